//! Canonical delta-stream plumbing shared by all provider transports.
//!
//! Every vendor protocol (SSE, NDJSON) is normalized into the same shape:
//! a sequence of [`StreamFrame::Delta`] text frames followed by exactly one
//! terminal frame, either [`StreamFrame::Done`] or [`StreamFrame::Failed`].
//! The producer side ([`StreamHandle`]) lives in a spawned pump task that
//! drains the HTTP response body; the consumer side ([`DeltaStream`]) is
//! returned to the caller and honors cancellation between frames.

use crate::types::{ApiError, Usage};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    /// A piece of assistant text, in arrival order.
    Delta(String),
    /// Orderly end of the stream.
    Done(Usage),
    /// The stream ended abnormally. Always the last frame when present.
    Failed(ApiError),
}

/// Creates a connected producer/consumer pair for one completion.
pub fn stream_channel(cancel: CancellationToken) -> (StreamHandle, DeltaStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        StreamHandle {
            tx,
            cancel: cancel.clone(),
            terminated: AtomicBool::new(false),
        },
        DeltaStream {
            rx,
            cancel,
            finished: false,
        },
    )
}

/// Producer half handed to a transport pump task.
///
/// `done` and `fail` are one-shot: whichever is called first wins and
/// later terminal calls are ignored, so a pump can never emit two
/// terminal frames. Dropping the handle without a terminal makes the
/// consumer synthesize a `Failed(StreamClosed)`.
pub struct StreamHandle {
    tx: mpsc::UnboundedSender<StreamFrame>,
    cancel: CancellationToken,
    terminated: AtomicBool,
}

impl StreamHandle {
    /// Forwards one text delta. Empty deltas are swallowed; deltas after
    /// cancellation or after a terminal frame are discarded.
    pub fn emit(&self, text: &str) {
        if text.is_empty() || self.cancel.is_cancelled() || self.terminated.load(Ordering::Acquire)
        {
            return;
        }
        let _ = self.tx.send(StreamFrame::Delta(text.to_string()));
    }

    pub fn done(&self, usage: Usage) {
        if !self.terminated.swap(true, Ordering::AcqRel) {
            let _ = self.tx.send(StreamFrame::Done(usage));
        }
    }

    pub fn fail(&self, error: ApiError) {
        if !self.terminated.swap(true, Ordering::AcqRel) {
            let _ = self.tx.send(StreamFrame::Failed(error));
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the consumer cancels. Pumps select on this between
    /// body reads so a cancel stops network consumption promptly.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

/// Consumer half of a normalized completion stream.
#[derive(Debug)]
pub struct DeltaStream {
    rx: mpsc::UnboundedReceiver<StreamFrame>,
    cancel: CancellationToken,
    finished: bool,
}

impl DeltaStream {
    /// Next frame, or `None` once the stream is spent or cancelled.
    ///
    /// After a terminal frame every further call returns `None`. When the
    /// producer goes away without a terminal frame, a single
    /// `Failed(StreamClosed)` is synthesized so callers always observe
    /// exactly one terminal.
    pub async fn next(&mut self) -> Option<StreamFrame> {
        if self.finished {
            return None;
        }

        let received = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.finished = true;
                self.rx.close();
                return None;
            }
            frame = self.rx.recv() => frame,
        };

        match received {
            Some(frame @ StreamFrame::Delta(_)) => Some(frame),
            Some(frame) => {
                self.finished = true;
                Some(frame)
            }
            None => {
                self.finished = true;
                Some(StreamFrame::Failed(ApiError::StreamClosed(
                    "stream ended without a completion event".to_string(),
                )))
            }
        }
    }

    /// Stops the stream. Buffered and future frames are discarded and the
    /// transport pump is signalled to stop reading. Safe to call more
    /// than once and safe to call when the stream already ended.
    pub fn cancel(&mut self) {
        self.cancel.cancel();
        self.rx.close();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Accumulates raw response bytes and yields complete lines.
///
/// Chunk boundaries are arbitrary: a multi-byte UTF-8 character or a
/// whole SSE frame can straddle two network reads. Splitting on `\n` at
/// the byte level keeps both intact regardless of how the body was
/// chunked.
#[derive(Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk and returns every line completed by it, with the
    /// trailing `\n` (and `\r` for CRLF framing) removed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\n' {
                lines.push(self.take_line());
            } else {
                self.buf.push(byte);
            }
        }
        lines
    }

    /// Drains a trailing unterminated line, if any. Call after the body
    /// is exhausted.
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            None
        } else {
            Some(self.take_line())
        }
    }

    fn take_line(&mut self) -> String {
        if self.buf.last() == Some(&b'\r') {
            self.buf.pop();
        }
        match String::from_utf8(std::mem::take(&mut self.buf)) {
            Ok(line) => line,
            Err(e) => {
                warn!("Dropping invalid UTF-8 in stream line: {}", e);
                String::from_utf8_lossy(e.as_bytes()).into_owned()
            }
        }
    }
}

/// Extracts the payload of an SSE `data:` line. Returns `None` for
/// comments, `event:` lines and blank separators.
pub fn sse_data(line: &str) -> Option<&str> {
    line.strip_prefix("data: ")
        .or_else(|| line.strip_prefix("data:"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_buffer_reassembles_split_lines() {
        let mut buffer = LineBuffer::new();
        assert!(buffer.push(b"data: {\"te").is_empty());
        let lines = buffer.push(b"xt\":\"hi\"}\ndata: done\n");
        assert_eq!(lines, vec!["data: {\"text\":\"hi\"}", "data: done"]);
        assert_eq!(buffer.finish(), None);
    }

    #[test]
    fn test_line_buffer_splits_multibyte_utf8() {
        // "héllo\n" with the chunk boundary inside the two-byte 'é'
        let bytes = "h\u{e9}llo\n".as_bytes();
        let mut buffer = LineBuffer::new();
        assert!(buffer.push(&bytes[..2]).is_empty());
        let lines = buffer.push(&bytes[2..]);
        assert_eq!(lines, vec!["h\u{e9}llo"]);
    }

    #[test]
    fn test_line_buffer_strips_crlf() {
        let mut buffer = LineBuffer::new();
        let lines = buffer.push(b"data: a\r\n\r\ndata: b\r\n");
        assert_eq!(lines, vec!["data: a", "", "data: b"]);
    }

    #[test]
    fn test_line_buffer_finish_returns_trailing_data() {
        let mut buffer = LineBuffer::new();
        buffer.push(b"no newline");
        assert_eq!(buffer.finish(), Some("no newline".to_string()));
        assert_eq!(buffer.finish(), None);
    }

    #[test]
    fn test_sse_data_prefix_forms() {
        assert_eq!(sse_data("data: {\"a\":1}"), Some("{\"a\":1}"));
        assert_eq!(sse_data("data:[DONE]"), Some("[DONE]"));
        assert_eq!(sse_data("event: message_start"), None);
        assert_eq!(sse_data(""), None);
    }

    #[tokio::test]
    async fn test_terminal_frame_is_delivered_once() {
        let (handle, mut stream) = stream_channel(CancellationToken::new());
        handle.emit("a");
        handle.done(Usage::default());
        handle.done(Usage::default());
        handle.fail(ApiError::Unknown("late".to_string()));

        assert!(matches!(stream.next().await, Some(StreamFrame::Delta(t)) if t == "a"));
        assert!(matches!(stream.next().await, Some(StreamFrame::Done(_))));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_dropped_handle_synthesizes_failure() {
        let (handle, mut stream) = stream_channel(CancellationToken::new());
        handle.emit("partial");
        drop(handle);

        assert!(matches!(stream.next().await, Some(StreamFrame::Delta(t)) if t == "partial"));
        assert!(matches!(
            stream.next().await,
            Some(StreamFrame::Failed(ApiError::StreamClosed(_)))
        ));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_discards_buffered_frames() {
        let (handle, mut stream) = stream_channel(CancellationToken::new());
        handle.emit("buffered");
        stream.cancel();
        stream.cancel();

        assert!(stream.next().await.is_none());
        // Emits after cancellation are dropped on the producer side too.
        handle.emit("late");
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_wakes_pending_next() {
        let (handle, mut stream) = stream_channel(CancellationToken::new());
        let waiter = tokio::spawn(async move {
            let frame = stream.next().await;
            (frame.is_none(), stream)
        });
        // Give the consumer a chance to park in next().
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        handle.cancel.cancel();
        let (was_none, _stream) = waiter.await.unwrap();
        assert!(was_none);
    }
}
