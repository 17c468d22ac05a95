use tracing::info;

/// Soft byte size for one chunk of injected context.
pub const CHUNK_TARGET: usize = 3000;
/// Bytes repeated between neighboring chunks so sentences survive a cut.
pub const CHUNK_OVERLAP: usize = 200;

#[derive(Debug, Clone, PartialEq)]
pub struct TextChunk {
    pub index: usize,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct DocumentContext {
    pub name: String,
    pub chunks: Vec<TextChunk>,
}

#[derive(Debug, Clone)]
pub struct ScrapedUrlContext {
    pub url: String,
    pub title: String,
    pub chunks: Vec<TextChunk>,
}

#[derive(Debug, Clone)]
pub struct YoutubeContext {
    pub video_id: String,
    pub title: String,
    pub channel: String,
    pub description: String,
    pub transcript: String,
}

/// The side-contexts active for the current conversation, at most one of
/// each kind. Cleared wholesale on conversation switch.
#[derive(Debug, Clone, Default)]
pub struct ActiveContexts {
    pub document: Option<DocumentContext>,
    pub scraped_url: Option<ScrapedUrlContext>,
    pub youtube: Option<YoutubeContext>,
}

impl ActiveContexts {
    pub fn set_document(&mut self, document: DocumentContext) {
        info!(
            "Document context set: {} ({} chunks)",
            document.name,
            document.chunks.len()
        );
        self.document = Some(document);
    }

    pub fn set_scraped_url(&mut self, page: ScrapedUrlContext) {
        info!("Page context set: {} ({})", page.title, page.url);
        self.scraped_url = Some(page);
    }

    pub fn set_youtube(&mut self, video: YoutubeContext) {
        info!("YouTube context set: {} ({})", video.title, video.video_id);
        self.youtube = Some(video);
    }

    pub fn clear(&mut self) {
        self.document = None;
        self.scraped_url = None;
        self.youtube = None;
    }

    pub fn labels(&self) -> Vec<String> {
        let mut labels = Vec::new();
        if let Some(document) = &self.document {
            labels.push(format!(
                "document: {} ({} chunks)",
                document.name,
                document.chunks.len()
            ));
        }
        if let Some(page) = &self.scraped_url {
            labels.push(format!("page: {} ({})", page.title, page.url));
        }
        if let Some(video) = &self.youtube {
            labels.push(format!("youtube: {} by {}", video.title, video.channel));
        }
        labels
    }
}

/// Splits text into overlapping chunks of roughly `target` bytes,
/// preferring to cut at whitespace and never inside a UTF-8 character.
pub fn chunk_text(text: &str, target: usize, overlap: usize) -> Vec<TextChunk> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }

    let bytes = text.len();
    let mut chunks = Vec::new();
    let mut start = 0usize;
    while start < bytes {
        let mut end = (start + target).min(bytes);
        while end < bytes && !text.is_char_boundary(end) {
            end -= 1;
        }
        if end < bytes {
            // Cut at the last whitespace unless that would halve the chunk.
            if let Some(cut) = text[start..end].rfind(|c: char| c.is_whitespace()) {
                if cut > target / 2 {
                    end = start + cut;
                }
            }
        }

        let piece = text[start..end].trim();
        if !piece.is_empty() {
            chunks.push(TextChunk {
                index: chunks.len(),
                text: piece.to_string(),
            });
        }

        if end >= bytes {
            break;
        }
        let mut next = end.saturating_sub(overlap);
        if next <= start {
            next = end;
        }
        while !text.is_char_boundary(next) {
            next += 1;
        }
        start = next;
    }
    chunks
}

/// Cuts `text` at the largest char boundary not past `max_bytes`.
pub fn cut_at_boundary(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_one_chunk() {
        let chunks = chunk_text("hello world", CHUNK_TARGET, CHUNK_OVERLAP);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].index, 0);
        assert_eq!(chunks[0].text, "hello world");
    }

    #[test]
    fn long_text_splits_at_whitespace_with_overlap() {
        let text = "word ".repeat(200);
        let chunks = chunk_text(&text, 100, 20);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.text.len() <= 100);
            // Whitespace preference keeps words intact.
            assert!(chunk.text.split_whitespace().all(|w| w == "word"));
        }
        let indices: Vec<usize> = chunks.iter().map(|c| c.index).collect();
        assert_eq!(indices, (0..chunks.len()).collect::<Vec<_>>());
    }

    #[test]
    fn multibyte_text_never_splits_characters() {
        let text = "\u{e9}".repeat(500);
        let chunks = chunk_text(&text, 101, 10);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.text.chars().all(|c| c == '\u{e9}'));
        }
    }

    #[test]
    fn empty_text_yields_no_chunks() {
        assert!(chunk_text("   \n ", CHUNK_TARGET, CHUNK_OVERLAP).is_empty());
    }

    #[test]
    fn cut_at_boundary_respects_multibyte() {
        let text = "a\u{e9}b";
        assert_eq!(cut_at_boundary(text, 2), "a");
        assert_eq!(cut_at_boundary(text, 3), "a\u{e9}");
        assert_eq!(cut_at_boundary(text, 10), text);
    }

    #[test]
    fn contexts_replace_per_kind() {
        let mut contexts = ActiveContexts::default();
        contexts.set_document(DocumentContext {
            name: "a.txt".to_string(),
            chunks: chunk_text("first", CHUNK_TARGET, CHUNK_OVERLAP),
        });
        contexts.set_document(DocumentContext {
            name: "b.txt".to_string(),
            chunks: chunk_text("second", CHUNK_TARGET, CHUNK_OVERLAP),
        });
        assert_eq!(contexts.document.as_ref().map(|d| d.name.as_str()), Some("b.txt"));
        assert_eq!(contexts.labels().len(), 1);

        contexts.clear();
        assert!(contexts.labels().is_empty());
    }
}
