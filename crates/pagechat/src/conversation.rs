use llm::{Message, MessageContent, MessageMeta, Role};
use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use tracing::warn;

const DEFAULT_TITLE: &str = "New chat";
const MAX_TITLE_CHARS: usize = 60;

/// One chat: an ordered message log plus the in-flight marker.
///
/// While a completion is streaming, the last message is an assistant
/// message that grows by delta application. All tail mutations are
/// guarded so a late delta from a cancelled or superseded stream can
/// never touch a finalized log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
    pub messages: Vec<Message>,
    #[serde(skip)]
    in_flight: bool,
}

impl Conversation {
    pub fn new(id: String) -> Self {
        Self {
            id,
            title: DEFAULT_TITLE.to_string(),
            created_at: SystemTime::now(),
            updated_at: SystemTime::now(),
            messages: Vec::new(),
            in_flight: false,
        }
    }

    /// Appends the user's message. The first user message also names the
    /// conversation.
    pub fn append_user(&mut self, text: &str) {
        self.append_user_message(Message::text(Role::User, text));
    }

    /// Like [`append_user`](Self::append_user), but accepts a prebuilt
    /// message so image parts survive.
    pub fn append_user_message(&mut self, message: Message) {
        if self.title == DEFAULT_TITLE && self.messages.iter().all(|m| m.role != Role::User) {
            self.title = derive_title(&message.text_content());
        }
        self.messages.push(message);
        self.touch();
    }

    /// Appends a status notice shown in the transcript but filtered from
    /// upstream requests.
    pub fn append_notice(&mut self, text: &str) {
        self.messages.push(Message::text(Role::System, text));
        self.touch();
    }

    /// Appends the empty assistant message that streaming deltas extend.
    pub fn append_placeholder(&mut self) {
        if self.in_flight {
            warn!(
                "Placeholder requested for {} while a completion is already in flight",
                self.id
            );
            return;
        }
        self.messages.push(Message::text(Role::Assistant, ""));
        self.in_flight = true;
        self.touch();
    }

    /// Extends the in-flight assistant message. Dropped with a log entry
    /// when nothing is in flight.
    pub fn append_delta(&mut self, delta: &str) {
        if !self.can_mutate_last() {
            warn!("Dropping stream delta: no assistant message is in flight");
            return;
        }
        if let Some(Message {
            content: MessageContent::Text(text),
            ..
        }) = self.messages.last_mut()
        {
            text.push_str(delta);
        }
        self.touch();
    }

    /// Replaces the in-flight assistant text wholesale. Used by the
    /// non-streaming fallback path.
    pub fn replace_last_text(&mut self, new_text: impl Into<String>) {
        if !self.can_mutate_last() {
            warn!("Dropping text replacement: no assistant message is in flight");
            return;
        }
        if let Some(Message {
            content: MessageContent::Text(text),
            ..
        }) = self.messages.last_mut()
        {
            *text = new_text.into();
        }
        self.touch();
    }

    /// Appends an annotation such as the stopped-by-user marker. A note
    /// on an empty message drops its leading separator.
    pub fn append_note_to_last(&mut self, note: &str) {
        if !self.can_mutate_last() {
            warn!("Dropping annotation: no assistant message is in flight");
            return;
        }
        if let Some(Message {
            content: MessageContent::Text(text),
            ..
        }) = self.messages.last_mut()
        {
            if text.is_empty() {
                text.push_str(note.trim_start());
            } else {
                text.push_str(note);
            }
        }
        self.touch();
    }

    /// Marks the in-flight assistant message final. Later deltas are
    /// dropped by the guards above.
    pub fn finalize_last(&mut self, meta: Option<MessageMeta>) {
        if !self.can_mutate_last() {
            warn!("Ignoring finalize: no assistant message is in flight");
            return;
        }
        if let Some(meta) = meta {
            if let Some(message) = self.messages.last_mut() {
                message.meta = Some(meta);
            }
        }
        self.in_flight = false;
        self.touch();
    }

    /// The partial text of the in-flight assistant message, if any.
    pub fn in_flight_text(&self) -> Option<&str> {
        if !self.in_flight {
            return None;
        }
        match self.messages.last() {
            Some(Message {
                role: Role::Assistant,
                content: MessageContent::Text(text),
                ..
            }) => Some(text),
            _ => None,
        }
    }

    /// Drops `messages[index..]`, e.g. for redo and edit-and-resend.
    pub fn truncate_from(&mut self, index: usize) {
        if index >= self.messages.len() {
            return;
        }
        self.messages.truncate(index);
        self.in_flight = false;
        self.touch();
    }

    fn can_mutate_last(&self) -> bool {
        self.in_flight
            && matches!(
                self.messages.last(),
                Some(Message {
                    role: Role::Assistant,
                    content: MessageContent::Text(_),
                    ..
                })
            )
    }

    fn touch(&mut self) {
        self.updated_at = SystemTime::now();
    }
}

fn derive_title(text: &str) -> String {
    let first_line = text.lines().next().unwrap_or("").trim();
    if first_line.is_empty() {
        return DEFAULT_TITLE.to_string();
    }
    if first_line.chars().count() <= MAX_TITLE_CHARS {
        first_line.to_string()
    } else {
        let cut: String = first_line.chars().take(MAX_TITLE_CHARS - 3).collect();
        format!("{}...", cut.trim_end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_application_extends_placeholder() {
        let mut conversation = Conversation::new("c1".to_string());
        conversation.append_user("Hello");
        conversation.append_placeholder();
        conversation.append_delta("Hi");
        conversation.append_delta(" there!");
        conversation.finalize_last(Some(MessageMeta {
            provider: "test".to_string(),
            model: "test-model".to_string(),
        }));

        let last = conversation.messages.last().expect("assistant message");
        assert_eq!(last.text_content(), "Hi there!");
        assert_eq!(last.meta.as_ref().map(|m| m.model.as_str()), Some("test-model"));
    }

    #[test]
    fn deltas_without_placeholder_are_dropped() {
        let mut conversation = Conversation::new("c1".to_string());
        conversation.append_user("Hello");
        conversation.append_delta("stale");
        assert_eq!(conversation.messages.len(), 1);
        assert_eq!(conversation.messages[0].text_content(), "Hello");
    }

    #[test]
    fn deltas_after_finalize_are_dropped() {
        let mut conversation = Conversation::new("c1".to_string());
        conversation.append_placeholder();
        conversation.append_delta("done");
        conversation.finalize_last(None);
        conversation.append_delta(" and more");
        assert_eq!(conversation.messages.last().unwrap().text_content(), "done");
    }

    #[test]
    fn second_placeholder_is_rejected() {
        let mut conversation = Conversation::new("c1".to_string());
        conversation.append_placeholder();
        conversation.append_placeholder();
        assert_eq!(conversation.messages.len(), 1);
    }

    #[test]
    fn note_on_empty_message_drops_leading_space() {
        let mut conversation = Conversation::new("c1".to_string());
        conversation.append_placeholder();
        conversation.append_note_to_last(" [Response stopped by user]");
        assert_eq!(
            conversation.messages.last().unwrap().text_content(),
            "[Response stopped by user]"
        );

        let mut with_partial = Conversation::new("c2".to_string());
        with_partial.append_placeholder();
        with_partial.append_delta("Partial answ");
        with_partial.append_note_to_last(" [Response stopped by user]");
        assert_eq!(
            with_partial.messages.last().unwrap().text_content(),
            "Partial answ [Response stopped by user]"
        );
    }

    #[test]
    fn first_user_message_sets_title() {
        let mut conversation = Conversation::new("c1".to_string());
        conversation.append_user("How do rust lifetimes work?\nSecond line");
        assert_eq!(conversation.title, "How do rust lifetimes work?");

        let mut long = Conversation::new("c2".to_string());
        long.append_user(&"x".repeat(100));
        assert_eq!(long.title.chars().count(), MAX_TITLE_CHARS);
        assert!(long.title.ends_with("..."));
    }

    #[test]
    fn truncate_clears_in_flight_state() {
        let mut conversation = Conversation::new("c1".to_string());
        conversation.append_user("Hello");
        conversation.append_placeholder();
        conversation.truncate_from(1);
        assert_eq!(conversation.messages.len(), 1);
        conversation.append_delta("stale");
        assert_eq!(conversation.messages[0].text_content(), "Hello");
    }
}
