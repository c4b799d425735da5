//! Conversation log and the transcription reconciler.
//!
//! The service streams two transcriptions at once: what the user is
//! saying and what the model is saying back. Each arrives as suffix
//! fragments. The reconciler merges both streams into one ordered log,
//! growing the current utterance in place until a turn boundary or a
//! role swap closes it.

/// Who a log entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Model,
    /// System notices (stream failures) rendered inline with the chat.
    Error,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Model => "model",
            Role::Error => "error",
        }
    }
}

/// The two spoken transcription streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    User,
    Model,
}

impl Speaker {
    pub fn role(self) -> Role {
        match self {
            Speaker::User => Role::User,
            Speaker::Model => Role::Model,
        }
    }
}

/// One conversation entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Base64 JPEG attached to a typed turn in vision mode.
    pub image: Option<String>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Message {
            role,
            content: content.into(),
            image: None,
        }
    }
}

/// Ordered, append-only sequence of messages. Entries never move or
/// disappear, so an index taken at push time stays valid; only the
/// reconciler rewrites content at an index.
#[derive(Debug, Default)]
pub struct ConversationLog {
    entries: Vec<Message>,
}

impl ConversationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry and return its index.
    pub fn push(&mut self, message: Message) -> usize {
        self.entries.push(message);
        self.entries.len() - 1
    }

    pub fn entries(&self) -> &[Message] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn replace_content(&mut self, index: usize, content: String) {
        if let Some(entry) = self.entries.get_mut(index) {
            entry.content = content;
        }
    }
}

#[derive(Debug, Default)]
struct StreamState {
    accumulator: String,
    /// Index of this speaker's still-growing log entry, if any.
    live_entry: Option<usize>,
}

/// Merges the two transcription streams into the conversation log.
///
/// Per speaker it keeps an accumulator string and the index of the log
/// entry it is currently growing. A fragment extends the accumulator;
/// if the speaker's live entry is still newer than the other speaker's,
/// the entry is rewritten in place with the whole accumulator,
/// otherwise a fresh entry is appended. Entries pushed by anyone else
/// (typed turns, error notices) are never rewrite targets.
#[derive(Debug, Default)]
pub struct TranscriptReconciler {
    user: StreamState,
    model: StreamState,
}

impl TranscriptReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one transcription fragment into the log.
    pub fn apply(&mut self, log: &mut ConversationLog, speaker: Speaker, fragment: &str) {
        let (state, other_live) = match speaker {
            Speaker::User => (&mut self.user, self.model.live_entry),
            Speaker::Model => (&mut self.model, self.user.live_entry),
        };
        state.accumulator.push_str(fragment);
        match state.live_entry {
            Some(index) if other_live.is_none_or(|other| index > other) => {
                log.replace_content(index, state.accumulator.clone());
            }
            _ => {
                let index = log.push(Message::new(speaker.role(), state.accumulator.clone()));
                state.live_entry = Some(index);
            }
        }
    }

    /// Close out the current turn. Both accumulators empty and both
    /// live entries freeze; the next fragment starts a new entry even
    /// if its text happens to extend the old one.
    pub fn turn_complete(&mut self) {
        self.user = StreamState::default();
        self.model = StreamState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragments_grow_one_entry_in_place() {
        let mut log = ConversationLog::new();
        let mut rec = TranscriptReconciler::new();
        rec.apply(&mut log, Speaker::User, "Hel");
        rec.apply(&mut log, Speaker::User, "lo");
        assert_eq!(log.len(), 1);
        assert_eq!(log.entries()[0], Message::new(Role::User, "Hello"));
    }

    #[test]
    fn turn_complete_starts_a_fresh_entry() {
        let mut log = ConversationLog::new();
        let mut rec = TranscriptReconciler::new();
        rec.apply(&mut log, Speaker::User, "Hel");
        rec.apply(&mut log, Speaker::User, "lo");
        rec.turn_complete();
        rec.apply(&mut log, Speaker::Model, "Hi");
        assert_eq!(log.len(), 2);
        assert_eq!(log.entries()[0].content, "Hello");
        assert_eq!(log.entries()[1], Message::new(Role::Model, "Hi"));
    }

    #[test]
    fn boundary_splits_even_when_text_continues() {
        let mut log = ConversationLog::new();
        let mut rec = TranscriptReconciler::new();
        rec.apply(&mut log, Speaker::Model, "Hi");
        rec.turn_complete();
        rec.apply(&mut log, Speaker::Model, " there");
        assert_eq!(log.len(), 2);
        assert_eq!(log.entries()[1].content, " there");
    }

    #[test]
    fn role_swap_closes_the_live_entry() {
        let mut log = ConversationLog::new();
        let mut rec = TranscriptReconciler::new();
        rec.apply(&mut log, Speaker::User, "Hel");
        rec.apply(&mut log, Speaker::Model, "Hi");
        rec.apply(&mut log, Speaker::User, "lo");
        let contents: Vec<&str> = log.entries().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["Hel", "Hi", "Hello"]);
        assert_eq!(log.entries()[2].role, Role::User);
    }

    #[test]
    fn both_streams_interleave_within_a_turn() {
        let mut log = ConversationLog::new();
        let mut rec = TranscriptReconciler::new();
        rec.apply(&mut log, Speaker::Model, "One");
        rec.apply(&mut log, Speaker::Model, " two");
        rec.apply(&mut log, Speaker::User, "wait");
        rec.apply(&mut log, Speaker::Model, " three");
        // The user interjection froze "One two"; the model keeps its
        // whole accumulator when it reappears.
        let contents: Vec<&str> = log.entries().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["One two", "wait", "One two three"]);
    }

    #[test]
    fn foreign_entries_are_never_rewritten() {
        let mut log = ConversationLog::new();
        let mut rec = TranscriptReconciler::new();
        rec.apply(&mut log, Speaker::User, "Hel");
        log.push(Message::new(Role::Error, "stream hiccup"));
        rec.turn_complete();
        rec.apply(&mut log, Speaker::User, "lo");
        assert_eq!(log.len(), 3);
        assert_eq!(log.entries()[1].content, "stream hiccup");
        assert_eq!(log.entries()[2].content, "lo");
    }
}
