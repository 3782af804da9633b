use crate::clients::{Message, MessageRole};

pub mod compression;

pub use compression::{
    CompressionError, CompressionResult, CompressionState, CompressionTrigger, ContextCompressor,
};

/// Characters per token used by the size heuristics.
pub const CHARS_PER_TOKEN: usize = 4;

/// Ordered message log for one session.
///
/// Index 0 holds the pinned system message when there is one; there is never
/// more than one system message and it is never anywhere else.
#[derive(Debug, Clone, Default)]
pub struct ConversationHistory {
    messages: Vec<Message>,
    keep_history: bool,
}

impl ConversationHistory {
    pub fn new(system_instructions: Option<String>, keep_history: bool) -> Self {
        let messages = match system_instructions {
            Some(instructions) => vec![Message::system(instructions)],
            None => Vec::new(),
        };
        Self {
            messages,
            keep_history,
        }
    }

    pub fn keep_history(&self) -> bool {
        self.keep_history
    }

    pub fn has_system_message(&self) -> bool {
        self.messages
            .first()
            .is_some_and(|m| m.role == MessageRole::System)
    }

    pub fn system_message(&self) -> Option<&Message> {
        self.messages.first().filter(|m| m.role == MessageRole::System)
    }

    pub fn append(&mut self, role: MessageRole, content: impl Into<String>) {
        self.add_message(Message::new(role, content));
    }

    /// Appends a message. A system message replaces the pinned one instead of
    /// being appended.
    pub fn add_message(&mut self, message: Message) {
        if message.role == MessageRole::System {
            self.set_system_instructions(message.content);
            return;
        }
        self.messages.push(message);
    }

    pub fn add_messages(&mut self, messages: impl IntoIterator<Item = Message>) {
        for message in messages {
            self.add_message(message);
        }
    }

    pub fn set_system_instructions(&mut self, instructions: impl Into<String>) {
        let instructions = instructions.into();
        match self.messages.first_mut() {
            Some(first) if first.role == MessageRole::System => first.content = instructions,
            _ => self.messages.insert(0, Message::system(instructions)),
        }
    }

    /// Drops everything but the pinned system message.
    pub fn reset(&mut self) {
        let system = self.system_message().cloned();
        self.messages.clear();
        self.messages.extend(system);
    }

    /// Clears the log, pinned system message included.
    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// Removes up to `n` trailing messages, never the system message.
    pub fn remove_last_n(&mut self, n: usize) {
        let floor = usize::from(self.has_system_message());
        let keep = self.messages.len().saturating_sub(n).max(floor);
        self.messages.truncate(keep);
    }

    pub fn all(&self) -> &[Message] {
        &self.messages
    }

    pub fn get_messages(&self) -> Vec<Message> {
        self.messages.clone()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Total characters across every message, tool call arguments included.
    pub fn approximate_size(&self) -> usize {
        approximate_size(&self.messages)
    }

    pub fn approximate_tokens(&self) -> usize {
        self.approximate_size() / CHARS_PER_TOKEN
    }

    pub fn export_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.messages)
    }
}

pub fn approximate_size(messages: &[Message]) -> usize {
    messages
        .iter()
        .map(|m| {
            m.content.chars().count()
                + m.tool_calls.as_ref().map_or(0, |calls| {
                    calls
                        .iter()
                        .map(|c| c.function.name.chars().count() + c.function.arguments.chars().count())
                        .sum()
                })
        })
        .sum()
}
