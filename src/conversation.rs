use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const USER_AUTHOR: &str = "user";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One appended turn. Fields are private so content cannot change after append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    sequence: u64,
    author: String,
    role: Role,
    content: String,
    timestamp: DateTime<Utc>,
}

impl Message {
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn author(&self) -> &str {
        &self.author
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Append-only message log for a single orchestration run.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a message and returns it. Sequence numbers start at 1 and
    /// strictly increase.
    pub fn append(
        &mut self,
        author: impl Into<String>,
        role: Role,
        content: impl Into<String>,
    ) -> &Message {
        let sequence = self.messages.last().map(|m| m.sequence + 1).unwrap_or(1);
        self.messages.push(Message {
            sequence,
            author: author.into(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
        });
        &self.messages[self.messages.len() - 1]
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn by_author<'a>(&'a self, author: &'a str) -> impl Iterator<Item = &'a Message> + 'a {
        self.messages.iter().filter(move |m| m.author == author)
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }
}
