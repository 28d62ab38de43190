//! Append-only conversation log with structural sharing.
//!
//! A refinement run forks several branches off one prefix (self-correction,
//! feedback, intent, test). Each [`Conversation`] is an immutable handle to the
//! tail of a linked list of messages, so forking is a pointer copy and an
//! append on one branch can never show up on another.

use crate::error::ConversationError;
use crate::protocol::{ChatMessage, Role};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

struct Node {
    message: ChatMessage,
    parent: Option<Arc<Node>>,
}

#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<ChatMessage>", into = "Vec<ChatMessage>")]
pub struct Conversation {
    tail: Option<Arc<Node>>,
    len: usize,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Stage a user prompt on top of this conversation. The conversation only
    /// grows once the turn is answered, which keeps user and assistant
    /// messages strictly alternating.
    pub fn ask(&self, prompt: impl Into<String>) -> PendingTurn {
        PendingTurn {
            base: self.clone(),
            prompt: ChatMessage::user(prompt),
        }
    }

    pub fn last(&self) -> Option<&ChatMessage> {
        self.tail.as_deref().map(|node| &node.message)
    }

    /// Content of the most recent assistant reply.
    pub fn last_reply(&self) -> Option<&str> {
        self.last()
            .filter(|message| message.role == Role::Assistant)
            .map(|message| message.content.as_str())
    }

    /// Messages oldest first.
    pub fn messages(&self) -> Vec<ChatMessage> {
        let mut out = Vec::with_capacity(self.len);
        let mut cursor = self.tail.as_deref();
        while let Some(node) = cursor {
            out.push(node.message.clone());
            cursor = node.parent.as_deref();
        }
        out.reverse();
        out
    }

    fn push(&self, message: ChatMessage) -> Conversation {
        Conversation {
            tail: Some(Arc::new(Node {
                message,
                parent: self.tail.clone(),
            })),
            len: self.len + 1,
        }
    }
}

impl fmt::Debug for Conversation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.messages()).finish()
    }
}

impl PartialEq for Conversation {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len && self.messages() == other.messages()
    }
}

impl From<Conversation> for Vec<ChatMessage> {
    fn from(conversation: Conversation) -> Self {
        conversation.messages()
    }
}

impl TryFrom<Vec<ChatMessage>> for Conversation {
    type Error = ConversationError;

    fn try_from(messages: Vec<ChatMessage>) -> Result<Self, Self::Error> {
        let mut conversation = Conversation::new();
        for (index, message) in messages.into_iter().enumerate() {
            let expected = if index % 2 == 0 {
                Role::User
            } else {
                Role::Assistant
            };
            if message.role != expected {
                return Err(ConversationError::OutOfOrder {
                    index,
                    expected,
                    found: message.role,
                });
            }
            conversation = conversation.push(message);
        }
        if conversation.len % 2 == 1 {
            return Err(ConversationError::Unanswered);
        }
        Ok(conversation)
    }
}

/// A user prompt waiting for its reply.
#[derive(Debug, Clone)]
pub struct PendingTurn {
    base: Conversation,
    prompt: ChatMessage,
}

impl PendingTurn {
    pub fn prompt(&self) -> &str {
        &self.prompt.content
    }

    /// Full message list to send: the base conversation plus the prompt.
    pub fn messages(&self) -> Vec<ChatMessage> {
        let mut messages = self.base.messages();
        messages.push(self.prompt.clone());
        messages
    }

    pub fn answer(self, reply: impl Into<String>) -> Conversation {
        self.base
            .push(self.prompt)
            .push(ChatMessage::assistant(reply))
    }
}
