//! The single shared document.

use chrono::Utc;

use crate::protocol::{ServerMessage, Timestamp};

/// Content every server starts from.
pub const INITIAL_CONTENT: &str = "Initial document content";

/// Point-in-time copy of the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentSnapshot {
    pub content: String,
    pub last_updated: Timestamp,
}

impl DocumentSnapshot {
    /// The `initialState` frame a newly opened connection receives.
    pub fn initial_state(&self) -> ServerMessage {
        ServerMessage::InitialState {
            content: self.content.clone(),
            last_updated: self.last_updated,
        }
    }
}

/// Authoritative document state.
///
/// Content and timestamp only ever change together through
/// [`SharedDocument::replace`]; there is no partial update.
#[derive(Debug)]
pub struct SharedDocument {
    content: String,
    last_updated: Timestamp,
}

impl SharedDocument {
    pub fn new(content: impl Into<String>, last_updated: Timestamp) -> Self {
        Self {
            content: content.into(),
            last_updated,
        }
    }

    /// The placeholder document, stamped with the current time.
    pub fn placeholder() -> Self {
        Self::new(INITIAL_CONTENT, Utc::now())
    }

    pub fn current(&self) -> DocumentSnapshot {
        DocumentSnapshot {
            content: self.content.clone(),
            last_updated: self.last_updated,
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn last_updated(&self) -> Timestamp {
        self.last_updated
    }

    /// Overwrite the whole document.
    pub fn replace(&mut self, content: String, timestamp: Timestamp) {
        self.content = content;
        self.last_updated = timestamp;
    }
}

impl Default for SharedDocument {
    fn default() -> Self {
        Self::placeholder()
    }
}
