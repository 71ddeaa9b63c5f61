//! Local editing surface and user identity seen by the client link.

use std::sync::{Arc, Mutex, PoisonError};

/// Identity reported when no provider yields one.
pub const UNKNOWN_USER: &str = "unknown-user";

/// The editable text the link reads from on send and overwrites on
/// remote updates. Only whole-document replacement is supported.
pub trait EditorSurface: Send {
    /// Full current text.
    fn text(&self) -> String;

    /// Replace the whole text.
    fn replace_all(&mut self, text: &str);
}

/// Thread-safe in-memory surface.
///
/// Clones share the same buffer, so an application can keep one clone
/// for local typing while the link owns another.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer {
    inner: Arc<Mutex<String>>,
}

impl SharedBuffer {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(text.into())),
        }
    }

    /// Set the text as the local user.
    pub fn set_text(&self, text: impl Into<String>) {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = text.into();
    }

    /// Append to the text as the local user.
    pub fn push_str(&self, text: &str) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_str(text);
    }

    pub fn text(&self) -> String {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl EditorSurface for SharedBuffer {
    fn text(&self) -> String {
        SharedBuffer::text(self)
    }

    fn replace_all(&mut self, text: &str) {
        self.set_text(text);
    }
}

/// Opaque display label for edits. Never used for authorization.
pub trait IdentityProvider: Send + Sync {
    fn user_id(&self) -> Option<String>;
}

impl IdentityProvider for String {
    fn user_id(&self) -> Option<String> {
        if self.is_empty() {
            None
        } else {
            Some(self.clone())
        }
    }
}

/// Provider with no identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnonymousIdentity;

impl IdentityProvider for AnonymousIdentity {
    fn user_id(&self) -> Option<String> {
        None
    }
}

/// The provider's identity, or [`UNKNOWN_USER`].
pub fn resolve_user(identity: &dyn IdentityProvider) -> String {
    identity
        .user_id()
        .unwrap_or_else(|| UNKNOWN_USER.to_string())
}
