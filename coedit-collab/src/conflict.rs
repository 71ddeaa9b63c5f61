//! Last-write-wins conflict detection.
//!
//! An edit is stale when its client timestamp is strictly earlier than the
//! document's `last_updated`. Equal timestamps are accepted, so two edits
//! issued in the same tick resolve to whichever the hub processes last.
//! Clock skew between clients is not corrected.

use crate::document::SharedDocument;
use crate::protocol::Edit;

/// Details text sent with every `conflictDetected` frame.
pub const CONFLICT_DETAILS: &str = "Your edit was based on an outdated version of the document.";

/// Outcome of evaluating an edit against the current document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    /// The edit is stale; carries the authoritative content for the sender.
    Reject { current_content: String },
}

impl Verdict {
    pub fn is_accept(&self) -> bool {
        matches!(self, Self::Accept)
    }
}

/// Decide whether `edit` may replace `document`. Never mutates.
pub fn evaluate(edit: &Edit, document: &SharedDocument) -> Verdict {
    if edit.timestamp < document.last_updated() {
        Verdict::Reject {
            current_content: document.content().to_owned(),
        }
    } else {
        Verdict::Accept
    }
}

/// Evaluate `edit` and commit it on acceptance.
///
/// The accepted edit's own timestamp becomes the new `last_updated`.
pub fn apply(edit: Edit, document: &mut SharedDocument) -> Verdict {
    let verdict = evaluate(&edit, document);
    if verdict.is_accept() {
        document.replace(edit.content, edit.timestamp);
    }
    verdict
}
