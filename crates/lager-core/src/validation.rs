use serde::{Deserialize, Serialize};

/// One validation message attached to an attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationMessage {
    pub attribute: String,
    pub message: String,
}

impl ValidationMessage {
    pub fn new(attribute: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            message: message.into(),
        }
    }

    /// Build a message from a JSON:API error `source.pointer`.
    ///
    /// `/data/attributes/first-name` yields attribute `first-name`; any other
    /// pointer is kept under `base`.
    pub fn from_pointer(pointer: &str, message: impl Into<String>) -> Self {
        let attribute = pointer
            .strip_prefix("/data/attributes/")
            .or_else(|| pointer.strip_prefix("/data/relationships/"))
            .filter(|a| !a.is_empty())
            .unwrap_or("base");
        Self::new(attribute, message)
    }
}

/// Crossing of the empty/non-empty boundary of an [`Errors`] ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidityEdge {
    BecameInvalid,
    BecameValid,
}

impl From<ValidityEdge> for crate::state::StateEvent {
    fn from(edge: ValidityEdge) -> Self {
        match edge {
            ValidityEdge::BecameInvalid => crate::state::StateEvent::BecameInvalid,
            ValidityEdge::BecameValid => crate::state::StateEvent::BecameValid,
        }
    }
}

/// Per-record validation ledger.
///
/// Insertion order is kept and duplicates are allowed. Every mutation reports
/// whether it crossed between empty and non-empty, which is what drives the
/// record into and out of its invalid states.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Errors {
    entries: Vec<ValidationMessage>,
}

impl Errors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        attribute: impl Into<String>,
        message: impl Into<String>,
    ) -> Option<ValidityEdge> {
        let was_empty = self.entries.is_empty();
        self.entries.push(ValidationMessage::new(attribute, message));
        was_empty.then_some(ValidityEdge::BecameInvalid)
    }

    /// Add several messages at once, reporting at most one edge.
    pub fn extend(
        &mut self,
        messages: impl IntoIterator<Item = ValidationMessage>,
    ) -> Option<ValidityEdge> {
        let was_empty = self.entries.is_empty();
        self.entries.extend(messages);
        (was_empty && !self.entries.is_empty()).then_some(ValidityEdge::BecameInvalid)
    }

    /// Remove every message for `attribute`.
    pub fn remove(&mut self, attribute: &str) -> Option<ValidityEdge> {
        let was_empty = self.entries.is_empty();
        self.entries.retain(|e| e.attribute != attribute);
        (!was_empty && self.entries.is_empty()).then_some(ValidityEdge::BecameValid)
    }

    pub fn clear(&mut self) -> Option<ValidityEdge> {
        let was_empty = self.entries.is_empty();
        self.entries.clear();
        (!was_empty).then_some(ValidityEdge::BecameValid)
    }

    pub fn has(&self, attribute: &str) -> bool {
        self.entries.iter().any(|e| e.attribute == attribute)
    }

    /// Messages for one attribute, in insertion order.
    pub fn messages_for(&self, attribute: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|e| e.attribute == attribute)
            .map(|e| e.message.as_str())
            .collect()
    }

    pub fn to_vec(&self) -> Vec<ValidationMessage> {
        self.entries.clone()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ValidationMessage> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
