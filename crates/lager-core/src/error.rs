use thiserror::Error;

use crate::state::{RecordState, StateEvent};
use crate::validation::ValidationMessage;

/// A payload or call that breaks the store's contract. Never retried.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ContractError {
    #[error("Expected id to be a non-empty string, received {0:?}")]
    InvalidId(String),

    #[error("expected the primary data returned from a '{request}' response to be an object but instead it found an array")]
    ExpectedSingle { request: &'static str },

    #[error("Expected the primary data returned by the serializer for a '{request}' response to be a single object or null but instead it was an array.")]
    ExpectedSingleOrNull { request: &'static str },

    #[error("expected the primary data returned from a '{request}' response to be an array")]
    ExpectedMany { request: &'static str },

    #[error("The '{request}' request for {key} resolved indicating success but contained no primary data")]
    MissingPrimaryData { request: &'static str, key: String },

    #[error("requested {requested} but the response contained {received}")]
    IdentityMismatch { requested: String, received: String },

    #[error("You must include an 'id' for {0} in an object passed to 'push'")]
    MissingResourceId(String),

    #[error("Your {0} record was saved to the server, but the response does not have an id and no id has been set client side. Records must have ids. Please update the server response to provide an id in the response or generate the id on the client side either before saving the record or while normalizing the response.")]
    SavedWithoutId(String),

    #[error("The id {id} has already been used with another '{model}' record")]
    DuplicateId { model: String, id: String },

    #[error("You looked up the '{name}' relationship on {record} but some of the associated records were not loaded. Either make sure they are all loaded together with the parent record, or declare the relationship as lazy")]
    EagerNotLoaded { record: String, name: String },

    #[error("Malformed payload: {0}")]
    Malformed(String),
}

/// An event that the record state machine refuses in its current state.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Attempted to handle event `{event}` while in state {}", state.name())]
pub struct TransitionError {
    pub state: RecordState,
    pub event: StateEvent,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("There is no relationship named '{name}' on '{model}'")]
    UnknownRelationship { model: String, name: String },

    #[error("Relationship '{name}' on '{model}' is a {actual}, not a {expected}")]
    WrongKind {
        model: String,
        name: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Cannot relate a '{actual}' record through '{name}', which expects '{expected}'")]
    WrongModel {
        name: String,
        expected: String,
        actual: String,
    },
}

/// Failure reported by the transport collaborator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AdapterError {
    /// The write was semantically rejected. Drives the validation ledger.
    #[error("The adapter rejected the commit because it was invalid")]
    Invalid(Vec<ValidationMessage>),

    #[error("Record was not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Transport(String),
}

impl AdapterError {
    pub fn transport(msg: impl Into<String>) -> Self {
        AdapterError::Transport(msg.into())
    }
}
