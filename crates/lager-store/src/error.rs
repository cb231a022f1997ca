use thiserror::Error;

use lager_core::{AdapterError, ContractError, SchemaError, TransitionError, ValidationMessage};

/// Everything a store operation can fail with.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// The transport rejected a write as semantically invalid. The messages
    /// are in the record's error ledger.
    #[error("The adapter rejected the commit because it was invalid")]
    Invalid(Vec<ValidationMessage>),

    #[error("{0}")]
    Transport(AdapterError),

    #[error("{0}")]
    Contract(#[from] ContractError),

    #[error("{0}")]
    Schema(#[from] SchemaError),

    #[error("{0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("Async request leaks detected: {}", .requests.join(", "))]
    LeakDetected {
        requests: Vec<String>,
        report: TeardownReport,
    },
}

impl StoreError {
    /// Whether the record involved stays usable after this failure.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, StoreError::Invalid(_) | StoreError::Transport(_))
    }
}

impl From<AdapterError> for StoreError {
    fn from(e: AdapterError) -> Self {
        match e {
            AdapterError::Invalid(messages) if !messages.is_empty() => StoreError::Invalid(messages),
            AdapterError::Invalid(_) => {
                StoreError::Transport(AdapterError::transport("invalid response without errors"))
            }
            other => StoreError::Transport(other),
        }
    }
}

impl From<TransitionError> for StoreError {
    fn from(e: TransitionError) -> Self {
        StoreError::Lifecycle(LifecycleError::IllegalTransition(e))
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LifecycleError {
    #[error("Attempted to unload {0} while it was being saved")]
    RecordInFlight(String),

    #[error("The store has been destroyed")]
    StoreDestroyed,

    #[error("{0} has been unloaded")]
    RecordUnloaded(String),

    #[error("Records from different stores cannot be related")]
    ForeignRecord,

    #[error(transparent)]
    IllegalTransition(#[from] TransitionError),
}

/// What `destroy` tore down, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// Torn-down records, `type:id` (or `type:@lid:N`), dependents first.
    pub records: Vec<String>,
    pub relationships: usize,
    pub arrays: usize,
}
