//! Lager Core - Domain types for the record store.
//!
//! Identities, the record lifecycle state machine, validation ledgers,
//! resource documents, schema metadata and the collaborator traits. Nothing
//! in here is async or shared; the orchestration lives in `lager-store`.

pub mod adapter;
pub mod document;
pub mod error;
pub mod identity;
pub mod record;
pub mod schema;
pub mod state;
pub mod validation;

// Re-exports for convenience
pub use adapter::{Adapter, JsonApiNormalizer, Normalizer, RequestKind};
pub use document::{
    Linkage, PrimaryData, RelationshipData, ResourceDocument, ResourceIdentifier, ResourceObject,
};
pub use error::{AdapterError, ContractError, SchemaError, TransitionError};
pub use identity::{Lid, ModelName, RecordId, RecordKey};
pub use record::{AttributeChange, Record, RelationshipValue, Snapshot};
pub use schema::{Loading, ModelDef, RelationshipDef, RelationshipKind, Schema};
pub use state::{RecordState, StateEvent};
pub use validation::{Errors, ValidationMessage, ValidityEdge};

#[cfg(any(test, feature = "test-utils"))]
pub use adapter::memory::{Hook, InMemoryAdapter};
