//! Lager - a client-side record store.
//!
//! Re-exports the domain types from `lager-core`, the store from
//! `lager-store` and the HTTP transport from `lager-http`.

pub mod cli;

pub use lager_core::{
    Adapter, AdapterError, ContractError, JsonApiNormalizer, Lid, Linkage, Loading, ModelDef,
    ModelName, Normalizer, RecordId, RecordKey, RecordState, RelationshipDef, RelationshipKind,
    RequestKind, ResourceDocument, ResourceIdentifier, ResourceObject, Schema, SchemaError,
    Snapshot, StateEvent, TransitionError, ValidationMessage,
};
pub use lager_http::{ConfigError, HttpAdapter, HttpConfig, KeyStyle};
pub use lager_store::{
    attributes, ArrayId, ArrayKind, FindOptions, LifecycleError, PendingRelated, RecordArray,
    RecordRef, Related, Store, StoreConfig, StoreError, TeardownReport,
};
