//! Lager Store - Identity map, request coordination and record lifecycle.
//!
//! [`Store`] is the entry point: it owns every record, deduplicates fetches
//! through the in-flight ledger, applies cache policy and drives each
//! record's state machine as adapter responses arrive.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod graph;
pub mod identity_map;
pub mod record_array;
pub mod record_ref;
pub mod store;

pub use config::StoreConfig;
pub use error::{LifecycleError, StoreError, TeardownReport};
pub use identity_map::IdentityMap;
pub use record_array::{ArrayId, ArrayKind, RecordArray};
pub use record_ref::{PendingRelated, RecordRef, Related};
pub use store::{attributes, FindOptions, Store};
