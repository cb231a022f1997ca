use std::collections::BTreeMap;

use serde_json::{Map, Value};

use lager_core::{
    Adapter, Lid, ModelName, RecordId, RecordKey, RecordState, Snapshot, ValidationMessage,
};

use crate::error::{LifecycleError, StoreError};
use crate::store::{FindOptions, Store};

/// Caller-facing handle to one record in a [`Store`].
///
/// Reads always go through the identity map, so every holder of a handle
/// observes reloads and local edits. Two handles are equal when they point
/// at the same record of the same store.
pub struct RecordRef<A: Adapter> {
    store: Store<A>,
    lid: Lid,
    model: ModelName,
}

impl<A: Adapter> RecordRef<A> {
    pub(crate) fn new(store: Store<A>, lid: Lid, model: ModelName) -> Self {
        Self { store, lid, model }
    }

    pub fn lid(&self) -> Lid {
        self.lid
    }

    pub fn model(&self) -> &ModelName {
        &self.model
    }

    pub fn store(&self) -> &Store<A> {
        &self.store
    }

    pub fn id(&self) -> Option<RecordId> {
        self.store.read(self.lid, |r| r.id().cloned()).flatten()
    }

    pub fn key(&self) -> Option<RecordKey> {
        self.store.read(self.lid, |r| r.key()).flatten()
    }

    /// Current state. Unloaded handles report `root.empty`.
    pub fn state(&self) -> RecordState {
        self.store
            .read(self.lid, |r| r.state())
            .unwrap_or(RecordState::Empty)
    }

    /// The handle no longer refers to a record in the store.
    pub fn is_unloaded(&self) -> bool {
        self.store.read(self.lid, |_| ()).is_none()
    }

    pub fn is_empty(&self) -> bool {
        self.state().is_empty()
    }

    pub fn is_loading(&self) -> bool {
        self.state().is_loading()
    }

    pub fn is_loaded(&self) -> bool {
        self.state().is_loaded()
    }

    pub fn is_error(&self) -> bool {
        self.state().is_error()
    }

    pub fn is_new(&self) -> bool {
        self.state().is_new()
    }

    pub fn is_deleted(&self) -> bool {
        self.state().is_deleted()
    }

    pub fn is_saving(&self) -> bool {
        self.state().is_saving()
    }

    pub fn is_valid(&self) -> bool {
        self.state().is_valid()
    }

    pub fn is_dirty(&self) -> bool {
        self.state().is_dirty()
    }

    pub fn is_reloading(&self) -> bool {
        self.store
            .read(self.lid, |r| r.is_reloading())
            .unwrap_or(false)
    }

    pub fn get(&self, attribute: &str) -> Option<Value> {
        self.store
            .read(self.lid, |r| r.attribute(attribute).cloned())
            .flatten()
    }

    pub fn attributes(&self) -> Map<String, Value> {
        self.store
            .read(self.lid, |r| r.attributes())
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> Option<Snapshot> {
        self.store.snapshot_of(self.lid)
    }

    /// Set one attribute. Clears that attribute's validation errors.
    pub fn set(&self, attribute: &str, value: impl Into<Value>) -> Result<(), StoreError> {
        self.store.set_attribute(self.lid, attribute, value.into())
    }

    /// Set several attributes in order.
    pub fn set_properties(&self, properties: Map<String, Value>) -> Result<(), StoreError> {
        for (name, value) in properties {
            self.store.set_attribute(self.lid, &name, value)?;
        }
        Ok(())
    }

    /// Dirty attributes as `(persisted, current)`.
    pub fn changed_attributes(&self) -> BTreeMap<String, (Value, Value)> {
        self.store
            .read(self.lid, |r| r.changed_attributes())
            .unwrap_or_default()
    }

    pub fn errors(&self) -> Vec<ValidationMessage> {
        self.store
            .read(self.lid, |r| r.errors().to_vec())
            .unwrap_or_default()
    }

    pub fn errors_for(&self, attribute: &str) -> Vec<String> {
        self.store
            .read(self.lid, |r| {
                r.errors()
                    .messages_for(attribute)
                    .into_iter()
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has_error(&self, attribute: &str) -> bool {
        self.store
            .read(self.lid, |r| r.errors().has(attribute))
            .unwrap_or(false)
    }

    pub fn error_count(&self) -> usize {
        self.store
            .read(self.lid, |r| r.errors().len())
            .unwrap_or(0)
    }

    pub fn add_error(&self, attribute: &str, message: &str) -> Result<(), StoreError> {
        self.store
            .update_errors(self.lid, |errors| errors.add(attribute, message))
    }

    pub fn remove_error(&self, attribute: &str) -> Result<(), StoreError> {
        self.store
            .update_errors(self.lid, |errors| errors.remove(attribute))
    }

    pub fn clear_errors(&self) -> Result<(), StoreError> {
        self.store.update_errors(self.lid, |errors| errors.clear())
    }

    /// Persist local changes: create, update or delete depending on state.
    pub async fn save(&self) -> Result<(), StoreError> {
        self.store.save(self.lid).await
    }

    /// Mark for deletion. Never-saved records are gone immediately.
    ///
    /// The handle keeps reporting `deleted.saved` until
    /// [`Store::prune_deleted`] or an unload drops it.
    pub fn delete_record(&self) -> Result<(), StoreError> {
        self.store.delete(self.lid)
    }

    /// Delete and persist the deletion.
    pub async fn destroy_record(&self) -> Result<(), StoreError> {
        self.delete_record()?;
        self.save().await
    }

    /// Discard local attribute edits and errors. Returns the reverted names.
    pub fn rollback_attributes(&self) -> Result<Vec<String>, StoreError> {
        self.store.rollback(self.lid)
    }

    /// Refetch this record, blocking until fresh data arrives.
    pub async fn reload(&self) -> Result<RecordRef<A>, StoreError> {
        let key = self
            .key()
            .ok_or_else(|| LifecycleError::RecordUnloaded(self.describe()))?;
        self.store
            .find_record(key.model, key.id.as_str(), FindOptions::reload())
            .await
    }

    pub fn unload(&self) -> Result<(), StoreError> {
        self.store.unload(self.lid)
    }

    /// Related records, or a pending placeholder for unloaded lazy members.
    pub fn related(&self, name: &str) -> Result<Related<A>, StoreError> {
        self.store.related(self.lid, name)
    }

    /// Related handles already in the store, loaded or not. Never fetches.
    pub fn peek_related(&self, name: &str) -> Result<Vec<RecordRef<A>>, StoreError> {
        self.store.peek_related(self.lid, name)
    }

    pub fn set_belongs_to(&self, name: &str, target: Option<&RecordRef<A>>) -> Result<(), StoreError> {
        if let Some(target) = target {
            self.check_same_store(target)?;
        }
        self.store
            .set_belongs_to(self.lid, name, target.map(|t| (t.lid, &t.model)))
    }

    pub fn add_to_has_many(&self, name: &str, target: &RecordRef<A>) -> Result<(), StoreError> {
        self.check_same_store(target)?;
        self.store
            .add_to_has_many(self.lid, name, (target.lid, &target.model))
    }

    pub fn remove_from_has_many(&self, name: &str, target: &RecordRef<A>) -> Result<(), StoreError> {
        self.check_same_store(target)?;
        self.store
            .remove_from_has_many(self.lid, name, (target.lid, &target.model))
    }

    fn check_same_store(&self, other: &RecordRef<A>) -> Result<(), StoreError> {
        if !self.store.same_store(&other.store) {
            return Err(LifecycleError::ForeignRecord.into());
        }
        Ok(())
    }

    /// `type:id`, or `type:@lid:N` without an id.
    pub fn describe(&self) -> String {
        match self.id() {
            Some(id) => format!("{}:{}", self.model, id),
            None => format!("{}:{}", self.model, self.lid),
        }
    }
}

impl<A: Adapter> Clone for RecordRef<A> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            lid: self.lid,
            model: self.model.clone(),
        }
    }
}

impl<A: Adapter> PartialEq for RecordRef<A> {
    fn eq(&self, other: &Self) -> bool {
        self.lid == other.lid && self.store.same_store(&other.store)
    }
}

impl<A: Adapter> Eq for RecordRef<A> {}

impl<A: Adapter> std::fmt::Debug for RecordRef<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RecordRef({})", self.describe())
    }
}

/// Result of reading a relationship.
pub enum Related<A: Adapter> {
    /// Every member is loaded.
    Ready(Vec<RecordRef<A>>),
    /// Some members of a lazy relationship still have to be fetched.
    Pending(PendingRelated<A>),
}

impl<A: Adapter> Related<A> {
    /// Wait for the members, fetching what is missing.
    pub async fn load(self) -> Result<Vec<RecordRef<A>>, StoreError> {
        match self {
            Related::Ready(records) => Ok(records),
            Related::Pending(pending) => pending.resolve().await,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Related::Pending(_))
    }
}

impl<A: Adapter> std::fmt::Debug for Related<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Related::Ready(records) => f.debug_tuple("Ready").field(records).finish(),
            Related::Pending(pending) => f.debug_tuple("Pending").field(pending).finish(),
        }
    }
}

/// Placeholder for a lazy relationship with unloaded members.
pub struct PendingRelated<A: Adapter> {
    store: Store<A>,
    members: Vec<(Lid, ModelName, Option<RecordKey>)>,
}

impl<A: Adapter> PendingRelated<A> {
    pub(crate) fn new(store: Store<A>, members: Vec<(Lid, ModelName, Option<RecordKey>)>) -> Self {
        Self { store, members }
    }

    /// Keys of the members that still have to be fetched.
    pub fn missing(&self) -> Vec<RecordKey> {
        self.members
            .iter()
            .filter(|(lid, _, _)| {
                !self
                    .store
                    .read(*lid, |r| r.state().is_loaded())
                    .unwrap_or(false)
            })
            .filter_map(|(_, _, key)| key.clone())
            .collect()
    }

    /// Fetch unloaded members in order, joining fetches already in flight.
    pub async fn resolve(self) -> Result<Vec<RecordRef<A>>, StoreError> {
        let mut records = Vec::with_capacity(self.members.len());
        for (lid, model, key) in self.members {
            let loaded = self
                .store
                .read(lid, |r| r.state().is_loaded())
                .unwrap_or(false);
            if loaded {
                records.push(RecordRef::new(self.store.clone(), lid, model));
                continue;
            }
            let Some(key) = key else {
                continue;
            };
            let record = self
                .store
                .find_record(key.model, key.id.as_str(), FindOptions::default())
                .await?;
            records.push(record);
        }
        Ok(records)
    }
}

impl<A: Adapter> std::fmt::Debug for PendingRelated<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRelated")
            .field("members", &self.members.len())
            .finish()
    }
}
