use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{Map, Value};
use tokio::sync::oneshot;

use lager_core::{
    Adapter, AdapterError, ContractError, Errors, JsonApiNormalizer, Lid, ModelName, Normalizer,
    Record, RecordId, RecordKey, RecordState, RelationshipDef, RelationshipKind, RequestKind,
    ResourceDocument, ResourceIdentifier, ResourceObject, Schema, SchemaError, Snapshot,
    StateEvent, ValidityEdge,
};

use crate::config::StoreConfig;
use crate::coordinator::{
    self, AdapterCall, Ledger, Mode, Outcome, RequestId, RequestTarget, Resolved,
};
use crate::error::{LifecycleError, StoreError, TeardownReport};
use crate::graph;
use crate::identity_map::IdentityMap;
use crate::record_array::{ArrayId, ArrayKind, ArrayRegistry, RecordArray};
use crate::record_ref::{PendingRelated, RecordRef, Related};

/// Per-call cache policy for `find_record`, `find_all` and `query`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FindOptions {
    /// Block on a fresh fetch without consulting any policy hook.
    pub reload: bool,
    /// Force (or suppress) the background refresh of cached data instead of
    /// asking the adapter.
    pub background_reload: Option<bool>,
}

impl FindOptions {
    pub fn reload() -> Self {
        Self {
            reload: true,
            background_reload: None,
        }
    }

    pub fn background_reload(enabled: bool) -> Self {
        Self {
            reload: false,
            background_reload: Some(enabled),
        }
    }
}

/// Everything guarded by the store lock.
#[derive(Debug, Default)]
pub(crate) struct State {
    map: IdentityMap,
    ledger: Ledger,
    arrays: ArrayRegistry,
    destroyed: bool,
}

struct Inner<A> {
    adapter: Arc<A>,
    normalizer: Box<dyn Normalizer>,
    schema: Schema,
    config: StoreConfig,
    state: Mutex<State>,
}

/// Client-side record cache.
///
/// Cheap to clone; clones share the same identity map. All bookkeeping
/// happens synchronously under one lock that is never held across an
/// await, so the only suspension points are adapter calls.
pub struct Store<A: Adapter> {
    inner: Arc<Inner<A>>,
}

impl<A: Adapter> Clone for Store<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: Adapter> std::fmt::Debug for Store<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Store")
            .field("records", &state.map.len())
            .field("pending", &state.ledger.len())
            .field("destroyed", &state.destroyed)
            .finish()
    }
}

impl<A: Adapter> Store<A> {
    pub fn new(adapter: A, schema: Schema) -> Self {
        Self::with_config(adapter, schema, JsonApiNormalizer, StoreConfig::default())
    }

    pub fn with_config(
        adapter: A,
        schema: Schema,
        normalizer: impl Normalizer + 'static,
        config: StoreConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                adapter: Arc::new(adapter),
                normalizer: Box::new(normalizer),
                schema,
                config,
                state: Mutex::new(State::default()),
            }),
        }
    }

    pub fn adapter(&self) -> &A {
        &self.inner.adapter
    }

    pub fn schema(&self) -> &Schema {
        &self.inner.schema
    }

    pub fn is_destroyed(&self) -> bool {
        self.lock().destroyed
    }

    /// Descriptions of the requests that have not resolved yet.
    pub fn pending_requests(&self) -> Vec<String> {
        self.lock().ledger.descriptions()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn same_store(&self, other: &Store<A>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn handle(&self, lid: Lid, model: ModelName) -> RecordRef<A> {
        RecordRef::new(self.clone(), lid, model)
    }

    fn handles(&self, state: &State, lids: Vec<Lid>) -> Vec<RecordRef<A>> {
        lids.into_iter()
            .filter_map(|lid| {
                let model = state.map.get(lid)?.model().clone();
                Some(self.handle(lid, model))
            })
            .collect()
    }

    // ---- reads ----

    /// A loaded record, without touching the network.
    pub fn peek_record(
        &self,
        model: impl Into<ModelName>,
        id: &str,
    ) -> Result<Option<RecordRef<A>>, StoreError> {
        let key = RecordKey::parse(model, id)?;
        let state = self.lock();
        let loaded = state
            .map
            .lookup(&key)
            .filter(|lid| state.map.get(*lid).is_some_and(|r| r.state().is_loaded()));
        Ok(loaded.map(|lid| self.handle(lid, key.model)))
    }

    /// Whether `(type, id)` is known and loaded.
    pub fn has_record_for_id(&self, model: impl Into<ModelName>, id: &str) -> Result<bool, StoreError> {
        Ok(self.peek_record(model, id)?.is_some())
    }

    /// The handle for `(type, id)`, created empty if absent. Never fetches.
    pub fn record_for_id(&self, model: impl Into<ModelName>, id: &str) -> Result<RecordRef<A>, StoreError> {
        let key = RecordKey::parse(model, id)?;
        let mut state = self.lock();
        ensure_alive(&state)?;
        let lid = state.map.get_or_create(&key);
        Ok(self.handle(lid, key.model))
    }

    /// Loaded records of a type, in insertion order.
    pub fn peek_all(&self, model: impl Into<ModelName>) -> Vec<RecordRef<A>> {
        let model = model.into();
        let state = self.lock();
        let lids = visible(&state.map, &model);
        self.handles(&state, lids)
    }

    // ---- requests ----

    /// Find a record by identity, consulting the cache policy.
    pub async fn find_record(
        &self,
        model: impl Into<ModelName>,
        id: &str,
        options: FindOptions,
    ) -> Result<RecordRef<A>, StoreError> {
        let key = RecordKey::parse(model, id)?;
        let (lid, cached) = {
            let mut state = self.lock();
            ensure_alive(&state)?;
            let lid = state.map.get_or_create(&key);
            let cached = state
                .map
                .get(lid)
                .filter(|r| r.state().is_loaded())
                .map(|_| snapshot(&state.map, lid));
            (lid, cached.flatten())
        };

        let Some(snapshot) = cached else {
            return self.fetch_record(key).await;
        };

        let adapter = &self.inner.adapter;
        if options.reload || consult("shouldReloadRecord", || adapter.should_reload_record(&snapshot))? {
            return self.fetch_record(key).await;
        }

        let background = match options.background_reload {
            Some(enabled) => enabled,
            None => consult("shouldBackgroundReloadRecord", || {
                adapter.should_background_reload_record(&snapshot)
            })?,
        };
        if background {
            self.schedule(
                RequestKind::FindRecord,
                RequestTarget::Record(key.clone()),
                AdapterCall::FindRecord(key.model.clone(), key.id.clone()),
                &key,
            )?;
        }
        tracing::debug!("Returning cached {} (background reload: {})", key, background);
        Ok(self.handle(lid, key.model))
    }

    /// Blocking fetch of one record, joining a pending blocking fetch.
    async fn fetch_record(&self, key: RecordKey) -> Result<RecordRef<A>, StoreError> {
        let receiver = {
            let mut state = self.lock();
            ensure_alive(&state)?;
            let target = RequestTarget::Record(key.clone());
            let id = match state.ledger.blocking_for(&target) {
                Some(id) => {
                    tracing::debug!("Joining in-flight findRecord for {}", key);
                    id
                }
                None => {
                    let lid = state.map.get_or_create(&key);
                    if let Some(record) = state.map.get_mut(lid) {
                        if record.state().is_loaded() {
                            record.set_reloading(true);
                        } else {
                            record.apply(StateEvent::FetchStarted)?;
                        }
                    }
                    let id = state
                        .ledger
                        .register(RequestKind::FindRecord, target, Mode::Blocking, &key);
                    self.spawn_request(id, AdapterCall::FindRecord(key.model.clone(), key.id.clone()));
                    id
                }
            };
            state.ledger.wait(id)
        };

        match settle(receiver).await? {
            Resolved::Record(lid) => Ok(self.handle(lid, key.model)),
            other => Err(unexpected(other)),
        }
    }

    /// All records of a type: the union of what is cached and what the
    /// adapter returns.
    pub async fn find_all(
        &self,
        model: impl Into<ModelName>,
        options: FindOptions,
    ) -> Result<RecordArray<A>, StoreError> {
        let model = model.into();
        let snapshots: Vec<Snapshot> = {
            let state = self.lock();
            ensure_alive(&state)?;
            visible(&state.map, &model)
                .into_iter()
                .filter_map(|lid| snapshot(&state.map, lid))
                .collect()
        };

        let adapter = &self.inner.adapter;
        if options.reload
            || consult("shouldReloadAll", || adapter.should_reload_all(&model, &snapshots))?
        {
            return self
                .fetch_collection(
                    RequestKind::FindAll,
                    RequestTarget::All(model.clone()),
                    AdapterCall::FindAll(model.clone()),
                    &model,
                )
                .await;
        }

        let background = match options.background_reload {
            Some(enabled) => enabled,
            None => consult("shouldBackgroundReloadAll", || {
                adapter.should_background_reload_all(&model, &snapshots)
            })?,
        };

        let array = self.lock().arrays.live_array(&model);
        if background {
            self.schedule(
                RequestKind::FindAll,
                RequestTarget::All(model.clone()),
                AdapterCall::FindAll(model.clone()),
                &model,
            )?;
        }
        Ok(RecordArray::new(self.clone(), array))
    }

    /// Run a query. Result arrays are cached per `(type, query)`.
    pub async fn query(
        &self,
        model: impl Into<ModelName>,
        query: Value,
        options: FindOptions,
    ) -> Result<RecordArray<A>, StoreError> {
        let model = model.into();
        let canonical = query.to_string();
        let target = RequestTarget::Query(model.clone(), canonical.clone());
        let subject = format!("{model} {canonical}");

        let cached = {
            let state = self.lock();
            ensure_alive(&state)?;
            state.arrays.query_array(&model, &canonical)
        };

        match cached {
            Some(array) if !options.reload => {
                if options.background_reload == Some(true) {
                    self.schedule(RequestKind::Query, target, AdapterCall::Query(model, query), &subject)?;
                }
                Ok(RecordArray::new(self.clone(), array))
            }
            _ => {
                self.fetch_collection(RequestKind::Query, target, AdapterCall::Query(model, query), &subject)
                    .await
            }
        }
    }

    /// Run a query expected to match at most one record. Never cached.
    pub async fn query_record(
        &self,
        model: impl Into<ModelName>,
        query: Value,
    ) -> Result<Option<RecordRef<A>>, StoreError> {
        let model = model.into();
        let canonical = query.to_string();
        let receiver = {
            let mut state = self.lock();
            ensure_alive(&state)?;
            let id = state.ledger.register(
                RequestKind::QueryRecord,
                RequestTarget::QueryRecord(model.clone(), canonical.clone()),
                Mode::Blocking,
                format!("{model} {canonical}"),
            );
            self.spawn_request(id, AdapterCall::QueryRecord(model.clone(), query));
            state.ledger.wait(id)
        };

        match settle(receiver).await? {
            Resolved::Maybe(Some(lid)) => Ok(Some(self.handle(lid, model))),
            Resolved::Maybe(None) => Ok(None),
            other => Err(unexpected(other)),
        }
    }

    /// Blocking fetch of a collection, joining a pending blocking fetch.
    async fn fetch_collection(
        &self,
        kind: RequestKind,
        target: RequestTarget,
        call: AdapterCall,
        subject: impl std::fmt::Display,
    ) -> Result<RecordArray<A>, StoreError> {
        let receiver = {
            let mut state = self.lock();
            ensure_alive(&state)?;
            let id = match state.ledger.blocking_for(&target) {
                Some(id) => {
                    tracing::debug!("Joining in-flight {} for {}", kind, subject);
                    id
                }
                None => {
                    mark_updating(&mut state, &target, true);
                    let id = state.ledger.register(kind, target, Mode::Blocking, subject);
                    self.spawn_request(id, call);
                    id
                }
            };
            state.ledger.wait(id)
        };

        match settle(receiver).await? {
            Resolved::Array(array) => Ok(RecordArray::new(self.clone(), array)),
            other => Err(unexpected(other)),
        }
    }

    /// Issue a background fetch unless one is already pending.
    fn schedule(
        &self,
        kind: RequestKind,
        target: RequestTarget,
        call: AdapterCall,
        subject: impl std::fmt::Display,
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        ensure_alive(&state)?;
        if self.inner.config.coalesce_background_reloads && state.ledger.is_pending(&target) {
            tracing::debug!("Background {} for {} already pending", kind, subject);
            return Ok(());
        }
        if let RequestTarget::Record(key) = &target {
            if let Some(record) = state.map.lookup(key).and_then(|lid| state.map.get_mut(lid)) {
                record.set_reloading(true);
            }
        }
        mark_updating(&mut state, &target, true);
        let id = state.ledger.register(kind, target, Mode::Background, subject);
        self.spawn_request(id, call);
        Ok(())
    }

    fn spawn_request(&self, id: RequestId, call: AdapterCall) {
        let store = self.clone();
        let adapter = Arc::clone(&self.inner.adapter);
        tokio::spawn(async move {
            let result = coordinator::dispatch(adapter, call).await;
            store.finish(id, result);
        });
    }

    /// Apply an adapter response and resolve everyone waiting on it.
    fn finish(&self, id: RequestId, result: Result<Value, AdapterError>) {
        let (request, outcome) = {
            let mut state = self.lock();
            let Some(request) = state.ledger.complete(id) else {
                tracing::debug!("Discarding response to request {} after teardown", id);
                return;
            };
            let outcome = match &request.target {
                RequestTarget::Record(key) => self.settle_find_record(&mut state, key, result),
                RequestTarget::All(model) => self.settle_find_all(&mut state, model, result),
                RequestTarget::Query(model, canonical) => {
                    self.settle_query(&mut state, model, canonical, result)
                }
                RequestTarget::QueryRecord(model, _) => {
                    self.settle_query_record(&mut state, model, result)
                }
                RequestTarget::Save(lid) => self.settle_save(&mut state, *lid, request.kind, result),
            };
            let still_pending = state.ledger.is_pending(&request.target);
            mark_updating(&mut state, &request.target, still_pending);
            (request, outcome)
        };

        if let Err(e) = &outcome {
            match request.mode {
                Mode::Background if self.inner.config.log_background_failures => {
                    tracing::warn!("Background {} failed: {}", request.description(), e);
                }
                Mode::Background => {}
                Mode::Blocking => tracing::debug!("{} failed: {}", request.description(), e),
            }
        }
        request.resolve(outcome);
    }

    fn settle_find_record(
        &self,
        state: &mut State,
        key: &RecordKey,
        result: Result<Value, AdapterError>,
    ) -> Outcome {
        let target = RequestTarget::Record(key.clone());
        let pushed = result
            .map_err(StoreError::from)
            .and_then(|raw| self.normalize(&key.model, RequestKind::FindRecord, raw))
            .and_then(|document| {
                let received = document
                    .expect_single(RequestKind::FindRecord.name())?
                    .ok_or_else(|| ContractError::MissingPrimaryData {
                        request: RequestKind::FindRecord.name(),
                        key: key.to_string(),
                    })?
                    .key()?;
                if received != *key {
                    return Err(ContractError::IdentityMismatch {
                        requested: key.to_string(),
                        received: received.to_string(),
                    }
                    .into());
                }
                self.push_document(state, document)
            });

        let reloading = state.ledger.is_pending(&target);
        let lid = state.map.lookup(key);
        let record = lid.and_then(|lid| state.map.get_mut(lid));
        match pushed {
            Ok(lids) => {
                if let Some(record) = record {
                    record.set_reloading(reloading);
                    record.apply(StateEvent::FetchSucceeded)?;
                }
                lids.first()
                    .copied()
                    .map(Resolved::Record)
                    .ok_or_else(|| unexpected(Resolved::Maybe(None)))
            }
            Err(e) => {
                if let Some(record) = record {
                    record.set_reloading(reloading);
                    if record.state().is_loading() && !reloading {
                        record.apply(StateEvent::FetchFailed)?;
                    }
                }
                Err(e)
            }
        }
    }

    fn settle_find_all(
        &self,
        state: &mut State,
        model: &ModelName,
        result: Result<Value, AdapterError>,
    ) -> Outcome {
        let raw = result?;
        let document = self.normalize(model, RequestKind::FindAll, raw)?;
        document.expect_many(RequestKind::FindAll.name())?;
        self.push_document(state, document)?;
        Ok(Resolved::Array(state.arrays.live_array(model)))
    }

    fn settle_query(
        &self,
        state: &mut State,
        model: &ModelName,
        canonical: &str,
        result: Result<Value, AdapterError>,
    ) -> Outcome {
        let raw = result?;
        let document = self.normalize(model, RequestKind::Query, raw)?;
        document.expect_many(RequestKind::Query.name())?;
        let lids = self.push_document(state, document)?;
        let query = serde_json::from_str(canonical).unwrap_or(Value::Null);
        Ok(Resolved::Array(
            state.arrays.set_query_result(model, canonical, query, lids),
        ))
    }

    fn settle_query_record(
        &self,
        state: &mut State,
        model: &ModelName,
        result: Result<Value, AdapterError>,
    ) -> Outcome {
        let raw = result?;
        let document = self.normalize(model, RequestKind::QueryRecord, raw)?;
        document.expect_single_or_null(RequestKind::QueryRecord.name())?;
        let lids = self.push_document(state, document)?;
        Ok(Resolved::Maybe(lids.first().copied()))
    }

    fn normalize(
        &self,
        model: &ModelName,
        kind: RequestKind,
        raw: Value,
    ) -> Result<ResourceDocument, StoreError> {
        self.inner
            .normalizer
            .normalize(model, kind, raw)
            .map_err(|e| {
                tracing::error!("Rejecting {} response for {}: {}", kind, model, e);
                StoreError::from(e)
            })
    }

    // ---- push ----

    /// Insert server data synchronously. `null` primary data is a no-op.
    pub fn push(&self, document: ResourceDocument) -> Result<Vec<RecordRef<A>>, StoreError> {
        let mut state = self.lock();
        ensure_alive(&state)?;
        let lids = self.push_document(&mut state, document)?;
        Ok(self.handles(&state, lids))
    }

    /// Normalize a raw payload for `model` and push it.
    pub fn push_payload(
        &self,
        model: impl Into<ModelName>,
        raw: Value,
    ) -> Result<Vec<RecordRef<A>>, StoreError> {
        let document = self.normalize(&model.into(), RequestKind::Push, raw)?;
        self.push(document)
    }

    /// Push primary data then included data. Returns the primary handles.
    fn push_document(&self, state: &mut State, document: ResourceDocument) -> Result<Vec<Lid>, StoreError> {
        let (primary, included) = document.into_parts();
        for resource in primary.iter().chain(&included) {
            resource.key()?;
        }
        let lids = primary
            .iter()
            .map(|resource| self.push_resource(state, resource))
            .collect::<Result<Vec<_>, _>>()?;
        for resource in &included {
            self.push_resource(state, resource)?;
        }
        Ok(lids)
    }

    fn push_resource(&self, state: &mut State, resource: &ResourceObject) -> Result<Lid, StoreError> {
        let key = resource.key()?;
        let lid = state.map.get_or_create(&key);
        if let Some(record) = state.map.get_mut(lid) {
            record.push_attributes(resource.attributes.clone());
            record.apply(StateEvent::Pushed)?;
        }
        self.apply_relationships(state, lid, resource)?;
        Ok(lid)
    }

    fn apply_relationships(
        &self,
        state: &mut State,
        lid: Lid,
        resource: &ResourceObject,
    ) -> Result<(), StoreError> {
        for (name, data) in &resource.relationships {
            if let Some(linkage) = &data.data {
                graph::apply_linkage(&mut state.map, &self.inner.schema, lid, name, linkage)?;
            }
        }
        Ok(())
    }

    // ---- local writes ----

    /// Create a new local record. An `"id"` entry becomes the client id.
    pub fn create(
        &self,
        model: impl Into<ModelName>,
        attributes: Map<String, Value>,
    ) -> Result<RecordRef<A>, StoreError> {
        let model = model.into();
        let mut attributes = attributes;
        let id = match attributes.remove("id") {
            None | Some(Value::Null) => None,
            Some(Value::String(id)) => Some(RecordId::parse(id)?),
            Some(Value::Number(id)) => Some(RecordId::parse(id.to_string())?),
            Some(other) => return Err(ContractError::InvalidId(other.to_string()).into()),
        };

        let mut state = self.lock();
        ensure_alive(&state)?;
        let lid = state.map.create_local(model.clone(), id)?;
        if let Some(record) = state.map.get_mut(lid) {
            for (name, value) in attributes {
                record.set_attribute(&name, value);
            }
        }
        Ok(self.handle(lid, model))
    }

    /// Mark `record` for deletion. See [`RecordRef::delete_record`].
    ///
    /// Once the deletion is saved the record leaves the identity index and
    /// every array, but its handle stays in the arena so holders still see
    /// `deleted.saved`. Call [`Store::prune_deleted`] (or unload) to reclaim it.
    pub fn delete_record(&self, record: &RecordRef<A>) -> Result<(), StoreError> {
        self.owns(record)?;
        self.delete(record.lid())
    }

    /// Drop every record whose deletion was acknowledged. Their handles
    /// report unloaded afterwards. Returns how many were dropped.
    pub fn prune_deleted(&self) -> usize {
        let mut state = self.lock();
        let deleted: Vec<Lid> = state
            .map
            .records()
            .filter(|r| r.state() == RecordState::DeletedSaved)
            .map(|r| r.lid())
            .collect();
        for lid in &deleted {
            state.map.remove(*lid);
        }
        if !deleted.is_empty() {
            tracing::debug!("Pruned {} deleted record(s)", deleted.len());
        }
        deleted.len()
    }

    /// Drop `record` from the cache without touching the server.
    pub fn unload_record(&self, record: &RecordRef<A>) -> Result<(), StoreError> {
        self.owns(record)?;
        self.unload(record.lid())
    }

    fn owns(&self, record: &RecordRef<A>) -> Result<(), StoreError> {
        if !self.same_store(record.store()) {
            return Err(LifecycleError::ForeignRecord.into());
        }
        Ok(())
    }

    pub(crate) fn read<R>(&self, lid: Lid, f: impl FnOnce(&Record) -> R) -> Option<R> {
        self.lock().map.get(lid).map(f)
    }

    pub(crate) fn snapshot_of(&self, lid: Lid) -> Option<Snapshot> {
        snapshot(&self.lock().map, lid)
    }

    pub(crate) fn set_attribute(&self, lid: Lid, name: &str, value: Value) -> Result<(), StoreError> {
        let mut state = self.lock();
        ensure_alive(&state)?;
        let record = record_mut(&mut state, lid)?;
        record.state().transition(StateEvent::Mutated)?;

        record.set_attribute(name, value);
        if let Some(edge) = record.errors_mut().remove(name) {
            record.apply(edge.into())?;
        }
        let event = if record.has_changed_attributes() {
            StateEvent::Mutated
        } else {
            StateEvent::Reverted
        };
        record.apply(event)?;
        Ok(())
    }

    /// Run `f` against a copy of the error ledger and commit it only if the
    /// resulting validity edge is legal in the current state.
    pub(crate) fn update_errors(
        &self,
        lid: Lid,
        f: impl FnOnce(&mut Errors) -> Option<ValidityEdge>,
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        ensure_alive(&state)?;
        let record = record_mut(&mut state, lid)?;
        let mut errors = record.errors().clone();
        let edge = f(&mut errors);
        if let Some(edge) = edge {
            record.state().transition(edge.into())?;
        }
        *record.errors_mut() = errors;
        if let Some(edge) = edge {
            record.apply(edge.into())?;
        }
        Ok(())
    }

    pub(crate) fn delete(&self, lid: Lid) -> Result<(), StoreError> {
        let mut state = self.lock();
        ensure_alive(&state)?;
        let record = record_mut(&mut state, lid)?;
        let current = record.state();
        current.transition(StateEvent::DeleteRequested)?;
        // Errors belong to the edits being discarded.
        if !current.is_deleted() {
            if let Some(edge) = record.errors_mut().clear() {
                record.apply(edge.into())?;
            }
        }
        let next = record.apply(StateEvent::DeleteRequested)?;
        if next == RecordState::DeletedSaved {
            finalize_deletion(&mut state, lid);
        }
        Ok(())
    }

    pub(crate) fn rollback(&self, lid: Lid) -> Result<Vec<String>, StoreError> {
        let mut state = self.lock();
        ensure_alive(&state)?;
        let record = record_mut(&mut state, lid)?;
        record.state().transition(StateEvent::RolledBack)?;
        let reverted = record.rollback_attributes();
        record.errors_mut().clear();
        let next = record.apply(StateEvent::RolledBack)?;
        if next == RecordState::DeletedSaved {
            finalize_deletion(&mut state, lid);
        }
        Ok(reverted)
    }

    pub(crate) async fn save(&self, lid: Lid) -> Result<(), StoreError> {
        let receiver = {
            let mut state = self.lock();
            ensure_alive(&state)?;
            let record = record_mut(&mut state, lid)?;
            let current = record.state();
            if current == RecordState::DeletedSaved {
                return Ok(());
            }
            current.transition(StateEvent::SaveStarted)?;
            if let Some(edge) = record.errors_mut().clear() {
                record.apply(edge.into())?;
            }
            record.apply(StateEvent::SaveStarted)?;
            let subject = record.describe();

            let snapshot = snapshot(&state.map, lid)
                .ok_or_else(|| LifecycleError::RecordUnloaded(subject.clone()))?;
            let call = if current.is_new() {
                AdapterCall::Create(snapshot)
            } else if current.is_deleted() {
                AdapterCall::Delete(snapshot)
            } else {
                AdapterCall::Update(snapshot)
            };
            let id = state
                .ledger
                .register(call.kind(), RequestTarget::Save(lid), Mode::Blocking, subject);
            self.spawn_request(id, call);
            state.ledger.wait(id)
        };

        settle(receiver).await.map(|_| ())
    }

    fn settle_save(
        &self,
        state: &mut State,
        lid: Lid,
        kind: RequestKind,
        result: Result<Value, AdapterError>,
    ) -> Outcome {
        let committed = result
            .map_err(StoreError::from)
            .and_then(|raw| self.commit_save(state, lid, kind, raw));

        match committed {
            Ok(()) => Ok(Resolved::Saved),
            Err(e) => {
                let record = record_mut(state, lid)?;
                if !record.state().is_saving() {
                    return Err(e);
                }
                match &e {
                    StoreError::Invalid(messages) => {
                        record.apply(StateEvent::SaveRejected)?;
                        record.errors_mut().extend(messages.iter().cloned());
                    }
                    _ => {
                        record.apply(StateEvent::SaveFailed)?;
                        // Errors added while the save was in flight.
                        if !record.errors().is_empty() {
                            record.apply(StateEvent::BecameInvalid)?;
                        }
                    }
                }
                Err(e)
            }
        }
    }

    fn commit_save(
        &self,
        state: &mut State,
        lid: Lid,
        kind: RequestKind,
        raw: Value,
    ) -> Result<(), StoreError> {
        let model = record_mut(state, lid)?.model().clone();
        let document = self.normalize(&model, kind, raw)?;
        let resource = document.expect_single_or_null(kind.name())?.cloned();
        let (_, included) = document.into_parts();

        if kind == RequestKind::DeleteRecord {
            record_mut(state, lid)?.apply(StateEvent::SaveSucceeded)?;
            finalize_deletion(state, lid);
        } else {
            let record = record_mut(state, lid)?;
            if record.id().is_none() {
                let server_id = resource
                    .as_ref()
                    .and_then(|r| r.id.clone())
                    .ok_or_else(|| ContractError::SavedWithoutId(model.to_string()))?;
                state.map.assign_id(lid, RecordId::parse(server_id)?)?;
            }

            let record = record_mut(state, lid)?;
            let attributes = resource
                .as_ref()
                .map(|r| r.attributes.clone())
                .unwrap_or_default();
            record.commit(attributes);
            record.errors_mut().clear();
            record.apply(StateEvent::SaveSucceeded)?;
            if let Some(resource) = &resource {
                self.apply_relationships(state, lid, resource)?;
            }
        }

        for resource in &included {
            self.push_resource(state, resource)?;
        }
        Ok(())
    }

    // ---- relationships ----

    pub(crate) fn related(&self, lid: Lid, name: &str) -> Result<Related<A>, StoreError> {
        let state = self.lock();
        let record = state
            .map
            .get(lid)
            .ok_or_else(|| LifecycleError::RecordUnloaded(lid.to_string()))?;
        let def = self.inner.schema.relationship(record.model(), name)?;
        let members = record
            .relationship(name)
            .map(|r| r.members())
            .unwrap_or_default();

        let unloaded = members
            .iter()
            .any(|m| !state.map.get(*m).is_some_and(|r| r.state().is_loaded()));
        if !unloaded {
            return Ok(Related::Ready(self.handles(&state, members)));
        }
        if !def.is_lazy() {
            return Err(ContractError::EagerNotLoaded {
                record: record.describe(),
                name: name.to_string(),
            }
            .into());
        }

        let members = members
            .into_iter()
            .filter_map(|m| {
                let member = state.map.get(m)?;
                Some((m, member.model().clone(), member.key()))
            })
            .collect();
        Ok(Related::Pending(PendingRelated::new(self.clone(), members)))
    }

    /// Related handles present in the store, whatever their state.
    pub(crate) fn peek_related(&self, lid: Lid, name: &str) -> Result<Vec<RecordRef<A>>, StoreError> {
        let state = self.lock();
        let record = state
            .map
            .get(lid)
            .ok_or_else(|| LifecycleError::RecordUnloaded(lid.to_string()))?;
        self.inner.schema.relationship(record.model(), name)?;
        let members = record
            .relationship(name)
            .map(|r| r.members())
            .unwrap_or_default();
        Ok(self.handles(&state, members))
    }

    /// Shared preamble of local relationship writes.
    fn relationship_write(
        &self,
        state: &mut State,
        lid: Lid,
        name: &str,
        kind: RelationshipKind,
        target: Option<(Lid, &ModelName)>,
    ) -> Result<RelationshipDef, StoreError> {
        ensure_alive(state)?;
        let record = record_mut(state, lid)?;
        let def = graph::definition(&self.inner.schema, record.model(), name, kind)?;
        record.state().transition(StateEvent::Mutated)?;
        if let Some((target, model)) = target {
            if *model != def.related {
                return Err(SchemaError::WrongModel {
                    name: name.to_string(),
                    expected: def.related.to_string(),
                    actual: model.to_string(),
                }
                .into());
            }
            if !state.map.contains(target) {
                return Err(LifecycleError::RecordUnloaded(target.to_string()).into());
            }
        }
        Ok(def)
    }

    pub(crate) fn set_belongs_to(
        &self,
        lid: Lid,
        name: &str,
        target: Option<(Lid, &ModelName)>,
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        let def = self.relationship_write(&mut state, lid, name, RelationshipKind::BelongsTo, target)?;
        graph::set_belongs_to(
            &mut state.map,
            &self.inner.schema,
            lid,
            &def,
            target.map(|(t, _)| t),
        );
        record_mut(&mut state, lid)?.apply(StateEvent::Mutated)?;
        Ok(())
    }

    pub(crate) fn add_to_has_many(
        &self,
        lid: Lid,
        name: &str,
        target: (Lid, &ModelName),
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        let def = self.relationship_write(&mut state, lid, name, RelationshipKind::HasMany, Some(target))?;
        graph::add_to_has_many(&mut state.map, &self.inner.schema, lid, &def, target.0);
        record_mut(&mut state, lid)?.apply(StateEvent::Mutated)?;
        Ok(())
    }

    pub(crate) fn remove_from_has_many(
        &self,
        lid: Lid,
        name: &str,
        target: (Lid, &ModelName),
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        let def = self.relationship_write(&mut state, lid, name, RelationshipKind::HasMany, Some(target))?;
        graph::remove_from_has_many(&mut state.map, &self.inner.schema, lid, &def, target.0);
        record_mut(&mut state, lid)?.apply(StateEvent::Mutated)?;
        Ok(())
    }

    // ---- arrays ----

    pub(crate) fn array_kind(&self, id: ArrayId) -> Option<ArrayKind> {
        self.lock().arrays.get(id).map(|e| e.kind.clone())
    }

    pub(crate) fn array_flags(&self, id: ArrayId) -> (bool, bool) {
        self.lock()
            .arrays
            .get(id)
            .map(|e| (e.updating, e.destroyed))
            .unwrap_or((false, true))
    }

    pub(crate) fn array_records(&self, id: ArrayId) -> Vec<RecordRef<A>> {
        let state = self.lock();
        let lids = match state.arrays.get(id) {
            Some(entry) if entry.destroyed => Vec::new(),
            Some(entry) => match &entry.kind {
                ArrayKind::All(model) => visible(&state.map, model),
                ArrayKind::Query { .. } => entry
                    .members
                    .iter()
                    .copied()
                    .filter(|lid| state.map.get(*lid).is_some_and(|r| r.state().is_visible()))
                    .collect(),
            },
            None => Vec::new(),
        };
        self.handles(&state, lids)
    }

    // ---- unload and teardown ----

    pub(crate) fn unload(&self, lid: Lid) -> Result<(), StoreError> {
        let mut state = self.lock();
        ensure_alive(&state)?;
        unload_locked(&mut state, lid)
    }

    /// Unload every record, or every record of one type. Fails without
    /// unloading anything if one of them is being saved.
    pub fn unload_all(&self, model: Option<&str>) -> Result<(), StoreError> {
        let mut state = self.lock();
        ensure_alive(&state)?;
        let targets: Vec<Lid> = state
            .map
            .records()
            .filter(|r| model.map_or(true, |m| r.model().as_str() == m))
            .map(|r| r.lid())
            .collect();

        if let Some(saving) = targets
            .iter()
            .filter_map(|lid| state.map.get(*lid))
            .find(|r| r.state().is_saving())
        {
            return Err(LifecycleError::RecordInFlight(saving.describe()).into());
        }
        for lid in targets {
            unload_locked(&mut state, lid)?;
        }
        Ok(())
    }

    /// Tear the store down.
    ///
    /// Pending requests are rejected and their late responses ignored. Every
    /// record is torn down, dependents first, and every array destroyed.
    /// Fails with [`StoreError::LeakDetected`] if any request was still
    /// pending; the teardown itself happens either way.
    pub fn destroy(&self) -> Result<TeardownReport, StoreError> {
        let (report, pending) = {
            let mut state = self.lock();
            ensure_alive(&state)?;
            state.destroyed = true;
            let pending = state.ledger.drain();

            let mut report = TeardownReport::default();
            for lid in graph::teardown_order(&state.map, &self.inner.schema) {
                if let Some(record) = state.map.get(lid) {
                    report.records.push(record.describe());
                    report.relationships += record
                        .relationships()
                        .values()
                        .map(|r| r.members().len())
                        .sum::<usize>();
                }
                graph::detach(&mut state.map, lid);
                state.map.remove(lid);
            }
            report.arrays = state.arrays.destroy_all();
            (report, pending)
        };

        let leaked: Vec<String> = pending.iter().map(|r| r.description().to_string()).collect();
        for request in pending {
            request.resolve(Err(LifecycleError::StoreDestroyed.into()));
        }

        tracing::info!(
            "Store destroyed: {} records, {} relationships, {} arrays",
            report.records.len(),
            report.relationships,
            report.arrays
        );
        if leaked.is_empty() {
            Ok(report)
        } else {
            tracing::error!("Async request leaks detected: {:?}", leaked);
            Err(StoreError::LeakDetected {
                requests: leaked,
                report,
            })
        }
    }
}

fn ensure_alive(state: &State) -> Result<(), StoreError> {
    if state.destroyed {
        return Err(LifecycleError::StoreDestroyed.into());
    }
    Ok(())
}

fn record_mut(state: &mut State, lid: Lid) -> Result<&mut Record, StoreError> {
    state
        .map
        .get_mut(lid)
        .ok_or_else(|| LifecycleError::RecordUnloaded(lid.to_string()).into())
}

/// Visible records of a type in insertion order.
fn visible(map: &IdentityMap, model: &ModelName) -> Vec<Lid> {
    map.all_of(model)
        .into_iter()
        .filter(|lid| map.get(*lid).is_some_and(|r| r.state().is_visible()))
        .collect()
}

fn snapshot(map: &IdentityMap, lid: Lid) -> Option<Snapshot> {
    let record = map.get(lid)?;
    Some(record.snapshot(|member| {
        let key = map.get(member)?.key()?;
        Some(ResourceIdentifier::new(key.model, key.id.to_string()))
    }))
}

fn mark_updating(state: &mut State, target: &RequestTarget, updating: bool) {
    let array = match target {
        RequestTarget::All(model) => Some(state.arrays.live_array(model)),
        RequestTarget::Query(model, canonical) => state.arrays.query_array(model, canonical),
        _ => None,
    };
    if let Some(array) = array {
        state.arrays.set_updating(array, updating);
    }
}

/// Remove an acknowledged deletion from the identity index, the graph and
/// every array. The handle itself stays until unload or teardown.
fn finalize_deletion(state: &mut State, lid: Lid) {
    graph::detach(&mut state.map, lid);
    state.map.forget(lid);
    state.arrays.drop_member(lid);
}

fn unload_locked(state: &mut State, lid: Lid) -> Result<(), StoreError> {
    let Some(record) = state.map.get_mut(lid) else {
        return Ok(());
    };
    if record.state().is_saving() {
        return Err(LifecycleError::RecordInFlight(record.describe()).into());
    }
    record.apply(StateEvent::Unloaded)?;
    tracing::debug!("Unloading {}", record.describe());
    graph::detach(&mut state.map, lid);
    state.arrays.drop_member(lid);
    state.map.remove(lid);
    Ok(())
}

/// Ask a policy hook, treating a panic like an error answer.
fn consult(
    hook: &'static str,
    ask: impl FnOnce() -> Result<bool, AdapterError>,
) -> Result<bool, StoreError> {
    match catch_unwind(AssertUnwindSafe(ask)) {
        Ok(Ok(answer)) => Ok(answer),
        Ok(Err(e)) => {
            tracing::warn!("{} failed: {}", hook, e);
            Err(e.into())
        }
        Err(_) => {
            tracing::error!("{} panicked", hook);
            Err(AdapterError::transport(format!("{hook} panicked")).into())
        }
    }
}

async fn settle(receiver: oneshot::Receiver<Outcome>) -> Outcome {
    receiver
        .await
        .unwrap_or_else(|_| Err(LifecycleError::StoreDestroyed.into()))
}

fn unexpected(resolved: Resolved) -> StoreError {
    ContractError::Malformed(format!("unexpected resolution {resolved:?}")).into()
}

/// Attribute maps for [`Store::create`].
pub fn attributes<I, K, V>(pairs: I) -> Map<String, Value>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Value>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}
