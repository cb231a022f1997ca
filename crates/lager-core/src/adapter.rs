use std::future::Future;

use serde_json::Value;

use crate::document::ResourceDocument;
use crate::error::{AdapterError, ContractError};
use crate::identity::{ModelName, RecordId};
use crate::record::Snapshot;

/// The kind of request a payload answers. Drives shape validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    FindRecord,
    FindAll,
    Query,
    QueryRecord,
    CreateRecord,
    UpdateRecord,
    DeleteRecord,
    /// Data handed to the store directly, outside any request.
    Push,
}

impl RequestKind {
    pub fn name(self) -> &'static str {
        match self {
            RequestKind::FindRecord => "findRecord",
            RequestKind::FindAll => "findAll",
            RequestKind::Query => "query",
            RequestKind::QueryRecord => "queryRecord",
            RequestKind::CreateRecord => "createRecord",
            RequestKind::UpdateRecord => "updateRecord",
            RequestKind::DeleteRecord => "deleteRecord",
            RequestKind::Push => "push",
        }
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Transport collaborator: moves raw payloads to and from the backing API.
///
/// The policy hooks are synchronous and fallible. An `Err` from a hook fails
/// the request that consulted it.
pub trait Adapter: Send + Sync + 'static {
    fn find_record(
        &self,
        model: &ModelName,
        id: &RecordId,
    ) -> impl Future<Output = Result<Value, AdapterError>> + Send;

    fn find_all(&self, model: &ModelName)
        -> impl Future<Output = Result<Value, AdapterError>> + Send;

    fn query(
        &self,
        model: &ModelName,
        query: &Value,
    ) -> impl Future<Output = Result<Value, AdapterError>> + Send;

    fn query_record(
        &self,
        model: &ModelName,
        query: &Value,
    ) -> impl Future<Output = Result<Value, AdapterError>> + Send;

    fn create_record(
        &self,
        snapshot: &Snapshot,
    ) -> impl Future<Output = Result<Value, AdapterError>> + Send;

    fn update_record(
        &self,
        snapshot: &Snapshot,
    ) -> impl Future<Output = Result<Value, AdapterError>> + Send;

    fn delete_record(
        &self,
        snapshot: &Snapshot,
    ) -> impl Future<Output = Result<Value, AdapterError>> + Send;

    /// Block on a fresh fetch even though the record is cached.
    fn should_reload_record(&self, _snapshot: &Snapshot) -> Result<bool, AdapterError> {
        Ok(false)
    }

    /// Refresh a cached record in the background.
    fn should_background_reload_record(&self, _snapshot: &Snapshot) -> Result<bool, AdapterError> {
        Ok(true)
    }

    /// Block on a fresh `find_all`. Defaults to reloading when nothing is cached.
    fn should_reload_all(
        &self,
        _model: &ModelName,
        snapshots: &[Snapshot],
    ) -> Result<bool, AdapterError> {
        Ok(snapshots.is_empty())
    }

    fn should_background_reload_all(
        &self,
        _model: &ModelName,
        _snapshots: &[Snapshot],
    ) -> Result<bool, AdapterError> {
        Ok(true)
    }
}

/// Normalization collaborator: raw payload to canonical document.
pub trait Normalizer: Send + Sync {
    fn normalize(
        &self,
        model: &ModelName,
        request: RequestKind,
        raw: Value,
    ) -> Result<ResourceDocument, ContractError>;
}

/// Accepts payloads that already are JSON:API documents.
///
/// `null` and `{}` (typical delete acknowledgements) normalize to a null document.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonApiNormalizer;

impl Normalizer for JsonApiNormalizer {
    fn normalize(
        &self,
        _model: &ModelName,
        _request: RequestKind,
        raw: Value,
    ) -> Result<ResourceDocument, ContractError> {
        match &raw {
            Value::Null => Ok(ResourceDocument::null()),
            Value::Object(map) if map.is_empty() => Ok(ResourceDocument::null()),
            _ => ResourceDocument::from_value(raw),
        }
    }
}

// In-memory implementation for testing
#[cfg(any(test, feature = "test-utils"))]
pub mod memory {
    use super::*;
    use std::collections::{BTreeMap, HashMap, VecDeque};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, RwLock};
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::Semaphore;

    use crate::document::ResourceObject;

    /// Policy hooks that tests can override.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum Hook {
        ShouldReloadRecord,
        ShouldBackgroundReloadRecord,
        ShouldReloadAll,
        ShouldBackgroundReloadAll,
    }

    impl Hook {
        fn name(self) -> &'static str {
            match self {
                Hook::ShouldReloadRecord => "shouldReloadRecord",
                Hook::ShouldBackgroundReloadRecord => "shouldBackgroundReloadRecord",
                Hook::ShouldReloadAll => "shouldReloadAll",
                Hook::ShouldBackgroundReloadAll => "shouldBackgroundReloadAll",
            }
        }
    }

    /// Scriptable in-memory backend.
    ///
    /// Serves JSON:API payloads out of a table of server-side resources,
    /// counts every call by its JSON:API method name (`findRecord`,
    /// `shouldReloadRecord`, ...), and lets tests queue failures, raw
    /// responses and panics, override policy hooks, add latency, or hold all
    /// responses until released.
    #[derive(Default)]
    pub struct InMemoryAdapter {
        resources: RwLock<BTreeMap<(String, String), ResourceObject>>,
        calls: RwLock<HashMap<&'static str, usize>>,
        hooks: RwLock<HashMap<Hook, Result<bool, AdapterError>>>,
        failures: RwLock<HashMap<&'static str, VecDeque<AdapterError>>>,
        raw: RwLock<HashMap<&'static str, VecDeque<Value>>>,
        panics: RwLock<HashMap<&'static str, usize>>,
        gate: RwLock<Option<Arc<Semaphore>>>,
        latency: RwLock<Option<Duration>>,
        next_id: AtomicU64,
        omit_created_ids: RwLock<bool>,
    }

    impl InMemoryAdapter {
        pub fn new() -> Self {
            Self {
                next_id: AtomicU64::new(1000),
                ..Self::default()
            }
        }

        /// Put a resource on the "server".
        pub fn seed(&self, resource: ResourceObject) {
            let id = resource.id.clone().unwrap_or_default();
            self.resources
                .write()
                .unwrap()
                .insert((resource.model.to_string(), id), resource);
        }

        /// Remove a resource from the "server".
        pub fn remove(&self, model: &str, id: &str) {
            self.resources
                .write()
                .unwrap()
                .remove(&(model.to_string(), id.to_string()));
        }

        pub fn server_record(&self, model: &str, id: &str) -> Option<ResourceObject> {
            self.resources
                .read()
                .unwrap()
                .get(&(model.to_string(), id.to_string()))
                .cloned()
        }

        /// Number of calls made to a method or hook, by JSON:API name.
        pub fn call_count(&self, method: &str) -> usize {
            self.calls.read().unwrap().get(method).copied().unwrap_or(0)
        }

        pub fn set_hook(&self, hook: Hook, answer: Result<bool, AdapterError>) {
            self.hooks.write().unwrap().insert(hook, answer);
        }

        /// Fail the next call to `method` with `error`.
        pub fn fail_next(&self, method: &'static str, error: AdapterError) {
            self.failures
                .write()
                .unwrap()
                .entry(method)
                .or_default()
                .push_back(error);
        }

        /// Answer the next call to `method` with a raw payload.
        pub fn respond_next(&self, method: &'static str, payload: Value) {
            self.raw
                .write()
                .unwrap()
                .entry(method)
                .or_default()
                .push_back(payload);
        }

        /// Panic inside the next call to `method`.
        pub fn panic_next(&self, method: &'static str) {
            *self.panics.write().unwrap().entry(method).or_default() += 1;
        }

        /// Panic inside the next call to a policy hook.
        pub fn panic_in_hook(&self, hook: Hook) {
            self.panic_next(hook.name());
        }

        pub fn set_latency(&self, latency: Duration) {
            *self.latency.write().unwrap() = Some(latency);
        }

        /// Acknowledge creates without assigning server ids.
        pub fn omit_created_ids(&self) {
            *self.omit_created_ids.write().unwrap() = true;
        }

        /// Hold every response until [`release`](Self::release) or
        /// [`release_all`](Self::release_all).
        pub fn hold_responses(&self) {
            *self.gate.write().unwrap() = Some(Arc::new(Semaphore::new(0)));
        }

        /// Let `n` held responses through, in arrival order.
        pub fn release(&self, n: usize) {
            if let Some(gate) = self.gate.read().unwrap().as_ref() {
                gate.add_permits(n);
            }
        }

        pub fn release_all(&self) {
            if let Some(gate) = self.gate.write().unwrap().take() {
                gate.close();
            }
        }

        /// Yield until `method` has been called at least `n` times.
        pub async fn wait_for_calls(&self, method: &str, n: usize) {
            while self.call_count(method) < n {
                tokio::task::yield_now().await;
            }
        }

        fn record_call(&self, method: &'static str) {
            *self.calls.write().unwrap().entry(method).or_default() += 1;
        }

        fn take_panic(&self, method: &str) -> bool {
            let mut panics = self.panics.write().unwrap();
            match panics.get_mut(method) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    true
                }
                _ => false,
            }
        }

        fn hook(&self, hook: Hook, default: bool) -> Result<bool, AdapterError> {
            self.record_call(hook.name());
            if self.take_panic(hook.name()) {
                panic!("Refusing to answer {}", hook.name());
            }
            self.hooks
                .read()
                .unwrap()
                .get(&hook)
                .cloned()
                .unwrap_or(Ok(default))
        }

        /// Common prologue: count, wait, then apply scripted outcomes.
        async fn begin(&self, method: &'static str) -> Option<Result<Value, AdapterError>> {
            self.record_call(method);

            let latency = *self.latency.read().unwrap();
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }

            let gate = self.gate.read().unwrap().clone();
            if let Some(gate) = gate {
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
            }

            if self.take_panic(method) {
                panic!("Refusing to {method}");
            }

            if let Some(error) = self
                .failures
                .write()
                .unwrap()
                .get_mut(method)
                .and_then(|q| q.pop_front())
            {
                return Some(Err(error));
            }

            self.raw
                .write()
                .unwrap()
                .get_mut(method)
                .and_then(|q| q.pop_front())
                .map(Ok)
        }

        fn matching(&self, model: &ModelName, query: &Value) -> Vec<ResourceObject> {
            let filter = query.as_object();
            self.resources
                .read()
                .unwrap()
                .values()
                .filter(|r| r.model == *model)
                .filter(|r| {
                    filter.map_or(true, |f| f.iter().all(|(k, v)| r.attributes.get(k) == Some(v)))
                })
                .cloned()
                .collect()
        }

        fn store_snapshot(&self, snapshot: &Snapshot, id: String) -> ResourceObject {
            let mut resource = ResourceObject::new(snapshot.model.clone(), id.clone());
            resource.attributes = snapshot.attributes.clone();
            let doc = snapshot.to_document();
            if let Some(crate::document::PrimaryData::Single(sent)) = doc.data {
                resource.relationships = sent.relationships;
            }
            self.resources
                .write()
                .unwrap()
                .insert((snapshot.model.to_string(), id), resource.clone());
            resource
        }
    }

    impl Adapter for InMemoryAdapter {
        async fn find_record(&self, model: &ModelName, id: &RecordId) -> Result<Value, AdapterError> {
            if let Some(scripted) = self.begin("findRecord").await {
                return scripted;
            }
            match self.server_record(model.as_str(), id.as_str()) {
                Some(resource) => Ok(json!({ "data": resource })),
                None => Err(AdapterError::NotFound(format!("{model}:{id}"))),
            }
        }

        async fn find_all(&self, model: &ModelName) -> Result<Value, AdapterError> {
            if let Some(scripted) = self.begin("findAll").await {
                return scripted;
            }
            Ok(json!({ "data": self.matching(model, &Value::Null) }))
        }

        async fn query(&self, model: &ModelName, query: &Value) -> Result<Value, AdapterError> {
            if let Some(scripted) = self.begin("query").await {
                return scripted;
            }
            Ok(json!({ "data": self.matching(model, query) }))
        }

        async fn query_record(&self, model: &ModelName, query: &Value) -> Result<Value, AdapterError> {
            if let Some(scripted) = self.begin("queryRecord").await {
                return scripted;
            }
            let first = self.matching(model, query).into_iter().next();
            Ok(json!({ "data": first }))
        }

        async fn create_record(&self, snapshot: &Snapshot) -> Result<Value, AdapterError> {
            if let Some(scripted) = self.begin("createRecord").await {
                return scripted;
            }
            if *self.omit_created_ids.read().unwrap() {
                return Ok(json!({}));
            }
            let id = match &snapshot.id {
                Some(id) => id.to_string(),
                None => self.next_id.fetch_add(1, Ordering::SeqCst).to_string(),
            };
            let resource = self.store_snapshot(snapshot, id);
            Ok(json!({ "data": resource }))
        }

        async fn update_record(&self, snapshot: &Snapshot) -> Result<Value, AdapterError> {
            if let Some(scripted) = self.begin("updateRecord").await {
                return scripted;
            }
            let id = snapshot
                .id
                .as_ref()
                .map(|id| id.to_string())
                .ok_or_else(|| AdapterError::transport("cannot update a record without an id"))?;
            let resource = self.store_snapshot(snapshot, id);
            Ok(json!({ "data": resource }))
        }

        async fn delete_record(&self, snapshot: &Snapshot) -> Result<Value, AdapterError> {
            if let Some(scripted) = self.begin("deleteRecord").await {
                return scripted;
            }
            if let Some(id) = &snapshot.id {
                self.remove(snapshot.model.as_str(), id.as_str());
            }
            Ok(json!({}))
        }

        fn should_reload_record(&self, _snapshot: &Snapshot) -> Result<bool, AdapterError> {
            self.hook(Hook::ShouldReloadRecord, false)
        }

        fn should_background_reload_record(&self, _snapshot: &Snapshot) -> Result<bool, AdapterError> {
            self.hook(Hook::ShouldBackgroundReloadRecord, true)
        }

        fn should_reload_all(
            &self,
            _model: &ModelName,
            snapshots: &[Snapshot],
        ) -> Result<bool, AdapterError> {
            self.hook(Hook::ShouldReloadAll, snapshots.is_empty())
        }

        fn should_background_reload_all(
            &self,
            _model: &ModelName,
            _snapshots: &[Snapshot],
        ) -> Result<bool, AdapterError> {
            self.hook(Hook::ShouldBackgroundReloadAll, true)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn car(id: &str, model: &str) -> ResourceObject {
            ResourceObject::new("car", id)
                .with_attribute("make", "BMC")
                .with_attribute("model", model)
        }

        #[tokio::test]
        async fn test_find_record_serves_seeded_resource() {
            let adapter = InMemoryAdapter::new();
            adapter.seed(car("1", "Mini"));

            let raw = adapter
                .find_record(&"car".into(), &RecordId::parse("1").unwrap())
                .await
                .unwrap();
            assert_eq!(raw["data"]["attributes"]["model"], json!("Mini"));
            assert_eq!(adapter.call_count("findRecord"), 1);
        }

        #[tokio::test]
        async fn test_missing_record_is_not_found() {
            let adapter = InMemoryAdapter::new();
            let err = adapter
                .find_record(&"car".into(), &RecordId::parse("9").unwrap())
                .await
                .unwrap_err();
            assert!(matches!(err, AdapterError::NotFound(_)));
        }

        #[tokio::test]
        async fn test_scripted_failure_then_recovery() {
            let adapter = InMemoryAdapter::new();
            adapter.seed(car("1", "Mini"));
            adapter.fail_next("findAll", AdapterError::transport("offline"));

            assert!(adapter.find_all(&"car".into()).await.is_err());
            let raw = adapter.find_all(&"car".into()).await.unwrap();
            assert_eq!(raw["data"].as_array().unwrap().len(), 1);
        }

        #[tokio::test]
        async fn test_query_filters_by_attributes() {
            let adapter = InMemoryAdapter::new();
            adapter.seed(car("1", "Mini"));
            adapter.seed(car("2", "Isetta"));

            let raw = adapter
                .query(&"car".into(), &json!({ "model": "Isetta" }))
                .await
                .unwrap();
            let data = raw["data"].as_array().unwrap();
            assert_eq!(data.len(), 1);
            assert_eq!(data[0]["id"], json!("2"));
        }

        #[test]
        fn test_hook_overrides_and_counts() {
            let adapter = InMemoryAdapter::new();
            assert!(adapter.should_reload_all(&"car".into(), &[]).unwrap());
            adapter.set_hook(Hook::ShouldReloadAll, Ok(false));
            assert_eq!(adapter.should_reload_all(&"car".into(), &[]).unwrap(), false);
            assert_eq!(adapter.call_count("shouldReloadAll"), 2);
        }

        #[test]
        fn test_json_api_normalizer_accepts_empty_ack() {
            let doc = JsonApiNormalizer
                .normalize(&"car".into(), RequestKind::DeleteRecord, json!({}))
                .unwrap();
            assert!(doc.data.is_none());
        }
    }
}
