//! In-flight request ledger and adapter dispatch.
//!
//! Every request the store issues is registered here before the adapter is
//! called and completed exactly once. Blocking callers wait on a oneshot
//! channel attached to the pending entry; completing an entry fans the
//! outcome out to all of them. After teardown the ledger is drained, so late
//! completions find nothing and become no-ops.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::oneshot;

use lager_core::{Adapter, AdapterError, Lid, ModelName, RecordId, RecordKey, RequestKind, Snapshot};

use crate::error::{LifecycleError, StoreError};
use crate::record_array::ArrayId;

pub type RequestId = u64;

/// What a pending request is for. Requests for the same target may be joined.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RequestTarget {
    Record(RecordKey),
    All(ModelName),
    Query(ModelName, String),
    QueryRecord(ModelName, String),
    Save(Lid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// A caller is waiting for the outcome.
    Blocking,
    /// Nobody waits; failures are logged.
    Background,
}

/// The value a request resolves to.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    Record(Lid),
    Array(ArrayId),
    Maybe(Option<Lid>),
    Saved,
}

pub type Outcome = Result<Resolved, StoreError>;

#[derive(Debug)]
pub struct PendingRequest {
    pub kind: RequestKind,
    pub target: RequestTarget,
    pub mode: Mode,
    description: String,
    waiters: Vec<oneshot::Sender<Outcome>>,
}

impl PendingRequest {
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Hand `outcome` to every waiter. Waiters that gave up are skipped.
    pub fn resolve(self, outcome: Outcome) {
        for waiter in self.waiters {
            let _ = waiter.send(outcome.clone());
        }
    }
}

#[derive(Debug, Default)]
pub struct Ledger {
    pending: BTreeMap<RequestId, PendingRequest>,
    next_id: RequestId,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        kind: RequestKind,
        target: RequestTarget,
        mode: Mode,
        subject: impl std::fmt::Display,
    ) -> RequestId {
        self.next_id += 1;
        let description = match mode {
            Mode::Blocking => format!("{kind} {subject}"),
            Mode::Background => format!("{kind} {subject} (background)"),
        };
        self.pending.insert(
            self.next_id,
            PendingRequest {
                kind,
                target,
                mode,
                description,
                waiters: Vec::new(),
            },
        );
        self.next_id
    }

    /// Attach a waiter to a pending request.
    pub fn wait(&mut self, id: RequestId) -> oneshot::Receiver<Outcome> {
        let (tx, rx) = oneshot::channel();
        match self.pending.get_mut(&id) {
            Some(request) => request.waiters.push(tx),
            None => {
                let _ = tx.send(Err(LifecycleError::StoreDestroyed.into()));
            }
        }
        rx
    }

    /// A blocking request for `target` that can be joined.
    pub fn blocking_for(&self, target: &RequestTarget) -> Option<RequestId> {
        self.pending
            .iter()
            .find(|(_, r)| r.mode == Mode::Blocking && r.target == *target)
            .map(|(id, _)| *id)
    }

    pub fn is_pending(&self, target: &RequestTarget) -> bool {
        self.pending.values().any(|r| r.target == *target)
    }

    /// Remove a request so it can be resolved. `None` once drained.
    pub fn complete(&mut self, id: RequestId) -> Option<PendingRequest> {
        self.pending.remove(&id)
    }

    /// Remove every pending request, in issue order.
    pub fn drain(&mut self) -> Vec<PendingRequest> {
        std::mem::take(&mut self.pending).into_values().collect()
    }

    pub fn descriptions(&self) -> Vec<String> {
        self.pending.values().map(|r| r.description.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// One call into the transport collaborator, owning its arguments.
#[derive(Debug, Clone)]
pub enum AdapterCall {
    FindRecord(ModelName, RecordId),
    FindAll(ModelName),
    Query(ModelName, Value),
    QueryRecord(ModelName, Value),
    Create(Snapshot),
    Update(Snapshot),
    Delete(Snapshot),
}

impl AdapterCall {
    pub fn kind(&self) -> RequestKind {
        match self {
            AdapterCall::FindRecord(..) => RequestKind::FindRecord,
            AdapterCall::FindAll(_) => RequestKind::FindAll,
            AdapterCall::Query(..) => RequestKind::Query,
            AdapterCall::QueryRecord(..) => RequestKind::QueryRecord,
            AdapterCall::Create(_) => RequestKind::CreateRecord,
            AdapterCall::Update(_) => RequestKind::UpdateRecord,
            AdapterCall::Delete(_) => RequestKind::DeleteRecord,
        }
    }

    async fn run<A: Adapter>(self, adapter: &A) -> Result<Value, AdapterError> {
        match self {
            AdapterCall::FindRecord(model, id) => adapter.find_record(&model, &id).await,
            AdapterCall::FindAll(model) => adapter.find_all(&model).await,
            AdapterCall::Query(model, query) => adapter.query(&model, &query).await,
            AdapterCall::QueryRecord(model, query) => adapter.query_record(&model, &query).await,
            AdapterCall::Create(snapshot) => adapter.create_record(&snapshot).await,
            AdapterCall::Update(snapshot) => adapter.update_record(&snapshot).await,
            AdapterCall::Delete(snapshot) => adapter.delete_record(&snapshot).await,
        }
    }
}

/// Run `call` on its own task so a panicking adapter surfaces as a
/// transport failure instead of tearing down the caller.
pub async fn dispatch<A: Adapter>(adapter: Arc<A>, call: AdapterCall) -> Result<Value, AdapterError> {
    let kind = call.kind();
    match tokio::spawn(async move { call.run(adapter.as_ref()).await }).await {
        Ok(result) => result,
        Err(e) => {
            tracing::error!("Adapter {} task failed: {}", kind, e);
            Err(AdapterError::transport(format!("adapter task failed: {e}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lager_core::InMemoryAdapter;

    fn car(id: &str) -> RequestTarget {
        RequestTarget::Record(RecordKey::parse("car", id).unwrap())
    }

    #[test]
    fn test_blocking_requests_can_be_joined() {
        let mut ledger = Ledger::new();
        let background = ledger.register(RequestKind::FindRecord, car("1"), Mode::Background, "car:1");
        assert_eq!(ledger.blocking_for(&car("1")), None);
        assert!(ledger.is_pending(&car("1")));

        let blocking = ledger.register(RequestKind::FindRecord, car("1"), Mode::Blocking, "car:1");
        assert_ne!(background, blocking);
        assert_eq!(ledger.blocking_for(&car("1")), Some(blocking));
        assert_eq!(ledger.blocking_for(&car("2")), None);
        assert_eq!(
            ledger.descriptions(),
            vec!["findRecord car:1 (background)", "findRecord car:1"]
        );
    }

    #[tokio::test]
    async fn test_resolution_fans_out() {
        let mut ledger = Ledger::new();
        let id = ledger.register(RequestKind::FindRecord, car("1"), Mode::Blocking, "car:1");
        let first = ledger.wait(id);
        let second = ledger.wait(id);

        ledger.complete(id).unwrap().resolve(Ok(Resolved::Record(Lid(4))));
        assert_eq!(first.await.unwrap(), Ok(Resolved::Record(Lid(4))));
        assert_eq!(second.await.unwrap(), Ok(Resolved::Record(Lid(4))));
        assert!(ledger.complete(id).is_none());
    }

    #[tokio::test]
    async fn test_waiting_on_drained_request_is_rejected() {
        let mut ledger = Ledger::new();
        let id = ledger.register(RequestKind::FindAll, RequestTarget::All("car".into()), Mode::Blocking, "car");
        assert_eq!(ledger.drain().len(), 1);
        assert!(ledger.is_empty());

        let outcome = ledger.wait(id).await.unwrap();
        assert_eq!(outcome, Err(StoreError::Lifecycle(LifecycleError::StoreDestroyed)));
    }

    #[tokio::test]
    async fn test_dispatch_traps_adapter_panics() {
        let adapter = Arc::new(InMemoryAdapter::new());
        adapter.panic_next("findAll");

        let err = dispatch(adapter.clone(), AdapterCall::FindAll("car".into()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("adapter task failed"));

        // The adapter keeps working afterwards.
        assert!(dispatch(adapter, AdapterCall::FindAll("car".into())).await.is_ok());
    }
}
