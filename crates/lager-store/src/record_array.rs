//! Store-owned collections returned by `find_all` and `query`.

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;

use lager_core::{Adapter, Lid, ModelName};

use crate::error::StoreError;
use crate::record_ref::RecordRef;
use crate::store::{FindOptions, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArrayId(pub u64);

impl std::fmt::Display for ArrayId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "array:{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ArrayKind {
    /// Every visible record of a type. Membership is read live from the
    /// identity map.
    All(ModelName),
    /// The result set of the last response to a query.
    Query { model: ModelName, query: Value },
}

impl ArrayKind {
    pub fn model(&self) -> &ModelName {
        match self {
            ArrayKind::All(model) => model,
            ArrayKind::Query { model, .. } => model,
        }
    }
}

#[derive(Debug)]
pub struct ArrayEntry {
    pub kind: ArrayKind,
    pub members: Vec<Lid>,
    pub updating: bool,
    pub destroyed: bool,
}

#[derive(Debug, Default)]
pub struct ArrayRegistry {
    arrays: BTreeMap<ArrayId, ArrayEntry>,
    live: HashMap<ModelName, ArrayId>,
    queries: HashMap<(ModelName, String), ArrayId>,
    next_id: u64,
}

impl ArrayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, kind: ArrayKind, members: Vec<Lid>) -> ArrayId {
        self.next_id += 1;
        let id = ArrayId(self.next_id);
        self.arrays.insert(
            id,
            ArrayEntry {
                kind,
                members,
                updating: false,
                destroyed: false,
            },
        );
        id
    }

    /// The live array for `model`, created on first use.
    pub fn live_array(&mut self, model: &ModelName) -> ArrayId {
        if let Some(id) = self.live.get(model) {
            return *id;
        }
        let id = self.insert(ArrayKind::All(model.clone()), Vec::new());
        self.live.insert(model.clone(), id);
        id
    }

    pub fn query_array(&self, model: &ModelName, canonical: &str) -> Option<ArrayId> {
        self.queries
            .get(&(model.clone(), canonical.to_string()))
            .copied()
    }

    /// Store the result set of a query response, reusing the cached array.
    pub fn set_query_result(
        &mut self,
        model: &ModelName,
        canonical: &str,
        query: Value,
        members: Vec<Lid>,
    ) -> ArrayId {
        if let Some(id) = self.query_array(model, canonical) {
            if let Some(entry) = self.arrays.get_mut(&id) {
                entry.members = members;
            }
            return id;
        }
        let id = self.insert(
            ArrayKind::Query {
                model: model.clone(),
                query,
            },
            members,
        );
        self.queries
            .insert((model.clone(), canonical.to_string()), id);
        id
    }

    pub fn set_updating(&mut self, id: ArrayId, updating: bool) {
        if let Some(entry) = self.arrays.get_mut(&id) {
            entry.updating = updating;
        }
    }

    pub fn get(&self, id: ArrayId) -> Option<&ArrayEntry> {
        self.arrays.get(&id)
    }

    /// Remove `lid` from every array holding it.
    pub fn drop_member(&mut self, lid: Lid) {
        for entry in self.arrays.values_mut() {
            entry.members.retain(|l| *l != lid);
        }
    }

    /// Destroy every array. Returns how many were destroyed.
    pub fn destroy_all(&mut self) -> usize {
        self.live.clear();
        self.queries.clear();
        let mut destroyed = 0;
        for entry in self.arrays.values_mut().filter(|e| !e.destroyed) {
            entry.destroyed = true;
            entry.updating = false;
            entry.members.clear();
            destroyed += 1;
        }
        destroyed
    }
}

/// Handle to a store-owned record array.
pub struct RecordArray<A: Adapter> {
    store: Store<A>,
    id: ArrayId,
}

impl<A: Adapter> RecordArray<A> {
    pub(crate) fn new(store: Store<A>, id: ArrayId) -> Self {
        Self { store, id }
    }

    pub fn id(&self) -> ArrayId {
        self.id
    }

    pub fn kind(&self) -> Option<ArrayKind> {
        self.store.array_kind(self.id)
    }

    pub fn model(&self) -> Option<ModelName> {
        self.kind().map(|k| k.model().clone())
    }

    /// The query this array answers, `None` for `find_all` arrays.
    pub fn query(&self) -> Option<Value> {
        match self.kind()? {
            ArrayKind::Query { query, .. } => Some(query),
            ArrayKind::All(_) => None,
        }
    }

    pub fn records(&self) -> Vec<RecordRef<A>> {
        self.store.array_records(self.id)
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }

    pub fn get(&self, index: usize) -> Option<RecordRef<A>> {
        self.records().into_iter().nth(index)
    }

    pub fn first(&self) -> Option<RecordRef<A>> {
        self.get(0)
    }

    pub fn last(&self) -> Option<RecordRef<A>> {
        self.records().pop()
    }

    /// Ids of the members, in order.
    pub fn ids(&self) -> Vec<String> {
        self.records()
            .iter()
            .filter_map(|r| r.id().map(|id| id.to_string()))
            .collect()
    }

    /// Whether a fetch for this array is pending.
    pub fn is_updating(&self) -> bool {
        self.store.array_flags(self.id).0
    }

    pub fn is_destroyed(&self) -> bool {
        self.store.array_flags(self.id).1
    }

    /// Refetch the array, blocking until the response arrives.
    pub async fn update(&self) -> Result<(), StoreError> {
        match self.kind() {
            Some(ArrayKind::All(model)) => {
                self.store.find_all(model, FindOptions::reload()).await?;
            }
            Some(ArrayKind::Query { model, query }) => {
                self.store.query(model, query, FindOptions::reload()).await?;
            }
            None => {}
        }
        Ok(())
    }
}

impl<A: Adapter> Clone for RecordArray<A> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            id: self.id,
        }
    }
}

impl<A: Adapter> std::fmt::Debug for RecordArray<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordArray")
            .field("id", &self.id)
            .field("kind", &self.kind())
            .finish()
    }
}
