//! Arena of record handles addressed by [`Lid`], indexed by `(type, id)`.

use std::collections::{BTreeMap, HashMap};

use lager_core::{ContractError, Lid, ModelName, Record, RecordId, RecordKey};

#[derive(Debug, Default)]
pub struct IdentityMap {
    records: BTreeMap<Lid, Record>,
    by_id: HashMap<ModelName, HashMap<RecordId, Lid>>,
    order: HashMap<ModelName, Vec<Lid>>,
    next_lid: u64,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&mut self) -> Lid {
        self.next_lid += 1;
        Lid(self.next_lid)
    }

    fn insert(&mut self, record: Record) -> Lid {
        let lid = record.lid();
        self.order.entry(record.model().clone()).or_default().push(lid);
        if let Some(id) = record.id() {
            self.by_id
                .entry(record.model().clone())
                .or_default()
                .insert(id.clone(), lid);
        }
        self.records.insert(lid, record);
        lid
    }

    /// The handle for `key`, created in the empty state if absent.
    pub fn get_or_create(&mut self, key: &RecordKey) -> Lid {
        if let Some(lid) = self.lookup(key) {
            return lid;
        }
        let lid = self.allocate();
        self.insert(Record::empty(lid, key.model.clone(), key.id.clone()))
    }

    /// Register a client-created record. A client id must not be in use.
    pub fn create_local(&mut self, model: ModelName, id: Option<RecordId>) -> Result<Lid, ContractError> {
        if let Some(id) = &id {
            if self.lookup(&RecordKey::new(model.clone(), id.clone())).is_some() {
                return Err(ContractError::DuplicateId {
                    model: model.to_string(),
                    id: id.to_string(),
                });
            }
        }
        let lid = self.allocate();
        Ok(self.insert(Record::created(lid, model, id)))
    }

    /// Promote a local record to its server identity.
    pub fn assign_id(&mut self, lid: Lid, id: RecordId) -> Result<(), ContractError> {
        let Some(record) = self.records.get(&lid) else {
            return Ok(());
        };
        let model = record.model().clone();
        if let Some(existing) = self.lookup(&RecordKey::new(model.clone(), id.clone())) {
            if existing != lid {
                return Err(ContractError::DuplicateId {
                    model: model.to_string(),
                    id: id.to_string(),
                });
            }
        }
        self.by_id
            .entry(model)
            .or_default()
            .insert(id.clone(), lid);
        if let Some(record) = self.records.get_mut(&lid) {
            record.assign_id(id);
        }
        Ok(())
    }

    pub fn lookup(&self, key: &RecordKey) -> Option<Lid> {
        self.by_id.get(&key.model)?.get(&key.id).copied()
    }

    pub fn get(&self, lid: Lid) -> Option<&Record> {
        self.records.get(&lid)
    }

    pub fn get_mut(&mut self, lid: Lid) -> Option<&mut Record> {
        self.records.get_mut(&lid)
    }

    pub fn contains(&self, lid: Lid) -> bool {
        self.records.contains_key(&lid)
    }

    /// Drop the `(type, id)` entry but keep the handle in the arena.
    ///
    /// Used for records whose delete was acknowledged: callers still holding
    /// the handle see it as deleted, while the identity is free again.
    pub fn forget(&mut self, lid: Lid) {
        let Some(record) = self.records.get(&lid) else {
            return;
        };
        let model = record.model().clone();
        if let Some(id) = record.id() {
            if let Some(index) = self.by_id.get_mut(&model) {
                if index.get(id) == Some(&lid) {
                    index.remove(id);
                }
            }
        }
        if let Some(order) = self.order.get_mut(&model) {
            order.retain(|l| *l != lid);
        }
    }

    /// Remove a handle entirely.
    pub fn remove(&mut self, lid: Lid) -> Option<Record> {
        self.forget(lid);
        self.records.remove(&lid)
    }

    /// Handles of one type in insertion order.
    pub fn all_of(&self, model: &ModelName) -> Vec<Lid> {
        self.order.get(model).cloned().unwrap_or_default()
    }

    /// Every handle in the arena, in allocation order.
    pub fn lids(&self) -> Vec<Lid> {
        self.records.keys().copied().collect()
    }

    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }

    pub fn records_mut(&mut self) -> impl Iterator<Item = &mut Record> {
        self.records.values_mut()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lager_core::RecordState;

    fn key(model: &str, id: &str) -> RecordKey {
        RecordKey::parse(model, id).unwrap()
    }

    #[test]
    fn test_get_or_create_never_duplicates() {
        let mut map = IdentityMap::new();
        let first = map.get_or_create(&key("car", "1"));
        let second = map.get_or_create(&key("car", "1"));
        assert_eq!(first, second);
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(first).unwrap().state(), RecordState::Empty);
    }

    #[test]
    fn test_same_id_different_types() {
        let mut map = IdentityMap::new();
        let car = map.get_or_create(&key("car", "1"));
        let person = map.get_or_create(&key("person", "1"));
        assert_ne!(car, person);
    }

    #[test]
    fn test_all_of_keeps_insertion_order() {
        let mut map = IdentityMap::new();
        let b = map.get_or_create(&key("car", "b"));
        let a = map.get_or_create(&key("car", "a"));
        map.get_or_create(&key("person", "1"));
        assert_eq!(map.all_of(&"car".into()), vec![b, a]);
        assert!(map.all_of(&"boat".into()).is_empty());
    }

    #[test]
    fn test_local_records_are_promoted() {
        let mut map = IdentityMap::new();
        let first = map.create_local("person".into(), None).unwrap();
        let second = map.create_local("person".into(), None).unwrap();
        assert_ne!(first, second);

        map.assign_id(first, RecordId::parse("7").unwrap()).unwrap();
        assert_eq!(map.lookup(&key("person", "7")), Some(first));
        assert_eq!(map.get(first).unwrap().id().unwrap().as_str(), "7");

        let err = map.assign_id(second, RecordId::parse("7").unwrap()).unwrap_err();
        assert!(matches!(err, ContractError::DuplicateId { .. }));
    }

    #[test]
    fn test_client_id_collision() {
        let mut map = IdentityMap::new();
        map.get_or_create(&key("person", "1"));
        let err = map
            .create_local("person".into(), Some(RecordId::parse("1").unwrap()))
            .unwrap_err();
        assert_eq!(
            err,
            ContractError::DuplicateId {
                model: "person".into(),
                id: "1".into()
            }
        );
    }

    #[test]
    fn test_forget_keeps_handle() {
        let mut map = IdentityMap::new();
        let lid = map.get_or_create(&key("car", "1"));
        map.forget(lid);
        assert!(map.contains(lid));
        assert_eq!(map.lookup(&key("car", "1")), None);
        assert!(map.all_of(&"car".into()).is_empty());

        // The identity is free again.
        let fresh = map.get_or_create(&key("car", "1"));
        assert_ne!(fresh, lid);

        assert!(map.remove(lid).is_some());
        assert_eq!(map.lookup(&key("car", "1")), Some(fresh));
    }
}
