use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::document::{Linkage, RelationshipData, ResourceDocument, ResourceIdentifier, ResourceObject};
use crate::error::TransitionError;
use crate::identity::{Lid, ModelName, RecordId, RecordKey};
use crate::state::{RecordState, StateEvent};
use crate::validation::Errors;

/// Relationship storage. Members are handle ids, never owned records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationshipValue {
    One(Option<Lid>),
    Many(Vec<Lid>),
}

impl RelationshipValue {
    pub fn members(&self) -> Vec<Lid> {
        match self {
            RelationshipValue::One(Some(lid)) => vec![*lid],
            RelationshipValue::One(None) => Vec::new(),
            RelationshipValue::Many(lids) => lids.clone(),
        }
    }

    pub fn contains(&self, lid: Lid) -> bool {
        match self {
            RelationshipValue::One(member) => *member == Some(lid),
            RelationshipValue::Many(lids) => lids.contains(&lid),
        }
    }

    /// Drop `lid` from this relationship. Returns whether anything changed.
    pub fn remove(&mut self, lid: Lid) -> bool {
        match self {
            RelationshipValue::One(member) if *member == Some(lid) => {
                *member = None;
                true
            }
            RelationshipValue::One(_) => false,
            RelationshipValue::Many(lids) => {
                let before = lids.len();
                lids.retain(|l| *l != lid);
                lids.len() != before
            }
        }
    }
}

/// Outcome of a local attribute write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeChange {
    /// The attribute now differs from its persisted value.
    Changed,
    /// The attribute is back at its persisted value.
    Reset,
}

/// In-memory state of one record.
///
/// Attributes are split into the last-known persisted values and a local
/// overlay of unsaved edits; the overlay is the dirty set.
#[derive(Debug, Clone)]
pub struct Record {
    lid: Lid,
    model: ModelName,
    id: Option<RecordId>,
    state: RecordState,
    persisted: Map<String, Value>,
    local: Map<String, Value>,
    relationships: BTreeMap<String, RelationshipValue>,
    errors: Errors,
    reloading: bool,
}

impl Record {
    /// A known identity without data.
    pub fn empty(lid: Lid, model: ModelName, id: RecordId) -> Self {
        Self::with_state(lid, model, Some(id), RecordState::Empty)
    }

    /// A client-created record. Never passes through empty or loading.
    pub fn created(lid: Lid, model: ModelName, id: Option<RecordId>) -> Self {
        Self::with_state(lid, model, id, RecordState::CreatedUncommitted)
    }

    fn with_state(lid: Lid, model: ModelName, id: Option<RecordId>, state: RecordState) -> Self {
        Self {
            lid,
            model,
            id,
            state,
            persisted: Map::new(),
            local: Map::new(),
            relationships: BTreeMap::new(),
            errors: Errors::new(),
            reloading: false,
        }
    }

    pub fn lid(&self) -> Lid {
        self.lid
    }

    pub fn model(&self) -> &ModelName {
        &self.model
    }

    pub fn id(&self) -> Option<&RecordId> {
        self.id.as_ref()
    }

    pub fn key(&self) -> Option<RecordKey> {
        self.id
            .as_ref()
            .map(|id| RecordKey::new(self.model.clone(), id.clone()))
    }

    /// `type:id`, or `type:@lid:N` for records without an id.
    pub fn describe(&self) -> String {
        match &self.id {
            Some(id) => format!("{}:{}", self.model, id),
            None => format!("{}:{}", self.model, self.lid),
        }
    }

    pub fn assign_id(&mut self, id: RecordId) {
        self.id = Some(id);
    }

    pub fn state(&self) -> RecordState {
        self.state
    }

    /// Run `event` through the state machine, updating the state on success.
    pub fn apply(&mut self, event: StateEvent) -> Result<RecordState, TransitionError> {
        let next = self.state.transition(event)?;
        self.state = next;
        Ok(next)
    }

    pub fn errors(&self) -> &Errors {
        &self.errors
    }

    pub fn errors_mut(&mut self) -> &mut Errors {
        &mut self.errors
    }

    pub fn is_reloading(&self) -> bool {
        self.reloading
    }

    pub fn set_reloading(&mut self, reloading: bool) {
        self.reloading = reloading;
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.local.get(name).or_else(|| self.persisted.get(name))
    }

    /// Current attribute values, local edits applied.
    pub fn attributes(&self) -> Map<String, Value> {
        let mut merged = self.persisted.clone();
        for (name, value) in &self.local {
            merged.insert(name.clone(), value.clone());
        }
        merged
    }

    /// Write an attribute locally. A missing persisted value compares as `null`.
    pub fn set_attribute(&mut self, name: &str, value: Value) -> AttributeChange {
        let persisted = self.persisted.get(name).unwrap_or(&Value::Null);
        if *persisted == value {
            self.local.remove(name);
            AttributeChange::Reset
        } else {
            self.local.insert(name.to_string(), value);
            AttributeChange::Changed
        }
    }

    /// Dirty attributes as `(persisted, current)`.
    pub fn changed_attributes(&self) -> BTreeMap<String, (Value, Value)> {
        self.local
            .iter()
            .map(|(name, current)| {
                let persisted = self.persisted.get(name).cloned().unwrap_or(Value::Null);
                (name.clone(), (persisted, current.clone()))
            })
            .collect()
    }

    pub fn has_changed_attributes(&self) -> bool {
        !self.local.is_empty()
    }

    /// Merge server values into the persisted layer. Local edits stay on top.
    pub fn push_attributes(&mut self, attributes: Map<String, Value>) {
        for (name, value) in attributes {
            self.persisted.insert(name, value);
        }
    }

    /// Adopt a successful save: local edits become persisted, then the
    /// server-returned values win.
    pub fn commit(&mut self, server: Map<String, Value>) {
        let local = std::mem::take(&mut self.local);
        for (name, value) in local {
            self.persisted.insert(name, value);
        }
        self.push_attributes(server);
    }

    /// Discard local edits, returning the names that were dirty.
    pub fn rollback_attributes(&mut self) -> Vec<String> {
        let local = std::mem::take(&mut self.local);
        local.into_iter().map(|(name, _)| name).collect()
    }

    pub fn relationship(&self, name: &str) -> Option<&RelationshipValue> {
        self.relationships.get(name)
    }

    pub fn relationships(&self) -> &BTreeMap<String, RelationshipValue> {
        &self.relationships
    }

    pub fn set_relationship(&mut self, name: &str, value: RelationshipValue) {
        self.relationships.insert(name.to_string(), value);
    }

    pub fn relationship_mut(&mut self, name: &str) -> Option<&mut RelationshipValue> {
        self.relationships.get_mut(name)
    }

    /// Drop every reference to `lid`. Returns the relationship names that changed.
    pub fn remove_references_to(&mut self, lid: Lid) -> Vec<String> {
        self.relationships
            .iter_mut()
            .filter_map(|(name, value)| value.remove(lid).then(|| name.clone()))
            .collect()
    }

    /// Point-in-time copy handed to the transport collaborator.
    ///
    /// `resolve` maps related handle ids to identifiers; members without an id
    /// are left out of the linkage.
    pub fn snapshot(&self, resolve: impl Fn(Lid) -> Option<ResourceIdentifier>) -> Snapshot {
        let relationships = self
            .relationships
            .iter()
            .map(|(name, value)| {
                let linkage = match value {
                    RelationshipValue::One(member) => Linkage::One(member.and_then(&resolve)),
                    RelationshipValue::Many(members) => {
                        Linkage::Many(members.iter().filter_map(|l| resolve(*l)).collect())
                    }
                };
                (name.clone(), linkage)
            })
            .collect();

        Snapshot {
            lid: self.lid,
            model: self.model.clone(),
            id: self.id.clone(),
            state: self.state,
            attributes: self.attributes(),
            changed: self.local.keys().cloned().collect(),
            relationships,
        }
    }
}

/// Immutable view of a record passed to adapters and policy hooks.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub lid: Lid,
    pub model: ModelName,
    pub id: Option<RecordId>,
    pub state: RecordState,
    pub attributes: Map<String, Value>,
    pub changed: Vec<String>,
    pub relationships: BTreeMap<String, Linkage>,
}

impl Snapshot {
    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    /// Serialize as a JSON:API document for create/update requests.
    pub fn to_document(&self) -> ResourceDocument {
        let resource = ResourceObject {
            model: self.model.clone(),
            id: self.id.as_ref().map(|id| id.to_string()),
            attributes: self.attributes.clone(),
            relationships: self
                .relationships
                .iter()
                .map(|(name, linkage)| {
                    (
                        name.clone(),
                        RelationshipData {
                            data: Some(linkage.clone()),
                        },
                    )
                })
                .collect(),
        };
        ResourceDocument::single(resource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn loaded_car() -> Record {
        let mut record = Record::empty(Lid(1), "car".into(), RecordId::parse("1").unwrap());
        let mut attrs = Map::new();
        attrs.insert("make".into(), json!("BMC"));
        attrs.insert("model".into(), json!("Mini"));
        record.push_attributes(attrs);
        record.apply(StateEvent::Pushed).unwrap();
        record
    }

    #[test]
    fn test_set_attribute_tracks_dirty_set() {
        let mut car = loaded_car();
        assert_eq!(car.set_attribute("model", json!("Princess")), AttributeChange::Changed);
        assert_eq!(car.attribute("model"), Some(&json!("Princess")));
        assert_eq!(
            car.changed_attributes()["model"],
            (json!("Mini"), json!("Princess"))
        );

        assert_eq!(car.set_attribute("model", json!("Mini")), AttributeChange::Reset);
        assert!(!car.has_changed_attributes());
    }

    #[test]
    fn test_missing_persisted_value_compares_as_null() {
        let mut record = Record::created(Lid(2), "person".into(), None);
        assert_eq!(record.set_attribute("firstName", Value::Null), AttributeChange::Reset);
        assert_eq!(
            record.set_attribute("firstName", json!("Yehuda")),
            AttributeChange::Changed
        );
    }

    #[test]
    fn test_push_keeps_local_edits() {
        let mut car = loaded_car();
        car.set_attribute("model", json!("Local"));

        let mut server = Map::new();
        server.insert("model".into(), json!("Server"));
        server.insert("make".into(), json!("Austin"));
        car.push_attributes(server);

        assert_eq!(car.attribute("model"), Some(&json!("Local")));
        assert_eq!(car.attribute("make"), Some(&json!("Austin")));
        assert_eq!(car.changed_attributes()["model"].0, json!("Server"));
    }

    #[test]
    fn test_commit_adopts_server_values() {
        let mut car = loaded_car();
        car.set_attribute("model", json!("Local"));
        car.set_attribute("color", json!("red"));

        let mut server = Map::new();
        server.insert("model".into(), json!("Normalized"));
        car.commit(server);

        assert!(!car.has_changed_attributes());
        assert_eq!(car.attribute("model"), Some(&json!("Normalized")));
        assert_eq!(car.attribute("color"), Some(&json!("red")));
    }

    #[test]
    fn test_rollback_attributes() {
        let mut car = loaded_car();
        car.set_attribute("model", json!("Local"));
        assert_eq!(car.rollback_attributes(), vec!["model".to_string()]);
        assert_eq!(car.attribute("model"), Some(&json!("Mini")));
    }

    #[test]
    fn test_remove_references() {
        let mut person = Record::created(Lid(3), "person".into(), None);
        person.set_relationship("cars", RelationshipValue::Many(vec![Lid(1), Lid(2)]));
        person.set_relationship("favorite", RelationshipValue::One(Some(Lid(1))));

        let changed = person.remove_references_to(Lid(1));
        assert_eq!(changed, vec!["cars".to_string(), "favorite".to_string()]);
        assert_eq!(
            person.relationship("cars"),
            Some(&RelationshipValue::Many(vec![Lid(2)]))
        );
        assert_eq!(
            person.relationship("favorite"),
            Some(&RelationshipValue::One(None))
        );
    }

    #[test]
    fn test_snapshot_document() {
        let mut car = loaded_car();
        car.set_relationship("person", RelationshipValue::One(Some(Lid(9))));
        let snapshot = car.snapshot(|lid| {
            (lid == Lid(9)).then(|| ResourceIdentifier::new("person", "1"))
        });

        let doc = serde_json::to_value(snapshot.to_document()).unwrap();
        assert_eq!(doc["data"]["id"], json!("1"));
        assert_eq!(doc["data"]["attributes"]["make"], json!("BMC"));
        assert_eq!(
            doc["data"]["relationships"]["person"]["data"],
            json!({ "type": "person", "id": "1" })
        );
    }
}
