//! Canonical resource documents: `{ data: object|array|null, included?: [...] }`.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::ContractError;
use crate::identity::{ModelName, RecordKey};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceDocument {
    #[serde(default)]
    pub data: Option<PrimaryData>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub included: Vec<ResourceObject>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrimaryData {
    Many(Vec<ResourceObject>),
    Single(Box<ResourceObject>),
}

/// A single resource as it is pushed into the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceObject {
    #[serde(rename = "type")]
    pub model: ModelName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attributes: Map<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub relationships: BTreeMap<String, RelationshipData>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RelationshipData {
    /// `None` when the payload did not include linkage at all; an explicit
    /// `null` becomes `Some(Linkage::One(None))`.
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub data: Option<Linkage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Linkage {
    Many(Vec<ResourceIdentifier>),
    One(Option<ResourceIdentifier>),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceIdentifier {
    #[serde(rename = "type")]
    pub model: ModelName,
    pub id: String,
}

fn deserialize_present<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

impl ResourceIdentifier {
    pub fn new(model: impl Into<ModelName>, id: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            id: id.into(),
        }
    }

    pub fn key(&self) -> Result<RecordKey, ContractError> {
        RecordKey::parse(self.model.clone(), self.id.clone())
    }
}

impl ResourceObject {
    pub fn new(model: impl Into<ModelName>, id: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            id: Some(id.into()),
            attributes: Map::new(),
            relationships: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn with_belongs_to(mut self, name: impl Into<String>, target: Option<ResourceIdentifier>) -> Self {
        self.relationships.insert(
            name.into(),
            RelationshipData {
                data: Some(Linkage::One(target)),
            },
        );
        self
    }

    pub fn with_has_many(
        mut self,
        name: impl Into<String>,
        targets: impl IntoIterator<Item = ResourceIdentifier>,
    ) -> Self {
        self.relationships.insert(
            name.into(),
            RelationshipData {
                data: Some(Linkage::Many(targets.into_iter().collect())),
            },
        );
        self
    }

    /// The validated identity of this resource.
    pub fn key(&self) -> Result<RecordKey, ContractError> {
        let id = self
            .id
            .as_deref()
            .ok_or_else(|| ContractError::MissingResourceId(self.model.to_string()))?;
        RecordKey::parse(self.model.clone(), id)
            .map_err(|_| ContractError::MissingResourceId(self.model.to_string()))
    }
}

impl ResourceDocument {
    pub fn null() -> Self {
        Self::default()
    }

    pub fn single(resource: ResourceObject) -> Self {
        Self {
            data: Some(PrimaryData::Single(Box::new(resource))),
            included: Vec::new(),
        }
    }

    pub fn many(resources: impl IntoIterator<Item = ResourceObject>) -> Self {
        Self {
            data: Some(PrimaryData::Many(resources.into_iter().collect())),
            included: Vec::new(),
        }
    }

    pub fn with_included(mut self, included: impl IntoIterator<Item = ResourceObject>) -> Self {
        self.included.extend(included);
        self
    }

    /// Parse a raw JSON value as a resource document.
    pub fn from_value(raw: Value) -> Result<Self, ContractError> {
        serde_json::from_value(raw).map_err(|e| ContractError::Malformed(e.to_string()))
    }

    pub fn is_many(&self) -> bool {
        matches!(self.data, Some(PrimaryData::Many(_)))
    }

    /// Primary data of a response that must carry exactly one resource.
    pub fn expect_single(&self, request: &'static str) -> Result<Option<&ResourceObject>, ContractError> {
        match &self.data {
            Some(PrimaryData::Many(_)) => Err(ContractError::ExpectedSingle { request }),
            Some(PrimaryData::Single(resource)) => Ok(Some(resource)),
            None => Ok(None),
        }
    }

    /// Primary data of a response that may be one resource or null.
    pub fn expect_single_or_null(
        &self,
        request: &'static str,
    ) -> Result<Option<&ResourceObject>, ContractError> {
        match &self.data {
            Some(PrimaryData::Many(_)) => Err(ContractError::ExpectedSingleOrNull { request }),
            Some(PrimaryData::Single(resource)) => Ok(Some(resource)),
            None => Ok(None),
        }
    }

    /// Primary data of a response that must be a collection.
    pub fn expect_many(&self, request: &'static str) -> Result<&[ResourceObject], ContractError> {
        match &self.data {
            Some(PrimaryData::Many(resources)) => Ok(resources),
            Some(PrimaryData::Single(_)) => Err(ContractError::ExpectedMany { request }),
            None => Ok(&[]),
        }
    }

    /// Split into primary resources and included resources.
    pub fn into_parts(self) -> (Vec<ResourceObject>, Vec<ResourceObject>) {
        let primary = match self.data {
            Some(PrimaryData::Many(resources)) => resources,
            Some(PrimaryData::Single(resource)) => vec![*resource],
            None => Vec::new(),
        };
        (primary, self.included)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_single_document() {
        let doc = ResourceDocument::from_value(json!({
            "data": {
                "type": "car",
                "id": "1",
                "attributes": { "make": "BMC", "model": "Mini" },
                "relationships": {
                    "person": { "data": { "type": "person", "id": "1" } }
                }
            }
        }))
        .unwrap();

        let car = doc.expect_single("findRecord").unwrap().unwrap();
        assert_eq!(car.key().unwrap().to_string(), "car:1");
        assert_eq!(car.attributes["model"], json!("Mini"));
        assert_eq!(
            car.relationships["person"].data,
            Some(Linkage::One(Some(ResourceIdentifier::new("person", "1"))))
        );
    }

    #[test]
    fn test_null_data_is_accepted() {
        let doc = ResourceDocument::from_value(json!({ "data": null })).unwrap();
        assert!(doc.data.is_none());
        assert!(doc.into_parts().0.is_empty());
    }

    #[test]
    fn test_explicit_null_linkage_differs_from_missing() {
        let doc = ResourceDocument::from_value(json!({
            "data": {
                "type": "car",
                "id": "1",
                "relationships": {
                    "person": { "data": null },
                    "owner": {}
                }
            }
        }))
        .unwrap();
        let car = doc.expect_single("findRecord").unwrap().unwrap();
        assert_eq!(car.relationships["person"].data, Some(Linkage::One(None)));
        assert_eq!(car.relationships["owner"].data, None);
    }

    #[test]
    fn test_find_record_array_is_contract_violation() {
        let doc = ResourceDocument::from_value(json!({ "data": [] })).unwrap();
        let err = doc.expect_single("findRecord").unwrap_err();
        assert!(err
            .to_string()
            .contains("expected the primary data returned from a 'findRecord' response to be an object but instead it found an array"));
    }

    #[test]
    fn test_query_record_array_is_contract_violation() {
        let doc = ResourceDocument::many(vec![ResourceObject::new("car", "1")]);
        let err = doc.expect_single_or_null("queryRecord").unwrap_err();
        assert!(err.to_string().contains("single object or null"));
    }

    #[test]
    fn test_missing_id_is_rejected() {
        let resource = ResourceObject {
            id: None,
            ..ResourceObject::new("car", "x")
        };
        assert_eq!(
            resource.key().unwrap_err(),
            ContractError::MissingResourceId("car".to_string())
        );
    }

    #[test]
    fn test_malformed_document() {
        let err = ResourceDocument::from_value(json!({ "data": 42 })).unwrap_err();
        assert!(matches!(err, ContractError::Malformed(_)));
    }
}
