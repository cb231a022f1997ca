use serde::{Deserialize, Serialize};

use crate::error::ContractError;

/// Name of a record type, e.g. `"car"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelName(pub String);

impl ModelName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ModelName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModelName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ModelName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&ModelName> for ModelName {
    fn from(m: &ModelName) -> Self {
        m.clone()
    }
}

/// Server-side identifier of a record. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    /// Validate and wrap an id.
    pub fn parse(id: impl Into<String>) -> Result<Self, ContractError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(ContractError::InvalidId(id));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Local handle identifier, unique per store for the lifetime of the store.
///
/// Client-created records have a `Lid` long before they have a `RecordId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lid(pub u64);

impl std::fmt::Display for Lid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "@lid:{}", self.0)
    }
}

/// The `(type, id)` pair uniquely addressing a persisted record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    #[serde(rename = "type")]
    pub model: ModelName,
    pub id: RecordId,
}

impl RecordKey {
    pub fn new(model: ModelName, id: RecordId) -> Self {
        Self { model, id }
    }

    /// Build a key from raw strings, validating the id.
    pub fn parse(model: impl Into<ModelName>, id: impl Into<String>) -> Result<Self, ContractError> {
        Ok(Self {
            model: model.into(),
            id: RecordId::parse(id)?,
        })
    }
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.model, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_id_rejects_empty() {
        assert!(RecordId::parse("").is_err());
        assert!(RecordId::parse("   ").is_err());
        assert_eq!(RecordId::parse("1").unwrap().as_str(), "1");
    }

    #[test]
    fn test_record_key_display() {
        let key = RecordKey::parse("car", "20").unwrap();
        assert_eq!(key.to_string(), "car:20");
    }

    #[test]
    fn test_record_key_serializes_as_identifier() {
        let key = RecordKey::parse("person", "1").unwrap();
        let json = serde_json::to_value(&key).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "person", "id": "1" }));
    }
}
