use std::collections::HashMap;

use crate::error::SchemaError;
use crate::identity::ModelName;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationshipKind {
    BelongsTo,
    HasMany,
}

impl RelationshipKind {
    pub fn name(self) -> &'static str {
        match self {
            RelationshipKind::BelongsTo => "belongsTo",
            RelationshipKind::HasMany => "hasMany",
        }
    }
}

/// How related records are expected to arrive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Loading {
    /// Always delivered together with the parent.
    #[default]
    Eager,
    /// Fetched on first access if not already cached.
    Lazy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipDef {
    pub name: String,
    pub kind: RelationshipKind,
    pub related: ModelName,
    pub inverse: Option<String>,
    pub loading: Loading,
}

impl RelationshipDef {
    pub fn belongs_to(name: impl Into<String>, related: impl Into<ModelName>) -> Self {
        Self {
            name: name.into(),
            kind: RelationshipKind::BelongsTo,
            related: related.into(),
            inverse: None,
            loading: Loading::Eager,
        }
    }

    pub fn has_many(name: impl Into<String>, related: impl Into<ModelName>) -> Self {
        Self {
            name: name.into(),
            kind: RelationshipKind::HasMany,
            related: related.into(),
            inverse: None,
            loading: Loading::Eager,
        }
    }

    pub fn inverse(mut self, inverse: impl Into<String>) -> Self {
        self.inverse = Some(inverse.into());
        self
    }

    pub fn lazy(mut self) -> Self {
        self.loading = Loading::Lazy;
        self
    }

    pub fn is_lazy(&self) -> bool {
        self.loading == Loading::Lazy
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelDef {
    pub name: ModelName,
    relationships: Vec<RelationshipDef>,
}

impl ModelDef {
    pub fn new(name: impl Into<ModelName>) -> Self {
        Self {
            name: name.into(),
            relationships: Vec::new(),
        }
    }

    pub fn relationship(mut self, def: RelationshipDef) -> Self {
        self.relationships.push(def);
        self
    }

    pub fn relationships(&self) -> &[RelationshipDef] {
        &self.relationships
    }

    pub fn find_relationship(&self, name: &str) -> Option<&RelationshipDef> {
        self.relationships.iter().find(|r| r.name == name)
    }
}

/// Model registry. Models that are not registered simply have no relationships.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    models: HashMap<ModelName, ModelDef>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, def: ModelDef) -> Self {
        self.models.insert(def.name.clone(), def);
        self
    }

    pub fn model(&self, name: &ModelName) -> Option<&ModelDef> {
        self.models.get(name)
    }

    pub fn relationships_of(&self, name: &ModelName) -> &[RelationshipDef] {
        self.models
            .get(name)
            .map(|m| m.relationships())
            .unwrap_or(&[])
    }

    pub fn relationship(&self, model: &ModelName, name: &str) -> Result<&RelationshipDef, SchemaError> {
        self.models
            .get(model)
            .and_then(|m| m.find_relationship(name))
            .ok_or_else(|| SchemaError::UnknownRelationship {
                model: model.to_string(),
                name: name.to_string(),
            })
    }

    /// The declared inverse of `model.name`, if any.
    pub fn inverse_of(&self, model: &ModelName, name: &str) -> Option<&RelationshipDef> {
        let def = self.relationship(model, name).ok()?;
        let inverse = def.inverse.as_deref()?;
        self.relationship(&def.related, inverse).ok()
    }
}
