//! Attribute and relationship key conventions on the wire.

use serde_json::{Map, Value};

/// How record keys are spelled in JSON:API payloads.
///
/// Records always use the keys the application uses (`firstName`). With
/// [`KeyStyle::Dasherized`] the adapter sends `first-name` and maps
/// `first-name` in responses and error pointers back to `firstName`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum KeyStyle {
    #[default]
    Verbatim,
    Dasherized,
}

impl KeyStyle {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "verbatim" => Some(KeyStyle::Verbatim),
            "dasherized" => Some(KeyStyle::Dasherized),
            _ => None,
        }
    }

    /// The wire spelling of a record key.
    pub fn to_wire(self, key: &str) -> String {
        match self {
            KeyStyle::Verbatim => key.to_string(),
            KeyStyle::Dasherized => dasherize(key),
        }
    }

    /// The record key for a wire spelling.
    pub fn from_wire(self, key: &str) -> String {
        match self {
            KeyStyle::Verbatim => key.to_string(),
            KeyStyle::Dasherized => camelize(key),
        }
    }

    /// Rewrite the keys of every resource in a response document.
    pub fn inbound(self, document: &mut Value) {
        if self != KeyStyle::Verbatim {
            rename_document(document, |k| self.from_wire(k));
        }
    }

    /// Rewrite the keys of every resource in a request document.
    pub fn outbound(self, document: &mut Value) {
        if self != KeyStyle::Verbatim {
            rename_document(document, |k| self.to_wire(k));
        }
    }
}

fn rename_document(document: &mut Value, rename: impl Fn(&str) -> String + Copy) {
    let Value::Object(document) = document else {
        return;
    };
    for member in ["data", "included"] {
        match document.get_mut(member) {
            Some(Value::Array(resources)) => {
                for resource in resources {
                    rename_resource(resource, rename);
                }
            }
            Some(resource) if resource.is_object() => rename_resource(resource, rename),
            _ => {}
        }
    }
}

fn rename_resource(resource: &mut Value, rename: impl Fn(&str) -> String) {
    let Value::Object(resource) = resource else {
        return;
    };
    for member in ["attributes", "relationships"] {
        if let Some(Value::Object(fields)) = resource.get_mut(member) {
            let renamed: Map<String, Value> = std::mem::take(fields)
                .into_iter()
                .map(|(k, v)| (rename(&k), v))
                .collect();
            *fields = renamed;
        }
    }
}

/// `firstName` becomes `first-name`, `first_name` becomes `first-name`.
fn dasherize(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for (i, c) in key.chars().enumerate() {
        if c == '_' {
            out.push('-');
        } else if c.is_ascii_uppercase() {
            if i > 0 && !out.ends_with('-') {
                out.push('-');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// `first-name` becomes `firstName`.
fn camelize(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut upper = false;
    for c in key.chars() {
        if c == '-' || c == '_' {
            upper = !out.is_empty();
        } else if upper {
            out.push(c.to_ascii_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}
