use std::collections::HashMap;

use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::Value;

use lager_core::{Adapter, AdapterError, ModelName, RecordId, Snapshot, ValidationMessage};

use crate::config::HttpConfig;
use crate::keys::KeyStyle;

/// JSON:API adapter over HTTP.
///
/// `car` records live under `{base}/cars` unless another path is registered
/// with [`HttpAdapter::with_path`].
pub struct HttpAdapter {
    client: reqwest::Client,
    base_url: String,
    paths: HashMap<ModelName, String>,
    key_style: KeyStyle,
}

impl HttpAdapter {
    pub fn new(config: &HttpConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url(),
            paths: HashMap::new(),
            key_style: config.key_style,
        })
    }

    pub fn with_path(mut self, model: impl Into<ModelName>, path: impl Into<String>) -> Self {
        self.paths
            .insert(model.into(), path.into().trim_matches('/').to_string());
        self
    }

    pub fn with_key_style(mut self, key_style: KeyStyle) -> Self {
        self.key_style = key_style;
        self
    }

    pub fn path_for(&self, model: &ModelName) -> String {
        self.paths
            .get(model)
            .cloned()
            .unwrap_or_else(|| format!("{}s", model))
    }

    fn collection_url(&self, model: &ModelName) -> String {
        format!("{}/{}", self.base_url, self.path_for(model))
    }

    fn member_url(&self, model: &ModelName, id: &RecordId) -> String {
        format!("{}/{}", self.collection_url(model), id)
    }

    fn member_url_of(&self, snapshot: &Snapshot) -> Result<String, AdapterError> {
        let id = snapshot.id.as_ref().ok_or_else(|| {
            AdapterError::transport(format!(
                "cannot address a {} record without an id",
                snapshot.model
            ))
        })?;
        Ok(self.member_url(&snapshot.model, id))
    }

    fn document_body(&self, snapshot: &Snapshot) -> Result<Value, AdapterError> {
        let mut body = serde_json::to_value(snapshot.to_document())
            .map_err(|e| AdapterError::transport(format!("failed to serialize record: {}", e)))?;
        self.key_style.outbound(&mut body);
        Ok(body)
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        query: &[(String, String)],
        body: Option<Value>,
        subject: &str,
    ) -> Result<Value, AdapterError> {
        tracing::debug!("{} {}", method, url);

        let mut request = self
            .client
            .request(method, url)
            .header(reqwest::header::ACCEPT, "application/vnd.api+json");
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request
                .header(reqwest::header::CONTENT_TYPE, "application/vnd.api+json")
                .body(body.to_string());
        }

        let response = request
            .send()
            .await
            .map_err(|e| AdapterError::transport(e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| AdapterError::transport(e.to_string()))?;

        if status.is_success() {
            if status == StatusCode::NO_CONTENT || text.trim().is_empty() {
                return Ok(Value::Null);
            }
            let mut document: Value = serde_json::from_str(&text)
                .map_err(|e| AdapterError::transport(format!("invalid JSON response: {}", e)))?;
            self.key_style.inbound(&mut document);
            return Ok(document);
        }

        match status {
            StatusCode::NOT_FOUND => Err(AdapterError::NotFound(subject.to_string())),
            StatusCode::UNPROCESSABLE_ENTITY => Err(AdapterError::Invalid(
                validation_errors(&text, self.key_style),
            )),
            _ => Err(AdapterError::transport(format!("HTTP error: {}", status))),
        }
    }
}

impl Adapter for HttpAdapter {
    async fn find_record(&self, model: &ModelName, id: &RecordId) -> Result<Value, AdapterError> {
        let url = self.member_url(model, id);
        self.send(Method::GET, &url, &[], None, &format!("{}:{}", model, id))
            .await
    }

    async fn find_all(&self, model: &ModelName) -> Result<Value, AdapterError> {
        let url = self.collection_url(model);
        self.send(Method::GET, &url, &[], None, model.as_str()).await
    }

    async fn query(&self, model: &ModelName, query: &Value) -> Result<Value, AdapterError> {
        let url = self.collection_url(model);
        self.send(Method::GET, &url, &query_pairs(query), None, model.as_str())
            .await
    }

    async fn query_record(&self, model: &ModelName, query: &Value) -> Result<Value, AdapterError> {
        let url = self.collection_url(model);
        self.send(Method::GET, &url, &query_pairs(query), None, model.as_str())
            .await
    }

    async fn create_record(&self, snapshot: &Snapshot) -> Result<Value, AdapterError> {
        let url = self.collection_url(&snapshot.model);
        let body = self.document_body(snapshot)?;
        self.send(Method::POST, &url, &[], Some(body), snapshot.model.as_str())
            .await
    }

    async fn update_record(&self, snapshot: &Snapshot) -> Result<Value, AdapterError> {
        let url = self.member_url_of(snapshot)?;
        let body = self.document_body(snapshot)?;
        self.send(Method::PATCH, &url, &[], Some(body), &describe(snapshot))
            .await
    }

    async fn delete_record(&self, snapshot: &Snapshot) -> Result<Value, AdapterError> {
        let url = self.member_url_of(snapshot)?;
        self.send(Method::DELETE, &url, &[], None, &describe(snapshot))
            .await
    }
}

fn describe(snapshot: &Snapshot) -> String {
    match &snapshot.id {
        Some(id) => format!("{}:{}", snapshot.model, id),
        None => snapshot.model.to_string(),
    }
}


/// Flatten a query descriptor into `key[nested]=value` pairs.
///
/// `{"filter": {"make": "BMC"}, "page": 2}` becomes
/// `filter[make]=BMC` and `page=2`; arrays repeat their key with `[]`.
pub fn query_pairs(query: &Value) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    if let Value::Object(map) = query {
        for (key, value) in map {
            flatten(key.clone(), value, &mut pairs);
        }
    }
    pairs
}

fn flatten(prefix: String, value: &Value, pairs: &mut Vec<(String, String)>) {
    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                flatten(format!("{}[{}]", prefix, key), nested, pairs);
            }
        }
        Value::Array(items) => {
            for item in items {
                flatten(format!("{}[]", prefix), item, pairs);
            }
        }
        Value::String(s) => pairs.push((prefix, s.clone())),
        Value::Null => pairs.push((prefix, String::new())),
        other => pairs.push((prefix, other.to_string())),
    }
}

#[derive(Debug, Deserialize)]
struct ErrorDocument {
    #[serde(default)]
    errors: Vec<ErrorObject>,
}

#[derive(Debug, Deserialize)]
struct ErrorObject {
    detail: Option<String>,
    title: Option<String>,
    source: Option<ErrorSource>,
}

#[derive(Debug, Deserialize)]
struct ErrorSource {
    pointer: Option<String>,
}

/// Parse a JSON:API `errors` array into validation messages.
fn validation_errors(body: &str, key_style: KeyStyle) -> Vec<ValidationMessage> {
    let document: ErrorDocument = match serde_json::from_str(body) {
        Ok(doc) => doc,
        Err(e) => {
            tracing::warn!("Unreadable 422 response body: {:?}", e);
            return Vec::new();
        }
    };

    document
        .errors
        .into_iter()
        .map(|error| {
            let message = error
                .detail
                .or(error.title)
                .unwrap_or_else(|| "is invalid".to_string());
            let pointer = error
                .source
                .and_then(|s| s.pointer)
                .unwrap_or_default();
            let mut message = ValidationMessage::from_pointer(&pointer, message);
            message.attribute = key_style.from_wire(&message.attribute);
            message
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_and_custom_paths() {
        let adapter = HttpAdapter::new(&HttpConfig::new("http://localhost:4200").with_namespace("api"))
            .unwrap()
            .with_path("person", "/people/");
        assert_eq!(adapter.path_for(&"car".into()), "cars");
        assert_eq!(adapter.path_for(&"person".into()), "people");
        assert_eq!(
            adapter.member_url(&"car".into(), &RecordId::parse("7").unwrap()),
            "http://localhost:4200/api/cars/7"
        );
    }

    #[test]
    fn test_query_pairs_flatten_nested_descriptors() {
        let pairs = query_pairs(&json!({
            "filter": {"make": "BMC", "year": 1959},
            "include": ["owner", "wheels"],
            "page": 2
        }));
        assert!(pairs.contains(&("filter[make]".to_string(), "BMC".to_string())));
        assert!(pairs.contains(&("filter[year]".to_string(), "1959".to_string())));
        assert!(pairs.contains(&("include[]".to_string(), "owner".to_string())));
        assert!(pairs.contains(&("include[]".to_string(), "wheels".to_string())));
        assert!(pairs.contains(&("page".to_string(), "2".to_string())));
        assert_eq!(pairs.len(), 5);
    }

    #[test]
    fn test_query_pairs_ignore_non_objects() {
        assert!(query_pairs(&json!(["make"])).is_empty());
        assert!(query_pairs(&Value::Null).is_empty());
    }

    #[test]
    fn test_validation_errors_from_pointers() {
        let body = json!({
            "errors": [
                {"detail": "can't be blank", "source": {"pointer": "/data/attributes/make"}},
                {"title": "is taken", "source": {"pointer": "/data"}},
                {}
            ]
        })
        .to_string();
        let messages = validation_errors(&body, KeyStyle::Verbatim);
        assert_eq!(
            messages,
            vec![
                ValidationMessage::new("make", "can't be blank"),
                ValidationMessage::new("base", "is taken"),
                ValidationMessage::new("base", "is invalid"),
            ]
        );
        assert!(validation_errors("not json", KeyStyle::Verbatim).is_empty());
    }

    #[test]
    fn test_validation_errors_use_record_keys() {
        let body = json!({
            "errors": [
                {"detail": "is invalid", "source": {"pointer": "/data/attributes/first-name"}}
            ]
        })
        .to_string();
        assert_eq!(
            validation_errors(&body, KeyStyle::Dasherized),
            vec![ValidationMessage::new("firstName", "is invalid")]
        );
        assert_eq!(
            validation_errors(&body, KeyStyle::Verbatim),
            vec![ValidationMessage::new("first-name", "is invalid")]
        );
    }
}
