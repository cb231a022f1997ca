use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use lager_core::{AdapterError, RecordState, Schema};
use lager_http::{HttpAdapter, HttpConfig, KeyStyle};
use lager_store::{attributes, FindOptions, Store, StoreError};

/// Requests the fake API received, as `METHOD path` plus any decoded body.
#[derive(Clone, Default)]
struct Api {
    seen: Arc<Mutex<Vec<String>>>,
    bodies: Arc<Mutex<Vec<Value>>>,
    queries: Arc<Mutex<Vec<HashMap<String, String>>>>,
}

impl Api {
    fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }

    fn last_body(&self) -> Value {
        self.bodies.lock().unwrap().last().cloned().unwrap_or(Value::Null)
    }
}

fn car(id: &str, make: &str, model: &str) -> Value {
    json!({
        "type": "car",
        "id": id,
        "attributes": { "make": make, "model": model }
    })
}

async fn show_car(State(api): State<Api>, Path(id): Path<String>) -> Response {
    api.seen.lock().unwrap().push(format!("GET /api/cars/{}", id));
    match id.as_str() {
        "1" => Json(json!({ "data": car("1", "BMC", "Mini") })).into_response(),
        "2" => Json(json!({ "data": car("2", "Jeep", "Wrangler") })).into_response(),
        "boom" => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn list_cars(
    State(api): State<Api>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    api.seen.lock().unwrap().push("GET /api/cars".to_string());
    api.queries.lock().unwrap().push(params.clone());
    let cars = vec![car("1", "BMC", "Mini"), car("2", "Jeep", "Wrangler")];
    let data: Vec<Value> = match params.get("filter[make]") {
        Some(make) => cars
            .into_iter()
            .filter(|c| c["attributes"]["make"] == json!(make))
            .collect(),
        None => cars,
    };
    Json(json!({ "data": data }))
}

async fn create_car(State(api): State<Api>, body: String) -> Response {
    api.seen.lock().unwrap().push("POST /api/cars".to_string());
    let document: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
    api.bodies.lock().unwrap().push(document.clone());

    let attrs = document["data"]["attributes"].clone();
    if attrs["make"] == json!("") {
        let errors = json!({
            "errors": [{
                "detail": "can't be blank",
                "source": { "pointer": "/data/attributes/make" }
            }]
        });
        return (StatusCode::UNPROCESSABLE_ENTITY, Json(errors)).into_response();
    }
    let data = json!({ "type": "car", "id": "42", "attributes": attrs });
    (StatusCode::CREATED, Json(json!({ "data": data }))).into_response()
}

async fn update_car(State(api): State<Api>, Path(id): Path<String>, body: String) -> Json<Value> {
    api.seen.lock().unwrap().push(format!("PATCH /api/cars/{}", id));
    let document: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
    api.bodies.lock().unwrap().push(document.clone());
    let attrs = document["data"]["attributes"].clone();
    Json(json!({ "data": { "type": "car", "id": id, "attributes": attrs } }))
}

async fn delete_car(State(api): State<Api>, Path(id): Path<String>) -> StatusCode {
    api.seen.lock().unwrap().push(format!("DELETE /api/cars/{}", id));
    StatusCode::NO_CONTENT
}

async fn show_person(State(api): State<Api>, Path(id): Path<String>) -> Json<Value> {
    api.seen.lock().unwrap().push(format!("GET /api/people/{}", id));
    Json(json!({
        "data": {
            "type": "person",
            "id": id,
            "attributes": { "name": "Tom Dale", "first-name": "Tom" }
        }
    }))
}

async fn create_person(State(api): State<Api>, body: String) -> Response {
    api.seen.lock().unwrap().push("POST /api/people".to_string());
    let document: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
    api.bodies.lock().unwrap().push(document.clone());

    let attrs = document["data"]["attributes"].clone();
    if attrs["first-name"] == json!("") {
        let errors = json!({
            "errors": [{
                "detail": "can't be blank",
                "source": { "pointer": "/data/attributes/first-name" }
            }]
        });
        return (StatusCode::UNPROCESSABLE_ENTITY, Json(errors)).into_response();
    }
    let data = json!({ "type": "person", "id": "7", "attributes": attrs });
    (StatusCode::CREATED, Json(json!({ "data": data }))).into_response()
}

async fn create_test_store() -> (Store<HttpAdapter>, Api) {
    create_test_store_with(KeyStyle::Verbatim).await
}

/// Start the fake API on an ephemeral port and return a store talking to it.
async fn create_test_store_with(key_style: KeyStyle) -> (Store<HttpAdapter>, Api) {
    let api = Api::default();
    let app = Router::new()
        .route("/api/cars", get(list_cars).post(create_car))
        .route(
            "/api/cars/{id}",
            get(show_car).patch(update_car).delete(delete_car),
        )
        .route("/api/people", post(create_person))
        .route("/api/people/{id}", get(show_person))
        .with_state(api.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let config = HttpConfig::new(format!("http://{}", addr))
        .with_namespace("api")
        .with_key_style(key_style);
    let adapter = HttpAdapter::new(&config)
        .unwrap()
        .with_path("person", "people");
    (Store::new(adapter, Schema::new()), api)
}

// ============================================================================
// Fetching
// ============================================================================

#[tokio::test]
async fn test_find_record_over_http() {
    let (store, api) = create_test_store().await;

    let record = store
        .find_record("car", "1", FindOptions::default())
        .await
        .unwrap();

    assert_eq!(record.state(), RecordState::Saved);
    assert_eq!(record.get("model"), Some(json!("Mini")));
    assert_eq!(api.seen(), vec!["GET /api/cars/1"]);
}

#[tokio::test]
async fn test_not_found_marks_record_as_error() {
    let (store, _api) = create_test_store().await;

    let err = store
        .find_record("car", "9", FindOptions::default())
        .await
        .unwrap_err();

    assert_eq!(
        err,
        StoreError::Transport(AdapterError::NotFound("car:9".to_string()))
    );
    assert!(store.record_for_id("car", "9").unwrap().is_error());
}

#[tokio::test]
async fn test_server_error_is_transport_failure() {
    let (store, _api) = create_test_store().await;

    let err = store
        .find_record("car", "boom", FindOptions::default())
        .await
        .unwrap_err();

    match err {
        StoreError::Transport(AdapterError::Transport(msg)) => assert!(msg.contains("500")),
        other => panic!("expected a transport failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_find_all_and_query() {
    let (store, api) = create_test_store().await;

    let all = store.find_all("car", FindOptions::default()).await.unwrap();
    assert_eq!(all.ids(), vec!["1", "2"]);

    let jeeps = store
        .query("car", json!({ "filter": { "make": "Jeep" } }), FindOptions::default())
        .await
        .unwrap();
    assert_eq!(jeeps.ids(), vec!["2"]);

    let queries = api.queries.lock().unwrap().clone();
    assert_eq!(queries.len(), 2);
    assert!(queries[0].is_empty());
    assert_eq!(queries[1].get("filter[make]"), Some(&"Jeep".to_string()));
}

#[tokio::test]
async fn test_custom_path() {
    let (store, api) = create_test_store().await;

    let person = store
        .find_record("person", "1", FindOptions::default())
        .await
        .unwrap();

    assert_eq!(person.get("name"), Some(json!("Tom Dale")));
    assert_eq!(api.seen(), vec!["GET /api/people/1"]);
}

// ============================================================================
// Saving
// ============================================================================

#[tokio::test]
async fn test_create_posts_document_and_adopts_server_id() {
    let (store, api) = create_test_store().await;

    let record = store
        .create("car", attributes([("make", "BMC"), ("model", "Cooper")]))
        .unwrap();
    record.save().await.unwrap();

    assert_eq!(record.id().map(|id| id.to_string()), Some("42".to_string()));
    assert_eq!(record.state(), RecordState::Saved);
    assert_eq!(api.seen(), vec!["POST /api/cars"]);

    let body = api.last_body();
    assert_eq!(body["data"]["type"], json!("car"));
    assert_eq!(body["data"]["attributes"]["model"], json!("Cooper"));
    assert!(body["data"].get("id").is_none());
}

#[tokio::test]
async fn test_unprocessable_entity_becomes_validation_errors() {
    let (store, _api) = create_test_store().await;

    let record = store
        .create("car", attributes([("make", ""), ("model", "Cooper")]))
        .unwrap();
    let err = record.save().await.unwrap_err();

    assert!(matches!(err, StoreError::Invalid(_)));
    assert!(err.is_recoverable());
    assert_eq!(record.state(), RecordState::CreatedInvalid);
    assert_eq!(record.errors_for("make"), vec!["can't be blank"]);
}

#[tokio::test]
async fn test_update_patches_member_url() {
    let (store, api) = create_test_store().await;

    let record = store
        .find_record("car", "1", FindOptions::default())
        .await
        .unwrap();
    record.set("model", "Cooper").unwrap();
    assert!(record.is_dirty());
    record.save().await.unwrap();

    assert_eq!(record.state(), RecordState::Saved);
    assert_eq!(record.get("model"), Some(json!("Cooper")));
    assert_eq!(api.seen(), vec!["GET /api/cars/1", "PATCH /api/cars/1"]);
    assert_eq!(api.last_body()["data"]["id"], json!("1"));
}

#[tokio::test]
async fn test_destroy_record_sends_delete() {
    let (store, api) = create_test_store().await;

    let record = store
        .find_record("car", "2", FindOptions::default())
        .await
        .unwrap();
    record.destroy_record().await.unwrap();

    assert_eq!(record.state(), RecordState::DeletedSaved);
    assert!(!store.has_record_for_id("car", "2").unwrap());
    assert_eq!(api.seen(), vec!["GET /api/cars/2", "DELETE /api/cars/2"]);
}

// ============================================================================
// Key style
// ============================================================================

#[tokio::test]
async fn test_dasherized_keys_are_read_as_record_keys() {
    let (store, _api) = create_test_store_with(KeyStyle::Dasherized).await;

    let person = store
        .find_record("person", "1", FindOptions::default())
        .await
        .unwrap();

    assert_eq!(person.get("firstName"), Some(json!("Tom")));
    assert_eq!(person.get("first-name"), None);
}

#[tokio::test]
async fn test_dasherized_validation_errors_clear_on_set_properties() {
    let (store, api) = create_test_store_with(KeyStyle::Dasherized).await;

    let person = store
        .create("person", attributes([("firstName", "")]))
        .unwrap();
    let err = person.save().await.unwrap_err();

    assert!(matches!(err, StoreError::Invalid(_)));
    assert_eq!(api.last_body()["data"]["attributes"], json!({ "first-name": "" }));
    assert_eq!(person.state(), RecordState::CreatedInvalid);
    assert_eq!(person.errors_for("firstName"), vec!["can't be blank"]);

    person
        .set_properties(attributes([("firstName", "Yehuda")]))
        .unwrap();
    assert_eq!(person.state(), RecordState::CreatedUncommitted);
    assert!(person.is_valid());

    person.save().await.unwrap();
    assert_eq!(person.id().map(|id| id.to_string()), Some("7".to_string()));
    assert_eq!(person.get("firstName"), Some(json!("Yehuda")));
}
