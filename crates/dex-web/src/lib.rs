//! Read-only JSON query API over the persisted document collections.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use dex_core::{value_at_path, Category, PersistedDocument};
use dex_storage::{DocumentStore, FieldCondition, FieldFilter, StoreError};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "dex-web";

const DEFAULT_PORT: u16 = 8000;

// Collections holding cross-locale data are left out of `/new`.
const CROSS_LOCALE_PREFIX: &str = "cn";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn DocumentStore>,
}

impl AppState {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoints: Option<Vec<String>>,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Invalid endpoint")]
    UnknownEndpoint(Vec<String>),
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("An unexpected error occurred.")]
    Store(#[from] StoreError),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::UnknownEndpoint(_) => StatusCode::NOT_FOUND,
            ApiError::InvalidQuery(_) => StatusCode::BAD_REQUEST,
            ApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Store(err) = &self {
            error!(%err, "document store query failed");
        }
        let code = self.status_code();
        let body = ErrorBody {
            msg: self.to_string(),
            endpoints: match self {
                ApiError::UnknownEndpoint(endpoints) => Some(endpoints),
                _ => None,
            },
        };
        (code, Json(body)).into_response()
    }
}

/// Query parameters shared by every listing route; anything else is a field filter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListParams {
    pub limit: Option<usize>,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub filters: Vec<(String, String)>,
}

impl ListParams {
    pub fn from_pairs(pairs: Vec<(String, String)>) -> Self {
        let mut params = Self::default();
        for (key, value) in pairs {
            match key.as_str() {
                // Zero or garbage means no limit.
                "limit" => params.limit = value.parse().ok().filter(|n: &usize| *n > 0),
                "include" => params.include.push(value),
                "exclude" => params.exclude.push(value),
                _ => params.filters.push((key, value)),
            }
        }
        params
    }

    /// `field=v` is textual equality; `field>=n` and `field<=n` arrive as keys
    /// ending in `>` / `<` once the query string is split on `=`.
    pub fn field_filters(&self) -> Result<Vec<FieldFilter>, ApiError> {
        self.filters
            .iter()
            .map(|(key, value)| {
                let (path, condition) = if let Some(path) = key.strip_suffix('>') {
                    (path, FieldCondition::Gte(parse_bound(key, value)?))
                } else if let Some(path) = key.strip_suffix('<') {
                    (path, FieldCondition::Lte(parse_bound(key, value)?))
                } else {
                    (key.as_str(), FieldCondition::Eq(value.clone()))
                };
                Ok(FieldFilter {
                    path: path.to_string(),
                    condition,
                })
            })
            .collect()
    }

    pub fn render(&self, documents: Vec<PersistedDocument>) -> Value {
        let limit = self.limit.unwrap_or(usize::MAX);
        Value::Array(
            documents
                .into_iter()
                .take(limit)
                .map(|doc| self.project(doc))
                .collect(),
        )
    }

    /// `include` wins over `exclude` when both are given.
    pub fn project(&self, doc: PersistedDocument) -> Value {
        let value = if !self.include.is_empty() {
            let mut kept = Value::Object(Map::new());
            for path in &self.include {
                if let Some(field) = value_at_path(&doc.value, path) {
                    insert_at_path(&mut kept, path, field.clone());
                }
            }
            kept
        } else {
            let mut value = doc.value;
            for path in &self.exclude {
                remove_at_path(&mut value, path);
            }
            value
        };
        json!({
            "canon": doc.canon,
            "keys": doc.keys,
            "value": value,
            "meta": doc.meta,
        })
    }
}

fn parse_bound(key: &str, value: &str) -> Result<f64, ApiError> {
    value
        .trim()
        .parse()
        .map_err(|_| ApiError::InvalidQuery(format!("{key}={value} is not a number")))
}

fn insert_at_path(target: &mut Value, path: &str, field: Value) {
    let mut segments = path.split('.').peekable();
    let mut current = target;
    while let Some(segment) = segments.next() {
        let Value::Object(map) = current else {
            return;
        };
        if segments.peek().is_none() {
            map.insert(segment.to_string(), field);
            return;
        }
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

fn remove_at_path(target: &mut Value, path: &str) {
    let (parent, last) = match path.rsplit_once('.') {
        Some((parent, last)) => (target.pointer_mut(&json_pointer(parent)), last),
        None => (Some(target), path),
    };
    match parent {
        Some(Value::Object(map)) => {
            map.remove(last);
        }
        Some(Value::Array(items)) => {
            if let Some(index) = last.parse::<usize>().ok().filter(|i| *i < items.len()) {
                items.remove(index);
            }
        }
        _ => {}
    }
}

fn json_pointer(dot_path: &str) -> String {
    dot_path
        .split('.')
        .map(|s| format!("/{}", s.replace('~', "~0").replace('/', "~1")))
        .collect()
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(collections_handler))
        .route("/new", get(new_handler))
        .route("/{category}", get(list_handler))
        .route("/{category}/search", get(search_handler))
        .route("/{category}/match/{fragment}", get(match_handler))
        .route("/{category}/{key}", get(single_handler))
        .fallback(fallback_handler)
        .with_state(Arc::new(state))
}

pub fn addr_from_env() -> SocketAddr {
    let port: u16 = std::env::var("DEXSYNC_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_PORT);
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "query api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn endpoints(state: &AppState) -> Result<Vec<String>, ApiError> {
    let mut names = state
        .store
        .collections()
        .await?
        .into_iter()
        .map(|c| c.as_str().to_string())
        .collect::<Vec<_>>();
    names.push("new".to_string());
    names.sort();
    Ok(names)
}

async fn known_category(state: &AppState, name: String) -> Result<Category, ApiError> {
    let category = Category::new(name);
    if state.store.collections().await?.contains(&category) {
        Ok(category)
    } else {
        Err(ApiError::UnknownEndpoint(endpoints(state).await?))
    }
}

async fn collections_handler(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let names = state
        .store
        .collections()
        .await?
        .into_iter()
        .map(|c| Value::String(c.as_str().to_string()))
        .collect();
    Ok(Json(Value::Array(names)))
}

async fn list_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(category): AxumPath<String>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Result<Json<Value>, ApiError> {
    let category = known_category(&state, category).await?;
    let params = ListParams::from_pairs(pairs);
    let docs = state.store.fetch_all(&category).await?;
    Ok(Json(params.render(docs)))
}

async fn single_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((category, key)): AxumPath<(String, String)>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Result<Json<Value>, ApiError> {
    let category = known_category(&state, category).await?;
    let params = ListParams::from_pairs(pairs);
    let doc = state.store.find_by_key(&category, &key).await?;
    Ok(Json(doc.map_or_else(|| json!({}), |doc| params.project(doc))))
}

async fn match_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((category, fragment)): AxumPath<(String, String)>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Result<Json<Value>, ApiError> {
    let category = known_category(&state, category).await?;
    let params = ListParams::from_pairs(pairs);
    let docs = state.store.find_matching(&category, &fragment).await?;
    Ok(Json(params.render(docs)))
}

async fn search_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(category): AxumPath<String>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Result<Json<Value>, ApiError> {
    let category = known_category(&state, category).await?;
    let params = ListParams::from_pairs(pairs);
    let filters = params.field_filters()?;
    let docs = state.store.search(&category, &filters).await?;
    Ok(Json(params.render(docs)))
}

/// Documents first seen at the latest recorded run, grouped by collection.
/// Here `include`/`exclude` name collections rather than fields.
async fn new_handler(
    State(state): State<Arc<AppState>>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Result<Json<Value>, ApiError> {
    let params = ListParams::from_pairs(pairs);
    let Some(run) = state.store.latest_run().await? else {
        return Ok(Json(json!({})));
    };
    let plain = ListParams::default();
    let mut out = Map::new();
    for category in state.store.collections().await? {
        let name = category.as_str();
        if name.starts_with(CROSS_LOCALE_PREFIX)
            || (!params.include.is_empty() && !params.include.iter().any(|c| c == name))
            || params.exclude.iter().any(|c| c == name)
        {
            continue;
        }
        let docs = state.store.find_created_in(&category, &run.revision).await?;
        out.insert(name.to_string(), plain.render(docs));
    }
    Ok(Json(Value::Object(out)))
}

async fn fallback_handler(State(state): State<Arc<AppState>>) -> Response {
    match endpoints(&state).await {
        Ok(endpoints) => ApiError::UnknownEndpoint(endpoints).into_response(),
        Err(err) => err.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use dex_core::{DocumentMeta, RunRecord};
    use dex_storage::MemoryDocumentStore;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn doc(canon: &str, keys: &[&str], value: Value, created: &str) -> PersistedDocument {
        PersistedDocument {
            canon: canon.to_string(),
            keys: keys.iter().map(|k| k.to_string()).collect(),
            value,
            meta: DocumentMeta {
                hash: format!("hash-{canon}"),
                created: created.to_string(),
                updated: created.to_string(),
                created_index: 1,
                updated_index: 1,
                date: 0,
            },
        }
    }

    async fn seeded_app() -> Router {
        let store = Arc::new(MemoryDocumentStore::new());
        store
            .replace_documents(
                &Category::from("operator"),
                &[
                    doc("char_001_rook", &["char_001_rook", "rook"], json!({"data": {"name": "Rook", "rarity": 5}, "skills": []}), "r1"),
                    doc("char_002_brook", &["char_002_brook", "brook"], json!({"data": {"name": "Brook", "rarity": "3"}, "skills": []}), "r2"),
                ],
            )
            .await
            .unwrap();
        store
            .replace_documents(
                &Category::from("cn"),
                &[doc("char_900_x", &["char_900_x"], json!({}), "r2")],
            )
            .await
            .unwrap();
        store
            .record_run(&RunRecord {
                epoch: 2,
                revision: "r2".into(),
                message: None,
                date: 0,
            })
            .await
            .unwrap();
        app(AppState::new(store))
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let resp = app
            .oneshot(axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn handler_smoke_collections_and_listing() {
        let app = seeded_app().await;
        let (status, body) = get_json(app.clone(), "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!(["cn", "operator"]));

        let (_, body) = get_json(app, "/operator?limit=1&include=data.name").await;
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["value"], json!({"data": {"name": "Rook"}}));
        assert_eq!(body[0]["meta"]["createdIndex"], json!(1));
    }

    #[tokio::test]
    async fn handler_smoke_single_key_is_case_insensitive() {
        let app = seeded_app().await;
        let (status, body) = get_json(app.clone(), "/operator/ROOK").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["canon"], json!("char_001_rook"));

        let (status, body) = get_json(app.clone(), "/operator/nobody").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({}));

        let (_, body) = get_json(app, "/operator/rook?exclude=skills").await;
        assert!(body["value"].get("skills").is_none());
        assert_eq!(body["value"]["data"]["rarity"], json!(5));
    }

    #[tokio::test]
    async fn handler_smoke_match_and_search() {
        let app = seeded_app().await;
        let (_, body) = get_json(app.clone(), "/operator/match/ROOK").await;
        assert_eq!(body.as_array().unwrap().len(), 2);

        let (_, body) = get_json(app.clone(), "/operator/search?data.rarity%3E=4").await;
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["canon"], json!("char_001_rook"));

        let (_, body) = get_json(app.clone(), "/operator/search?data.rarity=3").await;
        assert_eq!(body[0]["canon"], json!("char_002_brook"));

        let (status, _) = get_json(app, "/operator/search?data.rarity%3C=high").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn handler_smoke_new_uses_latest_run_revision() {
        let app = seeded_app().await;
        let (_, body) = get_json(app.clone(), "/new").await;
        assert_eq!(body.as_object().unwrap().len(), 1);
        assert_eq!(body["operator"][0]["canon"], json!("char_002_brook"));

        let (_, body) = get_json(app, "/new?exclude=operator").await;
        assert_eq!(body, json!({}));
    }

    #[tokio::test]
    async fn handler_smoke_unknown_collection_lists_endpoints() {
        let app = seeded_app().await;
        let (status, body) = get_json(app.clone(), "/ghost").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["endpoints"], json!(["cn", "new", "operator"]));

        let (status, _) = get_json(app, "/a/b/c/d").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn path_projection_helpers() {
        let mut value = json!({"a": {"b": 1, "c": [1, 2, 3]}});
        remove_at_path(&mut value, "a.c.1");
        remove_at_path(&mut value, "a.b");
        remove_at_path(&mut value, "missing.path");
        assert_eq!(value, json!({"a": {"c": [1, 3]}}));

        let mut out = Value::Object(Map::new());
        insert_at_path(&mut out, "x.y.z", json!(true));
        assert_eq!(out, json!({"x": {"y": {"z": true}}}));
    }
}
