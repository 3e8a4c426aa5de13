//! Remote document database access: the `reports`, `users` and `departments` collections.
//!
//! Implementations stamp `createdAt`/`updatedAt` themselves (server time) as
//! RFC 3339 strings: `create` and `set` write both, `update` writes `updatedAt`.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

use crate::{classify_reqwest_error, classify_status, BackoffPolicy, RetryDisposition};

pub type Fields = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Collection {
    Reports,
    Users,
    Departments,
}

impl Collection {
    pub fn name(self) -> &'static str {
        match self {
            Collection::Reports => "reports",
            Collection::Users => "users",
            Collection::Departments => "departments",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    #[serde(default)]
    pub fields: Fields,
}

impl Document {
    /// Deserialize the document body, exposing the document id as field `id`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, RemoteError> {
        let mut fields = self.fields.clone();
        fields
            .entry("id".to_string())
            .or_insert_with(|| Value::String(self.id.clone()));
        serde_json::from_value(Value::Object(fields)).map_err(|err| RemoteError::InvalidDocument {
            id: self.id.clone(),
            reason: err.to_string(),
        })
    }
}

/// Equality filter on a top-level field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldFilter {
    pub field: String,
    pub value: Value,
}

impl FieldFilter {
    pub fn equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }

    fn matches(&self, fields: &Fields) -> bool {
        fields.get(&self.field) == Some(&self.value)
    }

    fn query_value(&self) -> String {
        match &self.value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote store unavailable: {0}")]
    Unavailable(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("document not found: {collection}/{id}")]
    NotFound { collection: Collection, id: String },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid document {id}: {reason}")]
    InvalidDocument { id: String, reason: String },
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
}

impl RemoteError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            RemoteError::Unavailable(_) => RetryDisposition::Retryable,
            RemoteError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            RemoteError::Request(err) => classify_reqwest_error(err),
            RemoteError::PermissionDenied(_)
            | RemoteError::NotFound { .. }
            | RemoteError::InvalidDocument { .. } => RetryDisposition::NonRetryable,
        }
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert a document under a store-assigned id and return that id.
    async fn create(&self, collection: Collection, fields: Fields) -> Result<String, RemoteError>;

    /// Create or replace the document with a caller-chosen id.
    async fn set(&self, collection: Collection, id: &str, fields: Fields) -> Result<(), RemoteError>;

    async fn get(&self, collection: Collection, id: &str) -> Result<Option<Document>, RemoteError>;

    /// Merge `patch` into an existing document; missing documents are `NotFound`.
    async fn update(&self, collection: Collection, id: &str, patch: Fields) -> Result<(), RemoteError>;

    async fn delete(&self, collection: Collection, id: &str) -> Result<(), RemoteError>;

    async fn query(
        &self,
        collection: Collection,
        filters: &[FieldFilter],
    ) -> Result<Vec<Document>, RemoteError>;
}

fn server_timestamp() -> Value {
    Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// In-process document store used by tests and offline demos.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    collections: Mutex<HashMap<Collection, BTreeMap<String, Fields>>>,
    offline: AtomicBool,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every call fails with [`RemoteError::Unavailable`].
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub async fn count(&self, collection: Collection) -> usize {
        self.collections
            .lock()
            .await
            .get(&collection)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }

    fn ensure_online(&self) -> Result<(), RemoteError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::Unavailable("memory store is offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn create(&self, collection: Collection, mut fields: Fields) -> Result<String, RemoteError> {
        self.ensure_online()?;
        let id = Uuid::new_v4().simple().to_string();
        let now = server_timestamp();
        fields.insert("createdAt".to_string(), now.clone());
        fields.insert("updatedAt".to_string(), now);
        self.collections
            .lock()
            .await
            .entry(collection)
            .or_default()
            .insert(id.clone(), fields);
        Ok(id)
    }

    async fn set(&self, collection: Collection, id: &str, mut fields: Fields) -> Result<(), RemoteError> {
        self.ensure_online()?;
        let now = server_timestamp();
        fields.insert("createdAt".to_string(), now.clone());
        fields.insert("updatedAt".to_string(), now);
        self.collections
            .lock()
            .await
            .entry(collection)
            .or_default()
            .insert(id.to_string(), fields);
        Ok(())
    }

    async fn get(&self, collection: Collection, id: &str) -> Result<Option<Document>, RemoteError> {
        self.ensure_online()?;
        let collections = self.collections.lock().await;
        Ok(collections
            .get(&collection)
            .and_then(|docs| docs.get(id))
            .map(|fields| Document {
                id: id.to_string(),
                fields: fields.clone(),
            }))
    }

    async fn update(&self, collection: Collection, id: &str, patch: Fields) -> Result<(), RemoteError> {
        self.ensure_online()?;
        let mut collections = self.collections.lock().await;
        let doc = collections
            .get_mut(&collection)
            .and_then(|docs| docs.get_mut(id))
            .ok_or_else(|| RemoteError::NotFound {
                collection,
                id: id.to_string(),
            })?;
        doc.extend(patch);
        doc.insert("updatedAt".to_string(), server_timestamp());
        Ok(())
    }

    async fn delete(&self, collection: Collection, id: &str) -> Result<(), RemoteError> {
        self.ensure_online()?;
        if let Some(docs) = self.collections.lock().await.get_mut(&collection) {
            docs.remove(id);
        }
        Ok(())
    }

    async fn query(
        &self,
        collection: Collection,
        filters: &[FieldFilter],
    ) -> Result<Vec<Document>, RemoteError> {
        self.ensure_online()?;
        let collections = self.collections.lock().await;
        Ok(collections
            .get(&collection)
            .map(|docs| {
                docs.iter()
                    .filter(|(_, fields)| filters.iter().all(|f| f.matches(fields)))
                    .map(|(id, fields)| Document {
                        id: id.clone(),
                        fields: fields.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[derive(Debug, Clone)]
pub struct HttpStoreConfig {
    pub base_url: String,
    pub bearer_token: Option<String>,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl HttpStoreConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            bearer_token: None,
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreatedResponse {
    id: String,
}

/// REST document store client.
///
/// Routes: `POST /{collection}` (returns `{"id"}`), `PUT|GET|PATCH|DELETE
/// /{collection}/{id}`, and `GET /{collection}?field=value` for equality
/// queries. Documents travel as `{"id", "fields"}`.
#[derive(Debug)]
pub struct HttpDocumentStore {
    client: reqwest::Client,
    base_url: String,
    bearer_token: Option<String>,
    backoff: BackoffPolicy,
}

impl HttpDocumentStore {
    pub fn new(config: HttpStoreConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            bearer_token: config.bearer_token,
            backoff: config.backoff,
        })
    }

    fn collection_url(&self, collection: Collection) -> String {
        format!("{}/{}", self.base_url, collection.name())
    }

    fn document_url(&self, collection: Collection, id: &str) -> String {
        format!("{}/{}/{}", self.base_url, collection.name(), id)
    }

    /// Send with retries on transient failures. `404` is handed back to the
    /// caller because its meaning depends on the operation.
    async fn send<F>(&self, build: F) -> Result<reqwest::Response, RemoteError>
    where
        F: Fn() -> reqwest::RequestBuilder + Send + Sync,
    {
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let mut request = build();
            if let Some(token) = &self.bearer_token {
                request = request.bearer_auth(token);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() || status == StatusCode::NOT_FOUND {
                        return Ok(resp);
                    }

                    let url = resp.url().to_string();
                    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                        return Err(RemoteError::PermissionDenied(url));
                    }

                    if classify_status(status).is_retryable() && attempt < self.backoff.max_retries
                    {
                        debug!(attempt, status = status.as_u16(), "retrying remote call");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(RemoteError::HttpStatus {
                        status: status.as_u16(),
                        url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err).is_retryable()
                        && attempt < self.backoff.max_retries
                    {
                        debug!(attempt, error = %err, "retrying remote call");
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(RemoteError::Request(err));
                }
            }
        }

        Err(match last_request_error {
            Some(err) => RemoteError::Request(err),
            None => RemoteError::Unavailable("retry budget exhausted".to_string()),
        })
    }
}

fn not_found(collection: Collection, id: &str) -> RemoteError {
    RemoteError::NotFound {
        collection,
        id: id.to_string(),
    }
}

#[async_trait]
impl DocumentStore for HttpDocumentStore {
    async fn create(&self, collection: Collection, fields: Fields) -> Result<String, RemoteError> {
        let url = self.collection_url(collection);
        let span = info_span!("remote_create", %collection);
        async {
            let resp = self.send(|| self.client.post(&url).json(&fields)).await?;
            if resp.status() == StatusCode::NOT_FOUND {
                return Err(RemoteError::HttpStatus {
                    status: 404,
                    url: url.clone(),
                });
            }
            let created: CreatedResponse = resp.json().await?;
            Ok(created.id)
        }
        .instrument(span)
        .await
    }

    async fn set(&self, collection: Collection, id: &str, fields: Fields) -> Result<(), RemoteError> {
        let url = self.document_url(collection, id);
        let span = info_span!("remote_set", %collection, id);
        async {
            let resp = self.send(|| self.client.put(&url).json(&fields)).await?;
            if resp.status() == StatusCode::NOT_FOUND {
                return Err(not_found(collection, id));
            }
            Ok(())
        }
        .instrument(span)
        .await
    }

    async fn get(&self, collection: Collection, id: &str) -> Result<Option<Document>, RemoteError> {
        let url = self.document_url(collection, id);
        let span = info_span!("remote_get", %collection, id);
        async {
            let resp = self.send(|| self.client.get(&url)).await?;
            if resp.status() == StatusCode::NOT_FOUND {
                return Ok(None);
            }
            Ok(Some(resp.json::<Document>().await?))
        }
        .instrument(span)
        .await
    }

    async fn update(&self, collection: Collection, id: &str, patch: Fields) -> Result<(), RemoteError> {
        let url = self.document_url(collection, id);
        let span = info_span!("remote_update", %collection, id);
        async {
            let resp = self.send(|| self.client.patch(&url).json(&patch)).await?;
            if resp.status() == StatusCode::NOT_FOUND {
                return Err(not_found(collection, id));
            }
            Ok(())
        }
        .instrument(span)
        .await
    }

    async fn delete(&self, collection: Collection, id: &str) -> Result<(), RemoteError> {
        let url = self.document_url(collection, id);
        let span = info_span!("remote_delete", %collection, id);
        async {
            self.send(|| self.client.delete(&url)).await?;
            Ok(())
        }
        .instrument(span)
        .await
    }

    async fn query(
        &self,
        collection: Collection,
        filters: &[FieldFilter],
    ) -> Result<Vec<Document>, RemoteError> {
        let url = self.collection_url(collection);
        let params: Vec<(String, String)> = filters
            .iter()
            .map(|f| (f.field.clone(), f.query_value()))
            .collect();
        let span = info_span!("remote_query", %collection, filters = params.len());
        async {
            let resp = self.send(|| self.client.get(&url).query(&params)).await?;
            if resp.status() == StatusCode::NOT_FOUND {
                return Ok(Vec::new());
            }
            Ok(resp.json::<Vec<Document>>().await?)
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn fields(value: Value) -> Fields {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[tokio::test]
    async fn memory_store_stamps_server_timestamps() {
        let store = MemoryDocumentStore::new();
        let id = store
            .create(Collection::Reports, fields(json!({"userId": "u1"})))
            .await
            .expect("create");
        let doc = store
            .get(Collection::Reports, &id)
            .await
            .expect("get")
            .expect("present");
        assert!(doc.fields.contains_key("createdAt"));
        assert!(doc.fields.contains_key("updatedAt"));
    }

    #[tokio::test]
    async fn memory_store_filters_by_equality() {
        let store = MemoryDocumentStore::new();
        for user in ["u1", "u2", "u1"] {
            store
                .create(Collection::Reports, fields(json!({"userId": user})))
                .await
                .expect("create");
        }
        let mine = store
            .query(Collection::Reports, &[FieldFilter::equals("userId", "u1")])
            .await
            .expect("query");
        assert_eq!(mine.len(), 2);
        let all = store.query(Collection::Reports, &[]).await.expect("query");
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn updating_missing_document_is_not_found() {
        let store = MemoryDocumentStore::new();
        let err = store
            .update(Collection::Users, "nobody", Fields::new())
            .await
            .expect_err("missing");
        assert!(matches!(err, RemoteError::NotFound { .. }));
        assert_eq!(err.disposition(), RetryDisposition::NonRetryable);
    }

    #[tokio::test]
    async fn offline_store_fails_with_retryable_error() {
        let store = MemoryDocumentStore::new();
        store.set_offline(true);
        let err = store
            .get(Collection::Departments, "d1")
            .await
            .expect_err("offline");
        assert_eq!(err.disposition(), RetryDisposition::Retryable);
        store.set_offline(false);
        assert!(store.get(Collection::Departments, "d1").await.expect("online").is_none());
    }

    #[test]
    fn document_decode_exposes_id() {
        #[derive(Deserialize)]
        struct Named {
            id: String,
            name: String,
        }
        let doc = Document {
            id: "d1".into(),
            fields: fields(json!({"name": "Water"})),
        };
        let named: Named = doc.decode().expect("decode");
        assert_eq!(named.id, "d1");
        assert_eq!(named.name, "Water");
    }

    #[test]
    fn http_status_errors_classify_like_statuses() {
        let transient = RemoteError::HttpStatus {
            status: 503,
            url: "http://x".into(),
        };
        let permanent = RemoteError::HttpStatus {
            status: 422,
            url: "http://x".into(),
        };
        assert_eq!(transient.disposition(), RetryDisposition::Retryable);
        assert_eq!(permanent.disposition(), RetryDisposition::NonRetryable);
    }

    #[test]
    fn http_store_trims_trailing_slash() {
        let store = HttpDocumentStore::new(HttpStoreConfig::new("https://docs.example/api/"))
            .expect("client");
        assert_eq!(
            store.document_url(Collection::Reports, "r1"),
            "https://docs.example/api/reports/r1"
        );
    }

    /// Serve one scripted `(status, body)` per connection, repeating the last
    /// entry once the script runs out. Returns the base url and a hit counter.
    async fn scripted_server(script: Vec<(u16, &'static str)>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let served = counter.fetch_add(1, Ordering::SeqCst);
                let (status, body) = script[served.min(script.len() - 1)];

                let mut request = Vec::new();
                let mut buf = [0u8; 2048];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(read) => {
                            request.extend_from_slice(&buf[..read]);
                            if request.windows(4).any(|w| w == b"\r\n\r\n") {
                                break;
                            }
                        }
                    }
                }

                let response = format!(
                    "HTTP/1.1 {status} Scripted\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        (format!("http://{addr}"), hits)
    }

    fn http_store(base_url: String, backoff: BackoffPolicy) -> HttpDocumentStore {
        HttpDocumentStore::new(HttpStoreConfig {
            backoff,
            ..HttpStoreConfig::new(base_url)
        })
        .expect("client")
    }

    fn fast_backoff(max_retries: usize) -> BackoffPolicy {
        BackoffPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    const REPORT_BODY: &str = r#"{"id":"r1","fields":{"title":"Pothole"}}"#;

    #[tokio::test]
    async fn http_store_retries_throttling_and_server_errors() {
        let (url, hits) = scripted_server(vec![(429, ""), (503, ""), (200, REPORT_BODY)]).await;
        let store = http_store(url, fast_backoff(3));

        let doc = store
            .get(Collection::Reports, "r1")
            .await
            .expect("eventually succeeds")
            .expect("present");
        assert_eq!(doc.id, "r1");
        assert_eq!(doc.fields.get("title"), Some(&json!("Pothole")));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn http_store_gives_up_after_retry_budget() {
        let (url, hits) = scripted_server(vec![(503, "")]).await;
        let store = http_store(url, fast_backoff(2));

        let err = store
            .get(Collection::Reports, "r1")
            .await
            .expect_err("still unavailable");
        assert!(matches!(err, RemoteError::HttpStatus { status: 503, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn http_store_without_retries_makes_one_attempt() {
        let (url, hits) = scripted_server(vec![(503, ""), (200, REPORT_BODY)]).await;
        let store = http_store(url, BackoffPolicy::none());

        let err = store
            .get(Collection::Reports, "r1")
            .await
            .expect_err("no retry budget");
        assert_eq!(err.disposition(), RetryDisposition::Retryable);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn http_store_never_retries_client_errors() {
        let (url, hits) = scripted_server(vec![(403, ""), (200, REPORT_BODY)]).await;
        let store = http_store(url, fast_backoff(3));
        let err = store
            .update(Collection::Users, "u1", Fields::new())
            .await
            .expect_err("forbidden");
        assert!(matches!(err, RemoteError::PermissionDenied(_)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let (url, hits) = scripted_server(vec![(422, ""), (200, REPORT_BODY)]).await;
        let store = http_store(url, fast_backoff(3));
        let err = store
            .get(Collection::Reports, "r1")
            .await
            .expect_err("unprocessable");
        assert!(matches!(err, RemoteError::HttpStatus { status: 422, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn http_store_reads_missing_documents_as_absent() {
        let (url, hits) = scripted_server(vec![(404, "")]).await;
        let store = http_store(url, fast_backoff(3));

        assert!(store.get(Collection::Reports, "gone").await.expect("get").is_none());
        let err = store
            .update(Collection::Reports, "gone", Fields::new())
            .await
            .expect_err("missing");
        assert!(matches!(err, RemoteError::NotFound { .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
