//! HTTP client for the persistence service.
//!
//! Routes: `GET /get/{kind}/{key}`, `POST /post/{kind}/{key}`,
//! `PUT /update/{kind}/{key}`, `DELETE /delete/{kind}/{key}`, authenticated
//! with an `api-key` header. Responses carry a `{"success", "data"}`
//! envelope.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use super::{Database, RecordKind, Result, StorageError};

/// Environment variable overriding the service URL.
pub const DATABASE_URL_ENV_VAR: &str = "DATABASE_SERVICE_URL";
/// Environment variable overriding the service auth key.
pub const DATABASE_AUTH_ENV_VAR: &str = "DATABASE_AUTH_KEY";

/// Persistence service configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Base URL of the persistence service.
    pub base_url: String,
    /// Value sent in the `api-key` header.
    pub auth_key: String,
    /// Per-request timeout.
    pub timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            auth_key: String::new(),
            timeout_secs: 10,
        }
    }
}

impl DatabaseConfig {
    /// Apply `DATABASE_SERVICE_URL` / `DATABASE_AUTH_KEY` if set.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var(DATABASE_URL_ENV_VAR) {
            self.base_url = url;
        }
        if let Ok(key) = std::env::var(DATABASE_AUTH_ENV_VAR) {
            self.auth_key = key;
        }
        self
    }
}

enum Reply {
    NotFound,
    /// Successful status; the body when it parsed as an envelope.
    Done(Option<Envelope>),
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    data: Option<Value>,
}

/// `Database` backed by the persistence service's REST API.
pub struct HttpDatabase {
    client: Client,
    base_url: Url,
    auth_key: String,
}

impl HttpDatabase {
    pub fn new(config: &DatabaseConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url).map_err(|e| {
            StorageError::Connection(format!("Invalid base URL {}: {}", config.base_url, e))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(StorageError::Connection(format!(
                "Base URL {} cannot carry a path",
                config.base_url
            )));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| StorageError::Connection(format!("Failed to build HTTP client: {}", e)))?;

        info!(base_url = %base_url, "Persistence client initialized");

        Ok(Self {
            client,
            base_url,
            auth_key: config.auth_key.clone(),
        })
    }

    /// Build `{base}/{action}/{kind}/{key}` with each segment escaped.
    fn url(&self, action: &str, kind: RecordKind, key: &str) -> Url {
        let code = kind.code().to_string();
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend([action, code.as_str(), key]);
        }
        url
    }

    async fn send(
        &self,
        method: Method,
        action: &str,
        kind: RecordKind,
        key: &str,
        body: Option<&Value>,
    ) -> Result<Reply> {
        let url = self.url(action, kind, key);
        let mut request = self
            .client
            .request(method, url)
            .header("api-key", &self.auth_key);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| StorageError::Request {
            key: key.to_string(),
            message: e.to_string(),
        })?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Reply::NotFound);
        }

        let response = response
            .error_for_status()
            .map_err(|e| StorageError::Request {
                key: key.to_string(),
                message: e.to_string(),
            })?;

        // Some routes answer with a bare value rather than an envelope.
        let envelope = response.json::<Envelope>().await.ok();
        debug!(action, key, "Persistence request succeeded");
        Ok(Reply::Done(envelope))
    }

    async fn write(
        &self,
        method: Method,
        action: &str,
        kind: RecordKind,
        key: &str,
        body: Option<&Value>,
    ) -> Result<()> {
        match self.send(method, action, kind, key, body).await? {
            Reply::NotFound => Err(StorageError::NotFound {
                key: key.to_string(),
            }),
            Reply::Done(Some(Envelope {
                success: Some(false),
                ..
            })) => Err(StorageError::Rejected {
                key: key.to_string(),
            }),
            Reply::Done(_) => Ok(()),
        }
    }
}

#[async_trait]
impl Database for HttpDatabase {
    async fn get(&self, kind: RecordKind, key: &str) -> Result<Option<Value>> {
        match self.send(Method::GET, "get", kind, key, None).await? {
            Reply::NotFound | Reply::Done(None) => Ok(None),
            Reply::Done(Some(envelope)) => match envelope.success {
                Some(false) => Ok(None),
                _ => Ok(envelope.data.filter(|data| !data.is_null())),
            },
        }
    }

    async fn post(&self, kind: RecordKind, key: &str, value: &Value) -> Result<()> {
        self.write(Method::POST, "post", kind, key, Some(value)).await
    }

    async fn update(&self, kind: RecordKind, key: &str, value: &Value) -> Result<()> {
        self.write(Method::PUT, "update", kind, key, Some(value)).await
    }

    async fn delete(&self, kind: RecordKind, key: &str) -> Result<()> {
        self.write(Method::DELETE, "delete", kind, key, None).await
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    use super::*;

    /// Answer one request with a canned response; yields the request head.
    async fn serve_once(
        status: &'static str,
        body: &'static str,
    ) -> (HttpDatabase, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let db = HttpDatabase::new(&DatabaseConfig {
            base_url: format!("http://{}", listener.local_addr().unwrap()),
            auth_key: "secret".to_string(),
            ..DatabaseConfig::default()
        })
        .unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = socket.read(&mut buf).await.unwrap();
            let response = format!(
                "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&buf[..n]).into_owned()
        });
        (db, server)
    }

    #[tokio::test]
    async fn test_delete_sends_authenticated_request() {
        let (db, server) = serve_once("200 OK", r#"{"success":true}"#).await;

        db.delete(RecordKind::CollectionCommaIdValue, "maps,M1")
            .await
            .unwrap();

        let head = server.await.unwrap();
        assert!(head.starts_with("DELETE /delete/1/maps,M1 HTTP/1.1"));
        assert!(head.to_lowercase().contains("api-key: secret"));
    }

    #[tokio::test]
    async fn test_delete_missing_record_is_not_found() {
        let (db, server) = serve_once("404 Not Found", "").await;

        let result = db.delete(RecordKind::Messenger, "maps_M1").await;
        assert!(matches!(result, Err(StorageError::NotFound { key }) if key == "maps_M1"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_write_refused_by_envelope_is_rejected() {
        let (db, server) = serve_once("200 OK", r#"{"success":false}"#).await;

        let result = db
            .update(RecordKind::CollectionCommaIdValue, "maps,M1", &serde_json::json!({}))
            .await;
        assert!(matches!(result, Err(StorageError::Rejected { .. })));
        server.await.unwrap();
    }

    #[test]
    fn test_url_escapes_segments() {
        let db = HttpDatabase::new(&DatabaseConfig {
            base_url: "http://db.local:8080/api/".to_string(),
            ..DatabaseConfig::default()
        })
        .unwrap();

        let url = db.url("get", RecordKind::CollectionCommaIdValue, "maps,team one");
        assert_eq!(url.as_str(), "http://db.local:8080/api/get/1/maps,team%20one");
    }

    #[test]
    fn test_rejects_invalid_base_url() {
        let result = HttpDatabase::new(&DatabaseConfig {
            base_url: "not a url".to_string(),
            ..DatabaseConfig::default()
        });
        assert!(matches!(result, Err(StorageError::Connection(_))));
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var(DATABASE_URL_ENV_VAR, "http://override:9000");
        std::env::set_var(DATABASE_AUTH_ENV_VAR, "secret");

        let config = DatabaseConfig::default().with_env_overrides();

        std::env::remove_var(DATABASE_URL_ENV_VAR);
        std::env::remove_var(DATABASE_AUTH_ENV_VAR);

        assert_eq!(config.base_url, "http://override:9000");
        assert_eq!(config.auth_key, "secret");
    }
}
