//! REST client for the document store.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tipster_live::{Document, QueryKey};
use tracing::{debug, warn};

use crate::store::WireDocument;
use crate::{DocumentStore, StoreError};

/// Which failures of a request may be replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Replay {
    /// Repeating the request has no extra effect (GET, PATCH, DELETE).
    Idempotent,
    /// Only retried when the request never reached the server.
    ConnectOnly,
}

/// Client for the store's REST API.
#[derive(Debug, Clone)]
pub struct StoreClient {
    http: Client,
    base_url: String,
    token: Option<String>,
}

impl StoreClient {
    /// Create a new client for the given base URL.
    pub fn new(base_url: impl Into<String>) -> Result<Self, StoreError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
        })
    }

    /// Send `token` as a bearer credential on every request.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Get the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn collection_url(&self, collection: &str) -> String {
        format!("{}/v1/{}", self.base_url, collection)
    }

    fn document_url(&self, collection: &str, id: &str) -> String {
        format!("{}/v1/{}/{}", self.base_url, collection, id)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.header("Authorization", format!("Bearer {}", token)),
            None => request,
        }
    }

    /// List a collection once, ordered like `key`.
    pub async fn list(&self, key: &QueryKey) -> Result<Vec<Document<Value>>, StoreError> {
        #[derive(Deserialize)]
        struct ListResponse {
            documents: Vec<WireDocument>,
        }

        let url = self.collection_url(key.collection_name());
        let mut query: Vec<(&str, &str)> = Vec::new();
        if let Some(order) = key.order() {
            query.push(("orderBy", order.field.as_str()));
            query.push(("direction", order.direction.as_str()));
        }

        let response = self
            .send("list", key.collection_name(), None, Replay::Idempotent, || {
                self.http.get(&url).query(&query)
            })
            .await?;
        let body: ListResponse = response.json().await?;
        debug!(query = %key, documents = body.documents.len(), "listed collection");

        Ok(body.documents.into_iter().map(Document::from).collect())
    }

    /// Send a request, retrying transient failures.
    ///
    /// Up to 4 attempts: initial + 3 retries after 500ms, 1s, 2s. A
    /// [`Replay::ConnectOnly`] request is not retried once the server may
    /// have seen it.
    async fn send<F>(
        &self,
        operation: &str,
        collection: &str,
        id: Option<&str>,
        replay: Replay,
        build: F,
    ) -> Result<Response, StoreError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut last_error = None;
        for attempt in 0..4 {
            let (result, retryable) = match self.authorize(build()).send().await {
                Ok(response) => {
                    let status = response.status();
                    let result = Self::handle_response(response, collection, id).await;
                    let retryable = replay == Replay::Idempotent
                        && (status.is_server_error()
                            || result.as_ref().err().is_some_and(StoreError::is_transient));
                    (result, retryable)
                }
                Err(e) => {
                    let connect = e.is_connect();
                    let error = StoreError::Http(e);
                    let retryable = match replay {
                        Replay::Idempotent => error.is_transient(),
                        Replay::ConnectOnly => connect,
                    };
                    (Err(error), retryable)
                }
            };

            match result {
                Ok(response) => return Ok(response),
                Err(ref e) if retryable && attempt < 3 => {
                    let backoff_ms = 500 * (1 << attempt); // 500ms, 1s, 2s
                    warn!(
                        attempt = attempt + 1,
                        backoff_ms,
                        error = %e,
                        "transient error in {}, retrying",
                        operation
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    last_error = Some(result);
                    continue;
                }
                Err(_) => return result,
            }
        }

        last_error.unwrap_or_else(|| Err(StoreError::InvalidResponse("retry exhausted".into())))
    }

    /// Map error statuses onto [`StoreError`], passing successes through.
    async fn handle_response(
        response: Response,
        collection: &str,
        id: Option<&str>,
    ) -> Result<Response, StoreError> {
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok());
            return Err(StoreError::RateLimited { retry_after_secs });
        }

        if status == StatusCode::NOT_FOUND {
            if let Some(id) = id {
                return Err(StoreError::NotFound {
                    collection: collection.to_string(),
                    id: id.to_string(),
                });
            }
        }

        if !status.is_success() {
            let text = response.text().await.map_err(|e| {
                StoreError::InvalidResponse(format!(
                    "request failed ({}): failed to read response: {}",
                    status, e
                ))
            })?;

            if let Ok(body) = serde_json::from_str::<ErrorBody>(&text) {
                return Err(StoreError::Api {
                    error: body.error,
                    message: body.message,
                });
            }

            return Err(StoreError::InvalidResponse(format!(
                "request failed ({}): {}",
                status, text
            )));
        }

        Ok(response)
    }
}

/// Error body returned by the store.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    #[serde(default)]
    message: String,
}

#[async_trait]
impl DocumentStore for StoreClient {
    async fn create(&self, collection: &str, record: Value) -> Result<String, StoreError> {
        #[derive(Deserialize)]
        struct CreateResponse {
            id: String,
        }

        let url = self.collection_url(collection);
        debug!(collection = %collection, body = %record, "creating document");

        let response = self
            .send("create", collection, None, Replay::ConnectOnly, || {
                self.http.post(&url).json(&record)
            })
            .await?;
        let body: CreateResponse = response.json().await?;
        if body.id.is_empty() {
            return Err(StoreError::InvalidResponse("create returned empty id".into()));
        }
        Ok(body.id)
    }

    async fn update(&self, collection: &str, id: &str, patch: Value) -> Result<(), StoreError> {
        let url = self.document_url(collection, id);
        debug!(collection = %collection, id = %id, "updating document");

        self.send("update", collection, Some(id), Replay::Idempotent, || {
            self.http.patch(&url).json(&patch)
        })
        .await?;
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        let url = self.document_url(collection, id);
        debug!(collection = %collection, id = %id, "deleting document");

        self.send("delete", collection, Some(id), Replay::Idempotent, || {
            self.http.delete(&url)
        })
            .await?;
        Ok(())
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Document<Value>, StoreError> {
        let url = self.document_url(collection, id);
        let response = self
            .send("get", collection, Some(id), Replay::Idempotent, || {
                self.http.get(&url)
            })
            .await?;
        let body: WireDocument = response.json().await?;
        Ok(body.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tipster_live::Direction;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_client_trims_base_url() {
        let client = StoreClient::new("https://store.example.com/").unwrap();
        assert_eq!(client.base_url(), "https://store.example.com");
        assert_eq!(
            client.document_url("games", "g1"),
            "https://store.example.com/v1/games/g1"
        );
    }

    #[tokio::test]
    async fn test_create_returns_id() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/games"))
            .and(header("Authorization", "Bearer admin-token"))
            .and(body_json(json!({"fixture": "Arsenal vs Chelsea"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "g42"})))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = StoreClient::new(mock_server.uri())
            .unwrap()
            .with_token("admin-token");
        let id = client
            .create("games", json!({"fixture": "Arsenal vs Chelsea"}))
            .await
            .unwrap();

        assert_eq!(id, "g42");
    }

    #[tokio::test]
    async fn test_update_sends_patch() {
        let mock_server = MockServer::start().await;

        Mock::given(method("PATCH"))
            .and(path("/v1/games/g1"))
            .and(body_json(json!({"active": false})))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = StoreClient::new(mock_server.uri()).unwrap();
        client
            .update("games", "g1", json!({"active": false}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_delete_not_found() {
        let mock_server = MockServer::start().await;

        Mock::given(method("DELETE"))
            .and(path("/v1/games/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;

        let client = StoreClient::new(mock_server.uri()).unwrap();
        let result = client.delete("games", "missing").await;

        match result {
            Err(StoreError::NotFound { collection, id }) => {
                assert_eq!(collection, "games");
                assert_eq!(id, "missing");
            }
            other => panic!("expected NotFound, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_get_document() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1/leaderboard/u1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "u1",
                "data": {"username": "kemi", "score": 900}
            })))
            .mount(&mock_server)
            .await;

        let client = StoreClient::new(mock_server.uri()).unwrap();
        let doc = client.get("leaderboard", "u1").await.unwrap();

        assert_eq!(doc.id, "u1");
        assert_eq!(doc.data["username"], "kemi");
    }

    #[tokio::test]
    async fn test_list_passes_ordering() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1/leaderboard"))
            .and(query_param("orderBy", "score"))
            .and(query_param("direction", "desc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "documents": [
                    {"id": "u2", "data": {"score": 20}},
                    {"id": "u1", "data": {"score": 10}}
                ]
            })))
            .mount(&mock_server)
            .await;

        let client = StoreClient::new(mock_server.uri()).unwrap();
        let key = QueryKey::collection("leaderboard").order_by("score", Direction::Descending);
        let docs = client.list(&key).await.unwrap();

        let ids: Vec<_> = docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["u2", "u1"]);
    }

    #[tokio::test]
    async fn test_rate_limited() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/games"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "12"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = StoreClient::new(mock_server.uri()).unwrap();
        let result = client.create("games", json!({})).await;

        assert!(matches!(
            result,
            Err(StoreError::RateLimited {
                retry_after_secs: Some(12)
            })
        ));
    }

    #[tokio::test]
    async fn test_api_error_body() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/games"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                "error": "PermissionDenied",
                "message": "admin only"
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = StoreClient::new(mock_server.uri()).unwrap();
        let err = client.create("games", json!({})).await.unwrap_err();

        match err {
            StoreError::Api { error, message } => {
                assert_eq!(error, "PermissionDenied");
                assert_eq!(message, "admin only");
            }
            other => panic!("expected Api, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1/games/g1"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .expect(2)
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .and(path("/v1/games/g1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "g1",
                "data": {"fixture": "A vs B"}
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = StoreClient::new(mock_server.uri()).unwrap();
        let doc = client.get("games", "g1").await.unwrap();

        assert_eq!(doc.data["fixture"], "A vs B");
    }

    #[tokio::test]
    async fn test_create_is_not_replayed_after_server_error() {
        let mock_server = MockServer::start().await;

        // The write may have committed before the 503.
        Mock::given(method("POST"))
            .and(path("/v1/games"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = StoreClient::new(mock_server.uri()).unwrap();
        let result = client.create("games", json!({"fixture": "A vs B"})).await;

        assert!(matches!(result, Err(StoreError::InvalidResponse(_))));
    }
}
