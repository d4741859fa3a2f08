//! WebSocket live-query client.
//!
//! Each [`QuerySource::subscribe`] call opens one WebSocket to the store's
//! listen endpoint and runs a reconnecting read loop on the tokio runtime.
//! The store pushes JSON text frames:
//!
//! ```json
//! {"type": "snapshot", "documents": [{"id": "g1", "data": {"fixture": "..."}}]}
//! {"type": "error", "code": "permission-denied", "message": "..."}
//! ```
//!
//! Snapshot frames are full result sets. An error frame ends the query. A
//! frame that does not parse is reported as [`UpstreamError::Decode`] and the
//! connection stays up. Transport failures are reported as [`UpstreamError::Connection`] and the
//! loop reconnects with exponential backoff; the next snapshot restores data.

use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::{debug, error, info, trace, warn};

use tipster_live::{Document, QueryKey, QuerySource, SnapshotSink, Subscription, UpstreamError};

use crate::StoreError;
use crate::store::WireDocument;

/// How long a connection may stay silent before it is considered dead.
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(90);

/// Live-query client for the store's WebSocket listen endpoint.
#[derive(Debug, Clone)]
pub struct ListenClient {
    url: String,
    token: Option<String>,
    runtime: Option<Handle>,
    read_timeout: Duration,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl ListenClient {
    /// Create a client for the listen endpoint at `url` (`ws://` or `wss://`).
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            runtime: None,
            read_timeout: DEFAULT_READ_TIMEOUT,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }

    /// Send `token` as a bearer credential on every connection.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Spawn listener tasks on `runtime` instead of the ambient one.
    ///
    /// Needed when `subscribe` is called from outside a tokio context.
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Override the silent-connection timeout.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Override the reconnect backoff bounds.
    pub fn with_reconnect_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Build the full WebSocket URL for `key`.
    fn build_url(&self, key: &QueryKey) -> String {
        let mut url = self.url.clone();
        url.push(if url.contains('?') { '&' } else { '?' });
        url.push_str("collection=");
        url.push_str(key.collection_name());

        if let Some(order) = key.order() {
            url.push_str("&orderBy=");
            url.push_str(&order.field);
            url.push_str("&direction=");
            url.push_str(order.direction.as_str());
        }

        url
    }
}

impl QuerySource<Value> for ListenClient {
    fn subscribe(&self, key: &QueryKey, sink: SnapshotSink<Value>) -> Box<dyn Subscription> {
        let runtime = match self.runtime.clone().or_else(|| Handle::try_current().ok()) {
            Some(runtime) => runtime,
            None => {
                error!(query = %key, "no tokio runtime available, cannot open live query");
                sink.error(UpstreamError::Connection(
                    "no tokio runtime available".to_string(),
                ));
                return Box::new(|| {});
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let listener = QueryListener {
            url: self.build_url(key),
            token: self.token.clone(),
            query: key.clone(),
            sink,
            read_timeout: self.read_timeout,
            backoff: ExponentialBackoff {
                initial_interval: self.initial_backoff,
                max_interval: self.max_backoff,
                max_elapsed_time: None, // Retry forever
                ..Default::default()
            },
        };

        runtime.spawn(listener.run(shutdown_rx));

        Box::new(move || {
            // The task may already have ended after an error frame.
            let _ = shutdown_tx.send(true);
        })
    }
}

/// How a connection ended without a transport failure.
#[derive(Debug, PartialEq, Eq)]
enum Ended {
    /// The subscription was cancelled.
    Shutdown,
    /// The store rejected the query with an error frame.
    Rejected,
}

/// Frames pushed by the listen endpoint.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Frame {
    Snapshot {
        #[serde(default)]
        documents: Vec<WireDocument>,
    },
    Error {
        code: String,
        #[serde(default)]
        message: String,
    },
}

/// Map a store error code onto the cache's error kinds.
fn upstream_error(code: &str, message: String) -> UpstreamError {
    match code {
        "permission-denied" | "unauthenticated" => UpstreamError::PermissionDenied(message),
        "unavailable" | "deadline-exceeded" => UpstreamError::Connection(message),
        other => UpstreamError::Backend(format!("{}: {}", other, message)),
    }
}

/// One running live query.
struct QueryListener {
    url: String,
    token: Option<String>,
    query: QueryKey,
    sink: SnapshotSink<Value>,
    read_timeout: Duration,
    backoff: ExponentialBackoff,
}

impl QueryListener {
    /// Connect and deliver frames until cancelled or rejected.
    ///
    /// Runs in a reconnection loop with exponential backoff.
    async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            if *shutdown_rx.borrow() {
                debug!(query = %self.query, "live query cancelled");
                return;
            }

            debug!(url = %self.url, "connecting live query");

            match self.connect_and_process(&mut shutdown_rx).await {
                Ok(Ended::Shutdown) => {
                    debug!(query = %self.query, "live query cancelled");
                    return;
                }
                Ok(Ended::Rejected) => {
                    info!(query = %self.query, "live query rejected by store, not reconnecting");
                    return;
                }
                Err(e) => {
                    if *shutdown_rx.borrow() {
                        return;
                    }
                    error!(query = %self.query, error = %e, "live query connection error, reconnecting");
                    self.sink.error(UpstreamError::Connection(e.to_string()));

                    // Always Some since max_elapsed_time is None
                    let wait = self.backoff.next_backoff().unwrap_or(self.backoff.max_interval);

                    tokio::select! {
                        changed = shutdown_rx.changed() => {
                            if changed.is_err() || *shutdown_rx.borrow() {
                                return;
                            }
                        }
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
    }

    /// Connect and process frames until error, rejection or shutdown.
    async fn connect_and_process(
        &mut self,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<Ended, StoreError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| StoreError::WebSocket(format!("invalid listen URL: {}", e)))?;
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| StoreError::WebSocket(format!("invalid token: {}", e)))?;
            request.headers_mut().insert("Authorization", value);
        }

        let (ws_stream, _) = tokio::select! {
            biased;

            _ = shutdown_rx.changed() => return Ok(Ended::Shutdown),
            result = connect_async(request) => result
                .map_err(|e| StoreError::WebSocket(format!("connection failed: {}", e)))?,
        };

        let (_, mut read) = ws_stream.split();

        info!(query = %self.query, "live query connected");

        // Reset backoff on successful connection
        self.backoff.reset();

        loop {
            tokio::select! {
                biased;

                // A dropped sender counts as cancellation.
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        return Ok(Ended::Shutdown);
                    }
                }

                result = tokio::time::timeout(self.read_timeout, read.next()) => {
                    match result {
                        Ok(Some(Ok(Message::Text(text)))) => {
                            if let Some(ended) = self.handle_message(&text) {
                                return Ok(ended);
                            }
                        }
                        Ok(Some(Ok(Message::Ping(_)))) => {
                            // tungstenite auto-responds to pings
                            trace!("received ping");
                        }
                        Ok(Some(Ok(Message::Close(_)))) => {
                            return Err(StoreError::WebSocket("connection closed".to_string()));
                        }
                        Ok(Some(Ok(_))) => {}
                        Ok(Some(Err(e))) => {
                            return Err(StoreError::WebSocket(format!("read error: {}", e)));
                        }
                        Ok(None) => {
                            return Err(StoreError::WebSocket("stream ended".to_string()));
                        }
                        Err(_) => {
                            warn!(query = %self.query, timeout_secs = self.read_timeout.as_secs(), "live query read timeout");
                            return Err(StoreError::WebSocket("read timeout".to_string()));
                        }
                    }
                }
            }
        }
    }

    /// Deliver one text frame. Returns `Some` when the frame ends the query.
    fn handle_message(&self, text: &str) -> Option<Ended> {
        let frame: Frame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(query = %self.query, error = %e, "failed to parse live query frame");
                self.sink.error(UpstreamError::Decode(e.to_string()));
                return None;
            }
        };

        match frame {
            Frame::Snapshot { documents } => {
                trace!(query = %self.query, documents = documents.len(), "snapshot frame");
                self.sink
                    .snapshot(documents.into_iter().map(Document::from).collect());
                None
            }
            Frame::Error { code, message } => {
                warn!(query = %self.query, code = %code, message = %message, "live query error frame");
                self.sink.error(upstream_error(&code, message));
                Some(Ended::Rejected)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tipster_live::Direction;

    #[test]
    fn test_build_url() {
        let client = ListenClient::new("ws://localhost:9000/v1/listen");
        let plain = QueryKey::collection("notifications");
        assert_eq!(
            client.build_url(&plain),
            "ws://localhost:9000/v1/listen?collection=notifications"
        );

        let ordered = QueryKey::collection("games").order_by("createdAt", Direction::Descending);
        assert_eq!(
            client.build_url(&ordered),
            "ws://localhost:9000/v1/listen?collection=games&orderBy=createdAt&direction=desc"
        );
    }

    #[test]
    fn test_build_url_with_existing_query() {
        let client = ListenClient::new("ws://localhost:9000/listen?project=demo");
        assert_eq!(
            client.build_url(&QueryKey::collection("games")),
            "ws://localhost:9000/listen?project=demo&collection=games"
        );
    }

    #[test]
    fn test_parse_frames() {
        let frame: Frame = serde_json::from_str(
            r#"{"type":"snapshot","documents":[{"id":"g1","data":{"fixture":"A vs B"}}]}"#,
        )
        .unwrap();
        match frame {
            Frame::Snapshot { documents } => {
                assert_eq!(documents.len(), 1);
                assert_eq!(documents[0].id, "g1");
            }
            other => panic!("expected snapshot, got {:?}", other),
        }

        let frame: Frame =
            serde_json::from_str(r#"{"type":"error","code":"permission-denied","message":"no"}"#)
                .unwrap();
        assert!(matches!(frame, Frame::Error { ref code, .. } if code == "permission-denied"));
    }

    #[test]
    fn test_upstream_error_codes() {
        assert_eq!(
            upstream_error("permission-denied", "rules".into()),
            UpstreamError::PermissionDenied("rules".into())
        );
        assert_eq!(
            upstream_error("unavailable", "restarting".into()),
            UpstreamError::Connection("restarting".into())
        );
        assert_eq!(
            upstream_error("internal", "assertion failed".into()),
            UpstreamError::Backend("internal: assertion failed".into())
        );
    }

    #[test]
    fn test_subscribe_without_runtime_reports_error() {
        use std::sync::{Arc, Mutex};

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = Arc::clone(&seen);
            SnapshotSink::new(move |delivery| seen.lock().unwrap().push(delivery))
        };

        let client = ListenClient::new("ws://localhost:1/listen");
        let subscription = client.subscribe(&QueryKey::collection("games"), sink);
        subscription.cancel();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(matches!(
            seen[0],
            tipster_live::Delivery::Error(UpstreamError::Connection(_))
        ));
    }
}
