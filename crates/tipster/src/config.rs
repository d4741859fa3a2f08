//! Store endpoints and credentials.

use serde::{Deserialize, Serialize};
use url::Url;

use tipster_store::{ListenClient, StoreClient, StoreError};

use crate::ConfigError;

/// Default REST endpoint.
pub const DEFAULT_STORE_URL: &str = "http://localhost:8080";
/// Default live-query endpoint.
pub const DEFAULT_LISTEN_URL: &str = "ws://localhost:8080/v1/listen";

/// Where the document store lives and how to authenticate against it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the REST API (`http://` or `https://`).
    pub store_url: String,
    /// Live-query WebSocket endpoint (`ws://` or `wss://`).
    pub listen_url: String,
    /// Bearer token sent to both endpoints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_url: DEFAULT_STORE_URL.to_string(),
            listen_url: DEFAULT_LISTEN_URL.to_string(),
            token: None,
        }
    }
}

impl Config {
    /// Check URL schemes and the token.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_url("store URL", &self.store_url, &["http", "https"])?;
        check_url("listen URL", &self.listen_url, &["ws", "wss"])?;

        if self.token.as_deref().is_some_and(|t| t.trim().is_empty()) {
            return Err(ConfigError::EmptyToken);
        }

        Ok(())
    }

    /// REST client for [`Config::store_url`].
    pub fn store_client(&self) -> Result<StoreClient, StoreError> {
        let client = StoreClient::new(&self.store_url)?;
        Ok(match &self.token {
            Some(token) => client.with_token(token),
            None => client,
        })
    }

    /// Live-query client for [`Config::listen_url`].
    pub fn listen_client(&self) -> ListenClient {
        let client = ListenClient::new(&self.listen_url);
        match &self.token {
            Some(token) => client.with_token(token),
            None => client,
        }
    }
}

fn check_url(field: &'static str, url: &str, schemes: &[&str]) -> Result<(), ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidUrl {
        field,
        url: url.to_string(),
        reason,
    };

    let parsed = Url::parse(url).map_err(|e| invalid(e.to_string()))?;
    if !schemes.contains(&parsed.scheme()) {
        return Err(invalid(format!("expected scheme {}", schemes.join(" or "))));
    }
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(invalid("missing host".to_string()));
    }

    Ok(())
}
