//! Backend RPC contract
//!
//! A call has the shape `{action, key_values, authToken}` and answers
//! `{success, data?, error?}`. Save accepts many keys per call; load can force
//! a refresh past any backend-side cache.
//!
//! Implementations:
//! - [`HttpBackend`]: JSON POST over `reqwest`
//! - [`InMemoryBackend`]: process-local store for simulations and tests
//! - [`FlakyBackend`]: decorator that injects seeded network failures

use async_trait::async_trait;
use parking_lot::Mutex;
use prefsync_core::{SettingsMap, SyncError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Error codes the backend uses for values it will never accept
const VALIDATION_CODES: &[&str] = &["validation", "invalid_value", "rest_invalid_param"];

/// Requested backend operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendAction {
    /// Persist `key_values`
    Save,
    /// Read every stored setting
    Load,
    /// Restore defaults (all keys, or those named in `key_values`)
    Reset,
}

/// One RPC request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendRequest {
    /// Operation
    pub action: BackendAction,
    /// Payload
    #[serde(default)]
    pub key_values: SettingsMap,
    /// Session credential
    #[serde(rename = "authToken")]
    pub auth_token: String,
    /// Bypass backend caches on load
    #[serde(rename = "forceRefresh", default, skip_serializing_if = "std::ops::Not::not")]
    pub force_refresh: bool,
}

impl BackendRequest {
    /// Save request
    #[must_use]
    pub fn save(key_values: SettingsMap, auth_token: impl Into<String>) -> Self {
        Self {
            action: BackendAction::Save,
            key_values,
            auth_token: auth_token.into(),
            force_refresh: false,
        }
    }

    /// Load request
    #[must_use]
    pub fn load(auth_token: impl Into<String>, force_refresh: bool) -> Self {
        Self {
            action: BackendAction::Load,
            key_values: SettingsMap::new(),
            auth_token: auth_token.into(),
            force_refresh,
        }
    }

    /// Reset request; an empty map resets everything
    #[must_use]
    pub fn reset(keys: SettingsMap, auth_token: impl Into<String>) -> Self {
        Self {
            action: BackendAction::Reset,
            key_values: keys,
            auth_token: auth_token.into(),
            force_refresh: false,
        }
    }
}

/// Error body of a failed call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendErrorBody {
    /// Machine-readable code
    pub code: String,
    /// Human-readable message
    pub message: String,
}

/// One RPC response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendResponse {
    /// Whether the call succeeded
    pub success: bool,
    /// Returned settings (load) or persisted keys (save)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<SettingsMap>,
    /// Failure details
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<BackendErrorBody>,
}

impl BackendResponse {
    /// Successful response
    #[must_use]
    pub fn ok(data: Option<SettingsMap>) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }

    /// Failed response
    #[must_use]
    pub fn failure(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(BackendErrorBody {
                code: code.into(),
                message: message.into(),
            }),
        }
    }

    /// Interpret the response
    ///
    /// # Errors
    /// - [`SyncError::Validation`] for validation codes
    /// - [`SyncError::Server`] for any other error body
    /// - [`SyncError::Protocol`] for a failure without an error body
    pub fn into_result(self) -> Result<Option<SettingsMap>, SyncError> {
        if self.success {
            return Ok(self.data);
        }
        match self.error {
            Some(body) if VALIDATION_CODES.contains(&body.code.as_str()) => {
                Err(SyncError::validation("*", body.message))
            }
            Some(body) => Err(SyncError::server(body.code, body.message)),
            None => Err(SyncError::Protocol(
                "failed response carries no error body".to_string(),
            )),
        }
    }
}

/// Authoritative settings store reached over the network
#[async_trait]
pub trait SettingsBackend: Send + Sync {
    /// Perform one round-trip
    ///
    /// # Errors
    /// Transport failures only; backend-reported failures are in the response
    async fn call(&self, request: BackendRequest) -> Result<BackendResponse, SyncError>;
}

#[async_trait]
impl<T: SettingsBackend + ?Sized> SettingsBackend for std::sync::Arc<T> {
    async fn call(&self, request: BackendRequest) -> Result<BackendResponse, SyncError> {
        (**self).call(request).await
    }
}

/// JSON-over-HTTP backend
#[derive(Debug, Clone)]
pub struct HttpBackend {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpBackend {
    /// Create a client posting to `endpoint`
    ///
    /// # Errors
    /// Returns [`SyncError::Network`] if the HTTP client cannot be built
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, SyncError> {
        let http = reqwest::Client::builder()
            .user_agent(format!("prefsync/{}", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Network(e.to_string()))?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl SettingsBackend for HttpBackend {
    async fn call(&self, request: BackendRequest) -> Result<BackendResponse, SyncError> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(classify_reqwest)?;

        let status = response.status();
        if status.is_server_error() {
            return Err(SyncError::server(status.as_u16().to_string(), status.to_string()));
        }
        response
            .json::<BackendResponse>()
            .await
            .map_err(|e| SyncError::Protocol(e.to_string()))
    }
}

fn classify_reqwest(err: reqwest::Error) -> SyncError {
    if err.is_timeout() {
        SyncError::Timeout(Duration::ZERO)
    } else if err.is_decode() {
        SyncError::Protocol(err.to_string())
    } else {
        SyncError::Network(err.to_string())
    }
}

/// Process-local backend
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    data: Mutex<SettingsMap>,
    defaults: SettingsMap,
}

impl InMemoryBackend {
    /// Create empty backend
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create backend whose reset restores `defaults`
    #[must_use]
    pub fn with_defaults(defaults: SettingsMap) -> Self {
        Self {
            data: Mutex::new(defaults.clone()),
            defaults,
        }
    }

    /// Pre-populate stored values
    #[must_use]
    pub fn with_data(self, data: SettingsMap) -> Self {
        self.data.lock().extend(data);
        self
    }

    /// Copy of stored values
    #[must_use]
    pub fn data(&self) -> SettingsMap {
        self.data.lock().clone()
    }

    /// Apply a request synchronously
    #[must_use]
    pub fn handle(&self, request: &BackendRequest) -> BackendResponse {
        let mut data = self.data.lock();
        match request.action {
            BackendAction::Save => {
                data.extend(request.key_values.clone());
                BackendResponse::ok(Some(request.key_values.clone()))
            }
            BackendAction::Load => BackendResponse::ok(Some(data.clone())),
            BackendAction::Reset => {
                if request.key_values.is_empty() {
                    *data = self.defaults.clone();
                } else {
                    for key in request.key_values.keys() {
                        match self.defaults.get(key) {
                            Some(value) => data.insert(key.clone(), value.clone()),
                            None => data.remove(key),
                        };
                    }
                }
                BackendResponse::ok(Some(data.clone()))
            }
        }
    }
}

#[async_trait]
impl SettingsBackend for InMemoryBackend {
    async fn call(&self, request: BackendRequest) -> Result<BackendResponse, SyncError> {
        Ok(self.handle(&request))
    }
}

/// Decorator failing a seeded fraction of calls with a network error
pub struct FlakyBackend<B> {
    inner: B,
    failure_rate: f64,
    rng: Mutex<StdRng>,
}

impl<B> FlakyBackend<B> {
    /// Wrap `inner`; `failure_rate` is clamped to `0.0..=1.0`
    #[must_use]
    pub fn new(inner: B, failure_rate: f64, seed: u64) -> Self {
        Self {
            inner,
            failure_rate: failure_rate.clamp(0.0, 1.0),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Wrapped backend
    #[inline]
    #[must_use]
    pub fn inner(&self) -> &B {
        &self.inner
    }
}

#[async_trait]
impl<B: SettingsBackend> SettingsBackend for FlakyBackend<B> {
    async fn call(&self, request: BackendRequest) -> Result<BackendResponse, SyncError> {
        let fail = self.rng.lock().random_bool(self.failure_rate);
        if fail {
            return Err(SyncError::Network("injected failure".to_string()));
        }
        self.inner.call(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(pairs: &[(&str, serde_json::Value)]) -> SettingsMap {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn request_wire_shape() {
        let request = BackendRequest::save(map(&[("width", json!(200))]), "token-1");
        let wire = serde_json::to_value(&request).unwrap();

        assert_eq!(wire["action"], json!("save"));
        assert_eq!(wire["key_values"]["width"], json!(200));
        assert_eq!(wire["authToken"], json!("token-1"));
        assert!(wire.get("forceRefresh").is_none());

        let load = serde_json::to_value(BackendRequest::load("t", true)).unwrap();
        assert_eq!(load["forceRefresh"], json!(true));
    }

    #[test]
    fn response_classification() {
        assert_eq!(
            BackendResponse::ok(None).into_result().unwrap(),
            None
        );
        assert!(matches!(
            BackendResponse::failure("invalid_value", "bad color").into_result(),
            Err(SyncError::Validation { .. })
        ));
        assert!(matches!(
            BackendResponse::failure("db_down", "later").into_result(),
            Err(SyncError::Server { .. })
        ));

        let malformed: BackendResponse = serde_json::from_value(json!({"success": false})).unwrap();
        assert!(matches!(malformed.into_result(), Err(SyncError::Protocol(_))));
    }

    #[tokio::test]
    async fn in_memory_save_load_reset() {
        let backend = InMemoryBackend::with_defaults(map(&[("width", json!(100))]));

        let saved = backend
            .call(BackendRequest::save(map(&[("width", json!(250)), ("color", json!("#fff"))]), ""))
            .await
            .unwrap();
        assert_eq!(saved.data.unwrap().len(), 2);

        let loaded = backend.call(BackendRequest::load("", true)).await.unwrap();
        assert_eq!(loaded.data.unwrap()["width"], json!(250));

        let reset = backend
            .call(BackendRequest::reset(map(&[("color", json!(null))]), ""))
            .await
            .unwrap();
        let data = reset.data.unwrap();
        assert_eq!(data["width"], json!(250));
        assert!(!data.contains_key("color"));

        backend.call(BackendRequest::reset(SettingsMap::new(), "")).await.unwrap();
        assert_eq!(backend.data(), map(&[("width", json!(100))]));
    }

    #[tokio::test]
    async fn flaky_backend_extremes() {
        let always = FlakyBackend::new(InMemoryBackend::new(), 1.0, 7);
        assert!(always.call(BackendRequest::load("", false)).await.is_err());

        let never = FlakyBackend::new(InMemoryBackend::new(), 0.0, 7);
        assert!(never.call(BackendRequest::load("", false)).await.is_ok());
    }
}
