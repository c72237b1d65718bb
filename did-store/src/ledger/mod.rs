//! # Ledger Registrar
//!
//! Remote publication of DID documents is delegated to a
//! [`LedgerRegistrar`]. Any non-success response is a hard failure of the
//! enclosing lifecycle operation; retries belong to the caller.
//!
//! Two registrars ship with the store:
//! - [`HttpRegistrar`]: JSON over HTTP
//!   (`POST /dids`, `PUT /dids/{id}`, `GET /dids/{id}`)
//! - [`MemoryLedger`]: in-process, for tests and offline use

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

use shared::{
    config::LedgerConfig,
    constants::LEDGER_REQUEST_TIMEOUT_SECS,
    error::{StoreError, StoreResult},
    types::{Did, KeyMaterial},
};

use crate::document::document_did;

/// Publishes documents to and resolves them from a ledger
#[async_trait]
pub trait LedgerRegistrar: Send + Sync {
    /// Host recorded as `publishedHost` after a successful registration
    fn host(&self) -> Option<String>;

    /// Publish a new document
    ///
    /// `keys` lets signing registrars prove control; the document is the
    /// only thing sent.
    async fn register(&self, document: &Value, keys: &KeyMaterial) -> StoreResult<()>;

    /// Replace a published document
    async fn update(&self, document: &Value, keys: &KeyMaterial) -> StoreResult<()>;

    /// Resolve a published document
    async fn get(&self, did: &Did) -> StoreResult<Option<Value>>;
}

fn ledger_error(action: &str, did: &str, reason: impl Into<String>) -> StoreError {
    StoreError::Ledger {
        action: action.to_string(),
        did: did.to_string(),
        reason: reason.into(),
    }
}

// =============================================================================
// HTTP REGISTRAR
// =============================================================================

/// Registrar speaking JSON over HTTP
#[derive(Debug, Clone)]
pub struct HttpRegistrar {
    /// Base URL, without trailing slash
    endpoint: String,

    /// Explicit `publishedHost`
    host: Option<String>,

    /// HTTP client
    http_client: reqwest::Client,
}

impl HttpRegistrar {
    /// Create a registrar for `endpoint`
    pub fn new(endpoint: impl Into<String>, host: Option<String>) -> StoreResult<Self> {
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        reqwest::Url::parse(&endpoint).map_err(|e| {
            StoreError::Configuration(format!("invalid ledger endpoint '{}': {}", endpoint, e))
        })?;

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(LEDGER_REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| StoreError::Configuration(format!("HTTP client: {}", e)))?;

        info!(endpoint = %endpoint, "Ledger registrar configured");

        Ok(Self {
            endpoint,
            host,
            http_client,
        })
    }

    /// Registrar for a ledger configuration, if it names an endpoint
    pub fn from_config(config: &LedgerConfig) -> StoreResult<Option<Self>> {
        config
            .endpoint
            .as_ref()
            .map(|endpoint| Self::new(endpoint.clone(), config.host.clone()))
            .transpose()
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn document_url(&self, did: &str) -> String {
        format!("{}/dids/{}", self.endpoint, urlencoding::encode(did))
    }

    async fn send(
        &self,
        action: &str,
        did: &str,
        request: reqwest::RequestBuilder,
    ) -> StoreResult<reqwest::Response> {
        let response = request
            .send()
            .await
            .map_err(|e| ledger_error(action, did, e.to_string()))?;

        debug!(action, did = %did, status = %response.status(), "Ledger responded");
        Ok(response)
    }

    async fn expect_success(action: &str, did: &str, response: reqwest::Response) -> StoreResult<()> {
        if response.status().is_success() {
            return Ok(());
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(ledger_error(action, did, format!("{}: {}", status, body)))
    }
}

#[async_trait]
impl LedgerRegistrar for HttpRegistrar {
    fn host(&self) -> Option<String> {
        self.host.clone().or_else(|| {
            reqwest::Url::parse(&self.endpoint)
                .ok()
                .and_then(|url| url.host_str().map(str::to_string))
        })
    }

    async fn register(&self, document: &Value, _keys: &KeyMaterial) -> StoreResult<()> {
        let did = document_did(document)?;
        let url = format!("{}/dids", self.endpoint);

        let request = self.http_client.post(&url).json(&json!({ "document": document }));
        let response = self.send("register", did.as_str(), request).await?;
        Self::expect_success("register", did.as_str(), response).await
    }

    async fn update(&self, document: &Value, _keys: &KeyMaterial) -> StoreResult<()> {
        let did = document_did(document)?;
        let url = self.document_url(did.as_str());

        let request = self.http_client.put(&url).json(&json!({ "document": document }));
        let response = self.send("update", did.as_str(), request).await?;
        Self::expect_success("update", did.as_str(), response).await
    }

    async fn get(&self, did: &Did) -> StoreResult<Option<Value>> {
        let url = self.document_url(did.as_str());

        let response = self
            .send("get", did.as_str(), self.http_client.get(&url))
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ledger_error("get", did.as_str(), format!("{}: {}", status, body)));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ledger_error("get", did.as_str(), e.to_string()))?;

        // Accept both a bare document and `{ "document": ... }`
        Ok(Some(match body {
            Value::Object(mut map) if map.contains_key("document") => {
                map.remove("document").unwrap_or(Value::Null)
            }
            other => other,
        }))
    }
}

// =============================================================================
// MEMORY LEDGER
// =============================================================================

/// In-process ledger
///
/// Can be told to fail every request, to exercise failure paths.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    documents: RwLock<HashMap<String, Value>>,
    failure: RwLock<Option<String>>,
    host: Option<String>,
    updates: RwLock<u32>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ledger reporting `host` as `publishedHost`
    pub fn with_host(host: impl Into<String>) -> Self {
        Self {
            host: Some(host.into()),
            ..Self::default()
        }
    }

    /// Fail every following request with `reason`
    pub fn fail_with(&self, reason: impl Into<String>) {
        *self.failure.write() = Some(reason.into());
    }

    /// Stop failing requests
    pub fn succeed(&self) {
        *self.failure.write() = None;
    }

    /// Published copy of `did`
    pub fn document(&self, did: &str) -> Option<Value> {
        self.documents.read().get(did).cloned()
    }

    /// Number of published documents
    pub fn len(&self) -> usize {
        self.documents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.read().is_empty()
    }

    /// Number of successful updates
    pub fn update_count(&self) -> u32 {
        *self.updates.read()
    }

    fn check_failure(&self, action: &str, did: &str) -> StoreResult<()> {
        match self.failure.read().as_ref() {
            Some(reason) => Err(ledger_error(action, did, reason.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl LedgerRegistrar for MemoryLedger {
    fn host(&self) -> Option<String> {
        self.host.clone()
    }

    async fn register(&self, document: &Value, _keys: &KeyMaterial) -> StoreResult<()> {
        let did = document_did(document)?;
        self.check_failure("register", did.as_str())?;

        let mut documents = self.documents.write();
        if documents.contains_key(did.as_str()) {
            return Err(ledger_error("register", did.as_str(), "already registered"));
        }
        documents.insert(did.to_string(), document.clone());
        Ok(())
    }

    async fn update(&self, document: &Value, _keys: &KeyMaterial) -> StoreResult<()> {
        let did = document_did(document)?;
        self.check_failure("update", did.as_str())?;

        let mut documents = self.documents.write();
        let Some(existing) = documents.get_mut(did.as_str()) else {
            return Err(ledger_error("update", did.as_str(), "not registered"));
        };
        *existing = document.clone();
        *self.updates.write() += 1;
        Ok(())
    }

    async fn get(&self, did: &Did) -> StoreResult<Option<Value>> {
        self.check_failure("get", did.as_str())?;
        Ok(self.document(did.as_str()))
    }
}
