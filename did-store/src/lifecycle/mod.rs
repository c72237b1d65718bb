//! # Identity Lifecycle Manager
//!
//! Orchestrates the collections, the lock service and the notes store to
//! move identity records through their lifecycle:
//!
//! ```text
//! generate ─┐
//! import ───┴► Pending ──register──► Registered
//!                 │  ▲                  │  ▲
//!                 └──┘ rotate_key       └──┘ rotate_key (ledger first)
//!                 │
//!                 └──remove──► (gone)
//! ```
//!
//! Every operation holds the per-identifier lock for its whole
//! read-modify-write sequence. Notes are mirrored into the shared config
//! under the config lock, always taken after the identifier lock.

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use shared::{
    config::StoreConfig,
    constants::*,
    error::{Operation, StoreError, StoreResult},
    types::{Did, KeyMaterial, KeyType, Notes, RecordStatus},
};

use crate::collection::Collection;
use crate::document::{document_did, references_key, replace_key};
use crate::generator::{DocumentGenerator, GenerateRequest};
use crate::ledger::LedgerRegistrar;
use crate::lock::{LockGuard, LockService};
use crate::notes::NotesStore;

// =============================================================================
// OPERATION TYPES
// =============================================================================

/// Options of [`LifecycleManager::generate`]
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    pub key_type: KeyType,
    pub passphrase: Option<String>,

    /// Hex-encoded seed for deterministic generation
    pub seed: Option<String>,

    pub name: Option<String>,
    pub description: Option<String>,

    /// Register right after generation
    pub auto_register: bool,
}

/// Result of [`LifecycleManager::generate`]
#[derive(Debug, Clone, Serialize)]
pub struct GenerateOutcome {
    pub did: Did,
    pub document: Value,

    /// Seed the identity can be re-derived from
    pub seed: String,

    pub status: RecordStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub registration: Option<RegisterOutcome>,
}

/// Result of [`LifecycleManager::import`]
#[derive(Debug, Clone, Serialize)]
pub struct ImportOutcome {
    pub did: Did,
    pub status: RecordStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub registration: Option<RegisterOutcome>,
}

/// Result of [`LifecycleManager::register`]
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterOutcome {
    pub did: Did,
    pub published: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_host: Option<String>,
}

/// Result of [`LifecycleManager::rotate_key`]
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RotateOutcome {
    pub did: Did,
    pub old_key_id: String,
    pub new_key_id: String,
    pub status: RecordStatus,
}

/// Result of [`LifecycleManager::remove`]
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveOutcome {
    pub did: Did,
    pub removed_document: bool,
    pub removed_keys: bool,
    pub removed_metadata: bool,
    pub notes_cleared: bool,
}

/// Where [`LifecycleManager::info`] looks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InfoLocation {
    Local,
    Ledger,
    /// Local, then the ledger when not found locally
    Any,
    Both,
}

impl std::str::FromStr for InfoLocation {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(InfoLocation::Local),
            "ledger" => Ok(InfoLocation::Ledger),
            "any" => Ok(InfoLocation::Any),
            "both" => Ok(InfoLocation::Both),
            other => Err(StoreError::Configuration(format!(
                "unknown location '{}' (expected local, ledger, any or both)",
                other
            ))),
        }
    }
}

/// Outcome of looking an identifier up in one location
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InfoResult {
    /// `Local` or `Ledger`
    pub location: InfoLocation,
    pub did: Did,
    pub found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<RecordStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Notes>,
    /// Why the lookup failed, when it did
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl InfoResult {
    fn not_found(location: InfoLocation, did: &Did, started: Instant) -> Self {
        Self {
            location,
            did: did.clone(),
            found: false,
            status: None,
            document: None,
            metadata: None,
            error: None,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }

    fn failed(location: InfoLocation, did: &Did, started: Instant, err: &StoreError) -> Self {
        Self {
            error: Some(err.to_string()),
            ..Self::not_found(location, did, started)
        }
    }
}

/// Everything stored for one identifier
#[derive(Debug, Clone, Serialize)]
pub struct ExportedRecord {
    pub did: Did,
    pub status: RecordStatus,
    pub document: Value,
    pub keys: KeyMaterial,
    pub metadata: Notes,
}

// =============================================================================
// LIFECYCLE MANAGER
// =============================================================================

/// Drives identity records through generate / register / rotate / remove
pub struct LifecycleManager {
    config: StoreConfig,
    pending: Collection,
    registered: Collection,
    keys: Collection,
    meta: Collection,
    locks: LockService,
    notes: NotesStore,
    generator: Arc<dyn DocumentGenerator>,
    ledger: Option<Arc<dyn LedgerRegistrar>>,
}

impl LifecycleManager {
    /// Create a lifecycle manager
    ///
    /// The generator must produce identifiers of the configured method.
    pub fn new(
        config: StoreConfig,
        generator: Arc<dyn DocumentGenerator>,
        ledger: Option<Arc<dyn LedgerRegistrar>>,
    ) -> StoreResult<Self> {
        config.validate()?;

        if generator.method() != config.method {
            return Err(StoreError::Configuration(format!(
                "generator produces '{}' identifiers but the store is configured for '{}'",
                generator.method(),
                config.method
            )));
        }

        info!(
            root = ?config.root_dir,
            method = %config.method,
            mode = %config.mode,
            ledger = ledger.is_some(),
            "Lifecycle manager initialized"
        );

        Ok(Self {
            pending: Collection::documents(&config, RecordStatus::Pending),
            registered: Collection::documents(&config, RecordStatus::Registered),
            keys: Collection::keys(&config),
            meta: Collection::meta(&config),
            locks: LockService::from_config(&config),
            notes: NotesStore::from_config(&config),
            config,
            generator,
            ledger,
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn notes(&self) -> &NotesStore {
        &self.notes
    }

    /// Document collection of one status area
    pub fn documents(&self, status: RecordStatus) -> &Collection {
        match status {
            RecordStatus::Pending => &self.pending,
            RecordStatus::Registered => &self.registered,
        }
    }

    pub fn keys(&self) -> &Collection {
        &self.keys
    }

    pub fn meta(&self) -> &Collection {
        &self.meta
    }

    fn ledger(&self) -> StoreResult<&Arc<dyn LedgerRegistrar>> {
        self.ledger
            .as_ref()
            .ok_or_else(|| StoreError::Configuration("no ledger registrar configured".into()))
    }

    /// Current document and its status, Pending first
    pub async fn load_document(&self, did: &Did) -> StoreResult<Option<(RecordStatus, Value)>> {
        for status in RecordStatus::ALL {
            if let Some(document) = self.documents(status).get(did.as_str()).await? {
                return Ok(Some((status, document)));
            }
        }
        Ok(None)
    }

    // =========================================================================
    // GENERATE
    // =========================================================================

    /// Generate a new identity and store it as Pending
    ///
    /// With `auto_register`, the record is registered right away; a failed
    /// registration leaves the Pending record in place.
    pub async fn generate(&self, options: GenerateOptions) -> StoreResult<GenerateOutcome> {
        let request = GenerateRequest {
            key_type: options.key_type,
            passphrase: options.passphrase.clone(),
            seed: options.seed.clone(),
        };

        let identity = self
            .generator
            .generate(&request)
            .await
            .map_err(|e| e.in_operation(Operation::Generate, &format!("did:{}", self.config.method)))?;
        let did = identity.did.clone();

        let metadata = self.initial_metadata(&options)?;

        let guard = self.lock(&did, Operation::Generate).await?;
        let stored = self.store_generated(&did, &identity.document, &identity.keys, &metadata).await;
        release_after(guard, stored)
            .await
            .map_err(|e| e.in_operation(Operation::Generate, did.as_str()))?;

        info!(did = %did, "Generated identity");

        self.mirror_generated_notes(&did, &metadata)
            .await
            .map_err(|e| partial(Operation::Generate, &did, "record stored", e))?;

        let mut outcome = GenerateOutcome {
            did: did.clone(),
            document: identity.document,
            seed: identity.seed,
            status: RecordStatus::Pending,
            registration: None,
        };

        if options.auto_register {
            let registration = self.register(&did).await.map_err(|e| StoreError::Operation {
                operation: Operation::Generate,
                did: did.to_string(),
                source: Box::new(e),
            })?;
            outcome.status = RecordStatus::Registered;
            outcome.registration = Some(registration);
        }

        Ok(outcome)
    }

    fn initial_metadata(&self, options: &GenerateOptions) -> StoreResult<Notes> {
        let mut metadata = Notes::default();
        metadata.set_value(NOTE_CREATED, now())?;
        metadata.set_value(NOTE_LEDGER, self.config.ledger_label())?;
        metadata.set_value(NOTE_LEDGER_MODE, self.config.mode.clone())?;
        if let Some(name) = &options.name {
            metadata.set_value(NOTE_NAME, name.clone())?;
        }
        if let Some(description) = &options.description {
            metadata.set_value(NOTE_DESCRIPTION, description.clone())?;
        }
        Ok(metadata)
    }

    async fn store_generated(
        &self,
        did: &Did,
        document: &Value,
        keys: &KeyMaterial,
        metadata: &Notes,
    ) -> StoreResult<()> {
        if self.load_document(did).await?.is_some() || self.keys.contains(did.as_str()).await? {
            let key_id = keys.keys.keys().next().cloned().unwrap_or_else(|| did.to_string());
            return Err(StoreError::KeyCollision { key_id });
        }

        self.keys.put(did.as_str(), keys).await?;
        self.pending.put(did.as_str(), document).await?;
        self.meta.put(did.as_str(), metadata).await?;
        Ok(())
    }

    /// Record name/description and the automatic `created` note in the config
    async fn mirror_generated_notes(&self, did: &Did, metadata: &Notes) -> StoreResult<()> {
        let mut explicit = Notes::default();
        let mut automatic = Notes::default();
        for (property, values) in metadata.iter() {
            let target = match property {
                NOTE_NAME | NOTE_DESCRIPTION => &mut explicit,
                NOTE_CREATED => &mut automatic,
                _ => continue,
            };
            for value in values.iter() {
                target.add_value(property, value)?;
            }
        }

        self.notes.add_many(did, &explicit).await?;
        self.notes.add_auto(did, &automatic).await?;
        Ok(())
    }

    // =========================================================================
    // IMPORT
    // =========================================================================

    /// Store an existing document and its keys as a Pending record
    ///
    /// The identifier comes from the document's `id`. It must use the
    /// configured method, and every key must belong to it. An identifier
    /// that already has a document or keys fails with `KeyCollision`.
    pub async fn import(
        &self,
        document: Value,
        keys: KeyMaterial,
        auto_register: bool,
    ) -> StoreResult<ImportOutcome> {
        let did = document_did(&document).map_err(|e| e.in_operation(Operation::Import, "document"))?;
        self.check_import(&did, &keys)
            .map_err(|e| e.in_operation(Operation::Import, did.as_str()))?;

        let metadata = self.initial_metadata(&GenerateOptions::default())?;

        let guard = self.lock(&did, Operation::Import).await?;
        let stored = self.store_generated(&did, &document, &keys, &metadata).await;
        release_after(guard, stored)
            .await
            .map_err(|e| e.in_operation(Operation::Import, did.as_str()))?;

        info!(did = %did, keys = keys.keys.len(), "Imported identity");

        self.mirror_generated_notes(&did, &metadata)
            .await
            .map_err(|e| partial(Operation::Import, &did, "record stored", e))?;

        let mut outcome = ImportOutcome {
            did: did.clone(),
            status: RecordStatus::Pending,
            registration: None,
        };

        if auto_register {
            let registration = self.register(&did).await.map_err(|e| StoreError::Operation {
                operation: Operation::Import,
                did: did.to_string(),
                source: Box::new(e),
            })?;
            outcome.status = RecordStatus::Registered;
            outcome.registration = Some(registration);
        }

        Ok(outcome)
    }

    fn check_import(&self, did: &Did, keys: &KeyMaterial) -> StoreResult<()> {
        let invalid = |reason: String| StoreError::InvalidIdentifier {
            did: did.to_string(),
            reason,
        };

        if did.method() != self.config.method {
            return Err(invalid(format!(
                "method '{}' does not match the store's '{}'",
                did.method(),
                self.config.method
            )));
        }
        if keys.id != did.as_str() {
            return Err(invalid(format!("key material belongs to '{}'", keys.id)));
        }
        if keys.keys.is_empty() {
            return Err(invalid("no keys to import".into()));
        }
        for key_id in keys.keys.keys() {
            if Did::owner_of(key_id)? != *did {
                return Err(invalid(format!("key '{}' belongs to another identifier", key_id)));
            }
        }
        Ok(())
    }

    // =========================================================================
    // REGISTER
    // =========================================================================

    /// Publish a Pending record and move it to Registered
    ///
    /// A ledger failure leaves the record Pending. Failures after the
    /// ledger accepted the document are reported as `Partial`, naming the
    /// last step that completed.
    pub async fn register(&self, did: &Did) -> StoreResult<RegisterOutcome> {
        let ledger = self
            .ledger()
            .map_err(|e| e.in_operation(Operation::Register, did.as_str()))?;

        let guard = self.lock(did, Operation::Register).await?;
        let result = self.register_locked(did, ledger.as_ref()).await;
        release_after(guard, result)
            .await
            .map_err(|e| e.in_operation(Operation::Register, did.as_str()))
    }

    async fn register_locked(
        &self,
        did: &Did,
        ledger: &dyn LedgerRegistrar,
    ) -> StoreResult<RegisterOutcome> {
        let document: Value = self
            .pending
            .get(did.as_str())
            .await?
            .ok_or_else(|| StoreError::not_found(self.pending.name(), did.as_str()))?;
        let keys: KeyMaterial = self
            .keys
            .get(did.as_str())
            .await?
            .ok_or_else(|| StoreError::not_found(self.keys.name(), did.as_str()))?;

        ledger.register(&document, &keys).await?;
        info!(did = %did, "Ledger accepted registration");

        self.registered
            .put(did.as_str(), &document)
            .await
            .map_err(|e| partial(Operation::Register, did, "ledger registration", e))?;

        self.pending
            .remove(did.as_str())
            .await
            .map_err(|e| partial(Operation::Register, did, "registered copy stored", e))?;

        let published = now();
        let published_host = ledger.host();
        self.stamp_published(did, &published, published_host.as_deref())
            .await
            .map_err(|e| partial(Operation::Register, did, "pending copy removed", e))?;

        let mut ledger_note = Notes::default();
        ledger_note.set_value(NOTE_LEDGER, self.config.ledger_label())?;
        self.notes
            .add_auto(did, &ledger_note)
            .await
            .map_err(|e| partial(Operation::Register, did, "metadata stamped", e))?;

        info!(did = %did, host = ?published_host, "Registered identity");

        Ok(RegisterOutcome {
            did: did.clone(),
            published,
            published_host,
        })
    }

    async fn stamp_published(&self, did: &Did, published: &str, host: Option<&str>) -> StoreResult<()> {
        let mut metadata: Notes = self.meta.get(did.as_str()).await?.unwrap_or_default();
        metadata.set_value(NOTE_PUBLISHED, published)?;
        if let Some(host) = host {
            metadata.set_value(NOTE_PUBLISHED_HOST, host)?;
        }
        self.meta.put(did.as_str(), &metadata).await
    }

    // =========================================================================
    // ROTATE KEY
    // =========================================================================

    /// Replace key `key_id` with a freshly generated key
    ///
    /// For Registered records the ledger update must succeed before anything
    /// is written locally. A replacement id that is listed, stored or was
    /// used before fails with `KeyCollision`.
    pub async fn rotate_key(&self, key_id: &str, key_type: KeyType) -> StoreResult<RotateOutcome> {
        let owner = Did::owner_of(key_id).map_err(|e| e.in_operation(Operation::RotateKey, key_id))?;

        let guard = self.lock(&owner, Operation::RotateKey).await?;
        let result = self.rotate_locked(&owner, key_id, key_type).await;
        release_after(guard, result)
            .await
            .map_err(|e| e.in_operation(Operation::RotateKey, owner.as_str()))
    }

    async fn rotate_locked(
        &self,
        owner: &Did,
        key_id: &str,
        key_type: KeyType,
    ) -> StoreResult<RotateOutcome> {
        let (status, mut document) = self
            .load_document(owner)
            .await?
            .ok_or_else(|| StoreError::not_found("documents", owner.as_str()))?;
        let mut keys: KeyMaterial = self
            .keys
            .get(owner.as_str())
            .await?
            .ok_or_else(|| StoreError::not_found(self.keys.name(), owner.as_str()))?;

        if !references_key(&document, key_id) {
            return Err(StoreError::not_found("verificationMethod", key_id));
        }

        let ledger = match status {
            RecordStatus::Registered => Some(self.ledger()?),
            RecordStatus::Pending => None,
        };

        let new_key = self.generator.generate_key(owner, key_type).await?;
        if Did::owner_of(&new_key.id)? != *owner {
            return Err(StoreError::Generator(format!(
                "generated key '{}' does not belong to '{}'",
                new_key.id, owner
            )));
        }
        if references_key(&document, &new_key.id) || keys.knows(&new_key.id) {
            return Err(StoreError::KeyCollision {
                key_id: new_key.id,
            });
        }

        let new_key_id = new_key.id.clone();
        replace_key(&mut document, key_id, &new_key)?;
        keys.rotate(key_id, new_key);

        if let Some(ledger) = ledger {
            ledger.update(&document, &keys).await?;
            debug!(did = %owner, "Ledger accepted key rotation");
        }

        let completed = match status {
            RecordStatus::Registered => "ledger update",
            RecordStatus::Pending => "key generated",
        };
        self.documents(status)
            .put(owner.as_str(), &document)
            .await
            .map_err(|e| partial(Operation::RotateKey, owner, completed, e))?;
        self.keys
            .put(owner.as_str(), &keys)
            .await
            .map_err(|e| partial(Operation::RotateKey, owner, "document stored", e))?;

        info!(
            did = %owner,
            old_key = %key_id,
            new_key = %new_key_id,
            status = %status,
            "Rotated key"
        );

        Ok(RotateOutcome {
            did: owner.clone(),
            old_key_id: key_id.to_string(),
            new_key_id,
            status,
        })
    }

    // =========================================================================
    // REMOVE
    // =========================================================================

    /// Delete a Pending record: document, keys, metadata and notes
    ///
    /// Published records fail with `PublishedRecord` and are left untouched.
    pub async fn remove(&self, did: &Did) -> StoreResult<RemoveOutcome> {
        let guard = self.lock(did, Operation::Remove).await?;
        let result = self.remove_locked(did).await;
        release_after(guard, result)
            .await
            .map_err(|e| e.in_operation(Operation::Remove, did.as_str()))
    }

    async fn remove_locked(&self, did: &Did) -> StoreResult<RemoveOutcome> {
        let metadata: Option<Notes> = self.meta.get(did.as_str()).await?;
        let published = metadata
            .as_ref()
            .is_some_and(|m| m.contains_property(NOTE_PUBLISHED));

        if published || self.registered.contains(did.as_str()).await? {
            warn!(did = %did, "Refusing to remove published record");
            return Err(StoreError::PublishedRecord(did.to_string()));
        }

        let removed_document = self.pending.remove(did.as_str()).await?;
        let removed_keys = self
            .keys
            .remove(did.as_str())
            .await
            .map_err(|e| partial(Operation::Remove, did, "document removed", e))?;
        let removed_metadata = self
            .meta
            .remove(did.as_str())
            .await
            .map_err(|e| partial(Operation::Remove, did, "keys removed", e))?;

        if !(removed_document || removed_keys || removed_metadata) {
            return Err(StoreError::not_found(self.pending.name(), did.as_str()));
        }

        let notes_cleared = self
            .notes
            .clear(did)
            .await
            .map_err(|e| partial(Operation::Remove, did, "metadata removed", e))?;

        info!(did = %did, "Removed identity");

        Ok(RemoveOutcome {
            did: did.clone(),
            removed_document,
            removed_keys,
            removed_metadata,
            notes_cleared,
        })
    }

    // =========================================================================
    // INFO / EXPORT
    // =========================================================================

    /// Look an identifier up locally and/or on the ledger
    ///
    /// Absence and unreadable records are reported in the results, never
    /// as an error.
    pub async fn info(&self, did: &Did, location: InfoLocation) -> Vec<InfoResult> {
        let mut results = Vec::new();

        if matches!(location, InfoLocation::Local | InfoLocation::Any | InfoLocation::Both) {
            results.push(self.local_info(did).await);
        }

        let query_ledger = match location {
            InfoLocation::Ledger | InfoLocation::Both => true,
            InfoLocation::Any => !results.iter().any(|r| r.found) && self.ledger.is_some(),
            InfoLocation::Local => false,
        };
        if query_ledger {
            results.push(self.ledger_info(did).await);
        }

        results
    }

    async fn local_info(&self, did: &Did) -> InfoResult {
        let started = Instant::now();

        match self.load_document(did).await {
            Ok(Some((status, document))) => {
                let metadata = match self.meta.get::<Notes>(did.as_str()).await {
                    Ok(metadata) => metadata,
                    Err(e) => {
                        warn!(did = %did, error = %e, "Unreadable metadata");
                        None
                    }
                };
                InfoResult {
                    location: InfoLocation::Local,
                    did: did.clone(),
                    found: true,
                    status: Some(status),
                    document: Some(document),
                    metadata,
                    error: None,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                }
            }
            Ok(None) => InfoResult::not_found(InfoLocation::Local, did, started),
            Err(e) => {
                warn!(did = %did, error = %e, category = e.category(), "Local lookup failed");
                InfoResult::failed(InfoLocation::Local, did, started, &e)
            }
        }
    }

    async fn ledger_info(&self, did: &Did) -> InfoResult {
        let started = Instant::now();

        let ledger = match self.ledger() {
            Ok(ledger) => ledger,
            Err(e) => return InfoResult::failed(InfoLocation::Ledger, did, started, &e),
        };

        match ledger.get(did).await {
            Ok(Some(document)) => InfoResult {
                location: InfoLocation::Ledger,
                did: did.clone(),
                found: true,
                status: Some(RecordStatus::Registered),
                document: Some(document),
                metadata: None,
                error: None,
                elapsed_ms: started.elapsed().as_millis() as u64,
            },
            Ok(None) => InfoResult::not_found(InfoLocation::Ledger, did, started),
            Err(e) => {
                warn!(did = %did, error = %e, "Ledger lookup failed");
                InfoResult::failed(InfoLocation::Ledger, did, started, &e)
            }
        }
    }

    /// Document, key material and metadata of one identifier
    pub async fn export(&self, did: &Did) -> StoreResult<ExportedRecord> {
        let guard = self.lock(did, Operation::Export).await?;
        let result = self.export_locked(did).await;
        release_after(guard, result)
            .await
            .map_err(|e| e.in_operation(Operation::Export, did.as_str()))
    }

    async fn export_locked(&self, did: &Did) -> StoreResult<ExportedRecord> {
        let (status, document) = self
            .load_document(did)
            .await?
            .ok_or_else(|| StoreError::not_found("documents", did.as_str()))?;
        let keys = self
            .keys
            .get(did.as_str())
            .await?
            .ok_or_else(|| StoreError::not_found(self.keys.name(), did.as_str()))?;
        let metadata = self.meta.get(did.as_str()).await?.unwrap_or_default();

        Ok(ExportedRecord {
            did: did.clone(),
            status,
            document,
            keys,
            metadata,
        })
    }

    async fn lock(&self, did: &Did, operation: Operation) -> StoreResult<LockGuard> {
        self.locks
            .acquire(did.as_str())
            .await
            .map_err(|e| e.in_operation(operation, did.as_str()))
    }
}

// =============================================================================
// HELPERS
// =============================================================================

/// Release `guard`, preferring the operation's error over a release error
async fn release_after<T>(guard: LockGuard, result: StoreResult<T>) -> StoreResult<T> {
    let released = guard.release().await;
    let value = result?;
    released?;
    Ok(value)
}

fn partial(operation: Operation, did: &Did, completed: &'static str, source: StoreError) -> StoreError {
    warn!(
        did = %did,
        operation = %operation,
        completed,
        error = %source,
        "Operation partially applied"
    );
    StoreError::Partial {
        operation,
        did: did.to_string(),
        completed,
        source: Box::new(source),
    }
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::{Ed25519Generator, GeneratedIdentity};
    use crate::ledger::MemoryLedger;
    use crate::notes::{NotesRequest, NotesScope};
    use async_trait::async_trait;
    use serde_json::json;
    use shared::config::LockConfig;
    use shared::types::ExportedKey;
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    const ABC: &str = "did:example:abc";

    /// Generator always producing `did:example:abc` with `#key-<n>` keys
    struct FixedGenerator {
        next_key: AtomicU32,
        repeat_key: bool,
    }

    impl FixedGenerator {
        fn new() -> Self {
            Self {
                next_key: AtomicU32::new(2),
                repeat_key: false,
            }
        }

        fn repeating() -> Self {
            Self {
                repeat_key: true,
                ..Self::new()
            }
        }

        fn key(owner: &str, n: u32) -> ExportedKey {
            ExportedKey {
                id: format!("{}#key-{}", owner, n),
                key_type: VERIFICATION_KEY_TYPE_ED25519.into(),
                controller: owner.into(),
                public_key_hex: format!("{:064x}", n),
                private_key_hex: Some(format!("{:064x}", n + 1000)),
            }
        }
    }

    #[async_trait]
    impl DocumentGenerator for FixedGenerator {
        fn method(&self) -> &str {
            "example"
        }

        async fn generate(&self, _request: &GenerateRequest) -> StoreResult<GeneratedIdentity> {
            let key = Self::key(ABC, 1);
            let document = json!({
                "@context": [DID_CONTEXT_V1],
                "id": ABC,
                "verificationMethod": [crate::document::verification_method(&key)],
                "authentication": [key.id],
                "capabilityInvocation": [key.id],
            });
            Ok(GeneratedIdentity {
                did: Did::parse(ABC)?,
                document,
                keys: KeyMaterial::new(ABC, [key]),
                seed: "00".repeat(32),
            })
        }

        async fn generate_key(&self, owner: &Did, _key_type: KeyType) -> StoreResult<ExportedKey> {
            let n = if self.repeat_key {
                1
            } else {
                self.next_key.fetch_add(1, Ordering::SeqCst)
            };
            Ok(Self::key(owner.as_str(), n))
        }
    }

    /// Ledger that takes `delay` to accept a registration
    struct SlowLedger {
        inner: MemoryLedger,
        delay: Duration,
    }

    #[async_trait]
    impl LedgerRegistrar for SlowLedger {
        fn host(&self) -> Option<String> {
            self.inner.host()
        }

        async fn register(&self, document: &Value, keys: &KeyMaterial) -> StoreResult<()> {
            tokio::time::sleep(self.delay).await;
            self.inner.register(document, keys).await
        }

        async fn update(&self, document: &Value, keys: &KeyMaterial) -> StoreResult<()> {
            self.inner.update(document, keys).await
        }

        async fn get(&self, did: &Did) -> StoreResult<Option<Value>> {
            self.inner.get(did).await
        }
    }

    struct Fixture {
        _dir: TempDir,
        manager: LifecycleManager,
        ledger: Arc<MemoryLedger>,
    }

    fn config(root: &Path) -> StoreConfig {
        let mut config = StoreConfig::with_root(root);
        config.lock = LockConfig {
            retries: 200,
            retry_delay_ms: 5,
        };
        config
    }

    fn fixture_with(generator: Arc<dyn DocumentGenerator>) -> Fixture {
        let dir = tempdir().unwrap();
        let ledger = Arc::new(MemoryLedger::with_host("ledger.example.com"));
        let manager = LifecycleManager::new(
            config(dir.path()),
            generator,
            Some(ledger.clone() as Arc<dyn LedgerRegistrar>),
        )
        .unwrap();
        Fixture {
            _dir: dir,
            manager,
            ledger,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(FixedGenerator::new()))
    }

    fn abc() -> Did {
        Did::parse(ABC).unwrap()
    }

    async fn generate(manager: &LifecycleManager) -> GenerateOutcome {
        manager
            .generate(GenerateOptions {
                name: Some("Alice".into()),
                description: Some("test identity".into()),
                ..Default::default()
            })
            .await
            .unwrap()
    }

    /// Snapshot of every file under the store root except locks
    fn snapshot(root: &Path) -> Vec<(String, Vec<u8>)> {
        let mut files = Vec::new();
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            for entry in std::fs::read_dir(&dir).unwrap() {
                let path = entry.unwrap().path();
                if path.ends_with(LOCKS_DIR) {
                    continue;
                }
                if path.is_dir() {
                    stack.push(path);
                } else {
                    files.push((path.display().to_string(), std::fs::read(&path).unwrap()));
                }
            }
        }
        files.sort();
        files
    }

    #[test]
    fn test_generator_method_must_match_config() {
        let dir = tempdir().unwrap();
        let result = LifecycleManager::new(
            config(dir.path()),
            Arc::new(Ed25519Generator::new("other")),
            None,
        );
        assert!(matches!(result, Err(StoreError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_generate_stores_pending_record() {
        let f = fixture();
        let outcome = generate(&f.manager).await;

        assert_eq!(outcome.did.as_str(), ABC);
        assert_eq!(outcome.status, RecordStatus::Pending);
        assert!(outcome.registration.is_none());

        let pending = f.manager.documents(RecordStatus::Pending);
        assert!(pending.contains(ABC).await.unwrap());
        assert!(f.manager.keys().contains(ABC).await.unwrap());

        let metadata: Notes = f.manager.meta().get(ABC).await.unwrap().unwrap();
        assert!(metadata.contains_property(NOTE_CREATED));
        assert!(metadata.has_value(NOTE_LEDGER, "example:test"));
        assert!(metadata.has_value(NOTE_LEDGER_MODE, "test"));
        assert!(metadata.has_value(NOTE_NAME, "Alice"));

        let notes = f.manager.notes().get(&abc()).await.unwrap().unwrap();
        assert!(notes.has_value(NOTE_NAME, "Alice"));
        assert!(notes.has_value(NOTE_DESCRIPTION, "test identity"));
        assert!(notes.contains_property(NOTE_CREATED));
        assert!(!notes.contains_property(NOTE_LEDGER));
    }

    #[tokio::test]
    async fn test_generate_twice_collides() {
        let f = fixture();
        generate(&f.manager).await;

        let result = f.manager.generate(GenerateOptions::default()).await;
        assert!(matches!(
            result.unwrap_err().root(),
            StoreError::KeyCollision { .. }
        ));
    }

    // Scenario A
    #[tokio::test]
    async fn test_info_after_generate_reports_pending() {
        let f = fixture();
        generate(&f.manager).await;

        let results = f.manager.info(&abc(), InfoLocation::Local).await;

        assert_eq!(results.len(), 1);
        assert!(results[0].found);
        assert_eq!(results[0].status, Some(RecordStatus::Pending));
        assert_eq!(results[0].document.as_ref().unwrap()["id"], ABC);
    }

    // Scenario B + P3
    #[tokio::test]
    async fn test_register_moves_record_to_registered() {
        let f = fixture();
        generate(&f.manager).await;

        let outcome = f.manager.register(&abc()).await.unwrap();
        assert_eq!(outcome.published_host.as_deref(), Some("ledger.example.com"));

        assert!(!f.manager.documents(RecordStatus::Pending).contains(ABC).await.unwrap());
        assert!(f.manager.documents(RecordStatus::Registered).contains(ABC).await.unwrap());
        assert!(f.ledger.document(ABC).is_some());

        let results = f.manager.info(&abc(), InfoLocation::Local).await;
        assert_eq!(results[0].status, Some(RecordStatus::Registered));
        let metadata = results[0].metadata.as_ref().unwrap();
        assert!(metadata.contains_property(NOTE_PUBLISHED));
        assert!(metadata.has_value(NOTE_PUBLISHED_HOST, "ledger.example.com"));

        let notes = f.manager.notes().get(&abc()).await.unwrap().unwrap();
        assert!(notes.has_value(NOTE_LEDGER, "example:test"));
    }

    #[tokio::test]
    async fn test_register_requires_pending_record() {
        let f = fixture();

        let err = f.manager.register(&abc()).await.unwrap_err();
        assert!(matches!(err.root(), StoreError::NotFound { .. }));
        assert!(err.to_string().contains("register"));
        assert!(err.to_string().contains(ABC));

        generate(&f.manager).await;
        f.manager.register(&abc()).await.unwrap();

        let err = f.manager.register(&abc()).await.unwrap_err();
        assert!(matches!(err.root(), StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_ledger_failure_keeps_record_pending() {
        let f = fixture();
        generate(&f.manager).await;
        f.ledger.fail_with("ledger offline");

        let err = f.manager.register(&abc()).await.unwrap_err();

        match &err {
            StoreError::Operation { operation, did, source } => {
                assert_eq!(*operation, Operation::Register);
                assert_eq!(did, ABC);
                assert!(matches!(**source, StoreError::Ledger { .. }));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.is_retryable());
        assert!(f.manager.documents(RecordStatus::Pending).contains(ABC).await.unwrap());
        assert!(!f.manager.documents(RecordStatus::Registered).contains(ABC).await.unwrap());

        let metadata: Notes = f.manager.meta().get(ABC).await.unwrap().unwrap();
        assert!(!metadata.contains_property(NOTE_PUBLISHED));
    }

    #[tokio::test]
    async fn test_local_failure_after_ledger_is_partial() {
        let f = fixture();
        generate(&f.manager).await;

        // A plain file where the registered area should be
        let registered_dir = f.manager.config().documents_dir(RecordStatus::Registered);
        std::fs::write(&registered_dir, b"in the way").unwrap();

        let err = f.manager.register(&abc()).await.unwrap_err();

        match &err {
            StoreError::Partial { operation, completed, .. } => {
                assert_eq!(*operation, Operation::Register);
                assert_eq!(*completed, "ledger registration");
            }
            other => panic!("expected Partial, got {other:?}"),
        }
        assert!(f.ledger.document(ABC).is_some());
        assert!(f.manager.documents(RecordStatus::Pending).contains(ABC).await.unwrap());
    }

    #[tokio::test]
    async fn test_register_without_ledger_is_configuration_error() {
        let dir = tempdir().unwrap();
        let manager =
            LifecycleManager::new(config(dir.path()), Arc::new(FixedGenerator::new()), None).unwrap();
        generate(&manager).await;

        let err = manager.register(&abc()).await.unwrap_err();
        assert!(matches!(err.root(), StoreError::Configuration(_)));
        assert!(manager.documents(RecordStatus::Pending).contains(ABC).await.unwrap());
    }

    #[tokio::test]
    async fn test_auto_register_matches_generate_then_register() {
        let manual = fixture();
        generate(&manual.manager).await;
        manual.manager.register(&abc()).await.unwrap();

        let auto = fixture();
        let outcome = auto
            .manager
            .generate(GenerateOptions {
                name: Some("Alice".into()),
                description: Some("test identity".into()),
                auto_register: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(outcome.status, RecordStatus::Registered);
        assert!(outcome.registration.is_some());

        for f in [&manual, &auto] {
            assert!(!f.manager.documents(RecordStatus::Pending).contains(ABC).await.unwrap());
            let registered: Value = f
                .manager
                .documents(RecordStatus::Registered)
                .get(ABC)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(registered, outcome.document);

            let metadata: Notes = f.manager.meta().get(ABC).await.unwrap().unwrap();
            let properties: Vec<&str> = metadata.iter().map(|(p, _)| p).collect();
            assert_eq!(
                properties,
                vec!["created", "description", "ledger", "ledgerMode", "name", "published", "publishedHost"]
            );
        }
    }

    #[tokio::test]
    async fn test_failed_auto_register_names_generate() {
        let f = fixture();
        f.ledger.fail_with("ledger offline");

        let err = f
            .manager
            .generate(GenerateOptions {
                auto_register: true,
                ..Default::default()
            })
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            StoreError::Operation {
                operation: Operation::Generate,
                ..
            }
        ));
        assert!(matches!(err.root(), StoreError::Ledger { .. }));
        assert!(f.manager.documents(RecordStatus::Pending).contains(ABC).await.unwrap());
    }

    // P4 + Scenario C
    #[tokio::test]
    async fn test_remove_published_record_is_refused() {
        let f = fixture();
        generate(&f.manager).await;
        f.manager.register(&abc()).await.unwrap();

        let before = snapshot(f.manager.config().root_dir.as_path());
        let err = f.manager.remove(&abc()).await.unwrap_err();
        let after = snapshot(f.manager.config().root_dir.as_path());

        assert!(matches!(err.root(), StoreError::PublishedRecord(_)));
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_remove_checks_published_metadata() {
        let f = fixture();
        generate(&f.manager).await;

        let mut metadata: Notes = f.manager.meta().get(ABC).await.unwrap().unwrap();
        metadata.set_value(NOTE_PUBLISHED, "2024-01-01T00:00:00.000Z").unwrap();
        f.manager.meta().put(ABC, &metadata).await.unwrap();

        let err = f.manager.remove(&abc()).await.unwrap_err();
        assert!(matches!(err.root(), StoreError::PublishedRecord(_)));
        assert!(f.manager.documents(RecordStatus::Pending).contains(ABC).await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_pending_record() {
        let f = fixture();
        generate(&f.manager).await;

        let outcome = f.manager.remove(&abc()).await.unwrap();
        assert!(outcome.removed_document && outcome.removed_keys && outcome.removed_metadata);
        assert!(outcome.notes_cleared);

        assert!(!f.manager.documents(RecordStatus::Pending).contains(ABC).await.unwrap());
        assert!(!f.manager.keys().contains(ABC).await.unwrap());
        assert!(!f.manager.meta().contains(ABC).await.unwrap());
        assert!(f.manager.notes().get(&abc()).await.unwrap().is_none());

        let err = f.manager.remove(&abc()).await.unwrap_err();
        assert!(matches!(err.root(), StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_slow_registration_keeps_lock_against_remove() {
        let dir = tempdir().unwrap();
        let mut config = config(dir.path());
        config.lock.retries = 1000;

        let slow = Arc::new(SlowLedger {
            inner: MemoryLedger::with_host("ledger.example.com"),
            delay: Duration::from_millis(1500),
        });
        let registrar = LifecycleManager::new(
            config.clone(),
            Arc::new(FixedGenerator::new()),
            Some(slow.clone() as Arc<dyn LedgerRegistrar>),
        )
        .unwrap();
        // A second manager on the same root, as another process would have
        let remover = LifecycleManager::new(config, Arc::new(FixedGenerator::new()), None).unwrap();
        generate(&registrar).await;

        let did = abc();
        let (registered, removed) = tokio::join!(registrar.register(&did), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            remover.remove(&abc()).await
        });

        registered.unwrap();
        assert!(matches!(removed.unwrap_err().root(), StoreError::PublishedRecord(_)));
        assert!(slow.inner.document(ABC).is_some());
        assert!(registrar.documents(RecordStatus::Registered).contains(ABC).await.unwrap());
        assert!(registrar.keys().contains(ABC).await.unwrap());
        assert!(registrar.meta().contains(ABC).await.unwrap());
    }

    #[tokio::test]
    async fn test_import_exported_record() {
        let source = fixture();
        generate(&source.manager).await;
        let record = source.manager.export(&abc()).await.unwrap();

        let f = fixture();
        let outcome = f
            .manager
            .import(record.document.clone(), record.keys.clone(), false)
            .await
            .unwrap();
        assert_eq!(outcome.did.as_str(), ABC);
        assert_eq!(outcome.status, RecordStatus::Pending);
        assert!(outcome.registration.is_none());

        let document: Value = f
            .manager
            .documents(RecordStatus::Pending)
            .get(ABC)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(document, record.document);
        let keys: KeyMaterial = f.manager.keys().get(ABC).await.unwrap().unwrap();
        assert_eq!(keys, record.keys);

        let metadata: Notes = f.manager.meta().get(ABC).await.unwrap().unwrap();
        assert!(metadata.contains_property(NOTE_CREATED));
        assert!(metadata.has_value(NOTE_LEDGER, "example:test"));
        let notes = f.manager.notes().get(&abc()).await.unwrap().unwrap();
        assert!(notes.contains_property(NOTE_CREATED));

        // Imported records go through the normal lifecycle
        f.manager.register(&abc()).await.unwrap();
        assert!(f.ledger.document(ABC).is_some());
    }

    #[tokio::test]
    async fn test_import_existing_record_collides() {
        let f = fixture();
        let generated = generate(&f.manager).await;
        let record = f.manager.export(&abc()).await.unwrap();

        let before = snapshot(f.manager.config().root_dir.as_path());
        let err = f
            .manager
            .import(generated.document, record.keys, false)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            StoreError::Operation {
                operation: Operation::Import,
                ..
            }
        ));
        assert!(matches!(err.root(), StoreError::KeyCollision { .. }));
        assert_eq!(before, snapshot(f.manager.config().root_dir.as_path()));
    }

    #[tokio::test]
    async fn test_import_with_auto_register() {
        let source = fixture();
        generate(&source.manager).await;
        let record = source.manager.export(&abc()).await.unwrap();

        let f = fixture();
        let outcome = f
            .manager
            .import(record.document, record.keys, true)
            .await
            .unwrap();

        assert_eq!(outcome.status, RecordStatus::Registered);
        assert!(outcome.registration.is_some());
        assert!(f.ledger.document(ABC).is_some());
        assert!(!f.manager.documents(RecordStatus::Pending).contains(ABC).await.unwrap());
    }

    #[tokio::test]
    async fn test_import_rejects_mismatched_material() {
        let f = fixture();
        let key = FixedGenerator::key(ABC, 1);
        let document = json!({"id": ABC});

        let foreign = KeyMaterial::new("did:example:other", [key.clone()]);
        let err = f.manager.import(document.clone(), foreign, false).await.unwrap_err();
        assert!(matches!(err.root(), StoreError::InvalidIdentifier { .. }));

        let stray = KeyMaterial::new(ABC, [FixedGenerator::key("did:example:other", 1)]);
        let err = f.manager.import(document.clone(), stray, false).await.unwrap_err();
        assert!(matches!(err.root(), StoreError::InvalidIdentifier { .. }));

        let other_method = json!({"id": "did:other:abc"});
        let keys = KeyMaterial::new("did:other:abc", [FixedGenerator::key("did:other:abc", 1)]);
        let err = f.manager.import(other_method, keys, false).await.unwrap_err();
        assert!(matches!(err.root(), StoreError::InvalidIdentifier { .. }));

        let err = f
            .manager
            .import(json!({"name": "no id"}), KeyMaterial::new(ABC, [key]), false)
            .await
            .unwrap_err();
        assert!(matches!(err.root(), StoreError::InvalidIdentifier { .. }));

        assert!(!f.manager.keys().contains(ABC).await.unwrap());
    }

    #[tokio::test]
    async fn test_rotate_pending_key() {
        let f = fixture();
        generate(&f.manager).await;

        let outcome = f
            .manager
            .rotate_key("did:example:abc#key-1", KeyType::Ed25519)
            .await
            .unwrap();
        assert_eq!(outcome.new_key_id, "did:example:abc#key-2");
        assert_eq!(outcome.status, RecordStatus::Pending);
        assert_eq!(f.ledger.update_count(), 0);

        let document: Value = f
            .manager
            .documents(RecordStatus::Pending)
            .get(ABC)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(document["verificationMethod"][0]["id"], "did:example:abc#key-2");
        assert_eq!(document["authentication"], json!(["did:example:abc#key-2"]));

        let keys: KeyMaterial = f.manager.keys().get(ABC).await.unwrap().unwrap();
        assert_eq!(keys.keys.len(), 1);
        assert!(keys.keys.contains_key("did:example:abc#key-2"));
        assert_eq!(keys.retired, vec!["did:example:abc#key-1".to_string()]);
    }

    #[tokio::test]
    async fn test_rotate_registered_key_updates_ledger_first() {
        let f = fixture();
        generate(&f.manager).await;
        f.manager.register(&abc()).await.unwrap();

        f.ledger.fail_with("ledger offline");
        let before = snapshot(f.manager.config().root_dir.as_path());
        let err = f
            .manager
            .rotate_key("did:example:abc#key-1", KeyType::Ed25519)
            .await
            .unwrap_err();
        assert!(matches!(err.root(), StoreError::Ledger { .. }));
        assert_eq!(before, snapshot(f.manager.config().root_dir.as_path()));

        f.ledger.succeed();
        let outcome = f
            .manager
            .rotate_key("did:example:abc#key-1", KeyType::Ed25519)
            .await
            .unwrap();
        assert_eq!(outcome.status, RecordStatus::Registered);
        assert_eq!(f.ledger.update_count(), 1);

        let published = f.ledger.document(ABC).unwrap();
        let local: Value = f
            .manager
            .documents(RecordStatus::Registered)
            .get(ABC)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(published, local);
        assert_eq!(local["verificationMethod"][0]["id"], outcome.new_key_id);
    }

    #[tokio::test]
    async fn test_rotate_collision_is_fatal() {
        let f = fixture_with(Arc::new(FixedGenerator::repeating()));
        generate(&f.manager).await;

        let before = snapshot(f.manager.config().root_dir.as_path());
        let err = f
            .manager
            .rotate_key("did:example:abc#key-1", KeyType::Ed25519)
            .await
            .unwrap_err();

        assert!(matches!(err.root(), StoreError::KeyCollision { .. }));
        assert!(err.root().to_string().contains("already exists"));
        assert_eq!(before, snapshot(f.manager.config().root_dir.as_path()));
    }

    #[tokio::test]
    async fn test_rotate_unknown_key_or_owner() {
        let f = fixture();
        generate(&f.manager).await;

        let err = f
            .manager
            .rotate_key("did:example:abc#nope", KeyType::Ed25519)
            .await
            .unwrap_err();
        assert!(matches!(err.root(), StoreError::NotFound { .. }));

        let err = f
            .manager
            .rotate_key("did:example:other#key-1", KeyType::Ed25519)
            .await
            .unwrap_err();
        assert!(matches!(err.root(), StoreError::NotFound { .. }));

        let err = f
            .manager
            .rotate_key("not-a-did#key-1", KeyType::Ed25519)
            .await
            .unwrap_err();
        assert!(matches!(err.root(), StoreError::InvalidIdentifier { .. }));
    }

    // P7
    #[tokio::test]
    async fn test_concurrent_rotations_do_not_interleave() {
        let f = fixture();
        generate(&f.manager).await;

        let (a, b) = tokio::join!(
            f.manager.rotate_key("did:example:abc#key-1", KeyType::Ed25519),
            f.manager.rotate_key("did:example:abc#key-1", KeyType::Ed25519),
        );

        // The second rotation sees the first one's result: key-1 is gone
        let (winner, loser) = match (a, b) {
            (Ok(winner), Err(loser)) | (Err(loser), Ok(winner)) => (winner, loser),
            other => panic!("expected exactly one rotation to succeed: {other:?}"),
        };
        assert!(matches!(loser.root(), StoreError::NotFound { .. }));

        let keys: KeyMaterial = f.manager.keys().get(ABC).await.unwrap().unwrap();
        assert_eq!(keys.keys.len(), 1);
        assert!(keys.keys.contains_key(&winner.new_key_id));
        assert_eq!(keys.retired, vec!["did:example:abc#key-1".to_string()]);

        let document: Value = f
            .manager
            .documents(RecordStatus::Pending)
            .get(ABC)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(document["verificationMethod"].as_array().unwrap().len(), 1);
        assert_eq!(document["verificationMethod"][0]["id"], winner.new_key_id);
    }

    #[tokio::test]
    async fn test_sequential_rotations_never_reuse_ids() {
        let f = fixture();
        generate(&f.manager).await;

        let first = f
            .manager
            .rotate_key("did:example:abc#key-1", KeyType::Ed25519)
            .await
            .unwrap();
        let second = f
            .manager
            .rotate_key(&first.new_key_id, KeyType::Ed25519)
            .await
            .unwrap();

        assert_ne!(first.new_key_id, second.new_key_id);
        let keys: KeyMaterial = f.manager.keys().get(ABC).await.unwrap().unwrap();
        assert_eq!(keys.retired.len(), 2);
    }

    #[tokio::test]
    async fn test_info_locations() {
        let f = fixture();

        let results = f.manager.info(&abc(), InfoLocation::Any).await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| !r.found));

        generate(&f.manager).await;
        let results = f.manager.info(&abc(), InfoLocation::Any).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].location, InfoLocation::Local);

        let results = f.manager.info(&abc(), InfoLocation::Both).await;
        assert_eq!(results.len(), 2);
        assert!(results[0].found);
        assert!(!results[1].found);

        f.manager.register(&abc()).await.unwrap();
        let results = f.manager.info(&abc(), InfoLocation::Ledger).await;
        assert_eq!(results.len(), 1);
        assert!(results[0].found);
        assert_eq!(results[0].location, InfoLocation::Ledger);

        f.ledger.fail_with("ledger offline");
        let results = f.manager.info(&abc(), InfoLocation::Ledger).await;
        assert!(!results[0].found);
        assert!(results[0].error.as_ref().unwrap().contains("ledger offline"));
    }

    #[tokio::test]
    async fn test_info_reports_corrupt_local_record() {
        let f = fixture();
        let pending = f.manager.documents(RecordStatus::Pending);
        pending.put(ABC, &json!({"id": ABC})).await.unwrap();
        std::fs::write(pending.path_for(ABC), b"{ corrupt").unwrap();

        let results = f.manager.info(&abc(), InfoLocation::Local).await;

        assert!(!results[0].found);
        assert!(results[0].error.is_some());
    }

    #[tokio::test]
    async fn test_export_includes_keys_and_metadata() {
        let f = fixture();
        generate(&f.manager).await;

        let record = f.manager.export(&abc()).await.unwrap();
        assert_eq!(record.status, RecordStatus::Pending);
        assert!(record.keys.keys.contains_key("did:example:abc#key-1"));
        assert!(record.metadata.has_value(NOTE_NAME, "Alice"));

        let err = f
            .manager
            .export(&Did::parse("did:example:missing").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err.root(), StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_generate_with_reference_generator() {
        let dir = tempdir().unwrap();
        let manager = LifecycleManager::new(
            config(dir.path()),
            Arc::new(Ed25519Generator::new("example")),
            None,
        )
        .unwrap();

        let outcome = manager.generate(GenerateOptions::default()).await.unwrap();
        let key_id = crate::document::verification_method_ids(&outcome.document)
            .pop()
            .unwrap();

        let rotated = manager.rotate_key(&key_id, KeyType::Ed25519).await.unwrap();
        assert_ne!(rotated.new_key_id, key_id);

        let mut request = NotesRequest::new(NotesScope::Identifier(outcome.did.clone()));
        request.get = Some(NOTE_CREATED.into());
        let reports = manager.notes().apply(&request).await.unwrap();
        assert!(reports[0].get.is_some());
    }
}
