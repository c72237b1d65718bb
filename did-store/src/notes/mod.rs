//! # Versioned Config/Notes Store
//!
//! A single JSON-LD document (`config.jsonld`) holds the schema version,
//! the list of automatically recorded notes and a map from identifier to
//! its notes:
//!
//! ```json
//! {
//!   "@context": [{ ... }],
//!   "urn:did-client:config:version": "1",
//!   "urn:did-client:notes:auto": ["created", "ledger"],
//!   "dids": { "did:example:abc": { "name": "Alice" } }
//! }
//! ```
//!
//! [`ConfigStore`] loads and stores the file (one-generation `.old`
//! backup before every write), [`ConfigDocument`] is the in-memory form
//! with the notes mutations, and [`NotesStore`] runs read-modify-write
//! cycles under the shared config lock.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use shared::{
    config::StoreConfig,
    constants::*,
    error::{StoreError, StoreResult},
    types::{Did, NoteValues, Notes},
};

use crate::collection::{io_error, write_atomic};
use crate::lock::LockService;

// =============================================================================
// CONFIG DOCUMENT
// =============================================================================

/// In-memory form of `config.jsonld`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigDocument {
    #[serde(rename = "@context", default = "notes_context")]
    pub context: Value,

    /// Schema version tag
    #[serde(rename = "urn:did-client:config:version")]
    pub version: String,

    /// Notes recorded automatically by lifecycle operations
    #[serde(
        rename = "urn:did-client:notes:auto",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub auto_notes: Option<Vec<String>>,

    /// Notes by identifier
    #[serde(default)]
    pub dids: BTreeMap<String, Notes>,

    /// Unknown top-level entries, preserved on write
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for ConfigDocument {
    fn default() -> Self {
        Self {
            context: notes_context(),
            version: CONFIG_VERSION.to_string(),
            auto_notes: Some(DEFAULT_AUTO_NOTES.iter().map(|s| s.to_string()).collect()),
            dids: BTreeMap::new(),
            extra: Map::new(),
        }
    }
}

/// JSON-LD context mapping note names to vocabulary terms
fn notes_context() -> Value {
    json!([{
        "@version": 1.1,
        "id": "@id",
        "type": "@type",
        "schema": "http://schema.org/",
        "xsd": "http://www.w3.org/2001/XMLSchema#",
        "name": "schema:name",
        "description": "schema:description",
        "url": "schema:url",
        "ledger": "urn:did-client:ledger",
        "ledgerMode": "urn:did-client:ledgerMode",
        "publishedHost": "urn:did-client:publishedHost",
        "created": { "@id": "schema:dateCreated", "@type": "xsd:dateTime" },
        "modified": { "@id": "schema:dateModified", "@type": "xsd:dateTime" },
        "published": { "@id": "schema:datePublished", "@type": "xsd:dateTime" },
        "dids": { "@id": "urn:did-client:did", "@container": "@id" }
    }])
}

impl ConfigDocument {
    /// Add `value` to `property` of `id`; duplicates are a no-op
    pub fn add_value(&mut self, id: &str, property: &str, value: &str) -> StoreResult<bool> {
        let result = self
            .dids
            .entry(id.to_string())
            .or_default()
            .add_value(property, value);
        self.prune(id);
        result
    }

    /// Remove `value` from `property` of `id`; absent values are a no-op
    pub fn remove_value(&mut self, id: &str, property: &str, value: &str) -> StoreResult<bool> {
        let result = match self.dids.get_mut(id) {
            Some(notes) => notes.remove_value(property, value),
            None => Notes::default().remove_value(property, value),
        };
        self.prune(id);
        result
    }

    /// Replace `property` of `id` with the single `value`
    pub fn set_value(&mut self, id: &str, property: &str, value: &str) -> StoreResult<bool> {
        let notes = self.dids.entry(id.to_string()).or_default();
        let unchanged = notes
            .get(property)
            .is_some_and(|values| values.len() == 1 && values.contains(value));
        let result = notes.set_value(property, value).map(|()| !unchanged);
        self.prune(id);
        result
    }

    /// Remove `property` of `id` entirely
    pub fn delete_property(&mut self, id: &str, property: &str) -> bool {
        let changed = self
            .dids
            .get_mut(id)
            .is_some_and(|notes| notes.delete_property(property));
        self.prune(id);
        changed
    }

    /// Remove the whole entry of `id`
    pub fn clear(&mut self, id: &str) -> bool {
        self.dids.remove(id).is_some()
    }

    /// Check whether `property` of `id` holds `value`
    pub fn find(&self, id: &str, property: &str, value: &str) -> bool {
        self.dids
            .get(id)
            .is_some_and(|notes| notes.has_value(property, value))
    }

    /// Notes of `id`
    pub fn get(&self, id: &str) -> Option<&Notes> {
        self.dids.get(id)
    }

    /// Identifiers with notes, sorted
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.dids.keys().map(String::as_str)
    }

    /// Notes recorded automatically
    pub fn auto_notes(&self) -> Vec<String> {
        match &self.auto_notes {
            Some(notes) => notes.clone(),
            None => DEFAULT_AUTO_NOTES.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Check whether `note` is recorded automatically
    pub fn is_auto_note(&self, note: &str) -> bool {
        match &self.auto_notes {
            Some(notes) => notes.iter().any(|n| n == note),
            None => DEFAULT_AUTO_NOTES.contains(&note),
        }
    }

    /// Drop the entry of `id` if its bag is empty
    fn prune(&mut self, id: &str) {
        if self.dids.get(id).is_some_and(Notes::is_empty) {
            self.dids.remove(id);
        }
    }
}

// =============================================================================
// CONFIG STORE
// =============================================================================

/// Result of backing up the config file before a write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupOutcome {
    /// Prior content copied to the `.old` sibling
    BackedUp,
    /// Nothing to back up yet
    NoPriorFile,
}

/// Loads and stores `config.jsonld`
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
    backup_path: PathBuf,
}

impl ConfigStore {
    /// Config store for the file at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut backup = path.clone().into_os_string();
        backup.push(CONFIG_BACKUP_SUFFIX);

        Self {
            path,
            backup_path: PathBuf::from(backup),
        }
    }

    /// Config store for a store configuration
    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(config.config_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup_path
    }

    /// Load the config document
    ///
    /// An absent file yields a fresh default document. A version tag other
    /// than the supported one fails with `UnsupportedSchemaVersion`.
    pub async fn load(&self) -> StoreResult<ConfigDocument> {
        let content = match tokio::fs::read(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = ?self.path, "No config file, using defaults");
                return Ok(ConfigDocument::default());
            }
            Err(e) => return Err(io_error("read", &self.path, e)),
        };

        let deserialization = |e: serde_json::Error| StoreError::Deserialization {
            path: self.path.clone(),
            reason: e.to_string(),
        };

        let value: Value = serde_json::from_slice(&content).map_err(deserialization)?;

        let found = value.get(CONFIG_VERSION_KEY).map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });
        if found.as_deref() != Some(CONFIG_VERSION) {
            return Err(StoreError::UnsupportedSchemaVersion {
                found,
                expected: CONFIG_VERSION.to_string(),
            });
        }

        serde_json::from_value(value).map_err(deserialization)
    }

    /// Back up the current file, then replace it with `config`
    pub async fn store(&self, config: &ConfigDocument) -> StoreResult<BackupOutcome> {
        let content = serde_json::to_vec_pretty(config)?;

        let outcome = self.try_backup().await?;
        write_atomic(&self.path, &content).await?;

        debug!(path = ?self.path, backup = ?outcome, "Config stored");
        Ok(outcome)
    }

    /// Copy the current file to its `.old` sibling
    pub async fn try_backup(&self) -> StoreResult<BackupOutcome> {
        match tokio::fs::copy(&self.path, &self.backup_path).await {
            Ok(_) => Ok(BackupOutcome::BackedUp),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(BackupOutcome::NoPriorFile),
            Err(e) => Err(io_error("back up", &self.path, e)),
        }
    }
}

// =============================================================================
// NOTES FACADE
// =============================================================================

/// Which identifiers a notes request applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotesScope {
    /// One identifier
    Identifier(Did),
    /// Every identifier with notes, mutations allowed
    All,
    /// Every identifier with notes, read-only
    Unscoped,
}

/// A notes invocation
///
/// Commands run per identifier in a fixed order: clear, add, remove, get,
/// set, delete, find.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotesRequest {
    pub scope: NotesScope,
    pub clear: bool,
    pub add: Option<(String, String)>,
    pub remove: Option<(String, String)>,
    pub get: Option<String>,
    pub set: Option<(String, String)>,
    pub delete: Option<String>,
    pub find: Option<(String, String)>,
}

impl NotesRequest {
    /// Empty request (shows notes) for `scope`
    pub fn new(scope: NotesScope) -> Self {
        Self {
            scope,
            clear: false,
            add: None,
            remove: None,
            get: None,
            set: None,
            delete: None,
            find: None,
        }
    }

    /// Check whether the request would modify notes
    pub fn is_mutation(&self) -> bool {
        self.clear
            || self.add.is_some()
            || self.remove.is_some()
            || self.set.is_some()
            || self.delete.is_some()
    }
}

/// Outcome of a notes request for one identifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NoteReport {
    pub id: String,

    /// Notes after the request was applied
    pub notes: Notes,

    /// Values of the `get` property, when requested and present
    #[serde(skip_serializing_if = "Option::is_none")]
    pub get: Option<NoteValues>,

    /// Result of the `find` predicate, when requested
    #[serde(skip_serializing_if = "Option::is_none")]
    pub found: Option<bool>,
}

/// Apply `request` to the notes of `id`; returns the report and whether
/// anything changed
pub fn apply_to(
    config: &mut ConfigDocument,
    id: &str,
    request: &NotesRequest,
) -> StoreResult<(NoteReport, bool)> {
    let mut changed = false;

    if request.clear {
        changed |= config.clear(id);
    }
    if let Some((property, value)) = &request.add {
        changed |= config.add_value(id, property, value)?;
    }
    if let Some((property, value)) = &request.remove {
        changed |= config.remove_value(id, property, value)?;
    }
    let get = request
        .get
        .as_ref()
        .and_then(|property| config.get(id).and_then(|notes| notes.get(property)).cloned());
    if let Some((property, value)) = &request.set {
        changed |= config.set_value(id, property, value)?;
    }
    if let Some(property) = &request.delete {
        changed |= config.delete_property(id, property);
    }
    let found = request
        .find
        .as_ref()
        .map(|(property, value)| config.find(id, property, value));

    let report = NoteReport {
        id: id.to_string(),
        notes: config.get(id).cloned().unwrap_or_default(),
        get,
        found,
    };
    Ok((report, changed))
}

/// Read-modify-write access to notes under the config lock
#[derive(Debug, Clone)]
pub struct NotesStore {
    config: ConfigStore,
    locks: LockService,
}

impl NotesStore {
    pub fn new(config: ConfigStore, locks: LockService) -> Self {
        Self { config, locks }
    }

    /// Notes store for a store configuration
    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(ConfigStore::from_config(config), LockService::from_config(config))
    }

    /// Underlying config store
    pub fn config_store(&self) -> &ConfigStore {
        &self.config
    }

    /// Run a notes request
    ///
    /// Mutations under [`NotesScope::Unscoped`] fail with `ReadOnlyMode`
    /// before anything is loaded. The file is only rewritten when some
    /// command changed it.
    pub async fn apply(&self, request: &NotesRequest) -> StoreResult<Vec<NoteReport>> {
        if request.scope == NotesScope::Unscoped && request.is_mutation() {
            return Err(StoreError::ReadOnlyMode);
        }

        self.with_config(|config| {
            let ids: Vec<String> = match &request.scope {
                NotesScope::Identifier(did) => vec![did.to_string()],
                NotesScope::All | NotesScope::Unscoped => {
                    config.ids().map(str::to_string).collect()
                }
            };

            let mut reports = Vec::with_capacity(ids.len());
            let mut changed = false;
            for id in &ids {
                let (report, id_changed) = apply_to(config, id, request)?;
                changed |= id_changed;
                reports.push(report);
            }
            Ok((reports, changed))
        })
        .await
    }

    /// Add every value of `notes` to the notes of `did`
    pub async fn add_many(&self, did: &Did, notes: &Notes) -> StoreResult<()> {
        if notes.is_empty() {
            return Ok(());
        }

        self.with_config(|config| {
            let mut changed = false;
            for (property, values) in notes.iter() {
                for value in values.iter() {
                    changed |= config.add_value(did.as_str(), property, value)?;
                }
            }
            Ok(((), changed))
        })
        .await?;

        debug!(did = %did, properties = notes.len(), "Notes recorded");
        Ok(())
    }

    /// Add the automatic notes among `candidates` to the notes of `did`
    ///
    /// Returns the notes that were recorded.
    pub async fn add_auto(&self, did: &Did, candidates: &Notes) -> StoreResult<Notes> {
        self.with_config(|config| {
            let mut recorded = Notes::default();
            let mut changed = false;
            for (property, values) in candidates.iter() {
                if !config.is_auto_note(property) {
                    continue;
                }
                for value in values.iter() {
                    changed |= config.add_value(did.as_str(), property, value)?;
                    recorded.add_value(property, value)?;
                }
            }
            Ok((recorded, changed))
        })
        .await
    }

    /// Remove the whole notes entry of `did`
    pub async fn clear(&self, did: &Did) -> StoreResult<bool> {
        let cleared = self
            .with_config(|config| {
                let cleared = config.clear(did.as_str());
                Ok((cleared, cleared))
            })
            .await?;

        if cleared {
            info!(did = %did, "Notes cleared");
        }
        Ok(cleared)
    }

    /// Notes of `did`
    pub async fn get(&self, did: &Did) -> StoreResult<Option<Notes>> {
        Ok(self.config.load().await?.get(did.as_str()).cloned())
    }

    /// Identifiers with notes, sorted
    pub async fn ids(&self) -> StoreResult<Vec<String>> {
        Ok(self.config.load().await?.ids().map(str::to_string).collect())
    }

    /// Notes recorded automatically
    pub async fn auto_notes(&self) -> StoreResult<Vec<String>> {
        Ok(self.config.load().await?.auto_notes())
    }

    /// Load, mutate and (when changed) store the config under the config lock
    async fn with_config<T>(
        &self,
        mutate: impl FnOnce(&mut ConfigDocument) -> StoreResult<(T, bool)>,
    ) -> StoreResult<T> {
        let guard = self.locks.acquire(CONFIG_RESOURCE).await?;

        let result: StoreResult<T> = async {
            let mut config = self.config.load().await?;
            let (value, changed) = mutate(&mut config)?;
            if changed {
                self.config.store(&config).await?;
            }
            Ok(value)
        }
        .await;

        let released = guard.release().await;
        let value = result?;
        released?;
        Ok(value)
    }
}
