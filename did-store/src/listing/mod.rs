//! # Query and Listing
//!
//! Read-only views over the whole store root: every `<method>-<mode>`
//! directory, both status areas, and the identifiers known to the notes
//! config. Broken entries are reported next to the results instead of
//! aborting the listing.

use serde::Serialize;
use serde_json::Value;
use std::io::ErrorKind;
use std::path::PathBuf;
use tracing::{debug, warn};

use shared::{
    config::{documents_dir, StoreConfig},
    constants::{split_method_mode, DOCUMENT_EXTENSION},
    error::StoreResult,
    types::RecordStatus,
};

use crate::collection::{io_error, Collection};
use crate::document::document_did;
use crate::notes::NotesStore;

/// Which records [`RecordLister::list`] returns
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub method: Option<String>,
    pub mode: Option<String>,
    pub status: Option<RecordStatus>,

    /// Load every document and report broken ones
    pub verify: bool,
}

/// Identifiers of one method/mode/status area
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListingGroup {
    pub method: String,
    pub mode: String,
    pub status: RecordStatus,
    pub identifiers: Vec<String>,
}

/// File left out of a listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedEntry {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Listing {
    pub groups: Vec<ListingGroup>,
    pub skipped: Vec<SkippedEntry>,
}

impl Listing {
    /// Number of listed identifiers across all groups
    pub fn total(&self) -> usize {
        self.groups.iter().map(|g| g.identifiers.len()).sum()
    }
}

// =============================================================================
// RECORD LISTER
// =============================================================================

/// Enumerates records under a store root
#[derive(Debug, Clone)]
pub struct RecordLister {
    root: PathBuf,
    notes: NotesStore,
}

impl RecordLister {
    pub fn new(root: impl Into<PathBuf>, notes: NotesStore) -> Self {
        Self {
            root: root.into(),
            notes,
        }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(config.root_dir.clone(), NotesStore::from_config(config))
    }

    /// List identifiers per method, mode and status
    ///
    /// Method/mode directories are visited in sorted order, Pending before
    /// Registered. Empty areas are left out.
    pub async fn list(&self, filter: &ListFilter) -> StoreResult<Listing> {
        let mut listing = Listing::default();

        for (method, mode) in self.method_modes().await? {
            if filter.method.as_ref().is_some_and(|m| *m != method)
                || filter.mode.as_ref().is_some_and(|m| *m != mode)
            {
                continue;
            }

            for status in RecordStatus::ALL {
                if filter.status.is_some_and(|s| s != status) {
                    continue;
                }

                let collection = Collection::new(
                    status.dir_name(),
                    documents_dir(&self.root, &method, &mode, status),
                    DOCUMENT_EXTENSION,
                );

                let mut identifiers = match collection.list().await {
                    Ok(identifiers) => identifiers,
                    Err(e) => {
                        warn!(dir = ?collection.dir(), error = %e, "Skipping unreadable area");
                        listing.skipped.push(SkippedEntry {
                            path: collection.dir().to_path_buf(),
                            reason: e.to_string(),
                        });
                        continue;
                    }
                };

                if filter.verify {
                    identifiers = verify(&collection, identifiers, &mut listing.skipped).await;
                }

                if !identifiers.is_empty() {
                    listing.groups.push(ListingGroup {
                        method: method.clone(),
                        mode: mode.clone(),
                        status,
                        identifiers,
                    });
                }
            }
        }

        debug!(
            groups = listing.groups.len(),
            identifiers = listing.total(),
            skipped = listing.skipped.len(),
            "Listed records"
        );
        Ok(listing)
    }

    /// Identifiers present in the notes config, sorted
    pub async fn notes_ids(&self) -> StoreResult<Vec<String>> {
        self.notes.ids().await
    }

    /// `(method, mode)` pairs that have a directory under the root, sorted
    async fn method_modes(&self) -> StoreResult<Vec<(String, String)>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error("list", &self.root, e)),
        };

        let mut pairs = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error("list", &self.root, e))?
        {
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            if !is_dir {
                continue;
            }

            let name = entry.file_name();
            if let Some((method, mode)) = name.to_str().and_then(split_method_mode) {
                pairs.push((method.to_string(), mode.to_string()));
            }
        }

        pairs.sort();
        Ok(pairs)
    }
}

/// Keep identifiers whose document loads and carries the matching `id`
async fn verify(
    collection: &Collection,
    identifiers: Vec<String>,
    skipped: &mut Vec<SkippedEntry>,
) -> Vec<String> {
    let mut valid = Vec::with_capacity(identifiers.len());

    for id in identifiers {
        let path = collection.path_for(&id);
        let reason = match collection.get::<Value>(&id).await {
            Ok(Some(document)) => match document_did(&document) {
                Ok(did) if did.as_str() == id => {
                    valid.push(id);
                    continue;
                }
                Ok(did) => format!("document id '{}' does not match file name", did),
                Err(e) => e.to_string(),
            },
            // Removed while listing
            Ok(None) => continue,
            Err(e) => e.to_string(),
        };

        warn!(path = ?path, reason = %reason, "Skipping broken document");
        skipped.push(SkippedEntry { path, reason });
    }

    valid
}
