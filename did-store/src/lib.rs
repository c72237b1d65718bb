//! # Local DID Record Store
//!
//! Durable, concurrency-safe local storage for DID documents, their key
//! material and user notes, with the lifecycle a record goes through
//! before and after it is published to a ledger.
//!
//! ## Layout
//!
//! | Module         | Responsibility                                        |
//! |----------------|-------------------------------------------------------|
//! | [`collection`] | one directory of JSON documents, atomic writes        |
//! | [`lock`]       | flock-based locks shared across processes             |
//! | [`notes`]      | the `config.jsonld` notes document and its commands   |
//! | [`lifecycle`]  | generate / import / register / rotate / remove / ...  |
//! | [`listing`]    | enumeration across methods, modes and statuses        |
//! | [`document`]   | verification-method helpers used by key rotation      |
//! | [`generator`]  | key and document generation                           |
//! | [`ledger`]     | publication to a ledger                               |

pub mod collection;
pub mod document;
pub mod generator;
pub mod ledger;
pub mod lifecycle;
pub mod listing;
pub mod lock;
pub mod notes;

use std::sync::Arc;

use shared::config::StoreConfig;
use shared::error::StoreResult;

// Re-export commonly used types
pub use collection::Collection;
pub use generator::{DocumentGenerator, Ed25519Generator, GenerateRequest, GeneratedIdentity};
pub use ledger::{HttpRegistrar, LedgerRegistrar, MemoryLedger};
pub use lifecycle::{
    ExportedRecord, GenerateOptions, GenerateOutcome, ImportOutcome, InfoLocation, InfoResult,
    LifecycleManager, RegisterOutcome, RemoveOutcome, RotateOutcome,
};
pub use listing::{ListFilter, Listing, ListingGroup, RecordLister, SkippedEntry};
pub use lock::{LockGuard, LockService};
pub use notes::{NoteReport, NotesRequest, NotesScope, NotesStore};

/// Everything a front end needs, built from one configuration
pub struct DidStore {
    /// Configuration
    pub config: StoreConfig,
    /// Record lifecycle and notes
    pub lifecycle: LifecycleManager,
    /// Listing across the store root
    pub lister: RecordLister,
}

impl DidStore {
    /// Open the store described by `config`
    pub fn open(
        config: StoreConfig,
        generator: Arc<dyn DocumentGenerator>,
        ledger: Option<Arc<dyn LedgerRegistrar>>,
    ) -> StoreResult<Self> {
        let lifecycle = LifecycleManager::new(config.clone(), generator, ledger)?;
        let lister = RecordLister::from_config(&config);
        Ok(Self {
            config,
            lifecycle,
            lister,
        })
    }

    /// Notes store backing the `notes` commands
    pub fn notes(&self) -> &NotesStore {
        self.lifecycle.notes()
    }
}
