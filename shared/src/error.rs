//! # Error Types for the Local DID Record Store
//!
//! This module defines all error types used throughout the store,
//! providing enough context (identifier, operation, path) for every
//! failure to be reported meaningfully by a presentation layer.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Lifecycle operation in flight when an error occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Generate,
    Import,
    Register,
    RotateKey,
    Remove,
    Info,
    Export,
    List,
    Notes,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Generate => "generate",
            Operation::Import => "import",
            Operation::Register => "register",
            Operation::RotateKey => "rotate-key",
            Operation::Remove => "remove",
            Operation::Info => "info",
            Operation::Export => "export",
            Operation::List => "list",
            Operation::Notes => "notes",
        };
        f.write_str(name)
    }
}

/// Main error type for the record store
#[derive(Error, Debug)]
pub enum StoreError {
    // =========================================================================
    // RECORD ERRORS
    // =========================================================================

    /// Identifier (or key) absent from the collection that had to hold it
    #[error("'{key}' not found in {collection}")]
    NotFound { collection: String, key: String },

    /// Attempt to remove a record the ledger already accepted
    #[error("'{0}' has been published and cannot be removed locally")]
    PublishedRecord(String),

    /// Derived key id is already in use for the owning identifier
    #[error("key '{key_id}' already exists")]
    KeyCollision { key_id: String },

    /// Identifier does not have the `did:<method>:<id>` shape
    #[error("invalid DID '{did}': {reason}")]
    InvalidIdentifier { did: String, reason: String },

    /// Key type the generator does not support
    #[error("unknown key type: {0}")]
    UnknownKeyType(String),

    // =========================================================================
    // NOTES ERRORS
    // =========================================================================

    /// Attempt to modify `id` / `@id` through the notes API
    #[error("can not modify reserved property \"{0}\"")]
    ReservedProperty(String),

    /// Mutation attempted without naming an identifier or "all"
    #[error("readonly mode: specify a DID or use --all")]
    ReadOnlyMode,

    /// Config file written by an unknown schema version
    #[error("unsupported config version {found:?} (expected \"{expected}\")")]
    UnsupportedSchemaVersion { found: Option<String>, expected: String },

    // =========================================================================
    // STORAGE ERRORS
    // =========================================================================

    /// Lease could not be obtained within the retry budget
    #[error("timed out acquiring lock on '{resource}' after {attempts} attempts")]
    LockTimeout { resource: String, attempts: u32 },

    /// Lock file no longer named this holder at release
    #[error("lock on '{resource}' was lost before release")]
    LockLost { resource: String },

    /// A file exists but cannot be parsed
    #[error("failed to deserialize {path:?}: {reason}")]
    Deserialization { path: PathBuf, reason: String },

    /// Failed to read/write/remove a file
    #[error("storage I/O error: {0}")]
    Io(String),

    /// Serialization of an in-memory value failed
    #[error("serialization error: {0}")]
    Serialization(String),

    // =========================================================================
    // COLLABORATOR ERRORS
    // =========================================================================

    /// Ledger registrar rejected or failed a request
    #[error("ledger {action} failed for '{did}': {reason}")]
    Ledger { action: String, did: String, reason: String },

    /// Key/document generator failed
    #[error("generator error: {0}")]
    Generator(String),

    /// Requested feature is not supported by a collaborator
    #[error("operation not supported: {0}")]
    NotSupported(String),

    // =========================================================================
    // CONFIGURATION ERRORS
    // =========================================================================

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // CONTEXT
    // =========================================================================

    /// Failure of a lifecycle operation on one identifier
    #[error("{operation} failed for '{did}': {source}")]
    Operation {
        operation: Operation,
        did: String,
        #[source]
        source: Box<StoreError>,
    },

    /// Ledger accepted the change but a later local step failed
    ///
    /// `completed` names the last step that did succeed; retrying the
    /// following step repairs the record.
    #[error("{operation} partially applied for '{did}' (completed: {completed}): {source}")]
    Partial {
        operation: Operation,
        did: String,
        completed: &'static str,
        #[source]
        source: Box<StoreError>,
    },
}

/// Result type alias using StoreError
pub type StoreResult<T> = Result<T, StoreError>;

// =============================================================================
// ERROR CONVERSIONS
// =============================================================================

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

// =============================================================================
// CONTEXT HELPERS
// =============================================================================

impl StoreError {
    /// Shorthand for a `NotFound` error
    pub fn not_found(collection: impl Into<String>, key: impl Into<String>) -> Self {
        StoreError::NotFound {
            collection: collection.into(),
            key: key.into(),
        }
    }

    /// Wrap this error with the operation and identifier it belongs to
    pub fn in_operation(self, operation: Operation, did: &str) -> Self {
        match self {
            // Already carries context
            err @ (StoreError::Operation { .. } | StoreError::Partial { .. }) => err,
            err => StoreError::Operation {
                operation,
                did: did.to_string(),
                source: Box::new(err),
            },
        }
    }

    /// Innermost error, with all context layers stripped
    pub fn root(&self) -> &StoreError {
        match self {
            StoreError::Operation { source, .. } | StoreError::Partial { source, .. } => {
                source.root()
            }
            err => err,
        }
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self.root() {
            StoreError::NotFound { .. }
            | StoreError::PublishedRecord(_)
            | StoreError::KeyCollision { .. }
            | StoreError::InvalidIdentifier { .. }
            | StoreError::UnknownKeyType(_) => "record",

            StoreError::ReservedProperty(_)
            | StoreError::ReadOnlyMode
            | StoreError::UnsupportedSchemaVersion { .. } => "notes",

            StoreError::LockTimeout { .. }
            | StoreError::LockLost { .. }
            | StoreError::Deserialization { .. }
            | StoreError::Io(_)
            | StoreError::Serialization(_) => "storage",

            StoreError::Ledger { .. }
            | StoreError::Generator(_)
            | StoreError::NotSupported(_) => "collaborator",

            StoreError::Configuration(_) => "config",

            StoreError::Operation { .. } | StoreError::Partial { .. } => "internal",
        }
    }

    /// Check if retrying the whole operation may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.root(),
            StoreError::LockTimeout { .. } | StoreError::Ledger { .. } | StoreError::Io(_)
        )
    }
}
