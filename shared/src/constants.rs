//! # Constants for the Local DID Record Store
//!
//! This module contains all constants used throughout the store:
//! on-disk layout, schema tags, lock policy defaults and environment
//! variable names.

// =============================================================================
// ON-DISK LAYOUT
// =============================================================================

/// Directory under the user's home holding the store (`~/.dids`)
pub const DEFAULT_STORE_DIR: &str = ".dids";

/// Sub-directory holding exported key material
pub const KEYS_DIR: &str = "keys";

/// Sub-directory holding per-identifier metadata
pub const META_DIR: &str = "meta";

/// Sub-directory holding lock files
pub const LOCKS_DIR: &str = "locks";

/// Area for locally generated, not yet published documents
pub const PENDING_DIR: &str = "pending";

/// Area for documents accepted by the ledger
pub const REGISTERED_DIR: &str = "registered";

/// Name of the notes/config document
pub const CONFIG_FILE_NAME: &str = "config.jsonld";

/// Suffix appended to the config file for its one-generation backup
pub const CONFIG_BACKUP_SUFFIX: &str = ".old";

/// Extension of DID document files
pub const DOCUMENT_EXTENSION: &str = ".json";

/// Extension of key material files
pub const KEYS_EXTENSION: &str = ".keys.json";

/// Extension of metadata files
pub const META_EXTENSION: &str = ".meta.json";

/// Extension of lock files
pub const LOCK_EXTENSION: &str = ".lock";

/// Directory permissions (owner only)
pub const DIR_MODE: u32 = 0o700;

/// File permissions (owner read/write)
pub const FILE_MODE: u32 = 0o600;

// =============================================================================
// CONFIG DOCUMENT SCHEMA
// =============================================================================

/// Key holding the config schema version
pub const CONFIG_VERSION_KEY: &str = "urn:did-client:config:version";

/// The only schema version this implementation understands
pub const CONFIG_VERSION: &str = "1";

/// Key holding the list of automatically recorded notes
pub const CONFIG_AUTO_NOTES_KEY: &str = "urn:did-client:notes:auto";

/// Notes recorded automatically unless the config says otherwise
pub const DEFAULT_AUTO_NOTES: &[&str] = &["created", "ledger"];

/// Lock resource guarding the shared config document
pub const CONFIG_RESOURCE: &str = "config";

// =============================================================================
// NOTE PROPERTIES
// =============================================================================

/// Human readable name of an identifier
pub const NOTE_NAME: &str = "name";

/// Free-form description
pub const NOTE_DESCRIPTION: &str = "description";

/// When the record was generated locally
pub const NOTE_CREATED: &str = "created";

/// When the ledger accepted the record
pub const NOTE_PUBLISHED: &str = "published";

/// Ledger host that accepted the record
pub const NOTE_PUBLISHED_HOST: &str = "publishedHost";

/// `<method>:<mode>` of the ledger the record belongs to
pub const NOTE_LEDGER: &str = "ledger";

/// Ledger mode the record was generated for
pub const NOTE_LEDGER_MODE: &str = "ledgerMode";

/// Properties callers may never touch through the notes API
pub const RESERVED_PROPERTIES: &[&str] = &["id", "@id"];

// =============================================================================
// LOCKING POLICY
// =============================================================================

/// Maximum attempts to obtain a lock before giving up
pub const LOCK_RETRIES: u32 = 100;

/// Delay between lock attempts (milliseconds)
pub const LOCK_RETRY_DELAY_MS: u64 = 100;

// =============================================================================
// DID METHOD DEFAULTS
// =============================================================================

/// DID scheme
pub const DID_SCHEME: &str = "did";

/// Default DID method
pub const DEFAULT_METHOD: &str = "example";

/// Default ledger mode
pub const DEFAULT_MODE: &str = "test";

/// Ed25519 verification key type
pub const VERIFICATION_KEY_TYPE_ED25519: &str = "Ed25519VerificationKey2020";

/// DID core context
pub const DID_CONTEXT_V1: &str = "https://www.w3.org/ns/did/v1";

/// Verification relationships that may reference a key id
pub const VERIFICATION_RELATIONSHIPS: &[&str] = &[
    "authentication",
    "assertionMethod",
    "keyAgreement",
    "capabilityInvocation",
    "capabilityDelegation",
];

// =============================================================================
// LEDGER
// =============================================================================

/// Ledger request timeout (seconds)
pub const LEDGER_REQUEST_TIMEOUT_SECS: u64 = 30;

// =============================================================================
// ENVIRONMENT VARIABLE NAMES
// =============================================================================

/// Override of the store root directory
pub const ENV_STORE_HOME: &str = "DID_STORE_HOME";

/// DID method
pub const ENV_METHOD: &str = "DID_METHOD";

/// Ledger mode
pub const ENV_MODE: &str = "DID_MODE";

/// Ledger registrar endpoint
pub const ENV_LEDGER_ENDPOINT: &str = "DID_LEDGER_ENDPOINT";

/// Host name recorded as `publishedHost`
pub const ENV_LEDGER_HOST: &str = "DID_LEDGER_HOST";

/// Lock retry count
pub const ENV_LOCK_RETRIES: &str = "DID_LOCK_RETRIES";

/// Lock retry delay (milliseconds)
pub const ENV_LOCK_RETRY_MS: &str = "DID_LOCK_RETRY_MS";

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

/// Check whether a note property is reserved
pub fn is_reserved_property(property: &str) -> bool {
    RESERVED_PROPERTIES.contains(&property)
}

/// Name of the directory holding documents for a method/mode pair
pub fn method_mode_dir(method: &str, mode: &str) -> String {
    format!("{}-{}", method, mode)
}

/// Split a `<method>-<mode>` directory name back into its parts
///
/// Methods never contain `-`, so the first dash separates the two.
pub fn split_method_mode(dir_name: &str) -> Option<(&str, &str)> {
    let (method, mode) = dir_name.split_once('-')?;
    if method.is_empty()
        || mode.is_empty()
        || !method.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
    {
        return None;
    }
    Some((method, mode))
}
