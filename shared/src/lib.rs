//! # Shared Module for the Local DID Record Store
//!
//! This crate provides common types, errors, and configuration used across
//! the `did-store` library and the `did-client` command-line front end.
//!
//! ## On-disk Layout
//!
//! Every path the store touches is derived from one root directory
//! (`~/.dids` by default):
//!
//! | Path | Content |
//! |------|---------|
//! | `<method>-<mode>/pending/` | Locally generated documents |
//! | `<method>-<mode>/registered/` | Documents accepted by the ledger |
//! | `keys/` | Exported key material |
//! | `meta/` | Per-identifier metadata |
//! | `config.jsonld` | Versioned notes document (+ `.old` backup) |
//! | `locks/` | Lease files |

pub mod config;
pub mod constants;
pub mod error;
pub mod types;

// Re-exports for convenience
pub use config::*;
pub use constants::*;
pub use error::*;
pub use types::*;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
