//! # Key/Document Generator
//!
//! The store never builds key pairs or method-specific documents itself;
//! it asks a [`DocumentGenerator`]. [`Ed25519Generator`] is the reference
//! implementation: deterministic for a given seed, random otherwise.

use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use rand::RngCore;
use serde_json::{json, Value};
use tracing::debug;

use shared::{
    constants::{DID_CONTEXT_V1, VERIFICATION_KEY_TYPE_ED25519},
    error::{StoreError, StoreResult},
    types::{Did, ExportedKey, KeyMaterial, KeyType},
};

use crate::document::verification_method;

/// Length of an Ed25519 seed in bytes
pub const SEED_LENGTH: usize = 32;

/// Parameters of a `generate` call
#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    pub key_type: KeyType,

    /// Passphrase protecting exported private keys
    pub passphrase: Option<String>,

    /// Hex-encoded seed for deterministic generation
    pub seed: Option<String>,
}

/// Freshly generated document and keys
#[derive(Debug, Clone)]
pub struct GeneratedIdentity {
    pub did: Did,
    pub document: Value,
    pub keys: KeyMaterial,

    /// Hex-encoded seed the identity can be re-derived from
    pub seed: String,
}

/// Builds DID documents and key pairs for one DID method
#[async_trait]
pub trait DocumentGenerator: Send + Sync {
    /// DID method of generated identifiers
    fn method(&self) -> &str;

    /// Generate a new document with its key material
    async fn generate(&self, request: &GenerateRequest) -> StoreResult<GeneratedIdentity>;

    /// Generate a replacement key for `owner`
    async fn generate_key(&self, owner: &Did, key_type: KeyType) -> StoreResult<ExportedKey>;
}

// =============================================================================
// ED25519 GENERATOR
// =============================================================================

/// Reference generator producing Ed25519 keys
///
/// The identifier is derived from the public key:
/// `did:<method>:<first 16 bytes of the public key, hex>`, and key ids are
/// `<did>#<first 8 bytes of the public key, hex>`.
#[derive(Debug, Clone)]
pub struct Ed25519Generator {
    method: String,
}

impl Ed25519Generator {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
        }
    }

    fn signing_key(seed: Option<&str>) -> StoreResult<([u8; SEED_LENGTH], SigningKey)> {
        let mut bytes = [0u8; SEED_LENGTH];
        match seed {
            Some(seed) => {
                let decoded = hex::decode(seed)
                    .map_err(|e| StoreError::Generator(format!("invalid seed: {}", e)))?;
                if decoded.len() != SEED_LENGTH {
                    return Err(StoreError::Generator(format!(
                        "seed must be {} bytes, got {}",
                        SEED_LENGTH,
                        decoded.len()
                    )));
                }
                bytes.copy_from_slice(&decoded);
            }
            None => OsRng.fill_bytes(&mut bytes),
        }
        Ok((bytes, SigningKey::from_bytes(&bytes)))
    }

    fn export(owner: &str, key_type: KeyType, signing_key: &SigningKey) -> ExportedKey {
        let public_key_hex = hex::encode(signing_key.verifying_key().as_bytes());
        let verification_type = match key_type {
            KeyType::Ed25519 => VERIFICATION_KEY_TYPE_ED25519,
        };
        ExportedKey {
            id: format!("{}#{}", owner, &public_key_hex[..16]),
            key_type: verification_type.to_string(),
            controller: owner.to_string(),
            public_key_hex,
            private_key_hex: Some(hex::encode(signing_key.to_bytes())),
        }
    }
}

#[async_trait]
impl DocumentGenerator for Ed25519Generator {
    fn method(&self) -> &str {
        &self.method
    }

    async fn generate(&self, request: &GenerateRequest) -> StoreResult<GeneratedIdentity> {
        if request.passphrase.is_some() {
            return Err(StoreError::NotSupported(
                "passphrase-protected key export".into(),
            ));
        }
        let (seed, signing_key) = Self::signing_key(request.seed.as_deref())?;
        let public_key = signing_key.verifying_key();

        let did = Did::parse(&format!(
            "did:{}:{}",
            self.method,
            hex::encode(&public_key.as_bytes()[..16])
        ))?;

        let key = Self::export(did.as_str(), request.key_type, &signing_key);
        let document = json!({
            "@context": [DID_CONTEXT_V1],
            "id": did.as_str(),
            "verificationMethod": [verification_method(&key)],
            "authentication": [key.id],
            "assertionMethod": [key.id],
            "capabilityInvocation": [key.id],
            "capabilityDelegation": [key.id],
        });

        debug!(did = %did, "Generated Ed25519 identity");

        Ok(GeneratedIdentity {
            keys: KeyMaterial::new(did.as_str(), [key]),
            did,
            document,
            seed: hex::encode(seed),
        })
    }

    async fn generate_key(&self, owner: &Did, key_type: KeyType) -> StoreResult<ExportedKey> {
        let (_, signing_key) = Self::signing_key(None)?;
        Ok(Self::export(owner.as_str(), key_type, &signing_key))
    }
}
