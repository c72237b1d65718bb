//! # Shared Data Types for the Local DID Record Store
//!
//! This module defines the data structures shared between the store
//! library and its command-line front end: identifiers, record status,
//! exported key material and the multi-valued notes bag.

use serde::de::{self, Deserializer};
use serde::ser::{SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::constants::{is_reserved_property, DID_SCHEME};
use crate::error::{StoreError, StoreResult};

// =============================================================================
// IDENTIFIER
// =============================================================================

/// A validated decentralized identifier (`did:<method>:<method-specific-id>`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Did(String);

impl Did {
    /// Parse and validate an identifier
    ///
    /// The scheme must be `did`, the method one or more of `[a-z0-9]`, and
    /// the method-specific id one or more of `[A-Za-z0-9._:-]` or `%XX`
    /// escapes. DID URLs
    /// (with a path, query or fragment) are rejected; use [`Did::owner_of`]
    /// to get the identifier a key id belongs to.
    pub fn parse(input: &str) -> StoreResult<Self> {
        let invalid = |reason: &str| StoreError::InvalidIdentifier {
            did: input.to_string(),
            reason: reason.to_string(),
        };

        let rest = input
            .strip_prefix(DID_SCHEME)
            .and_then(|rest| rest.strip_prefix(':'))
            .ok_or_else(|| invalid("expected did:<method>:<method-specific-id>"))?;

        let (method, specific) = rest
            .split_once(':')
            .ok_or_else(|| invalid("missing method-specific id"))?;

        if method.is_empty() {
            return Err(invalid("method name must be at least one character"));
        }
        if !method.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()) {
            return Err(invalid("method name must be lowercase letters and digits"));
        }
        if specific.is_empty() {
            return Err(invalid("method-specific id is empty"));
        }

        let mut chars = specific.chars();
        while let Some(c) = chars.next() {
            if c == '%' {
                let escaped = [chars.next(), chars.next()];
                if !escaped.iter().all(|h| h.is_some_and(|h| h.is_ascii_hexdigit())) {
                    return Err(invalid("'%' must start a %XX escape"));
                }
            } else if !(c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ':')) {
                return Err(invalid(&format!("unexpected character '{}'", c)));
            }
        }

        Ok(Self(input.to_string()))
    }

    /// Identifier owning a key id (`did:example:abc#key-1` → `did:example:abc`)
    pub fn owner_of(key_id: &str) -> StoreResult<Self> {
        let end = key_id.find(['#', '/', '?', ';']).unwrap_or(key_id.len());
        Self::parse(&key_id[..end])
    }

    /// The DID method segment
    pub fn method(&self) -> &str {
        self.0.split(':').nth(1).unwrap_or_default()
    }

    /// Everything after `did:<method>:`
    pub fn method_specific_id(&self) -> &str {
        self.0.splitn(3, ':').nth(2).unwrap_or_default()
    }

    /// The identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Did {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for Did {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Did {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Did> for String {
    fn from(did: Did) -> Self {
        did.0
    }
}

// =============================================================================
// RECORD STATUS
// =============================================================================

/// Lifecycle status of an identity record
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// Generated locally, not yet accepted by the ledger
    Pending,
    /// Accepted by the ledger; the local copy is a cache
    Registered,
}

impl RecordStatus {
    /// All statuses, in listing order
    pub const ALL: [RecordStatus; 2] = [RecordStatus::Pending, RecordStatus::Registered];

    /// Directory name of the area holding documents in this status
    pub fn dir_name(&self) -> &'static str {
        match self {
            RecordStatus::Pending => crate::constants::PENDING_DIR,
            RecordStatus::Registered => crate::constants::REGISTERED_DIR,
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

// =============================================================================
// KEYS
// =============================================================================

/// Key type understood by the reference generator
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    #[default]
    Ed25519,
}

impl FromStr for KeyType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ed25519" => Ok(KeyType::Ed25519),
            other => Err(StoreError::UnknownKeyType(other.to_string())),
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyType::Ed25519 => write!(f, "ed25519"),
        }
    }
}

/// One exported key pair
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExportedKey {
    /// Key id (`<did>#<fragment>`)
    pub id: String,

    /// Verification method type (e.g. "Ed25519VerificationKey2020")
    #[serde(rename = "type")]
    pub key_type: String,

    /// Controlling identifier
    pub controller: String,

    /// Public key, hex encoded
    pub public_key_hex: String,

    /// Private key, hex encoded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key_hex: Option<String>,
}

impl ExportedKey {
    /// Copy of this key without private material
    pub fn public_only(&self) -> Self {
        Self {
            private_key_hex: None,
            ..self.clone()
        }
    }
}

/// All key material stored for one identifier
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyMaterial {
    /// Identifier the keys belong to
    pub id: String,

    /// Active keys by key id
    pub keys: BTreeMap<String, ExportedKey>,

    /// Key ids rotated away; never handed out again
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retired: Vec<String>,
}

impl KeyMaterial {
    /// Create key material holding the given keys
    pub fn new(id: impl Into<String>, keys: impl IntoIterator<Item = ExportedKey>) -> Self {
        Self {
            id: id.into(),
            keys: keys.into_iter().map(|key| (key.id.clone(), key)).collect(),
            retired: Vec::new(),
        }
    }

    /// Check whether a key id is active or was used before
    pub fn knows(&self, key_id: &str) -> bool {
        self.keys.contains_key(key_id) || self.retired.iter().any(|id| id == key_id)
    }

    /// Replace `old_id` with `new_key`, remembering the old id
    pub fn rotate(&mut self, old_id: &str, new_key: ExportedKey) {
        if self.keys.remove(old_id).is_some() && !self.retired.iter().any(|id| id == old_id) {
            self.retired.push(old_id.to_string());
        }
        self.keys.insert(new_key.id.clone(), new_key);
    }
}

// =============================================================================
// NOTES
// =============================================================================

/// Ordered set of string values for one note property
///
/// Serialized the JSON-LD compact way: a single value as a scalar,
/// several as an array.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NoteValues(Vec<String>);

impl NoteValues {
    /// Set holding a single value
    pub fn single(value: impl Into<String>) -> Self {
        Self(vec![value.into()])
    }

    /// Check for a value
    pub fn contains(&self, value: &str) -> bool {
        self.0.iter().any(|v| v == value)
    }

    /// Insert unless already present; returns whether the set changed
    pub fn insert(&mut self, value: impl Into<String>) -> bool {
        let value = value.into();
        if self.contains(&value) {
            return false;
        }
        self.0.push(value);
        true
    }

    /// Remove a value; returns whether the set changed
    pub fn remove(&mut self, value: &str) -> bool {
        let before = self.0.len();
        self.0.retain(|v| v != value);
        self.0.len() != before
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// First value, if any
    pub fn first(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl fmt::Display for NoteValues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(","))
    }
}

impl Serialize for NoteValues {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.0.len() == 1 {
            return serializer.serialize_str(&self.0[0]);
        }
        let mut seq = serializer.serialize_seq(Some(self.0.len()))?;
        for value in &self.0 {
            seq.serialize_element(value)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for NoteValues {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            One(String),
            Many(Vec<String>),
        }

        let mut values = NoteValues::default();
        match Repr::deserialize(deserializer)
            .map_err(|_| de::Error::custom("note values must be a string or an array of strings"))?
        {
            Repr::One(value) => {
                values.insert(value);
            }
            Repr::Many(many) => {
                for value in many {
                    values.insert(value);
                }
            }
        }
        Ok(values)
    }
}

/// Multi-valued property bag attached to an identifier
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Notes(BTreeMap<String, NoteValues>);

/// Reject reserved properties
fn guard_property(property: &str) -> StoreResult<()> {
    if is_reserved_property(property) {
        return Err(StoreError::ReservedProperty(property.to_string()));
    }
    Ok(())
}

impl Notes {
    /// Add a value to a property's set; duplicates are a no-op
    pub fn add_value(&mut self, property: &str, value: impl Into<String>) -> StoreResult<bool> {
        guard_property(property)?;
        Ok(self.0.entry(property.to_string()).or_default().insert(value))
    }

    /// Remove a value from a property's set; absent values are a no-op
    pub fn remove_value(&mut self, property: &str, value: &str) -> StoreResult<bool> {
        guard_property(property)?;
        let Some(values) = self.0.get_mut(property) else {
            return Ok(false);
        };
        let changed = values.remove(value);
        if values.is_empty() {
            self.0.remove(property);
        }
        Ok(changed)
    }

    /// Replace a property with a single value
    pub fn set_value(&mut self, property: &str, value: impl Into<String>) -> StoreResult<()> {
        guard_property(property)?;
        self.0.insert(property.to_string(), NoteValues::single(value));
        Ok(())
    }

    /// Remove a whole property; returns whether it existed
    pub fn delete_property(&mut self, property: &str) -> bool {
        self.0.remove(property).is_some()
    }

    /// Check whether `property` holds `value`
    pub fn has_value(&self, property: &str, value: &str) -> bool {
        self.0.get(property).is_some_and(|values| values.contains(value))
    }

    /// Values of a property
    pub fn get(&self, property: &str) -> Option<&NoteValues> {
        self.0.get(property)
    }

    pub fn contains_property(&self, property: &str) -> bool {
        self.0.contains_key(property)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Properties in sorted order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &NoteValues)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}
