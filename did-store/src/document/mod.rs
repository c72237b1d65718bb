//! # DID Document Helpers
//!
//! Documents are opaque JSON values. The store only reads their `id` and,
//! for key rotation, the `verificationMethod` listing and the
//! verification relationships that reference it.

use serde_json::{json, Value};

use shared::{
    constants::VERIFICATION_RELATIONSHIPS,
    error::{StoreError, StoreResult},
    types::{Did, ExportedKey},
};

/// Identifier a document is stored under
pub fn document_did(document: &Value) -> StoreResult<Did> {
    let id = document
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| StoreError::InvalidIdentifier {
            did: String::new(),
            reason: "document has no string \"id\"".into(),
        })?;
    Did::parse(id)
}

/// Verification method entry describing `key`
pub fn verification_method(key: &ExportedKey) -> Value {
    json!({
        "id": key.id,
        "type": key.key_type,
        "controller": key.controller,
        "publicKeyHex": key.public_key_hex,
    })
}

/// Absolute ids of all listed verification methods
pub fn verification_method_ids(document: &Value) -> Vec<String> {
    let doc_id = document.get("id").and_then(Value::as_str).unwrap_or_default();

    document
        .get("verificationMethod")
        .and_then(Value::as_array)
        .map(|methods| {
            methods
                .iter()
                .filter_map(|method| method.get("id").and_then(Value::as_str))
                .map(|id| absolute_id(doc_id, id))
                .collect()
        })
        .unwrap_or_default()
}

/// Check whether `key_id` is listed or referenced anywhere in the document
pub fn references_key(document: &Value, key_id: &str) -> bool {
    let doc_id = document.get("id").and_then(Value::as_str).unwrap_or_default();
    let matches = |entry: &Value| entry_id(entry).is_some_and(|id| absolute_id(doc_id, id) == key_id);

    std::iter::once("verificationMethod")
        .chain(VERIFICATION_RELATIONSHIPS.iter().copied())
        .filter_map(|field| document.get(field).and_then(Value::as_array))
        .flatten()
        .any(matches)
}

/// Replace every occurrence of `old_id` with `new_key`
///
/// Rewrites the `verificationMethod` entry and every reference in the
/// verification relationships: plain references become the new key id,
/// embedded methods become the new method entry. Fails with `NotFound`
/// when `old_id` occurs nowhere.
pub fn replace_key(document: &mut Value, old_id: &str, new_key: &ExportedKey) -> StoreResult<()> {
    let doc_id = document_did(document)?.to_string();
    let new_method = verification_method(new_key);
    let mut replaced = 0usize;

    if let Some(Value::Array(methods)) = document.get_mut("verificationMethod") {
        for entry in methods.iter_mut() {
            let matches = entry_id(entry).is_some_and(|id| absolute_id(&doc_id, id) == old_id);
            if matches {
                *entry = new_method.clone();
                replaced += 1;
            }
        }
    }

    for relationship in VERIFICATION_RELATIONSHIPS {
        let Some(Value::Array(references)) = document.get_mut(*relationship) else {
            continue;
        };
        for reference in references.iter_mut() {
            let matches = entry_id(reference).is_some_and(|id| absolute_id(&doc_id, id) == old_id);
            if !matches {
                continue;
            }
            *reference = match reference {
                Value::String(_) => Value::String(new_key.id.clone()),
                _ => new_method.clone(),
            };
            replaced += 1;
        }
    }

    if replaced == 0 {
        return Err(StoreError::not_found("verificationMethod", old_id));
    }
    Ok(())
}

/// Id of a reference (string) or an embedded method (object)
fn entry_id(entry: &Value) -> Option<&str> {
    match entry {
        Value::String(id) => Some(id),
        Value::Object(method) => method.get("id").and_then(Value::as_str),
        _ => None,
    }
}

fn absolute_id(doc_id: &str, id: &str) -> String {
    if id.starts_with('#') {
        format!("{}{}", doc_id, id)
    } else {
        id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: &str) -> ExportedKey {
        ExportedKey {
            id: id.into(),
            key_type: "Ed25519VerificationKey2020".into(),
            controller: "did:example:abc".into(),
            public_key_hex: "ab".repeat(32),
            private_key_hex: Some("cd".repeat(32)),
        }
    }

    fn document() -> Value {
        json!({
            "id": "did:example:abc",
            "verificationMethod": [
                {"id": "did:example:abc#k1", "type": "Ed25519VerificationKey2020"},
                {"id": "#k2", "type": "Ed25519VerificationKey2020"}
            ],
            "authentication": ["did:example:abc#k1", "#k2"],
            "assertionMethod": ["#k1"],
            "capabilityDelegation": [{"id": "did:example:abc#k1", "type": "Embedded"}],
            "service": [{"id": "did:example:abc#k1"}]
        })
    }

    #[test]
    fn test_document_did() {
        assert_eq!(document_did(&document()).unwrap().as_str(), "did:example:abc");
        assert!(document_did(&json!({"name": "x"})).is_err());
        assert!(document_did(&json!({"id": 5})).is_err());
    }

    #[test]
    fn test_verification_method_ids_resolve_relative_ids() {
        assert_eq!(
            verification_method_ids(&document()),
            vec!["did:example:abc#k1", "did:example:abc#k2"]
        );
        assert!(verification_method_ids(&json!({"id": "did:example:abc"})).is_empty());
    }

    #[test]
    fn test_replace_key_rewrites_listing_and_relationships() {
        let mut doc = document();
        let new_key = key("did:example:abc#k3");

        replace_key(&mut doc, "did:example:abc#k1", &new_key).unwrap();

        assert_eq!(doc["verificationMethod"][0]["id"], "did:example:abc#k3");
        assert_eq!(doc["verificationMethod"][0]["publicKeyHex"], new_key.public_key_hex);
        assert!(doc["verificationMethod"][0].get("privateKeyHex").is_none());
        assert_eq!(doc["verificationMethod"][1]["id"], "#k2");
        assert_eq!(doc["authentication"], json!(["did:example:abc#k3", "#k2"]));
        assert_eq!(doc["assertionMethod"], json!(["did:example:abc#k3"]));
        assert_eq!(doc["capabilityDelegation"][0]["id"], "did:example:abc#k3");
        // Not a verification relationship
        assert_eq!(doc["service"][0]["id"], "did:example:abc#k1");

        assert!(!references_key(&doc, "did:example:abc#k1"));
        assert!(references_key(&doc, "did:example:abc#k3"));
    }

    #[test]
    fn test_replace_unknown_key_is_not_found() {
        let mut doc = document();
        let before = doc.clone();

        let result = replace_key(&mut doc, "did:example:abc#missing", &key("did:example:abc#k3"));

        assert!(matches!(result, Err(StoreError::NotFound { .. })));
        assert_eq!(doc, before);
    }
}
