//! Checksum stamping and verification for structured artifacts
//!
//! An artifact is a JSON document carrying its own checksum at
//! `metadata.checksum`. The checksum covers the canonical serialization
//! of the whole document with that one field set to `null`:
//! compact JSON, object keys in sorted order. Writers emit exactly those
//! canonical bytes (with the checksum filled in), so any single-byte
//! change either breaks parsing or changes the recomputed digest.

use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::hash::{hash_bytes, Blake3Hash};

const CHECKSUM_POINTER: &str = "/metadata/checksum";

/// Canonical byte form of any serializable value
pub fn canonical_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    // Round-trip through Value: its map type orders keys, struct field
    // order and HashMap iteration order stop mattering.
    let value = serde_json::to_value(value)?;
    Ok(serde_json::to_vec(&value)?)
}

/// Digest of the canonical form of `value`
pub fn checksum<T: Serialize + ?Sized>(value: &T) -> Result<Blake3Hash> {
    Ok(hash_bytes(&canonical_bytes(value)?))
}

/// Compute the checksum of `document` and return the canonical bytes to
/// persist, with `metadata.checksum` filled in
pub fn stamp<T: Serialize>(document: &T) -> Result<(Vec<u8>, Blake3Hash)> {
    let mut value = serde_json::to_value(document)?;

    let digest = {
        let slot = checksum_slot(&mut value)?;
        *slot = Value::Null;
        hash_bytes(&serde_json::to_vec(&value)?)
    };

    *checksum_slot(&mut value)? = Value::String(digest.to_hex());
    Ok((serde_json::to_vec(&value)?, digest))
}

/// Verify `payload` against `claimed`
///
/// Fails closed: malformed JSON, a missing checksum field or any
/// mismatch yields `false`, never an error.
pub fn verify(payload: &[u8], claimed: &str) -> bool {
    let Ok(mut value) = serde_json::from_slice::<Value>(payload) else {
        return false;
    };
    let Some(slot) = value.pointer_mut(CHECKSUM_POINTER) else {
        return false;
    };

    // An embedded checksum must agree with the claim as well
    match &*slot {
        Value::Null => {}
        Value::String(embedded) if embedded.as_str() == claimed => {}
        _ => return false,
    }
    *slot = Value::Null;

    match serde_json::to_vec(&value) {
        Ok(canonical) => hash_bytes(&canonical).to_hex() == claimed,
        Err(_) => false,
    }
}

/// Verify an artifact against the checksum it carries
pub fn verify_artifact(payload: &[u8]) -> bool {
    match claimed_checksum(payload) {
        Some(claimed) => verify(payload, &claimed),
        None => false,
    }
}

/// The checksum recorded inside an artifact, if it has one
pub fn claimed_checksum(payload: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(payload).ok()?;
    value
        .pointer(CHECKSUM_POINTER)
        .and_then(Value::as_str)
        .map(str::to_owned)
}

fn checksum_slot(value: &mut Value) -> Result<&mut Value> {
    value.pointer_mut(CHECKSUM_POINTER).ok_or_else(|| {
        Error::InvalidArgument("document has no metadata.checksum field".to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;
    use std::collections::BTreeMap;

    #[derive(Serialize)]
    struct Metadata {
        version: u32,
        checksum: Option<String>,
    }

    #[derive(Serialize)]
    struct Document {
        timestamp: String,
        data: BTreeMap<String, Vec<Value>>,
        metadata: Metadata,
    }

    fn document() -> Document {
        let mut data = BTreeMap::new();
        data.insert(
            "projects".to_string(),
            vec![
                serde_json::json!({"id": 1, "project_code": "P-001", "budget": 12.5}),
                serde_json::json!({"id": 2, "project_code": "P-002", "budget": null}),
            ],
        );
        Document {
            timestamp: "2026-10-16T08-00-00-000Z".to_string(),
            data,
            metadata: Metadata {
                version: 1,
                checksum: None,
            },
        }
    }

    #[test]
    fn test_stamped_document_verifies() -> Result<()> {
        let (bytes, digest) = stamp(&document())?;
        assert!(verify(&bytes, &digest.to_hex()));
        assert!(verify_artifact(&bytes));
        assert_eq!(claimed_checksum(&bytes), Some(digest.to_hex()));
        Ok(())
    }

    #[test]
    fn test_real_values_survive_verification() -> Result<()> {
        let mut doc = document();
        doc.data.insert(
            "measurements".to_string(),
            vec![
                serde_json::json!({"id": 1, "budget": 1.8333333333333335}),
                serde_json::json!({"id": 2, "budget": 1.0715660391465826e-75}),
                serde_json::json!({"id": 3, "budget": 0.1 + 0.2}),
                serde_json::json!({"id": 4, "budget": f64::MAX}),
                serde_json::json!({"id": 5, "budget": -5e-324}),
            ],
        );

        let (bytes, digest) = stamp(&doc)?;
        assert!(verify(&bytes, &digest.to_hex()));

        let parsed: Value = serde_json::from_slice(&bytes)?;
        assert_eq!(
            parsed.pointer("/data/measurements/1/budget").and_then(Value::as_f64),
            Some(1.0715660391465826e-75)
        );
        Ok(())
    }

    #[test]
    fn test_checksum_ignores_field_order() -> Result<()> {
        let a = serde_json::json!({"b": 1, "a": [1, 2]});
        let b: Value = serde_json::from_str(r#"{"a":[1,2],"b":1}"#)?;
        assert_eq!(checksum(&a)?, checksum(&b)?);
        Ok(())
    }

    #[test]
    fn test_any_single_byte_mutation_fails() -> Result<()> {
        let (bytes, digest) = stamp(&document())?;
        let claimed = digest.to_hex();

        for index in 0..bytes.len() {
            let mut mutated = bytes.clone();
            mutated[index] ^= 0x01;
            assert!(
                !verify(&mutated, &claimed),
                "mutation at byte {index} ({:?}) still verified",
                bytes[index] as char
            );
        }
        Ok(())
    }

    #[test]
    fn test_wrong_claim_fails() -> Result<()> {
        let (bytes, _) = stamp(&document())?;
        assert!(!verify(&bytes, &"0".repeat(64)));
        assert!(!verify(&bytes, ""));
        Ok(())
    }

    #[test]
    fn test_garbage_fails_closed() {
        assert!(!verify(b"not json at all", &"0".repeat(64)));
        assert!(!verify_artifact(b"{\"metadata\":{}}"));
        assert!(!verify_artifact(&[0xff, 0xfe, 0x00]));
    }

    #[test]
    fn test_stamp_requires_checksum_field() {
        let err = stamp(&serde_json::json!({"metadata": {"version": 1}})).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
