//! Signature verification seams for job specs and execution receipts.
//!
//! Spec signatures cover the exact canonical bytes the client submitted.
//! Receipt signatures cover the canonical JSON form of the receipt document
//! with its `signature` field removed; canonical JSON means recursively
//! key-sorted objects with no insignificant whitespace.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ed25519_dalek::{Signature, Verifier, VerifyingKey, PUBLIC_KEY_LENGTH};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("malformed signature material: {0}")]
    Malformed(String),
    #[error("signature does not match payload")]
    Mismatch,
}

#[derive(Debug, Error)]
pub enum ReceiptError {
    #[error("receipt is not signed")]
    Unsigned,
    #[error("receipt is not a JSON object")]
    NotAnObject,
    #[error(transparent)]
    Signature(#[from] SignatureError),
}

/// Verifies a detached signature over a byte payload.
pub trait SignatureVerifier: Send + Sync {
    fn verify(
        &self,
        message: &[u8],
        signature_b64: &str,
        public_key_b64: &str,
    ) -> Result<(), SignatureError>;
}

/// Ed25519 verification over base64-encoded key and signature material.
#[derive(Debug, Clone, Default)]
pub struct Ed25519Verifier;

impl SignatureVerifier for Ed25519Verifier {
    fn verify(
        &self,
        message: &[u8],
        signature_b64: &str,
        public_key_b64: &str,
    ) -> Result<(), SignatureError> {
        let key_bytes = BASE64
            .decode(public_key_b64.trim())
            .map_err(|e| SignatureError::Malformed(format!("public key: {e}")))?;
        let key_bytes: [u8; PUBLIC_KEY_LENGTH] = key_bytes
            .try_into()
            .map_err(|_| SignatureError::Malformed("public key must be 32 bytes".to_string()))?;
        let key = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|e| SignatureError::Malformed(format!("public key: {e}")))?;

        let sig_bytes = BASE64
            .decode(signature_b64.trim())
            .map_err(|e| SignatureError::Malformed(format!("signature: {e}")))?;
        let signature = Signature::from_slice(&sig_bytes)
            .map_err(|e| SignatureError::Malformed(format!("signature: {e}")))?;

        key.verify(message, &signature)
            .map_err(|_| SignatureError::Mismatch)
    }
}

/// Recursively sort object keys so serialization is canonical.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted: Vec<(&String, &Value)> = map.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                sorted
                    .into_iter()
                    .map(|(k, v)| (k.clone(), canonicalize(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// The bytes a receipt's signature covers: the canonical JSON of the
/// document with `signature` removed.
pub fn receipt_signing_bytes(receipt: &Value) -> Result<Vec<u8>, ReceiptError> {
    let Value::Object(map) = receipt else {
        return Err(ReceiptError::NotAnObject);
    };
    let mut stripped = map.clone();
    stripped.remove("signature");
    let canonical = canonicalize(&Value::Object(stripped));
    Ok(canonical.to_string().into_bytes())
}

/// Verify a signed receipt document. The receipt must carry base64
/// `signature` and `public_key` string fields.
pub fn verify_receipt(
    verifier: &dyn SignatureVerifier,
    receipt: &Value,
) -> Result<(), ReceiptError> {
    let signature = receipt
        .get("signature")
        .and_then(Value::as_str)
        .ok_or(ReceiptError::Unsigned)?;
    let public_key = receipt
        .get("public_key")
        .and_then(Value::as_str)
        .ok_or(ReceiptError::Unsigned)?;

    let message = receipt_signing_bytes(receipt)?;
    verifier.verify(&message, signature, public_key)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    fn signed_receipt() -> Value {
        let signing_key = SigningKey::from_bytes(&[7u8; 32]);
        let mut receipt = serde_json::json!({
            "receipt_id": "rcpt-1",
            "job_id": "who-are-you-1",
            "execution": {
                "model": "llama3.2-1b",
                "region": "US",
                "question_id": "identity_basic",
                "provider_id": "modal-us-east"
            },
            "prompt_digest": "ab",
            "response_digest": "cd",
            "public_key": BASE64.encode(signing_key.verifying_key().as_bytes()),
        });
        let message = receipt_signing_bytes(&receipt).unwrap();
        let signature = signing_key.sign(&message);
        receipt["signature"] = Value::String(BASE64.encode(signature.to_bytes()));
        receipt
    }

    #[test]
    fn canonicalize_sorts_nested_keys() {
        let value = serde_json::json!({"b": {"z": 1, "a": 2}, "a": [ {"y": 1, "x": 2} ]});
        let canonical = canonicalize(&value).to_string();
        assert_eq!(canonical, r#"{"a":[{"x":2,"y":1}],"b":{"a":2,"z":1}}"#);
    }

    #[test]
    fn valid_receipt_verifies() {
        let receipt = signed_receipt();
        verify_receipt(&Ed25519Verifier, &receipt).expect("receipt verifies");
    }

    #[test]
    fn tampered_receipt_is_rejected() {
        let mut receipt = signed_receipt();
        receipt["execution"]["region"] = Value::String("EU".to_string());
        let err = verify_receipt(&Ed25519Verifier, &receipt).unwrap_err();
        assert!(matches!(err, ReceiptError::Signature(SignatureError::Mismatch)));
    }

    #[test]
    fn unsigned_receipt_is_reported_as_unsigned() {
        let mut receipt = signed_receipt();
        receipt.as_object_mut().unwrap().remove("signature");
        assert!(matches!(
            verify_receipt(&Ed25519Verifier, &receipt),
            Err(ReceiptError::Unsigned)
        ));
    }

    #[test]
    fn garbage_key_material_is_malformed() {
        let mut receipt = signed_receipt();
        receipt["public_key"] = Value::String("not base64!!!".to_string());
        assert!(matches!(
            verify_receipt(&Ed25519Verifier, &receipt),
            Err(ReceiptError::Signature(SignatureError::Malformed(_)))
        ));
    }
}
