//! Signed creation/deletion records for per-job sandboxes.
//!
//! Each document is signed by the job's assigned identity: the `signature`
//! field is removed, the remainder is serialised canonically (serde_json's
//! object map is BTree-backed, so keys always serialise sorted), the SHA-256
//! hex digest of that serialisation is signed, and the signature is embedded
//! back into the document. Verification recovers the identity address.

use std::fs;
use std::path::Path;

use alloy::primitives::Address;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::error::DispatcherError;
use crate::identity::{verify_signature, Identity};

pub const CREATION_FILE: &str = "creation-attestation.json";
pub const DELETION_FILE: &str = "deletion-attestation.json";

pub const TYPE_CREATED: &str = "container:created";
pub const TYPE_DESTROYED: &str = "container:destroyed";
pub const TYPE_DESTROYED_TIMEOUT: &str = "container:destroyed:timeout";

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Canonical serialisation of a JSON value: sorted object keys, no
/// insignificant whitespace.
pub fn canonical_json(value: &Value) -> Result<String, DispatcherError> {
    Ok(serde_json::to_string(value)?)
}

/// Locally computed job hash embedded in creation attestations.
///
/// Distinct from the marketplace-supplied `jobHash` used in acceptance
/// messages.
pub fn local_job_hash(
    job_id: &str,
    description: &str,
    buyer: &str,
    amount: &Decimal,
    currency: &str,
    timestamp: i64,
) -> Result<String, DispatcherError> {
    let payload = json!({
        "jobId": job_id,
        "description": description,
        "buyer": buyer,
        "amount": amount,
        "currency": currency,
        "timestamp": timestamp,
    });
    Ok(sha256_hex(canonical_json(&payload)?.as_bytes()))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    pub memory: String,
    pub cpus: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreationAttestation {
    #[serde(rename = "type")]
    pub kind: String,
    pub job_id: String,
    pub container_id: String,
    pub agent_id: String,
    pub identity: String,
    pub created_at: String,
    pub job_hash: String,
    pub limits: ResourceLimits,
    pub privacy_tier: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletionAttestation {
    #[serde(rename = "type")]
    pub kind: String,
    pub job_id: String,
    pub container_id: String,
    pub created_at: String,
    pub destroyed_at: String,
    pub data_volumes: Vec<String>,
    pub deletion_method: String,
    pub transcript_sha256: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// Sign a document in place: strip `signature`, digest the canonical
/// payload, sign the digest, embed the signature.
pub fn sign_document(identity: &Identity, document: &mut Value) -> Result<(), DispatcherError> {
    let obj = document
        .as_object_mut()
        .ok_or_else(|| DispatcherError::Serialization("attestation must be a JSON object".into()))?;
    obj.remove("signature");
    let digest = sha256_hex(canonical_json(document)?.as_bytes());
    let signature = identity.sign(digest.as_bytes())?;
    if let Some(obj) = document.as_object_mut() {
        obj.insert("signature".to_string(), Value::String(signature));
    }
    Ok(())
}

/// Verify a signed document against an identity address.
pub fn verify_document(address: Address, document: &Value) -> bool {
    let Some(signature) = document.get("signature").and_then(Value::as_str) else {
        return false;
    };
    let mut stripped = document.clone();
    let Some(obj) = stripped.as_object_mut() else {
        return false;
    };
    obj.remove("signature");
    let Ok(canonical) = canonical_json(&stripped) else {
        return false;
    };
    let digest = sha256_hex(canonical.as_bytes());
    verify_signature(address, digest.as_bytes(), signature)
}

/// Persist an attestation into the job directory.
pub fn write_attestation(
    job_dir: &Path,
    file_name: &str,
    document: &Value,
) -> Result<(), DispatcherError> {
    fs::create_dir_all(job_dir)?;
    fs::write(job_dir.join(file_name), serde_json::to_vec_pretty(document)?)?;
    Ok(())
}
