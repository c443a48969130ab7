//! Marketplace identities and signing.
//!
//! An identity is a pre-provisioned secp256k1 keypair bound to a marketplace
//! name. Provisioning (and true WIF encoding) is handled by an external tool;
//! the dispatcher loads `keys.json` records whose `wif` field carries the
//! hex-encoded 32-byte secret, signs with EIP-191 `sign_message`, and
//! verifies by address recovery.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use alloy::primitives::Address;
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::{Signature, SignerSync};
use serde::{Deserialize, Serialize};

use crate::config::DispatcherConfig;
use crate::error::DispatcherError;

/// On-disk identity record (`${AGENTS_DIR}/<agentId>/keys.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityRecord {
    pub agent_id: String,
    pub identity_name: String,
    #[serde(default)]
    pub address: String,
    pub i_address: String,
    pub wif: String,
    #[serde(default = "default_network")]
    pub network: String,
}

fn default_network() -> String {
    "mainnet".to_string()
}

/// A loaded identity: the record plus its signer. Immutable after load.
pub struct Identity {
    record: IdentityRecord,
    signer: PrivateKeySigner,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("agent_id", &self.record.agent_id)
            .field("identity_name", &self.record.identity_name)
            .finish_non_exhaustive()
    }
}

impl Identity {
    pub fn from_record(record: IdentityRecord) -> Result<Self, DispatcherError> {
        let raw = record.wif.trim_start_matches("0x");
        let bytes = hex::decode(raw).map_err(|e| {
            DispatcherError::Identity(format!("{}: key is not valid hex: {e}", record.agent_id))
        })?;
        let signer = PrivateKeySigner::from_slice(&bytes).map_err(|e| {
            DispatcherError::Identity(format!("{}: invalid signing key: {e}", record.agent_id))
        })?;
        Ok(Self { record, signer })
    }

    pub fn agent_id(&self) -> &str {
        &self.record.agent_id
    }

    pub fn identity_name(&self) -> &str {
        &self.record.identity_name
    }

    pub fn i_address(&self) -> &str {
        &self.record.i_address
    }

    /// The address recoverable from this identity's signatures.
    pub fn address(&self) -> Address {
        self.signer.address()
    }

    /// Sign an arbitrary message, returning the 65-byte signature as
    /// 0x-prefixed hex.
    pub fn sign(&self, message: &[u8]) -> Result<String, DispatcherError> {
        let signature = self
            .signer
            .sign_message_sync(message)
            .map_err(|e| DispatcherError::Signing(e.to_string()))?;
        Ok(format!("0x{}", hex::encode(signature.as_bytes())))
    }
}

/// Verify a hex signature over `message` against an identity address.
pub fn verify_signature(address: Address, message: &[u8], signature_hex: &str) -> bool {
    let raw = signature_hex.strip_prefix("0x").unwrap_or(signature_hex);
    let Ok(bytes) = hex::decode(raw) else {
        return false;
    };
    let Ok(signature) = Signature::try_from(bytes.as_slice()) else {
        return false;
    };
    signature
        .recover_address_from_msg(message)
        .map(|recovered| recovered == address)
        .unwrap_or(false)
}

/// Load the identity pool.
///
/// With `AGENTS_DIR` set, every `<agentId>/keys.json` under it is loaded;
/// otherwise the single `VAP_KEYS_FILE` is used. An empty pool is fatal.
pub fn load_pool(config: &DispatcherConfig) -> Result<Vec<Arc<Identity>>, DispatcherError> {
    let mut pool = Vec::new();

    if let Some(dir) = &config.agents_dir {
        for entry in fs::read_dir(dir)? {
            let keys = entry?.path().join("keys.json");
            if keys.is_file() {
                pool.push(load_keys_file(&keys)?);
            }
        }
    } else if let Some(file) = &config.keys_file {
        pool.push(load_keys_file(file)?);
    }

    if pool.is_empty() {
        return Err(DispatcherError::Identity(
            "identity pool is empty — nothing to dispatch with".into(),
        ));
    }

    // Cross-check the env-declared primary identity against what was
    // actually loaded; a mismatch usually means the wrong keys tree.
    if let Some(expected) = &config.identity_name {
        if !pool.iter().any(|i| i.identity_name() == expected) {
            return Err(DispatcherError::Identity(format!(
                "VAP_IDENTITY {expected} not found in the loaded identity pool"
            )));
        }
    }
    if let Some(expected) = &config.i_address {
        if !pool.iter().any(|i| i.i_address() == expected) {
            return Err(DispatcherError::Identity(format!(
                "VAP_I_ADDRESS {expected} not found in the loaded identity pool"
            )));
        }
    }

    pool.sort_by(|a, b| a.agent_id().cmp(b.agent_id()));
    Ok(pool)
}

fn load_keys_file(path: &Path) -> Result<Arc<Identity>, DispatcherError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(meta) = fs::metadata(path) {
            let mode = meta.permissions().mode() & 0o777;
            if mode & 0o077 != 0 {
                let mode = format!("{mode:o}");
                tracing::warn!(path = %path.display(), mode = %mode, "keys file is readable by others, expected 0600");
            }
        }
    }

    let raw = fs::read_to_string(path)?;
    let record: IdentityRecord = serde_json::from_str(&raw).map_err(|e| {
        DispatcherError::Identity(format!("{}: malformed keys.json: {e}", path.display()))
    })?;
    let identity = Identity::from_record(record)?;
    tracing::debug!(agent_id = identity.agent_id(), identity = identity.identity_name(), "loaded identity");
    Ok(Arc::new(identity))
}

#[cfg(test)]
pub(crate) const TEST_KEY: &str =
    "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d";

#[cfg(test)]
pub(crate) fn test_identity() -> Identity {
    Identity::from_record(IdentityRecord {
        agent_id: "agent-test".into(),
        identity_name: "testagent@".into(),
        address: String::new(),
        i_address: "iTestAddress111".into(),
        wif: TEST_KEY.into(),
        network: "testnet".into(),
    })
    .unwrap()
}
