//! Integration signatures
//!
//! A signature is an HMAC-SHA256 over the canonical manifest subset
//! (name, version, author, tools). Trust is decided by a pluggable
//! [`SignatureVerifier`]; the default keeps an in-memory trusted set.

use crate::{models::Integration, Result, RuntimeError};
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

type HmacSha256 = Hmac<Sha256>;

/// Canonical bytes covered by a signature
pub fn canonical_payload(integration: &Integration) -> Result<Vec<u8>> {
    let payload = json!({
        "name": integration.name,
        "version": integration.version,
        "author": integration.author,
        "tools": integration.tools,
    });
    Ok(serde_json::to_vec(&payload)?)
}

/// SHA-256 of the canonical payload, hex encoded
pub fn content_digest(integration: &Integration) -> Result<String> {
    let payload = canonical_payload(integration)?;
    Ok(hex::encode(Sha256::digest(&payload)))
}

/// Sign the canonical payload with `key`
pub fn sign(integration: &Integration, key: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|_| RuntimeError::Config("Invalid signing key".to_string()))?;
    mac.update(&canonical_payload(integration)?);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Check `signature` was produced by `key` over the integration's current content
pub fn verify_with_key(integration: &Integration, signature: &str, key: &[u8]) -> bool {
    let Ok(expected) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(key) else {
        return false;
    };
    let Ok(payload) = canonical_payload(integration) else {
        return false;
    };
    mac.update(&payload);
    mac.verify_slice(&expected).is_ok()
}

/// Decides whether a signature is trusted
pub trait SignatureVerifier: Send + Sync + std::fmt::Debug {
    /// Whether `signature` is trusted for content with `digest`
    fn is_trusted(&self, signature: &str, digest: &str) -> bool;

    /// Trust `signature`, optionally bound to one content digest
    fn trust(&self, signature: String, digest: Option<String>);

    /// Withdraw trust
    fn revoke(&self, signature: &str) -> bool;
}

/// In-memory trusted signature set
///
/// Entries trusted through [`SignatureVerifier::trust`] with a digest only
/// verify for that exact content. Entries seeded from configuration are
/// unbound and rely on the signing key for tamper detection.
#[derive(Debug, Default)]
pub struct TrustedSignatureSet {
    entries: RwLock<HashMap<String, Option<String>>>,
}

impl TrustedSignatureSet {
    pub fn new<I>(signatures: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        Self {
            entries: RwLock::new(signatures.into_iter().map(|sig| (sig, None)).collect()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl SignatureVerifier for TrustedSignatureSet {
    fn is_trusted(&self, signature: &str, digest: &str) -> bool {
        match self.entries.read().get(signature) {
            Some(Some(bound)) => bound == digest,
            Some(None) => true,
            None => false,
        }
    }

    fn trust(&self, signature: String, digest: Option<String>) {
        self.entries.write().insert(signature, digest);
    }

    fn revoke(&self, signature: &str) -> bool {
        self.entries.write().remove(signature).is_some()
    }
}
