//! Public key records, histories and signature tokens.

use crate::error::{KeyError, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const ALGORITHM: &str = "ed25519";
const FINGERPRINT_BYTES: usize = 8;

/// Short stable identifier of a public key: first 8 bytes of its SHA-256, hex.
#[must_use]
pub fn fingerprint(key: &VerifyingKey) -> String {
    let digest = Sha256::digest(key.as_bytes());
    hex::encode(&digest[..FINGERPRINT_BYTES])
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyRecord {
    pub algorithm: String,
    pub fingerprint: String,
    /// Hex-encoded 32-byte public key.
    pub public_key: String,
    pub created_at: DateTime<Utc>,
}

impl PublicKeyRecord {
    #[must_use]
    pub fn new(key: &VerifyingKey, created_at: DateTime<Utc>) -> Self {
        Self {
            algorithm: ALGORITHM.to_string(),
            fingerprint: fingerprint(key),
            public_key: hex::encode(key.as_bytes()),
            created_at,
        }
    }

    /// Decodes the key and checks it against the stored fingerprint.
    ///
    /// # Errors
    /// [`KeyError::Malformed`] on a wrong algorithm, bad hex, an invalid
    /// curve point or a fingerprint mismatch.
    pub fn verifying_key(&self) -> Result<VerifyingKey> {
        if self.algorithm != ALGORITHM {
            return Err(KeyError::Malformed(format!(
                "unsupported algorithm {}",
                self.algorithm
            )));
        }
        let bytes = hex::decode(&self.public_key)
            .map_err(|e| KeyError::Malformed(format!("public key hex: {e}")))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| KeyError::Malformed("public key must be 32 bytes".into()))?;
        let key = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| KeyError::Malformed(format!("public key: {e}")))?;
        if fingerprint(&key) != self.fingerprint {
            return Err(KeyError::Malformed(format!(
                "fingerprint mismatch for {}",
                self.fingerprint
            )));
        }
        Ok(key)
    }
}

/// Every public key an author has ever published, oldest first.
///
/// Append-only: records are never removed or replaced, so messages signed
/// before a rotation keep verifying against the key that signed them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyHistory {
    pub author: String,
    pub keys: Vec<PublicKeyRecord>,
}

impl PublicKeyHistory {
    #[must_use]
    pub fn new(author: &str) -> Self {
        Self {
            author: author.to_string(),
            keys: Vec::new(),
        }
    }

    /// The record new signatures are made with.
    #[must_use]
    pub fn current(&self) -> Option<&PublicKeyRecord> {
        self.keys.last()
    }

    #[must_use]
    pub fn find(&self, fingerprint: &str) -> Option<&PublicKeyRecord> {
        self.keys.iter().find(|r| r.fingerprint == fingerprint)
    }

    /// Appends a record unless its fingerprint is already known.
    pub fn push(&mut self, record: PublicKeyRecord) -> bool {
        if self.find(&record.fingerprint).is_some() {
            return false;
        }
        self.keys.push(record);
        true
    }

    /// Merges `other` into `self`. Unknown, well-formed records are appended in
    /// `created_at` order; malformed ones are dropped. Returns how many were added.
    pub fn merge(&mut self, other: &Self) -> usize {
        let mut incoming: Vec<&PublicKeyRecord> = other
            .keys
            .iter()
            .filter(|r| self.find(&r.fingerprint).is_none())
            .filter(|r| match r.verifying_key() {
                Ok(_) => true,
                Err(e) => {
                    tracing::warn!(author = %self.author, error = %e, "dropping malformed public key record");
                    false
                }
            })
            .collect();
        incoming.sort_by_key(|r| r.created_at);
        let mut added = 0;
        for record in incoming {
            if self.push(record.clone()) {
                added += 1;
            }
        }
        added
    }
}

/// `ed25519:<fingerprint>:<base64 signature>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureToken {
    pub fingerprint: Option<String>,
    pub signature: Signature,
}

impl SignatureToken {
    #[must_use]
    pub fn new(fingerprint: &str, signature: Signature) -> Self {
        Self {
            fingerprint: Some(fingerprint.to_string()),
            signature,
        }
    }

    /// Accepts the full form or a bare base64 signature (no fingerprint).
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let (fingerprint, encoded) = match raw.split_once(':') {
            Some((ALGORITHM, rest)) => {
                let (fp, sig) = rest.split_once(':')?;
                (Some(fp.to_string()), sig)
            }
            Some(_) => return None,
            None => (None, raw),
        };
        let bytes = BASE64.decode(encoded).ok()?;
        let signature = Signature::from_slice(&bytes).ok()?;
        Some(Self {
            fingerprint,
            signature,
        })
    }

    #[must_use]
    pub fn encode(&self) -> String {
        let sig = BASE64.encode(self.signature.to_bytes());
        match &self.fingerprint {
            Some(fp) => format!("{ALGORITHM}:{fp}:{sig}"),
            None => sig,
        }
    }
}
