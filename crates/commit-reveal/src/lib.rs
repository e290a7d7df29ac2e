//! Commit-reveal randomness for allocation rounds.
//!
//! The operator generates a [`Secret`] when a round opens and publishes only
//! its [`Commitment`]. At close, a salt from a public randomness source is
//! mixed in via HMAC to produce the [`Combined`] value that drives winner
//! selection. Publishing the secret afterwards lets anyone check that the
//! commitment matched and that the selection was not steered: the operator
//! is bound before the salt exists and the salt provider never sees the
//! secret.

use {
    hmac::{Hmac, Mac},
    serde::{Deserialize, Serialize},
    sha2::{Digest, Sha256},
};

const SECRET_LEN: usize = 32;

/// The operator-side half of the randomness, hex-encoded.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Secret(String);

/// SHA-256 over the secret's hex encoding, itself hex-encoded. Safe to
/// publish at round creation.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Commitment(String);

/// HMAC-SHA256 of the public salt keyed by the secret, hex-encoded.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Combined(String);

impl Secret {
    pub fn generate() -> Self {
        let mut bytes = [0u8; SECRET_LEN];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut bytes);
        Self(hex::encode(bytes))
    }

    pub fn from_hex(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Commitment {
    pub fn from_hex(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Combined {
    pub fn from_hex(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Deterministically maps the combined randomness onto `[0, 1)`.
    ///
    /// Takes the first 8 digest bytes as a big-endian integer scaled by
    /// 2^64. Auditors re-run this on the published reveal, so the mapping
    /// must never change.
    pub fn to_unit_float(&self) -> f64 {
        let bytes = hex::decode(&self.0).unwrap_or_default();
        let mut head = [0u8; 8];
        for (i, b) in bytes.iter().take(8).enumerate() {
            head[i] = *b;
        }
        u64::from_be_bytes(head) as f64 / (u64::MAX as f64 + 1.0)
    }
}

/// Binds the operator to `secret` without disclosing it.
pub fn commit(secret: &Secret) -> Commitment {
    let digest = Sha256::digest(secret.as_str().as_bytes());
    Commitment(hex::encode(digest))
}

/// Mixes the operator secret with the public salt into the final randomness.
pub fn reveal(secret: &Secret, salt: &str) -> Combined {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_str().as_bytes())
        .expect("hmac accepts keys of any length");
    mac.update(salt.as_bytes());
    Combined(hex::encode(mac.finalize().into_bytes()))
}

/// Checks that a revealed secret matches the commitment published when the
/// round was created.
pub fn verify(commitment: &Commitment, secret: &Secret) -> bool {
    commit(secret) == *commitment
}
