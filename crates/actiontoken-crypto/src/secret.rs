//! Bearer secret generation
//!
//! Secrets come straight from the OS CSPRNG (`ring::rand::SystemRandom`).
//! Raw bytes live in a `Zeroizing` buffer and are scrubbed once hex-encoded.

use ring::rand::{SecureRandom, SystemRandom};
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::Zeroizing;

/// 256 bits of entropy per secret
pub const SECRET_BYTES: usize = 32;
/// Length of the hex-encoded secret
pub const SECRET_LEN: usize = SECRET_BYTES * 2;

#[derive(Error, Debug)]
pub enum SecretError {
    #[error("System random source unavailable")]
    RandomUnavailable,
}

/// Generate a fresh opaque bearer secret (64 lowercase hex chars)
pub fn generate_secret() -> Result<String, SecretError> {
    let mut bytes = Zeroizing::new([0u8; SECRET_BYTES]);
    SystemRandom::new().fill(&mut bytes[..]).map_err(|_| {
        tracing::error!("system random source failed while generating a token secret");
        SecretError::RandomUnavailable
    })?;
    Ok(hex::encode(&bytes[..]))
}

/// Compare a presented secret against a stored one without leaking
/// the position of the first mismatch.
pub fn secrets_match(presented: &str, stored: &str) -> bool {
    if stored.is_empty() {
        return false;
    }
    presented.as_bytes().ct_eq(stored.as_bytes()).into()
}
