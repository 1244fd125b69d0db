//! ActionToken Crypto - credential generation
//!
//! This crate provides:
//! - Cryptographically secure bearer secrets
//! - Constant-time secret comparison

pub mod secret;

pub use secret::{generate_secret, secrets_match, SecretError, SECRET_LEN};
