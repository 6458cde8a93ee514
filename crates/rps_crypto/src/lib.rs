//! rps_crypto — cryptographic primitives for remote profile sessions
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited Rust crates.
//! - Zeroize all secret material on drop.
//! - Long-lived keys only ever *sign*; confidentiality always comes from a
//!   fresh ephemeral Diffie-Hellman per connection.
//!
//! # Module layout
//! - `identity`  — long-lived Ed25519 binding keys (one pair per remote device)
//! - `handshake` — ephemeral X25519 agreement with signed ephemerals
//! - `record`    — ChaCha20-Poly1305 record protection, counter nonces
//! - `kdf`       — HKDF-SHA256 key schedule helpers
//! - `error`     — unified error type

pub mod error;
pub mod handshake;
pub mod identity;
pub mod kdf;
pub mod record;

pub use error::CryptoError;
