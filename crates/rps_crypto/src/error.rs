use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Signature verification failed")]
    SignatureVerification,

    #[error("Record seal failed")]
    RecordSeal,

    #[error("Record open failed (authentication tag mismatch — possible tampering)")]
    RecordOpen,

    #[error("Record counter regression: last seen {last}, got {got}")]
    CounterRegression { last: u64, got: u64 },

    #[error("Record counter exhausted")]
    CounterExhausted,

    #[error("Record truncated: {0} bytes")]
    RecordTruncated(usize),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
}
