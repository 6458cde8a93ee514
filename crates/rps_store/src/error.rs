use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Device already registered (fingerprint {fingerprint})")]
    DuplicateDevice { fingerprint: String },

    #[error("Device {0} is revoked")]
    DeviceRevoked(i64),

    #[error("Invalid device status: {0}")]
    InvalidStatus(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] rps_crypto::CryptoError),
}
