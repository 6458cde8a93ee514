//! Database row models — these map to/from SQL rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Lifecycle of a registered remote device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Pending,
    Active,
    Revoked,
}

impl DeviceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceStatus::Pending => "pending",
            DeviceStatus::Active => "active",
            DeviceStatus::Revoked => "revoked",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "pending" => Ok(DeviceStatus::Pending),
            "active" => Ok(DeviceStatus::Active),
            "revoked" => Ok(DeviceStatus::Revoked),
            other => Err(StoreError::InvalidStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RemoteDeviceRow {
    pub remote_device_id: i64,
    pub device_name: String,
    pub device_status: String,
    /// Satellite's long-lived Ed25519 public key.
    pub device_public_key: Vec<u8>,
    /// Host's long-lived keypair for this binding — one pair per device.
    pub local_private_key: Vec<u8>,
    pub local_public_key: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RemoteDeviceRow {
    pub fn status(&self) -> Result<DeviceStatus, StoreError> {
        DeviceStatus::parse(&self.device_status)
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserRow {
    pub user_id: i64,
    pub display_name: String,
    /// Set when the user row was announced by a satellite; cascades away
    /// with the device row.
    pub remote_device_id: Option<i64>,
    /// The satellite-side integer the satellite uses for this user locally.
    pub remote_user_id: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip() {
        for s in [DeviceStatus::Pending, DeviceStatus::Active, DeviceStatus::Revoked] {
            assert_eq!(DeviceStatus::parse(s.as_str()).unwrap(), s);
        }
        assert!(DeviceStatus::parse("disabled").is_err());
    }
}
