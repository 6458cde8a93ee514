//! Device registry — binds remote devices to local users.
//!
//! `register` creates a `pending` row and mints a fresh host binding keypair
//! for that device alone; the pair (device key, host key) identifies the
//! binding across restarts. A handshake whose offered keys do not match an
//! `active` row is rejected upstream.
//!
//! Caller contract: every write runs under the controller lock shared with
//! the chat store. The registry itself is lock-free.

use tracing::{debug, info, warn};

use rps_crypto::identity::{BindingKeyPair, PublicKeyBytes};

use crate::{
    db::Store,
    error::StoreError,
    models::{DeviceStatus, RemoteDeviceRow, UserRow},
};

#[derive(Clone)]
pub struct Registry {
    store: Store,
}

impl Registry {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Create a `pending` row for a new satellite and generate the host's
    /// keypair for this binding. Fails with `DuplicateDevice` if the device
    /// key already has an `active` row.
    pub async fn register(
        &self,
        name: &str,
        device_public_key: &PublicKeyBytes,
    ) -> Result<(i64, PublicKeyBytes), StoreError> {
        let existing: Option<(i64,)> = sqlx::query_as(
            "SELECT remote_device_id FROM remote_devices
             WHERE device_public_key = ? AND device_status = 'active'",
        )
        .bind(&device_public_key.0)
        .fetch_optional(&self.store.pool)
        .await?;

        if existing.is_some() {
            warn!(fingerprint = %device_public_key.fingerprint(), "duplicate device registration");
            return Err(StoreError::DuplicateDevice {
                fingerprint: device_public_key.fingerprint(),
            });
        }

        let host_keys = BindingKeyPair::generate();
        let row: (i64,) = sqlx::query_as(
            "INSERT INTO remote_devices
               (device_name, device_status, device_public_key, local_private_key, local_public_key)
             VALUES (?, 'pending', ?, ?, ?)
             RETURNING remote_device_id",
        )
        .bind(name)
        .bind(&device_public_key.0)
        .bind(host_keys.secret_bytes().as_slice())
        .bind(&host_keys.public.0)
        .fetch_one(&self.store.pool)
        .await?;

        info!(device_id = row.0, name, "registered pending remote device");
        Ok((row.0, host_keys.public.clone()))
    }

    /// `pending` → `active`.
    pub async fn confirm(&self, device_id: i64) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE remote_devices
             SET device_status = 'active', updated_at = datetime('now')
             WHERE remote_device_id = ? AND device_status = 'pending'",
        )
        .bind(device_id)
        .execute(&self.store.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("pending device {device_id}")));
        }
        info!(device_id, "remote device confirmed");
        Ok(())
    }

    /// Delete a `pending` row the user declined.
    pub async fn reject(&self, device_id: i64) -> Result<(), StoreError> {
        let result = sqlx::query(
            "DELETE FROM remote_devices
             WHERE remote_device_id = ? AND device_status = 'pending'",
        )
        .bind(device_id)
        .execute(&self.store.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("pending device {device_id}")));
        }
        info!(device_id, "remote device rejected");
        Ok(())
    }

    /// Find the binding for a satellite's long-lived key.
    pub async fn lookup(
        &self,
        device_public_key: &PublicKeyBytes,
    ) -> Result<RemoteDeviceRow, StoreError> {
        sqlx::query_as::<_, RemoteDeviceRow>(
            "SELECT * FROM remote_devices WHERE device_public_key = ?
             ORDER BY remote_device_id DESC LIMIT 1",
        )
        .bind(&device_public_key.0)
        .fetch_optional(&self.store.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound("unknown device key".into()))
    }

    pub async fn get(&self, device_id: i64) -> Result<RemoteDeviceRow, StoreError> {
        sqlx::query_as::<_, RemoteDeviceRow>(
            "SELECT * FROM remote_devices WHERE remote_device_id = ?",
        )
        .bind(device_id)
        .fetch_optional(&self.store.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("device {device_id}")))
    }

    /// Mark the device `revoked`. Open sessions for it are torn down by the
    /// transport on its next tick.
    pub async fn revoke(&self, device_id: i64) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE remote_devices
             SET device_status = 'revoked', updated_at = datetime('now')
             WHERE remote_device_id = ?",
        )
        .bind(device_id)
        .execute(&self.store.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("device {device_id}")));
        }
        info!(device_id, "remote device revoked");
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<RemoteDeviceRow>, StoreError> {
        Ok(sqlx::query_as::<_, RemoteDeviceRow>(
            "SELECT * FROM remote_devices ORDER BY remote_device_id",
        )
        .fetch_all(&self.store.pool)
        .await?)
    }

    pub async fn rename(&self, device_id: i64, name: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE remote_devices
             SET device_name = ?, updated_at = datetime('now')
             WHERE remote_device_id = ?",
        )
        .bind(name)
        .bind(device_id)
        .execute(&self.store.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("device {device_id}")));
        }
        Ok(())
    }

    /// Bump `updated_at` — called when a session for the device goes active.
    pub async fn touch(&self, device_id: i64) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE remote_devices SET updated_at = datetime('now')
             WHERE remote_device_id = ?",
        )
        .bind(device_id)
        .execute(&self.store.pool)
        .await?;
        Ok(())
    }

    /// Reconstruct the host's signing keypair for a binding.
    pub async fn host_keypair(&self, device_id: i64) -> Result<BindingKeyPair, StoreError> {
        let row = self.get(device_id).await?;
        if row.status()? == DeviceStatus::Revoked {
            return Err(StoreError::DeviceRevoked(device_id));
        }
        Ok(BindingKeyPair::from_bytes(&row.local_private_key)?)
    }

    // ── User bindings ────────────────────────────────────────────────────────

    /// Attach an existing local user to a device binding.
    pub async fn bind_user(
        &self,
        user_id: i64,
        device_id: i64,
        remote_user_id: i64,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE users SET remote_device_id = ?, remote_user_id = ? WHERE user_id = ?",
        )
        .bind(device_id)
        .bind(remote_user_id)
        .bind(user_id)
        .execute(&self.store.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("user {user_id}")));
        }
        debug!(user_id, device_id, remote_user_id, "bound user to remote device");
        Ok(())
    }

    /// Create a user row from a satellite announcement.
    pub async fn create_remote_user(
        &self,
        display_name: &str,
        device_id: i64,
        remote_user_id: i64,
    ) -> Result<i64, StoreError> {
        let row: (i64,) = sqlx::query_as(
            "INSERT INTO users (display_name, remote_device_id, remote_user_id)
             VALUES (?, ?, ?) RETURNING user_id",
        )
        .bind(display_name)
        .bind(device_id)
        .bind(remote_user_id)
        .fetch_one(&self.store.pool)
        .await?;
        Ok(row.0)
    }

    pub async fn users_for_device(&self, device_id: i64) -> Result<Vec<UserRow>, StoreError> {
        Ok(sqlx::query_as::<_, UserRow>(
            "SELECT user_id, display_name, remote_device_id, remote_user_id
             FROM users WHERE remote_device_id = ?",
        )
        .bind(device_id)
        .fetch_all(&self.store.pool)
        .await?)
    }

    /// Remove a device row entirely. User rows bound to it cascade away.
    pub async fn delete(&self, device_id: i64) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM remote_devices WHERE remote_device_id = ?")
            .bind(device_id)
            .execute(&self.store.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("device {device_id}")));
        }
        info!(device_id, "remote device deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use uuid::Uuid;

    async fn registry() -> (Registry, PathBuf) {
        let db_path = PathBuf::from(format!("/tmp/rps-store-test-{}.db", Uuid::new_v4()));
        let store = Store::open(&db_path).await.expect("open store");
        (Registry::new(store), db_path)
    }

    fn cleanup(db_path: &PathBuf) {
        let _ = std::fs::remove_file(db_path);
        let _ = std::fs::remove_file(db_path.with_extension("db-wal"));
        let _ = std::fs::remove_file(db_path.with_extension("db-shm"));
    }

    #[tokio::test]
    async fn register_confirm_lookup() {
        let (reg, db) = registry().await;
        let sat = BindingKeyPair::generate();

        let (id, host_pub) = reg.register("Desk", &sat.public).await.unwrap();
        assert_eq!(host_pub.0.len(), 32);

        let row = reg.lookup(&sat.public).await.unwrap();
        assert_eq!(row.remote_device_id, id);
        assert_eq!(row.status().unwrap(), DeviceStatus::Pending);
        assert_eq!(row.local_public_key, host_pub.0);

        reg.confirm(id).await.unwrap();
        let row = reg.lookup(&sat.public).await.unwrap();
        assert_eq!(row.status().unwrap(), DeviceStatus::Active);

        // Host keypair round-trips through the row.
        let keys = reg.host_keypair(id).await.unwrap();
        assert_eq!(keys.public, host_pub);
        cleanup(&db);
    }

    #[tokio::test]
    async fn duplicate_active_device_is_rejected() {
        let (reg, db) = registry().await;
        let sat = BindingKeyPair::generate();

        let (id, _) = reg.register("Desk", &sat.public).await.unwrap();
        reg.confirm(id).await.unwrap();

        let err = reg.register("Desk again", &sat.public).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateDevice { .. }));
        cleanup(&db);
    }

    #[tokio::test]
    async fn reject_deletes_pending_row() {
        let (reg, db) = registry().await;
        let sat = BindingKeyPair::generate();

        let (id, _) = reg.register("Desk", &sat.public).await.unwrap();
        reg.reject(id).await.unwrap();
        assert!(matches!(
            reg.lookup(&sat.public).await,
            Err(StoreError::NotFound(_))
        ));

        // Reject is only legal on pending rows.
        assert!(matches!(reg.reject(id).await, Err(StoreError::NotFound(_))));
        cleanup(&db);
    }

    #[tokio::test]
    async fn revoked_device_stays_revoked_and_loses_its_keys() {
        let (reg, db) = registry().await;
        let sat = BindingKeyPair::generate();

        let (id, _) = reg.register("Desk", &sat.public).await.unwrap();
        reg.confirm(id).await.unwrap();
        reg.revoke(id).await.unwrap();

        let row = reg.lookup(&sat.public).await.unwrap();
        assert_eq!(row.status().unwrap(), DeviceStatus::Revoked);
        assert!(matches!(
            reg.host_keypair(id).await,
            Err(StoreError::DeviceRevoked(_))
        ));
        cleanup(&db);
    }

    #[tokio::test]
    async fn deleting_device_cascades_to_bound_users() {
        let (reg, db) = registry().await;
        let sat = BindingKeyPair::generate();

        let (id, _) = reg.register("Desk", &sat.public).await.unwrap();
        reg.confirm(id).await.unwrap();

        let user = reg.create_remote_user("alice", id, 3).await.unwrap();
        assert_eq!(reg.users_for_device(id).await.unwrap().len(), 1);

        reg.delete(id).await.unwrap();

        let remaining: Option<(i64,)> =
            sqlx::query_as("SELECT user_id FROM users WHERE user_id = ?")
                .bind(user)
                .fetch_optional(&reg.store.pool)
                .await
                .unwrap();
        assert!(remaining.is_none(), "user row must cascade away with the device");
        cleanup(&db);
    }

    #[tokio::test]
    async fn rename_and_list() {
        let (reg, db) = registry().await;
        let sat = BindingKeyPair::generate();

        let (id, _) = reg.register("Desk", &sat.public).await.unwrap();
        reg.rename(id, "Living-room desk").await.unwrap();

        let all = reg.list().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].device_name, "Living-room desk");
        cleanup(&db);
    }
}
