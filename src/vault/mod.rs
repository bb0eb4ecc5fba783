//! Owner-only exit levels, sealed at rest and opened only inside the monitor.
//!
//! Nothing served to a client terminal may call [`ExitStore::load`]; the HTTP
//! layer only exposes the write path.

pub mod cipher;

pub use cipher::ExitCipher;

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use crate::db::exit_repo;
use crate::models::ExitLevels;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("no exit levels stored for signal {0}")]
    NotFound(Uuid),

    #[error("exit levels for signal {0} are already sealed")]
    AlreadySealed(Uuid),

    #[error("exit levels for signal {signal_id} failed to decrypt: {detail}")]
    Decryption { signal_id: Uuid, detail: String },

    #[error("exit levels could not be sealed: {0}")]
    Encryption(String),

    #[error("invalid exit key: {0}")]
    InvalidKey(String),

    #[error("exit store I/O failed: {0}")]
    Storage(#[from] anyhow::Error),
}

#[async_trait]
pub trait ExitStore: Send + Sync {
    /// Seal levels for a signal once. A second call fails with
    /// [`VaultError::AlreadySealed`].
    async fn store(&self, signal_id: Uuid, levels: &ExitLevels) -> Result<(), VaultError>;

    async fn load(&self, signal_id: Uuid) -> Result<ExitLevels, VaultError>;
}

/// Outcome of a key rotation sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RotationReport {
    pub rewritten: usize,
    pub already_current: usize,
    pub failed: usize,
    /// Blobs that changed underneath the sweep and were left as found.
    pub raced: usize,
}

/// Exit store backed by the `signal_exits` table.
#[derive(Clone)]
pub struct PgExitStore {
    pool: PgPool,
    cipher: Arc<ExitCipher>,
}

impl PgExitStore {
    pub fn new(pool: PgPool, cipher: Arc<ExitCipher>) -> Self {
        Self { pool, cipher }
    }

    /// Re-seal every blob not sealed with the active key. Blobs that fail to
    /// open are left untouched and counted.
    pub async fn reencrypt_all(&self) -> Result<RotationReport, VaultError> {
        let mut report = RotationReport::default();

        for (signal_id, blob) in exit_repo::list_exit_blobs(&self.pool).await? {
            if self.cipher.is_current(&blob) {
                report.already_current += 1;
                continue;
            }

            let levels = match self.cipher.open(signal_id, &blob) {
                Ok(l) => l,
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        signal_id = %signal_id,
                        alert = true,
                        "Key rotation: blob could not be opened with any known key"
                    );
                    report.failed += 1;
                    continue;
                }
            };

            let resealed = self.cipher.seal(signal_id, &levels)?;
            let swapped = exit_repo::replace_exit_blob(
                &self.pool,
                signal_id,
                &blob,
                &resealed,
                i16::from(self.cipher.active_key_id()),
            )
            .await?;
            if swapped {
                report.rewritten += 1;
            } else {
                tracing::warn!(signal_id = %signal_id, "Key rotation: blob changed during sweep, skipped");
                report.raced += 1;
            }
        }

        tracing::info!(
            rewritten = report.rewritten,
            already_current = report.already_current,
            failed = report.failed,
            raced = report.raced,
            active_key_id = self.cipher.active_key_id(),
            "Exit key rotation finished"
        );

        Ok(report)
    }
}

#[async_trait]
impl ExitStore for PgExitStore {
    async fn store(&self, signal_id: Uuid, levels: &ExitLevels) -> Result<(), VaultError> {
        let blob = self.cipher.seal(signal_id, levels)?;
        let inserted = exit_repo::insert_exit_blob(
            &self.pool,
            signal_id,
            &blob,
            i16::from(self.cipher.active_key_id()),
        )
        .await?;
        if !inserted {
            return Err(VaultError::AlreadySealed(signal_id));
        }
        Ok(())
    }

    async fn load(&self, signal_id: Uuid) -> Result<ExitLevels, VaultError> {
        let blob = exit_repo::get_exit_blob(&self.pool, signal_id)
            .await?
            .ok_or(VaultError::NotFound(signal_id))?;
        self.cipher.open(signal_id, &blob)
    }
}
