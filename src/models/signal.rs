use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::Side;

/// The visible half of a signal. The owner-only exit levels are sealed into
/// `signal_exits`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: Uuid,
    pub instrument: String,
    pub side: Side,
    pub entry_price: Decimal,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Database row for the signals table.
#[derive(Debug, Clone, FromRow)]
pub struct SignalRow {
    pub id: Uuid,
    pub instrument: String,
    pub side: String,
    pub entry_price: Decimal,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<SignalRow> for Signal {
    type Error = anyhow::Error;

    fn try_from(row: SignalRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            instrument: row.instrument,
            side: row.side.parse()?,
            entry_price: row.entry_price,
            metadata: row.metadata,
            created_at: row.created_at,
        })
    }
}

/// Owner-only exit levels. Exists in plaintext only inside the monitor process.
/// Serialized only by the vault, right before sealing.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitLevels {
    pub stop: Decimal,
    pub target: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ExitLevels {
    /// Levels must sit on the correct side of each other for `side`. The
    /// error text never echoes the levels.
    pub fn validate(&self, side: Side) -> Result<(), String> {
        if self.stop <= Decimal::ZERO || self.target <= Decimal::ZERO {
            return Err("exit levels must be positive".into());
        }
        let ordered = match side {
            Side::Long => self.stop < self.target,
            Side::Short => self.stop > self.target,
        };
        if !ordered {
            return Err(format!("stop and target are inverted for a {side} signal"));
        }
        Ok(())
    }
}

impl std::fmt::Debug for ExitLevels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Keep the levels out of logs.
        f.debug_struct("ExitLevels").finish_non_exhaustive()
    }
}
