use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::{Side, Signal};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Open,
    ClosedStop,
    ClosedTarget,
    ClosedManual,
    ClosedError,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "open",
            PositionStatus::ClosedStop => "closed_stop",
            PositionStatus::ClosedTarget => "closed_target",
            PositionStatus::ClosedManual => "closed_manual",
            PositionStatus::ClosedError => "closed_error",
        }
    }

    pub fn is_closed(&self) -> bool {
        !matches!(self, PositionStatus::Open)
    }
}

impl FromStr for PositionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(PositionStatus::Open),
            "closed_stop" => Ok(PositionStatus::ClosedStop),
            "closed_target" => Ok(PositionStatus::ClosedTarget),
            "closed_manual" => Ok(PositionStatus::ClosedManual),
            "closed_error" => Ok(PositionStatus::ClosedError),
            other => Err(anyhow::anyhow!("unknown position status: {other}")),
        }
    }
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A real-world trade opened by a client terminal from a distributed signal.
/// Carries no exit levels; those are decrypted per evaluation from the signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenPosition {
    pub id: Uuid,
    pub signal_id: Uuid,
    pub user_id: Uuid,
    pub device_id: Option<Uuid>,
    pub broker_account: Option<String>,
    pub instrument: String,
    pub side: Side,
    pub entry_price: Decimal,
    pub size: Decimal,
    pub broker_ticket: Option<String>,
    pub status: PositionStatus,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub close_price: Option<Decimal>,
    pub close_reason: Option<String>,
}

impl OpenPosition {
    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }
}

/// A terminal's report that it opened a trade for a signal.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionReport {
    pub signal_id: Uuid,
    pub user_id: Uuid,
    #[serde(default)]
    pub device_id: Option<Uuid>,
    #[serde(default)]
    pub broker_account: Option<String>,
    pub entry_price: Decimal,
    pub size: Decimal,
    #[serde(default)]
    pub broker_ticket: Option<String>,
}

/// Row to insert for a freshly opened position.
#[derive(Debug, Clone)]
pub struct NewPosition {
    pub signal_id: Uuid,
    pub user_id: Uuid,
    pub device_id: Option<Uuid>,
    pub broker_account: Option<String>,
    pub instrument: String,
    pub side: Side,
    pub entry_price: Decimal,
    pub size: Decimal,
    pub broker_ticket: Option<String>,
}

impl NewPosition {
    /// Instrument and side always come from the signal, never the terminal.
    pub fn from_execution(signal: &Signal, report: ExecutionReport) -> anyhow::Result<Self> {
        anyhow::ensure!(
            report.signal_id == signal.id,
            "execution report is for signal {}, not {}",
            report.signal_id,
            signal.id
        );
        anyhow::ensure!(report.size > Decimal::ZERO, "size must be positive");

        Ok(Self {
            signal_id: signal.id,
            user_id: report.user_id,
            device_id: report.device_id,
            broker_account: report.broker_account,
            instrument: signal.instrument.clone(),
            side: signal.side,
            entry_price: report.entry_price,
            size: report.size,
            broker_ticket: report.broker_ticket.filter(|t| !t.trim().is_empty()),
        })
    }
}

/// Database row for the positions table.
#[derive(Debug, Clone, FromRow)]
pub struct PositionRow {
    pub id: Uuid,
    pub signal_id: Uuid,
    pub user_id: Uuid,
    pub device_id: Option<Uuid>,
    pub broker_account: Option<String>,
    pub instrument: String,
    pub side: String,
    pub entry_price: Decimal,
    pub size: Decimal,
    pub broker_ticket: Option<String>,
    pub status: String,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub close_price: Option<Decimal>,
    pub close_reason: Option<String>,
}

impl TryFrom<PositionRow> for OpenPosition {
    type Error = anyhow::Error;

    fn try_from(row: PositionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            signal_id: row.signal_id,
            user_id: row.user_id,
            device_id: row.device_id,
            broker_account: row.broker_account,
            instrument: row.instrument,
            side: row.side.parse()?,
            entry_price: row.entry_price,
            size: row.size,
            broker_ticket: row.broker_ticket,
            status: row.status.parse()?,
            opened_at: row.opened_at,
            closed_at: row.closed_at,
            close_price: row.close_price,
            close_reason: row.close_reason,
        })
    }
}
