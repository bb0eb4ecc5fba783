use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::PositionStatus;

/// Namespace for deriving close command ids from position ids.
const COMMAND_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a4e_93b7_4d0a_8e55_1b7c_c0de_e417);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    StopLoss,
    TakeProfit,
    Manual,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::StopLoss => "stop_loss",
            CloseReason::TakeProfit => "take_profit",
            CloseReason::Manual => "manual",
        }
    }

    /// Ledger status a successful close with this reason lands in.
    pub fn closed_status(&self) -> PositionStatus {
        match self {
            CloseReason::StopLoss => PositionStatus::ClosedStop,
            CloseReason::TakeProfit => PositionStatus::ClosedTarget,
            CloseReason::Manual => PositionStatus::ClosedManual,
        }
    }
}

impl FromStr for CloseReason {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stop_loss" => Ok(CloseReason::StopLoss),
            "take_profit" => Ok(CloseReason::TakeProfit),
            "manual" => Ok(CloseReason::Manual),
            other => Err(anyhow::anyhow!("unknown close reason: {other}")),
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Executed,
    Failed,
    Superseded,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Executed => "executed",
            CommandStatus::Failed => "failed",
            CommandStatus::Superseded => "superseded",
        }
    }
}

impl FromStr for CommandStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(CommandStatus::Pending),
            "executed" => Ok(CommandStatus::Executed),
            "failed" => Ok(CommandStatus::Failed),
            "superseded" => Ok(CommandStatus::Superseded),
            other => Err(anyhow::anyhow!("unknown command status: {other}")),
        }
    }
}

/// Idempotent instruction to close one position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseCommand {
    pub id: Uuid,
    pub position_id: Uuid,
    pub device_id: Option<Uuid>,
    pub broker_ticket: Option<String>,
    pub reason: CloseReason,
    /// Operator note for manual closes.
    pub note: Option<String>,
    pub observed_price: Decimal,
    pub status: CommandStatus,
    pub delivery_count: i32,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub close_price: Option<Decimal>,
    pub error: Option<String>,
}

impl CloseCommand {
    /// Every dispatch attempt for a position uses this id, so retried
    /// delivery can never mint a second command.
    pub fn id_for(position_id: Uuid) -> Uuid {
        Uuid::new_v5(&COMMAND_NAMESPACE, position_id.as_bytes())
    }

    pub fn new(
        position_id: Uuid,
        device_id: Option<Uuid>,
        broker_ticket: Option<String>,
        reason: CloseReason,
        observed_price: Decimal,
    ) -> Self {
        Self {
            id: Self::id_for(position_id),
            position_id,
            device_id,
            broker_ticket,
            reason,
            note: None,
            observed_price,
            status: CommandStatus::Pending,
            delivery_count: 0,
            created_at: Utc::now(),
            delivered_at: None,
            acknowledged_at: None,
            close_price: None,
            error: None,
        }
    }

    pub fn with_note(mut self, note: Option<&str>) -> Self {
        self.note = note.map(str::to_string);
        self
    }

    /// Text recorded as the position's close reason.
    pub fn ledger_reason(&self) -> String {
        ledger_reason(self.reason, self.note.as_deref())
    }

    pub fn is_pending(&self) -> bool {
        self.status == CommandStatus::Pending
    }

    /// Pending for longer than `ttl` without an acknowledgment.
    pub fn is_stale(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        self.is_pending() && now - self.created_at >= ttl
    }

    /// The shape handed to a polling terminal. Observed price stays server-side
    /// because it sits right next to the hidden level that fired.
    pub fn to_terminal(&self) -> TerminalCommand {
        TerminalCommand {
            command_id: self.id,
            position_id: self.position_id,
            broker_ticket: self.broker_ticket.clone(),
            reason: self.reason,
        }
    }
}

pub fn ledger_reason(reason: CloseReason, note: Option<&str>) -> String {
    match note {
        Some(note) if !note.trim().is_empty() => format!("{}: {}", reason, note.trim()),
        _ => reason.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalCommand {
    pub command_id: Uuid,
    pub position_id: Uuid,
    pub broker_ticket: Option<String>,
    pub reason: CloseReason,
}

/// Terminal-reported outcome for a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Executed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandAck {
    pub status: AckStatus,
    #[serde(default)]
    pub close_price: Option<Decimal>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Database row for the close_commands table.
#[derive(Debug, Clone, FromRow)]
pub struct CloseCommandRow {
    pub id: Uuid,
    pub position_id: Uuid,
    pub device_id: Option<Uuid>,
    pub broker_ticket: Option<String>,
    pub reason: String,
    pub note: Option<String>,
    pub observed_price: Decimal,
    pub status: String,
    pub delivery_count: i32,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub close_price: Option<Decimal>,
    pub error: Option<String>,
}

impl TryFrom<CloseCommandRow> for CloseCommand {
    type Error = anyhow::Error;

    fn try_from(row: CloseCommandRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            position_id: row.position_id,
            device_id: row.device_id,
            broker_ticket: row.broker_ticket,
            reason: row.reason.parse()?,
            note: row.note,
            observed_price: row.observed_price,
            status: row.status.parse()?,
            delivery_count: row.delivery_count,
            created_at: row.created_at,
            delivered_at: row.delivered_at,
            acknowledged_at: row.acknowledged_at,
            close_price: row.close_price,
            error: row.error,
        })
    }
}
