//! Repository interfaces the monitor runs against. Postgres implementations
//! live in `crate::db`; the scheduler itself keeps no persistent state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::models::{CloseCommand, CommandAck, NewPosition, OpenPosition, PositionStatus, Signal};

/// The single status change a position ever makes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub status: PositionStatus,
    pub close_price: Option<Decimal>,
    pub reason: String,
    pub at: DateTime<Utc>,
}

impl Transition {
    /// Rejects `open` as a target; a transition always leaves `open`.
    pub fn new(
        status: PositionStatus,
        close_price: Option<Decimal>,
        reason: impl Into<String>,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(status.is_closed(), "transition target must be a closed status");
        Ok(Self {
            status,
            close_price,
            reason: reason.into(),
            at: Utc::now(),
        })
    }
}

#[async_trait]
pub trait PositionLedger: Send + Sync {
    async fn list_open(&self) -> anyhow::Result<Vec<OpenPosition>>;

    async fn list(
        &self,
        status: Option<PositionStatus>,
        limit: i64,
    ) -> anyhow::Result<Vec<OpenPosition>>;

    async fn get(&self, id: Uuid) -> anyhow::Result<Option<OpenPosition>>;

    async fn insert(&self, new: &NewPosition) -> anyhow::Result<OpenPosition>;

    /// Record the broker ticket of an open position. `None` if not open.
    async fn attach_ticket(&self, id: Uuid, ticket: &str) -> anyhow::Result<Option<OpenPosition>>;

    /// Apply `transition` only if the position is still `open`. Returns the
    /// updated row, or `None` when the position was already closed.
    async fn transition(
        &self,
        id: Uuid,
        transition: &Transition,
    ) -> anyhow::Result<Option<OpenPosition>>;
}

/// Result of recording a terminal's acknowledgment.
#[derive(Debug, Clone)]
pub enum AckApplied {
    /// First acknowledgment; the command is now executed or failed.
    Applied(CloseCommand),
    /// The command had already left `pending`; nothing changed.
    Duplicate(CloseCommand),
    NotFound,
}

#[async_trait]
pub trait CommandQueue: Send + Sync {
    async fn get(&self, command_id: Uuid) -> anyhow::Result<Option<CloseCommand>>;

    /// Insert unless a command with the same id exists. Returns whatever is
    /// stored under that id afterwards.
    async fn enqueue(&self, command: &CloseCommand) -> anyhow::Result<CloseCommand>;

    /// Pending commands for a device, oldest first. Marks them delivered;
    /// they stay pending until acknowledged.
    async fn poll(&self, device_id: Uuid, limit: i64) -> anyhow::Result<Vec<CloseCommand>>;

    async fn acknowledge(&self, command_id: Uuid, ack: &CommandAck) -> anyhow::Result<AckApplied>;

    /// Withdraw a pending command after the position was closed another way.
    async fn supersede(&self, command_id: Uuid, note: &str) -> anyhow::Result<()>;
}

/// Read access to the visible half of signals.
#[async_trait]
pub trait SignalBook: Send + Sync {
    async fn get(&self, signal_id: Uuid) -> anyhow::Result<Option<Signal>>;
}
