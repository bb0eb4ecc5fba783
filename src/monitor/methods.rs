//! The two ways a close reaches the real world, tried in order by the
//! orchestrator.

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;

use super::ports::CommandQueue;
use crate::broker::{BrokerCloseRequest, DirectBroker};
use crate::models::{CloseCommand, OpenPosition};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodKind {
    TerminalQueue,
    DirectBroker,
}

impl MethodKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MethodKind::TerminalQueue => "terminal_queue",
            MethodKind::DirectBroker => "direct_broker",
        }
    }
}

pub struct DispatchContext<'a> {
    pub position: &'a OpenPosition,
    pub command: &'a CloseCommand,
    /// A pending command for this position outlived its TTL unacknowledged.
    pub stale_pending: bool,
}

#[derive(Debug, Clone)]
pub enum Dispatched {
    /// Accepted by the terminal queue; the ledger moves on acknowledgment.
    Queued(CloseCommand),
    /// Closed synchronously at the broker.
    Executed { close_price: Option<Decimal> },
}

#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// This method cannot serve the position; try the next one.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Delivery failed; the position stays open and is retried.
    #[error("delivery failed: {0}")]
    Failed(String),

    /// The broker refused the close outright.
    #[error("rejected: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait CloseMethod: Send + Sync {
    fn kind(&self) -> MethodKind;

    async fn dispatch(&self, ctx: &DispatchContext<'_>) -> Result<Dispatched, DispatchError>;
}

/// Hand the command to the owning terminal through the polled queue.
pub struct ViaTerminalQueue {
    queue: Arc<dyn CommandQueue>,
}

impl ViaTerminalQueue {
    pub fn new(queue: Arc<dyn CommandQueue>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl CloseMethod for ViaTerminalQueue {
    fn kind(&self) -> MethodKind {
        MethodKind::TerminalQueue
    }

    async fn dispatch(&self, ctx: &DispatchContext<'_>) -> Result<Dispatched, DispatchError> {
        if ctx.position.device_id.is_none() {
            return Err(DispatchError::Unavailable("no terminal associated".into()));
        }
        if ctx.stale_pending {
            return Err(DispatchError::Unavailable(
                "terminal has not acknowledged the pending command".into(),
            ));
        }

        let stored = self
            .queue
            .enqueue(ctx.command)
            .await
            .map_err(|e| DispatchError::Failed(e.to_string()))?;

        if !stored.is_pending() {
            return Err(DispatchError::Failed(format!(
                "command {} is already {}",
                stored.id,
                stored.status.as_str()
            )));
        }

        Ok(Dispatched::Queued(stored))
    }
}

/// Close on the user's delegated broker account directly.
pub struct ViaDirectBroker {
    broker: Arc<dyn DirectBroker>,
}

impl ViaDirectBroker {
    pub fn new(broker: Arc<dyn DirectBroker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl CloseMethod for ViaDirectBroker {
    fn kind(&self) -> MethodKind {
        MethodKind::DirectBroker
    }

    async fn dispatch(&self, ctx: &DispatchContext<'_>) -> Result<Dispatched, DispatchError> {
        let Some(account) = ctx.position.broker_account.clone() else {
            return Err(DispatchError::Unavailable("no delegated broker account".into()));
        };
        let Some(ticket) = ctx.position.broker_ticket.clone() else {
            return Err(DispatchError::Unavailable("no broker ticket recorded".into()));
        };

        let request = BrokerCloseRequest {
            account,
            ticket,
            volume: ctx.position.size,
            idempotency_key: ctx.command.id,
        };

        let resp = self
            .broker
            .close(&request)
            .await
            .map_err(|e| DispatchError::Failed(e.to_string()))?;

        if resp.success {
            Ok(Dispatched::Executed {
                close_price: resp.close_price,
            })
        } else {
            Err(DispatchError::Rejected(
                resp.error.unwrap_or_else(|| "broker rejected close".into()),
            ))
        }
    }
}
