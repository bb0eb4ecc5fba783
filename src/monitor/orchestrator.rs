use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use super::inflight::{InFlight, InFlightGuard};
use super::methods::{CloseMethod, DispatchContext, DispatchError, Dispatched, MethodKind};
use super::ports::{AckApplied, CommandQueue, PositionLedger, Transition};
use crate::models::command::ledger_reason;
use crate::models::{
    CloseCommand, CloseReason, CommandAck, CommandStatus, ExecutionReport, NewPosition,
    OpenPosition, PositionStatus, Signal,
};
use crate::services::notifier::NotificationDispatcher;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CloseDisposition {
    /// Ledger transitioned to this status.
    Closed { status: PositionStatus },
    /// Accepted by the terminal queue; awaiting acknowledgment.
    Queued,
    /// Another close for the position is still outstanding.
    AlreadyInFlight,
    /// Position was no longer open.
    NotOpen,
    /// Broker refused; position moved to `closed_error`.
    Rejected,
    /// Every method failed; position stays open for the next tick.
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct CloseResult {
    pub success: bool,
    pub method: Option<MethodKind>,
    pub command_id: Uuid,
    pub disposition: CloseDisposition,
    pub error: Option<String>,
}

impl CloseResult {
    fn new(command_id: Uuid, disposition: CloseDisposition) -> Self {
        let success = matches!(
            disposition,
            CloseDisposition::Closed { .. } | CloseDisposition::Queued
        );
        Self {
            success,
            method: None,
            command_id,
            disposition,
            error: None,
        }
    }

    fn via(mut self, method: MethodKind) -> Self {
        self.method = Some(method);
        self
    }

    fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// What a terminal acknowledgment did.
#[derive(Debug, Clone)]
pub enum AckOutcome {
    Closed(OpenPosition),
    /// Terminal tried and failed; position is now `closed_error`.
    CloseFailed(OpenPosition),
    /// Command already acknowledged earlier; nothing changed.
    Duplicate,
    /// Command applied but the position had already been closed another way.
    PositionAlreadyClosed,
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideMode {
    /// Close through the normal methods with reason `manual`.
    Dispatch,
    /// Only record `closed_manual`; the close already happened elsewhere.
    LedgerOnly,
}

#[derive(Debug, Error)]
pub enum PositionActionError {
    #[error("position {0} not found")]
    NotFound(Uuid),

    #[error("position {0} is not open")]
    NotOpen(Uuid),

    #[error("a close for position {0} is already in flight")]
    InFlight(Uuid),

    #[error("{0}")]
    Invalid(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Drives a detected breach (or an operator request) to a closed position.
/// All ledger status changes go through [`CloseOrchestrator::finalize`].
pub struct CloseOrchestrator {
    ledger: Arc<dyn PositionLedger>,
    queue: Arc<dyn CommandQueue>,
    methods: Vec<Arc<dyn CloseMethod>>,
    notifier: Arc<dyn NotificationDispatcher>,
    inflight: InFlight,
    command_ttl: chrono::Duration,
}

impl CloseOrchestrator {
    pub fn new(
        ledger: Arc<dyn PositionLedger>,
        queue: Arc<dyn CommandQueue>,
        methods: Vec<Arc<dyn CloseMethod>>,
        notifier: Arc<dyn NotificationDispatcher>,
        command_ttl: std::time::Duration,
    ) -> Self {
        Self {
            ledger,
            queue,
            methods,
            notifier,
            inflight: InFlight::new(),
            command_ttl: chrono::Duration::from_std(command_ttl)
                .unwrap_or_else(|_| chrono::Duration::days(365)),
        }
    }

    pub fn ledger(&self) -> &Arc<dyn PositionLedger> {
        &self.ledger
    }

    pub fn queue(&self) -> &Arc<dyn CommandQueue> {
        &self.queue
    }

    pub fn is_in_flight(&self, position_id: &Uuid) -> bool {
        self.inflight.contains(position_id)
    }

    /// Close `position` after a breach at `observed_price`.
    pub async fn close(
        &self,
        position: &OpenPosition,
        reason: CloseReason,
        observed_price: Decimal,
    ) -> CloseResult {
        self.close_with_note(position, reason, observed_price, None).await
    }

    async fn close_with_note(
        &self,
        position: &OpenPosition,
        reason: CloseReason,
        observed_price: Decimal,
        note: Option<&str>,
    ) -> CloseResult {
        let command_id = CloseCommand::id_for(position.id);

        let Some(guard) = self.inflight.try_acquire(position.id) else {
            tracing::debug!(position_id = %position.id, "Close already in flight in this process");
            return CloseResult::new(command_id, CloseDisposition::AlreadyInFlight);
        };

        let result = self
            .close_guarded(&guard, position, reason, observed_price, note)
            .await;

        if matches!(result.disposition, CloseDisposition::Failed) {
            counter!("close_failures_total", "kind" => "delivery").increment(1);
            tracing::warn!(
                position_id = %position.id,
                command_id = %command_id,
                error = result.error.as_deref().unwrap_or(""),
                "Close delivery failed on every method; will retry next tick"
            );
        }

        result
    }

    async fn close_guarded(
        &self,
        _guard: &InFlightGuard,
        position: &OpenPosition,
        reason: CloseReason,
        observed_price: Decimal,
        note: Option<&str>,
    ) -> CloseResult {
        let command_id = CloseCommand::id_for(position.id);

        // The caller's copy may predate a close that finished while we waited.
        let position = match self.ledger.get(position.id).await {
            Ok(Some(p)) if p.is_open() => p,
            Ok(_) => return CloseResult::new(command_id, CloseDisposition::NotOpen),
            Err(e) => {
                return CloseResult::new(command_id, CloseDisposition::Failed)
                    .with_error(format!("position lookup failed: {e}"));
            }
        };
        let position = &position;

        let existing = match self.queue.get(command_id).await {
            Ok(c) => c,
            Err(e) => {
                return CloseResult::new(command_id, CloseDisposition::Failed)
                    .with_error(format!("command lookup failed: {e}"));
            }
        };

        let mut stale_pending = false;
        let command = match existing {
            Some(cmd) if cmd.is_pending() => {
                if !cmd.is_stale(Utc::now(), self.command_ttl) {
                    tracing::debug!(
                        position_id = %position.id,
                        command_id = %cmd.id,
                        "Close command still awaiting terminal acknowledgment"
                    );
                    return CloseResult::new(command_id, CloseDisposition::AlreadyInFlight)
                        .via(MethodKind::TerminalQueue);
                }
                tracing::warn!(
                    position_id = %position.id,
                    command_id = %cmd.id,
                    delivery_count = cmd.delivery_count,
                    "Pending close command went stale; falling back past the terminal queue"
                );
                stale_pending = true;
                cmd
            }
            Some(cmd) if cmd.status == CommandStatus::Superseded => {
                return CloseResult::new(command_id, CloseDisposition::NotOpen);
            }
            // Acknowledged but the ledger never caught up; settle from the command.
            Some(cmd) => return self.reconcile_acknowledged(cmd).await,
            None => CloseCommand::new(
                position.id,
                position.device_id,
                position.broker_ticket.clone(),
                reason,
                observed_price,
            )
            .with_note(note),
        };

        let ctx = DispatchContext {
            position,
            command: &command,
            stale_pending,
        };

        let mut errors = Vec::new();
        for method in &self.methods {
            let kind = method.kind();
            match method.dispatch(&ctx).await {
                Ok(Dispatched::Queued(stored)) => {
                    tracing::info!(
                        position_id = %position.id,
                        command_id = %stored.id,
                        device_id = ?stored.device_id,
                        reason = %stored.reason,
                        "Close command queued for terminal"
                    );
                    return CloseResult::new(command_id, CloseDisposition::Queued).via(kind);
                }
                Ok(Dispatched::Executed { close_price }) => {
                    let price = close_price.unwrap_or(observed_price);
                    let reason_text = command.ledger_reason();
                    return match self
                        .finalize(position.id, command.reason.closed_status(), Some(price), &reason_text)
                        .await
                    {
                        Ok(Some(closed)) => {
                            self.supersede(command.id, &format!("closed via {}", kind.as_str()))
                                .await;
                            CloseResult::new(
                                command_id,
                                CloseDisposition::Closed {
                                    status: closed.status,
                                },
                            )
                            .via(kind)
                        }
                        Ok(None) => {
                            self.supersede(command.id, "position already closed").await;
                            CloseResult::new(command_id, CloseDisposition::NotOpen).via(kind)
                        }
                        Err(e) => CloseResult::new(command_id, CloseDisposition::Failed)
                            .via(kind)
                            .with_error(format!("closed at broker but ledger update failed: {e}")),
                    };
                }
                Err(DispatchError::Rejected(msg)) => {
                    return self.record_rejection(position.id, &command, kind, &msg).await;
                }
                Err(e @ DispatchError::Unavailable(_)) => {
                    tracing::debug!(position_id = %position.id, method = kind.as_str(), error = %e, "Close method unavailable");
                    errors.push(format!("{}: {e}", kind.as_str()));
                }
                Err(e @ DispatchError::Failed(_)) => {
                    tracing::warn!(position_id = %position.id, method = kind.as_str(), error = %e, "Close method failed");
                    errors.push(format!("{}: {e}", kind.as_str()));
                }
            }
        }

        if errors.is_empty() {
            errors.push("no close method configured".into());
        }
        CloseResult::new(command_id, CloseDisposition::Failed).with_error(errors.join("; "))
    }

    async fn record_rejection(
        &self,
        position_id: Uuid,
        command: &CloseCommand,
        kind: MethodKind,
        msg: &str,
    ) -> CloseResult {
        counter!("close_failures_total", "kind" => "rejected").increment(1);
        let reason = format!("{}: {}", command.reason, msg);

        let result = match self
            .finalize(position_id, PositionStatus::ClosedError, None, &reason)
            .await
        {
            Ok(_) => {
                // The position is terminal now; a queued copy must not reach the terminal.
                self.supersede(command.id, &format!("rejected via {}", kind.as_str()))
                    .await;
                CloseResult::new(command.id, CloseDisposition::Rejected)
            }
            Err(e) => CloseResult::new(command.id, CloseDisposition::Failed)
                .with_error(format!("ledger update failed after rejection: {e}")),
        };

        let alert = format!("Close for position {position_id} rejected by broker: {msg}");
        tracing::error!(position_id = %position_id, method = kind.as_str(), alert = true, "{alert}");
        self.notifier.operator_alert(&alert).await;

        result.via(kind).with_error(msg)
    }

    /// Withdraw a still-pending command. No-op when it was never queued or
    /// is already acknowledged.
    async fn supersede(&self, command_id: Uuid, note: &str) {
        if let Err(e) = self.queue.supersede(command_id, note).await {
            tracing::warn!(error = %e, command_id = %command_id, "Failed to supersede pending close command");
        }
    }

    async fn reconcile_acknowledged(&self, cmd: CloseCommand) -> CloseResult {
        let command_id = cmd.id;
        match self.settle(cmd).await {
            Ok(AckOutcome::Closed(p)) => {
                CloseResult::new(command_id, CloseDisposition::Closed { status: p.status })
                    .via(MethodKind::TerminalQueue)
            }
            Ok(AckOutcome::CloseFailed(_)) => {
                CloseResult::new(command_id, CloseDisposition::Rejected).via(MethodKind::TerminalQueue)
            }
            Ok(_) => CloseResult::new(command_id, CloseDisposition::NotOpen),
            Err(e) => CloseResult::new(command_id, CloseDisposition::Failed)
                .with_error(format!("reconciling acknowledged command failed: {e}")),
        }
    }

    /// Apply a terminal acknowledgment. Redelivered acknowledgments are no-ops.
    pub async fn acknowledge(&self, command_id: Uuid, ack: &CommandAck) -> anyhow::Result<AckOutcome> {
        match self.queue.acknowledge(command_id, ack).await? {
            AckApplied::NotFound => Ok(AckOutcome::NotFound),
            AckApplied::Duplicate(cmd) => {
                tracing::info!(
                    command_id = %command_id,
                    status = cmd.status.as_str(),
                    "Duplicate acknowledgment ignored"
                );
                Ok(AckOutcome::Duplicate)
            }
            AckApplied::Applied(cmd) => self.settle(cmd).await,
        }
    }

    /// Move the ledger according to an acknowledged command.
    async fn settle(&self, cmd: CloseCommand) -> anyhow::Result<AckOutcome> {
        match cmd.status {
            CommandStatus::Executed => {
                let price = cmd.close_price.unwrap_or(cmd.observed_price);
                let closed = self
                    .finalize(
                        cmd.position_id,
                        cmd.reason.closed_status(),
                        Some(price),
                        &cmd.ledger_reason(),
                    )
                    .await?;
                Ok(closed.map_or(AckOutcome::PositionAlreadyClosed, AckOutcome::Closed))
            }
            CommandStatus::Failed => {
                counter!("close_failures_total", "kind" => "acknowledged_failed").increment(1);
                let error = cmd
                    .error
                    .clone()
                    .unwrap_or_else(|| "terminal reported failure".into());
                let closed = self
                    .finalize(
                        cmd.position_id,
                        PositionStatus::ClosedError,
                        cmd.close_price,
                        &format!("{}: {}", cmd.reason, error),
                    )
                    .await?;

                let alert = format!(
                    "Terminal failed to close position {} (command {}): {}",
                    cmd.position_id, cmd.id, error
                );
                tracing::error!(
                    position_id = %cmd.position_id,
                    command_id = %cmd.id,
                    alert = true,
                    "{alert}"
                );
                self.notifier.operator_alert(&alert).await;

                Ok(closed.map_or(AckOutcome::PositionAlreadyClosed, AckOutcome::CloseFailed))
            }
            CommandStatus::Pending | CommandStatus::Superseded => {
                Ok(AckOutcome::PositionAlreadyClosed)
            }
        }
    }

    /// Operator-forced close, bypassing breach detection.
    pub async fn force_close(
        &self,
        position_id: Uuid,
        note: &str,
        price: Option<Decimal>,
        mode: OverrideMode,
    ) -> Result<CloseResult, PositionActionError> {
        let position = self
            .ledger
            .get(position_id)
            .await?
            .ok_or(PositionActionError::NotFound(position_id))?;
        if !position.is_open() {
            return Err(PositionActionError::NotOpen(position_id));
        }

        tracing::warn!(
            position_id = %position_id,
            mode = ?mode,
            note,
            "Operator override close requested"
        );

        match mode {
            OverrideMode::Dispatch => {
                let price = price.ok_or_else(|| {
                    PositionActionError::Invalid(
                        "an observed price is required to dispatch a manual close".into(),
                    )
                })?;
                let result = self
                    .close_with_note(&position, CloseReason::Manual, price, Some(note))
                    .await;
                match result.disposition {
                    CloseDisposition::AlreadyInFlight => Err(PositionActionError::InFlight(position_id)),
                    CloseDisposition::NotOpen => Err(PositionActionError::NotOpen(position_id)),
                    _ => Ok(result),
                }
            }
            OverrideMode::LedgerOnly => {
                let command_id = CloseCommand::id_for(position_id);
                let Some(_guard) = self.inflight.try_acquire(position_id) else {
                    return Err(PositionActionError::InFlight(position_id));
                };

                let reason = ledger_reason(CloseReason::Manual, Some(note));
                let closed = self
                    .finalize(position_id, PositionStatus::ClosedManual, price, &reason)
                    .await?
                    .ok_or(PositionActionError::NotOpen(position_id))?;

                // A terminal must not act on a command for a position that is already closed.
                if let Some(cmd) = self.queue.get(command_id).await? {
                    if cmd.is_pending() {
                        self.queue.supersede(command_id, "closed by operator").await?;
                    }
                }

                Ok(CloseResult::new(
                    command_id,
                    CloseDisposition::Closed {
                        status: closed.status,
                    },
                ))
            }
        }
    }

    /// Open a position from a terminal's execution report.
    pub async fn record_execution(
        &self,
        signal: &Signal,
        report: ExecutionReport,
    ) -> anyhow::Result<OpenPosition> {
        let new = NewPosition::from_execution(signal, report)?;
        let position = self.ledger.insert(&new).await?;

        tracing::info!(
            position_id = %position.id,
            signal_id = %position.signal_id,
            instrument = %position.instrument,
            side = %position.side,
            size = %position.size,
            "Position opened"
        );
        Ok(position)
    }

    /// Record a broker ticket reported after the position was opened.
    pub async fn attach_ticket(
        &self,
        position_id: Uuid,
        ticket: &str,
    ) -> Result<OpenPosition, PositionActionError> {
        let ticket = ticket.trim();
        if ticket.is_empty() {
            return Err(PositionActionError::Invalid("broker ticket must not be empty".into()));
        }

        match self.ledger.attach_ticket(position_id, ticket).await? {
            Some(position) => {
                tracing::info!(position_id = %position_id, ticket, "Broker ticket attached");
                Ok(position)
            }
            None if self.ledger.get(position_id).await?.is_some() => {
                Err(PositionActionError::NotOpen(position_id))
            }
            None => Err(PositionActionError::NotFound(position_id)),
        }
    }

    /// The one place a position leaves `open`. Returns `None` when it had
    /// already left. Notification is best-effort.
    pub async fn finalize(
        &self,
        position_id: Uuid,
        status: PositionStatus,
        close_price: Option<Decimal>,
        reason: &str,
    ) -> anyhow::Result<Option<OpenPosition>> {
        let transition = Transition::new(status, close_price, reason)?;

        match self.ledger.transition(position_id, &transition).await? {
            Some(closed) => {
                counter!("closes_completed_total", "status" => status.as_str()).increment(1);
                tracing::info!(
                    position_id = %position_id,
                    status = status.as_str(),
                    close_price = ?close_price,
                    reason,
                    "Position closed"
                );
                self.notifier.position_closed(&closed).await;
                Ok(Some(closed))
            }
            None => {
                tracing::info!(
                    position_id = %position_id,
                    attempted = status.as_str(),
                    "Position already closed; transition skipped"
                );
                Ok(None)
            }
        }
    }
}
