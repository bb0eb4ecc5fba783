use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge, histogram};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::breach;
use super::orchestrator::{CloseDisposition, CloseOrchestrator, CloseResult};
use super::ports::PositionLedger;
use crate::models::OpenPosition;
use crate::pricing::{PriceOracle, Quote};
use crate::services::notifier::NotificationDispatcher;
use crate::vault::{ExitStore, VaultError};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval: Duration,
    pub max_concurrency: usize,
    pub eval_timeout: Duration,
    pub shutdown_grace: Duration,
    pub max_backoff: Duration,
    pub alert_after_failures: u32,
    pub tolerance: Decimal,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(2000),
            max_concurrency: 16,
            eval_timeout: Duration::from_millis(5000),
            shutdown_grace: Duration::from_millis(10_000),
            max_backoff: Duration::from_millis(60_000),
            alert_after_failures: 5,
            tolerance: Decimal::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Stopped,
    Running,
    Stopping,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub evaluated: usize,
    pub breaches: usize,
    pub dispatched: usize,
    pub closed: usize,
    pub skipped_in_flight: usize,
    pub failures: usize,
}

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("failed to list open positions: {0}")]
    ListPositions(#[source] anyhow::Error),

    #[error("monitor is already running")]
    AlreadyRunning,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    pub state: SchedulerState,
    pub paused: bool,
    pub consecutive_failures: u32,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub last_tick: Option<TickReport>,
}

/// Delay before the next tick after `failures` consecutive tick-level
/// failures: the interval doubled per failure, capped at `max`.
pub fn backoff_delay(interval: Duration, failures: u32, max: Duration) -> Duration {
    if failures == 0 {
        return interval;
    }
    let factor = 2u32.saturating_pow(failures.min(16));
    interval.saturating_mul(factor).min(max.max(interval))
}

/// Everything one evaluation task needs, cheap to clone into a spawned task.
#[derive(Clone)]
struct Evaluator {
    exits: Arc<dyn ExitStore>,
    orchestrator: Arc<CloseOrchestrator>,
    tolerance: Decimal,
}

impl Evaluator {
    async fn evaluate(
        &self,
        position: OpenPosition,
        quote: Quote,
    ) -> Result<Option<CloseResult>, VaultError> {
        let levels = self.exits.load(position.signal_id).await?;
        let result = breach::detect(
            position.side,
            position.entry_price,
            levels.stop,
            levels.target,
            quote.price,
            self.tolerance,
        );

        let Some(reason) = result.close_reason() else {
            return Ok(None);
        };

        counter!("breaches_detected_total", "reason" => reason.as_str()).increment(1);
        tracing::info!(
            position_id = %position.id,
            instrument = %position.instrument,
            side = %position.side,
            price = %quote.price,
            reason = reason.as_str(),
            "Exit level breached"
        );

        Ok(Some(self.orchestrator.close(&position, reason, quote.price).await))
    }
}

enum TaskOutcome {
    Evaluated(Option<CloseResult>),
    Vault(VaultError),
    TimedOut,
}

/// Fixed-cadence monitor over every open position.
pub struct MonitorScheduler {
    config: SchedulerConfig,
    ledger: Arc<dyn PositionLedger>,
    oracle: Arc<dyn PriceOracle>,
    orchestrator: Arc<CloseOrchestrator>,
    notifier: Arc<dyn NotificationDispatcher>,
    evaluator: Evaluator,
    paused: Arc<AtomicBool>,
    state: Mutex<SchedulerState>,
    consecutive_failures: AtomicU32,
    decrypt_failures: Mutex<HashMap<Uuid, u32>>,
    last_tick: Mutex<Option<(DateTime<Utc>, TickReport)>>,
}

impl MonitorScheduler {
    pub fn new(
        config: SchedulerConfig,
        ledger: Arc<dyn PositionLedger>,
        exits: Arc<dyn ExitStore>,
        oracle: Arc<dyn PriceOracle>,
        orchestrator: Arc<CloseOrchestrator>,
        notifier: Arc<dyn NotificationDispatcher>,
    ) -> Self {
        let evaluator = Evaluator {
            exits,
            orchestrator: Arc::clone(&orchestrator),
            tolerance: config.tolerance,
        };
        Self {
            config,
            ledger,
            oracle,
            orchestrator,
            notifier,
            evaluator,
            paused: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(SchedulerState::Stopped),
            consecutive_failures: AtomicU32::new(0),
            decrypt_failures: Mutex::new(HashMap::new()),
            last_tick: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.lock()
    }

    fn set_state(&self, state: SchedulerState) {
        *self.state.lock() = state;
        tracing::info!(state = ?state, "Position monitor state changed");
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> MonitorStatus {
        let last = self.last_tick.lock().clone();
        MonitorStatus {
            state: self.state(),
            paused: self.is_paused(),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            last_tick_at: last.as_ref().map(|(at, _)| *at),
            last_tick: last.map(|(_, report)| report),
        }
    }

    /// Spawn the monitor loop. Fails if it is not currently stopped.
    pub fn start(self: &Arc<Self>) -> Result<MonitorHandle, MonitorError> {
        {
            let mut state = self.state.lock();
            if *state != SchedulerState::Stopped {
                return Err(MonitorError::AlreadyRunning);
            }
            *state = SchedulerState::Running;
        }
        tracing::info!(
            interval_ms = self.config.interval.as_millis() as u64,
            max_concurrency = self.config.max_concurrency,
            "Position monitor started"
        );

        let shutdown = CancellationToken::new();
        let this = Arc::clone(self);
        let token = shutdown.clone();
        let join = tokio::spawn(async move { this.run(token).await });

        Ok(MonitorHandle { shutdown, join })
    }

    async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let delay = if self.is_paused() {
                tracing::debug!("Position monitor paused");
                self.config.interval
            } else {
                let tick = self.run_tick();
                tokio::pin!(tick);

                let outcome = tokio::select! {
                    r = &mut tick => Some(r),
                    _ = shutdown.cancelled() => {
                        self.set_state(SchedulerState::Stopping);
                        match tokio::time::timeout(self.config.shutdown_grace, &mut tick).await {
                            Ok(r) => Some(r),
                            Err(_) => {
                                tracing::warn!(
                                    grace_ms = self.config.shutdown_grace.as_millis() as u64,
                                    "Abandoning in-flight evaluations after shutdown grace period"
                                );
                                None
                            }
                        }
                    }
                };

                match outcome {
                    Some(Ok(_)) => self.config.interval,
                    Some(Err(e)) => self.record_tick_failure(&e).await,
                    None => break,
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(SchedulerState::Stopped);
    }

    async fn record_tick_failure(&self, error: &MonitorError) -> Duration {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        gauge!("monitor_consecutive_failures").set(failures as f64);

        let delay = backoff_delay(self.config.interval, failures, self.config.max_backoff);
        tracing::error!(
            error = %error,
            consecutive_failures = failures,
            retry_in_ms = delay.as_millis() as u64,
            "Position monitor tick failed"
        );

        if failures == self.config.alert_after_failures {
            let alert = format!("Position monitor failed {failures} ticks in a row: {error}");
            tracing::error!(alert = true, "{alert}");
            self.notifier.operator_alert(&alert).await;
        }

        delay
    }

    /// Evaluate every open position once.
    pub async fn run_tick(&self) -> Result<TickReport, MonitorError> {
        let started = Instant::now();
        counter!("monitor_ticks_total").increment(1);

        let positions = self
            .ledger
            .list_open()
            .await
            .map_err(MonitorError::ListPositions)?;
        gauge!("open_positions").set(positions.len() as f64);

        let mut report = TickReport::default();
        let present_signals: HashSet<Uuid> = positions.iter().map(|p| p.signal_id).collect();

        let mut by_instrument: BTreeMap<String, Vec<OpenPosition>> = BTreeMap::new();
        for position in positions {
            if self.orchestrator.is_in_flight(&position.id) {
                report.skipped_in_flight += 1;
                continue;
            }
            by_instrument
                .entry(position.instrument.clone())
                .or_default()
                .push(position);
        }

        let limit = self.config.max_concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(limit));
        let quotes = self.fetch_quotes(&by_instrument, &semaphore, &mut report).await;

        let mut tasks = JoinSet::new();
        for (instrument, group) in by_instrument {
            let Some(quote) = quotes.get(&instrument).copied() else {
                continue;
            };
            for position in group {
                let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                    break;
                };
                let evaluator = self.evaluator.clone();
                let eval_timeout = self.config.eval_timeout;
                tasks.spawn(async move {
                    let _permit = permit;
                    let position_id = position.id;
                    let signal_id = position.signal_id;
                    let outcome =
                        match tokio::time::timeout(eval_timeout, evaluator.evaluate(position, quote))
                            .await
                        {
                            Ok(Ok(result)) => TaskOutcome::Evaluated(result),
                            Ok(Err(e)) => TaskOutcome::Vault(e),
                            Err(_) => TaskOutcome::TimedOut,
                        };
                    (position_id, signal_id, outcome)
                });
            }
        }

        let mut failed_signals = HashSet::new();
        let mut opened_signals = HashSet::new();

        while let Some(joined) = tasks.join_next().await {
            let (position_id, signal_id, outcome) = match joined {
                Ok(v) => v,
                Err(e) => {
                    report.failures += 1;
                    tracing::error!(error = %e, "Position evaluation task panicked");
                    continue;
                }
            };

            match outcome {
                TaskOutcome::Evaluated(result) => {
                    report.evaluated += 1;
                    opened_signals.insert(signal_id);
                    if let Some(result) = result {
                        tally_close(&mut report, &result);
                    }
                }
                TaskOutcome::Vault(e) => {
                    report.failures += 1;
                    if matches!(e, VaultError::Decryption { .. }) {
                        counter!("decryption_failures_total").increment(1);
                    }
                    failed_signals.insert(signal_id);
                    tracing::error!(
                        position_id = %position_id,
                        signal_id = %signal_id,
                        error = %e,
                        "Failed to load exit levels"
                    );
                }
                TaskOutcome::TimedOut => {
                    report.failures += 1;
                    counter!("evaluation_timeouts_total").increment(1);
                    tracing::warn!(
                        position_id = %position_id,
                        timeout_ms = self.config.eval_timeout.as_millis() as u64,
                        "Position evaluation timed out; retrying next tick"
                    );
                }
            }
        }

        self.track_vault_failures(&present_signals, &opened_signals, &failed_signals)
            .await;

        self.consecutive_failures.store(0, Ordering::Relaxed);
        gauge!("monitor_consecutive_failures").set(0.0);
        histogram!("monitor_tick_seconds").record(started.elapsed().as_secs_f64());
        *self.last_tick.lock() = Some((Utc::now(), report.clone()));

        if report.breaches > 0 || report.failures > 0 {
            tracing::info!(
                evaluated = report.evaluated,
                breaches = report.breaches,
                dispatched = report.dispatched,
                closed = report.closed,
                skipped_in_flight = report.skipped_in_flight,
                failures = report.failures,
                "Monitor tick complete"
            );
        } else {
            tracing::debug!(evaluated = report.evaluated, "Monitor tick complete");
        }

        Ok(report)
    }

    async fn fetch_quotes(
        &self,
        by_instrument: &BTreeMap<String, Vec<OpenPosition>>,
        semaphore: &Arc<Semaphore>,
        report: &mut TickReport,
    ) -> HashMap<String, Quote> {
        let mut fetches = JoinSet::new();
        for instrument in by_instrument.keys() {
            let Ok(permit) = Arc::clone(semaphore).acquire_owned().await else {
                break;
            };
            let oracle = Arc::clone(&self.oracle);
            let instrument = instrument.clone();
            fetches.spawn(async move {
                let _permit = permit;
                let quote = oracle.get_price(&instrument).await;
                (instrument, quote)
            });
        }

        let mut quotes = HashMap::new();
        while let Some(joined) = fetches.join_next().await {
            match joined {
                Ok((instrument, Ok(quote))) => {
                    quotes.insert(instrument, quote);
                }
                Ok((instrument, Err(e))) => {
                    let skipped = by_instrument.get(&instrument).map_or(0, Vec::len);
                    report.failures += skipped;
                    counter!("price_failures_total").increment(1);
                    tracing::warn!(
                        instrument = %instrument,
                        positions = skipped,
                        error = %e,
                        "Price unavailable; skipping instrument this tick"
                    );
                }
                Err(e) => {
                    tracing::error!(error = %e, "Price fetch task panicked");
                }
            }
        }

        quotes
    }

    /// Alert once when a signal's exit levels keep failing to load.
    async fn track_vault_failures(
        &self,
        present: &HashSet<Uuid>,
        opened: &HashSet<Uuid>,
        failed: &HashSet<Uuid>,
    ) {
        let mut to_alert = Vec::new();
        {
            let mut streaks = self.decrypt_failures.lock();
            streaks.retain(|id, _| present.contains(id) && !opened.contains(id));
            for signal_id in failed {
                let streak = streaks.entry(*signal_id).or_insert(0);
                *streak += 1;
                if *streak == self.config.alert_after_failures {
                    to_alert.push((*signal_id, *streak));
                }
            }
        }

        for (signal_id, streak) in to_alert {
            let alert = format!(
                "Exit levels for signal {signal_id} failed to load {streak} ticks in a row"
            );
            tracing::error!(signal_id = %signal_id, alert = true, "{alert}");
            self.notifier.operator_alert(&alert).await;
        }
    }
}

fn tally_close(report: &mut TickReport, result: &CloseResult) {
    report.breaches += 1;
    if result.success {
        report.dispatched += 1;
    }
    match result.disposition {
        CloseDisposition::Closed { .. } => report.closed += 1,
        CloseDisposition::AlreadyInFlight => report.skipped_in_flight += 1,
        CloseDisposition::Failed | CloseDisposition::Rejected => report.failures += 1,
        CloseDisposition::Queued | CloseDisposition::NotOpen => {}
    }
}

/// Handle to a running monitor loop.
pub struct MonitorHandle {
    shutdown: CancellationToken,
    join: JoinHandle<()>,
}

impl MonitorHandle {
    /// Stop starting ticks, let the current one finish within the grace
    /// period, and wait for the loop to exit.
    pub async fn stop(self) {
        self.shutdown.cancel();
        if let Err(e) = self.join.await {
            tracing::error!(error = %e, "Position monitor task ended abnormally");
        }
    }
}
