#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use exitguard::broker::{BrokerCloseRequest, BrokerCloseResponse, BrokerError, DirectBroker};
use exitguard::models::{
    AckStatus, CloseCommand, CommandAck, CommandStatus, ExitLevels, NewPosition, OpenPosition,
    PositionStatus, Side, Signal,
};
use exitguard::monitor::ports::{AckApplied, Transition};
use exitguard::monitor::{
    CloseMethod, CloseOrchestrator, CommandQueue, MonitorScheduler, PositionLedger,
    SchedulerConfig, SignalBook, ViaDirectBroker, ViaTerminalQueue,
};
use exitguard::pricing::{PriceError, PriceOracle, Quote};
use exitguard::services::NotificationDispatcher;
use exitguard::vault::{ExitCipher, ExitStore, VaultError};

pub fn test_key() -> String {
    BASE64.encode([7u8; 32])
}

pub fn price(s: &str) -> Decimal {
    s.parse().expect("valid decimal literal")
}

pub fn open_position(instrument: &str, side: Side, entry: &str) -> OpenPosition {
    OpenPosition {
        id: Uuid::new_v4(),
        signal_id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        device_id: Some(Uuid::new_v4()),
        broker_account: Some("acct-1".into()),
        instrument: instrument.into(),
        side,
        entry_price: price(entry),
        size: Decimal::ONE,
        broker_ticket: Some("T-1".into()),
        status: PositionStatus::Open,
        opened_at: Utc::now(),
        closed_at: None,
        close_price: None,
        close_reason: None,
    }
}

// ---------------------------------------------------------------------------
// Position ledger
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryLedger {
    positions: Mutex<HashMap<Uuid, OpenPosition>>,
    pub fail_list: AtomicBool,
    pub transitions: AtomicUsize,
}

impl MemoryLedger {
    pub fn add(&self, position: OpenPosition) {
        self.positions.lock().insert(position.id, position);
    }

    pub fn snapshot(&self, id: Uuid) -> OpenPosition {
        self.positions
            .lock()
            .get(&id)
            .cloned()
            .expect("position exists")
    }
}

#[async_trait]
impl PositionLedger for MemoryLedger {
    async fn list_open(&self) -> anyhow::Result<Vec<OpenPosition>> {
        if self.fail_list.load(Ordering::SeqCst) {
            anyhow::bail!("ledger unavailable");
        }
        let mut open: Vec<_> = self
            .positions
            .lock()
            .values()
            .filter(|p| p.is_open())
            .cloned()
            .collect();
        open.sort_by_key(|p| p.opened_at);
        Ok(open)
    }

    async fn list(
        &self,
        status: Option<PositionStatus>,
        limit: i64,
    ) -> anyhow::Result<Vec<OpenPosition>> {
        let mut all: Vec<_> = self
            .positions
            .lock()
            .values()
            .filter(|p| status.map_or(true, |s| p.status == s))
            .cloned()
            .collect();
        all.sort_by(|a, b| b.opened_at.cmp(&a.opened_at));
        all.truncate(limit as usize);
        Ok(all)
    }

    async fn get(&self, id: Uuid) -> anyhow::Result<Option<OpenPosition>> {
        Ok(self.positions.lock().get(&id).cloned())
    }

    async fn insert(&self, new: &NewPosition) -> anyhow::Result<OpenPosition> {
        let position = OpenPosition {
            id: Uuid::new_v4(),
            signal_id: new.signal_id,
            user_id: new.user_id,
            device_id: new.device_id,
            broker_account: new.broker_account.clone(),
            instrument: new.instrument.clone(),
            side: new.side,
            entry_price: new.entry_price,
            size: new.size,
            broker_ticket: new.broker_ticket.clone(),
            status: PositionStatus::Open,
            opened_at: Utc::now(),
            closed_at: None,
            close_price: None,
            close_reason: None,
        };
        self.add(position.clone());
        Ok(position)
    }

    async fn attach_ticket(&self, id: Uuid, ticket: &str) -> anyhow::Result<Option<OpenPosition>> {
        let mut positions = self.positions.lock();
        match positions.get_mut(&id) {
            Some(p) if p.is_open() => {
                p.broker_ticket = Some(ticket.to_string());
                Ok(Some(p.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn transition(
        &self,
        id: Uuid,
        transition: &Transition,
    ) -> anyhow::Result<Option<OpenPosition>> {
        let mut positions = self.positions.lock();
        match positions.get_mut(&id) {
            Some(p) if p.is_open() => {
                p.status = transition.status;
                p.close_price = transition.close_price;
                p.close_reason = Some(transition.reason.clone());
                p.closed_at = Some(transition.at);
                self.transitions.fetch_add(1, Ordering::SeqCst);
                Ok(Some(p.clone()))
            }
            _ => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------------
// Command queue
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryQueue {
    commands: Mutex<HashMap<Uuid, CloseCommand>>,
    pub fail_enqueue: AtomicBool,
    pub enqueue_calls: AtomicUsize,
}

impl MemoryQueue {
    pub fn command(&self, id: Uuid) -> Option<CloseCommand> {
        self.commands.lock().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.commands.lock().len()
    }

    /// Pretend the command was created `secs` seconds ago.
    pub fn backdate(&self, id: Uuid, secs: i64) {
        if let Some(cmd) = self.commands.lock().get_mut(&id) {
            cmd.created_at = Utc::now() - chrono::Duration::seconds(secs);
        }
    }
}

#[async_trait]
impl CommandQueue for MemoryQueue {
    async fn get(&self, command_id: Uuid) -> anyhow::Result<Option<CloseCommand>> {
        Ok(self.command(command_id))
    }

    async fn enqueue(&self, command: &CloseCommand) -> anyhow::Result<CloseCommand> {
        self.enqueue_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_enqueue.load(Ordering::SeqCst) {
            anyhow::bail!("queue unavailable");
        }
        let mut commands = self.commands.lock();
        Ok(commands
            .entry(command.id)
            .or_insert_with(|| command.clone())
            .clone())
    }

    async fn poll(&self, device_id: Uuid, limit: i64) -> anyhow::Result<Vec<CloseCommand>> {
        let mut commands = self.commands.lock();
        let mut pending: Vec<_> = commands
            .values_mut()
            .filter(|c| c.is_pending() && c.device_id == Some(device_id))
            .collect();
        pending.sort_by_key(|c| c.created_at);

        Ok(pending
            .into_iter()
            .take(limit as usize)
            .map(|c| {
                c.delivery_count += 1;
                c.delivered_at = Some(Utc::now());
                c.clone()
            })
            .collect())
    }

    async fn acknowledge(&self, command_id: Uuid, ack: &CommandAck) -> anyhow::Result<AckApplied> {
        let mut commands = self.commands.lock();
        let Some(cmd) = commands.get_mut(&command_id) else {
            return Ok(AckApplied::NotFound);
        };
        if !cmd.is_pending() {
            return Ok(AckApplied::Duplicate(cmd.clone()));
        }
        cmd.status = match ack.status {
            AckStatus::Executed => CommandStatus::Executed,
            AckStatus::Failed => CommandStatus::Failed,
        };
        cmd.close_price = ack.close_price;
        cmd.error = ack.error.clone();
        cmd.acknowledged_at = Some(Utc::now());
        Ok(AckApplied::Applied(cmd.clone()))
    }

    async fn supersede(&self, command_id: Uuid, note: &str) -> anyhow::Result<()> {
        if let Some(cmd) = self.commands.lock().get_mut(&command_id) {
            if cmd.is_pending() {
                cmd.status = CommandStatus::Superseded;
                cmd.error = Some(note.to_string());
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Signals and exit levels
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemorySignals {
    signals: Mutex<HashMap<Uuid, Signal>>,
}

impl MemorySignals {
    pub fn add(&self, instrument: &str, side: Side, entry: &str) -> Signal {
        let signal = Signal {
            id: Uuid::new_v4(),
            instrument: instrument.into(),
            side,
            entry_price: price(entry),
            metadata: serde_json::json!({}),
            created_at: Utc::now(),
        };
        self.signals.lock().insert(signal.id, signal.clone());
        signal
    }
}

#[async_trait]
impl SignalBook for MemorySignals {
    async fn get(&self, signal_id: Uuid) -> anyhow::Result<Option<Signal>> {
        Ok(self.signals.lock().get(&signal_id).cloned())
    }
}

/// Exit store that seals with the real cipher and keeps blobs in memory.
pub struct MemoryExitStore {
    cipher: ExitCipher,
    blobs: Mutex<HashMap<Uuid, String>>,
    pub load_delay: Mutex<Option<Duration>>,
    pub loads: AtomicUsize,
}

impl Default for MemoryExitStore {
    fn default() -> Self {
        Self {
            cipher: ExitCipher::from_base64(1, &test_key()).expect("valid test key"),
            blobs: Mutex::new(HashMap::new()),
            load_delay: Mutex::new(None),
            loads: AtomicUsize::new(0),
        }
    }
}

impl MemoryExitStore {
    pub fn blob(&self, signal_id: Uuid) -> Option<String> {
        self.blobs.lock().get(&signal_id).cloned()
    }

    pub async fn store_levels(&self, signal_id: Uuid, stop: &str, target: &str) {
        self.store(
            signal_id,
            &ExitLevels {
                stop: price(stop),
                target: price(target),
                reason: None,
            },
        )
        .await
        .expect("store levels");
    }

    /// Flip one ciphertext byte so authentication fails.
    pub fn tamper(&self, signal_id: Uuid) {
        let mut blobs = self.blobs.lock();
        let blob = blobs.get_mut(&signal_id).expect("blob exists");
        let mut raw = BASE64.decode(blob.as_bytes()).expect("blob is base64");
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        *blob = BASE64.encode(raw);
    }
}

#[async_trait]
impl ExitStore for MemoryExitStore {
    async fn store(&self, signal_id: Uuid, levels: &ExitLevels) -> Result<(), VaultError> {
        let blob = self.cipher.seal(signal_id, levels)?;
        let mut blobs = self.blobs.lock();
        if blobs.contains_key(&signal_id) {
            return Err(VaultError::AlreadySealed(signal_id));
        }
        blobs.insert(signal_id, blob);
        Ok(())
    }

    async fn load(&self, signal_id: Uuid) -> Result<ExitLevels, VaultError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let delay = *self.load_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let blob = self
            .blob(signal_id)
            .ok_or(VaultError::NotFound(signal_id))?;
        self.cipher.open(signal_id, &blob)
    }
}

// ---------------------------------------------------------------------------
// Prices
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FixedOracle {
    prices: Mutex<HashMap<String, Decimal>>,
    unavailable: Mutex<HashSet<String>>,
    pub calls: AtomicUsize,
}

impl FixedOracle {
    pub fn set(&self, instrument: &str, value: &str) {
        self.prices.lock().insert(instrument.into(), price(value));
    }

    pub fn fail(&self, instrument: &str) {
        self.unavailable.lock().insert(instrument.into());
    }
}

#[async_trait]
impl PriceOracle for FixedOracle {
    async fn get_price(&self, instrument: &str) -> Result<Quote, PriceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.lock().contains(instrument) {
            return Err(PriceError::Unavailable {
                instrument: instrument.into(),
                detail: "feed down".into(),
            });
        }
        let price = self.prices.lock().get(instrument).copied().ok_or_else(|| {
            PriceError::Unavailable {
                instrument: instrument.into(),
                detail: "no quote".into(),
            }
        })?;
        Ok(Quote {
            price,
            as_of: Utc::now(),
        })
    }
}

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeBroker {
    responses: Mutex<VecDeque<Result<BrokerCloseResponse, String>>>,
    pub requests: Mutex<Vec<BrokerCloseRequest>>,
}

impl FakeBroker {
    pub fn respond(&self, response: BrokerCloseResponse) {
        self.responses.lock().push_back(Ok(response));
    }

    pub fn fail_transport(&self, detail: &str) {
        self.responses.lock().push_back(Err(detail.into()));
    }

    pub fn filled_at(value: &str) -> BrokerCloseResponse {
        BrokerCloseResponse {
            success: true,
            error: None,
            close_price: Some(price(value)),
        }
    }

    pub fn rejected(reason: &str) -> BrokerCloseResponse {
        BrokerCloseResponse {
            success: false,
            error: Some(reason.into()),
            close_price: None,
        }
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl DirectBroker for FakeBroker {
    async fn close(&self, request: &BrokerCloseRequest) -> Result<BrokerCloseResponse, BrokerError> {
        self.requests.lock().push(request.clone());
        match self.responses.lock().pop_front() {
            Some(Ok(resp)) => Ok(resp),
            Some(Err(detail)) => Err(BrokerError::Unexpected(detail)),
            None => Ok(BrokerCloseResponse {
                success: true,
                error: None,
                close_price: None,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingNotifier {
    pub closed: Mutex<Vec<OpenPosition>>,
    pub alerts: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn closed_count(&self) -> usize {
        self.closed.lock().len()
    }

    pub fn alert_count(&self) -> usize {
        self.alerts.lock().len()
    }
}

#[async_trait]
impl NotificationDispatcher for RecordingNotifier {
    async fn position_closed(&self, position: &OpenPosition) {
        self.closed.lock().push(position.clone());
    }

    async fn operator_alert(&self, message: &str) {
        self.alerts.lock().push(message.to_string());
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub ledger: Arc<MemoryLedger>,
    pub queue: Arc<MemoryQueue>,
    pub signals: Arc<MemorySignals>,
    pub exits: Arc<MemoryExitStore>,
    pub oracle: Arc<FixedOracle>,
    pub broker: Arc<FakeBroker>,
    pub notifier: Arc<RecordingNotifier>,
    pub orchestrator: Arc<CloseOrchestrator>,
    pub monitor: Arc<MonitorScheduler>,
}

pub fn test_scheduler_config() -> SchedulerConfig {
    SchedulerConfig {
        interval: Duration::from_millis(20),
        max_concurrency: 4,
        eval_timeout: Duration::from_millis(500),
        shutdown_grace: Duration::from_millis(500),
        max_backoff: Duration::from_millis(200),
        alert_after_failures: 3,
        tolerance: Decimal::ZERO,
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_scheduler_config(), Duration::from_secs(120))
    }

    pub fn with_config(config: SchedulerConfig, command_ttl: Duration) -> Self {
        let ledger = Arc::new(MemoryLedger::default());
        let queue = Arc::new(MemoryQueue::default());
        let signals = Arc::new(MemorySignals::default());
        let exits = Arc::new(MemoryExitStore::default());
        let oracle = Arc::new(FixedOracle::default());
        let broker = Arc::new(FakeBroker::default());
        let notifier = Arc::new(RecordingNotifier::default());

        let terminal: Arc<dyn CloseMethod> = Arc::new(ViaTerminalQueue::new(queue.clone()));
        let direct: Arc<dyn CloseMethod> = Arc::new(ViaDirectBroker::new(broker.clone()));

        let orchestrator = Arc::new(CloseOrchestrator::new(
            ledger.clone(),
            queue.clone(),
            vec![terminal, direct],
            notifier.clone(),
            command_ttl,
        ));

        let monitor = Arc::new(MonitorScheduler::new(
            config,
            ledger.clone(),
            exits.clone(),
            oracle.clone(),
            orchestrator.clone(),
            notifier.clone(),
        ));

        Self {
            ledger,
            queue,
            signals,
            exits,
            oracle,
            broker,
            notifier,
            orchestrator,
            monitor,
        }
    }

    /// Open a position with sealed hidden levels.
    pub async fn open(
        &self,
        instrument: &str,
        side: Side,
        entry: &str,
        stop: &str,
        target: &str,
    ) -> OpenPosition {
        let position = open_position(instrument, side, entry);
        self.exits.store_levels(position.signal_id, stop, target).await;
        self.ledger.add(position.clone());
        position
    }
}

// ---------------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------------

/// Connect to `TEST_DATABASE_URL` and run migrations. `None` when unset, so
/// database tests skip on machines without Postgres.
pub async fn try_setup_test_db() -> Option<PgPool> {
    let url = std::env::var("TEST_DATABASE_URL").ok()?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .expect("Failed to connect to test database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    // Clean tables for test isolation
    sqlx::query("DELETE FROM close_commands").execute(&pool).await.ok();
    sqlx::query("DELETE FROM positions").execute(&pool).await.ok();
    sqlx::query("DELETE FROM signal_exits").execute(&pool).await.ok();
    sqlx::query("DELETE FROM signals").execute(&pool).await.ok();

    Some(pool)
}
