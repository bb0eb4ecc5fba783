pub mod api;
pub mod broker;
pub mod config;
pub mod db;
pub mod errors;
pub mod metrics;
pub mod models;
pub mod monitor;
pub mod pricing;
pub mod services;
pub mod vault;

use std::sync::Arc;

use crate::api::auth::ApiTokens;
use crate::monitor::{CloseOrchestrator, CommandQueue, MonitorScheduler, PositionLedger, SignalBook};
use crate::pricing::PriceOracle;
use crate::vault::ExitStore;

#[derive(Clone)]
pub struct AppState {
    /// `None` when running against in-memory collaborators.
    pub db: Option<sqlx::PgPool>,
    pub tokens: ApiTokens,
    pub ledger: Arc<dyn PositionLedger>,
    pub queue: Arc<dyn CommandQueue>,
    pub signals: Arc<dyn SignalBook>,
    pub exits: Arc<dyn ExitStore>,
    pub oracle: Arc<dyn PriceOracle>,
    pub orchestrator: Arc<CloseOrchestrator>,
    pub monitor: Arc<MonitorScheduler>,
    pub metrics_handle: metrics_exporter_prometheus::PrometheusHandle,
}
