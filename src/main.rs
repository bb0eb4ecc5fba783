use std::sync::Arc;

use exitguard::api::auth::ApiTokens;
use exitguard::api::router::create_router;
use exitguard::broker::auth::BrokerAuth;
use exitguard::broker::client::HttpBrokerClient;
use exitguard::config::{AppConfig, LogFormat};
use exitguard::db::{self, PgCommandQueue, PgPositionLedger, PgSignalBook};
use exitguard::monitor::{
    CloseMethod, CloseOrchestrator, CommandQueue, MonitorScheduler, PositionLedger,
    ViaDirectBroker, ViaTerminalQueue,
};
use exitguard::pricing::{CachedPriceOracle, HttpPriceOracle, PriceOracle};
use exitguard::services::{NoopNotifier, NotificationDispatcher, Notifier};
use exitguard::vault::{ExitCipher, ExitStore, PgExitStore};
use exitguard::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = AppConfig::from_env()?;
    init_tracing(config.log_format);
    let addr = format!("{}:{}", config.host, config.port);

    let metrics_handle = exitguard::metrics::init_metrics()?;

    tracing::info!("Connecting to database...");
    let pool = db::init_pool(&config.database_url).await?;
    tracing::info!("Database connected");

    // --- Exit level vault ---
    let mut cipher = ExitCipher::from_base64(config.exit_key_id, &config.exit_key)?;
    for (key_id, key) in &config.exit_retired_keys {
        cipher = cipher.with_retired_key(*key_id, key)?;
    }
    let exit_store = PgExitStore::new(pool.clone(), Arc::new(cipher));

    if !config.exit_retired_keys.is_empty() {
        let report = exit_store.reencrypt_all().await?;
        tracing::info!(
            rewritten = report.rewritten,
            already_current = report.already_current,
            failed = report.failed,
            raced = report.raced,
            "Exit level re-encryption complete"
        );
    }
    let exits: Arc<dyn ExitStore> = Arc::new(exit_store);

    // --- Collaborators ---
    let http = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(10))
        .build()?;

    let oracle: Arc<dyn PriceOracle> = Arc::new(CachedPriceOracle::new(
        HttpPriceOracle::new(http.clone(), config.price_oracle_url.clone()),
        config.price_cache_ttl(),
        config.max_quote_age(),
    ));

    let notifier: Arc<dyn NotificationDispatcher> =
        match (&config.telegram_bot_token, &config.telegram_chat_id) {
            (Some(token), Some(chat_id)) => {
                tracing::info!("Telegram notifications enabled");
                Arc::new(Notifier::new(token.clone(), chat_id.clone()))
            }
            _ => {
                tracing::info!("Telegram notifications disabled (TELEGRAM_BOT_TOKEN/CHAT_ID not set)");
                Arc::new(NoopNotifier)
            }
        };

    let ledger: Arc<dyn PositionLedger> = Arc::new(PgPositionLedger::new(pool.clone()));
    let signals = Arc::new(PgSignalBook::new(pool.clone()));
    let queue: Arc<dyn CommandQueue> = Arc::new(PgCommandQueue::new(pool.clone()));

    // --- Close methods, in order of preference ---
    let terminal: Arc<dyn CloseMethod> = Arc::new(ViaTerminalQueue::new(Arc::clone(&queue)));
    let mut methods = vec![terminal];

    match (
        &config.broker_api_url,
        &config.broker_api_key,
        &config.broker_api_secret,
    ) {
        (Some(url), Some(key), Some(secret)) => {
            let auth = BrokerAuth::new(key.clone(), secret.clone());
            let broker = HttpBrokerClient::new(http.clone(), auth, url.clone());
            let direct: Arc<dyn CloseMethod> = Arc::new(ViaDirectBroker::new(Arc::new(broker)));
            methods.push(direct);
            tracing::info!("Direct broker close enabled");
        }
        _ => {
            tracing::warn!("No broker API credentials; closes go through the terminal queue only");
        }
    }

    let orchestrator = Arc::new(CloseOrchestrator::new(
        Arc::clone(&ledger),
        Arc::clone(&queue),
        methods,
        Arc::clone(&notifier),
        config.command_ttl(),
    ));

    let monitor = Arc::new(MonitorScheduler::new(
        config.scheduler_config(),
        Arc::clone(&ledger),
        Arc::clone(&exits),
        Arc::clone(&oracle),
        Arc::clone(&orchestrator),
        Arc::clone(&notifier),
    ));

    let monitor_handle = if config.monitor_enabled {
        Some(monitor.start()?)
    } else {
        tracing::info!("Position monitor disabled (MONITOR_ENABLED=false)");
        None
    };

    let state = AppState {
        db: Some(pool),
        tokens: ApiTokens {
            admin: config.api_token.clone(),
            terminal: config.terminal_token.clone(),
        },
        ledger,
        queue,
        signals,
        exits,
        oracle,
        orchestrator,
        monitor,
        metrics_handle,
    };
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {addr}");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(handle) = monitor_handle {
        tracing::info!("Stopping position monitor...");
        handle.stop().await;
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

fn init_tracing(format: LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(fmt::layer()).init(),
    }
}
