use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Side, Signal, SignalRow};
use crate::monitor::ports::SignalBook;

/// Insert the visible half of a signal.
pub async fn insert_signal(
    pool: &PgPool,
    instrument: &str,
    side: Side,
    entry_price: Decimal,
    metadata: &serde_json::Value,
) -> anyhow::Result<Signal> {
    let row = sqlx::query_as::<_, SignalRow>(
        r#"
        INSERT INTO signals (instrument, side, entry_price, metadata)
        VALUES ($1, $2, $3, $4)
        RETURNING id, instrument, side, entry_price, metadata, created_at
        "#,
    )
    .bind(instrument)
    .bind(side.as_str())
    .bind(entry_price)
    .bind(metadata)
    .fetch_one(pool)
    .await?;

    Signal::try_from(row)
}

pub async fn get_signal(pool: &PgPool, id: Uuid) -> anyhow::Result<Option<Signal>> {
    let row = sqlx::query_as::<_, SignalRow>(
        "SELECT id, instrument, side, entry_price, metadata, created_at FROM signals WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    row.map(Signal::try_from).transpose()
}

#[derive(Clone)]
pub struct PgSignalBook {
    pool: PgPool,
}

impl PgSignalBook {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SignalBook for PgSignalBook {
    async fn get(&self, signal_id: Uuid) -> anyhow::Result<Option<Signal>> {
        get_signal(&self.pool, signal_id).await
    }
}
