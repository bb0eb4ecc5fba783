use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::position::PositionRow;
use crate::models::{NewPosition, OpenPosition, PositionStatus};
use crate::monitor::ports::{PositionLedger, Transition};

const POSITION_COLUMNS: &str = "id, signal_id, user_id, device_id, broker_account, instrument, \
     side, entry_price, size, broker_ticket, status, opened_at, closed_at, close_price, close_reason";

fn into_positions(rows: Vec<PositionRow>) -> anyhow::Result<Vec<OpenPosition>> {
    rows.into_iter().map(OpenPosition::try_from).collect()
}

/// Record a position from a terminal's execution acknowledgment.
pub async fn insert_position(pool: &PgPool, new: &NewPosition) -> anyhow::Result<OpenPosition> {
    let row = sqlx::query_as::<_, PositionRow>(&format!(
        r#"
        INSERT INTO positions
            (signal_id, user_id, device_id, broker_account, instrument, side, entry_price, size, broker_ticket)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING {POSITION_COLUMNS}
        "#
    ))
    .bind(new.signal_id)
    .bind(new.user_id)
    .bind(new.device_id)
    .bind(new.broker_account.as_deref())
    .bind(&new.instrument)
    .bind(new.side.as_str())
    .bind(new.entry_price)
    .bind(new.size)
    .bind(new.broker_ticket.as_deref())
    .fetch_one(pool)
    .await?;

    row.try_into()
}

/// Get all open positions.
pub async fn get_open_positions(pool: &PgPool) -> anyhow::Result<Vec<OpenPosition>> {
    let rows = sqlx::query_as::<_, PositionRow>(&format!(
        "SELECT {POSITION_COLUMNS} FROM positions WHERE status = 'open' ORDER BY opened_at ASC"
    ))
    .fetch_all(pool)
    .await?;

    into_positions(rows)
}

/// Most recent positions, optionally filtered by status.
pub async fn list_positions(
    pool: &PgPool,
    status: Option<PositionStatus>,
    limit: i64,
) -> anyhow::Result<Vec<OpenPosition>> {
    let rows = sqlx::query_as::<_, PositionRow>(&format!(
        r#"
        SELECT {POSITION_COLUMNS} FROM positions
        WHERE ($1::TEXT IS NULL OR status = $1)
        ORDER BY opened_at DESC
        LIMIT $2
        "#
    ))
    .bind(status.map(|s| s.as_str()))
    .bind(limit)
    .fetch_all(pool)
    .await?;

    into_positions(rows)
}

pub async fn get_position(pool: &PgPool, id: Uuid) -> anyhow::Result<Option<OpenPosition>> {
    let row = sqlx::query_as::<_, PositionRow>(&format!(
        "SELECT {POSITION_COLUMNS} FROM positions WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    row.map(OpenPosition::try_from).transpose()
}

pub async fn set_broker_ticket(
    pool: &PgPool,
    id: Uuid,
    ticket: &str,
) -> anyhow::Result<Option<OpenPosition>> {
    let row = sqlx::query_as::<_, PositionRow>(&format!(
        r#"
        UPDATE positions SET broker_ticket = $2
        WHERE id = $1 AND status = 'open'
        RETURNING {POSITION_COLUMNS}
        "#
    ))
    .bind(id)
    .bind(ticket)
    .fetch_optional(pool)
    .await?;

    row.map(OpenPosition::try_from).transpose()
}

/// Close a position exactly once. The `status = 'open'` guard makes a second
/// attempt a no-op that returns `None`.
pub async fn close_position(
    pool: &PgPool,
    id: Uuid,
    transition: &Transition,
) -> anyhow::Result<Option<OpenPosition>> {
    let row = sqlx::query_as::<_, PositionRow>(&format!(
        r#"
        UPDATE positions
        SET status = $2, close_price = $3, close_reason = $4, closed_at = $5
        WHERE id = $1 AND status = 'open'
        RETURNING {POSITION_COLUMNS}
        "#
    ))
    .bind(id)
    .bind(transition.status.as_str())
    .bind(transition.close_price)
    .bind(&transition.reason)
    .bind(transition.at)
    .fetch_optional(pool)
    .await?;

    row.map(OpenPosition::try_from).transpose()
}

/// [`PositionLedger`] over the positions table.
#[derive(Clone)]
pub struct PgPositionLedger {
    pool: PgPool,
}

impl PgPositionLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PositionLedger for PgPositionLedger {
    async fn list_open(&self) -> anyhow::Result<Vec<OpenPosition>> {
        get_open_positions(&self.pool).await
    }

    async fn list(
        &self,
        status: Option<PositionStatus>,
        limit: i64,
    ) -> anyhow::Result<Vec<OpenPosition>> {
        list_positions(&self.pool, status, limit).await
    }

    async fn get(&self, id: Uuid) -> anyhow::Result<Option<OpenPosition>> {
        get_position(&self.pool, id).await
    }

    async fn insert(&self, new: &NewPosition) -> anyhow::Result<OpenPosition> {
        insert_position(&self.pool, new).await
    }

    async fn attach_ticket(&self, id: Uuid, ticket: &str) -> anyhow::Result<Option<OpenPosition>> {
        set_broker_ticket(&self.pool, id, ticket).await
    }

    async fn transition(
        &self,
        id: Uuid,
        transition: &Transition,
    ) -> anyhow::Result<Option<OpenPosition>> {
        close_position(&self.pool, id, transition).await
    }
}
