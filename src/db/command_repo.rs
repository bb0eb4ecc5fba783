use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::command::CloseCommandRow;
use crate::models::{AckStatus, CloseCommand, CommandAck, CommandStatus};
use crate::monitor::ports::{AckApplied, CommandQueue};

const COMMAND_COLUMNS: &str = "id, position_id, device_id, broker_ticket, reason, note, observed_price, \
     status, delivery_count, created_at, delivered_at, acknowledged_at, close_price, error";

pub async fn get_command(pool: &PgPool, id: Uuid) -> anyhow::Result<Option<CloseCommand>> {
    let row = sqlx::query_as::<_, CloseCommandRow>(&format!(
        "SELECT {COMMAND_COLUMNS} FROM close_commands WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    row.map(CloseCommand::try_from).transpose()
}

/// Insert a command unless its id is already taken, then return the stored row.
pub async fn insert_command(pool: &PgPool, cmd: &CloseCommand) -> anyhow::Result<CloseCommand> {
    sqlx::query(
        r#"
        INSERT INTO close_commands
            (id, position_id, device_id, broker_ticket, reason, note, observed_price, status, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(cmd.id)
    .bind(cmd.position_id)
    .bind(cmd.device_id)
    .bind(cmd.broker_ticket.as_deref())
    .bind(cmd.reason.as_str())
    .bind(cmd.note.as_deref())
    .bind(cmd.observed_price)
    .bind(cmd.status.as_str())
    .bind(cmd.created_at)
    .execute(pool)
    .await?;

    get_command(pool, cmd.id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("close command {} vanished after insert", cmd.id))
}

/// Hand out pending commands for a device, bumping their delivery count.
pub async fn take_pending_for_device(
    pool: &PgPool,
    device_id: Uuid,
    limit: i64,
) -> anyhow::Result<Vec<CloseCommand>> {
    let rows = sqlx::query_as::<_, CloseCommandRow>(&format!(
        r#"
        UPDATE close_commands
        SET delivery_count = delivery_count + 1, delivered_at = NOW()
        WHERE id IN (
            SELECT id FROM close_commands
            WHERE device_id = $1 AND status = 'pending'
            ORDER BY created_at ASC
            LIMIT $2
        )
        RETURNING {COMMAND_COLUMNS}
        "#
    ))
    .bind(device_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let mut commands = rows
        .into_iter()
        .map(CloseCommand::try_from)
        .collect::<anyhow::Result<Vec<_>>>()?;
    commands.sort_by_key(|c| c.created_at);

    Ok(commands)
}

/// Record the first acknowledgment of a pending command. Returns `None` if the
/// command is unknown or was already acknowledged.
pub async fn acknowledge_command(
    pool: &PgPool,
    id: Uuid,
    ack: &CommandAck,
) -> anyhow::Result<Option<CloseCommand>> {
    let status = match ack.status {
        AckStatus::Executed => CommandStatus::Executed,
        AckStatus::Failed => CommandStatus::Failed,
    };

    let row = sqlx::query_as::<_, CloseCommandRow>(&format!(
        r#"
        UPDATE close_commands
        SET status = $2, close_price = $3, error = $4, acknowledged_at = NOW()
        WHERE id = $1 AND status = 'pending'
        RETURNING {COMMAND_COLUMNS}
        "#
    ))
    .bind(id)
    .bind(status.as_str())
    .bind(ack.close_price)
    .bind(ack.error.as_deref())
    .fetch_optional(pool)
    .await?;

    row.map(CloseCommand::try_from).transpose()
}

pub async fn supersede_command(pool: &PgPool, id: Uuid, note: &str) -> anyhow::Result<()> {
    sqlx::query(
        "UPDATE close_commands SET status = 'superseded', error = $2 WHERE id = $1 AND status = 'pending'",
    )
    .bind(id)
    .bind(note)
    .execute(pool)
    .await?;

    Ok(())
}

/// [`CommandQueue`] over the close_commands table.
#[derive(Clone)]
pub struct PgCommandQueue {
    pool: PgPool,
}

impl PgCommandQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CommandQueue for PgCommandQueue {
    async fn get(&self, command_id: Uuid) -> anyhow::Result<Option<CloseCommand>> {
        get_command(&self.pool, command_id).await
    }

    async fn enqueue(&self, command: &CloseCommand) -> anyhow::Result<CloseCommand> {
        insert_command(&self.pool, command).await
    }

    async fn poll(&self, device_id: Uuid, limit: i64) -> anyhow::Result<Vec<CloseCommand>> {
        take_pending_for_device(&self.pool, device_id, limit).await
    }

    async fn acknowledge(&self, command_id: Uuid, ack: &CommandAck) -> anyhow::Result<AckApplied> {
        if let Some(cmd) = acknowledge_command(&self.pool, command_id, ack).await? {
            return Ok(AckApplied::Applied(cmd));
        }

        Ok(match get_command(&self.pool, command_id).await? {
            Some(existing) => AckApplied::Duplicate(existing),
            None => AckApplied::NotFound,
        })
    }

    async fn supersede(&self, command_id: Uuid, note: &str) -> anyhow::Result<()> {
        supersede_command(&self.pool, command_id, note).await
    }
}
