use sqlx::PgPool;
use uuid::Uuid;

/// Insert the sealed exit blob for a signal. Returns `false` when the signal
/// already has one; only key rotation may rewrite a stored blob.
pub async fn insert_exit_blob(
    pool: &PgPool,
    signal_id: Uuid,
    blob: &str,
    key_id: i16,
) -> anyhow::Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO signal_exits (signal_id, blob, key_id)
        VALUES ($1, $2, $3)
        ON CONFLICT (signal_id) DO NOTHING
        "#,
    )
    .bind(signal_id)
    .bind(blob)
    .bind(key_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn get_exit_blob(pool: &PgPool, signal_id: Uuid) -> anyhow::Result<Option<String>> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT blob FROM signal_exits WHERE signal_id = $1")
            .bind(signal_id)
            .fetch_optional(pool)
            .await?;

    Ok(row.map(|r| r.0))
}

/// Every stored blob, for key rotation.
pub async fn list_exit_blobs(pool: &PgPool) -> anyhow::Result<Vec<(Uuid, String)>> {
    let rows = sqlx::query_as::<_, (Uuid, String)>(
        "SELECT signal_id, blob FROM signal_exits ORDER BY signal_id",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Compare-and-swap a blob during rotation. Returns `false` when the stored
/// blob no longer matches `old_blob`.
pub async fn replace_exit_blob(
    pool: &PgPool,
    signal_id: Uuid,
    old_blob: &str,
    new_blob: &str,
    key_id: i16,
) -> anyhow::Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE signal_exits
        SET blob = $3, key_id = $4, updated_at = NOW()
        WHERE signal_id = $1 AND blob = $2
        "#,
    )
    .bind(signal_id)
    .bind(old_blob)
    .bind(new_blob)
    .bind(key_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}
