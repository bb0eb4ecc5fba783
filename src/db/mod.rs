pub mod command_repo;
pub mod exit_repo;
pub mod position_repo;
pub mod signal_repo;

pub use command_repo::PgCommandQueue;
pub use position_repo::PgPositionLedger;
pub use signal_repo::PgSignalBook;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

pub async fn init_pool(database_url: &str) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;

    // Verify connectivity
    sqlx::query("SELECT 1").execute(&pool).await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}
