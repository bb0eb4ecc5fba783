pub mod cache;
pub mod oracle;

pub use cache::CachedPriceOracle;
pub use oracle::HttpPriceOracle;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub price: Decimal,
    pub as_of: DateTime<Utc>,
}

#[derive(Debug, Clone, Error)]
pub enum PriceError {
    #[error("price unavailable for {instrument}: {detail}")]
    Unavailable { instrument: String, detail: String },

    #[error("price for {instrument} is stale (as of {as_of})")]
    Stale {
        instrument: String,
        as_of: DateTime<Utc>,
    },
}

#[async_trait]
pub trait PriceOracle: Send + Sync {
    async fn get_price(&self, instrument: &str) -> Result<Quote, PriceError>;
}
