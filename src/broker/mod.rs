pub mod auth;
pub mod client;

pub use auth::BrokerAuth;
pub use client::HttpBrokerClient;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("authentication error: {0}")]
    Auth(#[from] auth::AuthError),

    #[error("unexpected response: {0}")]
    Unexpected(String),
}

/// Close request sent on a user's behalf with delegated credentials.
#[derive(Debug, Clone, Serialize)]
pub struct BrokerCloseRequest {
    pub account: String,
    pub ticket: String,
    pub volume: Decimal,
    /// Close command id; the broker dedupes retried requests on it.
    #[serde(skip)]
    pub idempotency_key: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BrokerCloseResponse {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub close_price: Option<Decimal>,
}

#[async_trait]
pub trait DirectBroker: Send + Sync {
    async fn close(&self, request: &BrokerCloseRequest) -> Result<BrokerCloseResponse, BrokerError>;
}
