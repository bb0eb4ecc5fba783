use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tokio::time::Instant;

use super::{PriceError, PriceOracle, Quote};

/// Per-instrument quote cache with a short TTL in front of another oracle.
/// Quotes whose `as_of` is older than `max_quote_age` are refused.
pub struct CachedPriceOracle<O> {
    inner: O,
    ttl: Duration,
    max_quote_age: chrono::Duration,
    quotes: RwLock<HashMap<String, (Quote, Instant)>>,
}

impl<O: PriceOracle> CachedPriceOracle<O> {
    pub fn new(inner: O, ttl: Duration, max_quote_age: Duration) -> Self {
        Self {
            inner,
            ttl,
            max_quote_age: chrono::Duration::from_std(max_quote_age)
                .unwrap_or(chrono::Duration::MAX),
            quotes: RwLock::new(HashMap::new()),
        }
    }

    fn check_age(&self, instrument: &str, quote: Quote) -> Result<Quote, PriceError> {
        if Utc::now() - quote.as_of > self.max_quote_age {
            return Err(PriceError::Stale {
                instrument: instrument.to_string(),
                as_of: quote.as_of,
            });
        }
        Ok(quote)
    }
}

#[async_trait]
impl<O: PriceOracle> PriceOracle for CachedPriceOracle<O> {
    async fn get_price(&self, instrument: &str) -> Result<Quote, PriceError> {
        {
            let quotes = self.quotes.read().await;
            if let Some((quote, fetched_at)) = quotes.get(instrument) {
                if fetched_at.elapsed() < self.ttl {
                    return self.check_age(instrument, *quote);
                }
            }
        }

        let quote = self.inner.get_price(instrument).await?;
        self.quotes
            .write()
            .await
            .insert(instrument.to_string(), (quote, Instant::now()));

        self.check_age(instrument, quote)
    }
}
