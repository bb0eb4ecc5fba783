use async_trait::async_trait;
use reqwest::Client;

use super::{PriceError, PriceOracle, Quote};

/// Price oracle over HTTP: `GET {base_url}/prices/{instrument}` returning
/// `{"price": "...", "as_of": "..."}`.
#[derive(Debug, Clone)]
pub struct HttpPriceOracle {
    http: Client,
    base_url: String,
}

impl HttpPriceOracle {
    pub fn new(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl PriceOracle for HttpPriceOracle {
    async fn get_price(&self, instrument: &str) -> Result<Quote, PriceError> {
        let unavailable = |detail: String| PriceError::Unavailable {
            instrument: instrument.to_string(),
            detail,
        };

        let url = format!("{}/prices/{}", self.base_url, instrument);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| unavailable(e.to_string()))?;

        resp.json::<Quote>()
            .await
            .map_err(|e| unavailable(format!("malformed quote: {e}")))
    }
}
