use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};

use super::auth::BrokerAuth;
use super::{BrokerCloseRequest, BrokerCloseResponse, BrokerError, DirectBroker};

const CLOSE_PATH: &str = "/v1/positions/close";

#[derive(Debug, Clone)]
pub struct HttpBrokerClient {
    http: Client,
    auth: BrokerAuth,
    base_url: String,
}

impl HttpBrokerClient {
    pub fn new(http: Client, auth: BrokerAuth, base_url: impl Into<String>) -> Self {
        Self {
            http,
            auth,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Build an authenticated POST with HMAC signature headers.
    fn authenticated_post(&self, path: &str, body: String) -> Result<RequestBuilder, BrokerError> {
        let timestamp = chrono::Utc::now().timestamp().to_string();
        let signature = self.auth.sign(&timestamp, "POST", path, &body)?;

        let url = format!("{}{}", self.base_url, path);
        let req = self
            .http
            .post(&url)
            .header("X-API-KEY", &self.auth.api_key)
            .header("X-SIGNATURE", signature)
            .header("X-TIMESTAMP", &timestamp)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);

        Ok(req)
    }
}

#[async_trait]
impl DirectBroker for HttpBrokerClient {
    async fn close(&self, request: &BrokerCloseRequest) -> Result<BrokerCloseResponse, BrokerError> {
        let body = serde_json::to_string(request)
            .map_err(|e| BrokerError::Unexpected(e.to_string()))?;

        let resp = self
            .authenticated_post(CLOSE_PATH, body)?
            .header("Idempotency-Key", request.idempotency_key.to_string())
            .send()
            .await?;

        let status = resp.status();
        // 4xx bodies still carry {success:false,error}; anything else is transport trouble.
        if status.is_server_error() {
            return Err(BrokerError::Unexpected(format!("broker returned {status}")));
        }

        resp.json::<BrokerCloseResponse>()
            .await
            .map_err(|e| BrokerError::Unexpected(format!("{status}: {e}")))
    }
}
