use async_trait::async_trait;
use serde_json::json;

use crate::models::{OpenPosition, PositionStatus};

/// Where close outcomes and operator alerts go. Implementations must swallow
/// their own failures; a lost notification never rolls back a close.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn position_closed(&self, position: &OpenPosition);

    async fn operator_alert(&self, message: &str);
}

/// Telegram notification service. Failures are logged but never block the main flow.
#[derive(Debug, Clone)]
pub struct Notifier {
    http: reqwest::Client,
    bot_token: String,
    chat_id: String,
}

impl Notifier {
    pub fn new(bot_token: String, chat_id: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            bot_token,
            chat_id,
        }
    }

    /// Send a Telegram message. Failures are logged as warnings.
    pub async fn send(&self, message: &str) {
        let url = format!(
            "https://api.telegram.org/bot{}/sendMessage",
            self.bot_token
        );

        let body = json!({
            "chat_id": self.chat_id,
            "text": message,
            "parse_mode": "Markdown",
        });

        match self.http.post(&url).json(&body).send().await {
            Ok(resp) => {
                if !resp.status().is_success() {
                    tracing::warn!(
                        status = %resp.status(),
                        "Telegram sendMessage returned non-2xx"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to send Telegram notification");
            }
        }
    }
}

#[async_trait]
impl NotificationDispatcher for Notifier {
    async fn position_closed(&self, position: &OpenPosition) {
        self.send(&format_position_close(position)).await;
    }

    async fn operator_alert(&self, message: &str) {
        self.send(&format!("*Operator Alert*\n{message}")).await;
    }
}

/// Drops everything; used when no notification channel is configured.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

#[async_trait]
impl NotificationDispatcher for NoopNotifier {
    async fn position_closed(&self, _position: &OpenPosition) {}

    async fn operator_alert(&self, _message: &str) {}
}

/// Format the user-facing close message: final state only.
pub fn format_position_close(position: &OpenPosition) -> String {
    let headline = match position.status {
        PositionStatus::ClosedStop => "Stop Loss Hit",
        PositionStatus::ClosedTarget => "Take Profit Hit",
        PositionStatus::ClosedManual => "Position Closed",
        PositionStatus::ClosedError => "Close Failed",
        PositionStatus::Open => "Position Open",
    };

    let close_price = position
        .close_price
        .map(|p| p.to_string())
        .unwrap_or_else(|| "n/a".into());

    format!(
        "*{}*\nInstrument: {}\nSide: {}\nSize: {}\nEntry: {}\nClose: {}\nReason: {}",
        headline,
        position.instrument,
        position.side,
        position.size,
        position.entry_price,
        close_price,
        position.close_reason.as_deref().unwrap_or("unknown"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Side;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use uuid::Uuid;

    #[test]
    fn close_message_reports_final_state() {
        let position = OpenPosition {
            id: Uuid::new_v4(),
            signal_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            device_id: None,
            broker_account: None,
            instrument: "XAUUSD".into(),
            side: Side::Long,
            entry_price: Decimal::new(265050, 2),
            size: Decimal::new(10, 2),
            broker_ticket: Some("9001".into()),
            status: PositionStatus::ClosedStop,
            opened_at: Utc::now(),
            closed_at: Some(Utc::now()),
            close_price: Some(Decimal::new(264450, 2)),
            close_reason: Some("stop_loss".into()),
        };

        let msg = format_position_close(&position);
        assert!(msg.starts_with("*Stop Loss Hit*"));
        assert!(msg.contains("Close: 2644.50"));
        assert!(msg.contains("Reason: stop_loss"));
    }
}
