//! SMS delivery of issued codes.

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

#[derive(Clone, Debug)]
pub struct SmsMessage {
    pub realm_id: i64,
    pub to: String,
    pub body: String,
}

impl SmsMessage {
    /// Message carrying a short code and, when present, the long-code link.
    #[must_use]
    pub fn for_code(realm_id: i64, to: String, realm_name: &str, code: &str, link: Option<&str>) -> Self {
        let body = match link {
            Some(link) => format!("Your {realm_name} verification code is {code}. Or open {link}"),
            None => format!("Your {realm_name} verification code is {code}"),
        };
        Self { realm_id, to, body }
    }
}

#[async_trait]
pub trait SmsSender: Send + Sync {
    /// Deliver a message or return an error to mark it as failed.
    async fn send(&self, message: &SmsMessage) -> Result<()>;
}

/// Local dev sender that logs instead of sending. The body carries a live
/// code, so only its length is logged.
#[derive(Clone, Debug)]
pub struct LogSmsSender;

#[async_trait]
impl SmsSender for LogSmsSender {
    async fn send(&self, message: &SmsMessage) -> Result<()> {
        info!(
            realm_id = message.realm_id,
            body_len = message.body.len(),
            "sms send stub"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_includes_link_when_present() {
        let msg = SmsMessage::for_code(1, "+15551234567".to_string(), "State", "12345678", None);
        assert_eq!(msg.body, "Your State verification code is 12345678");

        let msg = SmsMessage::for_code(
            1,
            "+15551234567".to_string(),
            "State",
            "12345678",
            Some("https://example.org/v?c=abc"),
        );
        assert!(msg.body.ends_with("Or open https://example.org/v?c=abc"));
    }

    #[tokio::test]
    async fn log_sender_succeeds() -> Result<()> {
        let msg = SmsMessage::for_code(1, "+1555".to_string(), "State", "1", None);
        LogSmsSender.send(&msg).await
    }
}
