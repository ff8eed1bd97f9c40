//! Notification delivery with transport fallback. Idempotency (at-most-once
//! delivery of a given logical message) is the caller's responsibility —
//! the Notifier itself only guarantees best-effort delivery of whatever it
//! is asked to send.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::error::{PaymentCoreError, Result};

#[async_trait]
pub trait NotificationTransport: Send + Sync {
    fn name(&self) -> &'static str;
    async fn send(&self, recipient_id: i64, text: &str) -> Result<()>;
}

/// One logical interface with two transport implementations and an explicit
/// fallback order, so callers never know which transport actually delivered
/// a message.
pub struct Notifier {
    transports: Vec<Arc<dyn NotificationTransport>>,
    admin_user_id: Option<i64>,
}

impl Notifier {
    pub fn new(transports: Vec<Arc<dyn NotificationTransport>>, admin_user_id: Option<i64>) -> Self {
        Notifier {
            transports,
            admin_user_id,
        }
    }

    pub async fn notify_user(&self, user_id: i64, text: &str) -> Result<()> {
        self.send_with_fallback(user_id, text).await
    }

    /// Best-effort: failures are logged, never propagated, mirroring the
    /// admin-notification policy in SPEC_FULL.md §7.
    pub async fn notify_admin(&self, text: &str) {
        let Some(admin_id) = self.admin_user_id else {
            return;
        };
        if let Err(e) = self.send_with_fallback(admin_id, text).await {
            warn!(error = %e, "admin notification failed on all transports");
        }
    }

    async fn send_with_fallback(&self, recipient_id: i64, text: &str) -> Result<()> {
        let mut last_err = None;
        for transport in &self.transports {
            match transport.send(recipient_id, text).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(transport = transport.name(), error = %e, "notification transport failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| PaymentCoreError::notification("no transports configured")))
    }
}

/// In-process bot-handle transport: delivers via a channel a long-lived bot
/// task reads from.
pub struct BotHandleTransport {
    sender: tokio::sync::mpsc::Sender<(i64, String)>,
}

impl BotHandleTransport {
    pub fn new(sender: tokio::sync::mpsc::Sender<(i64, String)>) -> Self {
        BotHandleTransport { sender }
    }
}

#[async_trait]
impl NotificationTransport for BotHandleTransport {
    fn name(&self) -> &'static str {
        "bot_handle"
    }

    async fn send(&self, recipient_id: i64, text: &str) -> Result<()> {
        self.sender
            .send((recipient_id, text.to_string()))
            .await
            .map_err(|_| PaymentCoreError::notification("bot handle channel closed"))
    }
}

/// Direct HTTP transport against the Telegram Bot API, used as a fallback
/// when the in-process bot handle is unavailable (e.g. a separate process).
pub struct HttpBotTransport {
    bot_token: String,
    client: reqwest::Client,
}

impl HttpBotTransport {
    pub fn new(bot_token: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("reqwest client");
        HttpBotTransport { bot_token, client }
    }

    fn fake(&self) -> bool {
        self.bot_token.is_empty() || self.bot_token.eq_ignore_ascii_case("test")
    }
}

#[async_trait]
impl NotificationTransport for HttpBotTransport {
    fn name(&self) -> &'static str {
        "http_bot"
    }

    async fn send(&self, recipient_id: i64, text: &str) -> Result<()> {
        if self.fake() {
            return Ok(());
        }
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let resp = self
            .client
            .post(url)
            .json(&serde_json::json!({ "chat_id": recipient_id, "text": text }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(PaymentCoreError::notification(format!(
                "telegram API returned status {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingTransport;
    #[async_trait]
    impl NotificationTransport for FailingTransport {
        fn name(&self) -> &'static str {
            "failing"
        }
        async fn send(&self, _recipient_id: i64, _text: &str) -> Result<()> {
            Err(PaymentCoreError::notification("boom"))
        }
    }

    struct CountingTransport(Arc<AtomicUsize>);
    #[async_trait]
    impl NotificationTransport for CountingTransport {
        fn name(&self) -> &'static str {
            "counting"
        }
        async fn send(&self, _recipient_id: i64, _text: &str) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn falls_back_to_second_transport_on_first_failure() {
        let count = Arc::new(AtomicUsize::new(0));
        let notifier = Notifier::new(
            vec![
                Arc::new(FailingTransport),
                Arc::new(CountingTransport(count.clone())),
            ],
            None,
        );
        notifier.notify_user(1, "hello").await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reports_error_when_all_transports_fail() {
        let notifier = Notifier::new(vec![Arc::new(FailingTransport)], None);
        let err = notifier.notify_user(1, "hello").await.unwrap_err();
        assert!(matches!(err, PaymentCoreError::Notification(_)));
    }
}
