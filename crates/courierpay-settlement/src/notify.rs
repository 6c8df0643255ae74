//! Notification collaborator seam
//!
//! Delivery of notifications is an external concern; the engine only emits
//! them fire-and-forget. A notification failure is logged and never rolls
//! back financial state.

use async_trait::async_trait;

/// Fire-and-forget notification sink
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        recipient_id: &str,
        title: &str,
        message: &str,
        data: serde_json::Value,
    );
}

/// Discards all notifications
#[derive(Default)]
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn notify(&self, _: &str, _: &str, _: &str, _: serde_json::Value) {}
}

/// Records notifications for test assertions
#[derive(Default)]
pub struct RecordingNotifier {
    sent: tokio::sync::Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// (recipient, title) pairs in send order
    pub async fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, recipient_id: &str, title: &str, _message: &str, _: serde_json::Value) {
        self.sent
            .lock()
            .await
            .push((recipient_id.to_string(), title.to_string()));
    }
}

