//! External Alert Sink
//!
//! Optional chat-bot gateway (Telegram wire format). Two duties: forward a
//! compact text summary of each anomaly to the shop's configured target, and
//! run the long-poll loop that answers any inbound message with the sender's
//! chat id so operators can discover the target value to configure.
//!
//! Everything here is best-effort. A slow or dead gateway costs a WARN, never
//! the primary WebSocket push.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use sqlx::SqlitePool;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db;

/// Per-request deadline for gateway calls
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Long-poll window for update fetching
const POLL_TIMEOUT_SECS: u64 = 25;

pub struct ExternalSink {
    client: reqwest::Client,
    base_url: String,
}

impl ExternalSink {
    pub fn new(token: &str) -> Self {
        Self::with_base(format!("https://api.telegram.org/bot{token}"))
    }

    /// Alternate gateway root, used by tests
    pub fn with_base(base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("reqwest client");
        Self { client, base_url }
    }

    pub async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), reqwest::Error> {
        self.client
            .post(format!("{}/sendMessage", self.base_url))
            .json(&json!({ "chat_id": chat_id, "text": text }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn get_updates(&self, offset: i64) -> Result<Vec<Update>, reqwest::Error> {
        let response: UpdatesResponse = self
            .client
            .get(format!("{}/getUpdates", self.base_url))
            .query(&[
                ("offset", offset.to_string()),
                ("timeout", POLL_TIMEOUT_SECS.to_string()),
            ])
            .timeout(Duration::from_secs(POLL_TIMEOUT_SECS + 5))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.result)
    }
}

#[derive(Debug, Deserialize)]
struct UpdatesResponse {
    #[serde(default)]
    result: Vec<Update>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    message: Option<InboundMessage>,
}

#[derive(Debug, Deserialize)]
struct InboundMessage {
    chat: Chat,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
}

/// Resolves a shop's configured target and forwards the summary
pub struct ExternalAlerts {
    sink: Arc<ExternalSink>,
    pool: SqlitePool,
}

impl ExternalAlerts {
    pub fn new(sink: Arc<ExternalSink>, pool: SqlitePool) -> Self {
        Self { sink, pool }
    }

    pub async fn notify_shop(&self, shop_id: Uuid, text: &str) {
        let target = match db::external_alert_target(&self.pool, shop_id).await {
            Ok(Some(target)) => target,
            Ok(None) => return,
            Err(e) => {
                warn!(shop = %shop_id, error = %e, "external target lookup failed");
                return;
            }
        };
        if let Err(e) = self.sink.send_message(&target, text).await {
            warn!(shop = %shop_id, error = %e, "external alert delivery failed");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollingState {
    Running,
    Stopped,
}

/// Owner of the gateway long-poll loop. One controller per process,
/// started and stopped by the lifecycle.
pub struct PollingController {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PollingController {
    pub fn start(sink: Arc<ExternalSink>) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(poll_loop(sink, shutdown_rx));
        info!("external sink polling started");
        Self { shutdown, task }
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .is_err()
        {
            warn!("external sink polling did not stop in time");
        } else {
            info!("external sink polling stopped");
        }
    }
}

async fn poll_loop(sink: Arc<ExternalSink>, mut shutdown: watch::Receiver<bool>) {
    let mut state = PollingState::Running;
    let mut offset: i64 = 0;

    while state == PollingState::Running {
        let updates = tokio::select! {
            result = sink.get_updates(offset) => result,
            _ = shutdown.changed() => {
                state = PollingState::Stopped;
                continue;
            }
        };

        let updates = match updates {
            Ok(updates) => updates,
            Err(e) => {
                debug!(error = %e, "update poll failed, backing off");
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(3)) => continue,
                    _ = shutdown.changed() => {
                        state = PollingState::Stopped;
                        continue;
                    }
                }
            }
        };

        for update in updates {
            offset = offset.max(update.update_id + 1);
            let Some(message) = update.message else {
                continue;
            };
            let chat_id = message.chat.id;
            debug!(chat = chat_id, text = ?message.text, "inbound gateway message");
            let reply = format!("Your chat id is {chat_id}");
            if let Err(e) = sink.send_message(&chat_id.to_string(), &reply).await {
                debug!(error = %e, "chat id reply failed");
            }
        }
    }
}
