//! Alert Hub
//!
//! One persistent bidirectional channel per user, fanning in anomaly events
//! from all of that user's streams. A single writer task serializes the
//! outbound side, so heartbeats and alerts never interleave mid-write and
//! per-user delivery order matches submission order. Producers await on a
//! bounded mailbox; an abnormal burst backpressures the pipeline instead of
//! growing a queue.
//!
//! Heartbeats are symmetric: the server pings every 30 s and closes the
//! channel after 60 s without any client traffic. A second attach for the
//! same user supersedes the first with close code 4000.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use axum::extract::ws::{CloseFrame, Message};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use futures::{Sink, SinkExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vigil_core::detect::{BBox, ConfidenceBucket};
use vigil_core::processor::{AlertSink, AnomalyAlert};

use crate::metrics::{ALERTS_DELIVERED, ALERTS_DROPPED, ANOMALIES_DETECTED, WS_CONNECTIONS};
use crate::sink::ExternalAlerts;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(60);

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_SUPERSEDED: u16 = 4000;
pub const CLOSE_HEARTBEAT_TIMEOUT: u16 = 4001;
pub const CLOSE_UNAUTHENTICATED: u16 = 4401;

const MAILBOX_CAPACITY: usize = 64;

/// Wire messages, JSON text frames both directions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    Ping {
        timestamp: String,
    },
    Pong {
        timestamp: String,
    },
    AnomalyDetected {
        user_id: Uuid,
        stream_id: Uuid,
        result: AlertResult,
        annotated_frame: String,
        frame_format: String,
    },
    Ack {
        stream_id: Uuid,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertResult {
    pub person_id: u32,
    pub frame_number: u64,
    pub score: f32,
    pub classification: String,
    pub confidence: ConfidenceBucket,
    pub bbox: BBox,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelStats {
    pub user_id: Uuid,
    pub connected: bool,
    pub connected_at: DateTime<Utc>,
    pub uptime_seconds: i64,
    pub last_heartbeat_at: DateTime<Utc>,
    pub seconds_since_heartbeat: i64,
}

enum Outbound {
    Message(WsMessage),
    Close { code: u16, reason: &'static str },
}

struct HeartbeatMark {
    at: Instant,
    wall: DateTime<Utc>,
}

struct ChannelEntry {
    channel_id: Uuid,
    outbound: mpsc::Sender<Outbound>,
    connected_at: DateTime<Utc>,
    last_heartbeat: Arc<StdMutex<HeartbeatMark>>,
    heartbeat_task: JoinHandle<()>,
}

impl ChannelEntry {
    /// Queue a close frame and stop the heartbeat. The writer exits after
    /// forwarding the frame.
    fn close(&self, code: u16, reason: &'static str) {
        let _ = self.outbound.try_send(Outbound::Close { code, reason });
        self.heartbeat_task.abort();
    }
}

#[derive(Default)]
pub struct AlertHub {
    channels: StdMutex<HashMap<Uuid, ChannelEntry>>,
    external: Option<Arc<ExternalAlerts>>,
}

impl AlertHub {
    pub fn new(external: Option<Arc<ExternalAlerts>>) -> Self {
        Self {
            channels: StdMutex::new(HashMap::new()),
            external,
        }
    }

    /// Bind a user's socket write half to a fresh channel, superseding any
    /// existing one. Returns the channel id the read loop detaches with.
    pub fn attach<S>(self: &Arc<Self>, user_id: Uuid, sink: S) -> Uuid
    where
        S: Sink<Message> + Send + Unpin + 'static,
        S::Error: std::fmt::Display,
    {
        let channel_id = Uuid::new_v4();
        let (outbound_tx, outbound_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let last_heartbeat = Arc::new(StdMutex::new(HeartbeatMark {
            at: Instant::now(),
            wall: Utc::now(),
        }));

        tokio::spawn(writer_loop(sink, outbound_rx));

        let heartbeat_task = tokio::spawn(heartbeat_loop(
            self.clone(),
            user_id,
            channel_id,
            outbound_tx.clone(),
            last_heartbeat.clone(),
        ));

        let entry = ChannelEntry {
            channel_id,
            outbound: outbound_tx,
            connected_at: Utc::now(),
            last_heartbeat,
            heartbeat_task,
        };

        let mut channels = self.channels.lock().expect("hub lock poisoned");
        if let Some(previous) = channels.insert(user_id, entry) {
            info!(user = %user_id, "alert channel superseded");
            previous.close(CLOSE_SUPERSEDED, "superseded");
        } else {
            info!(user = %user_id, "alert channel attached");
        }
        WS_CONNECTIONS.set(channels.len() as f64);
        channel_id
    }

    /// Remove the channel if it is still the one the caller attached. Used
    /// by the read loop when the client goes away; a superseding channel is
    /// left untouched.
    pub fn detach(&self, user_id: Uuid, channel_id: Uuid) {
        let mut channels = self.channels.lock().expect("hub lock poisoned");
        let matches = channels
            .get(&user_id)
            .is_some_and(|entry| entry.channel_id == channel_id);
        if matches {
            if let Some(entry) = channels.remove(&user_id) {
                entry.heartbeat_task.abort();
            }
            info!(user = %user_id, "alert channel detached");
        }
        WS_CONNECTIONS.set(channels.len() as f64);
    }

    /// Close and remove one channel with an explicit code
    fn close_channel(&self, user_id: Uuid, channel_id: Uuid, code: u16, reason: &'static str) {
        let mut channels = self.channels.lock().expect("hub lock poisoned");
        let matches = channels
            .get(&user_id)
            .is_some_and(|entry| entry.channel_id == channel_id);
        if matches {
            if let Some(entry) = channels.remove(&user_id) {
                entry.close(code, reason);
            }
            warn!(user = %user_id, code, reason, "alert channel closed");
        }
        WS_CONNECTIONS.set(channels.len() as f64);
    }

    /// Any inbound client traffic counts as a heartbeat
    pub fn touch(&self, user_id: Uuid) {
        let channels = self.channels.lock().expect("hub lock poisoned");
        if let Some(entry) = channels.get(&user_id) {
            let mut mark = entry.last_heartbeat.lock().expect("heartbeat lock poisoned");
            mark.at = Instant::now();
            mark.wall = Utc::now();
        }
    }

    pub fn is_connected(&self, user_id: Uuid) -> bool {
        self.channels
            .lock()
            .expect("hub lock poisoned")
            .contains_key(&user_id)
    }

    pub fn stats(&self, user_id: Uuid) -> Option<ChannelStats> {
        let channels = self.channels.lock().expect("hub lock poisoned");
        channels.get(&user_id).map(|entry| entry_stats(user_id, entry))
    }

    pub fn stats_all(&self) -> Vec<ChannelStats> {
        let channels = self.channels.lock().expect("hub lock poisoned");
        let mut all: Vec<ChannelStats> = channels
            .iter()
            .map(|(user_id, entry)| entry_stats(*user_id, entry))
            .collect();
        all.sort_by_key(|s| s.connected_at);
        all
    }

    /// Close every channel, for shutdown
    pub fn close_all(&self, reason: &'static str) {
        let mut channels = self.channels.lock().expect("hub lock poisoned");
        for (user_id, entry) in channels.drain() {
            debug!(user = %user_id, reason, "closing alert channel");
            entry.close(CLOSE_NORMAL, reason);
        }
        WS_CONNECTIONS.set(0.0);
    }
}

fn entry_stats(user_id: Uuid, entry: &ChannelEntry) -> ChannelStats {
    let mark = entry.last_heartbeat.lock().expect("heartbeat lock poisoned");
    ChannelStats {
        user_id,
        connected: true,
        connected_at: entry.connected_at,
        uptime_seconds: (Utc::now() - entry.connected_at).num_seconds(),
        last_heartbeat_at: mark.wall,
        seconds_since_heartbeat: mark.at.elapsed().as_secs() as i64,
    }
}

#[async_trait::async_trait]
impl AlertSink for AlertHub {
    async fn push_anomaly(&self, alert: AnomalyAlert) {
        ANOMALIES_DETECTED.inc();

        let outbound = {
            let channels = self.channels.lock().expect("hub lock poisoned");
            channels.get(&alert.user_id).map(|e| e.outbound.clone())
        };

        match outbound {
            None => {
                ALERTS_DROPPED.inc();
                debug!(user = %alert.user_id, "no alert channel, anomaly dropped");
            }
            Some(tx) => {
                let message = WsMessage::AnomalyDetected {
                    user_id: alert.user_id,
                    stream_id: alert.stream_id,
                    result: AlertResult {
                        person_id: alert.verdict.person_id,
                        frame_number: alert.verdict.frame_number,
                        score: alert.verdict.score,
                        classification: alert.verdict.classification().to_string(),
                        confidence: alert.verdict.confidence,
                        bbox: alert.verdict.bbox,
                    },
                    annotated_frame: BASE64.encode(alert.annotated_jpeg.as_slice()),
                    frame_format: "jpeg".to_string(),
                };
                // blocks the producing processor when the mailbox is full
                if tx.send(Outbound::Message(message)).await.is_ok() {
                    ALERTS_DELIVERED.inc();
                }
            }
        }

        // best-effort external forward, strictly after the primary push
        if let Some(external) = &self.external {
            let external = external.clone();
            let shop_id = alert.shop_id;
            let summary = format!("[{}] {}", alert.location, alert.verdict.reason());
            tokio::spawn(async move {
                external.notify_shop(shop_id, &summary).await;
            });
        }
    }
}

async fn writer_loop<S>(mut sink: S, mut rx: mpsc::Receiver<Outbound>)
where
    S: Sink<Message> + Send + Unpin + 'static,
    S::Error: std::fmt::Display,
{
    while let Some(command) = rx.recv().await {
        match command {
            Outbound::Message(message) => {
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "outbound message serialization failed");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    debug!(error = %e, "alert channel write failed");
                    break;
                }
            }
            Outbound::Close { code, reason } => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })))
                    .await;
                break;
            }
        }
    }
}

async fn heartbeat_loop(
    hub: Arc<AlertHub>,
    user_id: Uuid,
    channel_id: Uuid,
    outbound: mpsc::Sender<Outbound>,
    last_heartbeat: Arc<StdMutex<HeartbeatMark>>,
) {
    let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
    interval.tick().await; // immediate first tick
    loop {
        interval.tick().await;

        let silent_for = {
            let mark = last_heartbeat.lock().expect("heartbeat lock poisoned");
            mark.at.elapsed()
        };
        if silent_for >= HEARTBEAT_TIMEOUT {
            hub.close_channel(user_id, channel_id, CLOSE_HEARTBEAT_TIMEOUT, "heartbeat_timeout");
            return;
        }

        let ping = WsMessage::Ping {
            timestamp: Utc::now().to_rfc3339(),
        };
        if outbound.send(Outbound::Message(ping)).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;
    use futures::StreamExt;
    use vigil_core::detect::PersonVerdict;

    fn test_sink() -> (
        futures::channel::mpsc::UnboundedSender<Message>,
        futures::channel::mpsc::UnboundedReceiver<Message>,
    ) {
        futures::channel::mpsc::unbounded()
    }

    fn alert_for(user_id: Uuid, person_id: u32) -> AnomalyAlert {
        AnomalyAlert {
            user_id,
            shop_id: Uuid::new_v4(),
            stream_id: Uuid::new_v4(),
            location: "entrance-cam".into(),
            verdict: PersonVerdict {
                person_id,
                frame_number: 24,
                bbox: BBox::new(1.0, 2.0, 3.0, 4.0),
                score: -3.2,
                is_abnormal: true,
                confidence: ConfidenceBucket::High,
            },
            annotated_jpeg: Arc::new(vec![0xFF, 0xD8, 0x42]),
        }
    }

    async fn next_text(
        rx: &mut futures::channel::mpsc::UnboundedReceiver<Message>,
    ) -> WsMessage {
        match rx.next().await.expect("message") {
            Message::Text(text) => serde_json::from_str(text.as_str()).expect("valid json"),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_alerts_delivered_in_order() {
        let hub = Arc::new(AlertHub::new(None));
        let user = Uuid::new_v4();
        let (tx, mut rx) = test_sink();
        hub.attach(user, tx);

        hub.push_anomaly(alert_for(user, 1)).await;
        hub.push_anomaly(alert_for(user, 2)).await;

        for expected in [1u32, 2] {
            match next_text(&mut rx).await {
                WsMessage::AnomalyDetected {
                    user_id,
                    result,
                    annotated_frame,
                    frame_format,
                    ..
                } => {
                    assert_eq!(user_id, user);
                    assert_eq!(result.person_id, expected);
                    assert_eq!(result.classification, "Abnormal");
                    assert_eq!(frame_format, "jpeg");
                    assert!(!annotated_frame.is_empty());
                    assert_eq!(
                        BASE64.decode(annotated_frame).unwrap(),
                        vec![0xFF, 0xD8, 0x42]
                    );
                }
                other => panic!("expected anomaly, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_alert_without_channel_is_dropped() {
        let hub = Arc::new(AlertHub::new(None));
        // no attach for this user; push must not hang or panic
        hub.push_anomaly(alert_for(Uuid::new_v4(), 1)).await;
        assert!(hub.stats_all().is_empty());
    }

    #[tokio::test]
    async fn test_second_attach_supersedes_first() {
        let hub = Arc::new(AlertHub::new(None));
        let user = Uuid::new_v4();

        let (tx1, mut rx1) = test_sink();
        let first = hub.attach(user, tx1);

        let (tx2, _rx2) = test_sink();
        let second = hub.attach(user, tx2);
        assert_ne!(first, second);

        // first channel receives close 4000
        loop {
            match rx1.next().await.expect("frame") {
                Message::Close(Some(frame)) => {
                    assert_eq!(frame.code, CLOSE_SUPERSEDED);
                    assert_eq!(frame.reason.as_str(), "superseded");
                    break;
                }
                _ => continue,
            }
        }

        // exactly one connection, the later one
        let stats = hub.stats_all();
        assert_eq!(stats.len(), 1);
        assert!(hub.stats(user).is_some());

        // detach with the stale channel id is a no-op
        hub.detach(user, first);
        assert!(hub.is_connected(user));
        hub.detach(user, second);
        assert!(!hub.is_connected(user));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_timeout_closes_channel() {
        let hub = Arc::new(AlertHub::new(None));
        let user = Uuid::new_v4();
        let (tx, mut rx) = test_sink();
        hub.attach(user, tx);

        // silent client: pings go out, then the 60 s cutoff closes the
        // channel with 4001
        let mut saw_ping = false;
        loop {
            match rx.next().await.expect("frame") {
                Message::Text(text) => {
                    let msg: WsMessage = serde_json::from_str(text.as_str()).unwrap();
                    assert!(matches!(msg, WsMessage::Ping { .. }));
                    saw_ping = true;
                }
                Message::Close(Some(frame)) => {
                    assert_eq!(frame.code, CLOSE_HEARTBEAT_TIMEOUT);
                    assert_eq!(frame.reason.as_str(), "heartbeat_timeout");
                    break;
                }
                other => panic!("unexpected frame {other:?}"),
            }
        }
        assert!(saw_ping);
        assert!(!hub.is_connected(user));
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_keeps_channel_alive() {
        let hub = Arc::new(AlertHub::new(None));
        let user = Uuid::new_v4();
        let (tx, mut rx) = test_sink();
        hub.attach(user, tx);

        // answer the first two pings, then confirm the channel survived
        for _ in 0..2 {
            match rx.next().await.expect("frame") {
                Message::Text(_) => hub.touch(user),
                other => panic!("unexpected frame {other:?}"),
            }
        }
        assert!(hub.is_connected(user));
        let stats = hub.stats(user).unwrap();
        assert!(stats.seconds_since_heartbeat <= HEARTBEAT_INTERVAL.as_secs() as i64);
    }

    #[tokio::test]
    async fn test_close_all_reports_server_shutdown() {
        let hub = Arc::new(AlertHub::new(None));
        let user = Uuid::new_v4();
        let (tx, mut rx) = test_sink();
        hub.attach(user, tx);

        hub.close_all("server_shutdown");
        loop {
            match rx.next().await.expect("frame") {
                Message::Close(Some(frame)) => {
                    assert_eq!(frame.code, CLOSE_NORMAL);
                    assert_eq!(frame.reason.as_str(), "server_shutdown");
                    break;
                }
                _ => continue,
            }
        }
        assert!(hub.stats_all().is_empty());
    }
}
