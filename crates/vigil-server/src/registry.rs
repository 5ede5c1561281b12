//! Stream Registry
//!
//! In-memory index of live peer connections, keyed by stream id with a
//! per-user secondary index. Both maps live under one mutex and are always
//! updated together. Removal hands the handles back to the caller so peer
//! connections are closed outside the lock.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;
use vigil_core::StreamProcessor;
use webrtc::peer_connection::RTCPeerConnection;

use crate::metrics::ACTIVE_STREAMS;

/// Everything needed to run and tear down one stream
#[derive(Clone)]
pub struct StreamHandle {
    pub stream_id: Uuid,
    pub user_id: Uuid,
    pub shop_id: Uuid,
    pub location: String,
    pub pc: Arc<RTCPeerConnection>,
    pub processor: Arc<StreamProcessor>,
    pub created_at: DateTime<Utc>,
}

impl StreamHandle {
    /// Close the peer connection and drop the processor state
    pub async fn teardown(&self) {
        self.processor.stop().await;
        if let Err(e) = self.pc.close().await {
            tracing::debug!(stream = %self.stream_id, error = %e, "peer connection close");
        }
    }
}

/// What the stream listing endpoint returns
#[derive(Debug, Clone, Serialize)]
pub struct StreamSummary {
    pub stream_id: Uuid,
    pub shop_id: Uuid,
    pub location: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Default)]
struct Indexes {
    by_stream: HashMap<Uuid, StreamHandle>,
    by_user: HashMap<Uuid, HashSet<Uuid>>,
}

#[derive(Default)]
pub struct StreamRegistry {
    inner: Mutex<Indexes>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handle. A stream id can only be live once.
    pub fn add(&self, handle: StreamHandle) -> bool {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        if inner.by_stream.contains_key(&handle.stream_id) {
            return false;
        }
        inner
            .by_user
            .entry(handle.user_id)
            .or_default()
            .insert(handle.stream_id);
        inner.by_stream.insert(handle.stream_id, handle);
        ACTIVE_STREAMS.set(inner.by_stream.len() as f64);
        true
    }

    pub fn remove(&self, stream_id: Uuid) -> Option<StreamHandle> {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let handle = inner.by_stream.remove(&stream_id)?;
        if let Some(streams) = inner.by_user.get_mut(&handle.user_id) {
            streams.remove(&stream_id);
            if streams.is_empty() {
                inner.by_user.remove(&handle.user_id);
            }
        }
        ACTIVE_STREAMS.set(inner.by_stream.len() as f64);
        Some(handle)
    }

    pub fn remove_all(&self, user_id: Uuid) -> Vec<StreamHandle> {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let Some(stream_ids) = inner.by_user.remove(&user_id) else {
            return Vec::new();
        };
        let handles = stream_ids
            .into_iter()
            .filter_map(|id| inner.by_stream.remove(&id))
            .collect();
        ACTIVE_STREAMS.set(inner.by_stream.len() as f64);
        handles
    }

    /// Drain every handle, for shutdown
    pub fn drain(&self) -> Vec<StreamHandle> {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        inner.by_user.clear();
        let handles = inner.by_stream.drain().map(|(_, h)| h).collect();
        ACTIVE_STREAMS.set(0.0);
        handles
    }

    pub fn get(&self, stream_id: Uuid) -> Option<StreamHandle> {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .by_stream
            .get(&stream_id)
            .cloned()
    }

    pub fn list(&self, user_id: Uuid) -> Vec<StreamSummary> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        let mut summaries: Vec<StreamSummary> = inner
            .by_user
            .get(&user_id)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.by_stream.get(id))
            .map(|h| StreamSummary {
                stream_id: h.stream_id,
                shop_id: h.shop_id,
                location: h.location.clone(),
                created_at: h.created_at,
            })
            .collect();
        summaries.sort_by_key(|s| s.created_at);
        summaries
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .by_stream
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
