//! Signaling Endpoint
//!
//! `POST /offer` binds an authenticated user and shop to a new stream: it
//! builds the peer connection, attaches the stream processor to the inbound
//! video track, answers the SDP offer and registers the handle. The whole
//! exchange runs under one deadline; expiry or any partial failure tears the
//! connection down and registers nothing.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use chrono::Utc;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex as TokioMutex};
use tracing::{debug, info, warn};
use uuid::Uuid;
use vigil_core::processor::AlertSink;
use vigil_core::StreamProcessor;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_remote::TrackRemote;

use crate::auth::{self, AuthContext};
use crate::decode::H264FrameDecoder;
use crate::error::ServiceError;
use crate::metrics::{FRAMES_DROPPED, FRAMES_PROCESSED, OFFER_LATENCY};
use crate::registry::StreamHandle;
use crate::routes::AppState;

/// Overall deadline on offer handling
pub const OFFER_DEADLINE: Duration = Duration::from_secs(10);

/// How long a disconnected peer may linger before teardown
const DISCONNECT_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
pub struct OfferRequest {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub user_id: Uuid,
    pub shop_id: Uuid,
    #[serde(default)]
    pub stream_metadata: StreamMetadata,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct StreamMetadata {
    pub location: Option<String>,
    pub camera: Option<String>,
}

impl StreamMetadata {
    fn location_label(&self) -> String {
        self.location
            .clone()
            .or_else(|| self.camera.clone())
            .unwrap_or_else(|| "camera".to_string())
    }
}

#[derive(Debug, Serialize)]
pub struct OfferResponse {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub user_id: Uuid,
    pub stream_id: Uuid,
}

pub async fn handle_offer(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<OfferRequest>,
) -> Result<Json<OfferResponse>, ServiceError> {
    let timer = OFFER_LATENCY.start_timer();

    let auth = auth::authenticate(&state.config.jwt_secret, &headers)?;
    if auth.user_id != request.user_id {
        return Err(ServiceError::Forbidden);
    }
    auth::ensure_shop_access(&state.pool, &auth, request.shop_id).await?;
    if request.kind != "offer" {
        return Err(ServiceError::BadRequest(format!(
            "expected type \"offer\", got \"{}\"",
            request.kind
        )));
    }

    let stream_id = Uuid::new_v4();
    let user_id = request.user_id;

    // lets the deadline path reach a half-built connection
    let pc_slot: Arc<TokioMutex<Option<Arc<RTCPeerConnection>>>> = Arc::default();

    let established = tokio::time::timeout(
        OFFER_DEADLINE,
        establish_stream(state.clone(), auth, request, stream_id, pc_slot.clone()),
    )
    .await;

    match established {
        Ok(Ok(answer_sdp)) => {
            timer.observe_duration();
            info!(stream = %stream_id, user = %user_id, "stream established");
            Ok(Json(OfferResponse {
                sdp: answer_sdp,
                kind: "answer".to_string(),
                user_id,
                stream_id,
            }))
        }
        Ok(Err(e)) => {
            release_partial(&state, stream_id, &pc_slot).await;
            Err(e)
        }
        Err(_) => {
            warn!(stream = %stream_id, "offer handling deadline exceeded");
            release_partial(&state, stream_id, &pc_slot).await;
            Err(ServiceError::Timeout("signaling"))
        }
    }
}

async fn release_partial(
    state: &AppState,
    stream_id: Uuid,
    pc_slot: &Arc<TokioMutex<Option<Arc<RTCPeerConnection>>>>,
) {
    if let Some(handle) = state.registry.remove(stream_id) {
        handle.teardown().await;
    } else if let Some(pc) = pc_slot.lock().await.take() {
        let _ = pc.close().await;
    }
}

async fn establish_stream(
    state: AppState,
    auth: AuthContext,
    request: OfferRequest,
    stream_id: Uuid,
    pc_slot: Arc<TokioMutex<Option<Arc<RTCPeerConnection>>>>,
) -> Result<String, ServiceError> {
    let transport = |e: webrtc::Error| ServiceError::Transport(e.to_string());

    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs().map_err(transport)?;
    let mut interceptors = Registry::new();
    interceptors =
        register_default_interceptors(interceptors, &mut media_engine).map_err(transport)?;
    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(interceptors)
        .build();

    let rtc_config = RTCConfiguration {
        ice_servers: vec![RTCIceServer {
            urls: state.config.stun_servers.clone(),
            ..Default::default()
        }],
        ..Default::default()
    };
    let pc = Arc::new(api.new_peer_connection(rtc_config).await.map_err(transport)?);
    *pc_slot.lock().await = Some(pc.clone());

    let location = request.stream_metadata.location_label();
    let processor = Arc::new(StreamProcessor::new(
        stream_id,
        auth.user_id,
        request.shop_id,
        location.clone(),
        state.config.processor_config(),
        state.inference.clone(),
        state.hub.clone() as Arc<dyn AlertSink>,
        state.recorder.clone(),
        state.font.clone(),
    ));

    // Latest-wins frame handoff: the decoder overwrites, the processor takes
    // whatever is newest. A slow pipeline skips frames instead of queueing.
    let (frame_tx, mut frame_rx) = watch::channel::<Option<(u64, RgbImage)>>(None);
    {
        let processor = processor.clone();
        tokio::spawn(async move {
            let mut last_seq: u64 = 0;
            while frame_rx.changed().await.is_ok() {
                let next = frame_rx.borrow_and_update().clone();
                let Some((seq, frame)) = next else { continue };
                if seq > last_seq + 1 {
                    FRAMES_DROPPED.inc_by((seq - last_seq - 1) as f64);
                }
                last_seq = seq;
                FRAMES_PROCESSED.inc();
                processor.process_frame(frame).await;
            }
        });
    }

    let frame_tx = Arc::new(frame_tx);
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let frame_tx = frame_tx.clone();
        Box::pin(async move {
            if track.kind() != RTPCodecType::Video {
                return;
            }
            let mime = track.codec().capability.mime_type.clone();
            if !mime.eq_ignore_ascii_case(MIME_TYPE_H264) {
                warn!(%mime, "unsupported inbound codec, track ignored");
                return;
            }
            tokio::spawn(read_track(track, frame_tx));
        })
    }));

    let registry = state.registry.clone();
    let pc_weak = Arc::downgrade(&pc);
    pc.on_peer_connection_state_change(Box::new(move |pc_state: RTCPeerConnectionState| {
        let registry = registry.clone();
        let pc_weak = pc_weak.clone();
        Box::pin(async move {
            debug!(stream = %stream_id, state = %pc_state, "peer connection state");
            match pc_state {
                RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                    if let Some(handle) = registry.remove(stream_id) {
                        handle.teardown().await;
                    }
                }
                RTCPeerConnectionState::Disconnected => {
                    tokio::time::sleep(DISCONNECT_GRACE).await;
                    let still_disconnected = pc_weak.upgrade().is_some_and(|pc| {
                        pc.connection_state() == RTCPeerConnectionState::Disconnected
                    });
                    if still_disconnected {
                        info!(stream = %stream_id, "disconnect grace expired");
                        if let Some(handle) = registry.remove(stream_id) {
                            handle.teardown().await;
                        }
                    }
                }
                _ => {}
            }
        })
    }));

    let offer = RTCSessionDescription::offer(request.sdp)
        .map_err(|e| ServiceError::BadRequest(format!("invalid sdp: {e}")))?;
    pc.set_remote_description(offer).await.map_err(transport)?;

    let answer = pc.create_answer(None).await.map_err(transport)?;
    let mut gather_complete = pc.gathering_complete_promise().await;
    pc.set_local_description(answer).await.map_err(transport)?;
    let _ = gather_complete.recv().await;

    let local = pc
        .local_description()
        .await
        .ok_or_else(|| ServiceError::Internal("local description missing".to_string()))?;

    let handle = StreamHandle {
        stream_id,
        user_id: auth.user_id,
        shop_id: request.shop_id,
        location,
        pc: pc.clone(),
        processor,
        created_at: Utc::now(),
    };
    if !state.registry.add(handle) {
        return Err(ServiceError::Internal("stream id collision".to_string()));
    }

    Ok(local.sdp)
}

async fn read_track(track: Arc<TrackRemote>, frame_tx: Arc<watch::Sender<Option<(u64, RgbImage)>>>) {
    let mut decoder = match H264FrameDecoder::new() {
        Ok(decoder) => decoder,
        Err(e) => {
            warn!(error = %e, "h264 decoder init failed, track ignored");
            return;
        }
    };

    let mut seq: u64 = 0;
    loop {
        match track.read_rtp().await {
            Ok((packet, _)) => {
                if let Some(frame) = decoder.push_packet(&packet) {
                    seq += 1;
                    frame_tx.send_replace(Some((seq, frame)));
                }
            }
            Err(e) => {
                debug!(error = %e, "inbound track ended");
                return;
            }
        }
    }
}
