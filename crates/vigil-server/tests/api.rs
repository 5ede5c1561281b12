//! HTTP surface tests: signaling auth contract, stream management and the
//! observability endpoints, driven through the router with real SDP offers
//! from an in-process WebRTC client.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use vigil_core::processor::EvidenceRecorder;
use vigil_core::{BBox, Detection, Inference, InferenceError, PoseFrame, PoseSequence};
use vigil_server::auth::{issue_token, Role};
use vigil_server::config::ServerConfig;
use vigil_server::db;
use vigil_server::hub::AlertHub;
use vigil_server::recorder::Recorder;
use vigil_server::registry::StreamRegistry;
use vigil_server::routes::{router, AppState};
use vigil_server::storage::EvidenceStore;

use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

const JWT_SECRET: &str = "integration-secret";

struct NoopInference;

#[async_trait::async_trait]
impl Inference for NoopInference {
    async fn detect(
        &self,
        _frame: Arc<image::RgbImage>,
        _min_confidence: f32,
    ) -> Result<Vec<Detection>, InferenceError> {
        Ok(Vec::new())
    }
    async fn pose(
        &self,
        _frame: Arc<image::RgbImage>,
        _bbox: BBox,
    ) -> Result<PoseFrame, InferenceError> {
        Ok([[0.0; 3]; 17])
    }
    async fn classify(&self, _sequence: PoseSequence) -> Result<f32, InferenceError> {
        Ok(0.0)
    }
}

struct Fixture {
    state: AppState,
    _evidence_dir: tempfile::TempDir,
}

async fn fixture() -> Fixture {
    let pool = db::connect("sqlite::memory:").await.expect("pool");
    db::init_schema(&pool).await.expect("schema");

    let evidence_dir = tempfile::tempdir().expect("tempdir");
    let recorder: Arc<dyn EvidenceRecorder> = Arc::new(Recorder::new(
        pool.clone(),
        EvidenceStore::new(evidence_dir.path()),
    ));

    let mut config = ServerConfig::from_lookup(|_| None);
    config.jwt_secret = JWT_SECRET.to_string();

    let state = AppState {
        config: Arc::new(config),
        pool,
        hub: Arc::new(AlertHub::new(None)),
        registry: Arc::new(StreamRegistry::new()),
        inference: Arc::new(NoopInference),
        recorder,
        font: None,
    };
    Fixture {
        state,
        _evidence_dir: evidence_dir,
    }
}

/// A browser-side SDP offer carrying one outbound video track
async fn client_video_offer() -> String {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs().expect("codecs");
    let api = APIBuilder::new().with_media_engine(media_engine).build();
    let pc = api
        .new_peer_connection(RTCConfiguration::default())
        .await
        .expect("client pc");
    pc.add_transceiver_from_kind(RTPCodecType::Video, None)
        .await
        .expect("transceiver");

    let offer = pc.create_offer(None).await.expect("offer");
    let mut gather = pc.gathering_complete_promise().await;
    pc.set_local_description(offer).await.expect("local");
    let _ = gather.recv().await;
    let sdp = pc.local_description().await.expect("description").sdp;
    let _ = pc.close().await;
    sdp
}

fn offer_body(sdp: &str, user_id: Uuid, shop_id: Uuid, kind: &str) -> String {
    json!({
        "sdp": sdp,
        "type": kind,
        "user_id": user_id,
        "shop_id": shop_id,
        "stream_metadata": { "location": "entrance-cam" },
    })
    .to_string()
}

async fn send_json(
    state: &AppState,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<String>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = router(state.clone()).oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

#[tokio::test]
async fn test_offer_without_token_is_unauthorized() {
    let fx = fixture().await;
    let user_id = Uuid::new_v4();
    let shop_id = Uuid::new_v4();

    let (status, _) = send_json(
        &fx.state,
        "POST",
        "/offer",
        None,
        Some(offer_body("v=0", user_id, shop_id, "offer")),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(fx.state.registry.is_empty());
}

#[tokio::test]
async fn test_offer_manager_outside_shop_is_forbidden() {
    let fx = fixture().await;
    let owner = Uuid::new_v4();
    let manager = Uuid::new_v4();
    let shop_id = Uuid::new_v4();
    db::insert_shop(&fx.state.pool, shop_id, owner, None)
        .await
        .unwrap();
    // manager is NOT added to the shop's manager set

    let token = issue_token(JWT_SECRET, manager, Role::Manager);
    let (status, _) = send_json(
        &fx.state,
        "POST",
        "/offer",
        Some(&token),
        Some(offer_body("v=0", manager, shop_id, "offer")),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // no stream appeared for the caller
    let (status, body) = send_json(
        &fx.state,
        "GET",
        &format!("/users/{manager}/streams"),
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn test_offer_wrong_type_is_bad_request() {
    let fx = fixture().await;
    let owner = Uuid::new_v4();
    let shop_id = Uuid::new_v4();
    db::insert_shop(&fx.state.pool, shop_id, owner, None)
        .await
        .unwrap();

    let token = issue_token(JWT_SECRET, owner, Role::Owner);
    let (status, _) = send_json(
        &fx.state,
        "POST",
        "/offer",
        Some(&token),
        Some(offer_body("v=0", owner, shop_id, "answer")),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(fx.state.registry.is_empty());
}

#[tokio::test]
async fn test_offer_for_another_user_is_forbidden() {
    let fx = fixture().await;
    let owner = Uuid::new_v4();
    let other = Uuid::new_v4();
    let shop_id = Uuid::new_v4();
    db::insert_shop(&fx.state.pool, shop_id, owner, None)
        .await
        .unwrap();

    let token = issue_token(JWT_SECRET, owner, Role::Owner);
    let (status, _) = send_json(
        &fx.state,
        "POST",
        "/offer",
        Some(&token),
        Some(offer_body("v=0", other, shop_id, "offer")),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_offer_answer_list_teardown_cycle() {
    let fx = fixture().await;
    let owner = Uuid::new_v4();
    let shop_id = Uuid::new_v4();
    db::insert_shop(&fx.state.pool, shop_id, owner, None)
        .await
        .unwrap();
    let token = issue_token(JWT_SECRET, owner, Role::Owner);

    let sdp = client_video_offer().await;
    let (status, body) = send_json(
        &fx.state,
        "POST",
        "/offer",
        Some(&token),
        Some(offer_body(&sdp, owner, shop_id, "offer")),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "offer failed: {body}");
    assert_eq!(body["type"], "answer");
    assert_eq!(body["user_id"], json!(owner));
    assert!(!body["sdp"].as_str().unwrap().is_empty());
    let stream_id: Uuid = serde_json::from_value(body["stream_id"].clone()).unwrap();

    // listing shows exactly the new stream
    let (status, body) = send_json(
        &fx.state,
        "GET",
        &format!("/users/{owner}/streams"),
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let streams = body.as_array().unwrap();
    assert_eq!(streams.len(), 1);
    assert_eq!(streams[0]["stream_id"], json!(stream_id));
    assert_eq!(streams[0]["location"], "entrance-cam");

    // a second offer yields a distinct stream id
    let sdp2 = client_video_offer().await;
    let (status, body) = send_json(
        &fx.state,
        "POST",
        "/offer",
        Some(&token),
        Some(offer_body(&sdp2, owner, shop_id, "offer")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let stream_id_2: Uuid = serde_json::from_value(body["stream_id"].clone()).unwrap();
    assert_ne!(stream_id, stream_id_2);

    // targeted teardown
    let (status, _) = send_json(
        &fx.state,
        "DELETE",
        &format!("/users/{owner}/streams/{stream_id}"),
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    // user-wide teardown empties the list
    let (status, _) = send_json(
        &fx.state,
        "DELETE",
        &format!("/users/{owner}"),
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, body) = send_json(
        &fx.state,
        "GET",
        &format!("/users/{owner}/streams"),
        Some(&token),
        None,
    )
    .await;
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn test_stream_listing_requires_matching_user() {
    let fx = fixture().await;
    let owner = Uuid::new_v4();
    let other = Uuid::new_v4();
    let token = issue_token(JWT_SECRET, owner, Role::Owner);

    let (status, _) = send_json(
        &fx.state,
        "GET",
        &format!("/users/{other}/streams"),
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send_json(
        &fx.state,
        "GET",
        &format!("/users/{owner}/streams"),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_delete_unknown_stream_is_not_found() {
    let fx = fixture().await;
    let owner = Uuid::new_v4();
    let token = issue_token(JWT_SECRET, owner, Role::Owner);

    let (status, _) = send_json(
        &fx.state,
        "DELETE",
        &format!("/users/{owner}/streams/{}", Uuid::new_v4()),
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_ws_connection_stats_endpoints() {
    let fx = fixture().await;

    let (status, body) = send_json(&fx.state, "GET", "/ws/connections", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));

    let (status, _) = send_json(
        &fx.state,
        "GET",
        &format!("/ws/connections/{}", Uuid::new_v4()),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_health_reports_ok() {
    let fx = fixture().await;
    let (status, body) = send_json(&fx.state, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "vigil");
}
