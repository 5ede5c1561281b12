//! Server Configuration
//!
//! All settings come from the environment. `from_env` reads the process
//! environment; `from_lookup` takes any key→value source so tests do not
//! touch global state.

use std::path::PathBuf;

use vigil_core::processor::ProcessorConfig;
use vigil_core::tracker::TrackerConfig;
use vigil_core::{ModelConfig, SEQUENCE_LENGTH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub environment: Environment,
    /// CORS allow-list, only honored in production
    pub allowed_origins: Vec<String>,
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub evidence_root: PathBuf,
    pub jwt_secret: String,
    pub stun_servers: Vec<String>,
    pub models: ModelConfig,
    pub person_confidence: f32,
    pub anomaly_threshold: f32,
    pub high_cut: f32,
    pub medium_cut: f32,
    pub sequence_length: usize,
    pub inference_workers: usize,
    pub inference_queue: usize,
    pub annotation_font_path: Option<PathBuf>,
    pub telegram_bot_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            environment: Environment::Development,
            allowed_origins: Vec::new(),
            host: "0.0.0.0".to_string(),
            port: 8000,
            database_url: "sqlite://vigil.db?mode=rwc".to_string(),
            evidence_root: PathBuf::from("evidence"),
            jwt_secret: "dev-secret-change-me".to_string(),
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            models: ModelConfig::default(),
            person_confidence: 0.45,
            anomaly_threshold: -2.0,
            high_cut: 3.0,
            medium_cut: 1.5,
            sequence_length: SEQUENCE_LENGTH,
            inference_workers: 2,
            inference_queue: 64,
            annotation_font_path: None,
            telegram_bot_token: None,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        if let Some(env) = lookup("ENVIRONMENT") {
            cfg.environment = match env.as_str() {
                "production" => Environment::Production,
                _ => Environment::Development,
            };
        }
        if let Some(origins) = lookup("ALLOWED_ORIGINS") {
            cfg.allowed_origins = split_csv(&origins);
        }
        if let Some(host) = lookup("SERVER_HOST") {
            cfg.host = host;
        }
        if let Some(port) = lookup("SERVER_PORT").and_then(|v| v.parse().ok()) {
            cfg.port = port;
        }
        if let Some(url) = lookup("DATABASE_URL") {
            cfg.database_url = url;
        }
        if let Some(root) = lookup("EVIDENCE_ROOT") {
            cfg.evidence_root = PathBuf::from(root);
        }
        if let Some(secret) = lookup("JWT_SECRET") {
            cfg.jwt_secret = secret;
        }
        if let Some(servers) = lookup("STUN_SERVERS") {
            cfg.stun_servers = split_csv(&servers);
        }

        if let Some(path) = lookup("YOLO_MODEL_PATH") {
            cfg.models.detector_path = PathBuf::from(path);
        }
        if let Some(path) = lookup("POSE_MODEL_PATH") {
            cfg.models.pose_path = PathBuf::from(path);
        }
        if let Some(path) = lookup("ANOMALY_MODEL_PATH") {
            cfg.models.classifier_path = PathBuf::from(path);
        }
        if let Some(device) = lookup("DEVICE") {
            cfg.models.device = device;
        }

        if let Some(v) = lookup("PERSON_DETECTION_CONFIDENCE").and_then(|v| v.parse().ok()) {
            cfg.person_confidence = v;
        }
        if let Some(v) = lookup("ANOMALY_THRESHOLD").and_then(|v| v.parse().ok()) {
            cfg.anomaly_threshold = v;
        }
        if let Some(v) = lookup("ANOMALY_HIGH_CUT").and_then(|v| v.parse().ok()) {
            cfg.high_cut = v;
        }
        if let Some(v) = lookup("ANOMALY_MEDIUM_CUT").and_then(|v| v.parse().ok()) {
            cfg.medium_cut = v;
        }
        if let Some(v) = lookup("SEQUENCE_LENGTH").and_then(|v| v.parse().ok()) {
            cfg.sequence_length = v;
            cfg.models.sequence_length = v;
        }
        if let Some(v) = lookup("INFERENCE_WORKERS").and_then(|v| v.parse().ok()) {
            cfg.inference_workers = v;
        }
        if let Some(v) = lookup("INFERENCE_QUEUE").and_then(|v| v.parse().ok()) {
            cfg.inference_queue = v;
        }
        if let Some(path) = lookup("ANNOTATION_FONT_PATH") {
            cfg.annotation_font_path = Some(PathBuf::from(path));
        }
        if let Some(token) = lookup("TELEGRAM_BOT_TOKEN") {
            if !token.is_empty() {
                cfg.telegram_bot_token = Some(token);
            }
        }

        cfg
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn processor_config(&self) -> ProcessorConfig {
        ProcessorConfig {
            person_confidence: self.person_confidence,
            anomaly_threshold: self.anomaly_threshold,
            high_cut: self.high_cut,
            medium_cut: self.medium_cut,
            sequence_length: self.sequence_length,
            tracker: TrackerConfig {
                min_confidence: self.person_confidence,
                ..TrackerConfig::default()
            },
        }
    }
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from<'a>(map: &'a HashMap<&'a str, &'a str>) -> impl Fn(&str) -> Option<String> + 'a {
        move |key| map.get(key).map(|v| v.to_string())
    }

    #[test]
    fn test_defaults() {
        let cfg = ServerConfig::from_lookup(|_| None);
        assert_eq!(cfg.environment, Environment::Development);
        assert_eq!(cfg.port, 8000);
        assert!((cfg.person_confidence - 0.45).abs() < 1e-6);
        assert_eq!(cfg.sequence_length, 24);
        assert!(cfg.telegram_bot_token.is_none());
    }

    #[test]
    fn test_env_overrides() {
        let mut map = HashMap::new();
        map.insert("ENVIRONMENT", "production");
        map.insert("ALLOWED_ORIGINS", "https://a.example, https://b.example");
        map.insert("SERVER_PORT", "9001");
        map.insert("PERSON_DETECTION_CONFIDENCE", "0.6");
        map.insert("ANOMALY_THRESHOLD", "-1.25");
        map.insert("SEQUENCE_LENGTH", "32");
        map.insert("YOLO_MODEL_PATH", "/models/detector.onnx");

        let cfg = ServerConfig::from_lookup(lookup_from(&map));
        assert_eq!(cfg.environment, Environment::Production);
        assert_eq!(
            cfg.allowed_origins,
            vec!["https://a.example".to_string(), "https://b.example".to_string()]
        );
        assert_eq!(cfg.port, 9001);
        assert!((cfg.person_confidence - 0.6).abs() < 1e-6);
        assert!((cfg.anomaly_threshold + 1.25).abs() < 1e-6);
        assert_eq!(cfg.sequence_length, 32);
        assert_eq!(cfg.models.sequence_length, 32);
        assert_eq!(
            cfg.models.detector_path,
            PathBuf::from("/models/detector.onnx")
        );
    }

    #[test]
    fn test_invalid_numbers_keep_defaults() {
        let mut map = HashMap::new();
        map.insert("SERVER_PORT", "not-a-port");
        map.insert("ANOMALY_THRESHOLD", "abc");
        let cfg = ServerConfig::from_lookup(lookup_from(&map));
        assert_eq!(cfg.port, 8000);
        assert!((cfg.anomaly_threshold + 2.0).abs() < 1e-6);
    }
}
