//! Persistence Layer
//!
//! SQLite through sqlx. The schema is created idempotently at startup; ids
//! are stored as hyphenated UUID text, JSON payloads as text, timestamps as
//! RFC3339. The anomaly event and its training sample are inserted in one
//! transaction so a sample can never exist without its event.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use uuid::Uuid;

pub async fn connect(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    // every pooled connection to an in-memory database is a separate database
    let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
}

pub async fn init_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(
        r#"
        CREATE TABLE IF NOT EXISTS shops (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            external_alert_target TEXT
        );

        CREATE TABLE IF NOT EXISTS shop_managers (
            shop_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            PRIMARY KEY (shop_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS anomaly_events (
            id TEXT PRIMARY KEY,
            shop_id TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            location TEXT NOT NULL,
            severity TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'PENDING',
            description TEXT NOT NULL,
            image_ref TEXT NOT NULL,
            anomaly_type TEXT NOT NULL,
            confidence_score REAL NOT NULL,
            extra TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_events_shop_time ON anomaly_events (shop_id, timestamp);
        CREATE INDEX IF NOT EXISTS idx_events_shop_status ON anomaly_events (shop_id, status);
        CREATE INDEX IF NOT EXISTS idx_events_severity_status ON anomaly_events (severity, status);

        CREATE TABLE IF NOT EXISTS training_samples (
            id TEXT PRIMARY KEY,
            anomaly_id TEXT NOT NULL REFERENCES anomaly_events (id),
            pose_dict TEXT NOT NULL,
            stream_id TEXT NOT NULL,
            frame_number INTEGER NOT NULL,
            predicted_score REAL NOT NULL,
            predicted_confidence_bucket TEXT NOT NULL,
            user_feedback TEXT,
            user_label TEXT,
            user_notes TEXT,
            labeled_by TEXT,
            labeled_at TEXT,
            used_for_training INTEGER NOT NULL DEFAULT 0,
            training_batch_id TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_samples_anomaly ON training_samples (anomaly_id);
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// An anomaly event row ready for insertion
#[derive(Debug, Clone)]
pub struct NewAnomalyEvent {
    pub id: Uuid,
    pub shop_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub location: String,
    pub severity: String,
    pub description: String,
    pub image_ref: String,
    pub anomaly_type: String,
    pub confidence_score: f32,
    pub extra: serde_json::Value,
}

/// The training sample persisted 1:1 with its event
#[derive(Debug, Clone)]
pub struct NewTrainingSample {
    pub id: Uuid,
    pub pose_dict: serde_json::Value,
    pub stream_id: Uuid,
    pub frame_number: u64,
    pub predicted_score: f32,
    pub predicted_confidence_bucket: String,
}

/// Insert the event and its training sample atomically
pub async fn insert_event_with_sample(
    pool: &SqlitePool,
    event: &NewAnomalyEvent,
    sample: &NewTrainingSample,
) -> Result<(), sqlx::Error> {
    let now = Utc::now().to_rfc3339();
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO anomaly_events
            (id, shop_id, timestamp, location, severity, status, description,
             image_ref, anomaly_type, confidence_score, extra, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, 'PENDING', ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(event.id.to_string())
    .bind(event.shop_id.to_string())
    .bind(event.timestamp.to_rfc3339())
    .bind(&event.location)
    .bind(&event.severity)
    .bind(&event.description)
    .bind(&event.image_ref)
    .bind(&event.anomaly_type)
    .bind(event.confidence_score)
    .bind(event.extra.to_string())
    .bind(&now)
    .bind(&now)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO training_samples
            (id, anomaly_id, pose_dict, stream_id, frame_number,
             predicted_score, predicted_confidence_bucket, used_for_training)
        VALUES (?, ?, ?, ?, ?, ?, ?, 0)
        "#,
    )
    .bind(sample.id.to_string())
    .bind(event.id.to_string())
    .bind(sample.pose_dict.to_string())
    .bind(sample.stream_id.to_string())
    .bind(sample.frame_number as i64)
    .bind(sample.predicted_score)
    .bind(&sample.predicted_confidence_bucket)
    .execute(&mut *tx)
    .await?;

    tx.commit().await
}

pub async fn insert_shop(
    pool: &SqlitePool,
    shop_id: Uuid,
    owner_id: Uuid,
    external_alert_target: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO shops (id, owner_id, external_alert_target) VALUES (?, ?, ?)")
        .bind(shop_id.to_string())
        .bind(owner_id.to_string())
        .bind(external_alert_target)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn add_manager(
    pool: &SqlitePool,
    shop_id: Uuid,
    user_id: Uuid,
) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO shop_managers (shop_id, user_id) VALUES (?, ?)")
        .bind(shop_id.to_string())
        .bind(user_id.to_string())
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn shop_owner(pool: &SqlitePool, shop_id: Uuid) -> Result<Option<Uuid>, sqlx::Error> {
    let row: Option<(String,)> = sqlx::query_as("SELECT owner_id FROM shops WHERE id = ?")
        .bind(shop_id.to_string())
        .fetch_optional(pool)
        .await?;
    Ok(row.and_then(|(owner,)| Uuid::parse_str(&owner).ok()))
}

pub async fn is_manager(
    pool: &SqlitePool,
    shop_id: Uuid,
    user_id: Uuid,
) -> Result<bool, sqlx::Error> {
    let row: Option<(i64,)> =
        sqlx::query_as("SELECT 1 FROM shop_managers WHERE shop_id = ? AND user_id = ?")
            .bind(shop_id.to_string())
            .bind(user_id.to_string())
            .fetch_optional(pool)
            .await?;
    Ok(row.is_some())
}

pub async fn external_alert_target(
    pool: &SqlitePool,
    shop_id: Uuid,
) -> Result<Option<String>, sqlx::Error> {
    let row: Option<(Option<String>,)> =
        sqlx::query_as("SELECT external_alert_target FROM shops WHERE id = ?")
            .bind(shop_id.to_string())
            .fetch_optional(pool)
            .await?;
    Ok(row.and_then(|(target,)| target))
}

#[cfg(test)]
pub async fn memory_pool() -> SqlitePool {
    let pool = connect("sqlite::memory:").await.expect("memory pool");
    init_schema(&pool).await.expect("schema");
    pool
}
