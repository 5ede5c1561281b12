//! Authentication & Shop Access
//!
//! Token handling is an interface contract: a bearer JWT carries a verified
//! `user_id` and role, everything upstream of that (issuing, refresh, user
//! CRUD) lives elsewhere. Shop access is the one rule the streaming plane
//! enforces: owners own their shops, managers must be in the shop's manager
//! set.

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db;
use crate::error::ServiceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Owner,
    Manager,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub role: Role,
    pub exp: i64,
}

/// The verified caller identity consumed by every endpoint
#[derive(Debug, Clone, Copy)]
pub struct AuthContext {
    pub user_id: Uuid,
    pub role: Role,
}

/// Pull the bearer token out of the Authorization header
pub fn bearer_from_headers(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

pub fn verify_token(secret: &str, token: &str) -> Result<AuthContext, ServiceError> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )
    .map_err(|_| ServiceError::Unauthenticated)?;

    Ok(AuthContext {
        user_id: data.claims.sub,
        role: data.claims.role,
    })
}

/// Authenticate an HTTP request from its headers
pub fn authenticate(secret: &str, headers: &HeaderMap) -> Result<AuthContext, ServiceError> {
    let token = bearer_from_headers(headers).ok_or(ServiceError::Unauthenticated)?;
    verify_token(secret, token)
}

/// OWNER has access iff they own the shop; MANAGER iff they are in the
/// shop's manager set.
pub async fn ensure_shop_access(
    pool: &SqlitePool,
    auth: &AuthContext,
    shop_id: Uuid,
) -> Result<(), ServiceError> {
    match auth.role {
        Role::Owner => {
            if db::shop_owner(pool, shop_id).await? == Some(auth.user_id) {
                Ok(())
            } else {
                Err(ServiceError::Forbidden)
            }
        }
        Role::Manager => {
            if db::is_manager(pool, shop_id, auth.user_id).await? {
                Ok(())
            } else {
                Err(ServiceError::Forbidden)
            }
        }
    }
}

/// Issue a short-lived HS256 token. Used by tests and local tooling.
pub fn issue_token(secret: &str, user_id: Uuid, role: Role) -> String {
    let claims = Claims {
        sub: user_id,
        role,
        exp: (Utc::now() + Duration::hours(12)).timestamp(),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .expect("token encoding cannot fail with HS256")
}
