//! HTTP status surface
//!
//! Two read-only endpoints for monitoring: `/health` (liveness, uptime)
//! and `/status` (checkpoints plus table counts).

use axum::{extract::State, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use tower_http::trace::TraceLayer;

use crate::db::kv;

#[derive(Clone)]
pub struct ApiState {
    pub pool: SqlitePool,
    pub startup_time: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub module: String,
    pub version: String,
    pub uptime_seconds: u64,
}

/// GET /health
pub async fn health_check(State(state): State<ApiState>) -> Json<HealthResponse> {
    let uptime = Utc::now().signed_duration_since(state.startup_time);
    Json(HealthResponse {
        status: "ok".to_string(),
        module: "claimtrail-recon".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: uptime.num_seconds().max(0) as u64,
    })
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub checkpoints: BTreeMap<String, String>,
    pub claims: i64,
    pub identities: i64,
    pub records: i64,
}

/// GET /status
pub async fn status(
    State(state): State<ApiState>,
) -> Result<Json<StatusResponse>, axum::http::StatusCode> {
    let checkpoints = kv::all(&state.pool)
        .await
        .map_err(|_| axum::http::StatusCode::INTERNAL_SERVER_ERROR)?
        .into_iter()
        .collect();

    let claims = count(&state.pool, "claims").await?;
    let identities = count(&state.pool, "identities").await?;
    let records = count(&state.pool, "records").await?;

    Ok(Json(StatusResponse {
        checkpoints,
        claims,
        identities,
        records,
    }))
}

async fn count(pool: &SqlitePool, table: &str) -> Result<i64, axum::http::StatusCode> {
    // table names are compile-time constants, not user input
    let query = format!("SELECT COUNT(*) FROM {}", table);
    let (n,): (i64,) = sqlx::query_as(&query)
        .fetch_one(pool)
        .await
        .map_err(|_| axum::http::StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(n)
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use claimtrail_common::db::init_memory_pool;

    #[tokio::test]
    async fn test_health_reports_uptime() {
        let pool = init_memory_pool().await.unwrap();
        let state = ApiState {
            pool,
            startup_time: Utc::now() - chrono::Duration::seconds(5),
        };
        let response = health_check(State(state)).await;
        assert_eq!(response.0.status, "ok");
        assert!(response.0.uptime_seconds >= 5);
    }

    #[tokio::test]
    async fn test_status_lists_checkpoints_and_counts() {
        let pool = init_memory_pool().await.unwrap();
        kv::set(&pool, kv::LAST_CHECK, "2020-01-01T00:00:00Z")
            .await
            .unwrap();
        let state = ApiState {
            pool,
            startup_time: Utc::now(),
        };

        let response = status(State(state)).await.unwrap();
        assert_eq!(
            response.0.checkpoints.get(kv::LAST_CHECK).map(String::as_str),
            Some("2020-01-01T00:00:00Z")
        );
        assert_eq!(response.0.claims, 0);
    }
}
