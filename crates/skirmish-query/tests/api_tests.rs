//! Integration tests for the query API endpoints.
//!
//! Tests drive the Axum `Router` directly via `tower::ServiceExt` without
//! starting a TCP server.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{DateTime, Utc};
use serde_json::Value;
use skirmish_core::query::VictoryQueryService;
use skirmish_core::stores::{ArenaRegistry, VictoryStore};
use skirmish_query::router::build_router;
use skirmish_query::state::AppState;
use skirmish_store::WindowConfig;
use skirmish_types::{Arena, VictoryRecord};
use tower::ServiceExt;

const T: i64 = 1_700_000_000_000;

fn at(offset_secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(T.saturating_add(offset_secs.saturating_mul(1000))).unwrap()
}

fn victory(arena: &str, round: &str, winner: &str, decided_at: DateTime<Utc>) -> VictoryRecord {
    VictoryRecord {
        round_id: round.into(),
        arena_id: arena.into(),
        arena_name: Some(String::from("Colosseum")),
        winner_id: winner.into(),
        winning_metric: 9,
        decided_at,
    }
}

/// Two partitions: arena-1/r-1 and arena-1/r-2 on one, arena-2/r-3 on the
/// other. The stores are returned so their readers stay published.
fn make_test_state() -> (Arc<AppState>, Vec<VictoryStore>) {
    let mut p0 = VictoryStore::in_memory("victories", WindowConfig::default());
    let mut p1 = VictoryStore::in_memory("victories", WindowConfig::default());
    for record in [
        victory("arena-1", "r-1", "C", at(0)),
        victory("arena-1", "r-2", "A", at(5)),
    ] {
        p0.put(record.decision_key(), record.clone(), record.decided_at);
    }
    let other = victory("arena-2", "r-3", "B", at(7));
    p1.put(other.decision_key(), other.clone(), other.decided_at);
    p0.publish();
    p1.publish();

    let registry = ArenaRegistry::in_memory();
    registry.upsert(Arena::new("arena-1", "Colosseum")).unwrap();

    let service = VictoryQueryService::new(vec![p0.reader(), p1.reader()], WindowConfig::default());
    let state = Arc::new(AppState::new(service, registry.reader()));
    (state, vec![p0, p1])
}

async fn get(uri: &str) -> (StatusCode, Value) {
    let (state, _stores) = make_test_state();
    let response = build_router(state)
        .oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    (status, body_to_json(response.into_body()).await)
}

async fn body_to_json(body: Body) -> Value {
    let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

// =========================================================================
// Tests
// =========================================================================

#[tokio::test]
async fn test_health() {
    let (status, json) = get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["partitions"], 2);
    assert_eq!(json["arenas"], 1);
    assert!(json["stream_time"].is_string());
}

#[tokio::test]
async fn test_latest_victory() {
    let (status, json) = get("/api/victories/arena-1/r-1/latest").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["winner_id"], "C");
    assert_eq!(json["winning_metric"], 9);
    assert_eq!(json["arena_name"], "Colosseum");
}

#[tokio::test]
async fn test_latest_victory_not_found() {
    let (status, json) = get("/api/victories/arena-1/r-404/latest").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["status"], 404);
    assert!(json["error"].as_str().unwrap().contains("arena-1/r-404"));
}

#[tokio::test]
async fn test_victory_range_with_bounds() {
    let (status, json) = get(
        "/api/victories/arena-1/r-1?from=2023-11-14T22:13:00Z&to=2023-11-14T22:14:00Z",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["count"], 1);
    assert_eq!(json["victories"][0]["winner_id"], "C");
}

#[tokio::test]
async fn test_victory_range_outside_bounds_is_empty() {
    let (status, json) = get("/api/victories/arena-1/r-1?to=2020-01-01T00:00:00Z").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["count"], 0);
}

#[tokio::test]
async fn test_inverted_range_is_bad_request() {
    let (status, json) = get(
        "/api/victories/arena-1/r-1?from=2024-01-02T00:00:00Z&to=2024-01-01T00:00:00Z",
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["status"], 400);
}

#[tokio::test]
async fn test_malformed_bound_is_bad_request() {
    let (status, _) = get("/api/arenas/arena-1/victories?from=soon").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_arena_range_is_ordered_and_scoped() {
    let (status, json) = get("/api/arenas/arena-1/victories").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["count"], 2);
    assert_eq!(json["victories"][0]["round_id"], "r-1");
    assert_eq!(json["victories"][1]["round_id"], "r-2");
}

#[tokio::test]
async fn test_latest_in_arena() {
    let (status, json) = get("/api/arenas/arena-2/victories/latest").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["winner_id"], "B");

    let (status, _) = get("/api/arenas/arena-9/victories/latest").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
