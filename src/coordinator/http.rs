//! HTTP API of the master
//!
//! - Chunk lifecycle and replica events (`/chunks/...`)
//! - Location registration, liveness and medium override (`/locations/...`)
//! - Medium policy (`/media/...`)
//! - Raw ground store inspection (`/ground/...`)
//! - Dynamic config, verify/repair, status, health and metrics

use crate::common::{ChunkId, ChunkManagerConfig, Error, LocationId, METRICS, DEFAULT_MEDIUM};
use crate::coordinator::reconciler::{LivenessStatus, LocationEvent};
use crate::coordinator::server::MasterState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

fn error_response(e: Error) -> Response {
    (
        e.to_http_status(),
        axum::Json(json!({ "error": e.to_string() })),
    )
        .into_response()
}

fn ok_json(value: serde_json::Value) -> Response {
    (StatusCode::OK, axum::Json(value)).into_response()
}

/// Creates the HTTP router with all endpoints.
pub fn create_router(state: MasterState) -> Router {
    Router::new()
        // Chunks
        .route("/chunks", axum::routing::post(create_chunk))
        .route("/chunks/lost", axum::routing::get(lost_chunks))
        .route("/chunks/degraded", axum::routing::get(degraded_chunks))
        .route("/chunks/:id", axum::routing::get(get_chunk).delete(remove_chunk))
        .route(
            "/chunks/:id/replication_factor",
            axum::routing::put(set_replication_factor),
        )
        .route("/chunks/:id/replicas", axum::routing::post(record_replica))
        .route(
            "/chunks/:id/replicas/:location",
            axum::routing::delete(drop_replica),
        )
        .route("/chunks/:id/stored_replicas", axum::routing::get(stored_replicas))
        .route(
            "/chunks/:id/stored_sequoia_replicas",
            axum::routing::get(stored_sequoia_replicas),
        )
        .route(
            "/chunks/:id/stored_master_replicas",
            axum::routing::get(stored_master_replicas),
        )
        .route(
            "/chunks/:id/last_seen_replicas",
            axum::routing::get(last_seen_replicas),
        )
        // Locations
        .route(
            "/locations",
            axum::routing::post(register_location).get(list_locations),
        )
        .route(
            "/locations/:id",
            axum::routing::get(get_location).delete(decommission_location),
        )
        .route("/locations/:id/heartbeat", axum::routing::post(heartbeat))
        .route(
            "/locations/:id/medium_override",
            axum::routing::put(set_medium_override),
        )
        // Media
        .route("/media", axum::routing::get(list_media))
        .route(
            "/media/:name",
            axum::routing::put(set_medium_policy).get(get_medium),
        )
        // Ground store inspection
        .route("/ground/chunk_replicas", axum::routing::get(scan_chunk_rows))
        .route(
            "/ground/chunk_replicas/:chunk",
            axum::routing::get(get_chunk_row),
        )
        .route(
            "/ground/location_replicas",
            axum::routing::get(scan_location_rows),
        )
        .route(
            "/ground/location_replicas/:location",
            axum::routing::get(get_location_rows),
        )
        // Admin
        .route(
            "/admin/config",
            axum::routing::get(get_config).put(replace_config),
        )
        .route("/admin/verify", axum::routing::post(admin_verify))
        .route("/admin/repair", axum::routing::post(admin_repair))
        .route("/admin/status", axum::routing::get(admin_status))
        .route("/health", axum::routing::get(health))
        .route("/metrics", axum::routing::get(metrics))
        .with_state(state)
}

// ============================================================================
// Chunks
// ============================================================================

#[derive(Debug, Deserialize)]
struct CreateChunkRequest {
    /// Generated when absent
    chunk_id: Option<ChunkId>,
    replication_factor: u32,
}

async fn create_chunk(
    State(state): State<MasterState>,
    axum::Json(req): axum::Json<CreateChunkRequest>,
) -> impl IntoResponse {
    let chunk_id = req.chunk_id.unwrap_or_default();
    match state.directory.create_chunk(chunk_id, req.replication_factor) {
        Ok(created) => {
            let status = if created {
                StatusCode::CREATED
            } else {
                StatusCode::OK
            };
            (
                status,
                axum::Json(json!({ "chunk_id": chunk_id, "created": created })),
            )
                .into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn get_chunk(State(state): State<MasterState>, Path(id): Path<String>) -> impl IntoResponse {
    match id.parse::<ChunkId>().and_then(|id| state.directory.query(id)) {
        Ok(view) => ok_json(json!(view)),
        Err(e) => error_response(e),
    }
}

async fn remove_chunk(
    State(state): State<MasterState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match id.parse::<ChunkId>() {
        Ok(chunk_id) => {
            let removed = state.directory.remove_chunk(chunk_id);
            ok_json(json!({ "chunk_id": chunk_id, "removed": removed }))
        }
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct ReplicationFactorRequest {
    replication_factor: u32,
}

async fn set_replication_factor(
    State(state): State<MasterState>,
    Path(id): Path<String>,
    axum::Json(req): axum::Json<ReplicationFactorRequest>,
) -> impl IntoResponse {
    let res = id.parse::<ChunkId>().and_then(|chunk_id| {
        state
            .directory
            .set_replication_factor(chunk_id, req.replication_factor)
            .map(|()| chunk_id)
    });
    match res {
        Ok(chunk_id) => ok_json(json!({
            "chunk_id": chunk_id,
            "replication_factor": req.replication_factor,
        })),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct RecordReplicaRequest {
    location_uuid: LocationId,
}

/// Placement confirmation. Stale references answer 200 with the outcome.
async fn record_replica(
    State(state): State<MasterState>,
    Path(id): Path<String>,
    axum::Json(req): axum::Json<RecordReplicaRequest>,
) -> impl IntoResponse {
    match id.parse::<ChunkId>() {
        Ok(chunk_id) => {
            let outcome = state.directory.record_replica(chunk_id, req.location_uuid);
            ok_json(json!({ "outcome": outcome }))
        }
        Err(e) => error_response(e),
    }
}

async fn drop_replica(
    State(state): State<MasterState>,
    Path((id, location)): Path<(String, String)>,
) -> impl IntoResponse {
    let parsed = id
        .parse::<ChunkId>()
        .and_then(|c| location.parse::<LocationId>().map(|l| (c, l)));
    match parsed {
        Ok((chunk_id, location_uuid)) => {
            let outcome = state.directory.drop_replica(chunk_id, location_uuid);
            ok_json(json!({ "outcome": outcome }))
        }
        Err(e) => error_response(e),
    }
}

async fn stored_replicas(
    State(state): State<MasterState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match id
        .parse::<ChunkId>()
        .and_then(|c| state.directory.stored_replicas(c))
    {
        Ok(replicas) => ok_json(json!(replicas)),
        Err(e) => error_response(e),
    }
}

async fn stored_sequoia_replicas(
    State(state): State<MasterState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match id
        .parse::<ChunkId>()
        .and_then(|c| state.directory.stored_sequoia_replicas(c))
    {
        Ok(replicas) => ok_json(json!(replicas)),
        Err(e) => error_response(e),
    }
}

async fn stored_master_replicas(
    State(state): State<MasterState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match id
        .parse::<ChunkId>()
        .and_then(|c| state.directory.stored_master_replicas(c))
    {
        Ok(replicas) => ok_json(json!(replicas)),
        Err(e) => error_response(e),
    }
}

async fn last_seen_replicas(
    State(state): State<MasterState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match id
        .parse::<ChunkId>()
        .and_then(|c| state.directory.last_seen_replicas(c))
    {
        Ok(replicas) => ok_json(json!(replicas)),
        Err(e) => error_response(e),
    }
}

async fn lost_chunks(State(state): State<MasterState>) -> impl IntoResponse {
    let chunks = state.directory.lost_chunks();
    axum::Json(json!({ "total": chunks.len(), "chunks": chunks }))
}

#[derive(Debug, Deserialize)]
struct DegradedQuery {
    /// Overrides the configured threshold
    after_ms: Option<u64>,
}

async fn degraded_chunks(
    State(state): State<MasterState>,
    Query(query): Query<DegradedQuery>,
) -> impl IntoResponse {
    let threshold = query
        .after_ms
        .map(Duration::from_millis)
        .unwrap_or(state.degraded_after);
    let chunks = state.directory.degraded_chunks(threshold);
    axum::Json(json!({ "total": chunks.len(), "chunks": chunks }))
}

// ============================================================================
// Locations
// ============================================================================

#[derive(Debug, Deserialize)]
struct RegisterLocationRequest {
    location_uuid: Option<LocationId>,
    node_address: String,
    medium: Option<String>,
}

async fn register_location(
    State(state): State<MasterState>,
    axum::Json(req): axum::Json<RegisterLocationRequest>,
) -> impl IntoResponse {
    let location_uuid = req.location_uuid.unwrap_or_default();
    let medium = req.medium.as_deref().unwrap_or(DEFAULT_MEDIUM);
    match state
        .registry
        .register_location(location_uuid, &req.node_address, medium)
    {
        Ok(info) => (StatusCode::CREATED, axum::Json(json!(info))).into_response(),
        Err(e) => error_response(e),
    }
}

async fn list_locations(State(state): State<MasterState>) -> impl IntoResponse {
    let locations = state.registry.list_locations();
    axum::Json(json!({ "total": locations.len(), "locations": locations }))
}

async fn get_location(
    State(state): State<MasterState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let res = id.parse::<LocationId>().and_then(|location_uuid| {
        let info = state
            .registry
            .location(&location_uuid)
            .ok_or(Error::NoSuchLocation(location_uuid))?;
        let (sequoia, master) = state.directory.location_replica_counts(&location_uuid);
        Ok(json!({
            "location": info,
            "indexed_sequoia_replicas": sequoia,
            "indexed_master_replicas": master,
        }))
    });
    match res {
        Ok(body) => ok_json(body),
        Err(e) => error_response(e),
    }
}

/// Drops every replica on the location, then forgets it
async fn decommission_location(
    State(state): State<MasterState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let res = id.parse::<LocationId>().and_then(|location_uuid| {
        if state.registry.location(&location_uuid).is_none() {
            return Err(Error::NoSuchLocation(location_uuid));
        }
        state.reconciler.decommission(location_uuid)?;
        Ok(location_uuid)
    });
    match res {
        Ok(location_uuid) => (
            StatusCode::ACCEPTED,
            axum::Json(json!({ "location_uuid": location_uuid, "status": "decommissioning" })),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Default, Deserialize)]
struct HeartbeatRequest {
    #[serde(default)]
    status: Option<LivenessStatus>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

/// Liveness report; an explicit `down` status skips the grace period
async fn heartbeat(
    State(state): State<MasterState>,
    Path(id): Path<String>,
    body: Option<axum::Json<HeartbeatRequest>>,
) -> impl IntoResponse {
    let req = body.map(|axum::Json(req)| req).unwrap_or_default();
    let res = id.parse::<LocationId>().and_then(|location_uuid| {
        if state.registry.location(&location_uuid).is_none() {
            return Err(Error::NoSuchLocation(location_uuid));
        }
        let event = LocationEvent {
            location_uuid,
            timestamp: req.timestamp.unwrap_or_else(Utc::now),
            status: req.status.unwrap_or(LivenessStatus::Up),
        };
        state.reconciler.liveness(event)
    });
    match res {
        Ok(()) => (StatusCode::ACCEPTED, axum::Json(json!({ "status": "accepted" }))).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct MediumOverrideRequest {
    /// `null` clears the override
    medium: Option<String>,
}

async fn set_medium_override(
    State(state): State<MasterState>,
    Path(id): Path<String>,
    axum::Json(req): axum::Json<MediumOverrideRequest>,
) -> impl IntoResponse {
    match id.parse::<LocationId>().and_then(|location_uuid| {
        state
            .registry
            .set_medium_override(&location_uuid, req.medium.as_deref())
    }) {
        Ok(info) => ok_json(json!(info)),
        Err(e) => error_response(e),
    }
}

// ============================================================================
// Media
// ============================================================================

#[derive(Debug, Deserialize)]
struct MediumPolicyRequest {
    enable_sequoia_replicas: bool,
}

async fn set_medium_policy(
    State(state): State<MasterState>,
    Path(name): Path<String>,
    axum::Json(req): axum::Json<MediumPolicyRequest>,
) -> impl IntoResponse {
    match state
        .registry
        .set_medium_policy(&name, req.enable_sequoia_replicas)
    {
        Ok(medium) => ok_json(json!(medium)),
        Err(e) => error_response(e),
    }
}

async fn get_medium(State(state): State<MasterState>, Path(name): Path<String>) -> impl IntoResponse {
    match state.registry.medium(&name) {
        Some(medium) => ok_json(json!(medium)),
        None => error_response(Error::NoSuchMedium(name)),
    }
}

async fn list_media(State(state): State<MasterState>) -> impl IntoResponse {
    axum::Json(json!({ "media": state.registry.list_media() }))
}

// ============================================================================
// Ground store inspection
// ============================================================================

async fn scan_chunk_rows(State(state): State<MasterState>) -> impl IntoResponse {
    match state.ground.scan_chunk_replicas() {
        Ok(rows) => ok_json(json!({ "total": rows.len(), "rows": rows })),
        Err(e) => error_response(e),
    }
}

async fn get_chunk_row(
    State(state): State<MasterState>,
    Path(chunk): Path<String>,
) -> impl IntoResponse {
    let res = chunk.parse::<ChunkId>().and_then(|chunk_id| {
        state
            .ground
            .get_chunk_replicas(&chunk_id)?
            .ok_or(Error::NoSuchChunk(chunk_id))
    });
    match res {
        Ok(row) => ok_json(json!(row)),
        Err(e) => error_response(e),
    }
}

async fn scan_location_rows(State(state): State<MasterState>) -> impl IntoResponse {
    match state.ground.scan_location_replicas() {
        Ok(rows) => ok_json(json!({ "total": rows.len(), "rows": rows })),
        Err(e) => error_response(e),
    }
}

async fn get_location_rows(
    State(state): State<MasterState>,
    Path(location): Path<String>,
) -> impl IntoResponse {
    match location
        .parse::<LocationId>()
        .and_then(|l| state.ground.location_replicas(&l))
    {
        Ok(rows) => ok_json(json!({ "total": rows.len(), "rows": rows })),
        Err(e) => error_response(e),
    }
}

// ============================================================================
// Admin
// ============================================================================

async fn get_config(State(state): State<MasterState>) -> impl IntoResponse {
    axum::Json(json!(*state.config.snapshot()))
}

async fn replace_config(
    State(state): State<MasterState>,
    axum::Json(config): axum::Json<ChunkManagerConfig>,
) -> impl IntoResponse {
    match state.config.replace(config) {
        Ok(current) => ok_json(json!(*current)),
        Err(e) => error_response(e),
    }
}

async fn admin_verify(State(state): State<MasterState>) -> impl IntoResponse {
    if let Err(e) = state.mirror.flush().await {
        return error_response(e);
    }
    match crate::ops::verify_ground(&state.directory, state.ground.as_ref()) {
        Ok(report) => ok_json(json!({
            "status": "ok",
            "consistent": report.is_consistent(),
            "report": report,
        })),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Default, Deserialize)]
struct RepairQuery {
    #[serde(default)]
    dry_run: bool,
}

async fn admin_repair(
    State(state): State<MasterState>,
    Query(query): Query<RepairQuery>,
) -> impl IntoResponse {
    if let Err(e) = state.mirror.flush().await {
        return error_response(e);
    }
    let res = crate::ops::repair_ground(
        &state.directory,
        state.ground.as_ref(),
        &state.mirror,
        query.dry_run,
    )
    .await;
    match res {
        Ok(report) => ok_json(json!({ "status": "ok", "report": report })),
        Err(e) => error_response(e),
    }
}

async fn admin_status(State(state): State<MasterState>) -> impl IntoResponse {
    let (up, suspect, down) = state.registry.state_counts();
    let config = state.config.snapshot();
    axum::Json(json!({
        "node_id": state.node_id,
        "version": crate::VERSION,
        "uptime_secs": METRICS.uptime_seconds(),
        "chunks": state.directory.chunk_count(),
        "locations": { "up": up, "suspect": suspect, "down": down },
        "reconcile_backlog": METRICS.reconcile_backlog.get(),
        "lost_chunks": METRICS.lost_chunks.get(),
        "degraded_chunks": METRICS.degraded_chunks.get(),
        "sequoia_chunk_replicas_percentage": config.sequoia_chunk_replicas_percentage,
    }))
}

async fn health(State(state): State<MasterState>) -> impl IntoResponse {
    axum::Json(json!({
        "status": "healthy",
        "node_id": state.node_id,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// Endpoint Prometheus /metrics
pub async fn metrics() -> impl IntoResponse {
    (StatusCode::OK, METRICS.to_prometheus())
}
