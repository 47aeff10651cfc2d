//! Thin REST projection over the topology query layer (ambient outer
//! surface, out of core scope per spec §1, but every Controller needs a
//! health/observability surface to sit behind the gRPC plane).

use crate::state::AppState;
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/v1/endpoints", get(list_endpoints))
        .route("/api/v1/conversations", get(list_conversations))
        .route("/api/v1/conversation", get(conversation_detail))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    "ok"
}

#[derive(Debug, Serialize)]
struct EndpointOut {
    id: String,
    alias: Option<String>,
    external: bool,
    host: bool,
    managed: bool,
}

async fn list_endpoints(State(state): State<AppState>) -> impl IntoResponse {
    let endpoints = state.graph.list_endpoints(|_| true).await;
    Json(
        endpoints
            .into_iter()
            .map(|e| EndpointOut {
                id: e.id.0,
                alias: e.attrs.alias,
                external: e.attrs.external,
                host: e.attrs.host,
                managed: e.attrs.managed,
            })
            .collect::<Vec<_>>(),
    )
}

#[derive(Debug, Serialize)]
struct ConversationOut {
    from: String,
    to: String,
    bytes: u64,
    sessions: u64,
    severity: u32,
}

async fn list_conversations(State(state): State<AppState>) -> impl IntoResponse {
    let conversations = state.graph.list_conversations(|_| true).await;
    Json(
        conversations
            .into_iter()
            .map(|c| ConversationOut {
                from: c.from.0,
                to: c.to.0,
                bytes: c.bytes,
                sessions: c.sessions,
                severity: c.severity,
            })
            .collect::<Vec<_>>(),
    )
}

#[derive(Debug, Deserialize)]
struct ConversationQuery {
    from: String,
    to: String,
}

#[derive(Debug, Serialize)]
struct ConversationEntryOut {
    port: u16,
    ip_proto: u8,
    application_id: u32,
    bytes: u64,
    sessions: u64,
    severity: u32,
    last_seen_unix_ms: i64,
}

async fn conversation_detail(
    State(state): State<AppState>,
    Query(q): Query<ConversationQuery>,
) -> impl IntoResponse {
    let from = segment_core::graph::NodeId(q.from);
    let to = segment_core::graph::NodeId(q.to);
    match state.graph.conversation_detail(&from, &to, |_| true).await {
        Some(detail) => {
            let entries = detail
                .entries
                .into_iter()
                .map(|(k, v)| ConversationEntryOut {
                    port: k.port,
                    ip_proto: k.ip_proto,
                    application_id: k.application_id,
                    bytes: v.bytes,
                    sessions: v.sessions,
                    severity: v.severity,
                    last_seen_unix_ms: v.last_seen_unix_ms,
                })
                .collect::<Vec<_>>();
            Json(serde_json::json!({
                "from": detail.summary.from.0,
                "to": detail.summary.to.0,
                "bytes": detail.summary.bytes,
                "sessions": detail.summary.sessions,
                "severity": detail.summary.severity,
                "entries": entries,
            }))
            .into_response()
        }
        None => axum::http::StatusCode::NOT_FOUND.into_response(),
    }
}
