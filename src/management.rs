//! REST API for tunnel administration: listing, inspecting, closing
//! tunnels and managing their viewer sets.

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::info;
use serde::Serialize;

use crate::error::TunnelError;
use crate::http::HttpState;
use crate::registry::TunnelSnapshot;

#[derive(Debug, Serialize)]
pub struct RootResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    pub active_tunnels: usize,
    pub ssh_server: String,
}

#[derive(Debug, Serialize)]
pub struct TunnelSummaryResponse {
    pub tunnel_id: String,
    pub username: String,
    pub project_name: String,
    pub remote_port: u16,
    pub public_url: String,
    pub viewers_count: usize,
    pub status: &'static str,
    pub created_at: f64,
}

#[derive(Debug, Serialize)]
pub struct TunnelsListResponse {
    pub tunnels: Vec<TunnelSummaryResponse>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct UserTunnelsResponse {
    pub user_id: String,
    pub tunnels: Vec<TunnelSummaryResponse>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct TunnelResponse {
    pub tunnel_id: String,
    pub username: String,
    pub project_name: String,
    pub remote_port: u16,
    pub public_url: String,
    pub ssh_command: String,
    pub status: &'static str,
    pub viewers_count: usize,
    pub created_at: f64,
}

#[derive(Debug, Serialize)]
pub struct TunnelStatsResponse {
    pub tunnel_id: String,
    pub viewers_count: usize,
    pub bytes_transferred: u64,
    pub requests_count: u64,
    pub uptime_seconds: f64,
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
    pub tunnel_id: String,
}

#[derive(Debug, Serialize)]
pub struct ViewerMessageResponse {
    pub message: String,
    pub tunnel_id: String,
    pub viewer_id: String,
}

fn status_label(status: crate::registry::TunnelStatus) -> &'static str {
    match status {
        crate::registry::TunnelStatus::Active => "active",
        crate::registry::TunnelStatus::Unhealthy => "unhealthy",
        crate::registry::TunnelStatus::Closed => "closed",
    }
}

fn unix_timestamp(t: std::time::SystemTime) -> f64 {
    t.duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

fn summarize(s: &TunnelSnapshot) -> TunnelSummaryResponse {
    TunnelSummaryResponse {
        tunnel_id: s.tunnel_id.clone(),
        username: s.username.clone(),
        project_name: s.project_name.clone(),
        remote_port: s.remote_port,
        public_url: crate::config::public_url(&s.username, &s.project_name),
        viewers_count: s.viewers.len(),
        status: status_label(s.status),
        created_at: unix_timestamp(s.created_at),
    }
}

async fn root(State(state): State<HttpState>) -> Json<RootResponse> {
    let config = crate::config::get();
    Json(RootResponse {
        status: "ok",
        service: "Hexagon Tunnel Service",
        version: env!("CARGO_PKG_VERSION"),
        active_tunnels: state.registry.list().await.len(),
        ssh_server: format!("{}:{}", config.ssh_host, config.ssh_port),
    })
}

async fn list_tunnels(State(state): State<HttpState>) -> Json<TunnelsListResponse> {
    let tunnels: Vec<TunnelSummaryResponse> =
        state.registry.list().await.iter().map(summarize).collect();
    Json(TunnelsListResponse {
        count: tunnels.len(),
        tunnels,
    })
}

async fn user_tunnels(
    State(state): State<HttpState>,
    Path(user_id): Path<String>,
) -> Json<UserTunnelsResponse> {
    let tunnels: Vec<TunnelSummaryResponse> = state
        .registry
        .list_by_user(&user_id)
        .await
        .iter()
        .map(summarize)
        .collect();
    Json(UserTunnelsResponse {
        count: tunnels.len(),
        user_id,
        tunnels,
    })
}

async fn get_tunnel(
    State(state): State<HttpState>,
    Path(tunnel_id): Path<String>,
) -> Result<Json<TunnelResponse>, TunnelError> {
    let tunnel = state
        .registry
        .get(&tunnel_id)
        .await
        .ok_or_else(|| TunnelError::TunnelNotFound(tunnel_id.clone()))?;

    let config = crate::config::get();
    Ok(Json(TunnelResponse {
        tunnel_id: tunnel.tunnel_id.clone(),
        username: tunnel.username.clone(),
        project_name: tunnel.project_name.clone(),
        remote_port: tunnel.remote_port,
        public_url: crate::config::public_url(&tunnel.username, &tunnel.project_name),
        ssh_command: format!(
            "ssh -R {}:localhost:{} {}:{}:{}@{} -p {}",
            tunnel.remote_port,
            tunnel.local_port,
            tunnel.user_id,
            tunnel.tunnel_id,
            tunnel.project_name,
            config.ssh_host,
            config.ssh_port
        ),
        status: status_label(tunnel.status),
        viewers_count: tunnel.viewers.len(),
        created_at: unix_timestamp(tunnel.created_at),
    }))
}

async fn tunnel_stats(
    State(state): State<HttpState>,
    Path(tunnel_id): Path<String>,
) -> Result<Json<TunnelStatsResponse>, TunnelError> {
    let tunnel = state
        .registry
        .get(&tunnel_id)
        .await
        .ok_or_else(|| TunnelError::TunnelNotFound(tunnel_id.clone()))?;

    let uptime_seconds = tunnel.created_at.elapsed().unwrap_or_default().as_secs_f64();
    Ok(Json(TunnelStatsResponse {
        tunnel_id: tunnel.tunnel_id.clone(),
        viewers_count: tunnel.viewers.len(),
        bytes_transferred: tunnel.bytes_transferred,
        requests_count: tunnel.requests_count,
        uptime_seconds,
        status: status_label(tunnel.status),
    }))
}

async fn close_tunnel(
    State(state): State<HttpState>,
    Path(tunnel_id): Path<String>,
) -> Result<Json<MessageResponse>, TunnelError> {
    state
        .registry
        .get(&tunnel_id)
        .await
        .ok_or_else(|| TunnelError::TunnelNotFound(tunnel_id.clone()))?;

    state.registry.close(&tunnel_id).await;
    info!("tunnel {} closed via management API", tunnel_id);
    Ok(Json(MessageResponse {
        message: "Tunnel closed successfully".to_string(),
        tunnel_id,
    }))
}

async fn add_viewer(
    State(state): State<HttpState>,
    Path((tunnel_id, viewer_id)): Path<(String, String)>,
) -> Result<Json<ViewerMessageResponse>, TunnelError> {
    state.registry.add_viewer(&tunnel_id, &viewer_id).await?;
    Ok(Json(ViewerMessageResponse {
        message: "Viewer added".to_string(),
        tunnel_id,
        viewer_id,
    }))
}

async fn remove_viewer(
    State(state): State<HttpState>,
    Path((tunnel_id, viewer_id)): Path<(String, String)>,
) -> Result<Json<ViewerMessageResponse>, TunnelError> {
    state.registry.remove_viewer(&tunnel_id, &viewer_id).await?;
    Ok(Json(ViewerMessageResponse {
        message: "Viewer removed".to_string(),
        tunnel_id,
        viewer_id,
    }))
}

pub fn routes() -> Router<HttpState> {
    Router::new()
        .route("/", get(root))
        .route("/tunnels", get(list_tunnels))
        .route("/tunnels/user/{user_id}", get(user_tunnels))
        .route("/tunnels/{tunnel_id}", get(get_tunnel).delete(close_tunnel))
        .route("/tunnels/{tunnel_id}/stats", get(tunnel_stats))
        .route(
            "/tunnels/{tunnel_id}/viewers/{viewer_id}",
            post(add_viewer).delete(remove_viewer),
        )
}

