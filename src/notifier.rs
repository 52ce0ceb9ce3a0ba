//! Fire-and-forget webhooks to the Node.js backend.
//!
//! Every call here is best-effort: a slow or unreachable backend must never
//! block tunnel creation, closure, or the proxy's hot path, so callers
//! `tokio::spawn` these instead of awaiting them inline.

use std::time::Duration;

use log::warn;
use serde_json::{json, Value};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(5);

pub struct BackendNotifier {
    client: reqwest::Client,
    backend_url: String,
}

impl BackendNotifier {
    pub fn new(backend_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .expect("failed to build backend notifier HTTP client");
        Self { client, backend_url }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn tunnel_created(
        &self,
        tunnel_id: &str,
        user_id: &str,
        username: &str,
        project_name: &str,
        remote_port: u16,
        public_url: &str,
        created_at: chrono::DateTime<chrono::Utc>,
    ) {
        self.post(
            "created",
            json!({
                "tunnel_id": tunnel_id,
                "user_id": user_id,
                "username": username,
                "project_name": project_name,
                "remote_port": remote_port,
                "public_url": public_url,
                "created_at": created_at.to_rfc3339(),
            }),
        )
        .await;
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn tunnel_closed(
        &self,
        tunnel_id: &str,
        user_id: &str,
        bytes_transferred: u64,
        requests_count: u64,
        viewers_count: usize,
        duration_seconds: f64,
    ) {
        self.post(
            "closed",
            json!({
                "tunnel_id": tunnel_id,
                "user_id": user_id,
                "stats": {
                    "bytes_transferred": bytes_transferred,
                    "requests_count": requests_count,
                    "viewers_count": viewers_count,
                    "duration_seconds": duration_seconds,
                }
            }),
        )
        .await;
    }

    pub async fn tunnel_unhealthy(&self, tunnel_id: &str, user_id: &str, failures: u32) {
        self.post(
            "unhealthy",
            json!({
                "tunnel_id": tunnel_id,
                "user_id": user_id,
                "reason": "Health check failed",
                "failures": failures,
            }),
        )
        .await;
    }

    pub async fn tunnel_expired(&self, tunnel_id: &str, user_id: &str) {
        self.post(
            "expired",
            json!({
                "tunnel_id": tunnel_id,
                "user_id": user_id,
                "reason": "8 hour time limit reached",
            }),
        )
        .await;
    }

    pub async fn metrics(&self, payload: Value) {
        self.post("metrics", payload).await;
    }

    async fn post(&self, event: &str, body: Value) {
        let url = format!("{}/api/tunnels/webhook/{}", self.backend_url, event);
        match self.client.post(&url).json(&body).send().await {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                warn!(
                    "backend webhook '{}' returned status {}",
                    event,
                    response.status()
                );
            }
            Err(e) => {
                warn!("backend webhook '{}' failed: {}", event, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn post_to_unreachable_backend_does_not_panic() {
        let notifier = BackendNotifier::new("http://127.0.0.1:1".to_string());
        notifier.tunnel_expired("t1", "u1").await;
    }
}
