//! Background metrics collector: aggregates tunnel counters and reports
//! them to the backend every minute.

use std::sync::Arc;
use std::time::Duration;

use log::info;
use serde_json::json;
use tokio::sync::oneshot;

use crate::notifier::BackendNotifier;
use crate::registry::TunnelRegistry;

const COLLECTION_INTERVAL: Duration = Duration::from_secs(60);

pub fn spawn(
    registry: Arc<TunnelRegistry>,
    notifier: Arc<BackendNotifier>,
) -> (tokio::task::JoinHandle<()>, oneshot::Sender<()>) {
    let (stop_tx, mut stop_rx) = oneshot::channel();
    let handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(COLLECTION_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    collect(&registry, &notifier).await;
                }
                _ = &mut stop_rx => {
                    info!("metrics collector stopping");
                    break;
                }
            }
        }
    });
    (handle, stop_tx)
}

async fn collect(registry: &Arc<TunnelRegistry>, notifier: &Arc<BackendNotifier>) {
    let tunnels = registry.list().await;

    let total_tunnels = tunnels.len();
    let total_viewers: usize = tunnels.iter().map(|t| t.viewers.len()).sum();
    let total_bandwidth: u64 = tunnels.iter().map(|t| t.bytes_transferred).sum();

    info!(
        "metrics: {} tunnels, {} viewers, {} bytes",
        total_tunnels, total_viewers, total_bandwidth
    );

    let per_tunnel: Vec<_> = tunnels
        .iter()
        .map(|t| {
            json!({
                "tunnel_id": t.tunnel_id,
                "viewers_count": t.viewers.len(),
                "bandwidth": t.bytes_transferred,
                "requests": t.requests_count,
                "uptime_seconds": t.created_at.elapsed().unwrap_or_default().as_secs_f64(),
            })
        })
        .collect();

    let payload = json!({
        "total_tunnels": total_tunnels,
        "total_viewers": total_viewers,
        "total_bandwidth": total_bandwidth,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "tunnels": per_tunnel,
    });

    notifier.metrics(payload).await;
}
