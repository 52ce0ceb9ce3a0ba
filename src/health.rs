//! Background health monitor: periodically probes every live tunnel for
//! liveness, port accessibility, and age, closing tunnels that fail.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio::net::TcpStream;
use tokio::sync::oneshot;

use crate::notifier::BackendNotifier;
use crate::registry::{TunnelRegistry, TunnelSnapshot};

const CHECK_INTERVAL: Duration = Duration::from_secs(30);
const PORT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_FAILURES: u32 = 3;
const MAX_AGE: Duration = Duration::from_secs(8 * 3600);

pub fn spawn(
    registry: Arc<TunnelRegistry>,
    notifier: Arc<BackendNotifier>,
) -> (tokio::task::JoinHandle<()>, oneshot::Sender<()>) {
    let (stop_tx, mut stop_rx) = oneshot::channel();
    let handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(CHECK_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    check_all_tunnels(&registry, &notifier).await;
                }
                _ = &mut stop_rx => {
                    info!("health monitor stopping");
                    break;
                }
            }
        }
    });
    (handle, stop_tx)
}

async fn check_all_tunnels(registry: &Arc<TunnelRegistry>, notifier: &Arc<BackendNotifier>) {
    for tunnel in registry.list().await {
        if let Err(e) = check_one_tunnel(registry, notifier, &tunnel).await {
            warn!("health check for tunnel {} failed: {}", tunnel.tunnel_id, e);
        }
    }
}

async fn check_one_tunnel(
    registry: &Arc<TunnelRegistry>,
    notifier: &Arc<BackendNotifier>,
    tunnel: &TunnelSnapshot,
) -> Result<(), crate::error::TunnelError> {
    if !liveness_ok(tunnel) {
        return fail(registry, notifier, tunnel).await;
    }

    if !port_accessible(tunnel.remote_port).await {
        return fail(registry, notifier, tunnel).await;
    }

    if tunnel.created_at.elapsed().unwrap_or_default() > MAX_AGE {
        info!("tunnel {} expired (8h limit)", tunnel.tunnel_id);
        registry.close(&tunnel.tunnel_id).await;
        notifier
            .tunnel_expired(&tunnel.tunnel_id, &tunnel.user_id)
            .await;
        return Ok(());
    }

    if tunnel.health_check_failures > 0 {
        info!("tunnel {} recovered", tunnel.tunnel_id);
        registry.reset_health_failures(&tunnel.tunnel_id).await;
    }

    Ok(())
}

async fn fail(
    registry: &Arc<TunnelRegistry>,
    notifier: &Arc<BackendNotifier>,
    tunnel: &TunnelSnapshot,
) -> Result<(), crate::error::TunnelError> {
    let failures = registry
        .record_health_failure(&tunnel.tunnel_id)
        .await
        .unwrap_or(tunnel.health_check_failures + 1);

    warn!(
        "tunnel {} health check failed ({}/{})",
        tunnel.tunnel_id, failures, MAX_FAILURES
    );

    if failures >= MAX_FAILURES {
        registry.close(&tunnel.tunnel_id).await;
        notifier
            .tunnel_unhealthy(&tunnel.tunnel_id, &tunnel.user_id, failures)
            .await;
    }
    Ok(())
}

/// `russh::server::Handle` exposes no passive "is closed" query, so
/// liveness is tracked out-of-band: the owning `SshHandler` flips this flag
/// to `false` from every close path, including its `Drop` impl, the moment
/// the session ends. Reading it here is a plain load, not a probe — it
/// never makes the creator's local service see a phantom connection.
fn liveness_ok(tunnel: &TunnelSnapshot) -> bool {
    tunnel.alive.load(Ordering::Acquire)
}

async fn port_accessible(remote_port: u16) -> bool {
    matches!(
        tokio::time::timeout(
            PORT_PROBE_TIMEOUT,
            TcpStream::connect(("127.0.0.1", remote_port))
        )
        .await,
        Ok(Ok(_))
    )
}
