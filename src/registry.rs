//! The in-memory tunnel registry: the single source of truth for which
//! tunnels are live, who owns them, and how much traffic they've carried.

use std::collections::HashMap;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::SystemTime;

use log::{info, warn};
use russh::server::Handle;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::error::TunnelError;
use crate::notifier::BackendNotifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelStatus {
    Active,
    Unhealthy,
    Closed,
}

/// Parameters carried by the SSH credential once parsed (spec §4.3).
pub struct CreateParams {
    pub user_id: String,
    pub tunnel_id: String,
    pub project_name: String,
    pub local_port: u16,
    pub peer_addr: Option<SocketAddr>,
}

/// The registry's internal, non-`Clone` record for a live tunnel. The SSH
/// session `Handle` and the forwarding listener task both live here; callers
/// only ever see a [`TunnelSnapshot`].
struct TunnelRecord {
    user_id: String,
    username: String,
    project_name: String,
    local_port: u16,
    remote_port: u16,
    handle: Handle,
    forward: JoinHandle<()>,
    created_at: SystemTime,
    viewers: HashSet<String>,
    bytes_transferred: u64,
    requests_count: u64,
    status: TunnelStatus,
    health_check_failures: u32,
    /// Flipped to `false` by the owning SSH session's close hooks (including
    /// its `Drop` impl). The health monitor reads this instead of probing
    /// liveness by opening a real forwarded-tcpip channel against the
    /// creator's local service.
    alive: Arc<AtomicBool>,
}

/// A point-in-time, `Clone`-able view of a tunnel, safe to hand out of the
/// lock. `handle` is retained (it is a cheap channel-sender clone) so health
/// probes can use it without a second registry lookup.
#[derive(Clone)]
pub struct TunnelSnapshot {
    pub tunnel_id: String,
    pub user_id: String,
    pub username: String,
    pub project_name: String,
    pub local_port: u16,
    pub remote_port: u16,
    pub handle: Handle,
    pub created_at: SystemTime,
    pub viewers: HashSet<String>,
    pub bytes_transferred: u64,
    pub requests_count: u64,
    pub status: TunnelStatus,
    pub health_check_failures: u32,
    pub alive: Arc<AtomicBool>,
}

impl TunnelRecord {
    fn snapshot(&self, tunnel_id: &str) -> TunnelSnapshot {
        TunnelSnapshot {
            tunnel_id: tunnel_id.to_string(),
            user_id: self.user_id.clone(),
            username: self.username.clone(),
            project_name: self.project_name.clone(),
            local_port: self.local_port,
            remote_port: self.remote_port,
            handle: self.handle.clone(),
            created_at: self.created_at,
            viewers: self.viewers.clone(),
            bytes_transferred: self.bytes_transferred,
            requests_count: self.requests_count,
            status: self.status,
            health_check_failures: self.health_check_failures,
            alive: self.alive.clone(),
        }
    }
}

/// The map of live tunnels plus the set of `(user_id, project_name)` pairs
/// that are mid-`create()` (port allocated or about to be, record not yet
/// inserted). Both live under one lock so a duplicate-project check and the
/// reservation that blocks a racing `create()` happen atomically.
#[derive(Default)]
struct RegistryState {
    tunnels: HashMap<String, TunnelRecord>,
    /// `(tunnel_id, user_id, project_name)` triples reserved by a `create()`
    /// call that has passed the uniqueness checks but not yet inserted its
    /// record (it is still allocating a port / binding a listener).
    pending: HashSet<(String, String, String)>,
}

pub struct TunnelRegistry {
    allocator: crate::port::PortAllocator,
    max_tunnels_per_user: u32,
    state: RwLock<RegistryState>,
    notifier: Arc<BackendNotifier>,
}

impl TunnelRegistry {
    pub fn new(
        base_port: u16,
        max_port: u16,
        max_tunnels_per_user: u32,
        notifier: Arc<BackendNotifier>,
    ) -> Self {
        Self {
            allocator: crate::port::PortAllocator::new(base_port, max_port),
            max_tunnels_per_user,
            state: RwLock::new(RegistryState::default()),
            notifier,
        }
    }

    /// Approve an SSH remote-forwarding request: allocate a port, bind a
    /// real `TcpListener` on it, and bridge every inbound connection back
    /// to the creator's local port over the SSH channel. On any failure the
    /// port is released and no record is stored (spec §4.2).
    pub async fn create(
        &self,
        params: CreateParams,
        handle: Handle,
    ) -> Result<TunnelSnapshot, TunnelError> {
        let pending_key = (
            params.tunnel_id.clone(),
            params.user_id.clone(),
            params.project_name.clone(),
        );

        // The duplicate-project/tunnel-id checks and the reservation that
        // blocks a second, concurrent `create()` for the same project must
        // happen in the same write-lock critical section: releasing the
        // lock between "checked, no duplicate" and "inserted" would let two
        // racing SSH sessions both pass the check before either commits
        // (spec §5's linearized-creation guarantee, invariant I3).
        {
            let mut state = self.state.write().await;
            if state.tunnels.contains_key(&params.tunnel_id)
                || state.pending.iter().any(|(t, _, _)| *t == params.tunnel_id)
            {
                return Err(TunnelError::DuplicateProject {
                    user_id: params.user_id,
                    project_name: params.project_name,
                });
            }
            let duplicate_project = state
                .tunnels
                .values()
                .any(|t| t.user_id == params.user_id && t.project_name == params.project_name)
                || state
                    .pending
                    .iter()
                    .any(|(_, u, p)| *u == params.user_id && *p == params.project_name);
            if duplicate_project {
                return Err(TunnelError::DuplicateProject {
                    user_id: params.user_id,
                    project_name: params.project_name,
                });
            }
            let live_for_user = state.tunnels.values().filter(|t| t.user_id == params.user_id).count()
                + state.pending.iter().filter(|(_, u, _)| *u == params.user_id).count();
            if live_for_user as u32 >= self.max_tunnels_per_user {
                return Err(TunnelError::LimitExceeded(params.user_id));
            }
            state.pending.insert(pending_key.clone());
        }

        let remote_port = match self.allocator.allocate() {
            Ok(port) => port,
            Err(e) => {
                self.state.write().await.pending.remove(&pending_key);
                return Err(e);
            }
        };

        let listener = match TcpListener::bind(("127.0.0.1", remote_port)).await {
            Ok(listener) => listener,
            Err(e) => {
                self.allocator.release(remote_port);
                self.state.write().await.pending.remove(&pending_key);
                return Err(TunnelError::ForwardingRejected(e.to_string()));
            }
        };

        let forward = spawn_forwarding_loop(listener, handle.clone(), params.local_port, remote_port);

        if let Some(addr) = params.peer_addr {
            info!("tunnel {} originates from {}", params.tunnel_id, addr);
        }

        let record = TunnelRecord {
            user_id: params.user_id.clone(),
            username: params.user_id.clone(),
            project_name: params.project_name.clone(),
            local_port: params.local_port,
            remote_port,
            handle,
            forward,
            created_at: SystemTime::now(),
            viewers: HashSet::new(),
            bytes_transferred: 0,
            requests_count: 0,
            status: TunnelStatus::Active,
            health_check_failures: 0,
            alive: Arc::new(AtomicBool::new(true)),
        };
        let snapshot = record.snapshot(&params.tunnel_id);

        {
            let mut state = self.state.write().await;
            state.pending.remove(&pending_key);
            state.tunnels.insert(params.tunnel_id.clone(), record);
        }

        info!(
            "tunnel {} created for {}/{} -> 127.0.0.1:{}",
            params.tunnel_id, snapshot.username, snapshot.project_name, remote_port
        );

        let notifier = self.notifier.clone();
        let public_url = crate::config::public_url(&snapshot.username, &snapshot.project_name);
        let tunnel_id = snapshot.tunnel_id.clone();
        let user_id = snapshot.user_id.clone();
        let username = snapshot.username.clone();
        let project_name = snapshot.project_name.clone();
        let created_at = chrono::DateTime::<chrono::Utc>::from(snapshot.created_at);
        tokio::spawn(async move {
            notifier
                .tunnel_created(
                    &tunnel_id,
                    &user_id,
                    &username,
                    &project_name,
                    remote_port,
                    &public_url,
                    created_at,
                )
                .await;
        });

        Ok(snapshot)
    }

    /// Idempotent: closing a tunnel that is not present (already closed by
    /// another caller) is a no-op.
    pub async fn close(&self, tunnel_id: &str) -> Option<TunnelSnapshot> {
        let record = {
            let mut state = self.state.write().await;
            state.tunnels.remove(tunnel_id)?
        };

        record.forward.abort();
        self.allocator.release(record.remote_port);

        let duration_seconds = record
            .created_at
            .elapsed()
            .unwrap_or_default()
            .as_secs_f64();

        info!("tunnel {} closed", tunnel_id);

        let notifier = self.notifier.clone();
        let tunnel_id_owned = tunnel_id.to_string();
        let user_id = record.user_id.clone();
        let bytes_transferred = record.bytes_transferred;
        let requests_count = record.requests_count;
        let viewers_count = record.viewers.len();
        tokio::spawn(async move {
            notifier
                .tunnel_closed(
                    &tunnel_id_owned,
                    &user_id,
                    bytes_transferred,
                    requests_count,
                    viewers_count,
                    duration_seconds,
                )
                .await;
        });

        Some(record.snapshot(tunnel_id))
    }

    pub async fn get(&self, tunnel_id: &str) -> Option<TunnelSnapshot> {
        let state = self.state.read().await;
        state.tunnels.get(tunnel_id).map(|r| r.snapshot(tunnel_id))
    }

    /// Secondary lookup by (username, project_name). A linear scan is
    /// acceptable at the tunnel counts this service runs at. Only an
    /// `active` tunnel is returned: this is the resolver the HTTP proxy
    /// uses to route viewer traffic, and spec §4.4 step 1 requires
    /// "Absent or non-active → 404."
    pub async fn get_by_username_project(
        &self,
        username: &str,
        project_name: &str,
    ) -> Option<TunnelSnapshot> {
        let state = self.state.read().await;
        state.tunnels.iter().find_map(|(id, r)| {
            (r.username == username
                && r.project_name == project_name
                && r.status == TunnelStatus::Active)
                .then(|| r.snapshot(id))
        })
    }

    pub async fn list(&self) -> Vec<TunnelSnapshot> {
        let state = self.state.read().await;
        state.tunnels.iter().map(|(id, r)| r.snapshot(id)).collect()
    }

    pub async fn list_by_user(&self, user_id: &str) -> Vec<TunnelSnapshot> {
        let state = self.state.read().await;
        state
            .tunnels
            .iter()
            .filter(|(_, r)| r.user_id == user_id)
            .map(|(id, r)| r.snapshot(id))
            .collect()
    }

    pub async fn add_viewer(&self, tunnel_id: &str, viewer_id: &str) -> Result<(), TunnelError> {
        let mut state = self.state.write().await;
        let record = state
            .tunnels
            .get_mut(tunnel_id)
            .ok_or_else(|| TunnelError::TunnelNotFound(tunnel_id.to_string()))?;
        record.viewers.insert(viewer_id.to_string());
        Ok(())
    }

    pub async fn remove_viewer(&self, tunnel_id: &str, viewer_id: &str) -> Result<(), TunnelError> {
        let mut state = self.state.write().await;
        let record = state
            .tunnels
            .get_mut(tunnel_id)
            .ok_or_else(|| TunnelError::TunnelNotFound(tunnel_id.to_string()))?;
        record.viewers.remove(viewer_id);
        Ok(())
    }

    pub async fn update_stats(&self, tunnel_id: &str, bytes: u64) -> Result<(), TunnelError> {
        let mut state = self.state.write().await;
        let record = state
            .tunnels
            .get_mut(tunnel_id)
            .ok_or_else(|| TunnelError::TunnelNotFound(tunnel_id.to_string()))?;
        record.bytes_transferred += bytes;
        record.requests_count += 1;
        Ok(())
    }

    pub async fn record_health_failure(&self, tunnel_id: &str) -> Option<u32> {
        let mut state = self.state.write().await;
        let record = state.tunnels.get_mut(tunnel_id)?;
        record.health_check_failures += 1;
        record.status = TunnelStatus::Unhealthy;
        Some(record.health_check_failures)
    }

    pub async fn reset_health_failures(&self, tunnel_id: &str) {
        let mut state = self.state.write().await;
        if let Some(record) = state.tunnels.get_mut(tunnel_id) {
            if record.health_check_failures > 0 {
                record.health_check_failures = 0;
                record.status = TunnelStatus::Active;
            }
        }
    }
}

/// Bridges every inbound TCP connection on `listener` to the SSH session's
/// `forwarded-tcpip` channel, making `127.0.0.1:<remote_port>` a real,
/// proxyable address for the creator's local service listening on
/// `local_port`.
fn spawn_forwarding_loop(
    listener: TcpListener,
    handle: Handle,
    local_port: u16,
    remote_port: u16,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let (tcp_stream, peer_addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("forwarding listener on {} stopped accepting: {}", remote_port, e);
                    break;
                }
            };

            let handle = handle.clone();
            tokio::spawn(async move {
                let channel = match handle
                    .channel_open_forwarded_tcpip(
                        "127.0.0.1",
                        local_port as u32,
                        &peer_addr.ip().to_string(),
                        peer_addr.port() as u32,
                    )
                    .await
                {
                    Ok(channel) => channel,
                    Err(e) => {
                        warn!("failed to open forwarded-tcpip channel: {}", e);
                        return;
                    }
                };

                let mut tcp_stream = tcp_stream;
                let mut channel_stream = channel.into_stream();
                if let Err(e) =
                    tokio::io::copy_bidirectional(&mut tcp_stream, &mut channel_stream).await
                {
                    warn!("forwarding connection ended: {}", e);
                }
            });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notifier() -> Arc<BackendNotifier> {
        Arc::new(BackendNotifier::new("http://127.0.0.1:1".to_string()))
    }

    #[tokio::test]
    async fn viewer_and_stat_operations_require_an_existing_tunnel() {
        let registry = TunnelRegistry::new(10000, 10010, 5, notifier());
        assert!(matches!(
            registry.add_viewer("missing", "v1").await,
            Err(TunnelError::TunnelNotFound(_))
        ));
        assert!(matches!(
            registry.update_stats("missing", 10).await,
            Err(TunnelError::TunnelNotFound(_))
        ));
    }

    #[tokio::test]
    async fn list_and_get_agree_on_an_empty_registry() {
        let registry = TunnelRegistry::new(10000, 10010, 5, notifier());
        assert!(registry.list().await.is_empty());
        assert!(registry.get("anything").await.is_none());
        assert!(registry
            .get_by_username_project("alice", "blog")
            .await
            .is_none());
    }

    #[tokio::test]
    async fn closing_an_absent_tunnel_is_idempotent() {
        let registry = TunnelRegistry::new(10000, 10010, 5, notifier());
        assert!(registry.close("never-existed").await.is_none());
        assert!(registry.close("never-existed").await.is_none());
    }
}
