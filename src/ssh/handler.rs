//! SSH handler for individual connections.
//!
//! Authentication is password-based: the username carries the tunnel's
//! identity, the password carries the local port and a shared secret
//! (spec §4.3). A session may establish at most one tunnel.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};
use russh::server::{Auth, Handler, Session};
use russh::ChannelId;

use crate::error::TunnelError;
use crate::registry::{CreateParams, TunnelRegistry};

struct ParsedCredential {
    user_id: String,
    tunnel_id: String,
    project_name: String,
    local_port: u16,
}

fn parse_username(user: &str) -> Option<(String, String, String)> {
    let parts: Vec<&str> = user.split(':').collect();
    match parts.as_slice() {
        [user_id, tunnel_id, project_name] => Some((
            user_id.to_string(),
            tunnel_id.to_string(),
            project_name.to_string(),
        )),
        _ => None,
    }
}

fn parse_password(password: &str) -> Option<(u16, &str)> {
    let parts: Vec<&str> = password.splitn(2, ':').collect();
    match parts.as_slice() {
        [local_port, secret] => local_port.parse().ok().map(|p| (p, *secret)),
        _ => None,
    }
}

/// Byte-by-byte comparison that does not short-circuit on the first
/// mismatch, so a failed auth attempt cannot be timed to learn the secret.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

pub struct SshHandler {
    registry: Arc<TunnelRegistry>,
    secret_key: Arc<str>,
    peer_addr: Option<SocketAddr>,
    credential: Option<ParsedCredential>,
    tunnel_id: Option<String>,
    /// Flipped to `false` by every close path (including `Drop`) so the
    /// health monitor's liveness probe has something to read without
    /// synthesizing a forwarded connection on every tick.
    alive: Option<Arc<AtomicBool>>,
}

impl SshHandler {
    pub fn new(registry: Arc<TunnelRegistry>, secret_key: Arc<str>, peer_addr: Option<SocketAddr>) -> Self {
        Self {
            registry,
            secret_key,
            peer_addr,
            credential: None,
            tunnel_id: None,
            alive: None,
        }
    }

    fn mark_dead(&mut self) {
        if let Some(alive) = self.alive.take() {
            alive.store(false, Ordering::Release);
        }
    }
}

#[async_trait]
impl Handler for SshHandler {
    type Error = TunnelError;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        let Some((user_id, tunnel_id, project_name)) = parse_username(user) else {
            warn!("rejecting auth: malformed username '{}'", user);
            return Ok(Auth::Reject {
                proceed_with_methods: None,
            });
        };

        let Some((local_port, secret)) = parse_password(password) else {
            warn!("rejecting auth for '{}': malformed password", user);
            return Ok(Auth::Reject {
                proceed_with_methods: None,
            });
        };

        if !constant_time_eq(secret, &self.secret_key) {
            warn!("rejecting auth for '{}': secret mismatch", user);
            return Ok(Auth::Reject {
                proceed_with_methods: None,
            });
        }

        info!(
            "auth succeeded: user_id={} tunnel_id={} project={} local_port={}",
            user_id, tunnel_id, project_name, local_port
        );
        self.credential = Some(ParsedCredential {
            user_id,
            tunnel_id,
            project_name,
            local_port,
        });
        Ok(Auth::Accept)
    }

    async fn tcpip_forward(
        &mut self,
        _address: &str,
        port: &mut u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if self.tunnel_id.is_some() {
            warn!("rejecting second tcpip_forward on a session that already has a tunnel");
            return Ok(false);
        }

        let Some(credential) = &self.credential else {
            warn!("tcpip_forward before successful authentication");
            return Ok(false);
        };

        let params = CreateParams {
            user_id: credential.user_id.clone(),
            tunnel_id: credential.tunnel_id.clone(),
            project_name: credential.project_name.clone(),
            local_port: credential.local_port,
            peer_addr: self.peer_addr,
        };

        let handle = session.handle();
        match self.registry.create(params, handle).await {
            Ok(snapshot) => {
                *port = snapshot.remote_port as u32;
                self.tunnel_id = Some(snapshot.tunnel_id.clone());
                self.alive = Some(snapshot.alive.clone());
                Ok(true)
            }
            Err(e) => {
                warn!("tunnel creation rejected: {}", e);
                Ok(false)
            }
        }
    }

    async fn cancel_tcpip_forward(
        &mut self,
        _address: &str,
        _port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.mark_dead();
        if let Some(tunnel_id) = self.tunnel_id.take() {
            self.registry.close(&tunnel_id).await;
        }
        Ok(true)
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("channel {:?} closed", channel);
        self.mark_dead();
        if let Some(tunnel_id) = self.tunnel_id.take() {
            self.registry.close(&tunnel_id).await;
        }
        Ok(())
    }
}

/// Neither a bare `ssh -N -R ...` client (which never opens a channel) nor
/// an abrupt disconnect reliably trips `channel_close`/`cancel_tcpip_forward`
/// (spec §4.3/§4.8: termination on "client disconnect, error, or
/// server-initiated close"). `Drop` is the one hook that fires regardless of
/// how the session ended, so it is the backstop that actually closes the
/// tunnel instead of leaving it for the health monitor's 3-strike giveup.
impl Drop for SshHandler {
    fn drop(&mut self) {
        self.mark_dead();
        if let Some(tunnel_id) = self.tunnel_id.take() {
            let registry = self.registry.clone();
            tokio::spawn(async move {
                registry.close(&tunnel_id).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_must_have_exactly_three_segments() {
        assert!(parse_username("user:tunnel:project").is_some());
        assert!(parse_username("user:tunnel").is_none());
        assert!(parse_username("user:tunnel:project:extra").is_none());
    }

    #[test]
    fn password_splits_on_first_colon_only() {
        let (port, secret) = parse_password("3000:se:cr:et").unwrap();
        assert_eq!(port, 3000);
        assert_eq!(secret, "se:cr:et");
        assert!(parse_password("not-a-port:secret").is_none());
        assert!(parse_password("3000").is_none());
    }

    #[test]
    fn constant_time_eq_matches_string_equality() {
        assert!(constant_time_eq("shared-secret", "shared-secret"));
        assert!(!constant_time_eq("shared-secret", "shared-secrets"));
        assert!(!constant_time_eq("abc", "abd"));
    }
}
