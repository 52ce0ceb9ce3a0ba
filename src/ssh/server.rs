//! SSH server implementation.

use std::net::SocketAddr;
use std::sync::Arc;

use log::{error, info};
use russh::server::{Handler, Server};

use super::SshHandler;
use crate::registry::TunnelRegistry;

/// Creates one [`SshHandler`] per inbound connection, each sharing the same
/// registry and port pool.
#[derive(Clone)]
pub struct SshServer {
    registry: Arc<TunnelRegistry>,
    secret_key: Arc<str>,
}

impl SshServer {
    pub fn new(registry: Arc<TunnelRegistry>, secret_key: String) -> Self {
        Self {
            registry,
            secret_key: secret_key.into(),
        }
    }
}

impl Server for SshServer {
    type Handler = SshHandler;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> Self::Handler {
        info!("new SSH connection from {:?}", peer_addr);
        SshHandler::new(self.registry.clone(), self.secret_key.clone(), peer_addr)
    }

    fn handle_session_error(&mut self, error: <Self::Handler as Handler>::Error) {
        error!("SSH session error: {:?}", error);
    }
}
