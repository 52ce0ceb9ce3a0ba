//! SSH reverse-tunnel server entry point.
//!
//! Wires together the tunnel registry, the SSH server, the HTTP front end
//! (management API + reverse proxy), and the health/metrics background
//! tasks, then runs them all until shutdown.
//!
//! ## Usage
//! ```bash
//! ssh -R 3000:localhost:3000 -p 2222 alice:t-1:blog@localhost
//! # password: 3000:<TUNNEL_SECRET_KEY>
//! ```

use std::sync::Arc;

use log::info;

use russh::server::Server;

use hexagon_tunnel::{config, health, key, metrics, notifier::BackendNotifier, HttpState, SshServer, TunnelRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    config::init();
    let cfg = config::get();

    info!("starting Hexagon Tunnel Service...");

    let host_key = key::load_or_generate_host_key(&cfg.ssh_host_key_path)?;

    let notifier = Arc::new(BackendNotifier::new(cfg.nodejs_backend_url.clone()));
    let registry = Arc::new(TunnelRegistry::new(
        cfg.tunnel_base_port,
        cfg.tunnel_max_port,
        cfg.max_tunnels_per_user,
        notifier.clone(),
    ));

    let (health_handle, _health_stop) = health::spawn(registry.clone(), notifier.clone());
    let (metrics_handle, _metrics_stop) = metrics::spawn(registry.clone(), notifier.clone());

    let ssh_config = russh::server::Config {
        methods: russh::MethodSet::PASSWORD,
        server_id: russh::SshId::Standard("SSH-2.0-hexagon-tunnel".to_string()),
        keys: vec![host_key],
        inactivity_timeout: Some(std::time::Duration::from_secs(1800)),
        auth_rejection_time: std::time::Duration::from_secs(3),
        auth_rejection_time_initial: Some(std::time::Duration::from_secs(0)),
        ..Default::default()
    };
    let ssh_config = Arc::new(ssh_config);

    let mut ssh_server = SshServer::new(registry.clone(), cfg.tunnel_secret_key.clone());
    let ssh_addr = format!("{}:{}", cfg.ssh_host, cfg.ssh_port);
    info!("SSH server listening on {}", ssh_addr);
    let ssh_task = tokio::spawn(async move {
        if let Err(e) = ssh_server.run_on_address(ssh_config, ssh_addr).await {
            log::error!("SSH server exited: {}", e);
        }
    });

    let http_state = HttpState::new(registry.clone());
    let http_addr = format!("{}:{}", cfg.host, cfg.port);
    let http_task = tokio::spawn(async move {
        if let Err(e) = hexagon_tunnel::http::run(http_state, &http_addr).await {
            log::error!("HTTP front end exited: {}", e);
        }
    });

    tokio::select! {
        _ = ssh_task => {}
        _ = http_task => {}
        _ = health_handle => {}
        _ = metrics_handle => {}
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    for tunnel in registry.list().await {
        registry.close(&tunnel.tunnel_id).await;
    }

    info!("Hexagon Tunnel Service stopped");
    Ok(())
}
