//! The HTTP front end: one `axum` server hosting both the management REST
//! API and the `/live/...` reverse proxy, the way spec's endpoint table
//! lists them as a single front end on one `HOST:PORT`.

use std::sync::Arc;
use std::time::Duration;

use log::info;
use tower_http::cors::{Any, CorsLayer};

use crate::registry::TunnelRegistry;

const PROXY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct HttpState {
    pub registry: Arc<TunnelRegistry>,
    pub proxy_client: reqwest::Client,
}

impl HttpState {
    pub fn new(registry: Arc<TunnelRegistry>) -> Self {
        let proxy_client = reqwest::Client::builder()
            .timeout(PROXY_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("failed to build proxy HTTP client");
        Self {
            registry,
            proxy_client,
        }
    }
}

pub fn router(state: HttpState) -> axum::Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    crate::management::routes()
        .merge(crate::proxy::routes())
        .layer(cors)
        .with_state(state)
}

pub async fn run(state: HttpState, addr: &str) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP front end listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}
