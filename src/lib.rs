//! SSH reverse-tunnel server library: exposes a public, HTTP-proxied
//! `localhost:<port>` for a developer's local service, identical in spirit
//! to `ngrok`/`localtunnel` but self-hosted.

pub mod config;
pub mod error;
pub mod health;
pub mod http;
pub mod key;
pub mod management;
pub mod metrics;
pub mod notifier;
pub mod port;
pub mod proxy;
pub mod registry;
pub mod ssh;

pub use error::TunnelError;
pub use http::HttpState;
pub use notifier::BackendNotifier;
pub use registry::TunnelRegistry;
pub use ssh::{SshHandler, SshServer};
