//! Centralized configuration management for the tunnel server.
//!
//! Every setting is overridable via an environment variable (optionally
//! loaded from a `.env` file); unset or malformed values fall back to the
//! defaults below rather than aborting startup.

use std::sync::OnceLock;

mod env {
    pub const PORT: &str = "PORT";
    pub const HOST: &str = "HOST";
    pub const SSH_HOST: &str = "SSH_HOST";
    pub const SSH_PORT: &str = "SSH_PORT";
    pub const SSH_HOST_KEY_PATH: &str = "SSH_HOST_KEY_PATH";
    pub const TUNNEL_BASE_PORT: &str = "TUNNEL_BASE_PORT";
    pub const TUNNEL_MAX_PORT: &str = "TUNNEL_MAX_PORT";
    pub const MAX_TUNNELS_PER_USER: &str = "MAX_TUNNELS_PER_USER";
    pub const PUBLIC_DOMAIN: &str = "PUBLIC_DOMAIN";
    pub const NODEJS_BACKEND_URL: &str = "NODEJS_BACKEND_URL";
    pub const TUNNEL_SECRET_KEY: &str = "TUNNEL_SECRET_KEY";
}

static CONFIG: OnceLock<Config> = OnceLock::new();

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub host: String,
    pub ssh_host: String,
    pub ssh_port: u16,
    pub ssh_host_key_path: String,
    pub tunnel_base_port: u16,
    pub tunnel_max_port: u16,
    pub max_tunnels_per_user: u32,
    pub public_domain: String,
    pub nodejs_backend_url: String,
    pub tunnel_secret_key: String,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_str_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

impl Config {
    fn load() -> Self {
        let config = Self {
            port: env_or(env::PORT, 8001),
            host: env_str_or(env::HOST, "0.0.0.0"),
            ssh_host: env_str_or(env::SSH_HOST, "0.0.0.0"),
            ssh_port: env_or(env::SSH_PORT, 2222),
            ssh_host_key_path: env_str_or(env::SSH_HOST_KEY_PATH, "./ssh_host_key"),
            tunnel_base_port: env_or(env::TUNNEL_BASE_PORT, 10000),
            tunnel_max_port: env_or(env::TUNNEL_MAX_PORT, 20000),
            max_tunnels_per_user: env_or(env::MAX_TUNNELS_PER_USER, 5),
            public_domain: env_str_or(env::PUBLIC_DOMAIN, "localhost:8001"),
            nodejs_backend_url: env_str_or(env::NODEJS_BACKEND_URL, "http://localhost:5003"),
            tunnel_secret_key: env_str_or(env::TUNNEL_SECRET_KEY, "change-me-in-production"),
        };

        if config.tunnel_base_port >= config.tunnel_max_port {
            panic!(
                "{} must be less than {}",
                env::TUNNEL_BASE_PORT,
                env::TUNNEL_MAX_PORT
            );
        }

        config
    }
}

/// Initialize configuration. Must be called once at startup.
pub fn init() {
    dotenvy::dotenv().ok();
    CONFIG.get_or_init(Config::load);
}

/// Get the global configuration. Panics if not initialized.
pub fn get() -> &'static Config {
    CONFIG
        .get()
        .expect("config not initialized. Call config::init() first.")
}

/// Construct the public URL a viewer would use to reach a tunneled project.
pub fn public_url(username: &str, project_name: &str) -> String {
    format!(
        "http://{}/live/{}/{}",
        get().public_domain,
        username,
        project_name
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_original_service() {
        std::env::remove_var(env::TUNNEL_BASE_PORT);
        std::env::remove_var(env::TUNNEL_MAX_PORT);
        let config = Config::load();
        assert_eq!(config.tunnel_base_port, 10000);
        assert_eq!(config.tunnel_max_port, 20000);
        assert_eq!(config.max_tunnels_per_user, 5);
    }

    #[test]
    fn malformed_numeric_env_falls_back_to_default() {
        std::env::set_var(env::SSH_PORT, "not-a-number");
        let config = Config::load();
        assert_eq!(config.ssh_port, 2222);
        std::env::remove_var(env::SSH_PORT);
    }
}
