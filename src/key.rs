//! SSH host key management.

use log::info;
use russh_keys::HashAlg;
use std::path::Path;

use crate::error::TunnelError;

/// Load the host key from `path`, or generate a new Ed25519 key and
/// persist it there. I/O failure here is fatal at startup.
pub fn load_or_generate_host_key(path: &str) -> Result<russh_keys::PrivateKey, TunnelError> {
    use russh_keys::Algorithm;
    use std::fs;

    let key_path = Path::new(path);

    if key_path.exists() {
        info!("loading SSH host key from {}", path);
        let key_data = fs::read_to_string(key_path)?;
        let key = russh_keys::PrivateKey::from_openssh(&key_data).map_err(std::io::Error::other)?;
        info!(
            "host key fingerprint: {}",
            key.public_key().fingerprint(HashAlg::Sha256)
        );
        Ok(key)
    } else {
        info!("generating new Ed25519 SSH host key at {}", path);
        let key = russh_keys::PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519)
            .map_err(std::io::Error::other)?;

        let key_data = key
            .to_openssh(russh_keys::ssh_key::LineEnding::LF)
            .map_err(std::io::Error::other)?;
        fs::write(key_path, key_data.as_bytes())?;
        info!(
            "host key fingerprint: {}",
            key.public_key().fingerprint(HashAlg::Sha256)
        );

        Ok(key)
    }
}
