//! Host-key policy enforcement.

use std::path::{Path, PathBuf};

use keyrot_core::RotationError;
use keyrot_core::config::{HostConfig, HostKeyPolicy};
use russh::keys::{HashAlg, PublicKey};
use tracing::{info, warn};

/// Decides whether a server key presented during the handshake is trusted.
#[derive(Debug, Clone)]
pub struct HostKeyVerifier {
    host: String,
    port: u16,
    check: Check,
}

#[derive(Debug, Clone)]
enum Check {
    Pinned(Vec<String>),
    KnownHosts(PathBuf),
    TrustOnFirstUse(PathBuf),
}

impl HostKeyVerifier {
    pub fn from_config(host: &HostConfig) -> Result<Self, RotationError> {
        let known_hosts = || match &host.known_hosts_path {
            Some(path) => Ok(path.clone()),
            None => default_known_hosts(),
        };
        let check = match host.host_key_policy {
            HostKeyPolicy::Pinned => Check::Pinned(host.host_key_fingerprints.clone()),
            HostKeyPolicy::KnownHosts => Check::KnownHosts(known_hosts()?),
            HostKeyPolicy::TrustOnFirstUse => Check::TrustOnFirstUse(known_hosts()?),
        };
        Ok(Self {
            host: host.hostname.clone(),
            port: host.port,
            check,
        })
    }

    /// `Err` carries the reason the key was refused.
    pub fn verify(&self, key: &PublicKey) -> Result<(), String> {
        let fingerprint = key.fingerprint(HashAlg::Sha256).to_string();
        match &self.check {
            Check::Pinned(pins) => {
                if pins.iter().any(|p| p.trim() == fingerprint) {
                    Ok(())
                } else {
                    Err(format!("host key {fingerprint} is not pinned"))
                }
            }
            Check::KnownHosts(path) => match self.lookup(key, path) {
                Ok(true) => Ok(()),
                Ok(false) => Err(format!(
                    "host key {fingerprint} not found in {}",
                    path.display()
                )),
                Err(e) => Err(e),
            },
            Check::TrustOnFirstUse(path) => match self.lookup(key, path) {
                Ok(true) => Ok(()),
                Ok(false) => {
                    warn!(
                        host = %self.host,
                        %fingerprint,
                        "trusting previously unseen host key (trust-on-first-use)"
                    );
                    if let Err(e) = russh::keys::known_hosts::learn_known_hosts_path(
                        &self.host, self.port, key, path,
                    ) {
                        warn!(path = %path.display(), "could not record host key: {e}");
                    } else {
                        info!(path = %path.display(), "host key recorded");
                    }
                    Ok(())
                }
                Err(e) => Err(e),
            },
        }
    }

    fn lookup(&self, key: &PublicKey, path: &Path) -> Result<bool, String> {
        if !path.exists() {
            return Ok(false);
        }
        russh::keys::check_known_hosts_path(&self.host, self.port, key, path)
            .map_err(|e| format!("host key for {} rejected by {}: {e}", self.host, path.display()))
    }
}

fn default_known_hosts() -> Result<PathBuf, RotationError> {
    std::env::var_os("HOME")
        .map(|home| PathBuf::from(home).join(".ssh").join("known_hosts"))
        .ok_or_else(|| {
            RotationError::Config(
                "HOME is not set; configure host.known_hosts_path explicitly".to_string(),
            )
        })
}
