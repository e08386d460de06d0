//! Remote account channel over SSH.
//!
//! [`SshConnector`] authenticates to the configured host with the admin
//! identity and hands out [`SshChannel`]s.  Each [`RemoteCommand`] runs in its
//! own session channel on the shared connection: the argv is rendered with
//! every element single-quoted and sent as the `exec` request, and stdout,
//! stderr and the exit status are collected until the channel closes.
//!
//! The server's host key is checked against the configured
//! [`HostKeyPolicy`](keyrot_core::config::HostKeyPolicy) before
//! authentication; a rejected key aborts the handshake.

pub mod host_key;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use keyrot_core::config::HostConfig;
use keyrot_core::{
    AdminIdentity, ChannelConnector, ChannelError, CommandOutput, RemoteChannel, RemoteCommand,
    RotationError,
};
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg, PublicKey};
use russh::{ChannelMsg, Disconnect, client};
use tracing::{debug, info, warn};

pub use host_key::HostKeyVerifier;

/// Idle connections are dropped by the client after this long.
const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(300);

/// Opens authenticated SSH connections to one host.
pub struct SshConnector {
    hostname: String,
    port: u16,
    admin_user: String,
    connect_timeout: Duration,
    verifier: HostKeyVerifier,
    key: Arc<PrivateKey>,
    config: Arc<client::Config>,
}

impl std::fmt::Debug for SshConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConnector")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("admin_user", &self.admin_user)
            .finish_non_exhaustive()
    }
}

impl SshConnector {
    /// Decode the admin key and prepare the host-key policy.
    ///
    /// The identity is consumed; its buffers are zeroed when dropped here.
    pub fn new(host: &HostConfig, identity: AdminIdentity) -> Result<Self, RotationError> {
        let passphrase = identity.passphrase.as_deref().map(String::as_str);
        let key = russh::keys::decode_secret_key(&identity.private_key, passphrase).map_err(|e| {
            RotationError::SecretRetrieval(format!("admin private key could not be decoded: {e}"))
        })?;
        let verifier = HostKeyVerifier::from_config(host)?;

        let config = client::Config {
            inactivity_timeout: Some(INACTIVITY_TIMEOUT),
            ..Default::default()
        };

        Ok(Self {
            hostname: host.hostname.clone(),
            port: host.port,
            admin_user: host.admin_user.clone(),
            connect_timeout: host.connect_timeout(),
            verifier,
            key: Arc::new(key),
            config: Arc::new(config),
        })
    }

    fn connection_error(&self, reason: impl Into<String>) -> RotationError {
        RotationError::Connection {
            host: self.hostname.clone(),
            reason: reason.into(),
        }
    }

    async fn open(&self) -> Result<SshChannel, RotationError> {
        let rejection = Arc::new(Mutex::new(None));
        let handler = Client {
            verifier: self.verifier.clone(),
            rejection: Arc::clone(&rejection),
        };

        let mut handle = client::connect(
            Arc::clone(&self.config),
            (self.hostname.as_str(), self.port),
            handler,
        )
        .await
        .map_err(|e| {
            let refused = rejection.lock().ok().and_then(|mut slot| slot.take());
            self.connection_error(refused.unwrap_or_else(|| e.to_string()))
        })?;

        let hash_alg = handle
            .best_supported_rsa_hash()
            .await
            .map_err(|e| self.connection_error(e.to_string()))?
            .flatten();
        let auth = handle
            .authenticate_publickey(
                self.admin_user.clone(),
                PrivateKeyWithHashAlg::new(Arc::clone(&self.key), hash_alg),
            )
            .await
            .map_err(|e| self.connection_error(e.to_string()))?;
        if !auth.success() {
            return Err(self.connection_error(format!(
                "public key authentication rejected for {}",
                self.admin_user
            )));
        }

        info!(host = %self.hostname, port = self.port, user = %self.admin_user, "ssh channel authenticated");
        Ok(SshChannel {
            host: self.hostname.clone(),
            handle,
        })
    }
}

#[async_trait::async_trait]
impl ChannelConnector for SshConnector {
    fn host(&self) -> &str {
        &self.hostname
    }

    async fn connect(&self) -> Result<Box<dyn RemoteChannel>, RotationError> {
        match tokio::time::timeout(self.connect_timeout, self.open()).await {
            Ok(channel) => Ok(Box::new(channel?)),
            Err(_) => Err(self.connection_error(format!(
                "no connection within {}s",
                self.connect_timeout.as_secs()
            ))),
        }
    }
}

/// Handshake callbacks.
struct Client {
    verifier: HostKeyVerifier,
    /// Why the host key was refused, for the connection error.
    rejection: Arc<Mutex<Option<String>>>,
}

impl client::Handler for Client {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        match self.verifier.verify(server_public_key) {
            Ok(()) => Ok(true),
            Err(reason) => {
                warn!("{reason}");
                if let Ok(mut slot) = self.rejection.lock() {
                    *slot = Some(reason);
                }
                Ok(false)
            }
        }
    }
}

/// One authenticated connection.  Commands run one at a time.
pub struct SshChannel {
    host: String,
    handle: client::Handle<Client>,
}

/// authorized_keys lines may carry comments in any encoding.  Decoding is
/// lossy but deterministic, so a before and after probe of the same bytes
/// compare equal.
fn decode_output(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn transport(e: russh::Error) -> ChannelError {
    ChannelError::Transport(e.to_string())
}

#[async_trait::async_trait]
impl RemoteChannel for SshChannel {
    async fn execute(&mut self, command: &RemoteCommand) -> Result<CommandOutput, ChannelError> {
        let mut channel = self.handle.channel_open_session().await.map_err(transport)?;
        channel
            .exec(true, command.to_shell_line())
            .await
            .map_err(transport)?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                // ext 1 is SSH_EXTENDED_DATA_STDERR
                ChannelMsg::ExtendedData { ref data, ext: 1 } => stderr.extend_from_slice(data),
                ChannelMsg::ExitStatus { exit_status } => exit_code = Some(exit_status),
                ChannelMsg::ExitSignal { signal_name, .. } => {
                    stderr.extend_from_slice(format!("terminated by signal {signal_name:?}").as_bytes());
                    exit_code.get_or_insert(255);
                }
                _ => {}
            }
        }

        let exit_code = exit_code.ok_or_else(|| {
            ChannelError::Transport("channel closed without an exit status".to_string())
        })?;
        debug!(host = %self.host, exit_code, "remote command finished");
        Ok(CommandOutput {
            stdout: decode_output(&stdout),
            stderr: decode_output(&stderr),
            exit_code,
        })
    }

    async fn close(&mut self) -> Result<(), ChannelError> {
        self.handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
            .map_err(transport)?;
        debug!(host = %self.host, "ssh channel closed");
        Ok(())
    }
}
