//! Remote Shell (C3): an authenticated session to a host, with `exec`,
//! `upload`, and `close`. The [`Shell`] trait is the minimal capability seam
//! called out in the spec's design notes so tests can substitute a local
//! fake instead of opening a real SSH connection.
//!
//! The `russh::client::Handler` below accepts every server host key
//! unconditionally, the same choice the teacher makes in
//! `core::containers::host::HostExposeHandler` — operators here run
//! controlled clusters, not arbitrary internet hosts.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use russh::client::{self, Handle};
use tokio::io::{AsyncWriteExt, copy_bidirectional};
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::model::{ShellCredentials, ShellSecret};

pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        matches!(self.exit_code, Some(0))
    }
}

#[async_trait]
pub trait Shell: Send + Sync {
    async fn exec(&self, cmd: &str) -> Result<ExecOutput, TransportError>;
    async fn upload(&self, local_path: &Path, remote_path: &str) -> Result<(), TransportError>;
    async fn close(&self) -> Result<(), TransportError>;
}

struct AcceptAllKeys;

impl client::Handler for AcceptAllKeys {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// A live SSH session to one host, implementing [`Shell`].
pub struct RemoteShell {
    handle: Handle<AcceptAllKeys>,
}

impl RemoteShell {
    pub async fn connect(credentials: &ShellCredentials) -> Result<Self, TransportError> {
        let config = Arc::new(client::Config::default());
        let addr = (credentials.hostname.as_str(), credentials.port);
        let mut handle = client::connect(config, addr, AcceptAllKeys)
            .await
            .map_err(TransportError::Ssh)?;

        let authenticated = match &credentials.secret {
            ShellSecret::Password(password) => handle
                .authenticate_password(&credentials.username, password)
                .await
                .map_err(TransportError::Ssh)?
                .success(),
            ShellSecret::KeyPath(key_path) => {
                let key_pair = russh::keys::load_secret_key(key_path, None)
                    .map_err(TransportError::Key)?;
                handle
                    .authenticate_publickey(
                        &credentials.username,
                        russh::keys::PrivateKeyWithHashAlg::new(Arc::new(key_pair), None),
                    )
                    .await
                    .map_err(TransportError::Ssh)?
                    .success()
            }
        };

        if !authenticated {
            return Err(TransportError::AuthFailure {
                hostname: credentials.hostname.clone(),
                username: credentials.username.clone(),
            });
        }

        Ok(Self { handle })
    }
}

#[async_trait]
impl Shell for RemoteShell {
    async fn exec(&self, cmd: &str) -> Result<ExecOutput, TransportError> {
        let mut channel = self.handle.channel_open_session().await?;
        channel.exec(true, cmd).await?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = None;

        loop {
            let Some(msg) = channel.wait().await else {
                break;
            };
            match msg {
                russh::ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                russh::ChannelMsg::ExtendedData { ref data, ext: 1 } => {
                    stderr.extend_from_slice(data)
                }
                russh::ChannelMsg::ExitStatus { exit_status } => {
                    exit_code = Some(exit_status as i32)
                }
                russh::ChannelMsg::Eof | russh::ChannelMsg::Close => break,
                _ => {}
            }
        }

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
        })
    }

    async fn upload(&self, local_path: &Path, remote_path: &str) -> Result<(), TransportError> {
        let contents = tokio::fs::read(local_path).await?;
        let mut channel = self.handle.channel_open_session().await?;
        let size = contents.len();
        let remote_name = Path::new(remote_path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(remote_path);
        let remote_dir = Path::new(remote_path)
            .parent()
            .and_then(|p| p.to_str())
            .unwrap_or(".");
        channel
            .exec(true, format!("scp -t {remote_dir}"))
            .await?;
        let mut stream = channel.into_stream();
        stream
            .write_all(format!("C0644 {size} {remote_name}\n").as_bytes())
            .await?;
        stream.write_all(&contents).await?;
        stream.write_all(&[0u8]).await?;
        stream.shutdown().await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        // Idempotent: the handle may already have seen the connection drop.
        // Ends the whole SSH session, not just this clone of the handle —
        // callers must not invoke this while a `TunnelHandle` obtained from
        // `establish_tunnel` on the same `RemoteShell` is still in use.
        let _ = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "English")
            .await;
        Ok(())
    }
}

/// Handle to a live `local_port -> loopback:remote_port` forward (spec
/// §4.5.1). Dropping or cancelling this tears the forward down; the forward
/// itself is a loop of `direct-tcpip` channels opened per accepted local
/// connection, the mirror image of the teacher's `tcpip_forward`-based
/// `HostPortExposure` (which forwards the other direction).
pub struct TunnelHandle {
    pub local_port: u16,
    pub remote_port: u16,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
    handle: Handle<AcceptAllKeys>,
}

impl TunnelHandle {
    /// Stops the forwarding loop, then disconnects the SSH session the
    /// forward ran over. The session is kept alive by this handle's own
    /// clone of [`RemoteShell`]'s connection, independent of whatever the
    /// `RemoteShell` that created the tunnel does with its own handle, so a
    /// tunnel outlives the deploy call that set it up.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.task.await;
        let _ = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "English")
            .await;
    }
}

impl RemoteShell {
    /// Establishes the forward and returns once the local listener is bound
    /// — the forward itself runs in a background task until
    /// [`TunnelHandle::shutdown`] is called.
    pub async fn establish_tunnel(
        &self,
        local_port: u16,
        remote_port: u16,
    ) -> Result<TunnelHandle, TransportError> {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", local_port)).await?;
        let cancel = CancellationToken::new();
        let handle = self.handle.clone();
        let task_cancel = cancel.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    accepted = listener.accept() => {
                        let Ok((local_stream, _peer)) = accepted else { continue };
                        let handle = handle.clone();
                        let forward_cancel = task_cancel.clone();
                        tokio::spawn(async move {
                            let channel = match handle
                                .channel_open_direct_tcpip("127.0.0.1", remote_port as u32, "127.0.0.1", 0)
                                .await
                            {
                                Ok(c) => c,
                                Err(e) => {
                                    log::warn!("tunnel: failed to open forwarding channel: {e}");
                                    return;
                                }
                            };
                            let mut remote_stream = channel.into_stream();
                            let mut local_stream = local_stream;
                            tokio::select! {
                                _ = forward_cancel.cancelled() => {}
                                result = copy_bidirectional(&mut local_stream, &mut remote_stream) => {
                                    if let Err(e) = result {
                                        log::debug!("tunnel: connection closed: {e}");
                                    }
                                }
                            }
                        });
                    }
                }
            }
        });

        Ok(TunnelHandle {
            local_port,
            remote_port,
            cancel,
            task,
            handle: self.handle.clone(),
        })
    }
}

/// A local no-op shell used by [`crate::profiler`] when profiling the
/// operator's own host instead of a remote one.
pub struct LocalShell;

#[async_trait]
impl Shell for LocalShell {
    async fn exec(&self, cmd: &str) -> Result<ExecOutput, TransportError> {
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .output()
            .await?;
        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
        })
    }

    async fn upload(&self, local_path: &Path, remote_path: &str) -> Result<(), TransportError> {
        tokio::fs::copy(local_path, remote_path).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}
