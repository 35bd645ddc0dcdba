//! SSH with one exec channel per command.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect};
use russh_keys::key;
use russh_sftp::client::SftpSession;
use tokio::{fs, io, time};
use tracing::debug;

use super::{decode_stream, not_connected, CommandOutput, Session, SessionState};
use crate::error::{Result, StarescError};
use crate::target::{ConnectionString, Secret};

/// Interval between keepalive probes once authenticated.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Host keys are not verified: targets are scanned by address and are often
/// freshly provisioned or rebuilt.
pub(crate) struct AcceptAnyHostKey;

#[async_trait]
impl client::Handler for AcceptAnyHostKey {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Connect, negotiate and authenticate with the credentials of `target`.
pub(crate) async fn open_authenticated(
    target: &ConnectionString,
    timeout: Duration,
) -> Result<Handle<AcceptAnyHostKey>> {
    let config = Arc::new(client::Config {
        keepalive_interval: Some(KEEPALIVE_INTERVAL),
        keepalive_max: 3,
        ..Default::default()
    });

    let addr = (target.host.as_str(), target.port);
    let connect = client::connect(config, addr, AcceptAnyHostKey);
    let mut handle = match time::timeout(timeout, connect).await {
        Ok(Ok(handle)) => handle,
        Ok(Err(e)) => {
            return Err(StarescError::Connection(format!("{}: {e}", target.addr())));
        }
        Err(_) => {
            return Err(StarescError::Connection(format!(
                "{}: connect timed out after {}s",
                target.addr(),
                timeout.as_secs_f32()
            )));
        }
    };

    let auth = match &target.secret {
        Secret::Password(password) => {
            time::timeout(
                timeout,
                handle.authenticate_password(target.username.as_str(), password.as_str()),
            )
            .await
        }
        Secret::KeyFile(path) => {
            let key_pair = russh_keys::load_secret_key(path, None).map_err(|e| {
                StarescError::Authentication(format!("cannot load private key {path}: {e}"))
            })?;
            time::timeout(
                timeout,
                handle.authenticate_publickey(target.username.as_str(), Arc::new(key_pair)),
            )
            .await
        }
    };

    match auth {
        Ok(Ok(true)) => Ok(handle),
        Ok(Ok(false)) => Err(StarescError::Authentication(format!(
            "{} rejected credentials for {}",
            target.addr(),
            target.username
        ))),
        Ok(Err(e)) => Err(StarescError::Connection(format!("{}: {e}", target.addr()))),
        Err(_) => Err(StarescError::Connection(format!(
            "{}: authentication timed out",
            target.addr()
        ))),
    }
}

pub(crate) async fn disconnect(handle: &Handle<AcceptAnyHostKey>) {
    if let Err(e) = handle
        .disconnect(Disconnect::ByApplication, "", "English")
        .await
    {
        debug!(error = %e, "ssh disconnect failed");
    }
}

/// Every `run` opens a fresh channel and reads until it closes, so the end
/// of output needs no framing.
pub struct SshSession {
    target: ConnectionString,
    handle: Option<Handle<AcceptAnyHostKey>>,
    sftp: Option<SftpSession>,
    tty: bool,
    state: SessionState,
}

impl SshSession {
    pub fn new(target: ConnectionString) -> Self {
        Self {
            target,
            handle: None,
            sftp: None,
            tty: false,
            state: SessionState::Unconnected,
        }
    }

    /// The SFTP subsystem is only started on the first transfer, so hosts
    /// without an sftp-server still run plain commands.
    async fn sftp(&mut self) -> Result<&SftpSession> {
        if self.sftp.is_none() {
            let handle = self
                .handle
                .as_ref()
                .ok_or_else(|| not_connected(&self.target))?;
            let channel = handle
                .channel_open_session()
                .await
                .map_err(|e| self.transfer_error("sftp channel", e))?;
            channel
                .request_subsystem(true, "sftp")
                .await
                .map_err(|e| self.transfer_error("sftp subsystem", e))?;
            let sftp = SftpSession::new(channel.into_stream())
                .await
                .map_err(|e| self.transfer_error("sftp handshake", e))?;
            debug!(host = %self.target, "sftp subsystem started");
            self.sftp = Some(sftp);
        }
        match &self.sftp {
            Some(sftp) => Ok(sftp),
            None => Err(not_connected(&self.target)),
        }
    }

    fn transfer_error(&self, what: &str, e: impl std::fmt::Display) -> StarescError {
        StarescError::FileTransfer(format!("{}: {what}: {e}", self.target.addr()))
    }
}

#[async_trait]
impl Session for SshSession {
    fn target(&self) -> &ConnectionString {
        &self.target
    }

    fn state(&self) -> SessionState {
        self.state
    }

    async fn connect(&mut self, timeout: Duration) -> Result<()> {
        let handle = open_authenticated(&self.target, timeout).await?;
        self.handle = Some(handle);
        self.state = SessionState::Connected;
        debug!(host = %self.target, "ssh session established");
        Ok(())
    }

    async fn run(&mut self, cmd: &str, timeout: Duration) -> Result<CommandOutput> {
        let handle = self
            .handle
            .as_ref()
            .ok_or_else(|| not_connected(&self.target))?;

        let tty = self.tty;
        let exec = async {
            let mut channel = handle.channel_open_session().await?;
            if tty {
                channel
                    .request_pty(false, "vt100", 200, 24, 0, 0, &[])
                    .await?;
            }
            channel.exec(true, cmd).await?;

            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            // `wait` yields None once the channel is closed on both ends.
            while let Some(msg) = channel.wait().await {
                match msg {
                    ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                    ChannelMsg::ExtendedData { ref data, ext } if ext == 1 => {
                        stderr.extend_from_slice(data)
                    }
                    _ => {}
                }
            }
            Ok::<_, russh::Error>((stdout, stderr))
        };

        match time::timeout(timeout, exec).await {
            Ok(Ok((stdout, stderr))) => Ok(CommandOutput {
                stdin: cmd.to_string(),
                stdout: decode_stream(&stdout),
                stderr: decode_stream(&stderr),
            }),
            Ok(Err(e)) => Err(StarescError::ConnectionLost(format!(
                "{} while running `{cmd}`: {e}",
                self.target.addr()
            ))),
            Err(_) => Err(StarescError::CommandTimeout(cmd.to_string())),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.sftp = None;
        if let Some(handle) = self.handle.take() {
            disconnect(&handle).await;
        }
        self.state = SessionState::Closed;
        Ok(())
    }

    fn set_tty(&mut self, enabled: bool) {
        self.tty = enabled;
    }

    async fn push(&mut self, local: &Path, remote: &str) -> Result<()> {
        let mut src = fs::File::open(local).await?;
        let sftp = self.sftp().await?;
        let mut dst = sftp.create(remote).await.map_err(|e| {
            StarescError::FileTransfer(format!("cannot create {remote}: {e}"))
        })?;
        io::copy(&mut src, &mut dst).await?;
        io::AsyncWriteExt::shutdown(&mut dst).await?;
        Ok(())
    }

    async fn pull(&mut self, remote: &str, local: &Path) -> Result<()> {
        let sftp = self.sftp().await?;
        let mut src = sftp.open(remote).await.map_err(|e| {
            StarescError::FileTransfer(format!("cannot open {remote}: {e}"))
        })?;
        let mut dst = fs::File::create(local).await?;
        io::copy(&mut src, &mut dst).await?;
        io::AsyncWriteExt::flush(&mut dst).await?;
        Ok(())
    }
}
