//! SSH restricted to a single interactive shell per connection.
//!
//! Some hardened hosts refuse a second channel on an authenticated
//! connection, so every command is typed into the same shell and its output
//! is delimited with a canary token.

use std::time::Duration;

use async_trait::async_trait;
use russh::client::{Handle, Msg};
use russh::{Channel, ChannelMsg};
use tokio::time::{self, Instant};
use tracing::{debug, warn};

use super::canary::{new_token, LineFramer};
use super::ssh::{disconnect, open_authenticated, AcceptAnyHostKey};
use super::{not_connected, CommandOutput, Session, SessionState};
use crate::error::{Result, StarescError};
use crate::target::ConnectionString;

/// Byte pipe to an interactive shell.
#[async_trait]
pub trait ShellIo: Send {
    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Next chunk of output, `None` once the remote side closed the shell.
    async fn recv(&mut self) -> Result<Option<Vec<u8>>>;

    async fn shutdown(&mut self) -> Result<()>;
}

/// Canary-framed command execution over any [`ShellIo`].
pub struct SharedShell<T> {
    io: T,
    poisoned: bool,
}

impl<T: ShellIo> SharedShell<T> {
    pub fn new(io: T) -> Self {
        Self {
            io,
            poisoned: false,
        }
    }

    /// False after a timeout or a transport failure: the stream position is
    /// no longer known, so later output could belong to an earlier command.
    pub fn is_usable(&self) -> bool {
        !self.poisoned
    }

    /// Returns the command's stdout. stderr is merged by the remote pty.
    pub async fn run(&mut self, cmd: &str, timeout: Duration) -> Result<String> {
        if self.poisoned {
            return Err(StarescError::ConnectionLost(
                "shared shell lost framing after an earlier failure".into(),
            ));
        }
        let deadline = Instant::now() + timeout;
        let result = self.exchange(cmd, deadline).await;
        if result.is_err() {
            self.poisoned = true;
        }
        result
    }

    async fn exchange(&mut self, cmd: &str, deadline: Instant) -> Result<String> {
        let token = new_token();
        let mut framer = LineFramer::new(cmd, &token);
        let request = format!("{cmd}\necho {token}\n");

        match time::timeout_at(deadline, self.io.send(request.as_bytes())).await {
            Ok(sent) => sent?,
            Err(_) => return Err(StarescError::CommandTimeout(cmd.to_string())),
        }

        while !framer.is_done() {
            let chunk = match time::timeout_at(deadline, self.io.recv()).await {
                Ok(chunk) => chunk?,
                Err(_) => return Err(StarescError::CommandTimeout(cmd.to_string())),
            };
            match chunk {
                Some(bytes) => {
                    framer.feed(&bytes);
                }
                None => {
                    return Err(StarescError::ConnectionLost(format!(
                        "shell closed while running `{cmd}`"
                    )))
                }
            }
        }
        Ok(framer.finish())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.io.shutdown().await
    }
}

/// [`ShellIo`] over a russh session channel with a pty and a shell.
pub struct RusshShell {
    channel: Channel<Msg>,
}

impl RusshShell {
    async fn open(handle: &Handle<AcceptAnyHostKey>) -> std::result::Result<Self, russh::Error> {
        let mut channel = handle.channel_open_session().await?;
        channel
            .request_pty(false, "vt100", 200, 24, 0, 0, &[])
            .await?;
        channel.request_shell(false).await?;
        Ok(Self { channel })
    }
}

#[async_trait]
impl ShellIo for RusshShell {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        self.channel
            .data(data)
            .await
            .map_err(|e| StarescError::ConnectionLost(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            match self.channel.wait().await {
                Some(ChannelMsg::Data { ref data }) => return Ok(Some(data.to_vec())),
                Some(ChannelMsg::ExtendedData { ref data, .. }) => return Ok(Some(data.to_vec())),
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => return Ok(None),
                Some(_) => continue,
            }
        }
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.channel
            .eof()
            .await
            .map_err(|e| StarescError::ConnectionLost(e.to_string()))
    }
}

pub struct SshSsSession {
    target: ConnectionString,
    handle: Option<Handle<AcceptAnyHostKey>>,
    shell: Option<SharedShell<RusshShell>>,
    state: SessionState,
}

impl SshSsSession {
    pub fn new(target: ConnectionString) -> Self {
        Self {
            target,
            handle: None,
            shell: None,
            state: SessionState::Unconnected,
        }
    }
}

#[async_trait]
impl Session for SshSsSession {
    fn target(&self) -> &ConnectionString {
        &self.target
    }

    fn state(&self) -> SessionState {
        self.state
    }

    async fn connect(&mut self, timeout: Duration) -> Result<()> {
        let handle = open_authenticated(&self.target, timeout).await?;
        let shell = match time::timeout(timeout, RusshShell::open(&handle)).await {
            Ok(Ok(shell)) => shell,
            Ok(Err(e)) => {
                disconnect(&handle).await;
                return Err(StarescError::Connection(format!(
                    "{}: cannot open shell: {e}",
                    self.target.addr()
                )));
            }
            Err(_) => {
                disconnect(&handle).await;
                return Err(StarescError::Connection(format!(
                    "{}: shell request timed out",
                    self.target.addr()
                )));
            }
        };
        self.handle = Some(handle);
        self.shell = Some(SharedShell::new(shell));
        self.state = SessionState::Connected;
        debug!(host = %self.target, "single-session shell established");
        Ok(())
    }

    async fn run(&mut self, cmd: &str, timeout: Duration) -> Result<CommandOutput> {
        let shell = self
            .shell
            .as_mut()
            .ok_or_else(|| not_connected(&self.target))?;
        let stdout = shell.run(cmd, timeout).await?;
        Ok(CommandOutput {
            stdin: cmd.to_string(),
            stdout,
            stderr: String::new(),
        })
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut shell) = self.shell.take() {
            if let Err(e) = shell.shutdown().await {
                warn!(host = %self.target, error = %e, "closing shell failed");
            }
        }
        if let Some(handle) = self.handle.take() {
            disconnect(&handle).await;
        }
        self.state = SessionState::Closed;
        Ok(())
    }

    fn is_reusable(&self) -> bool {
        self.state == SessionState::Connected
            && self.shell.as_ref().is_some_and(SharedShell::is_usable)
    }
}
