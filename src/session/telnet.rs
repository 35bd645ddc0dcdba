//! Telnet transport with a scripted login and in-band canary framing.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{self, Instant};
use tracing::debug;

use super::canary::{clean_line, new_token};
use super::{not_connected, CommandOutput, Session, SessionState};
use crate::error::{Result, StarescError};
use crate::target::ConnectionString;

const IAC: u8 = 255;
const DONT: u8 = 254;
const DO: u8 = 253;
const WONT: u8 = 252;
const WILL: u8 = 251;
const SB: u8 = 250;
const SE: u8 = 240;

/// Strips Telnet negotiation from the byte stream and refuses every option,
/// leaving the connection in plain NVT mode.
#[derive(Debug, Default)]
struct Negotiator {
    state: IacState,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum IacState {
    #[default]
    Data,
    Iac,
    Option(u8),
    Sub,
    SubIac,
}

impl Negotiator {
    /// Append payload bytes of `input` to `data`, and refusals to `reply`.
    fn process(&mut self, input: &[u8], data: &mut Vec<u8>, reply: &mut Vec<u8>) {
        for &b in input {
            self.state = match (self.state, b) {
                (IacState::Data, IAC) => IacState::Iac,
                (IacState::Data, _) => {
                    data.push(b);
                    IacState::Data
                }
                (IacState::Iac, IAC) => {
                    data.push(IAC);
                    IacState::Data
                }
                (IacState::Iac, DO | DONT | WILL | WONT) => IacState::Option(b),
                (IacState::Iac, SB) => IacState::Sub,
                (IacState::Iac, _) => IacState::Data,
                (IacState::Option(verb), opt) => {
                    match verb {
                        DO => reply.extend_from_slice(&[IAC, WONT, opt]),
                        WILL => reply.extend_from_slice(&[IAC, DONT, opt]),
                        _ => {}
                    }
                    IacState::Data
                }
                (IacState::Sub, IAC) => IacState::SubIac,
                (IacState::Sub, _) => IacState::Sub,
                (IacState::SubIac, SE) => IacState::Data,
                (IacState::SubIac, _) => IacState::Sub,
            };
        }
    }
}

/// A logged-in Telnet shell over any byte stream.
pub struct TelnetConn<S> {
    stream: S,
    buf: Vec<u8>,
    negotiator: Negotiator,
    poisoned: bool,
}

impl<S> TelnetConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buf: Vec::new(),
            negotiator: Negotiator::default(),
            poisoned: false,
        }
    }

    /// False once a command failed mid-read; leftover output would be
    /// attributed to the next command.
    pub fn is_usable(&self) -> bool {
        !self.poisoned
    }

    async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.write_all(b"\n").await?;
        self.stream.flush().await
    }

    /// Read until `needle` shows up and return everything up to and
    /// including it. `Ok(None)` means the deadline passed first.
    async fn read_until(&mut self, needle: &[u8], deadline: Instant) -> Result<Option<Vec<u8>>> {
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(pos) = find(&self.buf, needle) {
                let rest = self.buf.split_off(pos + needle.len());
                return Ok(Some(std::mem::replace(&mut self.buf, rest)));
            }
            let n = match time::timeout_at(deadline, self.stream.read(&mut chunk)).await {
                Ok(read) => read?,
                Err(_) => return Ok(None),
            };
            if n == 0 {
                return Err(StarescError::ConnectionLost(
                    "telnet peer closed the connection".into(),
                ));
            }
            let mut reply = Vec::new();
            self.negotiator
                .process(&chunk[..n], &mut self.buf, &mut reply);
            if !reply.is_empty() {
                self.stream.write_all(&reply).await?;
            }
        }
    }

    /// Answer the `login:` and `Password:` prompts, then confirm the shell
    /// responds to a canary.
    pub async fn login(&mut self, username: &str, password: &str, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let prompt_failure = |what: &str| StarescError::Connection(format!("no {what} prompt"));

        if self.read_until(b"login:", deadline).await?.is_none() {
            return Err(prompt_failure("login"));
        }
        self.write_line(username).await?;
        if self.read_until(b"Password:", deadline).await?.is_none() {
            return Err(prompt_failure("password"));
        }
        self.write_line(password).await?;

        let token = new_token();
        let needle = format!("\r\n{token}\r\n");
        let denied = || StarescError::Authentication(format!("login refused for {username}"));
        self.write_line(&format!("echo {token}"))
            .await
            .map_err(|_| denied())?;
        match self.read_until(needle.as_bytes(), deadline).await {
            Ok(Some(_)) => Ok(()),
            Ok(None) | Err(StarescError::ConnectionLost(_)) => Err(denied()),
            Err(e) => Err(e),
        }
    }

    /// Run `cmd; echo <token>` and return the text printed before the token.
    pub async fn run(&mut self, cmd: &str, timeout: Duration) -> Result<String> {
        if self.poisoned {
            return Err(StarescError::ConnectionLost(
                "telnet shell lost framing after an earlier failure".into(),
            ));
        }
        let result = self.exchange(cmd, timeout).await;
        if result.is_err() {
            self.poisoned = true;
        }
        result
    }

    async fn exchange(&mut self, cmd: &str, timeout: Duration) -> Result<String> {
        let deadline = Instant::now() + timeout;
        let token = new_token();
        let needle = format!("\r\n{token}\r\n");

        self.write_line(&format!("{cmd}; echo {token}")).await?;
        let Some(raw) = self.read_until(needle.as_bytes(), deadline).await? else {
            return Err(StarescError::CommandTimeout(cmd.to_string()));
        };

        let text = String::from_utf8_lossy(&raw[..raw.len() - needle.len()]).to_string();
        Ok(extract_output(&text, &token))
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// `text` ends right before the final token line; the typed line (which also
/// carries the token) is echoed first, so output starts after its last
/// occurrence.
fn extract_output(text: &str, token: &str) -> String {
    let body = match text.rfind(token) {
        Some(i) => &text[i + token.len()..],
        None => text,
    };
    let body = body.trim_start_matches([' ', '\t']);
    let body = body.strip_prefix("\r\n").unwrap_or(body);
    body.split('\n')
        .map(clean_line)
        .collect::<Vec<_>>()
        .join("\n")
        .trim_end()
        .to_string()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

pub struct TelnetSession {
    target: ConnectionString,
    conn: Option<TelnetConn<TcpStream>>,
    state: SessionState,
}

impl TelnetSession {
    pub fn new(target: ConnectionString) -> Self {
        Self {
            target,
            conn: None,
            state: SessionState::Unconnected,
        }
    }
}

#[async_trait]
impl Session for TelnetSession {
    fn target(&self) -> &ConnectionString {
        &self.target
    }

    fn state(&self) -> SessionState {
        self.state
    }

    async fn connect(&mut self, timeout: Duration) -> Result<()> {
        let addr = self.target.addr();
        let stream = match time::timeout(timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(StarescError::Connection(format!("{addr}: {e}"))),
            Err(_) => {
                return Err(StarescError::Connection(format!(
                    "{addr}: connect timed out"
                )))
            }
        };

        let mut conn = TelnetConn::new(stream);
        conn.login(&self.target.username, self.target.secret.as_str(), timeout)
            .await
            .map_err(|e| match e {
                StarescError::Connection(why) | StarescError::ConnectionLost(why) => {
                    StarescError::Connection(format!("{addr}: {why}"))
                }
                StarescError::Io(e) => StarescError::Connection(format!("{addr}: {e}")),
                other => other,
            })?;
        self.conn = Some(conn);
        self.state = SessionState::Connected;
        debug!(host = %self.target, "telnet login succeeded");
        Ok(())
    }

    async fn run(&mut self, cmd: &str, timeout: Duration) -> Result<CommandOutput> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| not_connected(&self.target))?;
        let stdout = conn.run(cmd, timeout).await?;
        Ok(CommandOutput {
            stdin: cmd.to_string(),
            stdout,
            stderr: String::new(),
        })
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut conn) = self.conn.take() {
            if let Err(e) = conn.shutdown().await {
                debug!(host = %self.target, error = %e, "telnet shutdown failed");
            }
        }
        self.state = SessionState::Closed;
        Ok(())
    }

    fn is_reusable(&self) -> bool {
        self.state == SessionState::Connected
            && self.conn.as_ref().is_some_and(TelnetConn::is_usable)
    }
}
