//! Remote command execution over SSH and Telnet.
//!
//! A [`Session`] owns one live transport. Which implementation backs a target
//! is decided by the connection string scheme through [`SCHEMES`].

pub mod canary;
pub mod ssh;
pub mod sshss;
pub mod telnet;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::{Result, StarescError};
use crate::target::ConnectionString;

pub use ssh::SshSession;
pub use sshss::{SharedShell, ShellIo, SshSsSession};
pub use telnet::{TelnetConn, TelnetSession};

/// What one command produced on the target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommandOutput {
    pub stdin: String,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unconnected,
    Connected,
    Closed,
}

/// One authenticated remote shell.
///
/// Sessions are owned by a single worker and never shared between tasks;
/// commands on one session run strictly one after another.
#[async_trait]
pub trait Session: Send {
    fn target(&self) -> &ConnectionString;

    fn state(&self) -> SessionState;

    /// Connect and authenticate. Fails with `Connection` or `Authentication`.
    async fn connect(&mut self, timeout: Duration) -> Result<()>;

    /// Run one command. A deadline overrun is reported as `CommandTimeout`.
    async fn run(&mut self, cmd: &str, timeout: Duration) -> Result<CommandOutput>;

    async fn close(&mut self) -> Result<()>;

    /// False once the transport can no longer frame command output reliably
    /// (a shared shell after a timeout). The owner should reconnect.
    fn is_reusable(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Ask for a pty on later commands. Transports that always or never
    /// have one ignore this.
    fn set_tty(&mut self, _enabled: bool) {}

    /// Copy the local file `local` to `remote` on the target.
    async fn push(&mut self, _local: &Path, remote: &str) -> Result<()> {
        Err(no_file_transfer(self.target(), remote))
    }

    /// Copy `remote` from the target into the local file `local`.
    async fn pull(&mut self, remote: &str, _local: &Path) -> Result<()> {
        Err(no_file_transfer(self.target(), remote))
    }
}

fn no_file_transfer(target: &ConnectionString, remote: &str) -> StarescError {
    StarescError::FileTransfer(format!(
        "{remote}: {} sessions cannot transfer files",
        target.scheme
    ))
}

pub type SessionConstructor = fn(ConnectionString) -> Box<dyn Session>;

/// Scheme to transport table.
pub const SCHEMES: &[(&str, SessionConstructor)] = &[
    ("ssh", new_ssh),
    ("sshss", new_sshss),
    ("telnet", new_telnet),
];

fn new_ssh(target: ConnectionString) -> Box<dyn Session> {
    Box::new(SshSession::new(target))
}

fn new_sshss(target: ConnectionString) -> Box<dyn Session> {
    Box::new(SshSsSession::new(target))
}

fn new_telnet(target: ConnectionString) -> Box<dyn Session> {
    Box::new(TelnetSession::new(target))
}

/// Build an unconnected session for `target` from its scheme.
pub fn open_session(target: ConnectionString) -> Result<Box<dyn Session>> {
    match SCHEMES.iter().find(|(scheme, _)| *scheme == target.scheme) {
        Some((_, ctor)) => Ok(ctor(target)),
        None => Err(StarescError::UnsupportedScheme {
            scheme: target.scheme.clone(),
            supported: supported_schemes(),
        }),
    }
}

pub fn supported_schemes() -> String {
    SCHEMES
        .iter()
        .map(|(s, _)| *s)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Seam used by the scanner to obtain sessions; tests swap in scripted ones.
pub trait SessionFactory: Send + Sync + 'static {
    fn create(&self, target: &ConnectionString) -> Result<Box<dyn Session>>;
}

/// Default factory backed by [`SCHEMES`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemeTable;

impl SessionFactory for SchemeTable {
    fn create(&self, target: &ConnectionString) -> Result<Box<dyn Session>> {
        open_session(target.clone())
    }
}

pub(crate) fn not_connected(target: &ConnectionString) -> StarescError {
    StarescError::Connection(format!("{target}: session is not connected"))
}

/// Lossy decode and drop trailing line breaks.
pub(crate) fn decode_stream(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches(['\r', '\n'])
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_table_dispatch() {
        for (scheme, _) in SCHEMES {
            let cs = ConnectionString::parse(&format!("{scheme}://u:p@h:22")).unwrap();
            let session = open_session(cs).unwrap();
            assert_eq!(session.target().scheme, *scheme);
            assert_eq!(session.state(), SessionState::Unconnected);
            assert!(!session.is_reusable());
        }
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        let cs = ConnectionString::parse("rdp://u:p@h:3389").unwrap();
        let err = open_session(cs).err().unwrap();
        assert!(matches!(err, StarescError::UnsupportedScheme { .. }));
        assert!(err.to_string().contains("sshss"));
    }

    #[tokio::test]
    async fn shells_without_sftp_refuse_transfers() {
        let cs = ConnectionString::parse("telnet://u:p@h:23").unwrap();
        let mut session = open_session(cs).unwrap();
        let err = session
            .push(Path::new("tool.sh"), "/tmp/tool.sh")
            .await
            .unwrap_err();
        assert!(matches!(err, StarescError::FileTransfer(_)));
        assert!(err.to_string().contains("telnet"));
    }

    #[test]
    fn decode_trims_line_breaks_only() {
        assert_eq!(decode_stream(b"  a b\r\n\r\n"), "  a b");
        assert_eq!(decode_stream(b""), "");
    }
}
