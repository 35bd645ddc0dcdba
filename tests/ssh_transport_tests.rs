//! The SSH transports against an in-process russh server on 127.0.0.1.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::server::{self, Auth, Msg, Server as _, Session as ServerSession};
use russh::{Channel, ChannelId, CryptoVec};
use staresc::session::{Session, SshSession, SshSsSession};
use staresc::{ConnectionString, StarescError};
use tokio::net::TcpListener;

const CONNECT: Duration = Duration::from_secs(5);
const SHORT: Duration = Duration::from_millis(300);

/// Accepts `user` / `pass` only.
///
/// Exec channels: `whoami` answers on stdout and stderr, `sleep forever`
/// never answers, anything else fails.
///
/// The shell behaves like bash on a pty: typed input is echoed at once,
/// then each line is redrawn after a prompt before its output.
#[derive(Default)]
struct TestHost {
    typed: Vec<u8>,
    hung: bool,
}

struct TestServer;

impl server::Server for TestServer {
    type Handler = TestHost;

    fn new_client(&mut self, _peer: Option<SocketAddr>) -> TestHost {
        TestHost::default()
    }
}

fn shell_output(line: &str) -> String {
    if line == "whoami" {
        return "user\r\n".to_string();
    }
    match line.strip_prefix("echo ") {
        Some(rest) => format!("{rest}\r\n"),
        None => format!("sh: {line}: not found\r\n"),
    }
}

#[async_trait]
impl server::Handler for TestHost {
    type Error = russh::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if user == "user" && password == "pass" {
            Ok(Auth::Accept)
        } else {
            Ok(Auth::Reject {
                proceed_with_methods: None,
            })
        }
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut ServerSession,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut ServerSession,
    ) -> Result<(), Self::Error> {
        match data {
            b"sleep forever" => return Ok(()),
            b"whoami" => {
                session.data(channel, CryptoVec::from_slice(b"user\n"));
                session.extended_data(channel, 1, CryptoVec::from_slice(b"warning: test host\n"));
                session.exit_status_request(channel, 0);
            }
            other => {
                let msg = format!("sh: {}: not found\n", String::from_utf8_lossy(other));
                session.extended_data(channel, 1, CryptoVec::from(msg));
                session.exit_status_request(channel, 127);
            }
        }
        session.eof(channel);
        session.close(channel);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut ServerSession,
    ) -> Result<(), Self::Error> {
        session.data(channel, CryptoVec::from_slice(b"Welcome to the test host\r\n$ "));
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut ServerSession,
    ) -> Result<(), Self::Error> {
        if self.hung {
            return Ok(());
        }
        let echo = String::from_utf8_lossy(data).replace('\n', "\r\n");
        session.data(channel, CryptoVec::from(echo));

        self.typed.extend_from_slice(data);
        while let Some(pos) = self.typed.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.typed.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..pos]).to_string();
            if line == "sleep forever" {
                self.hung = true;
                return Ok(());
            }
            let reply = format!("$ {line}\r\n{}", shell_output(&line));
            session.data(channel, CryptoVec::from(reply));
        }
        Ok(())
    }
}

async fn start_host() -> u16 {
    let config = Arc::new(server::Config {
        keys: vec![russh_keys::key::KeyPair::generate_ed25519().unwrap()],
        auth_rejection_time: Duration::from_millis(10),
        auth_rejection_time_initial: Some(Duration::ZERO),
        inactivity_timeout: Some(Duration::from_secs(30)),
        ..Default::default()
    });
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut server = TestServer;
        let _ = server.run_on_socket(config, &listener).await;
    });
    port
}

fn target(scheme: &str, password: &str, port: u16) -> ConnectionString {
    ConnectionString::parse(&format!("{scheme}://user:{password}@127.0.0.1:{port}")).unwrap()
}

#[tokio::test]
async fn wrong_password_is_an_authentication_error() {
    let port = start_host().await;
    for scheme in ["ssh", "sshss"] {
        let mut session: Box<dyn Session> = match scheme {
            "ssh" => Box::new(SshSession::new(target(scheme, "nope", port))),
            _ => Box::new(SshSsSession::new(target(scheme, "nope", port))),
        };
        let err = session.connect(CONNECT).await.unwrap_err();
        assert!(matches!(err, StarescError::Authentication(_)), "{scheme}: {err}");
        assert!(!err.to_string().contains("nope"));
    }
}

#[tokio::test]
async fn closed_port_is_a_connection_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let mut session = SshSession::new(target("ssh", "pass", port));
    let err = session.connect(CONNECT).await.unwrap_err();
    assert!(matches!(err, StarescError::Connection(_)), "{err}");
}

#[tokio::test]
async fn exec_channel_splits_stdout_and_stderr() {
    let port = start_host().await;
    let mut session = SshSession::new(target("ssh", "pass", port));
    session.connect(CONNECT).await.unwrap();

    let out = session.run("whoami", CONNECT).await.unwrap();
    assert_eq!(out.stdin, "whoami");
    assert_eq!(out.stdout, "user");
    assert_eq!(out.stderr, "warning: test host");

    let out = session.run("lsb_release -d", CONNECT).await.unwrap();
    assert_eq!(out.stdout, "");
    assert_eq!(out.stderr, "sh: lsb_release -d: not found");
    session.close().await.unwrap();
}

#[tokio::test]
async fn hanging_exec_times_out_without_losing_the_connection() {
    let port = start_host().await;
    let mut session = SshSession::new(target("ssh", "pass", port));
    session.connect(CONNECT).await.unwrap();

    let err = session.run("sleep forever", SHORT).await.unwrap_err();
    assert!(matches!(err, StarescError::CommandTimeout(ref c) if c == "sleep forever"));
    assert!(session.is_reusable());

    let out = session.run("whoami", CONNECT).await.unwrap();
    assert_eq!(out.stdout, "user");
    session.close().await.unwrap();
}

#[tokio::test]
async fn shared_shell_frames_pty_output() {
    let port = start_host().await;
    let mut session = SshSsSession::new(target("sshss", "pass", port));
    session.connect(CONNECT).await.unwrap();

    let out = session.run("whoami", CONNECT).await.unwrap();
    assert_eq!(out.stdout, "user");
    assert_eq!(out.stderr, "");

    let out = session.run("echo hello world", CONNECT).await.unwrap();
    assert_eq!(out.stdout, "hello world");

    let out = session.run("sudo -V", CONNECT).await.unwrap();
    assert_eq!(out.stdout, "sh: sudo -V: not found");
    assert!(session.is_reusable());
    session.close().await.unwrap();
}

#[tokio::test]
async fn shared_shell_timeout_needs_a_reconnect() {
    let port = start_host().await;
    let mut session = SshSsSession::new(target("sshss", "pass", port));
    session.connect(CONNECT).await.unwrap();

    let err = session.run("sleep forever", SHORT).await.unwrap_err();
    assert!(matches!(err, StarescError::CommandTimeout(_)));
    assert!(!session.is_reusable());
    let err = session.run("whoami", CONNECT).await.unwrap_err();
    assert!(matches!(err, StarescError::ConnectionLost(_)));

    session.close().await.unwrap();
    session.connect(CONNECT).await.unwrap();
    assert_eq!(session.run("whoami", CONNECT).await.unwrap().stdout, "user");
    session.close().await.unwrap();
}
