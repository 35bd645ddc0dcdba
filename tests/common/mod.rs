#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use staresc::session::{CommandOutput, Session, SessionFactory, SessionState};
use staresc::worker::BINPATH_COMMAND;
use staresc::{ConnectionString, StarescError};

/// What a scripted host answers to one command.
#[derive(Debug, Clone)]
pub enum Reply {
    Out(&'static str, &'static str),
    /// Report a command timeout and leave the session unusable.
    Timeout,
    Lost,
}

/// How a scripted host reacts to `connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostMode {
    Up,
    BadAuth,
    Down,
}

#[derive(Debug, Default)]
pub struct Stats {
    pub connects: AtomicUsize,
    pub live: AtomicUsize,
    pub max_live: AtomicUsize,
    pub commands: Mutex<Vec<(String, String)>>,
    pub tty: Mutex<Vec<bool>>,
}

impl Stats {
    pub fn commands_for(&self, host: &str) -> Vec<String> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|(h, _)| h == host)
            .map(|(_, c)| c.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Script {
    pub replies: HashMap<String, Reply>,
    pub binpath: &'static str,
    pub os_info: &'static str,
    pub root_password: Option<&'static str>,
    /// Simulated per-command latency.
    pub delay: Duration,
    /// Reject every push and pull.
    pub no_sftp: bool,
}

impl Script {
    pub fn reply(mut self, cmd: &str, reply: Reply) -> Self {
        self.replies.insert(cmd.to_string(), reply);
        self
    }
}

pub struct ScriptedSession {
    target: ConnectionString,
    state: SessionState,
    poisoned: bool,
    mode: HostMode,
    script: Arc<Script>,
    stats: Arc<Stats>,
}

impl ScriptedSession {
    pub fn new(
        target: ConnectionString,
        mode: HostMode,
        script: Arc<Script>,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            target,
            state: SessionState::Unconnected,
            poisoned: false,
            mode,
            script,
            stats,
        }
    }

    fn answer(&self, cmd: &str) -> Reply {
        if cmd == BINPATH_COMMAND {
            return Reply::Out(self.script.binpath, "");
        }
        if cmd == "uname -a" {
            return Reply::Out(self.script.os_info, "");
        }
        if let Some(reply) = self.script.replies.get(cmd) {
            return reply.clone();
        }
        Reply::Out("", "")
    }

    fn log(&self, entry: String) {
        self.stats
            .commands
            .lock()
            .unwrap()
            .push((self.target.host.clone(), entry));
    }

    fn su_echo(&self, cmd: &str) -> Option<String> {
        let pw = self.script.root_password?;
        let rest = cmd.strip_prefix(&format!("echo {pw} | su -c \"echo "))?;
        let (token, _) = rest.split_once('"')?;
        Some(token.to_string())
    }
}

#[async_trait]
impl Session for ScriptedSession {
    fn target(&self) -> &ConnectionString {
        &self.target
    }

    fn state(&self) -> SessionState {
        self.state
    }

    async fn connect(&mut self, _timeout: Duration) -> staresc::Result<()> {
        match self.mode {
            HostMode::Down => {
                return Err(StarescError::Connection(format!("{}: refused", self.target.addr())))
            }
            HostMode::BadAuth => {
                return Err(StarescError::Authentication(self.target.to_string()))
            }
            HostMode::Up => {}
        }
        self.stats.connects.fetch_add(1, Ordering::SeqCst);
        let live = self.stats.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.max_live.fetch_max(live, Ordering::SeqCst);
        self.state = SessionState::Connected;
        self.poisoned = false;
        Ok(())
    }

    async fn run(&mut self, cmd: &str, _timeout: Duration) -> staresc::Result<CommandOutput> {
        if self.state != SessionState::Connected {
            return Err(StarescError::Connection("not connected".into()));
        }
        if self.poisoned {
            return Err(StarescError::ConnectionLost("poisoned".into()));
        }
        self.log(cmd.to_string());
        if !self.script.delay.is_zero() {
            tokio::time::sleep(self.script.delay).await;
        }

        if let Some(token) = self.su_echo(cmd) {
            return Ok(CommandOutput {
                stdin: cmd.to_string(),
                stdout: token,
                stderr: String::new(),
            });
        }
        match self.answer(cmd) {
            Reply::Out(stdout, stderr) => Ok(CommandOutput {
                stdin: cmd.to_string(),
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            }),
            Reply::Timeout => {
                self.poisoned = true;
                Err(StarescError::CommandTimeout(cmd.to_string()))
            }
            Reply::Lost => Err(StarescError::ConnectionLost(cmd.to_string())),
        }
    }

    async fn close(&mut self) -> staresc::Result<()> {
        if self.state == SessionState::Connected {
            self.stats.live.fetch_sub(1, Ordering::SeqCst);
        }
        self.state = SessionState::Closed;
        Ok(())
    }

    fn is_reusable(&self) -> bool {
        self.state == SessionState::Connected && !self.poisoned
    }

    fn set_tty(&mut self, enabled: bool) {
        self.stats.tty.lock().unwrap().push(enabled);
    }

    async fn push(&mut self, local: &Path, remote: &str) -> staresc::Result<()> {
        self.log(format!("push {} {remote}", local.display()));
        if self.script.no_sftp {
            return Err(StarescError::FileTransfer("sftp disabled".into()));
        }
        Ok(())
    }

    async fn pull(&mut self, remote: &str, local: &Path) -> staresc::Result<()> {
        self.log(format!("pull {remote}"));
        if self.script.no_sftp {
            return Err(StarescError::FileTransfer("sftp disabled".into()));
        }
        tokio::fs::write(local, format!("contents of {remote}")).await?;
        Ok(())
    }
}

/// Hands out [`ScriptedSession`]s; hosts not listed in `modes` are up.
#[derive(Default)]
pub struct ScriptedFactory {
    pub script: Arc<Script>,
    pub modes: HashMap<String, HostMode>,
    pub stats: Arc<Stats>,
}

impl ScriptedFactory {
    pub fn new(script: Script) -> Self {
        Self {
            script: Arc::new(script),
            ..Default::default()
        }
    }

    pub fn with_mode(mut self, host: &str, mode: HostMode) -> Self {
        self.modes.insert(host.to_string(), mode);
        self
    }

    pub fn session(&self, raw: &str) -> Box<dyn Session> {
        let target = ConnectionString::parse(raw).unwrap();
        self.create(&target).unwrap()
    }
}

impl SessionFactory for ScriptedFactory {
    fn create(&self, target: &ConnectionString) -> staresc::Result<Box<dyn Session>> {
        if !["ssh", "sshss", "telnet"].contains(&target.scheme.as_str()) {
            return Err(StarescError::UnsupportedScheme {
                scheme: target.scheme.clone(),
                supported: "ssh, sshss, telnet".into(),
            });
        }
        let mode = self.modes.get(&target.host).copied().unwrap_or(HostMode::Up);
        Ok(Box::new(ScriptedSession::new(
            target.clone(),
            mode,
            self.script.clone(),
            self.stats.clone(),
        )))
    }
}

pub const OR_PLUGIN: &str = r#"
id: or-plugin
severity: high
match_condition: or
tests:
  - command: first
    parsers:
      - parser_type: matcher
        rule_type: word
        rules: [hit]
  - command: second
    parsers:
      - parser_type: matcher
        rule_type: word
        rules: [hit]
  - command: third
    parsers:
      - parser_type: matcher
        rule_type: word
        rules: [hit]
"#;

pub const AND_PLUGIN: &str = r#"
id: and-plugin
tests:
  - command: first
    parsers:
      - parser_type: matcher
        rule_type: word
        rules: [hit]
  - command: second
    parsers:
      - parser_type: matcher
        rule_type: word
        rules: [hit]
"#;
