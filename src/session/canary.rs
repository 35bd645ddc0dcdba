//! Canary tokens and the line framing used by shared-shell transports.
//!
//! A shared shell never tells us where one command's output ends, so every
//! command is followed by `echo <token>` and output is collected until the
//! token comes back.

use std::sync::LazyLock;

use regex::Regex;

/// Random bytes per token; hex encoding doubles the length.
pub const CANARY_BYTES: usize = 15;

static ANSI_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\x9B|\x1B\[)[0-?]*[ -/]*[@-~]").expect("ansi regex is valid")
});

/// Fresh 30 hex character marker.
pub fn new_token() -> String {
    let bytes: [u8; CANARY_BYTES] = rand::random();
    hex::encode(bytes)
}

/// Remove terminal escape sequences, backspaces and carriage returns.
pub fn clean_line(line: &str) -> String {
    ANSI_RE
        .replace_all(line, "")
        .chars()
        .filter(|c| *c != '\u{8}' && *c != '\r')
        .collect()
}

/// Incremental parser for one command's output on a shared shell.
///
/// Feed raw bytes as they arrive; once the canary line shows up `finish`
/// yields the framed stdout.
#[derive(Debug)]
pub struct LineFramer {
    command: String,
    echo_command: String,
    token: String,
    pending: Vec<u8>,
    lines: Vec<String>,
    seen_echo: bool,
    done: bool,
}

impl LineFramer {
    pub fn new(command: &str, token: &str) -> Self {
        Self {
            command: command.to_string(),
            echo_command: format!("echo {token}"),
            token: token.to_string(),
            pending: Vec::new(),
            lines: Vec::new(),
            seen_echo: false,
            done: false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Consume a chunk of transport output. Returns true once the token line was seen.
    pub fn feed(&mut self, chunk: &[u8]) -> bool {
        if self.done {
            return true;
        }
        self.pending.extend_from_slice(chunk);
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = clean_line(&String::from_utf8_lossy(&raw[..raw.len() - 1]));
            if self.accept(line) {
                self.done = true;
                self.pending.clear();
                break;
            }
        }
        self.done
    }

    fn accept(&mut self, line: String) -> bool {
        if line.starts_with(&self.token) {
            return true;
        }
        // Prompt-prefixed or not, the token echo never carries output.
        if line.trim_end().ends_with(&self.echo_command) {
            return false;
        }
        if self.is_command_echo(&line) {
            // Anything collected so far is shell junk (banners, motd,
            // leftovers from the previous command).
            self.seen_echo = true;
            self.lines.clear();
            return false;
        }
        self.lines.push(line);
        false
    }

    /// A pty may echo typed-ahead input twice: once from the line
    /// discipline and again when readline redraws it after a prompt. Both
    /// copies come before the first real output line.
    fn is_command_echo(&self, line: &str) -> bool {
        if self.command.is_empty() {
            return false;
        }
        if !self.seen_echo {
            line.starts_with(&self.command) || line.trim_end().ends_with(&self.command)
        } else {
            self.lines.is_empty() && line.trim_end().ends_with(&self.command)
        }
    }

    /// Output between the echoed command and the token, right-trimmed.
    pub fn finish(self) -> String {
        self.lines.join("\n").trim_end().to_string()
    }
}
