//! Per-target workers: one session, commands strictly in sequence.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument, Span};

use crate::config::{RawJob, ScanOptions};
use crate::error::{Result, StarescError};
use crate::output::Output;
use crate::plugin::{Condition, ParsedResult, Plugin};
use crate::session::{canary, CommandOutput, Session, SessionState};

/// Lists every regular file reachable from `$PATH`.
pub const BINPATH_COMMAND: &str =
    r#"for p in $(echo $PATH | tr ':' ' '); do find "$p" -type f 2>/dev/null; done"#;

/// Best-effort host fingerprint matched against plugin `distr_matcher`s.
pub const OS_INFO_COMMANDS: &[&str] = &[
    "uname -a",
    "lsb_release -d",
    "cat /etc/*release*",
    "cat /proc/version",
];

/// Rewrite the first word of `cmd` to the `binpath` entry ending in
/// `/<word>` (case-insensitive). Unknown words and paths are kept as is.
pub fn resolve_in(binpath: &[String], cmd: &str) -> String {
    let trimmed = cmd.trim_start();
    let (head, rest) = match trimmed.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, Some(rest)),
        None => (trimmed, None),
    };
    if head.is_empty() || head.contains('/') {
        return cmd.to_string();
    }

    let suffix = format!("/{}", head.to_lowercase());
    let Some(abs) = binpath
        .iter()
        .find(|b| b.to_lowercase().ends_with(&suffix))
    else {
        return cmd.to_string();
    };
    match rest {
        Some(rest) => format!("{abs} {rest}"),
        None => abs.clone(),
    }
}

/// Drives plugins against a single target.
pub struct ScanWorker {
    session: Box<dyn Session>,
    options: ScanOptions,
    binpath: Vec<String>,
    resolved: HashMap<String, String>,
    os_info: String,
    span: Span,
}

impl ScanWorker {
    /// `span` carries the target's logging context; every event the worker
    /// emits is recorded inside it.
    pub fn new(session: Box<dyn Session>, options: ScanOptions, span: Span) -> Self {
        Self {
            session,
            options,
            binpath: Vec::new(),
            resolved: HashMap::new(),
            os_info: String::new(),
            span,
        }
    }

    pub fn session(&self) -> &dyn Session {
        self.session.as_ref()
    }

    pub fn binpath(&self) -> &[String] {
        &self.binpath
    }

    pub fn os_info(&self) -> &str {
        &self.os_info
    }

    /// Connect, then cache the executable search path and OS fingerprint.
    pub async fn prepare(&mut self) -> Result<()> {
        let span = self.span.clone();
        self.prepare_inner().instrument(span).await
    }

    async fn prepare_inner(&mut self) -> Result<()> {
        self.session.connect(self.options.connect_timeout).await?;
        info!("connected");

        match self.run(BINPATH_COMMAND).await {
            Ok(out) => {
                self.binpath = out
                    .stdout
                    .lines()
                    .map(str::trim)
                    .filter(|l| l.starts_with('/'))
                    .map(str::to_string)
                    .collect();
                debug!(entries = self.binpath.len(), "binpath cached");
            }
            Err(StarescError::CommandTimeout(_)) => warn!("binpath listing timed out"),
            Err(e) => return Err(e),
        }

        let mut info = Vec::with_capacity(OS_INFO_COMMANDS.len());
        for cmd in OS_INFO_COMMANDS {
            match self.run(cmd).await {
                Ok(out) => info.push(out.stdout),
                Err(StarescError::CommandTimeout(_)) => debug!(cmd, "os info probe timed out"),
                Err(e) => return Err(e),
            }
        }
        self.os_info = info.join(" ");
        Ok(())
    }

    /// Memoized [`resolve_in`] over this worker's binpath.
    pub fn resolve_absolute(&mut self, cmd: &str) -> String {
        if let Some(hit) = self.resolved.get(cmd) {
            return hit.clone();
        }
        let resolved = resolve_in(&self.binpath, cmd);
        self.resolved.insert(cmd.to_string(), resolved.clone());
        resolved
    }

    /// Run one command, reconnecting first if the session lost its framing.
    async fn run(&mut self, cmd: &str) -> Result<CommandOutput> {
        if self.session.state() == SessionState::Connected && !self.session.is_reusable() {
            warn!("session unusable after a failed command, reconnecting");
            self.session.close().await?;
            self.session.connect(self.options.connect_timeout).await?;
        }
        self.session.run(cmd, self.options.command_timeout).await
    }

    /// Evaluate `plugin` on the target. `None` when the plugin does not apply
    /// to this host's distribution.
    pub async fn do_check(&mut self, plugin: &Plugin) -> Result<Option<Output>> {
        let span = self.span.clone();
        self.do_check_inner(plugin).instrument(span).await
    }

    async fn do_check_inner(&mut self, plugin: &Plugin) -> Result<Option<Output>> {
        if !plugin.applies_to(&self.os_info) {
            debug!(plugin = %plugin.id, "distribution does not match, skipping");
            return Ok(None);
        }

        let mut output = Output::new(self.session.target().clone(), Some(plugin));
        output.vuln_found = plugin.match_condition == Condition::And;

        for test in plugin.tests() {
            let cmd = self.resolve_absolute(test.command());
            let result = match self.run(&cmd).await {
                Ok(result) => result,
                Err(StarescError::CommandTimeout(_)) => {
                    warn!(plugin = %plugin.id, cmd = %cmd, "command timed out");
                    output.add_timeout_result(&cmd);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let (positive, parsed) =
                test.parse(&ParsedResult::new(&result.stdout, &result.stderr));
            output.add_test_result(result, parsed, positive);

            match plugin.match_condition {
                Condition::Or if positive => {
                    output.vuln_found = true;
                    break;
                }
                Condition::And if !positive => {
                    output.vuln_found = false;
                    break;
                }
                _ => {}
            }
        }
        Ok(Some(output))
    }

    /// Probe the root credentials of the connection string with `su`.
    /// Nothing changes for later commands; they still run as the login user.
    pub async fn elevate(&mut self) -> Result<bool> {
        let Some((user, password)) = self
            .session
            .target()
            .root_credentials()
            .map(|(u, p)| (u.to_string(), p.to_string()))
        else {
            return Ok(false);
        };
        let token = canary::new_token();
        let cmd = format!(r#"echo {password} | su -c "echo {token}" {user}"#);
        let span = self.span.clone();
        let out = self.run(&cmd).instrument(span).await?;
        Ok(out.stdout.contains(&token))
    }

    pub async fn close(&mut self) {
        if let Err(e) = self.session.close().await {
            debug!(parent: &self.span, error = %e, "close failed");
        }
    }
}

/// Runs a [`RawJob`] on one host: push files, run commands, pull files,
/// optionally inside a scratch directory that is removed afterwards.
pub struct RawWorker {
    session: Box<dyn Session>,
    options: ScanOptions,
    job: Arc<RawJob>,
    tmp_base: String,
    tmp_dir: Option<String>,
    cancel: CancellationToken,
    span: Span,
}

impl RawWorker {
    pub fn new(
        session: Box<dyn Session>,
        options: ScanOptions,
        job: Arc<RawJob>,
        cancel: CancellationToken,
        span: Span,
    ) -> Self {
        Self {
            session,
            options,
            job,
            tmp_base: "/tmp".to_string(),
            tmp_dir: None,
            cancel,
            span,
        }
    }

    pub fn tmp_dir(&self) -> Option<&str> {
        self.tmp_dir.as_deref()
    }

    pub async fn prepare(&mut self) -> Result<()> {
        let span = self.span.clone();
        async {
            self.session.connect(self.options.connect_timeout).await?;
            self.session.set_tty(self.job.tty);
            if self.job.uses_temp_dir() && !self.cancel.is_cancelled() {
                let dir = format!("{}/staresc_{}", self.tmp_base, compact_timestamp());
                self.session
                    .run(&format!("mkdir -p {dir}"), self.options.command_timeout)
                    .await?;
                info!(dir = %dir, "created scratch directory");
                self.tmp_dir = Some(dir);
            }
            Ok::<_, StarescError>(())
        }
        .instrument(span)
        .await
    }

    /// Push every file, run every command, then pull every file. A failed
    /// push skips the rest of the job; a failed pull only skips that file.
    pub async fn run_job(&mut self) -> Output {
        let job = self.job.clone();
        let span = self.span.clone();
        let target = self.session.target().clone();

        for file in &job.push {
            if self.is_cancelled() {
                return Output::new(target, None);
            }
            if let Err(e) = self.push(file).instrument(span.clone()).await {
                error!(
                    parent: &span,
                    file = %file.display(),
                    error = %e,
                    "push failed, skipping commands"
                );
                return Output::new(target, None);
            }
        }

        let output = self.exec(&job.commands).await;

        for file in &job.pull {
            if self.is_cancelled() {
                break;
            }
            if let Err(e) = self.pull(file).instrument(span.clone()).await {
                error!(parent: &span, file = %file, error = %e, "pull failed");
            }
        }
        output
    }

    /// Run every command in order, stopping early if the run is cancelled.
    pub async fn exec(&mut self, commands: &[String]) -> Output {
        let span = self.span.clone();
        async {
            let mut output = Output::new(self.session.target().clone(), None);
            for cmd in commands {
                if self.is_cancelled() {
                    break;
                }
                let full = match &self.tmp_dir {
                    Some(dir) => format!("cd {dir} ; {cmd}"),
                    None => cmd.clone(),
                };
                info!(cmd = %cmd, "executing");
                match self.session.run(&full, self.options.command_timeout).await {
                    Ok(result) => output.add_raw_result(result),
                    Err(StarescError::CommandTimeout(_)) => {
                        warn!(cmd = %cmd, "command timed out");
                        output.add_timeout_result(&full);
                    }
                    Err(e) => {
                        error!(cmd = %cmd, error = %e, "command failed");
                        output.add_failed_result(&full, &e.to_string());
                    }
                }
                if !self.session.is_reusable() {
                    warn!("session unusable, skipping remaining commands");
                    break;
                }
            }
            output
        }
        .instrument(span)
        .await
    }

    /// Copy `local` into the working directory and make it executable.
    /// Returns the remote path.
    pub async fn push(&mut self, local: &Path) -> Result<String> {
        let name = local
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                StarescError::FileTransfer(format!("{} has no file name", local.display()))
            })?;
        let dest = self.remote_path(&name);
        info!(file = %local.display(), dest = %dest, "pushing");
        self.session.push(local, &dest).await?;
        self.session
            .run(&format!("chmod 777 {dest}"), self.options.command_timeout)
            .await?;
        Ok(dest)
    }

    /// Fetch `remote` into `<pull_dir>/staresc_<host>/<file name>`.
    pub async fn pull(&mut self, remote: &str) -> Result<PathBuf> {
        let name = remote
            .rsplit('/')
            .find(|part| !part.is_empty())
            .ok_or_else(|| StarescError::FileTransfer(format!("`{remote}` names no file")))?;
        let dir = self
            .job
            .pull_dir
            .join(format!("staresc_{}", self.session.target().host));
        tokio::fs::create_dir_all(&dir).await?;
        let dest = dir.join(name);
        let src = self.remote_path(remote);
        info!(src = %src, dest = %dest.display(), "pulling");
        self.session.pull(&src, &dest).await?;
        Ok(dest)
    }

    fn remote_path(&self, name: &str) -> String {
        if name.starts_with('/') {
            return name.to_string();
        }
        match &self.tmp_dir {
            Some(dir) => format!("{dir}/{name}"),
            None => name.to_string(),
        }
    }

    fn is_cancelled(&self) -> bool {
        if self.cancel.is_cancelled() {
            warn!(parent: &self.span, "cancelled, skipping remaining steps");
            return true;
        }
        false
    }

    /// Remove the scratch directory and close the session. Safe to call
    /// after a cancellation.
    pub async fn cleanup(&mut self) {
        let span = self.span.clone();
        async {
            if let Some(dir) = self.tmp_dir.take() {
                if self.session.is_reusable() {
                    let rm = format!("rm -rf {dir}");
                    match self.session.run(&rm, self.options.command_timeout).await {
                        Ok(_) => debug!(dir = %dir, "removed scratch directory"),
                        Err(e) => {
                            warn!(dir = %dir, error = %e, "could not remove scratch directory")
                        }
                    }
                } else {
                    warn!(dir = %dir, "session unusable, scratch directory left behind");
                }
            }
            if let Err(e) = self.session.close().await {
                debug!(error = %e, "close failed");
            }
        }
        .instrument(span)
        .await
    }
}

fn compact_timestamp() -> String {
    let format = ::time::macros::format_description!("[year][month][day][hour][minute][second]");
    ::time::OffsetDateTime::now_utc()
        .format(&format)
        .unwrap_or_else(|_| "0".to_string())
}
