use std::path::PathBuf;
use std::time::Duration;

/// Default number of targets scanned at the same time.
pub const DEFAULT_CONCURRENCY: usize = 5;

/// Knobs shared by the scan, check and raw runners.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Targets processed concurrently (clamped to at least 1).
    pub concurrency: usize,
    /// Bound on TCP connect plus authentication.
    pub connect_timeout: Duration,
    /// Bound on every single remote command.
    pub command_timeout: Duration,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            connect_timeout: Duration::from_secs(2),
            command_timeout: Duration::from_secs(60),
        }
    }
}

impl ScanOptions {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }
}

/// What raw mode does on each target, in order: push files, run commands,
/// pull files.
#[derive(Debug, Clone)]
pub struct RawJob {
    pub commands: Vec<String>,
    /// Local files copied into the working directory and made executable.
    pub push: Vec<PathBuf>,
    /// Remote files fetched into `<pull_dir>/staresc_<host>/`. Relative
    /// names are taken from the working directory.
    pub pull: Vec<String>,
    /// Work inside a fresh directory under /tmp, removed afterwards.
    pub make_temp: bool,
    /// Request a pty for every command (SSH only).
    pub tty: bool,
    pub pull_dir: PathBuf,
}

impl Default for RawJob {
    fn default() -> Self {
        Self {
            commands: Vec::new(),
            push: Vec::new(),
            pull: Vec::new(),
            make_temp: true,
            tty: true,
            pull_dir: PathBuf::from("."),
        }
    }
}

impl RawJob {
    pub fn new(commands: Vec<String>) -> Self {
        Self {
            commands,
            ..Default::default()
        }
    }

    /// Push `file` and run it from the working directory.
    pub fn with_exec(mut self, file: PathBuf) -> Self {
        if let Some(name) = file.file_name() {
            self.commands.push(format!("./{}", name.to_string_lossy()));
        }
        self.push.push(file);
        self
    }

    pub fn with_push(mut self, files: Vec<PathBuf>) -> Self {
        self.push.extend(files);
        self
    }

    pub fn with_pull(mut self, files: Vec<String>) -> Self {
        self.pull.extend(files);
        self
    }

    pub fn with_temp_dir(mut self, make_temp: bool) -> Self {
        self.make_temp = make_temp;
        self
    }

    pub fn with_tty(mut self, tty: bool) -> Self {
        self.tty = tty;
        self
    }

    pub fn with_pull_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.pull_dir = dir.into();
        self
    }

    /// A job that only moves files gets no scratch directory, so pushed
    /// files land in the login directory.
    pub fn uses_temp_dir(&self) -> bool {
        self.make_temp && !self.commands.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty() && self.push.is_empty() && self.pull.is_empty()
    }
}
