use std::sync::{Arc, Mutex, PoisonError};

use ::time::{format_description::well_known, OffsetDateTime};
use serde::Serialize;

use crate::plugin::{ParsedResult, Plugin, PluginInfo};
use crate::session::CommandOutput;
use crate::target::ConnectionString;

/// Plugin identity as it appears in a report.
#[derive(Debug, Clone, Serialize)]
pub struct PluginSummary {
    pub id: String,
    #[serde(flatten)]
    pub info: PluginInfo,
}

impl From<&Plugin> for PluginSummary {
    fn from(p: &Plugin) -> Self {
        Self {
            id: p.id.clone(),
            info: p.info.clone(),
        }
    }
}

/// Everything recorded while scanning one target with one plugin.
///
/// The four per-test lists are index-aligned: entry `i` of each describes
/// the `i`-th executed test.
#[derive(Debug, Clone, Serialize)]
pub struct Output {
    pub target: ConnectionString,
    pub plugin: Option<PluginSummary>,
    pub test_results: Vec<CommandOutput>,
    pub test_results_parsed: Vec<ParsedResult>,
    pub test_success: Vec<bool>,
    pub test_timeout: Vec<bool>,
    pub vuln_found: bool,
    pub timestamp: String,
}

impl Output {
    pub fn new(target: ConnectionString, plugin: Option<&Plugin>) -> Self {
        Self {
            target,
            plugin: plugin.map(PluginSummary::from),
            test_results: Vec::new(),
            test_results_parsed: Vec::new(),
            test_success: Vec::new(),
            test_timeout: Vec::new(),
            vuln_found: false,
            timestamp: now_rfc3339(),
        }
    }

    pub fn add_test_result(&mut self, result: CommandOutput, parsed: ParsedResult, success: bool) {
        self.test_results.push(result);
        self.test_results_parsed.push(parsed);
        self.test_success.push(success);
        self.test_timeout.push(false);
    }

    /// Record a test whose command never completed.
    pub fn add_timeout_result(&mut self, stdin: &str) {
        self.test_results.push(CommandOutput {
            stdin: stdin.to_string(),
            ..Default::default()
        });
        self.test_results_parsed.push(ParsedResult::default());
        self.test_success.push(false);
        self.test_timeout.push(true);
    }

    /// Record a command that failed for a reason other than a timeout; the
    /// error text stands in for stderr.
    pub fn add_failed_result(&mut self, stdin: &str, error: &str) {
        self.test_results.push(CommandOutput {
            stdin: stdin.to_string(),
            stdout: String::new(),
            stderr: error.to_string(),
        });
        self.test_results_parsed.push(ParsedResult::default());
        self.test_success.push(false);
        self.test_timeout.push(false);
    }

    /// Raw-mode commands have no parsers.
    pub fn add_raw_result(&mut self, result: CommandOutput) {
        let parsed = ParsedResult::new(result.stdout.clone(), result.stderr.clone());
        self.add_test_result(result, parsed, true);
    }

    pub fn any_timeout(&self) -> bool {
        self.test_timeout.iter().any(|t| *t)
    }
}

/// Thread-safe collection point for finished outputs.
///
/// Producers only push; the accumulated list is read once, after every
/// producer has been joined, by consuming the sink.
#[derive(Debug, Clone, Default)]
pub struct ResultSink {
    inner: Arc<Mutex<Vec<Output>>>,
}

impl ResultSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, output: Output) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(output);
    }

    /// Take the collected outputs. Any clones still alive keep their handle
    /// but see an empty list afterwards.
    pub fn into_outputs(self) -> Vec<Output> {
        match Arc::try_unwrap(self.inner) {
            Ok(mutex) => mutex.into_inner().unwrap_or_else(PoisonError::into_inner),
            Err(shared) => std::mem::take(
                &mut *shared.lock().unwrap_or_else(PoisonError::into_inner),
            ),
        }
    }
}

pub(crate) fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
