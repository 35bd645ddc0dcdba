use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::{RawJob, ScanOptions};
use crate::error::StarescError;
use crate::output::{Output, ResultSink};
use crate::plugin::Plugin;
use crate::session::{SchemeTable, SessionFactory};
use crate::target::ConnectionString;
use crate::worker::{RawWorker, ScanWorker};

/// Totals and collected outputs of one run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanReport {
    pub scanned_total: u64,
    pub scanned_done: u64,
    pub vulnerable: u64,
    pub outputs: Vec<Output>,
}

/// Live counters, readable while a scan is running.
#[derive(Clone, Debug, Default)]
pub struct SharedProgress {
    pub scanned_done: Arc<AtomicU64>,
    pub vulnerable: Arc<AtomicU64>,
    pub sink: ResultSink,
}

impl SharedProgress {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Scan every target with every plugin, at most `options.concurrency`
/// targets at a time.
///
/// - Each target gets its own session and worker; nothing is shared between
///   targets except the result sink and the counters.
/// - A target that cannot be parsed, reached or prepared is logged and
///   skipped; the other targets are unaffected.
/// - Plugins run in order on each target; a plugin that errors is logged and
///   the next one runs.
pub async fn scan_targets(
    targets: &[String],
    plugins: &[Plugin],
    options: &ScanOptions,
) -> ScanReport {
    scan_targets_with_cancel(targets, plugins, options, CancellationToken::new()).await
}

/// Variant that accepts a `CancellationToken` to allow external cancellation.
pub async fn scan_targets_with_cancel(
    targets: &[String],
    plugins: &[Plugin],
    options: &ScanOptions,
    cancel: CancellationToken,
) -> ScanReport {
    scan_targets_with_factory(
        targets,
        plugins,
        options,
        cancel,
        SharedProgress::new(),
        Arc::new(SchemeTable),
    )
    .await
}

pub async fn scan_targets_with_factory(
    targets: &[String],
    plugins: &[Plugin],
    options: &ScanOptions,
    cancel: CancellationToken,
    shared: SharedProgress,
    factory: Arc<dyn SessionFactory>,
) -> ScanReport {
    let plugins: Arc<[Plugin]> = plugins.into();
    let vulnerable = shared.vulnerable.clone();
    let sink = shared.sink.clone();
    let worker_options = options.clone();

    let done = shared.scanned_done.clone();
    for_each_target(targets.iter().cloned(), options.concurrency, &cancel, done, |raw| {
        let plugins = plugins.clone();
        let vulnerable = vulnerable.clone();
        let sink = sink.clone();
        let factory = factory.clone();
        let options = worker_options.clone();
        let cancel = cancel.clone();
        async move {
            scan_one(&raw, &plugins, options, factory, cancel, &sink, &vulnerable).await;
        }
    })
    .await;

    ScanReport {
        scanned_total: targets.len() as u64,
        scanned_done: shared.scanned_done.load(Ordering::Relaxed),
        vulnerable: shared.vulnerable.load(Ordering::Relaxed),
        outputs: shared.sink.into_outputs(),
    }
}

async fn scan_one(
    raw: &str,
    plugins: &[Plugin],
    options: ScanOptions,
    factory: Arc<dyn SessionFactory>,
    cancel: CancellationToken,
    sink: &ResultSink,
    vulnerable: &AtomicU64,
) {
    let target = match ConnectionString::parse(raw) {
        Ok(t) => t,
        Err(e) => {
            error!(error = %e, "skipping target");
            return;
        }
    };
    let span = info_span!("target", host = %target);
    let session = match factory.create(&target) {
        Ok(s) => s,
        Err(e) => {
            error!(parent: &span, error = %e, "skipping target");
            return;
        }
    };

    let mut worker = ScanWorker::new(session, options, span.clone());
    if let Err(e) = worker.prepare().await {
        error!(parent: &span, error = %e, "preparation failed, aborting target");
        worker.close().await;
        return;
    }

    for plugin in plugins {
        if cancel.is_cancelled() {
            warn!(parent: &span, "cancelled, skipping remaining plugins");
            break;
        }
        match worker.do_check(plugin).await {
            Ok(Some(output)) => {
                if output.vuln_found {
                    vulnerable.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        parent: &span,
                        plugin = %plugin.id,
                        severity = plugin.info.severity.as_deref().unwrap_or("unknown"),
                        "vulnerable to {}",
                        plugin.display_name()
                    );
                }
                sink.push(output);
            }
            Ok(None) => {}
            Err(e) => error!(parent: &span, plugin = %plugin.id, error = %e, "plugin failed"),
        }
    }
    worker.close().await;
    info!(parent: &span, "target done");
}

/// Outcome of a connectivity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Ok,
    WrongCredentials,
    NotReachable,
    InvalidConnectionString,
    UnsupportedScheme,
}

impl std::fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CheckStatus::Ok => "ok",
            CheckStatus::WrongCredentials => "wrong credentials",
            CheckStatus::NotReachable => "not reachable",
            CheckStatus::InvalidConnectionString => "invalid connection string",
            CheckStatus::UnsupportedScheme => "unsupported scheme",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    /// The connection string with its secret removed.
    pub target: String,
    pub status: CheckStatus,
}

/// Try to connect and authenticate to every target, nothing more.
/// Results come back in input order.
pub async fn check_targets(
    targets: &[String],
    options: &ScanOptions,
    cancel: CancellationToken,
) -> Vec<CheckResult> {
    check_targets_with_factory(targets, options, cancel, Arc::new(SchemeTable)).await
}

pub async fn check_targets_with_factory(
    targets: &[String],
    options: &ScanOptions,
    cancel: CancellationToken,
    factory: Arc<dyn SessionFactory>,
) -> Vec<CheckResult> {
    let results: Arc<Mutex<Vec<(usize, CheckResult)>>> = Arc::default();
    let connect_timeout = options.connect_timeout;

    for_each_target(
        targets.iter().cloned().enumerate(),
        options.concurrency,
        &cancel,
        Arc::default(),
        |(index, raw)| {
            let results = results.clone();
            let factory = factory.clone();
            async move {
                let result = check_one(&raw, factory.as_ref(), connect_timeout).await;
                info!(host = %result.target, status = %result.status, "checked");
                results
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push((index, result));
            }
        },
    )
    .await;

    let mut results = std::mem::take(&mut *results.lock().unwrap_or_else(PoisonError::into_inner));
    results.sort_by_key(|(i, _)| *i);
    results.into_iter().map(|(_, r)| r).collect()
}

async fn check_one(
    raw: &str,
    factory: &dyn SessionFactory,
    connect_timeout: std::time::Duration,
) -> CheckResult {
    let target = match ConnectionString::parse(raw) {
        Ok(t) => t,
        Err(_) => {
            return CheckResult {
                target: crate::target::redact(raw),
                status: CheckStatus::InvalidConnectionString,
            }
        }
    };
    let label = target.to_string();
    let status = match factory.create(&target) {
        Err(_) => CheckStatus::UnsupportedScheme,
        Ok(mut session) => {
            let status = match session.connect(connect_timeout).await {
                Ok(()) => CheckStatus::Ok,
                Err(StarescError::Authentication(_)) => CheckStatus::WrongCredentials,
                Err(e) => {
                    debug!(host = %label, error = %e, "connect failed");
                    CheckStatus::NotReachable
                }
            };
            if let Err(e) = session.close().await {
                debug!(host = %label, error = %e, "close failed");
            }
            status
        }
    };
    CheckResult {
        target: label,
        status,
    }
}

/// Run `job` on every SSH target: push files, run commands, pull files.
/// A scratch directory, when used, is removed afterwards (also on
/// cancellation).
pub async fn raw_targets(
    targets: &[String],
    job: RawJob,
    options: &ScanOptions,
    cancel: CancellationToken,
) -> ScanReport {
    raw_targets_with_factory(targets, job, options, cancel, Arc::new(SchemeTable)).await
}

pub async fn raw_targets_with_factory(
    targets: &[String],
    job: RawJob,
    options: &ScanOptions,
    cancel: CancellationToken,
    factory: Arc<dyn SessionFactory>,
) -> ScanReport {
    let job = Arc::new(job);
    let sink = ResultSink::new();
    let worker_options = options.clone();

    let done: Arc<AtomicU64> = Arc::default();
    for_each_target(targets.iter().cloned(), options.concurrency, &cancel, done.clone(), |raw| {
        let job = job.clone();
        let sink = sink.clone();
        let factory = factory.clone();
        let options = worker_options.clone();
        let cancel = cancel.clone();
        async move {
            let target = match ConnectionString::parse(&raw) {
                Ok(t) => t,
                Err(e) => {
                    error!(error = %e, "skipping target");
                    return;
                }
            };
            let span = info_span!("target", host = %target);
            if target.scheme != "ssh" {
                error!(parent: &span, scheme = %target.scheme, "raw mode needs an ssh:// target");
                return;
            }
            let session = match factory.create(&target) {
                Ok(s) => s,
                Err(e) => {
                    error!(parent: &span, error = %e, "skipping target");
                    return;
                }
            };
            let mut worker = RawWorker::new(session, options, job, cancel, span.clone());
            match worker.prepare().await {
                Ok(()) => sink.push(worker.run_job().await),
                Err(e) => error!(parent: &span, error = %e, "preparation failed, aborting target"),
            }
            worker.cleanup().await;
        }
    })
    .await;

    ScanReport {
        scanned_total: targets.len() as u64,
        scanned_done: done.load(Ordering::Relaxed),
        vulnerable: 0,
        outputs: sink.into_outputs(),
    }
}

/// Cancel `token` when the process receives Ctrl-C.
pub fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, finishing in-flight commands");
            token.cancel();
        }
    });
}

/// Bounded pool over `targets`: a `Semaphore` caps running jobs and a
/// `JoinSet` owns them. `done` counts jobs that ran to completion.
async fn for_each_target<T, F, Fut>(
    targets: impl IntoIterator<Item = T>,
    concurrency: usize,
    cancel: &CancellationToken,
    done: Arc<AtomicU64>,
    job: F,
) where
    F: Fn(T) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let sem = Arc::new(Semaphore::new(concurrency.clamp(1, 1_000)));
    let mut set = JoinSet::new();

    for item in targets {
        if cancel.is_cancelled() {
            break;
        }
        let Ok(permit) = sem.clone().acquire_owned().await else {
            break;
        };
        let fut = job(item);
        let done = done.clone();
        let cancel = cancel.clone();

        set.spawn(
            async move {
                let _permit = permit;
                if cancel.is_cancelled() {
                    return;
                }
                fut.await;
                done.fetch_add(1, Ordering::Relaxed);
            }
            .in_current_span(),
        );
    }

    while let Some(res) = set.join_next().await {
        if let Err(e) = res {
            error!(error = %e, "worker task failed");
        }
    }
}
