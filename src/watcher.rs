//! Debounced filesystem watcher that coalesces reindex submissions onto a
//! `BackgroundIndexer`. Restarts the underlying watch on crash within a
//! bounded budget; every restart and backoff wait is interruptible by a stop
//! signal, never just polled between batches (SPEC_FULL.md §9).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use globset::{Glob, GlobSet, GlobSetBuilder};
use notify::RecursiveMode;
use notify_debouncer_full::{new_debouncer, DebounceEventResult};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::background::{BackgroundIndexer, JobRequest};
use crate::config::EngineConfig;

const DEFAULT_MAX_CRASH_RESTARTS: u32 = 5;
const BASE_BACKOFF_SECS: u64 = 1;

fn build_globset(patterns: &[String]) -> GlobSet {
    let mut builder = GlobSetBuilder::new();
    for p in patterns {
        if let Ok(g) = Glob::new(p) {
            builder.add(g);
        }
    }
    builder.build().unwrap_or_else(|_| GlobSetBuilder::new().build().unwrap())
}

/// Four candidate forms an event path is checked against, so glob patterns
/// like `**/node_modules/*` match regardless of whether the watcher handed
/// back an absolute path, a relative one, or a different separator
/// convention (SPEC_FULL.md §4.7).
fn candidate_forms(path: &Path, watch_roots: &[PathBuf]) -> Vec<String> {
    let mut forms = Vec::new();
    if let Some(name) = path.file_name() {
        forms.push(name.to_string_lossy().to_string());
    }
    forms.push(path.to_string_lossy().to_string());

    let abs = dunce::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    forms.push(abs.to_string_lossy().replace('\\', "/"));

    for root in watch_roots {
        if let Ok(rel) = abs.strip_prefix(root) {
            forms.push(rel.to_string_lossy().replace('\\', "/"));
        }
    }
    forms
}

fn event_survives_globs(path: &Path, watch_roots: &[PathBuf], include: &GlobSet, exclude: &GlobSet) -> bool {
    let forms = candidate_forms(path, watch_roots);
    let included = forms.iter().any(|f| include.is_match(f));
    let excluded = forms.iter().any(|f| exclude.is_match(f));
    included && !excluded
}

pub struct FileWatcherConfig {
    pub db_path: PathBuf,
    pub watch_roots: Vec<PathBuf>,
    pub include_globs: Vec<String>,
    pub exclude_globs: Vec<String>,
    pub debounce_ms: u64,
    pub max_crash_restarts: u32,
    pub engine_config: EngineConfig,
}

impl Default for FileWatcherConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::new(),
            watch_roots: Vec::new(),
            include_globs: vec!["*.md".to_string()],
            exclude_globs: Vec::new(),
            debounce_ms: 500,
            max_crash_restarts: DEFAULT_MAX_CRASH_RESTARTS,
            engine_config: EngineConfig::default(),
        }
    }
}

/// Owns the watcher background task. `stop` signals it and joins.
pub struct FileWatcher {
    stop_signal: Arc<Notify>,
    handle: Option<JoinHandle<()>>,
}

impl FileWatcher {
    /// Start watching. Every surviving event batch submits one `reindex`
    /// request covering all `watch_roots` (`force=false, prune_missing=true`)
    /// to `background`, coalesced against any job already `queued`/`running`
    /// for the same `(db_path, watch_roots)` key.
    pub fn start(config: FileWatcherConfig, background: Arc<BackgroundIndexer>) -> Self {
        let stop_signal = Arc::new(Notify::new());
        let stop_for_task = stop_signal.clone();
        let handle = tokio::spawn(run_watch_loop(config, background, stop_for_task));
        Self {
            stop_signal,
            handle: Some(handle),
        }
    }

    pub async fn stop(&mut self, timeout: Duration) {
        self.stop_signal.notify_waiters();
        if let Some(handle) = self.handle.take() {
            let _ = tokio::time::timeout(timeout, handle).await;
        }
    }
}

fn job_label(db_path: &Path, watch_roots: &[PathBuf]) -> String {
    let mut roots: Vec<String> = watch_roots.iter().map(|p| p.display().to_string()).collect();
    roots.sort();
    format!("watch::{}::{}", db_path.display(), roots.join(","))
}

async fn run_watch_loop(config: FileWatcherConfig, background: Arc<BackgroundIndexer>, stop: Arc<Notify>) {
    let include = build_globset(&config.include_globs);
    let exclude = build_globset(&config.exclude_globs);
    let crash_count = Arc::new(AtomicU32::new(0));

    loop {
        if crash_count.load(Ordering::SeqCst) > config.max_crash_restarts {
            warn!(
                restarts = crash_count.load(Ordering::SeqCst),
                "file watcher exceeded crash restart budget, terminating"
            );
            return;
        }

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<DebounceEventResult>();
        let debouncer = new_debouncer(Duration::from_millis(config.debounce_ms), None, move |result| {
            let _ = tx.send(result);
        });

        let mut debouncer = match debouncer {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "failed to construct file watcher debouncer");
                if !backoff_and_wait(&crash_count, &stop).await {
                    return;
                }
                continue;
            }
        };

        let mut watch_failed = false;
        for root in &config.watch_roots {
            if let Err(e) = debouncer.watch(root.as_path(), RecursiveMode::Recursive) {
                warn!(root = %root.display(), error = %e, "failed to watch path");
                watch_failed = true;
            }
        }
        if watch_failed {
            drop(debouncer);
            if !backoff_and_wait(&crash_count, &stop).await {
                return;
            }
            continue;
        }

        info!(roots = ?config.watch_roots, "file watcher started");

        loop {
            tokio::select! {
                _ = stop.notified() => {
                    info!("file watcher stop signal received");
                    return;
                }
                maybe_result = rx.recv() => {
                    match maybe_result {
                        Some(Ok(events)) => {
                            crash_count.store(0, Ordering::SeqCst);
                            let mut any_surviving = false;
                            for event in &events {
                                for path in &event.paths {
                                    if event_survives_globs(path, &config.watch_roots, &include, &exclude) {
                                        any_surviving = true;
                                    }
                                }
                            }
                            if any_surviving {
                                submit_coalesced_reindex(&background, &config);
                            }
                        }
                        Some(Err(errors)) => {
                            for e in errors {
                                warn!(error = ?e, "file watcher backend error");
                            }
                            crash_count.fetch_add(1, Ordering::SeqCst);
                            drop(debouncer);
                            if !backoff_and_wait(&crash_count, &stop).await {
                                return;
                            }
                            break;
                        }
                        None => {
                            // Debouncer dropped its sender: treat as a crash.
                            crash_count.fetch_add(1, Ordering::SeqCst);
                            if !backoff_and_wait(&crash_count, &stop).await {
                                return;
                            }
                            break;
                        }
                    }
                }
            }
        }
    }
}

/// Sleep `base_backoff * 2^(n-1)`, interruptible by `stop`. Returns `false`
/// if the stop signal fired during the wait (caller should exit entirely).
async fn backoff_and_wait(crash_count: &Arc<AtomicU32>, stop: &Arc<Notify>) -> bool {
    let n = crash_count.load(Ordering::SeqCst).max(1);
    let wait = Duration::from_secs(BASE_BACKOFF_SECS * 2u64.saturating_pow(n.saturating_sub(1)));
    tokio::select! {
        _ = tokio::time::sleep(wait) => true,
        _ = stop.notified() => false,
    }
}

fn submit_coalesced_reindex(background: &Arc<BackgroundIndexer>, config: &FileWatcherConfig) {
    let label = job_label(&config.db_path, &config.watch_roots);
    if background.has_active_job(&label) {
        return;
    }
    let db_path = config.db_path.clone();
    let roots = config.watch_roots.clone();
    let engine_config = config.engine_config.clone();
    let request = JobRequest {
        label: label.clone(),
        run: Arc::new(move || crate::engine::run_reindex_job(&db_path, &roots, false, true, &engine_config)),
    };
    if let Err(e) = background.submit(request) {
        warn!(error = %e, "failed to submit watcher-triggered reindex job");
    }
}
