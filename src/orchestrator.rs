//! Concurrent search orchestration.
//!
//! An [`Orchestrator`] owns one query and runs every attached plugin on its
//! own worker at the same time. Plugins report candidates through their
//! [`Feed`]; each candidate is matched against the query exactly once, on
//! arrival, and accepted ones are appended to a shared result list and
//! announced to the attached [`Frontend`].
//!
//! # Lifecycle
//!
//! ```text
//! Created ──attach()──▶ Loaded ──start()──▶ Searching ──shutdown()──▶ Draining ──▶ Closed
//! ```
//!
//! # Locking
//!
//! The result list and the frontend reference each have their own lock.
//! Ingestion takes the frontend lock first, appends under the results lock,
//! releases it, and calls [`Frontend::update`] before releasing the frontend
//! lock. Updates are therefore issued in insertion order, and a frontend may
//! read [`ResultsView`] from inside `update`.
//!
//! # Shutdown
//!
//! [`Orchestrator::shutdown`] cancels every worker and waits a bounded time.
//! Workers that do not stop in time are abandoned, not killed. The state they
//! report into is reference-counted, so late calls are harmless: once the
//! search is closed they are ignored.

use parking_lot::RwLock;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::error::{PluginRuntimeError, SearchError};
use crate::frontend::{Frontend, FrontendSlot};
use crate::logging;
use crate::matching::matches;
use crate::models::{Candidate, Item, LogLevel, Query};
use crate::plugin::{CancelToken, Feed, PluginHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchState {
    Created,
    Loaded,
    Searching,
    Draining,
    Closed,
}

impl fmt::Display for SearchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SearchState::Created => "created",
            SearchState::Loaded => "loaded",
            SearchState::Searching => "searching",
            SearchState::Draining => "draining",
            SearchState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// What happened to a reported candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingested {
    /// Matched and appended to the results.
    Accepted,
    /// Did not match, or had no URI. Dropped silently.
    Rejected,
    /// The search is closed; nothing was recorded.
    Closed,
}

/// A live, read-only view of the result list. Cheap to clone.
///
/// Workers may still be appending, so any read is a snapshot of a list that
/// only grows.
#[derive(Clone, Default)]
pub struct ResultsView {
    items: Arc<RwLock<Vec<Item>>>,
}

impl ResultsView {
    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Item> {
        self.items.read().get(index).cloned()
    }

    pub fn snapshot(&self) -> Vec<Item> {
        self.items.read().clone()
    }

    /// Items at positions `start..`, i.e. everything that arrived after the
    /// first `start` items.
    pub fn since(&self, start: usize) -> Vec<Item> {
        self.items
            .read()
            .get(start..)
            .map(<[Item]>::to_vec)
            .unwrap_or_default()
    }

    /// Borrow the current items without cloning. Keep `f` short: workers
    /// cannot append while it runs.
    pub fn with<R>(&self, f: impl FnOnce(&[Item]) -> R) -> R {
        f(&self.items.read())
    }
}

/// State shared by the orchestrator, every [`Feed`] and every [`ResultsView`].
pub(crate) struct Shared {
    query: Arc<Query>,
    results: ResultsView,
    frontend: FrontendSlot,
    closed: AtomicBool,
}

impl Shared {
    fn new(query: Arc<Query>) -> Self {
        Self {
            query,
            results: ResultsView::default(),
            frontend: FrontendSlot::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Taken under the slot lock so no ingest or log is mid-delivery.
    fn close(&self) {
        self.frontend.locked(|_| self.closed.store(true, Ordering::Release));
    }

    pub(crate) fn ingest(&self, source: &str, candidate: Candidate) -> Ingested {
        if self.is_closed() {
            return Ingested::Closed;
        }
        if !matches(&candidate, &self.query) {
            return Ingested::Rejected;
        }

        let item = Item::from_candidate(source, candidate);
        self.frontend.locked(|frontend| {
            if self.is_closed() {
                return Ingested::Closed;
            }
            self.results.items.write().push(item);
            if let Some(fe) = frontend {
                fe.update();
            }
            Ingested::Accepted
        })
    }

    pub(crate) fn log(&self, level: LogLevel, plugin: Option<&str>, message: &str) {
        match plugin {
            Some(name) => self.forward(level, plugin, message, &format!("{}: {}", name, message)),
            None => self.forward(level, None, message, message),
        }
    }

    fn report_failure(&self, err: &PluginRuntimeError) {
        let line = format!("{}; ignoring it", err);
        self.forward(LogLevel::Error, Some(&err.plugin), &err.message, &line);
    }

    /// Emit `message` through `tracing` and hand `line` to the frontend.
    fn forward(&self, level: LogLevel, plugin: Option<&str>, message: &str, line: &str) {
        if self.is_closed() || level == LogLevel::Off {
            return;
        }
        logging::emit(level, plugin, message);
        self.frontend.locked(|frontend| {
            if let (Some(fe), false) = (frontend, self.is_closed()) {
                fe.log(level, line);
            }
        });
    }
}

/// Decrements the running-worker count when a worker exits, however it exits.
struct ActiveGuard {
    active: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if self.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

struct Worker {
    plugin: String,
    join: JoinHandle<()>,
    cancel: CancelToken,
}

/// Outcome of [`Orchestrator::shutdown`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Workers that had stopped by the end of the grace period.
    pub finished: usize,
    /// Plugins whose workers were still running and were left behind.
    pub abandoned: Vec<String>,
}

/// Runs plugins concurrently for one query and collects matching items.
pub struct Orchestrator {
    shared: Arc<Shared>,
    handles: Vec<PluginHandle>,
    workers: Vec<Worker>,
    state: SearchState,
    active: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl Orchestrator {
    pub fn new(query: Query) -> Self {
        Self {
            shared: Arc::new(Shared::new(Arc::new(query))),
            handles: Vec::new(),
            workers: Vec::new(),
            state: SearchState::Created,
            active: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
        }
    }

    pub fn query(&self) -> &Query {
        &self.shared.query
    }

    pub fn state(&self) -> SearchState {
        self.state
    }

    pub fn plugins(&self) -> &[PluginHandle] {
        &self.handles
    }

    /// Add plugins to run. Allowed until [`start`](Self::start) is called.
    pub fn attach(&mut self, handles: Vec<PluginHandle>) -> Result<(), SearchError> {
        match self.state {
            SearchState::Created | SearchState::Loaded => {
                self.handles.extend(handles);
                self.state = SearchState::Loaded;
                Ok(())
            }
            state => Err(SearchError::InvalidState {
                action: "attach plugins",
                state,
            }),
        }
    }

    /// Spawn one worker per attached plugin and return immediately.
    ///
    /// Workers run on tokio's blocking pool, so this must be called from
    /// within a tokio runtime.
    pub fn start(&mut self) -> Result<(), SearchError> {
        match self.state {
            SearchState::Loaded => {}
            SearchState::Created => return Err(SearchError::NoPlugins),
            state => {
                return Err(SearchError::InvalidState {
                    action: "start",
                    state,
                })
            }
        }
        if self.handles.is_empty() {
            return Err(SearchError::NoPlugins);
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SearchError::NoRuntime)?;

        for handle in &self.handles {
            let cancel = CancelToken::new();
            let feed = Feed::new(handle.name(), Arc::clone(&self.shared), cancel.clone());
            let plugin = handle.clone();
            let query = Arc::clone(&self.shared.query);

            self.active.fetch_add(1, Ordering::AcqRel);
            let guard = ActiveGuard {
                active: Arc::clone(&self.active),
                idle: Arc::clone(&self.idle),
            };

            let shared = Arc::clone(&self.shared);
            let join = runtime.spawn_blocking(move || {
                let _guard = guard;
                run_worker(&plugin, &query, &feed, &shared);
            });

            self.workers.push(Worker {
                plugin: handle.name().to_string(),
                join,
                cancel,
            });
        }

        tracing::debug!(workers = self.workers.len(), "search started");
        self.state = SearchState::Searching;
        Ok(())
    }

    /// Report a candidate on behalf of `source`. Same path plugins use.
    pub fn ingest(&self, source: &str, candidate: Candidate) -> Ingested {
        self.shared.ingest(source, candidate)
    }

    /// Forward a log line to the attached frontend, if any.
    pub fn log(&self, level: LogLevel, message: &str) {
        self.shared.log(level, None, message);
    }

    pub fn results(&self) -> ResultsView {
        self.shared.results.clone()
    }

    /// Attach `frontend` without taking ownership of it.
    pub fn attach_frontend(&self, frontend: &Arc<dyn Frontend>) {
        self.shared.frontend.set(frontend);
    }

    pub fn detach_frontend(&self) {
        self.shared.frontend.clear();
    }

    /// Number of workers whose plugin has not returned yet.
    pub fn active_workers(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Wait until every worker has returned on its own.
    ///
    /// Cancel-safe: dropping this future leaves the workers untouched.
    pub async fn wait(&self) {
        loop {
            let idle = self.idle.notified();
            if self.active_workers() == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Cancel all workers, wait up to `grace` for them, then close the search.
    ///
    /// Workers still running after `grace` are abandoned. Anything they
    /// report afterwards is ignored.
    pub async fn shutdown(&mut self, grace: Duration) -> ShutdownReport {
        if self.state == SearchState::Closed {
            return ShutdownReport::default();
        }
        self.state = SearchState::Draining;
        for worker in &self.workers {
            worker.cancel.cancel();
        }

        let deadline = tokio::time::Instant::now() + grace;
        let mut report = ShutdownReport::default();
        for worker in std::mem::take(&mut self.workers) {
            match tokio::time::timeout_at(deadline, worker.join).await {
                Ok(_) => report.finished += 1,
                Err(_) => {
                    tracing::warn!(plugin = %worker.plugin, "plugin did not stop in time; abandoning it");
                    report.abandoned.push(worker.plugin);
                }
            }
        }

        self.shared.close();
        self.state = SearchState::Closed;
        tracing::debug!(
            finished = report.finished,
            abandoned = report.abandoned.len(),
            "search closed"
        );
        report
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if self.state == SearchState::Closed {
            return;
        }
        for worker in &self.workers {
            worker.cancel.cancel();
        }
        self.shared.close();
    }
}

/// Run one plugin to completion, containing any failure to this worker.
fn run_worker(plugin: &PluginHandle, query: &Query, feed: &Feed, shared: &Shared) {
    if feed.is_cancelled() {
        return;
    }
    tracing::debug!(plugin = plugin.name(), "worker started");

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| plugin.plugin().find(query, feed)));
    let message = match outcome {
        Ok(Ok(())) => {
            tracing::debug!(plugin = plugin.name(), "worker finished");
            return;
        }
        Ok(Err(e)) => format!("{:#}", e),
        Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
    };

    if feed.is_cancelled() {
        tracing::debug!(plugin = plugin.name(), "worker stopped after cancellation: {}", message);
        return;
    }

    shared.report_failure(&PluginRuntimeError {
        plugin: plugin.name().to_string(),
        message,
    });
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
