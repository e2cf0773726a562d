//! The plugin contract: what a finder implements and what it is handed.
//!
//! A finder implements [`SearchPlugin`]. The orchestrator calls
//! [`SearchPlugin::find`] once, on a dedicated worker thread, with the
//! immutable [`Query`] and a [`Feed`]. The plugin reports candidates through
//! [`Feed::feed`] as it finds them and returns when it is done; there is no
//! separate "finished" signal.
//!
//! # Example
//!
//! ```rust
//! use anyhow::Result;
//! use bookhound::models::{Candidate, LogLevel, Query};
//! use bookhound::plugin::{Feed, SearchPlugin};
//!
//! struct Shelf;
//!
//! impl SearchPlugin for Shelf {
//!     fn name(&self) -> &str { "shelf" }
//!
//!     fn find(&self, _query: &Query, feed: &Feed) -> Result<()> {
//!         let mut book = Candidate::default();
//!         book.nonexacts.title = Some("Dune".into());
//!         book.misc.uris.push("file:///books/dune.epub".into());
//!         feed.feed(book);
//!         feed.log(LogLevel::Debug, "shelf scanned");
//!         Ok(())
//!     }
//! }
//! ```

use anyhow::Result;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::models::{Candidate, LogLevel, Query};
use crate::orchestrator::{Ingested, Shared};

/// A finder that searches some source for items matching a query.
pub trait SearchPlugin: Send + Sync {
    /// Short identifier used in logs and on every item this plugin reports.
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Search for `query`, reporting candidates through `feed`.
    ///
    /// Runs on a blocking thread and may take as long as it needs. Long
    /// searches should poll [`Feed::is_cancelled`] and return early once it
    /// is set. An `Err` (or a panic) stops only this plugin.
    fn find(&self, query: &Query, feed: &Feed) -> Result<()>;
}

/// Where a loaded plugin came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginOrigin {
    Script(PathBuf),
    Builtin,
}

impl fmt::Display for PluginOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginOrigin::Script(path) => write!(f, "{}", path.display()),
            PluginOrigin::Builtin => f.write_str("builtin"),
        }
    }
}

/// A loaded, callable plugin. Cheap to clone.
#[derive(Clone)]
pub struct PluginHandle {
    plugin: Arc<dyn SearchPlugin>,
    origin: PluginOrigin,
}

impl PluginHandle {
    /// Wrap a compiled plugin.
    pub fn builtin(plugin: impl SearchPlugin + 'static) -> Self {
        Self {
            plugin: Arc::new(plugin),
            origin: PluginOrigin::Builtin,
        }
    }

    pub(crate) fn script(plugin: impl SearchPlugin + 'static, path: &Path) -> Self {
        Self {
            plugin: Arc::new(plugin),
            origin: PluginOrigin::Script(path.to_path_buf()),
        }
    }

    pub fn name(&self) -> &str {
        self.plugin.name()
    }

    pub fn description(&self) -> &str {
        self.plugin.description()
    }

    pub fn origin(&self) -> &PluginOrigin {
        &self.origin
    }

    pub fn plugin(&self) -> &dyn SearchPlugin {
        self.plugin.as_ref()
    }
}

impl fmt::Debug for PluginHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginHandle")
            .field("name", &self.name())
            .field("origin", &self.origin)
            .finish()
    }
}

/// Cooperative cancellation flag shared between the orchestrator and one worker.
///
/// Cancelling never interrupts a compiled plugin by force: the plugin sees it
/// only when it checks [`Feed::is_cancelled`]. Lua plugins are additionally
/// interrupted by an instruction hook.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// The handle a plugin uses to report back: candidates and log lines.
///
/// Clones share the same destination. A `Feed` stays valid after the search
/// that issued it has been shut down; calls then do nothing and
/// [`Feed::feed`] returns [`Ingested::Closed`].
#[derive(Clone)]
pub struct Feed {
    plugin: Arc<str>,
    shared: Arc<Shared>,
    cancel: CancelToken,
}

impl Feed {
    pub(crate) fn new(plugin: &str, shared: Arc<Shared>, cancel: CancelToken) -> Self {
        Self {
            plugin: Arc::from(plugin),
            shared,
            cancel,
        }
    }

    /// Name of the plugin this feed belongs to.
    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    /// Report a candidate. It is matched against the query immediately.
    pub fn feed(&self, candidate: Candidate) -> Ingested {
        self.shared.ingest(&self.plugin, candidate)
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        self.shared.log(level, Some(&self.plugin), message);
    }

    /// Whether the search has asked this plugin to stop.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }
}
