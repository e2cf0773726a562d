//! The observer protocol between the search core and a display layer.
//!
//! A [`Frontend`] is told when new results exist ([`Frontend::update`]) and
//! receives log lines ([`Frontend::log`]). The orchestrator never owns its
//! frontend: it keeps a [`FrontendSlot`] holding a weak reference, and every
//! use goes through [`FrontendSlot::try_use`], which upgrades and calls under
//! the same lock that guards the reference. A frontend dropped by its owner
//! is simply skipped.
//!
//! Two line-oriented frontends are provided for the CLI: [`ConsoleFrontend`]
//! (human output on stderr) and [`JsonFrontend`] (JSON lines on stdout).

use parking_lot::Mutex;
use std::io::Write;
use std::sync::{Arc, Weak};

use crate::models::{Item, LogLevel};
use crate::orchestrator::ResultsView;

/// A consumer of live search results.
///
/// Both methods are called from plugin worker threads while the orchestrator
/// holds its frontend lock. Implementations may read the orchestrator's
/// results, but must not attach or detach frontends from inside a callback.
pub trait Frontend: Send + Sync {
    /// New results are available.
    fn update(&self);

    /// A log line from the core or from a plugin.
    fn log(&self, level: LogLevel, message: &str);
}

/// Holds at most one weakly referenced [`Frontend`].
#[derive(Default)]
pub struct FrontendSlot {
    inner: Mutex<Option<Weak<dyn Frontend>>>,
}

impl FrontendSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `frontend`, replacing any previous one. Does not extend its lifetime.
    pub fn set(&self, frontend: &Arc<dyn Frontend>) {
        *self.inner.lock() = Some(Arc::downgrade(frontend));
    }

    pub fn clear(&self) {
        *self.inner.lock() = None;
    }

    /// Whether a frontend is attached and still alive.
    pub fn is_attached(&self) -> bool {
        self.inner
            .lock()
            .as_ref()
            .is_some_and(|weak| weak.strong_count() > 0)
    }

    /// Run `f` against the attached frontend if it is still alive.
    ///
    /// The liveness check and the call happen under one lock acquisition, so
    /// the frontend cannot be detached between them. Returns `None` when no
    /// live frontend is attached.
    pub fn try_use<R>(&self, f: impl FnOnce(&dyn Frontend) -> R) -> Option<R> {
        self.locked(|frontend| frontend.map(f))
    }

    /// Run `f` while holding the slot lock, passing the live frontend if any.
    ///
    /// Work done inside `f` is ordered with respect to every other use of
    /// the slot.
    pub(crate) fn locked<R>(&self, f: impl FnOnce(Option<&dyn Frontend>) -> R) -> R {
        let guard = self.inner.lock();
        let frontend = guard.as_ref().and_then(Weak::upgrade);
        f(frontend.as_deref())
    }
}

/// Output format for the CLI frontends.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OutputMode {
    Human,
    Json,
}

impl OutputMode {
    pub fn frontend(self, results: ResultsView, min_level: LogLevel) -> Arc<dyn Frontend> {
        match self {
            OutputMode::Human => Arc::new(ConsoleFrontend::new(results, min_level)),
            OutputMode::Json => Arc::new(JsonFrontend::new(results, min_level)),
        }
    }
}

/// Prints each newly arrived item as one human-readable line on stderr.
pub struct ConsoleFrontend {
    results: ResultsView,
    min_level: LogLevel,
    shown: Mutex<usize>,
}

impl ConsoleFrontend {
    pub fn new(results: ResultsView, min_level: LogLevel) -> Self {
        Self {
            results,
            min_level,
            shown: Mutex::new(0),
        }
    }
}

impl Frontend for ConsoleFrontend {
    fn update(&self) {
        let mut shown = self.shown.lock();
        let fresh = self.results.since(*shown);
        let mut err = std::io::stderr().lock();
        for (offset, item) in fresh.iter().enumerate() {
            let _ = writeln!(err, "{}", item_line(*shown + offset + 1, item));
        }
        let _ = err.flush();
        *shown += fresh.len();
    }

    fn log(&self, level: LogLevel, message: &str) {
        if level < self.min_level || level == LogLevel::Off {
            return;
        }
        let _ = writeln!(std::io::stderr().lock(), "{}: {}", level, message);
    }
}

/// Emits one JSON object per item on stdout and one per log line on stderr.
pub struct JsonFrontend {
    results: ResultsView,
    min_level: LogLevel,
    shown: Mutex<usize>,
}

impl JsonFrontend {
    pub fn new(results: ResultsView, min_level: LogLevel) -> Self {
        Self {
            results,
            min_level,
            shown: Mutex::new(0),
        }
    }
}

impl Frontend for JsonFrontend {
    fn update(&self) {
        let mut shown = self.shown.lock();
        let fresh = self.results.since(*shown);
        let mut out = std::io::stdout().lock();
        for item in &fresh {
            let obj = serde_json::json!({ "event": "item", "item": item });
            if let Ok(line) = serde_json::to_string(&obj) {
                let _ = writeln!(out, "{}", line);
            }
        }
        let _ = out.flush();
        *shown += fresh.len();
    }

    fn log(&self, level: LogLevel, message: &str) {
        if level < self.min_level || level == LogLevel::Off {
            return;
        }
        let obj = serde_json::json!({
            "event": "log",
            "level": level,
            "message": message,
        });
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
        }
    }
}

fn item_line(n: usize, item: &Item) -> String {
    let uri = item.misc.uris.first().map(String::as_str).unwrap_or("");
    format!("[{:>3}] {}\n      {}", n, item, uri)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        updates: AtomicUsize,
        logs: AtomicUsize,
    }

    impl Frontend for Counting {
        fn update(&self) {
            self.updates.fetch_add(1, Ordering::SeqCst);
        }

        fn log(&self, _level: LogLevel, _message: &str) {
            self.logs.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn try_use_calls_live_frontend() {
        let slot = FrontendSlot::new();
        let counting = Arc::new(Counting::default());
        let fe: Arc<dyn Frontend> = counting.clone();
        slot.set(&fe);

        assert!(slot.is_attached());
        assert_eq!(slot.try_use(|f| f.update()), Some(()));
        assert_eq!(counting.updates.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropped_frontend_is_skipped() {
        let slot = FrontendSlot::new();
        {
            let fe: Arc<dyn Frontend> = Arc::new(Counting::default());
            slot.set(&fe);
        }
        assert!(!slot.is_attached());
        assert!(slot.try_use(|f| f.update()).is_none());
    }

    #[test]
    fn clear_detaches() {
        let slot = FrontendSlot::new();
        let counting = Arc::new(Counting::default());
        let fe: Arc<dyn Frontend> = counting.clone();
        slot.set(&fe);
        slot.clear();
        assert!(slot.try_use(|f| f.log(LogLevel::Info, "x")).is_none());
        assert_eq!(counting.logs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn item_line_shows_first_uri() {
        let item = Item {
            source: "openlibrary".into(),
            nonexacts: crate::models::NonExacts {
                title: Some("Dune".into()),
                authors: vec!["Frank Herbert".into()],
                ..Default::default()
            },
            exacts: crate::models::Exacts {
                year: Some(1965),
                extension: Some("epub".into()),
                ..Default::default()
            },
            misc: crate::models::Misc {
                uris: vec!["https://a/1".into(), "https://b/2".into()],
                ..Default::default()
            },
        };
        let line = item_line(7, &item);
        assert!(line.starts_with("[  7] Dune by Frank Herbert (1965) [epub] via openlibrary"));
        assert!(line.ends_with("https://a/1"));
    }
}
