//! Plugin discovery and loading.
//!
//! ```text
//! plugin dirs ──discover()──▶ [*.lua] ──load()──▶ Catalog { handles, skipped }
//!                                                     ▲
//!                               with_builtin() ───────┘
//! ```
//!
//! A source that fails to load is logged, recorded in
//! [`Catalog::skipped`] and does not stop the others. Loading only fails
//! when nothing at all could be loaded.

use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::PluginsConfig;
use crate::error::{CatalogError, PluginLoadError};
use crate::frontend::Frontend;
use crate::models::LogLevel;
use crate::plugin::{PluginHandle, SearchPlugin};
use crate::plugin_script::ScriptPlugin;

/// Loaded plugins, plus the sources that could not be loaded.
#[derive(Debug, Default)]
pub struct Catalog {
    handles: Vec<PluginHandle>,
    skipped: Vec<PluginLoadError>,
}

impl Catalog {
    /// A catalog of already-constructed plugins.
    pub fn from_handles(handles: Vec<PluginHandle>) -> Self {
        Self {
            handles,
            skipped: Vec::new(),
        }
    }

    /// Add a compiled plugin.
    pub fn with_builtin(mut self, plugin: impl SearchPlugin + 'static) -> Self {
        self.handles.push(PluginHandle::builtin(plugin));
        self
    }

    pub fn handles(&self) -> &[PluginHandle] {
        &self.handles
    }

    pub fn skipped(&self) -> &[PluginLoadError] {
        &self.skipped
    }

    pub fn into_handles(self) -> Vec<PluginHandle> {
        self.handles
    }

    /// First plugin called `name`.
    pub fn find(&self, name: &str) -> Option<&PluginHandle> {
        self.handles.iter().find(|h| h.name() == name)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Replay load failures as warnings to a frontend attached after loading.
    pub fn report_skipped(&self, frontend: &dyn Frontend) {
        for err in &self.skipped {
            frontend.log(LogLevel::Warn, &err.to_string());
        }
    }
}

/// Every `.lua` file under `dirs`, at most `max_depth` levels down, sorted.
/// Directories that do not exist are skipped.
pub fn discover(dirs: &[PathBuf], max_depth: usize) -> Vec<PathBuf> {
    let mut found = Vec::new();
    for dir in dirs {
        if !dir.is_dir() {
            tracing::debug!(dir = %dir.display(), "plugin directory not found; skipping");
            continue;
        }
        for entry in WalkDir::new(dir).max_depth(max_depth).follow_links(true) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!("skipping unreadable entry under {}: {}", dir.display(), e);
                    continue;
                }
            };
            if entry.file_type().is_file() && is_lua(entry.path()) {
                found.push(entry.into_path());
            }
        }
    }
    found.sort();
    found.dedup();
    found
}

fn is_lua(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "lua")
}

/// Load every source, isolating failures.
///
/// Returns [`CatalogError::NoPluginsFound`] if not a single source loaded.
pub fn load(sources: &[PathBuf], config: &PluginsConfig) -> Result<Catalog, CatalogError> {
    let mut catalog = Catalog::default();

    for path in sources {
        match ScriptPlugin::load(path, config) {
            Ok(plugin) => {
                tracing::debug!(
                    plugin = plugin.name(),
                    path = %path.display(),
                    "loaded plugin"
                );
                catalog.handles.push(plugin.into_handle());
            }
            Err(e) => {
                tracing::warn!("{}", e);
                catalog.skipped.push(e);
            }
        }
    }

    warn_duplicate_names(&catalog.handles);

    if catalog.handles.is_empty() {
        return Err(CatalogError::NoPluginsFound {
            searched: sources.len(),
        });
    }
    Ok(catalog)
}

/// Discover and load plugins from the configured directories.
pub fn load_configured(config: &PluginsConfig) -> Result<Catalog, CatalogError> {
    let sources = discover(&config.search_dirs(), config.max_depth);
    load(&sources, config)
}

/// Same-named plugins are all kept; their items can only be told apart by origin.
fn warn_duplicate_names(handles: &[PluginHandle]) {
    for (i, handle) in handles.iter().enumerate() {
        if let Some(first) = handles[..i].iter().find(|h| h.name() == handle.name()) {
            tracing::warn!(
                plugin = handle.name(),
                "duplicate plugin name: {} and {}",
                first.origin(),
                handle.origin()
            );
        }
    }
}
