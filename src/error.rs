//! Error taxonomy for the search core.
//!
//! Failures local to one plugin ([`PluginLoadError`], [`PluginRuntimeError`])
//! are recoverable: they are logged and only that plugin is dropped. Only
//! [`CatalogError::NoPluginsFound`] is fatal, since there is nothing left to
//! search with.

use std::path::PathBuf;
use thiserror::Error;

/// A single plugin source could not be loaded. The catalog skips it.
#[derive(Debug, Clone, Error)]
#[error("failed to load plugin {}: {reason}", path.display())]
pub struct PluginLoadError {
    pub path: PathBuf,
    pub reason: String,
}

/// A plugin's `find` invocation failed or panicked. Only its worker stops.
#[derive(Debug, Clone, Error)]
#[error("plugin '{plugin}' failed: {message}")]
pub struct PluginRuntimeError {
    pub plugin: String,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("no usable plugins found (searched {searched} source(s))")]
    NoPluginsFound { searched: usize },
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("cannot {action} while the search is {state}")]
    InvalidState {
        action: &'static str,
        state: crate::orchestrator::SearchState,
    },

    #[error("no plugins attached to the search")]
    NoPlugins,

    #[error("a tokio runtime is required to start plugin workers")]
    NoRuntime,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("invalid year '{0}': expected e.g. 2004, >=1990, <2010")]
    InvalidYear(String),

    #[error("file extension must not be empty")]
    EmptyExtension,
}
