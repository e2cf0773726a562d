//! # bookhound
//!
//! Find books and papers by running many independent finder plugins at once
//! and keeping only what matches.
//!
//! A user describes what they want as a [`Query`](models::Query). Each
//! plugin searches its own source (a library catalogue, a shadow library
//! mirror, a local shelf, ...) and reports candidates as it finds them.
//! Candidates are matched against the query on arrival and the matches are
//! handed to a display layer immediately, while slower plugins keep working.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐  handles  ┌──────────────┐  update()/log()  ┌──────────┐
//! │  Catalog  │──────────▶│ Orchestrator │─────────────────▶│ Frontend │
//! │ *.lua +   │           │  1 worker    │                  │ console/ │
//! │ builtins  │           │  per plugin  │                  │  json    │
//! └───────────┘           └──────┬───────┘                  └──────────┘
//!                          feed()│▲ matches()
//!                                ▼│
//!                         ┌──────────────┐
//!                         │   results    │
//!                         └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! hound plugin init openlibrary            # scaffold plugins/openlibrary.lua
//! hound plugin list                        # what would run
//! hound search --title dune --year ">=1965" --ext epub
//! hound search --author "Ursula K. Le Guin" --json
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | Query, candidate and item types |
//! | [`matching`] | The candidate/query match predicate |
//! | [`plugin`] | The plugin contract and the feed handed to plugins |
//! | [`plugin_script`] | Lua plugins |
//! | [`catalog`] | Plugin discovery and loading |
//! | [`orchestrator`] | Concurrent search, result collection, shutdown |
//! | [`frontend`] | Observer interface and CLI sinks |
//! | [`config`] | TOML configuration |
//! | [`error`] | Error types |
//! | [`logging`] | `tracing` setup |

pub mod catalog;
pub mod config;
pub mod error;
pub mod frontend;
pub mod logging;
mod lua_runtime;
pub mod matching;
pub mod models;
pub mod orchestrator;
pub mod plugin;
pub mod plugin_script;
