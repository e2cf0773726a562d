//! # bookhound CLI (`hound`)
//!
//! ## Usage
//!
//! ```bash
//! hound [--config ./hound.toml] [--log-level debug] <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `hound search [fields]` | Run every plugin and print matching items as they arrive |
//! | `hound plugin list` | Show which plugins would run and which failed to load |
//! | `hound plugin test <path>` | Run one plugin script on its own |
//! | `hound plugin init <name>` | Scaffold a new plugin script |
//! | `hound completions <shell>` | Print a shell completion script |
//!
//! ## Examples
//!
//! ```bash
//! hound search --title "left hand of darkness" --ext epub
//! hound search --author "Frank Herbert" --year ">=1980" --json > hits.jsonl
//! hound search --isbn 978-0-441-17271-9
//! hound plugin test plugins/openlibrary.lua --title dune
//! ```

use anyhow::{bail, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bookhound::catalog;
use bookhound::config::{self, Config};
use bookhound::frontend::{Frontend, OutputMode};
use bookhound::logging;
use bookhound::models::{LogLevel, Query, YearSpec};
use bookhound::orchestrator::Orchestrator;
use bookhound::plugin_script;

/// Find books and papers with concurrent finder plugins.
#[derive(Parser)]
#[command(name = "hound", version, about)]
struct Cli {
    /// Path to a configuration file (TOML).
    ///
    /// Defaults to `./hound.toml`, then `<config dir>/bookhound/hound.toml`.
    /// Built-in defaults apply when neither exists.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level: trace, debug, info, warn, error, critical or off.
    /// Overrides `[log] level`; `RUST_LOG` overrides both.
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Search with every available plugin.
    ///
    /// Items are printed as soon as a plugin reports a match. The search
    /// ends when all plugins have finished, when the time limit is reached,
    /// or on Ctrl-C.
    Search {
        #[command(flatten)]
        query: QueryArgs,

        /// Print items as JSON lines on stdout.
        #[arg(long)]
        json: bool,

        /// Stop after this many seconds (0 = wait for every plugin).
        /// Overrides `[search] wait_secs`.
        #[arg(long)]
        wait: Option<u64>,
    },

    /// Manage plugin scripts.
    Plugin {
        #[command(subcommand)]
        action: PluginAction,
    },

    /// Print a completion script for `shell` to stdout.
    Completions { shell: Shell },
}

#[derive(Subcommand)]
enum PluginAction {
    /// List discovered plugins.
    List,

    /// Run a single plugin script and show what it finds.
    Test {
        path: PathBuf,

        #[command(flatten)]
        query: QueryArgs,
    },

    /// Create a plugin script from a template.
    Init {
        name: String,

        /// Directory to create the script in (default: first `[plugins] paths` entry).
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

/// Query fields. Text fields match case-insensitively by substring.
#[derive(Args, Default)]
struct QueryArgs {
    /// Author (repeatable; any one matching is enough).
    #[arg(long = "author", short = 'a')]
    authors: Vec<String>,

    #[arg(long, short = 't')]
    title: Option<String>,

    #[arg(long)]
    series: Option<String>,

    #[arg(long)]
    publisher: Option<String>,

    #[arg(long)]
    journal: Option<String>,

    #[arg(long)]
    edition: Option<String>,

    /// Publication year, optionally prefixed with <, >, <= or >=.
    #[arg(long, short = 'y')]
    year: Option<YearSpec>,

    /// File extension, e.g. epub, pdf, djvu.
    #[arg(long = "ext", short = 'e')]
    extension: Option<String>,

    #[arg(long)]
    volume: Option<u32>,

    /// Issue number.
    #[arg(long)]
    number: Option<u32>,

    #[arg(long)]
    pages: Option<u32>,

    #[arg(long, short = 'l')]
    language: Option<String>,

    /// ISBN (repeatable).
    #[arg(long = "isbn")]
    isbns: Vec<String>,
}

impl QueryArgs {
    fn build(self) -> Result<Query> {
        let mut b = Query::builder().authors(self.authors);
        if let Some(v) = self.title {
            b = b.title(v);
        }
        if let Some(v) = self.series {
            b = b.series(v);
        }
        if let Some(v) = self.publisher {
            b = b.publisher(v);
        }
        if let Some(v) = self.journal {
            b = b.journal(v);
        }
        if let Some(v) = self.edition {
            b = b.edition(v);
        }
        if let Some(v) = self.year {
            b = b.year(v);
        }
        if let Some(v) = self.extension {
            b = b.extension(&v)?;
        }
        if let Some(v) = self.volume {
            b = b.volume(v);
        }
        if let Some(v) = self.number {
            b = b.number(v);
        }
        if let Some(v) = self.pages {
            b = b.pages(v);
        }
        if let Some(v) = self.language {
            b = b.language(v);
        }
        for isbn in self.isbns {
            b = b.isbn(isbn);
        }
        Ok(b.build())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Commands that don't require config
    if let Commands::Completions { shell } = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "hound", &mut std::io::stdout());
        return Ok(());
    }

    let cfg = config::load_or_default(cli.config.as_deref())?;
    let level = cli.log_level.unwrap_or(cfg.log.level);

    match cli.command {
        Commands::Search { query, json, wait } => {
            // In JSON mode the frontend writes log events itself, keeping
            // stderr machine-readable.
            logging::init(if json { LogLevel::Off } else { level });
            run_search(&cfg, query.build()?, json, wait, level).await?;
        }
        Commands::Plugin { action } => {
            logging::init(level);
            match action {
                PluginAction::List => list_plugins(&cfg),
                PluginAction::Test { path, query } => {
                    plugin_script::test_plugin(&path, query.build()?, &cfg).await?;
                }
                PluginAction::Init { name, dir } => {
                    let dir = dir
                        .or_else(|| cfg.plugins.search_dirs().into_iter().next())
                        .unwrap_or_else(|| PathBuf::from("plugins"));
                    let path = plugin_script::scaffold_plugin(&name, &dir)?;
                    println!("Created plugin: {}", path.display());
                    println!();
                    println!("Try it:");
                    println!();
                    println!("  hound plugin test {} --title dune", path.display());
                }
            }
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}

async fn run_search(
    cfg: &Config,
    query: Query,
    json: bool,
    wait: Option<u64>,
    level: LogLevel,
) -> Result<()> {
    if query.is_empty() {
        bail!("Nothing to search for: give at least one field, e.g. --title or --author");
    }

    let catalog = catalog::load_configured(&cfg.plugins)?;
    let mut search = Orchestrator::new(query);

    // The console frontend prints items only; `tracing` already shows logs.
    // In JSON mode `tracing` is off, so notices go through the frontend.
    let (mode, frontend_level) = if json {
        (OutputMode::Json, level)
    } else {
        (OutputMode::Human, LogLevel::Off)
    };
    let frontend: Arc<dyn Frontend> = mode.frontend(search.results(), frontend_level);
    search.attach_frontend(&frontend);
    let notices = json.then_some(&*frontend);

    if let Some(fe) = notices {
        catalog.report_skipped(fe);
    }
    search.attach(catalog.into_handles())?;
    search.start()?;
    tracing::info!(plugins = search.plugins().len(), "search started");

    let limit = match wait {
        Some(0) => None,
        Some(secs) => Some(Duration::from_secs(secs)),
        None => cfg.search.wait_limit(),
    };
    tokio::select! {
        _ = search.wait() => {
            tracing::debug!("all plugins finished");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted; stopping plugins");
        }
        _ = time_limit(limit) => {
            tracing::info!("time limit reached; stopping plugins");
        }
    }

    let report = search.shutdown(cfg.search.shutdown_grace()).await;
    if !report.abandoned.is_empty() {
        let message = format!(
            "{} plugin(s) did not stop in time: {}",
            report.abandoned.len(),
            report.abandoned.join(", ")
        );
        match notices {
            Some(fe) => fe.log(LogLevel::Warn, &message),
            None => tracing::warn!("{}", message),
        }
    }

    let found = search.results().len();
    if !json {
        eprintln!("{} matching item(s)", found);
    }
    Ok(())
}

async fn time_limit(limit: Option<Duration>) {
    match limit {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

fn list_plugins(cfg: &Config) {
    let dirs = cfg.plugins.search_dirs();
    let sources = catalog::discover(&dirs, cfg.plugins.max_depth);
    if sources.is_empty() {
        println!("No plugin scripts found in:");
        for dir in &dirs {
            println!("  {}", dir.display());
        }
        println!();
        println!("Create one with: hound plugin init <name>");
        return;
    }

    match catalog::load(&sources, &cfg.plugins) {
        Ok(catalog) => {
            println!("{} plugin(s):", catalog.len());
            for handle in catalog.handles() {
                println!("  ✓ {:<20} {}", handle.name(), handle.origin());
                if !handle.description().is_empty() {
                    println!("    {}", handle.description());
                }
            }
            for skipped in catalog.skipped() {
                println!("  ✗ {}", skipped);
            }
        }
        Err(e) => println!("{}", e),
    }
}
