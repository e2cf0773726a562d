//! Lua finder plugins.
//!
//! A plugin is a single `.lua` file that defines a global `plugin` table and
//! a `plugin.find` function:
//!
//! ```lua
//! plugin = {
//!     name = "openlibrary",
//!     version = "0.1.0",
//!     description = "Search the Open Library catalogue",
//! }
//!
//! function plugin.find(query, hound, config)
//!     local resp = http.get(config.base_url .. "/search.json", {
//!         params = { title = query.title },
//!     })
//!     for _, doc in ipairs(resp.json.docs) do
//!         hound.feed({
//!             title = doc.title,
//!             authors = doc.author_name,
//!             year = doc.first_publish_year,
//!             uris = { config.base_url .. doc.key },
//!         })
//!     end
//! end
//! ```
//!
//! `query` holds the query fields (`authors`, `title`, `year`,
//! `year_modifier`, `isbns`, ...; unset fields are `nil`). `config` is the
//! plugin's `[plugins.settings.<name>]` table. `hound` is the way back:
//!
//! | Function | Effect |
//! |----------|--------|
//! | `hound.feed(candidate)` | report a candidate; returns `true` if it matched |
//! | `hound.log(level, message)` | log through the search's frontend |
//! | `hound.cancelled()` | whether the search wants this plugin to stop |
//! | `hound.plugin` | this plugin's name |
//!
//! Every call to `find` runs in a fresh sandboxed VM (see
//! [`crate::lua_runtime`]) on the worker thread the orchestrator gives it.
//! Loading evaluates the script once more without `http` and `sleep`, so
//! top-level code must not touch the network.

use anyhow::{anyhow, bail, Context, Result};
use mlua::prelude::{Lua, LuaFunction, LuaResult, LuaTable, LuaValue};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, PluginsConfig};
use crate::error::PluginLoadError;
use crate::lua_runtime::{cancelled, metadata_vm, plugin_vm, to_lua, LogSink};
use crate::models::{normalize_extension, Candidate, LogLevel, Query};
use crate::orchestrator::{Ingested, Orchestrator};
use crate::plugin::{Feed, PluginHandle, SearchPlugin};

/// A loaded Lua plugin. The script is re-evaluated for every search.
pub struct ScriptPlugin {
    name: String,
    version: Option<String>,
    description: String,
    path: PathBuf,
    source: Arc<str>,
    settings: toml::Table,
    timeout: Duration,
}

impl ScriptPlugin {
    /// Read `path`, run it once in an offline sandbox and check that it
    /// defines a usable `plugin` table.
    pub fn load(path: &Path, config: &PluginsConfig) -> Result<Self, PluginLoadError> {
        let fail = |reason: String| PluginLoadError {
            path: path.to_path_buf(),
            reason,
        };

        let source = std::fs::read_to_string(path)
            .map_err(|e| fail(format!("cannot read script: {}", e)))?;
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("plugin");
        let meta = inspect(path, &source, stem, config.timeout())
            .map_err(|e| fail(format!("{:#}", e)))?;

        Ok(Self {
            settings: config.settings_for(&meta.name),
            name: meta.name,
            version: meta.version,
            description: meta.description,
            path: path.to_path_buf(),
            source: Arc::from(source),
            timeout: config.timeout(),
        })
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn into_handle(self) -> PluginHandle {
        let path = self.path.clone();
        PluginHandle::script(self, &path)
    }

    fn sandbox_root(&self) -> &Path {
        sandbox_root(&self.path)
    }
}

impl SearchPlugin for ScriptPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn find(&self, query: &Query, feed: &Feed) -> Result<()> {
        let lua = plugin_vm(
            &LogSink::Feed(feed.clone()),
            self.sandbox_root(),
            feed.cancel_token(),
            self.timeout,
        )?;
        let plugin = exec_script(&lua, &self.path, &self.source)?;
        let find: LuaFunction = plugin.get("find")?;

        let query = to_lua(&lua, query)?;
        let hound = hound_api(&lua, feed)?;
        let config = to_lua(&lua, &self.settings)?;
        find.call::<()>((query, hound, config))
            .map_err(|e| anyhow!("plugin.find failed: {}", e))
    }
}

struct Meta {
    name: String,
    version: Option<String>,
    description: String,
}

fn inspect(path: &Path, source: &str, fallback_name: &str, timeout: Duration) -> Result<Meta> {
    let sink = LogSink::Tracing(Arc::from(fallback_name));
    let lua = metadata_vm(&sink, sandbox_root(path), timeout)?;
    let plugin = exec_script(&lua, path, source)?;

    let name = plugin
        .get::<Option<String>>("name")
        .context("plugin.name must be a string")?
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| fallback_name.to_string());
    let version = plugin
        .get::<Option<String>>("version")
        .context("plugin.version must be a string")?;
    let description = plugin
        .get::<Option<String>>("description")
        .context("plugin.description must be a string")?
        .unwrap_or_default();

    Ok(Meta {
        name,
        version,
        description,
    })
}

/// Evaluate the script and return its `plugin` table, checking `plugin.find`.
fn exec_script(lua: &Lua, path: &Path, source: &str) -> Result<LuaTable> {
    lua.load(source)
        .set_name(format!("@{}", path.display()))
        .exec()
        .map_err(|e| anyhow!("script failed to run: {}", e))?;

    let plugin = lua
        .globals()
        .get::<LuaTable>("plugin")
        .map_err(|_| anyhow!("script must define a global 'plugin' table"))?;
    plugin
        .get::<LuaFunction>("find")
        .map_err(|_| anyhow!("plugin.find function not defined"))?;
    Ok(plugin)
}

fn sandbox_root(path: &Path) -> &Path {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    }
}

// ═══════════════════════════════════════════════════════════════════════
// The `hound` table
// ═══════════════════════════════════════════════════════════════════════

fn hound_api(lua: &Lua, feed: &Feed) -> LuaResult<LuaTable> {
    let hound = lua.create_table()?;
    hound.set("plugin", feed.plugin())?;

    // hound.feed(candidate) → matched?
    let f = feed.clone();
    hound.set(
        "feed",
        lua.create_function(move |_lua, table: LuaTable| {
            if f.is_cancelled() {
                return Err(cancelled());
            }
            let candidate = table_to_candidate(&table, &|msg| f.log(LogLevel::Warn, msg));
            Ok(f.feed(candidate) == Ingested::Accepted)
        })?,
    )?;

    // hound.log(level, message)
    let f = feed.clone();
    hound.set(
        "log",
        lua.create_function(move |_lua, (level, message): (String, String)| {
            if f.is_cancelled() {
                return Err(cancelled());
            }
            f.log(level.parse().unwrap_or(LogLevel::Info), &message);
            Ok(())
        })?,
    )?;

    let f = feed.clone();
    hound.set(
        "cancelled",
        lua.create_function(move |_lua, ()| Ok(f.is_cancelled()))?,
    )?;

    Ok(hound)
}

// ═══════════════════════════════════════════════════════════════════════
// Lua table → Candidate
// ═══════════════════════════════════════════════════════════════════════

/// Build a candidate from a plugin's table. Fields of the wrong type are
/// reported through `warn` and left unset; the rest of the table still counts.
fn table_to_candidate(table: &LuaTable, warn: &dyn Fn(&str)) -> Candidate {
    let mut c = Candidate::default();

    c.nonexacts.authors = list(table, "authors", warn);
    c.nonexacts.title = text(table, "title", warn);
    c.nonexacts.series = text(table, "series", warn);
    c.nonexacts.publisher = text(table, "publisher", warn);
    c.nonexacts.journal = text(table, "journal", warn);
    c.nonexacts.edition = text(table, "edition", warn);

    c.exacts.year = number(table, "year", warn);
    c.exacts.extension = text(table, "extension", warn)
        .map(|e| normalize_extension(&e))
        .filter(|e| !e.is_empty());
    c.exacts.volume = number(table, "volume", warn);
    c.exacts.number = number(table, "number", warn);
    c.exacts.pages = number(table, "pages", warn);
    c.exacts.language = text(table, "language", warn);

    c.misc.isbns = list(table, "isbns", warn);
    c.misc.uris = list(table, "uris", warn);
    c.misc.identifiers = list(table, "identifiers", warn);
    c
}

fn field(table: &LuaTable, key: &str, warn: &dyn Fn(&str)) -> Option<LuaValue> {
    match table.get::<LuaValue>(key) {
        Ok(LuaValue::Nil) => None,
        Ok(value) => Some(value),
        Err(e) => {
            warn(&format!("ignoring field '{}': {}", key, e));
            None
        }
    }
}

/// Strings and numbers become trimmed text; blank text counts as unset.
fn scalar_text(value: &LuaValue) -> Option<Option<String>> {
    let s = match value {
        LuaValue::String(s) => s.to_str().ok()?.trim().to_string(),
        LuaValue::Integer(i) => i.to_string(),
        LuaValue::Number(n) => n.to_string(),
        _ => return None,
    };
    Some((!s.is_empty()).then_some(s))
}

fn text(table: &LuaTable, key: &str, warn: &dyn Fn(&str)) -> Option<String> {
    let value = field(table, key, warn)?;
    match scalar_text(&value) {
        Some(s) => s,
        None => {
            warn(&format!(
                "ignoring field '{}': expected a string, got {}",
                key,
                value.type_name()
            ));
            None
        }
    }
}

/// A single string or an array of strings.
fn list(table: &LuaTable, key: &str, warn: &dyn Fn(&str)) -> Vec<String> {
    let Some(value) = field(table, key, warn) else {
        return Vec::new();
    };
    match &value {
        LuaValue::Table(items) => {
            let mut out = Vec::new();
            for item in items.sequence_values::<LuaValue>() {
                match item.as_ref().map(scalar_text) {
                    Ok(Some(Some(s))) => out.push(s),
                    Ok(Some(None)) => {}
                    _ => warn(&format!("ignoring a non-string entry in '{}'", key)),
                }
            }
            out
        }
        other => match scalar_text(other) {
            Some(s) => s.into_iter().collect(),
            None => {
                warn(&format!(
                    "ignoring field '{}': expected a string or an array, got {}",
                    key,
                    other.type_name()
                ));
                Vec::new()
            }
        },
    }
}

/// An integer, or a string holding one.
fn number<T>(table: &LuaTable, key: &str, warn: &dyn Fn(&str)) -> Option<T>
where
    T: TryFrom<i64> + FromStr,
{
    let value = field(table, key, warn)?;
    let parsed = match &value {
        LuaValue::Integer(i) => T::try_from(*i).ok(),
        LuaValue::Number(n) if n.fract() == 0.0 => T::try_from(*n as i64).ok(),
        LuaValue::String(s) => s.to_str().ok().and_then(|s| s.trim().parse().ok()),
        _ => None,
    };
    if parsed.is_none() {
        warn(&format!(
            "ignoring field '{}': expected an integer, got {}",
            key,
            value.type_name()
        ));
    }
    parsed
}

// ═══════════════════════════════════════════════════════════════════════
// Scaffolding and test runs
// ═══════════════════════════════════════════════════════════════════════

/// Write a commented plugin template to `<dir>/<name>.lua`.
pub fn scaffold_plugin(name: &str, dir: &Path) -> Result<PathBuf> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        bail!(
            "Invalid plugin name '{}': use letters, digits, '-' and '_'",
            name
        );
    }

    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    let path = dir.join(format!("{}.lua", name));
    if path.exists() {
        bail!("Plugin script already exists: {}", path.display());
    }

    let template = format!(
        r#"--[[
  bookhound plugin: {name}

  Settings (optional, in hound.toml):

    [plugins.settings.{name}]
    # base_url = "https://example.org"
    # api_key = "${{{name_upper}_API_KEY}}"

  Try it:

    hound plugin test {path} --title "dune"
]]

plugin = {{
    name = "{name}",
    version = "0.1.0",
    description = "",
}}

--- Search for `query` and report each hit with hound.feed().
--- @param query table  title, authors, year, year_modifier, extension, isbns, ...
--- @param hound table  feed(candidate) -> bool, log(level, msg), cancelled() -> bool
--- @param config table [plugins.settings.{name}] from hound.toml
function plugin.find(query, hound, config)
    -- local resp = http.get(config.base_url .. "/search", {{
    --     params = {{ q = query.title }},
    -- }})
    -- if not resp.ok then
    --     hound.log("error", "search failed: HTTP " .. resp.status)
    --     return
    -- end
    -- for _, hit in ipairs(resp.json.results) do
    --     if hound.cancelled() then return end
    --     hound.feed({{
    --         title = hit.title,
    --         authors = hit.authors,
    --         year = hit.year,
    --         extension = hit.format,
    --         uris = {{ hit.download_url }},
    --     }})
    -- end
    hound.log("info", "nothing to search yet")
end
"#,
        name = name,
        name_upper = name.to_uppercase().replace('-', "_"),
        path = path.display(),
    );

    std::fs::write(&path, template)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}

/// Load one script and run it alone against `query`, printing what it found.
pub async fn test_plugin(path: &Path, query: Query, config: &Config) -> Result<()> {
    let plugin = ScriptPlugin::load(path, &config.plugins)?;
    println!("Testing plugin: {} ({})", plugin.name(), path.display());
    println!("  ✓ Script loaded");
    if let Some(version) = plugin.version() {
        println!("  ✓ Version {}", version);
    }

    let mut search = Orchestrator::new(query);
    search.attach(vec![plugin.into_handle()])?;
    search.start()?;

    let limit = config.plugins.timeout() + config.search.shutdown_grace();
    let finished = tokio::time::timeout(limit, search.wait()).await.is_ok();
    let report = search.shutdown(config.search.shutdown_grace()).await;
    if !finished || !report.abandoned.is_empty() {
        println!("  ✗ Plugin did not finish within {}s", limit.as_secs());
    } else {
        println!("  ✓ find() returned");
    }

    let items = search.results().snapshot();
    println!("  ✓ {} matching items", items.len());
    if items.is_empty() {
        return Ok(());
    }

    println!();
    let show = items.len().min(5);
    println!("Items (first {}):", show);
    for (i, item) in items.iter().take(show).enumerate() {
        println!("  [{}] {}", i, item);
        for uri in &item.misc.uris {
            println!("      {}", uri);
        }
    }
    if items.len() > show {
        println!("  ... and {} more", items.len() - show);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    fn candidate_from(lua_table: &str) -> (Candidate, Vec<String>) {
        let lua = Lua::new();
        let table: LuaTable = lua.load(lua_table).eval().unwrap();
        let warnings = RefCell::new(Vec::new());
        let c = table_to_candidate(&table, &|m| warnings.borrow_mut().push(m.to_string()));
        (c, warnings.into_inner())
    }

    #[test]
    fn load_reads_metadata() {
        let tmp = TempDir::new().unwrap();
        let path = write(
            tmp.path(),
            "shelf.lua",
            r#"plugin = { name = "my-shelf", version = "1.2.0", description = "Local shelf" }
               function plugin.find(query, hound, config) end"#,
        );
        let plugin = ScriptPlugin::load(&path, &PluginsConfig::default()).unwrap();
        assert_eq!(plugin.name(), "my-shelf");
        assert_eq!(plugin.version(), Some("1.2.0"));
        assert_eq!(plugin.description(), "Local shelf");
    }

    #[test]
    fn name_defaults_to_file_stem() {
        let tmp = TempDir::new().unwrap();
        let path = write(
            tmp.path(),
            "anon.lua",
            "plugin = {} function plugin.find() end",
        );
        let plugin = ScriptPlugin::load(&path, &PluginsConfig::default()).unwrap();
        assert_eq!(plugin.name(), "anon");
        assert_eq!(plugin.version(), None);
    }

    #[test]
    fn load_rejects_missing_find() {
        let tmp = TempDir::new().unwrap();
        let path = write(tmp.path(), "nofind.lua", r#"plugin = { name = "x" }"#);
        let err = ScriptPlugin::load(&path, &PluginsConfig::default())
            .err()
            .unwrap();
        assert_eq!(err.path, path);
        assert!(err.reason.contains("plugin.find"));
    }

    #[test]
    fn load_rejects_syntax_errors() {
        let tmp = TempDir::new().unwrap();
        let path = write(tmp.path(), "broken.lua", "plugin = {");
        let err = ScriptPlugin::load(&path, &PluginsConfig::default())
            .err()
            .unwrap();
        assert!(err.reason.contains("script failed to run"));
    }

    #[test]
    fn load_rejects_missing_file() {
        let tmp = TempDir::new().unwrap();
        let err = ScriptPlugin::load(&tmp.path().join("gone.lua"), &PluginsConfig::default())
            .err()
            .unwrap();
        assert!(err.reason.contains("cannot read script"));
    }

    #[test]
    fn candidate_accepts_strings_and_arrays() {
        let (c, warnings) = candidate_from(
            r#"return {
                title = " Dune ",
                authors = "Frank Herbert",
                year = "1965",
                extension = ".EPUB",
                pages = 412,
                isbns = { "9780441172719", 441013597 },
                uris = { "https://example.org/dune.epub" },
            }"#,
        );
        assert!(warnings.is_empty(), "{:?}", warnings);
        assert_eq!(c.nonexacts.title.as_deref(), Some("Dune"));
        assert_eq!(c.nonexacts.authors, vec!["Frank Herbert"]);
        assert_eq!(c.exacts.year, Some(1965));
        assert_eq!(c.exacts.extension.as_deref(), Some("epub"));
        assert_eq!(c.exacts.pages, Some(412));
        assert_eq!(c.misc.isbns, vec!["9780441172719", "441013597"]);
        assert_eq!(c.misc.uris.len(), 1);
    }

    #[test]
    fn candidate_skips_bad_fields_with_warning() {
        let (c, warnings) = candidate_from(
            r#"return { title = { "nested" }, year = "soon", pages = -3, uris = "magnet:?xt=1" }"#,
        );
        assert_eq!(c.nonexacts.title, None);
        assert_eq!(c.exacts.year, None);
        assert_eq!(c.exacts.pages, None);
        assert_eq!(c.misc.uris, vec!["magnet:?xt=1"]);
        assert_eq!(warnings.len(), 3);
        assert!(warnings.iter().any(|w| w.contains("'title'")));
    }

    #[test]
    fn scaffold_writes_loadable_template() {
        let tmp = TempDir::new().unwrap();
        let path = scaffold_plugin("my-finder", tmp.path()).unwrap();
        assert!(path.ends_with("my-finder.lua"));

        let plugin = ScriptPlugin::load(&path, &PluginsConfig::default()).unwrap();
        assert_eq!(plugin.name(), "my-finder");

        assert!(scaffold_plugin("my-finder", tmp.path()).is_err());
        assert!(scaffold_plugin("../escape", tmp.path()).is_err());
    }
}
