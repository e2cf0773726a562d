//! Sandboxed Lua 5.4 environment for finder plugins.
//!
//! Every plugin call gets a fresh VM from [`plugin_vm`]: dangerous standard
//! libraries are removed, the host modules below are registered, and an
//! instruction hook interrupts the script once its search is cancelled or
//! its time budget runs out. The VM runs on a blocking worker thread, so all
//! host functions are synchronous (`reqwest::blocking`, `std::thread::sleep`).
//!
//! # Host APIs
//!
//! | Module | Functions |
//! |--------|-----------|
//! | `http` | `get`, `post` |
//! | `json` | `parse`, `encode` |
//! | `env` | `get` |
//! | `log` | `trace`, `debug`, `info`, `warn`, `error` |
//! | `fs` | `read`, `list` (confined to the plugin's directory) |
//! | `base64` | `encode`, `decode` |
//! | `crypto` | `sha256`, `hmac_sha256` |
//! | `sleep` | `sleep(seconds)`, returns early with an error when cancelled |
//!
//! # Sandboxing
//!
//! `os`, `io`, `debug`, `loadfile` and `dofile` are removed from the globals.

use globset::Glob;
use hmac::{Hmac, Mac};
use mlua::prelude::*;
use mlua::LuaSerdeExt;
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::logging;
use crate::models::LogLevel;
use crate::plugin::{CancelToken, Feed};

const HOOK_INTERVAL: u32 = 10_000;
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const SLEEP_SLICE: Duration = Duration::from_millis(50);
const MAX_SLEEP_SECS: f64 = 3600.0;
const USER_AGENT: &str = concat!("bookhound/", env!("CARGO_PKG_VERSION"));

/// Where a script's log lines end up.
#[derive(Clone)]
pub(crate) enum LogSink {
    /// Straight to `tracing`, tagged with the plugin name. Used outside a search.
    Tracing(Arc<str>),
    /// Through a running search, so the attached frontend sees them too.
    Feed(Feed),
}

impl LogSink {
    pub(crate) fn emit(&self, level: LogLevel, message: &str) {
        match self {
            LogSink::Tracing(name) => logging::emit(level, Some(name), message),
            LogSink::Feed(feed) => feed.log(level, message),
        }
    }
}

/// Create a sandboxed VM with every host API registered and the interrupt
/// hook armed for `timeout`.
pub(crate) fn plugin_vm(
    sink: &LogSink,
    sandbox_root: &Path,
    cancel: &CancelToken,
    timeout: Duration,
) -> LuaResult<Lua> {
    let lua = offline_vm(sink, sandbox_root, cancel, timeout)?;
    register_http_api(&lua, cancel)?;
    register_sleep(&lua, cancel)?;
    Ok(lua)
}

/// A VM for evaluating a script outside a search, e.g. to read its
/// metadata while loading. Same sandbox and hook, but no `http` or `sleep`:
/// nothing in it blocks, so it is safe to build on an async thread.
pub(crate) fn metadata_vm(
    sink: &LogSink,
    sandbox_root: &Path,
    timeout: Duration,
) -> LuaResult<Lua> {
    offline_vm(sink, sandbox_root, &CancelToken::new(), timeout)
}

fn offline_vm(
    sink: &LogSink,
    sandbox_root: &Path,
    cancel: &CancelToken,
    timeout: Duration,
) -> LuaResult<Lua> {
    let lua = Lua::new();
    install_interrupt(&lua, cancel.clone(), timeout);

    sandbox_globals(&lua)?;
    register_json_api(&lua)?;
    register_env_api(&lua)?;
    register_log_api(&lua, sink)?;
    register_fs_api(&lua, sandbox_root)?;
    register_base64_api(&lua)?;
    register_crypto_api(&lua)?;
    Ok(lua)
}

/// Abort the running script once `cancel` is set or `timeout` has elapsed.
///
/// Checked every few thousand VM instructions; a script blocked inside a
/// host call is interrupted when that call returns.
fn install_interrupt(lua: &Lua, cancel: CancelToken, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    lua.set_hook(
        mlua::HookTriggers::new().every_nth_instruction(HOOK_INTERVAL),
        move |_lua, _debug| {
            if cancel.is_cancelled() {
                Err(cancelled())
            } else if Instant::now() > deadline {
                Err(LuaError::RuntimeError(format!(
                    "plugin timed out after {} seconds",
                    timeout.as_secs()
                )))
            } else {
                Ok(mlua::VmState::Continue)
            }
        },
    );
}

fn sandbox_globals(lua: &Lua) -> LuaResult<()> {
    let globals = lua.globals();
    for name in ["os", "io", "debug", "loadfile", "dofile"] {
        globals.set(name, LuaValue::Nil)?;
    }
    Ok(())
}

pub(crate) fn cancelled() -> LuaError {
    LuaError::RuntimeError("search cancelled".to_string())
}

fn host_error(api: &str, detail: impl fmt::Display) -> LuaError {
    LuaError::RuntimeError(format!("{}: {}", api, detail))
}

// ═══════════════════════════════════════════════════════════════════════
// Host API: http
// ═══════════════════════════════════════════════════════════════════════

/// The blocking client is built on the first request, never while the VM
/// is being set up.
#[derive(Clone, Default)]
struct LazyClient(Arc<Mutex<Option<reqwest::blocking::Client>>>);

impl LazyClient {
    fn get(&self) -> LuaResult<reqwest::blocking::Client> {
        let mut slot = self.0.lock();
        if let Some(client) = slot.as_ref() {
            return Ok(client.clone());
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|e| host_error("http", e))?;
        *slot = Some(client.clone());
        Ok(client)
    }
}

fn register_http_api(lua: &Lua, cancel: &CancelToken) -> LuaResult<()> {
    let client = LazyClient::default();
    let http = lua.create_table()?;

    // http.get(url, opts?) → response
    let (c, token) = (client.clone(), cancel.clone());
    http.set(
        "get",
        lua.create_function(move |lua, (url, opts): (String, Option<LuaTable>)| {
            send_request(lua, &token, c.get()?.get(&url), &url, opts)
        })?,
    )?;

    // http.post(url, body, opts?) → response
    let (c, token) = (client, cancel.clone());
    http.set(
        "post",
        lua.create_function(
            move |lua, (url, body, opts): (String, String, Option<LuaTable>)| {
                send_request(lua, &token, c.get()?.post(&url).body(body), &url, opts)
            },
        )?,
    )?;

    lua.globals().set("http", http)?;
    Ok(())
}

/// Apply `opts` (`headers`, `params`, `timeout`), send, and describe the
/// response as `{ status, ok, headers, body, json? }`.
fn send_request(
    lua: &Lua,
    cancel: &CancelToken,
    mut request: reqwest::blocking::RequestBuilder,
    url: &str,
    opts: Option<LuaTable>,
) -> LuaResult<LuaTable> {
    if cancel.is_cancelled() {
        return Err(cancelled());
    }

    if let Some(opts) = opts {
        if let Ok(headers) = opts.get::<LuaTable>("headers") {
            for pair in headers.pairs::<String, String>() {
                let (k, v) = pair?;
                request = request.header(k, v);
            }
        }
        if let Ok(params) = opts.get::<LuaTable>("params") {
            let params = params
                .pairs::<String, String>()
                .collect::<LuaResult<Vec<_>>>()?;
            request = request.query(&params);
        }
        if let Ok(secs) = opts.get::<f64>("timeout") {
            let timeout = Duration::try_from_secs_f64(secs).map_err(|e| host_error("http", e))?;
            request = request.timeout(timeout);
        }
    }

    let response = request
        .send()
        .map_err(|e| host_error("http", format!("{} failed: {}", url, e)))?;

    let status = response.status();
    let headers = lua.create_table()?;
    for (name, value) in response.headers() {
        if let Ok(v) = value.to_str() {
            headers.set(name.as_str(), v)?;
        }
    }
    let body = response
        .text()
        .map_err(|e| host_error("http", format!("reading body of {}: {}", url, e)))?;

    let result = lua.create_table()?;
    result.set("status", status.as_u16())?;
    result.set("ok", status.is_success())?;
    result.set("headers", headers)?;
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(&body) {
        result.set("json", to_lua(lua, &json)?)?;
    }
    result.set("body", body)?;
    Ok(result)
}

// ═══════════════════════════════════════════════════════════════════════
// Host API: json, env, log
// ═══════════════════════════════════════════════════════════════════════

fn register_json_api(lua: &Lua) -> LuaResult<()> {
    let json = lua.create_table()?;

    json.set(
        "parse",
        lua.create_function(|lua, s: String| {
            let value: serde_json::Value =
                serde_json::from_str(&s).map_err(|e| host_error("json.parse", e))?;
            to_lua(lua, &value)
        })?,
    )?;

    json.set(
        "encode",
        lua.create_function(|lua, value: LuaValue| {
            let value = lua_to_json(lua, value)?;
            serde_json::to_string(&value).map_err(|e| host_error("json.encode", e))
        })?,
    )?;

    lua.globals().set("json", json)?;
    Ok(())
}

fn register_env_api(lua: &Lua) -> LuaResult<()> {
    let env = lua.create_table()?;
    env.set(
        "get",
        lua.create_function(|_lua, name: String| Ok(std::env::var(&name).ok()))?,
    )?;
    lua.globals().set("env", env)?;
    Ok(())
}

fn register_log_api(lua: &Lua, sink: &LogSink) -> LuaResult<()> {
    let log = lua.create_table()?;
    for level in [
        LogLevel::Trace,
        LogLevel::Debug,
        LogLevel::Info,
        LogLevel::Warn,
        LogLevel::Error,
    ] {
        let sink = sink.clone();
        log.set(
            level.as_str(),
            lua.create_function(move |_lua, msg: String| {
                sink.emit(level, &msg);
                Ok(())
            })?,
        )?;
    }
    lua.globals().set("log", log)?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Host API: fs (confined to the plugin directory)
// ═══════════════════════════════════════════════════════════════════════

fn register_fs_api(lua: &Lua, sandbox_root: &Path) -> LuaResult<()> {
    let root = sandbox_root
        .canonicalize()
        .unwrap_or_else(|_| sandbox_root.to_path_buf());
    let fs = lua.create_table()?;

    // fs.read(path) → string
    let r = root.clone();
    fs.set(
        "read",
        lua.create_function(move |lua, path: String| {
            let target = confine(&r, &path, "fs.read")?;
            let bytes =
                std::fs::read(&target).map_err(|e| host_error("fs.read", format!("{}: {}", path, e)))?;
            lua.create_string(&bytes)
        })?,
    )?;

    // fs.list(dir, glob?) → [{name, path, size, is_dir}]
    fs.set(
        "list",
        lua.create_function(move |lua, (dir, pattern): (String, Option<String>)| {
            let target = confine(&root, &dir, "fs.list")?;
            let matcher = pattern
                .as_deref()
                .map(|p| Glob::new(p).map(|g| g.compile_matcher()))
                .transpose()
                .map_err(|e| host_error("fs.list", e))?;

            let entries = std::fs::read_dir(&target)
                .map_err(|e| host_error("fs.list", format!("{}: {}", dir, e)))?;
            let listing = lua.create_table()?;
            for entry in entries {
                let entry = entry.map_err(LuaError::external)?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if matcher.as_ref().is_some_and(|m| !m.is_match(&name)) {
                    continue;
                }
                let meta = entry.metadata().map_err(LuaError::external)?;
                let row = lua.create_table()?;
                row.set("name", name)?;
                row.set("path", entry.path().to_string_lossy().into_owned())?;
                row.set("size", meta.len())?;
                row.set("is_dir", meta.is_dir())?;
                listing.push(row)?;
            }
            Ok(listing)
        })?,
    )?;

    lua.globals().set("fs", fs)?;
    Ok(())
}

/// Resolve `relative` under `root`, refusing anything that escapes it.
fn confine(root: &Path, relative: &str, api: &str) -> LuaResult<std::path::PathBuf> {
    let resolved = root
        .join(relative)
        .canonicalize()
        .map_err(|e| host_error(api, format!("{}: {}", relative, e)))?;
    if !resolved.starts_with(root) {
        return Err(host_error(
            api,
            format!("path escapes plugin directory: {}", relative),
        ));
    }
    Ok(resolved)
}

// ═══════════════════════════════════════════════════════════════════════
// Host API: base64, crypto, sleep
// ═══════════════════════════════════════════════════════════════════════

fn register_base64_api(lua: &Lua) -> LuaResult<()> {
    use base64::{engine::general_purpose::STANDARD, Engine as _};

    let b64 = lua.create_table()?;
    b64.set(
        "encode",
        lua.create_function(|_lua, data: LuaString| Ok(STANDARD.encode(&data.as_bytes()[..])))?,
    )?;
    b64.set(
        "decode",
        lua.create_function(|lua, data: String| {
            let bytes = STANDARD
                .decode(data.trim())
                .map_err(|e| host_error("base64.decode", e))?;
            lua.create_string(&bytes)
        })?,
    )?;
    lua.globals().set("base64", b64)?;
    Ok(())
}

fn register_crypto_api(lua: &Lua) -> LuaResult<()> {
    let crypto = lua.create_table()?;

    crypto.set(
        "sha256",
        lua.create_function(|_lua, data: LuaString| Ok(hex::encode(Sha256::digest(&data.as_bytes()[..]))))?,
    )?;

    crypto.set(
        "hmac_sha256",
        lua.create_function(|_lua, (key, data): (LuaString, LuaString)| {
            let mut mac = Hmac::<Sha256>::new_from_slice(&key.as_bytes())
                .map_err(|e| host_error("crypto.hmac_sha256", e))?;
            mac.update(&data.as_bytes());
            Ok(hex::encode(mac.finalize().into_bytes()))
        })?,
    )?;

    lua.globals().set("crypto", crypto)?;
    Ok(())
}

fn register_sleep(lua: &Lua, cancel: &CancelToken) -> LuaResult<()> {
    let cancel = cancel.clone();
    lua.globals().set(
        "sleep",
        lua.create_function(move |_lua, seconds: f64| {
            let seconds = if seconds.is_finite() {
                seconds.clamp(0.0, MAX_SLEEP_SECS)
            } else {
                0.0
            };
            let until = Instant::now() + Duration::from_secs_f64(seconds);
            loop {
                if cancel.is_cancelled() {
                    return Err(cancelled());
                }
                let now = Instant::now();
                if now >= until {
                    return Ok(());
                }
                std::thread::sleep((until - now).min(SLEEP_SLICE));
            }
        })?,
    )?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Value conversions
// ═══════════════════════════════════════════════════════════════════════

/// Serialize any value into Lua. `None` and JSON `null` become `nil`.
pub(crate) fn to_lua<T: Serialize + ?Sized>(lua: &Lua, value: &T) -> LuaResult<LuaValue> {
    let options = mlua::SerializeOptions::new()
        .serialize_none_to_null(false)
        .serialize_unit_to_null(false);
    lua.to_value_with(value, options)
}

pub(crate) fn lua_to_json(lua: &Lua, value: LuaValue) -> LuaResult<serde_json::Value> {
    lua.from_value(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn vm(root: &Path, cancel: &CancelToken) -> Lua {
        plugin_vm(
            &LogSink::Tracing(Arc::from("test")),
            root,
            cancel,
            Duration::from_secs(30),
        )
        .unwrap()
    }

    #[test]
    fn dangerous_globals_removed() {
        let tmp = TempDir::new().unwrap();
        let lua = vm(tmp.path(), &CancelToken::new());
        let gone: bool = lua
            .load("return os == nil and io == nil and debug == nil and dofile == nil and loadfile == nil")
            .eval()
            .unwrap();
        assert!(gone);
    }

    #[test]
    fn metadata_vm_has_no_network_or_sleep() {
        let tmp = TempDir::new().unwrap();
        let lua = metadata_vm(
            &LogSink::Tracing(Arc::from("test")),
            tmp.path(),
            Duration::from_secs(5),
        )
        .unwrap();
        let offline: bool = lua
            .load("return http == nil and sleep == nil and os == nil and json ~= nil")
            .eval()
            .unwrap();
        assert!(offline);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn plugin_vm_can_be_built_and_dropped_on_async_thread() {
        let tmp = TempDir::new().unwrap();
        let lua = vm(tmp.path(), &CancelToken::new());
        let has_http: bool = lua.load("return type(http.get) == 'function'").eval().unwrap();
        assert!(has_http);
        drop(lua);
    }

    #[test]
    fn json_round_trip_through_lua() {
        let tmp = TempDir::new().unwrap();
        let lua = vm(tmp.path(), &CancelToken::new());
        let out: String = lua
            .load(r#"local t = json.parse('{"a":[1,2],"b":"x"}'); return json.encode({n = #t.a, b = t.b})"#)
            .eval()
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["n"], 2);
        assert_eq!(parsed["b"], "x");
    }

    #[test]
    fn fs_read_stays_in_sandbox() {
        let tmp = TempDir::new().unwrap();
        let inner = tmp.path().join("plugin");
        std::fs::create_dir(&inner).unwrap();
        std::fs::write(inner.join("books.txt"), "dune").unwrap();
        std::fs::write(tmp.path().join("secret.txt"), "nope").unwrap();

        let lua = vm(&inner, &CancelToken::new());
        let read: String = lua.load(r#"return fs.read("books.txt")"#).eval().unwrap();
        assert_eq!(read, "dune");

        let err = lua
            .load(r#"return fs.read("../secret.txt")"#)
            .eval::<String>()
            .unwrap_err();
        assert!(err.to_string().contains("escapes plugin directory"));
    }

    #[test]
    fn fs_list_filters_by_glob() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a.epub"), "").unwrap();
        std::fs::write(tmp.path().join("b.pdf"), "").unwrap();

        let lua = vm(tmp.path(), &CancelToken::new());
        let names: Vec<String> = lua
            .load(r#"local out = {} for _, e in ipairs(fs.list(".", "*.epub")) do out[#out+1] = e.name end return out"#)
            .eval()
            .unwrap();
        assert_eq!(names, vec!["a.epub".to_string()]);
    }

    #[test]
    fn crypto_sha256_hex() {
        let tmp = TempDir::new().unwrap();
        let lua = vm(tmp.path(), &CancelToken::new());
        let digest: String = lua.load(r#"return crypto.sha256("abc")"#).eval().unwrap();
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn cancelled_vm_interrupts_busy_loop() {
        let tmp = TempDir::new().unwrap();
        let cancel = CancelToken::new();
        let lua = vm(tmp.path(), &cancel);
        cancel.cancel();
        let err = lua.load("while true do end").exec().unwrap_err();
        assert!(err.to_string().contains("search cancelled"));
    }

    #[test]
    fn sleep_returns_early_when_cancelled() {
        let tmp = TempDir::new().unwrap();
        let cancel = CancelToken::new();
        let lua = vm(tmp.path(), &cancel);
        cancel.cancel();
        let started = Instant::now();
        assert!(lua.load("sleep(10)").exec().is_err());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn timeout_interrupts_busy_loop() {
        let tmp = TempDir::new().unwrap();
        let lua = plugin_vm(
            &LogSink::Tracing(Arc::from("test")),
            tmp.path(),
            &CancelToken::new(),
            Duration::from_millis(50),
        )
        .unwrap();
        let err = lua.load("while true do end").exec().unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
