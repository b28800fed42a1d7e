//! C-compatible FFI wrappers around vireo-core and vireo-browser.
//!
//! Complex values cross the boundary as JSON. Callers must free returned
//! strings with `vireo_free_string`.
//!
//! Every extern "C" function is wrapped in `ffi_catch` so a Rust panic never
//! unwinds into Swift. Handles are opaque tokens looked up in a global
//! registry; they are never dereferenced.
#![allow(clippy::not_unsafe_ptr_arg_deref)]

use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use vireo_browser::{Browser, BrowserCommand, Compositor, SharedBrowser, SurfaceOpLog, Viewport, WindowId};
use vireo_core::agent::{AgentEvent, AgentLoop};
use vireo_core::config::ConfigStore;
use vireo_core::mcp::{McpEvent, McpManager};
use vireo_core::openai::OpenAiProvider;
use vireo_core::tools::{BrowserHost, ToolDispatcher};

fn ffi_catch<T>(fallback: T, f: impl FnOnce() -> T + std::panic::UnwindSafe) -> T {
    match catch_unwind(f) {
        Ok(v) => v,
        Err(payload) => {
            let msg = if let Some(s) = payload.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic payload".to_string()
            };
            log::error!("FFI panic caught: {}", msg);
            fallback
        }
    }
}

fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).try_init();
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn to_rust_str(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    // SAFETY: Caller guarantees `ptr` is a valid, null-terminated C string
    // that stays alive for the duration of this call.
    unsafe { CStr::from_ptr(ptr) }.to_str().ok().map(String::from)
}

fn to_c_string(s: &str) -> *mut c_char {
    match CString::new(s) {
        Ok(cs) => cs.into_raw(),
        Err(_) => {
            log::warn!("String contains interior NUL bytes, sanitizing ({} chars)", s.len());
            let sanitized: String = s.chars().filter(|&c| c != '\0').collect();
            CString::new(sanitized).unwrap_or_default().into_raw()
        }
    }
}

fn error_json(message: impl std::fmt::Display) -> *mut c_char {
    to_c_string(&serde_json::json!({ "error": message.to_string() }).to_string())
}

fn ok_json(value: &serde_json::Value) -> *mut c_char {
    to_c_string(&serde_json::json!({ "ok": value }).to_string())
}

/// Handle registry keyed by the address of a boxed opaque token.
struct HandleRegistry<T> {
    entries: Mutex<HashMap<usize, Arc<T>>>,
}

impl<T> HandleRegistry<T> {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn insert<H>(&self, handle: *mut H, inner: Arc<T>) {
        self.entries.lock().insert(handle as usize, inner);
    }

    /// Clone the entry out so the registry lock is not held while `f` runs.
    fn with<H, R>(&self, handle: *mut H, default: R, f: impl FnOnce(&T) -> R) -> R {
        if handle.is_null() {
            return default;
        }
        let inner = self.entries.lock().get(&(handle as usize)).cloned();
        match inner {
            Some(inner) => f(&inner),
            None => {
                log::warn!("Attempted to use an invalid or freed handle");
                default
            }
        }
    }

    fn remove<H>(&self, handle: *mut H) -> Option<Arc<T>> {
        if handle.is_null() {
            return None;
        }
        self.entries.lock().remove(&(handle as usize))
    }
}

// ---------------------------------------------------------------------------
// Memory management
// ---------------------------------------------------------------------------

/// Free a string previously returned by a `vireo_*` function.
#[no_mangle]
pub extern "C" fn vireo_free_string(s: *mut c_char) {
    ffi_catch(
        (),
        AssertUnwindSafe(|| {
            if !s.is_null() {
                // SAFETY: `s` came from `CString::into_raw` in `to_c_string`.
                unsafe {
                    drop(CString::from_raw(s));
                }
            }
        }),
    );
}

// ---------------------------------------------------------------------------
// Browser state
// ---------------------------------------------------------------------------

struct BrowserInner {
    shared: SharedBrowser,
    compositors: Mutex<HashMap<WindowId, Compositor>>,
}

fn browser_registry() -> &'static HandleRegistry<BrowserInner> {
    static REGISTRY: OnceLock<HandleRegistry<BrowserInner>> = OnceLock::new();
    REGISTRY.get_or_init(HandleRegistry::new)
}

/// Opaque handle token for the browser state. Never dereferenced.
pub struct BrowserHandle {
    _private: (),
}

/// Create the browser state. Free it with `vireo_browser_free`.
#[no_mangle]
pub extern "C" fn vireo_browser_new() -> *mut BrowserHandle {
    ffi_catch(
        std::ptr::null_mut(),
        AssertUnwindSafe(|| {
            init_logging();
            let inner = Arc::new(BrowserInner {
                shared: SharedBrowser::new(Browser::new()),
                compositors: Mutex::new(HashMap::new()),
            });
            let handle = Box::into_raw(Box::new(BrowserHandle { _private: () }));
            browser_registry().insert(handle, inner);
            handle
        }),
    )
}

#[no_mangle]
pub extern "C" fn vireo_browser_free(handle: *mut BrowserHandle) {
    ffi_catch(
        (),
        AssertUnwindSafe(|| {
            if browser_registry().remove(handle).is_none() {
                log::warn!("vireo_browser_free called on an unknown handle");
                return;
            }
            // SAFETY: `handle` was allocated by `Box::into_raw` in
            // `vireo_browser_new`; the registry removal above succeeds once.
            unsafe {
                drop(Box::from_raw(handle));
            }
        }),
    );
}

/// Run one JSON-encoded `BrowserCommand`.
///
/// Returns `{"ok": <result>}` or `{"error": "..."}`.
#[no_mangle]
pub extern "C" fn vireo_browser_command(handle: *mut BrowserHandle, command_json: *const c_char) -> *mut c_char {
    ffi_catch(
        std::ptr::null_mut(),
        AssertUnwindSafe(|| {
            let Some(json) = to_rust_str(command_json) else {
                return error_json("invalid command string");
            };
            let command: BrowserCommand = match serde_json::from_str(&json) {
                Ok(command) => command,
                Err(e) => return error_json(format!("invalid command: {}", e)),
            };
            browser_registry().with(handle, error_json("invalid handle"), |inner| {
                let closed_window = match &command {
                    BrowserCommand::CloseWindow { window } => Some(*window),
                    _ => None,
                };
                match inner.shared.execute(command) {
                    Ok(value) => {
                        if let Some(window) = closed_window {
                            inner.compositors.lock().remove(&window);
                        }
                        ok_json(&value)
                    }
                    Err(e) => error_json(e),
                }
            })
        }),
    )
}

/// Bring the window's surfaces in line with its state for a viewport of
/// `width` x `height`.
///
/// Returns a JSON array of surface operations for the frontend to apply in
/// order, or `{"error": "..."}`.
#[no_mangle]
pub extern "C" fn vireo_browser_reconcile(
    handle: *mut BrowserHandle,
    window: u64,
    width: f64,
    height: f64,
) -> *mut c_char {
    ffi_catch(
        std::ptr::null_mut(),
        AssertUnwindSafe(|| {
            browser_registry().with(handle, error_json("invalid handle"), |inner| {
                let window = WindowId(window);
                let viewport = Viewport { width, height };
                let mut compositors = inner.compositors.lock();
                let compositor = compositors.entry(window).or_default();
                let mut ops = SurfaceOpLog::new();
                let result = inner
                    .shared
                    .with(|browser| browser.reconcile(window, viewport, compositor, &mut ops));
                match result {
                    Ok(_) => match serde_json::to_string(ops.ops()) {
                        Ok(json) => to_c_string(&json),
                        Err(e) => error_json(e),
                    },
                    Err(e) => error_json(e),
                }
            })
        }),
    )
}

/// Poll for requests the frontend must fulfil (script evaluation).
///
/// Returns a JSON event, or null when none are pending.
#[no_mangle]
pub extern "C" fn vireo_browser_poll_event(handle: *mut BrowserHandle) -> *mut c_char {
    ffi_catch(
        std::ptr::null_mut(),
        AssertUnwindSafe(|| {
            browser_registry().with(handle, std::ptr::null_mut(), |inner| {
                match inner.shared.poll_event() {
                    Some(event) => match serde_json::to_string(&event) {
                        Ok(json) => to_c_string(&json),
                        Err(e) => {
                            log::error!("Failed to serialize browser event: {}", e);
                            std::ptr::null_mut()
                        }
                    },
                    None => std::ptr::null_mut(),
                }
            })
        }),
    )
}

/// Answer an `evaluate_script` request. A null `error` means success with
/// `result` as the script's output.
///
/// Returns false when nothing was waiting for this request.
#[no_mangle]
pub extern "C" fn vireo_browser_complete_script(
    handle: *mut BrowserHandle,
    request_id: u64,
    result: *const c_char,
    error: *const c_char,
) -> bool {
    ffi_catch(
        false,
        AssertUnwindSafe(|| {
            let outcome = match to_rust_str(error) {
                Some(error) => Err(error),
                None => Ok(to_rust_str(result).unwrap_or_default()),
            };
            browser_registry().with(handle, false, |inner| inner.shared.complete_script(request_id, outcome))
        }),
    )
}

// ---------------------------------------------------------------------------
// Assistant
// ---------------------------------------------------------------------------

struct AssistantInner {
    runtime: Arc<Runtime>,
    agent: Mutex<AgentLoop<OpenAiProvider>>,
    mcp: Arc<McpManager>,
    /// Token of the turn in flight, readable while `agent` is locked.
    cancel: Mutex<CancellationToken>,
    agent_events: Mutex<mpsc::UnboundedReceiver<AgentEvent>>,
    mcp_events: Mutex<mpsc::UnboundedReceiver<McpEvent>>,
}

fn assistant_registry() -> &'static HandleRegistry<AssistantInner> {
    static REGISTRY: OnceLock<HandleRegistry<AssistantInner>> = OnceLock::new();
    REGISTRY.get_or_init(HandleRegistry::new)
}

/// Opaque handle token for the assistant. Never dereferenced.
pub struct AssistantHandle {
    _private: (),
}

fn build_assistant(browser: Option<SharedBrowser>, config_path: Option<String>) -> Result<AssistantInner, String> {
    let store = match config_path {
        Some(path) => ConfigStore::load_or_default(path),
        None => ConfigStore::open_default().map_err(|e| e.to_string())?,
    };
    let config = store.config();
    let provider_config = config
        .provider()
        .ok_or_else(|| "No model provider is configured".to_string())?;
    let provider = OpenAiProvider::from_config(provider_config).map_err(|e| e.to_string())?;

    let runtime = Arc::new(Runtime::new().map_err(|e| format!("Failed to create Tokio runtime: {}", e))?);
    let (mcp_tx, mcp_rx) = mpsc::unbounded_channel();
    let mcp = Arc::new(McpManager::new(mcp_tx));

    let servers = config.mcp_servers.clone();
    let manager = Arc::clone(&mcp);
    runtime.spawn(async move {
        manager.sync(&servers).await;
    });

    let host = browser.map(|shared| Arc::new(shared) as Arc<dyn BrowserHost>);
    let dispatcher = Arc::new(ToolDispatcher::new(host, Arc::clone(&mcp)));
    let (agent_tx, agent_rx) = mpsc::unbounded_channel();
    let agent = AgentLoop::new(provider, dispatcher, config.agent_settings(), agent_tx);
    let cancel = agent.cancel_token();

    Ok(AssistantInner {
        runtime,
        agent: Mutex::new(agent),
        mcp,
        cancel: Mutex::new(cancel),
        agent_events: Mutex::new(agent_rx),
        mcp_events: Mutex::new(mcp_rx),
    })
}

/// Create the assistant from the config at `config_path` (null for the
/// default location). Native browser tools act on `browser` when it is not
/// null.
///
/// Returns null if no provider is configured. Free with `vireo_assistant_free`.
#[no_mangle]
pub extern "C" fn vireo_assistant_new(browser: *mut BrowserHandle, config_path: *const c_char) -> *mut AssistantHandle {
    ffi_catch(
        std::ptr::null_mut(),
        AssertUnwindSafe(|| {
            init_logging();
            let shared = browser_registry().with(browser, None, |inner| Some(inner.shared.clone()));
            match build_assistant(shared, to_rust_str(config_path)) {
                Ok(inner) => {
                    let handle = Box::into_raw(Box::new(AssistantHandle { _private: () }));
                    assistant_registry().insert(handle, Arc::new(inner));
                    handle
                }
                Err(e) => {
                    log::error!("Failed to create assistant: {}", e);
                    std::ptr::null_mut()
                }
            }
        }),
    )
}

/// Run one user turn to completion. Blocks the calling thread; call it off
/// the main thread and drain `vireo_assistant_poll_event` meanwhile.
///
/// Returns the JSON turn outcome.
#[no_mangle]
pub extern "C" fn vireo_assistant_send(handle: *mut AssistantHandle, text: *const c_char) -> *mut c_char {
    ffi_catch(
        std::ptr::null_mut(),
        AssertUnwindSafe(|| {
            let Some(text) = to_rust_str(text) else {
                return error_json("invalid message text");
            };
            assistant_registry().with(handle, error_json("invalid handle"), |inner| {
                let mut agent = inner.agent.lock();
                *inner.cancel.lock() = agent.cancel_token();
                let outcome = inner.runtime.block_on(agent.send_message(&text));
                *inner.cancel.lock() = agent.cancel_token();
                match serde_json::to_string(&outcome) {
                    Ok(json) => to_c_string(&json),
                    Err(e) => error_json(e),
                }
            })
        }),
    )
}

/// Cancel the turn in flight. Safe to call from any thread.
#[no_mangle]
pub extern "C" fn vireo_assistant_cancel(handle: *mut AssistantHandle) {
    ffi_catch(
        (),
        AssertUnwindSafe(|| {
            assistant_registry().with(handle, (), |inner| inner.cancel.lock().cancel());
        }),
    );
}

/// Clear the conversation. Waits for a running turn to finish.
#[no_mangle]
pub extern "C" fn vireo_assistant_reset(handle: *mut AssistantHandle) {
    ffi_catch(
        (),
        AssertUnwindSafe(|| {
            assistant_registry().with(handle, (), |inner| {
                let mut agent = inner.agent.lock();
                agent.reset();
                *inner.cancel.lock() = agent.cancel_token();
            });
        }),
    );
}

/// Poll for assistant activity: agent events first, then MCP server events.
///
/// Returns `{"source": "agent" | "mcp", "event": {...}}`, or null when none
/// are pending.
#[no_mangle]
pub extern "C" fn vireo_assistant_poll_event(handle: *mut AssistantHandle) -> *mut c_char {
    ffi_catch(
        std::ptr::null_mut(),
        AssertUnwindSafe(|| {
            assistant_registry().with(handle, std::ptr::null_mut(), |inner| {
                let event = if let Ok(event) = inner.agent_events.lock().try_recv() {
                    serde_json::to_value(&event).map(|e| serde_json::json!({ "source": "agent", "event": e }))
                } else if let Ok(event) = inner.mcp_events.lock().try_recv() {
                    serde_json::to_value(&event).map(|e| serde_json::json!({ "source": "mcp", "event": e }))
                } else {
                    return std::ptr::null_mut();
                };
                match event {
                    Ok(json) => to_c_string(&json.to_string()),
                    Err(e) => {
                        log::error!("Failed to serialize assistant event: {}", e);
                        std::ptr::null_mut()
                    }
                }
            })
        }),
    )
}

/// Connection state of every MCP server as a JSON object keyed by server id.
#[no_mangle]
pub extern "C" fn vireo_assistant_mcp_states(handle: *mut AssistantHandle) -> *mut c_char {
    ffi_catch(
        std::ptr::null_mut(),
        AssertUnwindSafe(|| {
            assistant_registry().with(handle, error_json("invalid handle"), |inner| {
                let states: serde_json::Map<String, serde_json::Value> = inner
                    .mcp
                    .states()
                    .into_iter()
                    .filter_map(|(id, state)| serde_json::to_value(state).ok().map(|s| (id, s)))
                    .collect();
                to_c_string(&serde_json::Value::Object(states).to_string())
            })
        }),
    )
}

/// Free the assistant. Cancels any running turn and disconnects every MCP
/// server.
#[no_mangle]
pub extern "C" fn vireo_assistant_free(handle: *mut AssistantHandle) {
    ffi_catch(
        (),
        AssertUnwindSafe(|| {
            let Some(inner) = assistant_registry().remove(handle) else {
                log::warn!("vireo_assistant_free called on an unknown handle");
                return;
            };
            inner.cancel.lock().cancel();
            inner.mcp.disconnect_all();
            // SAFETY: `handle` was allocated by `Box::into_raw` in
            // `vireo_assistant_new`; the registry removal above succeeds once.
            unsafe {
                drop(Box::from_raw(handle));
            }
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(handle: *mut BrowserHandle, json: &str) -> serde_json::Value {
        let json = CString::new(json).unwrap();
        let out = vireo_browser_command(handle, json.as_ptr());
        let text = unsafe { CStr::from_ptr(out) }.to_str().unwrap().to_string();
        vireo_free_string(out);
        serde_json::from_str(&text).unwrap()
    }

    fn take(ptr: *mut c_char) -> Option<String> {
        if ptr.is_null() {
            return None;
        }
        let text = unsafe { CStr::from_ptr(ptr) }.to_str().unwrap().to_string();
        vireo_free_string(ptr);
        Some(text)
    }

    #[test]
    fn browser_commands_and_reconcile_round_through_json() {
        let handle = vireo_browser_new();
        assert!(!handle.is_null());

        let window = call(handle, r#"{"type":"open_window"}"#)["ok"]["window"].as_u64().unwrap();
        let created = call(
            handle,
            &format!(r#"{{"type":"create_tab","window":{},"url":"https://a.example"}}"#, window),
        );
        let tab = created["ok"]["tab"].clone();

        let ops = take(vireo_browser_reconcile(handle, window, 800.0, 600.0)).unwrap();
        let ops: serde_json::Value = serde_json::from_str(&ops).unwrap();
        assert_eq!(ops[0], serde_json::json!({"op": "create", "tab": tab}));

        let unchanged = take(vireo_browser_reconcile(handle, window, 800.0, 600.0)).unwrap();
        assert_eq!(unchanged, "[]");

        let err = call(handle, r#"{"type":"close_tab","tab":999}"#);
        assert_eq!(err["error"], "Tab 999 not found");
        let bad = call(handle, r#"{"type":"nope"}"#);
        assert!(bad["error"].as_str().unwrap().starts_with("invalid command"));

        vireo_browser_free(handle);
        let stale = call(handle, r#"{"type":"open_window"}"#);
        assert_eq!(stale["error"], "invalid handle");
    }

    #[test]
    fn null_arguments_are_rejected() {
        assert!(vireo_browser_poll_event(std::ptr::null_mut()).is_null());
        assert!(!vireo_browser_complete_script(std::ptr::null_mut(), 1, std::ptr::null(), std::ptr::null()));
        vireo_free_string(std::ptr::null_mut());
        vireo_browser_free(std::ptr::null_mut());
        vireo_assistant_cancel(std::ptr::null_mut());
    }

    #[test]
    fn assistant_requires_a_provider() {
        let dir = tempfile::tempdir().unwrap();
        let path = CString::new(dir.path().join("assistant.json").to_str().unwrap()).unwrap();
        assert!(vireo_assistant_new(std::ptr::null_mut(), path.as_ptr()).is_null());
    }

    #[test]
    fn assistant_reports_mcp_states_and_frees_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("assistant.json");
        std::fs::write(
            &path,
            r#"{"providers":[{"id":"local","name":"Local","base_url":"http://127.0.0.1:9/v1"}]}"#,
        )
        .unwrap();
        let path = CString::new(path.to_str().unwrap()).unwrap();

        let handle = vireo_assistant_new(std::ptr::null_mut(), path.as_ptr());
        assert!(!handle.is_null());
        assert_eq!(take(vireo_assistant_mcp_states(handle)).unwrap(), "{}");
        assert!(take(vireo_assistant_poll_event(handle)).is_none());
        vireo_assistant_free(handle);
    }
}
