//! Bridge between the shared browser state and the assistant's native tools.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use vireo_core::tools::{BrowserHost, TabSummary};

use crate::protocol::{BrowserCommand, BrowserEvent};
use crate::registry::Browser;
use crate::tab::{TabId, TabMembership, WindowId};

type ScriptReply = oneshot::Sender<Result<String, String>>;

struct PendingScript {
    tab: TabId,
    reply: ScriptReply,
}

/// The registry behind one lock, plus the queue of requests waiting on the
/// frontend. Cloning shares the same state.
#[derive(Clone)]
pub struct SharedBrowser {
    browser: Arc<Mutex<Browser>>,
    events: Arc<Mutex<VecDeque<BrowserEvent>>>,
    scripts: Arc<Mutex<HashMap<u64, PendingScript>>>,
    next_request: Arc<AtomicU64>,
    headless: bool,
}

impl SharedBrowser {
    pub fn new(browser: Browser) -> Self {
        Self::build(browser, false)
    }

    /// No frontend will ever answer script requests; they fail at once.
    pub fn headless(browser: Browser) -> Self {
        Self::build(browser, true)
    }

    fn build(browser: Browser, headless: bool) -> Self {
        Self {
            browser: Arc::new(Mutex::new(browser)),
            events: Arc::new(Mutex::new(VecDeque::new())),
            scripts: Arc::new(Mutex::new(HashMap::new())),
            next_request: Arc::new(AtomicU64::new(1)),
            headless,
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut Browser) -> R) -> R {
        f(&mut self.browser.lock())
    }

    /// Run a frontend command. Script requests aimed at tabs the command
    /// closed fail right away.
    pub fn execute(&self, command: BrowserCommand) -> Result<Value, String> {
        let mut browser = self.browser.lock();
        let result = browser.execute(command);
        self.sweep_scripts(&browser);
        result
    }

    /// Next event for the frontend. Script requests nobody waits for any
    /// more are skipped.
    pub fn poll_event(&self) -> Option<BrowserEvent> {
        loop {
            let event = self.events.lock().pop_front()?;
            if let BrowserEvent::EvaluateScript { request_id, .. } = &event {
                if !self.scripts.lock().contains_key(request_id) {
                    log::debug!("Skipping abandoned script request {}", request_id);
                    continue;
                }
            }
            return Some(event);
        }
    }

    /// Deliver the frontend's answer to a script request. Returns `false`
    /// if nobody is waiting for it any more.
    pub fn complete_script(&self, request_id: u64, result: Result<String, String>) -> bool {
        match self.scripts.lock().remove(&request_id) {
            Some(pending) => pending.reply.send(result).is_ok(),
            None => {
                log::debug!("Script result for unknown request {}", request_id);
                false
            }
        }
    }

    pub fn pending_scripts(&self) -> usize {
        let browser = self.browser.lock();
        self.sweep_scripts(&browser);
        self.scripts.lock().len()
    }

    /// Drop requests whose caller gave up, and fail those whose tab is gone.
    fn sweep_scripts(&self, browser: &Browser) {
        let mut scripts = self.scripts.lock();
        let stale: Vec<u64> = scripts
            .iter()
            .filter(|(_, p)| p.reply.is_closed() || browser.resolve_tab(p.tab).is_none())
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            let Some(pending) = scripts.remove(&id) else {
                continue;
            };
            if !pending.reply.is_closed() {
                log::debug!("Failing script request {} for closed tab {}", id, pending.tab);
                let _ = pending.reply.send(Err(format!("Tab {} was closed", pending.tab)));
            }
        }
    }

    fn target_window(browser: &Browser) -> Result<WindowId, String> {
        browser
            .focused_window()
            .ok_or_else(|| "No browser window is open".to_string())
    }

    fn summary(browser: &Browser, window: WindowId, tab: TabId) -> Option<TabSummary> {
        let record = browser.resolve_tab(tab)?;
        let current = browser.window(window).and_then(|w| w.current_tab);
        let space = match record.membership {
            TabMembership::Space(space) => browser.space(space).map(|s| s.name.clone()),
            TabMembership::Essential => Some("Essentials".to_string()),
        };
        Some(TabSummary {
            id: tab.0,
            title: record.display_title().to_string(),
            url: record.url.clone(),
            active: current == Some(tab),
            space,
        })
    }

    fn resolve_target(browser: &Browser, tab: Option<u64>) -> Result<(WindowId, TabId), String> {
        let window = Self::target_window(browser)?;
        let tab = match tab {
            Some(raw) => TabId(raw),
            None => browser
                .window(window)
                .and_then(|w| w.current_tab)
                .ok_or_else(|| "No tab is focused".to_string())?,
        };
        browser
            .resolve_tab(tab)
            .ok_or_else(|| format!("Tab {} not found", tab))?;
        Ok((window, tab))
    }
}

impl BrowserHost for SharedBrowser {
    fn list_tabs(&self) -> Vec<TabSummary> {
        let browser = self.browser.lock();
        let Ok(window) = Self::target_window(&browser) else {
            return Vec::new();
        };
        browser
            .spaces()
            .iter()
            .flat_map(|space| space.tabs.iter())
            .chain(browser.essentials().iter())
            .filter_map(|tab| Self::summary(&browser, window, *tab))
            .collect()
    }

    fn open_tab(&self, url: &str, background: bool) -> Result<TabSummary, String> {
        let mut browser = self.browser.lock();
        let window = Self::target_window(&browser)?;
        let tab = browser.create_tab(window, url, None)?;
        if !background {
            browser.select_tab(window, tab)?;
        }
        Self::summary(&browser, window, tab).ok_or_else(|| format!("Tab {} not found", tab))
    }

    fn close_tab(&self, tab_id: u64) -> Result<(), String> {
        let mut browser = self.browser.lock();
        let result = browser.close_tab(TabId(tab_id));
        self.sweep_scripts(&browser);
        result
    }

    fn switch_tab(&self, tab_id: u64) -> Result<(), String> {
        let mut browser = self.browser.lock();
        let window = Self::target_window(&browser)?;
        browser.select_tab(window, TabId(tab_id))
    }

    fn navigate(&self, tab_id: Option<u64>, url: &str) -> Result<TabSummary, String> {
        let mut browser = self.browser.lock();
        let (window, tab) = Self::resolve_target(&browser, tab_id)?;
        browser.navigate(tab, url)?;
        Self::summary(&browser, window, tab).ok_or_else(|| format!("Tab {} not found", tab))
    }

    fn split_tabs(&self, left: u64, right: u64) -> Result<(), String> {
        let mut browser = self.browser.lock();
        let window = Self::target_window(&browser)?;
        browser.enter_split(window, TabId(left), TabId(right))
    }

    fn evaluate_script(
        &self,
        tab_id: Option<u64>,
        script: &str,
    ) -> oneshot::Receiver<Result<String, String>> {
        let (tx, rx) = oneshot::channel();
        if self.headless {
            let _ = tx.send(Err("Scripts cannot run without a browser frontend".to_string()));
            return rx;
        }
        let browser = self.browser.lock();
        let tab = match Self::resolve_target(&browser, tab_id) {
            Ok((_, tab)) => tab,
            Err(e) => {
                let _ = tx.send(Err(e));
                return rx;
            }
        };
        self.sweep_scripts(&browser);
        drop(browser);

        let request_id = self.next_request.fetch_add(1, Ordering::SeqCst);
        self.scripts.lock().insert(request_id, PendingScript { tab, reply: tx });
        self.events.lock().push_back(BrowserEvent::EvaluateScript {
            request_id,
            tab,
            script: script.to_string(),
        });
        rx
    }
}
