//! Automation backends.
//!
//! A backend owns exactly one live handle (a Chromium process, or the OS
//! input devices) and is driven by exactly one session. Every method that
//! takes a position takes a [`NativePoint`], so only converted and
//! bounds-checked coordinates ever reach a device.

pub mod browser;
pub mod desktop;
#[cfg(test)]
pub mod scripted;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::action::{ClickKind, KeyCombo, ScrollDirection, TypeMethod};
use crate::config::EngineConfig;
use crate::dom::{ElementMatch, ElementQuery, LoadState, OptionChoice, SelectorState};
use crate::error::EngineError;
use crate::geometry::{Dimensions, NativePoint, Surface};
use crate::session::{Scope, StartOptions};

pub use browser::ChromiumBackend;
pub use desktop::DesktopBackend;

#[derive(Error, Debug, Clone)]
pub enum BackendError {
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    Execution(String),
    /// The underlying process or connection is gone for good.
    #[error("connection lost: {0}")]
    Disconnected(String),
    #[error("{0} is not supported by this backend")]
    Unsupported(&'static str),
}

impl BackendError {
    pub fn into_engine(self, scope: Scope) -> EngineError {
        match self {
            BackendError::Unavailable(msg) => EngineError::BackendUnavailable(msg),
            BackendError::Execution(msg) => EngineError::BackendExecution(msg),
            BackendError::Disconnected(msg) => EngineError::SessionStopped(msg),
            BackendError::Unsupported(op) => EngineError::Unsupported {
                scope: scope.to_string(),
                operation: op.to_string(),
            },
        }
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Claim on a device that only one session may drive at a time.
#[derive(Debug, Clone, Default)]
pub struct InputSlot(Arc<AtomicBool>);

impl InputSlot {
    pub fn acquire(&self) -> BackendResult<InputLease> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| InputLease(self.0.clone()))
            .map_err(|_| {
                BackendError::Unavailable(
                    "OS input is already driven by another desktop session".to_string(),
                )
            })
    }

    pub fn is_held(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Held by the backend that owns the slot; dropping it frees the slot.
#[derive(Debug)]
pub struct InputLease(Arc<AtomicBool>);

impl Drop for InputLease {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

/// The element found under a point, in the backend's native space.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ElementInfo {
    pub tag: String,
    pub role: Option<String>,
    pub name: Option<String>,
    pub rect: Rect,
    pub interactive: bool,
}

/// Encoded PNG plus its pixel size.
#[derive(Debug, Clone)]
pub struct Capture {
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct TabInfo {
    pub id: usize,
    pub url: String,
    pub title: String,
    pub is_current: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Capabilities {
    pub browser: bool,
    pub desktop: bool,
    pub clipboard: bool,
}

#[async_trait]
pub trait Backend: Send + Sync {
    fn scope(&self) -> Scope;

    /// Driver label reported as `executed_with`.
    fn driver(&self) -> &'static str;

    /// Current drawable dimensions; queried before every spatial action.
    async fn surface(&mut self) -> BackendResult<Surface>;

    async fn click(&mut self, at: NativePoint, kind: ClickKind) -> BackendResult<()>;

    async fn move_pointer(&mut self, at: NativePoint) -> BackendResult<()>;

    async fn drag(&mut self, from: NativePoint, to: NativePoint) -> BackendResult<()>;

    /// Returns the method actually used.
    async fn type_text(
        &mut self,
        text: &str,
        method: TypeMethod,
        selector: Option<&str>,
    ) -> BackendResult<TypeMethod>;

    async fn scroll(
        &mut self,
        direction: ScrollDirection,
        amount: i32,
        anchor: Option<NativePoint>,
    ) -> BackendResult<()>;

    async fn press_key(&mut self, combo: &KeyCombo) -> BackendResult<()>;

    async fn capture(&mut self) -> BackendResult<Capture>;

    async fn element_at(&mut self, _at: NativePoint) -> BackendResult<Option<ElementInfo>> {
        Ok(None)
    }

    async fn pixel_at(&mut self, _at: NativePoint) -> BackendResult<Option<[u8; 3]>> {
        Ok(None)
    }

    async fn navigate(&mut self, _url: &str) -> BackendResult<String> {
        Err(BackendError::Unsupported("navigate"))
    }

    async fn reload(&mut self) -> BackendResult<String> {
        Err(BackendError::Unsupported("reload"))
    }

    async fn go_back(&mut self) -> BackendResult<String> {
        Err(BackendError::Unsupported("back"))
    }

    async fn go_forward(&mut self) -> BackendResult<String> {
        Err(BackendError::Unsupported("forward"))
    }

    async fn current_url(&mut self) -> BackendResult<String> {
        Err(BackendError::Unsupported("current_url"))
    }

    async fn tabs(&mut self) -> BackendResult<Vec<TabInfo>> {
        Err(BackendError::Unsupported("tabs"))
    }

    async fn new_tab(&mut self, _url: Option<&str>) -> BackendResult<TabInfo> {
        Err(BackendError::Unsupported("tab/new"))
    }

    async fn close_tab(&mut self, _id: Option<usize>) -> BackendResult<Vec<TabInfo>> {
        Err(BackendError::Unsupported("tab/close"))
    }

    async fn switch_tab(&mut self, _id: usize) -> BackendResult<TabInfo> {
        Err(BackendError::Unsupported("tab/switch"))
    }

    async fn dom_tree(&mut self) -> BackendResult<Value> {
        Err(BackendError::Unsupported("dom/tree"))
    }

    async fn element_rect(&mut self, _query: &ElementQuery) -> BackendResult<ElementMatch> {
        Err(BackendError::Unsupported("dom/element_rect"))
    }

    /// Resolves once `selector` reaches `state`; fails when `timeout` passes first.
    async fn wait_for_selector(
        &mut self,
        _selector: &str,
        _state: SelectorState,
        _timeout: Duration,
    ) -> BackendResult<()> {
        Err(BackendError::Unsupported("wait_for_selector"))
    }

    async fn wait_for_load_state(&mut self, _state: LoadState, _timeout: Duration) -> BackendResult<()> {
        Err(BackendError::Unsupported("wait_for_load_state"))
    }

    /// Returns the values selected afterwards.
    async fn select_option(&mut self, _selector: &str, _choice: &OptionChoice) -> BackendResult<Vec<String>> {
        Err(BackendError::Unsupported("select_option"))
    }

    async fn is_alive(&mut self) -> bool;

    async fn close(&mut self) -> BackendResult<()>;
}

/// Creates backends for new sessions.
#[async_trait]
pub trait BackendLauncher: Send + Sync {
    async fn launch(
        &self,
        scope: Scope,
        session_id: &str,
        options: &StartOptions,
    ) -> BackendResult<Box<dyn Backend>>;

    fn capabilities(&self) -> Capabilities;
}

/// Launches the real Chromium and OS-input backends.
pub struct NativeLauncher {
    config: Arc<EngineConfig>,
    desktop_input: InputSlot,
}

impl NativeLauncher {
    pub fn new(config: Arc<EngineConfig>) -> Self {
        Self {
            config,
            desktop_input: InputSlot::default(),
        }
    }
}

#[async_trait]
impl BackendLauncher for NativeLauncher {
    async fn launch(
        &self,
        scope: Scope,
        session_id: &str,
        options: &StartOptions,
    ) -> BackendResult<Box<dyn Backend>> {
        match scope {
            Scope::Browser => {
                let viewport: Dimensions = options.viewport.unwrap_or(self.config.default_viewport);
                let backend = ChromiumBackend::launch(
                    session_id,
                    options.start_url.as_deref(),
                    options.headless,
                    viewport,
                    &self.config,
                )
                .await?;
                Ok(Box::new(backend))
            }
            Scope::Desktop => {
                // one pointer and keyboard per process
                let lease = self.desktop_input.acquire()?;
                Ok(Box::new(DesktopBackend::connect(lease).await?))
            }
        }
    }

    fn capabilities(&self) -> Capabilities {
        let desktop = desktop::display_available();
        Capabilities {
            browser: browser::find_chrome_binary(self.config.chrome_executable.as_deref()).is_some(),
            desktop,
            clipboard: desktop,
        }
    }
}
