//! In-memory backend for tests: records every call and fails on demand.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{
    Backend, BackendError, BackendLauncher, BackendResult, Capabilities, Capture, ElementInfo,
    InputLease, InputSlot, Rect, TabInfo,
};
use crate::action::{ClickKind, KeyCombo, ScrollDirection, TypeMethod};
use crate::dom::{
    DomRef, ElementMatch, ElementQuery, LoadState, Locator, OptionChoice, SelectorState,
};
use crate::geometry::{Dimensions, NativePoint, Offset, Surface};
use crate::session::{Scope, StartOptions};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Click { x: f64, y: f64, kind: ClickKind },
    Move { x: f64, y: f64 },
    Drag { from: (f64, f64), to: (f64, f64) },
    Type { text: String, method: TypeMethod },
    Scroll { direction: ScrollDirection, amount: i32 },
    Key(String),
    Capture,
    ElementAt { x: f64, y: f64 },
    Navigate(String),
    WaitForSelector { selector: String, state: SelectorState },
    WaitForLoad(LoadState),
    SelectOption { selector: String, choice: OptionChoice },
    Close,
}

struct ScriptState {
    scope: Scope,
    surface: Surface,
    unavailable: bool,
    launches: usize,
    calls: Vec<(String, Call)>,
    failing_clicks: usize,
    failing_kinds: Vec<ClickKind>,
    element: Option<ElementInfo>,
    delay: Duration,
    disconnect: bool,
    page: Vec<DomRef>,
}

#[derive(Clone)]
pub struct Script {
    inner: Arc<Mutex<ScriptState>>,
}

impl Script {
    fn with_surface(scope: Scope, surface: Surface) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ScriptState {
                scope,
                surface,
                unavailable: false,
                launches: 0,
                calls: Vec::new(),
                failing_clicks: 0,
                failing_kinds: Vec::new(),
                element: None,
                delay: Duration::ZERO,
                disconnect: false,
                page: Vec::new(),
            })),
        }
    }

    pub fn browser(width: u32, height: u32) -> Self {
        Self::with_surface(
            Scope::Browser,
            Surface {
                viewport: Some(Dimensions::new(width, height)),
                screen: Some(Dimensions::new(1920, 1080)),
                viewport_origin: Some(Offset { x: 0.0, y: 80.0 }),
            },
        )
    }

    pub fn desktop(width: u32, height: u32) -> Self {
        Self::with_surface(
            Scope::Desktop,
            Surface {
                viewport: None,
                screen: Some(Dimensions::new(width, height)),
                viewport_origin: None,
            },
        )
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ScriptState> {
        self.inner.lock().unwrap()
    }

    pub fn unavailable(self) -> Self {
        self.state().unavailable = true;
        self
    }

    /// The next `n` clicks fail, whatever their kind.
    pub fn failing_clicks(self, n: usize) -> Self {
        self.state().failing_clicks = n;
        self
    }

    /// Clicks of this kind always fail.
    pub fn failing_kind(self, kind: ClickKind) -> Self {
        self.state().failing_kinds.push(kind);
        self
    }

    pub fn with_element(self, element: ElementInfo) -> Self {
        self.state().element = Some(element);
        self
    }

    /// Elements the DOM tree reports, in viewport pixels.
    pub fn with_page(self, elements: Vec<DomRef>) -> Self {
        self.state().page = elements;
        self
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        self.state().delay = delay;
        self
    }

    pub fn disconnect(&self) {
        self.state().disconnect = true;
    }

    pub fn resize(&self, width: u32, height: u32) {
        let mut state = self.state();
        match state.scope {
            Scope::Browser => state.surface.viewport = Some(Dimensions::new(width, height)),
            Scope::Desktop => state.surface.screen = Some(Dimensions::new(width, height)),
        }
    }

    pub fn launches(&self) -> usize {
        self.state().launches
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.iter().map(|(_, c)| c.clone()).collect()
    }

    pub fn calls_for(&self, session_id: &str) -> Vec<Call> {
        self.state()
            .calls
            .iter()
            .filter(|(id, _)| id == session_id)
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub fn clicks(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Click { .. }))
            .collect()
    }
}

pub struct ScriptedBackend {
    session_id: String,
    script: Script,
    lease: Option<InputLease>,
}

impl ScriptedBackend {
    async fn perform(&self, call: Call) -> BackendResult<()> {
        let delay = self.script.state().delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.script.state();
        if state.disconnect {
            return Err(BackendError::Disconnected("scripted backend went away".into()));
        }
        let fail = match &call {
            Call::Click { kind, .. } => {
                if state.failing_clicks > 0 {
                    state.failing_clicks -= 1;
                    true
                } else {
                    state.failing_kinds.contains(kind)
                }
            }
            _ => false,
        };
        state.calls.push((self.session_id.clone(), call));
        if fail {
            return Err(BackendError::Execution("element did not accept the click".into()));
        }
        Ok(())
    }

    fn find(&self, locator: &Locator) -> Vec<DomRef> {
        let name_is = |el: &DomRef, wanted: &str| el.name.as_deref() == Some(wanted);
        self.script
            .state()
            .page
            .iter()
            .filter(|el| match locator {
                Locator::Css(s) => *s == el.selector() || *s == el.tag,
                Locator::Role { role, name } => {
                    el.role.as_deref() == Some(role.as_str())
                        && name.as_deref().map_or(true, |n| name_is(*el, n))
                }
                Locator::Text { text, .. } | Locator::Label(text) | Locator::Placeholder(text) => {
                    name_is(*el, text)
                }
                Locator::TestId(_) => false,
            })
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn scope(&self) -> Scope {
        self.script.state().scope
    }

    fn driver(&self) -> &'static str {
        "scripted"
    }

    async fn surface(&mut self) -> BackendResult<Surface> {
        Ok(self.script.state().surface)
    }

    async fn click(&mut self, at: NativePoint, kind: ClickKind) -> BackendResult<()> {
        self.perform(Call::Click {
            x: at.x(),
            y: at.y(),
            kind,
        })
        .await
    }

    async fn move_pointer(&mut self, at: NativePoint) -> BackendResult<()> {
        self.perform(Call::Move { x: at.x(), y: at.y() }).await
    }

    async fn drag(&mut self, from: NativePoint, to: NativePoint) -> BackendResult<()> {
        self.perform(Call::Drag {
            from: (from.x(), from.y()),
            to: (to.x(), to.y()),
        })
        .await
    }

    async fn type_text(
        &mut self,
        text: &str,
        method: TypeMethod,
        _selector: Option<&str>,
    ) -> BackendResult<TypeMethod> {
        self.perform(Call::Type {
            text: text.to_string(),
            method,
        })
        .await?;
        Ok(method)
    }

    async fn scroll(
        &mut self,
        direction: ScrollDirection,
        amount: i32,
        _anchor: Option<NativePoint>,
    ) -> BackendResult<()> {
        self.perform(Call::Scroll { direction, amount }).await
    }

    async fn press_key(&mut self, combo: &KeyCombo) -> BackendResult<()> {
        self.perform(Call::Key(combo.to_string())).await
    }

    async fn capture(&mut self) -> BackendResult<Capture> {
        self.perform(Call::Capture).await?;
        let surface = self.script.state().surface;
        let dims = surface
            .viewport
            .or(surface.screen)
            .unwrap_or(Dimensions::reference());
        let img = image::RgbImage::from_pixel(dims.width, dims.height, image::Rgb([200, 10, 10]));
        let mut png = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .map_err(|e| BackendError::Execution(e.to_string()))?;
        Ok(Capture {
            png,
            width: dims.width,
            height: dims.height,
        })
    }

    async fn element_at(&mut self, at: NativePoint) -> BackendResult<Option<ElementInfo>> {
        self.perform(Call::ElementAt { x: at.x(), y: at.y() }).await?;
        Ok(self.script.state().element.clone())
    }

    async fn pixel_at(&mut self, _at: NativePoint) -> BackendResult<Option<[u8; 3]>> {
        Ok(Some([200, 10, 10]))
    }

    async fn navigate(&mut self, url: &str) -> BackendResult<String> {
        if self.scope() != Scope::Browser {
            return Err(BackendError::Unsupported("navigate"));
        }
        self.perform(Call::Navigate(url.to_string())).await?;
        Ok(url.to_string())
    }

    async fn current_url(&mut self) -> BackendResult<String> {
        Ok("about:blank".to_string())
    }

    async fn tabs(&mut self) -> BackendResult<Vec<TabInfo>> {
        Ok(vec![TabInfo {
            id: 0,
            url: "about:blank".into(),
            title: String::new(),
            is_current: true,
        }])
    }

    async fn dom_tree(&mut self) -> BackendResult<Value> {
        let page = self.script.state().page.clone();
        Ok(json!({ "url": "about:blank", "elements": page }))
    }

    async fn element_rect(&mut self, query: &ElementQuery) -> BackendResult<ElementMatch> {
        let locator = query
            .locator()
            .map_err(|e| BackendError::Execution(e.to_string()))?;
        let found = self.find(&locator);
        let mut result = ElementMatch {
            found: !found.is_empty(),
            visible: !found.is_empty(),
            element_count: found.len(),
            selector_used: locator.to_string(),
            ..Default::default()
        };
        if let Some(el) = found.get(query.index).or_else(|| found.first()) {
            result.enabled = !el.disabled;
            result.x = Some(el.x as i64);
            result.y = Some(el.y as i64);
            result.bounding_box = Some(Rect {
                x: el.x - el.width / 2.0,
                y: el.y - el.height / 2.0,
                width: el.width,
                height: el.height,
            });
            result.tag = Some(el.tag.clone());
            result.text = el.name.clone();
        }
        Ok(result)
    }

    async fn wait_for_selector(
        &mut self,
        selector: &str,
        state: SelectorState,
        timeout: Duration,
    ) -> BackendResult<()> {
        self.perform(Call::WaitForSelector {
            selector: selector.to_string(),
            state,
        })
        .await?;
        let present = !self.find(&Locator::Css(selector.to_string())).is_empty();
        let reached = match state {
            SelectorState::Attached | SelectorState::Visible => present,
            SelectorState::Detached | SelectorState::Hidden => !present,
        };
        if reached {
            Ok(())
        } else {
            Err(BackendError::Execution(format!(
                "Timeout waiting for selector {} to be {} after {}ms",
                selector,
                state.as_str(),
                timeout.as_millis()
            )))
        }
    }

    async fn wait_for_load_state(&mut self, state: LoadState, _timeout: Duration) -> BackendResult<()> {
        self.perform(Call::WaitForLoad(state)).await
    }

    async fn select_option(&mut self, selector: &str, choice: &OptionChoice) -> BackendResult<Vec<String>> {
        if self.find(&Locator::Css(selector.to_string())).is_empty() {
            return Err(BackendError::Execution(format!("No element matches {}", selector)));
        }
        self.perform(Call::SelectOption {
            selector: selector.to_string(),
            choice: choice.clone(),
        })
        .await?;
        Ok(vec![match choice {
            OptionChoice::Value(v) | OptionChoice::Label(v) => v.clone(),
            OptionChoice::Index(i) => i.to_string(),
        }])
    }

    async fn is_alive(&mut self) -> bool {
        !self.script.state().disconnect
    }

    async fn close(&mut self) -> BackendResult<()> {
        self.lease = None;
        self.script
            .state()
            .calls
            .push((self.session_id.clone(), Call::Close));
        Ok(())
    }
}

pub struct ScriptedLauncher {
    script: Script,
    desktop_input: InputSlot,
}

impl ScriptedLauncher {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            desktop_input: InputSlot::default(),
        }
    }
}

#[async_trait]
impl BackendLauncher for ScriptedLauncher {
    async fn launch(
        &self,
        scope: Scope,
        session_id: &str,
        _options: &StartOptions,
    ) -> BackendResult<Box<dyn Backend>> {
        let mut state = self.script.state();
        if state.unavailable {
            return Err(BackendError::Unavailable("no scripted display".into()));
        }
        if state.scope != scope {
            return Err(BackendError::Unavailable(format!("script only drives {}", state.scope)));
        }
        let lease = match scope {
            Scope::Desktop => Some(self.desktop_input.acquire()?),
            Scope::Browser => None,
        };
        state.launches += 1;
        drop(state);
        Ok(Box::new(ScriptedBackend {
            session_id: session_id.to_string(),
            script: self.script.clone(),
            lease,
        }))
    }

    fn capabilities(&self) -> Capabilities {
        let state = self.script.state();
        Capabilities {
            browser: state.scope == Scope::Browser,
            desktop: state.scope == Scope::Desktop,
            clipboard: true,
        }
    }
}
