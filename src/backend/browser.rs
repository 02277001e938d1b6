use std::fmt::Display;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchKeyEventParams, DispatchKeyEventType, DispatchMouseEventParams,
    DispatchMouseEventType, InsertTextParams, MouseButton,
};
use chromiumoxide::cdp::browser_protocol::page::{
    CaptureScreenshotFormat, CaptureScreenshotParams, GetNavigationHistoryParams,
    NavigateToHistoryEntryParams,
};
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::keys::{self, KeyDefinition};
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

use super::{Backend, BackendError, BackendResult, Capture, ElementInfo, Rect, TabInfo};
use crate::action::{ClickKind, KeyCombo, Modifier, ScrollDirection, TypeMethod};
use crate::config::EngineConfig;
use crate::dom::{
    ElementMatch, ElementQuery, LoadState, Locator, OptionChoice, SelectorState, REF_ATTRIBUTE,
};
use crate::geometry::{Dimensions, NativePoint, Offset, Surface};
use crate::session::Scope;

const DRAG_STEPS: u32 = 10;
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const NETWORK_QUIET: Duration = Duration::from_millis(500);

const SURFACE_SCRIPT: &str = r#"(() => ({
    width: window.innerWidth,
    height: window.innerHeight,
    screen_width: window.screen.width,
    screen_height: window.screen.height,
    screen_x: window.screenX,
    screen_y: window.screenY,
    outer_width: window.outerWidth,
    outer_height: window.outerHeight
}))()"#;

const INTERACTIVE_SELECTOR: &str = "a, button, input, select, textarea, summary, label, \
    [role=\"button\"], [role=\"link\"], [role=\"textbox\"], [role=\"menuitem\"], [role=\"tab\"], \
    [role=\"checkbox\"], [role=\"radio\"], [role=\"switch\"], [role=\"option\"], [role=\"combobox\"], \
    [onclick], [contenteditable=\"true\"], [tabindex]:not([tabindex=\"-1\"])";

/// Resolves a locator spec to the list of matching elements.
const LOCATE_FN: &str = r#"(spec) => {
    const norm = (s) => (s || "").replace(/\s+/g, " ").trim();
    const matches = (value, wanted, exact) => exact ? norm(value) === wanted : norm(value).toLowerCase().includes(wanted.toLowerCase());
    const implicitRole = (el) => {
        const tag = el.tagName.toLowerCase();
        if (tag === "a" && el.hasAttribute("href")) return "link";
        if (tag === "button" || (tag === "input" && ["button", "submit", "reset"].includes(el.type))) return "button";
        if (tag === "input" && el.type === "checkbox") return "checkbox";
        if (tag === "input" && el.type === "radio") return "radio";
        if (tag === "input" || tag === "textarea") return "textbox";
        if (tag === "select") return "combobox";
        if (tag === "option") return "option";
        if (/^h[1-6]$/.test(tag)) return "heading";
        if (tag === "img") return "img";
        return null;
    };
    const accessibleName = (el) => norm(el.getAttribute("aria-label") || el.getAttribute("title") ||
        el.getAttribute("alt") || el.getAttribute("placeholder") || el.innerText || el.value || "");
    const all = Array.from(document.querySelectorAll("*"));
    switch (spec.kind) {
        case "css": return Array.from(document.querySelectorAll(spec.value));
        case "test_id": return all.filter((el) => el.getAttribute("data-testid") === spec.value);
        case "role": return all.filter((el) => (el.getAttribute("role") || implicitRole(el)) === spec.value &&
            (!spec.name || matches(accessibleName(el), spec.name, false)));
        case "text": {
            const hits = all.filter((el) => el.tagName !== "SCRIPT" && el.tagName !== "STYLE" && matches(el.innerText, spec.value, spec.exact));
            return hits.filter((el) => !hits.some((other) => other !== el && el.contains(other)));
        }
        case "label": {
            const byLabel = Array.from(document.querySelectorAll("label"))
                .filter((l) => matches(l.innerText, spec.value, false))
                .map((l) => l.control)
                .filter(Boolean);
            const byAria = all.filter((el) => matches(el.getAttribute("aria-label"), spec.value, false));
            return Array.from(new Set([...byLabel, ...byAria]));
        }
        case "placeholder": return all.filter((el) => matches(el.getAttribute("placeholder"), spec.value, false));
        default: return [];
    }
}"#;

#[derive(Debug, Deserialize)]
struct MatchProbe {
    count: usize,
    visible: bool,
    enabled: bool,
    x: Option<f64>,
    y: Option<f64>,
    width: Option<f64>,
    height: Option<f64>,
    tag: Option<String>,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SelectProbe {
    error: Option<String>,
    #[serde(default)]
    selected: Vec<String>,
}

fn locator_spec(locator: &Locator) -> Value {
    match locator {
        Locator::Css(s) => json!({ "kind": "css", "value": s }),
        Locator::TestId(id) => json!({ "kind": "test_id", "value": id }),
        Locator::Role { role, name } => json!({ "kind": "role", "value": role, "name": name }),
        Locator::Text { text, exact } => json!({ "kind": "text", "value": text, "exact": exact }),
        Locator::Label(l) => json!({ "kind": "label", "value": l }),
        Locator::Placeholder(p) => json!({ "kind": "placeholder", "value": p }),
    }
}

fn selector_reached(observed: &str, wanted: SelectorState) -> bool {
    match wanted {
        SelectorState::Attached => observed != "detached",
        SelectorState::Detached => observed == "detached",
        SelectorState::Visible => observed == "visible",
        SelectorState::Hidden => observed != "visible",
    }
}

fn js_arg<T: serde::Serialize + ?Sized>(value: &T) -> BackendResult<String> {
    serde_json::to_string(value).map_err(|e| BackendError::Execution(e.to_string()))
}

#[derive(Debug, Deserialize)]
struct SurfaceProbe {
    width: f64,
    height: f64,
    screen_width: f64,
    screen_height: f64,
    screen_x: f64,
    screen_y: f64,
    outer_width: f64,
    outer_height: f64,
}

#[derive(Debug, Deserialize)]
struct ElementProbe {
    tag: String,
    role: Option<String>,
    name: Option<String>,
    x: f64,
    y: f64,
    width: f64,
    height: f64,
    interactive: bool,
}

/// One Chromium process with its own profile, driven over CDP.
pub struct ChromiumBackend {
    browser: Browser,
    handler: JoinHandle<()>,
    alive: Arc<AtomicBool>,
    pages: Vec<Page>,
    current: usize,
    headless: bool,
    profile_dir: PathBuf,
}

impl ChromiumBackend {
    pub async fn launch(
        session_id: &str,
        start_url: Option<&str>,
        headless: bool,
        viewport: Dimensions,
        config: &EngineConfig,
    ) -> BackendResult<Self> {
        let bin = find_chrome_binary(config.chrome_executable.as_deref()).ok_or_else(|| {
            BackendError::Unavailable(
                "No Chrome or Chromium executable found; set CHROME_BIN".to_string(),
            )
        })?;
        let profile_dir = config.profile_root.join(session_id);
        tokio::fs::create_dir_all(&profile_dir).await.map_err(|e| {
            BackendError::Unavailable(format!(
                "Cannot create profile directory {}: {}",
                profile_dir.display(),
                e
            ))
        })?;

        info!(bin = %bin.display(), headless, width = viewport.width, height = viewport.height, "launching chromium");

        let mut builder = BrowserConfig::builder()
            .chrome_executable(&bin)
            .user_data_dir(&profile_dir)
            .window_size(viewport.width, viewport.height + 140)
            .viewport(Viewport {
                width: viewport.width,
                height: viewport.height,
                device_scale_factor: Some(1.0),
                emulating_mobile: false,
                is_landscape: viewport.width >= viewport.height,
                has_touch: false,
            })
            .args(vec![
                "--disable-dev-shm-usage",
                "--disable-infobars",
                "--disable-extensions",
                "--no-first-run",
                "--no-default-browser-check",
            ]);
        if !headless {
            builder = builder.with_head();
        }
        if needs_no_sandbox() {
            builder = builder.no_sandbox();
        }
        let browser_config = builder
            .build()
            .map_err(|e| BackendError::Unavailable(format!("Invalid browser config: {}", e)))?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| BackendError::Unavailable(format!("Chromium failed to start: {}", e)))?;

        let alive = Arc::new(AtomicBool::new(true));
        let alive_signal = alive.clone();
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
            alive_signal.store(false, Ordering::SeqCst);
            warn!("chromium event loop exited");
        });

        let page = browser
            .new_page(start_url.unwrap_or("about:blank"))
            .await
            .map_err(|e| BackendError::Unavailable(format!("Failed to open page: {}", e)))?;

        Ok(Self {
            browser,
            handler,
            alive,
            pages: vec![page],
            current: 0,
            headless,
            profile_dir,
        })
    }

    fn page(&self) -> BackendResult<&Page> {
        self.pages
            .get(self.current)
            .ok_or_else(|| BackendError::Execution("No open tab".to_string()))
    }

    /// Connection failures end the session; everything else is retryable.
    fn fail(&self, context: &str, e: impl Display) -> BackendError {
        let msg = e.to_string();
        let lost = !self.alive.load(Ordering::SeqCst)
            || msg.contains("receiver is gone")
            || msg.contains("channel closed")
            || msg.contains("connection reset")
            || msg.contains("broken pipe");
        if lost {
            BackendError::Disconnected(format!("{}: {}", context, msg))
        } else {
            BackendError::Execution(format!("{}: {}", context, msg))
        }
    }

    async fn eval<T: serde::de::DeserializeOwned>(&self, script: String) -> BackendResult<T> {
        self.page()?
            .evaluate(script)
            .await
            .map_err(|e| self.fail("JS evaluation failed", e))?
            .into_value::<T>()
            .map_err(|e| BackendError::Execution(format!("JS decode failed: {}", e)))
    }

    async fn mouse(
        &self,
        kind: DispatchMouseEventType,
        x: f64,
        y: f64,
        button: Option<MouseButton>,
        click_count: i64,
    ) -> BackendResult<()> {
        let mut cmd = DispatchMouseEventParams::builder().r#type(kind).x(x).y(y);
        if let Some(button) = button {
            cmd = cmd.button(button).click_count(click_count);
        }
        let cmd = cmd.build().map_err(BackendError::Execution)?;
        self.page()?
            .execute(cmd)
            .await
            .map_err(|e| self.fail("Mouse event failed", e))?;
        Ok(())
    }

    async fn key_event(
        &self,
        kind: DispatchKeyEventType,
        def: &KeyDefinition,
        modifiers: i64,
        text: Option<&str>,
    ) -> BackendResult<()> {
        let mut cmd = DispatchKeyEventParams::builder()
            .r#type(kind)
            .key(def.key)
            .code(def.code)
            .windows_virtual_key_code(def.key_code)
            .native_virtual_key_code(def.key_code)
            .modifiers(modifiers);
        if let Some(text) = text {
            cmd = cmd.text(text);
        }
        let cmd = cmd.build().map_err(BackendError::Execution)?;
        self.page()?
            .execute(cmd)
            .await
            .map_err(|e| self.fail("Key event failed", e))?;
        Ok(())
    }

    async fn focus(&self, selector: &str) -> BackendResult<()> {
        let element = self
            .page()?
            .find_element(selector)
            .await
            .map_err(|e| BackendError::Execution(format!("Selector '{}' not found: {}", selector, e)))?;
        element
            .focus()
            .await
            .map_err(|e| self.fail("Focus failed", e))?;
        Ok(())
    }

    async fn history_step(&self, delta: i64) -> BackendResult<String> {
        let page = self.page()?;
        let history = page
            .execute(GetNavigationHistoryParams::default())
            .await
            .map_err(|e| self.fail("Navigation history failed", e))?;
        let target = history.current_index + delta;
        let entry = usize::try_from(target)
            .ok()
            .and_then(|i| history.entries.get(i))
            .ok_or_else(|| {
                BackendError::Execution(if delta < 0 {
                    "No previous page in history".to_string()
                } else {
                    "No next page in history".to_string()
                })
            })?;
        page.execute(NavigateToHistoryEntryParams::new(entry.id))
            .await
            .map_err(|e| self.fail("History navigation failed", e))?;
        let _ = page.wait_for_navigation().await;
        self.current_url().await
    }

    async fn tab_info(&self, id: usize, page: &Page) -> TabInfo {
        TabInfo {
            id,
            url: page.url().await.ok().flatten().unwrap_or_default(),
            title: page.get_title().await.ok().flatten().unwrap_or_default(),
            is_current: id == self.current,
        }
    }

    async fn current_url(&self) -> BackendResult<String> {
        Ok(self
            .page()?
            .url()
            .await
            .map_err(|e| self.fail("Failed to read url", e))?
            .unwrap_or_default())
    }

    async fn selector_state(&self, selector: &str) -> BackendResult<String> {
        let script = format!(
            r#"((sel) => {{
                const el = document.querySelector(sel);
                if (!el) return "detached";
                const r = el.getBoundingClientRect();
                const style = window.getComputedStyle(el);
                const shown = style.display !== "none" && style.visibility !== "hidden" && r.width > 0 && r.height > 0;
                return shown ? "visible" : "hidden";
            }})({selector})"#,
            selector = js_arg(selector)?,
        );
        self.eval(script).await
    }

    /// `readyState`, and the number of resource entries so far.
    async fn load_progress(&self) -> BackendResult<(String, usize)> {
        self.eval(
            r#"[document.readyState, performance.getEntriesByType("resource").length]"#.to_string(),
        )
        .await
    }
}

#[async_trait]
impl Backend for ChromiumBackend {
    fn scope(&self) -> Scope {
        Scope::Browser
    }

    fn driver(&self) -> &'static str {
        "chromium"
    }

    async fn surface(&mut self) -> BackendResult<Surface> {
        let probe: SurfaceProbe = self.eval(SURFACE_SCRIPT.to_string()).await?;
        // without a window the viewport has no position on screen
        let origin = if self.headless || probe.outer_width <= 0.0 {
            None
        } else {
            let chrome_left = ((probe.outer_width - probe.width) / 2.0).max(0.0);
            let chrome_top = (probe.outer_height - probe.height - chrome_left).max(0.0);
            Some(Offset {
                x: probe.screen_x + chrome_left,
                y: probe.screen_y + chrome_top,
            })
        };
        Ok(Surface {
            viewport: Some(Dimensions::new(probe.width as u32, probe.height as u32)),
            screen: Some(Dimensions::new(
                probe.screen_width as u32,
                probe.screen_height as u32,
            )),
            viewport_origin: origin,
        })
    }

    async fn click(&mut self, at: NativePoint, kind: ClickKind) -> BackendResult<()> {
        let (x, y) = (at.x(), at.y());
        let button = match kind {
            ClickKind::Right => MouseButton::Right,
            _ => MouseButton::Left,
        };
        self.mouse(DispatchMouseEventType::MouseMoved, x, y, None, 0).await?;
        for count in 1..=i64::from(kind.click_count()) {
            self.mouse(DispatchMouseEventType::MousePressed, x, y, Some(button.clone()), count)
                .await?;
            self.mouse(DispatchMouseEventType::MouseReleased, x, y, Some(button.clone()), count)
                .await?;
        }
        Ok(())
    }

    async fn move_pointer(&mut self, at: NativePoint) -> BackendResult<()> {
        self.mouse(DispatchMouseEventType::MouseMoved, at.x(), at.y(), None, 0)
            .await
    }

    async fn drag(&mut self, from: NativePoint, to: NativePoint) -> BackendResult<()> {
        self.mouse(DispatchMouseEventType::MouseMoved, from.x(), from.y(), None, 0)
            .await?;
        self.mouse(
            DispatchMouseEventType::MousePressed,
            from.x(),
            from.y(),
            Some(MouseButton::Left),
            1,
        )
        .await?;
        for step in 1..=DRAG_STEPS {
            let t = step as f64 / DRAG_STEPS as f64;
            let x = from.x() + (to.x() - from.x()) * t;
            let y = from.y() + (to.y() - from.y()) * t;
            let cmd = DispatchMouseEventParams::builder()
                .r#type(DispatchMouseEventType::MouseMoved)
                .x(x)
                .y(y)
                .button(MouseButton::Left)
                .buttons(1)
                .build()
                .map_err(BackendError::Execution)?;
            self.page()?
                .execute(cmd)
                .await
                .map_err(|e| self.fail("Drag move failed", e))?;
        }
        self.mouse(
            DispatchMouseEventType::MouseReleased,
            to.x(),
            to.y(),
            Some(MouseButton::Left),
            1,
        )
        .await
    }

    async fn type_text(
        &mut self,
        text: &str,
        method: TypeMethod,
        selector: Option<&str>,
    ) -> BackendResult<TypeMethod> {
        if let Some(selector) = selector {
            self.focus(selector).await?;
        }
        match method {
            TypeMethod::Clipboard => {
                self.page()?
                    .execute(InsertTextParams::new(text))
                    .await
                    .map_err(|e| self.fail("Insert text failed", e))?;
            }
            TypeMethod::Keystrokes => {
                for ch in text.chars() {
                    let s = ch.to_string();
                    let cmd = DispatchKeyEventParams::builder()
                        .r#type(DispatchKeyEventType::Char)
                        .text(s.clone())
                        .key(s)
                        .build()
                        .map_err(BackendError::Execution)?;
                    self.page()?
                        .execute(cmd)
                        .await
                        .map_err(|e| self.fail("Keystroke failed", e))?;
                }
            }
        }
        Ok(method)
    }

    async fn scroll(
        &mut self,
        direction: ScrollDirection,
        amount: i32,
        anchor: Option<NativePoint>,
    ) -> BackendResult<()> {
        let (x, y) = match anchor {
            Some(p) => (p.x(), p.y()),
            None => {
                let probe: SurfaceProbe = self.eval(SURFACE_SCRIPT.to_string()).await?;
                (probe.width / 2.0, probe.height / 2.0)
            }
        };
        let (dx, dy) = direction.delta(amount);
        let cmd = DispatchMouseEventParams::builder()
            .r#type(DispatchMouseEventType::MouseWheel)
            .x(x)
            .y(y)
            .delta_x(dx as f64)
            .delta_y(dy as f64)
            .build()
            .map_err(BackendError::Execution)?;
        self.page()?
            .execute(cmd)
            .await
            .map_err(|e| self.fail("Scroll failed", e))?;
        Ok(())
    }

    async fn press_key(&mut self, combo: &KeyCombo) -> BackendResult<()> {
        let key_name = if combo.key == "Space" { " " } else { combo.key.as_str() };
        let def = lookup_key(key_name)?;

        let mut mask = 0;
        for modifier in &combo.modifiers {
            let mod_def = lookup_key(modifier.key_name())?;
            mask |= modifier_bit(*modifier);
            self.key_event(DispatchKeyEventType::RawKeyDown, mod_def, mask, None)
                .await?;
        }

        // shortcuts must not insert their character
        let shortcut = combo
            .modifiers
            .iter()
            .any(|m| *m != Modifier::Shift);
        let text = if shortcut { None } else { def.text.or_else(|| (def.key.len() == 1).then_some(def.key)) };
        let down = if text.is_some() {
            DispatchKeyEventType::KeyDown
        } else {
            DispatchKeyEventType::RawKeyDown
        };
        self.key_event(down, def, mask, text).await?;
        self.key_event(DispatchKeyEventType::KeyUp, def, mask, None)
            .await?;

        for modifier in combo.modifiers.iter().rev() {
            mask &= !modifier_bit(*modifier);
            let mod_def = lookup_key(modifier.key_name())?;
            self.key_event(DispatchKeyEventType::KeyUp, mod_def, mask, None)
                .await?;
        }
        Ok(())
    }

    async fn capture(&mut self) -> BackendResult<Capture> {
        let params = CaptureScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .build();
        let png = self
            .page()?
            .screenshot(params)
            .await
            .map_err(|e| self.fail("Screenshot failed", e))?;
        let (width, height) = image::ImageReader::new(Cursor::new(&png))
            .with_guessed_format()
            .map_err(|e| BackendError::Execution(e.to_string()))?
            .into_dimensions()
            .map_err(|e| BackendError::Execution(format!("Unreadable screenshot: {}", e)))?;
        Ok(Capture { png, width, height })
    }

    async fn element_at(&mut self, at: NativePoint) -> BackendResult<Option<ElementInfo>> {
        let script = format!(
            r#"((x, y) => {{
                const hit = document.elementFromPoint(x, y);
                if (!hit) return null;
                const target = hit.closest({selector});
                const el = target || hit;
                const r = el.getBoundingClientRect();
                const label = (el.getAttribute("aria-label") || el.getAttribute("title") || el.textContent || "").trim().slice(0, 80);
                return {{
                    tag: (el.tagName || "").toLowerCase(),
                    role: el.getAttribute("role"),
                    name: label || null,
                    x: r.left, y: r.top, width: r.width, height: r.height,
                    interactive: !!target && !el.disabled && r.width > 0 && r.height > 0
                }};
            }})({x}, {y})"#,
            selector = serde_json::to_string(INTERACTIVE_SELECTOR)
                .map_err(|e| BackendError::Execution(e.to_string()))?,
            x = at.x(),
            y = at.y(),
        );
        let probe: Option<ElementProbe> = self.eval(script).await?;
        Ok(probe.map(|p| ElementInfo {
            tag: p.tag,
            role: p.role,
            name: p.name,
            rect: Rect {
                x: p.x,
                y: p.y,
                width: p.width,
                height: p.height,
            },
            interactive: p.interactive,
        }))
    }

    async fn navigate(&mut self, url: &str) -> BackendResult<String> {
        let page = self.page()?;
        page.goto(url)
            .await
            .map_err(|e| self.fail(&format!("Failed to navigate to {}", url), e))?;
        let _ = page.wait_for_navigation().await;
        ChromiumBackend::current_url(self).await
    }

    async fn reload(&mut self) -> BackendResult<String> {
        self.page()?
            .reload()
            .await
            .map_err(|e| self.fail("Reload failed", e))?;
        ChromiumBackend::current_url(self).await
    }

    async fn go_back(&mut self) -> BackendResult<String> {
        self.history_step(-1).await
    }

    async fn go_forward(&mut self) -> BackendResult<String> {
        self.history_step(1).await
    }

    async fn current_url(&mut self) -> BackendResult<String> {
        ChromiumBackend::current_url(self).await
    }

    async fn tabs(&mut self) -> BackendResult<Vec<TabInfo>> {
        let mut tabs = Vec::with_capacity(self.pages.len());
        for (id, page) in self.pages.iter().enumerate() {
            tabs.push(self.tab_info(id, page).await);
        }
        Ok(tabs)
    }

    async fn new_tab(&mut self, url: Option<&str>) -> BackendResult<TabInfo> {
        let page = self
            .browser
            .new_page(url.unwrap_or("about:blank"))
            .await
            .map_err(|e| self.fail("Failed to open tab", e))?;
        page.bring_to_front()
            .await
            .map_err(|e| self.fail("Failed to focus tab", e))?;
        self.pages.push(page);
        self.current = self.pages.len() - 1;
        let page = self.page()?;
        Ok(self.tab_info(self.current, page).await)
    }

    async fn close_tab(&mut self, id: Option<usize>) -> BackendResult<Vec<TabInfo>> {
        let id = id.unwrap_or(self.current);
        if id >= self.pages.len() {
            return Err(BackendError::Execution(format!("No tab with id {}", id)));
        }
        if self.pages.len() == 1 {
            return Err(BackendError::Execution(
                "Cannot close the last tab; stop the session instead".to_string(),
            ));
        }
        let page = self.pages.remove(id);
        page.close()
            .await
            .map_err(|e| self.fail("Failed to close tab", e))?;
        if self.current >= id && self.current > 0 {
            self.current -= 1;
        }
        self.page()?
            .bring_to_front()
            .await
            .map_err(|e| self.fail("Failed to focus tab", e))?;
        self.tabs().await
    }

    async fn switch_tab(&mut self, id: usize) -> BackendResult<TabInfo> {
        let page = self
            .pages
            .get(id)
            .ok_or_else(|| BackendError::Execution(format!("No tab with id {}", id)))?;
        page.bring_to_front()
            .await
            .map_err(|e| self.fail("Failed to switch tab", e))?;
        self.current = id;
        let page = self.page()?;
        Ok(self.tab_info(id, page).await)
    }

    async fn dom_tree(&mut self) -> BackendResult<Value> {
        let script = format!(
            r#"(() => {{
                document.querySelectorAll("[{attr}]").forEach((el) => el.removeAttribute("{attr}"));
                const nodes = document.querySelectorAll({selector});
                const elements = [];
                let ref = 0;
                nodes.forEach((el) => {{
                    const r = el.getBoundingClientRect();
                    const style = window.getComputedStyle(el);
                    const visible = style.display !== "none" && style.visibility !== "hidden" && r.width > 0 && r.height > 0;
                    if (!visible || r.bottom <= 0 || r.top >= window.innerHeight) return;
                    const tag = el.tagName.toLowerCase();
                    const role = el.getAttribute("role") ||
                        (tag === "a" ? "link" : tag === "button" ? "button" :
                         tag === "select" ? "combobox" : tag === "textarea" ? "textbox" :
                         tag === "input" ? (el.type === "checkbox" ? "checkbox" : el.type === "radio" ? "radio" : "textbox") : tag);
                    const name = el.getAttribute("aria-label") || el.getAttribute("title") ||
                        el.getAttribute("placeholder") || el.getAttribute("alt") ||
                        (el.textContent || "").trim().slice(0, 50) || null;
                    ref += 1;
                    el.setAttribute("{attr}", "e" + ref);
                    elements.push({{
                        ref: "e" + ref,
                        tag, role, name,
                        x: Math.round(r.left + r.width / 2),
                        y: Math.round(r.top + r.height / 2),
                        width: Math.round(r.width),
                        height: Math.round(r.height),
                        focused: document.activeElement === el,
                        disabled: !!el.disabled
                    }});
                }});
                return {{
                    url: location.href,
                    title: document.title,
                    viewport: {{ width: window.innerWidth, height: window.innerHeight }},
                    elements
                }};
            }})()"#,
            selector = serde_json::to_string(INTERACTIVE_SELECTOR)
                .map_err(|e| BackendError::Execution(e.to_string()))?,
            attr = REF_ATTRIBUTE,
        );
        self.eval(script).await
    }

    async fn element_rect(&mut self, query: &ElementQuery) -> BackendResult<ElementMatch> {
        let locator = query
            .locator()
            .map_err(|e| BackendError::Execution(e.to_string()))?;
        let script = format!(
            r#"((spec, index) => {{
                const found = ({locate})(spec);
                if (found.length === 0) return {{ count: 0, visible: false, enabled: false }};
                const el = found[index < found.length ? index : 0];
                const r = el.getBoundingClientRect();
                const style = window.getComputedStyle(el);
                const visible = style.display !== "none" && style.visibility !== "hidden" && r.width > 0 && r.height > 0;
                return {{
                    count: found.length,
                    visible,
                    enabled: !el.disabled,
                    x: r.left, y: r.top, width: r.width, height: r.height,
                    tag: el.tagName.toLowerCase(),
                    text: (el.innerText || "").slice(0, 100)
                }};
            }})({spec}, {index})"#,
            locate = LOCATE_FN,
            spec = js_arg(&locator_spec(&locator))?,
            index = query.index,
        );
        let probe: MatchProbe = self.eval(script).await?;

        let mut found = ElementMatch {
            found: probe.count > 0,
            visible: probe.visible,
            enabled: probe.enabled,
            element_count: probe.count,
            selector_used: locator.to_string(),
            ..Default::default()
        };
        if !found.found || (query.must_be_visible && !probe.visible) {
            return Ok(found);
        }
        if let (Some(x), Some(y), Some(width), Some(height)) = (probe.x, probe.y, probe.width, probe.height) {
            let rect = Rect { x, y, width, height };
            let (cx, cy) = rect.center();
            found.x = Some(cx as i64);
            found.y = Some(cy as i64);
            found.bounding_box = Some(rect);
        }
        found.tag = probe.tag;
        found.text = probe.text;
        Ok(found)
    }

    async fn wait_for_selector(
        &mut self,
        selector: &str,
        state: SelectorState,
        timeout: Duration,
    ) -> BackendResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let observed = self.selector_state(selector).await?;
            if selector_reached(&observed, state) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(BackendError::Execution(format!(
                    "Timeout waiting for selector {} to be {} after {}ms",
                    selector,
                    state.as_str(),
                    timeout.as_millis()
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn wait_for_load_state(&mut self, state: LoadState, timeout: Duration) -> BackendResult<()> {
        let deadline = Instant::now() + timeout;
        let mut last_resources: Option<(usize, Instant)> = None;
        loop {
            let (ready, resources) = self.load_progress().await?;
            let reached = match state {
                LoadState::DomContentLoaded => ready != "loading",
                LoadState::Load => ready == "complete",
                LoadState::NetworkIdle => {
                    // no new resource entries for a quiet period after load
                    let now = Instant::now();
                    let since = match last_resources {
                        Some((count, at)) if count == resources => at,
                        _ => {
                            last_resources = Some((resources, now));
                            now
                        }
                    };
                    ready == "complete" && now.duration_since(since) >= NETWORK_QUIET
                }
            };
            if reached {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(BackendError::Execution(format!(
                    "Timeout waiting for load state {} after {}ms",
                    state.as_str(),
                    timeout.as_millis()
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn select_option(&mut self, selector: &str, choice: &OptionChoice) -> BackendResult<Vec<String>> {
        let choice = match choice {
            OptionChoice::Value(v) => json!({ "value": v }),
            OptionChoice::Label(l) => json!({ "label": l }),
            OptionChoice::Index(i) => json!({ "index": i }),
        };
        let script = format!(
            r#"((sel, choice) => {{
                const el = document.querySelector(sel);
                if (!el) return {{ error: "No element matches " + sel }};
                if (el.tagName.toLowerCase() !== "select") return {{ error: "Element is not a <select>" }};
                const options = Array.from(el.options);
                let idx = -1;
                if (choice.value !== undefined) idx = options.findIndex((o) => o.value === choice.value);
                else if (choice.label !== undefined) idx = options.findIndex((o) => o.label === choice.label || o.text.trim() === choice.label);
                else if (choice.index < options.length) idx = choice.index;
                if (idx < 0) return {{ error: "No matching option" }};
                el.selectedIndex = idx;
                el.dispatchEvent(new Event("input", {{ bubbles: true }}));
                el.dispatchEvent(new Event("change", {{ bubbles: true }}));
                return {{ selected: Array.from(el.selectedOptions).map((o) => o.value) }};
            }})({selector}, {choice})"#,
            selector = js_arg(selector)?,
            choice = js_arg(&choice)?,
        );
        let probe: SelectProbe = self.eval(script).await?;
        match probe.error {
            Some(error) => Err(BackendError::Execution(error)),
            None => Ok(probe.selected),
        }
    }

    async fn is_alive(&mut self) -> bool {
        self.alive.load(Ordering::SeqCst) && self.browser.version().await.is_ok()
    }

    async fn close(&mut self) -> BackendResult<()> {
        let closed = self.browser.close().await;
        let _ = tokio::time::timeout(Duration::from_secs(5), self.browser.wait()).await;
        self.handler.abort();
        self.alive.store(false, Ordering::SeqCst);
        if let Err(e) = tokio::fs::remove_dir_all(&self.profile_dir).await {
            warn!(dir = %self.profile_dir.display(), error = %e, "failed to remove browser profile");
        }
        closed
            .map(|_| ())
            .map_err(|e| BackendError::Execution(format!("Browser close failed: {}", e)))
    }
}

fn modifier_bit(modifier: Modifier) -> i64 {
    match modifier {
        Modifier::Alt => 1,
        Modifier::Control => 2,
        Modifier::Meta => 4,
        Modifier::Shift => 8,
    }
}

fn lookup_key(name: &str) -> BackendResult<&'static KeyDefinition> {
    keys::get_key_definition(name)
        .or_else(|| {
            keys::USKEYBOARD_LAYOUT
                .iter()
                .find(|definition| definition.key.eq_ignore_ascii_case(name))
        })
        .ok_or_else(|| BackendError::Execution(format!("Unsupported key '{}'", name)))
}

fn needs_no_sandbox() -> bool {
    std::env::var("CI").is_ok()
        || std::env::var("NO_SANDBOX").is_ok()
        || std::env::var("USER").map(|u| u == "root").unwrap_or(false)
}

#[cfg(target_os = "linux")]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(target_os = "linux"))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

pub fn find_chrome_binary(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return is_executable(path).then(|| path.to_path_buf());
    }

    let candidates = [
        "/usr/bin/google-chrome",
        "/usr/bin/google-chrome-stable",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
        "/snap/bin/chromium",
        "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        "/Applications/Chromium.app/Contents/MacOS/Chromium",
        r"C:\Program Files\Google\Chrome\Application\chrome.exe",
        r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
    ];
    if let Some(found) = candidates
        .iter()
        .map(PathBuf::from)
        .find(|p| is_executable(p))
    {
        return Some(found);
    }

    let names = ["google-chrome", "chromium", "chromium-browser", "chrome"];
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .flat_map(|dir| names.iter().map(move |n| dir.join(n)))
        .find(|p| is_executable(p))
}
