//! The engine facade: session registry, dispatcher and healing chain behind
//! one object that the HTTP layer holds.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::action::{Action, ActionResult, ClickKind};
use crate::backend::{Backend, BackendError, BackendLauncher, Capabilities, Capture, ElementInfo, TabInfo};
use crate::config::EngineConfig;
use crate::dispatcher::ActionDispatcher;
use crate::dom::{DomRef, ElementMatch, ElementQuery, LoadState, OptionChoice, RefMap, SelectorState};
use crate::error::{EngineError, EngineResult, ValidationError};
use crate::geometry::{
    Conversion, CoordinateSpace, CoordinateTransformer, Dimensions, Point, ScaleFactors, Surface,
};
use crate::healing::SelfHealingExecutor;
use crate::screenshot::{OptimizeFor, Screenshot};
use crate::session::{Scope, Session, SessionInfo, SessionManager, StartOptions};

/// Result of an action together with the session it ran on.
pub struct Outcome {
    pub session: Arc<Session>,
    pub result: ActionResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct BrowserStarted {
    pub session_id: String,
    pub current_url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BrowserStatus {
    pub session_id: String,
    pub alive: bool,
    pub current_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversionReport {
    pub conversion: Conversion,
    pub reference_dimensions: Dimensions,
}

#[derive(Debug, Clone, Serialize)]
pub struct PointCheck {
    pub valid: bool,
    pub resolved: Point,
    pub bounds: Option<Dimensions>,
    pub element_info: Option<ElementInfo>,
    pub pixel_color: Option<[u8; 3]>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub status: &'static str,
    pub version: &'static str,
    pub browser_sessions: usize,
    pub desktop_sessions: usize,
    pub capabilities: Capabilities,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScreenReport {
    pub lux_sdk_reference: Dimensions,
    pub viewport_reference: Dimensions,
    pub screen: Option<Dimensions>,
    pub lux_scale: Option<ScaleFactors>,
}

pub struct Engine {
    config: Arc<EngineConfig>,
    sessions: SessionManager,
    executor: SelfHealingExecutor,
}

impl Engine {
    pub fn new(config: Arc<EngineConfig>, launcher: Arc<dyn BackendLauncher>) -> Self {
        let sessions = SessionManager::new(launcher, config.loop_detection);
        let executor = SelfHealingExecutor::new(ActionDispatcher::new(&config));
        Self {
            config,
            sessions,
            executor,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    fn dispatcher(&self) -> &ActionDispatcher {
        self.executor.dispatcher()
    }

    /// Picks the named session, or the oldest live one of `scope` when no id
    /// is given. A named session of the wrong scope is rejected.
    pub fn resolve_session(
        &self,
        scope: Option<Scope>,
        session_id: Option<&str>,
    ) -> EngineResult<Arc<Session>> {
        match session_id {
            Some(id) => {
                let session = self.sessions.get(id)?;
                match scope {
                    Some(expected) if expected != session.scope() => {
                        Err(ValidationError::ScopeMismatch {
                            session_id: id.to_string(),
                            expected: expected.to_string(),
                            actual: session.scope().to_string(),
                        }
                        .into())
                    }
                    _ => Ok(session),
                }
            }
            None => {
                let scope = scope.unwrap_or(Scope::Browser);
                self.sessions.first_active(scope).ok_or_else(|| {
                    EngineError::SessionNotFound(format!("no active {} session", scope))
                })
            }
        }
    }

    pub async fn start_browser(
        &self,
        start_url: Option<String>,
        headless: Option<bool>,
    ) -> EngineResult<BrowserStarted> {
        let options = StartOptions {
            start_url,
            headless: headless.unwrap_or(self.config.headless),
            viewport: Some(self.config.default_viewport),
        };
        let session = self.sessions.start(Scope::Browser, options).await?;
        let current_url = self
            .with_backend(&session, |b| b.current_url())
            .await
            .unwrap_or_default();
        Ok(BrowserStarted {
            session_id: session.id().to_string(),
            current_url,
        })
    }

    pub async fn start_desktop(&self) -> EngineResult<Arc<Session>> {
        self.sessions.start(Scope::Desktop, StartOptions::default()).await
    }

    /// Boot-time desktop session; absence of a display is not fatal.
    pub async fn start_default_desktop(&self) {
        match self.start_desktop().await {
            Ok(session) => info!(session_id = session.id(), "default desktop session ready"),
            Err(e) => warn!(error = %e, "no default desktop session"),
        }
    }

    /// Stops the named session, or the oldest of `scope`. Stopping nothing is not an error.
    pub async fn stop_session(&self, scope: Scope, session_id: Option<&str>) -> EngineResult<bool> {
        let target = match session_id {
            Some(id) => match self.resolve_session(Some(scope), Some(id)) {
                Ok(session) => session.id().to_string(),
                Err(EngineError::SessionNotFound(_)) | Err(EngineError::SessionStopped(_)) => {
                    return Ok(false)
                }
                Err(e) => return Err(e),
            },
            None => match self.sessions.first_active(scope) {
                Some(session) => session.id().to_string(),
                None => return Ok(false),
            },
        };
        self.sessions.stop(&target).await
    }

    pub async fn shutdown(&self) {
        self.sessions.stop_all().await;
    }

    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        self.sessions.list_active()
    }

    pub async fn execute(
        &self,
        scope: Option<Scope>,
        session_id: Option<&str>,
        action: Action,
    ) -> EngineResult<Outcome> {
        let session = self.resolve_session(scope, session_id)?;
        let result = self.executor.execute(&session, action).await;
        Ok(Outcome { session, result })
    }

    /// Runs one direct backend call under the session lock, timeout and cancellation.
    async fn with_backend<T, F>(&self, session: &Session, op: F) -> EngineResult<T>
    where
        F: for<'b> FnOnce(&'b mut dyn Backend) -> BoxFuture<'b, Result<T, BackendError>>,
    {
        self.with_backend_for(session, self.dispatcher().timeout(), op)
            .await
    }

    async fn with_backend_for<T, F>(&self, session: &Session, limit: Duration, op: F) -> EngineResult<T>
    where
        F: for<'b> FnOnce(&'b mut dyn Backend) -> BoxFuture<'b, Result<T, BackendError>>,
    {
        let mut backend = session.lock_backend().await?;
        let value = self
            .dispatcher()
            .guarded_for(session, limit, op(backend.as_mut()))
            .await?;
        session.touch();
        Ok(value)
    }

    pub async fn capture(&self, session: &Session) -> EngineResult<Capture> {
        self.with_backend(session, |b| b.capture()).await
    }

    pub async fn snapshot(
        &self,
        session: &Session,
        optimize: Option<OptimizeFor>,
    ) -> EngineResult<Screenshot> {
        let capture = self.capture(session).await?;
        tokio::task::spawn_blocking(move || Screenshot::from_capture(&capture, optimize))
            .await
            .map_err(|e| EngineError::BackendExecution(format!("Screenshot encoding failed: {}", e)))?
            .map_err(|e| e.into_engine(session.scope()))
    }

    pub async fn screenshot(
        &self,
        scope: Option<Scope>,
        session_id: Option<&str>,
        optimize: Option<OptimizeFor>,
    ) -> EngineResult<Screenshot> {
        let session = self.resolve_session(scope, session_id)?;
        self.snapshot(&session, optimize).await
    }

    async fn fresh_surface(&self, session: &Session) -> EngineResult<Surface> {
        let mut backend = session.lock_backend().await?;
        self.dispatcher().surface(session, backend.as_mut()).await
    }

    /// Surface used for conversions when the caller names no session.
    fn fallback_surface(&self) -> Surface {
        Surface {
            viewport: Some(self.config.default_viewport),
            screen: None,
            viewport_origin: None,
        }
    }

    pub async fn convert(
        &self,
        point: Point,
        to: CoordinateSpace,
        session_id: Option<&str>,
    ) -> EngineResult<ConversionReport> {
        let session = match session_id {
            Some(id) => Some(self.sessions.get(id)?),
            None => self
                .sessions
                .first_active(Scope::Browser)
                .or_else(|| self.sessions.first_active(Scope::Desktop)),
        };
        let surface = match session {
            Some(session) => self.fresh_surface(&session).await?,
            None => self.fallback_surface(),
        };
        let conversion = CoordinateTransformer::convert(point, to, &surface)?;
        Ok(ConversionReport {
            conversion,
            reference_dimensions: Dimensions::reference(),
        })
    }

    /// Bounds-checks a point against the session's live surface and reports
    /// what sits there, without acting on it.
    pub async fn validate(
        &self,
        scope: Option<Scope>,
        session_id: Option<&str>,
        point: Point,
    ) -> EngineResult<PointCheck> {
        let session = self.resolve_session(scope, session_id)?;
        let native = session.scope().native_space();
        let mut backend = session.lock_backend().await?;
        let surface = self.dispatcher().surface(&session, backend.as_mut()).await?;

        let resolved = CoordinateTransformer::convert(point, native, &surface)?.point;
        let bounds = surface.dimensions(native);
        let valid = CoordinateTransformer::validate_bounds(&resolved, &surface)?;

        let mut check = PointCheck {
            valid,
            resolved,
            bounds,
            element_info: None,
            pixel_color: None,
        };
        if !valid {
            return Ok(check);
        }

        let at = CoordinateTransformer::resolve(point, native, &surface)?.native;
        match session.scope() {
            Scope::Browser => {
                match self.dispatcher().guarded(&session, backend.element_at(at)).await {
                    Ok(element) => check.element_info = element,
                    Err(e) => debug!(session_id = session.id(), error = %e, "element lookup failed"),
                }
            }
            Scope::Desktop => {
                match self.dispatcher().guarded(&session, backend.pixel_at(at)).await {
                    Ok(color) => check.pixel_color = color,
                    Err(e) => debug!(session_id = session.id(), error = %e, "pixel sample failed"),
                }
            }
        }
        Ok(check)
    }

    fn browser(&self, session_id: Option<&str>) -> EngineResult<Arc<Session>> {
        self.resolve_session(Some(Scope::Browser), session_id)
    }

    pub async fn navigate(&self, session_id: Option<&str>, url: String) -> EngineResult<String> {
        let session = self.browser(session_id)?;
        info!(session_id = session.id(), %url, "navigate");
        self.with_backend(&session, move |b| Box::pin(async move { b.navigate(&url).await }))
            .await
    }

    pub async fn reload(&self, session_id: Option<&str>) -> EngineResult<String> {
        let session = self.browser(session_id)?;
        self.with_backend(&session, |b| b.reload()).await
    }

    pub async fn go_back(&self, session_id: Option<&str>) -> EngineResult<String> {
        let session = self.browser(session_id)?;
        self.with_backend(&session, |b| b.go_back()).await
    }

    pub async fn go_forward(&self, session_id: Option<&str>) -> EngineResult<String> {
        let session = self.browser(session_id)?;
        self.with_backend(&session, |b| b.go_forward()).await
    }

    pub async fn current_url(&self, session_id: Option<&str>) -> EngineResult<String> {
        let session = self.browser(session_id)?;
        self.with_backend(&session, |b| b.current_url()).await
    }

    pub async fn tabs(&self, session_id: Option<&str>) -> EngineResult<Vec<TabInfo>> {
        let session = self.browser(session_id)?;
        self.with_backend(&session, |b| b.tabs()).await
    }

    pub async fn new_tab(&self, session_id: Option<&str>, url: Option<String>) -> EngineResult<TabInfo> {
        let session = self.browser(session_id)?;
        self.with_backend(&session, move |b| {
            Box::pin(async move { b.new_tab(url.as_deref()).await })
        })
        .await
    }

    pub async fn close_tab(&self, session_id: Option<&str>, tab_id: Option<usize>) -> EngineResult<Vec<TabInfo>> {
        let session = self.browser(session_id)?;
        self.with_backend(&session, move |b| b.close_tab(tab_id)).await
    }

    pub async fn switch_tab(&self, session_id: Option<&str>, tab_id: usize) -> EngineResult<TabInfo> {
        let session = self.browser(session_id)?;
        self.with_backend(&session, move |b| b.switch_tab(tab_id)).await
    }

    /// Dumps the page's interactive elements and keeps their refs for later calls.
    pub async fn dom_tree(&self, session_id: Option<&str>) -> EngineResult<Value> {
        let session = self.browser(session_id)?;
        let tree = self.with_backend(&session, |b| b.dom_tree()).await?;
        let refs = RefMap::from_tree(&tree);
        debug!(session_id = session.id(), refs = refs.len(), "dom tree captured");
        session.remember_refs(refs);
        Ok(tree)
    }

    fn known_ref(session: &Session, ref_id: &str) -> EngineResult<DomRef> {
        session
            .lookup_ref(ref_id)
            .ok_or_else(|| ValidationError::UnknownRef(ref_id.trim().to_string()).into())
    }

    /// Clicks the centre of an element from the last DOM tree. The click is
    /// an ordinary viewport click, so it is bounds-checked and may heal.
    pub async fn click_by_ref(
        &self,
        session_id: Option<&str>,
        ref_id: &str,
        kind: ClickKind,
    ) -> EngineResult<(Outcome, DomRef)> {
        let session = self.browser(session_id)?;
        let element = Self::known_ref(&session, ref_id)?;
        info!(session_id = session.id(), ref_id = %element.id, x = element.x, y = element.y, "click by ref");
        let action = Action::Click {
            at: Point::new(CoordinateSpace::Viewport, element.x, element.y),
            kind,
        };
        let result = self.executor.execute(&session, action).await;
        Ok((Outcome { session, result }, element))
    }

    pub async fn element_rect(
        &self,
        session_id: Option<&str>,
        query: ElementQuery,
    ) -> EngineResult<ElementMatch> {
        query.locator()?;
        let session = self.browser(session_id)?;
        self.with_backend(&session, move |b| {
            Box::pin(async move { b.element_rect(&query).await })
        })
        .await
    }

    /// Page-side waits report their own timeout; the outer guard only
    /// catches a backend that stops answering.
    fn wait_limit(&self, timeout: Duration) -> EngineResult<Duration> {
        let max = self.dispatcher().max_wait();
        if timeout > max {
            return Err(ValidationError::InvalidValue {
                field: "timeout",
                reason: format!("must be at most {}ms", max.as_millis()),
            }
            .into());
        }
        Ok(timeout + self.dispatcher().timeout())
    }

    pub async fn wait_for_selector(
        &self,
        session_id: Option<&str>,
        selector: String,
        state: SelectorState,
        timeout: Duration,
    ) -> EngineResult<()> {
        if selector.trim().is_empty() {
            return Err(ValidationError::MissingField("selector").into());
        }
        let limit = self.wait_limit(timeout)?;
        let session = self.browser(session_id)?;
        debug!(session_id = session.id(), %selector, state = state.as_str(), "wait for selector");
        self.with_backend_for(&session, limit, move |b| {
            Box::pin(async move { b.wait_for_selector(&selector, state, timeout).await })
        })
        .await
    }

    pub async fn wait_for_load_state(
        &self,
        session_id: Option<&str>,
        state: LoadState,
        timeout: Duration,
    ) -> EngineResult<()> {
        let limit = self.wait_limit(timeout)?;
        let session = self.browser(session_id)?;
        debug!(session_id = session.id(), state = state.as_str(), "wait for load state");
        self.with_backend_for(&session, limit, move |b| b.wait_for_load_state(state, timeout))
            .await
    }

    /// Picks an option in a `<select>` found by ref or selector; a ref wins.
    pub async fn select_option(
        &self,
        session_id: Option<&str>,
        ref_id: Option<&str>,
        selector: Option<String>,
        choice: OptionChoice,
    ) -> EngineResult<Vec<String>> {
        let session = self.browser(session_id)?;
        let selector = match (ref_id.filter(|r| !r.trim().is_empty()), selector) {
            (Some(ref_id), _) => Self::known_ref(&session, ref_id)?.selector(),
            (None, Some(selector)) if !selector.trim().is_empty() => selector,
            _ => return Err(ValidationError::MissingField("selector").into()),
        };
        self.with_backend(&session, move |b| {
            Box::pin(async move { b.select_option(&selector, &choice).await })
        })
        .await
    }

    /// Liveness of one browser session, or of all of them.
    pub async fn browser_status(&self, session_id: Option<&str>) -> EngineResult<Vec<BrowserStatus>> {
        let sessions = match session_id {
            Some(id) => vec![self.browser(Some(id))?],
            None => self
                .sessions
                .list_active()
                .into_iter()
                .filter(|info| info.scope == Scope::Browser)
                .filter_map(|info| self.sessions.get(&info.session_id).ok())
                .collect(),
        };

        let mut report = Vec::with_capacity(sessions.len());
        for session in sessions {
            let alive = self
                .with_backend(&session, |b| {
                    Box::pin(async move { Ok::<_, BackendError>(b.is_alive().await) })
                })
                .await
                .unwrap_or(false);
            let current_url = if alive {
                self.with_backend(&session, |b| b.current_url()).await.ok()
            } else {
                None
            };
            report.push(BrowserStatus {
                session_id: session.id().to_string(),
                alive,
                current_url,
            });
        }
        Ok(report)
    }

    pub fn status(&self) -> StatusReport {
        StatusReport {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
            browser_sessions: self.sessions.count(Scope::Browser),
            desktop_sessions: self.sessions.count(Scope::Desktop),
            capabilities: self.sessions.launcher().capabilities(),
        }
    }

    pub async fn screen(&self) -> ScreenReport {
        let screen = match self.sessions.first_active(Scope::Desktop) {
            Some(session) => match self.fresh_surface(&session).await {
                Ok(surface) => surface.screen,
                Err(e) => {
                    debug!(error = %e, "screen size unavailable");
                    session.last_surface().screen
                }
            },
            None => None,
        };
        ScreenReport {
            lux_sdk_reference: Dimensions::reference(),
            viewport_reference: self.config.default_viewport,
            screen,
            lux_scale: screen.map(|s| ScaleFactors::between(Dimensions::reference(), s)),
        }
    }
}
