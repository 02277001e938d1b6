use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::{HeaderValue, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::action::{ActionResult, ClickKind, RawAction};
use crate::dom::{ElementQuery, LoadState, OptionChoice, SelectorState};
use crate::engine::{Engine, Outcome};
use crate::error::{EngineError, ValidationError};
use crate::geometry::{CoordinateSpace, Point};
use crate::screenshot::OptimizeFor;
use crate::session::{Scope, Session};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

type ApiError = (StatusCode, Json<Value>);
type ApiResult = Result<Json<Value>, ApiError>;

// Request types

#[derive(Debug, Default, Deserialize)]
pub struct SessionQuery {
    pub session_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct BrowserStartRequest {
    pub start_url: Option<String>,
    pub headless: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ScreenshotRequest {
    pub scope: Option<String>,
    pub session_id: Option<String>,
    pub optimize_for: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ClickRequest {
    pub scope: Option<String>,
    pub session_id: Option<String>,
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub coordinate_origin: Option<String>,
    pub click_type: Option<String>,
    #[serde(default)]
    pub include_screenshot: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct HoverRequest {
    pub scope: Option<String>,
    pub session_id: Option<String>,
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub coordinate_origin: Option<String>,
    #[serde(default)]
    pub include_screenshot: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct DragRequest {
    pub scope: Option<String>,
    pub session_id: Option<String>,
    pub start_x: Option<f64>,
    pub start_y: Option<f64>,
    pub end_x: Option<f64>,
    pub end_y: Option<f64>,
    pub coordinate_origin: Option<String>,
    #[serde(default)]
    pub include_screenshot: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct TypeRequest {
    pub scope: Option<String>,
    pub session_id: Option<String>,
    pub text: Option<String>,
    pub method: Option<String>,
    pub selector: Option<String>,
    #[serde(default)]
    pub include_screenshot: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct ScrollRequest {
    pub scope: Option<String>,
    pub session_id: Option<String>,
    pub direction: Option<String>,
    pub amount: Option<i32>,
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub coordinate_origin: Option<String>,
    #[serde(default)]
    pub include_screenshot: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct KeypressRequest {
    pub scope: Option<String>,
    pub session_id: Option<String>,
    pub key: Option<String>,
    #[serde(default)]
    pub include_screenshot: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct WaitRequest {
    pub scope: Option<String>,
    pub session_id: Option<String>,
    pub duration: Option<f64>,
    #[serde(default)]
    pub include_screenshot: bool,
}

#[derive(Debug, Deserialize)]
pub struct ActionRequest {
    pub scope: Option<String>,
    pub session_id: Option<String>,
    #[serde(default)]
    pub include_screenshot: bool,
    #[serde(flatten)]
    pub action: RawAction,
}

#[derive(Debug, Default, Deserialize)]
pub struct NavigateRequest {
    pub session_id: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TabRequest {
    pub session_id: Option<String>,
    pub url: Option<String>,
    #[serde(alias = "id", alias = "index")]
    pub tab_id: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ConvertRequest {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub from_space: Option<String>,
    pub to_space: Option<String>,
    pub session_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ValidateRequest {
    pub scope: Option<String>,
    pub session_id: Option<String>,
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub coordinate_origin: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ClickByRefRequest {
    pub session_id: Option<String>,
    #[serde(rename = "ref")]
    pub ref_id: Option<String>,
    pub click_type: Option<String>,
    #[serde(default)]
    pub include_screenshot: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct ElementRectRequest {
    pub session_id: Option<String>,
    #[serde(flatten)]
    pub query: ElementQuery,
}

#[derive(Debug, Default, Deserialize)]
pub struct WaitForSelectorRequest {
    pub session_id: Option<String>,
    pub selector: Option<String>,
    pub state: Option<String>,
    /// Milliseconds.
    pub timeout: Option<u64>,
    #[serde(default)]
    pub include_screenshot: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct WaitForLoadStateRequest {
    pub session_id: Option<String>,
    pub state: Option<String>,
    pub timeout: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SelectOptionRequest {
    pub session_id: Option<String>,
    pub selector: Option<String>,
    #[serde(rename = "ref")]
    pub ref_id: Option<String>,
    pub value: Option<String>,
    pub label: Option<String>,
    pub index: Option<usize>,
    #[serde(default)]
    pub include_screenshot: bool,
}

const DEFAULT_WAIT_TIMEOUT_MS: u64 = 30_000;

pub async fn start_api_server(engine: Arc<Engine>) -> anyhow::Result<()> {
    let bind_addr = engine.config().bind_addr();
    let app = router(engine.clone());

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", bind_addr, e))?;
    info!(addr = %bind_addr, "tool server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    info!("shutting down, stopping all sessions");
    engine.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

pub fn router(engine: Arc<Engine>) -> Router {
    let cors = cors_layer(&engine.config().allowed_origins);
    let state = AppState { engine };

    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(status))
        .route("/screen", get(screen))
        .route("/sessions", get(list_sessions))
        .route("/browser/start", post(browser_start))
        .route("/browser/stop", post(browser_stop))
        .route("/browser/status", get(browser_status))
        .route("/browser/current_url", get(browser_current_url))
        .route("/browser/navigate", post(browser_navigate))
        .route("/browser/reload", post(browser_reload))
        .route("/browser/back", post(browser_back))
        .route("/browser/forward", post(browser_forward))
        .route("/browser/tabs", get(browser_tabs))
        .route("/browser/tab/new", post(browser_tab_new))
        .route("/browser/tab/close", post(browser_tab_close))
        .route("/browser/tab/switch", post(browser_tab_switch))
        .route("/browser/dom/tree", get(browser_dom_tree))
        .route("/browser/dom/element_rect", post(browser_element_rect))
        .route("/desktop/start", post(desktop_start))
        .route("/desktop/stop", post(desktop_stop))
        .route("/screenshot", post(screenshot))
        .route("/click", post(click))
        .route("/hover", post(hover))
        .route("/drag", post(drag))
        .route("/type", post(type_text))
        .route("/scroll", post(scroll))
        .route("/keypress", post(keypress))
        .route("/wait", post(wait))
        .route("/click_by_ref", post(click_by_ref))
        .route("/wait_for_selector", post(wait_for_selector))
        .route("/wait_for_load_state", post(wait_for_load_state))
        .route("/select_option", post(select_option))
        .route("/action", post(action))
        .route("/coordinates/convert", post(coordinates_convert))
        .route("/coordinates/validate", post(coordinates_validate))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn cors_layer(allowed: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(%origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    let cors = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() {
        cors.allow_origin(Any)
    } else {
        cors.allow_origin(AllowOrigin::list(origins))
    }
}

// Helpers

fn engine_error(err: EngineError) -> ApiError {
    let mut body = json!({
        "success": false,
        "error": err.to_string(),
        "error_kind": err.kind(),
    });
    if let Some(details) = err.details() {
        body["details"] = details;
    }
    (err.status_code(), Json(body))
}

fn invalid(err: ValidationError) -> ApiError {
    engine_error(EngineError::Validation(err))
}

fn parse_body<T: DeserializeOwned + Default>(body: Option<Json<Value>>) -> Result<T, ApiError> {
    match body {
        None | Some(Json(Value::Null)) => Ok(T::default()),
        Some(Json(value)) => serde_json::from_value(value).map_err(|e| {
            invalid(ValidationError::InvalidValue {
                field: "body",
                reason: e.to_string(),
            })
        }),
    }
}

fn parse_scope(raw: Option<&str>) -> Result<Option<Scope>, ApiError> {
    raw.filter(|s| !s.trim().is_empty())
        .map(str::parse::<Scope>)
        .transpose()
        .map_err(invalid)
}

fn parse_space(raw: Option<&str>, field: &'static str) -> Result<CoordinateSpace, ApiError> {
    raw.ok_or(ValidationError::MissingField(field))
        .and_then(str::parse::<CoordinateSpace>)
        .map_err(invalid)
}

fn require_point(x: Option<f64>, y: Option<f64>, space: CoordinateSpace) -> Result<Point, ApiError> {
    let x = x.ok_or_else(|| invalid(ValidationError::MissingField("x")))?;
    let y = y.ok_or_else(|| invalid(ValidationError::MissingField("y")))?;
    Ok(Point::new(space, x, y))
}

fn session_id<'a>(body: Option<&'a str>, query: &'a SessionQuery) -> Option<&'a str> {
    body.or(query.session_id.as_deref())
        .filter(|s| !s.trim().is_empty())
}

/// Runs an action and shapes the shared part of the response.
async fn run_action(
    state: &AppState,
    scope: Option<&str>,
    session_id: Option<&str>,
    raw: RawAction,
    include_screenshot: bool,
    details: impl FnOnce(&ActionResult) -> Value,
) -> ApiResult {
    let scope = parse_scope(scope)?;
    let action = raw.normalize().map_err(invalid)?;
    let outcome = state
        .engine
        .execute(scope, session_id, action)
        .await
        .map_err(engine_error)?;
    action_response(state, outcome, include_screenshot, details).await
}

async fn action_response(
    state: &AppState,
    outcome: Outcome,
    include_screenshot: bool,
    details: impl FnOnce(&ActionResult) -> Value,
) -> ApiResult {
    let Outcome { session, result } = outcome;
    if let Some(err) = result.failure.clone() {
        // carries every attempted strategy when the healing chain ran out
        let message = result
            .error
            .as_ref()
            .map(|report| report.message.clone())
            .unwrap_or_else(|| err.to_string());
        let mut body = json!({
            "success": false,
            "session_id": session.id(),
            "error": message,
            "error_kind": err.kind(),
            "attempted_strategies": result.attempted_strategies,
            "loop_detected": result.loop_detected,
        });
        if let Some(details) = err.details() {
            body["details"] = details;
        }
        return Err((err.status_code(), Json(body)));
    }

    let mut body = json!({
        "success": true,
        "session_id": session.id(),
        "executed_with": result.executed_via,
        "healed": result.healed,
        "healing_method": result.healing_method,
        "attempted_strategies": result.attempted_strategies,
        "loop_detected": result.loop_detected,
        "details": details(&result),
    });
    if include_screenshot {
        attach_screenshot(state, &session, &mut body).await;
    }
    Ok(Json(body))
}

async fn attach_screenshot(state: &AppState, session: &Session, body: &mut Value) {
    match state.engine.snapshot(session, None).await {
        Ok(shot) => body["screenshot"] = json!(shot.original),
        Err(e) => body["screenshot_error"] = json!(e.to_string()),
    }
}

fn wait_timeout(timeout: Option<u64>) -> Duration {
    Duration::from_millis(timeout.unwrap_or(DEFAULT_WAIT_TIMEOUT_MS))
}

/// `viewport_coords` or `screen_coords`, the requested point, and the scale.
fn spatial_details(result: &ActionResult, coordinate_origin: Option<&str>) -> Map<String, Value> {
    let mut details = Map::new();
    let Some(coords) = &result.resolved_coordinates else {
        return details;
    };
    let (rx, ry) = coords.resolved.rounded();
    let key = match coords.resolved.space {
        CoordinateSpace::Screen => "screen_coords",
        _ => "viewport_coords",
    };
    details.insert(key.to_string(), json!({ "x": rx, "y": ry }));
    details.insert(
        "original_coords".to_string(),
        json!({ "x": coords.requested.x, "y": coords.requested.y }),
    );
    details.insert(
        "coordinate_origin".to_string(),
        json!(coordinate_origin.unwrap_or(coords.requested.space.as_str())),
    );
    let (sx, sy) = coords.scale.map(|s| (s.x, s.y)).unwrap_or((1.0, 1.0));
    details.insert("scale_x".to_string(), json!(sx));
    details.insert("scale_y".to_string(), json!(sy));
    details
}

// Handlers

async fn health_check() -> &'static str {
    "ok"
}

async fn status(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.engine.status()))
}

async fn screen(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.engine.screen().await))
}

async fn list_sessions(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "success": true, "sessions": state.engine.list_sessions() }))
}

async fn browser_start(State(state): State<AppState>, body: Option<Json<Value>>) -> ApiResult {
    let req: BrowserStartRequest = parse_body(body)?;
    let started = state
        .engine
        .start_browser(req.start_url, req.headless)
        .await
        .map_err(engine_error)?;
    Ok(Json(json!({
        "success": true,
        "session_id": started.session_id,
        "current_url": started.current_url,
    })))
}

async fn browser_stop(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> ApiResult {
    let was_active = state
        .engine
        .stop_session(Scope::Browser, query.session_id.as_deref())
        .await
        .map_err(engine_error)?;
    Ok(Json(json!({ "success": true, "was_active": was_active })))
}

async fn desktop_start(State(state): State<AppState>) -> ApiResult {
    let session = state.engine.start_desktop().await.map_err(engine_error)?;
    Ok(Json(json!({ "success": true, "session_id": session.id() })))
}

async fn desktop_stop(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> ApiResult {
    let was_active = state
        .engine
        .stop_session(Scope::Desktop, query.session_id.as_deref())
        .await
        .map_err(engine_error)?;
    Ok(Json(json!({ "success": true, "was_active": was_active })))
}

async fn browser_status(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> ApiResult {
    let sessions = state
        .engine
        .browser_status(query.session_id.as_deref())
        .await
        .map_err(engine_error)?;
    Ok(Json(json!({
        "success": true,
        "active": sessions.iter().any(|s| s.alive),
        "sessions": sessions,
    })))
}

async fn browser_current_url(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> ApiResult {
    let url = state
        .engine
        .current_url(query.session_id.as_deref())
        .await
        .map_err(engine_error)?;
    Ok(Json(json!({ "success": true, "url": url })))
}

async fn browser_navigate(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
    body: Option<Json<Value>>,
) -> ApiResult {
    let req: NavigateRequest = parse_body(body)?;
    let url = req
        .url
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| invalid(ValidationError::MissingField("url")))?;
    let url = state
        .engine
        .navigate(session_id(req.session_id.as_deref(), &query), url)
        .await
        .map_err(engine_error)?;
    Ok(Json(json!({ "success": true, "url": url })))
}

async fn browser_reload(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
    body: Option<Json<Value>>,
) -> ApiResult {
    let req: NavigateRequest = parse_body(body)?;
    let url = state
        .engine
        .reload(session_id(req.session_id.as_deref(), &query))
        .await
        .map_err(engine_error)?;
    Ok(Json(json!({ "success": true, "url": url })))
}

async fn browser_back(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
    body: Option<Json<Value>>,
) -> ApiResult {
    let req: NavigateRequest = parse_body(body)?;
    let url = state
        .engine
        .go_back(session_id(req.session_id.as_deref(), &query))
        .await
        .map_err(engine_error)?;
    Ok(Json(json!({ "success": true, "url": url })))
}

async fn browser_forward(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
    body: Option<Json<Value>>,
) -> ApiResult {
    let req: NavigateRequest = parse_body(body)?;
    let url = state
        .engine
        .go_forward(session_id(req.session_id.as_deref(), &query))
        .await
        .map_err(engine_error)?;
    Ok(Json(json!({ "success": true, "url": url })))
}

async fn browser_tabs(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> ApiResult {
    let tabs = state
        .engine
        .tabs(query.session_id.as_deref())
        .await
        .map_err(engine_error)?;
    Ok(Json(json!({ "success": true, "tabs": tabs })))
}

async fn browser_tab_new(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
    body: Option<Json<Value>>,
) -> ApiResult {
    let req: TabRequest = parse_body(body)?;
    let tab = state
        .engine
        .new_tab(session_id(req.session_id.as_deref(), &query), req.url)
        .await
        .map_err(engine_error)?;
    Ok(Json(json!({ "success": true, "tab": tab })))
}

async fn browser_tab_close(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
    body: Option<Json<Value>>,
) -> ApiResult {
    let req: TabRequest = parse_body(body)?;
    let tabs = state
        .engine
        .close_tab(session_id(req.session_id.as_deref(), &query), req.tab_id)
        .await
        .map_err(engine_error)?;
    Ok(Json(json!({ "success": true, "tabs": tabs })))
}

async fn browser_tab_switch(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
    body: Option<Json<Value>>,
) -> ApiResult {
    let req: TabRequest = parse_body(body)?;
    let tab_id = req
        .tab_id
        .ok_or_else(|| invalid(ValidationError::MissingField("tab_id")))?;
    let tab = state
        .engine
        .switch_tab(session_id(req.session_id.as_deref(), &query), tab_id)
        .await
        .map_err(engine_error)?;
    Ok(Json(json!({ "success": true, "tab": tab })))
}

async fn browser_dom_tree(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> ApiResult {
    let tree = state
        .engine
        .dom_tree(query.session_id.as_deref())
        .await
        .map_err(engine_error)?;
    Ok(Json(json!({ "success": true, "tree": tree })))
}

async fn browser_element_rect(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
    body: Option<Json<Value>>,
) -> ApiResult {
    let req: ElementRectRequest = parse_body(body)?;
    let found = state
        .engine
        .element_rect(session_id(req.session_id.as_deref(), &query), req.query)
        .await
        .map_err(engine_error)?;
    let mut body = json!(found);
    body["success"] = json!(true);
    Ok(Json(body))
}

async fn screenshot(State(state): State<AppState>, body: Option<Json<Value>>) -> ApiResult {
    let req: ScreenshotRequest = parse_body(body)?;
    let scope = parse_scope(req.scope.as_deref())?;
    let optimize = req
        .optimize_for
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .map(str::parse::<OptimizeFor>)
        .transpose()
        .map_err(invalid)?;
    let shot = state
        .engine
        .screenshot(scope, req.session_id.as_deref(), optimize)
        .await
        .map_err(engine_error)?;

    let mut body = json!({ "success": true, "original": shot.original });
    if let Some(lux) = shot.lux_optimized {
        body["lux_optimized"] = json!(lux);
    }
    Ok(Json(body))
}

async fn click(State(state): State<AppState>, body: Option<Json<Value>>) -> ApiResult {
    let req: ClickRequest = parse_body(body)?;
    let raw = req.to_raw();
    let click_type = raw.click_type.clone().unwrap_or_else(|| "single".to_string());
    let origin = req.coordinate_origin.clone();
    run_action(
        &state,
        req.scope.as_deref(),
        req.session_id.as_deref(),
        raw,
        req.include_screenshot,
        |result| {
            let mut details = spatial_details(result, origin.as_deref());
            details.insert("click_type".to_string(), json!(click_type));
            Value::Object(details)
        },
    )
    .await
}

async fn hover(State(state): State<AppState>, body: Option<Json<Value>>) -> ApiResult {
    let req: HoverRequest = parse_body(body)?;
    let origin = req.coordinate_origin.clone();
    run_action(
        &state,
        req.scope.as_deref(),
        req.session_id.as_deref(),
        req.to_raw(),
        req.include_screenshot,
        |result| Value::Object(spatial_details(result, origin.as_deref())),
    )
    .await
}

async fn drag(State(state): State<AppState>, body: Option<Json<Value>>) -> ApiResult {
    let req: DragRequest = parse_body(body)?;
    let origin = req.coordinate_origin.clone();
    run_action(
        &state,
        req.scope.as_deref(),
        req.session_id.as_deref(),
        req.to_raw(),
        req.include_screenshot,
        |result| {
            let mut details = spatial_details(result, origin.as_deref());
            if let Some(end) = &result.resolved_end {
                let (ex, ey) = end.resolved.rounded();
                details.insert("end_coords".to_string(), json!({ "x": ex, "y": ey }));
            }
            Value::Object(details)
        },
    )
    .await
}

async fn type_text(State(state): State<AppState>, body: Option<Json<Value>>) -> ApiResult {
    let req: TypeRequest = parse_body(body)?;
    let text_length = req.text.as_deref().map(|t| t.chars().count()).unwrap_or(0);
    let selector = req.selector.clone();
    run_action(
        &state,
        req.scope.as_deref(),
        req.session_id.as_deref(),
        req.to_raw(),
        req.include_screenshot,
        |_| {
            let mut details = json!({ "text_length": text_length });
            if let Some(selector) = selector {
                details["selector"] = json!(selector);
            }
            details
        },
    )
    .await
}

async fn scroll(State(state): State<AppState>, body: Option<Json<Value>>) -> ApiResult {
    let req: ScrollRequest = parse_body(body)?;
    let raw = req.to_raw();
    let direction = raw.direction.clone().unwrap_or_else(|| "down".to_string());
    let amount = raw.amount.unwrap_or(300);
    run_action(
        &state,
        req.scope.as_deref(),
        req.session_id.as_deref(),
        raw,
        req.include_screenshot,
        |_| json!({ "direction": direction, "amount": amount }),
    )
    .await
}

async fn keypress(State(state): State<AppState>, body: Option<Json<Value>>) -> ApiResult {
    let req: KeypressRequest = parse_body(body)?;
    let key = req.key.clone().unwrap_or_default();
    run_action(
        &state,
        req.scope.as_deref(),
        req.session_id.as_deref(),
        req.to_raw(),
        req.include_screenshot,
        |_| json!({ "key": key }),
    )
    .await
}

async fn wait(State(state): State<AppState>, body: Option<Json<Value>>) -> ApiResult {
    let req: WaitRequest = parse_body(body)?;
    let duration = req.duration.unwrap_or(1.0);
    run_action(
        &state,
        req.scope.as_deref(),
        req.session_id.as_deref(),
        req.to_raw(),
        req.include_screenshot,
        |_| json!({ "duration": duration }),
    )
    .await
}

async fn click_by_ref(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
    body: Option<Json<Value>>,
) -> ApiResult {
    let req: ClickByRefRequest = parse_body(body)?;
    let ref_id = req
        .ref_id
        .filter(|r| !r.trim().is_empty())
        .ok_or_else(|| invalid(ValidationError::MissingField("ref")))?;
    let kind = req
        .click_type
        .as_deref()
        .map(str::parse::<ClickKind>)
        .transpose()
        .map_err(invalid)?
        .unwrap_or_default();
    let (outcome, element) = state
        .engine
        .click_by_ref(session_id(req.session_id.as_deref(), &query), &ref_id, kind)
        .await
        .map_err(engine_error)?;
    action_response(&state, outcome, req.include_screenshot, |_| {
        json!({
            "ref": element.id,
            "x": element.x.round() as i64,
            "y": element.y.round() as i64,
            "click_type": kind.as_str(),
            "element": { "tag": element.tag, "role": element.role, "name": element.name },
        })
    })
    .await
}

async fn wait_for_selector(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
    body: Option<Json<Value>>,
) -> ApiResult {
    let req: WaitForSelectorRequest = parse_body(body)?;
    let selector = req
        .selector
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| invalid(ValidationError::MissingField("selector")))?;
    let wanted = req
        .state
        .as_deref()
        .map(str::parse::<SelectorState>)
        .transpose()
        .map_err(invalid)?
        .unwrap_or_default();
    let timeout = wait_timeout(req.timeout);
    let id = session_id(req.session_id.as_deref(), &query);
    state
        .engine
        .wait_for_selector(id, selector.clone(), wanted, timeout)
        .await
        .map_err(engine_error)?;

    let mut body = json!({
        "success": true,
        "selector": selector,
        "state": wanted.as_str(),
    });
    if req.include_screenshot {
        let session = state.engine.resolve_session(Some(Scope::Browser), id).map_err(engine_error)?;
        attach_screenshot(&state, &session, &mut body).await;
    }
    Ok(Json(body))
}

async fn wait_for_load_state(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
    body: Option<Json<Value>>,
) -> ApiResult {
    let req: WaitForLoadStateRequest = parse_body(body)?;
    let wanted = req
        .state
        .as_deref()
        .map(str::parse::<LoadState>)
        .transpose()
        .map_err(invalid)?
        .unwrap_or_default();
    state
        .engine
        .wait_for_load_state(
            session_id(req.session_id.as_deref(), &query),
            wanted,
            wait_timeout(req.timeout),
        )
        .await
        .map_err(engine_error)?;
    Ok(Json(json!({ "success": true, "state": wanted.as_str() })))
}

async fn select_option(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
    body: Option<Json<Value>>,
) -> ApiResult {
    let req: SelectOptionRequest = parse_body(body)?;
    let choice = OptionChoice::pick(req.value, req.label, req.index).map_err(invalid)?;
    let id = session_id(req.session_id.as_deref(), &query);
    let selected = state
        .engine
        .select_option(id, req.ref_id.as_deref(), req.selector, choice)
        .await
        .map_err(engine_error)?;

    let mut body = json!({ "success": true, "selected": selected });
    if req.include_screenshot {
        let session = state.engine.resolve_session(Some(Scope::Browser), id).map_err(engine_error)?;
        attach_screenshot(&state, &session, &mut body).await;
    }
    Ok(Json(body))
}

async fn action(State(state): State<AppState>, Json(body): Json<Value>) -> ApiResult {
    let req: ActionRequest = serde_json::from_value(body).map_err(|e| {
        invalid(ValidationError::InvalidValue {
            field: "body",
            reason: e.to_string(),
        })
    })?;
    let origin = req.action.space.clone();
    run_action(
        &state,
        req.scope.as_deref(),
        req.session_id.as_deref(),
        req.action,
        req.include_screenshot,
        |result| {
            let mut details = spatial_details(result, origin.as_deref());
            details.insert("action_type".to_string(), json!(result.action_type));
            Value::Object(details)
        },
    )
    .await
}

async fn coordinates_convert(State(state): State<AppState>, body: Option<Json<Value>>) -> ApiResult {
    let req: ConvertRequest = parse_body(body)?;
    let from = parse_space(req.from_space.as_deref(), "from_space")?;
    let to = parse_space(req.to_space.as_deref(), "to_space")?;
    let point = require_point(req.x, req.y, from)?;
    let report = state
        .engine
        .convert(point, to, req.session_id.as_deref())
        .await
        .map_err(engine_error)?;

    let mut body = json!({
        "success": true,
        "x": report.conversion.point.x,
        "y": report.conversion.point.y,
        "from_space": from,
        "to_space": to,
        "reference_dimensions": report.reference_dimensions,
    });
    if let Some(scale) = report.conversion.scale {
        body["scale_x"] = json!(scale.x);
        body["scale_y"] = json!(scale.y);
    }
    Ok(Json(body))
}

async fn coordinates_validate(State(state): State<AppState>, body: Option<Json<Value>>) -> ApiResult {
    let req: ValidateRequest = parse_body(body)?;
    let scope = parse_scope(req.scope.as_deref())?;
    let space = parse_space(req.coordinate_origin.as_deref(), "coordinate_origin")?;
    let point = require_point(req.x, req.y, space)?;
    let session = state
        .engine
        .resolve_session(scope, req.session_id.as_deref())
        .map_err(engine_error)?;
    let check = state
        .engine
        .validate(Some(session.scope()), Some(session.id()), point)
        .await
        .map_err(engine_error)?;

    let in_key = match session.scope() {
        Scope::Browser => "in_viewport",
        Scope::Desktop => "in_screen",
    };
    let mut body = json!({
        "success": true,
        "session_id": session.id(),
        "valid": check.valid,
        "resolved": check.resolved,
        "bounds": check.bounds,
    });
    body[in_key] = json!(check.valid);
    if let Some(element) = check.element_info {
        body["element_info"] = json!(element);
    }
    if let Some([r, g, b]) = check.pixel_color {
        body["pixel_color"] = json!({ "r": r, "g": g, "b": b });
    }
    Ok(Json(body))
}

impl ClickRequest {
    fn to_raw(&self) -> RawAction {
        RawAction {
            action_type: "click".to_string(),
            space: self.coordinate_origin.clone(),
            x: self.x,
            y: self.y,
            click_type: self.click_type.clone(),
            ..Default::default()
        }
    }
}

impl HoverRequest {
    fn to_raw(&self) -> RawAction {
        RawAction {
            action_type: "hover".to_string(),
            space: self.coordinate_origin.clone(),
            x: self.x,
            y: self.y,
            ..Default::default()
        }
    }
}

impl DragRequest {
    fn to_raw(&self) -> RawAction {
        RawAction {
            action_type: "drag".to_string(),
            space: self.coordinate_origin.clone(),
            x: self.start_x,
            y: self.start_y,
            end_x: self.end_x,
            end_y: self.end_y,
            ..Default::default()
        }
    }
}

impl TypeRequest {
    fn to_raw(&self) -> RawAction {
        RawAction {
            action_type: "type".to_string(),
            text: self.text.clone(),
            method: self.method.clone(),
            selector: self.selector.clone(),
            ..Default::default()
        }
    }
}

impl ScrollRequest {
    fn to_raw(&self) -> RawAction {
        RawAction {
            action_type: "scroll".to_string(),
            space: self.coordinate_origin.clone(),
            x: self.x,
            y: self.y,
            direction: self.direction.clone(),
            amount: self.amount,
            ..Default::default()
        }
    }
}

impl KeypressRequest {
    fn to_raw(&self) -> RawAction {
        RawAction {
            action_type: "keypress".to_string(),
            key: self.key.clone(),
            ..Default::default()
        }
    }
}

impl WaitRequest {
    fn to_raw(&self) -> RawAction {
        RawAction {
            action_type: "wait".to_string(),
            duration: self.duration,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::scripted::{Call, Script, ScriptedLauncher};
    use crate::config::EngineConfig;

    fn state(script: &Script) -> AppState {
        let config = EngineConfig {
            settle_delay: std::time::Duration::ZERO,
            ..EngineConfig::default()
        };
        AppState {
            engine: Arc::new(Engine::new(
                Arc::new(config),
                Arc::new(ScriptedLauncher::new(script.clone())),
            )),
        }
    }

    async fn start(state: &AppState) -> String {
        let Json(body) = browser_start(State(state.clone()), None).await.unwrap();
        body["session_id"].as_str().unwrap().to_string()
    }

    fn body(value: Value) -> Option<Json<Value>> {
        Some(Json(value))
    }

    #[tokio::test]
    async fn click_reports_scaled_viewport_coords() {
        let script = Script::browser(1280, 720);
        let state = state(&script);
        let id = start(&state).await;

        let Json(resp) = click(
            State(state.clone()),
            body(json!({
                "scope": "browser",
                "session_id": id,
                "x": 400,
                "y": 200,
                "coordinate_origin": "lux_sdk",
            })),
        )
        .await
        .unwrap();

        assert_eq!(resp["success"], true);
        assert_eq!(resp["executed_with"], "scripted");
        let details = &resp["details"];
        assert_eq!(details["viewport_coords"], json!({ "x": 406, "y": 206 }));
        assert_eq!(details["original_coords"], json!({ "x": 400.0, "y": 200.0 }));
        assert_eq!(details["coordinate_origin"], "lux_sdk");
        assert_eq!(details["click_type"], "single");
        let scale_x = details["scale_x"].as_f64().unwrap();
        assert!((scale_x - 1280.0 / 1260.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn out_of_bounds_click_is_a_400_with_bounds() {
        let script = Script::browser(1280, 720);
        let state = state(&script);
        start(&state).await;

        let (status, Json(resp)) = click(
            State(state),
            body(json!({ "x": 1500, "y": 200, "coordinate_origin": "viewport" })),
        )
        .await
        .unwrap_err();

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(resp["success"], false);
        assert_eq!(resp["error_kind"], "validation_error");
        assert_eq!(resp["details"]["bounds"]["width"], 1280);
        assert_eq!(resp["details"]["requested"]["x"], 1500.0);
        assert!(script.clicks().is_empty());
    }

    #[tokio::test]
    async fn click_without_space_is_rejected() {
        let script = Script::browser(1280, 720);
        let state = state(&script);
        start(&state).await;
        let (status, Json(resp)) = click(State(state), body(json!({ "x": 10, "y": 10 })))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(resp["error"].as_str().unwrap().contains("coordinate_origin"));
    }

    #[tokio::test]
    async fn exhausted_healing_is_a_502_listing_strategies() {
        let script = Script::browser(1280, 720)
            .failing_kind(crate::action::ClickKind::Single)
            .failing_kind(crate::action::ClickKind::Double);
        let state = state(&script);
        start(&state).await;

        let (status, Json(resp)) = click(
            State(state),
            body(json!({ "x": 100, "y": 100, "coordinate_origin": "viewport" })),
        )
        .await
        .unwrap_err();

        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(resp["error_kind"], "backend_execution_error");
        assert_eq!(resp["attempted_strategies"], json!(["primary", "double_click"]));
        assert!(resp["error"].as_str().unwrap().starts_with("all strategies failed"));
    }

    #[tokio::test]
    async fn unknown_session_is_404() {
        let script = Script::browser(1280, 720);
        let state = state(&script);
        let (status, Json(resp)) = keypress(
            State(state),
            body(json!({ "key": "Enter", "session_id": "session-missing" })),
        )
        .await
        .unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(resp["error_kind"], "session_not_found");
    }

    #[tokio::test]
    async fn type_details_never_echo_text() {
        let script = Script::browser(1280, 720);
        let state = state(&script);
        start(&state).await;
        let Json(resp) = type_text(
            State(state),
            body(json!({ "text": "héllo", "method": "keystrokes", "selector": "#q" })),
        )
        .await
        .unwrap();
        assert_eq!(resp["details"], json!({ "text_length": 5, "selector": "#q" }));
    }

    #[tokio::test]
    async fn scroll_and_keypress_details() {
        let script = Script::browser(1280, 720);
        let state = state(&script);
        start(&state).await;

        let Json(resp) = scroll(
            State(state.clone()),
            body(json!({ "direction": "up", "amount": 500 })),
        )
        .await
        .unwrap();
        assert_eq!(resp["details"], json!({ "direction": "up", "amount": 500 }));

        let Json(resp) = keypress(State(state), body(json!({ "key": "ctrl+a" })))
            .await
            .unwrap();
        assert_eq!(resp["details"], json!({ "key": "ctrl+a" }));
        assert!(script.calls().contains(&Call::Key("Control+a".into())));
    }

    #[tokio::test]
    async fn include_screenshot_attaches_image() {
        let script = Script::browser(320, 200);
        let state = state(&script);
        start(&state).await;
        let Json(resp) = hover(
            State(state),
            body(json!({ "x": 10, "y": 10, "coordinate_origin": "viewport", "include_screenshot": true })),
        )
        .await
        .unwrap();
        assert_eq!(resp["screenshot"]["width"], 320);
        assert!(resp["screenshot"]["image_base64"].as_str().unwrap().len() > 10);
    }

    #[tokio::test]
    async fn canonical_action_endpoint_rejects_unknown_type() {
        let script = Script::browser(1280, 720);
        let state = state(&script);
        start(&state).await;
        let (status, Json(resp)) = action(State(state), Json(json!({ "type": "teleport" })))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(resp["error"].as_str().unwrap().contains("teleport"));
    }

    #[tokio::test]
    async fn drag_reports_both_ends() {
        let script = Script::browser(1280, 720);
        let state = state(&script);
        start(&state).await;
        let Json(resp) = action(
            State(state),
            Json(json!({
                "action": "drag",
                "coordinate_origin": "viewport",
                "start_x": 10, "start_y": 20, "end_x": 300, "end_y": 400,
            })),
        )
        .await
        .unwrap();
        assert_eq!(resp["success"], true);
        assert_eq!(resp["details"]["action_type"], "drag");
        assert!(script.calls().contains(&Call::Drag {
            from: (10.0, 20.0),
            to: (300.0, 400.0)
        }));
    }

    #[tokio::test]
    async fn screenshot_lux_variant() {
        let script = Script::browser(1280, 720);
        let state = state(&script);
        start(&state).await;
        let Json(resp) = screenshot(
            State(state),
            body(json!({ "scope": "browser", "optimize_for": "lux" })),
        )
        .await
        .unwrap();
        assert_eq!(resp["original"]["width"], 1280);
        assert_eq!(resp["lux_optimized"]["width"], 1260);
        assert_eq!(resp["lux_optimized"]["original_height"], 720);
    }

    #[tokio::test]
    async fn convert_reports_reference_dimensions() {
        let script = Script::browser(1280, 720);
        let state = state(&script);
        let Json(resp) = coordinates_convert(
            State(state),
            body(json!({ "x": 630, "y": 350, "from_space": "lux_sdk", "to_space": "viewport" })),
        )
        .await
        .unwrap();
        // without a session the configured viewport is used
        assert_eq!(resp["x"], 630.0);
        assert_eq!(resp["reference_dimensions"], json!({ "width": 1260, "height": 700 }));
    }

    #[tokio::test]
    async fn validate_reports_in_viewport() {
        let script = Script::browser(1280, 720);
        let state = state(&script);
        start(&state).await;
        let Json(resp) = coordinates_validate(
            State(state),
            body(json!({ "x": 1279, "y": 719, "coordinate_origin": "viewport" })),
        )
        .await
        .unwrap();
        assert_eq!(resp["valid"], true);
        assert_eq!(resp["in_viewport"], true);
    }

    #[tokio::test]
    async fn stop_twice_is_not_an_error() {
        let script = Script::browser(1280, 720);
        let state = state(&script);
        let id = start(&state).await;
        let query = || {
            Query(SessionQuery {
                session_id: Some(id.clone()),
            })
        };
        let Json(first) = browser_stop(State(state.clone()), query()).await.unwrap();
        let Json(second) = browser_stop(State(state), query()).await.unwrap();
        assert_eq!(first, json!({ "success": true, "was_active": true }));
        assert_eq!(second, json!({ "success": true, "was_active": false }));
    }

    #[tokio::test]
    async fn navigation_takes_session_from_query() {
        let script = Script::browser(1280, 720);
        let state = state(&script);
        let id = start(&state).await;
        let Json(resp) = browser_navigate(
            State(state),
            Query(SessionQuery {
                session_id: Some(id),
            }),
            body(json!({ "url": "https://example.com" })),
        )
        .await
        .unwrap();
        assert_eq!(resp["url"], "https://example.com");
    }

    fn page_script() -> Script {
        let save: crate::dom::DomRef = serde_json::from_value(json!({
            "ref": "e1", "tag": "button", "role": "button", "name": "Save",
            "x": 120, "y": 40, "width": 80, "height": 24
        }))
        .unwrap();
        let language: crate::dom::DomRef = serde_json::from_value(json!({
            "ref": "e2", "tag": "select", "role": "combobox", "name": "Language",
            "x": 300, "y": 200, "width": 120, "height": 24
        }))
        .unwrap();
        Script::browser(1280, 720).with_page(vec![save, language])
    }

    fn no_query() -> Query<SessionQuery> {
        Query(SessionQuery::default())
    }

    #[tokio::test]
    async fn click_by_ref_uses_last_dom_tree() {
        let script = page_script();
        let state = state(&script);
        start(&state).await;

        let (status, Json(resp)) = click_by_ref(State(state.clone()), no_query(), body(json!({ "ref": "e1" })))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(resp["error_kind"], "validation_error");
        assert_eq!(resp["details"]["ref"], "e1");

        let Json(tree) = browser_dom_tree(State(state.clone()), no_query()).await.unwrap();
        assert_eq!(tree["tree"]["elements"][0]["ref"], "e1");

        let Json(resp) = click_by_ref(
            State(state),
            no_query(),
            body(json!({ "ref": "e1", "click_type": "double" })),
        )
        .await
        .unwrap();
        assert_eq!(resp["success"], true);
        assert_eq!(resp["details"]["x"], 120);
        assert_eq!(resp["details"]["click_type"], "double");
        assert_eq!(resp["details"]["element"]["name"], "Save");
        assert_eq!(
            script.clicks(),
            vec![Call::Click {
                x: 120.0,
                y: 40.0,
                kind: ClickKind::Double
            }]
        );
    }

    #[tokio::test]
    async fn element_rect_reports_centre_and_box() {
        let script = page_script();
        let state = state(&script);
        start(&state).await;

        let Json(resp) = browser_element_rect(
            State(state.clone()),
            no_query(),
            body(json!({ "text": "Language" })),
        )
        .await
        .unwrap();
        assert_eq!(resp["success"], true);
        assert_eq!(resp["found"], true);
        assert_eq!((resp["x"].clone(), resp["y"].clone()), (json!(300), json!(200)));
        assert_eq!(resp["bounding_box"]["width"], 120.0);
        assert_eq!(resp["selector_used"], "text: 'Language'");

        let (status, _) = browser_element_rect(State(state), no_query(), body(json!({})))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn wait_for_selector_times_out_on_missing_element() {
        let script = page_script();
        let state = state(&script);
        start(&state).await;

        let Json(resp) = wait_for_selector(
            State(state.clone()),
            no_query(),
            body(json!({ "selector": "button", "state": "attached", "timeout": 500 })),
        )
        .await
        .unwrap();
        assert_eq!(resp, json!({ "success": true, "selector": "button", "state": "attached" }));

        let (status, Json(resp)) = wait_for_selector(
            State(state.clone()),
            no_query(),
            body(json!({ "selector": "#spinner-done", "timeout": 500 })),
        )
        .await
        .unwrap_err();
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(resp["error"].as_str().unwrap().contains("Timeout waiting for selector"));

        let (status, _) = wait_for_selector(
            State(state),
            no_query(),
            body(json!({ "selector": "button", "state": "gone" })),
        )
        .await
        .unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn wait_for_load_state_defaults_to_load() {
        let script = page_script();
        let state = state(&script);
        start(&state).await;

        let Json(resp) = wait_for_load_state(State(state), no_query(), None).await.unwrap();
        assert_eq!(resp["state"], "load");
        assert!(script.calls().contains(&Call::WaitForLoad(LoadState::Load)));
    }

    #[tokio::test]
    async fn select_option_by_ref() {
        let script = page_script();
        let state = state(&script);
        start(&state).await;
        browser_dom_tree(State(state.clone()), no_query()).await.unwrap();

        let Json(resp) = select_option(
            State(state.clone()),
            no_query(),
            body(json!({ "ref": "e2", "label": "German" })),
        )
        .await
        .unwrap();
        assert_eq!(resp, json!({ "success": true, "selected": ["German"] }));
        assert!(script.calls().contains(&Call::SelectOption {
            selector: "[data-tool-ref=\"e2\"]".into(),
            choice: OptionChoice::Label("German".into()),
        }));

        let (status, Json(resp)) = select_option(State(state), no_query(), body(json!({ "ref": "e2" })))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(resp["error"].as_str().unwrap().contains("value"));
    }
}
