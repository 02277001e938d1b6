//! Retry chain for spatial actions.
//!
//! Browser sessions try `primary`, then `element_center` (re-aim at the centre
//! of an interactive element found under the point), then `double_click`
//! (single clicks only). Desktop sessions cannot inspect elements, so they go
//! straight from `primary` to `double_click`.

use chrono::Utc;
use tracing::{debug, warn};

use crate::action::{Action, ActionKind, ActionResult, ErrorReport, ResolvedCoordinates};
use crate::backend::Backend;
use crate::dispatcher::{ActionDispatcher, Executed, Plan};
use crate::error::{EngineError, EngineResult};
use crate::geometry::{CoordinateTransformer, Point};
use crate::loop_detector::HistoryEntry;
use crate::session::{Scope, Session};

pub const PRIMARY: &str = "primary";
pub const ELEMENT_CENTER: &str = "element_center";
pub const DOUBLE_CLICK: &str = "double_click";
/// Reported when a desktop click heals without an element lookup.
pub const NOT_APPLICABLE: &str = "not_applicable";

struct Attempt {
    strategy: &'static str,
    error: EngineError,
}

pub struct SelfHealingExecutor {
    dispatcher: ActionDispatcher,
}

impl SelfHealingExecutor {
    pub fn new(dispatcher: ActionDispatcher) -> Self {
        Self { dispatcher }
    }

    pub fn dispatcher(&self) -> &ActionDispatcher {
        &self.dispatcher
    }

    /// Runs one action to completion on `session`. Failures are folded into
    /// the result; the session's lock is held across every attempt.
    pub async fn execute(&self, session: &Session, action: Action) -> ActionResult {
        let kind = action.kind();
        let mut result = match session.lock_backend().await {
            Ok(mut backend) => self.run(session, backend.as_mut(), &action).await,
            Err(e) => ActionResult::failed(kind, e),
        };

        if !matches!(
            result.failure,
            Some(EngineError::SessionStopped(_)) | Some(EngineError::SessionNotFound(_))
        ) {
            let target = action.target();
            result.loop_detected = session.record(HistoryEntry {
                session_id: session.id().to_string(),
                action_type: kind,
                space: target.map(|p| p.space),
                x: target.map(|p| p.x),
                y: target.map(|p| p.y),
                timestamp: Utc::now(),
                success: result.success,
            });
            if result.loop_detected {
                warn!(session_id = session.id(), action = %kind, "repeated action detected");
            }
        }
        session.touch();
        result
    }

    async fn run(&self, session: &Session, backend: &mut dyn Backend, action: &Action) -> ActionResult {
        let kind = action.kind();
        let plan = match self.prepare(session, backend, action).await {
            Ok(plan) => plan,
            Err(e) => return ActionResult::failed(kind, e),
        };

        let mut attempts: Vec<Attempt> = Vec::new();

        match self.dispatcher.execute(session, backend, &plan).await {
            Ok(done) => return success(kind, &plan, done, &[PRIMARY], None),
            Err(e) => {
                let healable = e.is_healable();
                attempts.push(Attempt {
                    strategy: PRIMARY,
                    error: e,
                });
                if !healable {
                    return exhausted(kind, &plan, attempts);
                }
            }
        }

        if session.scope() == Scope::Browser {
            match self.element_center(session, backend, &plan).await {
                Ok(Some(retargeted)) => match self.dispatcher.execute(session, backend, &retargeted).await {
                    Ok(done) => {
                        let tried = [PRIMARY, ELEMENT_CENTER];
                        return success(kind, &retargeted, done, &tried, Some(ELEMENT_CENTER));
                    }
                    Err(e) => {
                        let healable = e.is_healable();
                        attempts.push(Attempt {
                            strategy: ELEMENT_CENTER,
                            error: e,
                        });
                        if !healable {
                            return exhausted(kind, &plan, attempts);
                        }
                    }
                },
                Ok(None) => debug!(session_id = session.id(), "no interactive element under the point"),
                Err(EngineError::SessionStopped(id)) => {
                    let mut result = exhausted(kind, &plan, attempts);
                    let err = EngineError::SessionStopped(id);
                    result.error = Some(ErrorReport::from(&err));
                    result.failure = Some(err);
                    return result;
                }
                Err(e) => debug!(session_id = session.id(), error = %e, "element lookup failed"),
            }
        }

        if let Some(double) = plan.as_double_click() {
            warn!(session_id = session.id(), "retrying click as double click");
            match self.dispatcher.execute(session, backend, &double).await {
                Ok(done) => {
                    let mut tried: Vec<&str> = attempts.iter().map(|a| a.strategy).collect();
                    tried.push(DOUBLE_CLICK);
                    let method = match session.scope() {
                        Scope::Browser => DOUBLE_CLICK,
                        Scope::Desktop => NOT_APPLICABLE,
                    };
                    return success(kind, &plan, done, &tried, Some(method));
                }
                Err(e) => attempts.push(Attempt {
                    strategy: DOUBLE_CLICK,
                    error: e,
                }),
            }
        }

        exhausted(kind, &plan, attempts)
    }

    async fn prepare(
        &self,
        session: &Session,
        backend: &mut dyn Backend,
        action: &Action,
    ) -> EngineResult<Plan> {
        let surface = if action.kind().is_spatial() || action.target().is_some() {
            self.dispatcher.surface(session, backend).await?
        } else {
            session.last_surface()
        };
        self.dispatcher.plan(session.scope(), action, &surface)
    }

    /// Finds an interactive element under the failed point and re-aims at its centre.
    async fn element_center(
        &self,
        session: &Session,
        backend: &mut dyn Backend,
        plan: &Plan,
    ) -> EngineResult<Option<Plan>> {
        let Some(target) = plan.target() else {
            return Ok(None);
        };
        if plan.retarget(target.native).is_none() {
            return Ok(None);
        }
        let element = self
            .dispatcher
            .guarded(session, backend.element_at(target.native))
            .await?;
        let Some(element) = element.filter(|e| e.interactive) else {
            return Ok(None);
        };

        let (cx, cy) = element.rect.center();
        let surface = session.last_surface();
        let native_space = session.scope().native_space();
        let resolved =
            CoordinateTransformer::resolve(Point::new(native_space, cx, cy), native_space, &surface)?;
        debug!(
            session_id = session.id(),
            tag = %element.tag,
            x = cx,
            y = cy,
            "retargeting to element centre"
        );
        Ok(plan.retarget(resolved.native))
    }
}

fn attach_coordinates(result: &mut ActionResult, plan: &Plan) {
    result.resolved_coordinates = plan.target().map(ResolvedCoordinates::from);
    result.resolved_end = plan.end().map(ResolvedCoordinates::from);
}

fn success(
    kind: ActionKind,
    plan: &Plan,
    done: Executed,
    tried: &[&str],
    healed_by: Option<&str>,
) -> ActionResult {
    let mut result = ActionResult {
        success: true,
        action_type: kind,
        executed_via: Some(done.via.to_string()),
        resolved_coordinates: None,
        resolved_end: None,
        healed: healed_by.is_some(),
        healing_method: healed_by.map(str::to_string),
        attempted_strategies: tried.iter().map(|s| s.to_string()).collect(),
        error: None,
        loop_detected: false,
        failure: None,
    };
    attach_coordinates(&mut result, plan);
    result
}

fn exhausted(kind: ActionKind, plan: &Plan, attempts: Vec<Attempt>) -> ActionResult {
    let last = attempts
        .last()
        .map(|a| a.error.clone())
        .unwrap_or_else(|| EngineError::BackendExecution("no strategy ran".into()));
    let mut result = ActionResult::failed(kind, last);
    if attempts.len() > 1 {
        let summary = attempts
            .iter()
            .map(|a| format!("{}: {}", a.strategy, a.error))
            .collect::<Vec<_>>()
            .join("; ");
        if let Some(report) = result.error.as_mut() {
            report.message = format!("all strategies failed ({})", summary);
        }
    }
    result.attempted_strategies = attempts.iter().map(|a| a.strategy.to_string()).collect();
    attach_coordinates(&mut result, plan);
    result
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::action::ClickKind;
    use crate::backend::scripted::{Call, Script, ScriptedLauncher};
    use crate::backend::{ElementInfo, Rect};
    use crate::config::EngineConfig;
    use crate::error::ValidationError;
    use crate::geometry::CoordinateSpace;
    use crate::loop_detector::LoopConfig;
    use crate::session::{SessionManager, StartOptions};

    fn executor() -> SelfHealingExecutor {
        let config = EngineConfig {
            settle_delay: Duration::ZERO,
            backend_timeout: Duration::from_millis(500),
            ..EngineConfig::default()
        };
        SelfHealingExecutor::new(ActionDispatcher::new(&config))
    }

    async fn start(script: &Script, scope: Scope) -> (SessionManager, Arc<Session>) {
        let mgr = SessionManager::new(
            Arc::new(ScriptedLauncher::new(script.clone())),
            LoopConfig::default(),
        );
        let session = mgr.start(scope, StartOptions::default()).await.unwrap();
        (mgr, session)
    }

    fn click(space: CoordinateSpace, x: f64, y: f64) -> Action {
        Action::Click {
            at: Point::new(space, x, y),
            kind: ClickKind::Single,
        }
    }

    fn button() -> ElementInfo {
        ElementInfo {
            tag: "button".into(),
            role: Some("button".into()),
            name: Some("Submit".into()),
            rect: Rect {
                x: 300.0,
                y: 300.0,
                width: 100.0,
                height: 40.0,
            },
            interactive: true,
        }
    }

    #[tokio::test]
    async fn out_of_bounds_click_never_reaches_backend() {
        let script = Script::browser(1280, 720);
        let (_mgr, session) = start(&script, Scope::Browser).await;

        let result = executor()
            .execute(&session, click(CoordinateSpace::Viewport, 1500.0, 200.0))
            .await;

        assert!(!result.success);
        assert!(matches!(
            result.failure,
            Some(EngineError::Validation(ValidationError::OutOfBounds { .. }))
        ));
        let details = result.error.unwrap().details.unwrap();
        assert_eq!(details["bounds"]["width"], 1280);
        assert_eq!(details["bounds"]["height"], 720);
        assert!(script.clicks().is_empty());
        assert!(result.attempted_strategies.is_empty());
    }

    #[tokio::test]
    async fn normalized_click_lands_scaled() {
        let script = Script::browser(1280, 720);
        let (_mgr, session) = start(&script, Scope::Browser).await;

        let result = executor()
            .execute(&session, click(CoordinateSpace::Normalized, 400.0, 200.0))
            .await;

        assert!(result.success);
        assert!(!result.healed);
        assert_eq!(result.attempted_strategies, vec![PRIMARY]);
        let coords = result.resolved_coordinates.unwrap();
        assert_eq!(coords.resolved.rounded(), (406, 206));
        let scale = coords.scale.unwrap();
        assert!((scale.x - 1.016).abs() < 0.001 && (scale.y - 1.029).abs() < 0.001);
        assert_eq!(result.executed_via.as_deref(), Some("scripted"));
    }

    #[tokio::test]
    async fn heals_by_element_center_before_double_click() {
        let script = Script::browser(1280, 720)
            .failing_clicks(1)
            .with_element(button());
        let (_mgr, session) = start(&script, Scope::Browser).await;

        let result = executor()
            .execute(&session, click(CoordinateSpace::Viewport, 310.0, 305.0))
            .await;

        assert!(result.success);
        assert!(result.healed);
        assert_eq!(result.healing_method.as_deref(), Some(ELEMENT_CENTER));
        assert_eq!(result.attempted_strategies, vec![PRIMARY, ELEMENT_CENTER]);
        let clicks = script.clicks();
        assert_eq!(clicks.len(), 2);
        assert_eq!(
            clicks[1],
            Call::Click {
                x: 350.0,
                y: 320.0,
                kind: ClickKind::Single
            }
        );
    }

    #[tokio::test]
    async fn falls_back_to_double_click_without_element() {
        let script = Script::browser(1280, 720).failing_clicks(1);
        let (_mgr, session) = start(&script, Scope::Browser).await;

        let result = executor()
            .execute(&session, click(CoordinateSpace::Viewport, 10.0, 10.0))
            .await;

        assert!(result.success);
        assert_eq!(result.healing_method.as_deref(), Some(DOUBLE_CLICK));
        assert_eq!(result.attempted_strategies, vec![PRIMARY, DOUBLE_CLICK]);
        assert!(matches!(
            script.clicks().last(),
            Some(Call::Click {
                kind: ClickKind::Double,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn exhaustion_lists_every_strategy() {
        let script = Script::browser(1280, 720)
            .failing_clicks(3)
            .with_element(button());
        let (_mgr, session) = start(&script, Scope::Browser).await;

        let result = executor()
            .execute(&session, click(CoordinateSpace::Viewport, 310.0, 305.0))
            .await;

        assert!(!result.success);
        assert!(!result.healed);
        assert_eq!(
            result.attempted_strategies,
            vec![PRIMARY, ELEMENT_CENTER, DOUBLE_CLICK]
        );
        assert!(matches!(result.failure, Some(EngineError::BackendExecution(_))));
        assert!(result
            .error
            .unwrap()
            .message
            .starts_with("all strategies failed"));
    }

    #[tokio::test]
    async fn right_click_has_no_double_click_fallback() {
        let script = Script::browser(1280, 720).failing_kind(ClickKind::Right);
        let (_mgr, session) = start(&script, Scope::Browser).await;

        let action = Action::Click {
            at: Point::new(CoordinateSpace::Viewport, 10.0, 10.0),
            kind: ClickKind::Right,
        };
        let result = executor().execute(&session, action).await;

        assert!(!result.success);
        assert_eq!(result.attempted_strategies, vec![PRIMARY]);
        assert_eq!(script.clicks().len(), 1);
    }

    #[tokio::test]
    async fn desktop_heals_via_double_click_only() {
        let script = Script::desktop(1920, 1080)
            .failing_clicks(1)
            .with_element(button());
        let (_mgr, session) = start(&script, Scope::Desktop).await;

        let result = executor()
            .execute(&session, click(CoordinateSpace::Screen, 100.0, 100.0))
            .await;

        assert!(result.success);
        assert!(result.healed);
        assert_eq!(result.healing_method.as_deref(), Some(NOT_APPLICABLE));
        assert_eq!(result.attempted_strategies, vec![PRIMARY, DOUBLE_CLICK]);
        assert!(!script
            .calls()
            .iter()
            .any(|c| matches!(c, Call::ElementAt { .. })));
    }

    #[tokio::test]
    async fn bounds_follow_current_dimensions() {
        let script = Script::browser(1280, 720);
        let (_mgr, session) = start(&script, Scope::Browser).await;
        let exec = executor();

        assert!(exec
            .execute(&session, click(CoordinateSpace::Viewport, 1000.0, 10.0))
            .await
            .success);
        script.resize(800, 600);
        let result = exec
            .execute(&session, click(CoordinateSpace::Viewport, 1000.0, 10.0))
            .await;
        assert!(!result.success);
        assert_eq!(script.clicks().len(), 1);
    }

    #[tokio::test]
    async fn flags_repeated_clicks() {
        let script = Script::browser(1280, 720);
        let (_mgr, session) = start(&script, Scope::Browser).await;
        let exec = executor();

        let mut flags = Vec::new();
        for (x, y) in [(100.0, 100.0), (110.0, 95.0), (130.0, 140.0), (900.0, 500.0)] {
            flags.push(
                exec.execute(&session, click(CoordinateSpace::Viewport, x, y))
                    .await
                    .loop_detected,
            );
        }
        assert_eq!(flags, vec![false, false, true, false]);
    }

    #[tokio::test]
    async fn actions_on_one_session_run_in_submission_order() {
        let script = Script::browser(1280, 720).with_delay(Duration::from_millis(20));
        let (_mgr, session) = start(&script, Scope::Browser).await;
        let exec = Arc::new(executor());

        let mut handles = Vec::new();
        for i in 0..5 {
            let exec = exec.clone();
            let session = session.clone();
            handles.push(tokio::spawn(async move {
                exec.execute(&session, click(CoordinateSpace::Viewport, 10.0 + i as f64, 10.0))
                    .await
            }));
            // give each task time to queue on the session lock before the next
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        for h in handles {
            assert!(h.await.unwrap().success);
        }

        let xs: Vec<f64> = script
            .clicks()
            .into_iter()
            .map(|c| match c {
                Call::Click { x, .. } => x,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(xs, vec![10.0, 11.0, 12.0, 13.0, 14.0]);
    }

    #[tokio::test]
    async fn stopping_one_session_leaves_another_running() {
        let script = Script::browser(1280, 720).with_delay(Duration::from_millis(200));
        let (mgr, a) = start(&script, Scope::Browser).await;
        let b = mgr.start(Scope::Browser, StartOptions::default()).await.unwrap();
        let exec = Arc::new(executor());

        let in_flight = {
            let exec = exec.clone();
            let a = a.clone();
            tokio::spawn(async move {
                exec.execute(&a, click(CoordinateSpace::Viewport, 5.0, 5.0)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        mgr.stop(a.id()).await.unwrap();

        let stopped = in_flight.await.unwrap();
        assert!(!stopped.success);
        assert!(matches!(stopped.failure, Some(EngineError::SessionStopped(_))));

        let other = exec
            .execute(&b, click(CoordinateSpace::Viewport, 5.0, 5.0))
            .await;
        assert!(other.success);
        assert!(script
            .calls_for(b.id())
            .iter()
            .any(|c| matches!(c, Call::Click { .. })));
    }

    #[tokio::test]
    async fn slow_backend_reports_timeout() {
        let script = Script::browser(1280, 720).with_delay(Duration::from_secs(2));
        let (_mgr, session) = start(&script, Scope::Browser).await;

        let result = executor()
            .execute(&session, click(CoordinateSpace::Viewport, 5.0, 5.0))
            .await;

        assert!(!result.success);
        assert!(matches!(result.failure, Some(EngineError::BackendTimeout(_))));
    }

    #[tokio::test]
    async fn lost_connection_stops_the_session() {
        let script = Script::browser(1280, 720);
        let (mgr, session) = start(&script, Scope::Browser).await;
        script.disconnect();

        let result = executor()
            .execute(&session, click(CoordinateSpace::Viewport, 5.0, 5.0))
            .await;

        assert!(!result.success);
        assert!(matches!(result.failure, Some(EngineError::SessionStopped(_))));
        assert!(mgr.get(session.id()).is_err());
    }
}
