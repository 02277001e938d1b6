use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::action::{Action, ClickKind, KeyCombo, ScrollDirection, TypeMethod};
use crate::backend::{Backend, BackendError, BackendResult};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult, ValidationError};
use crate::geometry::{CoordinateTransformer, NativePoint, Resolution, Surface};
use crate::session::{Scope, Session};

/// An action whose coordinates have been converted to the backend's native
/// space and bounds-checked against the session's current surface.
#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    Click { at: Resolution, kind: ClickKind },
    Hover { at: Resolution },
    Drag { from: Resolution, to: Resolution },
    Type {
        text: String,
        method: TypeMethod,
        selector: Option<String>,
    },
    Scroll {
        direction: ScrollDirection,
        amount: i32,
        anchor: Option<Resolution>,
    },
    KeyPress { combo: KeyCombo },
    Wait { duration: Duration },
}

impl Plan {
    pub fn target(&self) -> Option<&Resolution> {
        match self {
            Plan::Click { at, .. } | Plan::Hover { at } => Some(at),
            Plan::Drag { from, .. } => Some(from),
            Plan::Scroll { anchor, .. } => anchor.as_ref(),
            _ => None,
        }
    }

    pub fn end(&self) -> Option<&Resolution> {
        match self {
            Plan::Drag { to, .. } => Some(to),
            _ => None,
        }
    }

    /// Same action aimed at another native point. Only clicks and hovers can be retargeted.
    pub fn retarget(&self, native: NativePoint) -> Option<Plan> {
        let moved = |at: &Resolution| Resolution {
            requested: at.requested,
            native,
            scale: at.scale,
        };
        match self {
            Plan::Click { at, kind } => Some(Plan::Click {
                at: moved(at),
                kind: *kind,
            }),
            Plan::Hover { at } => Some(Plan::Hover { at: moved(at) }),
            _ => None,
        }
    }

    pub fn is_single_click(&self) -> bool {
        matches!(
            self,
            Plan::Click {
                kind: ClickKind::Single,
                ..
            }
        )
    }

    pub fn as_double_click(&self) -> Option<Plan> {
        match self {
            Plan::Click {
                at,
                kind: ClickKind::Single,
            } => Some(Plan::Click {
                at: *at,
                kind: ClickKind::Double,
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Executed {
    pub via: &'static str,
    pub typed_with: Option<TypeMethod>,
}

/// Turns canonical actions into backend calls, bounded by a timeout and by
/// the session's cancellation.
#[derive(Debug, Clone)]
pub struct ActionDispatcher {
    timeout: Duration,
    settle: Duration,
    max_wait: Duration,
}

impl ActionDispatcher {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            timeout: config.backend_timeout,
            settle: config.settle_delay,
            max_wait: config.max_wait,
        }
    }

    /// Runs one backend call. A stop request aborts it with `SessionStopped`.
    pub async fn guarded<T, F>(&self, session: &Session, call: F) -> EngineResult<T>
    where
        F: Future<Output = BackendResult<T>>,
    {
        self.guarded_for(session, self.timeout, call).await
    }

    /// Like `guarded`, for calls that wait on the page for up to `limit`.
    pub async fn guarded_for<T, F>(&self, session: &Session, limit: Duration, call: F) -> EngineResult<T>
    where
        F: Future<Output = BackendResult<T>>,
    {
        let outcome = tokio::select! {
            _ = session.cancellation().cancelled() => {
                return Err(EngineError::SessionStopped(session.id().to_string()));
            }
            outcome = tokio::time::timeout(limit, call) => outcome,
        };
        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                if matches!(e, BackendError::Disconnected(_)) {
                    session.mark_crashed();
                }
                Err(e.into_engine(session.scope()))
            }
            Err(_) => Err(EngineError::BackendTimeout(limit)),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }

    /// Fresh dimensions from the backend; never a cached value.
    pub async fn surface(&self, session: &Session, backend: &mut dyn Backend) -> EngineResult<Surface> {
        let surface = self.guarded(session, backend.surface()).await?;
        session.remember_surface(surface);
        Ok(surface)
    }

    /// Converts and bounds-checks every coordinate. Nothing here touches a backend.
    pub fn plan(&self, scope: Scope, action: &Action, surface: &Surface) -> EngineResult<Plan> {
        let native = scope.native_space();
        let resolve = |p| CoordinateTransformer::resolve(p, native, surface);
        let plan = match action {
            Action::Click { at, kind } => Plan::Click {
                at: resolve(*at)?,
                kind: *kind,
            },
            Action::Hover { at } => Plan::Hover { at: resolve(*at)? },
            Action::Drag { from, to } => Plan::Drag {
                from: resolve(*from)?,
                to: resolve(*to)?,
            },
            Action::Type {
                text,
                method,
                selector,
            } => {
                if selector.is_some() && scope != Scope::Browser {
                    return Err(ValidationError::InvalidValue {
                        field: "selector",
                        reason: "selectors only apply to browser sessions".into(),
                    }
                    .into());
                }
                Plan::Type {
                    text: text.clone(),
                    method: *method,
                    selector: selector.clone(),
                }
            }
            Action::Scroll {
                direction,
                amount,
                anchor,
            } => Plan::Scroll {
                direction: *direction,
                amount: *amount,
                anchor: anchor.map(resolve).transpose()?,
            },
            Action::KeyPress { combo } => Plan::KeyPress {
                combo: combo.clone(),
            },
            Action::Wait { duration } => {
                if *duration > self.max_wait {
                    return Err(ValidationError::InvalidValue {
                        field: "duration",
                        reason: format!(
                            "{:.1}s exceeds the {:.0}s maximum",
                            duration.as_secs_f64(),
                            self.max_wait.as_secs_f64()
                        ),
                    }
                    .into());
                }
                Plan::Wait {
                    duration: *duration,
                }
            }
        };
        Ok(plan)
    }

    pub async fn execute(
        &self,
        session: &Session,
        backend: &mut dyn Backend,
        plan: &Plan,
    ) -> EngineResult<Executed> {
        let via = backend.driver();
        let mut typed_with = None;
        match plan {
            Plan::Click { at, kind } => {
                debug!(session_id = session.id(), x = at.native.x(), y = at.native.y(), kind = kind.as_str(), "click");
                self.guarded(session, backend.click(at.native, *kind)).await?;
            }
            Plan::Hover { at } => {
                self.guarded(session, backend.move_pointer(at.native)).await?;
            }
            Plan::Drag { from, to } => {
                self.guarded(session, backend.drag(from.native, to.native)).await?;
            }
            Plan::Type {
                text,
                method,
                selector,
            } => {
                debug!(session_id = session.id(), chars = text.chars().count(), method = method.as_str(), "type");
                let used = self
                    .guarded(
                        session,
                        backend.type_text(text, *method, selector.as_deref()),
                    )
                    .await?;
                typed_with = Some(used);
            }
            Plan::Scroll {
                direction,
                amount,
                anchor,
            } => {
                self.guarded(
                    session,
                    backend.scroll(*direction, *amount, anchor.map(|a| a.native)),
                )
                .await?;
            }
            Plan::KeyPress { combo } => {
                debug!(session_id = session.id(), key = %combo, "keypress");
                self.guarded(session, backend.press_key(combo)).await?;
            }
            Plan::Wait { duration } => {
                self.pause(session, *duration).await?;
                return Ok(Executed { via, typed_with });
            }
        }
        self.pause(session, self.settle).await?;
        Ok(Executed { via, typed_with })
    }

    async fn pause(&self, session: &Session, duration: Duration) -> EngineResult<()> {
        if duration.is_zero() {
            return Ok(());
        }
        tokio::select! {
            _ = session.cancellation().cancelled() => {
                Err(EngineError::SessionStopped(session.id().to_string()))
            }
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Action;
    use crate::geometry::{CoordinateSpace, Dimensions, Offset, Point};

    fn dispatcher() -> ActionDispatcher {
        ActionDispatcher::new(&EngineConfig {
            settle_delay: Duration::ZERO,
            ..EngineConfig::default()
        })
    }

    fn surface() -> Surface {
        Surface {
            viewport: Some(Dimensions::new(1280, 720)),
            screen: Some(Dimensions::new(1920, 1080)),
            viewport_origin: Some(Offset { x: 0.0, y: 80.0 }),
        }
    }

    #[test]
    fn plan_converts_normalized_click() {
        let action = Action::Click {
            at: Point::new(CoordinateSpace::Normalized, 400.0, 200.0),
            kind: ClickKind::Single,
        };
        let plan = dispatcher().plan(Scope::Browser, &action, &surface()).unwrap();
        let target = plan.target().unwrap();
        assert_eq!(target.native.pixel(), (406, 206));
        assert_eq!(target.native.space(), CoordinateSpace::Viewport);
        assert!(target.scale.is_some());
    }

    #[test]
    fn plan_rejects_out_of_bounds_drag_end() {
        let action = Action::Drag {
            from: Point::new(CoordinateSpace::Viewport, 10.0, 10.0),
            to: Point::new(CoordinateSpace::Viewport, 10.0, 900.0),
        };
        let err = dispatcher().plan(Scope::Browser, &action, &surface()).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn desktop_plans_in_screen_space() {
        let action = Action::Click {
            at: Point::new(CoordinateSpace::Viewport, 100.0, 100.0),
            kind: ClickKind::Single,
        };
        let plan = dispatcher().plan(Scope::Desktop, &action, &surface()).unwrap();
        let target = plan.target().unwrap();
        assert_eq!(target.native.space(), CoordinateSpace::Screen);
        assert_eq!(target.native.pixel(), (100, 180));
    }

    #[test]
    fn wait_is_capped() {
        let action = Action::Wait {
            duration: Duration::from_secs(101),
        };
        assert!(dispatcher().plan(Scope::Browser, &action, &surface()).is_err());
    }

    #[test]
    fn only_single_clicks_become_double_clicks() {
        let action = Action::Click {
            at: Point::new(CoordinateSpace::Viewport, 5.0, 5.0),
            kind: ClickKind::Right,
        };
        let plan = dispatcher().plan(Scope::Browser, &action, &surface()).unwrap();
        assert!(plan.as_double_click().is_none());
        assert!(!plan.is_single_click());
    }

    #[test]
    fn retarget_keeps_requested_point() {
        let action = Action::Hover {
            at: Point::new(CoordinateSpace::Viewport, 5.0, 5.0),
        };
        let plan = dispatcher().plan(Scope::Browser, &action, &surface()).unwrap();
        let moved = plan
            .retarget(NativePoint::unchecked(CoordinateSpace::Viewport, 50.0, 60.0))
            .unwrap();
        let target = moved.target().unwrap();
        assert_eq!(target.requested.x, 5.0);
        assert_eq!(target.native.pixel(), (50, 60));
    }
}
