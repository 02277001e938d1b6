use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::backend::{Backend, BackendError, BackendLauncher};
use crate::dom::{DomRef, RefMap};
use crate::error::{EngineError, EngineResult, ValidationError};
use crate::geometry::{CoordinateSpace, Dimensions, Surface};
use crate::loop_detector::{HistoryEntry, LoopConfig, LoopDetector};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Browser,
    Desktop,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Browser => "browser",
            Scope::Desktop => "desktop",
        }
    }

    /// The coordinate space this scope's backend consumes.
    pub fn native_space(&self) -> CoordinateSpace {
        match self {
            Scope::Browser => CoordinateSpace::Viewport,
            Scope::Desktop => CoordinateSpace::Screen,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = ValidationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_lowercase().as_str() {
            "browser" => Ok(Scope::Browser),
            "desktop" => Ok(Scope::Desktop),
            other => Err(ValidationError::UnknownValue {
                field: "scope",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub start_url: Option<String>,
    pub headless: bool,
    pub viewport: Option<Dimensions>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub scope: Scope,
    pub driver: &'static str,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub history_len: usize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct Session {
    id: String,
    scope: Scope,
    driver: &'static str,
    created_at: DateTime<Utc>,
    last_activity_at: Mutex<DateTime<Utc>>,
    surface: Mutex<Surface>,
    // Holding this lock is what serialises a session's actions.
    backend: tokio::sync::Mutex<Box<dyn Backend>>,
    history: Mutex<LoopDetector>,
    refs: Mutex<RefMap>,
    cancel: CancellationToken,
    crashed: AtomicBool,
}

impl Session {
    fn new(id: String, scope: Scope, backend: Box<dyn Backend>, loop_config: LoopConfig) -> Self {
        let now = Utc::now();
        Self {
            id,
            scope,
            driver: backend.driver(),
            created_at: now,
            last_activity_at: Mutex::new(now),
            surface: Mutex::new(Surface::default()),
            backend: tokio::sync::Mutex::new(backend),
            history: Mutex::new(LoopDetector::new(loop_config)),
            refs: Mutex::new(RefMap::default()),
            cancel: CancellationToken::new(),
            crashed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn driver(&self) -> &'static str {
        self.driver
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_activity_at(&self) -> DateTime<Utc> {
        *lock(&self.last_activity_at)
    }

    pub fn touch(&self) {
        *lock(&self.last_activity_at) = Utc::now();
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_crashed(&self) -> bool {
        self.crashed.load(Ordering::SeqCst)
    }

    /// The backend connection died; in-flight and queued work is abandoned.
    pub fn mark_crashed(&self) {
        if !self.crashed.swap(true, Ordering::SeqCst) {
            warn!(session_id = %self.id, "backend connection lost, session will be reaped");
        }
        self.cancel.cancel();
    }

    /// Waits for exclusive use of the backend, in request order.
    pub async fn lock_backend(
        &self,
    ) -> EngineResult<tokio::sync::MutexGuard<'_, Box<dyn Backend>>> {
        if self.is_stopped() {
            return Err(EngineError::SessionStopped(self.id.clone()));
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(EngineError::SessionStopped(self.id.clone())),
            guard = self.backend.lock() => {
                if self.is_stopped() {
                    Err(EngineError::SessionStopped(self.id.clone()))
                } else {
                    Ok(guard)
                }
            }
        }
    }

    pub fn remember_surface(&self, surface: Surface) {
        *lock(&self.surface) = surface;
    }

    /// Dimensions seen at the last backend query.
    pub fn last_surface(&self) -> Surface {
        *lock(&self.surface)
    }

    /// Appends to the loop-detection history and returns the loop signal.
    pub fn record(&self, entry: HistoryEntry) -> bool {
        lock(&self.history).record(entry)
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        lock(&self.history).history().cloned().collect()
    }

    /// Replaces the refs with those of the latest DOM tree dump.
    pub fn remember_refs(&self, refs: RefMap) {
        *lock(&self.refs) = refs;
    }

    pub fn lookup_ref(&self, id: &str) -> Option<DomRef> {
        lock(&self.refs).get(id).cloned()
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id.clone(),
            scope: self.scope,
            driver: self.driver,
            created_at: self.created_at,
            last_activity_at: self.last_activity_at(),
            history_len: lock(&self.history).len(),
        }
    }

    async fn shutdown(&self) {
        self.cancel.cancel();
        lock(&self.history).clear();
        *lock(&self.refs) = RefMap::default();
        // in-flight work observes the cancellation and releases the lock
        let mut backend = self.backend.lock().await;
        match tokio::time::timeout(CLOSE_TIMEOUT, backend.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(session_id = %self.id, error = %e, "backend close failed"),
            Err(_) => warn!(session_id = %self.id, "backend close timed out"),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("scope", &self.scope)
            .field("driver", &self.driver)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

fn new_session_id() -> String {
    format!("session-{}", Uuid::new_v4().simple())
}

/// Registry of live sessions. Structural changes go through one lock; work
/// on a session only holds that session's own backend lock.
pub struct SessionManager {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    launcher: Arc<dyn BackendLauncher>,
    loop_config: LoopConfig,
}

impl SessionManager {
    pub fn new(launcher: Arc<dyn BackendLauncher>, loop_config: LoopConfig) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            launcher,
            loop_config,
        }
    }

    pub fn launcher(&self) -> &Arc<dyn BackendLauncher> {
        &self.launcher
    }

    pub async fn start(&self, scope: Scope, options: StartOptions) -> EngineResult<Arc<Session>> {
        let id = new_session_id();
        let backend = self
            .launcher
            .launch(scope, &id, &options)
            .await
            .map_err(|e| match e {
                BackendError::Execution(msg) | BackendError::Disconnected(msg) => {
                    EngineError::BackendUnavailable(msg)
                }
                other => other.into_engine(scope),
            })?;

        let session = Arc::new(Session::new(id.clone(), scope, backend, self.loop_config));
        lock(&self.sessions).insert(id.clone(), session.clone());
        info!(session_id = %id, %scope, driver = session.driver(), "session started");
        Ok(session)
    }

    pub fn get(&self, session_id: &str) -> EngineResult<Arc<Session>> {
        let mut sessions = lock(&self.sessions);
        match sessions.get(session_id) {
            None => Err(EngineError::SessionNotFound(session_id.to_string())),
            Some(session) if session.is_crashed() => {
                if let Some(dead) = sessions.remove(session_id) {
                    reap(dead);
                }
                Err(EngineError::SessionStopped(session_id.to_string()))
            }
            Some(session) => Ok(session.clone()),
        }
    }

    /// Idempotent: stopping an unknown or already stopped session is not an error.
    pub async fn stop(&self, session_id: &str) -> EngineResult<bool> {
        let removed = lock(&self.sessions).remove(session_id);
        let Some(session) = removed else {
            return Ok(false);
        };
        session.shutdown().await;
        info!(session_id, "session stopped");
        Ok(true)
    }

    pub async fn stop_all(&self) {
        let drained: Vec<Arc<Session>> = lock(&self.sessions).drain().map(|(_, s)| s).collect();
        for session in drained {
            session.shutdown().await;
        }
    }

    pub fn list_active(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = lock(&self.sessions)
            .values()
            .filter(|s| !s.is_stopped())
            .map(|s| s.info())
            .collect();
        infos.sort_by_key(|i| i.created_at);
        infos
    }

    /// Oldest live session of a scope, used when a request names none.
    pub fn first_active(&self, scope: Scope) -> Option<Arc<Session>> {
        lock(&self.sessions)
            .values()
            .filter(|s| s.scope() == scope && !s.is_stopped())
            .min_by_key(|s| s.created_at())
            .cloned()
    }

    pub fn count(&self, scope: Scope) -> usize {
        lock(&self.sessions)
            .values()
            .filter(|s| s.scope() == scope && !s.is_stopped())
            .count()
    }
}

fn reap(session: Arc<Session>) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(async move { session.shutdown().await });
    }
}
