use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::action::ActionKind;
use crate::geometry::CoordinateSpace;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopConfig {
    /// Consecutive entries that must match.
    pub window: usize,
    /// Entries kept per session.
    pub capacity: usize,
    /// Per-axis distance, in the space the actions were issued in.
    pub tolerance: f64,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            window: 3,
            capacity: 10,
            tolerance: 50.0,
        }
    }
}

impl LoopConfig {
    /// A usable config needs `capacity >= window >= 1` and a finite, non-negative tolerance.
    pub fn is_valid(&self) -> bool {
        self.window >= 1
            && self.capacity >= self.window
            && self.tolerance.is_finite()
            && self.tolerance >= 0.0
    }

    fn clamped(self) -> Self {
        let window = self.window.max(1);
        let tolerance = if self.tolerance.is_finite() && self.tolerance >= 0.0 {
            self.tolerance
        } else {
            Self::default().tolerance
        };
        Self {
            window,
            capacity: self.capacity.max(window),
            tolerance,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub session_id: String,
    pub action_type: ActionKind,
    pub space: Option<CoordinateSpace>,
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
}

impl HistoryEntry {
    fn position(&self) -> Option<(CoordinateSpace, f64, f64)> {
        match (self.space, self.x, self.y) {
            (Some(space), Some(x), Some(y)) => Some((space, x, y)),
            _ => None,
        }
    }
}

/// Action loop detector.
/// Flags a session that keeps issuing the same action at (nearly) the same
/// place. The signal is advisory and never blocks execution.
#[derive(Debug)]
pub struct LoopDetector {
    config: LoopConfig,
    entries: VecDeque<HistoryEntry>,
}

impl LoopDetector {
    pub fn new(config: LoopConfig) -> Self {
        let config = config.clamped();
        Self {
            entries: VecDeque::with_capacity(config.capacity),
            config,
        }
    }

    /// Appends an entry and reports whether the newest window forms a loop.
    pub fn record(&mut self, entry: HistoryEntry) -> bool {
        while self.entries.len() >= self.config.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
        self.detect()
    }

    pub fn history(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn detect(&self) -> bool {
        let window = self.config.window;
        if self.entries.len() < window {
            return false;
        }
        let recent: Vec<&HistoryEntry> = self.entries.iter().rev().take(window).collect();
        let first = recent[0];
        if recent.iter().any(|e| e.action_type != first.action_type) {
            return false;
        }

        if !first.action_type.is_spatial() {
            return true;
        }

        let Some((space, x0, y0)) = first.position() else {
            return false;
        };
        let tolerance = self.config.tolerance;
        recent.iter().all(|e| match e.position() {
            Some((s, x, y)) => s == space && (x - x0).abs() <= tolerance && (y - y0).abs() <= tolerance,
            None => false,
        })
    }
}
