//! Canonical action model.
//!
//! Every request is normalised into an [`Action`] exactly once, here. Type and
//! space synonyms are folded into closed enums, so nothing downstream ever
//! matches on raw strings.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, ValidationError};
use crate::geometry::{CoordinateSpace, Point, Resolution, ScaleFactors};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Click,
    DoubleClick,
    RightClick,
    TripleClick,
    Hover,
    Drag,
    Type,
    Scroll,
    #[serde(rename = "keypress")]
    KeyPress,
    Wait,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Click => "click",
            ActionKind::DoubleClick => "double_click",
            ActionKind::RightClick => "right_click",
            ActionKind::TripleClick => "triple_click",
            ActionKind::Hover => "hover",
            ActionKind::Drag => "drag",
            ActionKind::Type => "type",
            ActionKind::Scroll => "scroll",
            ActionKind::KeyPress => "keypress",
            ActionKind::Wait => "wait",
        }
    }

    /// Actions that target a point on the surface.
    pub fn is_spatial(&self) -> bool {
        matches!(
            self,
            ActionKind::Click
                | ActionKind::DoubleClick
                | ActionKind::RightClick
                | ActionKind::TripleClick
                | ActionKind::Hover
                | ActionKind::Drag
        )
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = ValidationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let key = raw.trim().to_lowercase().replace(['-', ' '], "_");
        match key.as_str() {
            "click" | "left_click" | "single_click" | "tap" => Ok(ActionKind::Click),
            "double_click" | "doubleclick" | "dblclick" => Ok(ActionKind::DoubleClick),
            "right_click" | "rightclick" | "context_click" => Ok(ActionKind::RightClick),
            "triple_click" | "tripleclick" => Ok(ActionKind::TripleClick),
            "hover" | "move" | "mouse_move" | "move_mouse" => Ok(ActionKind::Hover),
            "drag" | "drag_and_drop" | "left_click_drag" => Ok(ActionKind::Drag),
            "type" | "type_text" | "input" | "input_text" => Ok(ActionKind::Type),
            "scroll" => Ok(ActionKind::Scroll),
            "keypress" | "key" | "key_press" | "press" | "hotkey" => Ok(ActionKind::KeyPress),
            "wait" | "sleep" | "pause" => Ok(ActionKind::Wait),
            _ => Err(ValidationError::UnknownActionType(raw.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClickKind {
    #[default]
    Single,
    Double,
    Right,
    Triple,
}

impl ClickKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClickKind::Single => "single",
            ClickKind::Double => "double",
            ClickKind::Right => "right",
            ClickKind::Triple => "triple",
        }
    }

    pub fn click_count(&self) -> u8 {
        match self {
            ClickKind::Single | ClickKind::Right => 1,
            ClickKind::Double => 2,
            ClickKind::Triple => 3,
        }
    }

    fn action_kind(&self) -> ActionKind {
        match self {
            ClickKind::Single => ActionKind::Click,
            ClickKind::Double => ActionKind::DoubleClick,
            ClickKind::Right => ActionKind::RightClick,
            ClickKind::Triple => ActionKind::TripleClick,
        }
    }
}

impl FromStr for ClickKind {
    type Err = ValidationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_lowercase().as_str() {
            "single" | "left" | "" => Ok(ClickKind::Single),
            "double" => Ok(ClickKind::Double),
            "right" | "context" => Ok(ClickKind::Right),
            "triple" => Ok(ClickKind::Triple),
            other => Err(ValidationError::UnknownValue {
                field: "click_type",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollDirection {
    Up,
    #[default]
    Down,
    Left,
    Right,
}

impl ScrollDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScrollDirection::Up => "up",
            ScrollDirection::Down => "down",
            ScrollDirection::Left => "left",
            ScrollDirection::Right => "right",
        }
    }

    /// Signed (dx, dy) for a positive amount, page coordinates.
    pub fn delta(&self, amount: i32) -> (i32, i32) {
        match self {
            ScrollDirection::Up => (0, -amount),
            ScrollDirection::Down => (0, amount),
            ScrollDirection::Left => (-amount, 0),
            ScrollDirection::Right => (amount, 0),
        }
    }
}

impl FromStr for ScrollDirection {
    type Err = ValidationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_lowercase().as_str() {
            "up" => Ok(ScrollDirection::Up),
            "down" => Ok(ScrollDirection::Down),
            "left" => Ok(ScrollDirection::Left),
            "right" => Ok(ScrollDirection::Right),
            other => Err(ValidationError::UnknownValue {
                field: "direction",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeMethod {
    #[default]
    Clipboard,
    Keystrokes,
}

impl TypeMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            TypeMethod::Clipboard => "clipboard",
            TypeMethod::Keystrokes => "keystrokes",
        }
    }
}

impl FromStr for TypeMethod {
    type Err = ValidationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_lowercase().as_str() {
            "clipboard" | "paste" => Ok(TypeMethod::Clipboard),
            "keystrokes" | "keys" | "typewrite" => Ok(TypeMethod::Keystrokes),
            other => Err(ValidationError::UnknownValue {
                field: "method",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Modifier {
    Control,
    Shift,
    Alt,
    Meta,
}

impl Modifier {
    /// DOM key name.
    pub fn key_name(&self) -> &'static str {
        match self {
            Modifier::Control => "Control",
            Modifier::Shift => "Shift",
            Modifier::Alt => "Alt",
            Modifier::Meta => "Meta",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "ctrl" | "control" => Some(Modifier::Control),
            "shift" => Some(Modifier::Shift),
            "alt" | "option" | "opt" => Some(Modifier::Alt),
            "cmd" | "command" | "meta" | "super" | "win" | "windows" => Some(Modifier::Meta),
            _ => None,
        }
    }
}

/// A key with optional held modifiers, written as `ctrl+shift+t`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyCombo {
    pub modifiers: Vec<Modifier>,
    /// Canonical DOM-style key name (`Enter`, `ArrowUp`, `a`, `F5`).
    pub key: String,
}

impl KeyCombo {
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::MissingField("key"));
        }
        // a bare "+" is the plus key, not a separator
        if trimmed == "+" {
            return Ok(Self {
                modifiers: Vec::new(),
                key: "+".to_string(),
            });
        }

        let parts: Vec<&str> = trimmed.split('+').map(str::trim).collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(ValidationError::InvalidValue {
                field: "key",
                reason: format!("malformed key combination '{}'", raw),
            });
        }
        let (last, held) = parts.split_last().ok_or(ValidationError::MissingField("key"))?;

        let mut modifiers = Vec::new();
        for part in held {
            let modifier = Modifier::parse(&part.to_lowercase()).ok_or_else(|| {
                ValidationError::UnknownValue {
                    field: "modifier",
                    value: part.to_string(),
                }
            })?;
            if !modifiers.contains(&modifier) {
                modifiers.push(modifier);
            }
        }

        Ok(Self {
            modifiers,
            key: canonical_key(last),
        })
    }

    pub fn has_modifiers(&self) -> bool {
        !self.modifiers.is_empty()
    }
}

impl fmt::Display for KeyCombo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for m in &self.modifiers {
            write!(f, "{}+", m.key_name())?;
        }
        f.write_str(&self.key)
    }
}

fn canonical_key(raw: &str) -> String {
    let lower = raw.to_lowercase();
    let named = match lower.as_str() {
        "enter" | "return" => "Enter",
        "tab" => "Tab",
        "esc" | "escape" => "Escape",
        "backspace" => "Backspace",
        "delete" | "del" => "Delete",
        "space" | "spacebar" => "Space",
        "up" | "arrowup" => "ArrowUp",
        "down" | "arrowdown" => "ArrowDown",
        "left" | "arrowleft" => "ArrowLeft",
        "right" | "arrowright" => "ArrowRight",
        "home" => "Home",
        "end" => "End",
        "pageup" | "page_up" => "PageUp",
        "pagedown" | "page_down" => "PageDown",
        "ctrl" | "control" => "Control",
        "shift" => "Shift",
        "alt" | "option" => "Alt",
        "cmd" | "command" | "meta" | "super" => "Meta",
        _ => "",
    };
    if !named.is_empty() {
        return named.to_string();
    }
    if lower.len() > 1 && lower.starts_with('f') && lower[1..].parse::<u8>().is_ok() {
        return lower.to_uppercase();
    }
    raw.to_string()
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Click { at: Point, kind: ClickKind },
    Hover { at: Point },
    Drag { from: Point, to: Point },
    Type {
        text: String,
        method: TypeMethod,
        selector: Option<String>,
    },
    Scroll {
        direction: ScrollDirection,
        amount: i32,
        anchor: Option<Point>,
    },
    KeyPress { combo: KeyCombo },
    Wait { duration: Duration },
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Click { kind, .. } => kind.action_kind(),
            Action::Hover { .. } => ActionKind::Hover,
            Action::Drag { .. } => ActionKind::Drag,
            Action::Type { .. } => ActionKind::Type,
            Action::Scroll { .. } => ActionKind::Scroll,
            Action::KeyPress { .. } => ActionKind::KeyPress,
            Action::Wait { .. } => ActionKind::Wait,
        }
    }

    /// The point the loop detector compares, in the space it was issued in.
    pub fn target(&self) -> Option<Point> {
        match self {
            Action::Click { at, .. } | Action::Hover { at } => Some(*at),
            Action::Drag { from, .. } => Some(*from),
            Action::Scroll { anchor, .. } => *anchor,
            _ => None,
        }
    }
}

/// Loosely-typed action as it arrives over the wire.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawAction {
    #[serde(rename = "type", alias = "action", alias = "action_type")]
    pub action_type: String,
    #[serde(alias = "coordinate_origin")]
    pub space: Option<String>,
    #[serde(alias = "start_x")]
    pub x: Option<f64>,
    #[serde(alias = "start_y")]
    pub y: Option<f64>,
    pub end_x: Option<f64>,
    pub end_y: Option<f64>,
    pub text: Option<String>,
    pub key: Option<String>,
    pub direction: Option<String>,
    pub amount: Option<i32>,
    pub click_type: Option<String>,
    pub method: Option<String>,
    pub selector: Option<String>,
    /// Seconds.
    pub duration: Option<f64>,
}

impl RawAction {
    pub fn normalize(self) -> Result<Action, ValidationError> {
        let kind: ActionKind = self.action_type.parse()?;
        // spatial actions must name their space; nothing is assumed
        let space: Option<CoordinateSpace> = self.space.as_deref().map(str::parse).transpose()?;
        let point = |x: Option<f64>, y: Option<f64>, fx: &'static str, fy: &'static str| {
            let space = space.ok_or(ValidationError::MissingField("coordinate_origin"))?;
            let x = x.ok_or(ValidationError::MissingField(fx))?;
            let y = y.ok_or(ValidationError::MissingField(fy))?;
            if !x.is_finite() || !y.is_finite() {
                return Err(ValidationError::InvalidValue {
                    field: "coordinates",
                    reason: "coordinates must be finite numbers".into(),
                });
            }
            Ok(Point::new(space, x, y))
        };

        let action = match kind {
            ActionKind::Click
            | ActionKind::DoubleClick
            | ActionKind::RightClick
            | ActionKind::TripleClick => {
                let click = match (kind, self.click_type.as_deref()) {
                    (ActionKind::Click, Some(raw)) => raw.parse()?,
                    (ActionKind::Click, None) => ClickKind::Single,
                    (ActionKind::DoubleClick, _) => ClickKind::Double,
                    (ActionKind::RightClick, _) => ClickKind::Right,
                    _ => ClickKind::Triple,
                };
                Action::Click {
                    at: point(self.x, self.y, "x", "y")?,
                    kind: click,
                }
            }
            ActionKind::Hover => Action::Hover {
                at: point(self.x, self.y, "x", "y")?,
            },
            ActionKind::Drag => Action::Drag {
                from: point(self.x, self.y, "start_x", "start_y")?,
                to: point(self.end_x, self.end_y, "end_x", "end_y")?,
            },
            ActionKind::Type => Action::Type {
                text: self.text.ok_or(ValidationError::MissingField("text"))?,
                method: match self.method.as_deref() {
                    Some(raw) => raw.parse()?,
                    None => TypeMethod::default(),
                },
                selector: self.selector.filter(|s| !s.trim().is_empty()),
            },
            ActionKind::Scroll => {
                let amount = self.amount.unwrap_or(300);
                if amount <= 0 {
                    return Err(ValidationError::InvalidValue {
                        field: "amount",
                        reason: "scroll amount must be positive".into(),
                    });
                }
                let anchor = match (self.x, self.y) {
                    (None, None) => None,
                    _ => Some(point(self.x, self.y, "x", "y")?),
                };
                Action::Scroll {
                    direction: match self.direction.as_deref() {
                        Some(raw) => raw.parse()?,
                        None => ScrollDirection::default(),
                    },
                    amount,
                    anchor,
                }
            }
            ActionKind::KeyPress => Action::KeyPress {
                combo: KeyCombo::parse(self.key.as_deref().unwrap_or_default())?,
            },
            ActionKind::Wait => {
                let secs = self.duration.unwrap_or(1.0);
                let duration = Duration::try_from_secs_f64(secs).map_err(|_| {
                    ValidationError::InvalidValue {
                        field: "duration",
                        reason: "duration must be a non-negative number of seconds".into(),
                    }
                })?;
                Action::Wait { duration }
            }
        };
        Ok(action)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolvedCoordinates {
    pub requested: Point,
    pub resolved: Point,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale: Option<ScaleFactors>,
}

impl From<&Resolution> for ResolvedCoordinates {
    fn from(r: &Resolution) -> Self {
        Self {
            requested: r.requested,
            resolved: r.native.as_point(),
            scale: r.scale,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub kind: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl From<&EngineError> for ErrorReport {
    fn from(err: &EngineError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            details: err.details(),
        }
    }
}

/// Outcome of one action after the healing chain has run.
#[derive(Debug, Clone, Serialize)]
pub struct ActionResult {
    pub success: bool,
    pub action_type: ActionKind,
    pub executed_via: Option<String>,
    pub resolved_coordinates: Option<ResolvedCoordinates>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_end: Option<ResolvedCoordinates>,
    pub healed: bool,
    pub healing_method: Option<String>,
    pub attempted_strategies: Vec<String>,
    pub error: Option<ErrorReport>,
    pub loop_detected: bool,
    #[serde(skip)]
    pub failure: Option<EngineError>,
}

impl ActionResult {
    pub fn failed(action_type: ActionKind, err: EngineError) -> Self {
        Self {
            success: false,
            action_type,
            executed_via: None,
            resolved_coordinates: None,
            resolved_end: None,
            healed: false,
            healing_method: None,
            attempted_strategies: Vec::new(),
            error: Some(ErrorReport::from(&err)),
            loop_detected: false,
            failure: Some(err),
        }
    }
}
