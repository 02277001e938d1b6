//! Element references and DOM queries for browser sessions.
//!
//! A DOM tree dump tags every visible interactive element with a short ref
//! (`e1`, `e2`, ...). The refs from the latest dump are kept per session so
//! later calls can target an element without re-sending coordinates.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::Rect;
use crate::error::ValidationError;

/// Attribute the DOM tree script stamps on each element it reports.
pub const REF_ATTRIBUTE: &str = "data-tool-ref";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomRef {
    #[serde(rename = "ref")]
    pub id: String,
    #[serde(default)]
    pub tag: String,
    pub role: Option<String>,
    pub name: Option<String>,
    /// Centre, in viewport pixels.
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub width: f64,
    #[serde(default)]
    pub height: f64,
    #[serde(default)]
    pub disabled: bool,
}

impl DomRef {
    /// CSS selector that finds this element again while the page is unchanged.
    pub fn selector(&self) -> String {
        format!("[{}=\"{}\"]", REF_ATTRIBUTE, self.id)
    }
}

/// Refs from one DOM tree dump, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct RefMap {
    refs: HashMap<String, DomRef>,
}

impl RefMap {
    /// Reads the `elements` array of a tree dump. Entries that do not look
    /// like refs are skipped.
    pub fn from_tree(tree: &Value) -> Self {
        let refs = tree
            .get("elements")
            .and_then(Value::as_array)
            .map(|elements| {
                elements
                    .iter()
                    .filter_map(|e| serde_json::from_value::<DomRef>(e.clone()).ok())
                    .map(|r| (r.id.clone(), r))
                    .collect()
            })
            .unwrap_or_default();
        Self { refs }
    }

    pub fn get(&self, id: &str) -> Option<&DomRef> {
        self.refs.get(id.trim())
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }
}

/// How to find an element. Exactly one locator is used, in field order.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ElementQuery {
    pub selector: Option<String>,
    pub test_id: Option<String>,
    pub role: Option<String>,
    pub role_name: Option<String>,
    pub text: Option<String>,
    #[serde(default)]
    pub text_exact: bool,
    pub label: Option<String>,
    pub placeholder: Option<String>,
    /// Which match to use when several are found.
    #[serde(default)]
    pub index: usize,
    #[serde(default = "default_true")]
    pub must_be_visible: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq)]
pub enum Locator {
    Css(String),
    TestId(String),
    Role { role: String, name: Option<String> },
    Text { text: String, exact: bool },
    Label(String),
    Placeholder(String),
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::Css(s) => write!(f, "selector: {}", s),
            Locator::TestId(id) => write!(f, "test_id: {}", id),
            Locator::Role { role, name: Some(name) } => write!(f, "role: {}, name: {}", role, name),
            Locator::Role { role, name: None } => write!(f, "role: {}", role),
            Locator::Text { text, .. } => write!(f, "text: '{}'", text),
            Locator::Label(l) => write!(f, "label: {}", l),
            Locator::Placeholder(p) => write!(f, "placeholder: {}", p),
        }
    }
}

fn present(field: &Option<String>) -> Option<String> {
    field
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

impl ElementQuery {
    pub fn by_selector(selector: impl Into<String>) -> Self {
        Self {
            selector: Some(selector.into()),
            must_be_visible: true,
            ..Default::default()
        }
    }

    pub fn locator(&self) -> Result<Locator, ValidationError> {
        if let Some(s) = present(&self.selector) {
            return Ok(Locator::Css(s));
        }
        if let Some(id) = present(&self.test_id) {
            return Ok(Locator::TestId(id));
        }
        if let Some(role) = present(&self.role) {
            return Ok(Locator::Role {
                role,
                name: present(&self.role_name),
            });
        }
        if let Some(text) = present(&self.text) {
            return Ok(Locator::Text {
                text,
                exact: self.text_exact,
            });
        }
        if let Some(label) = present(&self.label) {
            return Ok(Locator::Label(label));
        }
        if let Some(placeholder) = present(&self.placeholder) {
            return Ok(Locator::Placeholder(placeholder));
        }
        Err(ValidationError::MissingField("selector"))
    }
}

/// What an element lookup found.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ElementMatch {
    pub found: bool,
    pub visible: bool,
    pub enabled: bool,
    pub element_count: usize,
    /// Centre, in viewport pixels.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bounding_box: Option<Rect>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    pub selector_used: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectorState {
    Attached,
    Detached,
    #[default]
    Visible,
    Hidden,
}

impl FromStr for SelectorState {
    type Err = ValidationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_lowercase().as_str() {
            "attached" => Ok(SelectorState::Attached),
            "detached" => Ok(SelectorState::Detached),
            "visible" => Ok(SelectorState::Visible),
            "hidden" => Ok(SelectorState::Hidden),
            other => Err(ValidationError::UnknownValue {
                field: "state",
                value: other.to_string(),
            }),
        }
    }
}

impl SelectorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectorState::Attached => "attached",
            SelectorState::Detached => "detached",
            SelectorState::Visible => "visible",
            SelectorState::Hidden => "hidden",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadState {
    #[default]
    Load,
    #[serde(rename = "domcontentloaded")]
    DomContentLoaded,
    #[serde(rename = "networkidle")]
    NetworkIdle,
}

impl FromStr for LoadState {
    type Err = ValidationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_lowercase().as_str() {
            "load" => Ok(LoadState::Load),
            "domcontentloaded" => Ok(LoadState::DomContentLoaded),
            "networkidle" => Ok(LoadState::NetworkIdle),
            other => Err(ValidationError::UnknownValue {
                field: "state",
                value: other.to_string(),
            }),
        }
    }
}

impl LoadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadState::Load => "load",
            LoadState::DomContentLoaded => "domcontentloaded",
            LoadState::NetworkIdle => "networkidle",
        }
    }
}

/// Which `<option>` of a `<select>` to pick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionChoice {
    Value(String),
    Label(String),
    Index(usize),
}

impl OptionChoice {
    /// First of value, label, index that is given.
    pub fn pick(
        value: Option<String>,
        label: Option<String>,
        index: Option<usize>,
    ) -> Result<Self, ValidationError> {
        match (value, label, index) {
            (Some(v), _, _) => Ok(OptionChoice::Value(v)),
            (None, Some(l), _) => Ok(OptionChoice::Label(l)),
            (None, None, Some(i)) => Ok(OptionChoice::Index(i)),
            (None, None, None) => Err(ValidationError::MissingField("value")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ref_map_reads_tree_elements() {
        let tree = json!({
            "url": "https://example.com",
            "elements": [
                { "ref": "e1", "tag": "button", "role": "button", "name": "Save", "x": 120, "y": 40, "width": 80, "height": 24 },
                { "ref": "e2", "tag": "a", "role": "link", "name": null, "x": 10.5, "y": 300 },
                { "tag": "div" }
            ]
        });
        let refs = RefMap::from_tree(&tree);
        assert_eq!(refs.len(), 2);
        let save = refs.get("e1").unwrap();
        assert_eq!((save.x, save.y), (120.0, 40.0));
        assert_eq!(save.name.as_deref(), Some("Save"));
        assert_eq!(save.selector(), "[data-tool-ref=\"e1\"]");
        assert!(refs.get(" e2 ").is_some());
        assert!(refs.get("e3").is_none());
    }

    #[test]
    fn tree_without_elements_has_no_refs() {
        assert!(RefMap::from_tree(&json!({ "url": "about:blank" })).is_empty());
    }

    #[test]
    fn locator_follows_field_order() {
        let query = ElementQuery {
            role: Some("button".into()),
            role_name: Some("Submit".into()),
            text: Some("ignored".into()),
            ..Default::default()
        };
        assert_eq!(
            query.locator().unwrap(),
            Locator::Role {
                role: "button".into(),
                name: Some("Submit".into())
            }
        );
        assert_eq!(query.locator().unwrap().to_string(), "role: button, name: Submit");

        let blank = ElementQuery {
            selector: Some("  ".into()),
            ..Default::default()
        };
        assert_eq!(blank.locator().unwrap_err(), ValidationError::MissingField("selector"));
    }

    #[test]
    fn query_defaults_to_visible_only() {
        let query: ElementQuery = serde_json::from_value(json!({ "text": "Next" })).unwrap();
        assert!(query.must_be_visible);
        assert_eq!(query.index, 0);
    }

    #[test]
    fn parses_wait_states() {
        assert_eq!("Hidden".parse::<SelectorState>().unwrap(), SelectorState::Hidden);
        assert!("gone".parse::<SelectorState>().is_err());
        assert_eq!(
            "networkidle".parse::<LoadState>().unwrap(),
            LoadState::NetworkIdle
        );
        assert!("idle".parse::<LoadState>().is_err());
    }

    #[test]
    fn option_choice_prefers_value() {
        assert_eq!(
            OptionChoice::pick(Some("de".into()), Some("German".into()), Some(2)).unwrap(),
            OptionChoice::Value("de".into())
        );
        assert_eq!(
            OptionChoice::pick(None, None, Some(2)).unwrap(),
            OptionChoice::Index(2)
        );
        assert!(OptionChoice::pick(None, None, None).is_err());
    }
}
