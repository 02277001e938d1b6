use std::thread;
use std::time::Duration;

use arboard::Clipboard;
use async_trait::async_trait;
use enigo::{Axis, Button, Coordinate, Direction, Enigo, Key, Keyboard, Mouse, Settings};
use tracing::{debug, warn};
use xcap::Monitor;

use super::{Backend, BackendError, BackendResult, Capture, InputLease};
use crate::action::{ClickKind, KeyCombo, Modifier, ScrollDirection, TypeMethod};
use crate::geometry::{Dimensions, NativePoint, Surface};
use crate::screenshot::encode_png;
use crate::session::Scope;

const DRAG_STEPS: i32 = 12;
const STEP_PAUSE: Duration = Duration::from_millis(10);
const PASTE_SETTLE: Duration = Duration::from_millis(120);

/// Whether an OS display is reachable for input injection and capture.
pub fn display_available() -> bool {
    if cfg!(target_os = "linux") {
        std::env::var_os("DISPLAY").is_some() || std::env::var_os("WAYLAND_DISPLAY").is_some()
    } else {
        true
    }
}

/// Drives the OS mouse and keyboard. Holds no device handle between calls:
/// each operation opens its own connection on a blocking thread. The lease
/// keeps any other desktop session off the same devices until `close`.
pub struct DesktopBackend {
    clipboard: bool,
    lease: Option<InputLease>,
}

impl DesktopBackend {
    pub async fn connect(lease: InputLease) -> BackendResult<Self> {
        if !display_available() {
            return Err(BackendError::Unavailable(
                "No display available for desktop automation (DISPLAY/WAYLAND_DISPLAY unset)"
                    .to_string(),
            ));
        }
        let (width, height) = with_enigo(|enigo| {
            enigo
                .main_display()
                .map_err(|e| BackendError::Unavailable(format!("Cannot read display size: {:?}", e)))
        })
        .await?;
        let clipboard = tokio::task::spawn_blocking(|| Clipboard::new().is_ok())
            .await
            .unwrap_or(false);
        debug!(width, height, clipboard, "desktop backend connected");
        Ok(Self {
            clipboard,
            lease: Some(lease),
        })
    }
}

async fn with_enigo<T, F>(op: F) -> BackendResult<T>
where
    T: Send + 'static,
    F: FnOnce(&mut Enigo) -> BackendResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut enigo = Enigo::new(&Settings::default())
            .map_err(|e| BackendError::Unavailable(format!("Input device unavailable: {:?}", e)))?;
        op(&mut enigo)
    })
    .await
    .map_err(|e| BackendError::Execution(format!("Input task failed: {}", e)))?
}

fn input_err(context: &'static str) -> impl Fn(enigo::InputError) -> BackendError {
    move |e| BackendError::Execution(format!("{}: {:?}", context, e))
}

fn move_to(enigo: &mut Enigo, x: i32, y: i32) -> BackendResult<()> {
    enigo
        .move_mouse(x, y, Coordinate::Abs)
        .map_err(input_err("Mouse move failed"))
}

fn modifier_key(modifier: Modifier) -> Key {
    match modifier {
        Modifier::Control => Key::Control,
        Modifier::Shift => Key::Shift,
        Modifier::Alt => Key::Alt,
        Modifier::Meta => Key::Meta,
    }
}

fn map_key(name: &str) -> BackendResult<Key> {
    let key = match name {
        "Enter" => Key::Return,
        "Tab" => Key::Tab,
        "Escape" => Key::Escape,
        "Backspace" => Key::Backspace,
        "Delete" => Key::Delete,
        "Space" => Key::Space,
        "ArrowUp" => Key::UpArrow,
        "ArrowDown" => Key::DownArrow,
        "ArrowLeft" => Key::LeftArrow,
        "ArrowRight" => Key::RightArrow,
        "Home" => Key::Home,
        "End" => Key::End,
        "PageUp" => Key::PageUp,
        "PageDown" => Key::PageDown,
        "Control" => Key::Control,
        "Shift" => Key::Shift,
        "Alt" => Key::Alt,
        "Meta" => Key::Meta,
        "F1" => Key::F1,
        "F2" => Key::F2,
        "F3" => Key::F3,
        "F4" => Key::F4,
        "F5" => Key::F5,
        "F6" => Key::F6,
        "F7" => Key::F7,
        "F8" => Key::F8,
        "F9" => Key::F9,
        "F10" => Key::F10,
        "F11" => Key::F11,
        "F12" => Key::F12,
        other => {
            let mut chars = other.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Key::Unicode(c),
                _ => {
                    return Err(BackendError::Execution(format!(
                        "Unsupported key '{}'",
                        other
                    )))
                }
            }
        }
    };
    Ok(key)
}

fn paste_modifier() -> Key {
    if cfg!(target_os = "macos") {
        Key::Meta
    } else {
        Key::Control
    }
}

/// Pastes through the system clipboard, then puts the previous text back.
fn paste(enigo: &mut Enigo, text: &str) -> BackendResult<()> {
    let mut clipboard = Clipboard::new()
        .map_err(|e| BackendError::Execution(format!("Clipboard unavailable: {}", e)))?;
    let previous = clipboard.get_text().ok();
    clipboard
        .set_text(text.to_string())
        .map_err(|e| BackendError::Execution(format!("Clipboard write failed: {}", e)))?;

    let modifier = paste_modifier();
    let pasted = enigo
        .key(modifier, Direction::Press)
        .and_then(|_| enigo.key(Key::Unicode('v'), Direction::Click))
        .and_then(|_| enigo.key(modifier, Direction::Release))
        .map_err(input_err("Paste failed"));
    thread::sleep(PASTE_SETTLE);

    if let Some(previous) = previous {
        if let Err(e) = clipboard.set_text(previous) {
            warn!(error = %e, "failed to restore clipboard");
        }
    }
    pasted
}

fn primary_monitor() -> BackendResult<Monitor> {
    let monitors = Monitor::all()
        .map_err(|e| BackendError::Execution(format!("Failed to list monitors: {}", e)))?;
    let primary = monitors
        .iter()
        .position(|m| m.is_primary().unwrap_or(false))
        .unwrap_or(0);
    monitors
        .into_iter()
        .nth(primary)
        .ok_or_else(|| BackendError::Unavailable("No monitor found".to_string()))
}

fn capture_primary() -> BackendResult<image::RgbaImage> {
    primary_monitor()?
        .capture_image()
        .map_err(|e| BackendError::Execution(format!("Screen capture failed: {}", e)))
}

#[async_trait]
impl Backend for DesktopBackend {
    fn scope(&self) -> Scope {
        Scope::Desktop
    }

    fn driver(&self) -> &'static str {
        "enigo"
    }

    async fn surface(&mut self) -> BackendResult<Surface> {
        let (width, height) = with_enigo(|enigo| {
            enigo
                .main_display()
                .map_err(input_err("Cannot read display size"))
        })
        .await?;
        Ok(Surface {
            viewport: None,
            screen: Some(Dimensions::new(width.max(0) as u32, height.max(0) as u32)),
            viewport_origin: None,
        })
    }

    async fn click(&mut self, at: NativePoint, kind: ClickKind) -> BackendResult<()> {
        let (x, y) = at.pixel();
        with_enigo(move |enigo| {
            move_to(enigo, x, y)?;
            let button = match kind {
                ClickKind::Right => Button::Right,
                _ => Button::Left,
            };
            for _ in 0..kind.click_count() {
                enigo
                    .button(button, Direction::Click)
                    .map_err(input_err("Click failed"))?;
            }
            Ok(())
        })
        .await
    }

    async fn move_pointer(&mut self, at: NativePoint) -> BackendResult<()> {
        let (x, y) = at.pixel();
        with_enigo(move |enigo| move_to(enigo, x, y)).await
    }

    async fn drag(&mut self, from: NativePoint, to: NativePoint) -> BackendResult<()> {
        let (fx, fy) = from.pixel();
        let (tx, ty) = to.pixel();
        with_enigo(move |enigo| {
            move_to(enigo, fx, fy)?;
            enigo
                .button(Button::Left, Direction::Press)
                .map_err(input_err("Drag press failed"))?;
            for step in 1..=DRAG_STEPS {
                let x = fx + (tx - fx) * step / DRAG_STEPS;
                let y = fy + (ty - fy) * step / DRAG_STEPS;
                move_to(enigo, x, y)?;
                thread::sleep(STEP_PAUSE);
            }
            enigo
                .button(Button::Left, Direction::Release)
                .map_err(input_err("Drag release failed"))
        })
        .await
    }

    async fn type_text(
        &mut self,
        text: &str,
        method: TypeMethod,
        _selector: Option<&str>,
    ) -> BackendResult<TypeMethod> {
        // synthetic keystrokes cannot produce most non-ASCII text
        let used = match method {
            TypeMethod::Clipboard if self.clipboard => TypeMethod::Clipboard,
            TypeMethod::Keystrokes if !text.is_ascii() && self.clipboard => TypeMethod::Clipboard,
            _ => TypeMethod::Keystrokes,
        };
        let text = text.to_string();
        with_enigo(move |enigo| match used {
            TypeMethod::Clipboard => paste(enigo, &text),
            TypeMethod::Keystrokes => enigo.text(&text).map_err(input_err("Typing failed")),
        })
        .await?;
        Ok(used)
    }

    async fn scroll(
        &mut self,
        direction: ScrollDirection,
        amount: i32,
        anchor: Option<NativePoint>,
    ) -> BackendResult<()> {
        let clicks = (amount.abs() / 100).max(1);
        let (length, axis) = match direction {
            ScrollDirection::Up => (-clicks, Axis::Vertical),
            ScrollDirection::Down => (clicks, Axis::Vertical),
            ScrollDirection::Left => (-clicks, Axis::Horizontal),
            ScrollDirection::Right => (clicks, Axis::Horizontal),
        };
        let anchor = anchor.map(|p| p.pixel());
        with_enigo(move |enigo| {
            if let Some((x, y)) = anchor {
                move_to(enigo, x, y)?;
            }
            enigo
                .scroll(length, axis)
                .map_err(input_err("Scroll failed"))
        })
        .await
    }

    async fn press_key(&mut self, combo: &KeyCombo) -> BackendResult<()> {
        let key = map_key(&combo.key)?;
        let held: Vec<Key> = combo.modifiers.iter().map(|m| modifier_key(*m)).collect();
        with_enigo(move |enigo| {
            for modifier in &held {
                enigo
                    .key(*modifier, Direction::Press)
                    .map_err(input_err("Modifier press failed"))?;
            }
            let pressed = enigo
                .key(key, Direction::Click)
                .map_err(input_err("Key press failed"));
            for modifier in held.iter().rev() {
                enigo
                    .key(*modifier, Direction::Release)
                    .map_err(input_err("Modifier release failed"))?;
            }
            pressed
        })
        .await
    }

    async fn capture(&mut self) -> BackendResult<Capture> {
        tokio::task::spawn_blocking(|| encode_png(capture_primary()?))
            .await
            .map_err(|e| BackendError::Execution(format!("Capture task failed: {}", e)))?
    }

    async fn pixel_at(&mut self, at: NativePoint) -> BackendResult<Option<[u8; 3]>> {
        let surface = self.surface().await?;
        let Some(screen) = surface.screen else {
            return Ok(None);
        };
        let (x, y) = (at.x(), at.y());
        tokio::task::spawn_blocking(move || {
            let img = capture_primary()?;
            // captures are in physical pixels, points are logical
            let px = (x * img.width() as f64 / screen.width as f64) as u32;
            let py = (y * img.height() as f64 / screen.height as f64) as u32;
            Ok(img.get_pixel_checked(px, py).map(|p| [p[0], p[1], p[2]]))
        })
        .await
        .map_err(|e| BackendError::Execution(format!("Capture task failed: {}", e)))?
    }

    async fn is_alive(&mut self) -> bool {
        self.lease.is_some() && display_available()
    }

    async fn close(&mut self) -> BackendResult<()> {
        self.lease = None;
        Ok(())
    }
}
