//! Input injection with multi-monitor coordinate remapping.
//!
//! Inbound pointer coordinates are in the encoded frame space
//! (0..1920 × 0..1080). They are mapped back to desktop-absolute pixels
//! according to the current monitor selection, then handed to the
//! platform backend. On X11 that is the XTEST extension; hosts without a
//! display get a no-op backend that logs and succeeds, so a session can
//! still negotiate media with input disabled.

use std::sync::Mutex;

use tracing::{debug, info, warn};

use tether_protocol::MouseButton;

use crate::capture::{MonitorSelection, MonitorSet};
use crate::encoder::{ENCODE_HEIGHT, ENCODE_WIDTH};
use crate::error::{AgentError, Result};

/// Operator pixels per discrete scroll notch.
const SCROLL_PIXELS_PER_NOTCH: f64 = 30.0;

/// Pure coordinate-remapping context. Kept separate from the platform
/// backend so the math is testable without a display server.
#[derive(Debug, Clone, Default)]
pub struct MonitorMap {
    context: Option<(MonitorSelection, MonitorSet)>,
}

impl MonitorMap {
    /// Update the remap context. Out-of-range selections are rejected
    /// without mutating the current context.
    pub fn set(&mut self, selection: MonitorSelection, monitors: MonitorSet) -> Result<()> {
        if !monitors.contains(selection) {
            return Err(AgentError::State(format!(
                "monitor selection out of range: {selection:?}"
            )));
        }
        self.context = Some((selection, monitors));
        Ok(())
    }

    /// Map an encoded-frame coordinate to a desktop-absolute pixel.
    ///
    /// Without a context, coordinates pass through unchanged; the
    /// operator observes misplaced clicks, which is the intended
    /// diagnostic for a missing `set_monitor_info`.
    pub fn to_desktop(&self, x: f64, y: f64) -> (i32, i32) {
        match &self.context {
            Some((MonitorSelection::Monitor(i), set)) => {
                let m = &set.monitors[*i];
                let sx = x * m.width as f64 / ENCODE_WIDTH as f64;
                let sy = y * m.height as f64 / ENCODE_HEIGHT as f64;
                (m.x + sx as i32, m.y + sy as i32)
            }
            Some((MonitorSelection::VirtualDesktop, set)) => {
                let sx = x * set.virtual_width as f64 / ENCODE_WIDTH as f64;
                let sy = y * set.virtual_height as f64 / ENCODE_HEIGHT as f64;
                (set.virtual_x + sx as i32, set.virtual_y + sy as i32)
            }
            None => (x as i32, y as i32),
        }
    }
}

/// Platform input backend, in desktop-absolute coordinates.
trait PlatformInput: Send {
    fn move_pointer(&mut self, x: i32, y: i32) -> Result<()>;
    fn button(&mut self, button: MouseButton, pressed: bool) -> Result<()>;
    /// One call per discrete notch; positive = up / right.
    fn scroll_notches(&mut self, horizontal: i32, vertical: i32) -> Result<()>;
    fn key(&mut self, evdev_code: u16, pressed: bool) -> Result<()>;
}

/// No-op backend for hosts without input support.
struct NullInput;

impl PlatformInput for NullInput {
    fn move_pointer(&mut self, _x: i32, _y: i32) -> Result<()> {
        Ok(())
    }
    fn button(&mut self, _button: MouseButton, _pressed: bool) -> Result<()> {
        Ok(())
    }
    fn scroll_notches(&mut self, _horizontal: i32, _vertical: i32) -> Result<()> {
        Ok(())
    }
    fn key(&mut self, _evdev_code: u16, _pressed: bool) -> Result<()> {
        Ok(())
    }
}

pub struct InputInjector {
    platform: Box<dyn PlatformInput>,
    /// Remap context has its own lock: it is written by the control
    /// channel (monitor changes) while pointer events read it.
    map: Mutex<MonitorMap>,
    scroll_accum_x: f64,
    scroll_accum_y: f64,
}

fn platform_backend(display: &str) -> Box<dyn PlatformInput> {
    #[cfg(target_os = "linux")]
    {
        match x11::X11Input::new(display) {
            Ok(input) => return Box::new(input),
            Err(e) => {
                warn!(display, "Input injection unavailable ({e}), using no-op backend");
            }
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = display;
        info!("No input backend for this OS, using no-op backend");
    }
    Box::new(NullInput)
}

impl InputInjector {
    pub fn new(display: &str) -> Self {
        Self {
            platform: platform_backend(display),
            map: Mutex::new(MonitorMap::default()),
            scroll_accum_x: 0.0,
            scroll_accum_y: 0.0,
        }
    }

    /// Update the coordinate-remapping context. Must be called before
    /// pointer events are processed after a monitor change.
    pub fn set_monitor_info(&self, selection: MonitorSelection, monitors: MonitorSet) -> Result<()> {
        self.map
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .set(selection, monitors)?;
        info!(?selection, "Input remap context updated");
        Ok(())
    }

    /// Inject a pointer move. `x`/`y` are encoded-frame coordinates.
    pub fn inject_mouse_move(&mut self, x: f64, y: f64) -> Result<()> {
        let (dx, dy) = self.map.lock().unwrap_or_else(|e| e.into_inner()).to_desktop(x, y);
        self.platform.move_pointer(dx, dy)
    }

    pub fn inject_mouse_button(&mut self, button: MouseButton, pressed: bool) -> Result<()> {
        self.platform.button(button, pressed)
    }

    /// Inject scroll. Deltas are operator pixels, positive-down; the
    /// desktop expects positive-up, so the vertical sign is inverted.
    /// Fractional notches accumulate across calls for smooth trackpads.
    pub fn inject_mouse_scroll(&mut self, delta_x: f64, delta_y: f64) -> Result<()> {
        let vertical = accumulate_scroll(&mut self.scroll_accum_y, -delta_y / SCROLL_PIXELS_PER_NOTCH);
        let horizontal = accumulate_scroll(&mut self.scroll_accum_x, delta_x / SCROLL_PIXELS_PER_NOTCH);
        if vertical == 0 && horizontal == 0 {
            return Ok(());
        }
        self.platform.scroll_notches(horizontal, vertical)
    }

    /// Inject a key by its symbolic operator-side name. Unknown names are
    /// dropped.
    pub fn inject_key(&mut self, key: &str, pressed: bool) -> Result<()> {
        match key_to_evdev(key) {
            Some(code) => self.platform.key(code, pressed),
            None => {
                debug!(key, "Unknown key name, dropping");
                Ok(())
            }
        }
    }
}

/// Accumulate fractional scroll and return the whole notches to emit.
fn accumulate_scroll(accum: &mut f64, notches: f64) -> i32 {
    *accum += notches;
    let discrete = *accum as i32;
    if discrete != 0 {
        *accum -= discrete as f64;
    }
    discrete
}

/// Map the operator-side symbolic key vocabulary to Linux evdev codes.
/// Single printable characters map through the US layout.
fn key_to_evdev(name: &str) -> Option<u16> {
    let code = match name {
        "Backspace" => 14,
        "Tab" => 15,
        "Enter" => 28,
        "Shift" | "ShiftLeft" => 42,
        "ShiftRight" => 54,
        "Control" | "ControlLeft" => 29,
        "ControlRight" => 97,
        "Alt" | "AltLeft" => 56,
        "AltRight" => 100,
        "Escape" => 1,
        " " | "Space" => 57,
        "PageUp" => 104,
        "PageDown" => 109,
        "End" => 107,
        "Home" => 102,
        "ArrowLeft" => 105,
        "ArrowUp" => 103,
        "ArrowRight" => 106,
        "ArrowDown" => 108,
        "Insert" => 110,
        "Delete" => 111,
        "Meta" | "MetaLeft" => 125,
        "MetaRight" => 126,
        "F1" => 59,
        "F2" => 60,
        "F3" => 61,
        "F4" => 62,
        "F5" => 63,
        "F6" => 64,
        "F7" => 65,
        "F8" => 66,
        "F9" => 67,
        "F10" => 68,
        "F11" => 87,
        "F12" => 88,
        _ => {
            let mut chars = name.chars();
            let (c, rest) = (chars.next()?, chars.next());
            if rest.is_some() {
                return None;
            }
            match c.to_ascii_lowercase() {
                'a' => 30,
                'b' => 48,
                'c' => 46,
                'd' => 32,
                'e' => 18,
                'f' => 33,
                'g' => 34,
                'h' => 35,
                'i' => 23,
                'j' => 36,
                'k' => 37,
                'l' => 38,
                'm' => 50,
                'n' => 49,
                'o' => 24,
                'p' => 25,
                'q' => 16,
                'r' => 19,
                's' => 31,
                't' => 20,
                'u' => 22,
                'v' => 47,
                'w' => 17,
                'x' => 45,
                'y' => 21,
                'z' => 44,
                '1' => 2,
                '2' => 3,
                '3' => 4,
                '4' => 5,
                '5' => 6,
                '6' => 7,
                '7' => 8,
                '8' => 9,
                '9' => 10,
                '0' => 11,
                _ => return None,
            }
        }
    };
    Some(code)
}

#[cfg(target_os = "linux")]
mod x11 {
    //! XTEST backend. Events are synthesized directly in the X server, so
    //! no uinput device is needed. X11 keycode = evdev code + 8.

    use super::PlatformInput;
    use crate::error::{AgentError, Result};

    use tether_protocol::MouseButton;
    use x11rb::connection::{Connection, RequestConnection};
    use x11rb::protocol::xproto;
    use x11rb::protocol::xtest;
    use x11rb::rust_connection::RustConnection;

    pub(super) struct X11Input {
        conn: RustConnection,
        root: xproto::Window,
    }

    impl X11Input {
        pub(super) fn new(display: &str) -> Result<Self> {
            let (conn, screen_num) = RustConnection::connect(Some(display))
                .map_err(|e| AgentError::Platform(format!("connect to X display: {e}")))?;
            let root = conn.setup().roots[screen_num].root;

            conn.extension_information(xtest::X11_EXTENSION_NAME)
                .map_err(|e| AgentError::Platform(format!("query XTEST: {e}")))?
                .ok_or_else(|| AgentError::Platform("XTEST extension not available".into()))?;

            Ok(Self { conn, root })
        }

        fn fake_input(&self, event_type: u8, detail: u8, x: i16, y: i16) -> Result<()> {
            xtest::fake_input(&self.conn, event_type, detail, 0, self.root, x, y, 0)
                .map_err(|e| AgentError::Platform(format!("XTEST fake_input: {e}")))?;
            self.conn
                .flush()
                .map_err(|e| AgentError::Platform(format!("X flush: {e}")))?;
            Ok(())
        }
    }

    fn button_number(button: MouseButton) -> u8 {
        match button {
            MouseButton::Left => 1,
            MouseButton::Middle => 2,
            MouseButton::Right => 3,
        }
    }

    impl PlatformInput for X11Input {
        fn move_pointer(&mut self, x: i32, y: i32) -> Result<()> {
            self.fake_input(
                xproto::MOTION_NOTIFY_EVENT,
                0, // absolute motion
                x.clamp(i16::MIN as i32, i16::MAX as i32) as i16,
                y.clamp(i16::MIN as i32, i16::MAX as i32) as i16,
            )
        }

        fn button(&mut self, button: MouseButton, pressed: bool) -> Result<()> {
            let event_type = if pressed {
                xproto::BUTTON_PRESS_EVENT
            } else {
                xproto::BUTTON_RELEASE_EVENT
            };
            self.fake_input(event_type, button_number(button), 0, 0)
        }

        fn scroll_notches(&mut self, horizontal: i32, vertical: i32) -> Result<()> {
            // Vertical: button 4 = up, 5 = down. Horizontal: 6 = left, 7 = right.
            let axes = [
                (vertical, 4u8, 5u8),
                (horizontal, 7u8, 6u8),
            ];
            for (count, positive, negative) in axes {
                let button = if count > 0 { positive } else { negative };
                for _ in 0..count.unsigned_abs() {
                    self.fake_input(xproto::BUTTON_PRESS_EVENT, button, 0, 0)?;
                    self.fake_input(xproto::BUTTON_RELEASE_EVENT, button, 0, 0)?;
                }
            }
            Ok(())
        }

        fn key(&mut self, evdev_code: u16, pressed: bool) -> Result<()> {
            let keycode = (evdev_code + 8) as u8;
            let event_type = if pressed {
                xproto::KEY_PRESS_EVENT
            } else {
                xproto::KEY_RELEASE_EVENT
            };
            self.fake_input(event_type, keycode, 0, 0)
        }
    }
}
