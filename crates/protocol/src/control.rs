//! Control-channel messages received from the operator over the WebRTC
//! data channel. One JSON object per message, discriminated by `type`
//! (and for mouse events additionally by `eventType`).
//!
//! Unknown `type` or `eventType` tags fail to parse; the agent logs and
//! drops such messages at the channel boundary.

use serde::{Deserialize, Serialize};

/// Mouse button identifiers as the operator sends them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

/// Mouse event payloads, discriminated by `eventType`.
///
/// Coordinates are in the encoded frame space (0..1920 × 0..1080).
/// Scroll deltas are operator-side pixel units, positive-down.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "eventType", rename_all = "lowercase")]
pub enum MouseEvent {
    Move { x: f64, y: f64 },
    Button { button: MouseButton, down: bool },
    Scroll {
        #[serde(rename = "deltaX")]
        delta_x: f64,
        #[serde(rename = "deltaY")]
        delta_y: f64,
    },
}

/// Top-level control event, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlEvent {
    Mouse(MouseEvent),
    Keyboard { key: String, down: bool },
    Monitor {
        /// Target monitor index; −1 selects the composite virtual desktop.
        #[serde(rename = "monitorIndex")]
        monitor_index: i32,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mouse_move_from_operator() {
        let json = r#"{"type":"mouse","eventType":"move","x":960.5,"y":540.0}"#;
        let event: ControlEvent = serde_json::from_str(json).unwrap();
        match event {
            ControlEvent::Mouse(MouseEvent::Move { x, y }) => {
                assert!((x - 960.5).abs() < f64::EPSILON);
                assert!((y - 540.0).abs() < f64::EPSILON);
            }
            other => panic!("expected mouse move, got {other:?}"),
        }
    }

    #[test]
    fn mouse_button_from_operator() {
        let json = r#"{"type":"mouse","eventType":"button","button":"right","down":true}"#;
        let event: ControlEvent = serde_json::from_str(json).unwrap();
        assert_eq!(
            event,
            ControlEvent::Mouse(MouseEvent::Button {
                button: MouseButton::Right,
                down: true,
            })
        );
    }

    #[test]
    fn mouse_scroll_uses_camel_case_deltas() {
        let json = r#"{"type":"mouse","eventType":"scroll","deltaX":0.0,"deltaY":-100.0}"#;
        let event: ControlEvent = serde_json::from_str(json).unwrap();
        match event {
            ControlEvent::Mouse(MouseEvent::Scroll { delta_x, delta_y }) => {
                assert_eq!(delta_x, 0.0);
                assert_eq!(delta_y, -100.0);
            }
            other => panic!("expected scroll, got {other:?}"),
        }
    }

    #[test]
    fn keyboard_event_from_operator() {
        let json = r#"{"type":"keyboard","key":"ArrowRight","down":true}"#;
        let event: ControlEvent = serde_json::from_str(json).unwrap();
        assert_eq!(
            event,
            ControlEvent::Keyboard {
                key: "ArrowRight".into(),
                down: true,
            }
        );
    }

    #[test]
    fn monitor_change_accepts_virtual_sentinel() {
        let json = r#"{"type":"monitor","monitorIndex":-1}"#;
        let event: ControlEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event, ControlEvent::Monitor { monitor_index: -1 });
    }

    #[test]
    fn unknown_type_is_rejected() {
        let json = r#"{"type":"clipboard","text":"hi"}"#;
        assert!(serde_json::from_str::<ControlEvent>(json).is_err());
    }

    #[test]
    fn unknown_mouse_event_type_is_rejected() {
        let json = r#"{"type":"mouse","eventType":"drag","x":1.0,"y":2.0}"#;
        assert!(serde_json::from_str::<ControlEvent>(json).is_err());
    }

    #[test]
    fn serializes_back_to_operator_shape() {
        let event = ControlEvent::Mouse(MouseEvent::Scroll {
            delta_x: 1.5,
            delta_y: -3.0,
        });
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"mouse""#));
        assert!(json.contains(r#""eventType":"scroll""#));
        assert!(json.contains(r#""deltaX":1.5"#));
    }
}
