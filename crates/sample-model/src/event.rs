//! Discrete event payloads for the Input and WindowEvent sources.
//!
//! Pointer coordinates are normalized to `[0.0, 1.0]` relative to the
//! desktop so recordings survive DPI/scaling changes.

use serde::{Deserialize, Serialize};

/// A keyboard or mouse event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputEvent {
    /// Mouse/touchpad pointer position update.
    Pointer {
        /// Normalized X coordinate [0.0, 1.0].
        x: f64,
        /// Normalized Y coordinate [0.0, 1.0].
        y: f64,
    },

    /// Mouse button click.
    Click {
        /// Which button was pressed.
        button: MouseButton,
        /// Press or release.
        state: ButtonState,
        /// Pointer position at click time.
        x: f64,
        y: f64,
    },

    /// Keyboard key event.
    Key {
        /// Key name (e.g., "KEY_A", "KEY_ENTER", "KEY_LEFTSHIFT").
        code: String,
        /// Press or release.
        state: ButtonState,
    },

    /// Scroll wheel event.
    Scroll {
        /// Horizontal scroll delta (normalized).
        dx: f64,
        /// Vertical scroll delta (normalized).
        dy: f64,
        /// Pointer position at scroll time.
        x: f64,
        y: f64,
    },
}

/// A focus or geometry change of the foreground window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WindowEvent {
    /// A different window gained focus.
    Focus {
        /// Window title.
        title: String,
        /// Application name / WM_CLASS.
        app_id: Option<String>,
        /// Owning process, when the window system reports it.
        pid: Option<u32>,
    },

    /// The focused window moved or resized (desktop pixels).
    Geometry {
        x: i32,
        y: i32,
        width: u32,
        height: u32,
    },
}

/// Mouse button identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouseButton {
    Left,
    Right,
    Middle,
    Back,
    Forward,
}

/// Button/key state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ButtonState {
    Down,
    Up,
}

impl InputEvent {
    /// Create a pointer event.
    pub fn pointer(x: f64, y: f64) -> Self {
        Self::Pointer { x, y }
    }

    /// Create a click event.
    pub fn click(button: MouseButton, state: ButtonState, x: f64, y: f64) -> Self {
        Self::Click {
            button,
            state,
            x,
            y,
        }
    }

    /// Create a key event.
    pub fn key(code: impl Into<String>, state: ButtonState) -> Self {
        Self::Key {
            code: code.into(),
            state,
        }
    }

    /// Extract pointer position if this event contains one.
    pub fn pointer_position(&self) -> Option<(f64, f64)> {
        match self {
            Self::Pointer { x, y } => Some((*x, *y)),
            Self::Click { x, y, .. } => Some((*x, *y)),
            Self::Scroll { x, y, .. } => Some((*x, *y)),
            Self::Key { .. } => None,
        }
    }
}

impl WindowEvent {
    /// Create a focus event.
    pub fn focus(title: impl Into<String>, app_id: Option<String>, pid: Option<u32>) -> Self {
        Self::Focus {
            title: title.into(),
            app_id,
            pid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_click_event_json_shape() {
        let event = InputEvent::click(MouseButton::Left, ButtonState::Down, 0.1, 0.9);
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"click\""));
        assert!(json.contains("\"button\":\"left\""));
        assert!(json.contains("\"state\":\"down\""));
    }

    #[test]
    fn test_key_event_parses() {
        let parsed: InputEvent =
            serde_json::from_str(r#"{"type":"key","code":"Enter","state":"up"}"#).unwrap();
        assert_eq!(parsed, InputEvent::key("Enter", ButtonState::Up));
    }

    #[test]
    fn test_pointer_position_extraction() {
        let ptr = InputEvent::pointer(0.3, 0.7);
        assert_eq!(ptr.pointer_position(), Some((0.3, 0.7)));

        let click = InputEvent::click(MouseButton::Left, ButtonState::Down, 0.1, 0.2);
        assert_eq!(click.pointer_position(), Some((0.1, 0.2)));

        let key = InputEvent::key("KeyA", ButtonState::Down);
        assert_eq!(key.pointer_position(), None);
    }

    #[test]
    fn test_window_focus_without_pid_parses() {
        let parsed: WindowEvent =
            serde_json::from_str(r#"{"type":"focus","title":"Terminal","app_id":null,"pid":null}"#)
                .unwrap();
        assert_eq!(parsed, WindowEvent::focus("Terminal", None, None));
    }
}
