//! Keyboard input routing
//!
//! Input arrives either as literal text, written unchanged, or as a named
//! key translated to its terminal escape sequence.

use serde::{Deserialize, Serialize};

use crate::error::SessionError;

/// One input request. `{"text": ".."}` or `{"key": ".."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputRequest {
    Text { text: String },
    Key { key: String },
}

impl InputRequest {
    pub fn text(text: impl Into<String>) -> Self {
        InputRequest::Text { text: text.into() }
    }

    pub fn key(key: impl Into<String>) -> Self {
        InputRequest::Key { key: key.into() }
    }

    /// Resolve to the bytes to write. Unknown key names are rejected.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SessionError> {
        match self {
            InputRequest::Text { text } => Ok(text.as_bytes().to_vec()),
            InputRequest::Key { key } => key_sequence(key)
                .map(|seq| seq.as_bytes().to_vec())
                .ok_or_else(|| SessionError::UnknownKey(key.clone())),
        }
    }
}

/// Escape sequence for a named key, case-insensitive.
pub fn key_sequence(name: &str) -> Option<&'static str> {
    let seq = match name.to_ascii_lowercase().as_str() {
        "enter" => "\r",
        "ctrl_enter" => "\n",
        "shift_enter" => "\x1b\r",
        "escape" | "esc" => "\x1b",
        "tab" => "\t",
        "shift_tab" => "\x1b[Z",
        "backspace" => "\x7f",
        "arrow_up" | "up" => "\x1b[A",
        "arrow_down" | "down" => "\x1b[B",
        "arrow_right" | "right" => "\x1b[C",
        "arrow_left" | "left" => "\x1b[D",
        "home" => "\x1b[H",
        "end" => "\x1b[F",
        "page_up" => "\x1b[5~",
        "page_down" => "\x1b[6~",
        "delete" => "\x1b[3~",
        "insert" => "\x1b[2~",
        "f1" => "\x1bOP",
        "f2" => "\x1bOQ",
        "f3" => "\x1bOR",
        "f4" => "\x1bOS",
        "f5" => "\x1b[15~",
        "f6" => "\x1b[17~",
        "f7" => "\x1b[18~",
        "f8" => "\x1b[19~",
        "f9" => "\x1b[20~",
        "f10" => "\x1b[21~",
        "f11" => "\x1b[23~",
        "f12" => "\x1b[24~",
        "ctrl_c" => "\x03",
        "ctrl_d" => "\x04",
        "ctrl_z" => "\x1a",
        "ctrl_l" => "\x0c",
        _ => return None,
    };
    Some(seq)
}
