// THEORY:
// The automation cycle ends in physical actions: pressing the cast key, moving
// the pointer onto the target, clicking to reel in. Those are OS-specific and
// live outside the crate. `ActionCallbacks` is the seam: the state machine only
// ever talks to this trait, and it never waits on it from its own loop.
//
// Failures are ordinary values (`ActionError`). The caller that spawned the
// action logs them; the state machine does not care whether the click landed.

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

/// A virtual-key code as understood by the platform input layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyCode(pub u16);

impl KeyCode {
    pub const F1: KeyCode = KeyCode(0x70);
    pub const F3: KeyCode = KeyCode(0x72);
    pub const F10: KeyCode = KeyCode(0x79);

    /// Parses `F1`..`F12` and single letters `A`..`Z` (case-insensitive).
    /// Anything else maps to `F3`.
    pub fn parse(token: &str) -> KeyCode {
        let token = token.trim().to_ascii_uppercase();
        if let Some(number) = token.strip_prefix('F') {
            if let Ok(n) = number.parse::<u16>() {
                if (1..=12).contains(&n) {
                    return KeyCode(KeyCode::F1.0 + n - 1);
                }
            }
        }
        let mut chars = token.chars();
        if let (Some(c), None) = (chars.next(), chars.next()) {
            if c.is_ascii_uppercase() {
                return KeyCode(c as u16);
            }
        }
        KeyCode::F3
    }
}

impl fmt::Display for KeyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("key press {key} failed: {message}")]
    KeyPress { key: KeyCode, message: String },

    #[error("cursor move to ({x}, {y}) failed: {message}")]
    CursorMove { x: i32, y: i32, message: String },

    #[error("secondary click failed: {0}")]
    Click(String),

    #[error("input backend unavailable: {0}")]
    Unavailable(String),
}

/// Side effects the automation cycle performs on the host.
#[async_trait]
pub trait ActionCallbacks: Send + Sync {
    async fn press_key(&self, key: KeyCode) -> Result<(), ActionError>;

    async fn move_cursor(&self, x: i32, y: i32) -> Result<(), ActionError>;

    async fn click_secondary_button(&self) -> Result<(), ActionError>;

    fn parse_key_token(&self, token: &str) -> KeyCode {
        KeyCode::parse(token)
    }
}

/// Callbacks that do nothing. Used for dry runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopActions;

#[async_trait]
impl ActionCallbacks for NoopActions {
    async fn press_key(&self, _key: KeyCode) -> Result<(), ActionError> {
        Ok(())
    }

    async fn move_cursor(&self, _x: i32, _y: i32) -> Result<(), ActionError> {
        Ok(())
    }

    async fn click_secondary_button(&self) -> Result<(), ActionError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_keys_map_to_the_f_key_block() {
        assert_eq!(KeyCode::parse("F1"), KeyCode(0x70));
        assert_eq!(KeyCode::parse("f3"), KeyCode(0x72));
        assert_eq!(KeyCode::parse("F9"), KeyCode(0x78));
        assert_eq!(KeyCode::parse("F10"), KeyCode(0x79));
        assert_eq!(KeyCode::parse(" F12 "), KeyCode(0x7B));
    }

    #[test]
    fn letters_map_to_ascii() {
        assert_eq!(KeyCode::parse("A"), KeyCode(0x41));
        assert_eq!(KeyCode::parse("z"), KeyCode(0x5A));
    }

    #[test]
    fn unknown_tokens_fall_back_to_f3() {
        for token in ["", "F0", "F13", "AB", "1", "Space"] {
            assert_eq!(KeyCode::parse(token), KeyCode::F3, "token {token:?}");
        }
        assert_eq!(NoopActions.parse_key_token("q"), KeyCode(0x51));
    }
}
