//! Logical server slots.
//!
//! A slot is a server role (center, login, a numbered game world, shop) that may
//! or may not currently have a running process. The derived ordering is the
//! order slots are listed in the UI.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Highest game world id accepted (ids are 7-bit).
pub const MAX_GAME_ID: u8 = 127;

/// Identity of a server slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SlotId {
    /// The center coordination server.
    Center,
    /// The login server.
    Login,
    /// A numbered game world server.
    Game(u8),
    /// The cash shop server.
    Shop,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SlotParseError {
    #[error("unknown slot '{0}' (expected center, login, game:<id> or shop)")]
    Unknown(String),
    #[error("game id {0} is out of range (0..=127)")]
    GameIdOutOfRange(u64),
}

impl SlotId {
    /// Builds a game slot, rejecting ids outside `0..=MAX_GAME_ID`.
    pub fn game(id: u64) -> Result<Self, SlotParseError> {
        if id > u64::from(MAX_GAME_ID) {
            return Err(SlotParseError::GameIdOutOfRange(id));
        }
        Ok(SlotId::Game(id as u8))
    }

    /// Whether the slot can be added and removed at runtime.
    pub fn is_dynamic(&self) -> bool {
        matches!(self, SlotId::Game(_) | SlotId::Shop)
    }

    /// Human readable label used for titles and messages.
    pub fn label(&self) -> String {
        match self {
            SlotId::Center => "Center".to_string(),
            SlotId::Login => "Login".to_string(),
            SlotId::Game(id) => format!("Game{}", id),
            SlotId::Shop => "Shop".to_string(),
        }
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotId::Center => f.write_str("center"),
            SlotId::Login => f.write_str("login"),
            SlotId::Game(id) => write!(f, "game:{}", id),
            SlotId::Shop => f.write_str("shop"),
        }
    }
}

impl FromStr for SlotId {
    type Err = SlotParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "center" => return Ok(SlotId::Center),
            "login" => return Ok(SlotId::Login),
            "shop" => return Ok(SlotId::Shop),
            _ => {}
        }
        let Some(rest) = normalized.strip_prefix("game") else {
            return Err(SlotParseError::Unknown(s.to_string()));
        };
        let digits = rest.trim_start_matches([':', ' ', '-']);
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(SlotParseError::Unknown(s.to_string()));
        }
        let id = digits
            .parse::<u64>()
            .map_err(|_| SlotParseError::GameIdOutOfRange(u64::MAX))?;
        SlotId::game(id)
    }
}
