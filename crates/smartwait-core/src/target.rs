use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// What to capture on a display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Target {
    /// Capture the whole display.
    Screen,
    /// Capture a specific window, by X window id or by a title substring.
    Window {
        /// Either `0x…` hex window id, or a title substring to match against
        /// at each capture (the first matching window wins).
        name_or_id: String,
    },
    /// Capture the display, with an advisory hint that the target is a pty
    /// session. Treated identically to `Screen` for capture purposes.
    PtySession {
        /// Opaque session identifier, carried through for diagnostics only.
        id: String,
    },
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Screen => write!(f, "screen"),
            Target::Window { name_or_id } => write!(f, "window:{name_or_id}"),
            Target::PtySession { id } => write!(f, "pty:{id}"),
        }
    }
}

/// A `register` target string didn't match any recognized prefix.
#[derive(Debug, thiserror::Error)]
#[error("unrecognized target {0:?}: expected \"screen\", \"window:<id-or-name>\", or \"pty:<session-id>\"")]
pub struct TargetParseError(String);

impl FromStr for Target {
    type Err = TargetParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "screen" {
            return Ok(Target::Screen);
        }
        if let Some(rest) = s.strip_prefix("window:") {
            if rest.is_empty() {
                return Err(TargetParseError(s.to_string()));
            }
            return Ok(Target::Window {
                name_or_id: rest.to_string(),
            });
        }
        if let Some(rest) = s.strip_prefix("pty:") {
            if rest.is_empty() {
                return Err(TargetParseError(s.to_string()));
            }
            return Ok(Target::PtySession { id: rest.to_string() });
        }
        Err(TargetParseError(s.to_string()))
    }
}
