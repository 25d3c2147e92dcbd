//! Detection mode and the state machine governing switches between modes.

use facegate_hw::Facing;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which detection pipeline is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Face,
    Qr,
}

impl Mode {
    /// Camera direction requested for this mode.
    pub fn facing(self) -> Facing {
        match self {
            Mode::Face => Facing::User,
            Mode::Qr => Facing::Environment,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Face => f.write_str("face"),
            Mode::Qr => f.write_str("qr"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown mode {0:?} (expected \"face\" or \"qr\")")]
pub struct ParseModeError(String);

impl FromStr for Mode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "face" => Ok(Mode::Face),
            "qr" => Ok(Mode::Qr),
            _ => Err(ParseModeError(s.to_string())),
        }
    }
}

/// Outcome of a mode request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeRequest {
    /// Already in the requested mode.
    Unchanged,
    /// A detection is in flight; the target is pending until it settles.
    Deferred(Mode),
    /// Tear down `from` and start `to`.
    Switch { from: Mode, to: Mode },
}

/// Tracks the active mode and at most one pending switch.
#[derive(Debug)]
pub struct ModeController {
    active: Mode,
    pending: Option<Mode>,
}

impl ModeController {
    pub fn new(initial: Mode) -> Self {
        Self {
            active: initial,
            pending: None,
        }
    }

    pub fn active(&self) -> Mode {
        self.active
    }

    pub fn pending(&self) -> Option<Mode> {
        self.pending
    }

    /// Request `target`. While `detecting`, the switch is queued; a newer
    /// request replaces an older pending one.
    pub fn request(&mut self, target: Mode, detecting: bool) -> ModeRequest {
        if detecting {
            if target == self.active {
                // Cancels any pending switch away from the active mode.
                self.pending = None;
                return ModeRequest::Unchanged;
            }
            self.pending = Some(target);
            return ModeRequest::Deferred(target);
        }
        self.pending = None;
        self.transition(target)
    }

    /// Apply the pending switch once the in-flight detection has completed
    /// or been cancelled.
    pub fn settle(&mut self) -> Option<ModeRequest> {
        let target = self.pending.take()?;
        match self.transition(target) {
            ModeRequest::Unchanged => None,
            req => Some(req),
        }
    }

    fn transition(&mut self, target: Mode) -> ModeRequest {
        if target == self.active {
            return ModeRequest::Unchanged;
        }
        let from = self.active;
        self.active = target;
        ModeRequest::Switch { from, to: target }
    }
}
