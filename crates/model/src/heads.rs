//! Active prediction heads and per-call routing.

use crate::error::{ModelError, Result};

/// Which observation reconstruction heads run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservationHeads {
    Disabled,
    Static,
    /// Static and wrist-camera reconstruction. The hand head reuses the static
    /// head's mask tokens, so it never runs alone.
    StaticAndHand,
}

impl ObservationHeads {
    fn rank(self) -> u8 {
        match self {
            ObservationHeads::Disabled => 0,
            ObservationHeads::Static => 1,
            ObservationHeads::StaticAndHand => 2,
        }
    }
}

/// The set of prediction heads, resolved once from the enable flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadSet {
    action: bool,
    observation: ObservationHeads,
}

impl HeadSet {
    pub const fn new(action: bool, observation: ObservationHeads) -> Self {
        Self {
            action,
            observation,
        }
    }

    /// Resolves the `act_pred` / `fwd_pred` / `fwd_pred_hand` flags.
    pub fn from_flags(act_pred: bool, fwd_pred: bool, fwd_pred_hand: bool) -> Result<Self> {
        let observation = match (fwd_pred, fwd_pred_hand) {
            (false, false) => ObservationHeads::Disabled,
            (true, false) => ObservationHeads::Static,
            (true, true) => ObservationHeads::StaticAndHand,
            (false, true) => {
                return Err(ModelError::configuration(
                    "fwd_pred_hand requires fwd_pred: the hand head shares the observation mask tokens",
                ))
            }
        };
        Ok(Self::new(act_pred, observation))
    }

    pub fn predicts_actions(&self) -> bool {
        self.action
    }

    pub fn observation(&self) -> ObservationHeads {
        self.observation
    }

    pub fn predicts_obs(&self) -> bool {
        self.observation != ObservationHeads::Disabled
    }

    pub fn predicts_obs_hand(&self) -> bool {
        self.observation == ObservationHeads::StaticAndHand
    }

    /// True when every head in `other` is also in `self`.
    pub fn contains(&self, other: &HeadSet) -> bool {
        (self.action || !other.action) && self.observation.rank() >= other.observation.rank()
    }

    pub fn without_hand(self) -> Self {
        let observation = match self.observation {
            ObservationHeads::StaticAndHand => ObservationHeads::Static,
            other => other,
        };
        Self::new(self.action, observation)
    }
}

/// Immutable per-call choice of heads and input views.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Routing {
    pub heads: HeadSet,
    pub use_hand_rgb: bool,
}

impl Routing {
    pub fn new(heads: HeadSet, use_hand_rgb: bool) -> Self {
        Self {
            heads,
            use_hand_rgb,
        }
    }
}
