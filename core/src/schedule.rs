//! Learning-rate schedules.
//!
//! While self-constructing, the rate follows the controller's patience
//! countdown; otherwise it is divided by 10 at two fixed fractions of the
//! epoch budget.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// How the rate reacts to the patience countdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LrVariant {
    /// Divide by 10 at each reduction point; restore the initial rate when
    /// the countdown resets.
    Restore,
    /// Clamp to `initial/10` at the first point, force `initial/100` at the
    /// second. Never restores.
    #[default]
    Clamp,
}

impl LrVariant {
    pub const LATEST: LrVariant = LrVariant::Clamp;

    /// Parse `0`, `1` or `latest`; anything else falls back to the latest.
    pub fn from_selector(selector: &str) -> Self {
        match selector.trim().to_ascii_lowercase().as_str() {
            "0" => LrVariant::Restore,
            "1" | "latest" => LrVariant::Clamp,
            other => {
                warn!("unknown learning rate reduction variant '{}', using the latest ({})", other, Self::LATEST);
                Self::LATEST
            }
        }
    }
}

impl fmt::Display for LrVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LrVariant::Restore => write!(f, "0"),
            LrVariant::Clamp => write!(f, "1"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LrCoordinator {
    pub variant: LrVariant,
    pub initial_lr: f32,
    /// Fractions (of the countdown or of the epoch budget) at which the rate
    /// drops.
    pub reduce_lr_1: f32,
    pub reduce_lr_2: f32,
}

/// `floor(total * fraction)`.
fn point(total: usize, fraction: f32) -> usize {
    (total as f64 * fraction as f64).floor().max(0.0) as usize
}

impl LrCoordinator {
    pub fn new(variant: LrVariant, initial_lr: f32, reduce_lr_1: f32, reduce_lr_2: f32) -> Self {
        Self { variant, initial_lr, reduce_lr_1, reduce_lr_2 }
    }

    /// Rate for the next epoch after a controller step left the patience
    /// countdown at `countdown`.
    pub fn after_step(&self, lr: f32, countdown: usize, patience: usize) -> f32 {
        let first = point(patience, 1.0 - self.reduce_lr_1);
        let second = point(patience, 1.0 - self.reduce_lr_2);
        let next = match self.variant {
            LrVariant::Restore => {
                if countdown == patience {
                    self.initial_lr
                } else if countdown == first || countdown == second {
                    lr / 10.0
                } else {
                    lr
                }
            }
            LrVariant::Clamp => {
                if countdown == first {
                    lr.min(self.initial_lr / 10.0)
                } else if countdown == second {
                    self.initial_lr / 100.0
                } else {
                    lr
                }
            }
        };
        if next != lr {
            info!("Learning rate changed to {} (countdown {})", next, countdown);
        }
        next
    }

    /// Fixed schedule when not self-constructing.
    pub fn fixed(&self, epoch: usize, max_n_ep: usize, lr: f32) -> f32 {
        if epoch == point(max_n_ep, self.reduce_lr_1) || epoch == point(max_n_ep, self.reduce_lr_2) {
            let next = lr / 10.0;
            info!("Learning rate has been divided by 10, new lr = {}", next);
            return next;
        }
        lr
    }
}
