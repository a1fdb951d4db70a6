//! Per-epoch learning rate schedules

use serde::{Deserialize, Serialize};

use crate::utils::{drop_based_learning_rate, time_based_learning_rate};

/// Learning rate as a function of the epoch index.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LrSchedule {
    /// Keep the initial rate
    Constant,
    /// `lr0 / (1 + decay_rate * epoch)`
    TimeBased {
        /// Decay per epoch
        decay_rate: f32,
    },
    /// `lr0 * drop_rate ^ floor((1 + epoch) / epoch_drop)`
    DropBased {
        /// Multiplier applied at each drop
        drop_rate: f32,
        /// Epochs between drops
        epoch_drop: f32,
    },
}

impl Default for LrSchedule {
    fn default() -> Self {
        LrSchedule::Constant
    }
}

impl LrSchedule {
    /// Validate decay parameters
    pub fn validate(&self) -> std::result::Result<(), String> {
        match *self {
            LrSchedule::Constant => Ok(()),
            LrSchedule::TimeBased { decay_rate } => {
                if !decay_rate.is_finite() || decay_rate < 0.0 {
                    return Err("Decay rate must be non-negative".to_string());
                }
                Ok(())
            }
            LrSchedule::DropBased { drop_rate, epoch_drop } => {
                if !drop_rate.is_finite() || drop_rate <= 0.0 {
                    return Err("Drop rate must be positive".to_string());
                }
                if !epoch_drop.is_finite() || epoch_drop <= 0.0 {
                    return Err("Epochs between drops must be positive".to_string());
                }
                Ok(())
            }
        }
    }

    /// Learning rate for `epoch` starting from `initial`
    pub fn learning_rate(&self, epoch: usize, initial: f32) -> f32 {
        match self {
            LrSchedule::Constant => initial,
            LrSchedule::TimeBased { decay_rate } => time_based_learning_rate(epoch, initial, *decay_rate),
            LrSchedule::DropBased { drop_rate, epoch_drop } => {
                drop_based_learning_rate(epoch, initial, *drop_rate, *epoch_drop)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedules() {
        assert_eq!(LrSchedule::Constant.learning_rate(10, 0.1), 0.1);

        let time = LrSchedule::TimeBased { decay_rate: 1.0 };
        assert!((time.learning_rate(1, 0.1) - 0.05).abs() < 1e-7);

        let drop = LrSchedule::DropBased { drop_rate: 0.5, epoch_drop: 10.0 };
        assert!((drop.learning_rate(8, 0.1) - 0.1).abs() < 1e-7);
        assert!((drop.learning_rate(9, 0.1) - 0.05).abs() < 1e-7);
        assert!((drop.learning_rate(19, 0.1) - 0.025).abs() < 1e-7);
    }

    #[test]
    fn test_validate() {
        assert!(LrSchedule::Constant.validate().is_ok());
        assert!(LrSchedule::TimeBased { decay_rate: 0.1 }.validate().is_ok());
        assert!(LrSchedule::TimeBased { decay_rate: -1.0 }.validate().is_err());
        assert!(LrSchedule::DropBased { drop_rate: 0.5, epoch_drop: 0.0 }.validate().is_err());
        assert!(LrSchedule::DropBased { drop_rate: -0.5, epoch_drop: 10.0 }.validate().is_err());
        assert!(LrSchedule::DropBased { drop_rate: 0.5, epoch_drop: 10.0 }.validate().is_ok());
    }
}
