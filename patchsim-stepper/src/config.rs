//! Plain configuration record for a `Stepper` run. Parsing this from a file
//! or environment is an out-of-scope collaborator; this struct only
//! enumerates the recognized fields and validates their invariants, even
//! though the *loader* itself is someone else's concern.

use std::ops::RangeInclusive;

use crate::error::StepperError;

/// Everything a `Stepper::new` call needs beyond the compiled `Model`.
#[derive(Clone, Debug)]
pub struct SimConfig {
    /// Inclusive timestep range to execute; `*steps.start()` need not be 0
    /// (see DESIGN.md Open Question 4 for how the `init` substep generalizes
    /// to this).
    pub steps: RangeInclusive<u64>,
    pub grid_size: f64,
    pub grid_low: (f64, f64),
    pub grid_high: (f64, f64),
    pub grid_patch: String,
    pub rand_seed: u64,
    /// Worker thread count for the patch-parallel pool; `0` means "let
    /// `rayon` pick", matching its own `num_threads(0)` convention.
    pub workers: usize,
}

impl SimConfig {
    pub fn validate(&self) -> Result<(), StepperError> {
        if self.steps.is_empty() {
            return Err(StepperError::InvalidConfig("steps.low must be <= steps.high".to_string()));
        }
        if self.grid_size <= 0.0 {
            return Err(StepperError::InvalidConfig("grid.size must be positive".to_string()));
        }
        if self.grid_low.0 >= self.grid_high.0 || self.grid_low.1 >= self.grid_high.1 {
            return Err(StepperError::InvalidConfig("grid.low must be strictly below grid.high".to_string()));
        }
        if self.grid_patch.trim().is_empty() {
            return Err(StepperError::InvalidConfig("grid.patch must name a declared entity type".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> SimConfig {
        SimConfig {
            steps: 0..=10,
            grid_size: 1.0,
            grid_low: (0.0, 0.0),
            grid_high: (10.0, 10.0),
            grid_patch: "Patch".to_string(),
            rand_seed: 42,
            workers: 4,
        }
    }

    #[test]
    fn rejects_inverted_step_range() {
        let mut config = base_config();
        config.steps = 10..=0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_non_positive_grid_size() {
        let mut config = base_config();
        config.grid_size = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_inverted_grid_extent() {
        let mut config = base_config();
        config.grid_high = (0.0, 0.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn accepts_well_formed_config() {
        assert!(base_config().validate().is_ok());
    }
}
