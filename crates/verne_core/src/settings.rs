use serde::{Deserialize, Serialize};

use crate::criteria::SplitCriterion;
use crate::error::{Result, SplitError};

/// Which splitting rule produced a patch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Algorithm {
    /// Truncation-error driven bisection.
    Ads,
    /// Nonlinearity-index driven trisection.
    Loads,
}

impl Algorithm {
    /// Width of a child relative to its parent along the split axis.
    pub fn scale(self) -> f64 {
        match self {
            Algorithm::Ads => 0.5,
            Algorithm::Loads => 1.0 / 3.0,
        }
    }

    /// Offset of an outer child's center, in parent half-widths.
    pub fn offset(self) -> f64 {
        match self {
            Algorithm::Ads => 0.5,
            Algorithm::Loads => 2.0 / 3.0,
        }
    }

    pub fn children(self) -> usize {
        match self {
            Algorithm::Ads => 2,
            Algorithm::Loads => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Scheme {
    Euler,
    Rk4,
    Rk78,
}

/// Step-size control for the embedded 7(8) scheme.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Rk78Settings {
    /// Smallest step (H0); steps this small are never rejected.
    pub min_step: f64,
    /// First trial step (HS).
    pub initial_step: f64,
    /// Target local error (EPS).
    pub tolerance: f64,
    /// Local error above which a step is rejected (BS).
    pub reject_bound: f64,
}

impl Default for Rk78Settings {
    fn default() -> Self {
        Self {
            min_step: 1e-3,
            initial_step: 0.1,
            tolerance: 1e-12,
            reject_bound: 20.0 * 1e-12,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IntegratorSettings {
    pub scheme: Scheme,
    /// Upper bound of a single step (H1 for the adaptive scheme).
    pub max_step: f64,
    pub t0: f64,
    pub t1: f64,
    #[serde(default)]
    pub rk78: Rk78Settings,
}

impl Default for IntegratorSettings {
    fn default() -> Self {
        Self {
            scheme: Scheme::Rk4,
            max_step: 0.1,
            t0: 0.0,
            t1: 1.0,
            rk78: Rk78Settings::default(),
        }
    }
}

impl IntegratorSettings {
    pub fn validate(&self) -> Result<()> {
        if !(self.max_step > 0.0) || !self.max_step.is_finite() {
            return Err(SplitError::InvalidSetting(format!(
                "max_step must be positive and finite, got {}",
                self.max_step
            )));
        }
        if !self.t0.is_finite() || !self.t1.is_finite() {
            return Err(SplitError::InvalidSetting(
                "time span must be finite".to_string(),
            ));
        }
        if self.t1 < self.t0 {
            return Err(SplitError::InvalidSetting(format!(
                "end time {} precedes start time {}",
                self.t1, self.t0
            )));
        }
        if self.scheme == Scheme::Rk78 {
            let rk = &self.rk78;
            if !(rk.min_step > 0.0) || !(rk.initial_step > 0.0) || !(rk.tolerance > 0.0) {
                return Err(SplitError::InvalidSetting(
                    "rk78 steps and tolerance must be positive".to_string(),
                ));
            }
            if rk.min_step > self.max_step {
                return Err(SplitError::InvalidSetting(format!(
                    "rk78 min_step {} exceeds max_step {}",
                    rk.min_step, self.max_step
                )));
            }
        }
        Ok(())
    }
}

/// Splitting configuration for one pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitSettings {
    pub criterion: SplitCriterion,
    /// Maximum depth of any patch's split path.
    pub max_split: usize,
    /// Store a snapshot of the worklist before every pop.
    #[serde(default)]
    pub record_evolution: bool,
}

impl SplitSettings {
    pub fn new(criterion: SplitCriterion, max_split: usize) -> Self {
        Self {
            criterion,
            max_split,
            record_evolution: false,
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        self.criterion.algorithm()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_children_tile_the_parent() {
        let alg = Algorithm::Loads;
        // Outer centers at +-2/3 with width 2/3 leave no gap next to the middle child.
        let outer_left_edge = alg.offset() - alg.scale();
        assert!((outer_left_edge - alg.scale()).abs() < 1e-15);
        assert_eq!(alg.children(), 3);
    }

    #[test]
    fn rejects_reversed_time_span() {
        let settings = IntegratorSettings {
            t0: 2.0,
            t1: 1.0,
            ..IntegratorSettings::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(SplitError::InvalidSetting(_))
        ));
    }

    #[test]
    fn rejects_non_positive_step() {
        let settings = IntegratorSettings {
            max_step: 0.0,
            ..IntegratorSettings::default()
        };
        assert!(settings.validate().is_err());
        let settings = IntegratorSettings {
            max_step: f64::NAN,
            ..IntegratorSettings::default()
        };
        assert!(settings.validate().is_err());
    }
}
