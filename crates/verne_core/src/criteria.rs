//! Split triggers evaluated on a candidate state.
//!
//! Both criteria answer the same question, whether the local expansion is
//! still acceptable, and if not, which domain axis should be cut.

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::algebra::Tps;
use crate::error::{Result, SplitError};
use crate::patch::dominant_axis;
use crate::settings::Algorithm;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum SplitCriterion {
    /// Per-component bound on the estimated truncation error.
    Truncation { tolerances: Vec<f64> },
    /// Bound on the nonlinearity index of the state Jacobian. `betas` scales
    /// the sensitivity along each domain axis; zero removes the axis.
    Nonlinearity { threshold: f64, betas: Vec<f64> },
}

/// Verdict of a criterion on one state.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionCheck {
    pub exceeded: bool,
    /// Axis to split along, set only when `exceeded`.
    pub axis: Option<usize>,
    /// Nonlinearity index, for the nonlinearity criterion.
    pub nli: Option<f64>,
    /// Estimates that came out NaN and were ignored.
    pub nan_skips: usize,
}

impl SplitCriterion {
    pub fn truncation(tolerances: Vec<f64>) -> Self {
        SplitCriterion::Truncation { tolerances }
    }

    /// Nonlinearity criterion with unit sensitivity on every axis.
    pub fn nonlinearity(threshold: f64, variables: usize) -> Self {
        SplitCriterion::Nonlinearity {
            threshold,
            betas: vec![1.0; variables],
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        match self {
            SplitCriterion::Truncation { .. } => Algorithm::Ads,
            SplitCriterion::Nonlinearity { .. } => Algorithm::Loads,
        }
    }

    /// Checks the configuration against the state and domain sizes.
    pub fn validate(&self, dimension: usize, variables: usize) -> Result<()> {
        match self {
            SplitCriterion::Truncation { tolerances } => {
                if tolerances.len() != dimension {
                    return Err(SplitError::mismatch(
                        "tolerance vector",
                        dimension,
                        tolerances.len(),
                    ));
                }
            }
            SplitCriterion::Nonlinearity { threshold, betas } => {
                if betas.len() != variables {
                    return Err(SplitError::mismatch("beta vector", variables, betas.len()));
                }
                if betas.iter().all(|b| *b == 0.0) {
                    return Err(SplitError::InvalidSetting(
                        "at least one beta must be non-zero".to_string(),
                    ));
                }
                if threshold.is_nan() {
                    return Err(SplitError::InvalidSetting(
                        "nonlinearity threshold is NaN".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// The criterion as seen by one patch: nonlinearity betas multiplied by
    /// the patch's per-axis scales. Truncation tolerances are unaffected.
    pub fn scaled(&self, scales: &[f64]) -> Result<SplitCriterion> {
        match self {
            SplitCriterion::Truncation { .. } => Ok(self.clone()),
            SplitCriterion::Nonlinearity { threshold, betas } => {
                if scales.len() != betas.len() {
                    return Err(SplitError::mismatch("beta scales", betas.len(), scales.len()));
                }
                Ok(SplitCriterion::Nonlinearity {
                    threshold: *threshold,
                    betas: betas.iter().zip(scales).map(|(b, s)| b * s).collect(),
                })
            }
        }
    }

    pub fn check(&self, state: &[Tps]) -> Result<ConditionCheck> {
        let Some(first) = state.first() else {
            return Err(SplitError::mismatch("state", 1, 0));
        };
        let variables = first.algebra().variables();
        self.validate(state.len(), variables)?;
        match self {
            SplitCriterion::Truncation { tolerances } => Ok(check_truncation(state, tolerances)),
            SplitCriterion::Nonlinearity { threshold, betas } => {
                Ok(check_nonlinearity(state, *threshold, betas))
            }
        }
    }
}

fn check_truncation(state: &[Tps], tolerances: &[f64]) -> ConditionCheck {
    let target = state[0].algebra().order() + 1;
    let mut nan_skips = 0;
    let mut worst: Option<(usize, f64)> = None;

    for (component, (series, tol)) in state.iter().zip(tolerances).enumerate() {
        let estimate = series.estimate_norm(None, target);
        if estimate.is_nan() {
            nan_skips += 1;
            warn!(component, "NaN truncation estimate ignored");
            continue;
        }
        if estimate > *tol {
            let overshoot = (estimate - tol).abs();
            if worst.map_or(true, |(_, w)| overshoot > w) {
                worst = Some((component, overshoot));
            }
        }
    }

    match worst {
        Some((component, _)) => ConditionCheck {
            exceeded: true,
            axis: Some(dominant_axis(&state[component], target)),
            nli: None,
            nan_skips,
        },
        None => ConditionCheck {
            exceeded: false,
            axis: None,
            nli: None,
            nan_skips,
        },
    }
}

fn check_nonlinearity(state: &[Tps], threshold: f64, betas: &[f64]) -> ConditionCheck {
    let rows = state.len();
    let cols = betas.len();

    // jacobian[i][j] = beta_j * d state_i / d x_j
    let jacobian: Vec<Vec<Option<Tps>>> = state
        .iter()
        .map(|series| {
            betas
                .iter()
                .enumerate()
                .map(|(axis, &beta)| (beta != 0.0).then(|| &series.deriv(axis) * beta))
                .collect()
        })
        .collect();

    let linear = DMatrix::from_fn(rows, cols, |i, j| {
        jacobian[i][j].as_ref().map_or(0.0, Tps::cons)
    });
    let nonlinear = DMatrix::from_fn(rows, cols, |i, j| {
        jacobian[i][j].as_ref().map_or(0.0, Tps::variation_bound)
    });
    let linear_norm = linear.norm();
    let nli = nonlinear.norm() / linear_norm;

    if nli.is_nan() {
        warn!(linear_norm, "NaN nonlinearity index ignored");
        return ConditionCheck {
            exceeded: false,
            axis: None,
            nli: Some(nli),
            nan_skips: 1,
        };
    }
    if nli <= threshold {
        return ConditionCheck {
            exceeded: false,
            axis: None,
            nli: Some(nli),
            nan_skips: 0,
        };
    }

    // Contribution of each axis: the Jacobian change at that axis unit point.
    let mut best: Option<(usize, f64)> = None;
    for (axis, &beta) in betas.iter().enumerate() {
        if beta == 0.0 {
            continue;
        }
        let mut unit = vec![0.0; cols];
        unit[axis] = 1.0;
        let shift = DMatrix::from_fn(rows, cols, |i, j| {
            jacobian[i][j]
                .as_ref()
                .map_or(0.0, |p| p.eval(&unit) - p.cons())
        });
        let contribution = shift.norm() / linear_norm;
        if best.map_or(true, |(_, b)| contribution > b) {
            best = Some((axis, contribution));
        }
    }

    ConditionCheck {
        exceeded: true,
        axis: best.map(|(axis, _)| axis),
        nli: Some(nli),
        nan_skips: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algebra::Algebra;
    use approx::assert_relative_eq;

    fn two_axis_state() -> Vec<Tps> {
        let algebra = Algebra::new(4, 2).expect("algebra");
        let x = algebra.variable(0).expect("x");
        let y = algebra.variable(1).expect("y");
        // Curved along y, straight along x.
        vec![&(&x * 0.2) + &(&y * 0.5).exp(), &y * 0.3]
    }

    #[test]
    fn truncation_within_tolerance_passes() {
        let criterion = SplitCriterion::truncation(vec![1.0, 1.0]);
        let check = criterion.check(&two_axis_state()).expect("check");
        assert!(!check.exceeded);
        assert_eq!(check.axis, None);
    }

    #[test]
    fn truncation_overshoot_picks_component_axis() {
        let criterion = SplitCriterion::truncation(vec![1e-12, 1e-12]);
        let check = criterion.check(&two_axis_state()).expect("check");
        assert!(check.exceeded);
        assert_eq!(check.axis, Some(1));
    }

    #[test]
    fn truncation_rejects_short_tolerance_vector() {
        let criterion = SplitCriterion::truncation(vec![1e-3]);
        let err = criterion.check(&two_axis_state()).expect_err("mismatch");
        assert_eq!(
            err,
            SplitError::DimensionMismatch {
                what: "tolerance vector",
                expected: 2,
                found: 1
            }
        );
    }

    #[test]
    fn nan_estimate_is_skipped_for_that_component_only() {
        let mut state = two_axis_state();
        state[1].set_coefficient(&[0, 2], f64::NAN).expect("coefficient");
        let check = SplitCriterion::truncation(vec![1.0, -1.0])
            .check(&state)
            .expect("check");
        assert!(!check.exceeded);
        assert_eq!(check.nan_skips, 1);

        let check = SplitCriterion::truncation(vec![1e-12, -1.0])
            .check(&state)
            .expect("check");
        assert!(check.exceeded);
        assert_eq!(check.nan_skips, 1);
    }

    #[test]
    fn linear_state_has_zero_nli() {
        let algebra = Algebra::new(3, 2).expect("algebra");
        let x = algebra.variable(0).expect("x");
        let y = algebra.variable(1).expect("y");
        let state = vec![&x + 1.0, &(&y * 2.0) - &x];
        let check = SplitCriterion::nonlinearity(0.0, 2)
            .check(&state)
            .expect("check");
        assert_eq!(check.nli, Some(0.0));
        assert!(!check.exceeded);
    }

    #[test]
    fn nli_matches_hand_computation() {
        let algebra = Algebra::new(2, 1).expect("algebra");
        let x = algebra.variable(0).expect("x");
        // d/dx (2x + 0.5x^2) = 2 + x: linear 2, nonlinear bound 1.
        let state = vec![&(&x * 2.0) + &(&(&x * &x) * 0.5)];
        let check = SplitCriterion::nonlinearity(0.1, 1)
            .check(&state)
            .expect("check");
        assert_relative_eq!(check.nli.expect("nli"), 0.5);
        assert!(check.exceeded);
        assert_eq!(check.axis, Some(0));
    }

    #[test]
    fn nli_axis_follows_curvature() {
        let check = SplitCriterion::nonlinearity(1e-6, 2)
            .check(&two_axis_state())
            .expect("check");
        assert!(check.exceeded);
        assert_eq!(check.axis, Some(1));
    }

    #[test]
    fn zero_beta_removes_axis() {
        let criterion = SplitCriterion::Nonlinearity {
            threshold: 1e-6,
            betas: vec![1.0, 0.0],
        };
        let check = criterion.check(&two_axis_state()).expect("check");
        // Only the straight x column survives.
        assert_eq!(check.nli, Some(0.0));
        assert!(!check.exceeded);
    }

    #[test]
    fn nli_with_no_linear_part_is_skipped() {
        let algebra = Algebra::new(2, 1).expect("algebra");
        let state = vec![algebra.constant(3.0)];
        let check = SplitCriterion::nonlinearity(-1.0, 1)
            .check(&state)
            .expect("check");
        assert!(!check.exceeded);
        assert_eq!(check.nan_skips, 1);
    }

    #[test]
    fn scaling_multiplies_betas_only() {
        let criterion = SplitCriterion::Nonlinearity {
            threshold: 0.1,
            betas: vec![2.0, 1.0],
        };
        let scaled = criterion.scaled(&[1.0 / 3.0, 1.0]).expect("scaled");
        let SplitCriterion::Nonlinearity { threshold, betas } = scaled else {
            panic!("criterion kind changed");
        };
        assert_eq!(threshold, 0.1);
        assert_relative_eq!(betas[0], 2.0 / 3.0);
        assert_eq!(betas[1], 1.0);
        assert!(matches!(
            criterion.scaled(&[1.0]),
            Err(SplitError::DimensionMismatch { what: "beta scales", .. })
        ));

        let truncation = SplitCriterion::truncation(vec![1e-3]);
        assert_eq!(truncation.scaled(&[0.5, 0.5]).expect("scaled"), truncation);
    }

    #[test]
    fn beta_vector_must_match_variables() {
        let criterion = SplitCriterion::Nonlinearity {
            threshold: 0.1,
            betas: vec![1.0],
        };
        assert!(matches!(
            criterion.validate(2, 2),
            Err(SplitError::DimensionMismatch { what: "beta vector", .. })
        ));
        let criterion = SplitCriterion::Nonlinearity {
            threshold: 0.1,
            betas: vec![0.0, 0.0],
        };
        assert!(matches!(
            criterion.validate(2, 2),
            Err(SplitError::InvalidSetting(_))
        ));
    }
}
