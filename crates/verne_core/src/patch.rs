use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::algebra::Tps;
use crate::error::{Result, SplitError};
use crate::settings::Algorithm;
use crate::split_path::{restriction, Side, SplitPath};

/// Time and nonlinearity index of an ancestor when it was split.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub time: f64,
    pub nli: f64,
}

/// Axis with the strictly largest truncation estimate of order `target`;
/// ties and NaN estimates keep the earlier axis.
pub(crate) fn dominant_axis(series: &Tps, target: usize) -> usize {
    let mut best = (0, f64::NEG_INFINITY);
    for axis in 0..series.algebra().variables() {
        let norm = series.estimate_norm(Some(axis), target);
        if norm > best.1 {
            best = (axis, norm);
        }
    }
    best.0
}

/// One box of the partition together with its local state expansion.
#[derive(Debug, Clone)]
pub struct Patch {
    state: Vec<Tps>,
    path: SplitPath,
    birth_time: f64,
    last_split_time: f64,
    nli: f64,
    history: Vec<HistoryEntry>,
    betas: Vec<f64>,
}

impl Patch {
    /// Unsplit patch covering the whole root box.
    pub fn seed(state: Vec<Tps>, algorithm: Algorithm, birth_time: f64) -> Result<Self> {
        let Some(first) = state.first() else {
            return Err(SplitError::mismatch("seed state", 1, 0));
        };
        if let Some(idx) = state
            .iter()
            .position(|s| !Arc::ptr_eq(s.algebra(), first.algebra()))
        {
            return Err(SplitError::InvalidSetting(format!(
                "state component {idx} belongs to a different algebra"
            )));
        }
        let variables = first.algebra().variables();
        let path = SplitPath::root(variables, algorithm)?;
        Ok(Self {
            state,
            path,
            birth_time,
            last_split_time: birth_time,
            nli: 0.0,
            history: Vec::new(),
            betas: vec![1.0; variables],
        })
    }

    /// Same box and ancestry, state advanced to `time`.
    pub(crate) fn advanced(&self, state: Vec<Tps>, time: f64) -> Self {
        Self {
            state,
            path: self.path.clone(),
            birth_time: time,
            last_split_time: self.last_split_time,
            nli: self.nli,
            history: self.history.clone(),
            betas: self.betas.clone(),
        }
    }

    pub fn state(&self) -> &[Tps] {
        &self.state
    }

    pub fn path(&self) -> &SplitPath {
        &self.path
    }

    pub fn algorithm(&self) -> Algorithm {
        self.path.algorithm()
    }

    /// Time at which `state` is valid.
    pub fn birth_time(&self) -> f64 {
        self.birth_time
    }

    pub fn last_split_time(&self) -> f64 {
        self.last_split_time
    }

    pub fn nli(&self) -> f64 {
        self.nli
    }

    pub(crate) fn set_nli(&mut self, nli: f64) {
        self.nli = nli;
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    /// Per-axis sensitivity relative to the nonlinearity criterion's betas.
    /// Every trisection along an axis divides its entry by 3.
    pub fn betas(&self) -> &[f64] {
        &self.betas
    }

    /// Number of state components.
    pub fn len(&self) -> usize {
        self.state.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }

    fn next_order(&self) -> usize {
        self.state
            .first()
            .map(|s| s.algebra().order() + 1)
            .unwrap_or(1)
    }

    /// Estimated size of the first dropped order, per state component.
    pub fn truncation_errors(&self) -> Vec<f64> {
        let target = self.next_order();
        self.state
            .iter()
            .map(|s| s.estimate_norm(None, target))
            .collect()
    }

    /// Axis along which `component` carries the largest truncation estimate.
    pub fn splitting_direction(&self, component: usize) -> Result<usize> {
        let series = self.state.get(component).ok_or_else(|| {
            SplitError::InvalidSetting(format!(
                "component {component} outside state of size {}",
                self.state.len()
            ))
        })?;
        Ok(dominant_axis(series, self.next_order()))
    }

    /// Splits along `axis`, or along the dominant axis of the component with
    /// the largest truncation error when `axis` is `None`.
    pub fn split(&self, axis: Option<usize>) -> Result<Vec<Patch>> {
        let base = self
            .state
            .first()
            .map(|s| s.algebra().identity())
            .unwrap_or_default();
        self.split_with(axis, &base)
    }

    /// Like [`Patch::split`], composing each child with `base` where only the
    /// split axis is replaced by the child's affine restriction.
    pub fn split_with(&self, axis: Option<usize>, base: &[Tps]) -> Result<Vec<Patch>> {
        let Some(first) = self.state.first() else {
            return Err(SplitError::mismatch("patch state", 1, 0));
        };
        let algebra = first.algebra();
        if base.len() != algebra.variables() {
            return Err(SplitError::mismatch(
                "split restriction",
                algebra.variables(),
                base.len(),
            ));
        }

        let axis = match axis {
            Some(axis) => axis,
            None => {
                let errors = self.truncation_errors();
                let mut worst = (0, f64::NEG_INFINITY);
                for (idx, err) in errors.iter().enumerate() {
                    if *err > worst.1 {
                        worst = (idx, *err);
                    }
                }
                self.splitting_direction(worst.0)?
            }
        };

        let algorithm = self.algorithm();
        let mut inherited = self.history.clone();
        inherited.push(HistoryEntry {
            time: self.birth_time,
            nli: self.nli,
        });

        let mut betas = self.betas.clone();
        if let (Algorithm::Loads, Some(beta)) = (algorithm, betas.get_mut(axis)) {
            *beta /= 3.0;
        }

        let mut children = Vec::with_capacity(algorithm.children());
        for &side in Side::for_algorithm(algorithm) {
            let path = self.path.child(axis, side)?;
            let mut substitution = base.to_vec();
            substitution[axis] = restriction(algebra, algorithm, axis, side)?.swap_remove(axis);
            let state = self.state.iter().map(|s| s.compose(&substitution)).collect();
            children.push(Patch {
                state,
                path,
                birth_time: self.birth_time,
                last_split_time: self.birth_time,
                nli: self.nli,
                history: inherited.clone(),
                betas: betas.clone(),
            });
        }
        Ok(children)
    }

    /// Evaluates the expansion at a point of the local `[-1, 1]` frame.
    pub fn eval(&self, local: &[f64]) -> Result<Vec<f64>> {
        if local.len() != self.path.variables() {
            return Err(SplitError::mismatch(
                "point coordinates",
                self.path.variables(),
                local.len(),
            ));
        }
        Ok(self.state.iter().map(|s| s.eval(local)).collect())
    }

    /// Value at the local origin, i.e. the image of the box center.
    pub fn center_value(&self) -> Vec<f64> {
        self.state.iter().map(Tps::cons).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algebra::Algebra;
    use crate::criteria::SplitCriterion;
    use approx::assert_relative_eq;

    fn quadratic_patch(algorithm: Algorithm) -> Patch {
        let algebra = Algebra::new(4, 2).expect("algebra");
        let x = algebra.variable(0).expect("x");
        let y = algebra.variable(1).expect("y");
        // Strongly nonlinear in x, nearly linear in y.
        let first = &(&x * &x).exp() + &(&y * 0.01);
        let second = &y + 1.0;
        Patch::seed(vec![first, second], algorithm, 0.0).expect("seed")
    }

    #[test]
    fn seed_starts_at_root() {
        let patch = quadratic_patch(Algorithm::Ads);
        assert_eq!(patch.path().count(), 0);
        assert_eq!(patch.len(), 2);
        assert!(patch.history().is_empty());
    }

    #[test]
    fn empty_seed_is_rejected() {
        assert!(matches!(
            Patch::seed(Vec::new(), Algorithm::Ads, 0.0),
            Err(SplitError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn truncation_error_flags_nonlinear_component() {
        let patch = quadratic_patch(Algorithm::Ads);
        let errors = patch.truncation_errors();
        assert!(errors[0] > 0.0);
        assert_eq!(errors[1], 0.0);
    }

    #[test]
    fn splitting_direction_follows_nonlinearity() {
        let algebra = Algebra::new(4, 2).expect("algebra");
        let x = algebra.variable(0).expect("x");
        let y = algebra.variable(1).expect("y");
        let state = vec![&(&y * 0.5).exp() + &(&x * 0.1)];
        let patch = Patch::seed(state, Algorithm::Ads, 0.0).expect("seed");
        assert_eq!(patch.splitting_direction(0).expect("direction"), 1);
        assert!(patch.splitting_direction(3).is_err());
    }

    #[test]
    fn splitting_direction_ties_keep_first_axis() {
        let algebra = Algebra::new(3, 3).expect("algebra");
        let patch = Patch::seed(vec![algebra.constant(1.0)], Algorithm::Ads, 0.0).expect("seed");
        assert_eq!(patch.splitting_direction(0).expect("direction"), 0);
    }

    #[test]
    fn bisection_children_reproduce_parent() {
        let patch = quadratic_patch(Algorithm::Ads);
        let children = patch.split(Some(0)).expect("split");
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].path().entries(), &[-1]);
        assert_eq!(children[1].path().entries(), &[1]);

        // Child-local 0 is the parent point -0.5 / +0.5 along x.
        let lower = children[0].eval(&[0.0, 0.3]).expect("eval");
        let parent = patch.eval(&[-0.5, 0.3]).expect("eval");
        assert_relative_eq!(lower[0], parent[0], epsilon = 1e-12);
        let upper = children[1].eval(&[1.0, -0.2]).expect("eval");
        let parent = patch.eval(&[1.0, -0.2]).expect("eval");
        assert_relative_eq!(upper[1], parent[1], epsilon = 1e-12);
        assert_eq!(patch.path().count(), 0);
    }

    #[test]
    fn trisection_adds_middle_child() {
        let patch = quadratic_patch(Algorithm::Loads);
        let children = patch.split(Some(1)).expect("split");
        let entries: Vec<&[i32]> = children.iter().map(|c| c.path().entries()).collect();
        assert_eq!(entries, vec![&[-2][..], &[200][..], &[2][..]]);
        let middle = children[1].eval(&[0.2, 1.0]).expect("eval");
        let parent = patch.eval(&[0.2, 1.0 / 3.0]).expect("eval");
        assert_relative_eq!(middle[0], parent[0], epsilon = 1e-12);
        assert_relative_eq!(middle[1], parent[1], epsilon = 1e-12);
    }

    #[test]
    fn automatic_split_picks_worst_component_axis() {
        let patch = quadratic_patch(Algorithm::Ads);
        let children = patch.split(None).expect("split");
        assert_eq!(children[0].path().entries(), &[-1]);
    }

    #[test]
    fn children_inherit_history() {
        let mut patch = quadratic_patch(Algorithm::Loads);
        patch.set_nli(0.25);
        let moved = patch.advanced(patch.state().to_vec(), 3.0);
        let children = moved.split(Some(0)).expect("split");
        for child in &children {
            assert_eq!(child.birth_time(), 3.0);
            assert_eq!(child.last_split_time(), 3.0);
            assert_eq!(child.history(), &[HistoryEntry { time: 3.0, nli: 0.25 }]);
        }
        let grandchildren = children[0].split(Some(1)).expect("split");
        assert_eq!(grandchildren[2].history().len(), 2);
        assert_eq!(grandchildren[2].path().count(), 2);
    }

    #[test]
    fn trisection_scales_split_axis_beta() {
        let patch = quadratic_patch(Algorithm::Loads);
        assert_eq!(patch.betas(), &[1.0, 1.0]);
        let children = patch.split(Some(0)).expect("split");
        for child in &children {
            assert_relative_eq!(child.betas()[0], 1.0 / 3.0);
            assert_eq!(child.betas()[1], 1.0);
        }
        let grandchildren = children[1].split(Some(0)).expect("split");
        assert_relative_eq!(grandchildren[2].betas()[0], 1.0 / 9.0);

        let halves = quadratic_patch(Algorithm::Ads).split(Some(0)).expect("split");
        assert_eq!(halves[0].betas(), &[1.0, 1.0]);
    }

    #[test]
    fn child_nli_uses_scaled_betas() {
        let algebra = Algebra::new(3, 2).expect("algebra");
        let x = algebra.variable(0).expect("x");
        let y = algebra.variable(1).expect("y");
        let state = vec![&x + &(&(&y * &y) * 0.5), y.clone()];
        let patch = Patch::seed(state, Algorithm::Loads, 0.0).expect("seed");
        let children = patch.split(Some(0)).expect("split");
        let middle = &children[1];

        // Column 0 of the middle child: d/dx (x/3) = 1/3, weighted by beta 1/3.
        let criterion = SplitCriterion::nonlinearity(10.0, 2);
        let scaled = criterion.scaled(middle.betas()).expect("scaled");
        let nli = scaled.check(middle.state()).expect("check").nli.expect("nli");
        assert_relative_eq!(nli, 1.0 / (1.0 + 1.0 / 81.0_f64).sqrt(), epsilon = 1e-12);

        let root_weighted = criterion.check(middle.state()).expect("check").nli.expect("nli");
        assert_relative_eq!(root_weighted, 1.0 / (1.0 + 1.0 / 9.0_f64).sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn seed_rejects_components_from_different_algebras() {
        let first = Algebra::new(4, 1).expect("algebra").variable(0).expect("x");
        let second = Algebra::new(4, 1).expect("algebra").variable(0).expect("x");
        let err = Patch::seed(vec![first, second], Algorithm::Ads, 0.0).expect_err("algebra");
        assert!(matches!(err, SplitError::InvalidSetting(_)));
        assert!(err.to_string().contains("component 1"));
    }

    #[test]
    fn split_with_rejects_short_restriction() {
        let patch = quadratic_patch(Algorithm::Ads);
        let err = patch.split_with(Some(0), &[]).expect_err("mismatch");
        assert!(matches!(err, SplitError::DimensionMismatch { expected: 2, found: 0, .. }));
    }

    #[test]
    fn eval_checks_point_length() {
        let patch = quadratic_patch(Algorithm::Ads);
        assert!(patch.eval(&[0.0]).is_err());
        assert_eq!(patch.center_value(), patch.eval(&[0.0, 0.0]).expect("eval"));
    }
}
