//! Ancestry of a patch inside the normalized root box `[-1, 1]^n`.
//!
//! Each entry records one split: `-(a + 1)` is the lower child along axis `a`,
//! `a + 1` the upper child, and `(a + 1) * 100` the middle child of a
//! trisection. Box geometry is recovered by folding over the entries.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::algebra::{Algebra, Tps};
use crate::error::{Result, SplitError};
use crate::settings::Algorithm;

const MIDDLE_MARKER: i32 = 100;

/// Which part of the parent box a child occupies along the split axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Lower,
    Middle,
    Upper,
}

impl Side {
    pub fn sign(self) -> f64 {
        match self {
            Side::Lower => -1.0,
            Side::Middle => 0.0,
            Side::Upper => 1.0,
        }
    }

    /// Children of a split in ascending position along the axis.
    pub fn for_algorithm(algorithm: Algorithm) -> &'static [Side] {
        match algorithm {
            Algorithm::Ads => &[Side::Lower, Side::Upper],
            Algorithm::Loads => &[Side::Lower, Side::Middle, Side::Upper],
        }
    }

    fn encode(self, axis: usize) -> i32 {
        let dir = axis as i32 + 1;
        match self {
            Side::Lower => -dir,
            Side::Middle => dir * MIDDLE_MARKER,
            Side::Upper => dir,
        }
    }

    fn decode(entry: i32) -> (usize, Side) {
        if entry < 0 {
            ((-entry - 1) as usize, Side::Lower)
        } else if entry < MIDDLE_MARKER {
            ((entry - 1) as usize, Side::Upper)
        } else {
            ((entry / MIDDLE_MARKER - 1) as usize, Side::Middle)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitPath {
    entries: Vec<i32>,
    variables: usize,
    algorithm: Algorithm,
}

impl SplitPath {
    /// Path of the unsplit root box.
    pub fn root(variables: usize, algorithm: Algorithm) -> Result<Self> {
        if variables == 0 || variables as i32 >= MIDDLE_MARKER {
            return Err(SplitError::InvalidSetting(format!(
                "split paths support 1..{} variables, got {variables}",
                MIDDLE_MARKER - 1
            )));
        }
        Ok(Self {
            entries: Vec::new(),
            variables,
            algorithm,
        })
    }

    pub fn entries(&self) -> &[i32] {
        &self.entries
    }

    pub fn variables(&self) -> usize {
        self.variables
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Total number of splits.
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Number of splits along `axis`.
    pub fn count_axis(&self, axis: usize) -> usize {
        self.steps().filter(|(a, _)| *a == axis).count()
    }

    /// Records one more split in place.
    pub fn append(&mut self, axis: usize, side: Side) -> Result<()> {
        if axis >= self.variables {
            return Err(SplitError::InvalidSetting(format!(
                "split axis {axis} outside {} variables",
                self.variables
            )));
        }
        if side == Side::Middle && self.algorithm == Algorithm::Ads {
            return Err(SplitError::InvalidSetting(
                "bisection has no middle child".to_string(),
            ));
        }
        self.entries.push(side.encode(axis));
        Ok(())
    }

    /// A copy of this path extended by one split.
    pub fn child(&self, axis: usize, side: Side) -> Result<Self> {
        let mut out = self.clone();
        out.append(axis, side)?;
        Ok(out)
    }

    /// Decoded `(axis, side)` pairs from the root down.
    pub fn steps(&self) -> impl Iterator<Item = (usize, Side)> + '_ {
        self.entries.iter().map(|&e| Side::decode(e))
    }

    pub fn center(&self) -> Vec<f64> {
        self.geometry().0
    }

    pub fn width(&self) -> Vec<f64> {
        self.geometry().1
    }

    fn geometry(&self) -> (Vec<f64>, Vec<f64>) {
        let mut center = vec![0.0; self.variables];
        let mut width = vec![2.0; self.variables];
        let scale = self.algorithm.scale();
        let offset = self.algorithm.offset();
        for (axis, side) in self.steps() {
            center[axis] += side.sign() * offset * 0.5 * width[axis];
            width[axis] *= scale;
        }
        (center, width)
    }

    /// Whether `point` (root-normalized) lies in the closed box of this path.
    pub fn contains(&self, point: &[f64]) -> Result<bool> {
        if point.len() != self.variables {
            return Err(SplitError::mismatch(
                "point coordinates",
                self.variables,
                point.len(),
            ));
        }
        let (center, width) = self.geometry();
        Ok(point
            .iter()
            .zip(center.iter().zip(&width))
            .all(|(x, (c, w))| (x - c).abs() <= 0.5 * w))
    }

    /// Maps a root-normalized point into this box's local `[-1, 1]` frame.
    pub fn local_coordinates(&self, point: &[f64]) -> Result<Vec<f64>> {
        if point.len() != self.variables {
            return Err(SplitError::mismatch(
                "point coordinates",
                self.variables,
                point.len(),
            ));
        }
        let (center, width) = self.geometry();
        Ok(point
            .iter()
            .zip(center.iter().zip(&width))
            .map(|(x, (c, w))| 2.0 * (x - c) / w)
            .collect())
    }

    /// Restricts a quantity expanded over the root box to this box.
    pub fn replay(&self, series: &[Tps]) -> Result<Vec<Tps>> {
        let mut current = series.to_vec();
        let Some(first) = series.first() else {
            return Ok(current);
        };
        let algebra = Arc::clone(first.algebra());
        for (axis, side) in self.steps() {
            let substitution = restriction(&algebra, self.algorithm, axis, side)?;
            current = current.iter().map(|s| s.compose(&substitution)).collect();
        }
        Ok(current)
    }
}

/// Identity map with `axis` replaced by the affine map onto one child.
pub(crate) fn restriction(
    algebra: &Arc<Algebra>,
    algorithm: Algorithm,
    axis: usize,
    side: Side,
) -> Result<Vec<Tps>> {
    let mut substitution = algebra.identity();
    let variable = algebra.variable(axis)?;
    substitution[axis] = &(&variable * algorithm.scale()) + side.sign() * algorithm.offset();
    Ok(substitution)
}

impl fmt::Display for SplitPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (idx, entry) in self.entries.iter().enumerate() {
            if idx > 0 {
                write!(f, " ")?;
            }
            write!(f, "{entry}")?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn ads_path(variables: usize, splits: &[(usize, Side)]) -> SplitPath {
        let mut path = SplitPath::root(variables, Algorithm::Ads).expect("root");
        for &(axis, side) in splits {
            path.append(axis, side).expect("append");
        }
        path
    }

    #[test]
    fn root_box_is_unit_cube() {
        let path = SplitPath::root(3, Algorithm::Ads).expect("root");
        assert_eq!(path.center(), vec![0.0; 3]);
        assert_eq!(path.width(), vec![2.0; 3]);
        assert_eq!(path.count(), 0);
    }

    #[test]
    fn bisections_fold_into_center_and_width() {
        let path = ads_path(2, &[(0, Side::Upper), (0, Side::Lower), (1, Side::Lower)]);
        assert_eq!(path.entries(), &[1, -1, -2]);
        let center = path.center();
        let width = path.width();
        assert_relative_eq!(center[0], 0.25);
        assert_relative_eq!(width[0], 0.5);
        assert_relative_eq!(center[1], -0.5);
        assert_relative_eq!(width[1], 1.0);
        assert_eq!(path.count_axis(0), 2);
        assert_eq!(path.count_axis(1), 1);
    }

    #[test]
    fn geometry_is_a_pure_function_of_entries() {
        let path = ads_path(2, &[(1, Side::Upper), (0, Side::Lower)]);
        let copy = SplitPath::root(2, Algorithm::Ads)
            .and_then(|p| p.child(1, Side::Upper))
            .and_then(|p| p.child(0, Side::Lower))
            .expect("path");
        assert_eq!(path.center(), copy.center());
        assert_eq!(path.width(), path.width());
        assert_eq!(path.center(), path.center());
    }

    #[test]
    fn trisection_marks_middle_child() {
        let mut path = SplitPath::root(2, Algorithm::Loads).expect("root");
        path.append(1, Side::Middle).expect("middle");
        path.append(1, Side::Upper).expect("upper");
        assert_eq!(path.entries(), &[200, 2]);
        let center = path.center();
        let width = path.width();
        assert_relative_eq!(center[1], 2.0 / 9.0);
        assert_relative_eq!(width[1], 2.0 / 9.0);
        assert_eq!(path.count_axis(1), 2);
    }

    #[test]
    fn bisection_rejects_middle_child() {
        let mut path = SplitPath::root(1, Algorithm::Ads).expect("root");
        assert!(path.append(0, Side::Middle).is_err());
        assert!(path.append(1, Side::Upper).is_err());
    }

    #[test]
    fn contains_matches_half_width_rule() {
        let path = ads_path(2, &[(0, Side::Upper), (1, Side::Lower)]);
        let center = path.center();
        let width = path.width();
        let samples = [
            [0.5, -0.5],
            [0.0, 0.0],
            [1.0, -1.0],
            [0.99, 0.01],
            [-0.1, -0.7],
            [0.3, -0.999],
        ];
        for point in samples {
            let expected = (0..2).all(|a| (point[a] - center[a]).abs() <= width[a] / 2.0);
            assert_eq!(path.contains(&point).expect("contains"), expected, "{point:?}");
        }
    }

    #[test]
    fn contains_rejects_wrong_dimension() {
        let path = SplitPath::root(2, Algorithm::Ads).expect("root");
        let err = path.contains(&[0.0]).expect_err("dimension");
        assert_eq!(
            err,
            SplitError::DimensionMismatch {
                what: "point coordinates",
                expected: 2,
                found: 1
            }
        );
        assert!(path.contains(&[0.0, 0.0, 0.0]).is_err());
    }

    #[test]
    fn local_coordinates_map_box_corners_to_unit_cube() {
        let path = ads_path(1, &[(0, Side::Lower), (0, Side::Upper)]);
        // Box is [-0.5, 0].
        assert_relative_eq!(path.local_coordinates(&[-0.5]).expect("local")[0], -1.0);
        assert_relative_eq!(path.local_coordinates(&[0.0]).expect("local")[0], 1.0);
    }

    #[test]
    fn replay_restricts_root_quantity() {
        let algebra = Algebra::new(3, 1).expect("algebra");
        let x = algebra.variable(0).expect("x");
        let cubic = &(&x * &x) * &x;
        let path = ads_path(1, &[(0, Side::Upper), (0, Side::Lower)]);
        let local = path.replay(&[cubic.clone()]).expect("replay");
        // Local -1 and 1 are root 0.0 and 0.5.
        assert_relative_eq!(local[0].eval(&[-1.0]), 0.0, epsilon = 1e-15);
        assert_relative_eq!(local[0].eval(&[1.0]), 0.125, epsilon = 1e-15);
        assert_relative_eq!(local[0].eval(&[0.0]), cubic.eval(&[0.25]), epsilon = 1e-15);
    }

    #[test]
    fn display_lists_entries() {
        let path = ads_path(2, &[(0, Side::Upper), (1, Side::Lower)]);
        assert_eq!(path.to_string(), "[1 -2]");
    }
}
