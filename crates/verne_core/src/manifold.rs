//! The worklist of patches and the domain-splitting pass that drains it.

use std::collections::vec_deque;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::algebra::Tps;
use crate::criteria::ConditionCheck;
use crate::error::{Result, SplitError};
use crate::integrator::{Integrator, Outcome};
use crate::patch::{HistoryEntry, Patch};
use crate::settings::{Algorithm, SplitSettings};
use crate::split_path::SplitPath;
use crate::traits::VectorField;

/// Counters collected over one splitting pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitStats {
    pub pops: usize,
    pub splits: usize,
    pub accepted: usize,
    pub interruptions: usize,
    pub nan_skips: usize,
}

/// Pending and accepted boxes as seen right before a pop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvolutionSnapshot {
    pub pending: Vec<SplitPath>,
    pub accepted: Vec<SplitPath>,
}

/// Result of a splitting pass.
#[derive(Debug, Clone)]
pub struct SplitPass {
    pub manifold: Manifold,
    pub stats: SplitStats,
    /// Empty unless `SplitSettings::record_evolution` is set.
    pub evolution: Vec<EvolutionSnapshot>,
}

/// Flat, serializable view of an accepted patch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchReport {
    pub path: Vec<i32>,
    pub center: Vec<f64>,
    pub width: Vec<f64>,
    pub birth_time: f64,
    pub last_split_time: f64,
    pub nli: f64,
    pub betas: Vec<f64>,
    pub center_value: Vec<f64>,
    pub history: Vec<HistoryEntry>,
}

enum Fate {
    Accepted(Patch),
    Split(Vec<Patch>),
}

struct Advance {
    fate: Fate,
    interrupted: bool,
    nan_skips: usize,
}

/// Integrates one patch to the end time or to the first criterion failure,
/// then either accepts it or splits it.
fn advance<F: VectorField>(
    patch: &Patch,
    integrator: &Integrator<F>,
    settings: &SplitSettings,
) -> Result<Advance> {
    if patch.algorithm() != settings.algorithm() {
        return Err(SplitError::AlgorithmMismatch {
            expected: settings.algorithm(),
            found: patch.algorithm(),
        });
    }
    settings
        .criterion
        .validate(patch.len(), patch.path().variables())?;
    let criterion = settings.criterion.scaled(patch.betas())?;

    let may_split = patch.path().count() < settings.max_split;
    let integration = integrator.integrate(
        patch.state(),
        patch.birth_time(),
        may_split.then_some(&criterion),
    )?;
    let mut nan_skips = integration.nan_skips;
    let interrupted = integration.interruption().is_some();
    let mut current = patch.advanced(integration.state, integration.time);

    let check: ConditionCheck = match (integration.outcome, integration.last_check) {
        (Outcome::Interrupted(check), _) => check,
        (Outcome::Completed, Some(check)) => check,
        (Outcome::Completed, None) => {
            let check = criterion.check(current.state())?;
            nan_skips += check.nan_skips;
            check
        }
    };
    if let Some(nli) = check.nli {
        current.set_nli(nli);
    }

    let fate = if check.exceeded && may_split {
        let children = current.split(check.axis)?;
        debug!(
            axis = ?check.axis,
            children = children.len(),
            time = current.birth_time(),
            path = %current.path(),
            "patch split"
        );
        Fate::Split(children)
    } else {
        Fate::Accepted(current)
    };

    Ok(Advance {
        fate,
        interrupted,
        nan_skips,
    })
}

/// Ordered collection of patches. Before a pass it is the worklist seed,
/// after a pass it holds the accepted leaves.
#[derive(Debug, Clone, Default)]
pub struct Manifold {
    patches: VecDeque<Patch>,
}

impl Manifold {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single-patch manifold over the whole root box.
    pub fn from_state(state: Vec<Tps>, algorithm: Algorithm, birth_time: f64) -> Result<Self> {
        let patch = Patch::seed(state, algorithm, birth_time)?;
        Ok(Self::from(patch))
    }

    pub fn push_front(&mut self, patch: Patch) {
        self.patches.push_front(patch);
    }

    pub fn push_back(&mut self, patch: Patch) {
        self.patches.push_back(patch);
    }

    pub fn pop_front(&mut self) -> Option<Patch> {
        self.patches.pop_front()
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    pub fn iter(&self) -> vec_deque::Iter<'_, Patch> {
        self.patches.iter()
    }

    pub fn get(&self, index: usize) -> Option<&Patch> {
        self.patches.get(index)
    }

    /// Number of domain variables, taken from the first patch.
    pub fn variables(&self) -> Option<usize> {
        self.patches.front().map(|p| p.path().variables())
    }

    /// Splits every patch until each satisfies the criterion or reaches the
    /// split limit. The seed manifold is left untouched.
    pub fn split_domain<F: VectorField>(
        &self,
        integrator: &Integrator<F>,
        settings: &SplitSettings,
    ) -> Result<Manifold> {
        let stop = AtomicBool::new(false);
        Ok(self.split_domain_until(integrator, settings, &stop)?.manifold)
    }

    /// Sequential pass that checks `stop` at every pop.
    pub fn split_domain_until<F: VectorField>(
        &self,
        integrator: &Integrator<F>,
        settings: &SplitSettings,
        stop: &AtomicBool,
    ) -> Result<SplitPass> {
        let mut queue = self.patches.clone();
        let mut accepted = Manifold::new();
        let mut stats = SplitStats::default();
        let mut evolution = Vec::new();

        while let Some(patch) = queue.pop_front() {
            if stop.load(Ordering::Relaxed) {
                let pending = queue.len() + 1;
                info!(pending, accepted = accepted.len(), "splitting pass cancelled");
                return Err(SplitError::Cancelled { pending });
            }
            if settings.record_evolution {
                evolution.push(EvolutionSnapshot {
                    pending: std::iter::once(&patch)
                        .chain(queue.iter())
                        .map(|p| p.path().clone())
                        .collect(),
                    accepted: accepted.iter().map(|p| p.path().clone()).collect(),
                });
            }
            stats.pops += 1;
            debug!(
                queue = queue.len(),
                depth = patch.path().count(),
                birth_time = patch.birth_time(),
                "patch popped"
            );

            let step = advance(&patch, integrator, settings)?;
            stats.nan_skips += step.nan_skips;
            stats.interruptions += usize::from(step.interrupted);
            match step.fate {
                Fate::Accepted(patch) => accepted.push_back(patch),
                Fate::Split(children) => {
                    stats.splits += 1;
                    queue.extend(children);
                }
            }
        }

        stats.accepted = accepted.len();
        info!(
            accepted = stats.accepted,
            pops = stats.pops,
            splits = stats.splits,
            nan_skips = stats.nan_skips,
            "splitting pass finished"
        );
        Ok(SplitPass {
            manifold: accepted,
            stats,
            evolution,
        })
    }

    /// Same accepted set as [`Manifold::split_domain`], computed in waves:
    /// every pending patch of a wave is advanced in parallel and their
    /// children form the next wave.
    pub fn split_domain_parallel<F>(
        &self,
        integrator: &Integrator<F>,
        settings: &SplitSettings,
    ) -> Result<SplitPass>
    where
        F: VectorField + Sync,
    {
        let mut wave: Vec<Patch> = self.patches.iter().cloned().collect();
        let mut accepted = Manifold::new();
        let mut stats = SplitStats::default();
        let mut evolution = Vec::new();

        while !wave.is_empty() {
            if settings.record_evolution {
                evolution.push(EvolutionSnapshot {
                    pending: wave.iter().map(|p| p.path().clone()).collect(),
                    accepted: accepted.iter().map(|p| p.path().clone()).collect(),
                });
            }
            stats.pops += wave.len();
            debug!(wave = wave.len(), accepted = accepted.len(), "advancing wave");

            let steps = wave
                .par_iter()
                .map(|patch| advance(patch, integrator, settings))
                .collect::<Result<Vec<_>>>()?;

            let mut next = Vec::new();
            for step in steps {
                stats.nan_skips += step.nan_skips;
                stats.interruptions += usize::from(step.interrupted);
                match step.fate {
                    Fate::Accepted(patch) => accepted.push_back(patch),
                    Fate::Split(children) => {
                        stats.splits += 1;
                        next.extend(children);
                    }
                }
            }
            wave = next;
        }

        stats.accepted = accepted.len();
        info!(
            accepted = stats.accepted,
            pops = stats.pops,
            splits = stats.splits,
            nan_skips = stats.nan_skips,
            "parallel splitting pass finished"
        );
        Ok(SplitPass {
            manifold: accepted,
            stats,
            evolution,
        })
    }

    /// Image of every box center.
    pub fn center_values(&self) -> Vec<Vec<f64>> {
        self.patches.iter().map(Patch::center_value).collect()
    }

    /// Image of each box perimeter in the first two axes, other axes held at
    /// the box center. Edges are visited X right, Y down, X left, Y up with
    /// `resolution` samples each, starting from the local corner `(-1, 1)`.
    pub fn wall_values(&self, resolution: usize) -> Result<Vec<Vec<Vec<f64>>>> {
        let Some(variables) = self.variables() else {
            return Err(SplitError::EmptyManifold);
        };
        if variables < 2 {
            return Err(SplitError::InvalidSetting(
                "wall evaluation needs at least two variables".to_string(),
            ));
        }
        if resolution < 2 {
            return Err(SplitError::InvalidSetting(format!(
                "wall resolution must be at least 2, got {resolution}"
            )));
        }

        let points = wall_points(variables, resolution);
        self.patches
            .iter()
            .map(|patch| points.iter().map(|p| patch.eval(p)).collect())
            .collect()
    }

    /// Evaluates the manifold at a root-normalized point. Points outside the
    /// root box are extrapolated from the patch with the nearest center.
    pub fn evaluate_at(&self, point: &[f64]) -> Result<Vec<f64>> {
        let Some(variables) = self.variables() else {
            return Err(SplitError::EmptyManifold);
        };
        if point.len() != variables {
            return Err(SplitError::mismatch(
                "point coordinates",
                variables,
                point.len(),
            ));
        }

        for patch in &self.patches {
            if patch.path().contains(point)? {
                let local = patch.path().local_coordinates(point)?;
                return patch.eval(&local);
            }
        }

        if point.iter().all(|x| x.abs() <= 1.0) {
            return Err(SplitError::PointNotCovered(point.to_vec()));
        }
        warn!(?point, "point outside root box, using nearest patch");
        let nearest = self
            .patches
            .iter()
            .map(|patch| {
                let distance: f64 = patch
                    .path()
                    .center()
                    .iter()
                    .zip(point)
                    .map(|(c, x)| (c - x) * (c - x))
                    .sum();
                (distance, patch)
            })
            .min_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, patch)| patch)
            .ok_or(SplitError::EmptyManifold)?;
        let local = nearest.path().local_coordinates(point)?;
        nearest.eval(&local)
    }

    /// Evaluates at a physical `deviation` from the center of the initial set
    /// `seed`. Each coordinate is normalized by the seed's half-width along
    /// the matching axis; axes with zero width map to the box center.
    pub fn evaluate_deviation(&self, seed: &[Tps], deviation: &[f64]) -> Result<Vec<f64>> {
        let Some(variables) = self.variables() else {
            return Err(SplitError::EmptyManifold);
        };
        if seed.len() < variables {
            return Err(SplitError::mismatch("initial set", variables, seed.len()));
        }
        if deviation.len() != variables {
            return Err(SplitError::mismatch(
                "deviation coordinates",
                variables,
                deviation.len(),
            ));
        }

        let corner = vec![1.0; variables];
        let point: Vec<f64> = seed
            .iter()
            .zip(deviation)
            .map(|(series, dx)| {
                let half_width = (series.eval(&corner) - series.cons()).abs();
                if half_width != 0.0 {
                    dx / half_width
                } else {
                    0.0
                }
            })
            .collect();
        self.evaluate_at(&point)
    }

    /// Restricts a root-box quantity (typically the initial state) to every
    /// accepted box, recovering the initial split domain.
    pub fn initial_domain(&self, seed: &[Tps]) -> Result<Vec<Vec<Tps>>> {
        self.patches.iter().map(|p| p.path().replay(seed)).collect()
    }

    pub fn report(&self) -> Vec<PatchReport> {
        self.patches
            .iter()
            .map(|patch| PatchReport {
                path: patch.path().entries().to_vec(),
                center: patch.path().center(),
                width: patch.path().width(),
                birth_time: patch.birth_time(),
                last_split_time: patch.last_split_time(),
                nli: patch.nli(),
                betas: patch.betas().to_vec(),
                center_value: patch.center_value(),
                history: patch.history().to_vec(),
            })
            .collect()
    }
}

fn wall_points(variables: usize, resolution: usize) -> Vec<Vec<f64>> {
    let edge: Vec<f64> = (0..resolution)
        .map(|k| -1.0 + 2.0 * k as f64 / (resolution - 1) as f64)
        .collect();
    let point = |x: f64, y: f64| {
        let mut p = vec![0.0; variables];
        p[0] = x;
        p[1] = y;
        p
    };

    let mut points = Vec::with_capacity(4 * resolution);
    points.extend(edge.iter().map(|&x| point(x, 1.0)));
    points.extend(edge.iter().rev().map(|&y| point(1.0, y)));
    points.extend(edge.iter().rev().map(|&x| point(x, -1.0)));
    points.extend(edge.iter().map(|&y| point(-1.0, y)));
    points
}

impl From<Patch> for Manifold {
    fn from(patch: Patch) -> Self {
        Self {
            patches: VecDeque::from([patch]),
        }
    }
}

impl FromIterator<Patch> for Manifold {
    fn from_iter<I: IntoIterator<Item = Patch>>(iter: I) -> Self {
        Self {
            patches: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a Manifold {
    type Item = &'a Patch;
    type IntoIter = vec_deque::Iter<'a, Patch>;

    fn into_iter(self) -> Self::IntoIter {
        self.patches.iter()
    }
}
