use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Result, SplitError};
use crate::integrator::Integrator;
use crate::manifold::{Manifold, SplitStats};
use crate::settings::SplitSettings;
use crate::traits::VectorField;

/// Shape of the current split domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifoldSummary {
    pub patches: usize,
    pub min_depth: usize,
    pub max_depth: usize,
    /// Total splits along each axis over all patches.
    pub splits_per_axis: BTreeMap<usize, usize>,
    pub t0: f64,
    pub t1: f64,
}

/// Drives successive splitting passes: the seed is split into `current`,
/// and the generation it replaces moves to `previous`.
pub struct SuperManifold<F> {
    integrator: Integrator<F>,
    settings: SplitSettings,
    seed: Option<Manifold>,
    previous: Option<Manifold>,
    current: Option<Manifold>,
    last_stats: Option<SplitStats>,
    stop: Arc<AtomicBool>,
}

impl<F: VectorField> SuperManifold<F> {
    pub fn new(integrator: Integrator<F>, settings: SplitSettings) -> Self {
        Self {
            integrator,
            settings,
            seed: None,
            previous: None,
            current: None,
            last_stats: None,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_seed(mut self, seed: Manifold) -> Self {
        self.set_seed(seed);
        self
    }

    pub fn set_seed(&mut self, seed: Manifold) {
        if let Some(old) = &self.seed {
            warn!(old = old.len(), new = seed.len(), "replacing seed manifold");
        }
        self.seed = Some(seed);
    }

    pub fn seed(&self) -> Option<&Manifold> {
        self.seed.as_ref()
    }

    pub fn previous(&self) -> Option<&Manifold> {
        self.previous.as_ref()
    }

    pub fn current(&self) -> Option<&Manifold> {
        self.current.as_ref()
    }

    pub fn settings(&self) -> &SplitSettings {
        &self.settings
    }

    pub fn integrator(&self) -> &Integrator<F> {
        &self.integrator
    }

    pub fn last_stats(&self) -> Option<SplitStats> {
        self.last_stats
    }

    /// Flag checked at every worklist pop; raising it aborts the running pass.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Moves the integration window for the next pass.
    pub fn set_time_span(&mut self, t0: f64, t1: f64) -> Result<()> {
        self.integrator.set_time_span(t0, t1)
    }

    /// Splits the current generation, or the seed on the first pass, and
    /// makes the result the current generation. Clears the stop flag first.
    pub fn split_domain(&mut self) -> Result<&Manifold> {
        let source = self
            .current
            .as_ref()
            .or(self.seed.as_ref())
            .ok_or(SplitError::UnboundDependency("seed manifold"))?;

        self.stop.store(false, Ordering::Relaxed);
        let pass = source.split_domain_until(&self.integrator, &self.settings, &self.stop)?;
        info!(
            patches = pass.manifold.len(),
            t1 = self.integrator.settings().t1,
            "split domain updated"
        );

        self.previous = self.current.take();
        self.last_stats = Some(pass.stats);
        Ok(self.current.insert(pass.manifold))
    }

    pub fn summary(&self) -> Result<ManifoldSummary> {
        let current = self
            .current
            .as_ref()
            .ok_or(SplitError::UnboundDependency("current manifold"))?;
        if current.is_empty() {
            return Err(SplitError::EmptyManifold);
        }

        let depths = current.iter().map(|p| p.path().count());
        let min_depth = depths.clone().min().unwrap_or(0);
        let max_depth = depths.max().unwrap_or(0);
        let mut splits_per_axis = BTreeMap::new();
        for patch in current {
            for (axis, _) in patch.path().steps() {
                *splits_per_axis.entry(axis).or_insert(0) += 1;
            }
        }

        let settings = self.integrator.settings();
        Ok(ManifoldSummary {
            patches: current.len(),
            min_depth,
            max_depth,
            splits_per_axis,
            t0: settings.t0,
            t1: settings.t1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algebra::{Algebra, Tps};
    use crate::criteria::SplitCriterion;
    use crate::settings::{Algorithm, IntegratorSettings, Scheme};

    struct Drift;

    impl VectorField for Drift {
        fn dimension(&self) -> usize {
            1
        }

        fn derivative(&self, _t: f64, x: &[Tps], out: &mut [Tps]) {
            out[0] = &(&x[0] * &x[0]) * 0.5;
        }
    }

    fn orchestrator(max_split: usize) -> SuperManifold<Drift> {
        let settings = IntegratorSettings {
            scheme: Scheme::Euler,
            max_step: 0.1,
            t0: 0.0,
            t1: 0.3,
            ..IntegratorSettings::default()
        };
        let integrator = Integrator::new(Drift, settings).expect("integrator");
        SuperManifold::new(
            integrator,
            SplitSettings::new(SplitCriterion::truncation(vec![-1.0]), max_split),
        )
    }

    fn seed() -> Manifold {
        let algebra = Algebra::new(3, 1).expect("algebra");
        let x = algebra.variable(0).expect("x");
        Manifold::from_state(vec![&(&x * 0.1) + 1.0], Algorithm::Ads, 0.0).expect("seed")
    }

    #[test]
    fn split_without_seed_is_unbound() {
        let mut orchestrator = orchestrator(1);
        let err = orchestrator.split_domain().expect_err("unbound");
        assert_eq!(err, SplitError::UnboundDependency("seed manifold"));
        assert!(orchestrator.current().is_none());
        assert!(orchestrator.summary().is_err());
    }

    #[test]
    fn generations_shift_on_each_pass() {
        let mut orchestrator = orchestrator(1).with_seed(seed());
        let first = orchestrator.split_domain().expect("split").len();
        assert_eq!(first, 2);
        assert!(orchestrator.previous().is_none());

        orchestrator.set_time_span(0.3, 0.6).expect("span");
        orchestrator.split_domain().expect("split");
        assert_eq!(orchestrator.previous().map(Manifold::len), Some(2));
        let current = orchestrator.current().expect("current");
        // Patches already at the split limit are only propagated.
        assert_eq!(current.len(), 2);
        for patch in current {
            assert!((patch.birth_time() - 0.6).abs() < 1e-12);
        }
        assert_eq!(orchestrator.last_stats().map(|s| s.splits), Some(0));
    }

    #[test]
    fn summary_describes_current_generation() {
        let mut orchestrator = orchestrator(2).with_seed(seed());
        orchestrator.split_domain().expect("split");
        let summary = orchestrator.summary().expect("summary");
        assert_eq!(summary.patches, 4);
        assert_eq!(summary.min_depth, 2);
        assert_eq!(summary.max_depth, 2);
        assert_eq!(summary.splits_per_axis.get(&0), Some(&8));
        assert_eq!(summary.t1, 0.3);
    }

    #[test]
    fn stop_handle_is_shared() {
        let orchestrator = orchestrator(1);
        let handle = orchestrator.stop_handle();
        handle.store(true, Ordering::Relaxed);
        assert!(orchestrator.stop.load(Ordering::Relaxed));
    }
}
