//! Time integration of polynomial states with optional mid-flight interruption.
//!
//! An [`Integrator`] holds only its model binding and settings. Every call to
//! [`Integrator::integrate`] owns its own time cursor and stage buffers, so a
//! single integrator can serve concurrent patches.

use num_traits::ToPrimitive;
use tracing::debug;

use crate::algebra::Tps;
use crate::criteria::{ConditionCheck, SplitCriterion};
use crate::error::{Result, SplitError};
use crate::settings::{IntegratorSettings, Scheme};
use crate::solvers::{Euler, Rk78, Steppable, RK4};
use crate::traits::VectorField;

/// Fixed-step parametrization of a time span.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepPlan {
    pub steps: usize,
    pub step: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The end of the time span was reached.
    Completed,
    /// A criterion tripped; the state is the last one that passed.
    Interrupted(ConditionCheck),
}

#[derive(Debug, Clone)]
pub struct Integration {
    pub state: Vec<Tps>,
    /// Time at which `state` is valid.
    pub time: f64,
    pub outcome: Outcome,
    pub accepted_steps: usize,
    pub rejected_steps: usize,
    /// NaN estimates skipped over all criterion checks.
    pub nan_skips: usize,
    /// Verdict on the last accepted state, when a criterion was supplied.
    pub last_check: Option<ConditionCheck>,
}

impl Integration {
    pub fn interruption(&self) -> Option<&ConditionCheck> {
        match &self.outcome {
            Outcome::Interrupted(check) => Some(check),
            Outcome::Completed => None,
        }
    }
}

struct Run {
    state: Vec<Tps>,
    time: f64,
    accepted: usize,
    rejected: usize,
    nan_skips: usize,
    last_check: Option<ConditionCheck>,
}

#[derive(Debug, Clone)]
pub struct Integrator<F> {
    model: F,
    settings: IntegratorSettings,
}

impl<F: VectorField> Integrator<F> {
    pub fn new(model: F, settings: IntegratorSettings) -> Result<Self> {
        settings.validate()?;
        if model.dimension() == 0 {
            return Err(SplitError::InvalidSetting(
                "model has zero dimension".to_string(),
            ));
        }
        Ok(Self { model, settings })
    }

    pub fn model(&self) -> &F {
        &self.model
    }

    pub fn settings(&self) -> &IntegratorSettings {
        &self.settings
    }

    /// Moves the integration window, e.g. for the next leg of a propagation.
    pub fn set_time_span(&mut self, t0: f64, t1: f64) -> Result<()> {
        let settings = IntegratorSettings {
            t0,
            t1,
            ..self.settings
        };
        settings.validate()?;
        self.settings = settings;
        Ok(())
    }

    /// Number and size of fixed steps from `start` to the end time. `start`
    /// must lie inside the `[t0, t1]` window.
    pub fn plan(&self, start: f64) -> Result<StepPlan> {
        if !(start >= self.settings.t0) {
            return Err(SplitError::InvalidSetting(format!(
                "start time {start} precedes window start {}",
                self.settings.t0
            )));
        }
        let span = self.settings.t1 - start;
        if span < 0.0 || !span.is_finite() {
            return Err(SplitError::InvalidSetting(format!(
                "start time {start} lies past end time {}",
                self.settings.t1
            )));
        }
        let steps = (span / self.settings.max_step)
            .ceil()
            .to_usize()
            .ok_or_else(|| SplitError::InvalidSetting(format!("cannot split span {span}")))?;
        let step = if steps == 0 { 0.0 } else { span / steps as f64 };
        Ok(StepPlan { steps, step })
    }

    /// Advances `state` from `start` to the end time. With a criterion, every
    /// accepted step is checked and the first failing one is discarded.
    pub fn integrate(
        &self,
        state: &[Tps],
        start: f64,
        criterion: Option<&SplitCriterion>,
    ) -> Result<Integration> {
        let dimension = self.model.dimension();
        if state.len() != dimension {
            return Err(SplitError::mismatch("state vs model", dimension, state.len()));
        }
        let plan = self.plan(start)?;

        let mut run = Run {
            state: state.to_vec(),
            time: start,
            accepted: 0,
            rejected: 0,
            nan_skips: 0,
            last_check: None,
        };

        let interruption = match self.settings.scheme {
            Scheme::Euler => self.run_fixed(&mut Euler::new(), &mut run, plan, criterion)?,
            Scheme::Rk4 => self.run_to_end(&mut RK4::new(), &mut run, plan, criterion)?,
            Scheme::Rk78 => self.run_adaptive(&mut run, criterion)?,
        };

        let outcome = match interruption {
            Some(check) => {
                debug!(time = run.time, axis = ?check.axis, "integration interrupted");
                Outcome::Interrupted(check)
            }
            None => {
                run.time = self.settings.t1;
                Outcome::Completed
            }
        };

        Ok(Integration {
            state: run.state,
            time: run.time,
            outcome,
            accepted_steps: run.accepted,
            rejected_steps: run.rejected,
            nan_skips: run.nan_skips,
            last_check: run.last_check,
        })
    }

    fn end_tolerance(&self, start: f64) -> f64 {
        64.0 * f64::EPSILON * self.settings.t1.abs().max(start.abs()).max(1.0)
    }

    /// Commits `candidate` unless the criterion trips on it.
    fn accept(
        &self,
        run: &mut Run,
        candidate: Vec<Tps>,
        time: f64,
        criterion: Option<&SplitCriterion>,
    ) -> Result<Option<ConditionCheck>> {
        if let Some(criterion) = criterion {
            let check = criterion.check(&candidate)?;
            run.nan_skips += check.nan_skips;
            if check.exceeded {
                return Ok(Some(check));
            }
            run.last_check = Some(check);
        }
        run.state = candidate;
        run.time = time;
        run.accepted += 1;
        Ok(None)
    }

    fn run_fixed(
        &self,
        stepper: &mut impl Steppable,
        run: &mut Run,
        plan: StepPlan,
        criterion: Option<&SplitCriterion>,
    ) -> Result<Option<ConditionCheck>> {
        for _ in 0..plan.steps {
            let mut candidate = run.state.clone();
            let mut t = run.time;
            stepper.step(&self.model, &mut t, &mut candidate, plan.step);
            if let Some(check) = self.accept(run, candidate, t, criterion)? {
                return Ok(Some(check));
            }
        }
        Ok(None)
    }

    fn run_to_end(
        &self,
        stepper: &mut impl Steppable,
        run: &mut Run,
        plan: StepPlan,
        criterion: Option<&SplitCriterion>,
    ) -> Result<Option<ConditionCheck>> {
        let end = self.settings.t1;
        let tolerance = self.end_tolerance(run.time);
        while end - run.time > tolerance {
            let step = plan.step.min(end - run.time);
            let mut candidate = run.state.clone();
            let mut t = run.time;
            stepper.step(&self.model, &mut t, &mut candidate, step);
            if let Some(check) = self.accept(run, candidate, t, criterion)? {
                return Ok(Some(check));
            }
        }
        Ok(None)
    }

    fn run_adaptive(
        &self,
        run: &mut Run,
        criterion: Option<&SplitCriterion>,
    ) -> Result<Option<ConditionCheck>> {
        let end = self.settings.t1;
        let tolerance = self.end_tolerance(run.time);
        let mut control = StepControl::new(&self.settings);
        let mut stepper = Rk78::new();

        while end - run.time > tolerance {
            let step = control.propose(end - run.time);
            let attempt = stepper.attempt(&self.model, run.time, &run.state, step);
            if !control.judge(attempt.error) {
                run.rejected += 1;
                continue;
            }

            let time = if end - (run.time + step) <= tolerance {
                end
            } else {
                run.time + step
            };
            if let Some(check) = self.accept(run, attempt.state, time, criterion)? {
                return Ok(Some(check));
            }
        }
        Ok(None)
    }
}

/// Step-size control of the adaptive 7(8) scheme.
#[derive(Debug, Clone, Copy)]
struct StepControl {
    step: f64,
    /// Error of the last accepted step; `None` after a rejection.
    last_error: Option<f64>,
    min_step: f64,
    max_step: f64,
    tolerance: f64,
    reject_bound: f64,
}

impl StepControl {
    fn new(settings: &IntegratorSettings) -> Self {
        let rk = settings.rk78;
        Self {
            step: rk.initial_step,
            last_error: None,
            min_step: rk.min_step,
            max_step: settings.max_step,
            tolerance: rk.tolerance,
            reject_bound: rk.reject_bound,
        }
    }

    /// Next trial step: grown from the last accepted error by at most 4x,
    /// kept in `[min_step, max_step]` and never past `remaining`.
    fn propose(&mut self, remaining: f64) -> f64 {
        if let Some(error) = self.last_error.take() {
            let growth = if error == 0.0 {
                4.0
            } else {
                ((self.tolerance / error).ln() / 9.0).exp().min(4.0)
            };
            self.step *= growth;
        }
        self.step = self.step.clamp(self.min_step, self.max_step).min(remaining);
        self.step
    }

    /// Accepts or rejects the trial of the last proposed size. A rejected
    /// trial is retried at a third of its size; steps near `min_step` are
    /// always accepted, as are NaN errors there.
    fn judge(&mut self, error: f64) -> bool {
        let too_large = !(error <= self.reject_bound);
        if too_large && (self.step / self.min_step).abs() > 1.2 {
            self.step /= 3.0;
            return false;
        }
        self.last_error = error.is_finite().then_some(error);
        true
    }
}
