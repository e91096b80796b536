//! The `verne_core` crate propagates uncertainty sets through nonlinear
//! dynamics by automatic domain splitting.
//!
//! An initial set is a polynomial expansion over the normalized box
//! `[-1, 1]^n`. While it is propagated, the expansion is watched either for
//! truncation error (ADS, bisection) or for its nonlinearity index (LOADS,
//! trisection); when the watch trips, the box is split and every piece is
//! propagated on its own.
//!
//! Key components:
//! - **Algebra**: truncated power series over a shared `Algebra` context.
//! - **Solvers / Integrator**: Euler, RK4 (3/8 rule) and adaptive RK7(8)
//!   with interruption on a `SplitCriterion`.
//! - **Patch / SplitPath**: one box of the partition and its ancestry.
//! - **Manifold / SuperManifold**: the splitting worklist and the
//!   orchestrator that runs successive passes.
pub mod algebra;
pub mod criteria;
pub mod error;
pub mod integrator;
pub mod manifold;
pub mod patch;
pub mod settings;
pub mod solvers;
pub mod split_path;
pub mod super_manifold;
pub mod traits;

pub use algebra::{Algebra, Tps};
pub use criteria::{ConditionCheck, SplitCriterion};
pub use error::{Result, SplitError};
pub use integrator::{Integration, Integrator, Outcome, StepPlan};
pub use manifold::{EvolutionSnapshot, Manifold, PatchReport, SplitPass, SplitStats};
pub use patch::{HistoryEntry, Patch};
pub use settings::{Algorithm, IntegratorSettings, Rk78Settings, Scheme, SplitSettings};
pub use split_path::{Side, SplitPath};
pub use super_manifold::{ManifoldSummary, SuperManifold};
pub use traits::VectorField;
