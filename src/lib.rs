//! Backward-induction decision grids for household microsimulation.
//!
//! The crate solves a finite-horizon, discrete-time intertemporal household
//! decision problem over a discretized state space, producing flat lookup
//! grids of the optimal consumption share, employment shares and the value
//! function, indexed by age and a multi-dimensional state combination. A
//! simulation later interpolates these grids instead of re-solving the
//! optimization per household.
//!
//! The pieces, leaves first: [`quadrature`] (Gauss-Hermite rules for normal
//! shocks), [`ranking`] (stable slice ranking), [`scale`] (per-age axis
//! layout), [`state`] (state combinations and the flat-index codec), [`grid`]
//! (partitioned storage and multi-linear interpolation), [`model`] (the
//! collaborator contracts for taxes and transition regressions),
//! [`expectations`] (the anticipated-state probability tree), [`utility`]
//! (the CES objective), [`solver`] (bounded Powell/Brent minimization),
//! [`solve`] (the backward-induction driver) and [`persist`] (memory-mapped
//! binary grid files plus the CSV dump).

pub mod config;
pub mod expectations;
pub mod grid;
pub mod model;
pub mod persist;
pub mod quadrature;
pub mod ranking;
pub mod scale;
pub mod solve;
pub mod solver;
pub mod state;
pub mod utility;

pub use config::{ConfigError, DecisionConfig};
pub use expectations::{Expectations, ExpectationsError, ExpectationsFactory, LocalExpectations};
pub use grid::{Grid, GridError, Grids, Solution, UNINITIALISED};
pub use model::{
    CareProvision, CareReceipt, Education, GaussianScore, Gender, GridCoded, Health, Region,
    Regression, RegressionInput, TaxBenefitCalculator, TaxQuery, TransitionModel,
};
pub use quadrature::{GaussHermite, QuadratureError};
pub use scale::{Axis, AxisSpec, GridScale, ScaleError, CHILD_BANDS};
pub use solve::{populate, solve_grids, solve_state, SolveError};
pub use solver::{Minimiser, Minimum, Objective};
pub use state::{StateError, States};
pub use utility::{CesUtility, UtilityError};
pub use persist::PersistError;
