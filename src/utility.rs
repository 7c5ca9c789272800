//! The nested CES utility objective minimized (as its negation) per state.
//!
//! One evaluation prices a candidate annual consumption level: the period
//! aggregate combines equivalised consumption with leisure, and the
//! continuation term interpolates the already-solved next-age value function
//! at every anticipated branch, weighting by branch probability and survival.
//! Negligible branches are skipped, and the realized mass is checked against
//! a floor so screening can never silently discard most of the distribution.

use thiserror::Error;

use crate::config::DecisionConfig;
use crate::expectations::Expectations;
use crate::grid::{Grid, GridError};
use crate::scale::Axis;
use crate::solver::Objective;
use crate::state::StateError;

/// Leisure share floor keeping the CES aggregate defined at full-time work.
///
/// With a substitution elasticity below one, leisure at zero carries an
/// unbounded penalty; the floor caps it at `floor^(1 - 1/epsilon)` instead.
/// Under the baseline calibration (`epsilon = 0.75`, single `theta = 0.3`)
/// the capped term still dominates the aggregate, so a single household's
/// full-time corner loses at any consumption level. That is the complements
/// calibration speaking, not a solver artifact; raise the floor to soften it.
const LEISURE_FLOOR: f64 = 1e-3;

/// Probability mass below which a mortality or survival term is dropped.
const MATERIAL_PROBABILITY: f64 = 1e-12;

#[derive(Debug, Error)]
pub enum UtilityError {
    #[error("Screening left {surviving} of {total} probability mass; the distribution lost too much.")]
    ScreenedMassTooLow { surviving: f64, total: f64 },

    #[error("Utility evaluated to a non-finite value at consumption {consumption}.")]
    NonFinite { consumption: f64 },

    #[error(transparent)]
    Grid(#[from] GridError),

    #[error(transparent)]
    State(#[from] StateError),
}

/// Period-plus-continuation CES utility for one (state, control) evaluation.
pub struct CesUtility<'a> {
    config: &'a DecisionConfig,
    expectations: &'a Expectations,
    /// Next-age value function; `None` only at the terminal age.
    continuation: Option<&'a Grid>,
}

impl<'a> CesUtility<'a> {
    pub fn new(
        config: &'a DecisionConfig,
        expectations: &'a Expectations,
        continuation: Option<&'a Grid>,
    ) -> Self {
        Self {
            config,
            expectations,
            continuation,
        }
    }

    /// Period CES aggregate of equivalised consumption and leisure, already
    /// raised to `(1 - gamma) / rho`.
    fn period_utility(&self, consumption: f64) -> f64 {
        let config = self.config;
        let exp = self.expectations;

        let equivalised = consumption / exp.equivalence_scale;
        let adults = if exp.cohabiting { 2.0 } else { 1.0 };
        let leisure =
            (1.0 - (exp.labour_share1 + exp.labour_share2) / adults).max(LEISURE_FLOOR);
        let theta = if exp.cohabiting {
            config.price_of_leisure_couple
        } else {
            config.price_of_leisure_single
        };

        let rho = 1.0 - 1.0 / config.epsilon;
        let inner = equivalised.powf(rho) + theta * leisure.powf(rho);
        inner.powf((1.0 - config.gamma) / rho)
    }

    /// Expected continuation in `V^(1-gamma)` units, plus the bequest term.
    fn expected_continuation(&self, consumption: f64) -> Result<f64, UtilityError> {
        let config = self.config;
        let exp = self.expectations;
        let one_minus_gamma = 1.0 - config.gamma;

        let next_wealth = exp.cash_on_hand - consumption;
        let mut continuation = 0.0;

        let survival = 1.0 - exp.mortality_probability;
        if survival > MATERIAL_PROBABILITY && !exp.states.is_empty() {
            let grid = self
                .continuation
                .expect("anticipated states exist only below the terminal age");

            let threshold = if config.screen_probabilities {
                config.min_probability
            } else {
                0.0
            };

            let mut total_mass = 0.0;
            let mut used_mass = 0.0;
            let mut value_sum = 0.0;
            for (state, &probability) in exp.states.iter().zip(&exp.probabilities) {
                total_mass += probability;
                if probability < threshold {
                    continue;
                }
                let spec = state
                    .age_scale()
                    .spec(Axis::LiquidWealth)
                    .expect("the wealth axis is active at every age");
                let coordinate = (next_wealth + config.wealth_shift)
                    .max(f64::MIN_POSITIVE)
                    .ln()
                    .clamp(spec.min, spec.max);
                let mut branch = state.clone();
                branch.set_value(Axis::LiquidWealth, coordinate)?;
                let value = grid.interpolate_all(&branch, true)?;
                value_sum += probability * value.powf(one_minus_gamma);
                used_mass += probability;
            }

            if used_mass < config.min_surviving_mass * total_mass {
                return Err(UtilityError::ScreenedMassTooLow {
                    surviving: used_mass,
                    total: total_mass,
                });
            }
            continuation += survival * value_sum / used_mass;
        }

        if exp.mortality_probability > MATERIAL_PROBABILITY && config.bequest_slope > 0.0 {
            let bequest = config.bequest_slope * (next_wealth + config.wealth_shift).max(1.0);
            continuation += exp.mortality_probability * bequest.powf(one_minus_gamma);
        }

        Ok(continuation)
    }
}

impl Objective for CesUtility<'_> {
    type Error = UtilityError;

    fn evaluate(&self, point: &[f64]) -> Result<f64, Self::Error> {
        let config = self.config;
        let consumption = point[0].max(config.min_consumption);

        let period = self.period_utility(consumption);
        let continuation = self.expected_continuation(consumption)?;
        let base = period + config.discount_factor * continuation;
        let total = base.powf(1.0 / (1.0 - config.gamma));

        if !total.is_finite() {
            return Err(UtilityError::NonFinite { consumption });
        }
        Ok(-total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expectations::{ExpectationsFactory, LocalExpectations};
    use crate::model::{
        GaussianScore, Regression, RegressionInput, TaxBenefitCalculator, TaxQuery,
        TransitionModel,
    };
    use crate::scale::GridScale;
    use crate::state::States;
    use approx::assert_relative_eq;
    use std::sync::Arc;

    struct NoTransitions;

    impl TransitionModel for NoTransitions {
        fn probability(&self, _i: &RegressionInput, _r: Regression) -> f64 {
            0.0
        }

        fn gaussian_score(&self, input: &RegressionInput, _r: Regression) -> GaussianScore {
            GaussianScore {
                mean: input.wage_potential_per_hour.max(1.0).ln(),
                rmse: 0.0,
            }
        }

        fn distribution(&self, _i: &RegressionInput, _r: Regression) -> Vec<(f64, f64)> {
            vec![(0.0, 1.0)]
        }
    }

    struct IdentityTax;

    impl TaxBenefitCalculator for IdentityTax {
        fn disposable_income_per_month(&self, query: &TaxQuery) -> f64 {
            query.gross_income_per_month + query.second_income_per_month
        }
    }

    fn terminal_config() -> crate::config::DecisionConfig {
        let mut config = crate::config::DecisionConfig::baseline();
        config.start_age = 98;
        config.max_age = 100;
        config.max_flexible_labour_age = 99;
        config.wealth_points = 5;
        config.wage_points = 2;
        config.pension_points = 2;
        config.price_of_leisure_single = 0.0;
        config.price_of_leisure_couple = 0.0;
        config.flag_health = false;
        config.flag_disability = false;
        config.flag_student = false;
        config.flag_children = false;
        config.flag_social_care = false;
        config.flag_cohabitation = false;
        config.flag_wage_offer1 = false;
        config.flag_wage_offer2 = false;
        config
    }

    #[test]
    fn terminal_utility_without_leisure_is_consumption_itself() {
        let config = terminal_config();
        let scale = Arc::new(GridScale::new(config.clone()).unwrap());
        let transitions = NoTransitions;
        let tax = IdentityTax;
        let factory = ExpectationsFactory::new(Arc::clone(&scale), &transitions, &tax).unwrap();

        let state = States::new(Arc::clone(&scale), scale.last_age_index());
        let outer = factory.outer(&state).unwrap();
        let invariant = factory.invariant(&outer, &state).unwrap();
        let exp = factory.for_controls(&invariant, &state, 0.0, 0.0).unwrap();

        let utility = CesUtility::new(&config, &exp, None);
        // With theta = 0 the CES collapses to c^(1-gamma) and the outer root
        // inverts it exactly.
        let value = utility.evaluate(&[20_000.0]).unwrap();
        assert_relative_eq!(value, -20_000.0, epsilon = 1e-6);
    }

    #[test]
    fn more_consumption_is_better_when_nothing_follows() {
        let config = terminal_config();
        let scale = Arc::new(GridScale::new(config.clone()).unwrap());
        let transitions = NoTransitions;
        let tax = IdentityTax;
        let factory = ExpectationsFactory::new(Arc::clone(&scale), &transitions, &tax).unwrap();

        let state = States::new(Arc::clone(&scale), scale.last_age_index());
        let outer = factory.outer(&state).unwrap();
        let invariant = factory.invariant(&outer, &state).unwrap();
        let exp = factory.for_controls(&invariant, &state, 0.0, 0.0).unwrap();

        let utility = CesUtility::new(&config, &exp, None);
        let low = utility.evaluate(&[5_000.0]).unwrap();
        let high = utility.evaluate(&[50_000.0]).unwrap();
        assert!(high < low);
    }

    #[test]
    fn over_aggressive_screening_is_fatal() {
        let config = terminal_config();
        let scale = Arc::new(GridScale::new(config.clone()).unwrap());
        let transitions = NoTransitions;
        let tax = IdentityTax;
        let factory = ExpectationsFactory::new(Arc::clone(&scale), &transitions, &tax).unwrap();

        // Age 98: one period before the end, so a continuation exists.
        let state = States::new(Arc::clone(&scale), 0);
        let outer = factory.outer(&state).unwrap();
        let invariant = factory.invariant(&outer, &state).unwrap();
        let mut exp = factory.for_controls(&invariant, &state, 0.0, 0.0).unwrap();

        // Crush every branch below the screening threshold and restore the
        // mass on paper: all of it will now be screened away.
        let n = exp.probabilities.len() as f64;
        for p in &mut exp.probabilities {
            *p = 1.0 / n;
        }
        let mut screened_config = config.clone();
        screened_config.min_probability = 2.0;

        let grid = crate::grid::Grid::new(scale.total_size());
        let utility = CesUtility::new(&screened_config, &exp, Some(&grid));
        assert!(matches!(
            utility.evaluate(&[10_000.0]),
            Err(UtilityError::ScreenedMassTooLow { .. })
        ));
    }

    #[test]
    fn bequest_motive_moves_the_terminal_optimum_interior() {
        let mut config = terminal_config();
        config.bequest_slope = 1.0;
        let scale = Arc::new(GridScale::new(config.clone()).unwrap());
        let transitions = NoTransitions;
        let tax = IdentityTax;
        let factory = ExpectationsFactory::new(Arc::clone(&scale), &transitions, &tax).unwrap();

        let mut state = States::new(Arc::clone(&scale), scale.last_age_index());
        state
            .set_value(
                Axis::LiquidWealth,
                (200_000.0 + config.wealth_shift).ln(),
            )
            .unwrap();
        let outer = factory.outer(&state).unwrap();
        let invariant = factory.invariant(&outer, &state).unwrap();
        let exp = factory.for_controls(&invariant, &state, 0.0, 0.0).unwrap();
        assert!(exp.cash_on_hand > config.min_consumption);

        let best_on = |slope: f64| {
            let mut cfg = config.clone();
            cfg.bequest_slope = slope;
            let utility = CesUtility::new(&cfg, &exp, None);
            let mut best = 0;
            let mut best_value = f64::INFINITY;
            for i in 0..50 {
                let c = config.min_consumption
                    + (exp.cash_on_hand * 0.999 - config.min_consumption) * i as f64 / 49.0;
                let value = utility.evaluate(&[c]).unwrap();
                if value < best_value {
                    best_value = value;
                    best = i;
                }
            }
            best
        };

        // Without a bequest motive the terminal optimum consumes everything;
        // with one, some wealth is left behind.
        assert_eq!(best_on(0.0), 49);
        assert!(best_on(1.0) < 49);
    }

    #[test]
    fn full_time_corner_is_dominated_for_singles_under_complements() {
        let mut config = terminal_config();
        config.price_of_leisure_single = 0.3;
        let scale = Arc::new(GridScale::new(config.clone()).unwrap());
        let transitions = NoTransitions;
        let tax = IdentityTax;
        let factory = ExpectationsFactory::new(Arc::clone(&scale), &transitions, &tax).unwrap();

        let state = States::new(Arc::clone(&scale), scale.last_age_index());
        let outer = factory.outer(&state).unwrap();
        let invariant = factory.invariant(&outer, &state).unwrap();
        let part_time = factory.for_controls(&invariant, &state, 0.5, 0.0).unwrap();
        let full_time = factory.for_controls(&invariant, &state, 1.0, 0.0).unwrap();

        // At equal consumption the floored leisure term of the full-time
        // corner dominates the aggregate; epsilon < 1 makes consumption and
        // leisure complements.
        let u_part = CesUtility::new(&config, &part_time, None)
            .evaluate(&[20_000.0])
            .unwrap();
        let u_full = CesUtility::new(&config, &full_time, None)
            .evaluate(&[20_000.0])
            .unwrap();
        assert!(u_part < u_full);
    }

    #[test]
    fn screened_local_expectations_feed_well_formed_trees() {
        // Guard for the expansion-to-utility handoff: a screened local
        // distribution still closes, so the tree the utility consumes does.
        let mut local =
            LocalExpectations::from_pairs(vec![(0.0, 0.99995), (1.0, 0.00005)], 1e-4).unwrap();
        local.screen(1e-3);
        let sum: f64 = local.probabilities().iter().sum();
        assert_relative_eq!(sum, 1.0, epsilon = 1e-12);
    }
}
