//! Backward-induction orchestration.
//!
//! Ages run strictly from the top of the horizon downward; within an age the
//! outer-state loop is sequential (each outer combination builds one
//! control-invariant `Expectations` shared by its inner combinations) and the
//! inner-state loop is data-parallel. Every inner iteration returns the list
//! of (flat index, solution) writes it owns; the driver applies them
//! sequentially, so the grids never need locking. Age `a` reads only the
//! already-committed value-function slice of age `a + 1`.

use std::time::Instant;

use rayon::prelude::*;
use thiserror::Error;

use crate::expectations::{Expectations, ExpectationsError, ExpectationsFactory};
use crate::grid::{Grid, GridError, Grids, Solution};
use crate::persist::{self, PersistError};
use crate::scale::Axis;
use crate::solver::Minimiser;
use crate::state::{StateError, States};
use crate::utility::{CesUtility, UtilityError};

#[derive(Debug, Error)]
pub enum SolveError {
    #[error(transparent)]
    Expectations(#[from] ExpectationsError),

    #[error(transparent)]
    Utility(#[from] UtilityError),

    #[error(transparent)]
    Grid(#[from] GridError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Persist(#[from] PersistError),
}

/// One optimized discrete-control combination.
#[derive(Debug, Clone, Copy)]
struct ControlSolution {
    share1: f64,
    share2: f64,
    consumption: f64,
    utility: f64,
    /// Cash-on-hand of this combination; labour income varies with the
    /// shares, so every combination has its own denominator.
    cash_on_hand: f64,
}

impl ControlSolution {
    fn better_than(&self, other: &Option<ControlSolution>) -> bool {
        other.map(|o| self.utility > o.utility).unwrap_or(true)
    }

    fn to_grid_solution(self) -> Solution {
        let share = if self.cash_on_hand > 0.0 {
            (self.consumption / self.cash_on_hand).clamp(0.0, 1.0)
        } else {
            1.0
        };
        Solution {
            value: self.utility,
            consumption_share: share,
            employment1: self.share1,
            employment2: self.share2,
        }
    }
}

/// Solve one full state combination: enumerate the feasible employment-share
/// grid, optimize consumption for each combination, and return the grid
/// writes this state owns (its own cell plus the wage-offer-zero companion
/// cells it fills without re-optimization).
pub fn solve_state(
    factory: &ExpectationsFactory<'_>,
    state: &States,
    outer: &Expectations,
    continuation: Option<&Grid>,
) -> Result<Vec<(u64, Solution)>, SolveError> {
    let config = factory.scale().config();
    let age = state.age_scale();
    let invariant = factory.invariant(outer, state)?;

    let can_work =
        state.age_years() <= config.max_flexible_labour_age && !state.retired();
    let offer1 = state.wage_offer1().unwrap_or(true);
    let offer2 = state.wage_offer2().unwrap_or(true);

    // Companion cells this state owns: the same combination with an offer
    // flipped to zero, filled from the best zero-share solution because the
    // consequence of not working does not depend on the hypothetical share.
    let companion1 = age.axis_position(Axis::WageOffer1).is_some() && offer1;
    let companion2 =
        age.axis_position(Axis::WageOffer2).is_some() && state.cohabiting() && offer2;

    let mut shares1 = if can_work && offer1 {
        config.employment_shares()
    } else {
        vec![0.0]
    };
    let mut shares2 = if can_work && state.cohabiting() && offer2 {
        config.employment_shares()
    } else {
        vec![0.0]
    };
    if companion1 && !shares1.contains(&0.0) {
        shares1.insert(0, 0.0);
    }
    if companion2 && !shares2.contains(&0.0) {
        shares2.insert(0, 0.0);
    }

    let mut best: Option<ControlSolution> = None;
    let mut best_s1_zero: Option<ControlSolution> = None;
    let mut best_s2_zero: Option<ControlSolution> = None;
    let mut best_both_zero: Option<ControlSolution> = None;

    for &share1 in &shares1 {
        for &share2 in &shares2 {
            let expectations = factory.for_controls(&invariant, state, share1, share2)?;
            let utility = CesUtility::new(config, &expectations, continuation);

            let lower = config.min_consumption;
            let upper =
                (expectations.cash_on_hand + expectations.available_credit).max(lower);
            let minimiser = Minimiser::new(&utility, vec![lower], vec![upper]);
            let minimum = minimiser.minimise(&[0.5 * (lower + upper)])?;

            let candidate = ControlSolution {
                share1,
                share2,
                consumption: minimum.point[0],
                utility: -minimum.value,
                cash_on_hand: expectations.cash_on_hand,
            };

            if candidate.better_than(&best) {
                best = Some(candidate);
            }
            if share1 == 0.0 && candidate.better_than(&best_s1_zero) {
                best_s1_zero = Some(candidate);
            }
            if share2 == 0.0 && candidate.better_than(&best_s2_zero) {
                best_s2_zero = Some(candidate);
            }
            if share1 == 0.0 && share2 == 0.0 && candidate.better_than(&best_both_zero) {
                best_both_zero = Some(candidate);
            }
        }
    }

    let best = best.expect("at least one control combination is always enumerated");
    let mut writes = vec![(state.to_flat_index()?, best.to_grid_solution())];

    if companion1 {
        if let Some(solution) = best_s1_zero {
            let mut companion = state.clone();
            companion.set_value(Axis::WageOffer1, 0.0)?;
            writes.push((companion.to_flat_index()?, solution.to_grid_solution()));
        }
    }
    if companion2 {
        if let Some(solution) = best_s2_zero {
            let mut companion = state.clone();
            companion.set_value(Axis::WageOffer2, 0.0)?;
            writes.push((companion.to_flat_index()?, solution.to_grid_solution()));
        }
    }
    if companion1 && companion2 {
        if let Some(solution) = best_both_zero {
            let mut companion = state.clone();
            companion.set_value(Axis::WageOffer1, 0.0)?;
            companion.set_value(Axis::WageOffer2, 0.0)?;
            writes.push((companion.to_flat_index()?, solution.to_grid_solution()));
        }
    }

    Ok(writes)
}

/// The backward-induction driver: every age from the starting age down to the
/// first, outer states sequential, inner states parallel.
pub fn solve_grids(
    factory: &ExpectationsFactory<'_>,
    grids: &mut Grids,
) -> Result<(), SolveError> {
    let scale = factory.scale().clone();
    let config = scale.config();
    let run_started = Instant::now();

    let start_index = config
        .start_solving_age
        .map(|age| scale.age_index(age))
        .unwrap_or_else(|| scale.last_age_index());

    for age_index in (0..=start_index).rev() {
        let age_started = Instant::now();
        let age = scale.age(age_index);
        let mut solved_states = 0u64;

        let writes = {
            let continuation = if age_index < scale.last_age_index() {
                Some(&grids.value_function)
            } else {
                None
            };

            let mut writes: Vec<(u64, Solution)> = Vec::new();
            for outer_index in 0..age.outer_count {
                let mut template = States::new(scale.clone(), age_index);
                template.populate_outer(outer_index);
                if !template.check_outer_combination() {
                    continue;
                }
                let outer = factory.outer(&template)?;

                let mut inner_writes = (0..age.inner_count)
                    .into_par_iter()
                    .map(|inner_index| {
                        let mut state = template.clone();
                        state.populate_inner(inner_index);
                        if !state.check_combination() {
                            return Ok(Vec::new());
                        }
                        solve_state(factory, &state, &outer, continuation)
                    })
                    .collect::<Result<Vec<_>, SolveError>>()?;
                for batch in &mut inner_writes {
                    solved_states += (!batch.is_empty()) as u64;
                    writes.append(batch);
                }
            }
            writes
        };

        for (index, solution) in writes {
            grids.put_solution(index, &solution)?;
        }

        log::info!(
            "age {} solved: {} states in {:.2?}",
            age.age_years,
            solved_states,
            age_started.elapsed()
        );

        if config.checkpoint_grids && age.age_years < 80 && age.age_years % 5 == 0 {
            persist::write_grids(&config.grids_directory, grids)?;
            log::debug!("checkpoint written at age {}", age.age_years);
        }
        if config.dump_csv {
            persist::write_descriptive_csv(
                &config.grids_directory,
                &scale,
                grids,
                age_index,
            )?;
        }
    }

    log::info!("solve finished in {:.2?}", run_started.elapsed());
    Ok(())
}

/// Load-or-solve entry point.
///
/// With `load_grids` set and no intermediate starting age the grids are read
/// back as-is; with a starting age they are read first so the slices above it
/// provide the continuation values, then the solve resumes downward.
pub fn populate(factory: &ExpectationsFactory<'_>) -> Result<Grids, SolveError> {
    let scale = factory.scale();
    let config = scale.config();

    if config.load_grids && config.start_solving_age.is_none() {
        return Ok(persist::read_grids(&config.grids_directory, scale)?);
    }

    let mut grids = if config.load_grids {
        persist::read_grids(&config.grids_directory, scale)?
    } else {
        Grids::new(scale)
    };

    solve_grids(factory, &mut grids)?;

    if config.persist_grids {
        persist::write_grids(&config.grids_directory, &grids)?;
    }
    Ok(grids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DecisionConfig;
    use crate::model::{
        GaussianScore, Regression, RegressionInput, TaxBenefitCalculator, TaxQuery,
        TransitionModel,
    };
    use crate::scale::GridScale;
    use approx::assert_relative_eq;
    use std::sync::Arc;

    struct QuietTransitions;

    impl TransitionModel for QuietTransitions {
        fn probability(&self, _i: &RegressionInput, regression: Regression) -> f64 {
            match regression {
                Regression::Mortality => 0.0,
                Regression::WageOffer1 | Regression::WageOffer2 => 1.0,
                _ => 0.0,
            }
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

    fn small_scale() -> Arc<GridScale> {
        let mut config = DecisionConfig::baseline();
        config.start_age = 63;
        config.max_age = 65;
        config.max_flexible_labour_age = 64;
        config.wealth_points = 4;
        config.wage_points = 2;
        config.pension_points = 2;
        config.employment_options = 2;
        config.quadrature_points = 2;
        config.flag_health = false;
        config.flag_disability = false;
        config.flag_student = false;
        config.flag_children = false;
        config.flag_social_care = false;
        config.flag_education = false;
        Arc::new(GridScale::new(config).unwrap())
    }

    #[test]
    fn every_unpruned_cell_is_written() {
        let scale = small_scale();
        let transitions = QuietTransitions;
        let tax = IdentityTax;
        let factory =
            ExpectationsFactory::new(Arc::clone(&scale), &transitions, &tax).unwrap();
        let mut grids = Grids::new(&scale);
        solve_grids(&factory, &mut grids).unwrap();

        for age_index in 0..scale.ages().len() {
            let age = scale.age(age_index);
            for outer in 0..age.outer_count {
                for inner in 0..age.inner_count {
                    let mut state = States::new(Arc::clone(&scale), age_index);
                    state.populate_outer(outer);
                    state.populate_inner(inner);

                    let index = state.to_flat_index().unwrap();
                    let cohabiting = state.cohabiting();
                    let offer2 = state.wage_offer2();
                    // Single households with a phantom partner offer are the
                    // only combinations that stay unwritten.
                    if !cohabiting && offer2 == Some(true) {
                        continue;
                    }
                    let value = grids.value_function.get(index);
                    assert!(
                        value.is_ok(),
                        "cell {index} at age {} unwritten: {value:?}",
                        age.age_years
                    );
                }
            }
        }
    }

    #[test]
    fn companion_cells_record_zero_employment() {
        let scale = small_scale();
        let transitions = QuietTransitions;
        let tax = IdentityTax;
        let factory =
            ExpectationsFactory::new(Arc::clone(&scale), &transitions, &tax).unwrap();
        let mut grids = Grids::new(&scale);
        solve_grids(&factory, &mut grids).unwrap();

        // A flexible-age canonical state and its offer-zero companion.
        let mut state = States::new(Arc::clone(&scale), 0);
        state.set_value(Axis::WageOffer1, 0.0).unwrap();
        let index = state.to_flat_index().unwrap();
        if index < grids.employment1.len() {
            assert_eq!(grids.employment1.get(index).unwrap(), 0.0);
        }
    }

    #[test]
    fn companion_share_divides_by_the_zero_offer_cash_on_hand() {
        let scale = small_scale();
        let transitions = QuietTransitions;
        let tax = IdentityTax;
        let factory =
            ExpectationsFactory::new(Arc::clone(&scale), &transitions, &tax).unwrap();
        let mut grids = Grids::new(&scale);
        solve_grids(&factory, &mut grids).unwrap();

        // A working-age single holding an offer, at the top wealth and wage
        // points so the canonical optimum earns labour income and its
        // cash-on-hand differs from the zero-offer corner's.
        let age = scale.age(0);
        let wealth_axis = age.axis_position(Axis::LiquidWealth).unwrap();
        let wage_axis = age.axis_position(Axis::WagePotential).unwrap();
        let mut state = States::new(Arc::clone(&scale), 0);
        state.set_grid_position(wealth_axis, age.axes[wealth_axis].count - 1);
        state.set_grid_position(wage_axis, age.axes[wage_axis].count - 1);
        state.set_value(Axis::WageOffer1, 1.0).unwrap();

        // Re-optimize the zero-offer corner independently; the companion
        // cell must store consumption as a share of this corner's own
        // cash-on-hand, not the canonical best's.
        let outer = factory.outer(&state).unwrap();
        let invariant = factory.invariant(&outer, &state).unwrap();
        let exp = factory.for_controls(&invariant, &state, 0.0, 0.0).unwrap();
        let config = scale.config();
        let utility = CesUtility::new(config, &exp, Some(&grids.value_function));
        let lower = config.min_consumption;
        let upper = (exp.cash_on_hand + exp.available_credit).max(lower);
        let minimiser = Minimiser::new(&utility, vec![lower], vec![upper]);
        let minimum = minimiser.minimise(&[0.5 * (lower + upper)]).unwrap();
        let expected = (minimum.point[0] / exp.cash_on_hand).clamp(0.0, 1.0);

        let mut companion = state.clone();
        companion.set_value(Axis::WageOffer1, 0.0).unwrap();
        let stored = grids
            .consumption_share
            .get(companion.to_flat_index().unwrap())
            .unwrap();
        assert_relative_eq!(stored, expected, epsilon = 1e-9);
    }

    #[test]
    fn values_decrease_with_less_wealth_at_fixed_age() {
        let scale = small_scale();
        let transitions = QuietTransitions;
        let tax = IdentityTax;
        let factory =
            ExpectationsFactory::new(Arc::clone(&scale), &transitions, &tax).unwrap();
        let mut grids = Grids::new(&scale);
        solve_grids(&factory, &mut grids).unwrap();

        let age = scale.age(1);
        let wealth_axis = age.axis_position(Axis::LiquidWealth).unwrap();
        let mut poor = States::new(Arc::clone(&scale), 1);
        let mut rich = poor.clone();
        poor.set_grid_position(wealth_axis, 0);
        rich.set_grid_position(wealth_axis, age.axes[wealth_axis].count - 1);

        let v_poor = grids.value_at(&poor).unwrap();
        let v_rich = grids.value_at(&rich).unwrap();
        assert!(v_rich > v_poor);
    }
}
