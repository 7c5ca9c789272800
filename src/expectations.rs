//! Anticipated next-period states and their joint probability tree.
//!
//! For every (state, discrete-control) evaluation the solver needs the joint
//! distribution over next-period state combinations. It is built in three
//! phases that mirror what actually depends on what:
//!
//! 1. `ExpectationsFactory::outer` precomputes everything invariant to the
//!    discrete controls: the next-age seed state (deterministic axis
//!    roll-forward) and the regression proxy describing next period's person.
//! 2. `ExpectationsFactory::invariant` adds the current-period continuous
//!    quantities (wealth, wage, pension, credit, mortality) that depend on the
//!    outer state but not on the controls.
//! 3. `ExpectationsFactory::for_controls` copies the invariant object, folds
//!    in the chosen employment shares (labour income, annuitization,
//!    investment income, taxes, cash-on-hand) and expands the probability
//!    tree axis by axis.
//!
//! Each expansion is index-preserving: branch `i` keeps the last outcome in
//! place and appends the earlier outcomes at the end, so already-issued branch
//! indices stay valid while the tree grows. Probability closure is checked
//! after the full expansion; a violation means the regression layer supplied
//! an inconsistent conditional table and is fatal.

use std::sync::Arc;

use thiserror::Error;

use crate::config::DecisionConfig;
use crate::model::{
    CareProvision, GridCoded, Regression, RegressionInput, TaxBenefitCalculator, TaxQuery,
    TransitionModel,
};
use crate::quadrature::{GaussHermite, QuadratureError};
use crate::scale::{band_fertile_window, Axis, GridScale, CHILD_BANDS};
use crate::state::{StateError, States};

#[derive(Debug, Error)]
pub enum ExpectationsError {
    #[error("Probability mass in {context} sums to {sum}, not 1.")]
    ProbabilityMass { context: &'static str, sum: f64 },

    #[error("The conditional distribution for axis '{axis}' is empty.")]
    EmptyDistribution { axis: String },

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Quadrature(#[from] QuadratureError),
}

/// A single-axis conditional distribution: paired outcome values and
/// probabilities.
#[derive(Debug, Clone)]
pub struct LocalExpectations {
    values: Vec<f64>,
    probabilities: Vec<f64>,
}

impl LocalExpectations {
    /// A degenerate distribution concentrated on one value.
    pub fn certain(value: f64) -> Self {
        Self {
            values: vec![value],
            probabilities: vec![1.0],
        }
    }

    /// A two-outcome distribution. The probability is clamped into `[0, 1]`
    /// because regression scores occasionally overshoot by rounding.
    pub fn binary(value_true: f64, value_false: f64, p_true: f64) -> Self {
        let p = p_true.clamp(0.0, 1.0);
        Self {
            values: vec![value_true, value_false],
            probabilities: vec![p, 1.0 - p],
        }
    }

    /// A multinomial distribution from value-probability pairs; the mass must
    /// close to 1 within `tolerance`.
    pub fn from_pairs(
        pairs: Vec<(f64, f64)>,
        tolerance: f64,
    ) -> Result<Self, ExpectationsError> {
        let sum: f64 = pairs.iter().map(|(_, p)| p).sum();
        if (sum - 1.0).abs() > tolerance {
            return Err(ExpectationsError::ProbabilityMass {
                context: "a conditional distribution",
                sum,
            });
        }
        let (values, probabilities) = pairs.into_iter().unzip();
        Ok(Self {
            values,
            probabilities,
        })
    }

    /// A Gaussian shock discretized through the quadrature rule, with outcome
    /// values clamped into `[min, max]` so anticipated states stay on-grid.
    pub fn gaussian(rule: &GaussHermite, mean: f64, sd: f64, min: f64, max: f64) -> Self {
        let (values, probabilities) = rule
            .points(mean, sd)
            .into_iter()
            .map(|(v, p)| (v.clamp(min, max), p))
            .unzip();
        Self {
            values,
            probabilities,
        }
    }

    /// Drop outcomes below `min_probability` and renormalize. The largest
    /// outcome always survives, so the distribution never empties.
    pub fn screen(&mut self, min_probability: f64) {
        if self.probabilities.len() <= 1 {
            return;
        }
        let max = self
            .probabilities
            .iter()
            .cloned()
            .fold(f64::NEG_INFINITY, f64::max);
        let keep: Vec<bool> = self
            .probabilities
            .iter()
            .map(|&p| p >= min_probability || p >= max)
            .collect();
        if keep.iter().all(|&k| k) {
            return;
        }
        let mut values = Vec::new();
        let mut probabilities = Vec::new();
        for (i, &k) in keep.iter().enumerate() {
            if k {
                values.push(self.values[i]);
                probabilities.push(self.probabilities[i]);
            }
        }
        let mass: f64 = probabilities.iter().sum();
        for p in &mut probabilities {
            *p /= mass;
        }
        self.values = values;
        self.probabilities = probabilities;
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn probabilities(&self) -> &[f64] {
        &self.probabilities
    }
}

/// The joint distribution over anticipated next-period states for one
/// (state, discrete-control) evaluation, plus the current-period quantities
/// the utility evaluation needs alongside it.
#[derive(Debug, Clone)]
pub struct Expectations {
    /// Next-period age index; meaningless when `states` is empty (terminal).
    pub next_age_index: usize,
    pub states: Vec<States>,
    pub probabilities: Vec<f64>,
    varied: Vec<Axis>,
    proxy: Option<RegressionInput>,

    // Current-period quantities carried for the utility evaluation.
    pub cohabiting: bool,
    pub equivalence_scale: f64,
    pub liquid_wealth: f64,
    pub wage_per_hour: f64,
    pub pension_per_year: f64,
    pub available_credit: f64,
    pub mortality_probability: f64,
    pub cash_on_hand: f64,
    pub labour_share1: f64,
    pub labour_share2: f64,
}

impl Expectations {
    /// Whether the axis produced more than one outcome during this build.
    pub fn axis_varied(&self, axis: Axis) -> bool {
        self.varied.contains(&axis)
    }

    /// The regression proxy for a specific branch: the base proxy with every
    /// varied axis re-read from the branch's anticipated state.
    fn branch_proxy(&self, state: &States) -> Option<RegressionInput> {
        let base = self.proxy.as_ref()?;
        let mut proxy = base.clone();
        for &axis in &self.varied {
            match axis {
                Axis::Student => proxy.student = state.student(),
                Axis::Education => proxy.education = state.education(),
                Axis::Health => proxy.health = state.health(),
                Axis::Disability => proxy.disabled = state.disabled(),
                Axis::Cohabitation => proxy.cohabiting = state.cohabiting(),
                Axis::Retirement => proxy.retired = state.retired(),
                Axis::CareReceipt => proxy.care_receipt = state.care_receipt(),
                Axis::CareProvision => proxy.care_provision = state.care_provision(),
                Axis::Region => proxy.region = state.region(),
                Axis::Children(_) => {
                    proxy.children = state.children_by_band();
                    proxy.births = state.total_children();
                }
                Axis::WagePotential => {
                    if let Some(w) = state.wage_per_hour() {
                        proxy.wage_potential_per_hour = w;
                    }
                }
                _ => {}
            }
        }
        Some(proxy)
    }

    /// Expand one axis with the same distribution for every branch.
    pub fn expand_uniform(
        &mut self,
        axis: Axis,
        local: &LocalExpectations,
    ) -> Result<(), ExpectationsError> {
        if local.is_empty() {
            return Err(ExpectationsError::EmptyDistribution {
                axis: axis.label(),
            });
        }
        let count = self.states.len();
        let mut varied = false;
        for i in 0..count {
            varied |= self.apply_local(i, axis, local)?;
        }
        if varied {
            self.varied.push(axis);
        }
        Ok(())
    }

    /// Expand one axis with a per-branch distribution derived from the
    /// branch's regression proxy. Consecutive branches with identical proxies
    /// reuse the previous distribution instead of consulting the regression
    /// layer again.
    pub fn expand_per_branch<F>(
        &mut self,
        axis: Axis,
        mut local_for: F,
    ) -> Result<(), ExpectationsError>
    where
        F: FnMut(&RegressionInput) -> Result<LocalExpectations, ExpectationsError>,
    {
        let count = self.states.len();
        let mut varied = false;
        let mut cached: Option<(RegressionInput, LocalExpectations)> = None;
        for i in 0..count {
            let Some(proxy) = self.branch_proxy(&self.states[i]) else {
                continue;
            };
            let local = match &cached {
                Some((p, l)) if *p == proxy => l.clone(),
                _ => {
                    let l = local_for(&proxy)?;
                    cached = Some((proxy, l.clone()));
                    l
                }
            };
            if local.is_empty() {
                return Err(ExpectationsError::EmptyDistribution {
                    axis: axis.label(),
                });
            }
            varied |= self.apply_local(i, axis, &local)?;
        }
        if varied {
            self.varied.push(axis);
        }
        Ok(())
    }

    /// Index-preserving expansion of one branch: the last outcome overwrites
    /// the branch in place, earlier outcomes are appended at the end with
    /// scaled probabilities.
    fn apply_local(
        &mut self,
        branch: usize,
        axis: Axis,
        local: &LocalExpectations,
    ) -> Result<bool, ExpectationsError> {
        let outcomes = local.len();
        let branch_probability = self.probabilities[branch];
        for k in 0..outcomes - 1 {
            let mut state = self.states[branch].clone();
            state.set_value(axis, local.values[k])?;
            self.states.push(state);
            self.probabilities
                .push(branch_probability * local.probabilities[k]);
        }
        self.states[branch].set_value(axis, local.values[outcomes - 1])?;
        self.probabilities[branch] = branch_probability * local.probabilities[outcomes - 1];
        Ok(outcomes > 1)
    }

    /// Terminal closure check over the whole tree.
    pub fn assert_closure(&self, tolerance: f64) -> Result<(), ExpectationsError> {
        if self.probabilities.is_empty() {
            return Ok(());
        }
        let sum: f64 = self.probabilities.iter().sum();
        if (sum - 1.0).abs() > tolerance {
            return Err(ExpectationsError::ProbabilityMass {
                context: "the anticipated-state tree",
                sum,
            });
        }
        Ok(())
    }
}

/// Builds `Expectations` objects against the collaborator models.
pub struct ExpectationsFactory<'a> {
    scale: Arc<GridScale>,
    transitions: &'a dyn TransitionModel,
    tax: &'a dyn TaxBenefitCalculator,
    quadrature: GaussHermite,
}

impl<'a> ExpectationsFactory<'a> {
    pub fn new(
        scale: Arc<GridScale>,
        transitions: &'a dyn TransitionModel,
        tax: &'a dyn TaxBenefitCalculator,
    ) -> Result<Self, QuadratureError> {
        let quadrature = GaussHermite::new(scale.config().quadrature_points)?;
        Ok(Self {
            scale,
            transitions,
            tax,
            quadrature,
        })
    }

    pub fn scale(&self) -> &Arc<GridScale> {
        &self.scale
    }

    fn config(&self) -> &DecisionConfig {
        self.scale.config()
    }

    /// Phase 1: the control-invariant, continuous-quantity-free part shared
    /// by every inner combination of one outer state.
    ///
    /// At the terminal age there is no next period; the tree stays empty and
    /// mortality is certain.
    pub fn outer(&self, state: &States) -> Result<Expectations, ExpectationsError> {
        let config = self.config();
        let adults = if state.cohabiting() { 2 } else { 1 };
        let equivalence_scale =
            1.0 + 0.5 * (adults as f64 - 1.0) + 0.3 * state.total_children() as f64;

        if state.age_index() == self.scale.last_age_index() {
            return Ok(Expectations {
                next_age_index: state.age_index(),
                states: Vec::new(),
                probabilities: Vec::new(),
                varied: Vec::new(),
                proxy: None,
                cohabiting: state.cohabiting(),
                equivalence_scale,
                liquid_wealth: 0.0,
                wage_per_hour: 0.0,
                pension_per_year: 0.0,
                available_credit: 0.0,
                mortality_probability: 1.0,
                cash_on_hand: 0.0,
                labour_share1: 0.0,
                labour_share2: 0.0,
            });
        }

        let next_age_index = state.age_index() + 1;
        let mut seed = States::new(Arc::clone(&self.scale), next_age_index);
        // Roll every currently-stored axis value forward; stochastic axes are
        // overwritten during expansion, the rest persist deterministically.
        for &axis in Axis::ORDER {
            if let Some(value) = state.value(axis) {
                seed.set_value(axis, value)?;
            }
        }

        let proxy = RegressionInput {
            age_years: state.age_years() + 1,
            birth_year: state.birth_year(),
            gender: state.gender(),
            education: state.education(),
            student: state.student(),
            health: state.health(),
            disabled: state.disabled(),
            cohabiting: state.cohabiting(),
            retired: state.retired(),
            children: state.children_by_band(),
            region: state.region(),
            care_receipt: state.care_receipt(),
            care_provision: state.care_provision(),
            births: state.total_children(),
            wage_potential_per_hour: state
                .wage_per_hour()
                .unwrap_or(config.min_wage_per_hour),
        };

        Ok(Expectations {
            next_age_index,
            states: vec![seed],
            probabilities: vec![1.0],
            varied: Vec::new(),
            proxy: Some(proxy),
            cohabiting: state.cohabiting(),
            equivalence_scale,
            liquid_wealth: 0.0,
            wage_per_hour: 0.0,
            pension_per_year: 0.0,
            available_credit: 0.0,
            mortality_probability: 0.0,
            cash_on_hand: 0.0,
            labour_share1: 0.0,
            labour_share2: 0.0,
        })
    }

    /// Phase 2: add the continuous quantities of the current inner state.
    ///
    /// The outer template carries the inner axes at their grid minimums, so
    /// the regression proxy must be re-pointed at this state's wage before
    /// anything conditions on it; mortality and the wage-potential expansion
    /// both read it.
    pub fn invariant(
        &self,
        outer: &Expectations,
        state: &States,
    ) -> Result<Expectations, ExpectationsError> {
        let config = self.config();
        let mut expectations = outer.clone();
        expectations.liquid_wealth = state.liquid_wealth();
        expectations.wage_per_hour = state
            .wage_per_hour()
            .unwrap_or(config.min_wage_per_hour);
        expectations.pension_per_year = state.pension_per_year();

        let annual_wage = expectations.wage_per_hour
            * config.hours_per_week_full_time
            * config.weeks_per_year;
        expectations.available_credit =
            (-config.min_liquid_wealth).min(config.credit_wage_multiple * annual_wage).max(0.0);

        if let Some(proxy) = &mut expectations.proxy {
            proxy.wage_potential_per_hour = expectations.wage_per_hour;
            expectations.mortality_probability = self
                .transitions
                .probability(proxy, Regression::Mortality)
                .clamp(0.0, 1.0);
        }
        Ok(expectations)
    }

    /// Phase 3: fold in the chosen employment shares and expand the tree.
    pub fn for_controls(
        &self,
        invariant: &Expectations,
        state: &States,
        share1: f64,
        share2: f64,
    ) -> Result<Expectations, ExpectationsError> {
        let config = self.config();
        let mut exp = invariant.clone();
        exp.labour_share1 = share1;
        exp.labour_share2 = share2;

        let hours1 = share1 * config.hours_per_week_full_time;
        let hours2 = share2 * config.hours_per_week_full_time;
        let labour_income1 = exp.wage_per_hour * hours1 * config.weeks_per_year;
        let labour_income2 = exp.wage_per_hour * config.partner_wage_ratio
            * hours2
            * config.weeks_per_year;

        // Lump-sum annuitization, triggered exactly once: the first period in
        // which retirement holds while no pension income is recorded yet.
        let mut wealth = exp.liquid_wealth;
        let mut pension = exp.pension_per_year;
        if state.retired() && pension <= config.min_pension_per_year + 1e-9 {
            let pot = config.pension_wealth_share * wealth.max(0.0);
            pension = config.annuity_rate * pot;
            wealth -= pot;
        }

        // Asymmetric return: the safe rate on savings, a leverage-blended
        // debt rate on borrowing.
        let annual_wage =
            exp.wage_per_hour * config.hours_per_week_full_time * config.weeks_per_year;
        let investment_income = if wealth >= 0.0 {
            config.safe_return * wealth
        } else {
            let leverage = if annual_wage > 0.0 {
                (-wealth / annual_wage).clamp(0.0, 1.0)
            } else {
                1.0
            };
            (config.debt_rate_low + (config.debt_rate_high - config.debt_rate_low) * leverage)
                * wealth
        };

        let children = state.children_by_band();
        let childcare_cost = config.childcare_cost_per_child_month
            * state.total_children() as f64;
        let social_care_cost = match state.care_receipt() {
            crate::model::CareReceipt::Formal | crate::model::CareReceipt::Mixed => {
                config.social_care_cost_month
            }
            _ => 0.0,
        };
        let adults = if exp.cohabiting { 2 } else { 1 };
        let query = TaxQuery {
            year: state.birth_year() + state.age_years() as i32 + 1,
            age_next: state.age_years() + 1,
            adults,
            children,
            hours_per_week_1: hours1,
            hours_per_week_2: hours2,
            disabled_1: state.disabled(),
            gross_income_per_month: (labour_income1 + pension) / 12.0,
            second_income_per_month: labour_income2 / 12.0,
            childcare_cost_per_month: childcare_cost,
            social_care_cost_per_month: social_care_cost,
            liquid_wealth: wealth,
        };
        let disposable = self.tax.disposable_income_per_month(&query) * 12.0;
        exp.cash_on_hand = wealth + disposable + investment_income;

        if exp.states.is_empty() {
            // Terminal age: nothing to anticipate.
            return Ok(exp);
        }

        self.expand_tree(&mut exp, state, pension)?;
        exp.assert_closure(config.probability_tolerance)?;
        Ok(exp)
    }

    /// Axis-by-axis expansion, deterministic axes first, wage potential last
    /// because its score depends on the anticipated outcomes of most of the
    /// others. Liquid wealth is never expanded here; the utility evaluation
    /// writes it per candidate consumption.
    fn expand_tree(
        &self,
        exp: &mut Expectations,
        state: &States,
        pension_per_year: f64,
    ) -> Result<(), ExpectationsError> {
        let config = self.config();
        let next_age = exp.states[0].age_years();
        let next_scale = self.scale.age(exp.next_age_index);
        let active = |axis: Axis| next_scale.axis_position(axis).is_some();

        if active(Axis::PensionIncome) {
            let spec = next_scale
                .spec(Axis::PensionIncome)
                .expect("spec exists for an active axis");
            let coord = (pension_per_year + 1.0).ln().clamp(spec.min, spec.max);
            exp.expand_uniform(Axis::PensionIncome, &LocalExpectations::certain(coord))?;
        }

        if active(Axis::Student) && state.student() {
            let p = self.branch_probability(exp, Regression::StudentContinuation);
            exp.expand_uniform(Axis::Student, &self.screened(LocalExpectations::binary(1.0, 0.0, p)))?;
        }

        if active(Axis::Education) && exp.axis_varied(Axis::Student) {
            let current_education = state.education().code();
            let transitions = self.transitions;
            let tolerance = config.probability_tolerance;
            let screen = config.screen_probabilities.then_some(config.min_probability);
            exp.expand_per_branch(Axis::Education, |proxy| {
                if proxy.student {
                    return Ok(LocalExpectations::certain(current_education));
                }
                let pairs = transitions.distribution(proxy, Regression::EducationOutcome);
                let mut local = LocalExpectations::from_pairs(pairs, tolerance)?;
                if let Some(min) = screen {
                    local.screen(min);
                }
                Ok(local)
            })?;
        }

        if active(Axis::Health) {
            self.expand_multinomial(exp, Axis::Health, Regression::HealthTransition)?;
        }

        if active(Axis::Disability) {
            let transitions = self.transitions;
            exp.expand_per_branch(Axis::Disability, |proxy| {
                let p = transitions.probability(proxy, Regression::Disability);
                Ok(LocalExpectations::binary(1.0, 0.0, p))
            })?;
        }

        if active(Axis::Cohabitation) {
            let transitions = self.transitions;
            exp.expand_per_branch(Axis::Cohabitation, |proxy| {
                let p = if proxy.cohabiting {
                    1.0 - transitions.probability(proxy, Regression::CohabitationDissolution)
                } else {
                    transitions.probability(proxy, Regression::CohabitationFormation)
                };
                Ok(LocalExpectations::binary(1.0, 0.0, p))
            })?;
        }

        if active(Axis::CareReceipt) {
            self.expand_multinomial(exp, Axis::CareReceipt, Regression::CareReceiptTransition)?;
        }

        if active(Axis::CareProvision) {
            let transitions = self.transitions;
            let tolerance = config.probability_tolerance;
            let screen = config.screen_probabilities.then_some(config.min_probability);
            exp.expand_per_branch(Axis::CareProvision, |proxy| {
                let mut pairs =
                    transitions.distribution(proxy, Regression::CareProvisionTransition);
                if !proxy.cohabiting {
                    // Partner-directed care is impossible without a partner.
                    pairs.retain(|&(value, _)| {
                        !matches!(
                            CareProvision::from_code(value),
                            Some(CareProvision::ToPartner)
                                | Some(CareProvision::ToPartnerAndOther)
                        )
                    });
                    let mass: f64 = pairs.iter().map(|(_, p)| p).sum();
                    if mass > 0.0 {
                        for (_, p) in &mut pairs {
                            *p /= mass;
                        }
                    }
                }
                let mut local = LocalExpectations::from_pairs(pairs, tolerance)?;
                if let Some(min) = screen {
                    local.screen(min);
                }
                Ok(local)
            })?;
        }

        if active(Axis::Region) && config.flag_region_mobility {
            self.expand_multinomial(exp, Axis::Region, Regression::RegionMobility)?;
        }

        for band in 0..CHILD_BANDS {
            if !active(Axis::Children(band)) {
                continue;
            }
            let (band_min, band_max) = band_fertile_window(config, band);
            if next_age < band_min || next_age > band_max {
                continue;
            }
            let local = self.fertility_distribution(exp, band, state.children(band), next_age)?;
            exp.expand_uniform(Axis::Children(band), &local)?;
        }

        if active(Axis::WageOffer1) {
            let transitions = self.transitions;
            exp.expand_per_branch(Axis::WageOffer1, |proxy| {
                let p = transitions.probability(proxy, Regression::WageOffer1);
                Ok(LocalExpectations::binary(1.0, 0.0, p))
            })?;
        }

        if active(Axis::WageOffer2) {
            let transitions = self.transitions;
            exp.expand_per_branch(Axis::WageOffer2, |proxy| {
                if !proxy.cohabiting {
                    return Ok(LocalExpectations::certain(0.0));
                }
                let p = transitions.probability(proxy, Regression::WageOffer2);
                Ok(LocalExpectations::binary(1.0, 0.0, p))
            })?;
        }

        if active(Axis::WagePotential) {
            let spec = next_scale
                .spec(Axis::WagePotential)
                .expect("spec exists for an active axis");
            let (min, max) = (spec.min, spec.max);
            let transitions = self.transitions;
            let rule = &self.quadrature;
            let screen = config.screen_probabilities.then_some(config.min_probability);
            exp.expand_per_branch(Axis::WagePotential, |proxy| {
                let score = transitions.gaussian_score(proxy, Regression::WagePotential);
                let mut local = LocalExpectations::gaussian(rule, score.mean, score.rmse, min, max);
                if let Some(min_p) = screen {
                    local.screen(min_p);
                }
                Ok(local)
            })?;
        }

        Ok(())
    }

    /// Binary probability evaluated on the base proxy (uniform across
    /// branches).
    fn branch_probability(&self, exp: &Expectations, regression: Regression) -> f64 {
        exp.proxy
            .as_ref()
            .map(|proxy| self.transitions.probability(proxy, regression))
            .unwrap_or(0.0)
    }

    fn expand_multinomial(
        &self,
        exp: &mut Expectations,
        axis: Axis,
        regression: Regression,
    ) -> Result<(), ExpectationsError> {
        let config = self.config();
        let transitions = self.transitions;
        let tolerance = config.probability_tolerance;
        let screen = config.screen_probabilities.then_some(config.min_probability);
        exp.expand_per_branch(axis, |proxy| {
            let pairs = transitions.distribution(proxy, regression);
            let mut local = LocalExpectations::from_pairs(pairs, tolerance)?;
            if let Some(min) = screen {
                local.screen(min);
            }
            Ok(local)
        })
    }

    /// Distribution over next-period birth counts within one band.
    ///
    /// The count vector starts as a point mass at the recorded count and the
    /// per-age fertility probability moves "flow" one count upward. Counts are
    /// processed from highest to lowest so the flow that just arrived at a
    /// count is not moved again within the same age.
    fn fertility_distribution(
        &self,
        exp: &Expectations,
        band: usize,
        existing: usize,
        next_age: u32,
    ) -> Result<LocalExpectations, ExpectationsError> {
        let config = self.config();
        let max_births = config.max_births_per_band;
        let mut probabilities = vec![0.0; max_births + 1];
        probabilities[existing.min(max_births)] = 1.0;

        if let Some(base) = &exp.proxy {
            self.fertility_flow(&mut probabilities, base, band, next_age);
        }

        let mut pairs: Vec<(f64, f64)> = probabilities
            .into_iter()
            .enumerate()
            .filter(|&(_, p)| p > 0.0)
            .map(|(n, p)| (n as f64, p))
            .collect();
        if config.screen_probabilities {
            let mass: f64 = pairs.iter().map(|(_, p)| p).sum();
            pairs.retain(|&(_, p)| p >= config.min_probability * mass);
            let kept: f64 = pairs.iter().map(|(_, p)| p).sum();
            for (_, p) in &mut pairs {
                *p /= kept;
            }
        }
        LocalExpectations::from_pairs(pairs, config.probability_tolerance)
    }

    /// One age-step of the band fold, highest existing count first.
    fn fertility_flow(
        &self,
        probabilities: &mut [f64],
        base: &RegressionInput,
        _band: usize,
        age_years: u32,
    ) {
        let max = probabilities.len() - 1;
        for n in (0..max).rev() {
            if probabilities[n] <= 0.0 {
                continue;
            }
            let mut proxy = base.clone();
            proxy.age_years = age_years;
            proxy.births = n;
            let p = self
                .transitions
                .probability(&proxy, Regression::Fertility)
                .clamp(0.0, 1.0);
            let flow = probabilities[n] * p;
            probabilities[n] -= flow;
            probabilities[n + 1] += flow;
        }
    }

    /// Optional screening applied to a freshly built binary distribution.
    fn screened(&self, mut local: LocalExpectations) -> LocalExpectations {
        let config = self.config();
        if config.screen_probabilities {
            local.screen(config.min_probability);
        }
        local
    }
}
