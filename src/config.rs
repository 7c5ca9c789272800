use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Age range is invalid: start age {start} must be below maximum age {max}.")]
    InvalidAgeRange { start: u32, max: u32 },

    #[error("Start-solving age {0} lies outside the simulated age range.")]
    StartSolvingAgeOutOfRange(u32),

    #[error("Continuous axis '{axis}' needs at least 2 grid points, but {points} were configured.")]
    TooFewGridPoints { axis: &'static str, points: usize },

    #[error("Bounds for '{axis}' are inverted: lower {lower} is not below upper {upper}.")]
    InvertedBounds {
        axis: &'static str,
        lower: f64,
        upper: f64,
    },

    #[error("Wealth shift constant {0} does not keep log(wealth + shift) defined at the lower wealth bound.")]
    WealthShiftTooSmall(f64),

    #[error("Quadrature requires at least 2 points, but {0} were configured.")]
    TooFewQuadraturePoints(usize),

    #[error("Tolerance '{name}' must be positive and finite, but was {value}.")]
    InvalidTolerance { name: &'static str, value: f64 },

    #[error("Preference parameter '{name}' is outside its admissible range: {value}.")]
    InvalidPreference { name: &'static str, value: f64 },
}

fn default_probability_tolerance() -> f64 {
    1e-5
}

fn default_min_probability() -> f64 {
    1e-4
}

fn default_min_surviving_mass() -> f64 {
    0.8
}

fn default_fixed_employment_share() -> f64 {
    1.0
}

fn default_partner_wage_ratio() -> f64 {
    0.85
}

/// Immutable solver configuration.
///
/// Constructed once before any grid exists and passed by reference (or inside
/// an `Arc` next to the `GridScale`) into every component, so the solve is a
/// pure function of this value plus the collaborator models.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionConfig {
    // Horizon.
    pub start_age: u32,
    pub max_age: u32,
    /// Solve backwards starting from this age instead of `max_age`; the value
    /// function above it must already be present in the grids.
    pub start_solving_age: Option<u32>,
    pub max_flexible_labour_age: u32,
    pub min_retirement_age: u32,
    pub min_health_age: u32,
    pub max_student_age: u32,
    pub fertility_min_age: u32,
    pub fertility_max_age: u32,
    pub child_dependent_years: u32,
    pub max_births_per_band: usize,

    // Axis activation.
    pub flag_retirement: bool,
    pub flag_health: bool,
    pub flag_disability: bool,
    pub flag_region: bool,
    pub flag_region_mobility: bool,
    pub flag_education: bool,
    pub flag_student: bool,
    pub flag_social_care: bool,
    pub flag_wage_offer1: bool,
    pub flag_wage_offer2: bool,
    pub flag_cohabitation: bool,
    pub flag_children: bool,

    // Cardinalities.
    pub wealth_points: usize,
    pub wage_points: usize,
    pub pension_points: usize,
    pub birth_year_points: usize,
    /// Number of discrete employment-share options; shares are spaced
    /// `1/(options-1)`. One option means employment is not a decision and
    /// `fixed_employment_share` is used whenever an offer is in hand.
    pub employment_options: usize,
    #[serde(default = "default_fixed_employment_share")]
    pub fixed_employment_share: f64,
    pub quadrature_points: usize,

    // Continuous-axis bounds and transforms (levels, not grid coordinates).
    pub min_liquid_wealth: f64,
    pub max_liquid_wealth: f64,
    /// Shift constant `c` in the stored wealth coordinate `log(w + c)`.
    pub wealth_shift: f64,
    pub min_wage_per_hour: f64,
    pub max_wage_per_hour: f64,
    pub min_pension_per_year: f64,
    pub max_pension_per_year: f64,
    pub min_birth_year: i32,

    // Preferences.
    pub gamma: f64,
    pub epsilon: f64,
    pub discount_factor: f64,
    pub price_of_leisure_single: f64,
    pub price_of_leisure_couple: f64,
    pub bequest_slope: f64,

    // Returns and credit.
    pub safe_return: f64,
    pub debt_rate_low: f64,
    pub debt_rate_high: f64,
    pub credit_wage_multiple: f64,
    pub annuity_rate: f64,
    /// Share of liquid wealth annuitized on first entering retirement with no
    /// recorded pension income.
    pub pension_wealth_share: f64,

    // Labour.
    pub hours_per_week_full_time: f64,
    pub weeks_per_year: f64,
    #[serde(default = "default_partner_wage_ratio")]
    pub partner_wage_ratio: f64,

    // Costs fed to the tax/benefit collaborator.
    pub childcare_cost_per_child_month: f64,
    pub social_care_cost_month: f64,

    // Screening and tolerances.
    pub screen_probabilities: bool,
    #[serde(default = "default_min_probability")]
    pub min_probability: f64,
    #[serde(default = "default_probability_tolerance")]
    pub probability_tolerance: f64,
    #[serde(default = "default_min_surviving_mass")]
    pub min_surviving_mass: f64,
    pub min_consumption: f64,

    // Outputs.
    pub grids_directory: PathBuf,
    pub persist_grids: bool,
    pub load_grids: bool,
    pub checkpoint_grids: bool,
    pub dump_csv: bool,
}

impl DecisionConfig {
    /// Number of simulated age-periods, `0..simulated_lifespan()` indexing them.
    pub fn simulated_lifespan(&self) -> usize {
        (self.max_age - self.start_age + 1) as usize
    }

    pub fn age_index(&self, age_years: u32) -> usize {
        debug_assert!(age_years >= self.start_age && age_years <= self.max_age);
        (age_years - self.start_age) as usize
    }

    /// Discrete employment-share options for one earner holding a wage offer.
    pub fn employment_shares(&self) -> Vec<f64> {
        if self.employment_options <= 1 {
            vec![self.fixed_employment_share]
        } else {
            let n = self.employment_options;
            (0..n).map(|i| i as f64 / (n - 1) as f64).collect()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.start_age >= self.max_age {
            return Err(ConfigError::InvalidAgeRange {
                start: self.start_age,
                max: self.max_age,
            });
        }
        if let Some(age) = self.start_solving_age {
            if age <= self.start_age || age > self.max_age {
                return Err(ConfigError::StartSolvingAgeOutOfRange(age));
            }
        }
        for (axis, points) in [
            ("liquid wealth", self.wealth_points),
            ("wage potential", self.wage_points),
        ] {
            if points < 2 {
                return Err(ConfigError::TooFewGridPoints { axis, points });
            }
        }
        if self.flag_retirement && self.pension_points < 2 {
            return Err(ConfigError::TooFewGridPoints {
                axis: "pension income",
                points: self.pension_points,
            });
        }
        for (axis, lower, upper) in [
            ("liquid wealth", self.min_liquid_wealth, self.max_liquid_wealth),
            ("wage potential", self.min_wage_per_hour, self.max_wage_per_hour),
            (
                "pension income",
                self.min_pension_per_year,
                self.max_pension_per_year,
            ),
        ] {
            if lower >= upper {
                return Err(ConfigError::InvertedBounds { axis, lower, upper });
            }
        }
        if self.min_liquid_wealth + self.wealth_shift <= 0.0 {
            return Err(ConfigError::WealthShiftTooSmall(self.wealth_shift));
        }
        if self.quadrature_points < 2 {
            return Err(ConfigError::TooFewQuadraturePoints(self.quadrature_points));
        }
        for (name, value) in [
            ("probability_tolerance", self.probability_tolerance),
            ("min_probability", self.min_probability),
            ("min_consumption", self.min_consumption),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::InvalidTolerance { name, value });
            }
        }
        if !(0.0..=1.0).contains(&self.min_surviving_mass) {
            return Err(ConfigError::InvalidTolerance {
                name: "min_surviving_mass",
                value: self.min_surviving_mass,
            });
        }
        if !self.gamma.is_finite() || self.gamma <= 0.0 || (self.gamma - 1.0).abs() < 1e-9 {
            return Err(ConfigError::InvalidPreference {
                name: "gamma",
                value: self.gamma,
            });
        }
        if !self.epsilon.is_finite() || self.epsilon <= 0.0 || (self.epsilon - 1.0).abs() < 1e-9 {
            return Err(ConfigError::InvalidPreference {
                name: "epsilon",
                value: self.epsilon,
            });
        }
        if !(0.0..=1.0).contains(&self.discount_factor) {
            return Err(ConfigError::InvalidPreference {
                name: "discount_factor",
                value: self.discount_factor,
            });
        }
        Ok(())
    }

    /// A complete baseline configuration; tests override the fields they care
    /// about instead of repeating the whole struct.
    pub fn baseline() -> Self {
        Self {
            start_age: 18,
            max_age: 100,
            start_solving_age: None,
            max_flexible_labour_age: 75,
            min_retirement_age: 55,
            min_health_age: 50,
            max_student_age: 29,
            fertility_min_age: 18,
            fertility_max_age: 44,
            child_dependent_years: 18,
            max_births_per_band: 2,
            flag_retirement: true,
            flag_health: true,
            flag_disability: true,
            flag_region: false,
            flag_region_mobility: false,
            flag_education: true,
            flag_student: true,
            flag_social_care: false,
            flag_wage_offer1: true,
            flag_wage_offer2: true,
            flag_cohabitation: true,
            flag_children: true,
            wealth_points: 31,
            wage_points: 11,
            pension_points: 7,
            birth_year_points: 1,
            employment_options: 3,
            fixed_employment_share: default_fixed_employment_share(),
            quadrature_points: 5,
            min_liquid_wealth: -30_000.0,
            max_liquid_wealth: 2_000_000.0,
            wealth_shift: 50_001.0,
            min_wage_per_hour: 1.0,
            max_wage_per_hour: 150.0,
            min_pension_per_year: 0.0,
            max_pension_per_year: 100_000.0,
            min_birth_year: 1980,
            gamma: 1.5,
            epsilon: 0.75,
            discount_factor: 0.97,
            price_of_leisure_single: 0.3,
            price_of_leisure_couple: 0.4,
            bequest_slope: 0.0,
            safe_return: 0.02,
            debt_rate_low: 0.05,
            debt_rate_high: 0.12,
            credit_wage_multiple: 0.5,
            annuity_rate: 0.05,
            pension_wealth_share: 0.75,
            hours_per_week_full_time: 37.5,
            weeks_per_year: 52.0,
            partner_wage_ratio: default_partner_wage_ratio(),
            childcare_cost_per_child_month: 400.0,
            social_care_cost_month: 800.0,
            screen_probabilities: true,
            min_probability: default_min_probability(),
            probability_tolerance: default_probability_tolerance(),
            min_surviving_mass: default_min_surviving_mass(),
            min_consumption: 1_000.0,
            grids_directory: PathBuf::from("output/grids"),
            persist_grids: false,
            load_grids: false,
            checkpoint_grids: false,
            dump_csv: false,
        }
    }
}
