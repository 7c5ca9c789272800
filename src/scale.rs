//! State-space definition: axes, per-age layout, and flat-array sizing.
//!
//! A `GridScale` fixes, for every age-period, the ordered list of active state
//! axes together with their cardinality, bounds, continuity classification and
//! inner/outer-loop membership, and derives the per-age flat-array metadata
//! (inner/outer combination counts, slice size, cumulative offset) that the
//! index codec and the interpolation rely on.
//!
//! Two layout invariants are enforced at construction because downstream
//! algorithms index against them: continuous axes form a contiguous leading
//! block, and inner-loop axes form a contiguous block at the very front.

use thiserror::Error;

use crate::config::{ConfigError, DecisionConfig};
use crate::model::{CareProvision, CareReceipt, Education, Gender, GridCoded, Health, Region};

/// Number of dependent-children birth-cohort bands tracked on the grid.
pub const CHILD_BANDS: usize = 3;

/// One dimension of the discretized state space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    LiquidWealth,
    WagePotential,
    PensionIncome,
    BirthYear,
    WageOffer1,
    WageOffer2,
    Retirement,
    Health,
    Disability,
    CareReceipt,
    CareProvision,
    Region,
    Student,
    Education,
    Children(usize),
    Cohabitation,
    Gender,
}

impl Axis {
    /// Canonical placement order: continuous axes first with birth year
    /// closing that block, then the wage-offer axes heading the discrete
    /// block, then the remaining discrete axes.
    pub const ORDER: &'static [Axis] = &[
        Axis::LiquidWealth,
        Axis::WagePotential,
        Axis::PensionIncome,
        Axis::BirthYear,
        Axis::WageOffer1,
        Axis::WageOffer2,
        Axis::Retirement,
        Axis::Health,
        Axis::Disability,
        Axis::CareReceipt,
        Axis::CareProvision,
        Axis::Region,
        Axis::Student,
        Axis::Education,
        Axis::Children(0),
        Axis::Children(1),
        Axis::Children(2),
        Axis::Cohabitation,
        Axis::Gender,
    ];

    pub fn label(&self) -> String {
        match self {
            Axis::Children(band) => format!("children{band}"),
            other => format!("{other:?}").to_lowercase(),
        }
    }
}

/// Per-age description of one active axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisSpec {
    pub axis: Axis,
    pub count: usize,
    pub min: f64,
    pub max: f64,
    /// 0 = discrete, 0.5 = ambiguous (discrete for solving, continuous for
    /// forward simulation), 1 = continuous.
    pub continuity: f64,
    /// Inner-loop axes are solved in the parallel inner-state loop.
    pub inner: bool,
}

impl AxisSpec {
    /// Grid spacing; zero for single-point axes.
    pub fn step(&self) -> f64 {
        if self.count > 1 {
            (self.max - self.min) / (self.count - 1) as f64
        } else {
            0.0
        }
    }
}

/// Layout and sizing metadata for one age-period. Immutable after
/// construction.
#[derive(Debug, Clone)]
pub struct AgeScale {
    pub age_years: u32,
    pub axes: Vec<AxisSpec>,
    /// Number of leading inner-loop axes.
    pub inner_axes: usize,
    pub inner_count: u64,
    pub outer_count: u64,
    pub slice_size: u64,
    /// Cumulative offset of this age-slice in the global flat array.
    pub offset: u64,
}

impl AgeScale {
    pub fn axis_position(&self, axis: Axis) -> Option<usize> {
        self.axes.iter().position(|spec| spec.axis == axis)
    }

    pub fn spec(&self, axis: Axis) -> Option<&AxisSpec> {
        self.axes.iter().find(|spec| spec.axis == axis)
    }
}

#[derive(Debug, Error)]
pub enum ScaleError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Continuous axes are not a contiguous leading block at age {age} (axis '{axis}' follows a discrete axis).")]
    NonContiguousContinuous { age: u32, axis: String },

    #[error("Inner-loop axes are not a contiguous leading block at age {age} (axis '{axis}' follows an outer axis).")]
    NonContiguousInner { age: u32, axis: String },
}

/// The full state-space layout over every simulated age-period, owning the
/// configuration it was derived from.
#[derive(Debug, Clone)]
pub struct GridScale {
    config: DecisionConfig,
    ages: Vec<AgeScale>,
}

impl GridScale {
    pub fn new(config: DecisionConfig) -> Result<Self, ScaleError> {
        config.validate()?;

        let mut ages = Vec::with_capacity(config.simulated_lifespan());
        let mut offset = 0u64;
        for age_years in config.start_age..=config.max_age {
            let axes = active_axes(&config, age_years);
            check_layout(age_years, &axes)?;

            let inner_axes = axes.iter().take_while(|spec| spec.inner).count();
            let inner_count: u64 = axes
                .iter()
                .filter(|spec| spec.inner)
                .map(|spec| spec.count as u64)
                .product();
            let outer_count: u64 = axes
                .iter()
                .filter(|spec| !spec.inner)
                .map(|spec| spec.count as u64)
                .product();
            let slice_size = inner_count * outer_count;

            ages.push(AgeScale {
                age_years,
                axes,
                inner_axes,
                inner_count,
                outer_count,
                slice_size,
                offset,
            });
            offset += slice_size;
        }

        Ok(Self { config, ages })
    }

    pub fn config(&self) -> &DecisionConfig {
        &self.config
    }

    pub fn ages(&self) -> &[AgeScale] {
        &self.ages
    }

    pub fn age(&self, age_index: usize) -> &AgeScale {
        &self.ages[age_index]
    }

    pub fn age_index(&self, age_years: u32) -> usize {
        self.config.age_index(age_years)
    }

    pub fn last_age_index(&self) -> usize {
        self.ages.len() - 1
    }

    /// Position of `axis` in the per-age axis array, or `None` when the axis
    /// stores nothing at that age. `None` is a normal outcome, not an error.
    pub fn axis_position(&self, axis: Axis, age_years: u32) -> Option<usize> {
        self.ages[self.age_index(age_years)].axis_position(axis)
    }

    /// Total flat-array size across the whole lifespan.
    pub fn total_size(&self) -> u64 {
        self.ages
            .last()
            .map(|a| a.offset + a.slice_size)
            .unwrap_or(0)
    }

    /// Flat-array size through the last age with flexible labour supply; the
    /// employment grids span only this prefix.
    pub fn flexible_labour_size(&self) -> u64 {
        if self.config.max_flexible_labour_age < self.config.start_age {
            return 0;
        }
        let last_flexible = self
            .config
            .max_flexible_labour_age
            .min(self.config.max_age);
        let age = &self.ages[self.age_index(last_flexible)];
        age.offset + age.slice_size
    }
}

/// Fertile-age window of one children band, before dependency years extend
/// its storage window.
pub fn band_fertile_window(config: &DecisionConfig, band: usize) -> (u32, u32) {
    let span = config.fertility_max_age - config.fertility_min_age + 1;
    let width = span.div_ceil(CHILD_BANDS as u32);
    let start = config.fertility_min_age + band as u32 * width;
    let end = (start + width - 1).min(config.fertility_max_age);
    (start, end)
}

fn children_band_active(config: &DecisionConfig, band: usize, age_years: u32) -> bool {
    if !config.flag_children {
        return false;
    }
    let (start, end) = band_fertile_window(config, band);
    if start > config.fertility_max_age {
        return false;
    }
    age_years >= start && age_years <= end + config.child_dependent_years
}

fn active_axes(config: &DecisionConfig, age_years: u32) -> Vec<AxisSpec> {
    let flexible = age_years <= config.max_flexible_labour_age;
    let mut axes = Vec::new();

    for &axis in Axis::ORDER {
        let spec = match axis {
            Axis::LiquidWealth => Some(AxisSpec {
                axis,
                count: config.wealth_points,
                min: (config.min_liquid_wealth + config.wealth_shift).ln(),
                max: (config.max_liquid_wealth + config.wealth_shift).ln(),
                continuity: 1.0,
                inner: true,
            }),
            Axis::WagePotential => flexible.then(|| AxisSpec {
                axis,
                count: config.wage_points,
                min: config.min_wage_per_hour.ln(),
                max: config.max_wage_per_hour.ln(),
                continuity: 1.0,
                inner: true,
            }),
            Axis::PensionIncome => (config.flag_retirement
                && age_years >= config.min_retirement_age)
                .then(|| AxisSpec {
                    axis,
                    count: config.pension_points,
                    min: (config.min_pension_per_year + 1.0).ln(),
                    max: (config.max_pension_per_year + 1.0).ln(),
                    continuity: 1.0,
                    inner: true,
                }),
            Axis::BirthYear => Some(AxisSpec {
                axis,
                count: config.birth_year_points,
                min: config.min_birth_year as f64,
                max: (config.min_birth_year + config.birth_year_points as i32 - 1) as f64,
                continuity: 0.5,
                inner: false,
            }),
            Axis::WageOffer1 => (config.flag_wage_offer1 && flexible).then(|| binary_axis(axis)),
            Axis::WageOffer2 => (config.flag_wage_offer2 && config.flag_cohabitation && flexible)
                .then(|| binary_axis(axis)),
            Axis::Retirement => (config.flag_retirement
                && age_years >= config.min_retirement_age
                && flexible)
                .then(|| binary_axis(axis)),
            Axis::Health => (config.flag_health && age_years >= config.min_health_age).then(|| {
                discrete_axis(axis, Health::COUNT)
            }),
            Axis::Disability => (config.flag_disability && age_years >= config.min_health_age)
                .then(|| binary_axis(axis)),
            Axis::CareReceipt => (config.flag_social_care && age_years >= config.min_health_age)
                .then(|| discrete_axis(axis, CareReceipt::COUNT)),
            Axis::CareProvision => (config.flag_social_care && age_years >= config.min_health_age)
                .then(|| discrete_axis(axis, CareProvision::COUNT)),
            Axis::Region => config.flag_region.then(|| discrete_axis(axis, Region::COUNT)),
            Axis::Student => (config.flag_student && age_years <= config.max_student_age)
                .then(|| binary_axis(axis)),
            Axis::Education => config
                .flag_education
                .then(|| discrete_axis(axis, Education::COUNT)),
            Axis::Children(band) => children_band_active(config, band, age_years)
                .then(|| discrete_axis(axis, config.max_births_per_band + 1)),
            Axis::Cohabitation => config.flag_cohabitation.then(|| binary_axis(axis)),
            Axis::Gender => Some(discrete_axis(axis, Gender::COUNT)),
        };
        if let Some(spec) = spec {
            axes.push(spec);
        }
    }

    axes
}

fn binary_axis(axis: Axis) -> AxisSpec {
    discrete_axis(axis, 2)
}

fn discrete_axis(axis: Axis, count: usize) -> AxisSpec {
    AxisSpec {
        axis,
        count,
        min: 0.0,
        max: (count - 1) as f64,
        continuity: 0.0,
        inner: false,
    }
}

fn check_layout(age_years: u32, axes: &[AxisSpec]) -> Result<(), ScaleError> {
    let mut seen_discrete = false;
    for spec in axes {
        if spec.continuity >= 0.5 {
            if seen_discrete {
                return Err(ScaleError::NonContiguousContinuous {
                    age: age_years,
                    axis: spec.axis.label(),
                });
            }
        } else {
            seen_discrete = true;
        }
    }

    let mut seen_outer = false;
    for spec in axes {
        if spec.inner {
            if seen_outer {
                return Err(ScaleError::NonContiguousInner {
                    age: age_years,
                    axis: spec.axis.label(),
                });
            }
        } else {
            seen_outer = true;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baseline_scale_builds_and_offsets_accumulate() {
        let scale = GridScale::new(DecisionConfig::baseline()).unwrap();
        let mut expected_offset = 0u64;
        for age in scale.ages() {
            assert_eq!(age.offset, expected_offset);
            assert_eq!(age.slice_size, age.inner_count * age.outer_count);
            expected_offset += age.slice_size;
        }
        assert_eq!(scale.total_size(), expected_offset);
    }

    #[test]
    fn continuous_axes_lead_every_age() {
        let scale = GridScale::new(DecisionConfig::baseline()).unwrap();
        for age in scale.ages() {
            let first_discrete = age
                .axes
                .iter()
                .position(|s| s.continuity < 0.5)
                .unwrap_or(age.axes.len());
            for spec in &age.axes[first_discrete..] {
                assert!(spec.continuity < 0.5, "axis {:?}", spec.axis);
            }
            for spec in &age.axes[age.inner_axes..] {
                assert!(!spec.inner, "axis {:?}", spec.axis);
            }
        }
    }

    #[test]
    fn age_gating_controls_axis_presence() {
        let config = DecisionConfig::baseline();
        let min_health = config.min_health_age;
        let max_flexible = config.max_flexible_labour_age;
        let scale = GridScale::new(config).unwrap();

        assert_eq!(scale.axis_position(Axis::Health, min_health - 1), None);
        assert!(scale.axis_position(Axis::Health, min_health).is_some());
        assert!(scale.axis_position(Axis::WageOffer1, max_flexible).is_some());
        assert_eq!(scale.axis_position(Axis::WageOffer1, max_flexible + 1), None);
        assert_eq!(scale.axis_position(Axis::WagePotential, max_flexible + 1), None);
    }

    #[test]
    fn employment_grid_prefix_is_shorter_than_total() {
        let scale = GridScale::new(DecisionConfig::baseline()).unwrap();
        let flexible = scale.flexible_labour_size();
        assert!(flexible > 0);
        assert!(flexible < scale.total_size());
    }

    #[test]
    fn children_bands_cover_the_fertile_window() {
        let config = DecisionConfig::baseline();
        let (start0, end0) = band_fertile_window(&config, 0);
        let (start2, end2) = band_fertile_window(&config, 2);
        assert_eq!(start0, config.fertility_min_age);
        assert!(end0 < start2 || CHILD_BANDS == 1);
        assert!(end2 <= config.fertility_max_age);
    }

    #[test]
    fn axis_step_spans_the_bounds() {
        let scale = GridScale::new(DecisionConfig::baseline()).unwrap();
        let age = scale.age(0);
        let wealth = age.spec(Axis::LiquidWealth).unwrap();
        let reconstructed = wealth.min + wealth.step() * (wealth.count - 1) as f64;
        approx::assert_relative_eq!(reconstructed, wealth.max, epsilon = 1e-12);
    }
}
