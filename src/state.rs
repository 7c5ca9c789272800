//! A concrete state combination and its mixed-radix flat-index codec.
//!
//! `States` pairs an age-period with a fixed-length array of axis values in
//! `GridScale` order: continuous axes hold a transformed (log-shifted) scalar,
//! discrete axes an integer-valued code. Every value must lie within its axis
//! bounds up to a small tolerance; violations are reported with a full
//! per-axis diagnostic dump because they always indicate a configuration or
//! transition-table defect.
//!
//! The flat-index mapping is a bijection between the Cartesian product of
//! per-axis grid points and the index range of the age-slice: least
//! significant axis first, axis cardinalities as radices, plus the per-age
//! cumulative offset.

use std::sync::Arc;

use thiserror::Error;

use crate::model::{
    CareProvision, CareReceipt, Education, Gender, GridCoded, Health, Region,
};
use crate::scale::{AgeScale, Axis, GridScale, CHILD_BANDS};

/// Relative tolerance for bounds checks on stored axis values.
const BOUNDS_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("Axis '{axis}' at age {age} holds {value} outside [{min}, {max}].\n{diagnostics}")]
    AxisOutOfBounds {
        age: u32,
        axis: String,
        value: f64,
        min: f64,
        max: f64,
        diagnostics: String,
    },

    #[error("Axis '{axis}' at age {age}: value {value} maps to grid position {position} outside 0..{count}.\n{diagnostics}")]
    GridPositionOutOfRange {
        age: u32,
        axis: String,
        value: f64,
        position: i64,
        count: usize,
        diagnostics: String,
    },
}

/// One state combination at a given age.
#[derive(Debug, Clone)]
pub struct States {
    scale: Arc<GridScale>,
    age_index: usize,
    age_years: u32,
    values: Vec<f64>,
}

impl States {
    /// A template state at the given age, every axis at its lower bound.
    pub fn new(scale: Arc<GridScale>, age_index: usize) -> Self {
        let age = scale.age(age_index);
        let values = age.axes.iter().map(|spec| spec.min).collect();
        let age_years = age.age_years;
        Self {
            scale,
            age_index,
            age_years,
            values,
        }
    }

    pub fn scale(&self) -> &Arc<GridScale> {
        &self.scale
    }

    pub fn age_index(&self) -> usize {
        self.age_index
    }

    pub fn age_years(&self) -> u32 {
        self.age_years
    }

    pub fn age_scale(&self) -> &AgeScale {
        self.scale.age(self.age_index)
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Raw value of an axis, or `None` when the axis stores nothing at this
    /// age.
    pub fn value(&self, axis: Axis) -> Option<f64> {
        self.age_scale()
            .axis_position(axis)
            .map(|pos| self.values[pos])
    }

    /// Store a value on an axis, clamping within tolerance of the bounds.
    /// Returns `false` when the axis is inactive at this age (nothing stored).
    pub fn set_value(&mut self, axis: Axis, value: f64) -> Result<bool, StateError> {
        let scale = Arc::clone(&self.scale);
        let age = scale.age(self.age_index);
        let Some(pos) = age.axis_position(axis) else {
            return Ok(false);
        };
        let spec = &age.axes[pos];
        let tol = BOUNDS_TOLERANCE * (1.0 + spec.min.abs().max(spec.max.abs()));
        if !value.is_finite() || value < spec.min - tol || value > spec.max + tol {
            return Err(StateError::AxisOutOfBounds {
                age: self.age_years,
                axis: spec.axis.label(),
                value,
                min: spec.min,
                max: spec.max,
                diagnostics: self.diagnostics(),
            });
        }
        self.values[pos] = value.clamp(spec.min, spec.max);
        Ok(true)
    }

    /// Place an axis directly on one of its grid points.
    pub fn set_grid_position(&mut self, axis_position: usize, grid_position: usize) {
        let scale = Arc::clone(&self.scale);
        let spec = &scale.age(self.age_index).axes[axis_position];
        debug_assert!(grid_position < spec.count);
        self.values[axis_position] = spec.min + spec.step() * grid_position as f64;
    }

    /// Nearest grid position of an axis value, validated against the axis
    /// cardinality.
    pub fn grid_position(&self, axis_position: usize) -> Result<usize, StateError> {
        let age = self.age_scale();
        let spec = &age.axes[axis_position];
        let raw = if spec.count > 1 {
            ((self.values[axis_position] - spec.min) / (spec.max - spec.min)
                * (spec.count - 1) as f64)
                .round()
        } else {
            0.0
        };
        if !raw.is_finite() || raw < 0.0 || raw >= spec.count as f64 {
            return Err(StateError::GridPositionOutOfRange {
                age: self.age_years,
                axis: spec.axis.label(),
                value: self.values[axis_position],
                position: if raw.is_finite() { raw as i64 } else { i64::MIN },
                count: spec.count,
                diagnostics: self.diagnostics(),
            });
        }
        Ok(raw as usize)
    }

    /// Global flat index of this combination: mixed-radix over the per-age
    /// axes (least significant first) plus the age-slice offset.
    pub fn to_flat_index(&self) -> Result<u64, StateError> {
        let age = self.age_scale();
        let mut index = 0u64;
        let mut radix = 1u64;
        for axis_position in 0..age.axes.len() {
            let pos = self.grid_position(axis_position)? as u64;
            index += pos * radix;
            radix *= age.axes[axis_position].count as u64;
        }
        Ok(age.offset + index)
    }

    /// Inverse of the outer part of the codec: decompose a linear index over
    /// the outer axes only and write the corresponding grid values.
    pub fn populate_outer(&mut self, outer_index: u64) {
        self.populate(outer_index, false);
    }

    /// Inverse of the inner part of the codec.
    pub fn populate_inner(&mut self, inner_index: u64) {
        self.populate(inner_index, true);
    }

    fn populate(&mut self, mut index: u64, inner: bool) {
        let scale = Arc::clone(&self.scale);
        let age = scale.age(self.age_index);
        for (axis_position, spec) in age.axes.iter().enumerate() {
            if spec.inner != inner {
                continue;
            }
            let count = spec.count as u64;
            let pos = index % count;
            index /= count;
            self.values[axis_position] = spec.min + spec.step() * pos as f64;
        }
        debug_assert_eq!(index, 0, "linear index exceeds the axis radices");
    }

    /// Per-axis dump used by every fatal bounds diagnostic.
    pub fn diagnostics(&self) -> String {
        let age = self.age_scale();
        let mut out = format!("state at age {} (index {}):", self.age_years, self.age_index);
        for (spec, value) in age.axes.iter().zip(&self.values) {
            out.push_str(&format!(
                "\n  {:<16} value {:>14.6} in [{:.6}, {:.6}] x{}",
                spec.axis.label(),
                value,
                spec.min,
                spec.max,
                spec.count
            ));
        }
        out
    }

    // Typed accessors. Each returns the axis's semantic reading, falling back
    // to the age-implied value when the axis stores nothing at this age.

    pub fn liquid_wealth_coordinate(&self) -> f64 {
        self.value(Axis::LiquidWealth).unwrap_or(0.0)
    }

    pub fn liquid_wealth(&self) -> f64 {
        self.liquid_wealth_coordinate().exp() - self.scale.config().wealth_shift
    }

    pub fn wage_per_hour(&self) -> Option<f64> {
        self.value(Axis::WagePotential).map(f64::exp)
    }

    pub fn pension_per_year(&self) -> f64 {
        self.value(Axis::PensionIncome)
            .map(|v| v.exp() - 1.0)
            .unwrap_or(0.0)
    }

    pub fn birth_year(&self) -> i32 {
        self.value(Axis::BirthYear)
            .map(|v| v.round() as i32)
            .unwrap_or(self.scale.config().min_birth_year)
    }

    pub fn gender(&self) -> Gender {
        self.value(Axis::Gender)
            .and_then(Gender::from_code)
            .unwrap_or(Gender::Female)
    }

    pub fn education(&self) -> Education {
        self.value(Axis::Education)
            .and_then(Education::from_code)
            .unwrap_or(Education::Medium)
    }

    pub fn health(&self) -> Health {
        self.value(Axis::Health)
            .and_then(Health::from_code)
            .unwrap_or(Health::Good)
    }

    pub fn region(&self) -> Region {
        self.value(Axis::Region)
            .and_then(Region::from_code)
            .unwrap_or(Region::London)
    }

    pub fn care_receipt(&self) -> CareReceipt {
        self.value(Axis::CareReceipt)
            .and_then(CareReceipt::from_code)
            .unwrap_or(CareReceipt::None)
    }

    pub fn care_provision(&self) -> CareProvision {
        self.value(Axis::CareProvision)
            .and_then(CareProvision::from_code)
            .unwrap_or(CareProvision::None)
    }

    pub fn cohabiting(&self) -> bool {
        self.value(Axis::Cohabitation).map(|v| v >= 0.5).unwrap_or(false)
    }

    pub fn student(&self) -> bool {
        self.value(Axis::Student).map(|v| v >= 0.5).unwrap_or(false)
    }

    pub fn disabled(&self) -> bool {
        self.value(Axis::Disability).map(|v| v >= 0.5).unwrap_or(false)
    }

    /// Once the retirement axis ages out everyone above the flexible-labour
    /// horizon is implicitly retired.
    pub fn retired(&self) -> bool {
        match self.value(Axis::Retirement) {
            Some(v) => v >= 0.5,
            None => {
                let config = self.scale.config();
                config.flag_retirement && self.age_years > config.max_flexible_labour_age
            }
        }
    }

    pub fn wage_offer1(&self) -> Option<bool> {
        self.value(Axis::WageOffer1).map(|v| v >= 0.5)
    }

    pub fn wage_offer2(&self) -> Option<bool> {
        self.value(Axis::WageOffer2).map(|v| v >= 0.5)
    }

    pub fn children(&self, band: usize) -> usize {
        self.value(Axis::Children(band))
            .map(|v| v.round().max(0.0) as usize)
            .unwrap_or(0)
    }

    pub fn children_by_band(&self) -> [usize; CHILD_BANDS] {
        std::array::from_fn(|band| self.children(band))
    }

    pub fn total_children(&self) -> usize {
        (0..CHILD_BANDS).map(|band| self.children(band)).sum()
    }

    /// Pruning over the outer axes only: combinations that are biologically
    /// or economically impossible, or that are filled as wage-offer-zero
    /// companions rather than solved directly.
    pub fn check_outer_combination(&self) -> bool {
        let cohabiting = self.cohabiting();
        if !cohabiting {
            if matches!(
                self.care_provision(),
                CareProvision::ToPartner | CareProvision::ToPartnerAndOther
            ) {
                return false;
            }
            // A partner offer without a partner is redundant.
            if self.wage_offer2() == Some(true) {
                return false;
            }
        } else if self.wage_offer2() == Some(false) {
            // Filled from the cohabiting canonical cell's zero-offer corner.
            return false;
        }
        if self.wage_offer1() == Some(false) {
            return false;
        }
        true
    }

    /// Pruning over the full combination. The inner axes are continuous and
    /// never pruned (the interpolation reads across their whole extent), so
    /// this currently coincides with the outer check; it stays a separate
    /// seam because the two are consulted at different points of the solve.
    pub fn check_combination(&self) -> bool {
        self.check_outer_combination()
    }
}
