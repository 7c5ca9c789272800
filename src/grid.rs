//! Partitioned flat grid storage and multi-linear interpolation.
//!
//! A `Grid` is logically one flat array of doubles addressed by a 64-bit
//! index; physically it is an arena of chunks no larger than a platform-safe
//! maximum so logical sizes beyond the 32-bit addressable range stay legal.
//! Cells start at a sentinel value; reading a sentinel is an error because it
//! means a state combination was queried before being solved, which is a
//! pruning-logic defect rather than a recoverable condition.

use thiserror::Error;

use crate::scale::GridScale;
use crate::state::{StateError, States};

/// Sentinel marking a cell that was never written.
pub const UNINITIALISED: f64 = -9.99e29;

/// Largest owned partition, just under 2^31 elements.
pub(crate) const MAX_PARTITION_LEN: usize = (1usize << 31) - 8;

/// Continuity thresholds: axes above the threshold are interpolated.
/// The solver raises the threshold so ambiguous axes (birth year) are treated
/// as discrete during optimization but continuous in forward simulation.
const CONTINUITY_THRESHOLD_SIMULATION: f64 = 0.3;
const CONTINUITY_THRESHOLD_SOLVER: f64 = 0.6;

/// Corners contributing less than `2^-n * CORNER_WEIGHT_CUTOFF` are skipped.
const CORNER_WEIGHT_CUTOFF: f64 = 1e-3;

/// A value is valid only if materially different from the sentinel.
pub fn is_initialised(value: f64) -> bool {
    (value - UNINITIALISED).abs() > 1e-5 * UNINITIALISED.abs()
}

#[derive(Debug, Error)]
pub enum GridError {
    #[error("Grid index {index} is outside the grid extent {len}.")]
    OutOfRange { index: u64, len: u64 },

    #[error("Grid cell {index} was read before being written; a state combination escaped pruning.")]
    Uninitialised { index: u64 },

    #[error("Continuous axes are not a contiguous leading block at age {age} (axis '{axis}').")]
    NonContiguousContinuous { age: u32, axis: String },

    #[error("Interpolation coordinate for axis '{axis}' at age {age} lies outside the grid: {value} not in [{min}, {max}].\n{diagnostics}")]
    InterpolationOutOfBounds {
        age: u32,
        axis: String,
        value: f64,
        min: f64,
        max: f64,
        diagnostics: String,
    },

    #[error(transparent)]
    State(#[from] StateError),
}

/// Partitioned flat array of doubles.
#[derive(Debug, Clone)]
pub struct Grid {
    partitions: Vec<Vec<f64>>,
    len: u64,
    partition_len: usize,
}

impl Grid {
    pub fn new(len: u64) -> Self {
        Self::with_partition_len(len, MAX_PARTITION_LEN)
    }

    /// Partition size is parameterized so the chunk/offset arithmetic is
    /// testable without allocating multi-gigabyte arrays.
    pub(crate) fn with_partition_len(len: u64, partition_len: usize) -> Self {
        assert!(partition_len > 0);
        let mut partitions = Vec::new();
        let mut remaining = len;
        while remaining > 0 {
            let chunk = remaining.min(partition_len as u64) as usize;
            partitions.push(vec![UNINITIALISED; chunk]);
            remaining -= chunk as u64;
        }
        Self {
            partitions,
            len,
            partition_len,
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[cfg(test)]
    pub(crate) fn partitions(&self) -> &[Vec<f64>] {
        &self.partitions
    }

    fn locate(&self, index: u64) -> Result<(usize, usize), GridError> {
        if index >= self.len {
            return Err(GridError::OutOfRange {
                index,
                len: self.len,
            });
        }
        Ok((
            (index / self.partition_len as u64) as usize,
            (index % self.partition_len as u64) as usize,
        ))
    }

    /// Checked read: distinguishes an out-of-range index from a cell that was
    /// never written.
    pub fn get(&self, index: u64) -> Result<f64, GridError> {
        let value = self.get_raw(index)?;
        if !is_initialised(value) {
            return Err(GridError::Uninitialised { index });
        }
        Ok(value)
    }

    /// Read allowing the sentinel through; used by persistence, which must
    /// round-trip unwritten cells bit-for-bit.
    pub fn get_raw(&self, index: u64) -> Result<f64, GridError> {
        let (partition, offset) = self.locate(index)?;
        Ok(self.partitions[partition][offset])
    }

    pub fn put(&mut self, index: u64, value: f64) -> Result<(), GridError> {
        let (partition, offset) = self.locate(index)?;
        self.partitions[partition][offset] = value;
        Ok(())
    }

    /// Multi-linear interpolation over the continuous subset of axes at the
    /// state's age. `solver_call` raises the continuity threshold so
    /// ambiguous axes are held at their grid points during optimization.
    pub fn interpolate_all(&self, state: &States, solver_call: bool) -> Result<f64, GridError> {
        let threshold = if solver_call {
            CONTINUITY_THRESHOLD_SOLVER
        } else {
            CONTINUITY_THRESHOLD_SIMULATION
        };
        let age = state.age_scale();

        // Single-point axes cannot be interpolated regardless of flag.
        let continuous = |spec: &crate::scale::AxisSpec| spec.continuity > threshold && spec.count > 1;

        let n_dims = age.axes.iter().take_while(|s| continuous(s)).count();
        if let Some(stray) = age.axes[n_dims..].iter().find(|s| continuous(s)) {
            return Err(GridError::NonContiguousContinuous {
                age: age.age_years,
                axis: stray.axis.label(),
            });
        }
        if n_dims == 0 {
            return self.get(state.to_flat_index()?);
        }

        let mut bases = Vec::with_capacity(n_dims);
        let mut fractions = Vec::with_capacity(n_dims);
        let mut strides = Vec::with_capacity(n_dims);
        let mut stride = 1u64;
        for (axis_position, spec) in age.axes.iter().take(n_dims).enumerate() {
            let extent = (spec.count - 1) as f64;
            let t = (state.values()[axis_position] - spec.min) / spec.step();
            let tol = 64.0 * f64::EPSILON * extent.max(1.0);
            if !t.is_finite() || t < -tol || t > extent + tol {
                return Err(GridError::InterpolationOutOfBounds {
                    age: age.age_years,
                    axis: spec.axis.label(),
                    value: state.values()[axis_position],
                    min: spec.min,
                    max: spec.max,
                    diagnostics: state.diagnostics(),
                });
            }
            let t = t.clamp(0.0, extent);
            let base = (t.floor() as usize).min(spec.count - 2);
            bases.push(base as u64);
            fractions.push(t - base as f64);
            strides.push(stride);
            stride *= spec.count as u64;
        }

        // Origin: the same combination with every continuous axis clamped to
        // its lower bound, so the corner offsets below are pure stride sums.
        let mut origin_state = state.clone();
        for axis_position in 0..n_dims {
            origin_state.set_grid_position(axis_position, 0);
        }
        let origin = origin_state.to_flat_index()?;

        self.interpolate_continuous(origin, &bases, &fractions, &strides)
    }

    /// Weighted average over the 2^n hypercube corners around the fractional
    /// grid coordinate, skipping numerically negligible corners and
    /// renormalizing by the weight actually used.
    fn interpolate_continuous(
        &self,
        origin: u64,
        bases: &[u64],
        fractions: &[f64],
        strides: &[u64],
    ) -> Result<f64, GridError> {
        let n_dims = bases.len();
        let cutoff = 0.5f64.powi(n_dims as i32) * CORNER_WEIGHT_CUTOFF;

        let mut weighted_sum = 0.0;
        let mut weight_used = 0.0;
        for corner in 0..(1u32 << n_dims) {
            let mut weight = 1.0;
            let mut cell = origin;
            for d in 0..n_dims {
                let bit = (corner >> d) & 1;
                weight *= if bit == 1 {
                    fractions[d]
                } else {
                    1.0 - fractions[d]
                };
                cell += (bases[d] + bit as u64) * strides[d];
            }
            if weight < cutoff {
                continue;
            }
            weighted_sum += weight * self.get(cell)?;
            weight_used += weight;
        }

        debug_assert!(weight_used > 0.0);
        Ok(weighted_sum / weight_used)
    }
}

/// A solved decision for one state combination.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Solution {
    pub value: f64,
    pub consumption_share: f64,
    pub employment1: f64,
    pub employment2: f64,
}

/// The four decision grids: value function and consumption span the full
/// lifespan, the employment grids only the ages with flexible labour supply.
#[derive(Debug)]
pub struct Grids {
    pub value_function: Grid,
    pub consumption_share: Grid,
    pub employment1: Grid,
    pub employment2: Grid,
}

impl Grids {
    pub fn new(scale: &GridScale) -> Self {
        let total = scale.total_size();
        let flexible = scale.flexible_labour_size();
        Self {
            value_function: Grid::new(total),
            consumption_share: Grid::new(total),
            employment1: Grid::new(flexible),
            employment2: Grid::new(flexible),
        }
    }

    /// Store a solution at a flat index; employment entries exist only within
    /// the flexible-labour prefix.
    pub fn put_solution(&mut self, index: u64, solution: &Solution) -> Result<(), GridError> {
        self.value_function.put(index, solution.value)?;
        self.consumption_share.put(index, solution.consumption_share)?;
        if index < self.employment1.len() {
            self.employment1.put(index, solution.employment1)?;
            self.employment2.put(index, solution.employment2)?;
        }
        Ok(())
    }

    pub fn value_at(&self, state: &States) -> Result<f64, GridError> {
        self.value_function.get(state.to_flat_index()?)
    }

    pub fn consumption_share_at(&self, state: &States) -> Result<f64, GridError> {
        self.consumption_share.get(state.to_flat_index()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DecisionConfig;
    use crate::scale::Axis;
    use approx::assert_relative_eq;
    use std::sync::Arc;

    fn wealth_wage_scale() -> Arc<GridScale> {
        let mut config = DecisionConfig::baseline();
        config.start_age = 30;
        config.max_age = 31;
        config.max_flexible_labour_age = 31;
        config.wealth_points = 3;
        config.wage_points = 3;
        config.flag_retirement = false;
        config.flag_health = false;
        config.flag_disability = false;
        config.flag_student = false;
        config.flag_children = false;
        config.flag_social_care = false;
        config.flag_education = false;
        config.flag_wage_offer1 = false;
        config.flag_wage_offer2 = false;
        config.flag_cohabitation = false;
        Arc::new(GridScale::new(config).unwrap())
    }

    /// Fill an age slice with a function linear in the two continuous
    /// coordinates, which multi-linear interpolation reproduces exactly.
    fn fill_linear(grid: &mut Grid, scale: &Arc<GridScale>, age_index: usize) {
        let age = scale.age(age_index);
        for outer in 0..age.outer_count {
            for inner in 0..age.inner_count {
                let mut state = States::new(Arc::clone(scale), age_index);
                state.populate_outer(outer);
                state.populate_inner(inner);
                let z = state.values()[0];
                let w = state.values()[1];
                grid.put(state.to_flat_index().unwrap(), 2.0 * z + 3.0 * w)
                    .unwrap();
            }
        }
    }

    #[test]
    fn interpolation_is_exact_at_grid_points() {
        let scale = wealth_wage_scale();
        let mut grid = Grid::new(scale.total_size());
        fill_linear(&mut grid, &scale, 0);

        let age = scale.age(0);
        for inner in 0..age.inner_count {
            let mut state = States::new(Arc::clone(&scale), 0);
            state.populate_inner(inner);
            let expected = grid.get(state.to_flat_index().unwrap()).unwrap();
            let got = grid.interpolate_all(&state, true).unwrap();
            assert_relative_eq!(got, expected, epsilon = 1e-12);
        }
    }

    #[test]
    fn interpolation_recovers_linear_functions_between_nodes() {
        let scale = wealth_wage_scale();
        let mut grid = Grid::new(scale.total_size());
        fill_linear(&mut grid, &scale, 0);

        let age = scale.age(0);
        let zw = &age.axes[0];
        let zh = &age.axes[1];
        let mut state = States::new(Arc::clone(&scale), 0);
        let z = zw.min + 0.37 * (zw.max - zw.min);
        let w = zh.min + 0.81 * (zh.max - zh.min);
        state.set_value(Axis::LiquidWealth, z).unwrap();
        state.set_value(Axis::WagePotential, w).unwrap();

        let got = grid.interpolate_all(&state, true).unwrap();
        assert_relative_eq!(got, 2.0 * z + 3.0 * w, epsilon = 1e-10);
    }

    #[test]
    fn interpolation_at_the_bounds_does_not_error() {
        let scale = wealth_wage_scale();
        let mut grid = Grid::new(scale.total_size());
        fill_linear(&mut grid, &scale, 0);

        let age = scale.age(0);
        let mut state = States::new(Arc::clone(&scale), 0);
        state
            .set_value(Axis::LiquidWealth, age.axes[0].max)
            .unwrap();
        state
            .set_value(Axis::WagePotential, age.axes[1].min)
            .unwrap();
        let got = grid.interpolate_all(&state, true).unwrap();
        let expected = 2.0 * age.axes[0].max + 3.0 * age.axes[1].min;
        assert_relative_eq!(got, expected, epsilon = 1e-10);
    }

    #[test]
    fn uninitialised_cells_are_reported() {
        let grid = Grid::new(10);
        assert!(matches!(
            grid.get(3),
            Err(GridError::Uninitialised { index: 3 })
        ));
        assert!(matches!(
            grid.get_raw(3),
            Ok(v) if !is_initialised(v)
        ));
    }

    #[test]
    fn out_of_range_reads_are_reported() {
        let grid = Grid::new(10);
        assert!(matches!(
            grid.get(10),
            Err(GridError::OutOfRange { index: 10, len: 10 })
        ));
    }

    #[test]
    fn partition_arithmetic_spans_chunk_boundaries() {
        let mut grid = Grid::with_partition_len(10, 3);
        assert_eq!(grid.partitions().len(), 4);
        for i in 0..10 {
            grid.put(i, i as f64).unwrap();
        }
        for i in 0..10 {
            assert_eq!(grid.get(i).unwrap(), i as f64);
        }
        assert_eq!(grid.partitions()[3].len(), 1);
    }

    #[test]
    fn employment_grids_span_only_the_flexible_prefix() {
        let mut config = DecisionConfig::baseline();
        config.start_age = 74;
        config.max_age = 76;
        config.max_flexible_labour_age = 75;
        config.wealth_points = 2;
        config.wage_points = 2;
        config.pension_points = 2;
        config.flag_health = false;
        config.flag_disability = false;
        config.flag_student = false;
        config.flag_children = false;
        config.flag_social_care = false;
        let scale = GridScale::new(config).unwrap();
        let grids = Grids::new(&scale);
        assert_eq!(grids.value_function.len(), scale.total_size());
        assert_eq!(grids.employment1.len(), scale.flexible_labour_size());
        assert!(grids.employment1.len() < grids.value_function.len());
    }
}
