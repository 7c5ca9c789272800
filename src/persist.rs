//! Binary grid persistence and the optional descriptive CSV dump.
//!
//! Each grid set is one directory with one headerless file of native-endian
//! doubles per grid, in flat-index order. Files are streamed through
//! memory-mapped windows capped well below the platform mapping limit, so
//! grids larger than addressable memory still round-trip. Writing removes a
//! pre-existing file first and creates parent directories as needed;
//! consumers rebuild the `GridScale` from the same configuration to
//! reinterpret indices.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use memmap2::{MmapMut, MmapOptions};
use thiserror::Error;

use crate::grid::{Grid, GridError, Grids};
use crate::scale::{Axis, GridScale};
use crate::state::States;

/// Largest mapped window, in bytes.
const MAX_MAP_BYTES: u64 = 1 << 30;

const VALUE_FUNCTION_FILE: &str = "value_function.uft";
const CONSUMPTION_FILE: &str = "consumption.uft";
const EMPLOYMENT1_FILE: &str = "employment1.uft";
const EMPLOYMENT2_FILE: &str = "employment2.uft";

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("I/O failure on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Grid file {path} holds {actual} values but the scale expects {expected}.")]
    LengthMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    #[error(transparent)]
    Grid(#[from] GridError),

    #[error(transparent)]
    State(#[from] crate::state::StateError),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> PersistError + '_ {
    move |source| PersistError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Write all four grids into `directory`.
pub fn write_grids(directory: &Path, grids: &Grids) -> Result<(), PersistError> {
    write_grid(&directory.join(VALUE_FUNCTION_FILE), &grids.value_function)?;
    write_grid(&directory.join(CONSUMPTION_FILE), &grids.consumption_share)?;
    write_grid(&directory.join(EMPLOYMENT1_FILE), &grids.employment1)?;
    write_grid(&directory.join(EMPLOYMENT2_FILE), &grids.employment2)?;
    Ok(())
}

/// Read all four grids back, sized from the scale.
pub fn read_grids(directory: &Path, scale: &GridScale) -> Result<Grids, PersistError> {
    let total = scale.total_size();
    let flexible = scale.flexible_labour_size();
    Ok(Grids {
        value_function: read_grid(&directory.join(VALUE_FUNCTION_FILE), total)?,
        consumption_share: read_grid(&directory.join(CONSUMPTION_FILE), total)?,
        employment1: read_grid(&directory.join(EMPLOYMENT1_FILE), flexible)?,
        employment2: read_grid(&directory.join(EMPLOYMENT2_FILE), flexible)?,
    })
}

pub(crate) fn write_grid(path: &Path, grid: &Grid) -> Result<(), PersistError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_error(path))?;
    }
    if path.exists() {
        fs::remove_file(path).map_err(io_error(path))?;
    }

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(io_error(path))?;
    let total_bytes = grid.len() * 8;
    file.set_len(total_bytes).map_err(io_error(path))?;

    let window_values = MAX_MAP_BYTES / 8;
    let mut start = 0u64;
    while start < grid.len() {
        let count = window_values.min(grid.len() - start);
        // Safety: the file was just created with the exact length and no
        // other mapping of it exists while this one is live.
        let mut map: MmapMut = unsafe {
            MmapOptions::new()
                .offset(start * 8)
                .len((count * 8) as usize)
                .map_mut(&file)
                .map_err(io_error(path))?
        };
        for (slot, chunk) in map.chunks_exact_mut(8).enumerate() {
            let value = grid.get_raw(start + slot as u64)?;
            chunk.copy_from_slice(&value.to_ne_bytes());
        }
        map.flush().map_err(io_error(path))?;
        start += count;
    }
    Ok(())
}

pub(crate) fn read_grid(path: &Path, expected_len: u64) -> Result<Grid, PersistError> {
    let file = OpenOptions::new()
        .read(true)
        .open(path)
        .map_err(io_error(path))?;
    let actual_bytes = file.metadata().map_err(io_error(path))?.len();
    if actual_bytes != expected_len * 8 {
        return Err(PersistError::LengthMismatch {
            path: path.to_path_buf(),
            expected: expected_len,
            actual: actual_bytes / 8,
        });
    }

    let mut grid = Grid::new(expected_len);
    let window_values = MAX_MAP_BYTES / 8;
    let mut start = 0u64;
    while start < expected_len {
        let count = window_values.min(expected_len - start);
        // Safety: read-only mapping of a file this process opened; length was
        // checked against the metadata above.
        let map = unsafe {
            MmapOptions::new()
                .offset(start * 8)
                .len((count * 8) as usize)
                .map(&file)
                .map_err(io_error(path))?
        };
        for (slot, chunk) in map.chunks_exact(8).enumerate() {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(chunk);
            grid.put(start + slot as u64, f64::from_ne_bytes(bytes))?;
        }
        start += count;
    }
    Ok(grid)
}

/// One descriptive CSV per age: a row for every state combination that the
/// pruning predicates admit, with its solved entries.
pub fn write_descriptive_csv(
    directory: &Path,
    scale: &std::sync::Arc<GridScale>,
    grids: &Grids,
    age_index: usize,
) -> Result<(), PersistError> {
    let age = scale.age(age_index);
    let path = directory.join(format!("grids_age_{}.csv", age.age_years));
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_error(&path))?;
    }
    let mut out = std::io::BufWriter::new(
        fs::File::create(&path).map_err(io_error(&path))?,
    );

    writeln!(
        out,
        "gender,birthyear,education,student,married,children0,children1,children2,\
         health,wealth,wageperhour,pensionperyear,valuefunction,consumptionshare,\
         employment1,employment2"
    )
    .map_err(io_error(&path))?;

    for outer in 0..age.outer_count {
        let mut template = States::new(std::sync::Arc::clone(scale), age_index);
        template.populate_outer(outer);
        for inner in 0..age.inner_count {
            let mut state = template.clone();
            state.populate_inner(inner);
            if !state.check_combination() {
                continue;
            }
            let index = state.to_flat_index()?;
            let (employment1, employment2) = if index < grids.employment1.len() {
                (
                    grids.employment1.get(index)?,
                    grids.employment2.get(index)?,
                )
            } else {
                (0.0, 0.0)
            };
            writeln!(
                out,
                "{},{},{},{},{},{},{},{},{},{:.6},{:.6},{:.6},{:.6},{:.6},{},{}",
                state.value(Axis::Gender).unwrap_or(0.0),
                state.birth_year(),
                state.value(Axis::Education).unwrap_or(0.0),
                state.student() as u8,
                state.cohabiting() as u8,
                state.children(0),
                state.children(1),
                state.children(2),
                state.value(Axis::Health).unwrap_or(0.0),
                state.liquid_wealth(),
                state.wage_per_hour().unwrap_or(0.0),
                state.pension_per_year(),
                grids.value_function.get(index)?,
                grids.consumption_share.get(index)?,
                employment1,
                employment2,
            )
            .map_err(io_error(&path))?;
        }
    }
    out.flush().map_err(io_error(&path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{is_initialised, UNINITIALISED};

    #[test]
    fn grid_round_trip_is_bit_exact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("grid.uft");

        let mut grid = Grid::new(1000);
        for i in 0..1000u64 {
            if i % 7 != 0 {
                grid.put(i, (i as f64).sin() * 1e6).unwrap();
            }
        }
        write_grid(&path, &grid).unwrap();
        let loaded = read_grid(&path, 1000).unwrap();

        for i in 0..1000u64 {
            let expected = grid.get_raw(i).unwrap();
            let actual = loaded.get_raw(i).unwrap();
            assert_eq!(expected.to_bits(), actual.to_bits(), "index {i}");
        }
        // Sentinel cells survive untouched.
        assert!(!is_initialised(loaded.get_raw(0).unwrap()));
        assert_eq!(loaded.get_raw(0).unwrap(), UNINITIALISED);
    }

    #[test]
    fn rewriting_replaces_the_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grid.uft");

        let mut large = Grid::new(64);
        for i in 0..64u64 {
            large.put(i, i as f64).unwrap();
        }
        write_grid(&path, &large).unwrap();

        let mut small = Grid::new(8);
        for i in 0..8u64 {
            small.put(i, -(i as f64)).unwrap();
        }
        write_grid(&path, &small).unwrap();

        let loaded = read_grid(&path, 8).unwrap();
        assert_eq!(loaded.get(3).unwrap(), -3.0);
        assert!(read_grid(&path, 64).is_err());
    }

    #[test]
    fn wrong_length_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grid.uft");
        let grid = Grid::new(10);
        write_grid(&path, &grid).unwrap();
        assert!(matches!(
            read_grid(&path, 11),
            Err(PersistError::LengthMismatch { expected: 11, .. })
        ));
    }

    #[test]
    fn missing_file_reports_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.uft");
        let err = read_grid(&path, 4).unwrap_err();
        assert!(err.to_string().contains("absent.uft"));
    }
}
