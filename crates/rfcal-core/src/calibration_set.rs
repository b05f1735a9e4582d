//! Named registry of solved calibrations.
//!
//! Instrument sessions typically juggle several calibrations at once
//! (different port subsets, different topologies, different fixture
//! states). [`CalibrationSet`] holds them under stable indices and
//! unique user-visible names, and serializes as a unit so a whole
//! session's calibration state round-trips through one file.

use serde::{Deserialize, Serialize};

use crate::solver::SolvedCalibration;
use crate::types::{CalError, CalResult};

/// An ordered, name-indexed collection of solved calibrations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CalibrationSet {
    entries: Vec<(String, SolvedCalibration)>,
}

impl CalibrationSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Register a calibration under a unique name, returning its
    /// stable index.
    pub fn add(
        &mut self,
        name: impl Into<String>,
        calibration: SolvedCalibration,
    ) -> CalResult<usize> {
        let name = name.into();
        if self.entries.iter().any(|(n, _)| *n == name) {
            return Err(CalError::DuplicateName { name });
        }
        self.entries.push((name, calibration));
        Ok(self.entries.len() - 1)
    }

    pub fn get(&self, index: usize) -> CalResult<&SolvedCalibration> {
        self.entries
            .get(index)
            .map(|(_, c)| c)
            .ok_or(CalError::CalibrationIndex {
                index,
                len: self.entries.len(),
            })
    }

    pub fn get_by_name(&self, name: &str) -> Option<&SolvedCalibration> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, c)| c)
    }

    pub fn name(&self, index: usize) -> CalResult<&str> {
        self.entries
            .get(index)
            .map(|(n, _)| n.as_str())
            .ok_or(CalError::CalibrationIndex {
                index,
                len: self.entries.len(),
            })
    }

    /// Remove a calibration by index. Later indices shift down, as in
    /// `Vec::remove`.
    pub fn remove(&mut self, index: usize) -> CalResult<SolvedCalibration> {
        if index >= self.entries.len() {
            return Err(CalError::CalibrationIndex {
                index,
                len: self.entries.len(),
            });
        }
        Ok(self.entries.remove(index).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SolvedCalibration)> {
        self.entries.iter().map(|(n, c)| (n.as_str(), c))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
