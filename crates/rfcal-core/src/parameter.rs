//! Frequency-dependent standard parameters.
//!
//! Calibration standards are described by S-parameters that may vary
//! with frequency. A [`ParameterStore`] is an append-only arena of
//! parameter definitions addressed by copyable [`ParamId`] handles:
//!
//! - scalar constants,
//! - sampled vectors with linear interpolation between grid points,
//! - correlated parameters (a base plus a perturbation, so several
//!   standards can share a common systematic offset),
//! - unknowns with an initial guess.
//!
//! Because the arena is append-only and a definition may only refer to
//! ids created before it, the reference graph is acyclic by
//! construction and evaluation needs no cycle detection.
//!
//! A [`ParamMatrix`] arranges ids into the S-matrix of a standard and
//! evaluates to a numeric [`ComplexMatrix`] at one frequency.
//!
//! ```
//! use rfcal_core::parameter::{ParamMatrix, ParameterStore};
//! use rfcal_core::types::Complex;
//!
//! let mut store = ParameterStore::new();
//! let thru = store.one();
//! let mut s = ParamMatrix::filled(2, 2, store.match_());
//! s.set(0, 1, thru);
//! s.set(1, 0, thru);
//! let m = s.evaluate(&store, 1.0e9).unwrap();
//! assert_eq!(m.get(0, 1), Complex::new(1.0, 0.0));
//! ```

use serde::{Deserialize, Serialize};

use crate::complex_matrix::ComplexMatrix;
use crate::types::{CalError, CalResult, Complex};

/// Handle into a [`ParameterStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParamId(usize);

/// One parameter definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum ParamDef {
    /// Frequency-independent constant.
    Scalar(Complex),
    /// Sampled values on an ascending frequency grid, linearly
    /// interpolated in between. Evaluation outside the grid is an
    /// error rather than an extrapolation.
    Vector {
        frequencies: Vec<f64>,
        values: Vec<Complex>,
    },
    /// base + perturbation, both resolved at the same frequency.
    Correlated { base: ParamId, perturbation: ParamId },
    /// Not exactly known; evaluates to its initial guess.
    Unknown { guess: ParamId },
}

/// Append-only arena of parameter definitions.
///
/// Ids 0 and 1 are pre-seeded with the constants zero and one, so the
/// common "matched port" and "ideal thru" entries need no allocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterStore {
    defs: Vec<ParamDef>,
}

impl ParameterStore {
    pub fn new() -> Self {
        Self {
            defs: vec![
                ParamDef::Scalar(Complex::new(0.0, 0.0)),
                ParamDef::Scalar(Complex::new(1.0, 0.0)),
            ],
        }
    }

    /// The constant 0 (a perfectly matched, isolated port).
    pub fn zero(&self) -> ParamId {
        ParamId(0)
    }

    /// The constant 0, under its S-parameter name.
    pub fn match_(&self) -> ParamId {
        ParamId(0)
    }

    /// The constant 1 (an ideal lossless thru path).
    pub fn one(&self) -> ParamId {
        ParamId(1)
    }

    /// Register a frequency-independent constant.
    pub fn scalar(&mut self, value: Complex) -> ParamId {
        self.push(ParamDef::Scalar(value))
    }

    /// Register a sampled parameter. `frequencies` must be strictly
    /// ascending and the same length as `values`, with at least one
    /// point.
    pub fn vector(&mut self, frequencies: Vec<f64>, values: Vec<Complex>) -> CalResult<ParamId> {
        if frequencies.is_empty() || frequencies.len() != values.len() {
            return Err(CalError::DimensionMismatch {
                expected: format!("{} values", frequencies.len().max(1)),
                actual: format!("{}", values.len()),
            });
        }
        if frequencies.windows(2).any(|w| w[0] >= w[1]) {
            return Err(CalError::DimensionMismatch {
                expected: "strictly ascending frequency grid".into(),
                actual: "unsorted or duplicate frequencies".into(),
            });
        }
        Ok(self.push(ParamDef::Vector {
            frequencies,
            values,
        }))
    }

    /// Register a correlated parameter: `base + perturbation`.
    pub fn correlated(&mut self, base: ParamId, perturbation: ParamId) -> CalResult<ParamId> {
        self.check(base)?;
        self.check(perturbation)?;
        Ok(self.push(ParamDef::Correlated { base, perturbation }))
    }

    /// Register an unknown parameter with an initial guess.
    pub fn unknown(&mut self, guess: ParamId) -> CalResult<ParamId> {
        self.check(guess)?;
        Ok(self.push(ParamDef::Unknown { guess }))
    }

    /// Evaluate a parameter at one frequency in Hz.
    pub fn value(&self, id: ParamId, frequency: f64) -> CalResult<Complex> {
        self.check(id)?;
        match &self.defs[id.0] {
            ParamDef::Scalar(v) => Ok(*v),
            ParamDef::Vector {
                frequencies,
                values,
            } => interpolate(frequencies, values, frequency),
            ParamDef::Correlated { base, perturbation } => {
                Ok(self.value(*base, frequency)? + self.value(*perturbation, frequency)?)
            }
            ParamDef::Unknown { guess } => self.value(*guess, frequency),
        }
    }

    /// True if the parameter involves an unknown anywhere in its
    /// definition chain.
    pub fn contains_unknown(&self, id: ParamId) -> bool {
        match &self.defs[id.0] {
            ParamDef::Scalar(_) | ParamDef::Vector { .. } => false,
            ParamDef::Correlated { base, perturbation } => {
                self.contains_unknown(*base) || self.contains_unknown(*perturbation)
            }
            ParamDef::Unknown { .. } => true,
        }
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        false // the two seeded constants are always present
    }

    fn push(&mut self, def: ParamDef) -> ParamId {
        let id = ParamId(self.defs.len());
        self.defs.push(def);
        id
    }

    fn check(&self, id: ParamId) -> CalResult<()> {
        if id.0 >= self.defs.len() {
            return Err(CalError::ParameterId { id: id.0 });
        }
        Ok(())
    }
}

impl Default for ParameterStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Piecewise-linear interpolation on an ascending grid.
fn interpolate(frequencies: &[f64], values: &[Complex], frequency: f64) -> CalResult<Complex> {
    let first = frequencies[0];
    let last = frequencies[frequencies.len() - 1];
    if frequency < first || frequency > last {
        return Err(CalError::ParameterRange { frequency });
    }
    // Index of the first grid point >= frequency.
    let hi = frequencies.partition_point(|&f| f < frequency);
    if hi == 0 || frequencies[hi] == frequency {
        return Ok(values[hi]);
    }
    let lo = hi - 1;
    let t = (frequency - frequencies[lo]) / (frequencies[hi] - frequencies[lo]);
    Ok(values[lo] + (values[hi] - values[lo]) * Complex::new(t, 0.0))
}

// ---------------------------------------------------------------------------
// Parameter matrices
// ---------------------------------------------------------------------------

/// An S-matrix of parameter handles describing one calibration
/// standard. Row-major, like [`ComplexMatrix`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamMatrix {
    rows: usize,
    cols: usize,
    ids: Vec<ParamId>,
}

impl ParamMatrix {
    /// A rows-by-cols matrix with every entry set to `id`.
    pub fn filled(rows: usize, cols: usize, id: ParamId) -> Self {
        assert!(rows >= 1 && cols >= 1, "parameter matrix dimensions");
        Self {
            rows,
            cols,
            ids: vec![id; rows * cols],
        }
    }

    /// Build from a row-major id list.
    pub fn from_ids(rows: usize, cols: usize, ids: Vec<ParamId>) -> CalResult<Self> {
        if ids.len() != rows * cols {
            return Err(CalError::DimensionMismatch {
                expected: format!("{} parameter ids", rows * cols),
                actual: format!("{}", ids.len()),
            });
        }
        Ok(Self { rows, cols, ids })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn get(&self, i: usize, j: usize) -> ParamId {
        assert!(i < self.rows && j < self.cols, "index out of range");
        self.ids[i * self.cols + j]
    }

    pub fn set(&mut self, i: usize, j: usize, id: ParamId) {
        assert!(i < self.rows && j < self.cols, "index out of range");
        self.ids[i * self.cols + j] = id;
    }

    /// True if every entry is numerically known.
    pub fn fully_known(&self, store: &ParameterStore) -> bool {
        self.ids.iter().all(|&id| !store.contains_unknown(id))
    }

    /// True if every off-diagonal entry is the zero constant. Used to
    /// recognize match-like standards whose off-diagonal measurements
    /// are pure leakage.
    pub fn is_diagonal(&self, store: &ParameterStore) -> bool {
        let zero = store.zero();
        for i in 0..self.rows {
            for j in 0..self.cols {
                if i != j && self.get(i, j) != zero {
                    return false;
                }
            }
        }
        true
    }

    /// Evaluate to a numeric matrix at one frequency.
    pub fn evaluate(&self, store: &ParameterStore, frequency: f64) -> CalResult<ComplexMatrix> {
        let mut m = ComplexMatrix::new(self.rows, self.cols);
        for i in 0..self.rows {
            for j in 0..self.cols {
                m.set(i, j, store.value(self.get(i, j), frequency)?);
            }
        }
        Ok(m)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_constants() {
        let store = ParameterStore::new();
        assert_eq!(store.value(store.zero(), 1.0e9).unwrap(), Complex::new(0.0, 0.0));
        assert_eq!(store.value(store.one(), 1.0e9).unwrap(), Complex::new(1.0, 0.0));
        assert_eq!(store.match_(), store.zero());
    }

    #[test]
    fn test_vector_interpolation() {
        let mut store = ParameterStore::new();
        let id = store
            .vector(
                vec![1.0e9, 2.0e9, 3.0e9],
                vec![
                    Complex::new(1.0, 0.0),
                    Complex::new(0.0, 1.0),
                    Complex::new(-1.0, 0.0),
                ],
            )
            .unwrap();

        // Exact grid points.
        assert_eq!(store.value(id, 1.0e9).unwrap(), Complex::new(1.0, 0.0));
        assert_eq!(store.value(id, 3.0e9).unwrap(), Complex::new(-1.0, 0.0));
        // Midpoint.
        let mid = store.value(id, 1.5e9).unwrap();
        assert!((mid - Complex::new(0.5, 0.5)).norm() < 1e-12);
        // Outside the grid.
        assert!(matches!(
            store.value(id, 0.5e9),
            Err(CalError::ParameterRange { .. })
        ));
        assert!(store.value(id, 3.5e9).is_err());
    }

    #[test]
    fn test_vector_validation() {
        let mut store = ParameterStore::new();
        assert!(store.vector(vec![], vec![]).is_err());
        assert!(store
            .vector(vec![1.0, 2.0], vec![Complex::new(0.0, 0.0)])
            .is_err());
        assert!(store
            .vector(
                vec![2.0, 1.0],
                vec![Complex::new(0.0, 0.0), Complex::new(0.0, 0.0)]
            )
            .is_err());
    }

    #[test]
    fn test_correlated_and_unknown() {
        let mut store = ParameterStore::new();
        let base = store.scalar(Complex::new(0.9, 0.0));
        let bump = store.scalar(Complex::new(0.05, 0.01));
        let corr = store.correlated(base, bump).unwrap();
        let v = store.value(corr, 2.0e9).unwrap();
        assert!((v - Complex::new(0.95, 0.01)).norm() < 1e-12);
        assert!(!store.contains_unknown(corr));

        let unk = store.unknown(corr).unwrap();
        assert_eq!(store.value(unk, 2.0e9).unwrap(), v);
        assert!(store.contains_unknown(unk));

        let chained = store.correlated(unk, bump).unwrap();
        assert!(store.contains_unknown(chained));
    }

    #[test]
    fn test_stale_id_rejected() {
        let mut store = ParameterStore::new();
        let other = {
            let mut s = ParameterStore::new();
            for _ in 0..10 {
                s.scalar(Complex::new(1.0, 0.0));
            }
            s.scalar(Complex::new(2.0, 0.0))
        };
        assert!(matches!(
            store.value(other, 1.0e9),
            Err(CalError::ParameterId { .. })
        ));
        assert!(store.correlated(other, ParamId(0)).is_err());
    }

    #[test]
    fn test_param_matrix_evaluate() {
        let mut store = ParameterStore::new();
        let refl = store.scalar(Complex::new(-1.0, 0.0));
        let mut s = ParamMatrix::filled(2, 2, store.match_());
        s.set(0, 0, refl);
        s.set(1, 1, refl);
        assert!(s.is_diagonal(&store));
        assert!(s.fully_known(&store));

        let m = s.evaluate(&store, 1.0e9).unwrap();
        assert_eq!(m.get(0, 0), Complex::new(-1.0, 0.0));
        assert_eq!(m.get(0, 1), Complex::new(0.0, 0.0));

        s.set(0, 1, store.one());
        assert!(!s.is_diagonal(&store));
    }

    #[test]
    fn test_param_matrix_from_ids_checks_len() {
        let store = ParameterStore::new();
        assert!(ParamMatrix::from_ids(2, 2, vec![store.zero(); 3]).is_err());
        assert!(ParamMatrix::from_ids(2, 2, vec![store.zero(); 4]).is_ok());
    }
}
