//! Core types for VNA calibration processing
//!
//! This module defines the fundamental types used throughout the
//! calibration engine: the complex sample type, the crate-wide error
//! enum, and the reference-impedance representation carried by a solved
//! calibration.
//!
//! ## Error categories
//!
//! Every failure falls into one of three categories (see
//! [`CalError::category`]):
//!
//! - **Usage**: the caller handed us inconsistent dimensions, a bad
//!   port map, or an out-of-range index.
//! - **Math**: the numbers themselves are the problem — a singular or
//!   rank-deficient system, or too few independent standards. These are
//!   detected at the point of failure and returned immediately; a
//!   silently wrong calibration is worse than an explicit error.
//! - **System**: resource failures (allocation).

use num_complex::Complex64;
use serde::{Deserialize, Serialize};

/// Type alias for complex values using f64 precision.
pub type Complex = Complex64;

/// Result type for calibration operations.
pub type CalResult<T> = Result<T, CalError>;

/// A port map: one entry per VNA port, giving the standard/DUT port it
/// is connected to, or `None` for an unconnected (terminated) port.
pub type PortMap = Vec<Option<usize>>;

/// Broad failure category, per the error-handling contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Invalid arguments: dimensions, port maps, indices.
    Usage,
    /// Singular / rank-deficient system, insufficient standards.
    Math,
    /// Resource failure.
    System,
}

/// Errors that can occur while building, solving, or applying a
/// calibration.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CalError {
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: String, actual: String },

    #[error("port map has {actual} entries, calibration has {expected} ports")]
    PortMapLength { expected: usize, actual: usize },

    #[error("port map entry {entry} maps to port {target}, but only {limit} ports exist")]
    PortMapTarget {
        entry: usize,
        target: usize,
        limit: usize,
    },

    #[error("port map maps two VNA ports to the same target port {target}")]
    PortMapDuplicate { target: usize },

    #[error("frequency vector does not match the calibration ({expected} points, got {actual})")]
    FrequencyMismatch { expected: usize, actual: usize },

    #[error("sweep frequency {actual} Hz at index {index} does not match calibration point {expected} Hz")]
    SweepFrequencyMismatch {
        index: usize,
        expected: f64,
        actual: f64,
    },

    #[error("frequency {frequency} Hz outside the range of a vector parameter")]
    ParameterRange { frequency: f64 },

    #[error("unknown parameter id {id}")]
    ParameterId { id: usize },

    #[error("calibration index {index} out of range ({len} calibrations)")]
    CalibrationIndex { index: usize, len: usize },

    #[error("a calibration named {name:?} is already registered")]
    DuplicateName { name: String },

    #[error("calibration type {cal_type} requires {requirement}")]
    InvalidDimensions {
        cal_type: &'static str,
        requirement: String,
    },

    #[error("singular system at frequency index {frequency_index}")]
    SingularSystem { frequency_index: usize },

    #[error(
        "rank-deficient system at frequency index {frequency_index}: rank {rank}, need {needed}"
    )]
    RankDeficient {
        frequency_index: usize,
        rank: usize,
        needed: usize,
    },

    #[error("insufficient standards: need {needed}, have {have}")]
    InsufficientStandards { needed: usize, have: usize },

    #[error("leakage terms unresolved: no fully-connected standard with a diagonal S-matrix")]
    LeakageUnresolved,

    /// Never produced by the library itself (Rust aborts on failed
    /// allocations); carried so embedders with fallible allocators can
    /// report resource failures in the [`ErrorCategory::System`]
    /// category alongside every other calibration error.
    #[error("allocation of {bytes} bytes failed")]
    Allocation { bytes: usize },
}

impl CalError {
    /// The broad category this error belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            CalError::DimensionMismatch { .. }
            | CalError::PortMapLength { .. }
            | CalError::PortMapTarget { .. }
            | CalError::PortMapDuplicate { .. }
            | CalError::FrequencyMismatch { .. }
            | CalError::SweepFrequencyMismatch { .. }
            | CalError::ParameterRange { .. }
            | CalError::ParameterId { .. }
            | CalError::CalibrationIndex { .. }
            | CalError::DuplicateName { .. }
            | CalError::InvalidDimensions { .. } => ErrorCategory::Usage,
            CalError::SingularSystem { .. }
            | CalError::RankDeficient { .. }
            | CalError::InsufficientStandards { .. }
            | CalError::LeakageUnresolved => ErrorCategory::Math,
            CalError::Allocation { .. } => ErrorCategory::System,
        }
    }
}

/// Reference impedance (Z0) of a calibration.
///
/// S-parameters are defined relative to a reference impedance; most
/// calibrations share a single scalar Z0 (typically 50 ohms), but the
/// engine also carries per-port and per-port-per-frequency forms so a
/// solved calibration round-trips through persistence without loss.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReferenceImpedance {
    /// One Z0 shared by every port and frequency.
    Scalar(Complex),
    /// One Z0 per port, shared across frequencies.
    PerPort(Vec<Complex>),
    /// One Z0 per port per frequency (outer index: frequency).
    PerPortPerFrequency(Vec<Vec<Complex>>),
}

impl ReferenceImpedance {
    /// The conventional 50-ohm reference.
    pub fn fifty_ohms() -> Self {
        ReferenceImpedance::Scalar(Complex::new(50.0, 0.0))
    }

    /// Validate the shape against a port count and frequency count.
    pub fn validate(&self, ports: usize, frequencies: usize) -> CalResult<()> {
        match self {
            ReferenceImpedance::Scalar(_) => Ok(()),
            ReferenceImpedance::PerPort(v) => {
                if v.len() != ports {
                    return Err(CalError::DimensionMismatch {
                        expected: format!("{} per-port Z0 entries", ports),
                        actual: format!("{}", v.len()),
                    });
                }
                Ok(())
            }
            ReferenceImpedance::PerPortPerFrequency(m) => {
                if m.len() != frequencies || m.iter().any(|row| row.len() != ports) {
                    return Err(CalError::DimensionMismatch {
                        expected: format!("{}x{} Z0 entries", frequencies, ports),
                        actual: format!(
                            "{}x{}",
                            m.len(),
                            m.first().map(|r| r.len()).unwrap_or(0)
                        ),
                    });
                }
                Ok(())
            }
        }
    }
}

impl Default for ReferenceImpedance {
    fn default() -> Self {
        Self::fifty_ohms()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
