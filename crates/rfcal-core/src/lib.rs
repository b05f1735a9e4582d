//! # VNA Calibration Engine
//!
//! This crate implements vector network analyzer (VNA) error correction:
//! solving the error terms of an instrument from measurements of known
//! calibration standards, and applying the solved terms to correct raw
//! measurements of a device under test (DUT) into actual S-parameters.
//!
//! ## Overview
//!
//! A raw VNA reading mixes the device's true S-parameters with the
//! instrument's own imperfections (directivity, tracking, port match,
//! leakage). Calibration characterizes those imperfections as complex
//! error terms per frequency point. Eight error-model topologies are
//! supported — T8, U8, TE10, UE10, T16, U16, UE14 and E12 — covering
//! everything from the classic one-port 3-term model up to full 16-term
//! models that observe every leakage path.
//!
//! - **Error-term layouts**: block structure and sizing per topology
//! - **Solving**: per-frequency linear systems over measured standards
//! - **Correction**: invert the measurement model for DUT sweeps,
//!   including multi-sweep coverage of DUTs with more ports than the
//!   calibration
//! - **Numerics**: a dedicated complex Householder QR kernel with
//!   rank-revealing solves and explicit singularity reporting
//!
//! ## Data Flow
//!
//! ```text
//! standards + raw measurements → CalibrationSolver → SolvedCalibration
//! DUT sweeps + SolvedCalibration → CalibrationApplicator → S-parameters
//! ```
//!
//! ## Example
//!
//! ```rust
//! use rfcal_core::prelude::*;
//!
//! // One-port calibration from the classic open/short/match trio.
//! let frequencies = vec![1.0e9, 2.0e9];
//! let mut solver =
//!     CalibrationSolver::new(CalType::E12, 1, 1, frequencies.clone()).unwrap();
//!
//! let open = solver.parameters_mut().scalar(Complex::new(1.0, 0.0));
//! let short = solver.parameters_mut().scalar(Complex::new(-1.0, 0.0));
//! let matched = solver.parameters_mut().match_();
//!
//! for id in [open, short, matched] {
//!     let s = ParamMatrix::filled(1, 1, id);
//!     // With an ideal instrument the raw reading equals the standard.
//!     let raw: Vec<ComplexMatrix> = frequencies
//!         .iter()
//!         .map(|&f| {
//!             let v = solver.parameters().value(id, f).unwrap();
//!             ComplexMatrix::from_data(1, 1, vec![v])
//!         })
//!         .collect();
//!     solver
//!         .add_standard(s, vec![Some(0)], Measurement::Scalar(raw))
//!         .unwrap();
//! }
//!
//! let solved = solver.solve().unwrap();
//! assert_eq!(solved.terms(0).len(), 3);
//! ```

pub mod applicator;
pub mod calibration_set;
pub mod complex_matrix;
pub mod error_terms;
pub mod measurement_model;
pub mod observe;
pub mod parameter;
pub mod solver;
pub mod types;

// Re-export main types
pub use applicator::CalibrationApplicator;
pub use calibration_set::CalibrationSet;
pub use complex_matrix::{mldivide, mrdivide, qrsolve_q, rel_eps, ComplexMatrix, QrDecomposition};
pub use error_terms::{
    needed_standards, requires_match_standard, BlockName, BlockShape, CalType, ErrorTermLayout,
    TermBlock, TermView,
};
pub use measurement_model::{measure_waves, model_measurement, random_error_terms, NoiseSource};
pub use observe::{init_logging, LogConfig, LogFormat, LogLevel};
pub use parameter::{ParamId, ParamMatrix, ParameterStore};
pub use solver::{CalibrationSolver, Measurement, NamedBlock, SolvedCalibration};
pub use types::{CalError, CalResult, Complex, ErrorCategory, PortMap, ReferenceImpedance};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::applicator::CalibrationApplicator;
    pub use crate::calibration_set::CalibrationSet;
    pub use crate::complex_matrix::ComplexMatrix;
    pub use crate::error_terms::{BlockName, CalType, ErrorTermLayout};
    pub use crate::parameter::{ParamMatrix, ParameterStore};
    pub use crate::solver::{CalibrationSolver, Measurement, SolvedCalibration};
    pub use crate::types::{CalError, CalResult, Complex, PortMap, ReferenceImpedance};
}
