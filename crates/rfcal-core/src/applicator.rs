//! Applying a solved calibration to DUT sweeps.
//!
//! A [`CalibrationApplicator`] inverts the measurement model of a
//! square [`SolvedCalibration`]: raw sweeps go in, the DUT's actual
//! S-parameters come out. A DUT may have more ports than the
//! calibration; each sweep carries a port map saying which DUT ports
//! the VNA was connected to, and the applicator scatters every
//! recovered sub-matrix into the full DUT matrix. Cells no sweep
//! covered stay NaN, so a partial measurement plan is visible in the
//! output instead of silently reading as zero.
//!
//! Correction formulas (M' is the raw measurement with leakage
//! subtracted where the topology separates it):
//!
//! - T family: solve `(M'·Tx − Ts)·S = Ti − M'·Tm`
//! - U family: `S = (Um·M' + Ui)·(Ux·M' + Us)^-1`
//! - UE14: per column `g = Dum·m' + ui·e_j`, `v = Dux·m' + us·e_j`,
//!   then `S = G·V^-1`
//! - E12: per column `x = (m − el) ⊘ er`, `w = e_j + em ⊙ x`, then
//!   `S = X·W^-1`
//!
//! Every inversion carries a determinant check; a degenerate sweep
//! yields [`CalError::SingularSystem`] naming the frequency point
//! rather than NaN-poisoned output.

use crate::complex_matrix::{mldivide, mrdivide, rel_eps, ComplexMatrix};
use crate::error_terms::{BlockName, CalType};
use crate::solver::{Measurement, SolvedCalibration};
use crate::types::{CalError, CalResult, Complex, PortMap};

/// Relative tolerance for matching sweep frequencies against the
/// calibration grid.
const FREQUENCY_TOLERANCE: f64 = 1.0e-9;

/// Accumulates corrected DUT sweeps against one solved calibration.
#[derive(Debug)]
pub struct CalibrationApplicator {
    solved: SolvedCalibration,
    dut_ports: usize,
    /// Per frequency, dut_ports-square, NaN where not yet covered.
    corrected: Vec<ComplexMatrix>,
    covered: Vec<bool>,
}

impl CalibrationApplicator {
    /// Create an applicator for a DUT with `dut_ports` ports.
    ///
    /// Only square calibrations can correct measurements: a
    /// rectangular calibration characterizes detector rows the VNA
    /// cannot drive, so the model is not invertible for a device.
    pub fn new(solved: SolvedCalibration, dut_ports: usize) -> CalResult<Self> {
        if solved.m_rows() != solved.m_columns() {
            return Err(CalError::InvalidDimensions {
                cal_type: solved.cal_type().name(),
                requirement: format!(
                    "a square calibration to correct measurements, got {}x{}",
                    solved.m_rows(),
                    solved.m_columns()
                ),
            });
        }
        if dut_ports < 1 {
            return Err(CalError::InvalidDimensions {
                cal_type: solved.cal_type().name(),
                requirement: "a device with at least one port".into(),
            });
        }
        let nan = Complex::new(f64::NAN, f64::NAN);
        let corrected = (0..solved.frequencies().len())
            .map(|_| {
                ComplexMatrix::from_data(
                    dut_ports,
                    dut_ports,
                    vec![nan; dut_ports * dut_ports],
                )
            })
            .collect();
        Ok(Self {
            solved,
            dut_ports,
            corrected,
            covered: vec![false; dut_ports * dut_ports],
        })
    }

    pub fn solved(&self) -> &SolvedCalibration {
        &self.solved
    }

    pub fn dut_ports(&self) -> usize {
        self.dut_ports
    }

    /// True if some sweep has covered DUT cell (i, j).
    pub fn is_covered(&self, i: usize, j: usize) -> bool {
        self.covered[i * self.dut_ports + j]
    }

    /// Correct one raw sweep and scatter it into the DUT matrix.
    ///
    /// `port_map` has one entry per VNA port giving the DUT port it
    /// was connected to (`None` for terminated VNA ports);
    /// `frequencies` must reproduce the calibration grid.
    pub fn add_sweep(
        &mut self,
        frequencies: &[f64],
        port_map: &PortMap,
        measurement: Measurement,
    ) -> CalResult<()> {
        let n = self.solved.ports();
        let cal_freqs = self.solved.frequencies();
        if frequencies.len() != cal_freqs.len() {
            return Err(CalError::FrequencyMismatch {
                expected: cal_freqs.len(),
                actual: frequencies.len(),
            });
        }
        for (index, (&got, &want)) in frequencies.iter().zip(cal_freqs.iter()).enumerate() {
            if (got - want).abs() > FREQUENCY_TOLERANCE * want.abs().max(1.0) {
                return Err(CalError::SweepFrequencyMismatch {
                    index,
                    expected: want,
                    actual: got,
                });
            }
        }

        if port_map.len() != n {
            return Err(CalError::PortMapLength {
                expected: n,
                actual: port_map.len(),
            });
        }
        let mut seen = vec![false; self.dut_ports];
        for (entry, target) in port_map.iter().enumerate() {
            if let Some(t) = *target {
                if t >= self.dut_ports {
                    return Err(CalError::PortMapTarget {
                        entry,
                        target: t,
                        limit: self.dut_ports,
                    });
                }
                if seen[t] {
                    return Err(CalError::PortMapDuplicate { target: t });
                }
                seen[t] = true;
            }
        }

        let raw = self.convert_measurement(measurement)?;
        tracing::debug!(
            cal_type = self.solved.cal_type().name(),
            mapped = port_map.iter().flatten().count(),
            "correcting sweep"
        );

        for (fi, m) in raw.iter().enumerate() {
            let s = self.correct_frequency(fi, m)?;
            for i in 0..n {
                for j in 0..n {
                    if let (Some(di), Some(dj)) = (port_map[i], port_map[j]) {
                        self.corrected[fi].set(di, dj, s.get(i, j));
                        self.covered[di * self.dut_ports + dj] = true;
                    }
                }
            }
        }
        Ok(())
    }

    /// Finish, returning the corrected per-frequency DUT matrices.
    /// Uncovered cells are NaN.
    pub fn finish(self) -> Vec<ComplexMatrix> {
        self.corrected
    }

    fn convert_measurement(&self, measurement: Measurement) -> CalResult<Vec<ComplexMatrix>> {
        let n = self.solved.ports();
        let nf = self.solved.frequencies().len();
        match measurement {
            Measurement::Scalar(ms) => {
                if ms.len() != nf {
                    return Err(CalError::FrequencyMismatch {
                        expected: nf,
                        actual: ms.len(),
                    });
                }
                for m in &ms {
                    if m.rows() != n || m.cols() != n {
                        return Err(CalError::DimensionMismatch {
                            expected: format!("{}x{} sweep measurement", n, n),
                            actual: format!("{}x{}", m.rows(), m.cols()),
                        });
                    }
                }
                Ok(ms)
            }
            Measurement::Waves { a, b } => {
                if a.len() != nf || b.len() != nf {
                    return Err(CalError::FrequencyMismatch {
                        expected: nf,
                        actual: a.len().min(b.len()),
                    });
                }
                let mut out = Vec::with_capacity(nf);
                for (fi, (ai, bi)) in a.iter().zip(b.iter()).enumerate() {
                    if ai.rows() != n || ai.cols() != n || bi.rows() != n || bi.cols() != n {
                        return Err(CalError::DimensionMismatch {
                            expected: format!("{}x{} wave matrices", n, n),
                            actual: format!(
                                "a: {}x{}, b: {}x{}",
                                ai.rows(),
                                ai.cols(),
                                bi.rows(),
                                bi.cols()
                            ),
                        });
                    }
                    let (m, det) = mrdivide(bi, ai);
                    if det.norm() <= rel_eps() {
                        return Err(CalError::SingularSystem {
                            frequency_index: fi,
                        });
                    }
                    out.push(m);
                }
                Ok(out)
            }
        }
    }

    fn correct_frequency(&self, fi: usize, m: &ComplexMatrix) -> CalResult<ComplexMatrix> {
        correct_one(&self.solved, fi, m)
    }
}

/// Invert the measurement model at one frequency point. Shared by the
/// applicator and [`SolvedCalibration::apply_m`].
pub(crate) fn correct_one(
    solved: &SolvedCalibration,
    fi: usize,
    m: &ComplexMatrix,
) -> CalResult<ComplexMatrix> {
    let layout = solved.layout();
    let n = solved.ports();

    if layout.is_one_port() || solved.cal_type() == CalType::E12 {
        return correct_e12(solved, fi, m);
    }
    match solved.cal_type() {
        CalType::T8 | CalType::Te10 | CalType::T16 => {
            let mp = leakage_corrected(solved, fi, m);
            let ts = solved.term_view(fi, BlockName::Ts).expect("ts").to_matrix();
            let ti = solved.term_view(fi, BlockName::Ti).expect("ti").to_matrix();
            let tx = solved.term_view(fi, BlockName::Tx).expect("tx").to_matrix();
            let tm = solved.term_view(fi, BlockName::Tm).expect("tm").to_matrix();
            let lhs = mp.multiply(&tx).subtract(&ts);
            let rhs = ti.subtract(&mp.multiply(&tm));
            let (s, det) = mldivide(&lhs, &rhs);
            if det.norm() <= rel_eps() {
                return Err(CalError::SingularSystem {
                    frequency_index: fi,
                });
            }
            Ok(s)
        }
        CalType::U8 | CalType::Ue10 | CalType::U16 => {
            let mp = leakage_corrected(solved, fi, m);
            let um = solved.term_view(fi, BlockName::Um).expect("um").to_matrix();
            let ui = solved.term_view(fi, BlockName::Ui).expect("ui").to_matrix();
            let ux = solved.term_view(fi, BlockName::Ux).expect("ux").to_matrix();
            let us = solved.term_view(fi, BlockName::Us).expect("us").to_matrix();
            let num = um.multiply(&mp).add(&ui);
            let den = ux.multiply(&mp).add(&us);
            let (s, det) = mrdivide(&num, &den);
            if det.norm() <= rel_eps() {
                return Err(CalError::SingularSystem {
                    frequency_index: fi,
                });
            }
            Ok(s)
        }
        CalType::Ue14 => {
            let mp = leakage_corrected(solved, fi, m);
            let mut g = ComplexMatrix::new(n, n);
            let mut v = ComplexMatrix::new(n, n);
            for j in 0..n {
                let um = solved
                    .column_term_view(fi, BlockName::Um, j)
                    .expect("um");
                let ux = solved
                    .column_term_view(fi, BlockName::Ux, j)
                    .expect("ux");
                let ui = solved
                    .column_term_view(fi, BlockName::Ui, j)
                    .expect("ui")
                    .get(0, 0);
                let us = solved
                    .column_term_view(fi, BlockName::Us, j)
                    .expect("us")
                    .get(0, 0);
                for i in 0..n {
                    let mut gi = um.get(i, i) * mp.get(i, j);
                    let mut vi = ux.get(i, i) * mp.get(i, j);
                    if i == j {
                        gi += ui;
                        vi += us;
                    }
                    g.set(i, j, gi);
                    v.set(i, j, vi);
                }
            }
            let (s, det) = mrdivide(&g, &v);
            if det.norm() <= rel_eps() {
                return Err(CalError::SingularSystem {
                    frequency_index: fi,
                });
            }
            Ok(s)
        }
        CalType::E12 => unreachable!("handled above"),
    }
}

/// E12 (and one-port): undo directivity/tracking per cell, then invert
/// the match loop.
fn correct_e12(solved: &SolvedCalibration, fi: usize, m: &ComplexMatrix) -> CalResult<ComplexMatrix> {
    let n = solved.ports();
    let mut x = ComplexMatrix::new(n, n);
    let mut w = ComplexMatrix::new(n, n);
    for j in 0..n {
        let el = solved.column_term_view(fi, BlockName::El, j).expect("el");
        let er = solved.column_term_view(fi, BlockName::Er, j).expect("er");
        let em = solved.column_term_view(fi, BlockName::Em, j).expect("em");
        for i in 0..n {
            let tracking = er.get(i, 0);
            if tracking.norm() <= rel_eps() {
                return Err(CalError::SingularSystem {
                    frequency_index: fi,
                });
            }
            let xi = (m.get(i, j) - el.get(i, 0)) / tracking;
            let mut wi = em.get(i, 0) * xi;
            if i == j {
                wi += Complex::new(1.0, 0.0);
            }
            x.set(i, j, xi);
            w.set(i, j, wi);
        }
    }
    let (s, det) = mrdivide(&x, &w);
    if det.norm() <= rel_eps() {
        return Err(CalError::SingularSystem {
            frequency_index: fi,
        });
    }
    Ok(s)
}

/// Subtract the separately-stored leakage block where the topology has
/// one.
fn leakage_corrected(solved: &SolvedCalibration, fi: usize, m: &ComplexMatrix) -> ComplexMatrix {
    if solved.cal_type().has_leakage_block() {
        let el = solved
            .term_view(fi, BlockName::El)
            .expect("el")
            .to_matrix();
        m.subtract(&el)
    } else {
        m.clone()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_terms::ErrorTermLayout;
    use crate::measurement_model::{
        measure_waves, model_measurement, random_error_terms, NoiseSource,
    };
    use crate::solver::NamedBlock;
    use crate::types::ReferenceImpedance;

    /// Build a solved calibration directly from synthetic error terms
    /// through the named-block constructor.
    fn synth_calibration(
        cal_type: CalType,
        n: usize,
        frequencies: Vec<f64>,
        seed: u64,
    ) -> (SolvedCalibration, ErrorTermLayout, Vec<Vec<Complex>>) {
        let (layout, truth) =
            random_error_terms(cal_type, n, n, frequencies.len(), seed).unwrap();
        let blocks: Vec<NamedBlock> = layout
            .blocks()
            .iter()
            .map(|b| NamedBlock {
                name: b.name.as_str().to_string(),
                column: b.column,
                values: truth
                    .iter()
                    .map(|t| t[b.offset..b.offset + b.len].to_vec())
                    .collect(),
            })
            .collect();
        let solved = SolvedCalibration::from_blocks(
            cal_type,
            n,
            n,
            frequencies,
            ReferenceImpedance::fifty_ohms(),
            &blocks,
        )
        .unwrap();
        (solved, layout, truth)
    }

    fn submatrix(m: &ComplexMatrix, ports: &[usize]) -> ComplexMatrix {
        let k = ports.len();
        let mut out = ComplexMatrix::new(k, k);
        for (i, &pi) in ports.iter().enumerate() {
            for (j, &pj) in ports.iter().enumerate() {
                out.set(i, j, m.get(pi, pj));
            }
        }
        out
    }

    #[test]
    fn test_round_trip_recovers_dut_all_types() {
        // Simulate a raw measurement of a known device and correct it:
        // the output must be the device.
        let frequencies = vec![1.0e9, 2.0e9];
        for &cal_type in &CalType::ALL {
            for n in [1, 2, 3, 5] {
                let (solved, layout, truth) =
                    synth_calibration(cal_type, n, frequencies.clone(), 0x900 + n as u64);
                let mut noise = NoiseSource::new(0x1000 + n as u64);
                let dut: Vec<ComplexMatrix> =
                    (0..frequencies.len()).map(|_| noise.matrix(n, n, 0.5)).collect();

                let raw: Vec<ComplexMatrix> = dut
                    .iter()
                    .enumerate()
                    .map(|(fi, d)| model_measurement(&layout, &truth[fi], d, fi).unwrap())
                    .collect();

                let mut app = CalibrationApplicator::new(solved, n).unwrap();
                let map: PortMap = (0..n).map(Some).collect();
                app.add_sweep(&frequencies, &map, Measurement::Scalar(raw))
                    .unwrap();
                let corrected = app.finish();

                for (fi, d) in dut.iter().enumerate() {
                    for i in 0..n {
                        for j in 0..n {
                            let diff = (corrected[fi].get(i, j) - d.get(i, j)).norm();
                            assert!(
                                diff < 1e-8,
                                "{} {}x{} fi={} ({}, {}): diff {}",
                                cal_type.name(),
                                n,
                                n,
                                fi,
                                i,
                                j,
                                diff
                            );
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_three_port_dut_with_two_port_calibration() {
        // Cover a 3-port DUT with the three pairwise 2-port sweeps.
        let frequencies = vec![1.0e9];
        let (solved, layout, truth) =
            synth_calibration(CalType::Ue10, 2, frequencies.clone(), 0x31);
        let mut noise = NoiseSource::new(0x32);
        let dut = noise.matrix(3, 3, 0.5);

        let mut app = CalibrationApplicator::new(solved, 3).unwrap();
        for pair in [[0usize, 1], [0, 2], [1, 2]] {
            let sub = submatrix(&dut, &pair);
            let raw = model_measurement(&layout, &truth[0], &sub, 0).unwrap();
            let map: PortMap = pair.iter().map(|&p| Some(p)).collect();
            app.add_sweep(&frequencies, &map, Measurement::Scalar(vec![raw]))
                .unwrap();
        }
        assert!(app.is_covered(0, 2));
        let corrected = app.finish();
        for i in 0..3 {
            for j in 0..3 {
                let diff = (corrected[0].get(i, j) - dut.get(i, j)).norm();
                assert!(diff < 1e-8, "({}, {}): diff {}", i, j, diff);
            }
        }
    }

    #[test]
    fn test_apply_m_shortcut_matches_applicator() {
        let frequencies = vec![1.0e9, 2.0e9];
        let (solved, layout, truth) =
            synth_calibration(CalType::Ue14, 2, frequencies.clone(), 0x71);
        let mut noise = NoiseSource::new(0x72);

        for fi in 0..frequencies.len() {
            let dut = noise.matrix(2, 2, 0.5);
            let raw = model_measurement(&layout, &truth[fi], &dut, fi).unwrap();
            let corrected = solved.apply_m(fi, &raw).unwrap();
            for i in 0..2 {
                for j in 0..2 {
                    assert!((corrected.get(i, j) - dut.get(i, j)).norm() < 1e-8);
                }
            }
        }

        // Wrong measurement size is a usage error.
        assert!(matches!(
            solved.apply_m(0, &ComplexMatrix::new(3, 3)),
            Err(CalError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_uncovered_cells_stay_nan() {
        let frequencies = vec![1.0e9];
        let (solved, layout, truth) =
            synth_calibration(CalType::E12, 2, frequencies.clone(), 0x41);
        let mut noise = NoiseSource::new(0x42);
        let dut = noise.matrix(3, 3, 0.5);

        let mut app = CalibrationApplicator::new(solved, 3).unwrap();
        let sub = submatrix(&dut, &[0, 1]);
        let raw = model_measurement(&layout, &truth[0], &sub, 0).unwrap();
        app.add_sweep(
            &frequencies,
            &vec![Some(0), Some(1)],
            Measurement::Scalar(vec![raw]),
        )
        .unwrap();
        assert!(!app.is_covered(2, 2));
        let corrected = app.finish();
        assert!(corrected[0].get(2, 2).re.is_nan());
        assert!(corrected[0].get(0, 2).re.is_nan());
        assert!(!corrected[0].get(0, 1).re.is_nan());
    }

    #[test]
    fn test_wave_sweeps() {
        let frequencies = vec![1.0e9, 2.0e9];
        let (solved, layout, truth) =
            synth_calibration(CalType::T8, 2, frequencies.clone(), 0x51);
        let mut noise = NoiseSource::new(0x52);
        let dut: Vec<ComplexMatrix> = (0..2).map(|_| noise.matrix(2, 2, 0.5)).collect();

        let (mut a, mut b) = (Vec::new(), Vec::new());
        for (fi, d) in dut.iter().enumerate() {
            let raw = model_measurement(&layout, &truth[fi], d, fi).unwrap();
            let (ai, bi) = measure_waves(&raw, 0.1, &mut noise);
            a.push(ai);
            b.push(bi);
        }

        let mut app = CalibrationApplicator::new(solved, 2).unwrap();
        app.add_sweep(
            &frequencies,
            &vec![Some(0), Some(1)],
            Measurement::Waves { a, b },
        )
        .unwrap();
        let corrected = app.finish();
        for (fi, d) in dut.iter().enumerate() {
            for i in 0..2 {
                for j in 0..2 {
                    assert!((corrected[fi].get(i, j) - d.get(i, j)).norm() < 1e-8);
                }
            }
        }
    }

    #[test]
    fn test_rectangular_calibration_rejected() {
        let frequencies = vec![1.0e9];
        let (layout, truth) = random_error_terms(CalType::T8, 2, 3, 1, 7).unwrap();
        let blocks: Vec<NamedBlock> = layout
            .blocks()
            .iter()
            .map(|b| NamedBlock {
                name: b.name.as_str().to_string(),
                column: b.column,
                values: truth
                    .iter()
                    .map(|t| t[b.offset..b.offset + b.len].to_vec())
                    .collect(),
            })
            .collect();
        let solved = SolvedCalibration::from_blocks(
            CalType::T8,
            2,
            3,
            frequencies,
            ReferenceImpedance::fifty_ohms(),
            &blocks,
        )
        .unwrap();
        assert!(matches!(
            CalibrationApplicator::new(solved, 2),
            Err(CalError::InvalidDimensions { .. })
        ));
    }

    #[test]
    fn test_frequency_grid_must_match() {
        let frequencies = vec![1.0e9, 2.0e9];
        let (solved, _, _) = synth_calibration(CalType::E12, 2, frequencies, 0x61);
        let mut app = CalibrationApplicator::new(solved, 2).unwrap();
        let raw = vec![ComplexMatrix::new(2, 2), ComplexMatrix::new(2, 2)];
        let result = app.add_sweep(
            &[1.0e9, 2.1e9],
            &vec![Some(0), Some(1)],
            Measurement::Scalar(raw),
        );
        assert!(matches!(
            result,
            Err(CalError::SweepFrequencyMismatch { index: 1, .. })
        ));
    }

    #[test]
    fn test_singular_sweep_names_frequency() {
        // One-port: pick the raw value that drives the match loop
        // denominator to zero, m = el - er/em.
        let frequencies = vec![1.0e9];
        let el = Complex::new(0.1, 0.0);
        let er = Complex::new(1.0, 0.0);
        let em = Complex::new(0.5, 0.0);
        let blocks = vec![
            NamedBlock {
                name: "el".into(),
                column: Some(0),
                values: vec![vec![el]],
            },
            NamedBlock {
                name: "er".into(),
                column: Some(0),
                values: vec![vec![er]],
            },
            NamedBlock {
                name: "em".into(),
                column: Some(0),
                values: vec![vec![em]],
            },
        ];
        let solved = SolvedCalibration::from_blocks(
            CalType::E12,
            1,
            1,
            frequencies.clone(),
            ReferenceImpedance::fifty_ohms(),
            &blocks,
        )
        .unwrap();
        let mut app = CalibrationApplicator::new(solved, 1).unwrap();
        let bad = el - er / em;
        let raw = ComplexMatrix::from_data(1, 1, vec![bad]);
        let result = app.add_sweep(&frequencies, &vec![Some(0)], Measurement::Scalar(vec![raw]));
        assert!(matches!(
            result,
            Err(CalError::SingularSystem { frequency_index: 0 })
        ));
    }
}
