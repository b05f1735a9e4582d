//! Calibration solving: from measured standards to error terms.
//!
//! [`CalibrationSolver`] accumulates standards — each a known
//! S-parameter matrix, a port map and a raw measurement per frequency
//! point — and [`solve`](CalibrationSolver::solve)s for the error
//! terms of the configured topology. The result is a
//! [`SolvedCalibration`], the serializable artifact a
//! [`CalibrationApplicator`](crate::applicator::CalibrationApplicator)
//! later consumes to correct DUT sweeps.
//!
//! Each topology's model equation (see
//! [`measurement_model`](crate::measurement_model)) is linear in the
//! error terms once one term is pinned to unity — the models are
//! homogeneous in the terms, so one gauge degree of freedom must be
//! fixed. T-family solves pin the first `tm` entry, U-family solves
//! the first `um` entry, UE14 pins `us` per column, and E12 uses a
//! substitution (documented on [`CalType::E12`]'s solve arm) that pins
//! the reciprocal tracking term of the driven row. Every measurement
//! cell whose detector row and driven column are both port-mapped
//! contributes one equation; the stacked system is solved per
//! frequency by QR least squares with a hard rank check.
//!
//! Off-diagonal leakage (`el`) terms of the TE10 / UE10 / UE14 / E12
//! topologies are not part of the linear system: they are read
//! directly off the off-diagonal measurements of fully-connected
//! standards with diagonal S-matrices (every path through the
//! standard blocked, so whatever arrives is leakage), averaged over
//! all such standards.

use serde::{Deserialize, Serialize};

use crate::complex_matrix::{mrdivide, qrsolve_q, rel_eps, ComplexMatrix};
use crate::error_terms::{
    needed_standards, off_diagonal_index, requires_match_standard, BlockName, CalType,
    ErrorTermLayout, TermView,
};
use crate::measurement_model::model_measurement;
use crate::parameter::{ParamMatrix, ParameterStore};
use crate::types::{CalError, CalResult, Complex, PortMap, ReferenceImpedance};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

// ---------------------------------------------------------------------------
// Measurements
// ---------------------------------------------------------------------------

/// Raw data recorded for one standard, one matrix per frequency point.
#[derive(Debug, Clone)]
pub enum Measurement {
    /// Already-ratioed measurement matrices (detector rows by driven
    /// columns).
    Scalar(Vec<ComplexMatrix>),
    /// Incident / reflected wave pairs: `a` is driven-columns square,
    /// `b` detector-rows by driven-columns, and the ratioed
    /// measurement is `b · a^-1`.
    Waves {
        a: Vec<ComplexMatrix>,
        b: Vec<ComplexMatrix>,
    },
}

#[derive(Debug, Clone)]
struct StandardEntry {
    s: ParamMatrix,
    port_map: PortMap,
    /// Ratioed measurements, one per frequency.
    measurements: Vec<ComplexMatrix>,
    fully_mapped: bool,
    /// Embedded S-matrix is diagonal: usable for leakage estimation
    /// when also fully mapped.
    diagonal_embedded: bool,
}

// ---------------------------------------------------------------------------
// Solver
// ---------------------------------------------------------------------------

/// Accumulates measured standards and solves for error terms.
///
/// The solver owns the [`ParameterStore`] its standards' S-parameters
/// live in; register parameters through
/// [`parameters_mut`](Self::parameters_mut) before building
/// [`ParamMatrix`] descriptions.
#[derive(Debug)]
pub struct CalibrationSolver {
    cal_type: CalType,
    m_rows: usize,
    m_columns: usize,
    frequencies: Vec<f64>,
    layout: ErrorTermLayout,
    store: ParameterStore,
    standards: Vec<StandardEntry>,
    z0: ReferenceImpedance,
}

impl CalibrationSolver {
    /// Create a solver for the given topology, VNA dimensions and
    /// frequency grid.
    pub fn new(
        cal_type: CalType,
        m_rows: usize,
        m_columns: usize,
        frequencies: Vec<f64>,
    ) -> CalResult<Self> {
        let layout = ErrorTermLayout::new(cal_type, m_rows, m_columns)?;
        if frequencies.is_empty() {
            return Err(CalError::DimensionMismatch {
                expected: "at least one frequency point".into(),
                actual: "0".into(),
            });
        }
        Ok(Self {
            cal_type,
            m_rows,
            m_columns,
            frequencies,
            layout,
            store: ParameterStore::new(),
            standards: Vec::new(),
            z0: ReferenceImpedance::fifty_ohms(),
        })
    }

    pub fn cal_type(&self) -> CalType {
        self.cal_type
    }

    /// Number of physical VNA ports.
    pub fn ports(&self) -> usize {
        self.layout.ports()
    }

    pub fn frequencies(&self) -> &[f64] {
        &self.frequencies
    }

    pub fn standard_count(&self) -> usize {
        self.standards.len()
    }

    pub fn parameters(&self) -> &ParameterStore {
        &self.store
    }

    pub fn parameters_mut(&mut self) -> &mut ParameterStore {
        &mut self.store
    }

    /// Set the reference impedance recorded in the solved calibration.
    pub fn set_z0(&mut self, z0: ReferenceImpedance) -> CalResult<()> {
        z0.validate(self.ports(), self.frequencies.len())?;
        self.z0 = z0;
        Ok(())
    }

    /// Add one measured standard.
    ///
    /// `s` is the standard's own square S-matrix (parameter handles
    /// into this solver's store); `port_map` has one entry per VNA
    /// port giving the standard port it connects to, `None` for
    /// terminated ports. Only measurement cells whose detector row and
    /// driven column are both mapped contribute equations.
    pub fn add_standard(
        &mut self,
        s: ParamMatrix,
        port_map: PortMap,
        measurement: Measurement,
    ) -> CalResult<()> {
        let ports = self.ports();
        if s.rows() != s.cols() {
            return Err(CalError::DimensionMismatch {
                expected: "a square standard S-matrix".into(),
                actual: format!("{}x{}", s.rows(), s.cols()),
            });
        }
        if port_map.len() != ports {
            return Err(CalError::PortMapLength {
                expected: ports,
                actual: port_map.len(),
            });
        }
        let mut seen = vec![false; s.rows()];
        for (entry, target) in port_map.iter().enumerate() {
            if let Some(t) = *target {
                if t >= s.rows() {
                    return Err(CalError::PortMapTarget {
                        entry,
                        target: t,
                        limit: s.rows(),
                    });
                }
                if seen[t] {
                    return Err(CalError::PortMapDuplicate { target: t });
                }
                seen[t] = true;
            }
        }

        let fully_mapped = port_map.iter().all(|p| p.is_some());
        if matches!(self.cal_type, CalType::T16 | CalType::U16) && !fully_mapped {
            return Err(CalError::InvalidDimensions {
                cal_type: self.cal_type.name(),
                requirement: "fully connected standards (every leakage path is observed)".into(),
            });
        }

        // The embedded S is diagonal iff no mapped off-diagonal pair
        // hits a non-zero parameter; recognized through the shared
        // zero constant.
        let zero = self.store.zero();
        let mut diagonal_embedded = true;
        for i in 0..ports {
            for j in 0..ports {
                if i == j {
                    continue;
                }
                if let (Some(a), Some(b)) = (port_map[i], port_map[j]) {
                    if s.get(a, b) != zero {
                        diagonal_embedded = false;
                    }
                }
            }
        }

        let measurements = self.convert_measurement(measurement)?;
        self.standards.push(StandardEntry {
            s,
            port_map,
            measurements,
            fully_mapped,
            diagonal_embedded,
        });
        Ok(())
    }

    /// Validate shapes and ratio wave pairs into measurement matrices.
    fn convert_measurement(&self, measurement: Measurement) -> CalResult<Vec<ComplexMatrix>> {
        let nf = self.frequencies.len();
        let (r, c) = (self.m_rows, self.m_columns);
        match measurement {
            Measurement::Scalar(ms) => {
                if ms.len() != nf {
                    return Err(CalError::FrequencyMismatch {
                        expected: nf,
                        actual: ms.len(),
                    });
                }
                for m in &ms {
                    if m.rows() != r || m.cols() != c {
                        return Err(CalError::DimensionMismatch {
                            expected: format!("{}x{} measurement", r, c),
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
                    if ai.rows() != c || ai.cols() != c || bi.rows() != r || bi.cols() != c {
                        return Err(CalError::DimensionMismatch {
                            expected: format!("a: {}x{}, b: {}x{}", c, c, r, c),
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

    /// Solve for the error terms at every frequency, consuming the
    /// solver.
    pub fn solve(self) -> CalResult<SolvedCalibration> {
        let needed =
            needed_standards(self.cal_type, self.m_rows, self.m_columns);
        let needs_match = requires_match_standard(self.cal_type, self.m_rows, self.m_columns);
        let needed_total = needed + usize::from(needs_match);
        if self.standards.len() < needed_total {
            return Err(CalError::InsufficientStandards {
                needed: needed_total,
                have: self.standards.len(),
            });
        }
        let leakage_needed =
            needs_match || (self.cal_type == CalType::E12 && self.ports() > 1);
        if leakage_needed
            && !self
                .standards
                .iter()
                .any(|st| st.fully_mapped && st.diagonal_embedded)
        {
            return Err(CalError::LeakageUnresolved);
        }

        tracing::debug!(
            cal_type = self.cal_type.name(),
            rows = self.m_rows,
            columns = self.m_columns,
            standards = self.standards.len(),
            frequencies = self.frequencies.len(),
            "solving calibration"
        );

        let nf = self.frequencies.len();
        #[cfg(feature = "parallel")]
        let terms: CalResult<Vec<Vec<Complex>>> = (0..nf)
            .into_par_iter()
            .map(|fi| self.solve_frequency(fi))
            .collect();
        #[cfg(not(feature = "parallel"))]
        let terms: CalResult<Vec<Vec<Complex>>> =
            (0..nf).map(|fi| self.solve_frequency(fi)).collect();

        Ok(SolvedCalibration {
            cal_type: self.cal_type,
            m_rows: self.m_rows,
            m_columns: self.m_columns,
            frequencies: self.frequencies,
            z0: self.z0,
            layout: self.layout,
            terms: terms?,
        })
    }

    /// Embed a standard's evaluated S-matrix into VNA port space:
    /// mapped port pairs carry the standard's entries, everything
    /// touching a terminated port is zero.
    fn embed(&self, s: &ComplexMatrix, port_map: &PortMap) -> ComplexMatrix {
        let ports = self.ports();
        let mut e = ComplexMatrix::new(ports, ports);
        for i in 0..ports {
            for j in 0..ports {
                if let (Some(a), Some(b)) = (port_map[i], port_map[j]) {
                    e.set(i, j, s.get(a, b));
                }
            }
        }
        e
    }

    fn solve_frequency(&self, fi: usize) -> CalResult<Vec<Complex>> {
        let frequency = self.frequencies[fi];
        let (r, c) = (self.m_rows, self.m_columns);

        // Embedded S per standard at this frequency.
        let mut prepared: Vec<(ComplexMatrix, &StandardEntry)> =
            Vec::with_capacity(self.standards.len());
        for st in &self.standards {
            let s = st.s.evaluate(&self.store, frequency)?;
            prepared.push((self.embed(&s, &st.port_map), st));
        }

        // Leakage: average the off-diagonal measurements of every
        // fully-connected diagonal standard.
        let leakage_families = matches!(
            self.cal_type,
            CalType::Te10 | CalType::Ue10 | CalType::Ue14 | CalType::E12
        ) && self.ports() > 1;
        let mut el_avg = ComplexMatrix::new(r, c);
        if leakage_families {
            let mut count = 0usize;
            for (_, st) in prepared
                .iter()
                .filter(|(_, st)| st.fully_mapped && st.diagonal_embedded)
            {
                count += 1;
                let m = &st.measurements[fi];
                for i in 0..r {
                    for j in 0..c {
                        if i != j {
                            el_avg.set(i, j, el_avg.get(i, j) + m.get(i, j));
                        }
                    }
                }
            }
            // count >= 1 was checked in solve().
            let scale = Complex::new(1.0 / count as f64, 0.0);
            for i in 0..r {
                for j in 0..c {
                    el_avg.set(i, j, el_avg.get(i, j) * scale);
                }
            }
        }

        // Leakage-corrected measurements (identical to raw for the
        // other families; the diagonal is never touched).
        let corrected: Vec<ComplexMatrix> = prepared
            .iter()
            .map(|(_, st)| {
                if leakage_families {
                    st.measurements[fi].subtract(&el_avg)
                } else {
                    st.measurements[fi].clone()
                }
            })
            .collect();

        let mut terms = vec![Complex::new(0.0, 0.0); self.layout.total_terms()];

        // Store the averaged leakage terms.
        if leakage_families {
            if self.cal_type == CalType::E12 {
                for j in 0..c {
                    let el = self.layout.column_block(BlockName::El, j).expect("el block");
                    for i in 0..r {
                        if i != j {
                            terms[el.offset + i] = el_avg.get(i, j);
                        }
                    }
                }
            } else {
                let el = self.layout.block(BlockName::El).expect("el block");
                for i in 0..r {
                    for j in 0..c {
                        if i != j {
                            terms[el.offset + off_diagonal_index(i, j, r, c)] = el_avg.get(i, j);
                        }
                    }
                }
            }
        }

        if self.layout.is_one_port() || self.cal_type == CalType::E12 {
            self.solve_e12(fi, &prepared, &corrected, &mut terms)?;
        } else {
            match self.cal_type {
                CalType::T8 | CalType::Te10 | CalType::T16 => {
                    self.solve_t_family(fi, &prepared, &corrected, &mut terms)?
                }
                CalType::U8 | CalType::Ue10 | CalType::U16 => {
                    self.solve_u_family(fi, &prepared, &corrected, &mut terms)?
                }
                CalType::Ue14 => self.solve_ue14(fi, &prepared, &corrected, &mut terms)?,
                CalType::E12 => unreachable!("handled above"),
            }
        }
        Ok(terms)
    }

    /// Map flat term indices to system columns, skipping the leakage
    /// block (pre-averaged) and the pinned gauge term.
    fn system_index(&self, fixed_flat: usize) -> (Vec<Option<usize>>, usize) {
        let mut map = vec![None; self.layout.total_terms()];
        let mut next = 0;
        for block in self.layout.blocks() {
            if block.name == BlockName::El {
                continue;
            }
            for k in 0..block.len {
                let flat = block.offset + k;
                if flat == fixed_flat {
                    continue;
                }
                map[flat] = Some(next);
                next += 1;
            }
        }
        (map, next)
    }

    fn solve_t_family(
        &self,
        fi: usize,
        prepared: &[(ComplexMatrix, &StandardEntry)],
        corrected: &[ComplexMatrix],
        terms: &mut [Complex],
    ) -> CalResult<()> {
        let (r, c) = (self.m_rows, self.m_columns);
        let ts = self.layout.block(BlockName::Ts).expect("ts").offset;
        let ti = self.layout.block(BlockName::Ti).expect("ti").offset;
        let tx = self.layout.block(BlockName::Tx).expect("tx").offset;
        let tm = self.layout.block(BlockName::Tm).expect("tm").offset;
        let full = self.cal_type == CalType::T16;
        // Gauge: pin the first tm entry to 1.
        let (sys, unknowns) = self.system_index(tm);

        let one = Complex::new(1.0, 0.0);
        let mut system = LinearSystem::new(unknowns);
        for ((s, st), mp) in prepared.iter().zip(corrected.iter()) {
            for i in 0..r {
                if st.port_map[i].is_none() {
                    continue;
                }
                for j in 0..c {
                    if st.port_map[j].is_none() {
                        continue;
                    }
                    let mut row = vec![Complex::new(0.0, 0.0); unknowns];
                    let mut rhs = Complex::new(0.0, 0.0);
                    let mut add = |flat: usize, coeff: Complex, rhs: &mut Complex| match sys[flat]
                    {
                        Some(col) => row[col] += coeff,
                        None => *rhs -= coeff,
                    };
                    if full {
                        for l in 0..c {
                            add(ts + i * c + l, -s.get(l, j), &mut rhs);
                        }
                        add(ti + i * c + j, -one, &mut rhs);
                        for k in 0..c {
                            for l in 0..c {
                                add(tx + k * c + l, mp.get(i, k) * s.get(l, j), &mut rhs);
                            }
                            add(tm + k * c + j, mp.get(i, k), &mut rhs);
                        }
                    } else {
                        add(ts + i, -s.get(i, j), &mut rhs);
                        if i == j {
                            add(ti + i, -one, &mut rhs);
                        }
                        for k in 0..c {
                            add(tx + k, mp.get(i, k) * s.get(k, j), &mut rhs);
                        }
                        add(tm + j, mp.get(i, j), &mut rhs);
                    }
                    system.push(row, rhs);
                }
            }
        }

        let x = system.solve(fi)?;
        scatter(terms, &sys, &x);
        terms[tm] = one;
        Ok(())
    }

    fn solve_u_family(
        &self,
        fi: usize,
        prepared: &[(ComplexMatrix, &StandardEntry)],
        corrected: &[ComplexMatrix],
        terms: &mut [Complex],
    ) -> CalResult<()> {
        let (r, c) = (self.m_rows, self.m_columns);
        let um = self.layout.block(BlockName::Um).expect("um").offset;
        let ui = self.layout.block(BlockName::Ui).expect("ui").offset;
        let ux = self.layout.block(BlockName::Ux).expect("ux").offset;
        let us = self.layout.block(BlockName::Us).expect("us").offset;
        let full = self.cal_type == CalType::U16;
        // Gauge: pin the first um entry to 1.
        let (sys, unknowns) = self.system_index(um);

        let one = Complex::new(1.0, 0.0);
        let mut system = LinearSystem::new(unknowns);
        for ((s, st), mp) in prepared.iter().zip(corrected.iter()) {
            for i in 0..r {
                if st.port_map[i].is_none() {
                    continue;
                }
                for j in 0..c {
                    if st.port_map[j].is_none() {
                        continue;
                    }
                    let mut row = vec![Complex::new(0.0, 0.0); unknowns];
                    let mut rhs = Complex::new(0.0, 0.0);
                    let mut add = |flat: usize, coeff: Complex, rhs: &mut Complex| match sys[flat]
                    {
                        Some(col) => row[col] += coeff,
                        None => *rhs -= coeff,
                    };
                    if full {
                        for l in 0..r {
                            add(um + i * r + l, mp.get(l, j), &mut rhs);
                        }
                        add(ui + i * c + j, one, &mut rhs);
                        for k in 0..r {
                            for l in 0..r {
                                add(ux + k * r + l, -s.get(i, k) * mp.get(l, j), &mut rhs);
                            }
                            add(us + k * c + j, -s.get(i, k), &mut rhs);
                        }
                    } else {
                        add(um + i, mp.get(i, j), &mut rhs);
                        if i == j {
                            add(ui + i, one, &mut rhs);
                        }
                        for k in 0..r {
                            add(ux + k, -s.get(i, k) * mp.get(k, j), &mut rhs);
                        }
                        add(us + j, -s.get(i, j), &mut rhs);
                    }
                    system.push(row, rhs);
                }
            }
        }

        let x = system.solve(fi)?;
        scatter(terms, &sys, &x);
        terms[um] = one;
        Ok(())
    }

    /// UE14: independent per-column solves with `us` pinned to 1.
    /// Unknown order per column: `um` (r), `ui`, `ux` (r).
    fn solve_ue14(
        &self,
        fi: usize,
        prepared: &[(ComplexMatrix, &StandardEntry)],
        corrected: &[ComplexMatrix],
        terms: &mut [Complex],
    ) -> CalResult<()> {
        let (r, c) = (self.m_rows, self.m_columns);
        let one = Complex::new(1.0, 0.0);
        for j in 0..c {
            let unknowns = 2 * r + 1;
            let mut system = LinearSystem::new(unknowns);
            for ((s, st), mp) in prepared.iter().zip(corrected.iter()) {
                if st.port_map[j].is_none() {
                    continue;
                }
                for i in 0..r {
                    if st.port_map[i].is_none() {
                        continue;
                    }
                    let mut row = vec![Complex::new(0.0, 0.0); unknowns];
                    row[i] += mp.get(i, j); // um_i
                    if i == j {
                        row[r] += one; // ui
                    }
                    for k in 0..r {
                        row[r + 1 + k] += -s.get(i, k) * mp.get(k, j); // ux_k
                    }
                    system.push(row, s.get(i, j));
                }
            }
            let x = system.solve(fi)?;

            let um = self.layout.column_block(BlockName::Um, j).expect("um").offset;
            let ui = self.layout.column_block(BlockName::Ui, j).expect("ui").offset;
            let ux = self.layout.column_block(BlockName::Ux, j).expect("ux").offset;
            let us = self.layout.column_block(BlockName::Us, j).expect("us").offset;
            for i in 0..r {
                terms[um + i] = x[i];
                terms[ux + i] = x[r + 1 + i];
            }
            terms[ui] = x[r];
            terms[us] = one;
        }
        Ok(())
    }

    /// E12 (and every one-port solve): per driven column j the model
    /// is linearized with the substitution
    ///
    /// ```text
    ///   a_i = 1/er_i,  b = el_j/er_j,  c_k = em_k/er_k,
    ///   g   = 1 - em_j·el_j/er_j
    /// ```
    ///
    /// under which each mapped row i yields the homogeneous equation
    /// `a_i·m'_ij - b·δ_ij - Σ_k s_ik·c_k·m'_kj - s_ij·g = 0`. The
    /// scale gauge is pinned by `a_j := 1`; afterwards `el_j = b`,
    /// `em_j = c_j`, `er_j = g + b·c_j`, `er_i = er_j/a_i` and
    /// `em_i = c_i/a_i`. Unknown order: `a_i` for `i != j` (r-1), `b`,
    /// `c_k` (r), `g`.
    fn solve_e12(
        &self,
        fi: usize,
        prepared: &[(ComplexMatrix, &StandardEntry)],
        corrected: &[ComplexMatrix],
        terms: &mut [Complex],
    ) -> CalResult<()> {
        let r = self.m_rows;
        let c = self.m_columns;
        let one = Complex::new(1.0, 0.0);
        for j in 0..c {
            let b_idx = r - 1;
            let c_idx = |k: usize| r + k; // b_idx + 1 + k
            let g_idx = 2 * r;
            let a_idx = |i: usize| if i < j { i } else { i - 1 };
            let unknowns = 2 * r + 1;

            let mut system = LinearSystem::new(unknowns);
            for ((s, st), mp) in prepared.iter().zip(corrected.iter()) {
                if st.port_map[j].is_none() {
                    continue;
                }
                for i in 0..r {
                    if st.port_map[i].is_none() {
                        continue;
                    }
                    let mut row = vec![Complex::new(0.0, 0.0); unknowns];
                    let mut rhs = Complex::new(0.0, 0.0);
                    if i == j {
                        // a_j is pinned to 1.
                        rhs -= mp.get(j, j);
                        row[b_idx] -= one;
                    } else {
                        row[a_idx(i)] += mp.get(i, j);
                    }
                    for k in 0..r {
                        row[c_idx(k)] -= s.get(i, k) * mp.get(k, j);
                    }
                    row[g_idx] -= s.get(i, j);
                    system.push(row, rhs);
                }
            }
            let x = system.solve(fi)?;

            let el = self.layout.column_block(BlockName::El, j).expect("el").offset;
            let er = self.layout.column_block(BlockName::Er, j).expect("er").offset;
            let em = self.layout.column_block(BlockName::Em, j).expect("em").offset;
            let b = x[b_idx];
            let g = x[g_idx];
            let er_jj = g + b * x[c_idx(j)];
            terms[el + j] = b;
            terms[em + j] = x[c_idx(j)];
            terms[er + j] = er_jj;
            for i in 0..r {
                if i == j {
                    continue;
                }
                let a_i = x[a_idx(i)];
                if a_i.norm() <= rel_eps() {
                    return Err(CalError::SingularSystem {
                        frequency_index: fi,
                    });
                }
                terms[er + i] = er_jj / a_i;
                terms[em + i] = x[c_idx(i)] / a_i;
                // terms[el + i] already holds the averaged isolation.
            }
        }
        Ok(())
    }
}

/// Dense per-frequency equation stack solved by QR least squares.
struct LinearSystem {
    unknowns: usize,
    coeffs: Vec<Complex>,
    rhs: Vec<Complex>,
}

impl LinearSystem {
    fn new(unknowns: usize) -> Self {
        Self {
            unknowns,
            coeffs: Vec::new(),
            rhs: Vec::new(),
        }
    }

    fn push(&mut self, row: Vec<Complex>, rhs: Complex) {
        debug_assert_eq!(row.len(), self.unknowns);
        self.coeffs.extend(row);
        self.rhs.push(rhs);
    }

    fn solve(&self, frequency_index: usize) -> CalResult<Vec<Complex>> {
        let rows = self.rhs.len();
        if rows == 0 {
            return Err(CalError::RankDeficient {
                frequency_index,
                rank: 0,
                needed: self.unknowns,
            });
        }
        let a = ComplexMatrix::from_data(rows, self.unknowns, self.coeffs.clone());
        let b = ComplexMatrix::from_data(rows, 1, self.rhs.clone());
        let (x, rank, _q) = qrsolve_q(&a, &b);
        if rank < self.unknowns {
            return Err(CalError::RankDeficient {
                frequency_index,
                rank,
                needed: self.unknowns,
            });
        }
        Ok((0..self.unknowns).map(|i| x.get(i, 0)).collect())
    }
}

/// Write solved unknowns back into the flat term vector.
fn scatter(terms: &mut [Complex], sys: &[Option<usize>], x: &[Complex]) {
    for (flat, col) in sys.iter().enumerate() {
        if let Some(col) = col {
            terms[flat] = x[*col];
        }
    }
}

// ---------------------------------------------------------------------------
// Solved calibration
// ---------------------------------------------------------------------------

/// The output of a solve: error terms per frequency plus everything
/// needed to interpret them. Serializable as-is; named per-block
/// access is available through [`term_view`](Self::term_view) and the
/// [`to_blocks`](Self::to_blocks) export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolvedCalibration {
    cal_type: CalType,
    m_rows: usize,
    m_columns: usize,
    frequencies: Vec<f64>,
    z0: ReferenceImpedance,
    layout: ErrorTermLayout,
    /// One flat term vector per frequency, sized `layout.total_terms()`.
    terms: Vec<Vec<Complex>>,
}

impl SolvedCalibration {
    pub fn cal_type(&self) -> CalType {
        self.cal_type
    }

    pub fn m_rows(&self) -> usize {
        self.m_rows
    }

    pub fn m_columns(&self) -> usize {
        self.m_columns
    }

    pub fn ports(&self) -> usize {
        self.m_rows.max(self.m_columns)
    }

    pub fn frequencies(&self) -> &[f64] {
        &self.frequencies
    }

    pub fn z0(&self) -> &ReferenceImpedance {
        &self.z0
    }

    pub fn layout(&self) -> &ErrorTermLayout {
        &self.layout
    }

    /// Flat error terms for one frequency point.
    ///
    /// # Panics
    /// Panics if `frequency_index` is out of range.
    pub fn terms(&self, frequency_index: usize) -> &[Complex] {
        &self.terms[frequency_index]
    }

    /// Shaped view of a calibration-wide block at one frequency.
    pub fn term_view(&self, frequency_index: usize, name: BlockName) -> Option<TermView<'_>> {
        let block = self.layout.block(name)?;
        Some(TermView::new(block, &self.terms[frequency_index]))
    }

    /// Shaped view of a per-column block at one frequency.
    pub fn column_term_view(
        &self,
        frequency_index: usize,
        name: BlockName,
        column: usize,
    ) -> Option<TermView<'_>> {
        let block = self.layout.column_block(name, column)?;
        Some(TermView::new(block, &self.terms[frequency_index]))
    }

    /// Forward model: the raw measurement this calibration would
    /// produce for a device with S-matrix `s` (ports-by-ports) at one
    /// frequency point.
    ///
    /// # Panics
    /// Panics if `frequency_index` is out of range.
    pub fn model(&self, frequency_index: usize, s: &ComplexMatrix) -> CalResult<ComplexMatrix> {
        model_measurement(
            &self.layout,
            &self.terms[frequency_index],
            s,
            frequency_index,
        )
    }

    /// Correct one already-ratioed measurement at one frequency point:
    /// the algebraic shortcut for a DUT with exactly the calibration's
    /// ports and an identity port map. Requires a square calibration,
    /// like [`CalibrationApplicator`](crate::applicator::CalibrationApplicator).
    ///
    /// # Panics
    /// Panics if `frequency_index` is out of range.
    pub fn apply_m(&self, frequency_index: usize, m: &ComplexMatrix) -> CalResult<ComplexMatrix> {
        let n = self.ports();
        if self.m_rows != self.m_columns {
            return Err(CalError::InvalidDimensions {
                cal_type: self.cal_type.name(),
                requirement: format!(
                    "a square calibration to correct measurements, got {}x{}",
                    self.m_rows, self.m_columns
                ),
            });
        }
        if m.rows() != n || m.cols() != n {
            return Err(CalError::DimensionMismatch {
                expected: format!("{}x{} measurement", n, n),
                actual: format!("{}x{}", m.rows(), m.cols()),
            });
        }
        crate::applicator::correct_one(self, frequency_index, m)
    }

    /// Export every block under its canonical name, entries per
    /// frequency in the block's storage order.
    pub fn to_blocks(&self) -> Vec<NamedBlock> {
        self.layout
            .blocks()
            .iter()
            .map(|block| NamedBlock {
                name: block.name.as_str().to_string(),
                column: block.column,
                values: self
                    .terms
                    .iter()
                    .map(|t| t[block.offset..block.offset + block.len].to_vec())
                    .collect(),
            })
            .collect()
    }

    /// Rebuild a calibration from named blocks (the inverse of
    /// [`to_blocks`](Self::to_blocks)). Every block the layout names
    /// must be present with matching sizes.
    pub fn from_blocks(
        cal_type: CalType,
        m_rows: usize,
        m_columns: usize,
        frequencies: Vec<f64>,
        z0: ReferenceImpedance,
        blocks: &[NamedBlock],
    ) -> CalResult<SolvedCalibration> {
        let layout = ErrorTermLayout::new(cal_type, m_rows, m_columns)?;
        z0.validate(m_rows.max(m_columns), frequencies.len())?;
        let nf = frequencies.len();
        let mut terms = vec![vec![Complex::new(0.0, 0.0); layout.total_terms()]; nf];
        for block in layout.blocks() {
            let named = blocks
                .iter()
                .find(|n| n.name == block.name.as_str() && n.column == block.column)
                .ok_or_else(|| CalError::DimensionMismatch {
                    expected: format!("block {:?}", block.name.as_str()),
                    actual: "missing".into(),
                })?;
            if named.values.len() != nf {
                return Err(CalError::FrequencyMismatch {
                    expected: nf,
                    actual: named.values.len(),
                });
            }
            for (fi, values) in named.values.iter().enumerate() {
                if values.len() != block.len {
                    return Err(CalError::DimensionMismatch {
                        expected: format!("{} entries in block {:?}", block.len, named.name),
                        actual: format!("{}", values.len()),
                    });
                }
                terms[fi][block.offset..block.offset + block.len].copy_from_slice(values);
            }
        }
        Ok(SolvedCalibration {
            cal_type,
            m_rows,
            m_columns,
            frequencies,
            z0,
            layout,
            terms,
        })
    }
}

/// One named error-term block in export form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedBlock {
    pub name: String,
    pub column: Option<usize>,
    /// Per-frequency stored entries in the block's storage order.
    pub values: Vec<Vec<Complex>>,
}

// ===========================================================================
// Tests
// ===========================================================================
