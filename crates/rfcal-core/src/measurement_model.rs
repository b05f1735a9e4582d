//! Forward measurement models and synthetic test instrumentation.
//!
//! The solver inverts a physical model: given a standard's true
//! S-matrix and a set of error terms, what does the VNA read? This
//! module implements that forward direction for every topology, plus
//! the deterministic noise source and random-but-well-conditioned
//! error-term generator used to exercise the solve/apply pipeline in
//! tests and benchmarks.
//!
//! Model equations (S is the ports-by-ports standard matrix, M the
//! raw detector-rows-by-driven-columns measurement):
//!
//! - T family:  `M = (Ts·S + Ti)·(Tx·S + Tm)^-1 + El`
//! - U family:  `Um·M + Ui = S·(Ux·M + Us)`, then `+ El`
//! - UE14, column j: `(Dum − S·Dux)·m_j = us·S·e_j − ui·e_j`, `+ El`
//! - E12, column j:  `x = (I − S·Dem)^-1·S·e_j`, `m_j = el_j + er_j ⊙ x`
//!
//! One-port layouts always use the E12 form, which collapses to the
//! scalar bilinear map `m = el + er·s / (1 − em·s)`.

use num_complex::Complex64;

use crate::complex_matrix::{mldivide, mrdivide, rel_eps, ComplexMatrix};
use crate::error_terms::{BlockName, CalType, ErrorTermLayout, TermView};
use crate::types::{CalError, CalResult, Complex};

// ---------------------------------------------------------------------------
// Forward models
// ---------------------------------------------------------------------------

/// Simulate the raw measurement of a standard with S-matrix `s`
/// (ports-by-ports) under the error terms `terms` (one flat
/// per-frequency vector matching `layout`).
///
/// `frequency_index` only labels a [`CalError::SingularSystem`] if the
/// model itself is degenerate at this point.
pub fn model_measurement(
    layout: &ErrorTermLayout,
    terms: &[Complex],
    s: &ComplexMatrix,
    frequency_index: usize,
) -> CalResult<ComplexMatrix> {
    let r = layout.m_rows();
    let c = layout.m_columns();
    let ports = layout.ports();
    if s.rows() != ports || s.cols() != ports {
        return Err(CalError::DimensionMismatch {
            expected: format!("{}x{} standard matrix", ports, ports),
            actual: format!("{}x{}", s.rows(), s.cols()),
        });
    }
    if terms.len() != layout.total_terms() {
        return Err(CalError::DimensionMismatch {
            expected: format!("{} error terms", layout.total_terms()),
            actual: format!("{}", terms.len()),
        });
    }

    if layout.is_one_port() || layout.cal_type() == CalType::E12 {
        return model_e12(layout, terms, s, frequency_index);
    }
    match layout.cal_type() {
        CalType::T8 | CalType::Te10 | CalType::T16 => {
            let ts = view(layout, BlockName::Ts, terms).to_matrix();
            let ti = view(layout, BlockName::Ti, terms).to_matrix();
            let tx = view(layout, BlockName::Tx, terms).to_matrix();
            let tm = view(layout, BlockName::Tm, terms).to_matrix();
            let num = ts.multiply(s).add(&ti);
            let den = tx.multiply(s).add(&tm);
            let (mut m, det) = mrdivide(&num, &den);
            if det.norm() <= rel_eps() {
                return Err(CalError::SingularSystem { frequency_index });
            }
            if layout.cal_type() == CalType::Te10 {
                let el = view(layout, BlockName::El, terms).to_matrix();
                m = m.add(&el);
            }
            Ok(m)
        }
        CalType::U8 | CalType::Ue10 | CalType::U16 => {
            let um = view(layout, BlockName::Um, terms).to_matrix();
            let ui = view(layout, BlockName::Ui, terms).to_matrix();
            let ux = view(layout, BlockName::Ux, terms).to_matrix();
            let us = view(layout, BlockName::Us, terms).to_matrix();
            let lhs = um.subtract(&s.multiply(&ux));
            let rhs = s.multiply(&us).subtract(&ui);
            let (mut m, det) = mldivide(&lhs, &rhs);
            if det.norm() <= rel_eps() {
                return Err(CalError::SingularSystem { frequency_index });
            }
            if layout.cal_type() == CalType::Ue10 {
                let el = view(layout, BlockName::El, terms).to_matrix();
                m = m.add(&el);
            }
            Ok(m)
        }
        CalType::Ue14 => {
            let mut m = ComplexMatrix::new(r, c);
            for j in 0..c {
                let um = column_view(layout, BlockName::Um, j, terms).to_matrix();
                let ux = column_view(layout, BlockName::Ux, j, terms).to_matrix();
                let ui = column_view(layout, BlockName::Ui, j, terms).get(0, 0);
                let us = column_view(layout, BlockName::Us, j, terms).get(0, 0);
                let lhs = um.subtract(&s.multiply(&ux));
                let mut rhs = ComplexMatrix::new(r, 1);
                for i in 0..r {
                    let mut v = us * s.get(i, j);
                    if i == j {
                        v -= ui;
                    }
                    rhs.set(i, 0, v);
                }
                let (col, det) = mldivide(&lhs, &rhs);
                if det.norm() <= rel_eps() {
                    return Err(CalError::SingularSystem { frequency_index });
                }
                for i in 0..r {
                    m.set(i, j, col.get(i, 0));
                }
            }
            let el = view(layout, BlockName::El, terms).to_matrix();
            Ok(m.add(&el))
        }
        CalType::E12 => unreachable!("handled above"),
    }
}

fn model_e12(
    layout: &ErrorTermLayout,
    terms: &[Complex],
    s: &ComplexMatrix,
    frequency_index: usize,
) -> CalResult<ComplexMatrix> {
    let r = layout.m_rows().max(1);
    let c = layout.m_columns();
    let mut m = ComplexMatrix::new(layout.m_rows(), c);
    for j in 0..c {
        let el = column_view(layout, BlockName::El, j, terms);
        let er = column_view(layout, BlockName::Er, j, terms);
        let em = column_view(layout, BlockName::Em, j, terms);
        // lhs = I - S·diag(em_j)
        let mut lhs = ComplexMatrix::identity(r);
        for i in 0..r {
            for k in 0..r {
                let v = lhs.get(i, k) - s.get(i, k) * em.get(k, 0);
                lhs.set(i, k, v);
            }
        }
        let mut rhs = ComplexMatrix::new(r, 1);
        for i in 0..r {
            rhs.set(i, 0, s.get(i, j));
        }
        let (x, det) = mldivide(&lhs, &rhs);
        if det.norm() <= rel_eps() {
            return Err(CalError::SingularSystem { frequency_index });
        }
        for i in 0..layout.m_rows() {
            m.set(i, j, el.get(i, 0) + er.get(i, 0) * x.get(i, 0));
        }
    }
    Ok(m)
}

fn view<'a>(layout: &ErrorTermLayout, name: BlockName, terms: &'a [Complex]) -> TermView<'a> {
    TermView::new(
        layout.block(name).expect("layout block present"),
        terms,
    )
}

fn column_view<'a>(
    layout: &ErrorTermLayout,
    name: BlockName,
    column: usize,
    terms: &'a [Complex],
) -> TermView<'a> {
    TermView::new(
        layout
            .column_block(name, column)
            .expect("layout column block present"),
        terms,
    )
}

// ---------------------------------------------------------------------------
// Deterministic noise source
// ---------------------------------------------------------------------------

/// Seedable pseudo-random source (xoshiro256** with SplitMix64
/// seeding) for simulated measurements. Deterministic for a given
/// seed, so every test and benchmark is reproducible.
#[derive(Debug, Clone)]
pub struct NoiseSource {
    state: [u64; 4],
    spare: Option<f64>,
}

impl NoiseSource {
    pub fn new(seed: u64) -> Self {
        let mut s = seed;
        let mut next = || {
            s = s.wrapping_add(0x9e3779b97f4a7c15);
            let mut z = s;
            z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
            z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
            z ^ (z >> 31)
        };
        Self {
            state: [next(), next(), next(), next()],
            spare: None,
        }
    }

    fn next_u64(&mut self) -> u64 {
        let s = &mut self.state;
        let result = s[1].wrapping_mul(5).rotate_left(7).wrapping_mul(9);
        let t = s[1] << 17;
        s[2] ^= s[0];
        s[3] ^= s[1];
        s[1] ^= s[2];
        s[0] ^= s[3];
        s[2] ^= t;
        s[3] = s[3].rotate_left(45);
        result
    }

    /// Uniform sample in [0, 1).
    pub fn uniform(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Standard normal sample (Box–Muller, pair-cached).
    pub fn gaussian(&mut self) -> f64 {
        if let Some(v) = self.spare.take() {
            return v;
        }
        let u1 = 1.0 - self.uniform(); // (0, 1]
        let u2 = self.uniform();
        let radius = (-2.0 * u1.ln()).sqrt();
        let angle = 2.0 * std::f64::consts::PI * u2;
        self.spare = Some(radius * angle.sin());
        radius * angle.cos()
    }

    /// Complex value with independent uniform real/imag parts in
    /// [-scale, scale].
    pub fn complex_uniform(&mut self, scale: f64) -> Complex64 {
        Complex64::new(
            (self.uniform() * 2.0 - 1.0) * scale,
            (self.uniform() * 2.0 - 1.0) * scale,
        )
    }

    /// Circularly-symmetric complex gaussian with total variance
    /// `sigma^2`.
    pub fn complex_gaussian(&mut self, sigma: f64) -> Complex64 {
        let s = sigma / std::f64::consts::SQRT_2;
        Complex64::new(self.gaussian() * s, self.gaussian() * s)
    }

    /// Matrix of [`complex_uniform`](Self::complex_uniform) entries.
    pub fn matrix(&mut self, rows: usize, cols: usize, scale: f64) -> ComplexMatrix {
        let data = (0..rows * cols)
            .map(|_| self.complex_uniform(scale))
            .collect();
        ComplexMatrix::from_data(rows, cols, data)
    }
}

// ---------------------------------------------------------------------------
// Synthetic error terms and wave measurements
// ---------------------------------------------------------------------------

/// Generate a layout plus per-frequency error-term vectors that are
/// random but physically plausible: tracking-like terms near unity,
/// directivity / match / leakage terms small. The conditioning keeps
/// every model denominator comfortably away from singular so solve and
/// apply round-trips are numerically clean.
pub fn random_error_terms(
    cal_type: CalType,
    m_rows: usize,
    m_columns: usize,
    frequencies: usize,
    seed: u64,
) -> CalResult<(ErrorTermLayout, Vec<Vec<Complex>>)> {
    let layout = ErrorTermLayout::new(cal_type, m_rows, m_columns)?;
    let mut noise = NoiseSource::new(seed);
    let mut per_frequency = Vec::with_capacity(frequencies);
    for _ in 0..frequencies {
        let mut terms = vec![Complex::new(0.0, 0.0); layout.total_terms()];
        for block in layout.blocks() {
            let unity_like = matches!(
                block.name,
                BlockName::Ts | BlockName::Tm | BlockName::Um | BlockName::Us | BlockName::Er
            );
            for k in 0..block.len {
                let cell = &mut terms[block.offset + k];
                *cell = if unity_like && on_main_diagonal(block, k) {
                    Complex::new(1.0, 0.0) + noise.complex_uniform(0.15)
                } else {
                    noise.complex_uniform(0.05)
                };
            }
        }
        per_frequency.push(terms);
    }
    Ok((layout, per_frequency))
}

/// True if flat entry `k` of `block` sits on the block's main
/// diagonal. Vector-shaped per-column blocks (rows-by-1) count every
/// entry as diagonal: they hold per-row tracking terms.
fn on_main_diagonal(block: &crate::error_terms::TermBlock, k: usize) -> bool {
    use crate::error_terms::BlockShape;
    match block.shape {
        BlockShape::Diagonal => true,
        BlockShape::OffDiagonal => false,
        BlockShape::Full => {
            if block.cols == 1 {
                true
            } else {
                k / block.cols == k % block.cols
            }
        }
    }
}

/// Split a raw measurement `m` into an incident/reflected wave pair
/// `(a, b)` with `m = b·a^-1`: `a` is the identity plus a small random
/// perturbation, `b = m·a`.
pub fn measure_waves(
    m: &ComplexMatrix,
    perturbation: f64,
    noise: &mut NoiseSource,
) -> (ComplexMatrix, ComplexMatrix) {
    let c = m.cols();
    let a = ComplexMatrix::identity(c).add(&noise.matrix(c, c, perturbation));
    let b = m.multiply(&a);
    (a, b)
}

// ===========================================================================
// Tests
// ===========================================================================
