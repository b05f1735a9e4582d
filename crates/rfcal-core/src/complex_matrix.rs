//! Dense complex matrix kernel: QR decomposition, right/left division,
//! and a rank-revealing solver.
//!
//! Provides the row-major [`ComplexMatrix`] type and the numeric
//! primitives the calibration engine is built on: Householder QR
//! ([`QrDecomposition`]), right division `X·A = B` ([`mrdivide`]), left
//! division `A·X = B` ([`mldivide`]), and the general solver
//! [`qrsolve_q`] covering square, over-determined (least squares) and
//! under-determined systems while exposing the `Q` factor and the
//! numerical rank.
//!
//! Zero comparisons are always relative — scaled by
//! [`rel_eps`]`()` times the largest pivot — never absolute, because
//! magnitudes vary with calibration scale.
//!
//! ## Example
//!
//! ```rust
//! use rfcal_core::complex_matrix::{ComplexMatrix, QrDecomposition};
//! use num_complex::Complex64;
//!
//! let a = ComplexMatrix::from_data(2, 2, vec![
//!     Complex64::new(1.0, 1.0), Complex64::new(2.0, 0.0),
//!     Complex64::new(0.0, -1.0), Complex64::new(3.0, 0.5),
//! ]);
//! let qr = QrDecomposition::new(a.clone());
//! let rebuilt = qr.reconstruct_q().multiply(&qr.reconstruct_r());
//! for i in 0..2 {
//!     for j in 0..2 {
//!         assert!((rebuilt.get(i, j) - a.get(i, j)).norm() < 1e-12);
//!     }
//! }
//! ```

use num_complex::Complex64;

/// Relative epsilon for singularity / rank decisions:
/// `sqrt(f64::EPSILON)`, roughly 1.49e-8.
#[inline]
pub fn rel_eps() -> f64 {
    f64::EPSILON.sqrt()
}

/// Row-major dense matrix of `Complex64` values.
#[derive(Debug, Clone, PartialEq)]
pub struct ComplexMatrix {
    rows: usize,
    cols: usize,
    data: Vec<Complex64>,
}

// ---------------------------------------------------------------------------
// ComplexMatrix implementation
// ---------------------------------------------------------------------------

impl ComplexMatrix {
    /// Create a zero-initialized matrix.
    ///
    /// # Panics
    /// Panics if `rows` or `cols` is zero.
    pub fn new(rows: usize, cols: usize) -> Self {
        assert!(rows >= 1 && cols >= 1, "matrix dimensions must be >= 1");
        Self {
            rows,
            cols,
            data: vec![Complex64::new(0.0, 0.0); rows * cols],
        }
    }

    /// Create a matrix from existing data (row-major order).
    ///
    /// # Panics
    /// Panics if `data.len() != rows * cols` or either dimension is zero.
    pub fn from_data(rows: usize, cols: usize, data: Vec<Complex64>) -> Self {
        assert!(rows >= 1 && cols >= 1, "matrix dimensions must be >= 1");
        assert_eq!(
            data.len(),
            rows * cols,
            "data length {} != rows*cols {}",
            data.len(),
            rows * cols
        );
        Self { rows, cols, data }
    }

    /// Create an *n*-by-*n* identity matrix.
    pub fn identity(n: usize) -> Self {
        let mut m = Self::new(n, n);
        for i in 0..n {
            m.set(i, i, Complex64::new(1.0, 0.0));
        }
        m
    }

    /// Get element at (r, c).
    #[inline]
    pub fn get(&self, r: usize, c: usize) -> Complex64 {
        self.data[r * self.cols + c]
    }

    /// Set element at (r, c).
    #[inline]
    pub fn set(&mut self, r: usize, c: usize, val: Complex64) {
        self.data[r * self.cols + c] = val;
    }

    /// Number of rows.
    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns.
    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Borrow the backing row-major slice.
    #[inline]
    pub fn data(&self) -> &[Complex64] {
        &self.data
    }

    /// Return the conjugate (Hermitian) transpose.
    pub fn conjugate_transpose(&self) -> Self {
        let mut t = Self::new(self.cols, self.rows);
        for r in 0..self.rows {
            for c in 0..self.cols {
                t.set(c, r, self.get(r, c).conj());
            }
        }
        t
    }

    /// Matrix multiplication `self * other`.
    ///
    /// # Panics
    /// Panics if `self.cols != other.rows`.
    pub fn multiply(&self, other: &ComplexMatrix) -> ComplexMatrix {
        assert_eq!(
            self.cols, other.rows,
            "incompatible dimensions: {}x{} * {}x{}",
            self.rows, self.cols, other.rows, other.cols
        );
        let mut out = ComplexMatrix::new(self.rows, other.cols);
        for i in 0..self.rows {
            for j in 0..other.cols {
                let mut s = Complex64::new(0.0, 0.0);
                for k in 0..self.cols {
                    s += self.get(i, k) * other.get(k, j);
                }
                out.set(i, j, s);
            }
        }
        out
    }

    /// Element-wise sum `self + other`.
    ///
    /// # Panics
    /// Panics on dimension mismatch.
    pub fn add(&self, other: &ComplexMatrix) -> ComplexMatrix {
        assert_eq!((self.rows, self.cols), (other.rows, other.cols));
        let data = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| a + b)
            .collect();
        ComplexMatrix::from_data(self.rows, self.cols, data)
    }

    /// Element-wise difference `self - other`.
    ///
    /// # Panics
    /// Panics on dimension mismatch.
    pub fn subtract(&self, other: &ComplexMatrix) -> ComplexMatrix {
        assert_eq!((self.rows, self.cols), (other.rows, other.cols));
        let data = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| a - b)
            .collect();
        ComplexMatrix::from_data(self.rows, self.cols, data)
    }

    /// Frobenius norm: `sqrt( sum_ij |a_ij|^2 )`.
    pub fn frobenius_norm(&self) -> f64 {
        self.data.iter().map(|x| x.norm_sqr()).sum::<f64>().sqrt()
    }
}

// ---------------------------------------------------------------------------
// Householder QR
// ---------------------------------------------------------------------------

/// Implicit QR factorization of an `m`-by-`n` matrix.
///
/// The factorization is stored packed, reusing the input buffer: the
/// scaled Householder vectors live below the diagonal (their leading
/// element is implicitly 1), R occupies the upper triangle, and the
/// signed complex diagonal pivots of R are kept in `diag`. Callers
/// never need to know the packed encoding: [`reconstruct_q`] and
/// [`reconstruct_r`] materialize the factors.
///
/// Invariant: `reconstruct_q() * reconstruct_r()` reproduces the
/// original matrix to working precision, and Q is unitary.
///
/// [`reconstruct_q`]: QrDecomposition::reconstruct_q
/// [`reconstruct_r`]: QrDecomposition::reconstruct_r
#[derive(Debug, Clone)]
pub struct QrDecomposition {
    packed: ComplexMatrix,
    diag: Vec<Complex64>,
}

impl QrDecomposition {
    /// Factor `a` by Householder reflections, consuming it as the
    /// packed working buffer.
    pub fn new(a: ComplexMatrix) -> Self {
        let m = a.rows();
        let n = a.cols();
        let p = m.min(n);
        let mut packed = a;
        let mut diag = vec![Complex64::new(0.0, 0.0); p];

        for k in 0..p {
            // Norm of column k from the diagonal down.
            let mut norm_sq = 0.0;
            for i in k..m {
                norm_sq += packed.get(i, k).norm_sqr();
            }
            let norm = norm_sq.sqrt();
            if norm == 0.0 {
                // Column already zero: reflection is the identity,
                // flagged by a zero pivot with no stored vector.
                continue;
            }

            let x0 = packed.get(k, k);
            // Sign chosen so x0 - beta never cancels.
            let phase = if x0.norm() == 0.0 {
                Complex64::new(1.0, 0.0)
            } else {
                x0 / x0.norm()
            };
            let beta = -phase * norm;
            let v0 = x0 - beta;
            diag[k] = beta;

            // Store the scaled Householder vector (leading 1 implicit)
            // in the now-zeroed subdiagonal; the diagonal slot holds
            // the R pivot.
            for i in (k + 1)..m {
                let w = packed.get(i, k) / v0;
                packed.set(i, k, w);
            }
            packed.set(k, k, beta);

            // tau = 2 / (w^H w) with w0 = 1.
            let mut wnorm = 1.0;
            for i in (k + 1)..m {
                wnorm += packed.get(i, k).norm_sqr();
            }
            let tau = 2.0 / wnorm;

            // Apply the reflection to the remaining columns.
            for j in (k + 1)..n {
                let mut acc = packed.get(k, j);
                for i in (k + 1)..m {
                    acc += packed.get(i, k).conj() * packed.get(i, j);
                }
                let c = acc * tau;
                packed.set(k, j, packed.get(k, j) - c);
                for i in (k + 1)..m {
                    let upd = packed.get(i, j) - c * packed.get(i, k);
                    packed.set(i, j, upd);
                }
            }
        }

        Self { packed, diag }
    }

    /// Number of rows of the factored matrix.
    pub fn rows(&self) -> usize {
        self.packed.rows()
    }

    /// Number of columns of the factored matrix.
    pub fn cols(&self) -> usize {
        self.packed.cols()
    }

    /// The signed complex diagonal pivots of R (length `min(m, n)`).
    pub fn diagonal(&self) -> &[Complex64] {
        &self.diag
    }

    /// Product of the diagonal pivots. For a square input this is the
    /// determinant up to a unimodular factor; its magnitude is the
    /// singularity signal callers compare against [`rel_eps`].
    pub fn pivot_product(&self) -> Complex64 {
        self.diag
            .iter()
            .fold(Complex64::new(1.0, 0.0), |acc, d| acc * d)
    }

    /// Numerical rank: the count of pivots whose magnitude exceeds
    /// `rel_eps() *` (largest pivot magnitude).
    pub fn rank(&self) -> usize {
        let max = self
            .diag
            .iter()
            .map(|d| d.norm())
            .fold(0.0_f64, f64::max);
        if max == 0.0 {
            return 0;
        }
        let tol = rel_eps() * max;
        self.diag.iter().filter(|d| d.norm() > tol).count()
    }

    /// Materialize the unitary `m`-by-`m` Q factor by applying the
    /// stored reflections to the identity.
    pub fn reconstruct_q(&self) -> ComplexMatrix {
        let m = self.packed.rows();
        let p = self.diag.len();
        let mut q = ComplexMatrix::identity(m);
        // Q = H_0 · H_1 · ... · H_{p-1}; apply right-to-left.
        for k in (0..p).rev() {
            if self.diag[k].norm() == 0.0 {
                continue;
            }
            self.apply_reflection(k, &mut q);
        }
        q
    }

    /// Materialize the upper-trapezoidal `m`-by-`n` R factor.
    pub fn reconstruct_r(&self) -> ComplexMatrix {
        let m = self.packed.rows();
        let n = self.packed.cols();
        let p = self.diag.len();
        let mut r = ComplexMatrix::new(m, n);
        for i in 0..p {
            r.set(i, i, self.diag[i]);
            for j in (i + 1)..n {
                r.set(i, j, self.packed.get(i, j));
            }
        }
        r
    }

    /// Left-multiply `target` by `Q^H` in place (applies the stored
    /// reflections in forward order; each H is Hermitian).
    fn apply_q_hermitian(&self, target: &mut ComplexMatrix) {
        let p = self.diag.len();
        for k in 0..p {
            if self.diag[k].norm() == 0.0 {
                continue;
            }
            self.apply_reflection(k, target);
        }
    }

    /// Left-multiply `target` by `Q` in place (reflections in reverse
    /// order).
    fn apply_q(&self, target: &mut ComplexMatrix) {
        let p = self.diag.len();
        for k in (0..p).rev() {
            if self.diag[k].norm() == 0.0 {
                continue;
            }
            self.apply_reflection(k, target);
        }
    }

    /// Left-multiply `target` (m-by-o) by reflection k in place.
    fn apply_reflection(&self, k: usize, target: &mut ComplexMatrix) {
        let m = self.packed.rows();
        let o = target.cols();
        debug_assert_eq!(target.rows(), m);

        let mut wnorm = 1.0;
        for i in (k + 1)..m {
            wnorm += self.packed.get(i, k).norm_sqr();
        }
        let tau = 2.0 / wnorm;

        for j in 0..o {
            let mut acc = target.get(k, j);
            for i in (k + 1)..m {
                acc += self.packed.get(i, k).conj() * target.get(i, j);
            }
            let c = acc * tau;
            target.set(k, j, target.get(k, j) - c);
            for i in (k + 1)..m {
                let upd = target.get(i, j) - c * self.packed.get(i, k);
                target.set(i, j, upd);
            }
        }
    }

    /// Back-substitute `R x = y` through the leading upper-triangular
    /// block of R.
    fn back_substitute(&self, y: &ComplexMatrix) -> ComplexMatrix {
        let n = self.packed.cols();
        let p = self.diag.len();
        let o = y.cols();
        let mut x = ComplexMatrix::new(n, o);
        let max = self
            .diag
            .iter()
            .map(|d| d.norm())
            .fold(0.0_f64, f64::max);
        let tol = rel_eps() * max;
        for j in 0..o {
            for k in (0..p).rev() {
                let mut acc = y.get(k, j);
                for l in (k + 1)..n {
                    acc -= self.packed.get(k, l) * x.get(l, j);
                }
                if self.diag[k].norm() <= tol {
                    // Dead pivot: leave the unknown at zero. The rank
                    // report is the caller-visible deficiency signal.
                    continue;
                }
                x.set(k, j, acc / self.diag[k]);
            }
        }
        x
    }
}

// ---------------------------------------------------------------------------
// Division and the general solver
// ---------------------------------------------------------------------------

/// Right division: solve `X · A = B` for X, i.e. `X = B · A^-1`.
///
/// `A` must be `n`-by-`n` and `B` `m`-by-`n`. Internally decomposes
/// `A^H` by QR and back-substitutes. Returns `(X, det)` where `det` is
/// the determinant of `A` up to a unimodular factor; callers must treat
/// `|det|` below their relative epsilon as failure rather than trusting
/// X. An exactly singular `A` yields zeroed unknowns and `det == 0` —
/// reported, never a crash.
///
/// # Panics
/// Panics if `A` is not square or `B.cols() != A.rows()`.
pub fn mrdivide(b: &ComplexMatrix, a: &ComplexMatrix) -> (ComplexMatrix, Complex64) {
    assert_eq!(a.rows(), a.cols(), "mrdivide: A must be square");
    assert_eq!(
        b.cols(),
        a.rows(),
        "mrdivide: B is {}x{}, A is {}x{}",
        b.rows(),
        b.cols(),
        a.rows(),
        a.cols()
    );
    // X A = B  <=>  A^H X^H = B^H.
    let (xh, det_ah) = mldivide(&a.conjugate_transpose(), &b.conjugate_transpose());
    (xh.conjugate_transpose(), det_ah.conj())
}

/// Left division: solve `A · X = B` for X, i.e. `X = A^-1 · B`.
///
/// Same contract as [`mrdivide`]: returns `(X, det)` and signals
/// singularity through `det` rather than crashing.
///
/// # Panics
/// Panics if `A` is not square or `B.rows() != A.rows()`.
pub fn mldivide(a: &ComplexMatrix, b: &ComplexMatrix) -> (ComplexMatrix, Complex64) {
    assert_eq!(a.rows(), a.cols(), "mldivide: A must be square");
    assert_eq!(
        b.rows(),
        a.rows(),
        "mldivide: A is {}x{}, B is {}x{}",
        a.rows(),
        a.cols(),
        b.rows(),
        b.cols()
    );
    let qr = QrDecomposition::new(a.clone());
    let det = qr.pivot_product();
    let mut y = b.clone();
    qr.apply_q_hermitian(&mut y);
    let x = qr.back_substitute(&y);
    (x, det)
}

/// General solver for `A · x ≈ B` with `A` `m`-by-`n`, `B` `m`-by-`o`.
///
/// Covers the square (exact), over-determined (`m > n`, least squares)
/// and under-determined (`m < n`, minimum-norm solution) cases.
/// Returns `(x, rank, q)`:
///
/// - `x` is `n`-by-`o`;
/// - `rank` counts the diagonal pivots above the relative threshold —
///   anything below `min(m, n)` means the system is rank-deficient and
///   the caller must treat the result as unusable;
/// - `q` is the full `m`-by-`m` unitary factor of A, exposed for
///   callers that need to project residuals.
///
/// # Panics
/// Panics if `B.rows() != A.rows()`.
pub fn qrsolve_q(a: &ComplexMatrix, b: &ComplexMatrix) -> (ComplexMatrix, usize, ComplexMatrix) {
    assert_eq!(
        b.rows(),
        a.rows(),
        "qrsolve_q: A is {}x{}, B is {}x{}",
        a.rows(),
        a.cols(),
        b.rows(),
        b.cols()
    );
    let qr = QrDecomposition::new(a.clone());
    let rank = qr.rank();
    let q = qr.reconstruct_q();
    let x = if a.rows() < a.cols() {
        minimum_norm_solution(a, b)
    } else {
        let mut y = b.clone();
        qr.apply_q_hermitian(&mut y);
        qr.back_substitute(&y)
    };
    (x, rank, q)
}

/// Minimum-norm solution of a wide system through the QR of `A^H`:
/// with `A^H = Q R`, `A x = B` becomes `R^H (Q^H x) = B`. Forward
/// substitution through the lower-triangular `R^H` fills the leading
/// `m` coefficients of `y = Q^H x`, the trailing ones stay zero, and
/// `x = Q y` then has no component in the null space of A — the
/// smallest-norm vector among all exact solutions.
fn minimum_norm_solution(a: &ComplexMatrix, b: &ComplexMatrix) -> ComplexMatrix {
    let m = a.rows();
    let n = a.cols();
    let o = b.cols();
    let qr = QrDecomposition::new(a.conjugate_transpose());
    let max = qr
        .diag
        .iter()
        .map(|d| d.norm())
        .fold(0.0_f64, f64::max);
    let tol = rel_eps() * max;
    let mut y = ComplexMatrix::new(n, o);
    for j in 0..o {
        for k in 0..m {
            let mut acc = b.get(k, j);
            for l in 0..k {
                acc -= qr.packed.get(l, k).conj() * y.get(l, j);
            }
            if qr.diag[k].norm() <= tol {
                // Dead pivot: leave the unknown at zero; the caller
                // sees the deficiency through the rank report.
                continue;
            }
            y.set(k, j, acc / qr.diag[k].conj());
        }
    }
    qr.apply_q(&mut y);
    y
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-10;

    /// Deterministic pseudo-random complex values for test matrices
    /// (xoshiro256**, same generator as the measurement simulator).
    struct TestRng {
        state: [u64; 4],
    }

    impl TestRng {
        fn new(seed: u64) -> Self {
            // SplitMix64 expansion of the seed.
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
            }
        }

        fn next_f64(&mut self) -> f64 {
            let s = &mut self.state;
            let result = s[1].wrapping_mul(5).rotate_left(7).wrapping_mul(9);
            let t = s[1] << 17;
            s[2] ^= s[0];
            s[3] ^= s[1];
            s[1] ^= s[2];
            s[0] ^= s[3];
            s[2] ^= t;
            s[3] = s[3].rotate_left(45);
            (result >> 11) as f64 / (1u64 << 53) as f64
        }

        fn next_complex(&mut self) -> Complex64 {
            Complex64::new(self.next_f64() * 2.0 - 1.0, self.next_f64() * 2.0 - 1.0)
        }

        fn matrix(&mut self, rows: usize, cols: usize) -> ComplexMatrix {
            let data = (0..rows * cols).map(|_| self.next_complex()).collect();
            ComplexMatrix::from_data(rows, cols, data)
        }
    }

    fn assert_matrix_near(a: &ComplexMatrix, b: &ComplexMatrix, tol: f64, what: &str) {
        assert_eq!((a.rows(), a.cols()), (b.rows(), b.cols()), "{}", what);
        for i in 0..a.rows() {
            for j in 0..a.cols() {
                let diff = (a.get(i, j) - b.get(i, j)).norm();
                assert!(
                    diff < tol,
                    "{}: ({}, {}) differs by {} ({} vs {})",
                    what,
                    i,
                    j,
                    diff,
                    a.get(i, j),
                    b.get(i, j)
                );
            }
        }
    }

    #[test]
    fn test_construction_and_get_set() {
        let mut m = ComplexMatrix::new(2, 3);
        assert_eq!(m.rows(), 2);
        assert_eq!(m.cols(), 3);
        assert_eq!(m.get(1, 2), Complex64::new(0.0, 0.0));

        m.set(0, 1, Complex64::new(5.0, -1.0));
        assert_eq!(m.get(0, 1), Complex64::new(5.0, -1.0));

        let id = ComplexMatrix::identity(3);
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_eq!(id.get(i, j), Complex64::new(expected, 0.0));
            }
        }
    }

    #[test]
    #[should_panic]
    fn test_zero_dimension_rejected() {
        let _ = ComplexMatrix::new(0, 3);
    }

    #[test]
    fn test_conjugate_transpose_and_multiply() {
        let a = ComplexMatrix::from_data(
            1,
            2,
            vec![Complex64::new(1.0, 2.0), Complex64::new(3.0, -4.0)],
        );
        let ah = a.conjugate_transpose();
        assert_eq!(ah.rows(), 2);
        assert_eq!(ah.get(0, 0), Complex64::new(1.0, -2.0));
        assert_eq!(ah.get(1, 0), Complex64::new(3.0, 4.0));

        // (1x2) * (2x1) = a a^H = |a|^2.
        let prod = a.multiply(&ah);
        let expected = 1.0 + 4.0 + 9.0 + 16.0;
        assert!((prod.get(0, 0) - Complex64::new(expected, 0.0)).norm() < EPS);
    }

    #[test]
    fn test_qr_round_trip_random_sizes() {
        let mut rng = TestRng::new(0x5eed);
        for m in 1..=5 {
            for n in 1..=5 {
                let a = rng.matrix(m, n);
                let qr = QrDecomposition::new(a.clone());
                let q = qr.reconstruct_q();
                let r = qr.reconstruct_r();

                let rebuilt = q.multiply(&r);
                assert_matrix_near(&rebuilt, &a, 1e-12 * (1.0 + a.frobenius_norm()), "Q*R");

                // Q must be unitary: Q Q^H = I.
                let qqh = q.multiply(&q.conjugate_transpose());
                assert_matrix_near(&qqh, &ComplexMatrix::identity(m), 1e-12, "Q*Q^H");
            }
        }
    }

    #[test]
    fn test_qr_zero_column() {
        // A column that is zero below and on the diagonal must not
        // break the factorization.
        let a = ComplexMatrix::from_data(
            3,
            2,
            vec![
                Complex64::new(0.0, 0.0),
                Complex64::new(1.0, 0.0),
                Complex64::new(0.0, 0.0),
                Complex64::new(2.0, 0.0),
                Complex64::new(0.0, 0.0),
                Complex64::new(-1.0, 0.0),
            ],
        );
        let qr = QrDecomposition::new(a.clone());
        let rebuilt = qr.reconstruct_q().multiply(&qr.reconstruct_r());
        assert_matrix_near(&rebuilt, &a, EPS, "Q*R with zero column");
        assert!(qr.rank() < 2);
    }

    #[test]
    fn test_qr_degenerate_single_row_and_column() {
        let mut rng = TestRng::new(17);
        let a_row = rng.matrix(1, 4);
        let qr = QrDecomposition::new(a_row.clone());
        assert_matrix_near(
            &qr.reconstruct_q().multiply(&qr.reconstruct_r()),
            &a_row,
            EPS,
            "1xn",
        );

        let a_col = rng.matrix(4, 1);
        let qr = QrDecomposition::new(a_col.clone());
        assert_matrix_near(
            &qr.reconstruct_q().multiply(&qr.reconstruct_r()),
            &a_col,
            EPS,
            "mx1",
        );
    }

    #[test]
    fn test_mrdivide_recovers_factor() {
        let mut rng = TestRng::new(99);
        for n in 1..=5 {
            for m in 1..=4 {
                let a = rng.matrix(n, n);
                let t = rng.matrix(m, n);
                let b = t.multiply(&a);
                let (x, det) = mrdivide(&b, &a);
                // Random matrices are full rank with probability 1.
                assert!(det.norm() > rel_eps(), "unexpected singular test matrix");
                assert_matrix_near(&x, &t, 1e-9, "mrdivide");
            }
        }
    }

    #[test]
    fn test_mldivide_recovers_factor() {
        let mut rng = TestRng::new(7);
        let a = rng.matrix(4, 4);
        let t = rng.matrix(4, 3);
        let b = a.multiply(&t);
        let (x, det) = mldivide(&a, &b);
        assert!(det.norm() > rel_eps());
        assert_matrix_near(&x, &t, 1e-9, "mldivide");
    }

    #[test]
    fn test_division_determinant_magnitude() {
        // det magnitude must match the true determinant magnitude.
        let a = ComplexMatrix::from_data(
            2,
            2,
            vec![
                Complex64::new(2.0, 0.0),
                Complex64::new(0.0, 1.0),
                Complex64::new(0.0, -1.0),
                Complex64::new(3.0, 0.0),
            ],
        );
        // det = 2*3 - (i)(-i) = 6 - 1 = 5.
        let b = ComplexMatrix::identity(2);
        let (_, det) = mldivide(&a, &b);
        assert!((det.norm() - 5.0).abs() < 1e-9, "|det| = {}", det.norm());
    }

    #[test]
    fn test_singular_matrix_signals_via_det() {
        let a = ComplexMatrix::from_data(
            2,
            2,
            vec![
                Complex64::new(1.0, 0.0),
                Complex64::new(2.0, 0.0),
                Complex64::new(2.0, 0.0),
                Complex64::new(4.0, 0.0),
            ],
        );
        let b = ComplexMatrix::identity(2);
        let (x, det) = mldivide(&a, &b);
        assert!(det.norm() < 1e-12, "singular A must yield ~zero det");
        // The result is unusable but must be finite, not NaN.
        for i in 0..2 {
            for j in 0..2 {
                assert!(x.get(i, j).re.is_finite() && x.get(i, j).im.is_finite());
            }
        }
    }

    #[test]
    fn test_qrsolve_q_exact_square() {
        let mut rng = TestRng::new(1234);
        for n in 1..=5 {
            let a = rng.matrix(n, n);
            let b = rng.matrix(n, 2);
            let (x, rank, q) = qrsolve_q(&a, &b);
            assert_eq!(rank, n);
            assert_matrix_near(&a.multiply(&x), &b, 1e-9, "A*x = B");
            assert_matrix_near(
                &q.multiply(&q.conjugate_transpose()),
                &ComplexMatrix::identity(n),
                1e-12,
                "Q unitary",
            );
        }
    }

    #[test]
    fn test_qrsolve_q_underdetermined_minimum_norm() {
        // x + y = 2 has many solutions; the minimum-norm one is
        // (1, 1), not (2, 0).
        let a = ComplexMatrix::from_data(
            1,
            2,
            vec![Complex64::new(1.0, 0.0), Complex64::new(1.0, 0.0)],
        );
        let b = ComplexMatrix::from_data(1, 1, vec![Complex64::new(2.0, 0.0)]);
        let (x, rank, _) = qrsolve_q(&a, &b);
        assert_eq!(rank, 1);
        assert!((x.get(0, 0) - Complex64::new(1.0, 0.0)).norm() < EPS);
        assert!((x.get(1, 0) - Complex64::new(1.0, 0.0)).norm() < EPS);

        let mut rng = TestRng::new(4321);
        // m < n: A x = B must hold exactly for full-rank A, and x must
        // match A^H (A A^H)^-1 B, the unique minimum-norm solution.
        for (m, n) in [(1, 3), (2, 4), (3, 5)] {
            let a = rng.matrix(m, n);
            let b = rng.matrix(m, 2);
            let (x, rank, _) = qrsolve_q(&a, &b);
            assert_eq!(rank, m);
            assert_matrix_near(&a.multiply(&x), &b, 1e-9, "underdetermined A*x = B");

            let gram = a.multiply(&a.conjugate_transpose());
            let (w, det) = mldivide(&gram, &b);
            assert!(det.norm() > rel_eps(), "unexpected singular test matrix");
            let expected = a.conjugate_transpose().multiply(&w);
            assert_matrix_near(&x, &expected, 1e-9, "minimum-norm solution");
        }
    }

    #[test]
    fn test_qrsolve_q_least_squares() {
        let mut rng = TestRng::new(55);
        // m > n: the residual of the LS solution must be orthogonal to
        // the column space, i.e. A^H (A x - B) = 0.
        let a = rng.matrix(5, 3);
        let b = rng.matrix(5, 1);
        let (x, rank, _) = qrsolve_q(&a, &b);
        assert_eq!(rank, 3);
        let residual = a.multiply(&x).subtract(&b);
        let proj = a.conjugate_transpose().multiply(&residual);
        assert!(proj.frobenius_norm() < 1e-9, "residual not orthogonal");
    }

    #[test]
    fn test_qrsolve_q_reports_rank_deficiency() {
        // Two proportional rows: rank 1 out of 2.
        let a = ComplexMatrix::from_data(
            3,
            2,
            vec![
                Complex64::new(1.0, 0.0),
                Complex64::new(2.0, 0.0),
                Complex64::new(2.0, 0.0),
                Complex64::new(4.0, 0.0),
                Complex64::new(-1.0, 0.0),
                Complex64::new(-2.0, 0.0),
            ],
        );
        let b = ComplexMatrix::new(3, 1);
        let (_, rank, _) = qrsolve_q(&a, &b);
        assert_eq!(rank, 1);
    }
}
