//! Error-term layout model for the eight calibration topologies.
//!
//! A calibration stores, per frequency, one flat vector of complex
//! error terms. How that vector is carved into named blocks — and how
//! large it is — depends only on the calibration type and the VNA's
//! detector-row / driven-column counts. [`ErrorTermLayout`] computes
//! the block descriptors once; [`TermView`] then gives shaped, typed
//! access into the flat buffer without any pointer arithmetic.
//!
//! Topology summary (r = detector rows, c = driven columns):
//!
//! | type | blocks                                   | terms        |
//! |------|------------------------------------------|--------------|
//! | T8   | ts,ti diag r×c; tx,tm diag c×c           | 2r + 2c      |
//! | TE10 | T8 + el off-diagonal r×c                 | + rc − min   |
//! | T16  | ts,ti full r×c; tx,tm full c×c           | 2rc + 2c²    |
//! | U8   | um,ux diag r×r; ui,us diag r×c           | 2r + 2c      |
//! | UE10 | U8 + el off-diagonal r×c                 | + rc − min   |
//! | U16  | all four full                            | 2r² + 2rc    |
//! | UE14 | per column: um,ux diag r; ui,us scalar;  | c(2r+2)      |
//! |      | one shared el off-diagonal r×c           | + rc − c     |
//! | E12  | per column: el, er, em vectors of r      | 3rc          |
//!
//! T16/U16 fold every leakage path into their full `tx`/`ux` blocks
//! while TE10/UE10 carry a separate `el` block; the asymmetry is real
//! (the 16-term models observe all r·c leakage paths, the 10-term
//! models only the off-diagonal detector paths) and is preserved.
//!
//! One-port calibrations are special: whatever the requested type, a
//! single reflection measurement can only support the 3-term error
//! model (directivity, tracking, match), so `ports == 1` always lays
//! out `el`, `er`, `em` scalars and `total_terms == 3`.

use serde::{Deserialize, Serialize};

use crate::complex_matrix::ComplexMatrix;
use crate::types::{CalError, CalResult, Complex};

// ---------------------------------------------------------------------------
// Calibration type
// ---------------------------------------------------------------------------

/// The eight supported calibration topologies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CalType {
    /// 8-term T-parameter model (diagonal blocks).
    T8,
    /// 8-term U-parameter (inverse) model.
    U8,
    /// 10-term T model: T8 plus an off-diagonal leakage block.
    Te10,
    /// 10-term U model: U8 plus an off-diagonal leakage block.
    Ue10,
    /// 16-term T model: full blocks, leakage folded in.
    T16,
    /// 16-term U model: full blocks, leakage folded in.
    U16,
    /// 14-term per-driven-column U model with shared leakage block.
    Ue14,
    /// Classic 12-term per-driven-column model (el/er/em).
    E12,
}

impl CalType {
    /// All calibration types, in a stable order.
    pub const ALL: [CalType; 8] = [
        CalType::T8,
        CalType::U8,
        CalType::Te10,
        CalType::Ue10,
        CalType::T16,
        CalType::U16,
        CalType::Ue14,
        CalType::E12,
    ];

    /// Canonical uppercase name (matches the persistence schema).
    pub fn name(&self) -> &'static str {
        match self {
            CalType::T8 => "T8",
            CalType::U8 => "U8",
            CalType::Te10 => "TE10",
            CalType::Ue10 => "UE10",
            CalType::T16 => "T16",
            CalType::U16 => "U16",
            CalType::Ue14 => "UE14",
            CalType::E12 => "E12",
        }
    }

    /// Parse a canonical name back into a type.
    pub fn from_name(name: &str) -> Option<CalType> {
        CalType::ALL.iter().copied().find(|t| t.name() == name)
    }

    /// True for the T-parameter (forward error box) family.
    pub fn is_t_family(&self) -> bool {
        matches!(self, CalType::T8 | CalType::Te10 | CalType::T16)
    }

    /// True for the U-parameter (inverse error box) family.
    pub fn is_u_family(&self) -> bool {
        matches!(self, CalType::U8 | CalType::Ue10 | CalType::U16)
    }

    /// True for the per-driven-column families (UE14, E12).
    pub fn is_per_column(&self) -> bool {
        matches!(self, CalType::Ue14 | CalType::E12)
    }

    /// True if the layout carries a separate off-diagonal leakage
    /// block (`el`) that is estimated by averaging rather than solved
    /// in the main system. E12 keeps its isolation terms inside the
    /// per-column `el` vectors but estimates the off-diagonal entries
    /// the same way.
    pub fn has_leakage_block(&self) -> bool {
        matches!(self, CalType::Te10 | CalType::Ue10 | CalType::Ue14)
    }

    /// Check the row/column constraint of this type.
    ///
    /// T-types drive at least as many ports as they detect
    /// (`rows <= columns`); U-types and the per-column types are the
    /// mirror image (`rows >= columns`).
    pub fn validate_dimensions(&self, rows: usize, columns: usize) -> CalResult<()> {
        if rows < 1 || columns < 1 {
            return Err(CalError::InvalidDimensions {
                cal_type: self.name(),
                requirement: "at least one row and one column".into(),
            });
        }
        if self.is_t_family() && rows > columns {
            return Err(CalError::InvalidDimensions {
                cal_type: self.name(),
                requirement: format!("rows <= columns, got {}x{}", rows, columns),
            });
        }
        if (self.is_u_family() || self.is_per_column()) && rows < columns {
            return Err(CalError::InvalidDimensions {
                cal_type: self.name(),
                requirement: format!("rows >= columns, got {}x{}", rows, columns),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Block descriptors
// ---------------------------------------------------------------------------

/// Names of the error-term blocks across all topologies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockName {
    Ts,
    Ti,
    Tx,
    Tm,
    Um,
    Ui,
    Ux,
    Us,
    El,
    Er,
    Em,
}

impl BlockName {
    /// Lowercase name used by the persistence schema.
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockName::Ts => "ts",
            BlockName::Ti => "ti",
            BlockName::Tx => "tx",
            BlockName::Tm => "tm",
            BlockName::Um => "um",
            BlockName::Ui => "ui",
            BlockName::Ux => "ux",
            BlockName::Us => "us",
            BlockName::El => "el",
            BlockName::Er => "er",
            BlockName::Em => "em",
        }
    }
}

/// Storage shape of a block within the flat term vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockShape {
    /// All rows*cols entries, row-major.
    Full,
    /// Only the min(rows, cols) diagonal entries.
    Diagonal,
    /// Row-major with the diagonal omitted (the `_ND` convention):
    /// rows*cols - min(rows, cols) entries.
    OffDiagonal,
}

impl BlockShape {
    /// Number of stored entries for a rows-by-cols block.
    pub fn len(&self, rows: usize, cols: usize) -> usize {
        let min = rows.min(cols);
        match self {
            BlockShape::Full => rows * cols,
            BlockShape::Diagonal => min,
            BlockShape::OffDiagonal => rows * cols - min,
        }
    }
}

/// Flat index of off-diagonal cell (i, j) within an
/// [`BlockShape::OffDiagonal`] block (row-major, diagonal skipped).
///
/// # Panics
/// Panics if `i == j` (the diagonal is not stored).
pub(crate) fn off_diagonal_index(i: usize, j: usize, rows: usize, cols: usize) -> usize {
    assert_ne!(i, j, "diagonal entry of an off-diagonal block");
    let min = rows.min(cols);
    let skipped = i.min(min) + usize::from(i < min && j > i);
    i * cols + j - skipped
}

/// One named block of error terms with its position in the flat
/// per-frequency vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TermBlock {
    pub name: BlockName,
    pub shape: BlockShape,
    pub rows: usize,
    pub cols: usize,
    /// Driven column this block belongs to, for the per-column
    /// topologies; `None` for calibration-wide blocks.
    pub column: Option<usize>,
    /// Offset of the first entry in the flat term vector.
    pub offset: usize,
    /// Number of stored entries.
    pub len: usize,
}

// ---------------------------------------------------------------------------
// Layout
// ---------------------------------------------------------------------------

/// Derived, immutable layout of the per-frequency error-term vector
/// for a `(type, m_rows, m_columns)` triple. Cheap to recompute; never
/// mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorTermLayout {
    cal_type: CalType,
    m_rows: usize,
    m_columns: usize,
    blocks: Vec<TermBlock>,
    total_terms: usize,
}

impl ErrorTermLayout {
    /// Compute the layout for a calibration type and port counts.
    pub fn new(cal_type: CalType, m_rows: usize, m_columns: usize) -> CalResult<Self> {
        cal_type.validate_dimensions(m_rows, m_columns)?;
        let r = m_rows;
        let c = m_columns;
        let ports = r.max(c);

        let mut blocks = Vec::new();
        let mut offset = 0usize;
        let mut push = |blocks: &mut Vec<TermBlock>,
                        name: BlockName,
                        shape: BlockShape,
                        rows: usize,
                        cols: usize,
                        column: Option<usize>| {
            let len = shape.len(rows, cols);
            blocks.push(TermBlock {
                name,
                shape,
                rows,
                cols,
                column,
                offset,
                len,
            });
            offset += len;
        };

        if ports == 1 {
            // Reflection-only 3-term model, whatever the nominal type.
            push(&mut blocks, BlockName::El, BlockShape::Full, 1, 1, Some(0));
            push(&mut blocks, BlockName::Er, BlockShape::Full, 1, 1, Some(0));
            push(&mut blocks, BlockName::Em, BlockShape::Full, 1, 1, Some(0));
        } else {
            match cal_type {
                CalType::T8 | CalType::Te10 => {
                    push(&mut blocks, BlockName::Ts, BlockShape::Diagonal, r, c, None);
                    push(&mut blocks, BlockName::Ti, BlockShape::Diagonal, r, c, None);
                    push(&mut blocks, BlockName::Tx, BlockShape::Diagonal, c, c, None);
                    push(&mut blocks, BlockName::Tm, BlockShape::Diagonal, c, c, None);
                    if cal_type == CalType::Te10 {
                        push(&mut blocks, BlockName::El, BlockShape::OffDiagonal, r, c, None);
                    }
                }
                CalType::T16 => {
                    push(&mut blocks, BlockName::Ts, BlockShape::Full, r, c, None);
                    push(&mut blocks, BlockName::Ti, BlockShape::Full, r, c, None);
                    push(&mut blocks, BlockName::Tx, BlockShape::Full, c, c, None);
                    push(&mut blocks, BlockName::Tm, BlockShape::Full, c, c, None);
                }
                CalType::U8 | CalType::Ue10 => {
                    push(&mut blocks, BlockName::Um, BlockShape::Diagonal, r, r, None);
                    push(&mut blocks, BlockName::Ui, BlockShape::Diagonal, r, c, None);
                    push(&mut blocks, BlockName::Ux, BlockShape::Diagonal, r, r, None);
                    push(&mut blocks, BlockName::Us, BlockShape::Diagonal, r, c, None);
                    if cal_type == CalType::Ue10 {
                        push(&mut blocks, BlockName::El, BlockShape::OffDiagonal, r, c, None);
                    }
                }
                CalType::U16 => {
                    push(&mut blocks, BlockName::Um, BlockShape::Full, r, r, None);
                    push(&mut blocks, BlockName::Ui, BlockShape::Full, r, c, None);
                    push(&mut blocks, BlockName::Ux, BlockShape::Full, r, r, None);
                    push(&mut blocks, BlockName::Us, BlockShape::Full, r, c, None);
                }
                CalType::Ue14 => {
                    for j in 0..c {
                        push(&mut blocks, BlockName::Um, BlockShape::Diagonal, r, r, Some(j));
                        push(&mut blocks, BlockName::Ui, BlockShape::Full, 1, 1, Some(j));
                        push(&mut blocks, BlockName::Ux, BlockShape::Diagonal, r, r, Some(j));
                        push(&mut blocks, BlockName::Us, BlockShape::Full, 1, 1, Some(j));
                    }
                    push(&mut blocks, BlockName::El, BlockShape::OffDiagonal, r, c, None);
                }
                CalType::E12 => {
                    for j in 0..c {
                        push(&mut blocks, BlockName::El, BlockShape::Full, r, 1, Some(j));
                        push(&mut blocks, BlockName::Er, BlockShape::Full, r, 1, Some(j));
                        push(&mut blocks, BlockName::Em, BlockShape::Full, r, 1, Some(j));
                    }
                }
            }
        }

        Ok(Self {
            cal_type,
            m_rows,
            m_columns,
            blocks,
            total_terms: offset,
        })
    }

    pub fn cal_type(&self) -> CalType {
        self.cal_type
    }

    pub fn m_rows(&self) -> usize {
        self.m_rows
    }

    pub fn m_columns(&self) -> usize {
        self.m_columns
    }

    /// Number of physical VNA ports, `max(m_rows, m_columns)`.
    pub fn ports(&self) -> usize {
        self.m_rows.max(self.m_columns)
    }

    /// True if this layout collapsed to the 1-port 3-term model.
    pub fn is_one_port(&self) -> bool {
        self.ports() == 1
    }

    /// All block descriptors in storage order.
    pub fn blocks(&self) -> &[TermBlock] {
        &self.blocks
    }

    /// Flat length of the per-frequency error-term vector. This is the
    /// authoritative sizing shared by the solver and the persistence
    /// layer.
    pub fn total_terms(&self) -> usize {
        self.total_terms
    }

    /// First calibration-wide block with the given name.
    pub fn block(&self, name: BlockName) -> Option<&TermBlock> {
        self.blocks
            .iter()
            .find(|b| b.name == name && b.column.is_none())
    }

    /// Block with the given name belonging to driven column `column`.
    pub fn column_block(&self, name: BlockName, column: usize) -> Option<&TermBlock> {
        self.blocks
            .iter()
            .find(|b| b.name == name && b.column == Some(column))
    }
}

// ---------------------------------------------------------------------------
// Standards arithmetic
// ---------------------------------------------------------------------------

/// True if solving this calibration requires one fully-connected
/// standard whose S-matrix is diagonal (e.g. every port terminated in
/// match): the off-diagonal leakage/isolation terms of these types are
/// estimated by averaging such standards' off-diagonal measurements.
pub fn requires_match_standard(cal_type: CalType, m_rows: usize, m_columns: usize) -> bool {
    if m_rows.max(m_columns) == 1 {
        return false;
    }
    matches!(
        cal_type,
        CalType::Te10 | CalType::Ue10 | CalType::Ue14 | CalType::E12
    )
}

/// Minimum number of regular (fully-known, generically independent)
/// standards required to solve, excluding the mandatory match standard
/// reported by [`requires_match_standard`].
///
/// The base count is system unknowns divided by the equations each
/// standard contributes (one per measurement cell for the
/// calibration-wide types, one per detector row per column for the
/// per-column types), with the match standard's diagonal equations
/// credited where it is mandatory anyway. Two families need more than
/// that quotient because their per-cell equations are not all
/// independent:
///
/// - T8/U8 on a square system lose two equations of rank right at the
///   critical count (the deficiency vanishes once two spare equations
///   are available, and never appears on rectangular systems);
/// - T16/U16 never resolve with fewer than five standards, whatever
///   the port count — a square system supplies surplus equations from
///   the fourth standard on, but the shared null space only closes
///   with the fifth.
pub fn needed_standards(cal_type: CalType, m_rows: usize, m_columns: usize) -> usize {
    let r = m_rows;
    let c = m_columns;
    if r.max(c) == 1 {
        // 3 unknowns, one reflection equation per standard.
        return 3;
    }
    match cal_type {
        CalType::T8 | CalType::U8 => {
            let unknowns = 2 * r + 2 * c - 1;
            let target = if r == c { unknowns + 2 } else { unknowns };
            target.div_ceil(r * c)
        }
        CalType::Te10 | CalType::Ue10 => {
            let unknowns = 2 * r + 2 * c - 1;
            (unknowns - r.min(c)).div_ceil(r * c)
        }
        CalType::T16 => (2 * r * c + 2 * c * c - 1).div_ceil(r * c).max(5),
        CalType::U16 => (2 * r * r + 2 * r * c - 1).div_ceil(r * c).max(5),
        // Per column: 2r + 1 unknowns, r equations per standard, one
        // equation from the mandatory match standard.
        CalType::Ue14 | CalType::E12 => 2,
    }
}

// ---------------------------------------------------------------------------
// Typed views
// ---------------------------------------------------------------------------

/// Shaped, read-only view of one block inside a flat per-frequency
/// error-term vector. Entries the shape does not store (off-diagonal
/// cells of a diagonal block, diagonal cells of an off-diagonal block)
/// read as zero.
#[derive(Debug, Clone, Copy)]
pub struct TermView<'a> {
    shape: BlockShape,
    rows: usize,
    cols: usize,
    data: &'a [Complex],
}

impl<'a> TermView<'a> {
    /// View `block` within `terms` (the flat vector for one frequency).
    ///
    /// # Panics
    /// Panics if `terms` is shorter than the block's extent.
    pub fn new(block: &TermBlock, terms: &'a [Complex]) -> Self {
        Self {
            shape: block.shape,
            rows: block.rows,
            cols: block.cols,
            data: &terms[block.offset..block.offset + block.len],
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Element at (i, j), materializing implicit zeros.
    pub fn get(&self, i: usize, j: usize) -> Complex {
        assert!(i < self.rows && j < self.cols, "term view index out of range");
        match self.shape {
            BlockShape::Full => self.data[i * self.cols + j],
            BlockShape::Diagonal => {
                if i == j {
                    self.data[i]
                } else {
                    Complex::new(0.0, 0.0)
                }
            }
            BlockShape::OffDiagonal => {
                if i == j {
                    Complex::new(0.0, 0.0)
                } else {
                    self.data[off_diagonal_index(i, j, self.rows, self.cols)]
                }
            }
        }
    }

    /// Materialize the full rows-by-cols matrix.
    pub fn to_matrix(&self) -> ComplexMatrix {
        let mut m = ComplexMatrix::new(self.rows, self.cols);
        for i in 0..self.rows {
            for j in 0..self.cols {
                m.set(i, j, self.get(i, j));
            }
        }
        m
    }
}

// ===========================================================================
// Tests
// ===========================================================================
