//! Schur complement solver for block-structured normal equations.
//!
//! The normal equations of the sparse universal adapters have the shape
//!
//! ```text
//! | A  B |   | da |   | ea |
//! | Bᵀ D | · | db | = | eb |
//! ```
//!
//! where `D` (and for some problems `A`) is block diagonal. Eliminating a block-diagonal side
//! costs one small inverse per block; only the remaining reduced system needs a full solve:
//!
//! ```text
//! (A - B·D⁻¹·Bᵀ) · da = ea - B·D⁻¹·eb
//!              db = D⁻¹ · (eb - Bᵀ·da)
//! ```
//!
//! The larger of the two sides is eliminated whenever it is block diagonal, so the dense
//! reduced system stays as small as possible. Blocks of size 1 and 3 are inverted in closed form.

use faer::sparse::SparseColMat;
use nalgebra::{DMatrix, DVector, Matrix3};

use crate::core::EPS;
use crate::linalg::{LinAlgError, LinAlgResult, dense};

/// Block structure of a symmetric normal-equation matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    /// Number of leading parameters forming the `A` block.
    pub split: usize,
    /// Diagonal block size of `A` when `A` is block diagonal.
    pub a_block: Option<usize>,
    /// Diagonal block size of `D`.
    pub d_block: usize,
}

impl BlockLayout {
    pub fn new(split: usize, a_block: Option<usize>, d_block: usize) -> Self {
        Self {
            split,
            a_block,
            d_block,
        }
    }

    /// Checks that the layout tiles a `dimension x dimension` matrix.
    pub fn validate(&self, dimension: usize) -> LinAlgResult<()> {
        if self.split > dimension {
            return Err(LinAlgError::InvalidBlockStructure(format!(
                "split {} exceeds dimension {}",
                self.split, dimension
            ))
            .log());
        }
        if self.d_block == 0 || (dimension - self.split) % self.d_block != 0 {
            return Err(LinAlgError::InvalidBlockStructure(format!(
                "D of size {} is not tiled by blocks of size {}",
                dimension - self.split,
                self.d_block
            ))
            .log());
        }
        if let Some(a_block) = self.a_block
            && (a_block == 0 || self.split % a_block != 0)
        {
            return Err(LinAlgError::InvalidBlockStructure(format!(
                "A of size {} is not tiled by blocks of size {}",
                self.split, a_block
            ))
            .log());
        }
        Ok(())
    }

    /// True if the `D` side is eliminated for a matrix of the given dimension.
    pub fn eliminates_d(&self, dimension: usize) -> bool {
        self.a_block.is_none() || self.split < dimension - self.split
    }
}

/// Index ranges of one elimination: the kept side stays in the reduced system.
struct Partition {
    kept_start: usize,
    kept_size: usize,
    eliminated_start: usize,
    eliminated_size: usize,
    block: usize,
}

impl Partition {
    fn new(layout: &BlockLayout, dimension: usize) -> Self {
        let size_a = layout.split;
        let size_b = dimension - size_a;
        match layout.a_block {
            Some(a_block) if !layout.eliminates_d(dimension) => Self {
                kept_start: size_a,
                kept_size: size_b,
                eliminated_start: 0,
                eliminated_size: size_a,
                block: a_block,
            },
            _ => Self {
                kept_start: 0,
                kept_size: size_a,
                eliminated_start: size_a,
                eliminated_size: size_b,
                block: layout.d_block,
            },
        }
    }

    fn kept(&self, index: usize) -> Option<usize> {
        (index >= self.kept_start && index < self.kept_start + self.kept_size)
            .then(|| index - self.kept_start)
    }

    fn eliminated(&self, index: usize) -> Option<usize> {
        (index >= self.eliminated_start && index < self.eliminated_start + self.eliminated_size)
            .then(|| index - self.eliminated_start)
    }
}

/// Inverts a small symmetric diagonal block.
///
/// # Errors
/// Returns `LinAlgError::SingularMatrix` when the block is not invertible.
pub fn invert_block(block: &DMatrix<f64>) -> LinAlgResult<DMatrix<f64>> {
    match block.nrows() {
        1 => {
            let value = block[(0, 0)];
            if value.abs() <= EPS {
                return Err(LinAlgError::SingularMatrix);
            }
            Ok(DMatrix::from_element(1, 1, 1.0 / value))
        }
        3 => {
            let m = Matrix3::from_iterator(block.iter().copied());
            let inverse = invert_3x3(&m).ok_or(LinAlgError::SingularMatrix)?;
            Ok(DMatrix::from_iterator(3, 3, inverse.iter().copied()))
        }
        _ => block.clone().try_inverse().ok_or(LinAlgError::SingularMatrix),
    }
}

/// Closed-form 3x3 inverse via the adjugate.
fn invert_3x3(m: &Matrix3<f64>) -> Option<Matrix3<f64>> {
    let c00 = m[(1, 1)] * m[(2, 2)] - m[(1, 2)] * m[(2, 1)];
    let c01 = m[(1, 2)] * m[(2, 0)] - m[(1, 0)] * m[(2, 2)];
    let c02 = m[(1, 0)] * m[(2, 1)] - m[(1, 1)] * m[(2, 0)];

    let determinant = m[(0, 0)] * c00 + m[(0, 1)] * c01 + m[(0, 2)] * c02;
    if determinant.abs() <= EPS {
        return None;
    }
    let inv_det = 1.0 / determinant;

    Some(Matrix3::new(
        c00 * inv_det,
        (m[(0, 2)] * m[(2, 1)] - m[(0, 1)] * m[(2, 2)]) * inv_det,
        (m[(0, 1)] * m[(1, 2)] - m[(0, 2)] * m[(1, 1)]) * inv_det,
        c01 * inv_det,
        (m[(0, 0)] * m[(2, 2)] - m[(0, 2)] * m[(2, 0)]) * inv_det,
        (m[(0, 2)] * m[(1, 0)] - m[(0, 0)] * m[(1, 2)]) * inv_det,
        c02 * inv_det,
        (m[(0, 1)] * m[(2, 0)] - m[(0, 0)] * m[(2, 1)]) * inv_det,
        (m[(0, 0)] * m[(1, 1)] - m[(0, 1)] * m[(1, 0)]) * inv_det,
    ))
}

/// Solves the symmetric block system `matrix · x = rhs` by eliminating one block-diagonal side.
///
/// # Errors
/// - `LinAlgError::InvalidBlockStructure` if the layout does not fit or the eliminated side has
///   entries outside its diagonal blocks
/// - `LinAlgError::SingularMatrix` if a diagonal block or the reduced system is singular
pub fn solve(
    matrix: &SparseColMat<usize, f64>,
    rhs: &DVector<f64>,
    layout: &BlockLayout,
) -> LinAlgResult<DVector<f64>> {
    let dimension = matrix.nrows();
    if matrix.ncols() != dimension || rhs.len() != dimension {
        return Err(LinAlgError::DimensionMismatch(format!(
            "Cannot solve {}x{} system with right-hand side of length {}",
            dimension,
            matrix.ncols(),
            rhs.len()
        ))
        .log());
    }
    layout.validate(dimension)?;

    let partition = Partition::new(layout, dimension);
    let block = partition.block;
    let block_count = partition.eliminated_size / block;

    let mut kept = DMatrix::<f64>::zeros(partition.kept_size, partition.kept_size);
    let mut coupling = DMatrix::<f64>::zeros(partition.kept_size, partition.eliminated_size);
    let mut blocks = vec![DMatrix::<f64>::zeros(block, block); block_count];

    for t in matrix.triplet_iter() {
        let value = *t.val;
        match (partition.kept(t.row), partition.kept(t.col)) {
            (Some(r), Some(c)) => kept[(r, c)] += value,
            (Some(r), None) => {
                if let Some(c) = partition.eliminated(t.col) {
                    coupling[(r, c)] += value;
                }
            }
            // lower-left coupling is the transpose of the upper-right one
            (None, Some(_)) => {}
            (None, None) => {
                if let (Some(r), Some(c)) =
                    (partition.eliminated(t.row), partition.eliminated(t.col))
                {
                    if r / block != c / block {
                        if value != 0.0 {
                            return Err(LinAlgError::InvalidBlockStructure(format!(
                                "entry ({}, {}) lies outside the diagonal blocks",
                                t.row, t.col
                            ))
                            .log());
                        }
                        continue;
                    }
                    blocks[r / block][(r % block, c % block)] += value;
                }
            }
        }
    }

    let inverses = blocks
        .iter()
        .map(invert_block)
        .collect::<LinAlgResult<Vec<_>>>()?;

    // X · E⁻¹, computed block column by block column
    let mut coupling_inverse =
        DMatrix::<f64>::zeros(partition.kept_size, partition.eliminated_size);
    for (j, inverse) in inverses.iter().enumerate() {
        let product = coupling.columns(j * block, block) * inverse;
        coupling_inverse
            .columns_mut(j * block, block)
            .copy_from(&product);
    }

    let rhs_kept = rhs.rows(partition.kept_start, partition.kept_size).into_owned();
    let rhs_eliminated = rhs
        .rows(partition.eliminated_start, partition.eliminated_size)
        .into_owned();

    let reduced = &kept - &coupling_inverse * coupling.transpose();
    let reduced_rhs = &rhs_kept - &coupling_inverse * &rhs_eliminated;
    let delta_kept = dense::solve_symmetric(&reduced, &reduced_rhs)?;

    let remaining = &rhs_eliminated - coupling.tr_mul(&delta_kept);

    let mut solution = DVector::<f64>::zeros(dimension);
    solution
        .rows_mut(partition.kept_start, partition.kept_size)
        .copy_from(&delta_kept);
    for (j, inverse) in inverses.iter().enumerate() {
        let delta = inverse * remaining.rows(j * block, block);
        solution
            .rows_mut(partition.eliminated_start + j * block, block)
            .copy_from(&delta);
    }

    Ok(solution)
}
