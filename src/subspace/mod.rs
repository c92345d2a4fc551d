//! # Randomized subspace iteration
//!
//! Estimates the dominant left (row orientation) or right (column orientation)
//! singular subspace of a [`PartitionedSparseMatrix`] by power iteration on
//! the Gram operator. Every product is re-orthonormalized with a thin QR so
//! the iterates do not collapse onto the leading direction.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::debug;
use nalgebra::DMatrix;

use crate::dense::{orthonormalize, PartitionedDense};
use crate::error::{LeverageError, Result};
use crate::random::RandomProjector;
use crate::sparse::PartitionedSparseMatrix;
use crate::Direction;

/// The matrix seen from one orientation.
///
/// For `Direction::ROW` the operator is `A` itself: `apply` is the partition
/// local right multiply and `apply_adjoint` the reducing transpose multiply.
/// `Direction::COLUMN` swaps the two primitives, which is the same as working
/// on `Aᵀ` without ever materializing it. Both primitives see `A / scale`.
#[derive(Debug, Clone, Copy)]
pub struct OrientedOperator<'a> {
    matrix: &'a PartitionedSparseMatrix,
    direction: Direction,
    scale: f64,
}

impl<'a> OrientedOperator<'a> {
    pub fn new(matrix: &'a PartitionedSparseMatrix, direction: Direction) -> Self {
        OrientedOperator {
            matrix,
            direction,
            scale: 1.0,
        }
    }

    /// Divides every entry by `scale` on the fly. The subspace, and therefore
    /// the leverage scores, do not change.
    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Length of the axis being scored (rows of the basis).
    pub fn axis_len(&self) -> usize {
        match self.direction {
            Direction::ROW => self.matrix.rows(),
            Direction::COLUMN => self.matrix.cols(),
        }
    }

    /// Length of the opposite axis.
    pub fn dual_len(&self) -> usize {
        match self.direction {
            Direction::ROW => self.matrix.cols(),
            Direction::COLUMN => self.matrix.rows(),
        }
    }

    /// Maps a `dual_len x l` block into the scored axis (`axis_len x l`).
    pub fn apply(&self, dense: &DMatrix<f64>) -> Result<DMatrix<f64>> {
        match self.direction {
            Direction::ROW => self.forward(dense),
            Direction::COLUMN => self.backward(dense),
        }
    }

    /// Maps an `axis_len x l` block back onto the opposite axis (`dual_len x l`).
    pub fn apply_adjoint(&self, dense: &DMatrix<f64>) -> Result<DMatrix<f64>> {
        match self.direction {
            Direction::ROW => self.backward(dense),
            Direction::COLUMN => self.forward(dense),
        }
    }

    fn forward(&self, dense: &DMatrix<f64>) -> Result<DMatrix<f64>> {
        Ok(self
            .matrix
            .right_multiply_scaled(dense, self.scale)?
            .gather(self.matrix))
    }

    fn backward(&self, dense: &DMatrix<f64>) -> Result<DMatrix<f64>> {
        let parts = PartitionedDense::scatter(dense, self.matrix)?;
        self.matrix.transpose_multiply_scaled(&parts, self.scale)
    }
}

/// Fixed-budget power iteration. `q` rounds, no convergence detection.
#[derive(Debug, Clone, Default)]
pub struct SubspaceIterator {
    power_iterations: usize,
    cancel_flag: Option<Arc<AtomicBool>>,
}

impl SubspaceIterator {
    pub fn new(power_iterations: usize) -> Self {
        SubspaceIterator {
            power_iterations,
            cancel_flag: None,
        }
    }

    /// Checked before every round and before the final pass.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel_flag = Some(flag);
        self
    }

    pub fn power_iterations(&self) -> usize {
        self.power_iterations
    }

    fn check_cancelled(&self, iteration: usize) -> Result<()> {
        match &self.cancel_flag {
            Some(flag) if flag.load(Ordering::Relaxed) => {
                Err(LeverageError::Cancelled { iteration })
            }
            _ => Ok(()),
        }
    }

    /// Returns an orthonormal `axis_len x width` basis of the estimated
    /// dominant subspace. `width` must not exceed `axis_len`, otherwise
    /// orthonormalization fails with `InvalidParameter`.
    pub fn estimate(
        &self,
        operator: &OrientedOperator<'_>,
        projector: &RandomProjector,
        width: usize,
    ) -> Result<DMatrix<f64>> {
        let mut y = projector.generate(operator.dual_len(), width)?;

        for iteration in 1..=self.power_iterations {
            self.check_cancelled(iteration)?;

            let z = orthonormalize(operator.apply(&y)?)?;
            y = orthonormalize(operator.apply_adjoint(&z)?)?;

            debug!(
                "power iteration {}/{} ({:?}, width {})",
                iteration, self.power_iterations, operator.direction(), width
            );
        }

        self.check_cancelled(self.power_iterations + 1)?;
        orthonormalize(operator.apply(&y)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn diagonal_matrix() -> PartitionedSparseMatrix {
        // 6 x 4 with singular values 8, 4, 1, 0.5 on the first four rows
        let triplets = vec![(0, 0, 8.0), (1, 1, 4.0), (2, 2, 1.0), (3, 3, 0.5)];
        PartitionedSparseMatrix::from_triplets("diag", 6, 4, triplets, 3).unwrap()
    }

    fn assert_orthonormal(basis: &DMatrix<f64>) {
        let gram = basis.transpose() * basis;
        let identity = DMatrix::<f64>::identity(gram.nrows(), gram.ncols());
        for (a, b) in gram.iter().zip(identity.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_operator_dimensions() {
        let matrix = diagonal_matrix();
        let rows = OrientedOperator::new(&matrix, Direction::ROW);
        let cols = OrientedOperator::new(&matrix, Direction::COLUMN);

        assert_eq!((rows.axis_len(), rows.dual_len()), (6, 4));
        assert_eq!((cols.axis_len(), cols.dual_len()), (4, 6));

        let y = DMatrix::from_element(4, 2, 1.0);
        assert_eq!(rows.apply(&y).unwrap().shape(), (6, 2));
        assert_eq!(cols.apply_adjoint(&y).unwrap().shape(), (6, 2));
    }

    #[test]
    fn test_column_operator_is_transpose() {
        let matrix = diagonal_matrix();
        let dense = matrix.to_dense();
        let op = OrientedOperator::new(&matrix, Direction::COLUMN);

        let y = RandomProjector::new(3).generate(6, 2).unwrap();
        let expected = dense.transpose() * &y;
        for (a, b) in op.apply(&y).unwrap().iter().zip(expected.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_basis_spans_dominant_rows() {
        let matrix = diagonal_matrix();
        let op = OrientedOperator::new(&matrix, Direction::ROW);
        let basis = SubspaceIterator::new(10)
            .estimate(&op, &RandomProjector::new(42), 2)
            .unwrap();

        assert_eq!(basis.shape(), (6, 2));
        assert_orthonormal(&basis);

        // all of the mass sits on rows 0 and 1
        let mass: Vec<f64> = (0..6).map(|i| basis.row(i).norm_squared()).collect();
        assert_abs_diff_eq!(mass[0], 1.0, epsilon = 1e-8);
        assert_abs_diff_eq!(mass[1], 1.0, epsilon = 1e-8);
        for &m in &mass[2..] {
            assert_abs_diff_eq!(m, 0.0, epsilon = 1e-8);
        }
    }

    #[test]
    fn test_zero_iterations_still_orthonormal() {
        let matrix = diagonal_matrix();
        let op = OrientedOperator::new(&matrix, Direction::COLUMN);
        let basis = SubspaceIterator::new(0)
            .estimate(&op, &RandomProjector::new(1), 3)
            .unwrap();
        assert_eq!(basis.shape(), (4, 3));
        assert_orthonormal(&basis);
    }

    #[test]
    fn test_width_above_axis() {
        let matrix = diagonal_matrix();
        let op = OrientedOperator::new(&matrix, Direction::COLUMN);
        let err = SubspaceIterator::new(0)
            .estimate(&op, &RandomProjector::new(1), 5)
            .unwrap_err();
        assert!(matches!(err, LeverageError::InvalidParameter { name: "width", .. }));
    }

    #[test]
    fn test_scale_does_not_move_basis() {
        let matrix = diagonal_matrix();
        let plain = OrientedOperator::new(&matrix, Direction::ROW);
        let scaled = plain.with_scale(8.0);

        let y = DMatrix::from_element(4, 1, 1.0);
        let a = plain.apply(&y).unwrap();
        let b = scaled.apply(&y).unwrap();
        for (x, z) in a.iter().zip(b.iter()) {
            assert_abs_diff_eq!(x / 8.0, z, epsilon = 1e-15);
        }

        let iterator = SubspaceIterator::new(4);
        let p = iterator.estimate(&plain, &RandomProjector::new(5), 2).unwrap();
        let q = iterator.estimate(&scaled, &RandomProjector::new(5), 2).unwrap();
        for i in 0..6 {
            assert_abs_diff_eq!(p.row(i).norm_squared(), q.row(i).norm_squared(), epsilon = 1e-12);
        }
    }

    #[test]
    fn test_cancelled_before_first_iteration() {
        let matrix = diagonal_matrix();
        let op = OrientedOperator::new(&matrix, Direction::ROW);
        let flag = Arc::new(AtomicBool::new(true));

        let err = SubspaceIterator::new(3)
            .with_cancel_flag(flag)
            .estimate(&op, &RandomProjector::new(1), 2)
            .unwrap_err();
        assert!(matches!(err, LeverageError::Cancelled { iteration: 1 }));
    }
}
