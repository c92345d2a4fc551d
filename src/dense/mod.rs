use nalgebra::DMatrix;

use crate::error::{LeverageError, Result};
use crate::sparse::PartitionedSparseMatrix;

/// Row-partitioned dense block, aligned with the partitions of a
/// [`PartitionedSparseMatrix`]: block `p` holds one row per local row of
/// partition `p`, in the same order.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionedDense {
    blocks: Vec<DMatrix<f64>>,
    ncols: usize,
}

impl PartitionedDense {
    /// Every block must be `ncols` wide.
    pub fn new(blocks: Vec<DMatrix<f64>>, ncols: usize) -> Result<Self> {
        if let Some((index, block)) = blocks.iter().enumerate().find(|(_, b)| b.ncols() != ncols) {
            return Err(LeverageError::invalid_parameter(
                "dense",
                format!(
                    "block {} has {} columns, expected {}",
                    index,
                    block.ncols(),
                    ncols
                ),
            ));
        }
        Ok(PartitionedDense { blocks, ncols })
    }

    /// Splits a coordinator matrix along the row layout of `layout`.
    pub fn scatter(dense: &DMatrix<f64>, layout: &PartitionedSparseMatrix) -> Result<Self> {
        if dense.nrows() != layout.rows() {
            return Err(LeverageError::invalid_parameter(
                "dense",
                format!(
                    "operand has {} rows, matrix `{}` has {} rows",
                    dense.nrows(),
                    layout.name(),
                    layout.rows()
                ),
            ));
        }
        let ncols = dense.ncols();
        let blocks = layout.map_partitions(|_, partition| {
            let rows = partition.row_indices();
            DMatrix::from_fn(rows.len(), ncols, |local, j| dense[(rows[local], j)])
        });
        Ok(PartitionedDense { blocks, ncols })
    }

    /// Materializes the blocks on the coordinator as a `rows x ncols` matrix.
    pub fn gather(&self, layout: &PartitionedSparseMatrix) -> DMatrix<f64> {
        let mut dense = DMatrix::zeros(layout.rows(), self.ncols);
        for (partition, block) in layout.partitions().iter().zip(&self.blocks) {
            for (local, &row) in partition.row_indices().iter().enumerate() {
                dense.row_mut(row).copy_from(&block.row(local));
            }
        }
        dense
    }

    pub fn blocks(&self) -> &[DMatrix<f64>] {
        &self.blocks
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn nrows(&self) -> usize {
        self.blocks.iter().map(|b| b.nrows()).sum()
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }
}

/// Replaces the columns of a tall matrix by an orthonormal basis of their span
/// (thin Householder QR, `Q` factor).
pub fn orthonormalize(matrix: DMatrix<f64>) -> Result<DMatrix<f64>> {
    let (rows, cols) = matrix.shape();
    if rows < cols {
        return Err(LeverageError::invalid_parameter(
            "width",
            format!(
                "cannot orthonormalize {} columns in a {}-dimensional space",
                cols, rows
            ),
        ));
    }
    if matrix.iter().any(|v| !v.is_finite()) {
        return Err(LeverageError::NumericalDegeneracy(
            "iterate contains non-finite values".to_string(),
        ));
    }
    Ok(matrix.qr().q())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn layout() -> PartitionedSparseMatrix {
        PartitionedSparseMatrix::new(
            "layout",
            4,
            2,
            vec![vec![(3, vec![]), (0, vec![])], vec![], vec![(1, vec![]), (2, vec![])]],
        )
        .unwrap()
    }

    #[test]
    fn test_scatter_gather() {
        let layout = layout();
        let dense = DMatrix::from_row_slice(4, 2, &[0.0, 1.0, 10.0, 11.0, 20.0, 21.0, 30.0, 31.0]);

        let parts = PartitionedDense::scatter(&dense, &layout).unwrap();
        assert_eq!(parts.num_blocks(), 3);
        assert_eq!(parts.nrows(), 4);
        assert_eq!(parts.ncols(), 2);
        assert_eq!(parts.blocks()[0][(0, 0)], 30.0);
        assert_eq!(parts.blocks()[0][(1, 1)], 1.0);
        assert_eq!(parts.blocks()[1].nrows(), 0);

        assert_eq!(parts.gather(&layout), dense);
    }

    #[test]
    fn test_new_checks_block_width() {
        let ok = PartitionedDense::new(vec![DMatrix::zeros(2, 3), DMatrix::zeros(0, 3)], 3).unwrap();
        assert_eq!(ok.nrows(), 2);

        let err = PartitionedDense::new(vec![DMatrix::zeros(2, 3), DMatrix::zeros(1, 2)], 3)
            .unwrap_err();
        assert!(matches!(err, LeverageError::InvalidParameter { name: "dense", .. }));
    }

    #[test]
    fn test_scatter_shape_mismatch() {
        let err = PartitionedDense::scatter(&DMatrix::zeros(3, 2), &layout()).unwrap_err();
        assert!(matches!(err, LeverageError::InvalidParameter { .. }));
    }

    #[test]
    fn test_orthonormalize() {
        let m = DMatrix::from_row_slice(4, 2, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 9.0]);
        let q = orthonormalize(m.clone()).unwrap();
        assert_eq!(q.shape(), (4, 2));

        let gram = q.transpose() * &q;
        let identity = DMatrix::<f64>::identity(2, 2);
        for (a, b) in gram.iter().zip(identity.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-12);
        }

        // span is preserved: projecting m onto span(q) gives m back
        let projected = &q * (q.transpose() * &m);
        for (a, b) in projected.iter().zip(m.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_orthonormalize_rejects_bad_input() {
        assert!(matches!(
            orthonormalize(DMatrix::zeros(2, 3)),
            Err(LeverageError::InvalidParameter { .. })
        ));

        let mut m = DMatrix::from_element(3, 2, 1.0);
        m[(1, 1)] = f64::INFINITY;
        assert!(matches!(
            orthonormalize(m),
            Err(LeverageError::NumericalDegeneracy(_))
        ));
    }
}
