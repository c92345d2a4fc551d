use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use log::debug;
use nalgebra::DMatrix;
use nalgebra_sparse::CsrMatrix;
use rayon::prelude::*;

use crate::dense::PartitionedDense;
use crate::error::{LeverageError, Result};

use super::{MatrixNonZero, MatrixSum};

fn check_scale(scale: f64) -> Result<()> {
    if scale.is_finite() && scale > 0.0 {
        Ok(())
    } else {
        Err(LeverageError::invalid_parameter(
            "scale",
            format!("must be positive and finite, got {}", scale),
        ))
    }
}

/// A sparse row as handed over by the input provider: global row index and
/// its `(column, value)` entries.
pub type SparseRow = (usize, Vec<(usize, f64)>);

/// One row partition: a local CSR block plus the global index of every local row.
#[derive(Debug, Clone)]
pub struct SparsePartition {
    row_indices: Vec<usize>,
    block: CsrMatrix<f64>,
}

impl SparsePartition {
    pub fn row_indices(&self) -> &[usize] {
        &self.row_indices
    }

    pub fn block(&self) -> &CsrMatrix<f64> {
        &self.block
    }

    pub fn len(&self) -> usize {
        self.row_indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.row_indices.is_empty()
    }
}

/// Immutable row-partitioned sparse matrix.
///
/// Every row index in `[0, rows)` lives in exactly one partition, column
/// indices are unique per row and values are finite. The multiply primitives
/// run partition-local work on the rayon pool and merge partial results in
/// partition order, so repeated calls on the same matrix are bit-for-bit
/// identical.
#[derive(Debug, Clone)]
pub struct PartitionedSparseMatrix {
    name: String,
    rows: usize,
    cols: usize,
    partitions: Vec<SparsePartition>,
}

impl PartitionedSparseMatrix {
    pub fn new(
        name: impl Into<String>,
        rows: usize,
        cols: usize,
        partitions: Vec<Vec<SparseRow>>,
    ) -> Result<Self> {
        let name = name.into();
        if rows == 0 || cols == 0 {
            return Err(LeverageError::InvalidMatrix(format!(
                "matrix `{}` must have a positive shape, got {} x {}",
                name, rows, cols
            )));
        }

        let mut assigned = vec![false; rows];
        let mut built = Vec::with_capacity(partitions.len());

        for (partition_index, partition_rows) in partitions.into_iter().enumerate() {
            let mut row_indices = Vec::with_capacity(partition_rows.len());
            let mut row_offsets = Vec::with_capacity(partition_rows.len() + 1);
            let mut col_indices = Vec::new();
            let mut values = Vec::new();
            row_offsets.push(0);

            for (row, mut entries) in partition_rows {
                if row >= rows {
                    return Err(LeverageError::InvalidMatrix(format!(
                        "row index {} out of range for {} rows",
                        row, rows
                    )));
                }
                if std::mem::replace(&mut assigned[row], true) {
                    return Err(LeverageError::InvalidMatrix(format!(
                        "row {} appears in more than one place",
                        row
                    )));
                }

                entries.sort_unstable_by_key(|&(col, _)| col);
                for pair in entries.windows(2) {
                    if pair[0].0 == pair[1].0 {
                        return Err(LeverageError::InvalidMatrix(format!(
                            "row {} has duplicate column {}",
                            row, pair[0].0
                        )));
                    }
                }
                for (col, value) in entries {
                    if col >= cols {
                        return Err(LeverageError::InvalidMatrix(format!(
                            "column index {} in row {} out of range for {} columns",
                            col, row, cols
                        )));
                    }
                    if !value.is_finite() {
                        return Err(LeverageError::InvalidMatrix(format!(
                            "non-finite value at ({}, {})",
                            row, col
                        )));
                    }
                    col_indices.push(col);
                    values.push(value);
                }

                row_offsets.push(col_indices.len());
                row_indices.push(row);
            }

            let block = CsrMatrix::try_from_csr_data(
                row_indices.len(),
                cols,
                row_offsets,
                col_indices,
                values,
            )
            .map_err(|e| {
                LeverageError::InvalidMatrix(format!("partition {}: {}", partition_index, e))
            })?;

            built.push(SparsePartition { row_indices, block });
        }

        if let Some(missing) = assigned.iter().position(|&seen| !seen) {
            return Err(LeverageError::InvalidMatrix(format!(
                "row {} is not assigned to any partition",
                missing
            )));
        }

        Ok(PartitionedSparseMatrix {
            name,
            rows,
            cols,
            partitions: built,
        })
    }

    /// Splits `[0, rows)` into `num_partitions` contiguous ranges. Rows that do
    /// not occur in `sparse_rows` are stored as empty rows.
    pub fn from_rows<I>(
        name: impl Into<String>,
        rows: usize,
        cols: usize,
        sparse_rows: I,
        num_partitions: usize,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = SparseRow>,
    {
        if num_partitions == 0 {
            return Err(LeverageError::invalid_parameter(
                "num_partitions",
                "at least one partition is required",
            ));
        }

        let mut by_row: BTreeMap<usize, Vec<(usize, f64)>> = BTreeMap::new();
        for (row, entries) in sparse_rows {
            if row >= rows {
                return Err(LeverageError::InvalidMatrix(format!(
                    "row index {} out of range for {} rows",
                    row, rows
                )));
            }
            match by_row.entry(row) {
                Entry::Vacant(slot) => {
                    slot.insert(entries);
                }
                Entry::Occupied(_) => {
                    return Err(LeverageError::InvalidMatrix(format!(
                        "row {} appears in more than one place",
                        row
                    )));
                }
            }
        }

        let chunk = rows.div_ceil(num_partitions).max(1);
        let partitions = (0..num_partitions)
            .map(|p| {
                let start = (p * chunk).min(rows);
                let end = ((p + 1) * chunk).min(rows);
                (start..end)
                    .map(|row| (row, by_row.remove(&row).unwrap_or_default()))
                    .collect()
            })
            .collect();

        Self::new(name, rows, cols, partitions)
    }

    /// Groups `(row, col, value)` nonzeros into sparse rows.
    pub fn from_triplets<I>(
        name: impl Into<String>,
        rows: usize,
        cols: usize,
        triplets: I,
        num_partitions: usize,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = (usize, usize, f64)>,
    {
        let mut by_row: BTreeMap<usize, Vec<(usize, f64)>> = BTreeMap::new();
        for (row, col, value) in triplets {
            by_row.entry(row).or_default().push((col, value));
        }
        Self::from_rows(name, rows, cols, by_row, num_partitions)
    }

    pub fn from_csr(
        name: impl Into<String>,
        csr: &CsrMatrix<f64>,
        num_partitions: usize,
    ) -> Result<Self> {
        let sparse_rows = csr.row_iter().enumerate().map(|(row, entries)| {
            let pairs = entries
                .col_indices()
                .iter()
                .copied()
                .zip(entries.values().iter().copied())
                .collect();
            (row, pairs)
        });
        Self::from_rows(name, csr.nrows(), csr.ncols(), sparse_rows, num_partitions)
    }

    pub fn transpose(&self, num_partitions: usize) -> Result<Self> {
        let triplets = self.triplets().map(|(row, col, value)| (col, row, value));
        Self::from_triplets(
            format!("{}^T", self.name),
            self.cols,
            self.rows,
            triplets,
            num_partitions,
        )
    }

    pub fn to_dense(&self) -> DMatrix<f64> {
        let mut dense = DMatrix::zeros(self.rows, self.cols);
        for (row, col, value) in self.triplets() {
            dense[(row, col)] = value;
        }
        dense
    }

    /// Stored entries as global `(row, col, value)` triplets, partition by partition.
    pub fn triplets(&self) -> impl Iterator<Item = (usize, usize, f64)> + '_ {
        self.partitions.iter().flat_map(|partition| {
            partition
                .block
                .triplet_iter()
                .map(move |(local, col, &value)| (partition.row_indices[local], col, value))
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn partitions(&self) -> &[SparsePartition] {
        &self.partitions
    }

    pub fn num_partitions(&self) -> usize {
        self.partitions.len()
    }

    /// Runs `map` on every partition in parallel; results come back in
    /// partition order.
    pub fn map_partitions<R, F>(&self, map: F) -> Vec<R>
    where
        R: Send,
        F: Fn(usize, &SparsePartition) -> R + Sync + Send,
    {
        self.partitions
            .par_iter()
            .enumerate()
            .map(|(index, partition)| map(index, partition))
            .collect()
    }

    /// Partition-local map followed by an associative merge, folded in
    /// partition order.
    pub fn map_reduce<R, F, G>(&self, map: F, identity: R, merge: G) -> R
    where
        R: Send,
        F: Fn(usize, &SparsePartition) -> R + Sync + Send,
        G: Fn(R, R) -> R,
    {
        self.map_partitions(map).into_iter().fold(identity, merge)
    }

    pub fn nnz(&self) -> usize {
        self.map_reduce(|_, partition| partition.block.nnz(), 0, |a, b| a + b)
    }

    pub fn frobenius_norm_squared(&self) -> Result<f64> {
        self.map_partitions(|_, partition| {
            partition
                .block
                .sum_squares_row::<f64>()
                .map(|sums| sums.into_iter().sum::<f64>())
        })
        .into_iter()
        .try_fold(0.0, |acc, partial| partial.map(|p| acc + p))
    }

    /// Number of rows without stored entries.
    pub fn empty_rows(&self) -> Result<usize> {
        self.map_partitions(|_, partition| {
            partition
                .block
                .nonzero_row::<usize>()
                .map(|counts| counts.into_iter().filter(|&c| c == 0).count())
        })
        .into_iter()
        .try_fold(0, |acc, partial| partial.map(|p| acc + p))
    }

    /// Number of columns without stored entries in any partition.
    pub fn empty_cols(&self) -> Result<usize> {
        let per_partition = self.map_partitions(|_, partition| partition.block.nonzero_col::<usize>());
        let mut counts = vec![0usize; self.cols];
        for partial in per_partition {
            for (total, count) in counts.iter_mut().zip(partial?) {
                *total += count;
            }
        }
        Ok(counts.into_iter().filter(|&c| c == 0).count())
    }

    /// Largest stored magnitude, 0.0 when nothing non-zero is stored.
    pub fn max_abs(&self) -> f64 {
        self.map_reduce(
            |_, partition| {
                partition
                    .block
                    .values()
                    .iter()
                    .fold(0.0f64, |acc, v| acc.max(v.abs()))
            },
            0.0,
            f64::max,
        )
    }

    /// `self * dense` for a `cols x l` operand replicated to every partition.
    /// The result stays row-partitioned.
    pub fn right_multiply(&self, dense: &DMatrix<f64>) -> Result<PartitionedDense> {
        self.right_multiply_scaled(dense, 1.0)
    }

    /// `(self / scale) * dense`. Entries are divided before multiplying, so
    /// matrices near the ends of the f64 range stay finite.
    pub fn right_multiply_scaled(
        &self,
        dense: &DMatrix<f64>,
        scale: f64,
    ) -> Result<PartitionedDense> {
        check_scale(scale)?;
        if dense.nrows() != self.cols {
            return Err(LeverageError::invalid_parameter(
                "dense",
                format!(
                    "right operand has {} rows, matrix `{}` has {} columns",
                    dense.nrows(),
                    self.name,
                    self.cols
                ),
            ));
        }
        let width = dense.ncols();

        let blocks = self.map_partitions(|_, partition| {
            let mut out = DMatrix::zeros(partition.len(), width);
            for (local, row) in partition.block.row_iter().enumerate() {
                for (&col, &value) in row.col_indices().iter().zip(row.values()) {
                    for j in 0..width {
                        out[(local, j)] += value / scale * dense[(col, j)];
                    }
                }
            }
            out
        });

        debug!(
            "right_multiply on `{}`: {} partitions, width {}",
            self.name,
            blocks.len(),
            width
        );
        PartitionedDense::new(blocks, width)
    }

    /// `selfᵀ * dense` for a row-partitioned `rows x l` operand, reduced to a
    /// single `cols x l` matrix.
    pub fn transpose_multiply(&self, dense: &PartitionedDense) -> Result<DMatrix<f64>> {
        self.transpose_multiply_scaled(dense, 1.0)
    }

    /// `(self / scale)ᵀ * dense`, see [`right_multiply_scaled`](Self::right_multiply_scaled).
    pub fn transpose_multiply_scaled(
        &self,
        dense: &PartitionedDense,
        scale: f64,
    ) -> Result<DMatrix<f64>> {
        check_scale(scale)?;
        if dense.num_blocks() != self.partitions.len() {
            return Err(LeverageError::invalid_parameter(
                "dense",
                format!(
                    "operand has {} blocks, matrix `{}` has {} partitions",
                    dense.num_blocks(),
                    self.name,
                    self.partitions.len()
                ),
            ));
        }
        for (index, (partition, block)) in self.partitions.iter().zip(dense.blocks()).enumerate() {
            if block.nrows() != partition.len() {
                return Err(LeverageError::invalid_parameter(
                    "dense",
                    format!(
                        "block {} has {} rows, partition holds {}",
                        index,
                        block.nrows(),
                        partition.len()
                    ),
                ));
            }
        }
        let width = dense.ncols();
        let cols = self.cols;

        let partials = self.map_partitions(|index, partition| {
            let block = &dense.blocks()[index];
            let mut acc: BTreeMap<usize, Vec<f64>> = BTreeMap::new();
            for (local, row) in partition.block.row_iter().enumerate() {
                for (&col, &value) in row.col_indices().iter().zip(row.values()) {
                    let sums = acc.entry(col).or_insert_with(|| vec![0.0; width]);
                    for (j, sum) in sums.iter_mut().enumerate() {
                        *sum += value / scale * block[(local, j)];
                    }
                }
            }
            acc
        });

        let mut result = DMatrix::zeros(cols, width);
        for partial in partials {
            for (col, sums) in partial {
                for (j, sum) in sums.into_iter().enumerate() {
                    result[(col, j)] += sum;
                }
            }
        }

        debug!(
            "transpose_multiply on `{}`: merged {} partitions, width {}",
            self.name,
            self.partitions.len(),
            width
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use nalgebra_sparse::CooMatrix;

    fn create_test_matrix(num_partitions: usize) -> PartitionedSparseMatrix {
        // [1 0 2]
        // [0 0 0]
        // [3 4 0]
        // [0 5 6]
        let triplets = vec![
            (0, 0, 1.0),
            (0, 2, 2.0),
            (2, 0, 3.0),
            (2, 1, 4.0),
            (3, 1, 5.0),
            (3, 2, 6.0),
        ];
        PartitionedSparseMatrix::from_triplets("test", 4, 3, triplets, num_partitions).unwrap()
    }

    fn assert_matrix_eq(a: &DMatrix<f64>, b: &DMatrix<f64>) {
        assert_eq!(a.shape(), b.shape());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_abs_diff_eq!(x, y, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_layout_and_stats() {
        let matrix = create_test_matrix(2);
        assert_eq!(matrix.shape(), (4, 3));
        assert_eq!(matrix.num_partitions(), 2);
        assert_eq!(matrix.partitions()[0].row_indices(), &[0, 1]);
        assert_eq!(matrix.partitions()[1].row_indices(), &[2, 3]);
        assert_eq!(matrix.nnz(), 6);
        assert_eq!(matrix.empty_rows().unwrap(), 1);
        assert_eq!(matrix.empty_cols().unwrap(), 0);
        assert_eq!(matrix.max_abs(), 6.0);
        assert_abs_diff_eq!(matrix.frobenius_norm_squared().unwrap(), 91.0);
    }

    #[test]
    fn test_more_partitions_than_rows() {
        let matrix = create_test_matrix(7);
        assert_eq!(matrix.num_partitions(), 7);
        assert!(matrix.partitions()[6].is_empty());
        assert_eq!(matrix.nnz(), 6);
        assert_eq!(matrix.to_dense(), create_test_matrix(1).to_dense());
    }

    #[test]
    fn test_right_multiply_matches_dense() {
        let matrix = create_test_matrix(3);
        let operand = DMatrix::from_row_slice(3, 2, &[1.0, -1.0, 0.5, 2.0, -3.0, 0.25]);

        let expected = matrix.to_dense() * &operand;
        let result = matrix.right_multiply(&operand).unwrap().gather(&matrix);

        assert_matrix_eq(&result, &expected);
    }

    #[test]
    fn test_transpose_multiply_matches_dense() {
        let matrix = create_test_matrix(2);
        let operand =
            DMatrix::from_row_slice(4, 2, &[1.0, 0.0, 2.0, -1.0, 0.5, 0.5, -2.0, 3.0]);

        let expected = matrix.to_dense().transpose() * &operand;
        let scattered = PartitionedDense::scatter(&operand, &matrix).unwrap();
        let result = matrix.transpose_multiply(&scattered).unwrap();

        assert_matrix_eq(&result, &expected);
    }

    #[test]
    fn test_empty_partitions_and_rows() {
        let matrix = PartitionedSparseMatrix::new(
            "gaps",
            3,
            2,
            vec![
                vec![],
                vec![(2, vec![(1, 4.0), (0, 1.0)]), (0, vec![])],
                vec![(1, vec![])],
            ],
        )
        .unwrap();

        let operand = DMatrix::from_row_slice(2, 1, &[1.0, 2.0]);
        let product = matrix.right_multiply(&operand).unwrap();
        assert_eq!(product.blocks()[0].nrows(), 0);
        let gathered = product.gather(&matrix);
        assert_eq!(gathered.as_slice(), &[0.0, 0.0, 9.0]);

        let back = matrix.transpose_multiply(&product).unwrap();
        assert_eq!(back.as_slice(), &[9.0, 36.0]);
        assert_eq!(matrix.empty_rows().unwrap(), 2);

        let sparse_cols =
            PartitionedSparseMatrix::from_triplets("cols", 2, 4, vec![(0, 1, 1.0), (1, 3, 2.0)], 2)
                .unwrap();
        assert_eq!(sparse_cols.empty_cols().unwrap(), 2);
    }

    #[test]
    fn test_operand_shape_mismatch() {
        let matrix = create_test_matrix(2);
        let err = matrix.right_multiply(&DMatrix::zeros(4, 2)).unwrap_err();
        assert!(matches!(err, LeverageError::InvalidParameter { .. }));

        let wrong_layout = PartitionedDense::new(vec![DMatrix::zeros(4, 2)], 2).unwrap();
        let err = matrix.transpose_multiply(&wrong_layout).unwrap_err();
        assert!(matches!(err, LeverageError::InvalidParameter { .. }));

        // block narrower than the declared width
        let single = create_test_matrix(1);
        let narrow = PartitionedDense::new(vec![DMatrix::zeros(4, 1)], 3);
        assert!(matches!(narrow, Err(LeverageError::InvalidParameter { name: "dense", .. })));

        let parts = single.right_multiply(&DMatrix::from_element(3, 2, 1.0)).unwrap();
        assert!(matches!(
            single.transpose_multiply_scaled(&parts, 0.0),
            Err(LeverageError::InvalidParameter { name: "scale", .. })
        ));
    }

    #[test]
    fn test_scaled_products_stay_finite() {
        let base = create_test_matrix(1).to_dense();
        let huge = base.map(|v| v * 1e300);
        let triplets: Vec<(usize, usize, f64)> = (0..4)
            .flat_map(|i| (0..3).map(move |j| (i, j)))
            .filter(|&(i, j)| huge[(i, j)] != 0.0)
            .map(|(i, j)| (i, j, huge[(i, j)]))
            .collect();
        let matrix = PartitionedSparseMatrix::from_triplets("huge", 4, 3, triplets, 2).unwrap();
        let scale = matrix.max_abs();
        assert_abs_diff_eq!(scale / 1e300, 6.0, epsilon = 1e-12);

        let y = DMatrix::from_element(3, 2, 1e10);
        let product = matrix.right_multiply_scaled(&y, scale).unwrap().gather(&matrix);
        let expected = &base * &y / 6.0;
        for (a, b) in product.iter().zip(expected.iter()) {
            assert!(a.is_finite());
            assert_abs_diff_eq!(a / 1e10, b / 1e10, epsilon = 1e-12);
        }

        let parts = PartitionedDense::scatter(&DMatrix::from_element(4, 1, 1e10), &matrix).unwrap();
        let back = matrix.transpose_multiply_scaled(&parts, scale).unwrap();
        assert!(back.iter().all(|v| v.is_finite()));
        assert_abs_diff_eq!(back[(1, 0)] / 1e10, 1.5, epsilon = 1e-12);
    }

    #[test]
    fn test_construction_invariants() {
        let missing = PartitionedSparseMatrix::new("m", 3, 2, vec![vec![(0, vec![])]]);
        assert!(matches!(missing, Err(LeverageError::InvalidMatrix(_))));

        let duplicate_row = PartitionedSparseMatrix::new(
            "m",
            1,
            2,
            vec![vec![(0, vec![])], vec![(0, vec![])]],
        );
        assert!(matches!(duplicate_row, Err(LeverageError::InvalidMatrix(_))));

        let duplicate_col =
            PartitionedSparseMatrix::from_triplets("m", 2, 2, vec![(0, 1, 1.0), (0, 1, 2.0)], 1);
        assert!(matches!(duplicate_col, Err(LeverageError::InvalidMatrix(_))));

        let col_range = PartitionedSparseMatrix::from_triplets("m", 2, 2, vec![(0, 2, 1.0)], 1);
        assert!(matches!(col_range, Err(LeverageError::InvalidMatrix(_))));

        let row_range = PartitionedSparseMatrix::from_triplets("m", 2, 2, vec![(5, 0, 1.0)], 1);
        assert!(matches!(row_range, Err(LeverageError::InvalidMatrix(_))));

        let nan = PartitionedSparseMatrix::from_triplets("m", 2, 2, vec![(0, 0, f64::NAN)], 1);
        assert!(matches!(nan, Err(LeverageError::InvalidMatrix(_))));

        let empty_shape = PartitionedSparseMatrix::from_triplets("m", 0, 2, vec![], 1);
        assert!(matches!(empty_shape, Err(LeverageError::InvalidMatrix(_))));

        let no_partitions = PartitionedSparseMatrix::from_triplets("m", 2, 2, vec![], 0);
        assert!(matches!(
            no_partitions,
            Err(LeverageError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_from_csr_and_transpose() {
        let mut coo = CooMatrix::new(3, 5);
        coo.push(0, 4, 1.5);
        coo.push(1, 0, -2.0);
        coo.push(2, 2, 3.0);
        coo.push(2, 4, 0.5);
        let csr = CsrMatrix::from(&coo);

        let matrix = PartitionedSparseMatrix::from_csr("csr", &csr, 2).unwrap();
        assert_eq!(matrix.shape(), (3, 5));
        assert_eq!(matrix.nnz(), 4);

        let transposed = matrix.transpose(3).unwrap();
        assert_eq!(transposed.shape(), (5, 3));
        assert_eq!(transposed.name(), "csr^T");
        assert_eq!(transposed.to_dense(), matrix.to_dense().transpose());
    }

    #[test]
    fn test_repeated_products_are_identical() {
        let matrix = create_test_matrix(3);
        let operand =
            DMatrix::from_row_slice(4, 2, &[0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8]);
        let scattered = PartitionedDense::scatter(&operand, &matrix).unwrap();

        let first = matrix.transpose_multiply(&scattered).unwrap();
        let second = matrix.transpose_multiply(&scattered).unwrap();
        assert_eq!(first, second);
    }
}
