use std::ops::AddAssign;

use num_traits::{Float, NumCast, PrimInt, Unsigned, Zero};

use crate::error::Result;

pub mod csr;
mod partitioned;

pub use partitioned::{PartitionedSparseMatrix, SparsePartition, SparseRow};

pub trait MatrixNonZero {
    fn nonzero_col<T>(&self) -> Result<Vec<T>>
    where
        T: PrimInt + Unsigned + Zero + AddAssign;

    fn nonzero_row<T>(&self) -> Result<Vec<T>>
    where
        T: PrimInt + Unsigned + Zero + AddAssign;
}

/// Squared-magnitude sums, the building block for Frobenius norms.
pub trait MatrixSum {
    type Item: NumCast;

    fn sum_squares_row<T>(&self) -> Result<Vec<T>>
    where
        T: Float + NumCast + AddAssign + std::iter::Sum;
}
