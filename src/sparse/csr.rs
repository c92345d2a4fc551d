use std::ops::AddAssign;

use nalgebra::Scalar;
use nalgebra_sparse::CsrMatrix;
use num_traits::{Float, NumCast, PrimInt, Unsigned, Zero};

use crate::error::{LeverageError, Result};

use super::{MatrixNonZero, MatrixSum};

fn cast<S: NumCast, T: NumCast>(value: S) -> Result<T> {
    T::from(value).ok_or_else(|| {
        LeverageError::InvalidMatrix("value does not fit the requested numeric type".to_string())
    })
}

impl<M: Scalar + NumCast + Copy> MatrixNonZero for CsrMatrix<M> {
    fn nonzero_col<T>(&self) -> Result<Vec<T>>
    where
        T: PrimInt + Unsigned + Zero + AddAssign,
    {
        let mut result = vec![T::zero(); self.ncols()];
        for &col_index in self.col_indices() {
            result[col_index] += T::one();
        }
        Ok(result)
    }

    fn nonzero_row<T>(&self) -> Result<Vec<T>>
    where
        T: PrimInt + Unsigned + Zero + AddAssign,
    {
        self.row_offsets()
            .windows(2)
            .map(|window| cast(window[1] - window[0]))
            .collect()
    }
}

impl<M: Scalar + NumCast + Copy> MatrixSum for CsrMatrix<M> {
    type Item = M;

    fn sum_squares_row<T>(&self) -> Result<Vec<T>>
    where
        T: Float + NumCast + AddAssign + std::iter::Sum,
    {
        let mut result = Vec::with_capacity(self.nrows());
        for row in self.row_iter() {
            let mut acc = T::zero();
            for &value in row.values() {
                let value: T = cast(value)?;
                acc += value * value;
            }
            result.push(acc);
        }
        Ok(result)
    }
}
