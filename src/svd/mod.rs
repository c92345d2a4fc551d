use std::cmp::Ordering;

use nalgebra::{DMatrix, DVector};

use crate::error::{LeverageError, Result};

/// Dense SVD backend for the small coordinator-side matrix.
pub trait SVDImplementation: Send + Sync {
    fn compute(&self, matrix: &DMatrix<f64>) -> Result<SVD>;
}

/// Thin SVD with singular triplets sorted by decreasing singular value.
#[derive(Debug, Clone)]
pub struct SVD {
    u: DMatrix<f64>,
    s: DVector<f64>,
    vt: DMatrix<f64>,
}

impl SVD {
    /// Builds from possibly unordered factors, reordering them so that `s` is
    /// non-increasing.
    pub fn from_parts(u: DMatrix<f64>, s: DVector<f64>, vt: DMatrix<f64>) -> Self {
        let mut order: Vec<usize> = (0..s.len()).collect();
        order.sort_by(|&a, &b| s[b].partial_cmp(&s[a]).unwrap_or(Ordering::Equal));

        SVD {
            u: u.select_columns(order.iter()),
            s: DVector::from_iterator(order.len(), order.iter().map(|&i| s[i])),
            vt: vt.select_rows(order.iter()),
        }
    }

    pub fn u(&self) -> &DMatrix<f64> {
        &self.u
    }

    pub fn s(&self) -> &DVector<f64> {
        &self.s
    }

    pub fn vt(&self) -> &DMatrix<f64> {
        &self.vt
    }
}

/// Golub-Kahan SVD from nalgebra.
#[derive(Debug, Clone, Copy)]
pub struct NalgebraSVD {
    /// Iteration cap for the bidiagonal solver; 0 runs until convergence.
    pub max_iterations: usize,
}

impl Default for NalgebraSVD {
    fn default() -> Self {
        NalgebraSVD { max_iterations: 0 }
    }
}

impl SVDImplementation for NalgebraSVD {
    fn compute(&self, matrix: &DMatrix<f64>) -> Result<SVD> {
        if matrix.iter().any(|v| !v.is_finite()) {
            return Err(LeverageError::NumericalDegeneracy(
                "SVD input contains non-finite values".to_string(),
            ));
        }

        let svd = matrix
            .clone()
            .try_svd(true, true, f64::EPSILON, self.max_iterations)
            .ok_or_else(|| {
                LeverageError::NumericalDegeneracy(format!(
                    "SVD of the {} x {} projection did not converge",
                    matrix.nrows(),
                    matrix.ncols()
                ))
            })?;

        let u = svd.u.ok_or_else(|| {
            LeverageError::NumericalDegeneracy("SVD U computation failed".to_string())
        })?;
        let vt = svd.v_t.ok_or_else(|| {
            LeverageError::NumericalDegeneracy("SVD V_t computation failed".to_string())
        })?;

        Ok(SVD::from_parts(u, svd.singular_values, vt))
    }
}
