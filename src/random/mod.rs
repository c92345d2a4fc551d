//! Seeded Gaussian test matrices for the randomized range finder.

use nalgebra::DMatrix;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

use crate::error::{LeverageError, Result};

/// Draws `n x width` matrices of i.i.d. standard-normal entries.
///
/// The generator is reseeded from the explicit seed on every call, so the
/// same seed and shape always yield the same matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RandomProjector {
    seed: u64,
}

impl RandomProjector {
    pub fn new(seed: u64) -> Self {
        RandomProjector { seed }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn generate(&self, n: usize, width: usize) -> Result<DMatrix<f64>> {
        if n == 0 {
            return Err(LeverageError::invalid_parameter(
                "n",
                "projection needs a non-empty dimension",
            ));
        }
        if width == 0 {
            return Err(LeverageError::invalid_parameter(
                "width",
                "projection width must be at least 1",
            ));
        }

        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        // column-major, matching DMatrix storage
        let data: Vec<f64> = (0..n * width).map(|_| rng.sample(StandardNormal)).collect();
        Ok(DMatrix::from_vec(n, width, data))
    }
}
