//! # Leverage scores
//!
//! Approximate statistical leverage scores of the rows or columns of a
//! [`PartitionedSparseMatrix`], and the sampling distribution obtained by
//! dividing them by the target rank. These feed CX-style row/column subset
//! selection.
//!
//! The pipeline is the randomized range finder: seed with a Gaussian
//! projection, run `q` rounds of orthonormalized power iteration, project the
//! matrix onto the resulting basis, take a small dense SVD on the coordinator
//! and keep the leading `k` directions.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use log::{debug, info, warn};
use nalgebra::DMatrix;
use ndarray::Array1;
use rayon::ThreadPoolBuilder;

use crate::error::{LeverageError, Result};
use crate::random::RandomProjector;
use crate::sparse::PartitionedSparseMatrix;
use crate::subspace::{OrientedOperator, SubspaceIterator};
use crate::svd::{NalgebraSVD, SVDImplementation};
use crate::Direction;

pub const DEFAULT_SEED: u64 = 42;
pub const DEFAULT_OVERSAMPLING: usize = 0;
pub const DEFAULT_RANK_TOLERANCE: f64 = 1e-10;
pub const DEFAULT_MAX_COORDINATOR_BYTES: usize = 1 << 30;

/// Scores and sampling probabilities for one orientation.
#[derive(Debug, Clone, PartialEq)]
pub struct LeverageScores {
    scores: Array1<f64>,
    probabilities: Array1<f64>,
    k: usize,
    width: usize,
    direction: Direction,
    singular_values: Array1<f64>,
}

impl LeverageScores {
    /// One non-negative score per row (or column); sums to about `k`.
    pub fn scores(&self) -> &Array1<f64> {
        &self.scores
    }

    /// `scores / k`; sums to one.
    pub fn probabilities(&self) -> &Array1<f64> {
        &self.probabilities
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// Projection width actually used (`k` plus the effective oversampling).
    pub fn width(&self) -> usize {
        self.width
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Singular values of the projected matrix, descending. The first `k` are
    /// estimates of the leading singular values of the input.
    pub fn singular_values(&self) -> &Array1<f64> {
        &self.singular_values
    }

    pub fn into_parts(self) -> (Array1<f64>, Array1<f64>) {
        (self.scores, self.probabilities)
    }
}

/// Leverage-score engine bound to one matrix.
///
/// The matrix is borrowed for the engine's lifetime and read once per power
/// iteration; nothing computed in one call is kept for the next.
pub struct LeverageScoreEngine<'a, S: SVDImplementation = NalgebraSVD> {
    matrix: &'a PartitionedSparseMatrix,
    seed: u64,
    oversampling: usize,
    rank_tolerance: f64,
    max_coordinator_bytes: usize,
    num_threads: Option<usize>,
    cancel_flag: Option<Arc<AtomicBool>>,
    svd_implementation: S,
}

impl<'a> LeverageScoreEngine<'a, NalgebraSVD> {
    /// Engine with the default configuration, see [`LeverageScoreEngineBuilder`].
    pub fn new(matrix: &'a PartitionedSparseMatrix) -> Self {
        LeverageScoreEngineBuilder::new().build(matrix)
    }
}

impl<'a, S: SVDImplementation> LeverageScoreEngine<'a, S> {
    pub fn matrix(&self) -> &PartitionedSparseMatrix {
        self.matrix
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn oversampling(&self) -> usize {
        self.oversampling
    }

    /// Integer-typed entry point.
    ///
    /// # Parameters
    /// - `k`: target rank, `1 <= k <= min(rows, cols)`
    /// - `axis`: 0 for row leverage, 1 for column leverage
    /// - `q`: number of power iterations, `q >= 0`
    ///
    /// # Returns
    /// `(scores, probabilities)`, each of length `rows` for axis 0 and `cols`
    /// for axis 1.
    pub fn get_lev(&self, k: i64, axis: i64, q: i64) -> Result<(Array1<f64>, Array1<f64>)> {
        let k = usize::try_from(k).map_err(|_| {
            LeverageError::invalid_parameter("k", format!("target rank must be positive, got {}", k))
        })?;
        let direction = Direction::try_from(axis)?;
        let q = usize::try_from(q).map_err(|_| {
            LeverageError::invalid_parameter(
                "q",
                format!("power iteration count must be non-negative, got {}", q),
            )
        })?;

        Ok(self.compute(k, direction, q)?.into_parts())
    }

    /// Typed entry point. Parameters are validated before any partition is
    /// touched.
    pub fn compute(&self, k: usize, direction: Direction, q: usize) -> Result<LeverageScores> {
        let (rows, cols) = self.matrix.shape();
        let min_dim = rows.min(cols);
        if k == 0 || k > min_dim {
            return Err(LeverageError::invalid_parameter(
                "k",
                format!(
                    "target rank must lie in [1, {}] for a {} x {} matrix, got {}",
                    min_dim, rows, cols, k
                ),
            ));
        }
        if !(self.rank_tolerance >= 0.0 && self.rank_tolerance < 1.0) {
            return Err(LeverageError::invalid_parameter(
                "rank_tolerance",
                format!("must lie in [0, 1), got {}", self.rank_tolerance),
            ));
        }

        let width = self.projection_width(k, min_dim);
        self.check_coordinator_budget(direction, k, width)?;

        match self.num_threads {
            Some(num_threads) => {
                let pool = ThreadPoolBuilder::new().num_threads(num_threads).build()?;
                pool.install(|| self.run(k, width, direction, q))
            }
            None => self.run(k, width, direction, q),
        }
    }

    fn projection_width(&self, k: usize, min_dim: usize) -> usize {
        let requested = k.saturating_add(self.oversampling);
        if requested > min_dim {
            warn!(
                "projection width {} (k={} + oversampling {}) exceeds min(rows, cols) = {}, clamping",
                requested, k, self.oversampling, min_dim
            );
            min_dim
        } else {
            requested
        }
    }

    /// Dense footprint on the coordinator: the basis and the current iterate
    /// on the scored axis, the iterate and the projection on the opposite
    /// axis, and the rank-`k` back-projection.
    fn check_coordinator_budget(&self, direction: Direction, k: usize, width: usize) -> Result<()> {
        let operator = OrientedOperator::new(self.matrix, direction);
        let (axis_len, dual_len) = (operator.axis_len(), operator.dual_len());

        let required = [
            axis_len.checked_mul(width),
            axis_len.checked_mul(width),
            dual_len.checked_mul(width),
            width.checked_mul(dual_len),
            axis_len.checked_mul(k),
        ]
        .into_iter()
        .try_fold(0usize, |acc, elements| elements.and_then(|e| acc.checked_add(e)))
        .and_then(|elements| elements.checked_mul(std::mem::size_of::<f64>()))
        .unwrap_or(usize::MAX);

        if required > self.max_coordinator_bytes {
            return Err(LeverageError::ResourceExhaustion {
                required,
                limit: self.max_coordinator_bytes,
            });
        }
        debug!(
            "coordinator footprint {} bytes (limit {})",
            required, self.max_coordinator_bytes
        );
        Ok(())
    }

    fn run(&self, k: usize, width: usize, direction: Direction, q: usize) -> Result<LeverageScores> {
        let matrix = self.matrix;
        let scale = matrix.max_abs();
        if scale == 0.0 {
            return Err(LeverageError::NumericalDegeneracy(format!(
                "matrix `{}` is all zero, leverage scores are undefined",
                matrix.name()
            )));
        }

        info!(
            "leverage scores for `{}` ({} x {}, {} nnz, {} partitions, {} empty rows, {} empty cols): k={}, width={}, q={}, axis={}",
            matrix.name(),
            matrix.rows(),
            matrix.cols(),
            matrix.nnz(),
            matrix.num_partitions(),
            matrix.empty_rows()?,
            matrix.empty_cols()?,
            k,
            width,
            q,
            direction.axis()
        );
        debug!(
            "max |a_ij| = {:e}, squared Frobenius norm = {:e}",
            scale,
            matrix.frobenius_norm_squared()?
        );

        // scores are scale invariant; iterate on A / max|a_ij|
        let operator = OrientedOperator::new(matrix, direction).with_scale(scale);
        let projector = RandomProjector::new(self.seed);
        let mut iterator = SubspaceIterator::new(q);
        if let Some(flag) = &self.cancel_flag {
            iterator = iterator.with_cancel_flag(Arc::clone(flag));
        }

        let basis = iterator.estimate(&operator, &projector, width)?;

        // B = Qᵀ A (or Qᵀ Aᵀ), width x dual_len
        let projection = operator.apply_adjoint(&basis)?.transpose();
        let svd = self.svd_implementation.compute(&projection)?;
        let singular_values = svd.s();

        let s_max = singular_values.iter().copied().next().unwrap_or(0.0);
        if !(s_max > 0.0) {
            return Err(LeverageError::NumericalDegeneracy(
                "projected matrix has no energy".to_string(),
            ));
        }
        if singular_values.len() < k || singular_values[k - 1] <= self.rank_tolerance * s_max {
            let s_k = singular_values.get(k - 1).copied().unwrap_or(0.0);
            return Err(LeverageError::NumericalDegeneracy(format!(
                "numerical rank of the projection is below k={} (sigma_k={:e}, sigma_1={:e})",
                k, s_k, s_max
            )));
        }
        debug!(
            "leading singular values of the projection: {:?}",
            &singular_values.as_slice()[..k]
        );

        let u_k: DMatrix<f64> = svd.u().columns(0, k).into_owned();
        let basis_k = &basis * &u_k;

        let scores = Array1::from_shape_fn(basis_k.nrows(), |i| basis_k.row(i).norm_squared());
        if scores.iter().any(|v| !v.is_finite()) {
            return Err(LeverageError::NumericalDegeneracy(
                "leverage scores contain non-finite values".to_string(),
            ));
        }
        let probabilities = &scores / k as f64;

        debug!(
            "leverage scores sum to {:.6} (k={}), probabilities to {:.6}",
            scores.sum(),
            k,
            probabilities.sum()
        );

        Ok(LeverageScores {
            scores,
            probabilities,
            k,
            width,
            direction,
            singular_values: Array1::from_iter(singular_values.iter().map(|v| v * scale)),
        })
    }
}

/// Builder for [`LeverageScoreEngine`].
///
/// Defaults:
/// - `seed`: 42
/// - `oversampling`: 0 (projection width equals `k`)
/// - `rank_tolerance`: 1e-10, relative to the largest projected singular value
/// - `max_coordinator_bytes`: 1 GiB
/// - `num_threads`: none, run on the global rayon pool
/// - `cancel_flag`: none
/// - `svd_implementation`: [`NalgebraSVD`]
///
/// ```ignore
/// let engine = LeverageScoreEngineBuilder::new()
///     .seed(7)
///     .oversampling(2)
///     .num_threads(8)
///     .build(&matrix);
/// let (lev, p) = engine.get_lev(2, 0, 2)?;
/// ```
pub struct LeverageScoreEngineBuilder<S: SVDImplementation = NalgebraSVD> {
    seed: u64,
    oversampling: usize,
    rank_tolerance: f64,
    max_coordinator_bytes: usize,
    num_threads: Option<usize>,
    cancel_flag: Option<Arc<AtomicBool>>,
    svd_implementation: S,
}

impl Default for LeverageScoreEngineBuilder<NalgebraSVD> {
    fn default() -> Self {
        Self {
            seed: DEFAULT_SEED,
            oversampling: DEFAULT_OVERSAMPLING,
            rank_tolerance: DEFAULT_RANK_TOLERANCE,
            max_coordinator_bytes: DEFAULT_MAX_COORDINATOR_BYTES,
            num_threads: None,
            cancel_flag: None,
            svd_implementation: NalgebraSVD::default(),
        }
    }
}

impl LeverageScoreEngineBuilder<NalgebraSVD> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<S: SVDImplementation> LeverageScoreEngineBuilder<S> {
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Extra projection columns beyond `k`. Clamped so the width never exceeds
    /// `min(rows, cols)`.
    pub fn oversampling(mut self, oversampling: usize) -> Self {
        self.oversampling = oversampling;
        self
    }

    pub fn rank_tolerance(mut self, rank_tolerance: f64) -> Self {
        self.rank_tolerance = rank_tolerance;
        self
    }

    pub fn max_coordinator_bytes(mut self, max_coordinator_bytes: usize) -> Self {
        self.max_coordinator_bytes = max_coordinator_bytes;
        self
    }

    /// Runs each computation on a dedicated rayon pool of this size.
    pub fn num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = Some(num_threads);
        self
    }

    pub fn cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel_flag = Some(flag);
        self
    }

    pub fn svd_implementation<T: SVDImplementation>(
        self,
        svd_implementation: T,
    ) -> LeverageScoreEngineBuilder<T> {
        LeverageScoreEngineBuilder {
            seed: self.seed,
            oversampling: self.oversampling,
            rank_tolerance: self.rank_tolerance,
            max_coordinator_bytes: self.max_coordinator_bytes,
            num_threads: self.num_threads,
            cancel_flag: self.cancel_flag,
            svd_implementation,
        }
    }

    pub fn build(self, matrix: &PartitionedSparseMatrix) -> LeverageScoreEngine<'_, S> {
        LeverageScoreEngine {
            matrix,
            seed: self.seed,
            oversampling: self.oversampling,
            rank_tolerance: self.rank_tolerance,
            max_coordinator_bytes: self.max_coordinator_bytes,
            num_threads: self.num_threads,
            cancel_flag: self.cancel_flag,
            svd_implementation: self.svd_implementation,
        }
    }
}

/// `get_lev` with the default engine configuration.
pub fn get_lev(
    matrix: &PartitionedSparseMatrix,
    k: i64,
    axis: i64,
    q: i64,
) -> Result<(Array1<f64>, Array1<f64>)> {
    LeverageScoreEngine::new(matrix).get_lev(k, axis, q)
}
