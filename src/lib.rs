pub mod dense;
pub mod error;
pub mod leverage;
pub mod random;
pub mod sparse;
pub mod subspace;
pub mod svd;
mod utils;

pub use error::{LeverageError, Result};
pub use leverage::{get_lev, LeverageScoreEngine, LeverageScoreEngineBuilder, LeverageScores};
pub use sparse::PartitionedSparseMatrix;
pub use utils::Direction;
