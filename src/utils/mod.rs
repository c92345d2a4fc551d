use crate::error::LeverageError;

/// Orientation of a leverage computation.
///
/// `ROW` scores the rows of the matrix (integer axis 0), `COLUMN` scores the
/// columns (integer axis 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    ROW,
    COLUMN,
}

impl Direction {
    pub fn axis(self) -> i64 {
        match self {
            Direction::ROW => 0,
            Direction::COLUMN => 1,
        }
    }
}

impl TryFrom<i64> for Direction {
    type Error = LeverageError;

    fn try_from(axis: i64) -> Result<Self, Self::Error> {
        match axis {
            0 => Ok(Direction::ROW),
            1 => Ok(Direction::COLUMN),
            other => Err(LeverageError::invalid_parameter(
                "axis",
                format!("expected 0 (rows) or 1 (columns), got {}", other),
            )),
        }
    }
}
