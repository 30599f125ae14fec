use crate::ShapeError;

/// Half of the largest integer that survives a round trip through an IEEE double.
///
/// Release sequences are compared across processes, so the bound is kept
/// well inside what every client of the coordination store can represent.
pub const MAX_SAFE_VALUE: i64 = ((1_i64 << 53) - 1) / 2;

/// A bounded counter that wraps instead of overflowing.
///
/// The value lives on a circle of circumference `2 * MAX_SAFE_VALUE`, where
/// `-MAX_SAFE_VALUE` and `MAX_SAFE_VALUE` name the same point. Two counters
/// that are close on the circle always report a small, correctly signed
/// [`diff`](SequenceCounter::diff), however many times they have wrapped.
///
/// There is no internal synchronisation: a counter has exactly one owner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequenceCounter {
    value: i64,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> i64 {
        self.value
    }

    /// Set the counter to `value`, which must lie strictly inside the bounds.
    pub fn set(&mut self, value: i64) -> Result<(), ShapeError> {
        if value >= MAX_SAFE_VALUE || value <= -MAX_SAFE_VALUE {
            return Err(ShapeError::OutOfRange(value));
        }
        self.value = value;
        Ok(())
    }

    /// Advance the counter by `by`, which must be in `1..MAX_SAFE_VALUE`.
    pub fn inc(&mut self, by: i64) -> Result<(), ShapeError> {
        if !(1..MAX_SAFE_VALUE).contains(&by) {
            return Err(ShapeError::InvalidArgument(format!(
                "inc by {by}: must be between 1 and {MAX_SAFE_VALUE}"
            )));
        }

        if self.value > 0 && MAX_SAFE_VALUE - self.value <= by {
            self.value = self.value + by - 2 * MAX_SAFE_VALUE;
        } else {
            self.value += by;
        }
        Ok(())
    }

    /// Move the counter back by `by`, which must be in `-MAX_SAFE_VALUE+1..=-1`.
    pub fn dec(&mut self, by: i64) -> Result<(), ShapeError> {
        if by > -1 || by <= -MAX_SAFE_VALUE {
            return Err(ShapeError::InvalidArgument(format!(
                "dec by {by}: must be between -1 and -{MAX_SAFE_VALUE}"
            )));
        }

        if self.value < 0 && -MAX_SAFE_VALUE - self.value >= by {
            self.value = self.value + by + 2 * MAX_SAFE_VALUE;
        } else {
            self.value += by;
        }
        Ok(())
    }

    /// Signed circular distance `self - other`.
    pub fn diff(&self, other: &SequenceCounter) -> i64 {
        let naive = self.value - other.value;

        if naive > MAX_SAFE_VALUE {
            naive - 2 * MAX_SAFE_VALUE
        } else if naive < -MAX_SAFE_VALUE {
            naive + 2 * MAX_SAFE_VALUE
        } else {
            naive
        }
    }

    /// A copy of this counter advanced by `by`, leaving `self` untouched.
    pub(crate) fn ahead_by(&self, by: i64) -> Result<SequenceCounter, ShapeError> {
        let mut target = *self;
        target.inc(by)?;
        Ok(target)
    }
}
