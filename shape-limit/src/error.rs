use crate::store::StoreError;

/// Errors produced while shaping traffic.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ShapeError {
    /// The shaper could not be constructed from the supplied options.
    ///
    /// No partially initialised shaper is ever returned alongside this error.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A call-time parameter was rejected.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A counter was set to a value outside of its bounds.
    #[error("value {0} is out of range")]
    OutOfRange(i64),

    /// The coordination store failed one or more operations.
    ///
    /// A batch with any failed sub-command is reported as a whole.
    #[error("coordination store unavailable: {0}")]
    StoreUnavailable(String),

    /// A round trip exceeded the configured timeout.
    #[error("timed out waiting for the coordination store")]
    Timeout,

    /// No shaping decision could be made because the store failed upstream.
    #[error("shaping decision unavailable: {0}")]
    ShapingUnavailable(Box<ShapeError>),
}

impl ShapeError {
    /// Wrap store failures so callers can tell a missing decision from a bad call.
    ///
    /// Timeouts and argument errors pass through untouched.
    pub(crate) fn unavailable(self) -> Self {
        match self {
            err @ ShapeError::StoreUnavailable(_) => ShapeError::ShapingUnavailable(Box::new(err)),
            other => other,
        }
    }
}

impl From<StoreError> for ShapeError {
    fn from(err: StoreError) -> Self {
        ShapeError::StoreUnavailable(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for ShapeError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ShapeError::Timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_become_unavailable_decisions() {
        let err: ShapeError = StoreError::Command("WRONGTYPE".to_string()).into();
        assert!(matches!(err, ShapeError::StoreUnavailable(_)));

        let wrapped = err.clone().unavailable();
        assert_eq!(wrapped, ShapeError::ShapingUnavailable(Box::new(err)));

        assert_eq!(ShapeError::Timeout.unavailable(), ShapeError::Timeout);
    }
}
