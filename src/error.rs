// =============================================================================
// Pipeline error taxonomy
// =============================================================================
//
// Every per-portfolio failure maps onto one of these kinds. None of them is
// fatal for a tick; the scheduler converts each into a result record and
// moves on. Trigger-level authentication failures live in `api::auth`.
// =============================================================================

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PipelineError {
    /// Chain read failed, timed out, or returned degenerate data.
    #[error("data unavailable: {0}")]
    DataUnavailable(String),

    /// Transaction reverted, RPC error, or submission timeout.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// Portfolio config is missing or has out-of-range fields.
    #[error("invalid config: {0}")]
    ConfigInvalid(String),
}

impl PipelineError {
    /// Taxonomy name reported to callers.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DataUnavailable(_) => "DataUnavailable",
            Self::ExecutionFailed(_) => "ExecutionFailed",
            Self::ConfigInvalid(_) => "ConfigInvalid",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_message() {
        let e = PipelineError::DataUnavailable("total value is zero".into());
        assert_eq!(e.to_string(), "data unavailable: total value is zero");
        assert_eq!(e.kind(), "DataUnavailable");
    }
}
