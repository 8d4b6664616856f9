//! Exit codes for the CLI

use conveyor_core::{ConfigError, ConveyorError};
use conveyor_tasks::GraphError;

/// Success
pub const SUCCESS: i32 = 0;

/// General error
pub const ERROR: i32 = 1;

/// Configuration error (bad config, pattern, pipeline or cycle)
pub const CONFIG_ERROR: i32 = 2;

/// One or more tasks failed
pub const TASK_FAILURE: i32 = 3;

/// User cancelled
pub const CANCELLED: i32 = 130;

/// A run that finished without succeeding
#[derive(Debug, thiserror::Error)]
pub enum RunFailure {
    #[error("{failed} task(s) failed")]
    TasksFailed { failed: usize },

    #[error("run cancelled")]
    Cancelled,
}

/// Map an error to the process exit code
pub fn for_error(err: &anyhow::Error) -> i32 {
    if let Some(failure) = err.downcast_ref::<RunFailure>() {
        return match failure {
            RunFailure::TasksFailed { .. } => TASK_FAILURE,
            RunFailure::Cancelled => CANCELLED,
        };
    }

    let is_config = err.downcast_ref::<ConfigError>().is_some()
        || err.downcast_ref::<GraphError>().is_some()
        || matches!(
            err.downcast_ref::<ConveyorError>(),
            Some(ConveyorError::Config(_))
        );

    if is_config {
        CONFIG_ERROR
    } else {
        ERROR
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_failure_codes() {
        let err = anyhow::Error::new(RunFailure::TasksFailed { failed: 2 });
        assert_eq!(for_error(&err), TASK_FAILURE);
        assert_eq!(err.to_string(), "2 task(s) failed");

        let err = anyhow::Error::new(RunFailure::Cancelled);
        assert_eq!(for_error(&err), CANCELLED);
    }

    #[test]
    fn test_config_error_code() {
        let err = anyhow::Error::new(ConfigError::InvalidPattern {
            pattern: "[".to_string(),
            message: "unclosed".to_string(),
        });
        assert_eq!(for_error(&err), CONFIG_ERROR);

        let err = anyhow::Error::new(ConveyorError::Config(ConfigError::ParseError(
            "bad".to_string(),
        )));
        assert_eq!(for_error(&err), CONFIG_ERROR);
    }

    #[test]
    fn test_other_error_code() {
        let err = anyhow::anyhow!("boom");
        assert_eq!(for_error(&err), ERROR);
    }
}
