// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Buffer allocation failed for pool '{pool}': {reason}")]
    AllocFailure { pool: String, reason: String },

    #[error("No buffer available in pool '{pool}'")]
    NoBufferAvailable { pool: String },

    #[error("Timed out waiting on queue '{queue}' after {waited_ms}ms")]
    QueueTimeout { queue: String, waited_ms: u64 },

    #[error("Illegal entity transition: {0}")]
    EntityState(String),

    #[error("No frame selected for stage {stage} after {attempts} attempts")]
    SelectionMiss { stage: u32, attempts: u32 },

    #[error("Buffer state error in pool '{pool}': {reason}")]
    BufferState { pool: String, reason: String },

    #[error("Frame graph error: {0}")]
    Graph(String),

    #[error("Stage '{stage}' failed: {reason}")]
    Stage { stage: String, reason: String },

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    /// Errors that callers recover from locally (retry, back off, or drop the cycle).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PipelineError::NoBufferAvailable { .. }
                | PipelineError::QueueTimeout { .. }
                | PipelineError::SelectionMiss { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(PipelineError::NoBufferAvailable { pool: "raw".into() }.is_transient());
        assert!(
            PipelineError::QueueTimeout {
                queue: "isp".into(),
                waited_ms: 66
            }
            .is_transient()
        );
        assert!(
            PipelineError::SelectionMiss {
                stage: 1,
                attempts: 3
            }
            .is_transient()
        );
        assert!(!PipelineError::EntityState("bad".into()).is_transient());
        assert!(!PipelineError::Configuration("bad".into()).is_transient());
    }

    #[test]
    fn test_display_includes_pool_name() {
        let err = PipelineError::AllocFailure {
            pool: "sensor".into(),
            reason: "out of memory".into(),
        };
        assert_eq!(
            err.to_string(),
            "Buffer allocation failed for pool 'sensor': out of memory"
        );
    }
}
