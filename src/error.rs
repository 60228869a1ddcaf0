use std::fmt;

use serde::Serialize;

/// Errors from the framed byte channel.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel is past end-of-stream")]
    AlreadyClosed,
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("peer endpoint closed")]
    PeerClosed,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors returned by stage predicates and workers.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
    #[error("{0}")]
    Failed(String),
    #[error("stage worker panicked: {0}")]
    Panicked(String),
    #[error("worker pool is shut down")]
    PoolClosed,
}

impl StageError {
    /// A user-domain failure with the given message.
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// Kind of a failure recorded on a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureKind {
    /// A stage worker returned an error or panicked.
    Worker,
    /// A stage predicate returned an error.
    Predicate,
    /// The last stage requested pairing with a non-existent successor.
    PairedLastStage,
    /// Controller-internal inconsistency.
    Internal,
    /// The pipeline shut down with the item still in flight.
    ShutDown,
}

/// An error descriptor accumulated on a work item's failure list.
///
/// Failures are plain data so finalized items can be cloned, compared, and
/// reported after the fact; the originating error is captured as a message.
#[derive(Debug, Clone, Serialize)]
pub struct StageFailure {
    /// Stage the failure occurred in, when attributable to one.
    pub stage: Option<usize>,
    pub kind: FailureKind,
    pub message: String,
}

impl StageFailure {
    pub(crate) fn at(stage: usize, kind: FailureKind, err: &dyn fmt::Display) -> Self {
        Self {
            stage: Some(stage),
            kind,
            message: err.to_string(),
        }
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        Self {
            stage: None,
            kind: FailureKind::Internal,
            message: message.into(),
        }
    }
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.stage {
            Some(stage) => write!(f, "stage {stage}: {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for StageFailure {}

/// Top-level pipeline error.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
    #[error("stage error: {0}")]
    Stage(#[from] StageError),
    #[error("work item failed: {0}")]
    WorkFailed(StageFailure),
    #[error("stage {stage} is the last stage and cannot pair with a successor")]
    PairedLastStage { stage: usize },
    #[error("invalid pipeline state: {0}")]
    InvalidState(String),
    #[error("pipeline is shut down")]
    ShutDown,
    #[error("pipeline controller terminated before completing the work item")]
    ControllerGone,
}

/// Kind of a controller-observed anomaly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AnomalyKind {
    Exception,
}

/// A non-fatal inconsistency observed by the controller, recorded for
/// post-mortem inspection.
#[derive(Debug, Clone, Serialize)]
pub struct Anomaly {
    pub kind: AnomalyKind,
    pub message: String,
    pub error: Option<String>,
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, PipelineError>;
