use std::fmt;

use serde_json::{Map, Value};
use tracing::debug;

use crate::channel::{PipeReader, PipeWriter};
use crate::error::StageFailure;

/// Endpoint of the paired-stage byte channel, carried only by the per-stage
/// copy of a work item.
pub(crate) enum PipeEnd {
    /// Producer half, handed to the upstream stage of a paired run.
    Writer(PipeWriter),
    /// Consumer half, handed to the downstream stage of a paired run.
    Reader(PipeReader),
}

/// A unit of work traversing the pipeline stages.
///
/// The caller constructs an item and hands ownership to
/// [`Pipeline::submit`](crate::Pipeline::submit); the finalized item comes
/// back through the completion handle. Each stage runs against a copy; the
/// controller merges the copy's payload (and, with auto-merge on, its
/// `extras`) back into the tracked instance when the stage settles, so a
/// later stage and the caller both see what the earlier stage produced.
pub struct WorkItem<P> {
    stage: usize,
    /// The caller's payload; always copied back from a stage's result.
    pub payload: P,
    params: Map<String, Value>,
    failures: Vec<StageFailure>,
    pipe: Option<PipeEnd>,
    auto_merge: bool,
    extras: Map<String, Value>,
}

impl<P> WorkItem<P> {
    pub fn new(payload: P) -> Self {
        Self {
            stage: 0,
            payload,
            params: Map::new(),
            failures: Vec::new(),
            pipe: None,
            auto_merge: true,
            extras: Map::new(),
        }
    }

    /// Add a per-item keyword argument, overlaid on the stage-fixed ones when
    /// the worker runs.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Control whether a stage copy's `extras` are merged back on completion.
    /// Defaults to on; callers with cross-stage invariants turn it off and
    /// carry state in the payload instead.
    pub fn with_auto_merge(mut self, on: bool) -> Self {
        self.auto_merge = on;
        self
    }

    /// Index of the next stage to consider; terminal once it reaches the
    /// number of stages.
    pub fn stage(&self) -> usize {
        self.stage
    }

    pub fn params(&self) -> &Map<String, Value> {
        &self.params
    }

    pub fn auto_merge(&self) -> bool {
        self.auto_merge
    }

    pub fn set_auto_merge(&mut self, on: bool) {
        self.auto_merge = on;
    }

    /// True once any failure has been recorded.
    pub fn is_failed(&self) -> bool {
        !self.failures.is_empty()
    }

    pub fn failures(&self) -> &[StageFailure] {
        &self.failures
    }

    pub fn first_failure(&self) -> Option<&StageFailure> {
        self.failures.first()
    }

    /// Record a failure. The item is failed from the first call on.
    pub fn push_failure(&mut self, failure: StageFailure) {
        self.failures.push(failure);
    }

    /// Set a scratch value carried back to the tracked item under auto-merge.
    pub fn set_extra(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.extras.insert(key.into(), value.into());
    }

    pub fn extra(&self, key: &str) -> Option<&Value> {
        self.extras.get(key)
    }

    pub fn extras(&self) -> &Map<String, Value> {
        &self.extras
    }

    /// Claim the producer end of the paired channel, if this copy carries one.
    pub fn take_pipe_writer(&mut self) -> Option<PipeWriter> {
        match self.pipe.take() {
            Some(PipeEnd::Writer(writer)) => Some(writer),
            other => {
                self.pipe = other;
                None
            }
        }
    }

    /// Claim the consumer end of the paired channel, if this copy carries one.
    pub fn take_pipe_reader(&mut self) -> Option<PipeReader> {
        match self.pipe.take() {
            Some(PipeEnd::Reader(reader)) => Some(reader),
            other => {
                self.pipe = other;
                None
            }
        }
    }

    pub(crate) fn advance(&mut self) {
        self.stage += 1;
    }

    /// Fold a settled stage execution into this (tracked) instance.
    ///
    /// An `Err` outcome means the execution produced no result item: the
    /// failure is appended and nothing else changes. An `Ok` outcome merges
    /// the stage copy back: its own failures extend the list, its payload is
    /// always taken, and its extras are merged when auto-merge is on. The
    /// bookkeeping fields (stage index, params, pipe endpoint, the flag
    /// itself) are never merged.
    pub(crate) fn stage_complete(
        &mut self,
        stage: usize,
        outcome: Result<WorkItem<P>, StageFailure>,
    ) {
        match outcome {
            Err(failure) => {
                debug!(stage, error = %failure, "stage completed with failure");
                self.failures.push(failure);
            }
            Ok(mut result) => {
                debug!(stage, failed = result.is_failed(), "stage completed");
                result.pipe = None;
                if result.is_failed() {
                    self.failures.append(&mut result.failures);
                }
                self.payload = result.payload;
                if self.auto_merge {
                    for (key, value) in result.extras {
                        self.extras.insert(key, value);
                    }
                }
            }
        }
    }
}

impl<P: Clone> WorkItem<P> {
    /// Shallow copy handed to a stage worker, with the pipe endpoint for this
    /// execution installed. The tracked instance never holds an endpoint.
    pub(crate) fn clone_for_stage(&self, pipe: Option<PipeEnd>) -> Self {
        Self {
            stage: self.stage,
            payload: self.payload.clone(),
            params: self.params.clone(),
            failures: self.failures.clone(),
            pipe,
            auto_merge: self.auto_merge,
            extras: self.extras.clone(),
        }
    }
}

impl<P: fmt::Debug> fmt::Debug for WorkItem<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem")
            .field("stage", &self.stage)
            .field("payload", &self.payload)
            .field("failures", &self.failures)
            .field("has_pipe", &self.pipe.is_some())
            .field("auto_merge", &self.auto_merge)
            .finish()
    }
}
