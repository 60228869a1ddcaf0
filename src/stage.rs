use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::StageError;
use crate::item::WorkItem;

/// Keyword bag handed to a stage worker: the stage-fixed entries overlaid by
/// the item's per-submission entries (item entries win).
pub type StageParams = Map<String, Value>;

/// Where a stage's worker runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// On one of the bounded worker pools.
    Pooled,
    /// Directly on the runtime, unbounded.
    Inline,
}

/// A pipeline stage: a predicate deciding whether the stage wants a work
/// item, and a worker performing the stage's work on a copy of it.
#[async_trait]
pub trait Stage<P>: Send + Sync {
    /// Whether this stage wants to run `item`.
    ///
    /// May be asked several times for the same item across controller
    /// iterations, so it should not carry side effects. Returning an error
    /// fails the item and finalizes it without running any later stage.
    fn accepts(&self, item: &WorkItem<P>) -> Result<bool, StageError>;

    /// Perform the stage's work.
    ///
    /// `item` is a per-stage copy of the tracked item (carrying the pipe
    /// endpoint during a paired run); the worker mutates and returns it.
    async fn run(&self, item: WorkItem<P>, params: StageParams)
        -> Result<WorkItem<P>, StageError>;

    fn placement(&self) -> Placement {
        Placement::Pooled
    }

    /// Whether this stage wants to run paired with its immediate successor,
    /// streaming bytes to it over a channel that lives for the joint duration
    /// of both stages. The last stage must not request pairing.
    fn pairs_with_next(&self) -> bool {
        false
    }

    /// Stage-fixed keyword arguments, merged under the item's own.
    fn params(&self) -> StageParams {
        StageParams::new()
    }
}

type BoxPredicate<P> = Box<dyn Fn(&WorkItem<P>) -> Result<bool, StageError> + Send + Sync>;
type BoxWorker<P> = Box<
    dyn Fn(
            WorkItem<P>,
            StageParams,
        ) -> Pin<Box<dyn Future<Output = Result<WorkItem<P>, StageError>> + Send>>
        + Send
        + Sync,
>;

/// Closure-backed [`Stage`] for callers that do not need a hand-written impl.
///
/// ```
/// use workpipe::{FnStage, WorkItem};
///
/// let stage = FnStage::inline(|mut item: WorkItem<String>, _params| async move {
///     item.payload.push('!');
///     Ok(item)
/// })
/// .accept_when(|item| !item.payload.is_empty());
/// # let _ = stage;
/// ```
pub struct FnStage<P> {
    accepts: BoxPredicate<P>,
    worker: BoxWorker<P>,
    placement: Placement,
    pairs_with_next: bool,
    params: StageParams,
}

impl<P: Send + 'static> FnStage<P> {
    /// A stage running `worker` on a bounded worker pool, accepting every
    /// item until a predicate is installed.
    pub fn pooled<F, Fut>(worker: F) -> Self
    where
        F: Fn(WorkItem<P>, StageParams) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<WorkItem<P>, StageError>> + Send + 'static,
    {
        Self::with_placement(Placement::Pooled, worker)
    }

    /// A stage running `worker` inline on the runtime.
    pub fn inline<F, Fut>(worker: F) -> Self
    where
        F: Fn(WorkItem<P>, StageParams) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<WorkItem<P>, StageError>> + Send + 'static,
    {
        Self::with_placement(Placement::Inline, worker)
    }

    fn with_placement<F, Fut>(placement: Placement, worker: F) -> Self
    where
        F: Fn(WorkItem<P>, StageParams) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<WorkItem<P>, StageError>> + Send + 'static,
    {
        Self {
            accepts: Box::new(|_| Ok(true)),
            worker: Box::new(move |item, params| Box::pin(worker(item, params))),
            placement,
            pairs_with_next: false,
            params: StageParams::new(),
        }
    }

    /// Install an infallible predicate.
    pub fn accept_when<F>(mut self, pred: F) -> Self
    where
        F: Fn(&WorkItem<P>) -> bool + Send + Sync + 'static,
    {
        self.accepts = Box::new(move |item| Ok(pred(item)));
        self
    }

    /// Install a fallible predicate.
    pub fn accept_with<F>(mut self, pred: F) -> Self
    where
        F: Fn(&WorkItem<P>) -> Result<bool, StageError> + Send + Sync + 'static,
    {
        self.accepts = Box::new(pred);
        self
    }

    /// Request a paired run with the immediate successor stage.
    pub fn paired(mut self) -> Self {
        self.pairs_with_next = true;
        self
    }

    /// Add a stage-fixed keyword argument.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

#[async_trait]
impl<P: Send + 'static> Stage<P> for FnStage<P> {
    fn accepts(&self, item: &WorkItem<P>) -> Result<bool, StageError> {
        (self.accepts)(item)
    }

    async fn run(
        &self,
        item: WorkItem<P>,
        params: StageParams,
    ) -> Result<WorkItem<P>, StageError> {
        (self.worker)(item, params).await
    }

    fn placement(&self) -> Placement {
        self.placement
    }

    fn pairs_with_next(&self) -> bool {
        self.pairs_with_next
    }

    fn params(&self) -> StageParams {
        self.params.clone()
    }
}
