use std::collections::HashMap;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::channel;
use crate::error::{
    Anomaly, AnomalyKind, FailureKind, PipelineError, StageError, StageFailure,
};
use crate::item::{PipeEnd, WorkItem};
use crate::pool::PoolSet;
use crate::stage::{Placement, Stage};

/// Configuration for a [`Pipeline`].
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Name used in logging.
    pub name: String,
    /// Desired number of simultaneously running work items. Sizes each
    /// bounded worker pool to `max_simultaneous + 2`. This governs admission
    /// headroom, not pool depth: nothing bounds how many paired runs are
    /// admitted against it. `None` sizes the pools to the host's available
    /// parallelism.
    pub max_simultaneous: Option<usize>,
    /// Buffer capacity of the in-memory pipe behind a paired run's byte
    /// channel.
    pub pipe_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            name: "unnamed".into(),
            max_simultaneous: None,
            pipe_capacity: 64 * 1024,
        }
    }
}

type WorkId = u64;

/// Completion side of a submission. Resolves exactly once, when the item has
/// cleared the last stage or failed.
pub struct CompletionHandle<P> {
    rx: oneshot::Receiver<WorkItem<P>>,
    done: Option<WorkItem<P>>,
    gone: bool,
}

impl<P: std::fmt::Debug> std::fmt::Debug for CompletionHandle<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionHandle")
            .field("done", &self.done)
            .field("gone", &self.gone)
            .finish()
    }
}

impl<P> CompletionHandle<P> {
    fn new(rx: oneshot::Receiver<WorkItem<P>>) -> Self {
        Self {
            rx,
            done: None,
            gone: false,
        }
    }

    /// Whether the item has finalized (non-blocking).
    pub fn is_done(&mut self) -> bool {
        if self.done.is_some() || self.gone {
            return true;
        }
        match self.rx.try_recv() {
            Ok(item) => {
                self.done = Some(item);
                true
            }
            Err(oneshot::error::TryRecvError::Empty) => false,
            Err(oneshot::error::TryRecvError::Closed) => {
                self.gone = true;
                true
            }
        }
    }

    /// Wait for finalization and borrow the finalized item.
    pub async fn wait(&mut self) -> crate::error::Result<&WorkItem<P>> {
        if self.gone {
            return Err(PipelineError::ControllerGone);
        }
        if self.done.is_none() {
            match (&mut self.rx).await {
                Ok(item) => self.done = Some(item),
                Err(_) => {
                    self.gone = true;
                    return Err(PipelineError::ControllerGone);
                }
            }
        }
        match self.done.as_ref() {
            Some(item) => Ok(item),
            None => Err(PipelineError::ControllerGone),
        }
    }

    /// Wait for finalization and take the item, failed or not. The full
    /// failure list stays readable on it.
    pub async fn join(mut self) -> crate::error::Result<WorkItem<P>> {
        self.wait().await?;
        self.done.take().ok_or(PipelineError::ControllerGone)
    }

    /// Wait for finalization and take the item, or surface its first
    /// recorded failure as [`PipelineError::WorkFailed`].
    pub async fn result(mut self) -> crate::error::Result<WorkItem<P>> {
        self.wait().await?;
        let item = self.done.take().ok_or(PipelineError::ControllerGone)?;
        match item.first_failure() {
            Some(failure) => Err(PipelineError::WorkFailed(failure.clone())),
            None => Ok(item),
        }
    }

    /// First recorded failure, available non-blocking once finalized.
    pub fn failure(&self) -> Option<&StageFailure> {
        self.done.as_ref().and_then(|item| item.first_failure())
    }
}

/// Gauge of submitted-but-not-finalized items; `shutdown` waits on it.
#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    notify: Notify,
}

impl InFlight {
    fn add(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    fn done(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.notify.notify_waiters();
        }
    }

    fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    async fn wait_drained(&self) {
        loop {
            let notified = self.notify.notified();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

enum Submission<P> {
    Work {
        item: WorkItem<P>,
        done: oneshot::Sender<WorkItem<P>>,
    },
    Shutdown,
}

/// One settled (or settling) stage execution reported to the controller.
struct StageDone<P> {
    id: WorkId,
    stage: usize,
    outcome: Result<WorkItem<P>, StageError>,
}

/// An outstanding stage execution for a tracked item. Kept in stage order;
/// length 2 during a paired run.
struct StageRun<P> {
    stage: usize,
    outcome: Option<Result<WorkItem<P>, StageError>>,
}

struct Tracked<P> {
    item: WorkItem<P>,
    done: oneshot::Sender<WorkItem<P>>,
    runs: Vec<StageRun<P>>,
}

enum Lane {
    Inline,
    Primary,
    Secondary,
}

enum Ask {
    Accepted,
    Refused,
    Failed,
}

enum Settle {
    Unknown,
    NoSlot,
    Pending,
    AllSettled,
}

struct Controller<P> {
    name: String,
    stages: Arc<Vec<Box<dyn Stage<P>>>>,
    pools: Arc<PoolSet>,
    pipe_capacity: usize,
    sub_rx: mpsc::UnboundedReceiver<Submission<P>>,
    done_tx: mpsc::UnboundedSender<StageDone<P>>,
    done_rx: mpsc::UnboundedReceiver<StageDone<P>>,
    tracked: HashMap<WorkId, Tracked<P>>,
    next_id: WorkId,
    inflight: Arc<InFlight>,
    anomalies: Arc<Mutex<Vec<Anomaly>>>,
    graceful: Arc<AtomicBool>,
}

impl<P: Clone + Send + 'static> Controller<P> {
    async fn run(mut self) {
        match self.run_inner().await {
            Ok(()) => {
                self.graceful.store(true, Ordering::Release);
                info!(pipeline = %self.name, "controller exited cleanly");
            }
            Err(e) => {
                error!(
                    pipeline = %self.name,
                    error = %e,
                    "controller failed; failing all in-flight work items"
                );
                self.fail_all_pending(&e);
            }
        }
    }

    async fn run_inner(&mut self) -> crate::error::Result<()> {
        let mut sub_open = true;
        loop {
            // The submission side going away without a sentinel (the
            // pipeline was dropped) still lets in-flight work finish.
            if !sub_open && self.tracked.is_empty() {
                debug!(pipeline = %self.name, "submission queue closed and nothing tracked");
                break;
            }
            tokio::select! {
                biased;
                Some(done) = self.done_rx.recv() => {
                    if let Some(id) = self.on_stage_done(done) {
                        self.advance_item(id);
                    }
                }
                sub = self.sub_rx.recv(), if sub_open => match sub {
                    Some(Submission::Work { item, done }) => {
                        let id = self.admit(item, done);
                        self.advance_item(id);
                    }
                    Some(Submission::Shutdown) => {
                        debug!(pipeline = %self.name, "shutdown sentinel received");
                        break;
                    }
                    None => sub_open = false,
                },
            }
        }
        // Shutdown waits for the tracked table to drain before sending the
        // sentinel; anything still here raced that wait.
        if !self.tracked.is_empty() {
            self.record_anomaly(
                format!(
                    "shutdown with {} work items still tracked",
                    self.tracked.len()
                ),
                None,
            );
            let ids: Vec<WorkId> = self.tracked.keys().copied().collect();
            for id in ids {
                if let Some(tracked) = self.tracked.get_mut(&id) {
                    tracked.item.push_failure(StageFailure {
                        stage: None,
                        kind: FailureKind::ShutDown,
                        message: "pipeline shut down while the work item was in flight".into(),
                    });
                }
                self.finalize(id);
            }
        }
        Ok(())
    }

    fn admit(&mut self, item: WorkItem<P>, done: oneshot::Sender<WorkItem<P>>) -> WorkId {
        let id = self.next_id;
        self.next_id += 1;
        debug!(pipeline = %self.name, work = id, stage = item.stage(), "work item admitted");
        self.tracked.insert(
            id,
            Tracked {
                item,
                done,
                runs: Vec::new(),
            },
        );
        id
    }

    /// Settle the matching run slot. The item is touched only when every
    /// slot has settled: a pending paired partner defers the whole batch, so
    /// both halves of a paired run merge together and in stage order.
    fn on_stage_done(&mut self, done: StageDone<P>) -> Option<WorkId> {
        let StageDone { id, stage, outcome } = done;
        match self.settle_run(id, stage, outcome) {
            Settle::Unknown => {
                self.record_anomaly(
                    format!("completion for untracked work item {id} (stage {stage})"),
                    None,
                );
                None
            }
            Settle::NoSlot => {
                self.record_anomaly(
                    format!("completion without a matching execution: work item {id}, stage {stage}"),
                    None,
                );
                None
            }
            Settle::Pending => None,
            Settle::AllSettled => {
                self.merge_settled(id);
                Some(id)
            }
        }
    }

    fn settle_run(
        &mut self,
        id: WorkId,
        stage: usize,
        outcome: Result<WorkItem<P>, StageError>,
    ) -> Settle {
        let tracked = match self.tracked.get_mut(&id) {
            Some(tracked) => tracked,
            None => return Settle::Unknown,
        };
        let slot = tracked
            .runs
            .iter_mut()
            .find(|run| run.stage == stage && run.outcome.is_none());
        match slot {
            Some(run) => run.outcome = Some(outcome),
            None => return Settle::NoSlot,
        }
        if tracked.runs.iter().all(|run| run.outcome.is_some()) {
            Settle::AllSettled
        } else {
            Settle::Pending
        }
    }

    fn merge_settled(&mut self, id: WorkId) {
        let runs = match self.tracked.get_mut(&id) {
            Some(tracked) => mem::take(&mut tracked.runs),
            None => return,
        };
        for run in runs {
            let outcome = match run.outcome {
                Some(outcome) => outcome,
                None => continue,
            };
            let mapped = outcome
                .map_err(|e| StageFailure::at(run.stage, FailureKind::Worker, &e));
            if let Some(tracked) = self.tracked.get_mut(&id) {
                tracked.item.stage_complete(run.stage, mapped);
            }
        }
    }

    /// Walk the item forward from its current stage index and either submit
    /// it somewhere or finalize it. Called only when nothing is outstanding
    /// for the item.
    fn advance_item(&mut self, id: WorkId) {
        let failed = match self.tracked.get(&id) {
            Some(tracked) => tracked.item.is_failed(),
            None => {
                self.record_anomaly(
                    format!("advancement requested for untracked work item {id}"),
                    None,
                );
                return;
            }
        };
        if failed {
            self.finalize(id);
            return;
        }

        let num_stages = self.stages.len();
        loop {
            let stage_idx = match self.tracked.get(&id) {
                Some(tracked) => tracked.item.stage(),
                None => return,
            };
            if stage_idx > num_stages {
                let message =
                    format!("work item stage index {stage_idx} is past the end of the pipeline");
                self.record_anomaly(message.clone(), None);
                self.push_failure(id, StageFailure::internal(message));
                self.finalize(id);
                return;
            }
            if stage_idx == num_stages {
                self.finalize(id);
                return;
            }

            if self.stages[stage_idx].pairs_with_next() {
                if stage_idx + 1 == num_stages {
                    let err = PipelineError::PairedLastStage { stage: stage_idx };
                    warn!(
                        pipeline = %self.name,
                        work = id,
                        stage = stage_idx,
                        error = %err,
                        "last stage requested pairing"
                    );
                    self.push_failure(
                        id,
                        StageFailure::at(stage_idx, FailureKind::PairedLastStage, &err),
                    );
                    self.finalize(id);
                    return;
                }
                match self.ask_pair(id, stage_idx) {
                    Ask::Accepted => {
                        self.submit_paired(id, stage_idx);
                        return;
                    }
                    Ask::Refused => self.bump_stage(id),
                    Ask::Failed => {
                        self.finalize(id);
                        return;
                    }
                }
            } else {
                match self.ask(id, stage_idx) {
                    Ask::Accepted => {
                        self.submit_solo(id, stage_idx);
                        return;
                    }
                    Ask::Refused => self.bump_stage(id),
                    Ask::Failed => {
                        self.finalize(id);
                        return;
                    }
                }
            }
        }
    }

    fn ask(&mut self, id: WorkId, stage_idx: usize) -> Ask {
        let verdict = match self.tracked.get(&id) {
            Some(tracked) => self.stages[stage_idx].accepts(&tracked.item),
            None => return Ask::Failed,
        };
        match verdict {
            Ok(true) => Ask::Accepted,
            Ok(false) => Ask::Refused,
            Err(e) => {
                warn!(
                    pipeline = %self.name,
                    work = id,
                    stage = stage_idx,
                    error = %e,
                    "stage predicate failed"
                );
                self.push_failure(id, StageFailure::at(stage_idx, FailureKind::Predicate, &e));
                Ask::Failed
            }
        }
    }

    /// Both the upstream and downstream predicates must accept; either
    /// refusing skips the upstream stage, either failing fails the item.
    fn ask_pair(&mut self, id: WorkId, stage_idx: usize) -> Ask {
        match self.ask(id, stage_idx) {
            Ask::Accepted => {}
            other => return other,
        }
        self.ask(id, stage_idx + 1)
    }

    fn submit_solo(&mut self, id: WorkId, stage_idx: usize) {
        let copy = match self.tracked.get(&id) {
            Some(tracked) => tracked.item.clone_for_stage(None),
            None => return,
        };
        let lane = match self.stages[stage_idx].placement() {
            Placement::Inline => Lane::Inline,
            Placement::Pooled => Lane::Primary,
        };
        debug!(pipeline = %self.name, work = id, stage = stage_idx, "submitting stage");
        self.dispatch(id, stage_idx, copy, lane);
        self.bump_stage(id);
    }

    /// Submit stages `stage_idx` and `stage_idx + 1` together, the upstream
    /// half holding the producer end of a fresh byte channel and the
    /// downstream half the consumer end, on the primary and secondary pools
    /// respectively.
    fn submit_paired(&mut self, id: WorkId, stage_idx: usize) {
        let (reader, writer) = channel::pair(self.pipe_capacity);
        debug!(
            pipeline = %self.name,
            work = id,
            upstream = stage_idx,
            downstream = stage_idx + 1,
            "submitting paired stages"
        );

        let upstream = match self.tracked.get(&id) {
            Some(tracked) => tracked.item.clone_for_stage(Some(PipeEnd::Writer(writer))),
            None => return,
        };
        self.dispatch(id, stage_idx, upstream, Lane::Primary);
        self.bump_stage(id);

        let downstream = match self.tracked.get(&id) {
            Some(tracked) => tracked.item.clone_for_stage(Some(PipeEnd::Reader(reader))),
            None => return,
        };
        self.dispatch(id, stage_idx + 1, downstream, Lane::Secondary);
        self.bump_stage(id);
    }

    /// Run the worker as its own task on the chosen lane and register the
    /// run. A watcher task reports the outcome back, turning a panicked
    /// worker into a settled failure rather than a lost completion.
    fn dispatch(&mut self, id: WorkId, stage_idx: usize, copy: WorkItem<P>, lane: Lane) {
        let stages = Arc::clone(&self.stages);
        let mut params = stages[stage_idx].params();
        if let Some(tracked) = self.tracked.get(&id) {
            for (key, value) in tracked.item.params() {
                params.insert(key.clone(), value.clone());
            }
        }
        let work = async move { stages[stage_idx].run(copy, params).await };
        let handle = match lane {
            Lane::Inline => self.pools.spawn_inline(work),
            Lane::Primary => self.pools.primary().spawn(work),
            Lane::Secondary => self.pools.secondary().spawn(work),
        };

        if let Some(tracked) = self.tracked.get_mut(&id) {
            tracked.runs.push(StageRun {
                stage: stage_idx,
                outcome: None,
            });
        }

        let done_tx = self.done_tx.clone();
        tokio::spawn(async move {
            let outcome = match handle.await {
                Ok(result) => result,
                Err(join_err) => Err(StageError::Panicked(join_err.to_string())),
            };
            let _ = done_tx.send(StageDone {
                id,
                stage: stage_idx,
                outcome,
            });
        });
    }

    fn bump_stage(&mut self, id: WorkId) {
        if let Some(tracked) = self.tracked.get_mut(&id) {
            tracked.item.advance();
        }
    }

    fn push_failure(&mut self, id: WorkId, failure: StageFailure) {
        if let Some(tracked) = self.tracked.get_mut(&id) {
            tracked.item.push_failure(failure);
        }
    }

    fn finalize(&mut self, id: WorkId) {
        let tracked = match self.tracked.remove(&id) {
            Some(tracked) => tracked,
            None => {
                self.record_anomaly(
                    format!("finalize requested for untracked work item {id}"),
                    None,
                );
                return;
            }
        };
        if !tracked.runs.is_empty() {
            self.record_anomaly(
                format!(
                    "work item {id} finalized with {} executions still outstanding",
                    tracked.runs.len()
                ),
                None,
            );
        }
        debug!(
            pipeline = %self.name,
            work = id,
            failed = tracked.item.is_failed(),
            "work item finalized"
        );
        self.inflight.done();
        let _ = tracked.done.send(tracked.item);
    }

    fn fail_all_pending(&mut self, err: &PipelineError) {
        let ids: Vec<WorkId> = self.tracked.keys().copied().collect();
        for id in ids {
            self.push_failure(id, StageFailure::internal(err.to_string()));
            self.finalize(id);
        }
    }

    fn record_anomaly(&self, message: impl Into<String>, error: Option<String>) {
        let message = message.into();
        warn!(pipeline = %self.name, %message, "anomaly recorded");
        if let Ok(mut list) = self.anomalies.lock() {
            list.push(Anomaly {
                kind: AnomalyKind::Exception,
                message,
                error,
            });
        }
    }
}

struct Running<P> {
    sub_tx: mpsc::UnboundedSender<Submission<P>>,
    handle: JoinHandle<()>,
    inflight: Arc<InFlight>,
    num_stages: usize,
}

/// A multi-stage work pipeline.
///
/// Work items are carried through a fixed, ordered sequence of stages by a
/// single controller task that owns all bookkeeping. Stage workers run on
/// bounded pools or inline on the runtime; a stage that pairs with its
/// successor runs jointly with it, streaming bytes over a framed channel.
pub struct Pipeline<P> {
    config: PipelineConfig,
    stages: Vec<Box<dyn Stage<P>>>,
    running: Option<Running<P>>,
    pools: Option<Arc<PoolSet>>,
    anomalies: Arc<Mutex<Vec<Anomaly>>>,
    graceful: Arc<AtomicBool>,
    shut: bool,
}

impl<P: Clone + Send + 'static> Pipeline<P> {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            stages: Vec::new(),
            running: None,
            pools: None,
            anomalies: Arc::new(Mutex::new(Vec::new())),
            graceful: Arc::new(AtomicBool::new(false)),
            shut: false,
        }
    }

    /// Create a pipeline with its stages up front.
    pub fn with_stages(config: PipelineConfig, stages: Vec<Box<dyn Stage<P>>>) -> Self {
        let mut pipeline = Self::new(config);
        pipeline.stages = stages;
        pipeline
    }

    /// Add a stage. Stages are numbered in the order added; adding fails
    /// once the controller has started.
    pub fn add_stage(&mut self, stage: impl Stage<P> + 'static) -> crate::error::Result<()> {
        if self.running.is_some() || self.shut {
            return Err(PipelineError::InvalidState(
                "stages cannot be added after the pipeline has started".into(),
            ));
        }
        self.stages.push(Box::new(stage));
        Ok(())
    }

    pub fn num_stages(&self) -> usize {
        match &self.running {
            Some(running) => running.num_stages,
            None => self.stages.len(),
        }
    }

    /// Launch the controller task. Idempotent; [`submit`](Self::submit)
    /// starts implicitly. Must be called from within a tokio runtime.
    pub fn start(&mut self) {
        if self.running.is_some() || self.shut {
            return;
        }
        let stages = Arc::new(mem::take(&mut self.stages));
        let num_stages = stages.len();
        let pools = Arc::new(PoolSet::new(self.config.max_simultaneous));
        let (sub_tx, sub_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let inflight = Arc::new(InFlight::default());
        let controller = Controller {
            name: self.config.name.clone(),
            stages,
            pools: Arc::clone(&pools),
            pipe_capacity: self.config.pipe_capacity,
            sub_rx,
            done_tx,
            done_rx,
            tracked: HashMap::new(),
            next_id: 0,
            inflight: Arc::clone(&inflight),
            anomalies: Arc::clone(&self.anomalies),
            graceful: Arc::clone(&self.graceful),
        };
        info!(
            pipeline = %self.config.name,
            stages = num_stages,
            pool_capacity = pools.primary().capacity(),
            "pipeline started"
        );
        let handle = tokio::spawn(controller.run());
        self.pools = Some(pools);
        self.running = Some(Running {
            sub_tx,
            handle,
            inflight,
            num_stages,
        });
    }

    /// Submit a work item. The pipeline owns the item until it finalizes and
    /// comes back through the returned handle, so a tracked item cannot be
    /// re-submitted.
    pub fn submit(&mut self, item: WorkItem<P>) -> crate::error::Result<CompletionHandle<P>> {
        if self.shut {
            return Err(PipelineError::ShutDown);
        }
        self.start();
        let running = match &self.running {
            Some(running) => running,
            None => {
                return Err(PipelineError::InvalidState(
                    "pipeline controller is not running".into(),
                ))
            }
        };
        let (tx, rx) = oneshot::channel();
        running.inflight.add();
        if running
            .sub_tx
            .send(Submission::Work { item, done: tx })
            .is_err()
        {
            running.inflight.done();
            return Err(PipelineError::ControllerGone);
        }
        Ok(CompletionHandle::new(rx))
    }

    /// Shut the pipeline down: wait for in-flight items to drain, stop the
    /// controller with the queue sentinel, then close the executor lanes.
    /// Submissions after this fail.
    pub async fn shutdown(&mut self) -> crate::error::Result<()> {
        self.shut = true;
        let running = match self.running.take() {
            Some(running) => running,
            None => return Ok(()),
        };
        running.inflight.wait_drained().await;
        let _ = running.sub_tx.send(Submission::Shutdown);
        let join = running.handle.await;
        if let Some(pools) = &self.pools {
            pools.shutdown();
        }
        join.map_err(|e| PipelineError::InvalidState(format!("controller task failed: {e}")))?;
        Ok(())
    }

    /// True only after a clean, sentinel-driven controller exit.
    pub fn was_graceful_shutdown(&self) -> bool {
        self.graceful.load(Ordering::Acquire)
    }

    /// Anomalies recorded by the controller, for post-mortem inspection.
    pub fn anomalies(&self) -> Vec<Anomaly> {
        match self.anomalies.lock() {
            Ok(list) => list.clone(),
            Err(_) => Vec::new(),
        }
    }

    /// Whether shutdown has completed: controller stopped and all three
    /// executor lanes closed.
    pub fn is_shut_down(&self) -> bool {
        self.shut
            && self.running.is_none()
            && self
                .pools
                .as_ref()
                .map(|pools| pools.is_shut_down())
                .unwrap_or(true)
    }
}
