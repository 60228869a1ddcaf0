pub mod channel;
pub mod controller;
pub mod error;
pub mod item;
mod pool;
pub mod stage;

pub use channel::{
    Frame, FrameReader, FrameWriter, PipeReader, PipeWriter, MAX_FRAME_LEN, TAG_DATA,
    TAG_DATA_FINAL,
};
pub use controller::{CompletionHandle, Pipeline, PipelineConfig};
pub use error::{
    Anomaly, AnomalyKind, ChannelError, FailureKind, PipelineError, Result, StageError,
    StageFailure,
};
pub use item::WorkItem;
pub use stage::{FnStage, Placement, Stage, StageParams};
