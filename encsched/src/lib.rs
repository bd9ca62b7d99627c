#![forbid(unsafe_code)]

pub mod block_qp;
pub mod dispatch;
pub mod error;
pub mod fps;
pub mod gop;
pub mod grid;
pub mod partition;
pub mod pipeline;
pub mod rc;
pub mod session;

pub use block_qp::{BlockStats, QpMap};
pub use dispatch::{DispatchPlan, TargetUsage, ThreadsPerUnit, WalkDegree};
pub use error::{ConfigError, Error, PipelineError, RateControlError};
pub use fps::Fps;
pub use gop::{FrameKind, FrameType, GopStructure};
pub use grid::{BlockSize, Grid, SliceSpec};
pub use partition::{RegionTable, RegionsPerSlice, partition_regions};
pub use pipeline::{ChannelFence, FenceSignal, ImmediateFence, RecyclePool, RetireFence};
pub use rc::{FrameDecision, RateControlConfig, RateController, RcMode};
pub use session::{FrameInput, FrameWork, KernelTask, RcStage, Session, SessionConfig, TaskPhase};
