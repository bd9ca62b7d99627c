use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::block_qp::{BlockStats, QpMap};
use crate::dispatch::{DispatchPlan, TargetUsage, ThreadsPerUnit, WalkDegree};
use crate::error::{Error, RateControlError};
use crate::gop::FrameKind;
use crate::grid::{BlockSize, Grid, SliceSpec};
use crate::partition::{RegionTable, RegionsPerSlice, partition_regions};
use crate::pipeline::{DEFAULT_RECYCLE_SLOTS, RecyclePool, RetireFence, SlotHandle};
use crate::rc::{
    EncodedFrameStats, FrameDecision, FrameUpdateInput, RateControlConfig, RateController,
    SkippedFrames,
};

pub const DEFAULT_SLICE_QP: u8 = 26;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub width: u32,
    pub height: u32,
    pub block_size: BlockSize,
    /// Empty means one slice covering the picture.
    pub slices: Vec<SliceSpec>,
    pub regions_per_slice: u32,
    pub target_usage: u8,
    /// Overrides the degree chosen from block size and target usage.
    pub degree: Option<WalkDegree>,
    pub threads_per_unit: Option<u8>,
    pub recycle_slots: usize,
    pub fence_timeout_ms: u64,
    pub rate_control: RateControlConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            block_size: BlockSize::B64,
            slices: Vec::new(),
            regions_per_slice: 4,
            target_usage: TargetUsage::BALANCED.get(),
            degree: None,
            threads_per_unit: None,
            recycle_slots: DEFAULT_RECYCLE_SLOTS,
            fence_timeout_ms: 100,
            rate_control: RateControlConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskPhase {
    First,
    Middle,
    Last,
    Only,
}

impl TaskPhase {
    pub fn for_position(index: usize, count: usize) -> Self {
        match (index, count) {
            (_, 0 | 1) => Self::Only,
            (0, _) => Self::First,
            (i, n) if i + 1 >= n => Self::Last,
            _ => Self::Middle,
        }
    }

    pub fn is_first(self) -> bool {
        matches!(self, Self::First | Self::Only)
    }

    pub fn is_last(self) -> bool {
        matches!(self, Self::Last | Self::Only)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RcStage {
    InitReset,
    FrameUpdate,
    BlockUpdate,
    Encode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelTask {
    pub stage: RcStage,
    pub phase: TaskPhase,
    pub slot: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameInput {
    pub frame_number: u64,
    /// Derived from the GOP structure when absent.
    pub kind: Option<FrameKind>,
    pub previous: Option<EncodedFrameStats>,
    pub skipped: SkippedFrames,
    pub block_stats: Option<Vec<BlockStats>>,
}

impl FrameInput {
    pub fn new(frame_number: u64) -> Self {
        Self {
            frame_number,
            kind: None,
            previous: None,
            skipped: SkippedFrames::default(),
            block_stats: None,
        }
    }

    pub fn with_kind(mut self, kind: FrameKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_previous(mut self, bits: u64, header_bits: u64) -> Self {
        self.previous = Some(EncodedFrameStats { bits, header_bits });
        self
    }

    pub fn with_skipped(mut self, count: u32, total_bits: u64) -> Self {
        self.skipped = SkippedFrames { count, total_bits };
        self
    }

    pub fn with_block_stats(mut self, stats: Vec<BlockStats>) -> Self {
        self.block_stats = Some(stats);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameWork {
    pub frame_number: u64,
    pub slot: usize,
    pub decision: FrameDecision,
    pub qp_map: Option<QpMap>,
    pub tasks: Vec<KernelTask>,
    pub history: Vec<u8>,
}

#[derive(Debug)]
pub struct Session<F> {
    config: SessionConfig,
    grid: Grid,
    regions: RegionTable,
    plan: DispatchPlan,
    rc: RateController,
    pool: RecyclePool<F>,
    reset_pending: bool,
}

impl<F: RetireFence> Session<F> {
    pub fn new(config: SessionConfig, fence: F) -> Result<Self, Error> {
        let grid = Grid::from_pixels(config.width, config.height, config.block_size)?;

        let slices = if config.slices.is_empty() {
            vec![SliceSpec::whole_picture(&grid, DEFAULT_SLICE_QP)]
        } else {
            config.slices.clone()
        };
        let regions_per_slice = RegionsPerSlice::new(config.regions_per_slice)?;
        let regions = partition_regions(&grid, &slices, regions_per_slice)?;

        let usage = TargetUsage::new(config.target_usage)?;
        let degree = config
            .degree
            .unwrap_or_else(|| WalkDegree::select(config.block_size, usage));
        let threads_per_unit = match config.threads_per_unit {
            Some(threads) => ThreadsPerUnit::new(threads)?,
            None => ThreadsPerUnit::from(usage),
        };
        let plan = DispatchPlan::build(&regions, degree, grid.width(), grid.height(), threads_per_unit)?;

        let rc = RateController::new(config.rate_control.clone(), grid)?;
        let pool = RecyclePool::new(
            config.recycle_slots,
            fence,
            Duration::from_millis(config.fence_timeout_ms),
        )?;

        info!(
            width = config.width,
            height = config.height,
            grid_width = grid.width(),
            grid_height = grid.height(),
            regions = regions.regions().len(),
            ?degree,
            "session created"
        );

        Ok(Self {
            config,
            grid,
            regions,
            plan,
            rc,
            pool,
            reset_pending: true,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub fn regions(&self) -> &RegionTable {
        &self.regions
    }

    pub fn plan(&self) -> &DispatchPlan {
        &self.plan
    }

    pub fn rate_controller(&self) -> &RateController {
        &self.rc
    }

    pub fn pool_mut(&mut self) -> &mut RecyclePool<F> {
        &mut self.pool
    }

    pub fn is_stalled(&self) -> bool {
        self.pool.is_stalled()
    }

    pub fn submit_frame(&mut self, input: FrameInput) -> Result<FrameWork, Error> {
        let handle = self.pool.acquire(input.frame_number)?;
        match self.run_frame(&handle, input) {
            Ok(work) => {
                self.pool.release(handle)?;
                self.reset_pending = false;
                Ok(work)
            }
            Err(err) => {
                self.pool.abandon(handle)?;
                Err(err)
            }
        }
    }

    /// Applies a sequence-parameter change to rate control.
    pub fn reset_rate_control(&mut self, config: RateControlConfig) -> Result<(), Error> {
        self.rc.reset(config.clone())?;
        self.config.rate_control = config;
        self.reset_pending = true;
        Ok(())
    }

    /// Clears a stalled pipeline and re-runs Reset with the current configuration.
    pub fn recover(&mut self) -> Result<(), Error> {
        self.pool.reset();
        self.rc.reset(self.config.rate_control.clone())?;
        self.reset_pending = true;
        info!("session recovered");
        Ok(())
    }

    fn run_frame(&mut self, handle: &SlotHandle, input: FrameInput) -> Result<FrameWork, Error> {
        let block_rc = self.rc.block_rc_enabled();
        let stats = if block_rc {
            let stats = input.block_stats.ok_or(RateControlError::MissingBlockStats {
                frame: input.frame_number,
            })?;
            if stats.len() != self.grid.block_count() {
                return Err(RateControlError::StatsMismatch {
                    expected: self.grid.block_count(),
                    got: stats.len(),
                }
                .into());
            }
            Some(stats)
        } else {
            None
        };

        let kind = input
            .kind
            .unwrap_or_else(|| self.config.rate_control.gop.kind_at(input.frame_number));
        let decision = self.rc.frame_update(FrameUpdateInput {
            frame_number: input.frame_number,
            kind,
            previous: input.previous,
            skipped: input.skipped,
        })?;

        let slot = self.pool.slot_mut(handle)?;
        slot.decision = Some(decision);
        let qp_map = match stats {
            Some(stats) => {
                slot.block_stats = stats;
                self.rc
                    .block_update(&self.grid, &decision, &slot.block_stats, &mut slot.qp_map)?;
                Some(slot.qp_map.clone())
            }
            None => None,
        };

        let mut stages = Vec::with_capacity(4);
        if self.reset_pending {
            stages.push(RcStage::InitReset);
        }
        stages.push(RcStage::FrameUpdate);
        if block_rc {
            stages.push(RcStage::BlockUpdate);
        }
        stages.push(RcStage::Encode);

        let count = stages.len();
        let tasks = stages
            .into_iter()
            .enumerate()
            .map(|(i, stage)| KernelTask {
                stage,
                phase: TaskPhase::for_position(i, count),
                slot: handle.index(),
            })
            .collect();

        debug!(
            frame = input.frame_number,
            slot = handle.index(),
            qp = decision.qp,
            "frame scheduled"
        );

        Ok(FrameWork {
            frame_number: input.frame_number,
            slot: handle.index(),
            decision,
            qp_map,
            tasks,
            history: self.rc.history().to_bytes(),
        })
    }
}
