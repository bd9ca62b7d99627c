use std::time::Duration;

use thiserror::Error;

use crate::fps::FpsError;
use crate::rc::RcMode;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("invalid dimensions {width}x{height}: each axis must be 1..=8192 pixels")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("unsupported block edge {0}: expected 32 or 64")]
    BlockSize(u32),

    #[error("slice {index}: {reason}")]
    SliceTable { index: usize, reason: &'static str },

    #[error("regions per slice must be 1..=16, got {0}")]
    RegionsPerSlice(u32),

    #[error("region table holds {regions} regions, more than the concurrency limit of 16")]
    TooManyRegions { regions: usize },

    #[error("region table is empty or has zero units per region")]
    InvalidUnitsInRegion,

    #[error(
        "region table was built for a {table_w}x{table_h} grid, plan requested {plan_w}x{plan_h}"
    )]
    GridMismatch {
        table_w: u32,
        table_h: u32,
        plan_w: u32,
        plan_h: u32,
    },

    #[error("unsupported walk degree {0}")]
    UnsupportedDegree(u8),

    #[error("threads per unit must be 3..=8, got {0}")]
    ThreadsPerUnit(u8),

    #[error("target usage must be 1..=7, got {0}")]
    TargetUsage(u8),

    #[error("invalid frame rate: {0}")]
    FrameRate(#[from] FpsError),

    #[error("{mode:?} rate control requires a non-zero target bitrate")]
    ZeroBitrate { mode: RcMode },

    #[error("{mode:?} rate control requires a non-zero buffer size")]
    ZeroBufferSize { mode: RcMode },

    #[error("max bitrate {max} is below target bitrate {target}")]
    MaxBitrateBelowTarget { max: u64, target: u64 },

    #[error("{field} qp {value} is outside 0..=51")]
    QpOutOfRange { field: &'static str, value: u8 },

    #[error("qp range {min}..={max} is empty")]
    QpRange { min: u8, max: u8 },

    #[error("invalid gop structure: {0}")]
    Gop(&'static str),

    #[error("recycle pool needs 2..=8 slots, got {0}")]
    RecycleSlots(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("slot {slot} stalled: frame {frame} did not retire within {timeout:?}")]
    Stalled {
        slot: usize,
        frame: u64,
        timeout: Duration,
    },

    #[error("all {slots} recycle slots are held by the submitter")]
    Exhausted { slots: usize },

    #[error("slot handle does not match a claimed slot")]
    ForeignHandle,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RateControlError {
    #[error("frame {got} submitted out of order, expected frame {expected}")]
    OutOfOrder { expected: u64, got: u64 },

    #[error("block statistics cover {got} blocks, grid has {expected}")]
    StatsMismatch { expected: usize, got: usize },

    #[error("per-block rate control is disabled")]
    BlockRcDisabled,

    #[error("per-block rate control is enabled but frame {frame} carries no block statistics")]
    MissingBlockStats { frame: u64 },
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    RateControl(#[from] RateControlError),
}

impl Error {
    pub fn is_stall(&self) -> bool {
        matches!(self, Error::Pipeline(PipelineError::Stalled { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regions_per_slice_display() {
        let err = ConfigError::RegionsPerSlice(17);
        assert!(err.to_string().contains("17"));
    }

    #[test]
    fn stall_display_names_frame_and_slot() {
        let err = PipelineError::Stalled {
            slot: 1,
            frame: 42,
            timeout: Duration::from_millis(5),
        };
        let msg = err.to_string();
        assert!(msg.contains("slot 1"));
        assert!(msg.contains("frame 42"));
    }

    #[test]
    fn fps_error_converts_into_config_error() {
        let err = ConfigError::from(FpsError::ZeroDen);
        assert_eq!(err, ConfigError::FrameRate(FpsError::ZeroDen));
        assert!(err.to_string().contains("den"));
    }

    #[test]
    fn umbrella_error_distinguishes_stalls() {
        let stall: Error = PipelineError::Stalled {
            slot: 0,
            frame: 3,
            timeout: Duration::from_millis(1),
        }
        .into();
        let config: Error = ConfigError::RegionsPerSlice(0).into();
        assert!(stall.is_stall());
        assert!(!config.is_stall());
    }
}
