//! Multi-pass bitrate control.
//!
//! The controller keeps a [`History`] that is carried from frame to frame. Each
//! [`RateController::frame_update`] folds in the feedback of the previous frame
//! and any dropped frames, then decides the QP and bit budget of the next one.
//! A frame update works on a copy of the history and only commits it once the
//! decision is complete, so a rejected frame leaves the controller untouched.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::block_qp::{self, BlockRcParams, BlockStats, QpMap};
use crate::error::{ConfigError, RateControlError};
use crate::fps::Fps;
use crate::gop::{BrcLevel, CLASS_COUNT, FrameKind, FrameType, GopStructure};
use crate::grid::Grid;

pub const MAX_QP: u8 = 51;
pub const DEFAULT_BLOCK_MAX_DELTA: u8 = 6;

const BUCKET_QP_DELTAS: [i32; 9] = [-3, -2, -1, -1, 0, 1, 1, 2, 3];
const CLASS_QP_OFFSETS: [i32; CLASS_COUNT] = [-3, 0, 1, 2, 3];
const QP_EMA_ALPHA: f64 = 0.2;
const SIZE_EMA_ALPHA: f64 = 0.25;
const MAX_RATE_QP_DELTA: i32 = 4;

const PB_BASES: [f64; 4] = [0.90, 0.66, 0.46, 0.3];
const INTRA_NEG_BASES: [f64; 4] = [0.80, 0.60, 0.34, 0.2];
const INTRA_POS_BASES: [f64; 4] = [0.2, 0.4, 0.66, 0.9];
const VBR_NEG_BASES: [f64; 4] = [0.90, 0.70, 0.50, 0.3];
const VBR_POS_BASES: [f64; 4] = [0.4, 0.5, 0.75, 0.90];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RcMode {
    Cbr,
    Vbr,
    Avbr,
    Icq,
    Cqp,
    Vcm,
}

impl RcMode {
    pub fn is_bitrate_driven(self) -> bool {
        !matches!(self, Self::Icq | Self::Cqp)
    }

    fn tuning(self) -> ModeTuning {
        let (buffer_gain, max_qp_step) = match self {
            Self::Cbr => (1.0, 4),
            Self::Vcm => (0.8, 4),
            Self::Vbr => (0.5, 3),
            Self::Avbr => (0.35, 2),
            Self::Icq | Self::Cqp => (0.0, 0),
        };
        ModeTuning {
            buffer_gain,
            max_qp_step,
        }
    }
}

struct ModeTuning {
    buffer_gain: f64,
    max_qp_step: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CqpQps {
    pub i: u8,
    pub p: u8,
    pub b: u8,
}

impl Default for CqpQps {
    fn default() -> Self {
        Self { i: 26, p: 28, b: 30 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateControlConfig {
    pub mode: RcMode,
    pub target_bitrate: u64,
    pub max_bitrate: Option<u64>,
    pub buffer_size: Option<u64>,
    pub initial_fullness: Option<u64>,
    pub fps: Fps,
    pub gop: GopStructure,
    pub min_qp: u8,
    pub max_qp: u8,
    pub cqp: CqpQps,
    pub icq_quality: u8,
    pub block_rc: bool,
    pub block_max_delta: u8,
}

impl Default for RateControlConfig {
    fn default() -> Self {
        Self {
            mode: RcMode::Cbr,
            target_bitrate: 4_000_000,
            max_bitrate: None,
            buffer_size: None,
            initial_fullness: None,
            fps: Fps::default(),
            gop: GopStructure::default(),
            min_qp: 1,
            max_qp: MAX_QP,
            cqp: CqpQps::default(),
            icq_quality: 26,
            block_rc: false,
            block_max_delta: DEFAULT_BLOCK_MAX_DELTA,
        }
    }
}

impl RateControlConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.fps.validated()?;
        if self.mode.is_bitrate_driven() && self.target_bitrate == 0 {
            return Err(ConfigError::ZeroBitrate { mode: self.mode });
        }
        if matches!(self.mode, RcMode::Cbr | RcMode::Vbr) && self.buffer_size == Some(0) {
            return Err(ConfigError::ZeroBufferSize { mode: self.mode });
        }
        if matches!(self.mode, RcMode::Vbr | RcMode::Avbr)
            && let Some(max) = self.max_bitrate
            && max < self.target_bitrate
        {
            return Err(ConfigError::MaxBitrateBelowTarget {
                max,
                target: self.target_bitrate,
            });
        }
        for (field, value) in [
            ("min", self.min_qp),
            ("max", self.max_qp),
            ("cqp i", self.cqp.i),
            ("cqp p", self.cqp.p),
            ("cqp b", self.cqp.b),
            ("icq quality", self.icq_quality),
            ("block max delta", self.block_max_delta),
        ] {
            if value > MAX_QP {
                return Err(ConfigError::QpOutOfRange { field, value });
            }
        }
        if self.min_qp > self.max_qp {
            return Err(ConfigError::QpRange {
                min: self.min_qp,
                max: self.max_qp,
            });
        }
        self.gop.validate()
    }
}

/// Sorted spend-deviation thresholds for one frame class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviationCurve {
    pub thresholds: [i8; 8],
}

impl DeviationCurve {
    fn build(ratio: f64, neg_bases: &[f64; 4], pos_bases: &[f64; 4], pos_scale: f64) -> Self {
        let mut thresholds = [0i8; 8];
        for (i, base) in neg_bases.iter().enumerate() {
            thresholds[i] = (-50.0 * base.powf(ratio)).round() as i8;
        }
        for (i, base) in pos_bases.iter().enumerate() {
            thresholds[4 + i] = (pos_scale * base.powf(ratio)).round() as i8;
        }
        thresholds.sort_unstable();
        Self { thresholds }
    }

    /// Bucket 0..=8 of a deviation in percent of the buffer.
    pub fn bucket(&self, deviation: f64) -> usize {
        self.thresholds
            .iter()
            .filter(|&&t| deviation >= t as f64)
            .count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviationCurves {
    pub inter: DeviationCurve,
    pub intra: DeviationCurve,
}

impl DeviationCurves {
    fn for_mode(mode: RcMode, input_bits_per_frame: f64, buffer_size: f64) -> Option<Self> {
        let ratio = (input_bits_per_frame / (buffer_size / 30.0)).clamp(0.1, 3.5);
        let inter = match mode {
            RcMode::Cbr | RcMode::Vcm => DeviationCurve::build(ratio, &PB_BASES, &PB_BASES, 50.0),
            RcMode::Vbr | RcMode::Avbr => {
                DeviationCurve::build(ratio, &VBR_NEG_BASES, &VBR_POS_BASES, 100.0)
            }
            RcMode::Icq | RcMode::Cqp => return None,
        };
        let intra = DeviationCurve::build(ratio, &INTRA_NEG_BASES, &INTRA_POS_BASES, 50.0);
        Some(Self { inter, intra })
    }

    fn for_kind(&self, kind: FrameKind) -> &DeviationCurve {
        if kind.is_intra() {
            &self.intra
        } else {
            &self.inter
        }
    }
}

/// Values derived from the configuration at Init/Reset.
#[derive(Debug, Clone, PartialEq)]
pub struct InitParams {
    pub input_bits_per_frame: f64,
    pub buffer_size: f64,
    pub init_fullness: f64,
    pub normalizer: f64,
    pub initial_qp: u8,
    pub curves: Option<DeviationCurves>,
}

impl InitParams {
    fn derive(config: &RateControlConfig, grid: &Grid) -> Self {
        let ibpf = if config.mode.is_bitrate_driven() {
            config.fps.bits_per_frame(config.target_bitrate)
        } else {
            0.0
        };

        let requested = config.buffer_size.unwrap_or(config.target_bitrate) as f64;
        let floor = (4.0 * ibpf).max(1.0);
        let buffer_size = if requested < floor {
            if config.mode.is_bitrate_driven() {
                warn!(
                    requested,
                    raised_to = floor,
                    "buffer size below four frames of input, raising it"
                );
            }
            floor
        } else {
            requested
        };

        let init_fullness = config
            .initial_fullness
            .map_or(0.75 * buffer_size, |f| f as f64)
            .clamp(2.0 * ibpf, buffer_size);

        let initial_qp = match config.mode {
            RcMode::Cqp => config.cqp.p,
            RcMode::Icq => config.icq_quality,
            _ => initial_qp_from_bitrate(config.target_bitrate, config.fps, grid.pixel_count()),
        };

        Self {
            input_bits_per_frame: ibpf,
            buffer_size,
            init_fullness,
            normalizer: config.gop.weight_normalizer(),
            initial_qp: initial_qp.clamp(config.min_qp, config.max_qp),
            curves: DeviationCurves::for_mode(config.mode, ibpf, buffer_size),
        }
    }
}

fn initial_qp_from_bitrate(target_bitrate: u64, fps: Fps, pixels: u64) -> u8 {
    let bpp = target_bitrate as f64 / (fps.as_f64() * pixels as f64);
    if bpp > 1.0 {
        12
    } else if bpp > 0.5 {
        18
    } else if bpp > 0.2 {
        24
    } else if bpp > 0.1 {
        30
    } else if bpp > 0.05 {
        36
    } else {
        42
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct PendingDecision {
    class: usize,
    qp: u8,
    target_bits: f64,
}

/// Rate-control state carried across frames.
#[derive(Debug, Clone, PartialEq)]
pub struct History {
    last_frame: Option<u64>,
    frames_encoded: u64,
    bits_consumed: u64,
    buffer_fullness: f64,
    target_fullness: f64,
    skipped_frames: u64,
    skipped_bits: u64,
    qp_avg: [f64; CLASS_COUNT],
    size_mult: [f64; CLASS_COUNT],
    avg_frame_size: f64,
    pending: Option<PendingDecision>,
    overflow_count: u32,
    underflow_count: u32,
}

impl History {
    fn new(params: &InitParams, config: &RateControlConfig) -> Self {
        let mut qp_avg = [0.0; CLASS_COUNT];
        for (avg, offset) in qp_avg.iter_mut().zip(CLASS_QP_OFFSETS) {
            *avg = (params.initial_qp as i32 + offset)
                .clamp(config.min_qp as i32, config.max_qp as i32) as f64;
        }
        Self {
            last_frame: None,
            frames_encoded: 0,
            bits_consumed: 0,
            buffer_fullness: params.init_fullness,
            target_fullness: params.init_fullness,
            skipped_frames: 0,
            skipped_bits: 0,
            qp_avg,
            size_mult: [1.0; CLASS_COUNT],
            avg_frame_size: params.input_bits_per_frame,
            pending: None,
            overflow_count: 0,
            underflow_count: 0,
        }
    }

    pub fn last_frame(&self) -> Option<u64> {
        self.last_frame
    }

    pub fn frames_encoded(&self) -> u64 {
        self.frames_encoded
    }

    pub fn bits_consumed(&self) -> u64 {
        self.bits_consumed
    }

    pub fn buffer_fullness(&self) -> f64 {
        self.buffer_fullness
    }

    pub fn target_fullness(&self) -> f64 {
        self.target_fullness
    }

    pub fn skipped_frames(&self) -> u64 {
        self.skipped_frames
    }

    pub fn skipped_bits(&self) -> u64 {
        self.skipped_bits
    }

    pub fn qp_average(&self, kind: FrameKind) -> f64 {
        self.qp_avg[kind.class_index()]
    }

    pub fn size_multiplier(&self, kind: FrameKind) -> f64 {
        self.size_mult[kind.class_index()]
    }

    pub fn avg_frame_size(&self) -> f64 {
        self.avg_frame_size
    }

    pub fn has_pending_decision(&self) -> bool {
        self.pending.is_some()
    }

    pub fn overflow_count(&self) -> u32 {
        self.overflow_count
    }

    pub fn underflow_count(&self) -> u32 {
        self.underflow_count
    }

    /// Little-endian snapshot handed to the kernel side.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(160);
        out.extend_from_slice(&self.last_frame.map_or(u64::MAX, |f| f).to_le_bytes());
        for v in [
            self.frames_encoded,
            self.bits_consumed,
            self.skipped_frames,
            self.skipped_bits,
        ] {
            out.extend_from_slice(&v.to_le_bytes());
        }
        for v in [
            self.buffer_fullness,
            self.target_fullness,
            self.avg_frame_size,
        ] {
            out.extend_from_slice(&v.to_le_bytes());
        }
        for v in self.qp_avg.iter().chain(&self.size_mult) {
            out.extend_from_slice(&v.to_le_bytes());
        }
        match self.pending {
            Some(p) => {
                out.push(1);
                out.push(p.class as u8);
                out.push(p.qp);
                out.extend_from_slice(&p.target_bits.to_le_bytes());
            }
            None => out.extend_from_slice(&[0; 11]),
        }
        out.extend_from_slice(&self.overflow_count.to_le_bytes());
        out.extend_from_slice(&self.underflow_count.to_le_bytes());
        out
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncodedFrameStats {
    pub bits: u64,
    pub header_bits: u64,
}

impl EncodedFrameStats {
    pub fn total(&self) -> u64 {
        self.bits + self.header_bits
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SkippedFrames {
    pub count: u32,
    pub total_bits: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameUpdateInput {
    pub frame_number: u64,
    pub kind: FrameKind,
    /// Feedback for the frame encoded before this one.
    pub previous: Option<EncodedFrameStats>,
    pub skipped: SkippedFrames,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameDecision {
    pub frame_number: u64,
    pub kind: FrameKind,
    pub level: BrcLevel,
    pub qp: u8,
    pub target_bits: u64,
    /// Target accumulator before this frame's input was added.
    pub target_fullness: u64,
    pub target_rollover: bool,
    pub buffer_fullness: u64,
}

#[derive(Debug, Clone)]
pub struct RateController {
    config: RateControlConfig,
    grid: Grid,
    params: InitParams,
    history: History,
}

impl RateController {
    pub fn new(config: RateControlConfig, grid: Grid) -> Result<Self, ConfigError> {
        config.validate()?;
        let params = InitParams::derive(&config, &grid);
        let history = History::new(&params, &config);
        info!(
            mode = ?config.mode,
            bitrate = config.target_bitrate,
            buffer_size = params.buffer_size,
            init_fullness = params.init_fullness,
            initial_qp = params.initial_qp,
            "rate control initialized"
        );
        Ok(Self {
            config,
            grid,
            params,
            history,
        })
    }

    /// Applies a sequence-parameter change.
    ///
    /// Learned QP averages, size multipliers and the buffer fullness ratio
    /// carry over; skipped-frame counters and the pending decision do not.
    pub fn reset(&mut self, config: RateControlConfig) -> Result<(), ConfigError> {
        config.validate()?;
        let params = InitParams::derive(&config, &self.grid);

        let mut history = self.history.clone();
        if params.buffer_size != self.params.buffer_size {
            let ratio = history.buffer_fullness / self.params.buffer_size;
            history.buffer_fullness = (ratio * params.buffer_size).clamp(0.0, params.buffer_size);
        }
        history.target_fullness = params.init_fullness;
        history.skipped_frames = 0;
        history.skipped_bits = 0;
        history.pending = None;
        for avg in &mut history.qp_avg {
            *avg = avg.clamp(config.min_qp as f64, config.max_qp as f64);
        }

        info!(
            mode = ?config.mode,
            bitrate = config.target_bitrate,
            buffer_size = params.buffer_size,
            fullness = history.buffer_fullness,
            "rate control reset"
        );
        self.config = config;
        self.params = params;
        self.history = history;
        Ok(())
    }

    pub fn config(&self) -> &RateControlConfig {
        &self.config
    }

    pub fn params(&self) -> &InitParams {
        &self.params
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn block_rc_enabled(&self) -> bool {
        self.config.block_rc
    }

    pub fn frame_update(&mut self, input: FrameUpdateInput) -> Result<FrameDecision, RateControlError> {
        let expected = self
            .history
            .last_frame
            .map_or(0, |last| last + 1)
            + input.skipped.count as u64;
        if input.frame_number != expected {
            return Err(RateControlError::OutOfOrder {
                expected,
                got: input.frame_number,
            });
        }

        let mut history = self.history.clone();
        if let Some(stats) = input.previous {
            self.apply_feedback(&mut history, stats);
        }
        if input.skipped != SkippedFrames::default() {
            self.apply_skipped(&mut history, input.skipped);
        }

        let decision = self.decide(&mut history, &input);
        history.last_frame = Some(input.frame_number);

        trace!(
            frame = decision.frame_number,
            qp = decision.qp,
            target_bits = decision.target_bits,
            fullness = history.buffer_fullness,
            "frame update"
        );
        self.history = history;
        Ok(decision)
    }

    pub fn block_update(
        &self,
        grid: &Grid,
        decision: &FrameDecision,
        stats: &[BlockStats],
        map: &mut QpMap,
    ) -> Result<(), RateControlError> {
        if !self.config.block_rc {
            return Err(RateControlError::BlockRcDisabled);
        }
        let params = BlockRcParams {
            max_delta: self.config.block_max_delta,
            min_qp: self.config.min_qp,
            max_qp: self.config.max_qp,
            ..BlockRcParams::default()
        };
        block_qp::block_update(&params, grid, decision, stats, map)
    }

    fn apply_feedback(&self, history: &mut History, stats: EncodedFrameStats) {
        let actual = stats.total();
        history.frames_encoded += 1;
        history.bits_consumed += actual;
        history.avg_frame_size =
            QP_EMA_ALPHA * actual as f64 + (1.0 - QP_EMA_ALPHA) * history.avg_frame_size;

        if self.config.mode.is_bitrate_driven() {
            let buffer_size = self.params.buffer_size;
            history.buffer_fullness += self.params.input_bits_per_frame;
            if history.buffer_fullness > buffer_size {
                history.overflow_count += 1;
                debug!(fullness = history.buffer_fullness, buffer_size, "buffer overflow");
                history.buffer_fullness = buffer_size;
            }
            history.buffer_fullness -= actual as f64;
            if history.buffer_fullness < 0.0 {
                history.underflow_count += 1;
                debug!(fullness = history.buffer_fullness, "buffer underflow");
                history.buffer_fullness = 0.0;
            }
        }

        if let Some(pending) = history.pending.take() {
            let c = pending.class;
            history.qp_avg[c] =
                QP_EMA_ALPHA * pending.qp as f64 + (1.0 - QP_EMA_ALPHA) * history.qp_avg[c];
            if pending.target_bits > 0.0 {
                let ratio = actual as f64 / pending.target_bits;
                history.size_mult[c] = ((1.0 - SIZE_EMA_ALPHA) * history.size_mult[c]
                    + SIZE_EMA_ALPHA * ratio)
                    .clamp(0.25, 4.0);
            }
        }
    }

    fn apply_skipped(&self, history: &mut History, skipped: SkippedFrames) {
        let buffer_size = self.params.buffer_size;
        let input = skipped.count as f64 * self.params.input_bits_per_frame;

        history.target_fullness += input;
        if history.target_fullness > buffer_size {
            history.target_fullness %= buffer_size;
        }

        if self.config.mode.is_bitrate_driven() {
            let fullness = history.buffer_fullness + input - skipped.total_bits as f64;
            if fullness > buffer_size {
                history.overflow_count += 1;
            } else if fullness < 0.0 {
                history.underflow_count += 1;
            }
            history.buffer_fullness = fullness.clamp(0.0, buffer_size);
        }
        history.skipped_frames += skipped.count as u64;
        history.skipped_bits += skipped.total_bits;
        debug!(
            count = skipped.count,
            total_bits = skipped.total_bits,
            "skipped frames folded into history"
        );
    }

    fn decide(&self, history: &mut History, input: &FrameUpdateInput) -> FrameDecision {
        let kind = input.kind;
        let class = kind.class_index();
        let level = kind.level();
        let params = &self.params;
        let (min_qp, max_qp) = (self.config.min_qp as i32, self.config.max_qp as i32);

        let nominal = params.input_bits_per_frame * kind.weight() * params.normalizer;

        let (qp, target_bits) = match self.config.mode {
            RcMode::Cqp => {
                let qp = match kind.frame_type {
                    FrameType::I => self.config.cqp.i,
                    FrameType::P => self.config.cqp.p,
                    FrameType::B => self.config.cqp.b,
                };
                (qp as i32, nominal)
            }
            RcMode::Icq => (
                self.config.icq_quality as i32 + CLASS_QP_OFFSETS[class],
                nominal,
            ),
            mode => {
                let tuning = mode.tuning();
                let deviation = -(history.buffer_fullness - params.init_fullness)
                    / params.buffer_size
                    * 100.0;

                let scale = (1.0 - tuning.buffer_gain * deviation / 100.0).clamp(0.25, 2.0);
                let mut target = nominal * scale;
                match mode {
                    RcMode::Vbr | RcMode::Avbr => {
                        if let Some(max) = self.config.max_bitrate {
                            let cap = self.config.fps.bits_per_frame(max)
                                * kind.weight()
                                * params.normalizer;
                            target = target.min(cap);
                        }
                    }
                    _ => {
                        target = target.min(history.buffer_fullness + params.input_bits_per_frame);
                    }
                }
                let target = target.max(1.0);

                let bucket = params
                    .curves
                    .as_ref()
                    .map_or(4, |c| c.for_kind(kind).bucket(deviation));
                let rate_delta = (6.0 * history.size_mult[class].log2()).round() as i32;
                let delta = (BUCKET_QP_DELTAS[bucket]
                    + rate_delta.clamp(-MAX_RATE_QP_DELTA, MAX_RATE_QP_DELTA))
                .clamp(-tuning.max_qp_step, tuning.max_qp_step);

                (history.qp_avg[class].round() as i32 + delta, target)
            }
        };
        let qp = qp.clamp(min_qp, max_qp) as u8;

        history.pending = Some(PendingDecision {
            class,
            qp,
            target_bits,
        });

        let recorded = history.target_fullness;
        history.target_fullness += params.input_bits_per_frame;
        let target_rollover = history.target_fullness > params.buffer_size;
        if target_rollover {
            history.target_fullness -= params.buffer_size;
        }

        FrameDecision {
            frame_number: input.frame_number,
            kind,
            level,
            qp,
            target_bits: target_bits.round() as u64,
            target_fullness: recorded.round() as u64,
            target_rollover,
            buffer_fullness: history.buffer_fullness.round() as u64,
        }
    }
}
