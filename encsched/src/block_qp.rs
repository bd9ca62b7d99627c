use tracing::{debug, trace};

use crate::error::RateControlError;
use crate::grid::Grid;
use crate::rc::{DEFAULT_BLOCK_MAX_DELTA, FrameDecision, MAX_QP};

/// Upper bound for a per-pixel statistic, scaled by block area.
pub const STAT_PER_PIXEL_MAX: u32 = 1020;
pub const MIN_BITS_PER_BLOCK: u64 = 64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockStats {
    pub activity: u32,
    pub intra_cost: u32,
    pub inter_cost: u32,
}

impl BlockStats {
    fn clamped(self, cap: u32) -> Self {
        Self {
            activity: self.activity.clamp(1, cap),
            intra_cost: self.intra_cost.clamp(1, cap),
            inter_cost: self.inter_cost.clamp(1, cap),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockRcParams {
    pub strength: f64,
    pub max_delta: u8,
    pub min_qp: u8,
    pub max_qp: u8,
}

impl Default for BlockRcParams {
    fn default() -> Self {
        Self {
            strength: 2.0,
            max_delta: DEFAULT_BLOCK_MAX_DELTA,
            min_qp: 1,
            max_qp: MAX_QP,
        }
    }
}

/// Per-block QP deltas relative to the frame QP, in raster order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QpMap {
    width: u32,
    height: u32,
    deltas: Vec<i8>,
}

impl QpMap {
    pub fn new(grid: &Grid) -> Self {
        Self {
            width: grid.width(),
            height: grid.height(),
            deltas: vec![0; grid.block_count()],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    pub fn deltas(&self) -> &[i8] {
        &self.deltas
    }

    pub fn delta_at(&self, x: u32, y: u32) -> i8 {
        self.deltas[y as usize * self.width as usize + x as usize]
    }

    pub fn qp_at(&self, frame_qp: u8, x: u32, y: u32) -> u8 {
        (frame_qp as i32 + self.delta_at(x, y) as i32).clamp(0, MAX_QP as i32) as u8
    }

    pub fn clear(&mut self) {
        self.deltas.fill(0);
    }

    fn reshape(&mut self, grid: &Grid) {
        self.width = grid.width();
        self.height = grid.height();
        self.deltas.clear();
        self.deltas.resize(grid.block_count(), 0);
    }
}

/// Spreads the frame QP across blocks by relative activity.
pub fn block_update(
    params: &BlockRcParams,
    grid: &Grid,
    decision: &FrameDecision,
    stats: &[BlockStats],
    map: &mut QpMap,
) -> Result<(), RateControlError> {
    let blocks = grid.block_count();
    if stats.len() != blocks {
        return Err(RateControlError::StatsMismatch {
            expected: blocks,
            got: stats.len(),
        });
    }

    let cap = grid.block_size().area() * STAT_PER_PIXEL_MAX;
    let mut clamped = 0usize;
    let stats: Vec<BlockStats> = stats
        .iter()
        .map(|s| {
            let c = s.clamped(cap);
            if c != *s {
                clamped += 1;
            }
            c
        })
        .collect();
    if clamped > 0 {
        debug!(
            frame = decision.frame_number,
            clamped, "block statistics outside the valid range were clamped"
        );
    }

    let mut strength = params.strength;
    if decision.target_bits < MIN_BITS_PER_BLOCK * blocks as u64 {
        strength *= 0.5;
        trace!(
            frame = decision.frame_number,
            target_bits = decision.target_bits,
            "small frame budget, halving block qp strength"
        );
    }

    let log_mean = stats
        .iter()
        .map(|s| (s.activity as f64).log2())
        .sum::<f64>()
        / blocks as f64;
    let inter = !decision.kind.is_intra();

    let raw: Vec<f64> = stats
        .iter()
        .map(|s| {
            let mut delta = (strength * ((s.activity as f64).log2() - log_mean)).round();
            if inter && (s.intra_cost as f64) < 0.5 * s.inter_cost as f64 {
                delta -= 1.0;
            }
            delta
        })
        .collect();
    let mean = raw.iter().sum::<f64>() / blocks as f64;

    // A hand-built decision may carry a QP outside the configured range.
    let qp = decision.qp.max(params.min_qp).min(params.max_qp) as i32;
    let max_delta = params.max_delta as i32;
    let lo = (params.min_qp as i32 - qp).max(-max_delta);
    let hi = (params.max_qp as i32 - qp).min(max_delta);

    map.reshape(grid);
    for (slot, delta) in map.deltas.iter_mut().zip(raw) {
        *slot = ((delta - mean).round() as i32).clamp(lo, hi) as i8;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gop::FrameKind;
    use crate::grid::BlockSize;

    fn decision(kind: FrameKind, qp: u8, target_bits: u64) -> FrameDecision {
        FrameDecision {
            frame_number: 0,
            kind,
            level: kind.level(),
            qp,
            target_bits,
            target_fullness: 0,
            target_rollover: false,
            buffer_fullness: 0,
        }
    }

    fn flat(activity: u32) -> BlockStats {
        BlockStats {
            activity,
            intra_cost: 100,
            inter_cost: 100,
        }
    }

    fn row(width: u32) -> Grid {
        Grid::in_blocks(width, 1, BlockSize::B32).unwrap()
    }

    #[test]
    fn rejects_mismatched_stats() {
        let grid = row(4);
        let mut map = QpMap::default();
        let err = block_update(
            &BlockRcParams::default(),
            &grid,
            &decision(FrameKind::INTRA, 30, 100_000),
            &[flat(10); 3],
            &mut map,
        )
        .unwrap_err();
        assert_eq!(err, RateControlError::StatsMismatch { expected: 4, got: 3 });
    }

    #[test]
    fn uniform_activity_gives_flat_map() {
        let grid = Grid::in_blocks(6, 4, BlockSize::B64).unwrap();
        let mut map = QpMap::default();
        block_update(
            &BlockRcParams::default(),
            &grid,
            &decision(FrameKind::PREDICTED, 30, 1_000_000),
            &vec![flat(500); 24],
            &mut map,
        )
        .unwrap();
        assert_eq!(map.deltas(), &[0; 24]);
        assert_eq!((map.width(), map.height()), (6, 4));
    }

    #[test]
    fn deltas_follow_log_activity() {
        let grid = row(4);
        let stats = [flat(1), flat(4), flat(16), flat(64)];
        let mut map = QpMap::default();
        let params = BlockRcParams::default();

        block_update(&params, &grid, &decision(FrameKind::INTRA, 30, 100_000), &stats, &mut map)
            .unwrap();
        assert_eq!(map.deltas(), &[-6, -2, 2, 6]);

        block_update(&params, &grid, &decision(FrameKind::INTRA, 30, 100), &stats, &mut map)
            .unwrap();
        assert_eq!(map.deltas(), &[-3, -1, 1, 3]);
    }

    #[test]
    fn map_is_zero_mean_and_bounded() {
        let grid = Grid::in_blocks(8, 5, BlockSize::B64).unwrap();
        let stats: Vec<_> = (0..40u32).map(|i| flat(40 + (i * 37 % 23) * 5)).collect();
        let mut map = QpMap::default();
        block_update(
            &BlockRcParams::default(),
            &grid,
            &decision(FrameKind::INTRA, 30, 1_000_000),
            &stats,
            &mut map,
        )
        .unwrap();

        let sum: i32 = map.deltas().iter().map(|&d| d as i32).sum();
        assert!((sum as f64 / 40.0).abs() <= 0.5, "mean {}", sum as f64 / 40.0);
        assert!(map.deltas().iter().all(|d| d.abs() <= 6));
        assert!(map.deltas().iter().any(|&d| d != 0));
    }

    #[test]
    fn inter_frames_protect_intra_friendly_blocks() {
        let grid = row(2);
        let stats = [
            BlockStats {
                activity: 100,
                intra_cost: 10,
                inter_cost: 100,
            },
            flat(100),
        ];
        let mut map = QpMap::default();
        let params = BlockRcParams::default();

        block_update(&params, &grid, &decision(FrameKind::PREDICTED, 30, 10_000), &stats, &mut map)
            .unwrap();
        assert!(map.delta_at(0, 0) < map.delta_at(1, 0));

        block_update(&params, &grid, &decision(FrameKind::INTRA, 30, 10_000), &stats, &mut map)
            .unwrap();
        assert_eq!(map.deltas(), &[0, 0]);
    }

    #[test]
    fn anomalous_stats_are_clamped() {
        let grid = row(2);
        let stats = [flat(0), flat(u32::MAX)];
        let mut map = QpMap::default();
        block_update(
            &BlockRcParams::default(),
            &grid,
            &decision(FrameKind::INTRA, 30, 10_000),
            &stats,
            &mut map,
        )
        .unwrap();
        assert_eq!(map.deltas(), &[-6, 6]);
    }

    #[test]
    fn deltas_respect_qp_range() {
        let grid = row(4);
        let stats = [flat(1), flat(4), flat(16), flat(64)];
        let mut map = QpMap::default();
        block_update(
            &BlockRcParams::default(),
            &grid,
            &decision(FrameKind::INTRA, 50, 100_000),
            &stats,
            &mut map,
        )
        .unwrap();
        assert!(map.deltas().iter().all(|&d| d <= 1));
        assert_eq!(map.qp_at(50, 3, 0), 51);
        assert_eq!(map.qp_at(50, 0, 0), 44);
    }

    #[test]
    fn frame_qp_below_range_is_pulled_in() {
        let grid = row(4);
        let stats = [flat(1), flat(4), flat(16), flat(64)];
        let params = BlockRcParams {
            min_qp: 20,
            ..BlockRcParams::default()
        };
        let mut map = QpMap::default();
        block_update(&params, &grid, &decision(FrameKind::INTRA, 10, 100_000), &stats, &mut map)
            .unwrap();
        assert_eq!(map.deltas(), &[0, 0, 2, 6]);

        block_update(&params, &grid, &decision(FrameKind::INTRA, 60, 100_000), &stats, &mut map)
            .unwrap();
        assert!(map.deltas().iter().all(|&d| d <= 0));
    }
}
