use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;
use crate::grid::BlockSize;
use crate::partition::{MAX_CONCURRENT_REGIONS, RegionTable};

pub const MAX_SCOREBOARD_DEPS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WalkDegree {
    Diagonal = 0,
    DiagonalZ = 1,
    DiagonalX = 2,
    DiagonalZX = 3,
}

impl TryFrom<u8> for WalkDegree {
    type Error = ConfigError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Diagonal),
            1 => Ok(Self::DiagonalZ),
            2 => Ok(Self::DiagonalX),
            3 => Ok(Self::DiagonalZX),
            other => Err(ConfigError::UnsupportedDegree(other)),
        }
    }
}

impl WalkDegree {
    pub fn select(block_size: BlockSize, usage: TargetUsage) -> Self {
        match (block_size, usage.is_quality_tier()) {
            (BlockSize::B64, true) => Self::DiagonalZX,
            (BlockSize::B64, false) => Self::DiagonalZ,
            (BlockSize::B32, true) => Self::DiagonalX,
            (BlockSize::B32, false) => Self::Diagonal,
        }
    }

    pub fn is_threaded(self) -> bool {
        self.traits().threaded
    }

    fn traits(self) -> &'static DegreeTraits {
        &DEGREE_TRAITS[self as usize]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetUsage(u8);

impl TargetUsage {
    pub const BEST_QUALITY: Self = Self(1);
    pub const BALANCED: Self = Self(4);
    pub const BEST_SPEED: Self = Self(7);

    pub fn new(tier: u8) -> Result<Self, ConfigError> {
        if !(1..=7).contains(&tier) {
            return Err(ConfigError::TargetUsage(tier));
        }
        Ok(Self(tier))
    }

    pub fn get(self) -> u8 {
        self.0
    }

    pub fn is_quality_tier(self) -> bool {
        self.0 <= 4
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadsPerUnit(u8);

impl ThreadsPerUnit {
    pub fn new(threads: u8) -> Result<Self, ConfigError> {
        if !(3..=8).contains(&threads) {
            return Err(ConfigError::ThreadsPerUnit(threads));
        }
        Ok(Self(threads))
    }

    pub fn get(self) -> u32 {
        self.0 as u32
    }
}

impl From<TargetUsage> for ThreadsPerUnit {
    fn from(usage: TargetUsage) -> Self {
        Self(match usage.0 {
            1 => 8,
            2 => 7,
            3 => 6,
            4 => 5,
            5 => 4,
            _ => 3,
        })
    }
}

// `dy` of an offset is `dy_units * rows + dy_threads`, where `rows` is the
// threads-per-unit factor for threaded degrees and 1 otherwise.
struct OffsetTemplate {
    dx: i8,
    dy_units: i8,
    dy_threads: i8,
}

const fn off(dx: i8, dy_units: i8, dy_threads: i8) -> OffsetTemplate {
    OffsetTemplate {
        dx,
        dy_units,
        dy_threads,
    }
}

struct DegreeTraits {
    group_width: u32,
    group_height: u32,
    threaded: bool,
    offsets: &'static [OffsetTemplate],
}

#[rustfmt::skip]
static DEGREE_TRAITS: [DegreeTraits; 4] = [
    DegreeTraits {
        group_width: 1,
        group_height: 1,
        threaded: false,
        offsets: &[off(-1, 0, 0), off(-1, -1, 0), off(0, -1, 0), off(1, -1, 0)],
    },
    // 2x2 sub-blocks per block, visited in Z order.
    DegreeTraits {
        group_width: 2,
        group_height: 2,
        threaded: false,
        offsets: &[off(-1, 0, 0), off(-1, -1, 0), off(0, -1, 0), off(1, -2, 0), off(2, -2, 0)],
    },
    DegreeTraits {
        group_width: 1,
        group_height: 1,
        threaded: true,
        offsets: &[off(-1, 0, 0), off(-1, -1, 0), off(0, -1, 0), off(1, -1, 0), off(0, 0, -1)],
    },
    DegreeTraits {
        group_width: 2,
        group_height: 2,
        threaded: true,
        offsets: &[
            off(-1, 0, 0), off(-1, -1, 0), off(0, -1, 0),
            off(1, -2, 0), off(2, -2, 0), off(0, 0, -1),
        ],
    },
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ScoreboardDelta {
    pub dx: i8,
    pub dy: i8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Scoreboard {
    deltas: [ScoreboardDelta; MAX_SCOREBOARD_DEPS],
    mask: u8,
}

impl Scoreboard {
    fn from_deltas(deltas: impl IntoIterator<Item = ScoreboardDelta>) -> Self {
        let mut board = Self {
            deltas: [ScoreboardDelta::default(); MAX_SCOREBOARD_DEPS],
            mask: 0,
        };
        let mut len = 0;
        for delta in deltas {
            if board.deltas[..len].contains(&delta) {
                continue;
            }
            board.deltas[len] = delta;
            board.mask |= 1 << len;
            len += 1;
        }
        board
    }

    pub fn deltas(&self) -> &[ScoreboardDelta] {
        &self.deltas[..self.mask.count_ones() as usize]
    }

    pub fn mask(&self) -> u8 {
        self.mask
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Stride {
    pub dx: i32,
    pub dy: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WalkerParams {
    pub width: u32,
    pub height: u32,
    pub group_width: u32,
    pub group_height: u32,
    pub outer_stride: Stride,
    pub inner_stride: Stride,
    pub threads_per_unit: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionDispatch {
    pub slice_index: u32,
    pub lane: u32,
    pub start_x: u32,
    pub start_y: u32,
    pub diagonal_start: u32,
    pub diagonal_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WalkerPos {
    pub x: u32,
    pub y: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DispatchPlan {
    degree: WalkDegree,
    walker: WalkerParams,
    scoreboard: Scoreboard,
    regions: Vec<RegionDispatch>,
    slice_rows: Vec<(u32, u32)>,
    grid_width: u32,
    grid_height: u32,
    num_units_in_region: u32,
    max_height_in_region: u32,
}

impl DispatchPlan {
    pub fn build(
        table: &RegionTable,
        degree: WalkDegree,
        grid_width: u32,
        grid_height: u32,
        threads_per_unit: ThreadsPerUnit,
    ) -> Result<Self, ConfigError> {
        let grid = table.grid();
        if grid.width() != grid_width || grid.height() != grid_height {
            return Err(ConfigError::GridMismatch {
                table_w: grid.width(),
                table_h: grid.height(),
                plan_w: grid_width,
                plan_h: grid_height,
            });
        }
        if table.regions_per_slice().get() as usize > MAX_CONCURRENT_REGIONS {
            return Err(ConfigError::RegionsPerSlice(table.regions_per_slice().get()));
        }
        if table.regions().len() > MAX_CONCURRENT_REGIONS {
            return Err(ConfigError::TooManyRegions {
                regions: table.regions().len(),
            });
        }
        if table.regions().is_empty() || table.num_units_in_region() == 0 {
            return Err(ConfigError::InvalidUnitsInRegion);
        }

        let traits = degree.traits();
        let rows = if traits.threaded {
            threads_per_unit.get()
        } else {
            1
        };
        let group_width = traits.group_width;
        let group_height = traits.group_height * rows;

        let walker = WalkerParams {
            width: grid_width * group_width,
            height: grid_height * group_height,
            group_width,
            group_height,
            outer_stride: Stride {
                dx: group_width as i32,
                dy: 0,
            },
            inner_stride: Stride {
                dx: -2 * group_width as i32,
                dy: group_height as i32,
            },
            threads_per_unit: rows,
        };

        let scoreboard = Scoreboard::from_deltas(traits.offsets.iter().map(|o| ScoreboardDelta {
            dx: o.dx,
            dy: o.dy_units * rows as i8 + o.dy_threads,
        }));
        debug_assert!(scoreboard.deltas().len() <= MAX_SCOREBOARD_DEPS);

        let regions = table
            .regions()
            .iter()
            .map(|r| RegionDispatch {
                slice_index: r.slice_index,
                lane: r.lane,
                start_x: r.col_start * group_width,
                start_y: r.row_start * group_height,
                diagonal_start: r.diagonal_start,
                diagonal_count: r.diagonal_count,
            })
            .collect();

        debug!(
            ?degree,
            walker_width = walker.width,
            walker_height = walker.height,
            deps = scoreboard.deltas().len(),
            "built dispatch plan"
        );

        Ok(Self {
            degree,
            walker,
            scoreboard,
            regions,
            slice_rows: table
                .slices()
                .iter()
                .map(|s| (s.row_start, s.row_end))
                .collect(),
            grid_width,
            grid_height,
            num_units_in_region: table.num_units_in_region(),
            max_height_in_region: table.max_height_in_region(),
        })
    }

    pub fn degree(&self) -> WalkDegree {
        self.degree
    }

    pub fn walker(&self) -> &WalkerParams {
        &self.walker
    }

    pub fn scoreboard(&self) -> &Scoreboard {
        &self.scoreboard
    }

    pub fn regions(&self) -> &[RegionDispatch] {
        &self.regions
    }

    pub fn slice_count(&self) -> usize {
        self.slice_rows.len()
    }

    pub fn num_units_in_region(&self) -> u32 {
        self.num_units_in_region
    }

    pub fn max_height_in_region(&self) -> u32 {
        self.max_height_in_region
    }

    /// Walker rows `[start, end)` covered by a slice.
    pub fn slice_walker_rows(&self, slice: usize) -> (u32, u32) {
        let (start, end) = self.slice_rows[slice];
        (start * self.walker.group_height, end * self.walker.group_height)
    }

    /// Positions of one region in dispatch order.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not a region of this plan.
    pub fn walk_region(&self, index: usize) -> impl Iterator<Item = WalkerPos> + '_ {
        self.walk_dispatch(self.regions[index])
    }

    pub fn walk_slice(&self, slice: usize) -> impl Iterator<Item = WalkerPos> + '_ {
        self.regions
            .iter()
            .filter(move |r| r.slice_index as usize == slice)
            .flat_map(move |r| self.walk_dispatch(*r))
    }

    /// Scoreboard targets of `pos` that exist inside its slice.
    pub fn dependencies(&self, slice: usize, pos: WalkerPos) -> impl Iterator<Item = WalkerPos> + '_ {
        let (top, bottom) = self.slice_walker_rows(slice);
        let width = self.walker.width as i64;
        self.scoreboard.deltas().iter().filter_map(move |d| {
            let x = pos.x as i64 + d.dx as i64;
            let y = pos.y as i64 + d.dy as i64;
            if x < 0 || x >= width || y < top as i64 || y >= bottom as i64 {
                return None;
            }
            Some(WalkerPos {
                x: x as u32,
                y: y as u32,
            })
        })
    }

    fn walk_dispatch(&self, region: RegionDispatch) -> impl Iterator<Item = WalkerPos> + use<> {
        let (row_start, row_end) = self.slice_rows[region.slice_index as usize];
        let height = row_end - row_start;
        let width = self.grid_width;
        let gw = self.walker.group_width;
        let gh = self.walker.group_height;
        let first = region.diagonal_start;
        let last = region.diagonal_start + region.diagonal_count;

        (first..last)
            .flat_map(move |d| {
                (0..height).filter_map(move |y| {
                    let x = d.checked_sub(2 * y)?;
                    (x < width).then_some((x, row_start + y))
                })
            })
            .flat_map(move |(bx, by)| {
                (0..gh).flat_map(move |row| {
                    (0..gw).map(move |col| WalkerPos {
                        x: bx * gw + col,
                        y: by * gh + row,
                    })
                })
            })
    }

    /// Little-endian image of the plan for the kernel-dispatch side.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.regions.len() * 24);
        out.push(self.degree as u8);
        out.push(self.walker.threads_per_unit as u8);
        out.push(self.scoreboard.mask);
        out.push(self.regions.len() as u8);
        for v in [
            self.walker.width,
            self.walker.height,
            self.walker.group_width,
            self.walker.group_height,
        ] {
            out.extend_from_slice(&v.to_le_bytes());
        }
        for v in [
            self.walker.outer_stride.dx,
            self.walker.outer_stride.dy,
            self.walker.inner_stride.dx,
            self.walker.inner_stride.dy,
        ] {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out.extend_from_slice(&self.num_units_in_region.to_le_bytes());
        out.extend_from_slice(&self.max_height_in_region.to_le_bytes());
        for d in &self.scoreboard.deltas {
            out.push(d.dx as u8);
            out.push(d.dy as u8);
        }
        for r in &self.regions {
            for v in [
                r.slice_index,
                r.lane,
                r.start_x,
                r.start_y,
                r.diagonal_start,
                r.diagonal_count,
            ] {
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::grid::{Grid, SliceSpec};
    use crate::partition::{RegionsPerSlice, partition_regions};

    const ALL_DEGREES: [WalkDegree; 4] = [
        WalkDegree::Diagonal,
        WalkDegree::DiagonalZ,
        WalkDegree::DiagonalX,
        WalkDegree::DiagonalZX,
    ];

    fn table(width: u32, height: u32, bounds: &[u32], rps: u32) -> RegionTable {
        let grid = Grid::in_blocks(width, height, BlockSize::B64).unwrap();
        let slices: Vec<_> = bounds
            .windows(2)
            .map(|w| SliceSpec::rows(&grid, w[0], w[1], 30))
            .collect();
        partition_regions(&grid, &slices, RegionsPerSlice::new(rps).unwrap()).unwrap()
    }

    fn plan(table: &RegionTable, degree: WalkDegree, tpu: u8) -> DispatchPlan {
        let grid = table.grid();
        DispatchPlan::build(
            table,
            degree,
            grid.width(),
            grid.height(),
            ThreadsPerUnit::new(tpu).unwrap(),
        )
        .unwrap()
    }

    fn deltas(plan: &DispatchPlan) -> Vec<(i8, i8)> {
        plan.scoreboard().deltas().iter().map(|d| (d.dx, d.dy)).collect()
    }

    #[test]
    fn plain_diagonal_walker_and_scoreboard() {
        let t = table(8, 4, &[0, 4], 1);
        let p = plan(&t, WalkDegree::Diagonal, 5);

        assert_eq!(deltas(&p), vec![(-1, 0), (-1, -1), (0, -1), (1, -1)]);
        assert_eq!(p.scoreboard().mask(), 0b1111);
        let w = p.walker();
        assert_eq!((w.width, w.height), (8, 4));
        assert_eq!(w.outer_stride, Stride { dx: 1, dy: 0 });
        assert_eq!(w.inner_stride, Stride { dx: -2, dy: 1 });
        assert_eq!(w.threads_per_unit, 1);
    }

    #[test]
    fn threaded_degree_multiplies_height() {
        let t = table(8, 4, &[0, 4], 2);
        let p = plan(&t, WalkDegree::DiagonalX, 6);

        let w = p.walker();
        assert_eq!((w.width, w.height), (8, 24));
        assert_eq!(w.inner_stride, Stride { dx: -2, dy: 6 });
        assert_eq!(deltas(&p), vec![(-1, 0), (-1, -6), (0, -6), (1, -6), (0, -1)]);
        assert_eq!(p.regions()[1].start_y, t.regions()[1].row_start * 6);
    }

    #[test]
    fn z_variants_group_two_by_two() {
        let t = table(5, 3, &[0, 3], 1);
        let z = plan(&t, WalkDegree::DiagonalZ, 3);
        assert_eq!((z.walker().width, z.walker().height), (10, 6));
        assert_eq!(z.walker().outer_stride, Stride { dx: 2, dy: 0 });
        assert_eq!(deltas(&z), vec![(-1, 0), (-1, -1), (0, -1), (1, -2), (2, -2)]);

        let zx = plan(&t, WalkDegree::DiagonalZX, 4);
        assert_eq!((zx.walker().width, zx.walker().height), (10, 24));
        assert_eq!(
            deltas(&zx),
            vec![(-1, 0), (-1, -4), (0, -4), (1, -8), (2, -8), (0, -1)]
        );
        assert_eq!(zx.scoreboard().mask(), 0b11_1111);
    }

    #[test]
    fn build_is_deterministic() {
        let t = table(30, 17, &[0, 5, 11, 17], 4);
        for degree in ALL_DEGREES {
            let a = plan(&t, degree, 7);
            let b = plan(&t, degree, 7);
            assert_eq!(a, b);
            assert_eq!(a.to_bytes(), b.to_bytes());
        }
    }

    #[test]
    fn rejects_grid_mismatch() {
        let t = table(8, 4, &[0, 4], 2);
        let err = DispatchPlan::build(
            &t,
            WalkDegree::Diagonal,
            9,
            4,
            ThreadsPerUnit::new(3).unwrap(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::GridMismatch { plan_w: 9, .. }));
    }

    #[test]
    fn raw_degree_and_thread_bounds() {
        assert_eq!(WalkDegree::try_from(3).unwrap(), WalkDegree::DiagonalZX);
        assert_eq!(
            WalkDegree::try_from(4).unwrap_err(),
            ConfigError::UnsupportedDegree(4)
        );
        assert!(ThreadsPerUnit::new(2).is_err());
        assert!(ThreadsPerUnit::new(9).is_err());
        assert!(TargetUsage::new(0).is_err());
        assert!(TargetUsage::new(8).is_err());
    }

    #[test]
    fn degree_selection_follows_block_size_and_tier() {
        assert_eq!(
            WalkDegree::select(BlockSize::B64, TargetUsage::BEST_QUALITY),
            WalkDegree::DiagonalZX
        );
        assert_eq!(
            WalkDegree::select(BlockSize::B64, TargetUsage::BEST_SPEED),
            WalkDegree::DiagonalZ
        );
        assert_eq!(
            WalkDegree::select(BlockSize::B32, TargetUsage::BALANCED),
            WalkDegree::DiagonalX
        );
        assert_eq!(
            WalkDegree::select(BlockSize::B32, TargetUsage::new(5).unwrap()),
            WalkDegree::Diagonal
        );
        assert_eq!(ThreadsPerUnit::from(TargetUsage::BEST_QUALITY).get(), 8);
        assert_eq!(ThreadsPerUnit::from(TargetUsage::BEST_SPEED).get(), 3);
    }

    #[test]
    fn walk_visits_every_position_once() {
        let t = table(9, 7, &[0, 2, 7], 3);
        for degree in ALL_DEGREES {
            let p = plan(&t, degree, 4);
            let mut seen = HashSet::new();
            for slice in 0..p.slice_count() {
                for pos in p.walk_slice(slice) {
                    assert!(seen.insert(pos), "{degree:?} visits {pos:?} twice");
                }
            }
            let w = p.walker();
            assert_eq!(seen.len(), (w.width * w.height) as usize);
        }
    }

    #[test]
    fn dependencies_only_point_backwards() {
        let cases: [(u32, u32, &[u32], u32); 4] = [
            (8, 6, &[0, 6], 1),
            (13, 9, &[0, 4, 9], 3),
            (1, 5, &[0, 5], 2),
            (30, 17, &[0, 17], 4),
        ];
        for (width, height, bounds, rps) in cases {
            let t = table(width, height, bounds, rps);
            for degree in ALL_DEGREES {
                for tpu in [3, 8] {
                    let p = plan(&t, degree, tpu);
                    assert!(p.scoreboard().deltas().iter().all(|d| (d.dx, d.dy) != (0, 0)));
                    for slice in 0..p.slice_count() {
                        let mut visited = HashSet::new();
                        for pos in p.walk_slice(slice) {
                            for dep in p.dependencies(slice, pos) {
                                assert!(
                                    visited.contains(&dep),
                                    "{degree:?} tpu {tpu}: {pos:?} waits on unvisited {dep:?}"
                                );
                            }
                            visited.insert(pos);
                        }
                    }
                }
            }
        }
    }
}
