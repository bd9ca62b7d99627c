//! Region partitioning for wavefront dispatch.
//!
//! Blocks of a slice are visited along 26-degree diagonals: every block on
//! diagonal `d` satisfies `x + 2y = d` (slice-relative), so a slice `W` blocks
//! wide and `H` rows tall has `W + 2(H - 1)` diagonals. Each slice is split into
//! `regions_per_slice` lanes, each owning a contiguous run of diagonals.

use tracing::debug;

use crate::error::ConfigError;
use crate::grid::{Grid, Slice, SliceLayout, SliceSpec};

pub const MAX_CONCURRENT_REGIONS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionsPerSlice(u8);

impl RegionsPerSlice {
    pub const ONE: Self = Self(1);

    pub fn new(count: u32) -> Result<Self, ConfigError> {
        if !(1..=MAX_CONCURRENT_REGIONS as u32).contains(&count) {
            return Err(ConfigError::RegionsPerSlice(count));
        }
        Ok(Self(count as u8))
    }

    pub fn get(self) -> u32 {
        self.0 as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Region {
    pub slice_index: u32,
    pub lane: u32,
    pub col_start: u32,
    pub row_start: u32,
    pub diagonal_start: u32,
    pub diagonal_count: u32,
}

impl Region {
    pub fn is_empty(&self) -> bool {
        self.diagonal_count == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionTable {
    grid: Grid,
    slices: Vec<Slice>,
    regions: Vec<Region>,
    regions_per_slice: RegionsPerSlice,
    num_units_in_region: u32,
    max_height_in_region: u32,
    irregular_fallback: bool,
}

impl RegionTable {
    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    /// Slices after irregular fallback and merging.
    pub fn slices(&self) -> &[Slice] {
        &self.slices
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn regions_of_slice(&self, slice_index: usize) -> &[Region] {
        let per = self.regions_per_slice.get() as usize;
        &self.regions[slice_index * per..(slice_index + 1) * per]
    }

    pub fn regions_per_slice(&self) -> RegionsPerSlice {
        self.regions_per_slice
    }

    pub fn num_units_in_region(&self) -> u32 {
        self.num_units_in_region
    }

    pub fn max_height_in_region(&self) -> u32 {
        self.max_height_in_region
    }

    pub fn irregular_fallback(&self) -> bool {
        self.irregular_fallback
    }
}

pub fn diagonal_count(width: u32, height: u32) -> u32 {
    width + 2 * (height - 1)
}

/// Topmost block on diagonal `d` of a `width` x `height` area, if any.
pub fn diagonal_origin(width: u32, height: u32, d: u32) -> Option<(u32, u32)> {
    let y = if d < width {
        0
    } else {
        (d - (width - 1)).div_ceil(2)
    };
    let x = d.checked_sub(2 * y)?;
    if x >= width || y >= height {
        return None;
    }
    Some((x, y))
}

pub fn partition_regions(
    grid: &Grid,
    slices: &[SliceSpec],
    regions_per_slice: RegionsPerSlice,
) -> Result<RegionTable, ConfigError> {
    let layout = SliceLayout::from_specs(grid, slices)?;
    let irregular_fallback = layout.is_irregular();
    let per_slice = regions_per_slice.get() as usize;
    let merged = merge_slices(layout.into_slices(), per_slice);

    let width = grid.width();
    let max_height_in_region = merged.iter().map(Slice::height).max().unwrap_or(1);
    let num_units_in_region =
        diagonal_count(width, max_height_in_region).div_ceil(regions_per_slice.get());

    let mut regions = Vec::with_capacity(merged.len() * per_slice);
    for (slice_index, slice) in merged.iter().enumerate() {
        let height = slice.height();
        let total = diagonal_count(width, height);
        for lane in 0..regions_per_slice.get() {
            let start = lane * num_units_in_region;
            let span = num_units_in_region.min(total.saturating_sub(start));
            let origin = (start..start + span)
                .find_map(|d| diagonal_origin(width, height, d).map(|xy| (d, xy)));

            let region = match origin {
                Some((d, (x, y))) => Region {
                    slice_index: slice_index as u32,
                    lane,
                    col_start: x,
                    row_start: slice.row_start + y,
                    diagonal_start: d,
                    diagonal_count: start + span - d,
                },
                None => Region {
                    slice_index: slice_index as u32,
                    lane,
                    col_start: 0,
                    row_start: slice.row_start,
                    diagonal_start: start.min(total),
                    diagonal_count: 0,
                },
            };
            regions.push(region);
        }
    }

    debug!(
        slices = merged.len(),
        regions = regions.len(),
        num_units_in_region,
        max_height_in_region,
        irregular_fallback,
        "partitioned frame into regions"
    );

    Ok(RegionTable {
        grid: *grid,
        slices: merged,
        regions,
        regions_per_slice,
        num_units_in_region,
        max_height_in_region,
        irregular_fallback,
    })
}

fn merge_slices(mut slices: Vec<Slice>, per_slice: usize) -> Vec<Slice> {
    while slices.len() > 1 && slices.len() * per_slice > MAX_CONCURRENT_REGIONS {
        let best = (0..slices.len() - 1)
            .min_by_key(|&i| {
                let merged = slices[i].height() + slices[i + 1].height();
                let others = slices
                    .iter()
                    .enumerate()
                    .filter(|&(j, _)| j != i && j != i + 1)
                    .map(|(_, s)| s.height())
                    .max()
                    .unwrap_or(0);
                (merged.max(others), merged)
            })
            .unwrap_or(0);

        let absorbed = slices.remove(best + 1);
        slices[best].row_end = absorbed.row_end;
        debug!(
            index = best,
            rows = slices[best].height(),
            remaining = slices.len(),
            "merged adjacent slices to fit the region limit"
        );
    }
    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::BlockSize;

    fn rows_of(grid: &Grid, bounds: &[u32]) -> Vec<SliceSpec> {
        bounds
            .windows(2)
            .map(|w| SliceSpec::rows(grid, w[0], w[1], 30))
            .collect()
    }

    #[test]
    fn regions_per_slice_bounds() {
        assert!(RegionsPerSlice::new(0).is_err());
        assert!(RegionsPerSlice::new(17).is_err());
        assert_eq!(RegionsPerSlice::new(16).unwrap().get(), 16);
    }

    #[test]
    fn single_slice_four_lanes_on_64x36() {
        let grid = Grid::in_blocks(64, 36, BlockSize::B32).unwrap();
        let slices = [SliceSpec::whole_picture(&grid, 30)];
        let table = partition_regions(&grid, &slices, RegionsPerSlice::new(4).unwrap()).unwrap();

        assert_eq!(table.regions().len(), 4);
        assert_eq!(table.num_units_in_region(), 34);
        assert_eq!(table.max_height_in_region(), 36);

        let starts: Vec<_> = table
            .regions()
            .iter()
            .map(|r| (r.col_start, r.row_start, r.diagonal_start))
            .collect();
        assert_eq!(starts, vec![(0, 0, 0), (34, 0, 34), (62, 3, 68), (62, 20, 102)]);
        let counts: Vec<_> = table.regions().iter().map(|r| r.diagonal_count).collect();
        assert_eq!(counts, vec![34, 34, 34, 32]);
    }

    #[test]
    fn diagonal_origin_alternates_columns_past_right_edge() {
        assert_eq!(diagonal_origin(8, 10, 7), Some((7, 0)));
        assert_eq!(diagonal_origin(8, 10, 8), Some((6, 1)));
        assert_eq!(diagonal_origin(8, 10, 9), Some((7, 1)));
        assert_eq!(diagonal_origin(8, 10, 10), Some((6, 2)));
        assert_eq!(diagonal_origin(8, 2, 10), None);
        assert_eq!(diagonal_origin(1, 4, 1), None);
        assert_eq!(diagonal_origin(1, 4, 2), Some((0, 1)));
    }

    #[test]
    fn one_region_per_slice_covers_all_diagonals() {
        let grid = Grid::in_blocks(20, 8, BlockSize::B64).unwrap();
        let slices = rows_of(&grid, &[0, 4, 8]);
        let table = partition_regions(&grid, &slices, RegionsPerSlice::ONE).unwrap();

        assert_eq!(table.regions().len(), 2);
        assert_eq!(table.num_units_in_region(), 20 + 2 * 3);
        for (region, slice) in table.regions().iter().zip(table.slices()) {
            assert_eq!(region.col_start, 0);
            assert_eq!(region.row_start, slice.row_start);
            assert_eq!(region.diagonal_count, 26);
        }
    }

    #[test]
    fn merges_until_region_limit_is_met() {
        let grid = Grid::in_blocks(16, 12, BlockSize::B32).unwrap();
        let slices = rows_of(&grid, &[0, 1, 2, 4, 8, 12]);
        let table = partition_regions(&grid, &slices, RegionsPerSlice::new(4).unwrap()).unwrap();

        assert_eq!(table.slices().len(), 4);
        assert_eq!(table.regions().len(), 16);
        let bounds: Vec<_> = table.slices().iter().map(|s| (s.row_start, s.row_end)).collect();
        assert_eq!(bounds, vec![(0, 2), (2, 4), (4, 8), (8, 12)]);
    }

    #[test]
    fn merge_prefers_smallest_resulting_maximum() {
        let slices = vec![
            Slice { row_start: 0, row_end: 5, qp: 1 },
            Slice { row_start: 5, row_end: 6, qp: 2 },
            Slice { row_start: 6, row_end: 8, qp: 3 },
            Slice { row_start: 8, row_end: 14, qp: 4 },
        ];
        let merged = merge_slices(slices, 5);
        assert_eq!(
            merged,
            vec![
                Slice { row_start: 0, row_end: 5, qp: 1 },
                Slice { row_start: 5, row_end: 8, qp: 2 },
                Slice { row_start: 8, row_end: 14, qp: 4 },
            ]
        );
    }

    #[test]
    fn irregular_slices_partition_as_one() {
        let grid = Grid::in_blocks(10, 6, BlockSize::B32).unwrap();
        let slices = [
            SliceSpec { first_block: 0, block_count: 25, qp: 27 },
            SliceSpec { first_block: 25, block_count: 35, qp: 29 },
        ];
        let table = partition_regions(&grid, &slices, RegionsPerSlice::new(2).unwrap()).unwrap();
        assert!(table.irregular_fallback());
        assert_eq!(table.slices().len(), 1);
        assert_eq!(table.regions().len(), 2);
        assert_eq!(table.num_units_in_region(), (10 + 10u32).div_ceil(2));
    }

    #[test]
    fn lanes_beyond_a_short_slice_are_empty() {
        let grid = Grid::in_blocks(4, 9, BlockSize::B32).unwrap();
        let slices = rows_of(&grid, &[0, 8, 9]);
        let table = partition_regions(&grid, &slices, RegionsPerSlice::new(4).unwrap()).unwrap();

        let short = table.regions_of_slice(1);
        assert_eq!(short[0].diagonal_count, 4);
        assert!(short[1..].iter().all(Region::is_empty));
        assert!(short[1..].iter().all(|r| r.row_start == 8));
    }

    #[test]
    fn single_column_grid_skips_empty_diagonals() {
        let grid = Grid::in_blocks(1, 8, BlockSize::B64).unwrap();
        let slices = [SliceSpec::whole_picture(&grid, 30)];
        let table = partition_regions(&grid, &slices, RegionsPerSlice::new(3).unwrap()).unwrap();

        assert_eq!(table.num_units_in_region(), 5);
        let lane1 = table.regions()[1];
        assert_eq!(lane1.diagonal_start, 6);
        assert_eq!((lane1.col_start, lane1.row_start), (0, 3));
        assert_eq!(lane1.diagonal_count, 4);
    }

    #[test]
    fn region_total_never_exceeds_limit() {
        for width in [1u32, 3, 17, 64] {
            for height in [1u32, 2, 7, 36] {
                let grid = Grid::in_blocks(width, height, BlockSize::B32).unwrap();
                let bounds: Vec<u32> = (0..=height).collect();
                let slices = rows_of(&grid, &bounds);
                for rps in 1..=16 {
                    let table =
                        partition_regions(&grid, &slices, RegionsPerSlice::new(rps).unwrap())
                            .unwrap();
                    assert!(table.regions().len() <= MAX_CONCURRENT_REGIONS);
                    assert_eq!(table.regions().len(), table.slices().len() * rps as usize);
                }
            }
        }
    }
}
