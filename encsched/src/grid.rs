use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;

pub const MAX_PICTURE_DIM: u32 = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockSize {
    B32,
    B64,
}

impl BlockSize {
    pub fn from_edge(edge: u32) -> Result<Self, ConfigError> {
        match edge {
            32 => Ok(Self::B32),
            64 => Ok(Self::B64),
            other => Err(ConfigError::BlockSize(other)),
        }
    }

    pub const fn edge(self) -> u32 {
        match self {
            Self::B32 => 32,
            Self::B64 => 64,
        }
    }

    pub const fn area(self) -> u32 {
        self.edge() * self.edge()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Grid {
    width: u32,
    height: u32,
    block_size: BlockSize,
}

impl Grid {
    pub fn from_pixels(width: u32, height: u32, block_size: BlockSize) -> Result<Self, ConfigError> {
        if !(1..=MAX_PICTURE_DIM).contains(&width) || !(1..=MAX_PICTURE_DIM).contains(&height) {
            return Err(ConfigError::InvalidDimensions { width, height });
        }
        let edge = block_size.edge();
        Ok(Self {
            width: width.div_ceil(edge),
            height: height.div_ceil(edge),
            block_size,
        })
    }

    pub fn in_blocks(width: u32, height: u32, block_size: BlockSize) -> Result<Self, ConfigError> {
        let edge = block_size.edge();
        let limit = MAX_PICTURE_DIM / edge;
        if !(1..=limit).contains(&width) || !(1..=limit).contains(&height) {
            return Err(ConfigError::InvalidDimensions {
                width: width.saturating_mul(edge),
                height: height.saturating_mul(edge),
            });
        }
        Ok(Self {
            width,
            height,
            block_size,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn block_size(&self) -> BlockSize {
        self.block_size
    }

    pub fn block_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn pixel_count(&self) -> u64 {
        self.block_count() as u64 * self.block_size.area() as u64
    }

    pub fn index(&self, x: u32, y: u32) -> usize {
        y as usize * self.width as usize + x as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceSpec {
    pub first_block: u32,
    pub block_count: u32,
    pub qp: u8,
}

impl SliceSpec {
    pub fn whole_picture(grid: &Grid, qp: u8) -> Self {
        Self {
            first_block: 0,
            block_count: grid.block_count() as u32,
            qp,
        }
    }

    pub fn rows(grid: &Grid, row_start: u32, row_end: u32, qp: u8) -> Self {
        Self {
            first_block: row_start * grid.width(),
            block_count: (row_end - row_start) * grid.width(),
            qp,
        }
    }

    fn end(&self) -> u64 {
        self.first_block as u64 + self.block_count as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slice {
    pub row_start: u32,
    pub row_end: u32,
    pub qp: u8,
}

impl Slice {
    pub fn height(&self) -> u32 {
        self.row_end - self.row_start
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceLayout {
    slices: Vec<Slice>,
    irregular: bool,
}

impl SliceLayout {
    /// Converts block-address slices into row ranges.
    ///
    /// Slices whose boundaries do not fall on row starts collapse into a single
    /// picture-wide slice carrying the first slice's QP.
    pub fn from_specs(grid: &Grid, specs: &[SliceSpec]) -> Result<Self, ConfigError> {
        if specs.is_empty() {
            return Err(ConfigError::SliceTable {
                index: 0,
                reason: "slice table is empty",
            });
        }

        let total = grid.block_count() as u64;
        let mut expected_start = 0u64;
        for (index, spec) in specs.iter().enumerate() {
            if spec.block_count == 0 {
                return Err(ConfigError::SliceTable {
                    index,
                    reason: "slice has no blocks",
                });
            }
            if spec.first_block as u64 != expected_start {
                return Err(ConfigError::SliceTable {
                    index,
                    reason: "slice does not start where the previous one ended",
                });
            }
            if spec.end() > total {
                return Err(ConfigError::SliceTable {
                    index,
                    reason: "slice runs past the end of the picture",
                });
            }
            expected_start = spec.end();
        }
        if expected_start != total {
            return Err(ConfigError::SliceTable {
                index: specs.len() - 1,
                reason: "slices do not cover the whole picture",
            });
        }

        let width = grid.width();
        let irregular = specs.iter().any(|s| !s.first_block.is_multiple_of(width));
        if irregular {
            debug!(
                slices = specs.len(),
                grid_width = width,
                "slice boundaries are not row aligned, partitioning as one slice"
            );
            return Ok(Self {
                slices: vec![Slice {
                    row_start: 0,
                    row_end: grid.height(),
                    qp: specs[0].qp,
                }],
                irregular: true,
            });
        }

        let slices = specs
            .iter()
            .map(|s| Slice {
                row_start: s.first_block / width,
                row_end: (s.end() / width as u64) as u32,
                qp: s.qp,
            })
            .collect();

        Ok(Self {
            slices,
            irregular: false,
        })
    }

    pub fn slices(&self) -> &[Slice] {
        &self.slices
    }

    pub fn is_irregular(&self) -> bool {
        self.irregular
    }

    pub fn into_slices(self) -> Vec<Slice> {
        self.slices
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_rounds_up_partial_blocks() {
        let grid = Grid::from_pixels(1920, 1080, BlockSize::B64).unwrap();
        assert_eq!(grid.width(), 30);
        assert_eq!(grid.height(), 17);

        let grid = Grid::from_pixels(1920, 1080, BlockSize::B32).unwrap();
        assert_eq!(grid.width(), 60);
        assert_eq!(grid.height(), 34);
    }

    #[test]
    fn grid_rejects_zero_and_oversized_pictures() {
        assert_eq!(
            Grid::from_pixels(0, 64, BlockSize::B32).unwrap_err(),
            ConfigError::InvalidDimensions { width: 0, height: 64 }
        );
        assert!(Grid::from_pixels(64, MAX_PICTURE_DIM + 1, BlockSize::B64).is_err());
        assert!(Grid::from_pixels(MAX_PICTURE_DIM, MAX_PICTURE_DIM, BlockSize::B64).is_ok());
    }

    #[test]
    fn block_size_from_edge() {
        assert_eq!(BlockSize::from_edge(64).unwrap(), BlockSize::B64);
        assert_eq!(BlockSize::from_edge(16).unwrap_err(), ConfigError::BlockSize(16));
    }

    #[test]
    fn regular_specs_become_row_ranges() {
        let grid = Grid::in_blocks(10, 6, BlockSize::B32).unwrap();
        let specs = [
            SliceSpec::rows(&grid, 0, 2, 30),
            SliceSpec::rows(&grid, 2, 6, 32),
        ];
        let layout = SliceLayout::from_specs(&grid, &specs).unwrap();
        assert!(!layout.is_irregular());
        assert_eq!(
            layout.slices(),
            &[
                Slice { row_start: 0, row_end: 2, qp: 30 },
                Slice { row_start: 2, row_end: 6, qp: 32 },
            ]
        );
    }

    #[test]
    fn unaligned_specs_fall_back_to_one_slice() {
        let grid = Grid::in_blocks(10, 6, BlockSize::B32).unwrap();
        let specs = [
            SliceSpec { first_block: 0, block_count: 15, qp: 26 },
            SliceSpec { first_block: 15, block_count: 45, qp: 28 },
        ];
        let layout = SliceLayout::from_specs(&grid, &specs).unwrap();
        assert!(layout.is_irregular());
        assert_eq!(layout.slices(), &[Slice { row_start: 0, row_end: 6, qp: 26 }]);
    }

    #[test]
    fn gaps_and_overruns_are_rejected() {
        let grid = Grid::in_blocks(4, 4, BlockSize::B64).unwrap();
        let gap = [
            SliceSpec { first_block: 0, block_count: 4, qp: 30 },
            SliceSpec { first_block: 8, block_count: 8, qp: 30 },
        ];
        assert!(matches!(
            SliceLayout::from_specs(&grid, &gap),
            Err(ConfigError::SliceTable { index: 1, .. })
        ));

        let short = [SliceSpec { first_block: 0, block_count: 12, qp: 30 }];
        assert!(SliceLayout::from_specs(&grid, &short).is_err());

        let over = [SliceSpec { first_block: 0, block_count: 17, qp: 30 }];
        assert!(SliceLayout::from_specs(&grid, &over).is_err());

        assert!(SliceLayout::from_specs(&grid, &[]).is_err());
    }
}
