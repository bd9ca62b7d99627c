use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const MAX_REF_DISTANCE: u32 = 16;
pub const MAX_HIERARCHY_LEVELS: u8 = 4;

/// Frame weights by BRC level, level 1 first.
pub const LEVEL_WEIGHTS: [f64; 4] = [1.0, 0.72, 0.55, 0.45];
pub const INTRA_WEIGHT: f64 = 2.5;

/// Rate-control classes: intra, then BRC levels 1..=4.
pub const CLASS_COUNT: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameType {
    I,
    P,
    B,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameKind {
    pub frame_type: FrameType,
    /// Pyramid depth; 0 for anchors.
    pub layer: u8,
}

impl FrameKind {
    pub const INTRA: Self = Self {
        frame_type: FrameType::I,
        layer: 0,
    };
    pub const PREDICTED: Self = Self {
        frame_type: FrameType::P,
        layer: 0,
    };

    pub const fn b(layer: u8) -> Self {
        Self {
            frame_type: FrameType::B,
            layer,
        }
    }

    pub fn is_intra(self) -> bool {
        self.frame_type == FrameType::I
    }

    pub fn level(self) -> BrcLevel {
        match self.frame_type {
            FrameType::I | FrameType::P => BrcLevel(1),
            FrameType::B => BrcLevel(self.layer.clamp(1, 3) + 1),
        }
    }

    pub fn class_index(self) -> usize {
        match self.frame_type {
            FrameType::I => 0,
            _ => self.level().get() as usize,
        }
    }

    pub fn weight(self) -> f64 {
        if self.is_intra() {
            INTRA_WEIGHT
        } else {
            self.level().weight()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BrcLevel(u8);

impl BrcLevel {
    pub fn get(self) -> u8 {
        self.0
    }

    pub fn weight(self) -> f64 {
        LEVEL_WEIGHTS[self.0 as usize - 1]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GopStructure {
    pub intra_period: u32,
    /// Distance between anchor frames; 1 means no B frames.
    pub ref_distance: u32,
    pub hierarchy_levels: u8,
}

impl Default for GopStructure {
    fn default() -> Self {
        Self {
            intra_period: 30,
            ref_distance: 1,
            hierarchy_levels: 1,
        }
    }
}

impl GopStructure {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.intra_period == 0 {
            return Err(ConfigError::Gop("intra period must be at least 1"));
        }
        if !(1..=MAX_REF_DISTANCE).contains(&self.ref_distance) {
            return Err(ConfigError::Gop("reference distance must be 1..=16"));
        }
        if self.ref_distance > self.intra_period {
            return Err(ConfigError::Gop("reference distance exceeds the intra period"));
        }
        if !(1..=MAX_HIERARCHY_LEVELS).contains(&self.hierarchy_levels) {
            return Err(ConfigError::Gop("hierarchy levels must be 1..=4"));
        }
        Ok(())
    }

    /// Kind of the frame at display position `frame_number`.
    pub fn kind_at(&self, frame_number: u64) -> FrameKind {
        let pos = frame_number % self.intra_period.max(1) as u64;
        if pos == 0 {
            return FrameKind::INTRA;
        }
        self.inter_kind((pos % self.ref_distance.max(1) as u64) as u32)
    }

    /// Scale that makes the weighted frame sizes of one intra period average
    /// out to the input bits per frame.
    pub fn weight_normalizer(&self) -> f64 {
        let period = self.intra_period.max(1) as u64;
        let distance = self.ref_distance.max(1) as u64;
        let mut total = INTRA_WEIGHT;
        for offset in 0..distance.min(period) {
            // Positions in 1..period sharing this offset; position 0 is intra.
            let mut count = (period - offset).div_ceil(distance);
            if offset == 0 {
                count -= 1;
            }
            total += count as f64 * self.inter_kind(offset as u32).weight();
        }
        period as f64 / total
    }

    fn inter_kind(&self, offset: u32) -> FrameKind {
        if offset == 0 {
            return FrameKind::PREDICTED;
        }
        let layer = pyramid_layer(offset, self.ref_distance.max(1));
        FrameKind::b(layer.min(self.hierarchy_levels.max(1)))
    }
}

// Depth of `offset` in a binary split of `(0, distance)`, starting at 1.
fn pyramid_layer(offset: u32, distance: u32) -> u8 {
    let (mut lo, mut hi) = (0, distance);
    let mut depth = 1u8;
    loop {
        let mid = (lo + hi) / 2;
        if offset == mid || hi - lo <= 2 {
            return depth;
        }
        if offset < mid {
            hi = mid;
        } else {
            lo = mid;
        }
        depth = depth.saturating_add(1);
    }
}
