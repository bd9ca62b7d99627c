use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fps {
    pub num: u32,
    pub den: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FpsError {
    #[error("fps num must be > 0")]
    ZeroNum,
    #[error("fps den must be > 0")]
    ZeroDen,
}

impl Fps {
    pub fn new(num: u32, den: u32) -> Result<Self, FpsError> {
        if num == 0 {
            return Err(FpsError::ZeroNum);
        }
        if den == 0 {
            return Err(FpsError::ZeroDen);
        }
        let g = gcd(num, den);
        Ok(Self {
            num: num / g,
            den: den / g,
        })
    }

    pub fn from_int(fps: u32) -> Result<Self, FpsError> {
        Self::new(fps, 1)
    }

    /// Re-checks a value that may have bypassed `new`, e.g. through serde.
    pub fn validated(self) -> Result<Self, FpsError> {
        Self::new(self.num, self.den)
    }

    pub fn as_f64(self) -> f64 {
        self.num as f64 / self.den as f64
    }

    pub fn bits_per_frame(self, bitrate: u64) -> f64 {
        bitrate as f64 * self.den as f64 / self.num as f64
    }
}

impl Default for Fps {
    fn default() -> Self {
        Self { num: 30, den: 1 }
    }
}

const fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        let t = b;
        b = a % b;
        a = t;
    }
    if a == 0 { 1 } else { a }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_accepts_valid_num_den() {
        let fps = Fps::new(30, 1).unwrap();
        assert_eq!(fps.num, 30);
        assert_eq!(fps.den, 1);
    }

    #[test]
    fn new_rejects_zero_num() {
        assert_eq!(Fps::new(0, 1).unwrap_err(), FpsError::ZeroNum);
    }

    #[test]
    fn new_rejects_zero_den() {
        assert_eq!(Fps::new(1, 0).unwrap_err(), FpsError::ZeroDen);
    }

    #[test]
    fn new_normalizes_ratio() {
        assert_eq!(Fps::new(60, 2).unwrap(), Fps { num: 30, den: 1 });
    }

    #[test]
    fn validated_catches_deserialized_zero() {
        let raw = Fps { num: 25, den: 0 };
        assert_eq!(raw.validated().unwrap_err(), FpsError::ZeroDen);
    }

    #[test]
    fn bits_per_frame_uses_exact_ratio() {
        let fps = Fps::new(30_000, 1_001).unwrap();
        let bits = fps.bits_per_frame(30_000_000);
        assert!((bits - 1_001_000.0).abs() < 1e-6);
        assert_eq!(Fps::from_int(30).unwrap().bits_per_frame(4_000_000).round(), 133_333.0);
    }
}
