//! Token cost of a generation.
//!
//! Pure function of the request parameters so the front-end can quote a
//! price before submitting.

use crate::task::model::{ImageQuality, ImageSize};

fn base_cost(quality: ImageQuality) -> u64 {
    match quality {
        ImageQuality::Low => 1,
        ImageQuality::Medium => 2,
        ImageQuality::High => 4,
    }
}

/// Tokens charged for one task. Always at least 1.
///
/// Non-square canvases cost half again (rounded up). `multiplier` comes from
/// the prompt template; `0` is treated as `1`.
pub fn estimate_cost(quality: ImageQuality, size: ImageSize, multiplier: u32) -> u64 {
    let base = base_cost(quality);
    let sized = if size.is_square() {
        base
    } else {
        (base * 3).div_ceil(2)
    };
    sized.saturating_mul(u64::from(multiplier.max(1)))
}

pub fn is_high_cost(cost: u64, threshold: u64) -> bool {
    cost >= threshold
}
