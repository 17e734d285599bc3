use rand::rngs::StdRng;
use rand::SeedableRng;
use std::time::{SystemTime, UNIX_EPOCH};

/// Golden-ratio increment used to decorrelate derived seeds
const SEED_MIX: u64 = 0x9E37_79B9_7F4A_7C15;

/// Turn a user supplied seed into the generator seed
///
/// Non-negative seeds are used verbatim. A negative seed requests a new
/// time-based seed on every call, so results are not reproducible.
pub fn resolve_seed(seed: i64) -> u64 {
    if seed >= 0 {
        seed as u64
    } else {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(SEED_MIX)
    }
}

/// Independent generator for one point of a parallel loop
///
/// ### Params
///
/// * `base` - Resolved seed of the run
/// * `point` - Index of the point the generator belongs to
/// * `stream` - Separates multiple passes over the same points
pub fn point_rng(base: u64, point: usize, stream: u64) -> StdRng {
    let mixed = base
        ^ (point as u64).wrapping_add(1).wrapping_mul(SEED_MIX)
        ^ stream.wrapping_mul(SEED_MIX.rotate_left(17));
    StdRng::seed_from_u64(mixed)
}
