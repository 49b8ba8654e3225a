use std::time::SystemTime;

use rand::rngs::StdRng;
pub use rand::Rng;
use rand::SeedableRng;
use tokio::time::Duration;

pub fn rng_seed_now() -> StdRng {
    StdRng::seed_from_u64(
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_nanos() as u64, // max 584 years
    )
}

// Uniformly random duration in [0, max).
pub fn jitter(rng: &mut StdRng, max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    max.mul_f64(rng.gen::<f64>())
}
