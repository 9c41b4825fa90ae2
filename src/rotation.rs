use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::error::EngineError;
use crate::models::{RotationState, Strategy};
use crate::registry::{PoolMember, ProviderRegistry};

const SEQUENTIAL: u8 = 0;
const RANDOM: u8 = 1;

/// Picks the provider for each new generation request.
///
/// The sequential cursor and the pool size it was computed against live in one
/// `AtomicU64` (size in the high half, cursor in the low half), so resetting on a
/// pool-size change and advancing happen in the same compare-and-swap.
pub struct RotationScheduler {
    registry: Arc<ProviderRegistry>,
    strategy: AtomicU8,
    state: AtomicU64,
    rng: Mutex<StdRng>,
}

impl RotationScheduler {
    pub fn new(registry: Arc<ProviderRegistry>, strategy: Strategy, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            registry,
            strategy: AtomicU8::new(encode(strategy)),
            state: AtomicU64::new(0),
            rng: Mutex::new(rng),
        }
    }

    pub fn strategy(&self) -> Strategy {
        match self.strategy.load(Ordering::Acquire) {
            RANDOM => Strategy::Random,
            _ => Strategy::Sequential,
        }
    }

    /// Accepts only `sequential` or `random`; anything else leaves the state untouched.
    pub fn set_strategy(&self, value: &str) -> Result<Strategy, EngineError> {
        let strategy: Strategy = value.parse()?;
        let previous = self.strategy.swap(encode(strategy), Ordering::AcqRel);
        if previous != encode(strategy) {
            info!(strategy = %strategy, "rotation strategy changed");
        }
        Ok(strategy)
    }

    pub fn state(&self) -> RotationState {
        let (_, cursor) = unpack(self.state.load(Ordering::Acquire));
        RotationState {
            strategy: self.strategy(),
            cursor: cursor as usize,
        }
    }

    /// Select the provider for the next request from one snapshot of the pool.
    pub fn next(&self) -> Result<PoolMember, EngineError> {
        let mut pool = self.registry.pool();
        if pool.is_empty() {
            return Err(EngineError::NoProviderAvailable);
        }

        let strategy = self.strategy();
        let index = match strategy {
            Strategy::Sequential => self.advance(pool.len()),
            Strategy::Random => {
                let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
                rng.random_range(0..pool.len())
            }
        };

        let chosen = pool.swap_remove(index);
        debug!(provider = %chosen.name, strategy = %strategy, index, "provider selected");
        Ok(chosen)
    }

    /// Returns the index to use and moves the cursor one step, in a single atomic update.
    fn advance(&self, pool_len: usize) -> usize {
        let len = u32::try_from(pool_len).unwrap_or(u32::MAX);
        let step = |packed: u64| {
            let (seen_len, cursor) = unpack(packed);
            let current = if seen_len == len { cursor } else { 0 };
            (current, pack(len, (current + 1) % len))
        };

        let previous = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |packed| Some(step(packed).1))
            .unwrap_or_else(|packed| packed);

        let (seen_len, _) = unpack(previous);
        if seen_len != len && seen_len != 0 {
            debug!(from = seen_len, to = len, "provider pool size changed, rotation cursor reset");
        }
        step(previous).0 as usize
    }
}

fn encode(strategy: Strategy) -> u8 {
    match strategy {
        Strategy::Sequential => SEQUENTIAL,
        Strategy::Random => RANDOM,
    }
}

fn pack(len: u32, cursor: u32) -> u64 {
    (u64::from(len) << 32) | u64::from(cursor)
}

fn unpack(packed: u64) -> (u32, u32) {
    ((packed >> 32) as u32, packed as u32)
}
