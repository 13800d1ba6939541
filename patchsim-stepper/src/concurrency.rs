//! Deterministic per-patch RNG seeding, independent of visit order (DESIGN.md
//! Open Question 2). Entity id allocation itself is `patchsim_core`'s
//! `EntityAllocator`, reused unchanged here since its `parking_lot::Mutex`
//! guarding already makes it safe to share across the worker pool.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::patchset::PatchCoord;

/// A cooperative stop flag a caller holds alongside a running `Stepper` and
/// flips from another thread. Grounded on the teacher's `AtomicUsize`
/// dependency-count coordination in `system.rs`'s `StageExecutor` — the same
/// "plain atomic, checked between units of work" idiom, here checked once per
/// substep barrier rather than once per scheduled system.
///
/// Per spec.md §5: "a run may be cancelled between substeps. In-flight
/// handler evaluations do not observe cancellation; the scheduler checks at
/// each barrier and terminates cleanly after the current substep." This type
/// only carries the flag; `Stepper::run` is responsible for checking it after
/// every substep and stopping before the next one starts.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        CancellationToken { flag: Arc::new(AtomicBool::new(false)) }
    }

    /// Requests cancellation; takes effect at the next substep barrier the
    /// scheduler checks, not immediately.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Mixes a 64-bit seed with a patch coordinate into a new 64-bit seed.
/// A splitmix64-style finalizer — cheap, well-distributed, and, unlike
/// hashing the coordinate through `fxhash`, stable across process runs
/// without depending on a build-time random hasher state.
fn mix(seed: u64, row: i64, col: i64) -> u64 {
    let mut x = seed ^ (row as u64).wrapping_mul(0x9E3779B97F4A7C15) ^ (col as u64).wrapping_mul(0xC2B2AE3D27D4EB4F);
    x ^= x >> 30;
    x = x.wrapping_mul(0xBF58476D1CE4E5B9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94D049BB133111EB);
    x ^= x >> 31;
    x
}

/// Produces one independent, reproducible `ChaCha8Rng` per patch coordinate
/// from a single run-level seed. Coordinate-based (not visit-order-based)
/// so that a `rayon`-parallel run and a sequential run seed every patch
/// identically.
#[derive(Clone, Debug)]
pub struct RngStream {
    seed: u64,
}

impl RngStream {
    pub fn new(seed: u64) -> Self {
        RngStream { seed }
    }

    pub fn rng_for(&self, coord: PatchCoord) -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(mix(self.seed, coord.0, coord.1))
    }

    /// The simulation entity's own stream, domain-separated from every patch
    /// coordinate by a sentinel that no real `(row, col)` patch can collide
    /// with (`i64::MIN` is never a valid row or column for a grid built from
    /// `Extent`, which always has non-negative width/height).
    pub fn simulation_rng(&self) -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(mix(self.seed, i64::MIN, i64::MIN))
    }
}
