//! A reusable spinning barrier.
//!
//! Waiting has no timeout: a participant that never arrives stalls every other participant
//! for good. An [`AbortToken`] releases the waiters with [`ChaseError::Aborted`]; a run aborts
//! it when one of its workers fails.

use crate::error::{ChaseError, Result};
use std::{
    hint,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
};

/// Spins this many times before yielding the CPU between checks.
const SPINS_BEFORE_YIELD: u32 = 1 << 10;

/// Cancels every current and future wait on the barriers sharing it.
#[derive(Debug, Clone, Default)]
pub struct AbortToken(Arc<AtomicBool>);

impl AbortToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Generation-counted rendezvous of a fixed number of participants.
///
/// Everything a participant did before [`wait`](Self::wait) happens-before everything
/// any participant does after the same wait returns.
#[derive(Debug)]
pub struct SpinBarrier {
    participants: usize,
    arrived: AtomicUsize,
    generation: AtomicUsize,
    abort: AbortToken,
}

impl SpinBarrier {
    pub fn new(participants: usize) -> Self {
        Self::with_abort(participants, AbortToken::new())
    }

    pub fn with_abort(participants: usize, abort: AbortToken) -> Self {
        assert!(participants > 0, "barrier without participants");
        SpinBarrier {
            participants,
            arrived: AtomicUsize::new(0),
            generation: AtomicUsize::new(0),
            abort,
        }
    }

    /// Blocks until all participants have called `wait` for the current generation.
    pub fn wait(&self) -> Result<()> {
        let generation = self.generation.load(Ordering::Acquire);
        if self.arrived.fetch_add(1, Ordering::AcqRel) + 1 == self.participants {
            self.arrived.store(0, Ordering::Relaxed);
            self.generation.fetch_add(1, Ordering::Release);
            return Ok(());
        }
        let mut spins = 0u32;
        while self.generation.load(Ordering::Acquire) == generation {
            if self.abort.is_aborted() {
                return Err(ChaseError::Aborted);
            }
            if spins < SPINS_BEFORE_YIELD {
                spins += 1;
                hint::spin_loop();
            } else {
                thread::yield_now();
            }
        }
        Ok(())
    }
}
