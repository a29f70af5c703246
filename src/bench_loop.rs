//! The inner pointer chasing loop.
//!
//! A [`LoopCompiler`] turns a [`LoopSpec`] into a [`BenchmarkLoop`] specialized to one thread's
//! chains. [`PortableCompiler`] specializes at compile time instead of generating code at run time:
//! every combination of chain count (up to [`MAX_UNROLLED_CHAINS`]) and prefetch hint is a separate
//! monomorphization, so the chain cursors live in registers and the hint costs no branch.
//! Loads go through [`ptr::read_volatile`], which the optimizer may neither remove nor merge,
//! and the final cursors are written back to the caller.

use crate::{chain::Node, config::PrefetchHint};
use std::ptr;

/// Chain counts above this use a loop over a cursor slice.
pub const MAX_UNROLLED_CHAINS: usize = 8;

/// What a benchmark loop is specialized to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopSpec {
    pub chains: usize,
    /// Signed stride of the access pattern. The portable loop does not need it.
    pub stride: i64,
    pub prefetch: PrefetchHint,
    /// Padding instructions executed after each step of all chains.
    pub loop_length: usize,
}

/// One thread's traversal routine.
pub trait BenchmarkLoop {
    /// Advances every chain one node at a time until chain 0 is back at its head,
    /// then stores the cursor of each chain in `positions`.
    ///
    /// # Safety
    ///
    /// `heads` must hold one pointer per chain the loop was compiled for, each the head of a linked,
    /// live cycle, and all cycles must have at least as many nodes as chain 0.
    unsafe fn traverse(&self, heads: &[*const Node], positions: &mut [*const Node]);
}

pub trait LoopCompiler {
    fn compile(&self, spec: &LoopSpec) -> Box<dyn BenchmarkLoop>;
}

/// Builds loops out of precompiled, const-generic variants.
#[derive(Debug, Default, Clone, Copy)]
pub struct PortableCompiler;

const NONE: u8 = 0;
const NTA: u8 = 1;
const T0: u8 = 2;
const T1: u8 = 3;
const T2: u8 = 4;

/// The hint actually issued on this target. Unsupported hints become [`PrefetchHint::None`].
pub fn supported_hint(hint: PrefetchHint) -> PrefetchHint {
    if cfg!(any(target_arch = "x86_64", target_arch = "x86")) {
        hint
    } else {
        PrefetchHint::None
    }
}

impl LoopCompiler for PortableCompiler {
    fn compile(&self, spec: &LoopSpec) -> Box<dyn BenchmarkLoop> {
        let hint = supported_hint(spec.prefetch);
        if hint != spec.prefetch {
            tracing::debug!(requested = %spec.prefetch, "prefetch hint unsupported, using none");
        }
        match hint {
            PrefetchHint::None => unrolled::<NONE>(spec),
            PrefetchHint::Nta => unrolled::<NTA>(spec),
            PrefetchHint::T0 => unrolled::<T0>(spec),
            PrefetchHint::T1 => unrolled::<T1>(spec),
            PrefetchHint::T2 => unrolled::<T2>(spec),
        }
    }
}

fn unrolled<const HINT: u8>(spec: &LoopSpec) -> Box<dyn BenchmarkLoop> {
    let pad = spec.loop_length;
    match spec.chains {
        1 => Box::new(Unrolled::<1, HINT> { pad }),
        2 => Box::new(Unrolled::<2, HINT> { pad }),
        3 => Box::new(Unrolled::<3, HINT> { pad }),
        4 => Box::new(Unrolled::<4, HINT> { pad }),
        5 => Box::new(Unrolled::<5, HINT> { pad }),
        6 => Box::new(Unrolled::<6, HINT> { pad }),
        7 => Box::new(Unrolled::<7, HINT> { pad }),
        8 => Box::new(Unrolled::<8, HINT> { pad }),
        chains => Box::new(Sliced::<HINT> { chains, pad }),
    }
}

struct Unrolled<const N: usize, const HINT: u8> {
    pad: usize,
}

impl<const N: usize, const HINT: u8> BenchmarkLoop for Unrolled<N, HINT> {
    unsafe fn traverse(&self, heads: &[*const Node], positions: &mut [*const Node]) {
        let mut cursor = [ptr::null::<Node>(); N];
        cursor.copy_from_slice(&heads[..N]);
        let head = cursor[0];
        loop {
            for c in &mut cursor {
                // SAFETY: the caller guarantees every cursor walks a live cycle.
                *c = unsafe { step::<HINT>(*c) };
            }
            pad(self.pad);
            if cursor[0] == head {
                break;
            }
        }
        positions[..N].copy_from_slice(&cursor);
    }
}

struct Sliced<const HINT: u8> {
    chains: usize,
    pad: usize,
}

impl<const HINT: u8> BenchmarkLoop for Sliced<HINT> {
    unsafe fn traverse(&self, heads: &[*const Node], positions: &mut [*const Node]) {
        let cursor = &mut positions[..self.chains];
        cursor.copy_from_slice(&heads[..self.chains]);
        let head = cursor[0];
        loop {
            for c in cursor.iter_mut() {
                // SAFETY: as above.
                *c = unsafe { step::<HINT>(*c) };
            }
            pad(self.pad);
            if cursor[0] == head {
                break;
            }
        }
    }
}

/// Loads the successor of `node` and issues the prefetch hint for it.
#[inline(always)]
unsafe fn step<const HINT: u8>(node: *const Node) -> *const Node {
    // SAFETY: forwarded from the caller.
    let next = unsafe { ptr::read_volatile(ptr::addr_of!((*node).next)) };
    prefetch::<HINT>(next);
    next
}

#[inline(always)]
fn prefetch<const HINT: u8>(p: *const Node) {
    #[cfg(target_arch = "x86_64")]
    use std::arch::x86_64::{_MM_HINT_NTA, _MM_HINT_T0, _MM_HINT_T1, _MM_HINT_T2, _mm_prefetch};
    #[cfg(target_arch = "x86")]
    use std::arch::x86::{_MM_HINT_NTA, _MM_HINT_T0, _MM_HINT_T1, _MM_HINT_T2, _mm_prefetch};

    #[cfg(any(target_arch = "x86_64", target_arch = "x86"))]
    // SAFETY: prefetching is a hint and never faults, whatever the address.
    unsafe {
        let p = p.cast::<i8>();
        match HINT {
            NTA => _mm_prefetch::<_MM_HINT_NTA>(p),
            T0 => _mm_prefetch::<_MM_HINT_T0>(p),
            T1 => _mm_prefetch::<_MM_HINT_T1>(p),
            T2 => _mm_prefetch::<_MM_HINT_T2>(p),
            _ => {}
        }
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "x86")))]
    let _ = p;
}

#[inline(always)]
fn pad(cycles: usize) {
    for _ in 0..cycles {
        #[cfg(any(target_arch = "x86_64", target_arch = "x86", target_arch = "aarch64"))]
        // SAFETY: a nop has no effect on memory, stack or flags.
        unsafe {
            std::arch::asm!("nop", options(nomem, nostack, preserves_flags));
        }
        #[cfg(not(any(target_arch = "x86_64", target_arch = "x86", target_arch = "aarch64")))]
        std::hint::black_box(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{chain::Chain, config::AccessPattern, geometry::Geometry};
    use rand::{SeedableRng, rngs::SmallRng};

    fn chains(n: usize, pattern: AccessPattern) -> Vec<Chain> {
        let g = Geometry::resolve(8, 64, 512, 4096);
        let mut rng = SmallRng::seed_from_u64(1);
        (0..n)
            .map(|_| {
                let mut c = Chain::allocate(&g);
                c.link(&g, pattern, &mut rng).unwrap();
                c
            })
            .collect()
    }

    #[test]
    fn one_call_is_one_cycle() {
        let hints = [
            PrefetchHint::None,
            PrefetchHint::Nta,
            PrefetchHint::T0,
            PrefetchHint::T1,
            PrefetchHint::T2,
        ];
        for n in [1, 2, 3, MAX_UNROLLED_CHAINS, MAX_UNROLLED_CHAINS + 3] {
            for prefetch in hints {
                for pattern in [
                    AccessPattern::Random,
                    AccessPattern::Forward { stride: 3 },
                    AccessPattern::Reverse { stride: 2 },
                ] {
                    let chains = chains(n, pattern);
                    let heads: Vec<_> = chains.iter().map(Chain::head).collect();
                    let mut positions = vec![ptr::null(); n];
                    let bench = PortableCompiler.compile(&LoopSpec {
                        chains: n,
                        stride: pattern.stride(),
                        prefetch,
                        loop_length: 3,
                    });
                    unsafe { bench.traverse(&heads, &mut positions) };
                    assert_eq!(positions, heads, "{n} chains, {prefetch}, {pattern:?}");
                }
            }
        }
    }

    #[test]
    fn unsupported_hints_degrade() {
        assert_eq!(supported_hint(PrefetchHint::None), PrefetchHint::None);
        if cfg!(target_arch = "x86_64") {
            assert_eq!(supported_hint(PrefetchHint::T1), PrefetchHint::T1);
        } else {
            assert_eq!(supported_hint(PrefetchHint::T1), PrefetchHint::None);
        }
    }
}
