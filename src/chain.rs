//! Pointer chains.
//!
//! A chain is one contiguous array of pointer-sized [`Node`]s, viewed as
//! pages of cache lines of links. Only link 0 of each visited line takes part in the cycle,
//! so every step of a traversal lands on a different cache line.

pub mod permutation;

use crate::{
    config::AccessPattern,
    error::{ChaseError, Result},
    geometry::Geometry,
};
use permutation::Permutation;
use rand::Rng;
use std::ptr;

/// One pointer slot. `next` points at the following node of the cycle, or is null if unused.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Node {
    pub next: *const Node,
}

impl Node {
    const UNLINKED: Node = Node { next: ptr::null() };
}

/// Backing storage of a chain and the cycle linked through it.
pub struct Chain {
    nodes: Box<[Node]>,
    head: *const Node,
    ops: usize,
}

impl Chain {
    /// Allocates `links_per_chain` unlinked nodes.
    ///
    /// Every node is written, so all pages are faulted in under the calling thread's
    /// current memory policy.
    pub fn allocate(geometry: &Geometry) -> Self {
        Chain {
            nodes: vec![Node::UNLINKED; geometry.links_per_chain].into_boxed_slice(),
            head: ptr::null(),
            ops: 0,
        }
    }

    /// Links the nodes into a cycle visiting lines in the order given by `pattern`.
    ///
    /// Returns the number of nodes in the cycle.
    pub fn link(
        &mut self,
        geometry: &Geometry,
        pattern: AccessPattern,
        rng: &mut impl Rng,
    ) -> Result<usize> {
        let order = line_order(geometry, pattern, rng);
        let (&first, &last) = match (order.first(), order.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return Err(ChaseError::DegenerateGeometry("a chain visits no node")),
        };
        let link_of = |line: usize| line * geometry.links_per_line;
        assert!(order.iter().all(|&line| link_of(line) < self.nodes.len()));
        let base = self.nodes.as_mut_ptr();
        // SAFETY: every line index is below lines_per_chain, so every link index is
        // inside the node array, and all accesses go through `base`.
        unsafe {
            for pair in order.windows(2) {
                (*base.add(link_of(pair[0]))).next = base.add(link_of(pair[1]));
            }
            (*base.add(link_of(last))).next = base.add(link_of(first));
            self.head = base.add(link_of(first));
        }
        self.ops = order.len();
        Ok(self.ops)
    }

    /// First node of the cycle, null before [`link`](Self::link).
    pub fn head(&self) -> *const Node {
        self.head
    }

    /// Nodes visited in one full cycle.
    pub fn ops(&self) -> usize {
        self.ops
    }

    /// Follows the cycle once from the head and returns the visited link indices.
    pub fn walk(&self) -> Vec<usize> {
        let mut visited = Vec::with_capacity(self.ops);
        let mut node = self.head;
        while !node.is_null() && visited.len() <= self.nodes.len() {
            // SAFETY: linked nodes only point into `self.nodes`.
            unsafe {
                visited.push(node.offset_from(self.nodes.as_ptr()) as usize);
                node = (*node).next;
            }
            if node == self.head {
                break;
            }
        }
        visited
    }
}

/// Line indices within the chain in the order the pattern visits them.
pub fn line_order(geometry: &Geometry, pattern: AccessPattern, rng: &mut impl Rng) -> Vec<usize> {
    let lines = geometry.lines_per_chain;
    match pattern {
        AccessPattern::Random => {
            let pages = Permutation::random(&mut *rng, geometry.pages_per_chain);
            let mut order = Vec::with_capacity(lines);
            for page in pages.iter() {
                let within = Permutation::random(&mut *rng, geometry.lines_per_page);
                order.extend(within.iter().map(|line| page * geometry.lines_per_page + line));
            }
            order
        }
        AccessPattern::Forward { stride } => (0..lines).step_by(stride).collect(),
        AccessPattern::Reverse { stride } => {
            if lines == 0 {
                return Vec::new();
            }
            let last = (lines - 1) / stride * stride;
            (0..=last).rev().step_by(stride).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{SeedableRng, rngs::SmallRng};

    fn geometry(lines_per_page: usize, pages: usize) -> Geometry {
        Geometry::resolve(8, 64, 64 * lines_per_page, 64 * lines_per_page * pages)
    }

    #[test]
    fn forward_stride() {
        let g = geometry(10, 1);
        let mut rng = SmallRng::seed_from_u64(0);
        let mut chain = Chain::allocate(&g);
        assert_eq!(
            chain
                .link(&g, AccessPattern::Forward { stride: 3 }, &mut rng)
                .unwrap(),
            4
        );
        assert_eq!(chain.walk(), [0, 24, 48, 72]);
        // the last node leads back to the head
        let last = unsafe { chain.nodes.as_ptr().add(72) };
        assert_eq!(unsafe { (*last).next }, chain.head());
    }

    #[test]
    fn reverse_stride() {
        let g = geometry(10, 1);
        let mut rng = SmallRng::seed_from_u64(0);
        assert_eq!(
            line_order(&g, AccessPattern::Reverse { stride: 3 }, &mut rng),
            [9, 6, 3, 0]
        );
        assert_eq!(
            line_order(&g, AccessPattern::Reverse { stride: 4 }, &mut rng),
            [8, 4, 0]
        );
        let mut chain = Chain::allocate(&g);
        let ops = chain
            .link(&g, AccessPattern::Reverse { stride: 3 }, &mut rng)
            .unwrap();
        assert_eq!(ops, 4);
        assert_eq!(chain.walk(), [72, 48, 24, 0]);
    }

    #[test]
    fn stride_larger_than_chain() {
        let g = geometry(4, 1);
        let mut rng = SmallRng::seed_from_u64(0);
        for pattern in [
            AccessPattern::Forward { stride: 100 },
            AccessPattern::Reverse { stride: 100 },
        ] {
            assert_eq!(line_order(&g, pattern, &mut rng), [0]);
            let mut chain = Chain::allocate(&g);
            assert_eq!(chain.link(&g, pattern, &mut rng).unwrap(), 1);
            assert_eq!(unsafe { (*chain.head()).next }, chain.head());
        }
    }

    #[test]
    fn random_visits_every_line_page_by_page() {
        for (lines_per_page, pages) in [(64, 1), (5, 11), (13, 7), (1, 163), (8, 326)] {
            let g = geometry(lines_per_page, pages);
            let mut rng = SmallRng::seed_from_u64(lines_per_page as u64);
            let order = line_order(&g, AccessPattern::Random, &mut rng);
            assert_eq!(order.len(), g.lines_per_chain);
            let mut sorted = order.clone();
            sorted.sort_unstable();
            assert_eq!(sorted, (0..g.lines_per_chain).collect::<Vec<_>>());
            for page in order.chunks(lines_per_page) {
                let p = page[0] / lines_per_page;
                assert!(page.iter().all(|l| l / lines_per_page == p));
            }

            let mut chain = Chain::allocate(&g);
            assert_eq!(
                chain.link(&g, AccessPattern::Random, &mut rng).unwrap(),
                g.lines_per_chain
            );
            let walked = chain.walk();
            assert_eq!(walked.len(), g.lines_per_chain);
            assert!(walked.iter().all(|link| link % g.links_per_line == 0));
        }
    }

    #[test]
    fn same_seed_same_chain() {
        let g = geometry(16, 16);
        let a = line_order(&g, AccessPattern::Random, &mut SmallRng::seed_from_u64(7));
        let b = line_order(&g, AccessPattern::Random, &mut SmallRng::seed_from_u64(7));
        assert_eq!(a, b);
    }
}
