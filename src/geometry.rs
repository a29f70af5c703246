//! Derivation of line, page and chain counts from requested byte sizes.

use crate::error::{ChaseError, Result};

/// Sizes and counts shared by every chain of a run.
///
/// All `bytes_per_*` fields are exact multiples of their constituent unit.
/// Requested sizes are rounded up, so they are a lower bound on what is allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub pointer_size: usize,
    pub bytes_per_line: usize,
    pub bytes_per_page: usize,
    pub bytes_per_chain: usize,
    pub lines_per_page: usize,
    pub pages_per_chain: usize,
    pub links_per_line: usize,
    pub links_per_page: usize,
    pub lines_per_chain: usize,
    pub links_per_chain: usize,
}

impl Geometry {
    /// Rounds page and chain sizes up to whole lines and pages.
    ///
    /// All arguments must be positive.
    pub fn resolve(
        pointer_size: usize,
        bytes_per_line: usize,
        bytes_per_page: usize,
        bytes_per_chain: usize,
    ) -> Self {
        let lines_per_page = bytes_per_page.div_ceil(bytes_per_line);
        let bytes_per_page = bytes_per_line * lines_per_page;
        let pages_per_chain = bytes_per_chain.div_ceil(bytes_per_page);
        let bytes_per_chain = bytes_per_page * pages_per_chain;
        let links_per_line = bytes_per_line / pointer_size;
        let links_per_page = lines_per_page * links_per_line;
        let lines_per_chain = lines_per_page * pages_per_chain;
        let links_per_chain = lines_per_chain * links_per_line;
        Geometry {
            pointer_size,
            bytes_per_line,
            bytes_per_page,
            bytes_per_chain,
            lines_per_page,
            pages_per_chain,
            links_per_line,
            links_per_page,
            lines_per_chain,
            links_per_chain,
        }
    }

    /// Like [`resolve`](Self::resolve), but fails where rounding would change a size.
    pub fn resolve_strict(
        pointer_size: usize,
        bytes_per_line: usize,
        bytes_per_page: usize,
        bytes_per_chain: usize,
    ) -> Result<Self> {
        let geometry = Self::resolve(pointer_size, bytes_per_line, bytes_per_page, bytes_per_chain);
        if geometry.bytes_per_page != bytes_per_page {
            return Err(ChaseError::StrictGeometry {
                what: "page size",
                requested: bytes_per_page,
                unit: bytes_per_line,
            });
        }
        if geometry.bytes_per_chain != bytes_per_chain {
            return Err(ChaseError::StrictGeometry {
                what: "chain size",
                requested: bytes_per_chain,
                unit: geometry.bytes_per_page,
            });
        }
        Ok(geometry)
    }

    /// Fails if a chain would have no node to visit.
    pub fn check_traversable(&self) -> Result<()> {
        if self.links_per_line == 0 {
            return Err(ChaseError::DegenerateGeometry(
                "a cache line holds no pointer",
            ));
        }
        if self.lines_per_chain == 0 {
            return Err(ChaseError::DegenerateGeometry("a chain holds no cache line"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn rounds_up() {
        let g = Geometry::resolve(8, 64, 4000, 10_000);
        assert_eq!(g.lines_per_page, 63);
        assert_eq!(g.bytes_per_page, 4032);
        assert_eq!(g.pages_per_chain, 3);
        assert_eq!(g.bytes_per_chain, 12096);
        assert_eq!(g.links_per_line, 8);
        assert_eq!(g.links_per_page, 504);
        assert_eq!(g.lines_per_chain, 189);
        assert_eq!(g.links_per_chain, 1512);
    }

    #[test]
    fn exact_sizes_are_kept() {
        let g = Geometry::resolve(8, 64, 4096, 4096);
        assert_eq!(g.lines_per_page, 64);
        assert_eq!(g.pages_per_chain, 1);
        assert_eq!(g.lines_per_chain, 64);
        assert_eq!(g.links_per_chain, 512);
        assert_eq!(Geometry::resolve_strict(8, 64, 4096, 4096).unwrap(), g);
    }

    #[test]
    fn strict_rejects_rounding() {
        assert!(matches!(
            Geometry::resolve_strict(8, 64, 4000, 8192),
            Err(ChaseError::StrictGeometry { what: "page size", .. })
        ));
        assert!(matches!(
            Geometry::resolve_strict(8, 64, 4096, 5000),
            Err(ChaseError::StrictGeometry { what: "chain size", .. })
        ));
    }

    #[test]
    fn degenerate_lines() {
        let g = Geometry::resolve(16, 8, 64, 64);
        assert!(g.check_traversable().is_err());
    }

    proptest! {
        #[test]
        fn sizes_are_exact_multiples(
            pointer_size in 1usize..=16,
            line_extra in 0usize..256,
            page in 1usize..1 << 16,
            chain in 1usize..1 << 20,
        ) {
            let line = pointer_size + line_extra;
            let g = Geometry::resolve(pointer_size, line, page, chain);
            prop_assert_eq!(g.bytes_per_page % g.bytes_per_line, 0);
            prop_assert_eq!(g.bytes_per_chain % g.bytes_per_page, 0);
            prop_assert!(g.bytes_per_page >= page);
            prop_assert!(g.bytes_per_chain >= chain);
            prop_assert!(g.lines_per_page > 0 && g.pages_per_chain > 0);
            prop_assert!(g.links_per_line > 0 && g.links_per_chain > 0);
            prop_assert_eq!(g.lines_per_chain * g.bytes_per_line, g.bytes_per_chain);
            prop_assert!(g.check_traversable().is_ok());
        }
    }
}
