//! Assignment of threads and chains to NUMA domains.

use crate::{
    config::{PlacementPolicy, parse_number},
    error::{ChaseError, Result},
};
use std::fmt;

/// NUMA domain of every thread and of every chain within a thread.
///
/// All domains are already reduced modulo [`numa_domains`](Self::numa_domains).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    thread_domain: Vec<usize>,
    chain_domain: Vec<Vec<usize>>,
    numa_domains: usize,
}

impl Placement {
    /// Plans placement for `threads` threads with `chains_per_thread` chains each.
    ///
    /// Under [`PlacementPolicy::Map`] the map decides both counts and the
    /// arguments are ignored. A malformed map is rejected as a whole.
    pub fn plan(
        policy: &PlacementPolicy,
        threads: usize,
        chains_per_thread: usize,
        numa_domains: usize,
    ) -> Result<Self> {
        let d = numa_domains.max(1);
        let chain_of = |thread: usize| match *policy {
            PlacementPolicy::Local | PlacementPolicy::Map(_) => thread,
            PlacementPolicy::Xor { mask } => (thread ^ mask) % d,
            PlacementPolicy::Add { offset } => thread.wrapping_add(offset) % d,
        };
        let (thread_domain, chain_domain) = match policy {
            PlacementPolicy::Map(map) => parse_map(map)?,
            _ => {
                let thread_domain: Vec<usize> = (0..threads).map(|i| i % d).collect();
                let chain_domain = thread_domain
                    .iter()
                    .map(|&t| vec![chain_of(t); chains_per_thread])
                    .collect();
                (thread_domain, chain_domain)
            }
        };
        Ok(Placement {
            thread_domain: thread_domain.into_iter().map(|t| t % d).collect(),
            chain_domain: chain_domain
                .into_iter()
                .map(|chains| chains.into_iter().map(|c| c % d).collect())
                .collect(),
            numa_domains: d,
        })
    }

    pub fn threads(&self) -> usize {
        self.thread_domain.len()
    }

    pub fn chains_per_thread(&self) -> usize {
        self.chain_domain.first().map_or(0, Vec::len)
    }

    pub fn numa_domains(&self) -> usize {
        self.numa_domains
    }

    pub fn thread_domain(&self, thread: usize) -> usize {
        self.thread_domain[thread]
    }

    pub fn thread_domains(&self) -> &[usize] {
        &self.thread_domain
    }

    pub fn chain_domains(&self, thread: usize) -> &[usize] {
        &self.chain_domain[thread]
    }
}

/// Renders the placement in map syntax, e.g. `0:0,0;1:1,1`.
impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (thread, chains)) in self.thread_domain.iter().zip(&self.chain_domain).enumerate() {
            if i > 0 {
                f.write_str(";")?;
            }
            write!(f, "{thread}:")?;
            for (j, chain) in chains.iter().enumerate() {
                if j > 0 {
                    f.write_str(",")?;
                }
                write!(f, "{chain}")?;
            }
        }
        Ok(())
    }
}

type ParsedMap = (Vec<usize>, Vec<Vec<usize>>);

/// Parses `t:c,c,...;t:c,c,...` into raw, unreduced domains.
fn parse_map(map: &str) -> Result<ParsedMap> {
    let domain = |value: &str| -> Result<usize> {
        parse_number(value.trim())
            .map(|v| v as usize)
            .map_err(|_| ChaseError::MalformedMap(format!("invalid domain {value:?}")))
    };
    let mut thread_domain = Vec::new();
    let mut chain_domain: Vec<Vec<usize>> = Vec::new();
    for (i, segment) in map.split(';').enumerate() {
        let (thread, chains) = segment.split_once(':').ok_or_else(|| {
            ChaseError::MalformedMap(format!("segment {i} ({segment:?}) has no ':'"))
        })?;
        let chains = chains.split(',').map(domain).collect::<Result<Vec<_>>>()?;
        if let Some(first) = chain_domain.first() {
            if first.len() != chains.len() {
                return Err(ChaseError::MalformedMap(format!(
                    "segment {i} has {} chains, expected {}",
                    chains.len(),
                    first.len()
                )));
            }
        }
        thread_domain.push(domain(thread)?);
        chain_domain.push(chains);
    }
    Ok((thread_domain, chain_domain))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_domains_wrap() {
        for policy in [
            PlacementPolicy::Local,
            PlacementPolicy::Xor { mask: 1 },
            PlacementPolicy::Add { offset: 3 },
        ] {
            let p = Placement::plan(&policy, 7, 2, 3).unwrap();
            assert_eq!(p.threads(), 7);
            assert_eq!(p.chains_per_thread(), 2);
            for i in 0..7 {
                assert_eq!(p.thread_domain(i), i % 3, "{policy:?}");
            }
        }
    }

    #[test]
    fn chain_domains() {
        let local = Placement::plan(&PlacementPolicy::Local, 4, 2, 2).unwrap();
        assert_eq!(local.chain_domains(3), &[1, 1]);
        let xor = Placement::plan(&PlacementPolicy::Xor { mask: 1 }, 4, 2, 4).unwrap();
        assert_eq!(xor.chain_domains(0), &[1, 1]);
        assert_eq!(xor.chain_domains(3), &[2, 2]);
        let add = Placement::plan(&PlacementPolicy::Add { offset: 3 }, 4, 1, 4).unwrap();
        assert_eq!(add.chain_domains(1), &[0]);
        assert_eq!(add.chain_domains(2), &[1]);
    }

    #[test]
    fn map() {
        let p = Placement::plan(&PlacementPolicy::Map("0:1,2;1:3,4".into()), 9, 9, 5).unwrap();
        assert_eq!(p.threads(), 2);
        assert_eq!(p.chains_per_thread(), 2);
        assert_eq!(p.thread_domain(0), 0);
        assert_eq!(p.thread_domain(1), 1);
        assert_eq!(p.chain_domains(0), &[1, 2]);
        assert_eq!(p.chain_domains(1), &[3, 4]);
        assert_eq!(p.to_string(), "0:1,2;1:3,4");
    }

    #[test]
    fn map_wraps_domains() {
        let p = Placement::plan(&PlacementPolicy::Map("3:4,5".into()), 1, 1, 2).unwrap();
        assert_eq!(p.thread_domain(0), 1);
        assert_eq!(p.chain_domains(0), &[0, 1]);
    }

    #[test]
    fn malformed_maps() {
        for map in ["0:1,2;1:3", "0:1;1:2,3", "0", "0:1;", "0:x", ":1", "0:1,,2"] {
            let result = Placement::plan(&PlacementPolicy::Map(map.into()), 1, 1, 4);
            assert!(
                matches!(result, Err(ChaseError::MalformedMap(_))),
                "{map:?} gave {result:?}"
            );
        }
    }

    #[test]
    fn without_numa_everything_is_domain_zero() {
        let p = Placement::plan(&PlacementPolicy::Add { offset: 5 }, 3, 2, 1).unwrap();
        assert_eq!(p.to_string(), "0:0,0;0:0,0;0:0,0");
    }
}
