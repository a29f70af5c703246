//! NUMA domain discovery and memory binding.
//!
//! Without NUMA support everything collapses into a single implicit domain 0
//! and binding becomes a no-op.

use std::io;

/// Number of NUMA domains on this host (highest node id + 1), at least 1.
pub fn domain_count() -> usize {
    match max_node() {
        Ok(Some(max)) => max + 1,
        Ok(None) => 1,
        Err(e) => {
            tracing::debug!("no NUMA topology available: {e}");
            1
        }
    }
}

#[cfg(target_os = "linux")]
fn max_node() -> io::Result<Option<usize>> {
    let mut max = None;
    for entry in std::fs::read_dir("/sys/devices/system/node")? {
        let name = entry?.file_name();
        let id = name
            .to_str()
            .and_then(|n| n.strip_prefix("node"))
            .and_then(|n| n.parse::<usize>().ok());
        if let Some(id) = id {
            max = max.max(Some(id));
        }
    }
    Ok(max)
}

#[cfg(not(target_os = "linux"))]
fn max_node() -> io::Result<Option<usize>> {
    Ok(None)
}

/// Logical CPUs of NUMA domain `domain`, empty if unknown.
pub fn domain_cpus(domain: usize) -> Vec<usize> {
    let path = format!("/sys/devices/system/node/node{domain}/cpulist");
    let cpus = std::fs::read_to_string(&path).and_then(|list| {
        parse_cpu_list(&list).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, format!("bad cpu list {list:?}"))
        })
    });
    match cpus {
        Ok(cpus) => cpus,
        Err(e) => {
            tracing::debug!("cannot read cpus of NUMA domain {domain}: {e}");
            Vec::new()
        }
    }
}

/// Parses the kernel's cpu list format, e.g. `0-3,8-11,16`.
fn parse_cpu_list(list: &str) -> Option<Vec<usize>> {
    let mut cpus = Vec::new();
    for part in list.trim().split(',').filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((lo, hi)) => {
                let (lo, hi) = (lo.parse::<usize>().ok()?, hi.parse::<usize>().ok()?);
                if lo > hi {
                    return None;
                }
                cpus.extend(lo..=hi);
            }
            None => cpus.push(part.parse().ok()?),
        }
    }
    Some(cpus)
}

/// Runs `f` with the calling thread's memory policy bound to `domain`,
/// then restores the default policy.
///
/// Pages first touched inside `f` are placed in `domain`.
/// With a single domain, or if the kernel refuses the policy, `f` simply runs unbound.
pub fn with_memory_bound_to<T>(domain: usize, domains: usize, f: impl FnOnce() -> T) -> T {
    if domains <= 1 {
        return f();
    }
    let bound = match bind(domain) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!("cannot bind memory to NUMA domain {domain}: {e}");
            false
        }
    };
    let ret = f();
    if bound {
        if let Err(e) = unbind() {
            tracing::warn!("cannot restore default memory policy: {e}");
        }
    }
    ret
}

#[cfg(target_os = "linux")]
const MPOL_DEFAULT: libc::c_int = 0;
#[cfg(target_os = "linux")]
const MPOL_BIND: libc::c_int = 2;

#[cfg(target_os = "linux")]
fn bind(domain: usize) -> io::Result<()> {
    const BITS: usize = libc::c_ulong::BITS as usize;
    let mut mask = vec![0 as libc::c_ulong; domain / BITS + 1];
    mask[domain / BITS] |= 1 << (domain % BITS);
    set_mempolicy(MPOL_BIND, &mask)
}

#[cfg(target_os = "linux")]
fn unbind() -> io::Result<()> {
    set_mempolicy(MPOL_DEFAULT, &[])
}

#[cfg(target_os = "linux")]
fn set_mempolicy(mode: libc::c_int, mask: &[libc::c_ulong]) -> io::Result<()> {
    let (ptr, maxnode) = if mask.is_empty() {
        (std::ptr::null(), 0)
    } else {
        // The kernel ignores the last bit of maxnode.
        (mask.as_ptr(), mask.len() * libc::c_ulong::BITS as usize + 1)
    };
    // SAFETY: the mask outlives the call and holds at least maxnode - 1 bits.
    let rc = unsafe { libc::syscall(libc::SYS_set_mempolicy, mode, ptr, maxnode) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn bind(_domain: usize) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "NUMA binding is not supported on this platform",
    ))
}

#[cfg(not(target_os = "linux"))]
fn unbind() -> io::Result<()> {
    Ok(())
}

#[test]
fn at_least_one_domain() {
    assert!(domain_count() >= 1);
}

#[test]
fn single_domain_runs_unbound() {
    assert_eq!(with_memory_bound_to(5, 1, || 42), 42);
}

#[test]
fn cpu_lists() {
    assert_eq!(parse_cpu_list("0-3,8-9,12\n"), Some(vec![0, 1, 2, 3, 8, 9, 12]));
    assert_eq!(parse_cpu_list("\n"), Some(vec![]));
    assert_eq!(parse_cpu_list("3-1"), None);
    assert_eq!(parse_cpu_list("a"), None);
}
