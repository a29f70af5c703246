//! Pinning worker threads to logical CPUs.
//!
//! With more than one NUMA domain, each worker runs on a CPU of its own domain: the workers of a
//! domain are spread round-robin over the allowed CPUs of that domain.
//! Otherwise, or if a domain has no allowed CPU, worker `i` is bound to the `i mod M`-th allowed
//! CPU. Either way it stays there for the whole run.
//! In a container or under `taskset` the allowed set can be a sparse subset of the host's CPUs,
//! so indices are taken from the affinity mask rather than assumed to be `0..M`.

use std::io;

/// Logical CPUs the calling thread may run on, in ascending order.
///
/// Falls back to `0..available_parallelism` where the affinity mask cannot be read.
pub fn allowed_cpus() -> Vec<usize> {
    match affinity_mask() {
        Ok(cpus) if !cpus.is_empty() => cpus,
        Ok(_) => fallback_cpus(),
        Err(e) => {
            tracing::debug!("cannot read affinity mask: {e}");
            fallback_cpus()
        }
    }
}

fn fallback_cpus() -> Vec<usize> {
    let n = std::thread::available_parallelism().map_or(1, |n| n.get());
    (0..n).collect()
}

/// The CPU worker `thread` is pinned to.
pub fn cpu_for_thread(allowed: &[usize], thread: usize) -> Option<usize> {
    if allowed.is_empty() {
        None
    } else {
        Some(allowed[thread % allowed.len()])
    }
}

/// The CPU of every worker, given the NUMA domain of each worker.
///
/// `domain_cpus(d)` lists the CPUs of domain `d`; it is only consulted with more than one domain.
pub fn plan_cpus(
    allowed: &[usize],
    thread_domains: &[usize],
    numa_domains: usize,
    mut domain_cpus: impl FnMut(usize) -> Vec<usize>,
) -> Vec<Option<usize>> {
    if numa_domains <= 1 {
        return (0..thread_domains.len())
            .map(|thread| cpu_for_thread(allowed, thread))
            .collect();
    }
    let mut in_domain: Vec<Option<Vec<usize>>> = vec![None; numa_domains];
    let mut placed = vec![0usize; numa_domains];
    thread_domains
        .iter()
        .enumerate()
        .map(|(thread, &domain)| {
            let cpus = in_domain[domain].get_or_insert_with(|| {
                domain_cpus(domain)
                    .into_iter()
                    .filter(|cpu| allowed.contains(cpu))
                    .collect()
            });
            if cpus.is_empty() {
                return cpu_for_thread(allowed, thread);
            }
            let rank = placed[domain];
            placed[domain] += 1;
            Some(cpus[rank % cpus.len()])
        })
        .collect()
}

#[cfg(target_os = "linux")]
const CPU_SET_CAPACITY: usize = std::mem::size_of::<libc::cpu_set_t>() * 8;

#[cfg(target_os = "linux")]
fn affinity_mask() -> io::Result<Vec<usize>> {
    // SAFETY: a zeroed cpu_set_t is a valid empty set, and sched_getaffinity
    // writes at most size_of::<cpu_set_t>() bytes into it.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        if libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut set) != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok((0..CPU_SET_CAPACITY)
            .filter(|&cpu| libc::CPU_ISSET(cpu, &set))
            .collect())
    }
}

#[cfg(not(target_os = "linux"))]
fn affinity_mask() -> io::Result<Vec<usize>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "CPU affinity is not supported on this platform",
    ))
}

/// Binds the calling thread to exactly one logical CPU.
#[cfg(target_os = "linux")]
pub fn pin_current_thread(cpu: usize) -> io::Result<()> {
    if cpu >= CPU_SET_CAPACITY {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("cpu index {cpu} exceeds cpu set capacity ({CPU_SET_CAPACITY})"),
        ));
    }
    // SAFETY: cpu is in bounds for CPU_SET, and pthread_setaffinity_np
    // only reads the set we pass.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        let rc = libc::pthread_setaffinity_np(
            libc::pthread_self(),
            std::mem::size_of::<libc::cpu_set_t>(),
            &set,
        );
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn pin_current_thread(_cpu: usize) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "CPU affinity is not supported on this platform",
    ))
}

#[test]
fn round_robin() {
    let allowed = [2, 3, 6];
    let picked: Vec<_> = (0..7).map(|t| cpu_for_thread(&allowed, t).unwrap()).collect();
    assert_eq!(picked, [2, 3, 6, 2, 3, 6, 2]);
    assert_eq!(cpu_for_thread(&[], 0), None);
}

#[test]
fn cpus_follow_thread_domains() {
    // node 0 holds cpus 0-3, node 1 holds 4-7, cpu 5 is not allowed
    let nodes = |domain: usize| (domain * 4..domain * 4 + 4).collect::<Vec<_>>();
    let allowed = [0, 1, 2, 3, 4, 6, 7];
    let picked = plan_cpus(&allowed, &[0, 1, 0, 1, 1, 1], 2, nodes);
    assert_eq!(
        picked,
        [Some(0), Some(4), Some(1), Some(6), Some(7), Some(4)]
    );
}

#[test]
fn cpus_without_numa_are_round_robin() {
    let picked = plan_cpus(&[2, 3, 6], &[0, 0, 0, 0], 1, |_| panic!("no domains"));
    assert_eq!(picked, [Some(2), Some(3), Some(6), Some(2)]);
}

#[test]
fn domain_without_allowed_cpus_falls_back() {
    let nodes = |domain: usize| if domain == 0 { vec![0, 1] } else { vec![8, 9] };
    let picked = plan_cpus(&[0, 1], &[0, 1, 1], 2, nodes);
    assert_eq!(picked, [Some(0), Some(1), Some(0)]);
}

#[test]
fn some_cpu_is_allowed() {
    assert!(!allowed_cpus().is_empty());
}

#[cfg(target_os = "linux")]
#[test]
fn pin_to_allowed_cpu() {
    let cpu = allowed_cpus()[0];
    std::thread::spawn(move || pin_current_thread(cpu))
        .join()
        .unwrap()
        .unwrap();
    assert!(pin_current_thread(CPU_SET_CAPACITY).is_err());
}
