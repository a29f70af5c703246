//! Host topology: logical CPUs and NUMA domains.

pub mod affinity;
pub mod numa;
