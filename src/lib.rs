//! Memory latency and bandwidth measurement by pointer chasing.
//!
//! Each worker thread owns a number of chains: arrays of pointer-sized nodes linked into a
//! cycle that touches one node per cache line, in random, forward or reverse order.
//! Workers walk their chains in lock step, and the elapsed time of every trial is reported.
//!
//! ```no_run
//! use pointer_chase::{Experiment, Format, Options, OutputMode, topology::numa};
//!
//! let experiment = Experiment::resolve(Options::default(), numa::domain_count())?;
//! let report = pointer_chase::run(&experiment)?;
//! OutputMode::Table.format().write(&report, &mut std::io::stdout())?;
//! # Ok::<(), pointer_chase::ChaseError>(())
//! ```

pub mod barrier;
pub mod bench_loop;
pub mod chain;
pub mod config;
pub mod coordinator;
pub mod counters;
pub mod error;
pub mod formats;
pub mod geometry;
pub mod placement;
pub mod timer;
pub mod topology;

pub use config::{AccessPattern, CalibrationTarget, Experiment, Options, PlacementPolicy, PrefetchHint};
pub use coordinator::{RunReport, run, run_with};
pub use error::{ChaseError, Result};
pub use formats::{Format, OutputMode};
pub use geometry::Geometry;
pub use placement::Placement;
