use super::{CounterReading, Counters};
use perf_event::{
    Builder, Counter,
    events::{Cache, CacheId, CacheOp, CacheResult, Hardware, Software},
};
use std::io;

/// Hardware and software counters from [`perf_event`] observing the calling thread only.
///
/// Note that this crate uses the `perf-event` crate from the `perf-event2` package, not the `perf-event` package.
///
/// Counters are not grouped, so the kernel may multiplex them independently.
/// Readings are extrapolated to the enabled time and flagged as multiplexed.
pub struct PerfBackend {
    counters: Vec<(String, Counter, f64)>,
}

impl PerfBackend {
    /// Builds a [`PerfBackend`] instance from a list of event names.
    ///
    /// These event names are not standard names.
    /// They are aliases for counter configurations: `cycle`, `kcycle`, `instr`, `l1-miss`,
    /// `llc-miss`, `br-miss` and `t-clock`.
    ///
    /// Invalid names and counters that cannot be opened (e.g. due to permission issues) are skipped with a warning.
    pub fn with_counter_names<'a>(counters: impl IntoIterator<Item = &'a str>) -> Self {
        let counters = counters
            .into_iter()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .filter_map(|name| {
                let mut scale = 1.0;

                // Keep this clean. Users are expected to read this match statement
                // to discover available counter names.
                let mut builder = match name {
                    "cycle" => Builder::new(Hardware::CPU_CYCLES),
                    "kcycle" => {
                        let mut builder = Builder::new(Hardware::CPU_CYCLES);
                        builder.exclude_user(true).exclude_kernel(false);
                        builder
                    }
                    "instr" => Builder::new(Hardware::INSTRUCTIONS),
                    "l1-miss" => Builder::new(Cache {
                        which: CacheId::L1D,
                        operation: CacheOp::READ,
                        result: CacheResult::MISS,
                    }),
                    "llc-miss" => Builder::new(Hardware::CACHE_MISSES),
                    "br-miss" => Builder::new(Hardware::BRANCH_MISSES),
                    "t-clock" => {
                        // time is reported by the kernel in nanoseconds, we convert to seconds.
                        scale = 1.0e-9;
                        Builder::new(Software::TASK_CLOCK)
                    }
                    _ => {
                        tracing::warn!(name, "invalid counter name");
                        return None;
                    }
                };
                builder.inherit(false);
                match builder.build() {
                    Err(error) => {
                        tracing::warn!(name, %error, "failed to create counter");
                        None
                    }
                    Ok(counter) => Some((name.to_string(), counter, scale)),
                }
            })
            .collect();
        PerfBackend { counters }
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

impl Counters for PerfBackend {
    fn enable(&mut self) -> io::Result<()> {
        for (_, counter, _) in &mut self.counters {
            counter.enable()?;
        }
        Ok(())
    }

    fn disable(&mut self) -> io::Result<()> {
        for (_, counter, _) in &mut self.counters {
            counter.disable()?;
        }
        Ok(())
    }

    fn reset(&mut self) -> io::Result<()> {
        for (_, counter, _) in &mut self.counters {
            counter.reset()?;
        }
        Ok(())
    }

    fn read(&mut self, dst: &mut Vec<CounterReading>) -> io::Result<()> {
        for (_, counter, scale) in &mut self.counters {
            let reading = counter.read_full()?;
            let enabled = reading.time_enabled().unwrap_or_default().as_secs_f64();
            let running = reading.time_running().unwrap_or_default().as_secs_f64();
            let value = if running > 0.0 {
                reading.count() as f64 * *scale * enabled / running
            } else {
                0.0
            };
            dst.push(CounterReading {
                value,
                multiplexed: reading.time_enabled() != reading.time_running(),
            });
        }
        Ok(())
    }

    fn names(&self, dst: &mut dyn FnMut(&str)) {
        for (name, _, _) in &self.counters {
            dst(name);
        }
    }
}

#[test]
fn unknown_names_are_skipped() {
    let backend = PerfBackend::with_counter_names(["bogus", " ", ""]);
    assert!(backend.is_empty());
}

#[test]
fn task_clock_counts_seconds() {
    // unavailable counters are skipped, so this only checks what could be opened
    let mut backend = PerfBackend::with_counter_names(["t-clock"]);
    if backend.is_empty() {
        return;
    }
    backend.reset().unwrap();
    backend.enable().unwrap();
    let start = std::time::Instant::now();
    while start.elapsed().as_millis() < 20 {
        std::hint::spin_loop();
    }
    backend.disable().unwrap();
    let mut readings = Vec::new();
    backend.read(&mut readings).unwrap();
    assert_eq!(readings.len(), 1);
    assert!(readings[0].value > 0.005 && readings[0].value < 1.0);
}
