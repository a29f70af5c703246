#[cfg(target_os = "linux")]
mod perf_backend;

#[cfg(target_os = "linux")]
pub use perf_backend::PerfBackend;

use std::io;

/// A set of named hardware counters observing the calling thread.
///
/// Each worker opens its own set, so readings never include other workers.
pub trait Counters {
    /// Enable counters.
    fn enable(&mut self) -> io::Result<()>;
    /// Disable counters.
    fn disable(&mut self) -> io::Result<()>;
    /// Reset counters.
    fn reset(&mut self) -> io::Result<()>;
    /// Read all counters and append the readings to `dst`.
    fn read(&mut self, dst: &mut Vec<CounterReading>) -> io::Result<()>;
    /// Appends the counter names to `dst`.
    ///
    /// Names must be appended in the same order as the values appended by [`read`](Self::read).
    fn names(&self, dst: &mut dyn FnMut(&str));
}

impl Counters for Box<dyn Counters> {
    fn enable(&mut self) -> io::Result<()> {
        (**self).enable()
    }

    fn disable(&mut self) -> io::Result<()> {
        (**self).disable()
    }

    fn reset(&mut self) -> io::Result<()> {
        (**self).reset()
    }

    fn read(&mut self, dst: &mut Vec<CounterReading>) -> io::Result<()> {
        (**self).read(dst)
    }

    fn names(&self, dst: &mut dyn FnMut(&str)) {
        (**self).names(dst);
    }
}

/// A reading of a hardware counter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CounterReading {
    /// Count, extrapolated to the full enabled time if the counter was multiplexed.
    pub value: f64,
    /// if `true`, the reading was multiplexed and may therefore be less reliable.
    pub multiplexed: bool,
}

/// Opens the counters named in `events` for the calling thread.
///
/// Returns `None` if no counter could be opened, including on platforms without perf events.
pub fn open_for_current_thread(events: &[String]) -> Option<Box<dyn Counters>> {
    if events.is_empty() {
        return None;
    }
    #[cfg(target_os = "linux")]
    {
        let backend = PerfBackend::with_counter_names(events.iter().map(String::as_str));
        if backend.is_empty() {
            return None;
        }
        Some(Box::new(backend))
    }
    #[cfg(not(target_os = "linux"))]
    {
        tracing::warn!("hardware counters are only supported on linux");
        None
    }
}

pub fn counter_names(counters: &dyn Counters) -> Vec<String> {
    let mut names = Vec::new();
    counters.names(&mut |name| names.push(name.to_string()));
    names
}

/// Counter values summed over threads and trials.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CounterTotals {
    totals: Vec<(String, f64)>,
    multiplexed: bool,
}

impl CounterTotals {
    /// Adds `readings`, named by `names` in the same order.
    pub fn add(&mut self, names: &[String], readings: &[CounterReading]) {
        for (name, reading) in names.iter().zip(readings) {
            self.multiplexed |= reading.multiplexed;
            match self.totals.iter_mut().find(|(n, _)| n == name) {
                Some((_, total)) => *total += reading.value,
                None => self.totals.push((name.clone(), reading.value)),
            }
        }
    }

    /// Adds the totals of another thread.
    pub fn merge(&mut self, other: &CounterTotals) {
        self.multiplexed |= other.multiplexed;
        for (name, value) in &other.totals {
            match self.totals.iter_mut().find(|(n, _)| n == name) {
                Some((_, total)) => *total += value,
                None => self.totals.push((name.clone(), *value)),
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.totals.is_empty()
    }

    pub fn multiplexed(&self) -> bool {
        self.multiplexed
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.totals.iter().map(|(n, v)| (n.as_str(), *v))
    }
}
