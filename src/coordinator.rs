//! Worker threads, calibration and timed trials.
//!
//! Every worker pins itself, builds its chains in the planned NUMA domains and compiles its
//! benchmark loop. All workers then move through calibration and the trials in lock step,
//! separated by a [`SpinBarrier`]. Thread 0 alone reads the clock, decides the iteration count
//! and records samples; whatever it publishes is read by the others only after the next barrier.

use crate::{
    barrier::{AbortToken, SpinBarrier},
    bench_loop::{BenchmarkLoop, LoopCompiler, LoopSpec, PortableCompiler},
    chain::{Chain, Node},
    config::{CalibrationTarget, Experiment},
    counters::{self, CounterReading, CounterTotals, Counters},
    error::{ChaseError, Result},
    timer::{Clock, MonotonicClock},
    topology::{affinity, numa},
};
use parking_lot::Mutex;
use rand::{SeedableRng, rngs::SmallRng};
use std::{
    sync::{
        OnceLock,
        atomic::{AtomicU64, Ordering},
    },
    thread,
};

/// Shortest calibration round that is trusted, in seconds.
pub const MIN_CALIBRATION_SECONDS: f64 = 0.2;

/// Calibration doubles the iteration count until one round takes longer than this.
pub fn calibration_bound(resolution: f64) -> f64 {
    MIN_CALIBRATION_SECONDS.max(10.0 * resolution)
}

/// Iterations needed for a trial of `target` seconds, given that `measured` iterations took `elapsed`.
pub fn iterations_for(target: f64, measured: u64, elapsed: f64) -> u64 {
    (target * measured as f64 / elapsed).ceil().max(1.0) as u64
}

/// Everything a run produced, ready for output.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub experiment: Experiment,
    pub ops_per_chain: usize,
    pub iterations: u64,
    /// Elapsed seconds of every trial that took a measurable amount of time.
    pub samples: Vec<f64>,
    /// Clock resolution in seconds.
    pub resolution: f64,
    pub counters: CounterTotals,
}

impl RunReport {
    pub fn total_ops(&self) -> usize {
        self.ops_per_chain * self.experiment.chains_per_thread() * self.experiment.threads()
    }

    /// Average elapsed seconds over all recorded trials, `None` if none was recorded.
    pub fn mean_seconds(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
    }

    pub fn timer_ticks(&self, seconds: f64) -> f64 {
        seconds / self.resolution
    }

    /// Average time per dereference in nanoseconds.
    pub fn latency_ns(&self, seconds: f64) -> f64 {
        seconds / (self.ops_per_chain as f64 * self.iterations as f64) * 1e9
    }

    /// Bytes of cache lines touched per second, in MB/s.
    pub fn bandwidth_mb_s(&self, seconds: f64) -> f64 {
        self.references() * self.experiment.geometry.bytes_per_line as f64 / seconds * 1e-6
    }

    /// Memory references issued by all threads in one trial.
    pub fn references(&self) -> f64 {
        self.total_ops() as f64 * self.iterations as f64
    }

    /// Counter totals divided by the number of memory references in all trials.
    pub fn counters_per_reference(&self) -> Vec<(&str, f64)> {
        let references = self.references() * self.experiment.experiments as f64;
        self.counters
            .iter()
            .map(|(name, total)| (name, total / references))
            .collect()
    }
}

/// Runs `experiment` on a wall clock with the portable benchmark loop.
pub fn run(experiment: &Experiment) -> Result<RunReport> {
    run_with(experiment, &MonotonicClock::new(), &PortableCompiler)
}

/// Runs `experiment` with the given clock and loop compiler.
pub fn run_with<L>(experiment: &Experiment, clock: &dyn Clock, compiler: &L) -> Result<RunReport>
where
    L: LoopCompiler + Sync,
{
    let threads = experiment.threads();
    let context = RunContext::new(experiment, clock);
    let placement = &experiment.placement;
    let cpus = affinity::plan_cpus(
        &affinity::allowed_cpus(),
        placement.thread_domains(),
        placement.numa_domains(),
        numa::domain_cpus,
    );
    tracing::debug!(threads, ?cpus, "starting workers");

    let results: Vec<Result<()>> = thread::scope(|s| {
        let handles: Vec<_> = (0..threads)
            .map(|id| {
                let context = &context;
                let cpu = cpus[id];
                thread::Builder::new()
                    .name(format!("chase-{id}"))
                    .spawn_scoped(s, move || {
                        let _guard = AbortOnPanic(&context.abort);
                        let result = Worker::start(context, compiler, id, cpu)
                            .and_then(|mut worker| worker.run());
                        if result.is_err() {
                            context.abort.abort();
                        }
                        result
                    })
            })
            .collect();
        // workers already spawned would wait for the missing ones forever
        if handles.iter().any(|handle| handle.is_err()) {
            context.abort.abort();
        }
        handles
            .into_iter()
            .enumerate()
            .map(|(id, handle)| match handle {
                Ok(handle) => handle.join().unwrap_or(Err(ChaseError::WorkerPanicked(id))),
                Err(e) => Err(e.into()),
            })
            .collect()
    });

    // a worker's own failure is more telling than the aborts it caused in the others
    let mut first_abort = None;
    for result in results {
        match result {
            Ok(()) => {}
            Err(ChaseError::Aborted) => first_abort = first_abort.or(Some(ChaseError::Aborted)),
            Err(e) => return Err(e),
        }
    }
    if let Some(e) = first_abort {
        return Err(e);
    }
    context.into_report()
}

/// Aborts the barrier if the owning worker unwinds.
struct AbortOnPanic<'a>(&'a AbortToken);

impl Drop for AbortOnPanic<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.abort();
        }
    }
}

/// State shared by all workers of one run.
struct RunContext<'a> {
    experiment: &'a Experiment,
    clock: &'a dyn Clock,
    abort: AbortToken,
    barrier: SpinBarrier,
    ops_per_chain: OnceLock<usize>,
    /// Written by thread 0 only.
    iterations: AtomicU64,
    /// Bits of the last calibration round's elapsed seconds, written by thread 0 only.
    calibration_elapsed: AtomicU64,
    samples: Mutex<Vec<f64>>,
    counters: Mutex<CounterTotals>,
}

impl<'a> RunContext<'a> {
    fn new(experiment: &'a Experiment, clock: &'a dyn Clock) -> Self {
        let abort = AbortToken::new();
        let iterations = match experiment.calibration {
            CalibrationTarget::Iterations(n) => n,
            CalibrationTarget::Seconds(_) => 0,
        };
        RunContext {
            experiment,
            clock,
            barrier: SpinBarrier::with_abort(experiment.threads(), abort.clone()),
            abort,
            ops_per_chain: OnceLock::new(),
            iterations: AtomicU64::new(iterations),
            calibration_elapsed: AtomicU64::new(0),
            samples: Mutex::new(Vec::with_capacity(experiment.experiments)),
            counters: Mutex::new(CounterTotals::default()),
        }
    }

    /// Every chain of every thread has the same length, so only the first value is kept.
    fn publish_ops(&self, ops: usize) {
        let published = *self.ops_per_chain.get_or_init(|| ops);
        debug_assert_eq!(published, ops, "chains of different length");
    }

    fn into_report(self) -> Result<RunReport> {
        let ops_per_chain = self
            .ops_per_chain
            .into_inner()
            .ok_or(ChaseError::DegenerateGeometry("no chain was built"))?;
        Ok(RunReport {
            experiment: self.experiment.clone(),
            ops_per_chain,
            iterations: self.iterations.into_inner(),
            samples: self.samples.into_inner(),
            resolution: self.clock.resolution(),
            counters: self.counters.into_inner(),
        })
    }
}

struct ThreadCounters {
    counters: Box<dyn Counters>,
    names: Vec<String>,
    readings: Vec<CounterReading>,
}

impl ThreadCounters {
    fn start(&mut self) -> Result<()> {
        self.counters.reset().map_err(|e| self.error(e))?;
        self.counters.enable().map_err(|e| self.error(e))
    }

    fn stop(&mut self) -> Result<()> {
        self.counters.disable().map_err(|e| self.error(e))?;
        self.readings.clear();
        self.counters
            .read(&mut self.readings)
            .map_err(|e| self.error(e))
    }

    fn error(&self, source: std::io::Error) -> ChaseError {
        ChaseError::Counter {
            name: self.names.join(","),
            source,
        }
    }
}

struct Worker<'c, 'a> {
    context: &'c RunContext<'a>,
    id: usize,
    // the loop walks raw pointers into these
    _chains: Vec<Chain>,
    heads: Vec<*const Node>,
    positions: Vec<*const Node>,
    bench: Box<dyn BenchmarkLoop>,
    counters: Option<ThreadCounters>,
    counter_totals: CounterTotals,
}

impl<'c, 'a> Worker<'c, 'a> {
    /// Pins the calling thread, then builds its chains, loop and counters.
    fn start(
        context: &'c RunContext<'a>,
        compiler: &impl LoopCompiler,
        id: usize,
        cpu: Option<usize>,
    ) -> Result<Self> {
        let experiment = context.experiment;
        let geometry = &experiment.geometry;
        let placement = &experiment.placement;

        if let Some(cpu) = cpu {
            let domain = placement.thread_domain(id);
            match affinity::pin_current_thread(cpu) {
                Ok(()) => tracing::debug!(thread = id, cpu, domain, "pinned"),
                Err(e) => tracing::warn!(thread = id, cpu, domain, "cannot pin thread: {e}"),
            }
        }

        let mut rng = SmallRng::seed_from_u64(id as u64);
        let mut chains = Vec::with_capacity(experiment.chains_per_thread());
        for &domain in placement.chain_domains(id) {
            let chain = numa::with_memory_bound_to(domain, placement.numa_domains(), || {
                Chain::allocate(geometry)
            });
            chains.push(chain);
        }
        for chain in &mut chains {
            let ops = chain.link(geometry, experiment.access, &mut rng)?;
            context.publish_ops(ops);
        }
        let heads: Vec<_> = chains.iter().map(Chain::head).collect();

        let bench = compiler.compile(&LoopSpec {
            chains: chains.len(),
            stride: experiment.access.stride(),
            prefetch: experiment.prefetch,
            loop_length: experiment.loop_length,
        });

        let counters = counters::open_for_current_thread(&experiment.events).map(|counters| {
            ThreadCounters {
                names: counters::counter_names(&*counters),
                counters,
                readings: Vec::new(),
            }
        });

        Ok(Worker {
            context,
            id,
            positions: heads.clone(),
            heads,
            _chains: chains,
            bench,
            counters,
            counter_totals: CounterTotals::default(),
        })
    }

    fn run(&mut self) -> Result<()> {
        let iterations = self.calibrate()?;
        self.trials(iterations)?;
        self.context.counters.lock().merge(&self.counter_totals);
        Ok(())
    }

    fn traverse(&mut self, iterations: u64) {
        for _ in 0..iterations {
            // SAFETY: the heads belong to linked chains owned by `self`, all of the same length.
            unsafe { self.bench.traverse(&self.heads, &mut self.positions) };
        }
    }

    fn calibrate(&mut self) -> Result<u64> {
        let context = self.context;
        calibrate(context, self.id, |iters| self.traverse(iters))
    }

    fn trials(&mut self, iterations: u64) -> Result<()> {
        let context = self.context;
        let leader = self.id == 0;
        for _ in 0..context.experiment.experiments {
            context.barrier.wait()?;
            let start = if leader { context.clock.seconds() } else { 0.0 };
            context.barrier.wait()?;

            self.start_counters();
            self.traverse(iterations);
            self.stop_counters();

            context.barrier.wait()?;
            let stop = if leader { context.clock.seconds() } else { 0.0 };
            context.barrier.wait()?;

            if leader {
                let elapsed = stop - start;
                if elapsed > 0.0 {
                    context.samples.lock().push(elapsed);
                }
            }
        }
        Ok(())
    }

    fn start_counters(&mut self) {
        if let Some(Err(e)) = self.counters.as_mut().map(ThreadCounters::start) {
            self.drop_counters(e);
        }
    }

    fn stop_counters(&mut self) {
        let Some(counters) = self.counters.as_mut() else {
            return;
        };
        match counters.stop() {
            Ok(()) => self
                .counter_totals
                .add(&counters.names, &counters.readings),
            Err(e) => self.drop_counters(e),
        }
    }

    fn drop_counters(&mut self, error: ChaseError) {
        tracing::warn!(thread = self.id, %error, "disabling hardware counters");
        self.counters = None;
    }
}

/// Finds the iteration count for the configured target, or returns the fixed one.
///
/// All `context.barrier` participants must call this together. `traverse(n)` runs the benchmark
/// loop `n` times.
fn calibrate(context: &RunContext<'_>, id: usize, mut traverse: impl FnMut(u64)) -> Result<u64> {
    let target = match context.experiment.calibration {
        CalibrationTarget::Iterations(n) => return Ok(n),
        CalibrationTarget::Seconds(target) => target,
    };
    let leader = id == 0;
    let bound = calibration_bound(context.clock.resolution());
    let mut iters: u64 = 1;
    let elapsed = loop {
        context.barrier.wait()?;
        let start = if leader { context.clock.seconds() } else { 0.0 };
        context.barrier.wait()?;
        traverse(iters);
        context.barrier.wait()?;
        if leader {
            let elapsed = context.clock.seconds() - start;
            context
                .calibration_elapsed
                .store(elapsed.to_bits(), Ordering::Relaxed);
        }
        context.barrier.wait()?;
        let elapsed = f64::from_bits(context.calibration_elapsed.load(Ordering::Relaxed));
        if elapsed > bound {
            break elapsed;
        }
        iters = iters.saturating_mul(2);
    };
    if leader {
        let iterations = iterations_for(target, iters, elapsed);
        tracing::info!(iterations, measured = iters, elapsed, "calibrated");
        context.iterations.store(iterations, Ordering::Relaxed);
    }
    context.barrier.wait()?;
    Ok(context.iterations.load(Ordering::Relaxed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{AccessPattern, Options},
        timer::ManualClock,
    };
    use std::time::Duration;

    fn experiment(threads: usize, calibration: CalibrationTarget) -> Experiment {
        Experiment::resolve(
            Options {
                threads,
                bytes_per_page: 4096,
                bytes_per_chain: 4096,
                access: AccessPattern::Forward { stride: 1 },
                calibration,
                experiments: 3,
                ..Options::default()
            },
            1,
        )
        .unwrap()
    }

    /// Calibrates with a clock that moves `per_iteration` for every benchmark loop iteration.
    fn calibrated(target: f64, per_iteration: Duration, resolution: f64) -> (u64, f64) {
        let experiment = experiment(1, CalibrationTarget::Seconds(target));
        let clock = ManualClock::new(resolution);
        let context = RunContext::new(&experiment, &clock);
        let mut last_round = 0;
        let iterations = calibrate(&context, 0, |n| {
            last_round = n;
            for _ in 0..n {
                clock.advance(per_iteration);
            }
        })
        .unwrap();
        let elapsed = per_iteration.as_secs_f64() * last_round as f64;
        (iterations, elapsed)
    }

    #[test]
    fn bound() {
        assert_eq!(calibration_bound(1e-9), 0.2);
        assert!((calibration_bound(0.05) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn calibration_stops_past_the_bound() {
        // 1 ms per iteration: 256 iterations take 0.256 s, the first round over 0.2 s
        let (iterations, elapsed) = calibrated(1.0, Duration::from_millis(1), 1e-9);
        assert!((elapsed - 0.256).abs() < 1e-9);
        assert!((999..=1001).contains(&iterations), "{iterations}");

        // a coarse clock raises the bound to 10 ticks
        let (_, elapsed) = calibrated(1.0, Duration::from_millis(1), 0.1);
        assert!((elapsed - 1.024).abs() < 1e-9);
    }

    #[test]
    fn calibration_is_monotone_in_target() {
        let mut previous = 0;
        for target in [0.001, 0.01, 0.1, 0.5, 1.0, 2.0, 10.0] {
            let (iterations, _) = calibrated(target, Duration::from_micros(37), 1e-9);
            assert!(iterations >= previous, "{target}: {iterations} < {previous}");
            assert!(iterations >= 1);
            previous = iterations;
        }
    }

    #[test]
    fn fixed_iterations_skip_calibration() {
        let experiment = experiment(1, CalibrationTarget::Iterations(17));
        let clock = ManualClock::new(1e-9);
        let context = RunContext::new(&experiment, &clock);
        let iterations = calibrate(&context, 0, |_| panic!("calibration ran")).unwrap();
        assert_eq!(iterations, 17);
    }

    #[test]
    fn iterations_round_up() {
        assert_eq!(iterations_for(1.0, 256, 0.256), 1000);
        assert_eq!(iterations_for(1.0, 3, 0.7), 5);
        assert_eq!(iterations_for(1e-9, 1, 10.0), 1);
    }

    #[test]
    fn trials_record_one_sample_each() {
        let experiment = experiment(2, CalibrationTarget::Iterations(4));
        let report = run(&experiment).unwrap();
        assert_eq!(report.ops_per_chain, 64);
        assert_eq!(report.iterations, 4);
        assert!(report.samples.len() <= 3);
        assert!(report.samples.iter().all(|&s| s > 0.0));
        assert_eq!(report.total_ops(), 128);
    }

    #[test]
    fn report_formulas() {
        let report = RunReport {
            experiment: experiment(2, CalibrationTarget::Iterations(10)),
            ops_per_chain: 64,
            iterations: 10,
            samples: vec![1.0, 3.0],
            resolution: 1e-6,
            counters: CounterTotals::default(),
        };
        assert_eq!(report.mean_seconds(), Some(2.0));
        let unmeasured = RunReport {
            samples: Vec::new(),
            ..report.clone()
        };
        assert_eq!(unmeasured.mean_seconds(), None);
        assert!((report.latency_ns(2.0) - 2.0 / 640.0 * 1e9).abs() < 1e-3);
        // 64 ops * 10 iterations * 1 chain * 2 threads * 64 bytes / 2 s
        assert!((report.bandwidth_mb_s(2.0) - 0.04096).abs() < 1e-12);
        assert!((report.timer_ticks(2.0) - 2e6).abs() < 1e-3);
    }
}
