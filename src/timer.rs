use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

/// A monotonic clock with a known resolution.
///
/// Used for calibration thresholds and trial durations.
pub trait Clock: Send + Sync {
    /// Seconds since an arbitrary, fixed origin.
    fn seconds(&self) -> f64;
    /// Smallest observable step of [`seconds`](Self::seconds).
    fn resolution(&self) -> f64;
}

/// Wall clock time based on [`Instant`].
///
/// The resolution is measured once at construction.
pub struct MonotonicClock {
    origin: Instant,
    resolution: f64,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock {
    pub const CALIBRATION_SAMPLES: usize = 10_000;

    pub fn new() -> Self {
        Self::calibrated(Self::CALIBRATION_SAMPLES)
    }

    /// Takes `samples` pairs of back-to-back readings and keeps the smallest non-zero difference.
    pub fn calibrated(samples: usize) -> Self {
        let mut resolution = Duration::MAX;
        for _ in 0..samples {
            let a = Instant::now();
            let mut b = Instant::now();
            while b == a {
                b = Instant::now();
            }
            resolution = resolution.min(b - a);
        }
        if resolution == Duration::MAX {
            resolution = Duration::from_nanos(1);
        }
        MonotonicClock {
            origin: Instant::now(),
            resolution: resolution.as_secs_f64(),
        }
    }
}

impl Clock for MonotonicClock {
    fn seconds(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    fn resolution(&self) -> f64 {
        self.resolution
    }
}

/// A clock that only moves when [`advance`](Self::advance) is called.
///
/// This makes calibration and trial timing deterministic, e.g. by advancing
/// it from inside a benchmark loop.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
    resolution: f64,
}

impl ManualClock {
    pub fn new(resolution: f64) -> Self {
        ManualClock {
            nanos: AtomicU64::new(0),
            resolution,
        }
    }

    pub fn advance(&self, by: Duration) {
        self.nanos.fetch_add(by.as_nanos() as u64, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn seconds(&self) -> f64 {
        Duration::from_nanos(self.nanos.load(Ordering::Relaxed)).as_secs_f64()
    }

    fn resolution(&self) -> f64 {
        self.resolution
    }
}

#[test]
fn monotonic() {
    let clock = MonotonicClock::calibrated(100);
    assert!(clock.resolution() > 0.0 && clock.resolution() < 0.01);
    let a = clock.seconds();
    std::thread::sleep(Duration::from_millis(5));
    let b = clock.seconds();
    assert!(b - a >= 0.005);
}

#[test]
fn manual() {
    let clock = ManualClock::new(1e-9);
    assert_eq!(clock.seconds(), 0.0);
    clock.advance(Duration::from_millis(250));
    assert_eq!(clock.seconds(), 0.25);
}
