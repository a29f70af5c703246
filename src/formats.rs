mod csv;
mod table;

pub use csv::Csv;
pub use table::Table;

use crate::{
    coordinator::RunReport,
    error::{ChaseError, Result},
};
use std::{fmt, io::Write, str::FromStr};

/// Renders a [`RunReport`].
pub trait Format {
    fn write(&mut self, report: &RunReport, out: &mut dyn Write) -> Result<()>;
}

impl Format for Box<dyn Format> {
    fn write(&mut self, report: &RunReport, out: &mut dyn Write) -> Result<()> {
        (**self).write(report, out)
    }
}

/// What is printed once a run completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// CSV header only.
    Header,
    /// One CSV record per trial.
    Csv,
    /// CSV header and records.
    Both,
    /// Averaged values, one per line.
    #[default]
    Table,
}

impl OutputMode {
    pub fn format(self) -> Box<dyn Format> {
        match self {
            OutputMode::Header => Box::new(Csv::new(true, false)),
            OutputMode::Csv => Box::new(Csv::new(false, true)),
            OutputMode::Both => Box::new(Csv::new(true, true)),
            OutputMode::Table => Box::new(Table::new()),
        }
    }
}

impl FromStr for OutputMode {
    type Err = ChaseError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "hdr" | "header" => Ok(OutputMode::Header),
            "csv" => Ok(OutputMode::Csv),
            "both" => Ok(OutputMode::Both),
            "table" => Ok(OutputMode::Table),
            _ => Err(ChaseError::Config(format!("invalid output format -- '{s}'"))),
        }
    }
}

impl fmt::Display for OutputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OutputMode::Header => "header",
            OutputMode::Csv => "csv",
            OutputMode::Both => "both",
            OutputMode::Table => "table",
        })
    }
}

/// One reported quantity.
struct Field {
    name: String,
    unit: Option<&'static str>,
    value: String,
}

impl Field {
    fn new(name: impl Into<String>, unit: Option<&'static str>, value: impl ToString) -> Self {
        Field {
            name: name.into(),
            unit,
            value: value.to_string(),
        }
    }

    /// Name with the unit appended, as used for CSV headers.
    fn heading(&self) -> String {
        match self.unit {
            Some(unit) => format!("{} ({unit})", self.name),
            None => self.name.clone(),
        }
    }
}

/// All fields of `report` for a trial that took `seconds`.
///
/// Without a time, the time-derived values are `-`.
fn fields(report: &RunReport, seconds: Option<f64>) -> Vec<Field> {
    let dash = || "-".to_string();
    const BYTES: Option<&str> = Some("bytes");
    let e = &report.experiment;
    let g = &e.geometry;
    let mut fields = vec![
        Field::new("pointer size", BYTES, g.pointer_size),
        Field::new("cache line size", BYTES, g.bytes_per_line),
        Field::new("page size", BYTES, g.bytes_per_page),
        Field::new("chain size", BYTES, g.bytes_per_chain),
        Field::new("thread size", BYTES, e.bytes_per_thread()),
        Field::new("test size", BYTES, e.bytes_per_test()),
        Field::new("chains per thread", None, e.chains_per_thread()),
        Field::new("number of threads", None, e.threads()),
        Field::new("iterations", None, report.iterations),
        Field::new("loop length", None, e.loop_length),
        Field::new("prefetch hint", None, e.prefetch),
        Field::new("experiments", None, e.experiments),
        Field::new("access pattern", None, e.access.name()),
        Field::new("stride", None, e.access.stride()),
        Field::new("numa placement", None, e.policy.name()),
        Field::new("offset or mask", None, e.policy.offset_or_mask()),
        Field::new("numa domains", None, e.placement.numa_domains()),
        Field::new("domain map", None, &e.placement),
        Field::new("operations per chain", None, report.ops_per_chain),
        Field::new("total operations", None, report.total_ops()),
        Field::new(
            "elapsed time",
            Some("seconds"),
            seconds.map_or_else(dash, |s| format!("{s:.3}")),
        ),
        Field::new(
            "elapsed time",
            Some("timer ticks"),
            seconds.map_or_else(dash, |s| format!("{:.0}", report.timer_ticks(s))),
        ),
        Field::new(
            "clock resolution",
            Some("ns"),
            format!("{:.2}", report.resolution * 1e9),
        ),
        Field::new(
            "memory latency",
            Some("ns"),
            seconds.map_or_else(dash, |s| format!("{:.2}", report.latency_ns(s))),
        ),
        Field::new(
            "memory bandwidth",
            Some("MB/s"),
            seconds.map_or_else(dash, |s| format!("{:.3}", report.bandwidth_mb_s(s))),
        ),
    ];
    for (name, per_reference) in report.counters_per_reference() {
        fields.push(Field::new(
            name,
            Some("per reference"),
            format!("{per_reference:.4}"),
        ));
    }
    fields
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        config::{AccessPattern, CalibrationTarget, Experiment, Options, PlacementPolicy},
        counters::{CounterReading, CounterTotals},
    };

    pub(crate) fn report() -> RunReport {
        let experiment = Experiment::resolve(
            Options {
                bytes_per_chain: 8192,
                access: AccessPattern::Reverse { stride: 2 },
                placement: PlacementPolicy::Map("0:1,0;1:0,1".into()),
                calibration: CalibrationTarget::Iterations(100),
                experiments: 2,
                ..Options::default()
            },
            2,
        )
        .unwrap();
        let mut counters = CounterTotals::default();
        counters.add(
            &["cycle".to_string()],
            &[CounterReading {
                value: 256_000.0,
                multiplexed: false,
            }],
        );
        RunReport {
            experiment,
            ops_per_chain: 64,
            iterations: 100,
            samples: vec![0.5, 1.5],
            resolution: 1e-9,
            counters,
        }
    }

    #[test]
    fn mode_names() {
        for (name, mode) in [
            ("hdr", OutputMode::Header),
            ("header", OutputMode::Header),
            ("CSV", OutputMode::Csv),
            ("both", OutputMode::Both),
            ("table", OutputMode::Table),
        ] {
            assert_eq!(name.parse::<OutputMode>().unwrap(), mode);
        }
        assert!("xml".parse::<OutputMode>().is_err());
    }

    #[test]
    fn derived_fields() {
        let fields = fields(&report(), Some(1.0));
        let get = |heading: &str| {
            fields
                .iter()
                .find(|f| f.heading() == heading)
                .map(|f| f.value.as_str())
                .unwrap()
        };
        assert_eq!(get("thread size (bytes)"), "16384");
        assert_eq!(get("test size (bytes)"), "32768");
        assert_eq!(get("stride"), "-2");
        assert_eq!(get("numa placement"), "map");
        assert_eq!(get("domain map"), "0:1,0;1:0,1");
        assert_eq!(get("total operations"), "256");
        // 1 s / (64 * 100)
        assert_eq!(get("memory latency (ns)"), "156250.00");
        // 256 ops * 100 iterations * 64 bytes / 1 s
        assert_eq!(get("memory bandwidth (MB/s)"), "1.638");
        // 256000 cycles / (25600 references * 2 trials)
        assert_eq!(get("cycle (per reference)"), "5.0000");
    }
}
