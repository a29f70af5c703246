use super::{Format, fields};
use crate::{coordinator::RunReport, error::Result};
use std::io::Write;
use tabled::settings::Style;

/// A two column markdown table of values averaged over all trials.
#[derive(Debug, Default)]
pub struct Table;

impl Table {
    pub fn new() -> Self {
        Table
    }
}

impl Format for Table {
    fn write(&mut self, report: &RunReport, out: &mut dyn Write) -> Result<()> {
        let mut table = tabled::builder::Builder::new();
        table.push_record(["parameter", "value"]);
        for field in fields(report, report.mean_seconds()) {
            let value = match field.unit {
                Some(unit) => format!("{} ({unit})", field.value),
                None => field.value,
            };
            table.push_record([field.name, value]);
        }
        let multiplex_warning = if report.counters.multiplexed() {
            "⚠️ Some counters were multiplexed.\n"
        } else {
            ""
        };
        let mut table = table.build();
        table.with(Style::markdown());
        writeln!(out, "{multiplex_warning}{table}")?;
        Ok(())
    }
}

#[test]
fn averaged_values() {
    let mut out = Vec::new();
    Table::new()
        .write(&crate::formats::tests::report(), &mut out)
        .unwrap();
    let out = String::from_utf8(out).unwrap();
    let row = |name: &str| {
        out.lines()
            .find(|l| l.starts_with(&format!("| {name} ")))
            .unwrap_or_else(|| panic!("no row {name:?} in\n{out}"))
            .to_string()
    };
    // samples 0.5 and 1.5 average to 1 s
    assert!(row("elapsed time").contains("1.000 (seconds)"));
    assert!(row("memory latency").contains("156250.00 (ns)"));
    assert!(row("domain map").contains("0:1,0;1:0,1"));
    assert!(row("cycle").contains("5.0000 (per reference)"));
    assert!(!out.contains("multiplexed"));
}

#[test]
fn no_trials_leave_times_blank() {
    let report = RunReport {
        samples: Vec::new(),
        ..crate::formats::tests::report()
    };
    let mut out = Vec::new();
    Table::new().write(&report, &mut out).unwrap();
    let out = String::from_utf8(out).unwrap();
    assert!(!out.contains("NaN"), "{out}");
    assert!(out.contains("| memory latency "));
    assert!(out.contains("- (ns)"));
    assert!(out.contains("- (seconds)"));
    assert!(out.contains("- (MB/s)"));
}
