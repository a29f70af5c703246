use super::{Format, fields};
use crate::{coordinator::RunReport, error::Result};
use std::io::Write;

/// Comma separated output with one record per trial.
pub struct Csv {
    header: bool,
    records: bool,
}

impl Csv {
    pub fn new(header: bool, records: bool) -> Self {
        Csv { header, records }
    }
}

impl Format for Csv {
    fn write(&mut self, report: &RunReport, out: &mut dyn Write) -> Result<()> {
        let mut writer = csv::Writer::from_writer(out);
        if self.header {
            // headings do not depend on the elapsed time
            writer.write_record(fields(report, None).iter().map(|f| f.heading()))?;
        }
        if self.records {
            for &seconds in &report.samples {
                writer.write_record(fields(report, Some(seconds)).iter().map(|f| &f.value))?;
            }
        }
        writer.flush()?;
        Ok(())
    }
}
