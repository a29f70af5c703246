//! chase - memory latency and bandwidth benchmark

use clap::{ArgMatches, CommandFactory, FromArgMatches, Parser};
use pointer_chase::{
    AccessPattern, CalibrationTarget, ChaseError, Experiment, Format, Options, OutputMode,
    PlacementPolicy, PrefetchHint,
    config::{parse_number, parse_real},
    topology::numa,
};
use std::{io, process::ExitCode};
use tracing_subscriber::EnvFilter;

fn number(s: &str) -> Result<usize, ChaseError> {
    parse_number(s).map(|n| n as usize)
}

fn iterations(s: &str) -> Result<u64, ChaseError> {
    parse_number(s)
}

#[derive(Parser, Debug)]
#[command(name = "chase")]
#[command(version, about = "Measures memory latency and bandwidth by chasing pointers", long_about = None)]
struct Args {
    /// Bytes per cache line
    #[arg(short = 'l', long = "line", value_name = "BYTES", default_value = "64", value_parser = number)]
    line: usize,

    /// Bytes per page
    #[arg(short = 'p', long = "page", value_name = "BYTES", default_value = "4k", value_parser = number)]
    page: usize,

    /// Bytes per chain
    #[arg(short = 'c', long = "chain", value_name = "BYTES", default_value = "1m", value_parser = number)]
    chain: usize,

    /// Chains per thread, i.e. concurrent references per thread
    #[arg(short = 'r', long = "references", value_name = "N", default_value = "1", value_parser = number)]
    references: usize,

    /// Worker threads
    #[arg(short = 't', long = "threads", value_name = "N", default_value = "1", value_parser = number)]
    threads: usize,

    /// Iterations per trial, skips calibration
    #[arg(short = 'i', long = "iterations", value_name = "N", value_parser = iterations)]
    iterations: Option<u64>,

    /// Calibrate to this many seconds per trial
    #[arg(short = 's', long = "seconds", value_name = "SECONDS", value_parser = parse_real)]
    seconds: Option<f64>,

    /// Number of timed trials
    #[arg(short = 'e', long = "experiments", value_name = "N", default_value = "1", value_parser = number)]
    experiments: usize,

    /// Padding instructions after each step of all chains
    #[arg(short = 'g', long = "loop", value_name = "N", default_value = "0", value_parser = number)]
    loop_length: usize,

    /// Prefetch hint: none, nta, t0, t1 or t2
    #[arg(short = 'f', long = "prefetch", value_name = "HINT", default_value = "none")]
    prefetch: PrefetchHint,

    /// Access pattern: random, forward <stride> or reverse <stride>
    #[arg(short = 'a', long = "access", num_args = 1..=2, value_names = ["PATTERN", "STRIDE"])]
    access: Option<Vec<String>>,

    /// Output: hdr, header, csv, both or table
    #[arg(short = 'o', long = "output", value_name = "FORMAT", default_value = "table")]
    output: OutputMode,

    /// NUMA placement: local, xor <mask>, add <offset> or map <t:c,c;t:c,c>
    #[arg(short = 'n', long = "numa", num_args = 1..=2, value_names = ["POLICY", "ARG"])]
    numa: Option<Vec<String>>,

    /// Reject sizes that would have to be rounded up
    #[arg(short = 'x', long = "strict")]
    strict: bool,

    /// Hardware counters to sample in every trial, e.g. cycle,instr,l1-miss
    #[arg(long = "events", env = "CHASE_EVENTS", value_delimiter = ',')]
    events: Vec<String>,

    /// Log debug information to stderr
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

impl Args {
    fn options(self, matches: &ArgMatches) -> Result<Options, ChaseError> {
        // the later of -i and -s wins
        let calibration = match (
            self.iterations.zip(matches.index_of("iterations")),
            self.seconds.zip(matches.index_of("seconds")),
        ) {
            (Some((i, at_i)), Some((s, at_s))) => {
                if at_i > at_s {
                    CalibrationTarget::Iterations(i)
                } else {
                    CalibrationTarget::Seconds(s)
                }
            }
            (Some((i, _)), None) => CalibrationTarget::Iterations(i),
            (None, Some((s, _))) => CalibrationTarget::Seconds(s),
            (None, None) => Options::default().calibration,
        };
        Ok(Options {
            bytes_per_line: self.line,
            bytes_per_page: self.page,
            bytes_per_chain: self.chain,
            chains_per_thread: self.references,
            threads: self.threads,
            access: match &self.access {
                Some(tokens) => AccessPattern::from_tokens(tokens)?,
                None => AccessPattern::Random,
            },
            prefetch: self.prefetch,
            placement: match &self.numa {
                Some(tokens) => PlacementPolicy::from_tokens(tokens)?,
                None => PlacementPolicy::Local,
            },
            calibration,
            experiments: self.experiments,
            loop_length: self.loop_length,
            strict: self.strict,
            events: self.events,
            ..Options::default()
        })
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn run(args: Args, matches: &ArgMatches) -> Result<(), ChaseError> {
    let output = args.output;
    let options = args.options(matches)?;
    let experiment = Experiment::resolve(options, numa::domain_count())?;
    let report = pointer_chase::run(&experiment)?;
    if report.samples.is_empty() {
        tracing::warn!("no trial took a measurable amount of time");
    }
    output.format().write(&report, &mut io::stdout().lock())
}

fn main() -> ExitCode {
    let matches = Args::command().get_matches();
    let args = Args::from_arg_matches(&matches).unwrap_or_else(|e| e.exit());
    init_logging(args.verbose);
    match run(args, &matches) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("chase: {e}");
            eprintln!("Try 'chase --help' for more information.");
            ExitCode::FAILURE
        }
    }
}
