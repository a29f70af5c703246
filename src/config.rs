//! Experiment configuration.
//!
//! [`Options`] holds what the user asked for. It is validated and turned into an
//! immutable [`Experiment`] once, before any worker thread starts.

use crate::{
    error::{ChaseError, Result},
    geometry::Geometry,
    placement::Placement,
};
use std::{fmt, mem, str::FromStr};

/// Order in which the cache lines of a chain are visited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessPattern {
    /// Pages in pseudo-random order, lines within each page in pseudo-random order.
    Random,
    /// Lines `0, s, 2s, ...` in ascending order.
    Forward { stride: usize },
    /// The forward sequence walked backwards, ending at line 0.
    Reverse { stride: usize },
}

impl AccessPattern {
    /// Parses `random`, `forward <stride>` or `reverse <stride>`.
    pub fn from_tokens<S: AsRef<str>>(tokens: &[S]) -> Result<Self> {
        let tokens: Vec<&str> = tokens.iter().map(|t| t.as_ref()).collect();
        let (kind, rest) = tokens
            .split_first()
            .ok_or_else(|| ChaseError::Config("type of memory access pattern missing".into()))?;
        let stride = |direction: &str| -> Result<usize> {
            let value = rest.first().ok_or_else(|| {
                ChaseError::Config(format!(
                    "stride of {direction} memory access pattern missing"
                ))
            })?;
            match parse_number(value) {
                Ok(0) | Err(_) => Err(ChaseError::Config(format!(
                    "invalid stride of {direction} memory access pattern"
                ))),
                Ok(stride) => Ok(stride as usize),
            }
        };
        let kind = *kind;
        let pattern = if kind.eq_ignore_ascii_case("random") {
            AccessPattern::Random
        } else if kind.eq_ignore_ascii_case("forward") {
            AccessPattern::Forward {
                stride: stride("forward")?,
            }
        } else if kind.eq_ignore_ascii_case("reverse") {
            AccessPattern::Reverse {
                stride: stride("reverse")?,
            }
        } else {
            return Err(ChaseError::Config(format!(
                "invalid type of memory access pattern -- '{kind}'"
            )));
        };
        let consumed = if pattern == AccessPattern::Random { 1 } else { 2 };
        if tokens.len() > consumed {
            return Err(ChaseError::Config(format!(
                "unexpected argument to memory access pattern -- '{}'",
                tokens[consumed]
            )));
        }
        Ok(pattern)
    }

    /// Signed stride in lines: negative for reverse, 1 for random.
    pub fn stride(&self) -> i64 {
        match *self {
            AccessPattern::Random => 1,
            AccessPattern::Forward { stride } => stride as i64,
            AccessPattern::Reverse { stride } => -(stride as i64),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AccessPattern::Random => "random",
            AccessPattern::Forward { .. } => "forward",
            AccessPattern::Reverse { .. } => "reverse",
        }
    }
}

/// Cache locality hint issued for each freshly loaded node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrefetchHint {
    #[default]
    None,
    /// Non-temporal, the line is used once.
    Nta,
    /// All cache levels.
    T0,
    /// All levels except L1.
    T1,
    /// All levels except L1 and L2.
    T2,
}

impl PrefetchHint {
    pub fn name(&self) -> &'static str {
        match self {
            PrefetchHint::None => "none",
            PrefetchHint::Nta => "nta",
            PrefetchHint::T0 => "t0",
            PrefetchHint::T1 => "t1",
            PrefetchHint::T2 => "t2",
        }
    }
}

impl FromStr for PrefetchHint {
    type Err = ChaseError;

    fn from_str(s: &str) -> Result<Self> {
        [
            PrefetchHint::None,
            PrefetchHint::Nta,
            PrefetchHint::T0,
            PrefetchHint::T1,
            PrefetchHint::T2,
        ]
        .into_iter()
        .find(|hint| hint.name().eq_ignore_ascii_case(s))
        .ok_or_else(|| ChaseError::Config(format!("invalid type of prefetch hint -- '{s}'")))
    }
}

impl fmt::Display for PrefetchHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How threads and their chains are spread over NUMA domains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlacementPolicy {
    /// Every chain lives in its thread's domain.
    Local,
    /// Chains live in `thread_domain ^ mask`.
    Xor { mask: usize },
    /// Chains live in `thread_domain + offset`.
    Add { offset: usize },
    /// Explicit `t:c,c,...;t:c,c,...` map. Overrides thread and chain counts.
    Map(String),
}

impl PlacementPolicy {
    /// Parses `local`, `xor <mask>`, `add <offset>` or `map <map>`.
    pub fn from_tokens<S: AsRef<str>>(tokens: &[S]) -> Result<Self> {
        let tokens: Vec<&str> = tokens.iter().map(|t| t.as_ref()).collect();
        let (kind, rest) = tokens
            .split_first()
            .ok_or_else(|| ChaseError::Config("numa placement missing".into()))?;
        let argument = |missing: &str| -> Result<&str> {
            rest.first()
                .copied()
                .ok_or_else(|| ChaseError::Config(missing.to_string()))
        };
        let kind = *kind;
        let policy = if kind.eq_ignore_ascii_case("local") {
            PlacementPolicy::Local
        } else if kind.eq_ignore_ascii_case("xor") {
            PlacementPolicy::Xor {
                mask: parse_number(argument("numa placement xor mask missing")?)? as usize,
            }
        } else if kind.eq_ignore_ascii_case("add") {
            PlacementPolicy::Add {
                offset: parse_number(argument("numa placement addition offset missing")?)?
                    as usize,
            }
        } else if kind.eq_ignore_ascii_case("map") {
            PlacementPolicy::Map(argument("numa placement map specification missing")?.to_string())
        } else {
            return Err(ChaseError::Config(format!(
                "invalid numa placement -- '{kind}'"
            )));
        };
        let consumed = if policy == PlacementPolicy::Local { 1 } else { 2 };
        if tokens.len() > consumed {
            return Err(ChaseError::Config(format!(
                "unexpected argument to numa placement -- '{}'",
                tokens[consumed]
            )));
        }
        Ok(policy)
    }

    pub fn name(&self) -> &'static str {
        match self {
            PlacementPolicy::Local => "local",
            PlacementPolicy::Xor { .. } => "xor",
            PlacementPolicy::Add { .. } => "add",
            PlacementPolicy::Map(_) => "map",
        }
    }

    pub fn offset_or_mask(&self) -> usize {
        match *self {
            PlacementPolicy::Xor { mask } => mask,
            PlacementPolicy::Add { offset } => offset,
            PlacementPolicy::Local | PlacementPolicy::Map(_) => 0,
        }
    }
}

/// How many times the benchmark loop runs per trial.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CalibrationTarget {
    /// Fixed iteration count, calibration is skipped.
    Iterations(u64),
    /// Calibrate so that one trial takes about this many seconds.
    Seconds(f64),
}

/// Requested configuration, before rounding and placement.
#[derive(Debug, Clone)]
pub struct Options {
    pub pointer_size: usize,
    pub bytes_per_line: usize,
    pub bytes_per_page: usize,
    pub bytes_per_chain: usize,
    pub chains_per_thread: usize,
    pub threads: usize,
    pub access: AccessPattern,
    pub prefetch: PrefetchHint,
    pub placement: PlacementPolicy,
    pub calibration: CalibrationTarget,
    pub experiments: usize,
    /// Padding cycles executed after each step of all chains.
    pub loop_length: usize,
    /// Reject sizes that would need rounding instead of rounding them up.
    pub strict: bool,
    /// Hardware counter aliases to sample in every trial.
    pub events: Vec<String>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            pointer_size: mem::size_of::<*const ()>(),
            bytes_per_line: 64,
            bytes_per_page: 4 << 10,
            bytes_per_chain: 1 << 20,
            chains_per_thread: 1,
            threads: 1,
            access: AccessPattern::Random,
            prefetch: PrefetchHint::None,
            placement: PlacementPolicy::Local,
            calibration: CalibrationTarget::Seconds(1.0),
            experiments: 1,
            loop_length: 0,
            strict: false,
            events: Vec::new(),
        }
    }
}

impl Options {
    /// Rejects values the core cannot work with.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            (self.pointer_size, "invalid pointer size"),
            (self.bytes_per_line, "invalid cache line size"),
            (self.bytes_per_page, "invalid page size"),
            (self.bytes_per_chain, "invalid chain size"),
            (self.chains_per_thread, "invalid amount of chains per thread"),
            (self.threads, "invalid amount of threads"),
            (self.experiments, "invalid amount of experiments"),
        ];
        for (value, msg) in positive {
            if value == 0 {
                return Err(ChaseError::Config(msg.into()));
            }
        }
        if self.pointer_size != mem::size_of::<*const ()>() {
            return Err(ChaseError::Config(format!(
                "unsupported pointer size ({})",
                self.pointer_size
            )));
        }
        if self.bytes_per_line < self.pointer_size {
            return Err(ChaseError::Config(format!(
                "cache line size ({}) smaller than pointer size ({})",
                self.bytes_per_line, self.pointer_size
            )));
        }
        match self.calibration {
            CalibrationTarget::Iterations(0) => {
                return Err(ChaseError::Config("invalid amount of iterations".into()));
            }
            CalibrationTarget::Seconds(s) if !(s.is_finite() && s > 0.0) => {
                return Err(ChaseError::Config("invalid amount of seconds".into()));
            }
            _ => {}
        }
        if let AccessPattern::Forward { stride: 0 } | AccessPattern::Reverse { stride: 0 } =
            self.access
        {
            return Err(ChaseError::Config("invalid stride".into()));
        }
        Ok(())
    }
}

/// A fully resolved experiment. Read-only once constructed.
#[derive(Debug, Clone)]
pub struct Experiment {
    pub geometry: Geometry,
    pub placement: Placement,
    pub policy: PlacementPolicy,
    pub access: AccessPattern,
    pub prefetch: PrefetchHint,
    pub calibration: CalibrationTarget,
    pub experiments: usize,
    pub loop_length: usize,
    pub events: Vec<String>,
}

impl Experiment {
    /// Validates `options`, derives the geometry and plans placement over `numa_domains` domains.
    pub fn resolve(options: Options, numa_domains: usize) -> Result<Self> {
        options.validate()?;
        let geometry = if options.strict {
            Geometry::resolve_strict(
                options.pointer_size,
                options.bytes_per_line,
                options.bytes_per_page,
                options.bytes_per_chain,
            )?
        } else {
            Geometry::resolve(
                options.pointer_size,
                options.bytes_per_line,
                options.bytes_per_page,
                options.bytes_per_chain,
            )
        };
        geometry.check_traversable()?;
        let placement = Placement::plan(
            &options.placement,
            options.threads,
            options.chains_per_thread,
            numa_domains,
        )?;
        tracing::debug!(?geometry, ?placement, "resolved experiment");
        Ok(Experiment {
            geometry,
            placement,
            policy: options.placement,
            access: options.access,
            prefetch: options.prefetch,
            calibration: options.calibration,
            experiments: options.experiments,
            loop_length: options.loop_length,
            events: options.events,
        })
    }

    pub fn threads(&self) -> usize {
        self.placement.threads()
    }

    pub fn chains_per_thread(&self) -> usize {
        self.placement.chains_per_thread()
    }

    pub fn bytes_per_thread(&self) -> usize {
        self.geometry.bytes_per_chain * self.chains_per_thread()
    }

    pub fn bytes_per_test(&self) -> usize {
        self.bytes_per_thread() * self.threads()
    }
}

/// Parses a decimal integer with an optional binary suffix.
///
/// `k`, `m`, `g` and `t` (either case) multiply by 2^10, 2^20, 2^30 and 2^40.
pub fn parse_number(s: &str) -> Result<u64> {
    let invalid = || ChaseError::Config(format!("invalid number -- '{s}'"));
    let digits_end = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    if digits_end == 0 {
        return Err(invalid());
    }
    let value: u64 = s[..digits_end].parse().map_err(|_| invalid())?;
    let shift = match &s[digits_end..] {
        "" => 0,
        "k" | "K" => 10,
        "m" | "M" => 20,
        "g" | "G" => 30,
        "t" | "T" => 40,
        _ => return Err(invalid()),
    };
    value.checked_mul(1 << shift).ok_or_else(invalid)
}

/// Parses a non-negative decimal real such as `0.5` or `2`.
pub fn parse_real(s: &str) -> Result<f64> {
    match s.parse::<f64>() {
        Ok(x) if x.is_finite() && x >= 0.0 => Ok(x),
        _ => Err(ChaseError::Config(format!("invalid number -- '{s}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn number_suffixes() {
        let cases = [
            ("0", 0),
            ("64", 64),
            ("4k", 4 << 10),
            ("4K", 4 << 10),
            ("1m", 1 << 20),
            ("3M", 3 << 20),
            ("2g", 2 << 30),
            ("1T", 1 << 40),
        ];
        for (input, expected) in cases {
            assert_eq!(parse_number(input).unwrap(), expected, "{input}");
        }
    }

    #[test]
    fn number_rejects_garbage() {
        for input in ["", "k", "12x", "4kk", "-3", "1.5"] {
            assert!(parse_number(input).is_err(), "{input:?} accepted");
        }
        assert!(parse_number("99999999999t").is_err());
    }

    #[test]
    fn real_numbers() {
        assert_eq!(parse_real("0.5").unwrap(), 0.5);
        assert_eq!(parse_real("2").unwrap(), 2.0);
        assert!(parse_real("-1").is_err());
        assert!(parse_real("inf").is_err());
    }

    #[test]
    fn access_tokens() {
        assert_eq!(
            AccessPattern::from_tokens(&["random"]).unwrap(),
            AccessPattern::Random
        );
        assert_eq!(
            AccessPattern::from_tokens(&["Forward", "3"]).unwrap(),
            AccessPattern::Forward { stride: 3 }
        );
        let reverse = AccessPattern::from_tokens(&["reverse", "2"]).unwrap();
        assert_eq!(reverse, AccessPattern::Reverse { stride: 2 });
        assert_eq!(reverse.stride(), -2);
        assert!(AccessPattern::from_tokens(&["forward"]).is_err());
        assert!(AccessPattern::from_tokens(&["forward", "0"]).is_err());
        assert!(AccessPattern::from_tokens(&["random", "4"]).is_err());
        assert!(AccessPattern::from_tokens(&["sideways"]).is_err());
    }

    #[test]
    fn placement_tokens() {
        assert_eq!(
            PlacementPolicy::from_tokens(&["local"]).unwrap(),
            PlacementPolicy::Local
        );
        assert_eq!(
            PlacementPolicy::from_tokens(&["xor", "1"]).unwrap(),
            PlacementPolicy::Xor { mask: 1 }
        );
        assert_eq!(
            PlacementPolicy::from_tokens(&["ADD", "2"]).unwrap(),
            PlacementPolicy::Add { offset: 2 }
        );
        assert_eq!(
            PlacementPolicy::from_tokens(&["map", "0:1,2;1:3,4"]).unwrap(),
            PlacementPolicy::Map("0:1,2;1:3,4".into())
        );
        assert!(PlacementPolicy::from_tokens(&["map"]).is_err());
        assert!(PlacementPolicy::from_tokens::<&str>(&[]).is_err());
    }

    #[test]
    fn prefetch_names() {
        assert_eq!("NTA".parse::<PrefetchHint>().unwrap(), PrefetchHint::Nta);
        assert_eq!("t2".parse::<PrefetchHint>().unwrap(), PrefetchHint::T2);
        assert!("t3".parse::<PrefetchHint>().is_err());
    }

    #[test]
    fn validation() {
        assert!(Options::default().validate().is_ok());
        let bad = [
            Options {
                bytes_per_line: 0,
                ..Options::default()
            },
            Options {
                bytes_per_line: 4,
                pointer_size: 8,
                ..Options::default()
            },
            Options {
                calibration: CalibrationTarget::Iterations(0),
                ..Options::default()
            },
            Options {
                calibration: CalibrationTarget::Seconds(0.0),
                ..Options::default()
            },
            Options {
                threads: 0,
                ..Options::default()
            },
        ];
        for options in bad {
            assert!(options.validate().is_err(), "{options:?}");
        }
    }

    #[test]
    fn map_overrides_counts() {
        let experiment = Experiment::resolve(
            Options {
                threads: 7,
                chains_per_thread: 3,
                placement: PlacementPolicy::Map("0:0,0;1:1,1".into()),
                ..Options::default()
            },
            2,
        )
        .unwrap();
        assert_eq!(experiment.threads(), 2);
        assert_eq!(experiment.chains_per_thread(), 2);
        assert_eq!(
            experiment.bytes_per_test(),
            experiment.geometry.bytes_per_chain * 4
        );
    }

    proptest! {
        #[test]
        fn suffix_is_a_shift(value in 0u64..1 << 20, suffix in prop::sample::select(vec![
            ("", 0u32), ("k", 10), ("M", 20), ("g", 30),
        ])) {
            let parsed = parse_number(&format!("{value}{}", suffix.0)).unwrap();
            prop_assert_eq!(parsed, value << suffix.1);
        }
    }
}
