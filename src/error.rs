use thiserror::Error;

/// Errors produced while resolving or running a pointer chasing experiment.
#[derive(Error, Debug)]
pub enum ChaseError {
    /// A configuration value is missing, zero, or otherwise unusable.
    #[error("{0}")]
    Config(String),

    /// The placement map does not follow `t:c,c,...;t:c,c,...`
    /// or its segments disagree on the number of chains.
    #[error("malformed map: {0}")]
    MalformedMap(String),

    /// Strict mode refused to round a size up.
    #[error("strict: {what} ({requested} bytes) is not a multiple of {unit} bytes")]
    StrictGeometry {
        what: &'static str,
        requested: usize,
        unit: usize,
    },

    /// A chain resolved to zero traversable nodes.
    #[error("degenerate geometry: {0}")]
    DegenerateGeometry(&'static str),

    /// A barrier wait was cancelled through its abort token.
    #[error("barrier aborted")]
    Aborted,

    #[error("worker thread {0} panicked")]
    WorkerPanicked(usize),

    #[error("counter {name:?}: {source}")]
    Counter {
        name: String,
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("error writing csv: {0}")]
    Csv(#[from] csv::Error),
}

pub type Result<T, E = ChaseError> = std::result::Result<T, E>;
