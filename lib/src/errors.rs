use std::result::Result as StdResult;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum OxliError {
    #[error("failed to load/read/write file: {0:?}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse the fasta/fastq file: {0}")]
    Needletail(#[from] needletail::errors::ParseError),
    #[error("json error: {0:?}")]
    Json(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("invalid value: {0}")]
    Value(String),
    #[error("bad k-mer length: expected {expected}, got {got}")]
    BadLength { expected: usize, got: usize },
    #[error("non-ACGT base {0:?} in k-mer")]
    BadAlphabet(char),
    #[error("sketch is too saturated (false positive rate {0:.3})")]
    Saturation(f64),
    #[error("incompatible sketches: {0}")]
    IncompatibleSketch(String),
    #[error("incompatible HLL counters: {0}")]
    IncompatibleHll(String),
    #[error("graph traversal hit the size cap after {visited} nodes")]
    TraversalAborted { visited: u64 },
    #[error("malformed {filetype} file {path}: {reason}")]
    BadFormat {
        filetype: &'static str,
        path: String,
        reason: String,
    },
    #[error("oxli error: {0}")]
    Message(String),
}

pub type OxliResult<T> = StdResult<T, OxliError>;

#[doc(hidden)]
#[macro_export]
macro_rules! bail {
    ($e:expr) => {
        return Err($crate::errors::OxliError::Message($e.to_owned()));
    };
    ($fmt:expr, $($arg:tt)*) => {
        return Err($crate::errors::OxliError::Message(format!($fmt, $($arg)*)))
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! format_err {
    ($($arg:tt)*) => { $crate::errors::OxliError::Message(format!($($arg)*)) }
}
