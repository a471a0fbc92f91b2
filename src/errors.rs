//! Ingest error taxonomy.
//!
//! Everything here is fatal process-wide: a missing or malformed input file
//! leaves the engine without a usable model atom or ejecta model, so errors
//! propagate up to `main` and abort with nonzero status.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("cannot open {path}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("i/o failure reading {path}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed record in {file}: expected {what}, found {found:?}")]
    Malformed {
        file: String,
        what: &'static str,
        found: Option<String>,
    },

    #[error("unexpected end of file in {0}")]
    UnexpectedEof(String),

    #[error("inconsistent input data: {0}")]
    Inconsistent(String),

    #[error("resource limit exceeded: {0}")]
    ResourceLimit(String),
}
