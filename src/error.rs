//! Error types for the two database parsers and the composite resolver.
//!
//! Per-line and per-record format errors are absorbed by the parsers
//! themselves (they are not reported here); only the failures that keep an
//! engine from being usable at all are represented.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failure loading a globs database.
#[derive(Debug, Error)]
pub enum GlobError {
    #[error("could not read globs database {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Failure loading a magic database.
#[derive(Debug, Error)]
pub enum MagicError {
    #[error("could not read magic database {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{path} does not start with the MIME-Magic signature")]
    BadSignature { path: PathBuf },
}

/// Failure constructing a [`crate::MimeResolver`].
#[derive(Debug, Error)]
pub enum InitError {
    #[error("neither the globs database ({glob_error}) nor the magic database ({magic_error}) could be loaded")]
    NoDatabases {
        glob_error: GlobError,
        magic_error: MagicError,
    },
}
