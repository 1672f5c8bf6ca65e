use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures local to blob persistence. None of these reach the client: callers
/// either abort startup (`StoreUnavailable`) or degrade to an uncached fetch.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("blob store {path} is unavailable: {source}")]
    StoreUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to create blob file {path}: {source}")]
    FileCreate {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to open cached blob {path}: {source}")]
    FileOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to stat cached blob {path}: {source}")]
    FileStat {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to persist blob {key}: {source}")]
    PersistWrite {
        key: String,
        #[source]
        source: io::Error,
    },
}
