//! Tracer-internal error kinds. These never cross the recording API:
//! recording entry points have void effect semantics (spec: a failed
//! dump or a failed capture start is logged and the affected operation
//! is abandoned for that fd, but the tracee's view of the world is
//! never touched). `TracerError` exists so that internal call sites
//! can use `?` instead of hand-rolled `if let Err = ... { log!(...) }`
//! chains, not so callers can react to it.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum TracerError {
    #[error("failed to open dump file {path:?} for connection {id}: {source}")]
    DumpOpen {
        id: u64,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write dump record for connection {id}: {source}")]
    DumpWrite {
        id: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("capture side-car failed to start: {0}")]
    CaptureStart(String),

    #[error("force-bind exhausted port range without success")]
    ForceBindExhausted,
}
