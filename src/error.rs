use std::time::Duration;

/// Failures that cross module boundaries.
///
/// Per-line parse failures and per-endpoint probe failures never show up
/// here; they are absorbed into domain values (`None`, sentinel latency)
/// so one bad input cannot abort a batch.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// The engine binary started but reported failure on its output stream.
    #[error("xray failed to start: {0}")]
    EngineStart(String),

    /// The engine exited before printing any readiness marker.
    #[error("xray exited before reporting readiness")]
    EngineExited,

    /// No readiness or failure marker arrived in time.
    #[error("xray produced no readiness marker within {0:?}")]
    StartTimeout(Duration),

    /// The latency tester finished with instances still running. Fatal:
    /// indicates a supervisor leak, not a transient condition.
    #[error("latency tester leaked {0} running instances")]
    SupervisorLeak(usize),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
