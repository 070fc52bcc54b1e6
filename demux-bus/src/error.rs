use thiserror::Error;

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

/// Misuse of the writable side of a [`crate::monitor::MonitorSink`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkConnectionError {
    #[error("sink is already connected to a destination")]
    AlreadyConnected,
    #[error("sink destination is gone")]
    NotConnected,
}

/// Terminal failure of a pipeline stage.
///
/// Errors are cloned to every party that observes the failure (pending writers,
/// the readable side, the abort signal), so the payloads are plain strings.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("unable to allocate packet")]
    AllocationFailure,
    #[error("unable to open input: {0}")]
    EngineOpenFailure(String),
    #[error("error reading packet: {0}")]
    EngineReadFailure(String),
    #[error(transparent)]
    SinkConnection(#[from] SinkConnectionError),
    #[error("decoder for stream {stream_id} failed: {message}")]
    DecodeSessionFailure { stream_id: usize, message: String },
    #[error("pipeline aborted: {0}")]
    Aborted(String),
    #[error("input error: {0}")]
    Input(String),
    #[error("transform failed: {0}")]
    Transform(String),
    #[error("stream is closed")]
    Closed,
}

impl PipelineError {
    pub fn aborted(reason: impl Into<String>) -> Self {
        Self::Aborted(reason.into())
    }

    pub fn transform(err: impl std::fmt::Display) -> Self {
        Self::Transform(err.to_string())
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        Self::Input(err.to_string())
    }
}

