use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

use crate::error::PipelineError;

/// Terminal cancellation signal shared by every part of one pipeline stage.
///
/// Only the first abort reason is kept; later calls still succeed but do not
/// replace it.
#[derive(Clone, Debug, Default)]
pub struct AbortSignal {
    inner: Arc<SignalInner>,
}

#[derive(Debug, Default)]
struct SignalInner {
    token: CancellationToken,
    reason: OnceLock<PipelineError>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires the signal. Returns `true` for the call that actually fired it.
    pub fn abort(&self, reason: PipelineError) -> bool {
        let first = self.inner.reason.set(reason).is_ok();
        self.inner.token.cancel();
        first
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<PipelineError> {
        self.inner.reason.get().cloned()
    }

    /// Resolves with the abort reason once the signal fires.
    pub async fn aborted(&self) -> PipelineError {
        self.inner.token.cancelled().await;
        self.reason()
            .unwrap_or_else(|| PipelineError::aborted("signal fired"))
    }
}
