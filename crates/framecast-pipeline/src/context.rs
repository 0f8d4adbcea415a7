//! Shared context for a pipeline run.

use framecast_core::{Error, MediaState, ProgressSender, Result};
use tokio_util::sync::CancellationToken;

/// Cancellation and progress plumbing threaded through a conversion.
pub struct PipelineContext {
    /// Token observed at every stage boundary; cancelling it rejects the
    /// conversion with [`Error::Aborted`].
    pub cancellation: CancellationToken,
    /// Snapshot sink for progress updates.
    pub progress: ProgressSender,
}

impl PipelineContext {
    pub fn new() -> Self {
        Self {
            cancellation: CancellationToken::new(),
            progress: ProgressSender::noop(),
        }
    }

    /// Builder: attach a cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Builder: attach a progress sender.
    pub fn with_progress(mut self, progress: ProgressSender) -> Self {
        self.progress = progress;
        self
    }

    /// Fail fast when the run was aborted.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancellation.is_cancelled() {
            Err(Error::aborted())
        } else {
            Ok(())
        }
    }

    /// Publish a progress snapshot.
    pub fn report(&self, state: &MediaState) {
        self.progress.send(state);
    }
}

impl Default for PipelineContext {
    fn default() -> Self {
        Self::new()
    }
}
