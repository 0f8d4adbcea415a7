//! Progress reporting for running conversions.
//!
//! [`ProgressSender`] wraps a callback that receives [`MediaState`] snapshots.
//! The pipeline copies the snapshot before sending; observers must assume
//! intermediate updates may be coalesced under load.

use serde::{Deserialize, Serialize};

/// Counters describing how far a conversion has progressed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaState {
    /// Video frames produced by decoders.
    pub decoded_video: u64,
    /// Audio frames produced by decoders.
    pub decoded_audio: u64,
    /// Video chunks submitted to the muxer.
    pub encoded_video: u64,
    /// Audio chunks submitted to the muxer.
    pub encoded_audio: u64,
    /// Highest `timestamp + duration` seen on any output chunk, in
    /// microseconds.
    pub duration_micros: i64,
}

impl MediaState {
    /// Fold an output chunk's end time into the running duration.
    pub fn observe_output(&mut self, timestamp_micros: i64, duration_micros: u32) {
        let end = timestamp_micros + i64::from(duration_micros);
        if end > self.duration_micros {
            self.duration_micros = end;
        }
    }
}

/// Sender for reporting progress snapshots to the caller.
pub struct ProgressSender {
    callback: Box<dyn Fn(&MediaState) + Send + Sync>,
}

impl ProgressSender {
    /// Create a new sender from the given callback.
    pub fn new(callback: impl Fn(&MediaState) + Send + Sync + 'static) -> Self {
        Self {
            callback: Box::new(callback),
        }
    }

    /// Create a no-op sender that discards all snapshots.
    pub fn noop() -> Self {
        Self {
            callback: Box::new(|_| {}),
        }
    }

    /// Report a snapshot.
    pub fn send(&self, state: &MediaState) {
        (self.callback)(state);
    }
}

impl std::fmt::Debug for ProgressSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressSender").finish_non_exhaustive()
    }
}
