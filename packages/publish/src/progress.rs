//! Progress reporting for the tile phase of a publish.
//!
//! [`ProgressCallback`] keeps the publisher independent of any rendering
//! backend. The CLI supplies an `indicatif` implementation; tests and
//! library callers use [`NullProgress`].

use std::sync::Arc;

/// Receives progress updates from a running publish.
///
/// Implementations must be `Send + Sync`: tile workers report from inside
/// the concurrent pool.
pub trait ProgressCallback: Send + Sync {
    /// Sets the number of tiles expected in the current phase.
    fn set_total(&self, total: u64);

    /// Advances by `delta` tiles.
    fn inc(&self, delta: u64);

    /// Updates the label shown next to the indicator.
    fn set_message(&self, msg: String);

    /// Completes the indicator with a final message.
    fn finish(&self, msg: String);
}

/// Ignores every update.
pub struct NullProgress;

impl ProgressCallback for NullProgress {
    fn set_total(&self, _total: u64) {}
    fn inc(&self, _delta: u64) {}
    fn set_message(&self, _msg: String) {}
    fn finish(&self, _msg: String) {}
}

/// Returns a shared [`NullProgress`].
#[must_use]
pub fn null_progress() -> Arc<dyn ProgressCallback> {
    Arc::new(NullProgress)
}
