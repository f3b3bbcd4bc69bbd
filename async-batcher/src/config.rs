//! Configuration for the batcher.

use std::{cmp::max, time::Duration};

use serde::{Deserialize, Serialize};

/// The default wait for another request before a partial batch is dispatched.
pub const DEFAULT_STRAGGLER_TIMEOUT: Duration = Duration::from_secs(5);

/// Batch formation and dispatch settings.
///
/// These settings are fixed when the [`Batcher`](crate::Batcher) is created.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// The maximum number of items passed to one batch function call.
    ///
    /// The default of `1` effectively disables batching.
    pub max_batch_size: usize,

    /// The maximum number of requests waiting in the intake queue.
    ///
    /// Further submissions wait until a queued request is drained into a batch.
    pub max_queue_size: usize,

    /// How long the worker waits for one more request before it dispatches a
    /// batch that is smaller than `max_batch_size`.
    ///
    /// This wait restarts after each arriving request.
    /// It never limits how long the batch function itself runs.
    #[serde(with = "humantime_serde")]
    pub straggler_timeout: Duration,

    /// The number of dispatch threads running the batch function.
    ///
    /// This is also the maximum number of batches in flight.
    /// With the default of `1`, one batch runs at a time.
    pub dispatch_threads: usize,
}

// we like our default configs to be explicit
#[allow(unknown_lints)]
#[allow(clippy::derivable_impls)]
impl Default for Config {
    fn default() -> Self {
        Self {
            max_batch_size: 1,
            max_queue_size: 100,
            straggler_timeout: DEFAULT_STRAGGLER_TIMEOUT,
            dispatch_threads: 1,
        }
    }
}

impl Config {
    /// Returns a copy of this config with every limit clamped to at least one.
    pub(crate) fn clamped(&self) -> Self {
        if self.max_batch_size == 0 || self.max_queue_size == 0 || self.dispatch_threads == 0 {
            tracing::warn!(
                max_batch_size = self.max_batch_size,
                max_queue_size = self.max_queue_size,
                dispatch_threads = self.dispatch_threads,
                "batcher limits must be at least 1, clamping to 1",
            );
        }

        Self {
            max_batch_size: max(self.max_batch_size, 1),
            max_queue_size: max(self.max_queue_size, 1),
            straggler_timeout: self.straggler_timeout,
            dispatch_threads: max(self.dispatch_threads, 1),
        }
    }
}
