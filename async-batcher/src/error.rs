//! Error types for the `Batcher`.

use std::{error::Error, sync::Arc};

use thiserror::Error;

use crate::BoxError;

/// An error returned to a batched request's caller.
///
/// Batch-wide failures are delivered to every request in the batch,
/// so this type is cheap to clone, and clones share the underlying error.
#[derive(Clone, Debug, Error)]
pub enum BatchError {
    /// The batcher was closed, or its worker stopped, before the request was queued.
    #[error("batch queue is closed")]
    QueueClosed,

    /// The batch function returned an error for the request's batch.
    #[error("batch function failed: {0}")]
    BatchFunction(#[source] Arc<dyn Error + Send + Sync + 'static>),

    /// The batch function panicked while processing the request's batch.
    #[error("batch function panicked: {0}")]
    BatchFunctionPanic(Arc<str>),

    /// The batch function returned a different number of outputs than it was given items.
    #[error("batch function returned {outputs} outputs for {inputs} items")]
    BatchSizeMismatch {
        /// The number of items in the batch.
        inputs: usize,
        /// The number of outputs returned by the batch function.
        outputs: usize,
    },

    /// The request was taken from the queue, but its result was never delivered.
    #[error("batched request was dropped without a result")]
    UnresolvedSlot,
}

impl BatchError {
    /// Wraps an error returned by the batch function.
    pub(crate) fn batch_function(error: BoxError) -> Self {
        BatchError::BatchFunction(Arc::from(error))
    }

    /// Converts a panic payload from the batch function into an error.
    pub(crate) fn panic(payload: Box<dyn std::any::Any + Send + 'static>) -> Self {
        let message = payload
            .downcast_ref::<String>()
            .map(String::as_str)
            .or_else(|| payload.downcast_ref::<&str>().copied())
            .unwrap_or("<non string panic payload>");

        BatchError::BatchFunctionPanic(message.into())
    }

    /// Returns `true` if this error applies to the whole batch the request was part of.
    pub fn is_batch_failure(&self) -> bool {
        matches!(
            self,
            BatchError::BatchFunction(_)
                | BatchError::BatchFunctionPanic(_)
                | BatchError::BatchSizeMismatch { .. }
        )
    }
}

/// An error creating a [`Batcher`](crate::Batcher).
#[derive(Debug, Error)]
pub enum BuildError {
    /// The dispatch thread pool could not be created.
    #[error("could not build the batch dispatch thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}
