//! Batch worker collection loop.

use std::time::Duration;

use crate::{config::Config, dispatch::Dispatcher, queue::IntakeReceiver};

/// Task that collects queued requests into batches, and dispatches them.
///
/// A `Worker` is returned by [`Batcher::pair`](crate::Batcher::pair), and must be
/// spawned by the caller, or it can be spawned automatically using
/// [`Batcher::spawn`](crate::Batcher::spawn).
///
/// Dropping the worker fails every queued request with
/// [`BatchError::QueueClosed`](crate::BatchError::QueueClosed).
#[derive(Debug)]
pub struct Worker<Item, Output>
where
    Item: Send + 'static,
    Output: Send + 'static,
{
    // Batch management
    //
    /// The draining side of the intake queue.
    rx: IntakeReceiver<Item, Output>,

    /// Runs closed batches on the dispatch threads.
    dispatcher: Dispatcher<Item, Output>,

    // Config
    //
    /// The maximum number of items allowed in a batch.
    max_batch_size: usize,

    /// The maximum wait for one more item before dispatching a partial batch.
    straggler_timeout: Duration,
}

impl<Item, Output> Worker<Item, Output>
where
    Item: Send + 'static,
    Output: Send + 'static,
{
    /// Creates a new batch worker.
    ///
    /// See [`Batcher::pair()`](crate::Batcher::pair) for details.
    pub(crate) fn new(
        rx: IntakeReceiver<Item, Output>,
        dispatcher: Dispatcher<Item, Output>,
        config: &Config,
    ) -> Self {
        Worker {
            rx,
            dispatcher,
            max_batch_size: config.max_batch_size,
            straggler_timeout: config.straggler_timeout,
        }
    }

    /// Run loop for batch requests, which implements the batch policies.
    ///
    /// Runs until the [`Batcher`](crate::Batcher) is closed and every queued
    /// request has been processed, or until every `Batcher` handle is dropped.
    /// Batch function failures never stop the loop.
    pub async fn run(mut self) {
        loop {
            // Only collect a batch once there's a free dispatch thread, so waiting
            // requests stay in the queue and keep applying backpressure.
            let Some(reservation) = self.dispatcher.ready().await else {
                tracing::trace!("batch dispatcher stopped, exiting worker task");
                return;
            };

            tracing::trace!(
                running_batches = self.dispatcher.running_batches(),
                "waiting for batch requests",
            );

            let Some(batch) = self
                .rx
                .drain_up_to(self.max_batch_size, self.straggler_timeout)
                .await
            else {
                tracing::trace!("batch queue closed and emptied");
                break;
            };

            tracing::trace!(
                batch_size = batch.len(),
                max_batch_size = self.max_batch_size,
                running_batches = self.dispatcher.running_batches(),
                "dispatching batch",
            );

            self.dispatcher.dispatch(reservation, batch);
        }

        tracing::trace!(
            running_batches = self.dispatcher.running_batches(),
            "waiting for running batches before exiting worker task",
        );
        self.dispatcher.shutdown().await;

        tracing::debug!("batch worker finished");
    }
}

impl<Item, Output> Drop for Worker<Item, Output>
where
    Item: Send + 'static,
    Output: Send + 'static,
{
    fn drop(&mut self) {
        tracing::trace!(
            running_batches = self.dispatcher.running_batches(),
            "dropping batch worker",
        );

        // Stop accepting requests; the receiver fails any queued requests when it drops.
        self.rx.close();
    }
}
