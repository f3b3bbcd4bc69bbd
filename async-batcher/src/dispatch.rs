//! Running batch functions on a dedicated thread pool.
//!
//! Batch functions are synchronous, and can take a long time, so they must not
//! run on the async runtime that serves callers. The [`Dispatcher`] owns a
//! fixed-size [`rayon`] pool, and limits the number of batches in flight to the
//! number of threads in that pool.

use std::{
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::{
    error::{BatchError, BuildError},
    message::PendingRequest,
    BoxError,
};

/// A synchronous function that processes a batch of items.
///
/// The function receives the batch items in submission order, and must return
/// exactly one output per item, in the same order. If it returns an error or
/// panics, every item in the batch fails with that error.
///
/// This trait is implemented for closures and functions with the signature
/// `Fn(Vec<Item>) -> Result<Vec<Output>, E>`, where `E: Into<BoxError>`.
pub trait BatchFn<Item, Output>: Send + Sync + 'static {
    /// Processes `items`, returning the output for each item in the same order.
    fn call(&self, items: Vec<Item>) -> Result<Vec<Output>, BoxError>;
}

impl<F, Item, Output, E> BatchFn<Item, Output> for F
where
    F: Fn(Vec<Item>) -> Result<Vec<Output>, E> + Send + Sync + 'static,
    E: Into<BoxError>,
{
    fn call(&self, items: Vec<Item>) -> Result<Vec<Output>, BoxError> {
        self(items).map_err(Into::into)
    }
}

/// Runs batches on a dedicated thread pool, and resolves their requests.
pub(crate) struct Dispatcher<Item, Output> {
    /// The batch function shared by all dispatch threads.
    batch_fn: Arc<dyn BatchFn<Item, Output>>,

    /// The threads that run the batch function.
    pool: rayon::ThreadPool,

    /// One permit per dispatch thread, held by each batch in flight.
    in_flight: Arc<Semaphore>,

    /// The number of dispatch threads.
    threads: usize,
}

impl<Item, Output> Dispatcher<Item, Output>
where
    Item: Send + 'static,
    Output: Send + 'static,
{
    /// Creates a dispatcher with `threads` dispatch threads.
    pub(crate) fn new(
        batch_fn: Arc<dyn BatchFn<Item, Output>>,
        threads: usize,
    ) -> Result<Self, BuildError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|index| format!("batch-dispatch-{index}"))
            .build()?;

        Ok(Self {
            batch_fn,
            pool,
            in_flight: Arc::new(Semaphore::new(threads)),
            threads,
        })
    }

    /// Waits until a dispatch thread is free, and returns a reservation for it.
    ///
    /// Returns `None` if the dispatcher is shutting down.
    pub(crate) async fn ready(&self) -> Option<OwnedSemaphorePermit> {
        self.in_flight.clone().acquire_owned().await.ok()
    }

    /// Returns the number of batches currently running.
    pub(crate) fn running_batches(&self) -> usize {
        self.threads - self.in_flight.available_permits()
    }

    /// Starts running `batch` on a dispatch thread, using a reservation from [`Self::ready`].
    ///
    /// Returns immediately, usually before the batch is completed.
    /// Every request in the batch is resolved when the batch completes.
    pub(crate) fn dispatch(
        &self,
        reservation: OwnedSemaphorePermit,
        batch: Vec<PendingRequest<Item, Output>>,
    ) {
        let batch_fn = self.batch_fn.clone();
        let span = tracing::debug_span!("batch", batch_size = batch.len());

        metrics::counter!("batcher.batches.dispatched").increment(1);
        metrics::histogram!("batcher.batch.size").record(batch.len() as f64);

        // Correctness: Do blocking work on a dedicated thread, to avoid blocking other futures.
        self.pool.spawn_fifo(move || {
            let _reservation = reservation;
            span.in_scope(|| run_batch(batch_fn.as_ref(), batch));
        });
    }

    /// Waits for every batch in flight to finish, then stops dispatching batches.
    pub(crate) async fn shutdown(&self) {
        let permits = u32::try_from(self.threads).unwrap_or(u32::MAX);

        if self.in_flight.acquire_many(permits).await.is_err() {
            tracing::trace!("dispatcher was already shut down");
        }

        self.in_flight.close();
    }
}

impl<Item, Output> fmt::Debug for Dispatcher<Item, Output> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("batch_fn", &std::any::type_name::<dyn BatchFn<Item, Output>>())
            .field("pool", &self.pool)
            .field("in_flight", &self.in_flight)
            .field("threads", &self.threads)
            .finish()
    }
}

/// Calls `batch_fn` with the items in `batch`, and resolves every request in `batch`.
///
/// Errors and panics in the batch function are delivered to every request,
/// and never propagate to the caller of this function.
pub(crate) fn run_batch<Item, Output>(
    batch_fn: &dyn BatchFn<Item, Output>,
    batch: Vec<PendingRequest<Item, Output>>,
) where
    Item: Send + 'static,
    Output: Send + 'static,
{
    let (items, slots): (Vec<_>, Vec<_>) = batch
        .into_iter()
        .map(PendingRequest::into_parts)
        .unzip();
    let inputs = items.len();

    tracing::trace!(batch_size = inputs, "running batch function");

    let error = match catch_unwind(AssertUnwindSafe(|| batch_fn.call(items))) {
        Ok(Ok(outputs)) if outputs.len() == inputs => {
            metrics::counter!("batcher.items.resolved").increment(inputs as u64);

            for (slot, output) in slots.into_iter().zip(outputs) {
                slot.resolve(Ok(output));
            }

            return;
        }
        Ok(Ok(outputs)) => {
            tracing::error!(
                inputs,
                outputs = outputs.len(),
                "batch function returned the wrong number of outputs",
            );

            BatchError::BatchSizeMismatch {
                inputs,
                outputs: outputs.len(),
            }
        }
        Ok(Err(error)) => {
            tracing::warn!(?error, batch_size = inputs, "batch function failed");

            BatchError::batch_function(error)
        }
        Err(panic) => {
            let error = BatchError::panic(panic);
            tracing::warn!(%error, batch_size = inputs, "batch function panicked");

            error
        }
    };

    metrics::counter!("batcher.batches.failed").increment(1);
    metrics::counter!("batcher.items.failed").increment(inputs as u64);

    for slot in slots {
        slot.resolve(Err(error.clone()));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::message::Rx;

    fn batch_of(items: &[u32]) -> (Vec<PendingRequest<u32, u32>>, Vec<Rx<u32>>) {
        items
            .iter()
            .map(|&item| PendingRequest::new(item, tracing::Span::none()))
            .unzip()
    }

    fn results(receivers: Vec<Rx<u32>>) -> Vec<Result<u32, BatchError>> {
        receivers
            .into_iter()
            .map(|mut rx| rx.try_recv().expect("every slot is resolved"))
            .collect()
    }

    #[test]
    fn outputs_are_delivered_in_order() {
        let _init_guard = async_batcher_test::init();

        let calls = Arc::new(Mutex::new(Vec::new()));
        let add_ten = {
            let calls = calls.clone();
            move |items: Vec<u32>| -> Result<Vec<u32>, BoxError> {
                calls.lock().expect("no panics").push(items.clone());
                Ok(items.into_iter().map(|item| item + 10).collect())
            }
        };

        let (batch, receivers) = batch_of(&[1, 2, 3]);
        run_batch(&add_ten, batch);

        let results: Vec<u32> = results(receivers)
            .into_iter()
            .map(|result| result.expect("batch succeeds"))
            .collect();

        assert_eq!(results, vec![11, 12, 13]);
        assert_eq!(*calls.lock().expect("no panics"), vec![vec![1, 2, 3]]);
    }

    #[test]
    fn owned_outputs_are_moved_to_their_callers() {
        let _init_guard = async_batcher_test::init();

        let greet = |names: Vec<String>| -> Result<Vec<String>, BoxError> {
            Ok(names.into_iter().map(|name| format!("hello {name}")).collect())
        };

        let (batch, receivers): (Vec<_>, Vec<_>) = ["ana", "bo"]
            .into_iter()
            .map(|name| PendingRequest::new(name.to_string(), tracing::Span::none()))
            .unzip();
        run_batch(&greet, batch);

        let greetings: Vec<String> = receivers
            .into_iter()
            .map(|mut rx| {
                rx.try_recv()
                    .expect("every slot is resolved")
                    .expect("batch succeeds")
            })
            .collect();

        assert_eq!(greetings, vec!["hello ana", "hello bo"]);
    }

    #[test]
    fn batch_function_errors_fail_every_item() {
        let _init_guard = async_batcher_test::init();

        let fail = |_items: Vec<u32>| -> Result<Vec<u32>, BoxError> { Err("out of memory".into()) };

        let (batch, receivers) = batch_of(&[1, 2]);
        run_batch(&fail, batch);

        let errors: Vec<BatchError> = results(receivers)
            .into_iter()
            .map(|result| result.expect_err("batch fails"))
            .collect();

        match (&errors[0], &errors[1]) {
            (BatchError::BatchFunction(first), BatchError::BatchFunction(second)) => {
                assert!(Arc::ptr_eq(first, second), "callers share the same failure");
                assert_eq!(first.to_string(), "out of memory");
            }
            other => panic!("unexpected errors: {other:?}"),
        }
    }

    #[test]
    fn size_mismatches_fail_every_item() {
        let _init_guard = async_batcher_test::init();

        let drop_last = |mut items: Vec<u32>| -> Result<Vec<u32>, BoxError> {
            items.pop();
            Ok(items)
        };

        let (batch, receivers) = batch_of(&[1, 2, 3]);
        run_batch(&drop_last, batch);

        for result in results(receivers) {
            assert!(matches!(
                result,
                Err(BatchError::BatchSizeMismatch {
                    inputs: 3,
                    outputs: 2
                })
            ));
        }
    }

    #[test]
    fn panics_fail_every_item() {
        let _init_guard = async_batcher_test::init();

        let explode = |_items: Vec<u32>| -> Result<Vec<u32>, BoxError> { panic!("device lost") };

        let (batch, receivers) = batch_of(&[1, 2]);
        run_batch(&explode, batch);

        for result in results(receivers) {
            match result {
                Err(BatchError::BatchFunctionPanic(message)) => {
                    assert_eq!(message.as_ref(), "device lost")
                }
                other => panic!("unexpected result: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn dispatcher_limits_batches_in_flight() {
        let _init_guard = async_batcher_test::init();

        let identity = |items: Vec<u32>| -> Result<Vec<u32>, BoxError> { Ok(items) };
        let dispatcher = Dispatcher::new(Arc::new(identity), 1).expect("pool builds");

        let reservation = dispatcher.ready().await.expect("dispatcher is running");
        assert_eq!(dispatcher.running_batches(), 1);

        let (batch, receivers) = batch_of(&[7]);
        dispatcher.dispatch(reservation, batch);

        let mut receivers = receivers.into_iter();
        let result = receivers
            .next()
            .expect("one receiver")
            .await
            .expect("slot is resolved");
        assert_eq!(result.expect("batch succeeds"), 7);

        dispatcher.shutdown().await;
        assert_eq!(dispatcher.running_batches(), 0);
        assert!(dispatcher.ready().await.is_none());
    }
}
