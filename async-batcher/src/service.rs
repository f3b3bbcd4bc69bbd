//! Handles for submitting items to a batch worker.

use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, PoisonError},
    task::{Context, Poll},
};

use futures_core::ready;
use tokio::{runtime::Handle, sync::OwnedSemaphorePermit, task::JoinHandle};
use tower::Service;
use tracing::info_span;
use tracing_futures::Instrument;

use crate::{
    config::Config,
    dispatch::{BatchFn, Dispatcher},
    error::{BatchError, BuildError},
    future::ResponseFuture,
    queue::{self, IntakeSender},
    worker::Worker,
};

/// Submits items to a batch function, and returns each item's output.
///
/// Each `Batcher` is a cheap handle to a shared intake queue. Clone it to submit
/// from many tasks at once. See the [crate documentation](crate) for the batch policy.
pub struct Batcher<Item, Output> {
    /// The submitting side of the intake queue.
    tx: IntakeSender<Item, Output>,

    /// A queue reservation acquired by `poll_ready`, used by the next `call`.
    permit: Option<OwnedSemaphorePermit>,

    /// A worker task handle shared between all handle clones for the same worker.
    ///
    /// Only used when the worker is spawned by [`Batcher::spawn`], or registered
    /// using [`Batcher::register_worker`].
    worker_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl<Item, Output> fmt::Debug for Batcher<Item, Output> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = std::any::type_name::<Self>();
        f.debug_struct(name)
            .field("tx", &self.tx)
            .field("permit", &self.permit)
            .field("worker_handle", &self.worker_handle)
            .finish()
    }
}

impl<Item, Output> Batcher<Item, Output>
where
    Item: Send + 'static,
    Output: Send + 'static,
{
    /// Creates a new `Batcher` for `batch_fn`, and spawns its worker on `runtime`.
    ///
    /// Batches are formed using the limits in `config`, and run on a dedicated
    /// thread pool with [`Config::dispatch_threads`] threads.
    pub fn spawn<F>(batch_fn: F, config: Config, runtime: &Handle) -> Result<Self, BuildError>
    where
        F: BatchFn<Item, Output>,
    {
        let (mut batcher, worker) = Self::pair(batch_fn, config)?;

        let span = info_span!("batch worker", item = std::any::type_name::<Item>());
        let worker_handle = runtime.spawn(worker.run().instrument(span));

        batcher.register_worker(worker_handle);

        Ok(batcher)
    }

    /// Creates a new `Batcher` for `batch_fn`, but returns the background worker.
    ///
    /// This is useful if you want to spawn the worker yourself, for example on a
    /// specific runtime, or as part of a startup sequence. Requests are only
    /// processed while [`Worker::run`] is being polled.
    pub fn pair<F>(batch_fn: F, config: Config) -> Result<(Self, Worker<Item, Output>), BuildError>
    where
        F: BatchFn<Item, Output>,
    {
        // Clamp config to sensible values.
        let config = config.clamped();

        let (tx, rx) = queue::channel(config.max_queue_size);
        let dispatcher = Dispatcher::new(Arc::new(batch_fn), config.dispatch_threads)?;
        let worker = Worker::new(rx, dispatcher, &config);

        tracing::debug!(?config, "created batcher");

        let batcher = Batcher {
            tx,
            permit: None,
            worker_handle: Arc::new(Mutex::new(None)),
        };

        Ok((batcher, worker))
    }

    /// Ask the `Batcher` to monitor the spawned worker task's [`JoinHandle`].
    pub fn register_worker(&mut self, worker_handle: JoinHandle<()>) {
        *self
            .worker_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(worker_handle);
    }

    /// Submits `item` for batch processing, and waits for its output.
    ///
    /// Waits for queue capacity if the queue is full.
    /// Returns [`BatchError::QueueClosed`] if the batcher has been closed.
    pub async fn submit(&self, item: Item) -> Result<Output, BatchError> {
        self.enqueue(item).await.await
    }

    /// Queues `item` for batch processing, and returns a future for its output.
    ///
    /// Waits for queue capacity if the queue is full. Once this method returns,
    /// the item is queued, and it is processed even if the returned future is dropped.
    pub async fn enqueue(&self, item: Item) -> ResponseFuture<Output> {
        let permit = match self.tx.reserve().await {
            Ok(permit) => permit,
            Err(error) => return ResponseFuture::failed(error),
        };

        self.send(permit, item)
    }

    /// Stops accepting new items.
    ///
    /// Waiting and future submissions fail with [`BatchError::QueueClosed`].
    /// Items that are already queued are still processed, then the worker exits.
    pub fn close(&self) {
        tracing::debug!("closing batcher");

        self.tx.close();
    }

    /// Returns `true` if the batcher is closed, or its worker has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Returns the number of items that can be queued without waiting.
    pub fn available_capacity(&self) -> usize {
        self.tx.available_capacity()
    }

    fn send(&self, permit: OwnedSemaphorePermit, item: Item) -> ResponseFuture<Output> {
        tracing::trace!("sending request to batch worker");

        // get the current Span so that we can explicitly propagate it to the worker
        // if we didn't do this, events on the worker related to this span wouldn't be counted
        // towards that span since the worker would have no way of entering it.
        let span = tracing::Span::current();

        match self.tx.send(permit, item, span) {
            Ok(rx) => ResponseFuture::new(rx),
            Err(error) => ResponseFuture::failed(error),
        }
    }

    /// Checks whether the registered worker task has exited.
    ///
    /// Registers the current task for wakeup when the worker exits.
    /// Resumes the worker's panic if it panicked.
    fn poll_worker(&mut self, cx: &mut Context<'_>) -> Poll<BatchError> {
        let mut worker_handle = self
            .worker_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let Some(handle) = worker_handle.as_mut() else {
            return Poll::Pending;
        };

        let result = ready!(Pin::new(handle).poll(cx));

        // A finished JoinHandle must not be polled again.
        *worker_handle = None;
        drop(worker_handle);

        self.tx.close();

        match result {
            Ok(()) => Poll::Ready(BatchError::QueueClosed),
            Err(task_cancelled) if task_cancelled.is_cancelled() => {
                tracing::warn!(
                    "batch worker task cancelled: {task_cancelled}\n\
                     Is the runtime shutting down?"
                );

                Poll::Ready(BatchError::QueueClosed)
            }
            Err(task_panic) => std::panic::resume_unwind(task_panic.into_panic()),
        }
    }
}

impl<Item, Output> Service<Item> for Batcher<Item, Output>
where
    Item: Send + 'static,
    Output: Send + 'static,
{
    type Response = Output;
    type Error = BatchError;
    type Future = ResponseFuture<Output>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Check to see if the worker has returned or panicked.
        //
        // Correctness: Registers this task for wakeup when the worker finishes.
        if let Poll::Ready(error) = self.poll_worker(cx) {
            return Poll::Ready(Err(error));
        }

        // Poll to acquire a semaphore permit.
        //
        // CORRECTNESS
        //
        // If we acquire a permit, then there's enough queue capacity to send a new request.
        // Otherwise, we need to wait for capacity. When that happens, `poll_reserve()` registers
        // this task for wakeup when the next permit is available, or when the queue is closed.
        //
        // When `poll_ready()` is called multiple times, and queue capacity is 1,
        // avoid deadlocks by dropping any previous permit before acquiring another one.
        // This also stops tasks holding a permit after an error.
        self.permit = None;

        let permit = ready!(self.tx.poll_reserve(cx))?;
        self.permit = Some(permit);

        Poll::Ready(Ok(()))
    }

    fn call(&mut self, item: Item) -> Self::Future {
        let permit = self
            .permit
            .take()
            .expect("poll_ready must be called before a batch request");

        self.send(permit, item)
    }
}

impl<Item, Output> Clone for Batcher<Item, Output> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            permit: None,
            worker_handle: self.worker_handle.clone(),
        }
    }
}
