//! The bounded intake queue between `Batcher` handles and the batch worker.
//!
//! The queue is a Tokio unbounded channel, bounded by a separate semaphore.
//! Tokio's bounded channel doesn't wake pending senders when it is closed, and it
//! doesn't expose a polling interface that `Service::poll_ready` can use.
//! Semaphore permits are handed out in FIFO order, so callers waiting for
//! capacity are queued in the order they started waiting.

use std::{
    fmt,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use tokio::{
    sync::{
        mpsc::{self, error::TryRecvError},
        OwnedSemaphorePermit, Semaphore,
    },
    time::timeout,
};
use tokio_util::sync::{CancellationToken, PollSemaphore};

use crate::{
    error::BatchError,
    message::{Message, PendingRequest, Rx},
};

/// Creates a new intake queue that holds at most `capacity` requests.
pub(crate) fn channel<Item, Output>(
    capacity: usize,
) -> (IntakeSender<Item, Output>, IntakeReceiver<Item, Output>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let semaphore = Arc::new(Semaphore::new(capacity));
    let shutdown = CancellationToken::new();

    let sender = IntakeSender {
        tx,
        semaphore: PollSemaphore::new(semaphore.clone()),
        shutdown: shutdown.clone(),
    };

    let receiver = IntakeReceiver {
        rx,
        semaphore,
        shutdown,
    };

    (sender, receiver)
}

/// The submitting side of the intake queue.
pub(crate) struct IntakeSender<Item, Output> {
    tx: mpsc::UnboundedSender<Message<Item, Output>>,

    /// A semaphore used to bound the channel.
    semaphore: PollSemaphore,

    /// Cancelled when the queue is explicitly closed.
    shutdown: CancellationToken,
}

impl<Item, Output> IntakeSender<Item, Output> {
    /// Waits for queue capacity, and returns a permit for one request.
    pub(crate) async fn reserve(&self) -> Result<OwnedSemaphorePermit, BatchError> {
        self.semaphore
            .clone_inner()
            .acquire_owned()
            .await
            .map_err(|_closed| BatchError::QueueClosed)
    }

    /// Polls for queue capacity, registering the current task for wakeup when
    /// a permit is released or the queue is closed.
    pub(crate) fn poll_reserve(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Result<OwnedSemaphorePermit, BatchError>> {
        self.semaphore
            .poll_acquire(cx)
            .map(|permit| permit.ok_or(BatchError::QueueClosed))
    }

    /// Queues `item` using a previously reserved `permit`.
    ///
    /// Returns the receiving side of the request's result slot.
    pub(crate) fn send(
        &self,
        permit: OwnedSemaphorePermit,
        item: Item,
        span: tracing::Span,
    ) -> Result<Rx<Output>, BatchError> {
        let (request, rx) = PendingRequest::new(item, span);

        match self.tx.send(Message {
            request,
            _permit: permit,
        }) {
            Ok(()) => {
                metrics::gauge!("batcher.queue.available").set(self.available_capacity() as f64);
                Ok(rx)
            }
            Err(mpsc::error::SendError(message)) => {
                tracing::trace!("batch worker has stopped, rejecting request");
                message.request.resolve(Err(BatchError::QueueClosed));

                Err(BatchError::QueueClosed)
            }
        }
    }

    /// Stops accepting new requests.
    ///
    /// Callers waiting for capacity are woken with [`BatchError::QueueClosed`].
    /// Requests that are already queued are still processed.
    pub(crate) fn close(&self) {
        self.semaphore.clone_inner().close();
        self.shutdown.cancel();
    }

    /// Returns `true` if the queue has been closed, or the worker has stopped.
    pub(crate) fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.tx.is_closed()
    }

    /// Returns the number of requests that can be queued without waiting.
    pub(crate) fn available_capacity(&self) -> usize {
        self.semaphore.available_permits()
    }
}

impl<Item, Output> Clone for IntakeSender<Item, Output> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            semaphore: self.semaphore.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<Item, Output> fmt::Debug for IntakeSender<Item, Output> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntakeSender")
            .field("tx", &self.tx)
            .field("semaphore", &self.semaphore)
            .field("shutdown", &self.shutdown)
            .finish()
    }
}

/// The draining side of the intake queue, owned by the batch worker.
pub(crate) struct IntakeReceiver<Item, Output> {
    rx: mpsc::UnboundedReceiver<Message<Item, Output>>,

    /// The semaphore bounding the channel, closed when the receiver closes.
    semaphore: Arc<Semaphore>,

    /// Cancelled when the queue is explicitly closed.
    shutdown: CancellationToken,
}

impl<Item, Output> IntakeReceiver<Item, Output> {
    /// Removes and returns up to `max_items` queued requests, in queue order.
    ///
    /// Waits until at least one request is queued, then takes every request that
    /// is already queued. While the batch is below `max_items`, waits up to
    /// `straggler_timeout` for each additional request.
    ///
    /// Returns `None` once the queue is closed and empty.
    pub(crate) async fn drain_up_to(
        &mut self,
        max_items: usize,
        straggler_timeout: Duration,
    ) -> Option<Vec<PendingRequest<Item, Output>>> {
        let first = self.recv_first().await?;

        let mut batch = vec![first];

        while batch.len() < max_items {
            let next = match self.rx.try_recv() {
                Ok(message) => Some(message),
                Err(TryRecvError::Disconnected) => None,
                Err(TryRecvError::Empty) => self.recv_straggler(straggler_timeout).await,
            };

            let Some(message) = next else {
                break;
            };

            // Dropping the message releases its queue capacity.
            batch.push(message.request);
        }

        if batch.len() >= max_items {
            tracing::trace!(batch_size = batch.len(), "batch is full");
        }

        metrics::gauge!("batcher.queue.available").set(self.semaphore.available_permits() as f64);

        Some(batch)
    }

    /// Waits for the first request of a new batch.
    ///
    /// After the queue is closed, returns the remaining queued requests, then `None`.
    async fn recv_first(&mut self) -> Option<PendingRequest<Item, Output>> {
        let message = tokio::select! {
            biased;

            message = self.rx.recv() => message,

            () = self.shutdown.cancelled() => {
                self.close();
                self.rx.recv().await
            }
        };

        message.map(|message| message.request)
    }

    /// Waits up to `straggler_timeout` for one more request.
    async fn recv_straggler(
        &mut self,
        straggler_timeout: Duration,
    ) -> Option<Message<Item, Output>> {
        tokio::select! {
            biased;

            result = timeout(straggler_timeout, self.rx.recv()) => match result {
                Ok(message) => message,
                Err(_elapsed) => {
                    tracing::trace!(?straggler_timeout, "straggler timeout elapsed");
                    None
                }
            },

            // Don't wait for stragglers after the queue is closed.
            () = self.shutdown.cancelled() => {
                self.close();
                self.rx.try_recv().ok()
            }
        }
    }

    /// Closes the queue to new requests, keeping any queued requests.
    pub(crate) fn close(&mut self) {
        self.semaphore.close();
        self.rx.close();
    }
}

impl<Item, Output> Drop for IntakeReceiver<Item, Output> {
    fn drop(&mut self) {
        self.close();

        // Fail queued requests
        while let Ok(message) = self.rx.try_recv() {
            message.request.resolve(Err(BatchError::QueueClosed));
        }
    }
}

impl<Item, Output> fmt::Debug for IntakeReceiver<Item, Output> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntakeReceiver")
            .field("rx", &self.rx)
            .field("semaphore", &self.semaphore)
            .field("shutdown", &self.shutdown)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use futures::executor::block_on;
    use metrics::{Counter, Gauge, Histogram, Key, KeyName, Metadata, SharedString, Unit};
    use tokio::time::Instant;

    use super::*;

    /// Records the queue capacity gauge, and ignores every other metric.
    #[derive(Default)]
    struct CapacityRecorder {
        available: Arc<AtomicU64>,
    }

    impl CapacityRecorder {
        fn available(&self) -> f64 {
            f64::from_bits(self.available.load(Ordering::SeqCst))
        }
    }

    impl metrics::Recorder for CapacityRecorder {
        fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

        fn register_counter(&self, _: &Key, _: &Metadata<'_>) -> Counter {
            Counter::noop()
        }

        fn register_gauge(&self, key: &Key, _: &Metadata<'_>) -> Gauge {
            if key.name() == "batcher.queue.available" {
                Gauge::from_arc(self.available.clone())
            } else {
                Gauge::noop()
            }
        }

        fn register_histogram(&self, _: &Key, _: &Metadata<'_>) -> Histogram {
            Histogram::noop()
        }
    }

    /// Queues `item`, waiting for capacity.
    async fn send(sender: &IntakeSender<u32, u32>, item: u32) -> Rx<u32> {
        let permit = sender.reserve().await.expect("queue is open");
        sender
            .send(permit, item, tracing::Span::none())
            .expect("queue is open")
    }

    /// Resolves every request in `batch`, and returns their items.
    fn items(batch: Vec<PendingRequest<u32, u32>>) -> Vec<u32> {
        batch
            .into_iter()
            .map(|request| {
                let (item, slot) = request.into_parts();
                slot.resolve(Ok(item));
                item
            })
            .collect()
    }

    fn resolve_all(batch: Vec<PendingRequest<u32, u32>>) {
        let _ = items(batch);
    }

    #[tokio::test(start_paused = true)]
    async fn drains_queued_items_without_waiting() {
        let _init_guard = async_batcher_test::init();

        let (sender, mut receiver) = channel(10);
        let mut slots = Vec::new();
        for item in 1..=5 {
            slots.push(send(&sender, item).await);
        }

        let start = Instant::now();
        let batch = receiver
            .drain_up_to(3, Duration::from_secs(3600))
            .await
            .expect("queue is open");

        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(items(batch), vec![1, 2, 3]);
        assert_eq!(sender.available_capacity(), 8);

        let batch = receiver
            .drain_up_to(2, Duration::from_secs(3600))
            .await
            .expect("queue is open");

        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(items(batch), vec![4, 5]);
        assert_eq!(sender.available_capacity(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn partial_batch_closes_after_straggler_timeout() {
        let _init_guard = async_batcher_test::init();

        let (sender, mut receiver) = channel(10);
        let _slot = send(&sender, 1).await;

        let start = Instant::now();
        let batch = receiver
            .drain_up_to(3, Duration::from_secs(5))
            .await
            .expect("queue is open");

        assert!(start.elapsed() >= Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(6));
        assert_eq!(items(batch), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn straggler_wait_restarts_after_each_arrival() {
        let _init_guard = async_batcher_test::init();

        let (sender, mut receiver) = channel(10);
        let _slot = send(&sender, 1).await;

        let straggler_sender = sender.clone();
        let stragglers = tokio::spawn(async move {
            let mut slots = Vec::new();
            for item in [2, 3] {
                tokio::time::sleep(Duration::from_secs(4)).await;
                slots.push(send(&straggler_sender, item).await);
            }
            slots
        });

        let start = Instant::now();
        let batch = receiver
            .drain_up_to(3, Duration::from_secs(5))
            .await
            .expect("queue is open");

        // Each straggler arrived within 5 seconds of the previous item,
        // and the batch closed as soon as it was full.
        assert!(start.elapsed() >= Duration::from_secs(8));
        assert!(start.elapsed() < Duration::from_secs(9));
        assert_eq!(items(batch), vec![1, 2, 3]);

        let _slots = stragglers.await.expect("task does not panic");
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_applies_backpressure() {
        let _init_guard = async_batcher_test::init();

        let (sender, mut receiver) = channel(2);
        let _first = send(&sender, 1).await;
        let _second = send(&sender, 2).await;

        assert_eq!(sender.available_capacity(), 0);
        assert!(
            timeout(Duration::from_secs(60), sender.reserve())
                .await
                .is_err(),
            "a full queue makes submitters wait"
        );

        let batch = receiver
            .drain_up_to(1, Duration::ZERO)
            .await
            .expect("queue is open");
        assert_eq!(batch.len(), 1);
        resolve_all(batch);

        let permit = timeout(Duration::from_secs(60), sender.reserve())
            .await
            .expect("draining frees capacity")
            .expect("queue is open");
        drop(permit);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_queue_flushes_queued_requests_then_ends() {
        let _init_guard = async_batcher_test::init();

        let (sender, mut receiver) = channel(10);
        let _first = send(&sender, 1).await;
        let _second = send(&sender, 2).await;

        sender.close();

        assert!(sender.is_closed());
        assert!(matches!(
            sender.reserve().await,
            Err(BatchError::QueueClosed)
        ));

        let start = Instant::now();
        let batch = receiver
            .drain_up_to(3, Duration::from_secs(3600))
            .await
            .expect("queued requests are still drained");

        assert_eq!(items(batch), vec![1, 2]);
        assert!(start.elapsed() < Duration::from_secs(3600));

        assert!(receiver
            .drain_up_to(3, Duration::from_secs(3600))
            .await
            .is_none());
    }

    #[test]
    fn draining_reports_released_capacity() {
        let _init_guard = async_batcher_test::init();

        let recorder = CapacityRecorder::default();
        let (sender, mut receiver) = channel(10);
        let _slots = block_on(async { vec![send(&sender, 1).await, send(&sender, 2).await] });

        let batch = metrics::with_local_recorder(&recorder, || {
            block_on(receiver.drain_up_to(2, Duration::from_secs(3600)))
        })
        .expect("queue is open");

        assert_eq!(recorder.available(), 10.0);
        assert_eq!(items(batch), vec![1, 2]);
    }

    #[tokio::test]
    async fn dropped_receiver_fails_queued_requests() {
        let _init_guard = async_batcher_test::init();

        let (sender, receiver) = channel::<u32, u32>(10);
        let slot = send(&sender, 1).await;

        drop(receiver);

        assert!(matches!(slot.await, Ok(Err(BatchError::QueueClosed))));
        assert!(sender.is_closed());
        assert!(matches!(
            sender.reserve().await,
            Err(BatchError::QueueClosed)
        ));
    }
}
