//! Requests passed from the `Batcher` handles to the batch worker.

use tokio::sync::{oneshot, OwnedSemaphorePermit};

use crate::error::BatchError;

/// Message sent to the batch worker through the intake queue.
#[derive(Debug)]
pub(crate) struct Message<Item, Output> {
    pub(crate) request: PendingRequest<Item, Output>,
    /// The queue capacity used by this message.
    ///
    /// Released when the request is drained into a batch.
    pub(crate) _permit: OwnedSemaphorePermit,
}

/// Response sender
pub(crate) type Tx<Output> = oneshot::Sender<Result<Output, BatchError>>;

/// Response receiver
pub(crate) type Rx<Output> = oneshot::Receiver<Result<Output, BatchError>>;

/// A submitted item waiting for its batch result.
#[derive(Debug)]
pub(crate) struct PendingRequest<Item, Output> {
    item: Item,
    slot: ResultSlot<Output>,
}

impl<Item, Output> PendingRequest<Item, Output> {
    /// Creates a new pending request, and returns the receiving side of its result slot.
    pub(crate) fn new(item: Item, span: tracing::Span) -> (Self, Rx<Output>) {
        let (tx, rx) = oneshot::channel();

        let request = PendingRequest {
            item,
            slot: ResultSlot { tx: Some(tx), span },
        };

        (request, rx)
    }

    /// Splits this request into the item for the batch function, and the slot
    /// for its result.
    pub(crate) fn into_parts(self) -> (Item, ResultSlot<Output>) {
        (self.item, self.slot)
    }

    /// Sends `result` to the caller, consuming this request.
    pub(crate) fn resolve(self, result: Result<Output, BatchError>) {
        self.slot.resolve(result)
    }
}

/// The sending side of a batched request's result.
///
/// Each slot is resolved at most once. A slot that is dropped before it is
/// resolved sends [`BatchError::UnresolvedSlot`] to its caller.
#[derive(Debug)]
pub(crate) struct ResultSlot<Output> {
    tx: Option<Tx<Output>>,

    /// The caller's span, so events about this request are counted towards it.
    span: tracing::Span,
}

impl<Output> ResultSlot<Output> {
    /// Sends `result` to the caller.
    pub(crate) fn resolve(mut self, result: Result<Output, BatchError>) {
        let Some(tx) = self.tx.take() else {
            return;
        };

        let _entered = self.span.enter();

        if tx.send(result).is_err() {
            tracing::trace!("batch request caller dropped its response future");
        } else {
            tracing::trace!("batch request resolved");
        }
    }
}

impl<Output> Drop for ResultSlot<Output> {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _entered = self.span.enter();

            tracing::error!("batch request dropped without a result, failing its caller");
            metrics::counter!("batcher.items.unresolved").increment(1);

            let _ = tx.send(Err(BatchError::UnresolvedSlot));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropped_slots_fail_their_caller() {
        let (request, mut rx) = PendingRequest::<u8, u8>::new(1, tracing::Span::none());
        let (item, slot) = request.into_parts();
        assert_eq!(item, 1);

        drop(slot);

        assert!(matches!(rx.try_recv(), Ok(Err(BatchError::UnresolvedSlot))));
    }

    #[test]
    fn resolved_slots_deliver_their_result() {
        let (request, mut rx) = PendingRequest::<u8, u8>::new(1, tracing::Span::none());

        request.resolve(Ok(2));

        assert!(matches!(rx.try_recv(), Ok(Ok(2))));
    }

    #[test]
    fn resolving_after_the_caller_left_is_harmless() {
        let (request, rx) = PendingRequest::<u8, u8>::new(1, tracing::Span::none());
        drop(rx);

        request.resolve(Err(BatchError::QueueClosed));
    }
}
