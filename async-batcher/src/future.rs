//! Future types for the `Batcher`.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use futures_core::ready;
use pin_project::pin_project;

use crate::{error::BatchError, message::Rx};

/// Future that completes when the batch containing a request has been processed.
///
/// Resolves to the request's output, or the error for its batch.
/// If the request is lost before its batch completes, resolves to
/// [`BatchError::UnresolvedSlot`] instead of waiting forever.
///
/// Use `futures::FutureExt::shared` to observe the same result more than once.
#[pin_project]
#[derive(Debug)]
pub struct ResponseFuture<Output> {
    #[pin]
    state: ResponseState<Output>,
}

#[pin_project(project = ResponseStateProj)]
#[derive(Debug)]
enum ResponseState<Output> {
    Failed(BatchError),
    Rx(#[pin] Rx<Output>),
}

impl<Output> ResponseFuture<Output> {
    pub(crate) fn new(rx: Rx<Output>) -> Self {
        ResponseFuture {
            state: ResponseState::Rx(rx),
        }
    }

    pub(crate) fn failed(error: BatchError) -> Self {
        ResponseFuture {
            state: ResponseState::Failed(error),
        }
    }
}

impl<Output> Future for ResponseFuture<Output> {
    type Output = Result<Output, BatchError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        match this.state.project() {
            ResponseStateProj::Failed(error) => Poll::Ready(Err(error.clone())),
            ResponseStateProj::Rx(rx) => match ready!(rx.poll(cx)) {
                Ok(result) => Poll::Ready(result),
                Err(_sender_dropped) => Poll::Ready(Err(BatchError::UnresolvedSlot)),
            },
        }
    }
}
