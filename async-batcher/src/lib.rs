//! Dynamic batching for synchronous batch functions called from async code
//!
//! This crate sits in front of a synchronous, batch-capable computation, such as
//! a model inference call, and lets many independent async callers submit one
//! item each. Items are collected into batches, the batch function is called
//! once per batch on a dedicated thread pool, and each result is routed back to
//! the caller that submitted the corresponding item.
//!
//! ## Batch policy
//!
//! A single background [`Worker`] drains the intake queue:
//!
//! 1. it waits until at least one request is queued,
//! 2. it takes every request that is already queued, up to
//!    [`Config::max_batch_size`],
//! 3. while the batch is not full, it waits up to
//!    [`Config::straggler_timeout`] for each additional request, and closes the
//!    batch as soon as that wait times out.
//!
//! The closed batch is handed to the dispatch pool, so a slow batch function
//! never blocks the async runtime that serves submissions. The batch function
//! receives the items in queue order, and must return exactly one output per
//! item, in the same order.
//!
//! ## Failures
//!
//! A failing or panicking batch function fails every request in that batch with
//! the same [`BatchError`], and the worker carries on with the next batch.
//! Output length mismatches are treated the same way. Requests in other
//! batches are unaffected.
//!
//! ## Backpressure
//!
//! The intake queue holds at most [`Config::max_queue_size`] requests.
//! When it is full, [`Batcher::submit`] and [`Batcher`]'s
//! [`tower::Service::poll_ready`] wait for capacity, in FIFO order, instead of
//! dropping requests.
//!
//! ## Example
//!
//! ```
//! use async_batcher::{Batcher, BoxError, Config};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), BoxError> {
//! fn double(items: Vec<u32>) -> Result<Vec<u32>, BoxError> {
//!     Ok(items.into_iter().map(|item| item * 2).collect())
//! }
//!
//! let config = Config {
//!     max_batch_size: 8,
//!     ..Config::default()
//! };
//! let batcher = Batcher::spawn(double, config, &tokio::runtime::Handle::current())?;
//!
//! assert_eq!(batcher.submit(21).await?, 42);
//! # Ok(())
//! # }
//! ```

// Standard lints
#![warn(missing_docs)]
#![deny(clippy::await_holding_lock)]
#![forbid(unsafe_code)]

pub mod config;
pub mod dispatch;
pub mod error;
pub mod future;
mod message;
mod queue;
mod service;
mod worker;

/// The error type returned by batch functions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub use self::config::Config;
pub use self::dispatch::BatchFn;
pub use self::error::{BatchError, BuildError};
pub use self::service::Batcher;
pub use self::worker::Worker;
