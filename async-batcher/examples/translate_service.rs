//! A request handler that batches translation requests.
//!
//! Each simulated HTTP request calls the handler with one text, and the batcher
//! groups concurrent requests into a single call to the translation model.
//!
//! Run with:
//! ```sh
//! RUST_LOG=async_batcher=trace cargo run --example translate_service
//! ```

use std::{thread, time::Duration};

use color_eyre::eyre::{eyre, Result};
use futures::future::join_all;
use tokio::runtime::Handle;
use tracing_subscriber::EnvFilter;

use async_batcher::{BatchError, Batcher, BoxError, Config};

/// The longest text the service accepts.
const MAX_TEXT_LENGTH: usize = 30;

/// A stand-in for an expensive, batch-capable translation model.
fn translate(texts: Vec<String>) -> Result<Vec<String>, BoxError> {
    // Model latency is mostly per batch, not per item.
    thread::sleep(Duration::from_millis(50));

    Ok(texts
        .into_iter()
        .map(|text| text.chars().rev().collect())
        .collect())
}

/// Handles a single translation request.
async fn handle_translate(batcher: &Batcher<String, String>, text: String) -> Result<String> {
    if text.is_empty() || text.len() > MAX_TEXT_LENGTH {
        return Err(eyre!(
            "text must be between 1 and {MAX_TEXT_LENGTH} bytes long"
        ));
    }

    match batcher.submit(text).await {
        Ok(translation) => Ok(translation),
        Err(error @ BatchError::QueueClosed) => Err(eyre!("service is shutting down: {error}")),
        Err(error) => Err(eyre!("translation failed: {error}")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config {
        max_batch_size: 5,
        straggler_timeout: Duration::from_millis(10),
        ..Config::default()
    };
    let batcher = Batcher::spawn(translate, config, &Handle::current())?;

    let requests = [
        "hello", "good morning", "", "thank you", "see you soon", "where is the station",
        "a text that is far too long for this service",
    ];

    let responses = join_all(requests.into_iter().map(|text| {
        let batcher = batcher.clone();
        async move { (text, handle_translate(&batcher, text.to_string()).await) }
    }))
    .await;

    for (text, response) in responses {
        match response {
            Ok(translation) => println!("{text:?} -> {translation:?}"),
            Err(error) => println!("{text:?} rejected: {error}"),
        }
    }

    batcher.close();

    Ok(())
}
