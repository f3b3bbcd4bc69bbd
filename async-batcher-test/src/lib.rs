//! Shared test setup for the async batcher crates.
// Standard lints
#![warn(missing_docs)]
#![deny(clippy::await_holding_lock)]
#![forbid(unsafe_code)]

use std::sync::Once;

use owo_colors::OwoColorize;
use tracing_error::ErrorLayer;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

static INIT: Once = Once::new();

/// Initialize globals for tests such as the tracing subscriber and panic / error
/// reporting hooks
pub fn init() {
    INIT.call_once(|| {
        let fmt_layer = fmt::layer().with_target(false);
        // Use the RUST_LOG env var, or by default:
        //  - warn for most tests, and
        //  - hide the expected error logs from batch failure tests
        let filter_layer = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::try_new("warn")
                .unwrap()
                .add_directive("async_batcher=error".parse().unwrap())
        });

        tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt_layer)
            .with(ErrorLayer::default())
            .init();

        color_eyre::config::HookBuilder::default()
            .add_frame_filter(Box::new(|frames| {
                let filters = &[
                    "tokio::",
                    "<futures_util::",
                    "std::panic",
                    "test::run_test_in_process",
                    "core::ops::function::FnOnce::call_once",
                    "<core::future::",
                    "<alloc::boxed::Box",
                    "rayon_core::",
                ];

                frames.retain(|frame| {
                    let Some(name) = frame.name.as_ref() else {
                        return true;
                    };

                    !filters.iter().any(|f| name.as_str().starts_with(f))
                });
            }))
            .install()
            .unwrap_or_else(|error| {
                eprintln!("{} {error}", "could not install error hooks:".red());
            });
    })
}

/// Initialize globals for tests, then return a new current-thread Tokio runtime.
///
/// Used by property tests, which can't be `async`.
pub fn init_async() -> tokio::runtime::Runtime {
    init();

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to create Tokio runtime")
}
