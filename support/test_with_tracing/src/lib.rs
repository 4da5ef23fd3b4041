// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Crate for defining tests that have tracing output.
//!
//! Tests using [`test`] get a process-wide `tracing` subscriber that writes
//! through the test harness's captured output, and run inside a span named
//! after the test so that output from concurrent tests can be told apart.

#[cfg(test)]
extern crate self as test_with_tracing;

pub use test_with_tracing_macro::test;
use tracing::metadata::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::prelude::*;

/// Initializes `tracing` for tests.
///
/// `RUST_LOG` takes a target list such as `zcopy=trace,gnttab=debug`. When
/// unset, everything at `DEBUG` and above is shown.
#[doc(hidden)]
pub fn init() {
    static ONCE: std::sync::Once = std::sync::Once::new();

    ONCE.call_once(|| {
        let targets = std::env::var("RUST_LOG")
            .ok()
            .and_then(|var| var.parse::<Targets>().ok())
            .unwrap_or_else(|| Targets::new().with_default(LevelFilter::DEBUG));
        tracing_subscriber::fmt()
            .with_ansi(false)
            .with_thread_names(true)
            .with_test_writer()
            .with_max_level(LevelFilter::TRACE)
            .finish()
            .with(targets)
            .init();
    });
}

/// Returns the span a test named `name` runs in.
#[doc(hidden)]
pub fn test_span(name: &'static str) -> tracing::Span {
    tracing::info_span!("test", name)
}
