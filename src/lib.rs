//! # yt-merge
//!
//! Pipeline engine that downloads online videos, trims and normalizes them to
//! a common format, and merges the results into one output file.
//!
//! ## Design Philosophy
//!
//! yt-merge is designed to be:
//! - **Cache-first** - Every stage output is content-addressed, so re-running a batch skips finished work
//! - **Worker-agnostic** - yt-dlp and ffmpeg sit behind traits and can be replaced
//! - **Library-first** - No GUI, purely a Rust crate for embedding
//! - **Event-driven** - Consumers subscribe to events, no polling required
//!
//! ## Quick Start
//!
//! ```no_run
//! use yt_merge::{Config, Pipeline, SourceDescriptor};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pipeline = Pipeline::from_config(Config::default()).await?;
//!
//!     // Subscribe to events
//!     let mut events = pipeline.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let report = pipeline
//!         .run(
//!             vec![
//!                 SourceDescriptor::new("https://www.youtube.com/watch?v=dQw4w9WgXcQ"),
//!                 SourceDescriptor::trimmed("https://youtu.be/9bZkp7q19f0", Some(30.0), Some(105.0)),
//!             ],
//!             "merged.mp4",
//!         )
//!         .await?;
//!     println!("wrote {:?}", report.output);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Batch file parsing and source identification
pub mod batch;
/// Content-addressed artifact cache
pub mod cache;
/// Configuration types
pub mod config;
/// Error types
pub mod error;
/// Pipeline orchestration (decomposed into focused submodules)
pub mod pipeline;
/// Retry logic with exponential backoff
pub mod retry;
/// Core types and events
pub mod types;
/// Utility functions
pub mod utils;
/// External tool workers (yt-dlp, ffmpeg, encoder detection)
pub mod workers;

// Re-export commonly used types
pub use cache::CacheStore;
pub use config::{Config, ContainerFormat, MergeMode, Resolution, ScalePolicy};
pub use error::{DownloadError, Error, MergeError, ProcessingError, Result};
pub use pipeline::{MergeOutcome, Pipeline, SequenceFilter};
pub use types::{
    BatchReport, EncoderClass, Event, JobId, JobSummary, ProgressEvent, SourceDescriptor, Stage,
    Status, TrimRange,
};
pub use workers::{EncoderProfile, Workers};

/// Helper function to run a batch with graceful signal handling.
///
/// Starts the batch, and if a termination signal arrives before it finishes,
/// cancels it through [`Pipeline::cancel`]. Either way the batch's report is
/// returned once it has stopped, so artifacts finished before the signal stay
/// cached for the next run.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use yt_merge::{Config, Pipeline, SourceDescriptor, run_with_shutdown};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let pipeline = Pipeline::from_config(Config::default()).await?;
///     let sources = vec![SourceDescriptor::new("https://youtu.be/dQw4w9WgXcQ")];
///
///     // Run with automatic signal handling
///     let report = run_with_shutdown(&pipeline, sources, "merged.mp4").await?;
///     println!("cancelled: {}", report.cancelled);
///
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(
    pipeline: &Pipeline,
    sources: Vec<SourceDescriptor>,
    output: impl AsRef<std::path::Path>,
) -> Result<BatchReport> {
    let run = pipeline.run(sources, output);
    tokio::pin!(run);

    tokio::select! {
        result = &mut run => result,
        _ = wait_for_signal() => {
            tracing::info!("shutdown signal received, cancelling batch");
            pipeline.cancel();
            run.await
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Set up signal handlers - these may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
