//! Merge batch example
//!
//! This example demonstrates the core functionality of yt-merge:
//! - Loading configuration from a JSON file (or using defaults)
//! - Creating a pipeline with auto-discovered yt-dlp / ffmpeg
//! - Subscribing to events
//! - Running a batch file with Ctrl+C cancellation
//!
//! Usage: `cargo run --example merge_batch -- batch.txt merged.mp4 [settings.json]`

use std::path::PathBuf;
use yt_merge::{Config, Event, Pipeline, run_with_shutdown};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing for logging (optional)
    // Uncomment if you add tracing-subscriber to your dependencies:
    // tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let (Some(batch_file), Some(output)) = (args.next(), args.next()) else {
        eprintln!("usage: merge_batch <batch.txt> <output.mp4> [settings.json]");
        std::process::exit(2);
    };

    let config = match args.next() {
        Some(settings) => Config::load(&settings).await?,
        None => Config::default(),
    };
    println!("Cache directory: {}", config.cache.cache_dir.display());

    let pipeline = Pipeline::from_config(config).await?;
    println!("Encoder: {}", pipeline.encoder().label());

    // Subscribe to events
    let mut events = pipeline.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                Event::JobQueued { index, url, .. } => {
                    println!("✓ Queued #{}: {}", index + 1, url);
                }
                Event::CacheHit { id, stage, .. } => {
                    println!("  {} {}: cached", id, stage);
                }
                Event::RetryScheduled {
                    id,
                    next_attempt,
                    delay_ms,
                    error,
                } => {
                    println!(
                        "  {} retry #{} in {:.1}s ({})",
                        id,
                        next_attempt,
                        delay_ms as f64 / 1000.0,
                        error
                    );
                }
                Event::EncoderFallback { id, .. } => {
                    println!("  {} GPU encode failed, using CPU", id);
                }
                Event::JobFailed { id, stage, error } => {
                    println!("✗ {} failed during {}: {}", id, stage, error);
                }
                Event::PipelineProgress { percent } => {
                    println!("  overall {:.0}%", percent);
                }
                Event::MusicOverlayFailed { error } => {
                    println!("  music not applied: {}", error);
                }
                Event::BatchComplete {
                    output,
                    succeeded,
                    failed,
                } => {
                    println!(
                        "✓ Wrote {} ({} merged, {} failed)",
                        output.display(),
                        succeeded,
                        failed
                    );
                }
                Event::BatchCancelled => println!("✗ Cancelled"),
                _ => {}
            }
        }
    });

    let sources = yt_merge::batch::read_batch_file(&batch_file).await?;
    let report = run_with_shutdown(&pipeline, sources, PathBuf::from(output)).await?;

    for job in &report.jobs {
        println!(
            "{:>3}. {:<10} {}{}",
            job.index + 1,
            job.status.label(),
            job.title.as_deref().unwrap_or(&job.url),
            if job.fully_cached() { " (cached)" } else { "" }
        );
    }
    println!("Finished in {:.1}s", report.elapsed.as_secs_f64());
    Ok(())
}
