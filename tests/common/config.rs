//! Pipeline construction for integration tests

use std::sync::Arc;
use tempfile::TempDir;

use super::fixtures::{StubDownloader, StubProcessor};
use yt_merge::workers::{FixedEncoder, MediaDownloader, MediaProcessor};
use yt_merge::{Config, Pipeline, Workers};

/// Configuration rooted in `dir`: CPU encoding, cache under `dir/cache`
pub fn isolated_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.cache.cache_dir = dir.path().join("cache");
    config.normalize.prefer_gpu = false;
    config
}

/// Build a pipeline over the given workers with a CPU encoder
pub async fn pipeline_with(
    config: Config,
    downloader: Arc<dyn MediaDownloader>,
    processor: Arc<dyn MediaProcessor>,
) -> Result<Pipeline, String> {
    let workers = Workers::new(downloader, processor, Arc::new(FixedEncoder::cpu()));
    Pipeline::new(config, workers)
        .await
        .map_err(|e| format!("Failed to create pipeline: {}", e))
}

/// Pipeline over the in-memory fixtures, plus the tempdir that must outlive it
pub async fn create_fake_pipeline() -> Result<(Pipeline, Arc<StubProcessor>, TempDir), String> {
    let temp_dir = tempfile::tempdir().map_err(|e| format!("Failed to create temp dir: {}", e))?;
    let processor = Arc::new(StubProcessor::default());
    let pipeline = pipeline_with(
        isolated_config(&temp_dir),
        Arc::new(StubDownloader),
        processor.clone(),
    )
    .await?;
    Ok((pipeline, processor, temp_dir))
}
