use super::*;

#[tokio::test]
async fn test_rerun_is_fully_cached_with_zero_worker_calls() {
    let temp_dir = tempfile::tempdir().unwrap();
    let config = test_config(temp_dir.path());
    let sources = vec![
        SourceDescriptor::new(URL_A),
        SourceDescriptor::trimmed(URL_B, Some(30.0), Some(105.0)),
    ];

    let first_output = temp_dir.path().join("first.mp4");
    {
        let (pipeline, workers) =
            create_test_pipeline_with(config.clone(), EncoderProfile::cpu()).await;
        pipeline.run(sources.clone(), &first_output).await.unwrap();
        assert_eq!(workers.downloader.call_count(), 2);
        assert_eq!(workers.processor.normalize_calls().len(), 2);
        pipeline.cache().close().await;
    }

    // A fresh pipeline over the same cache directory
    let (pipeline, workers) = create_test_pipeline_with(config, EncoderProfile::cpu()).await;
    let mut rx = pipeline.subscribe();
    let second_output = temp_dir.path().join("second.mp4");
    let report = pipeline.run(sources, &second_output).await.unwrap();

    assert_eq!(workers.downloader.call_count(), 0);
    assert!(workers.processor.normalize_calls().is_empty());
    assert_eq!(report.cached().count(), 2);
    assert_eq!(read(&first_output), read(&second_output));

    let hits = drain(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, Event::CacheHit { .. }))
        .count();
    assert_eq!(hits, 4, "one hit per job per stage");
}

#[tokio::test]
async fn test_url_spelling_does_not_defeat_the_cache() {
    let (pipeline, workers, temp_dir) = create_test_pipeline().await;
    pipeline
        .run(
            vec![SourceDescriptor::new("https://youtu.be/aaaaaaaaaaa")],
            temp_dir.path().join("a.mp4"),
        )
        .await
        .unwrap();
    pipeline
        .run(
            vec![SourceDescriptor::new(
                "https://www.youtube.com/watch?v=aaaaaaaaaaa&t=42s",
            )],
            temp_dir.path().join("b.mp4"),
        )
        .await
        .unwrap();
    assert_eq!(workers.downloader.call_count(), 1);
}

#[tokio::test]
async fn test_changed_trim_reuses_nothing() {
    let (pipeline, workers, temp_dir) = create_test_pipeline().await;
    pipeline
        .run(
            vec![SourceDescriptor::trimmed(URL_A, Some(0.0), Some(10.0))],
            temp_dir.path().join("a.mp4"),
        )
        .await
        .unwrap();
    pipeline
        .run(
            vec![SourceDescriptor::trimmed(URL_A, Some(0.0), Some(20.0))],
            temp_dir.path().join("b.mp4"),
        )
        .await
        .unwrap();
    assert_eq!(workers.processor.normalize_calls().len(), 2);
}

#[tokio::test]
async fn test_deleted_artifact_is_reproduced() {
    let (pipeline, workers, temp_dir) = create_test_pipeline().await;
    let report = pipeline
        .run(vec![SourceDescriptor::new(URL_A)], temp_dir.path().join("a.mp4"))
        .await
        .unwrap();
    assert_eq!(report.jobs[0].status, Status::Merged);

    for entry in pipeline.cache().entries().await.unwrap() {
        std::fs::remove_file(entry.artifact_path()).unwrap();
    }

    pipeline
        .run(vec![SourceDescriptor::new(URL_A)], temp_dir.path().join("b.mp4"))
        .await
        .unwrap();
    assert_eq!(workers.downloader.call_count(), 2);
    assert_eq!(workers.processor.normalize_calls().len(), 2);
}

#[tokio::test]
async fn test_evict_cache_forces_full_rerun() {
    let (pipeline, workers, temp_dir) = create_test_pipeline().await;
    pipeline
        .run(vec![SourceDescriptor::new(URL_A)], temp_dir.path().join("a.mp4"))
        .await
        .unwrap();

    assert_eq!(pipeline.evict_cache().await.unwrap(), 2);
    assert!(pipeline.cache().is_empty().await.unwrap());

    pipeline
        .run(vec![SourceDescriptor::new(URL_A)], temp_dir.path().join("b.mp4"))
        .await
        .unwrap();
    assert_eq!(workers.downloader.call_count(), 2);
}

#[tokio::test]
async fn test_merge_failure_keeps_normalized_artifacts_cached() {
    let (pipeline, workers, temp_dir) = create_test_pipeline().await;
    workers.processor.mark_low_res(URL_B);

    let err = pipeline
        .run(
            vec![SourceDescriptor::new(URL_A), SourceDescriptor::new(URL_B)],
            temp_dir.path().join("a.mp4"),
        )
        .await
        .unwrap_err();
    match &err {
        Error::Merge { succeeded, .. } => assert_eq!(succeeded.len(), 2),
        other => panic!("expected merge error, got {:?}", other),
    }

    // Both clips are served from the cache on the retry
    let report = pipeline
        .run(vec![SourceDescriptor::new(URL_A)], temp_dir.path().join("b.mp4"))
        .await
        .unwrap();
    assert!(report.jobs[0].download_cached && report.jobs[0].normalize_cached);
    assert_eq!(workers.processor.normalize_calls().len(), 2);
}
