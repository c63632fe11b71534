//! Assertion helpers for event streams and reports

use std::time::Duration;
use tokio::sync::broadcast;
use yt_merge::{BatchReport, Event, Status};

/// Outcome of waiting for an event
#[derive(Debug)]
pub enum WaitResult {
    /// The matching event
    Matched(Event),
    /// Nothing matched before the deadline
    Timeout,
    /// The pipeline was dropped
    Closed,
}

/// Receive until `pred` matches, the deadline passes or the channel closes
pub async fn wait_for_event(
    rx: &mut broadcast::Receiver<Event>,
    timeout: Duration,
    pred: impl Fn(&Event) -> bool,
) -> WaitResult {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Err(_) => return WaitResult::Timeout,
            Ok(Ok(event)) if pred(&event) => return WaitResult::Matched(event),
            Ok(Ok(_)) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => {}
            Ok(Err(broadcast::error::RecvError::Closed)) => return WaitResult::Closed,
        }
    }
}

/// Collect every event until (and including) the batch's terminal event
pub async fn collect_batch_events(rx: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_secs(10), rx.recv()).await {
            Ok(Ok(event)) => {
                let terminal = matches!(
                    event,
                    Event::BatchComplete { .. } | Event::BatchCancelled
                );
                events.push(event);
                if terminal {
                    return events;
                }
            }
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => {}
            _ => return events,
        }
    }
}

/// Assert every job in the report was merged
pub fn assert_all_merged(report: &BatchReport) {
    for job in &report.jobs {
        assert_eq!(
            job.status,
            Status::Merged,
            "job {} ({}) ended as {:?}: {:?}",
            job.index,
            job.url,
            job.status,
            job.error
        );
    }
    assert!(report.output.is_some(), "merged batch must have an output");
}
