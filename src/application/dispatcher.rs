//! Bounded-concurrency fan-out of segment transcodes.

use crate::application::worker::SegmentTranscoder;
use crate::config::{FailurePolicy, PipelineConfig, RetryPolicy};
use crate::domain::av::segments::segment_artifact_key;
use crate::domain::jobs::{MediaAsset, Segment, SegmentResult};
use crate::error::{DispatchError, TranscodeError};
use futures::{stream, StreamExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What happened to one segment after all of its attempts.
enum Outcome {
    Done(SegmentResult),
    Exhausted { attempts: u32, error: TranscodeError },
    Cancelled,
}

pub struct Dispatcher<T: ?Sized> {
    transcoder: Arc<T>,
    concurrency: usize,
    retry: RetryPolicy,
    failure_policy: FailurePolicy,
}

impl<T> Dispatcher<T>
where
    T: SegmentTranscoder + ?Sized,
{
    pub fn new(
        transcoder: Arc<T>,
        concurrency: usize,
        retry: RetryPolicy,
        failure_policy: FailurePolicy,
    ) -> Self {
        Self {
            transcoder,
            concurrency: concurrency.max(1),
            retry,
            failure_policy,
        }
    }

    pub fn from_config(transcoder: Arc<T>, config: &PipelineConfig) -> Self {
        Self::new(
            transcoder,
            config.concurrency,
            config.retry.clone(),
            config.failure_policy,
        )
    }

    /// Transcode every segment with at most `concurrency` attempts in flight.
    ///
    /// Segments start in index order; results come back sorted by index no
    /// matter in which order they completed.
    pub async fn dispatch(
        &self,
        asset: &MediaAsset,
        segments: &[Segment],
        cancel: &CancellationToken,
    ) -> Result<Vec<SegmentResult>, DispatchError> {
        // Fail-fast must be able to stop the batch without cancelling the caller.
        let batch = cancel.child_token();
        let mut results = Vec::with_capacity(segments.len());
        let mut failure = None;

        let batch_token = &batch;
        let mut outcomes = stream::iter(segments.iter().copied())
            .map(|segment| async move { self.run_segment(asset, segment, batch_token).await })
            .buffer_unordered(self.concurrency);

        while let Some(outcome) = outcomes.next().await {
            match outcome {
                Outcome::Done(result) => results.push(result),
                Outcome::Exhausted { attempts, error } => match self.failure_policy {
                    FailurePolicy::FailFast => {
                        if failure.is_none() {
                            warn!(segment = error.segment.index, attempts, "segment failed, aborting batch");
                            batch.cancel();
                            failure = Some(DispatchError::SegmentFailed { attempts, error });
                        }
                    }
                    FailurePolicy::BestEffort => {
                        warn!(segment = error.segment.index, attempts, error = %error, "segment failed, continuing");
                        let segment = error.segment;
                        results.push(SegmentResult::failed(
                            segment,
                            segment_artifact_key(&segment, asset.key()),
                            attempts,
                            error.to_string(),
                        ));
                    }
                },
                Outcome::Cancelled => {}
            }
        }

        if let Some(failure) = failure {
            return Err(failure);
        }
        if cancel.is_cancelled() || results.len() < segments.len() {
            return Err(DispatchError::Cancelled);
        }

        results.sort_by_key(|result| result.segment.index);
        info!(
            segments = results.len(),
            failed = results.iter().filter(|result| !result.is_success()).count(),
            "dispatch finished"
        );
        Ok(results)
    }

    /// All attempts of one segment, sequentially, inside one pool slot.
    async fn run_segment(
        &self,
        asset: &MediaAsset,
        segment: Segment,
        cancel: &CancellationToken,
    ) -> Outcome {
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Outcome::Cancelled;
            }
            attempt += 1;
            debug!(segment = segment.index, attempt, "transcoding");

            let error = match self.transcoder.transcode(asset, &segment, cancel).await {
                Ok(key) => return Outcome::Done(SegmentResult::success(segment, key, attempt)),
                Err(error) if error.is_cancelled() => return Outcome::Cancelled,
                Err(error) => error,
            };
            if attempt > self.retry.max_retries {
                return Outcome::Exhausted {
                    attempts: attempt,
                    error,
                };
            }

            let delay = self.retry.backoff(attempt);
            warn!(segment = segment.index, attempt, ?delay, error = %error, "retrying segment");
            tokio::select! {
                _ = cancel.cancelled() => return Outcome::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::worker::MockSegmentTranscoder;
    use crate::domain::av::segments::segments;
    use crate::domain::jobs::AssetLocation;
    use crate::error::{StorageError, TranscodeCause};
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    fn asset() -> MediaAsset {
        MediaAsset {
            location: AssetLocation::new("media", "clips/test.mov"),
            duration: 23.28,
            container_format: "mov".to_string(),
        }
    }

    fn fast_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    fn broken(segment: &Segment) -> TranscodeError {
        TranscodeError::new(
            *segment,
            TranscodeCause::Storage(StorageError::Backend("flaky".to_string())),
        )
    }

    /// Transcoder with per-start failure budgets and latencies that tracks concurrency.
    #[derive(Default)]
    struct Scripted {
        failures: Mutex<HashMap<u64, u32>>,
        latency: HashMap<u64, Duration>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        per_segment: Mutex<HashMap<usize, usize>>,
        calls: Mutex<Vec<usize>>,
    }

    impl Scripted {
        fn failing(mut self, start: f64, times: u32) -> Self {
            self.failures.get_mut().unwrap().insert(start as u64, times);
            self
        }

        fn slow(mut self, start: f64, latency: Duration) -> Self {
            self.latency.insert(start as u64, latency);
            self
        }

        fn attempts_of(&self, index: usize) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|called| **called == index)
                .count()
        }
    }

    #[async_trait::async_trait]
    impl SegmentTranscoder for Scripted {
        async fn transcode(
            &self,
            asset: &MediaAsset,
            segment: &Segment,
            cancel: &CancellationToken,
        ) -> Result<String, TranscodeError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.calls.lock().unwrap().push(segment.index);
            {
                let mut per_segment = self.per_segment.lock().unwrap();
                let concurrent = per_segment.entry(segment.index).or_default();
                *concurrent += 1;
                assert_eq!(*concurrent, 1, "two attempts of segment {}", segment.index);
            }

            let latency = self
                .latency
                .get(&(segment.start as u64))
                .copied()
                .unwrap_or(Duration::from_millis(2));
            let cancelled = tokio::select! {
                _ = cancel.cancelled() => true,
                _ = tokio::time::sleep(latency) => false,
            };

            *self
                .per_segment
                .lock()
                .unwrap()
                .get_mut(&segment.index)
                .unwrap() -= 1;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if cancelled {
                return Err(TranscodeError::new(*segment, TranscodeCause::Cancelled));
            }
            let mut failures = self.failures.lock().unwrap();
            match failures.get_mut(&(segment.start as u64)) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    Err(broken(segment))
                }
                _ => Ok(segment_artifact_key(segment, asset.key())),
            }
        }
    }

    fn all_segments() -> Vec<Segment> {
        segments(23.28, 5.0).unwrap()
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let transcoder = Arc::new(Scripted::default().failing(15.0, 2));
        let dispatcher = Dispatcher::new(transcoder.clone(), 2, fast_retry(3), FailurePolicy::FailFast);

        let results = dispatcher
            .dispatch(&asset(), &all_segments(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(results.len(), 5);
        assert!(results.iter().all(SegmentResult::is_success));
        assert_eq!(results[3].attempts, 3);
        assert_eq!(results[3].artifact_location, "15-20-clips/test.mov");
        assert_eq!(transcoder.attempts_of(3), 3);
        assert_eq!(transcoder.attempts_of(0), 1);
        assert!(transcoder.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_results_are_ordered_by_index_not_completion() {
        let transcoder = Arc::new(
            Scripted::default()
                .slow(0.0, Duration::from_millis(60))
                .slow(5.0, Duration::from_millis(30)),
        );
        let dispatcher = Dispatcher::new(transcoder, 5, fast_retry(0), FailurePolicy::FailFast);

        let results = dispatcher
            .dispatch(&asset(), &all_segments(), &CancellationToken::new())
            .await
            .unwrap();
        let indexes: Vec<_> = results.iter().map(|result| result.segment.index).collect();
        assert_eq!(indexes, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let segments = segments(100.0, 1.0).unwrap();
        let transcoder = Arc::new(Scripted::default());
        let dispatcher = Dispatcher::new(transcoder.clone(), 3, fast_retry(0), FailurePolicy::FailFast);

        let results = dispatcher
            .dispatch(&asset(), &segments, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(results.len(), 100);
        let peak = transcoder.peak.load(Ordering::SeqCst);
        assert!(peak <= 3 && peak >= 1, "peak concurrency {peak}");
    }

    #[tokio::test]
    async fn test_fail_fast_aborts_the_batch() {
        let transcoder = Arc::new(
            Scripted::default()
                .failing(0.0, u32::MAX)
                .slow(5.0, Duration::from_secs(30)),
        );
        let dispatcher = Dispatcher::new(transcoder.clone(), 2, fast_retry(1), FailurePolicy::FailFast);

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            dispatcher.dispatch(&asset(), &all_segments(), &CancellationToken::new()),
        )
        .await
        .expect("fail-fast should not wait for the slow segment")
        .unwrap_err();

        match err {
            DispatchError::SegmentFailed { attempts, error } => {
                assert_eq!(attempts, 2);
                assert_eq!(error.segment.index, 0);
            }
            other => panic!("unexpected error {other:?}"),
        }
        // Segments queued behind the failure never start.
        assert_eq!(transcoder.attempts_of(4), 0);
    }

    #[tokio::test]
    async fn test_best_effort_records_failures() {
        let transcoder = Arc::new(Scripted::default().failing(10.0, u32::MAX));
        let dispatcher = Dispatcher::new(transcoder, 2, fast_retry(2), FailurePolicy::BestEffort);

        let results = dispatcher
            .dispatch(&asset(), &all_segments(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(results.len(), 5);
        let failed: Vec<_> = results.iter().filter(|result| !result.is_success()).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].segment.index, 2);
        assert_eq!(failed[0].attempts, 3);
        assert!(failed[0].error.is_some());
    }

    #[tokio::test]
    async fn test_caller_cancellation_stops_everything() {
        let transcoder = Arc::new(Scripted::default().slow(0.0, Duration::from_secs(30)));
        let dispatcher = Dispatcher::new(transcoder, 1, fast_retry(0), FailurePolicy::FailFast);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = dispatcher
            .dispatch(&asset(), &all_segments(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Cancelled));
    }

    #[tokio::test]
    async fn test_backoff_sleep_is_cancellable() {
        let mut transcoder = MockSegmentTranscoder::new();
        transcoder
            .expect_transcode()
            .times(1)
            .returning(|_, segment, _| Err(broken(segment)));
        let retry = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60),
        };
        let dispatcher = Dispatcher::new(Arc::new(transcoder), 1, retry, FailurePolicy::FailFast);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let only_first = &all_segments()[..1];
        let err = tokio::time::timeout(
            Duration::from_secs(5),
            dispatcher.dispatch(&asset(), only_first, &cancel),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert!(matches!(err, DispatchError::Cancelled));
    }

    #[tokio::test]
    async fn test_each_segment_is_attempted_once_when_healthy() {
        let transcoder = Arc::new(Scripted::default());
        let dispatcher = Dispatcher::new(transcoder.clone(), 4, fast_retry(3), FailurePolicy::FailFast);
        dispatcher
            .dispatch(&asset(), &all_segments(), &CancellationToken::new())
            .await
            .unwrap();
        let called: HashSet<_> = transcoder.calls.lock().unwrap().iter().copied().collect();
        assert_eq!(called.len(), 5);
        assert_eq!(transcoder.calls.lock().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_empty_segment_list() {
        let mut transcoder = MockSegmentTranscoder::new();
        transcoder.expect_transcode().never();
        let dispatcher = Dispatcher::new(Arc::new(transcoder), 2, fast_retry(0), FailurePolicy::FailFast);
        let results = dispatcher
            .dispatch(&asset(), &[], &CancellationToken::new())
            .await
            .unwrap();
        assert!(results.is_empty());
    }
}
