//! Background task keeping the dependency-graph query warm.
//!
//! The dependencies query is the coldest query the store runs; executed on
//! demand it takes many seconds. When prefetching is enabled, a background
//! task calls it once per dependencies-query-TTL so interactive requests
//! always find a reusable execution in the cache.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::model::DependencyLink;
use crate::SpanlakeError;

/// Window the prefetcher asks for.
const PREFETCH_LOOKBACK: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Upper bound of the random delay before each prefetch, so reader replicas
/// don't refresh at the same time.
const MAX_JITTER_SECS: u64 = 180;

/// The one capability the prefetcher needs from the reader.
#[async_trait]
pub trait DependenciesSource: Send + Sync + 'static {
    async fn get_dependencies(
        &self,
        end_ts: DateTime<Utc>,
        lookback: Duration,
    ) -> Result<Vec<DependencyLink>, SpanlakeError>;
}

/// Periodically warms the dependency-graph query execution.
pub struct DependenciesPrefetch {
    source: Arc<dyn DependenciesSource>,
    interval: Duration,
    enabled: bool,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DependenciesPrefetch {
    pub fn new(source: Arc<dyn DependenciesSource>, interval: Duration, enabled: bool) -> Self {
        Self {
            source,
            interval,
            enabled,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Spawn the prefetch loop. No-op when disabled or already started.
    pub async fn start(&self) {
        if !self.enabled {
            return;
        }
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }

        let source = self.source.clone();
        let interval = self.interval;
        let cancel = self.cancel.clone();
        *task = Some(tokio::spawn(async move {
            tracing::info!(
                interval_secs = interval.as_secs(),
                "starting dependencies prefetch task"
            );
            let mut ticker = tokio::time::interval_at(
                tokio::time::Instant::now() + interval,
                interval,
            );

            loop {
                let jitter = Duration::from_secs(rand::thread_rng().gen_range(0..MAX_JITTER_SECS));
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(jitter) => {}
                }

                if let Err(e) = source.get_dependencies(Utc::now(), PREFETCH_LOOKBACK).await {
                    tracing::error!(error = %e, "failed to prefetch dependencies");
                }

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
            }

            tracing::info!("dependencies prefetch task stopped");
        }));
    }

    /// Signal the loop to stop and wait for it to finish. No-op when
    /// disabled or never started.
    pub async fn stop(&self) {
        if !self.enabled {
            return;
        }
        self.cancel.cancel();
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingSource {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DependenciesSource for CountingSource {
        async fn get_dependencies(
            &self,
            _end_ts: DateTime<Utc>,
            lookback: Duration,
        ) -> Result<Vec<DependencyLink>, SpanlakeError> {
            assert_eq!(lookback, PREFETCH_LOOKBACK);
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(SpanlakeError::Engine("boom".to_owned()));
            }
            Ok(Vec::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn prefetches_after_jitter_and_on_each_interval() {
        let source = CountingSource::new(false);
        let prefetch = DependenciesPrefetch::new(
            source.clone(),
            Duration::from_secs(3600),
            true,
        );
        prefetch.start().await;

        // Past the maximum jitter: the initial prefetch has run.
        tokio::time::sleep(Duration::from_secs(MAX_JITTER_SECS + 1)).await;
        assert_eq!(source.calls(), 1);

        // One interval (plus jitter headroom) later: a second prefetch.
        tokio::time::sleep(Duration::from_secs(3600 + MAX_JITTER_SECS + 1)).await;
        assert_eq!(source.calls(), 2);

        prefetch.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn errors_keep_the_loop_running() {
        let source = CountingSource::new(true);
        let prefetch = DependenciesPrefetch::new(
            source.clone(),
            Duration::from_secs(60),
            true,
        );
        prefetch.start().await;

        tokio::time::sleep(Duration::from_secs(MAX_JITTER_SECS + 61 + MAX_JITTER_SECS + 1)).await;
        assert!(source.calls() >= 2);

        prefetch.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_prefetch_never_runs() {
        let source = CountingSource::new(false);
        let prefetch = DependenciesPrefetch::new(
            source.clone(),
            Duration::from_secs(60),
            false,
        );
        prefetch.start().await;

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(source.calls(), 0);

        prefetch.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_ends_the_loop_promptly() {
        let source = CountingSource::new(false);
        let prefetch = DependenciesPrefetch::new(
            source.clone(),
            Duration::from_secs(60),
            true,
        );
        prefetch.start().await;
        prefetch.stop().await;

        let before = source.calls();
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(source.calls(), before);
    }
}
