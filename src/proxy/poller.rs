//! Background RSS pollers: one worker per (backend, feed) pair, warming the
//! cache independently of inbound searches.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

use crate::error::ProxyError;
use crate::model::{FeedItem, FeedItemSource};
use crate::newznab::client::NewznabBackend;
use crate::proxy::Proxy;
use crate::store::Store;

/// Hard bound on graceful shutdown: workers still running after this are
/// force-cancelled.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// How `stop` went. A forced cancel is a warning, not a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Clean,
    ForcedCancel,
}

pub struct PollerFleet {
    pending: Vec<PollerWorker>,
    shutdown: watch::Sender<bool>,
    tasks: JoinSet<()>,
}

struct PollerWorker {
    backend: String,
    feed: String,
    path: String,
    params: Vec<(String, String)>,
    interval: Duration,
    client: Arc<dyn NewznabBackend>,
    store: Store,
}

impl PollerFleet {
    /// One worker per feed of every backend with an RSS section. Effective
    /// query params are the backend's base params with feed-level overrides
    /// winning on key conflicts.
    pub fn from_proxy(proxy: &Proxy) -> Self {
        let (shutdown, _) = watch::channel(false);
        let mut pending = Vec::new();

        for backend in proxy.backends() {
            let Some(rss) = &backend.rss else { continue };
            for feed in &rss.feeds {
                let mut params = rss.rss_query_params.clone();
                params.extend(feed.query_params.clone());
                pending.push(PollerWorker {
                    backend: backend.name.clone(),
                    feed: feed.name.clone(),
                    path: rss.rss_path.clone(),
                    params: params.into_iter().collect(),
                    interval: feed.poll_interval,
                    client: backend.client.clone(),
                    store: proxy.store().clone(),
                });
            }
        }

        Self {
            pending,
            shutdown,
            tasks: JoinSet::new(),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.pending.len() + self.tasks.len()
    }

    /// Spawn all workers. Each polls immediately, then on its own interval.
    pub fn start(&mut self) {
        for worker in self.pending.drain(..) {
            let rx = self.shutdown.subscribe();
            tracing::info!(
                backend = %worker.backend,
                feed = %worker.feed,
                interval = ?worker.interval,
                "Starting RSS poller"
            );
            self.tasks.spawn(worker.run(rx));
        }
    }

    /// Signal shutdown and wait for every worker to exit. Idempotent; a
    /// no-op when `start` was never called.
    pub async fn stop(&mut self) -> StopOutcome {
        self.stop_with_timeout(SHUTDOWN_TIMEOUT).await
    }

    async fn stop_with_timeout(&mut self, budget: Duration) -> StopOutcome {
        let _ = self.shutdown.send(true);
        if self.tasks.is_empty() {
            return StopOutcome::Clean;
        }

        let drained = tokio::time::timeout(budget, async {
            while self.tasks.join_next().await.is_some() {}
        })
        .await;

        match drained {
            Ok(()) => {
                tracing::info!("Poller fleet stopped");
                StopOutcome::Clean
            }
            Err(_) => {
                tracing::warn!(budget = ?budget, "Poller fleet did not stop in time, forcing cancel");
                self.tasks.abort_all();
                while self.tasks.join_next().await.is_some() {}
                StopOutcome::ForcedCancel
            }
        }
    }
}

impl PollerWorker {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        // Don't pile up ticks behind a slow upstream.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.poll_once().await {
                        tracing::warn!(
                            backend = %self.backend,
                            feed = %self.feed,
                            error = %err,
                            "RSS poll failed"
                        );
                    }
                }
                changed = shutdown.changed() => {
                    // Stop on signal, or when the fleet itself went away.
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!(backend = %self.backend, feed = %self.feed, "RSS poller exiting");
                        break;
                    }
                }
            }
        }
    }

    async fn poll_once(&self) -> Result<(), ProxyError> {
        let feed = self
            .client
            .poll_rss(&self.path, &self.params)
            .await
            .map_err(|e| ProxyError::Upstream {
                backend: self.backend.clone(),
                source: e,
            })?;

        let items: Vec<FeedItem> = feed
            .channel
            .items
            .iter()
            .map(|item| FeedItem::from_upstream(item, &self.backend, FeedItemSource::Rss))
            .collect();
        let ids: Vec<String> = items.iter().map(|fi| fi.id.clone()).collect();
        let existing = self.store.get_feed_item_ids(&ids)?;

        let mut inserted = 0usize;
        for fi in items.into_iter().filter(|fi| !existing.contains(&fi.id)) {
            // One bad item must not starve the rest of the feed.
            if let Err(err) = self.store.insert_feed_item(&fi) {
                tracing::warn!(
                    backend = %self.backend,
                    feed = %self.feed,
                    id = %fi.id,
                    error = %err,
                    "Failed to insert feed item"
                );
                continue;
            }
            inserted += 1;
        }

        tracing::debug!(
            backend = %self.backend,
            feed = %self.feed,
            total = ids.len(),
            inserted,
            "RSS poll complete"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, FeedConfig, RssConfig};
    use crate::model::feed_item_id;
    use crate::proxy::testing::FakeBackend;
    use crate::proxy::{Backend, Proxy};
    use std::collections::BTreeMap;

    fn worker(fake: Arc<FakeBackend>, store: Store, interval: Duration) -> PollerWorker {
        PollerWorker {
            backend: "alpha".to_string(),
            feed: "all".to_string(),
            path: "/rss".to_string(),
            params: Vec::new(),
            interval,
            client: fake,
            store,
        }
    }

    fn fleet_with(workers: Vec<PollerWorker>) -> PollerFleet {
        let (shutdown, _) = watch::channel(false);
        PollerFleet {
            pending: workers,
            shutdown,
            tasks: JoinSet::new(),
        }
    }

    #[test]
    fn test_from_proxy_builds_one_worker_per_feed() {
        let mut rss_params = BTreeMap::new();
        rss_params.insert("dl".to_string(), "1".to_string());
        rss_params.insert("num".to_string(), "50".to_string());

        let mut movie_params = BTreeMap::new();
        movie_params.insert("num".to_string(), "100".to_string());
        movie_params.insert("t".to_string(), "2000".to_string());

        let rss = RssConfig {
            rss_path: "/rss".to_string(),
            rss_query_params: rss_params,
            feeds: vec![
                FeedConfig {
                    name: "movies".to_string(),
                    poll_interval: Duration::from_secs(60),
                    query_params: movie_params,
                },
                FeedConfig {
                    name: "tv".to_string(),
                    poll_interval: Duration::from_secs(120),
                    query_params: BTreeMap::new(),
                },
            ],
        };

        let proxy = Proxy::with_backends(
            Arc::new(Config::default()),
            Store::open_in_memory().unwrap(),
            vec![
                Backend {
                    name: "alpha".to_string(),
                    client: Arc::new(FakeBackend::with_guids(&[])),
                    rss: Some(rss),
                },
                Backend {
                    name: "beta".to_string(),
                    client: Arc::new(FakeBackend::with_guids(&[])),
                    rss: None,
                },
            ],
        );

        let fleet = PollerFleet::from_proxy(&proxy);
        assert_eq!(fleet.worker_count(), 2);

        // Feed-level params win on conflicts, backend params fill the rest.
        let movies = &fleet.pending[0];
        assert_eq!(movies.feed, "movies");
        let params: BTreeMap<_, _> = movies.params.iter().cloned().collect();
        assert_eq!(params["dl"], "1");
        assert_eq!(params["num"], "100");
        assert_eq!(params["t"], "2000");
    }

    #[tokio::test]
    async fn test_poll_once_inserts_new_items_only() {
        let store = Store::open_in_memory().unwrap();
        let fake = Arc::new(FakeBackend::with_guids(&["g1", "g2"]));
        let w = worker(fake.clone(), store.clone(), Duration::from_secs(60));

        w.poll_once().await.unwrap();
        w.poll_once().await.unwrap();

        let ids = vec![feed_item_id("alpha", "g1"), feed_item_id("alpha", "g2")];
        assert_eq!(store.get_feed_item_ids(&ids).unwrap().len(), 2);
        assert_eq!(fake.poll_calls(), 2);

        // Items entered through the poller carry the rss source.
        let items = store.search_for_feed_item("Release g1").unwrap();
        assert_eq!(items[0].source, FeedItemSource::Rss);
    }

    #[tokio::test]
    async fn test_poll_once_propagates_transport_errors() {
        let store = Store::open_in_memory().unwrap();
        let fake = Arc::new(FakeBackend::failing(503));
        let w = worker(fake, store, Duration::from_secs(60));

        let err = w.poll_once().await.unwrap_err();
        assert!(matches!(err, ProxyError::Upstream { .. }));
    }

    #[tokio::test]
    async fn test_fleet_polls_immediately_and_stops_clean() {
        let store = Store::open_in_memory().unwrap();
        let fake = Arc::new(FakeBackend::with_guids(&["g1"]));
        let mut fleet = fleet_with(vec![worker(
            fake.clone(),
            store.clone(),
            Duration::from_secs(3600),
        )]);

        fleet.start();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(fleet.stop().await, StopOutcome::Clean);
        assert!(fake.poll_calls() >= 1);
        assert_eq!(
            store
                .get_feed_item_ids(&[feed_item_id("alpha", "g1")])
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let mut fleet = fleet_with(Vec::new());
        assert_eq!(fleet.stop().await, StopOutcome::Clean);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let fake = Arc::new(FakeBackend::with_guids(&[]));
        let mut fleet = fleet_with(vec![worker(fake, store, Duration::from_secs(3600))]);

        fleet.start();
        assert_eq!(fleet.stop().await, StopOutcome::Clean);
        assert_eq!(fleet.stop().await, StopOutcome::Clean);
    }

    #[tokio::test]
    async fn test_hung_poll_forces_cancel() {
        let store = Store::open_in_memory().unwrap();
        let fake = Arc::new(FakeBackend::hanging());
        let mut fleet = fleet_with(vec![worker(fake, store, Duration::from_secs(3600))]);

        fleet.start();
        // Let the first (hanging) poll begin.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let outcome = fleet.stop_with_timeout(Duration::from_millis(100)).await;
        assert_eq!(outcome, StopOutcome::ForcedCancel);

        // A second stop after the forced cancel is a clean no-op.
        assert_eq!(fleet.stop().await, StopOutcome::Clean);
    }
}
