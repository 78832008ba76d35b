//! The aggregation core: fan a search out over every configured backend,
//! cache what comes back, and resolve cached ids back to upstream NZBs.

pub mod poller;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::future;

use crate::config::{Config, RssConfig};
use crate::error::ProxyError;
use crate::model::{FeedItem, FeedItemSource, SearchCacheEntry, SearchStatus};
use crate::newznab::SearchParams;
use crate::newznab::client::{Client, NewznabBackend};
use crate::newznab::wire::{self, RssFeed};
use crate::store::Store;

/// A resolved NZB download ready to stream to the client.
#[derive(Debug, Clone, PartialEq)]
pub struct NzbDownload {
    pub title: String,
    pub data: Bytes,
}

/// The narrow seam the HTTP layer consumes. Keeping it a trait lets the
/// routes be tested against a fake and the aggregator against fake backends.
#[async_trait]
pub trait ProxyService: Send + Sync {
    async fn search(&self, params: SearchParams) -> Result<RssFeed, ProxyError>;

    async fn get_nzb(&self, id: &str) -> Result<NzbDownload, ProxyError>;
}

/// One configured upstream indexer.
pub struct Backend {
    pub name: String,
    pub client: Arc<dyn NewznabBackend>,
    pub rss: Option<RssConfig>,
}

pub struct Proxy {
    config: Arc<Config>,
    store: Store,
    backends: Vec<Backend>,
}

enum FanoutOutcome {
    Skipped,
    Error(String),
    Success(Vec<wire::Item>),
}

impl Proxy {
    /// Build the proxy with a real HTTP client per configured backend.
    pub fn new(config: Arc<Config>, store: Store) -> Self {
        let backends = config
            .backends
            .iter()
            .map(|b| Backend {
                name: b.name.clone(),
                client: Arc::new(Client::new(&b.base_url, &b.api_key)) as Arc<dyn NewznabBackend>,
                rss: b.rss.clone(),
            })
            .collect();
        Self::with_backends(config, store, backends)
    }

    /// Construction seam for tests: inject arbitrary backend clients.
    pub fn with_backends(config: Arc<Config>, store: Store, backends: Vec<Backend>) -> Self {
        Self {
            config,
            store,
            backends,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn backends(&self) -> &[Backend] {
        &self.backends
    }

    async fn search_impl(&self, params: SearchParams) -> Result<RssFeed, ProxyError> {
        // Local lookup on the raw query. With cache-first enabled, a local
        // match is authoritative and no backend is contacted.
        let local = self.store.search_for_feed_item(&params.query)?;
        if !local.is_empty() && self.config.search.cache_first {
            tracing::debug!(
                query = %params.query,
                matches = local.len(),
                "Serving search from local cache"
            );
            return Ok(self.items_response(local));
        }

        // The sanitised query is the cache key and what backends see.
        let params = params.with_sanitised_query();
        let window = chrono::Duration::from_std(self.config.search.requery_window)
            .unwrap_or_else(|_| chrono::Duration::hours(24));
        let cached = self
            .store
            .load_current_search_cache_entries(&params.query, Utc::now() - window)?;

        let futures = self.backends.iter().map(|backend| {
            let skip = cached
                .get(&backend.name)
                .is_some_and(|e| e.status.should_not_requery());
            let params = &params;
            async move {
                if skip {
                    return FanoutOutcome::Skipped;
                }
                match backend.client.search(params).await {
                    Ok(feed) => FanoutOutcome::Success(feed.channel.items),
                    Err(e) => FanoutOutcome::Error(e.to_string()),
                }
            }
        });
        let outcomes = future::join_all(futures).await;

        // All writes happen sequentially after the join; a failing backend
        // never fails the request.
        let now = Utc::now();
        let mut merged = if self.config.search.cache_first {
            Vec::new()
        } else {
            local
        };
        let mut seen: std::collections::HashSet<String> =
            merged.iter().map(|fi| fi.id.clone()).collect();

        for (backend, outcome) in self.backends.iter().zip(outcomes) {
            match outcome {
                FanoutOutcome::Skipped => {
                    tracing::debug!(
                        backend = %backend.name,
                        query = %params.query,
                        "Skipping backend, recent cache entry"
                    );
                }
                FanoutOutcome::Error(message) => {
                    tracing::warn!(
                        backend = %backend.name,
                        query = %params.query,
                        error = %message,
                        "Backend search failed"
                    );
                    self.store.upsert_search_cache_entry(&SearchCacheEntry {
                        indexer_name: backend.name.clone(),
                        query: params.query.clone(),
                        first_tried: now,
                        last_tried: now,
                        status: SearchStatus::Error,
                        error_message: message,
                    })?;
                }
                FanoutOutcome::Success(items) => {
                    let status = if items.is_empty() {
                        SearchStatus::Miss
                    } else {
                        SearchStatus::Hit
                    };
                    self.store.upsert_search_cache_entry(&SearchCacheEntry {
                        indexer_name: backend.name.clone(),
                        query: params.query.clone(),
                        first_tried: now,
                        last_tried: now,
                        status,
                        error_message: String::new(),
                    })?;
                    for item in &items {
                        let fi =
                            FeedItem::from_upstream(item, &backend.name, FeedItemSource::Search);
                        self.store.insert_feed_item(&fi)?;
                        if seen.insert(fi.id.clone()) {
                            merged.push(fi);
                        }
                    }
                }
            }
        }

        Ok(self.items_response(merged))
    }

    async fn get_nzb_impl(&self, id: &str) -> Result<NzbDownload, ProxyError> {
        let data = self
            .store
            .get_nzb_data_by_id(id)?
            .ok_or_else(|| ProxyError::NzbNotFound(id.to_string()))?;

        let backend = self
            .backends
            .iter()
            .find(|b| b.name == data.indexer_name)
            .ok_or_else(|| ProxyError::OrphanIndexer(data.indexer_name.clone()))?;

        let body = backend
            .client
            .get_nzb(&data.nzb_link)
            .await
            .map_err(|e| ProxyError::Upstream {
                backend: backend.name.clone(),
                source: e,
            })?;

        tracing::debug!(id, backend = %backend.name, bytes = body.len(), "Proxied NZB download");
        Ok(NzbDownload {
            title: data.title,
            data: body,
        })
    }

    /// Wrap items for the downstream consumer: links rewritten to the proxy,
    /// item order is backend-configuration order.
    fn items_response(&self, items: Vec<FeedItem>) -> RssFeed {
        let web = &self.config.web;
        let wire_items: Vec<wire::Item> = items
            .iter()
            .map(|fi| fi.to_rewritten_upstream_item(&web.external_host, web.port, web.tls))
            .collect();
        let total = wire_items.len() as u32;
        RssFeed::from_items(0, total, wire_items)
    }
}

#[async_trait]
impl ProxyService for Proxy {
    async fn search(&self, params: SearchParams) -> Result<RssFeed, ProxyError> {
        self.search_impl(params).await
    }

    async fn get_nzb(&self, id: &str) -> Result<NzbDownload, ProxyError> {
        self.get_nzb_impl(id).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::testing::FakeBackend;
    use super::*;
    use crate::model::feed_item_id;
    use chrono::Duration;

    fn test_config() -> Arc<Config> {
        let mut config = Config::default();
        config.web.external_host = "proxy.local".to_string();
        config.web.port = 8080;
        Arc::new(config)
    }

    fn proxy_with(backends: Vec<Backend>) -> Proxy {
        Proxy::with_backends(test_config(), Store::open_in_memory().unwrap(), backends)
    }

    fn backend(name: &str, fake: Arc<FakeBackend>) -> Backend {
        Backend {
            name: name.to_string(),
            client: fake,
            rss: None,
        }
    }

    fn params(query: &str) -> SearchParams {
        SearchParams {
            query: query.to_string(),
            ..SearchParams::default()
        }
    }

    #[tokio::test]
    async fn test_empty_backends_returns_empty_feed() {
        let proxy = proxy_with(Vec::new());
        let feed = proxy.search_impl(params("foo")).await.unwrap();
        assert!(feed.channel.items.is_empty());
        assert_eq!(feed.channel.response.unwrap().total, 0);

        let entries = proxy
            .store
            .load_current_search_cache_entries("foo", Utc::now() - Duration::hours(24))
            .unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_cold_search_inserts_and_rewrites() {
        let fake = Arc::new(FakeBackend::with_guids(&["g1", "g2"]));
        let proxy = proxy_with(vec![backend("alpha", fake.clone())]);

        let feed = proxy.search_impl(params("foo")).await.unwrap();
        assert_eq!(feed.channel.items.len(), 2);
        assert_eq!(fake.search_calls(), 1);

        let expected = format!(
            "http://proxy.local:8080/getnzb/{}",
            feed_item_id("alpha", "g1")
        );
        assert_eq!(feed.channel.items[0].link, expected);
        assert_eq!(feed.channel.items[0].enclosure.url, expected);

        // Both items cached, plus a hit entry.
        let present = proxy
            .store
            .get_feed_item_ids(&[
                feed_item_id("alpha", "g1"),
                feed_item_id("alpha", "g2"),
            ])
            .unwrap();
        assert_eq!(present.len(), 2);

        let entries = proxy
            .store
            .load_current_search_cache_entries("foo", Utc::now() - Duration::hours(1))
            .unwrap();
        assert_eq!(entries["alpha"].status, SearchStatus::Hit);
    }

    #[tokio::test]
    async fn test_warm_search_skips_backends() {
        let fake = Arc::new(FakeBackend::with_guids(&["g1"]));
        let proxy = proxy_with(vec![backend("alpha", fake.clone())]);

        let cold = proxy.search_impl(params("release")).await.unwrap();
        let warm = proxy.search_impl(params("release")).await.unwrap();

        assert_eq!(fake.search_calls(), 1);
        assert_eq!(cold.channel.items, warm.channel.items);
    }

    #[tokio::test]
    async fn test_mixed_fanout_outcomes() {
        let erroring = Arc::new(FakeBackend::failing(503));
        let empty = Arc::new(FakeBackend::with_guids(&[]));
        let full = Arc::new(FakeBackend::with_guids(&["g1"]));
        let proxy = proxy_with(vec![
            backend("alpha", erroring.clone()),
            backend("beta", empty.clone()),
            backend("gamma", full.clone()),
        ]);

        let feed = proxy.search_impl(params("foo")).await.unwrap();
        assert_eq!(feed.channel.items.len(), 1);
        assert_eq!(
            feed.channel.items[0].link,
            format!(
                "http://proxy.local:8080/getnzb/{}",
                feed_item_id("gamma", "g1")
            )
        );

        let entries = proxy
            .store
            .load_current_search_cache_entries("foo", Utc::now() - Duration::hours(1))
            .unwrap();
        assert_eq!(entries["alpha"].status, SearchStatus::Error);
        assert!(entries["alpha"].error_message.contains("503"));
        assert_eq!(entries["beta"].status, SearchStatus::Miss);
        assert_eq!(entries["gamma"].status, SearchStatus::Hit);
    }

    #[tokio::test]
    async fn test_negative_cache_suppresses_requery() {
        let alpha = Arc::new(FakeBackend::with_guids(&[]));
        let beta = Arc::new(FakeBackend::with_guids(&["g1"]));
        let proxy = proxy_with(vec![
            backend("alpha", alpha.clone()),
            backend("beta", beta.clone()),
        ]);

        let now = Utc::now();
        proxy
            .store
            .upsert_search_cache_entry(&SearchCacheEntry {
                indexer_name: "alpha".to_string(),
                query: "foo".to_string(),
                first_tried: now - Duration::hours(1),
                last_tried: now - Duration::hours(1),
                status: SearchStatus::Miss,
                error_message: String::new(),
            })
            .unwrap();

        let feed = proxy.search_impl(params("foo")).await.unwrap();
        assert_eq!(alpha.search_calls(), 0);
        assert_eq!(beta.search_calls(), 1);
        assert_eq!(feed.channel.items.len(), 1);
    }

    #[tokio::test]
    async fn test_error_entries_do_requery() {
        let alpha = Arc::new(FakeBackend::with_guids(&["g1"]));
        let proxy = proxy_with(vec![backend("alpha", alpha.clone())]);

        let now = Utc::now();
        proxy
            .store
            .upsert_search_cache_entry(&SearchCacheEntry {
                indexer_name: "alpha".to_string(),
                query: "foo".to_string(),
                first_tried: now - Duration::hours(1),
                last_tried: now - Duration::hours(1),
                status: SearchStatus::Error,
                error_message: "unexpected status 503".to_string(),
            })
            .unwrap();

        proxy.search_impl(params("foo")).await.unwrap();
        assert_eq!(alpha.search_calls(), 1);

        let entries = proxy
            .store
            .load_current_search_cache_entries("foo", now - Duration::hours(2))
            .unwrap();
        assert_eq!(entries["alpha"].status, SearchStatus::Hit);
    }

    #[tokio::test]
    async fn test_stale_negative_entry_does_not_suppress() {
        let alpha = Arc::new(FakeBackend::with_guids(&["g1"]));
        let proxy = proxy_with(vec![backend("alpha", alpha.clone())]);

        let now = Utc::now();
        proxy
            .store
            .upsert_search_cache_entry(&SearchCacheEntry {
                indexer_name: "alpha".to_string(),
                query: "foo".to_string(),
                first_tried: now - Duration::hours(30),
                last_tried: now - Duration::hours(30),
                status: SearchStatus::Miss,
                error_message: String::new(),
            })
            .unwrap();

        proxy.search_impl(params("foo")).await.unwrap();
        assert_eq!(alpha.search_calls(), 1);
    }

    #[tokio::test]
    async fn test_query_sanitised_for_cache_and_fanout() {
        let alpha = Arc::new(FakeBackend::with_guids(&[]));
        let proxy = proxy_with(vec![backend("alpha", alpha.clone())]);

        proxy.search_impl(params("  Foo   BAR ")).await.unwrap();
        assert_eq!(alpha.last_search_query(), Some("foo bar".to_string()));

        let entries = proxy
            .store
            .load_current_search_cache_entries("foo bar", Utc::now() - Duration::hours(1))
            .unwrap();
        assert_eq!(entries["alpha"].status, SearchStatus::Miss);
    }

    #[tokio::test]
    async fn test_local_hit_short_circuits_fanout() {
        let alpha = Arc::new(FakeBackend::with_guids(&["g9"]));
        let proxy = proxy_with(vec![backend("alpha", alpha.clone())]);

        let item = FakeBackend::wire_item("g1");
        let fi = FeedItem::from_upstream(&item, "alpha", FeedItemSource::Rss);
        proxy.store.insert_feed_item(&fi).unwrap();

        let feed = proxy.search_impl(params("Release g1")).await.unwrap();
        assert_eq!(alpha.search_calls(), 0);
        assert_eq!(feed.channel.items.len(), 1);
        assert_eq!(
            feed.channel.items[0].link,
            format!("http://proxy.local:8080/getnzb/{}", fi.id)
        );
    }

    #[tokio::test]
    async fn test_cache_first_disabled_merges_local_and_remote() {
        let alpha = Arc::new(FakeBackend::with_guids(&["g1", "g2"]));
        let mut config = Config::default();
        config.web.external_host = "proxy.local".to_string();
        config.search.cache_first = false;
        let proxy = Proxy::with_backends(
            Arc::new(config),
            Store::open_in_memory().unwrap(),
            vec![backend("alpha", alpha.clone())],
        );

        // g1 is already cached locally; the fan-out returns g1 and g2.
        let fi = FeedItem::from_upstream(&FakeBackend::wire_item("g1"), "alpha", FeedItemSource::Rss);
        proxy.store.insert_feed_item(&fi).unwrap();

        let feed = proxy.search_impl(params("release")).await.unwrap();
        assert_eq!(alpha.search_calls(), 1);

        // Local match first, remote g2 appended, g1 not duplicated.
        let ids: Vec<String> = feed
            .channel
            .items
            .iter()
            .map(|i| i.link.rsplit('/').next().unwrap().to_string())
            .collect();
        assert_eq!(
            ids,
            vec![feed_item_id("alpha", "g1"), feed_item_id("alpha", "g2")]
        );
    }

    #[tokio::test]
    async fn test_get_nzb_round_trip() {
        let alpha = Arc::new(FakeBackend::with_guids(&[]));
        let proxy = proxy_with(vec![backend("alpha", alpha.clone())]);

        let fi = FeedItem::from_upstream(&FakeBackend::wire_item("g1"), "alpha", FeedItemSource::Rss);
        proxy.store.insert_feed_item(&fi).unwrap();

        let download = proxy.get_nzb_impl(&fi.id).await.unwrap();
        assert_eq!(download.title, "Release g1");
        assert_eq!(download.data.as_ref(), FakeBackend::NZB_BODY);
        assert_eq!(alpha.last_nzb_url(), Some(fi.nzb_link.clone()));
    }

    #[tokio::test]
    async fn test_get_nzb_unknown_id() {
        let proxy = proxy_with(Vec::new());
        let err = proxy.get_nzb_impl("deadbeef").await.unwrap_err();
        assert!(matches!(err, ProxyError::NzbNotFound(_)));
        assert_eq!(err.to_string(), "no NZB found with id deadbeef");
    }

    #[tokio::test]
    async fn test_get_nzb_orphan_indexer() {
        let proxy = proxy_with(Vec::new());
        let fi = FeedItem::from_upstream(&FakeBackend::wire_item("g1"), "gone", FeedItemSource::Rss);
        proxy.store.insert_feed_item(&fi).unwrap();

        let err = proxy.get_nzb_impl(&fi.id).await.unwrap_err();
        assert!(matches!(err, ProxyError::OrphanIndexer(_)));
        assert_eq!(
            err.to_string(),
            "the indexer that provided this NZB is no longer configured: gone"
        );
    }
}
