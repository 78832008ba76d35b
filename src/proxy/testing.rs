//! Fake upstream backend for aggregator and poller tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::DateTime;

use crate::newznab::SearchParams;
use crate::newznab::client::{ClientError, NewznabBackend};
use crate::newznab::wire::{self, RssFeed};

/// In-memory [`NewznabBackend`] that serves a fixed item list, optionally
/// fails with a status code, or hangs (for shutdown tests).
pub(crate) struct FakeBackend {
    items: Vec<wire::Item>,
    fail_status: Option<u16>,
    hang: bool,
    search_calls: AtomicUsize,
    poll_calls: AtomicUsize,
    last_query: Mutex<Option<String>>,
    last_nzb_url: Mutex<Option<String>>,
}

impl FakeBackend {
    pub(crate) const NZB_BODY: &'static [u8] = b"<nzb>fake</nzb>";

    pub(crate) fn with_guids(guids: &[&str]) -> Self {
        Self {
            items: guids.iter().map(|g| Self::wire_item(g)).collect(),
            fail_status: None,
            hang: false,
            search_calls: AtomicUsize::new(0),
            poll_calls: AtomicUsize::new(0),
            last_query: Mutex::new(None),
            last_nzb_url: Mutex::new(None),
        }
    }

    pub(crate) fn failing(status: u16) -> Self {
        let mut fake = Self::with_guids(&[]);
        fake.fail_status = Some(status);
        fake
    }

    pub(crate) fn hanging() -> Self {
        let mut fake = Self::with_guids(&[]);
        fake.hang = true;
        fake
    }

    pub(crate) fn wire_item(guid: &str) -> wire::Item {
        wire::Item {
            title: format!("Release {guid}"),
            guid: wire::RssGuid {
                is_permalink: false,
                value: guid.to_string(),
            },
            link: format!("https://upstream/details/{guid}"),
            comments: String::new(),
            pub_date: Some(
                DateTime::parse_from_rfc2822("Sun, 28 Apr 2019 11:01:32 -0400").unwrap(),
            ),
            category: String::new(),
            description: format!("Release {guid}"),
            enclosure: wire::RssEnclosure {
                url: format!("https://upstream/getnzb/{guid}.nzb"),
                length: 42,
                enclosure_type: "application/x-nzb".to_string(),
            },
            attrs: vec![wire::NewznabAttr {
                name: "size".to_string(),
                value: "42".to_string(),
            }],
        }
    }

    pub(crate) fn search_calls(&self) -> usize {
        self.search_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn poll_calls(&self) -> usize {
        self.poll_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn last_search_query(&self) -> Option<String> {
        self.last_query.lock().unwrap().clone()
    }

    pub(crate) fn last_nzb_url(&self) -> Option<String> {
        self.last_nzb_url.lock().unwrap().clone()
    }

    fn feed(&self) -> Result<RssFeed, ClientError> {
        if let Some(status) = self.fail_status {
            return Err(ClientError::Status(status));
        }
        Ok(RssFeed::from_items(
            0,
            self.items.len() as u32,
            self.items.clone(),
        ))
    }
}

#[async_trait]
impl NewznabBackend for FakeBackend {
    async fn search(&self, params: &SearchParams) -> Result<RssFeed, ClientError> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_query.lock().unwrap() = Some(params.query.clone());
        if self.hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        self.feed()
    }

    async fn poll_rss(
        &self,
        _path: &str,
        _query_params: &[(String, String)],
    ) -> Result<RssFeed, ClientError> {
        self.poll_calls.fetch_add(1, Ordering::SeqCst);
        if self.hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        self.feed()
    }

    async fn get_nzb(&self, url: &str) -> Result<Bytes, ClientError> {
        *self.last_nzb_url.lock().unwrap() = Some(url.to_string());
        if let Some(status) = self.fail_status {
            return Err(ClientError::Status(status));
        }
        Ok(Bytes::from_static(Self::NZB_BODY))
    }
}
