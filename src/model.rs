//! Canonical cached feed item, its deterministic identity, and the
//! proxy-facing link rewriting.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, Utc};
use sha2::{Digest, Sha256};

use crate::newznab::wire;

/// How an item entered the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedItemSource {
    Rss,
    Search,
}

impl FeedItemSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rss => "rss",
            Self::Search => "search",
        }
    }
}

impl fmt::Display for FeedItemSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeedItemSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rss" => Ok(Self::Rss),
            "search" => Ok(Self::Search),
            other => Err(format!("unknown feed item source: {other}")),
        }
    }
}

/// Derive the content-addressed item id: lowercase hex SHA-256 of
/// `<indexer>:<guid>`.
pub fn feed_item_id(indexer: &str, guid: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(indexer.as_bytes());
    hasher.update(b":");
    hasher.update(guid.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// The canonical cached artifact. Created on RSS poll or search fan-out,
/// never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedItem {
    pub id: String,
    pub indexer_name: String,
    pub title: String,
    pub guid: String,
    pub guid_is_permalink: bool,
    pub link: String,
    pub comments: String,
    pub description: String,
    pub category: String,
    pub pub_date: Option<DateTime<FixedOffset>>,
    /// Upstream NZB URL. Never exposed to clients.
    pub nzb_link: String,
    pub size: i64,
    pub source: FeedItemSource,
    pub attrs: BTreeMap<String, String>,
}

impl FeedItem {
    /// Build a feed item from an upstream wire item. Repeated attribute names
    /// collapse last-wins.
    pub fn from_upstream(item: &wire::Item, indexer: &str, source: FeedItemSource) -> Self {
        let attrs = item
            .attrs
            .iter()
            .map(|a| (a.name.clone(), a.value.clone()))
            .collect();

        Self {
            id: feed_item_id(indexer, &item.guid.value),
            indexer_name: indexer.to_string(),
            title: item.title.clone(),
            guid: item.guid.value.clone(),
            guid_is_permalink: item.guid.is_permalink,
            link: item.link.clone(),
            comments: item.comments.clone(),
            description: item.description.clone(),
            category: item.category.clone(),
            pub_date: item.pub_date,
            nzb_link: item.enclosure.url.clone(),
            size: item.enclosure.length,
            source,
            attrs,
        }
    }

    /// The proxy-hosted download URL for this item. The port segment is
    /// omitted for 0 and the default HTTP port.
    pub fn rewritten_nzb_link(&self, host: &str, port: u16, tls: bool) -> String {
        let proto = if tls { "https" } else { "http" };
        if port != 0 && port != 80 {
            format!("{proto}://{host}:{port}/getnzb/{}", self.id)
        } else {
            format!("{proto}://{host}/getnzb/{}", self.id)
        }
    }

    /// Wire item carrying the original upstream links.
    pub fn to_upstream_item(&self) -> wire::Item {
        wire::Item {
            title: self.title.clone(),
            guid: wire::RssGuid {
                is_permalink: self.guid_is_permalink,
                value: self.guid.clone(),
            },
            link: self.link.clone(),
            comments: self.comments.clone(),
            pub_date: self.pub_date,
            category: self.category.clone(),
            description: self.description.clone(),
            enclosure: wire::RssEnclosure {
                url: self.nzb_link.clone(),
                length: self.size,
                enclosure_type: "application/x-nzb".to_string(),
            },
            attrs: self
                .attrs
                .iter()
                .map(|(name, value)| wire::NewznabAttr {
                    name: name.clone(),
                    value: value.clone(),
                })
                .collect(),
        }
    }

    /// The only client-facing view: both `link` and the enclosure URL point
    /// back at the proxy.
    pub fn to_rewritten_upstream_item(&self, host: &str, port: u16, tls: bool) -> wire::Item {
        let mut item = self.to_upstream_item();
        let rewritten = self.rewritten_nzb_link(host, port, tls);
        item.link = rewritten.clone();
        item.enclosure.url = rewritten;
        item
    }
}

/// Outcome of the last fan-out attempt against one backend for one query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchStatus {
    Hit,
    Miss,
    Error,
}

impl SearchStatus {
    /// Hits and misses are authoritative within the re-query window; errors
    /// are retried so a transient failure can self-heal.
    pub fn should_not_requery(self) -> bool {
        matches!(self, Self::Hit | Self::Miss)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Miss => "miss",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for SearchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hit" => Ok(Self::Hit),
            "miss" => Ok(Self::Miss),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown search status: {other}")),
        }
    }
}

/// Negative/error cache row, keyed by `(indexer_name, query)`.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchCacheEntry {
    pub indexer_name: String,
    pub query: String,
    pub first_tried: DateTime<Utc>,
    pub last_tried: DateTime<Utc>,
    pub status: SearchStatus,
    pub error_message: String,
}

/// What is needed to serve a `/getnzb/{id}` request.
#[derive(Debug, Clone, PartialEq)]
pub struct NzbData {
    pub title: String,
    pub indexer_name: String,
    pub nzb_link: String,
}
