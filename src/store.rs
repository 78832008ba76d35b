//! Persistence for feed items, their attributes, and the search cache.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use rusqlite::types::Value;
use rusqlite::{OptionalExtension, Row, params};

use crate::db::Database;
use crate::error::ProxyError;
use crate::migrate;
use crate::model::{FeedItem, NzbData, SearchCacheEntry};

/// SQLite defaults to 999 bound parameters per statement; stay under it when
/// expanding id lists.
const ID_CHUNK: usize = 500;

const FEED_ITEM_COLUMNS: &str = "id, indexer_name, title, guid, guid_is_permalink, link, \
     comments, description, category, pub_date, nzb_url, size, source";

/// Typed queries over the embedded store. Cheap to clone; all clones share
/// one serialized connection.
#[derive(Clone)]
pub struct Store {
    db: Database,
}

impl Store {
    /// Open (or create) the store at `path` and bring its schema up to date.
    pub fn open(path: &Path) -> Result<Self, ProxyError> {
        let db = Database::open(path)?;
        migrate::migrate(&db)?;
        Ok(Self { db })
    }

    /// In-memory store with the full schema applied (for testing).
    pub fn open_in_memory() -> Result<Self, ProxyError> {
        let db = Database::open_in_memory()?;
        migrate::migrate(&db)?;
        Ok(Self { db })
    }

    /// Insert a feed item and its attributes. A duplicate id is a no-op, as
    /// is a duplicate `(feed_item_id, name)` attribute.
    pub fn insert_feed_item(&self, fi: &FeedItem) -> Result<(), rusqlite::Error> {
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            {
                let mut insert_item = tx.prepare_cached(
                    "INSERT OR IGNORE INTO feed_items \
                     (id, indexer_name, title, guid, guid_is_permalink, link, comments, \
                      description, category, pub_date, nzb_url, size, source) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                )?;
                insert_item.execute(params![
                    fi.id,
                    fi.indexer_name,
                    fi.title,
                    fi.guid,
                    fi.guid_is_permalink as i64,
                    fi.link,
                    fi.comments,
                    fi.description,
                    fi.category,
                    fi.pub_date.map(|d| d.to_rfc3339()),
                    fi.nzb_link,
                    fi.size,
                    fi.source.as_str(),
                ])?;

                let mut insert_meta = tx.prepare_cached(
                    "INSERT OR IGNORE INTO feed_item_meta (feed_item_id, name, value) \
                     VALUES (?1, ?2, ?3)",
                )?;
                for (name, value) in &fi.attrs {
                    insert_meta.execute(params![fi.id, name, value])?;
                }
            }
            tx.commit()
        })
    }

    /// Which of the given ids already exist.
    pub fn get_feed_item_ids(&self, ids: &[String]) -> Result<HashSet<String>, rusqlite::Error> {
        let mut present = HashSet::new();
        self.db.with_conn(|conn| {
            for chunk in ids.chunks(ID_CHUNK) {
                let sql = format!(
                    "SELECT id FROM feed_items WHERE id IN ({})",
                    placeholders(chunk.len())
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(
                    rusqlite::params_from_iter(chunk.iter()),
                    |row| row.get::<_, String>(0),
                )?;
                for id in rows {
                    present.insert(id?);
                }
            }
            Ok::<(), rusqlite::Error>(())
        })?;
        Ok(present)
    }

    /// Case-insensitive substring match against item titles, attributes
    /// eagerly attached. Rows come back in insertion order.
    pub fn search_for_feed_item(&self, query: &str) -> Result<Vec<FeedItem>, rusqlite::Error> {
        let pattern = format!("%{}%", escape_like(query));
        let mut items = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {FEED_ITEM_COLUMNS} FROM feed_items \
                 WHERE title LIKE ?1 ESCAPE '\\' ORDER BY rowid"
            ))?;
            let rows = stmt.query_map([pattern], row_to_feed_item)?;
            rows.collect::<Result<Vec<_>, _>>()
        })?;

        let ids: Vec<String> = items.iter().map(|fi| fi.id.clone()).collect();
        let mut metas = self.get_feed_item_metas(&ids)?;
        for fi in &mut items {
            if let Some(attrs) = metas.remove(&fi.id) {
                fi.attrs = attrs;
            }
        }
        Ok(items)
    }

    /// Bulk attribute fetch keyed by item id.
    pub fn get_feed_item_metas(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, BTreeMap<String, String>>, rusqlite::Error> {
        let mut metas: HashMap<String, BTreeMap<String, String>> = HashMap::new();
        self.db.with_conn(|conn| {
            for chunk in ids.chunks(ID_CHUNK) {
                let sql = format!(
                    "SELECT feed_item_id, name, value FROM feed_item_meta \
                     WHERE feed_item_id IN ({})",
                    placeholders(chunk.len())
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(rusqlite::params_from_iter(chunk.iter()), |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?;
                for row in rows {
                    let (id, name, value) = row?;
                    metas.entry(id).or_default().insert(name, value);
                }
            }
            Ok::<(), rusqlite::Error>(())
        })?;
        Ok(metas)
    }

    /// Insert-or-replace by `(indexer_name, query)`. `first_tried` keeps the
    /// earliest recorded value across updates.
    pub fn upsert_search_cache_entry(
        &self,
        entry: &SearchCacheEntry,
    ) -> Result<(), rusqlite::Error> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "INSERT INTO search_cache \
                 (indexer_name, query, categories, first_tried, last_tried, status, error_message) \
                 VALUES (?1, ?2, '', ?3, ?4, ?5, ?6) \
                 ON CONFLICT (indexer_name, query) DO UPDATE SET \
                 last_tried = excluded.last_tried, \
                 status = excluded.status, \
                 error_message = excluded.error_message",
            )?;
            stmt.execute(params![
                entry.indexer_name,
                entry.query,
                entry.first_tried.timestamp(),
                entry.last_tried.timestamp(),
                entry.status.as_str(),
                entry.error_message,
            ])?;
            Ok(())
        })
    }

    /// All cache entries for `query` tried strictly after `after`, keyed by
    /// indexer name. Older entries are excluded so a stale negative does not
    /// suppress a new fan-out.
    pub fn load_current_search_cache_entries(
        &self,
        query: &str,
        after: DateTime<Utc>,
    ) -> Result<HashMap<String, SearchCacheEntry>, rusqlite::Error> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT indexer_name, query, first_tried, last_tried, status, error_message \
                 FROM search_cache WHERE query = ?1 AND last_tried > ?2",
            )?;
            let rows = stmt.query_map(params![query, after.timestamp()], |row| {
                let status: String = row.get(4)?;
                Ok(SearchCacheEntry {
                    indexer_name: row.get(0)?,
                    query: row.get(1)?,
                    first_tried: unix_time(row.get(2)?),
                    last_tried: unix_time(row.get(3)?),
                    status: status
                        .parse()
                        .map_err(|e: String| bad_column(4, Value::Text(e)))?,
                    error_message: row.get(5)?,
                })
            })?;
            let mut entries = HashMap::new();
            for row in rows {
                let entry = row?;
                entries.insert(entry.indexer_name.clone(), entry);
            }
            Ok(entries)
        })
    }

    /// Resolve a cached item id to what is needed to proxy its NZB download.
    /// `None` means the id is unknown.
    pub fn get_nzb_data_by_id(&self, id: &str) -> Result<Option<NzbData>, rusqlite::Error> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT title, indexer_name, nzb_url FROM feed_items WHERE id = ?1",
                [id],
                |row| {
                    Ok(NzbData {
                        title: row.get(0)?,
                        indexer_name: row.get(1)?,
                        nzb_link: row.get(2)?,
                    })
                },
            )
            .optional()
        })
    }
}

fn row_to_feed_item(row: &Row<'_>) -> Result<FeedItem, rusqlite::Error> {
    let pub_date: Option<String> = row.get(9)?;
    let pub_date = pub_date
        .map(|raw| {
            DateTime::<FixedOffset>::parse_from_rfc3339(&raw)
                .map_err(|_| bad_column(9, Value::Text(raw)))
        })
        .transpose()?;
    let source: String = row.get(12)?;

    Ok(FeedItem {
        id: row.get(0)?,
        indexer_name: row.get(1)?,
        title: row.get(2)?,
        guid: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
        guid_is_permalink: row.get::<_, i64>(4)? != 0,
        link: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
        comments: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
        description: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
        category: row.get::<_, Option<String>>(8)?.unwrap_or_default(),
        pub_date,
        nzb_link: row.get(10)?,
        size: row.get::<_, Option<i64>>(11)?.unwrap_or_default(),
        source: source
            .parse()
            .map_err(|e: String| bad_column(12, Value::Text(e)))?,
        attrs: BTreeMap::new(),
    })
}

fn unix_time(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .unwrap_or_else(|| DateTime::<Utc>::MIN_UTC)
}

fn bad_column(index: usize, value: Value) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        format!("{value:?}").into(),
    )
}

fn placeholders(n: usize) -> String {
    let mut s = "?,".repeat(n);
    s.pop();
    s
}

fn escape_like(query: &str) -> String {
    query
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
