//! Embedded schema migrations.
//!
//! Migrations are SQL files compiled into the binary. At startup the full set
//! is replayed against the `schema_migrations` history: already-applied
//! versions must match by version number and content hash, new versions are
//! executed and recorded. A store whose history diverged from the embedded
//! set refuses to start.

use rusqlite::{Connection, params};
use sha2::{Digest, Sha256};

use crate::db::Database;

/// Embedded migration files, named `<version>_<label>.sql`.
const EMBEDDED: &[(&str, &str)] = &[
    (
        "1_feed_items.sql",
        include_str!("migrations/1_feed_items.sql"),
    ),
    (
        "2_search_cache.sql",
        include_str!("migrations/2_search_cache.sql"),
    ),
];

const CREATE_MIGRATIONS_TABLE: &str = "CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER NOT NULL,
    hash    BLOB NOT NULL
)";

#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    #[error("no migrations")]
    Empty,

    #[error("version number clash on {0}")]
    DuplicateVersion(i64),

    #[error("migration mismatch between recorded version {old} and embedded version {new}")]
    Mismatch { old: i64, new: i64 },

    #[error(transparent)]
    Sql(#[from] rusqlite::Error),
}

#[derive(Debug, Clone)]
pub(crate) struct Migration {
    version: i64,
    content: String,
}

impl Migration {
    fn hash(&self) -> [u8; 32] {
        Sha256::digest(self.content.as_bytes()).into()
    }
}

/// Bring the database schema up to the latest embedded version.
pub fn migrate(db: &Database) -> Result<(), MigrateError> {
    let migrations = load_embedded();
    db.with_conn(|conn| apply(conn, &migrations))
}

fn load_embedded() -> Vec<Migration> {
    let mut migrations: Vec<Migration> = EMBEDDED
        .iter()
        .filter_map(|(name, content)| {
            parse_version(name).map(|version| Migration {
                version,
                content: (*content).to_string(),
            })
        })
        .collect();
    migrations.sort_by_key(|m| m.version);
    migrations
}

/// Extract the version from a `<version>_<label>.sql` file name.
/// Names not matching the pattern are skipped.
fn parse_version(name: &str) -> Option<i64> {
    let stem = name.strip_suffix(".sql")?;
    let (version, _label) = stem.split_once('_')?;
    version.parse().ok()
}

fn validate(migrations: &[Migration]) -> Result<(), MigrateError> {
    if migrations.is_empty() {
        return Err(MigrateError::Empty);
    }
    let mut seen = std::collections::HashSet::new();
    for m in migrations {
        if !seen.insert(m.version) {
            return Err(MigrateError::DuplicateVersion(m.version));
        }
    }
    Ok(())
}

pub(crate) fn apply(conn: &Connection, migrations: &[Migration]) -> Result<(), MigrateError> {
    validate(migrations)?;
    conn.execute(CREATE_MIGRATIONS_TABLE, [])?;

    let history = load_history(conn)?;
    for (idx, m) in migrations.iter().enumerate() {
        match history.get(idx) {
            None => {
                conn.execute_batch(&m.content)?;
                conn.execute(
                    "INSERT INTO schema_migrations (version, hash) VALUES (?1, ?2)",
                    params![m.version, m.hash().as_slice()],
                )?;
                tracing::info!(version = m.version, "Applied migration");
            }
            Some((version, hash)) => {
                if *version != m.version || hash.as_slice() != m.hash().as_slice() {
                    return Err(MigrateError::Mismatch {
                        old: *version,
                        new: m.version,
                    });
                }
            }
        }
    }
    // History entries beyond the embedded set are tolerated: they belong to a
    // newer build and must survive a rollback untouched.
    Ok(())
}

fn load_history(conn: &Connection) -> Result<Vec<(i64, Vec<u8>)>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT version, hash FROM schema_migrations ORDER BY version")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
