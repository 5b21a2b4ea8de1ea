use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::identity::{DerivationStrategy, IdentityRecord};

pub trait IdentityStore: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<IdentityRecord>>;
    fn insert_if_absent(&self, key: &str, record: &IdentityRecord) -> Result<IdentityRecord>;
    fn remove(&self, key: &str) -> Result<bool>;
}

#[derive(Debug, Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

#[derive(Debug, Default, Clone)]
pub struct Options {
    pub path: Option<PathBuf>,
}

impl Store {
    pub fn open(opts: Options) -> Result<Self> {
        let path = if let Some(path) = opts.path {
            path
        } else {
            default_path().context("storage: resolve default path")?
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("storage: create directory {}", parent.display()))?;
        }

        let conn = Connection::open(&path)
            .with_context(|| format!("storage: open database at {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("storage: set WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .context("storage: set busy timeout")?;
        migrate(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("storage: open in-memory database")?;
        migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn close(self) -> Result<()> {
        let conn = Arc::try_unwrap(self.conn)
            .map_err(|_| anyhow!("storage: connection still in use"))?
            .into_inner();
        conn.close()
            .map_err(|(_, err)| err)
            .context("storage: close connection")
    }
}

impl IdentityStore for Store {
    fn load(&self, key: &str) -> Result<Option<IdentityRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            r#"
SELECT identifier, strategy, created_at
FROM identities
WHERE key = ?1
"#,
            params![key],
            identity_from_row,
        )
        .optional()
        .context("storage: query identity")
    }

    fn insert_if_absent(&self, key: &str, record: &IdentityRecord) -> Result<IdentityRecord> {
        if key.is_empty() {
            bail!("storage: identity key required");
        }
        if record.identifier.trim().is_empty() {
            bail!("storage: identifier required");
        }
        let conn = self.conn.lock();
        conn.execute(
            r#"
INSERT INTO identities (key, identifier, strategy, created_at)
VALUES (?1, ?2, ?3, ?4)
ON CONFLICT(key) DO NOTHING
"#,
            params![
                key,
                record.identifier,
                record.strategy.as_str(),
                record.created_at.timestamp(),
            ],
        )
        .context("storage: insert identity")?;
        conn.query_row(
            r#"
SELECT identifier, strategy, created_at
FROM identities
WHERE key = ?1
"#,
            params![key],
            identity_from_row,
        )
        .context("storage: read back identity")
    }

    fn remove(&self, key: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let removed = conn
            .execute("DELETE FROM identities WHERE key = ?1", params![key])
            .context("storage: delete identity")?;
        Ok(removed > 0)
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, IdentityRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdentityStore for MemoryStore {
    fn load(&self, key: &str) -> Result<Option<IdentityRecord>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn insert_if_absent(&self, key: &str, record: &IdentityRecord) -> Result<IdentityRecord> {
        if key.is_empty() {
            bail!("storage: identity key required");
        }
        if record.identifier.trim().is_empty() {
            bail!("storage: identifier required");
        }
        let mut entries = self.entries.lock();
        Ok(entries
            .entry(key.to_string())
            .or_insert_with(|| record.clone())
            .clone())
    }

    fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.entries.lock().remove(key).is_some())
    }
}

fn identity_from_row(row: &Row<'_>) -> rusqlite::Result<IdentityRecord> {
    let strategy: String = row.get(1)?;
    let created: i64 = row.get(2)?;
    Ok(IdentityRecord {
        identifier: row.get(0)?,
        strategy: DerivationStrategy::from_stored(&strategy),
        created_at: Utc
            .timestamp_opt(created, 0)
            .single()
            .unwrap_or_else(Utc::now),
    })
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at INTEGER NOT NULL
)
"#,
        [],
    )?;

    let current: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    let migrations = migrations();
    for (idx, sql) in migrations.iter().enumerate() {
        let version = (idx + 1) as i64;
        if version <= current {
            continue;
        }
        conn.execute_batch(sql)?;
        conn.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            params![
                version,
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or(Duration::from_secs(0))
                    .as_secs() as i64,
            ],
        )?;
    }
    Ok(())
}

fn migrations() -> Vec<&'static str> {
    vec![
        r#"
CREATE TABLE IF NOT EXISTS identities (
  key TEXT PRIMARY KEY,
  identifier TEXT NOT NULL,
  strategy TEXT NOT NULL,
  created_at INTEGER NOT NULL
);
"#,
    ]
}

pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("movievote").join("state.db"))
}
