//! Embedded SQLite store backing the chain engine.
use std::{
    path::{Path, PathBuf},
    str::FromStr,
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use bitcoin::BlockHash;
use rusqlite::{params, Connection, OpenFlags};
use tokio::task;

use crate::store::Store;

const SCHEMA: &str = r#"
    PRAGMA journal_mode=WAL;
    PRAGMA synchronous=NORMAL;

    CREATE TABLE IF NOT EXISTS state (
        key   TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
"#;

/// Simple key/value table:
///   state(key TEXT PRIMARY KEY, value TEXT NOT NULL)
///
/// Keys used:
///  - cf_tip_height  : u32 decimal string
///  - cf_tip_hash    : hex BlockHash
///
/// Cloning shares the connection; [`Store::close`] closes it for every clone.
#[derive(Clone)]
pub struct SqliteStore {
    path: PathBuf,
    conn: Arc<Mutex<Option<Connection>>>,
}

impl SqliteStore {
    /// Open the store file at `path`, creating it when missing, and apply the schema.
    pub fn create(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let conn = Connection::open(&path)
            .with_context(|| format!("create sqlite at {}", path.display()))?;
        Self::init(path, conn)
    }

    /// Open an existing store file. Fails if `path` does not exist.
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let conn = Connection::open_with_flags(&path, OpenFlags::SQLITE_OPEN_READ_WRITE)
            .with_context(|| format!("open sqlite at {}", path.display()))?;
        Self::init(path, conn)
    }

    /// Open the store file if present, else create it.
    pub fn open_or_create(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        if path.exists() {
            Self::open(path)
        } else {
            Self::create(path)
        }
    }

    fn init(path: PathBuf, conn: Connection) -> anyhow::Result<Self> {
        conn.execute_batch(SCHEMA)
            .with_context(|| format!("init schema at {}", path.display()))?;
        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    /// Location of the store file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether [`Store::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.conn.lock().map(|c| c.is_none()).unwrap_or(true)
    }

    /// Run `f` against the open connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> anyhow::Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        let path = self.path.clone();
        task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| anyhow!("sqlite connection lock poisoned"))?;
            let conn = guard
                .as_ref()
                .ok_or_else(|| anyhow!("store {} is closed", path.display()))?;
            f(conn)
        })
        .await?
    }

    fn kv_get(conn: &Connection, key: &str) -> anyhow::Result<Option<String>> {
        let mut stmt = conn.prepare("SELECT value FROM state WHERE key = ?1")?;
        let mut rows = stmt.query(params![key])?;
        if let Some(row) = rows.next()? {
            let v: String = row.get(0)?;
            Ok(Some(v))
        } else {
            Ok(None)
        }
    }

    fn kv_set(conn: &Connection, key: &str, val: &str) -> anyhow::Result<()> {
        conn.execute(
            "INSERT INTO state(key,value) VALUES(?1,?2)
             ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![key, val],
        )?;
        Ok(())
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn load_cf_tip(&self) -> anyhow::Result<Option<(u32, BlockHash)>> {
        self.with_conn(|conn| {
            let h = Self::kv_get(conn, "cf_tip_height")?;
            let hh = Self::kv_get(conn, "cf_tip_hash")?;
            match (h, hh) {
                (Some(hs), Some(hh)) => {
                    let height: u32 = hs.parse().context("parse cf_tip_height")?;
                    let hash = BlockHash::from_str(&hh).context("parse cf_tip_hash")?;
                    Ok(Some((height, hash)))
                }
                _ => Ok(None),
            }
        })
        .await
    }

    async fn save_cf_tip(&self, height: u32, cfheader: BlockHash) -> anyhow::Result<()> {
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            Self::kv_set(conn, "cf_tip_height", &height.to_string())?;
            Self::kv_set(conn, "cf_tip_hash", &cfheader.to_string())?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn close(&self) -> anyhow::Result<()> {
        let conn = self.conn.clone();
        let path = self.path.clone();
        task::spawn_blocking(move || {
            let taken = conn
                .lock()
                .map_err(|_| anyhow!("sqlite connection lock poisoned"))?
                .take();
            match taken {
                Some(c) => c
                    .close()
                    .map_err(|(_, e)| e)
                    .with_context(|| format!("close sqlite at {}", path.display())),
                None => Ok(()),
            }
        })
        .await?
    }
}
