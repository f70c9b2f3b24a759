use std::{
    collections::BTreeMap,
    future::Future,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::Context as _;
use rusqlite::{Connection, OpenFlags, OptionalExtension as _, params};

use crate::{
    config::{StoreBackend, StoreConfig},
    descriptor::ConnectionRecord,
};

const SCHEMA_VERSION: i32 = 1;
const FIXTURE_FILE_EXTENSION: &str = "json";
pub const FIXTURES_DB_FILENAME: &str = "fixtures.db";

/// Key-value persistence for fixtures.
///
/// Each operation must be linearizable per key; the engine never relies on
/// `get` followed by `set` being atomic.
pub trait FixtureStore: Send + Sync {
    fn get(&self, key: &str)
    -> impl Future<Output = anyhow::Result<Option<ConnectionRecord>>> + Send;

    fn set(
        &self,
        key: &str,
        record: ConnectionRecord,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Deleting a key that does not exist succeeds.
    fn delete(&self, key: &str) -> impl Future<Output = anyhow::Result<()>> + Send;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixtureKeyError {
    reason: String,
}

impl std::fmt::Display for FixtureKeyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.reason)
    }
}

impl std::error::Error for FixtureKeyError {}

/// Keys become file names, so anything that could escape the fixture
/// directory is rejected.
pub fn validate_fixture_key(key: &str) -> Result<(), FixtureKeyError> {
    let reason = if key.is_empty() {
        "fixture key cannot be empty"
    } else if key.contains('/') || key.contains('\\') {
        "fixture key cannot contain path separators"
    } else if key == "." || key == ".." {
        "fixture key cannot be `.` or `..`"
    } else if key.contains('\0') {
        "fixture key cannot contain NUL bytes"
    } else {
        return Ok(());
    };
    Err(FixtureKeyError {
        reason: reason.to_owned(),
    })
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<String, ConnectionRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, ConnectionRecord>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl FixtureStore for MemoryStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<ConnectionRecord>> {
        Ok(self.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, record: ConnectionRecord) -> anyhow::Result<()> {
        self.lock().insert(key.to_owned(), record);
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.lock().remove(key);
        Ok(())
    }
}

/// One pretty-printed JSON file per fixture, named `<key>.json`.
#[derive(Debug)]
pub struct DirectoryStore {
    dir: PathBuf,
    temp_counter: AtomicU64,
}

impl DirectoryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            temp_counter: AtomicU64::new(0),
        }
    }

    pub fn fixture_path(&self, key: &str) -> anyhow::Result<PathBuf> {
        validate_fixture_key(key)?;
        Ok(self.dir.join(format!("{key}.{FIXTURE_FILE_EXTENSION}")))
    }
}

impl FixtureStore for DirectoryStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<ConnectionRecord>> {
        let path = self.fixture_path(key)?;
        let json = match tokio::fs::read_to_string(&path).await {
            Ok(json) => json,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("read fixture {}", path.display()));
            }
        };
        ConnectionRecord::from_json(&json)
            .map(Some)
            .with_context(|| format!("parse fixture {}", path.display()))
    }

    async fn set(&self, key: &str, record: ConnectionRecord) -> anyhow::Result<()> {
        let path = self.fixture_path(key)?;
        let json = record.to_json().context("serialize fixture")?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("create fixture dir {}", self.dir.display()))?;

        // Rename into place so readers never observe a half-written fixture.
        let temp_path = self.dir.join(format!(
            ".{key}.{}.{}.tmp",
            std::process::id(),
            self.temp_counter.fetch_add(1, Ordering::Relaxed)
        ));
        tokio::fs::write(&temp_path, json)
            .await
            .with_context(|| format!("write fixture {}", temp_path.display()))?;
        if let Err(err) = tokio::fs::rename(&temp_path, &path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| format!("move fixture into {}", path.display()));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        let path = self.fixture_path(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("delete fixture {}", path.display())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    db_path: PathBuf,
}

impl SqliteStore {
    pub fn open(db_path: PathBuf) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create storage dir {}", parent.display()))?;
        }

        let store = Self { db_path };
        let mut conn = open_connection(&store.db_path)?;
        migrate(&mut conn)?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }
}

impl FixtureStore for SqliteStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<ConnectionRecord>> {
        let db_path = self.db_path.clone();
        let key = key.to_owned();
        tokio::task::spawn_blocking(move || get_fixture_blocking(&db_path, &key))
            .await
            .context("join get_fixture task")?
    }

    async fn set(&self, key: &str, record: ConnectionRecord) -> anyhow::Result<()> {
        let db_path = self.db_path.clone();
        let key = key.to_owned();
        tokio::task::spawn_blocking(move || set_fixture_blocking(&db_path, &key, &record))
            .await
            .context("join set_fixture task")?
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        let db_path = self.db_path.clone();
        let key = key.to_owned();
        tokio::task::spawn_blocking(move || delete_fixture_blocking(&db_path, &key))
            .await
            .context("join delete_fixture task")?
    }
}

fn open_connection(path: &Path) -> anyhow::Result<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(path, flags)
        .with_context(|| format!("open sqlite {}", path.display()))?;

    conn.pragma_update(None, "journal_mode", "WAL")
        .context("set PRAGMA journal_mode=WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .context("set PRAGMA synchronous=NORMAL")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .context("set sqlite busy_timeout")?;

    Ok(conn)
}

fn migrate(conn: &mut Connection) -> anyhow::Result<()> {
    let user_version: i32 = conn
        .query_row("PRAGMA user_version;", [], |row| row.get(0))
        .context("read PRAGMA user_version")?;

    match user_version {
        0 => {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS fixtures (
                  key TEXT PRIMARY KEY NOT NULL,
                  record_json TEXT NOT NULL
                );
                "#,
            )
            .context("create sqlite schema v1")?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)
                .context("set PRAGMA user_version=1")?;
            Ok(())
        }
        SCHEMA_VERSION => Ok(()),
        _ => anyhow::bail!(
            "unsupported {FIXTURES_DB_FILENAME} schema version {user_version} (expected {SCHEMA_VERSION})"
        ),
    }
}

fn get_fixture_blocking(path: &Path, key: &str) -> anyhow::Result<Option<ConnectionRecord>> {
    let conn = open_connection(path)?;
    let record_json: Option<String> = conn
        .query_row(
            "SELECT record_json FROM fixtures WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .context("select fixture by key")?;

    record_json
        .map(|json| {
            ConnectionRecord::from_json(&json).with_context(|| format!("parse fixture `{key}`"))
        })
        .transpose()
}

fn set_fixture_blocking(path: &Path, key: &str, record: &ConnectionRecord) -> anyhow::Result<()> {
    let conn = open_connection(path)?;
    let record_json = serde_json::to_string(record).context("serialize fixture")?;
    conn.execute(
        r#"
        INSERT INTO fixtures (key, record_json) VALUES (?1, ?2)
        ON CONFLICT(key) DO UPDATE SET record_json = excluded.record_json
        "#,
        params![key, record_json],
    )
    .context("upsert fixture")?;
    Ok(())
}

fn delete_fixture_blocking(path: &Path, key: &str) -> anyhow::Result<()> {
    let conn = open_connection(path)?;
    conn.execute("DELETE FROM fixtures WHERE key = ?1", params![key])
        .context("delete fixture")?;
    Ok(())
}

/// Store selected at runtime from configuration.
#[derive(Debug)]
pub enum ConfiguredStore {
    Memory(MemoryStore),
    Directory(DirectoryStore),
    Sqlite(SqliteStore),
}

impl ConfiguredStore {
    pub fn from_config(config: &StoreConfig) -> anyhow::Result<Self> {
        match config.backend {
            StoreBackend::Memory => Ok(Self::Memory(MemoryStore::new())),
            StoreBackend::Directory => {
                let path = config
                    .path
                    .clone()
                    .context("store.path is required for the directory backend")?;
                Ok(Self::Directory(DirectoryStore::new(path)))
            }
            StoreBackend::Sqlite => {
                let path = config
                    .path
                    .clone()
                    .context("store.path is required for the sqlite backend")?;
                let db_path = if path.extension().is_some() {
                    path
                } else {
                    path.join(FIXTURES_DB_FILENAME)
                };
                Ok(Self::Sqlite(SqliteStore::open(db_path)?))
            }
        }
    }
}

impl FixtureStore for ConfiguredStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<ConnectionRecord>> {
        match self {
            Self::Memory(store) => store.get(key).await,
            Self::Directory(store) => store.get(key).await,
            Self::Sqlite(store) => store.get(key).await,
        }
    }

    async fn set(&self, key: &str, record: ConnectionRecord) -> anyhow::Result<()> {
        match self {
            Self::Memory(store) => store.set(key, record).await,
            Self::Directory(store) => store.set(key, record).await,
            Self::Sqlite(store) => store.set(key, record).await,
        }
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        match self {
            Self::Memory(store) => store.delete(key).await,
            Self::Directory(store) => store.delete(key).await,
            Self::Sqlite(store) => store.delete(key).await,
        }
    }
}
