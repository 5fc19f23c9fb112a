// Credential persistence in a SQLite key/value table

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

use super::store::CredentialStore;
use super::types::{CredentialPair, StoredTokens};

const TOKENS_KEY: &str = "session:tokens";

/// Credential store backed by an `auth_kv` table.
///
/// The whole pair lives under one key, so every write and clear is a single
/// statement and readers never observe a half-written pair.
///
/// The pair is read from disk once when the store is opened and cached;
/// `get` never touches SQLite, while `set` and `clear` write through
/// synchronously. Writes only happen on login, refresh and logout.
pub struct SqliteCredentialStore {
    conn: Mutex<Connection>,
    cached: RwLock<Option<CredentialPair>>,
}

impl SqliteCredentialStore {
    /// Open (or create) the database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create directory: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database: {}", path.display()))?;

        Self::with_connection(conn)
    }

    /// In-memory database, gone when the store is dropped
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory SQLite")?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS auth_kv (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
            [],
        )
        .context("Failed to create auth_kv table")?;

        let store = Self {
            conn: Mutex::new(conn),
            cached: RwLock::new(None),
        };

        let pair = match store.load() {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!("Treating stored credentials as absent: {:#}", e);
                None
            }
        };
        *store.cached.write() = pair;

        Ok(store)
    }

    fn load(&self) -> Result<Option<CredentialPair>> {
        let conn = self.conn.lock();
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM auth_kv WHERE key = ?",
                [TOKENS_KEY],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to load tokens from SQLite")?;

        let Some(value) = value else {
            return Ok(None);
        };

        let stored: StoredTokens =
            serde_json::from_str(&value).context("Failed to parse stored tokens")?;

        match (stored.access_token, stored.refresh_token) {
            (Some(access), Some(refresh)) => Ok(CredentialPair::new(access, refresh)),
            _ => Ok(None),
        }
    }

    fn save(&self, pair: &CredentialPair) -> Result<()> {
        let record = StoredTokens {
            access_token: Some(pair.access_token().to_string()),
            refresh_token: Some(pair.refresh_token().to_string()),
            updated_at: Some(Utc::now()),
        };
        let value = serde_json::to_string(&record).context("Failed to serialize tokens")?;

        self.conn
            .lock()
            .execute(
                "INSERT OR REPLACE INTO auth_kv (key, value) VALUES (?1, ?2)",
                [TOKENS_KEY, value.as_str()],
            )
            .context("Failed to save tokens to SQLite")?;

        Ok(())
    }

    fn remove(&self) -> Result<()> {
        self.conn
            .lock()
            .execute("DELETE FROM auth_kv WHERE key = ?", [TOKENS_KEY])
            .context("Failed to delete tokens from SQLite")?;
        Ok(())
    }
}

impl CredentialStore for SqliteCredentialStore {
    fn get(&self) -> Option<CredentialPair> {
        self.cached.read().clone()
    }

    fn set(&self, pair: CredentialPair) {
        // Held across the write so the cache and the table change together
        let mut cached = self.cached.write();
        if let Err(e) = self.save(&pair) {
            tracing::error!("Error saving tokens: {:#}", e);
        }
        *cached = Some(pair);
    }

    fn clear(&self) {
        let mut cached = self.cached.write();
        if let Err(e) = self.remove() {
            tracing::error!("Error clearing tokens: {:#}", e);
        }
        *cached = None;
    }
}
