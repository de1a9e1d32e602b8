//! facepass-store: SQLite persistence for the enrollment roster.
//!
//! Implements [`RosterStore`] over a single database file. The whole roster is
//! rewritten inside one transaction on every save, so a crash mid-save leaves
//! the previous roster intact.

use facepass_core::{Embedding, EncodedImage, Identity, PersistenceError, RosterStore};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

const ACTIVE_IDENTITY_KEY: &str = "active_identity_id";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS identities (
    position        INTEGER NOT NULL,
    id              TEXT PRIMARY KEY,
    display_name    TEXT NOT NULL,
    email           TEXT NOT NULL,
    raw_mime        TEXT NOT NULL,
    raw_image       BLOB NOT NULL,
    enhanced_mime   TEXT NOT NULL,
    enhanced_image  BLOB NOT NULL,
    embedding       BLOB NOT NULL,
    model_version   TEXT,
    is_privileged   INTEGER NOT NULL,
    enrolled_at     TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS settings (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to create database directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("embedding for identity {id} is {len} bytes, not a whole number of f32 values")]
    BadEmbedding { id: String, len: usize },
}

impl From<StoreError> for PersistenceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::BadEmbedding { .. } => PersistenceError::Corrupt(err.to_string()),
            other => PersistenceError::Backend(Box::new(other)),
        }
    }
}

pub struct SqliteRosterStore {
    conn: Mutex<Connection>,
}

impl SqliteRosterStore {
    /// Open or create the database at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        tracing::info!(path = %path.display(), "roster database opened");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_roster(&self) -> Result<Vec<Identity>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, display_name, email, raw_mime, raw_image, enhanced_mime, enhanced_image,
                    embedding, model_version, is_privileged, enrolled_at
             FROM identities ORDER BY position",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(StoredIdentity {
                id: row.get(0)?,
                display_name: row.get(1)?,
                email: row.get(2)?,
                raw_image: EncodedImage {
                    mime: row.get(3)?,
                    bytes: row.get(4)?,
                },
                enhanced_image: EncodedImage {
                    mime: row.get(5)?,
                    bytes: row.get(6)?,
                },
                embedding: row.get(7)?,
                model_version: row.get(8)?,
                is_privileged: row.get(9)?,
                enrolled_at: row.get(10)?,
            })
        })?;

        let mut roster = Vec::new();
        for row in rows {
            roster.push(row?.into_identity()?);
        }
        Ok(roster)
    }

    fn write_roster(&self, roster: &[Identity]) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM identities", [])?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO identities (position, id, display_name, email, raw_mime, raw_image,
                                         enhanced_mime, enhanced_image, embedding, model_version,
                                         is_privileged, enrolled_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            )?;
            for (position, identity) in roster.iter().enumerate() {
                insert.execute(params![
                    position as i64,
                    identity.id,
                    identity.display_name,
                    identity.email,
                    identity.raw_image.mime,
                    identity.raw_image.bytes,
                    identity.enhanced_image.mime,
                    identity.enhanced_image.bytes,
                    encode_embedding(&identity.embedding),
                    identity.embedding.model_version(),
                    identity.is_privileged,
                    identity.enrolled_at,
                ])?;
            }
        }
        tx.commit()?;
        tracing::debug!(count = roster.len(), "roster saved");
        Ok(())
    }

    fn read_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .conn()
            .query_row("SELECT value FROM settings WHERE key = ?1", [key], |row| row.get(0))
            .optional()?)
    }

    fn write_setting(&self, key: &str, value: Option<&str>) -> Result<(), StoreError> {
        let conn = self.conn();
        match value {
            Some(value) => conn.execute(
                "INSERT INTO settings (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?,
            None => conn.execute("DELETE FROM settings WHERE key = ?1", [key])?,
        };
        Ok(())
    }
}

impl RosterStore for SqliteRosterStore {
    fn load_roster(&self) -> Result<Vec<Identity>, PersistenceError> {
        Ok(self.read_roster()?)
    }

    fn save_roster(&self, roster: &[Identity]) -> Result<(), PersistenceError> {
        Ok(self.write_roster(roster)?)
    }

    fn load_active_identity_id(&self) -> Result<Option<String>, PersistenceError> {
        Ok(self.read_setting(ACTIVE_IDENTITY_KEY)?)
    }

    fn save_active_identity_id(&self, id: Option<&str>) -> Result<(), PersistenceError> {
        Ok(self.write_setting(ACTIVE_IDENTITY_KEY, id)?)
    }
}

struct StoredIdentity {
    id: String,
    display_name: String,
    email: String,
    raw_image: EncodedImage,
    enhanced_image: EncodedImage,
    embedding: Vec<u8>,
    model_version: Option<String>,
    is_privileged: bool,
    enrolled_at: String,
}

impl StoredIdentity {
    fn into_identity(self) -> Result<Identity, StoreError> {
        let values = decode_embedding(&self.embedding).ok_or_else(|| StoreError::BadEmbedding {
            id: self.id.clone(),
            len: self.embedding.len(),
        })?;
        let mut embedding = Embedding::new(values);
        if let Some(version) = self.model_version {
            embedding = embedding.with_model_version(version);
        }
        Ok(Identity {
            id: self.id,
            display_name: self.display_name,
            email: self.email,
            raw_image: self.raw_image,
            enhanced_image: self.enhanced_image,
            embedding,
            is_privileged: self.is_privileged,
            enrolled_at: self.enrolled_at,
        })
    }
}

/// Little-endian f32 values, back to back.
fn encode_embedding(embedding: &Embedding) -> Vec<u8> {
    embedding
        .as_slice()
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect()
}

fn decode_embedding(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    )
}
