use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::task;

use super::topic_store::{StoredTopic, TopicStore};
use crate::config;
use crate::models::{FileRecord, FileType, Message};

#[derive(Debug, Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

fn lock(conn: &Mutex<Connection>) -> MutexGuard<'_, Connection> {
    conn.lock().unwrap_or_else(|e| e.into_inner())
}

impl Database {
    /// Opens (creating if needed) the database at `path`, or at the default
    /// per-user location.
    pub async fn open(path: Option<PathBuf>) -> Result<Self> {
        let path = match path {
            Some(path) => path,
            None => Self::default_path()?,
        };
        task::spawn_blocking(move || Self::open_blocking(&path)).await?
    }

    fn open_blocking(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create data directory: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        tracing::debug!("Opened database at {}", path.display());

        Ok(db)
    }

    pub fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    pub fn default_path() -> Result<PathBuf> {
        let data_dir = match std::env::var("XDG_DATA_HOME") {
            Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => {
                let home = std::env::var("HOME").context("HOME not set")?;
                PathBuf::from(home).join(".local/share")
            }
        };
        Ok(data_dir
            .join(config::DATA_DIR_NAME)
            .join(config::DB_FILE_NAME))
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = lock(&self.conn);

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER NOT NULL
            );",
        )?;

        let version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if version < 1 {
            conn.execute_batch(
                "CREATE TABLE topics (
                    id TEXT PRIMARY KEY,
                    messages TEXT NOT NULL DEFAULT '[]'
                );

                CREATE TABLE IF NOT EXISTS settings (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                );

                INSERT INTO schema_version (version) VALUES (1);",
            )?;
        }

        if version < 2 {
            conn.execute_batch(
                "CREATE TABLE files (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    origin_name TEXT NOT NULL,
                    ext TEXT NOT NULL,
                    file_type TEXT NOT NULL,
                    size BIGINT NOT NULL,
                    count INTEGER NOT NULL DEFAULT 1,
                    data BLOB NOT NULL,
                    created_at TEXT NOT NULL
                );

                UPDATE schema_version SET version = 2;",
            )?;
        }

        Ok(())
    }

    // --- Topics ---

    pub async fn get_topic_messages(&self, topic_id: &str) -> Result<Option<Vec<Message>>> {
        let conn = self.conn.clone();
        let topic_id = topic_id.to_string();
        task::spawn_blocking(move || {
            let conn = lock(&conn);
            let json: Option<String> = conn
                .query_row(
                    "SELECT messages FROM topics WHERE id = ?1",
                    params![topic_id],
                    |row| row.get(0),
                )
                .optional()?;
            match json {
                Some(json) => {
                    let messages = serde_json::from_str(&json).with_context(|| {
                        format!("Corrupt message list for topic {}", topic_id)
                    })?;
                    Ok(Some(messages))
                }
                None => Ok(None),
            }
        })
        .await?
    }

    pub async fn put_topic_messages(&self, topic_id: &str, messages: &[Message]) -> Result<()> {
        let conn = self.conn.clone();
        let topic_id = topic_id.to_string();
        let json = serde_json::to_string(messages)?;
        task::spawn_blocking(move || {
            let conn = lock(&conn);
            conn.execute(
                "INSERT INTO topics (id, messages) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET messages = ?2",
                params![topic_id, json],
            )?;
            Ok(())
        })
        .await?
    }

    pub async fn insert_topic(&self, topic_id: &str, messages: &[Message]) -> Result<()> {
        let conn = self.conn.clone();
        let topic_id = topic_id.to_string();
        let json = serde_json::to_string(messages)?;
        task::spawn_blocking(move || {
            let conn = lock(&conn);
            conn.execute(
                "INSERT INTO topics (id, messages) VALUES (?1, ?2)",
                params![topic_id, json],
            )
            .with_context(|| format!("Topic {} already exists", topic_id))?;
            Ok(())
        })
        .await?
    }

    pub async fn delete_topic(&self, topic_id: &str) -> Result<()> {
        let conn = self.conn.clone();
        let topic_id = topic_id.to_string();
        task::spawn_blocking(move || {
            let conn = lock(&conn);
            conn.execute("DELETE FROM topics WHERE id = ?1", params![topic_id])?;
            Ok(())
        })
        .await?
    }

    pub async fn list_topic_ids(&self) -> Result<Vec<String>> {
        let conn = self.conn.clone();
        task::spawn_blocking(move || {
            let conn = lock(&conn);
            let mut stmt = conn.prepare("SELECT id FROM topics ORDER BY id")?;
            let ids = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(ids)
        })
        .await?
    }

    // --- Files ---

    /// Stores a new file, or bumps the reference count of an existing one.
    /// Returns the stored record.
    pub async fn add_file(&self, file: &FileRecord, data: Vec<u8>) -> Result<FileRecord> {
        let conn = self.conn.clone();
        let file = file.clone();
        task::spawn_blocking(move || {
            let conn = lock(&conn);
            let updated = conn.execute(
                "UPDATE files SET count = count + 1 WHERE id = ?1",
                params![file.id],
            )?;
            if updated == 0 {
                conn.execute(
                    "INSERT INTO files (id, name, origin_name, ext, file_type, size, count, data, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?8)",
                    params![
                        file.id,
                        file.name,
                        file.origin_name,
                        file.ext,
                        file.file_type.as_str(),
                        file.size,
                        data,
                        file.created_at.to_rfc3339(),
                    ],
                )?;
            }
            Self::query_file(&conn, &file.id)?
                .ok_or_else(|| anyhow::anyhow!("File {} vanished after insert", file.id))
        })
        .await?
    }

    pub async fn get_file(&self, id: &str) -> Result<Option<FileRecord>> {
        let conn = self.conn.clone();
        let id = id.to_string();
        task::spawn_blocking(move || {
            let conn = lock(&conn);
            Self::query_file(&conn, &id)
        })
        .await?
    }

    pub async fn read_file_data(&self, id: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.clone();
        let id = id.to_string();
        task::spawn_blocking(move || {
            let conn = lock(&conn);
            let data = conn
                .query_row("SELECT data FROM files WHERE id = ?1", params![id], |row| {
                    row.get(0)
                })
                .optional()?;
            Ok(data)
        })
        .await?
    }

    /// Drops one reference. The row is removed when the count reaches zero or
    /// when `force` is set. Returns whether the row was removed.
    pub async fn release_file(&self, id: &str, force: bool) -> Result<bool> {
        let conn = self.conn.clone();
        let id = id.to_string();
        task::spawn_blocking(move || {
            let conn = lock(&conn);
            let count: Option<i64> = conn
                .query_row("SELECT count FROM files WHERE id = ?1", params![id], |row| {
                    row.get(0)
                })
                .optional()?;
            match count {
                None => Ok(false),
                Some(count) if force || count <= 1 => {
                    conn.execute("DELETE FROM files WHERE id = ?1", params![id])?;
                    Ok(true)
                }
                Some(_) => {
                    conn.execute(
                        "UPDATE files SET count = count - 1 WHERE id = ?1",
                        params![id],
                    )?;
                    Ok(false)
                }
            }
        })
        .await?
    }

    fn query_file(conn: &Connection, id: &str) -> Result<Option<FileRecord>> {
        let mut stmt = conn.prepare(
            "SELECT id, name, origin_name, ext, file_type, size, count, created_at
             FROM files WHERE id = ?1",
        )?;
        let result = stmt
            .query_row(params![id], |row| Ok(Self::row_to_file(row)))
            .optional()?;
        result.transpose()
    }

    // --- Settings ---

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.clone();
        let key = key.to_string();
        task::spawn_blocking(move || {
            let conn = lock(&conn);
            let result = conn
                .query_row(
                    "SELECT value FROM settings WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(result)
        })
        .await?
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.clone();
        let key = key.to_string();
        let value = value.to_string();
        task::spawn_blocking(move || {
            let conn = lock(&conn);
            conn.execute(
                "INSERT INTO settings (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = ?2",
                params![key, value],
            )?;
            Ok(())
        })
        .await?
    }

    // --- Row helpers ---

    fn row_to_file(row: &rusqlite::Row) -> Result<FileRecord> {
        let type_str: String = row.get(4)?;
        let created_str: String = row.get(7)?;

        Ok(FileRecord {
            id: row.get(0)?,
            name: row.get(1)?,
            origin_name: row.get(2)?,
            ext: row.get(3)?,
            file_type: FileType::from_str(&type_str)
                .ok_or_else(|| anyhow::anyhow!("Unknown file type: {}", type_str))?,
            size: row.get(5)?,
            count: row.get(6)?,
            created_at: DateTime::parse_from_rfc3339(&created_str)?.with_timezone(&Utc),
        })
    }
}

#[async_trait]
impl TopicStore for Database {
    async fn get(&self, topic_id: &str) -> Result<Option<StoredTopic>> {
        Ok(self
            .get_topic_messages(topic_id)
            .await?
            .map(|messages| StoredTopic {
                id: topic_id.to_string(),
                messages,
            }))
    }

    async fn update(&self, topic_id: &str, messages: &[Message]) -> Result<()> {
        self.put_topic_messages(topic_id, messages).await
    }

    async fn add(&self, topic: &StoredTopic) -> Result<()> {
        self.insert_topic(&topic.id, &topic.messages).await
    }

    async fn delete(&self, topic_id: &str) -> Result<()> {
        self.delete_topic(topic_id).await
    }
}
