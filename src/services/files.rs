use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;

use super::database::Database;
use crate::models::{FileRecord, FileType, Message};

/// Reference-counted attachment storage. Each message holding a file counts
/// once; the bytes are dropped when the last reference goes.
#[derive(Debug, Clone)]
pub struct FileManager {
    db: Database,
}

impl FileManager {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn add_file(&self, file: &FileRecord, data: Vec<u8>) -> Result<FileRecord> {
        self.db.add_file(file, data).await
    }

    pub async fn add_files(&self, files: Vec<(FileRecord, Vec<u8>)>) -> Result<Vec<FileRecord>> {
        let mut stored = Vec::with_capacity(files.len());
        for (file, data) in files {
            stored.push(self.add_file(&file, data).await?);
        }
        Ok(stored)
    }

    /// Reads a file from disk and stores it as a new attachment.
    pub async fn upload_path(&self, path: &Path) -> Result<FileRecord> {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let origin_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "file".to_string());
        let ext = path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy().to_ascii_lowercase()))
            .unwrap_or_default();
        let id = uuid::Uuid::new_v4().to_string();

        let record = FileRecord {
            name: format!("{}{}", id, ext),
            id,
            origin_name,
            file_type: FileType::from_ext(&ext),
            ext,
            size: data.len() as i64,
            count: 1,
            created_at: Utc::now(),
        };
        self.add_file(&record, data).await
    }

    pub async fn get_file(&self, id: &str) -> Result<Option<FileRecord>> {
        self.db.get_file(id).await
    }

    pub async fn read_file(&self, id: &str) -> Result<Vec<u8>> {
        self.db
            .read_file_data(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("File not found: {}", id))
    }

    pub async fn read_text(&self, id: &str) -> Result<String> {
        let data = self.read_file(id).await?;
        Ok(String::from_utf8_lossy(&data).into_owned())
    }

    pub async fn delete_file(&self, id: &str, force: bool) -> Result<()> {
        if self.db.release_file(id, force).await? {
            tracing::debug!("Deleted file {}", id);
        }
        Ok(())
    }

    pub async fn delete_files(&self, files: &[FileRecord]) -> Result<()> {
        for file in files {
            self.delete_file(&file.id, false).await?;
        }
        Ok(())
    }

    /// Releases every file referenced by the given messages. Failures are
    /// logged per file so one bad row does not keep the others alive.
    pub async fn delete_message_files(&self, messages: &[Message]) {
        for file in messages.iter().flat_map(|m| m.files.iter()) {
            if let Err(e) = self.delete_file(&file.id, false).await {
                tracing::warn!("Failed to release file {}: {}", file.id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> FileManager {
        FileManager::new(Database::new_in_memory().unwrap())
    }

    #[tokio::test]
    async fn test_upload_and_read_text() {
        let dir = std::env::temp_dir().join(format!("colloquy-files-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("notes.TXT");
        std::fs::write(&path, "line one").unwrap();

        let files = manager();
        let record = files.upload_path(&path).await.unwrap();
        assert_eq!(record.ext, ".txt");
        assert_eq!(record.file_type, FileType::Text);
        assert_eq!(record.origin_name, "notes.TXT");
        assert_eq!(files.read_text(&record.id).await.unwrap(), "line one");

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_shared_file_survives_until_last_message_goes() {
        let files = manager();
        let dir = std::env::temp_dir().join(format!("colloquy-files-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("cat.png");
        std::fs::write(&path, [1u8, 2, 3]).unwrap();
        let record = files.upload_path(&path).await.unwrap();
        files.add_file(&record, vec![1, 2, 3]).await.unwrap();

        let mut first = Message::user("a", "t", "look");
        first.files.push(record.clone());
        let mut second = Message::user("a", "t", "again");
        second.files.push(record.clone());

        files.delete_message_files(&[first]).await;
        assert_eq!(files.get_file(&record.id).await.unwrap().unwrap().count, 1);

        files.delete_message_files(&[second]).await;
        assert!(files.get_file(&record.id).await.unwrap().is_none());
        assert!(files.read_file(&record.id).await.is_err());

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
