use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    Image,
    Text,
    Document,
    Other,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Image => "image",
            FileType::Text => "text",
            FileType::Document => "document",
            FileType::Other => "other",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "image" => Some(FileType::Image),
            "text" => Some(FileType::Text),
            "document" => Some(FileType::Document),
            "other" => Some(FileType::Other),
            _ => None,
        }
    }

    pub fn from_ext(ext: &str) -> Self {
        match ext.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "png" | "jpg" | "jpeg" | "gif" | "webp" | "bmp" => FileType::Image,
            "txt" | "md" | "json" | "csv" | "rs" | "ts" | "js" | "py" | "toml" | "yaml" | "yml"
            | "html" | "xml" | "log" => FileType::Text,
            "pdf" | "doc" | "docx" | "odt" | "rtf" => FileType::Document,
            _ => FileType::Other,
        }
    }
}

/// Metadata for an attached file. The bytes live in the files table and are
/// shared between messages; `count` is the number of messages referencing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: String,
    pub name: String,
    pub origin_name: String,
    pub ext: String,
    pub file_type: FileType,
    pub size: i64,
    pub count: i64,
    pub created_at: DateTime<Utc>,
}

impl FileRecord {
    pub fn mime_type(&self) -> &'static str {
        match self.ext.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "png" => "image/png",
            "jpg" | "jpeg" => "image/jpeg",
            "gif" => "image/gif",
            "webp" => "image/webp",
            "bmp" => "image/bmp",
            _ => "application/octet-stream",
        }
    }
}
