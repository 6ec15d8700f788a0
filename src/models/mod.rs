pub mod assistant;
pub mod file;
pub mod message;
pub mod provider;
pub mod topic;

pub use assistant::{Assistant, AssistantSettings};
pub use file::{FileRecord, FileType};
pub use message::{
    McpToolResponse, Message, MessageError, MessageKind, MessageStatus, MessageUpdate, Metrics,
    Role, ToolResponseStatus, Usage,
};
pub use provider::{KeyRotation, Model, ProviderConfig, ProviderKind};
pub use topic::Topic;
