pub mod assistants;
pub mod conversation;
pub mod database;
pub mod events;
pub mod files;
pub mod messages;
pub mod naming;
pub mod orchestrator;
pub mod queue;
pub mod settings;
pub mod throttle;
pub mod topic_store;
pub mod topics;

pub use assistants::AssistantService;
pub use database::Database;
pub use events::StoreEvent;
pub use files::FileManager;
pub use messages::{DeleteBy, MessageStore};
pub use naming::TopicNamer;
pub use orchestrator::{Orchestrator, OrchestratorError, ResendTarget, SendOptions};
pub use queue::{QueueError, QueueRegistry, TopicQueue};
pub use settings::{AppSettings, SettingsService, SharedSettings};
pub use topic_store::TopicStore;
pub use topics::TopicManager;
