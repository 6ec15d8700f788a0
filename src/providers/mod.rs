pub mod abort;
pub mod anthropic;
pub mod completion;
#[cfg(test)]
pub mod fake;
mod http;
pub mod openai;
pub mod registry;
mod sse;
pub mod traits;
pub mod types;

pub use abort::AbortRegistry;
pub use registry::{create_provider, ProviderRegistry};
pub use traits::AiProvider;
pub use types::{
    ChatMessage, ChatRequest, CompletionChunk, CompletionsParams, ImageAttachment, ProviderError,
    StreamEvent,
};
