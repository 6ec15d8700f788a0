pub const DATA_DIR_NAME: &str = "colloquy";
pub const DB_FILE_NAME: &str = "colloquy.db";

pub const DEFAULT_ASSISTANT_ID: &str = "default";
pub const DEFAULT_ASSISTANT_NAME: &str = "Default Assistant";
pub const DEFAULT_TOPIC_NAME: &str = "New Topic";

/// Characters of the first message used as a topic name when LLM naming is off.
pub const FALLBACK_TOPIC_NAME_CHARS: usize = 50;
/// Messages a topic needs before it is auto-named.
pub const AUTO_RENAME_MIN_MESSAGES: usize = 2;
/// Messages fed to the summarizer when naming a topic.
pub const SUMMARY_MESSAGE_WINDOW: usize = 5;

pub const DEFAULT_QUEUE_CONCURRENCY: usize = 4;
pub const DEFAULT_STREAM_THROTTLE_MS: u64 = 100;

pub const DEFAULT_CONTEXT_COUNT: usize = 5;
pub const DEFAULT_MAX_TOKENS: u32 = 4096;
pub const MAX_TOOL_ROUNDS: u32 = 10;

pub const TOPIC_NAMING_PROMPT: &str = "Summarize the conversation into a title of at most 10 words in the conversation's language. Do not use punctuation or quotes. Output only the title.";

pub const SEARCH_SUMMARY_PROMPT: &str = "Transform the user's question into concise search keywords. Output only the keywords, separated by spaces, without explanations or punctuation.";

pub const TRANSLATE_PROMPT: &str = "You are a translation expert. Translate the text enclosed in <translate_input> into {{target_language}}. Output only the translation and keep the original formatting.\n\n<translate_input>\n{{text}}\n</translate_input>";

/// A context count at this value means "send the whole conversation".
pub const UNLIMITED_CONTEXT_COUNT: usize = 20;
