pub mod registry;
#[cfg(test)]
pub mod testing;
pub mod types;

pub use registry::ToolRegistry;
pub use types::Tool;
