//! 会话持久化：记录存储后端与会话存储

pub mod artifact;
pub mod file;
pub mod memory;
pub mod store;

pub use artifact::{ArtifactStore, ArtifactSummary, Manifest, Version};
pub use file::FileArtifactStore;
pub use memory::MemoryArtifactStore;
pub use store::{fallback_title, SessionStore, SessionSummary, MESSAGES_FILE};
