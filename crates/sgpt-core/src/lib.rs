//! ============================================================================
//! SGPT-CORE: Sessions and memory for a multi-tenant chat assistant
//! ============================================================================
//! This crate handles all backend logic for the SGPT bot:
//! - Per-user sessions: commands, access control, conversation limits
//! - Retrieval-augmented memory: chunking, Qdrant indexing, cached recall
//! - Model providers (OpenAI, Anthropic, Gemini) behind one trait
//! - Durable user records in redb
//! ============================================================================

pub mod access;
pub mod chunker;
pub mod config;
pub mod db;
pub mod links;
pub mod memory;
pub mod provider;
pub mod session;
pub mod speech;
pub mod types;

#[cfg(test)]
mod testing;

// Re-export main types for convenience
pub use types::*;
pub use access::AccessGate;
pub use config::BotConfig;
pub use db::{RedbUserStore, UserStore};
pub use session::{Attachment, InboundMessage, Reply, SessionDispatcher, SessionSettings};
