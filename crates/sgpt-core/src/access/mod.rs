//! ============================================================================
//! Access Module - Who may use the bot
//! ============================================================================
//! - **Allow-list**: when configured, only listed ids (and the administrator)
//!   get any reply beyond a fixed denial
//! - **Blocked users**: may read `/usage` and `/about`, nothing else
//! - **Administrator**: the configured id, always allowed, may run `/allow`,
//!   `/deny` and `/users`
//! ============================================================================

mod gate;

pub use gate::{AccessGate, ADMIN_ONLY_MESSAGE, BLOCKED_MESSAGE, NOT_ALLOWED_MESSAGE};
