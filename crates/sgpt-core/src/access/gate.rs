//! ============================================================================
//! Access Gate - Allow-list, administrator and blocked-user checks
//! ============================================================================

use std::collections::HashSet;
use tracing::{debug, warn};

use crate::types::{BotError, UserRecord};

pub const NOT_ALLOWED_MESSAGE: &str = "You don't have privileges to use this bot.";
pub const BLOCKED_MESSAGE: &str = "You are blocked. Wait for some time and try again.";
pub const ADMIN_ONLY_MESSAGE: &str = "This command requires administrator privileges.";

/// Who may talk to the bot and who may administer it
#[derive(Debug, Clone, Default)]
pub struct AccessGate {
    admin_id: Option<i64>,
    /// None admits everyone
    allowed_ids: Option<HashSet<i64>>,
    new_users_blocked: bool,
}

impl AccessGate {
    pub fn new(admin_id: Option<i64>, allowed_ids: Option<HashSet<i64>>, new_users_blocked: bool) -> Self {
        Self {
            admin_id,
            allowed_ids,
            new_users_blocked,
        }
    }

    pub fn is_admin(&self, user_id: i64) -> bool {
        self.admin_id == Some(user_id)
    }

    /// Allow-list check. The administrator is always admitted.
    pub fn check_allowed(&self, user_id: i64) -> Result<(), BotError> {
        if self.is_admin(user_id) {
            return Ok(());
        }
        match &self.allowed_ids {
            Some(allowed) if !allowed.contains(&user_id) => {
                warn!("User {} rejected by allow-list", user_id);
                Err(BotError::Authorization(NOT_ALLOWED_MESSAGE.to_string()))
            }
            _ => Ok(()),
        }
    }

    /// Initial blocked flag for a record created on first contact
    pub fn starts_blocked(&self, user_id: i64) -> bool {
        self.new_users_blocked && !self.is_admin(user_id)
    }

    /// Blocked non-administrators may only use the informational commands.
    /// Administrator status comes from configuration, never from the stored flag.
    pub fn check_not_blocked(&self, user: &UserRecord, informational: bool) -> Result<(), BotError> {
        if user.is_blocked && !self.is_admin(user.id) && !informational {
            debug!("Blocked user {} denied", user.id);
            return Err(BotError::Authorization(BLOCKED_MESSAGE.to_string()));
        }
        Ok(())
    }

    pub fn require_admin(&self, user: &UserRecord) -> Result<(), BotError> {
        if self.is_admin(user.id) {
            Ok(())
        } else {
            warn!("User {} attempted an administrator command", user.id);
            Err(BotError::Authorization(ADMIN_ONLY_MESSAGE.to_string()))
        }
    }
}
