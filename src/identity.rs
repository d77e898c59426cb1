//! Caller identity and dataset access policy.
//!
//! Authentication itself is external: something upstream maps a credential
//! to a user row. This module only decides what a resolved caller may do
//! with a dataset:
//!
//! - Demo datasets are world-readable and immutable.
//! - User datasets are private to their owner, who must be active.
//! - The system identity (lifecycle sweeper) bypasses ownership checks.

use serde::Serialize;

use crate::db::{Dataset, User};
use crate::error::ApiError;

/// A resolved user identity.
#[derive(Debug, Clone, Serialize)]
pub struct UserIdentity {
    pub id: i64,
    pub username: String,
    pub is_active: bool,
    pub is_superuser: bool,
}

impl From<&User> for UserIdentity {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
            is_active: user.is_active,
            is_superuser: user.is_superuser,
        }
    }
}

/// Who is asking.
#[derive(Debug, Clone)]
pub enum Caller {
    /// No credential presented.
    Anonymous,
    /// A resolved user.
    User(UserIdentity),
    /// Internal maintenance (expiry sweeper, startup reconciliation).
    System,
}

impl Caller {
    pub fn user(&self) -> Option<&UserIdentity> {
        match self {
            Caller::User(identity) => Some(identity),
            _ => None,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Caller::Anonymous)
    }
}

/// What the caller wants to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Read,
    Modify,
    Delete,
}

/// Decide whether `caller` may perform `intent` on `dataset`.
///
/// Returns the semantic error class on denial: `Unauthorized` when no
/// identity was presented, `Forbidden` otherwise.
pub fn check_access(dataset: &Dataset, caller: &Caller, intent: Intent) -> Result<(), ApiError> {
    if matches!(caller, Caller::System) {
        return Ok(());
    }

    if dataset.is_demo {
        return match intent {
            Intent::Read => Ok(()),
            Intent::Modify | Intent::Delete => {
                Err(ApiError::Forbidden("demo datasets are immutable".to_string()))
            }
        };
    }

    let Some(identity) = caller.user() else {
        return Err(ApiError::Unauthorized(
            "authentication required to access this dataset".to_string(),
        ));
    };

    if identity.is_active && Some(identity.id) == dataset.owner_id {
        Ok(())
    } else {
        Err(ApiError::Forbidden(
            "you don't have permission to access this dataset".to_string(),
        ))
    }
}

// =============================================================================
// Tests
// =============================================================================
