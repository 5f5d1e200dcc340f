//! bcp-authz
//!
//! Role-based access control over (actor, organization, permission)
//! triples. Pure deterministic logic: no I/O, no clock, no session
//! storage; the daemon resolves credentials to an [`ActorContext`] and
//! this crate only answers "may this actor do that to this org".
//!
//! Fail-closed: an actor gets exactly what its role grants within its own
//! organization; cross-org access requires the platform-admin flag.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Capabilities over the orchestration surface, from least to most
/// privileged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Read-only queue and limit visibility.
    Viewer,
    /// Viewer plus cancel, manual runs, and completion reports.
    Operator,
    /// Operator plus limit writes.
    Admin,
}

/// Individual permissions checked by the HTTP handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    QueueRead,
    QueueCancel,
    LimitRead,
    LimitWrite,
    RunTrigger,
    RunComplete,
}

impl Permission {
    /// Lowest role that grants this permission.
    fn minimum_role(self) -> Role {
        match self {
            Permission::QueueRead | Permission::LimitRead => Role::Viewer,
            Permission::QueueCancel | Permission::RunTrigger | Permission::RunComplete => {
                Role::Operator
            }
            Permission::LimitWrite => Role::Admin,
        }
    }
}

impl Role {
    fn rank(self) -> u8 {
        match self {
            Role::Viewer => 0,
            Role::Operator => 1,
            Role::Admin => 2,
        }
    }

    /// True when this role grants `permission` (org scoping is checked
    /// separately).
    pub fn grants(self, permission: Permission) -> bool {
        self.rank() >= permission.minimum_role().rank()
    }
}

/// The authenticated principal attached to a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorContext {
    pub actor_id: Uuid,
    /// Home organization the actor is bound to.
    pub org_id: Uuid,
    pub role: Role,
    /// Platform staff flag: lifts the same-org restriction, not the role
    /// rank.
    #[serde(default)]
    pub platform_admin: bool,
}

/// Refusals from the authorization layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthzError {
    /// No valid credentials were presented. HTTP 401.
    #[error("authentication required")]
    Unauthorized,
    /// Credentials are valid but the actor's role does not grant the
    /// permission. HTTP 403.
    #[error("permission denied")]
    Forbidden,
    /// The target org is not visible to the actor. Surfaced as 404, the
    /// same as a nonexistent entity, so tenants cannot probe each other.
    #[error("not found")]
    OutOfScope,
}

/// The single choke-point: every control-plane handler calls this before
/// touching the core.
///
/// Scope is checked before role: a foreign org looks nonexistent even to
/// an actor whose role would otherwise be insufficient.
pub fn authorize(
    actor: &ActorContext,
    org_id: Uuid,
    permission: Permission,
) -> Result<(), AuthzError> {
    if actor.org_id != org_id && !actor.platform_admin {
        return Err(AuthzError::OutOfScope);
    }
    if !actor.role.grants(permission) {
        return Err(AuthzError::Forbidden);
    }
    Ok(())
}
