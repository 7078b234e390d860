//! Role controller
//!
//! Holds whether this node is the leader. Changing role never talks to peers;
//! it only changes which commands this node may originate. Two nodes may both
//! call themselves leader at the same time; followers then apply whichever
//! command reached them last.

use crate::protocol::Role;

#[derive(Debug, Default, Clone)]
pub struct RoleController {
    role: Role,
}

impl RoleController {
    pub fn new(role: Role) -> Self {
        Self { role }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    /// Returns whether the role changed
    pub fn become_leader(&mut self) -> bool {
        self.set(Role::Leader)
    }

    /// Returns whether the role changed
    pub fn become_follower(&mut self) -> bool {
        self.set(Role::Follower)
    }

    fn set(&mut self, role: Role) -> bool {
        if self.role == role {
            return false;
        }
        tracing::info!("Role changed: {} -> {}", self.role, role);
        self.role = role;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions_report_changes() {
        let mut roles = RoleController::default();
        assert_eq!(roles.role(), Role::Follower);

        assert!(roles.become_leader());
        assert!(roles.is_leader());
        assert!(!roles.become_leader());

        assert!(roles.become_follower());
        assert!(!roles.is_leader());
        assert!(!roles.become_follower());
    }
}
