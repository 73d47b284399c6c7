//! User and role models

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Roles the engine checks before acting
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Requester,
    Approver,
    /// May override decisions; satisfies every other role check
    Administrator,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Requester => "requester",
            Role::Approver => "approver",
            Role::Administrator => "administrator",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "requester" => Some(Role::Requester),
            "approver" => Some(Role::Approver),
            "administrator" => Some(Role::Administrator),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An authenticated user as seen by the engine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub department: Option<String>,
    pub roles: Vec<Role>,
}

impl User {
    pub fn has_role(&self, role: Role) -> bool {
        self.roles
            .iter()
            .any(|r| *r == role || *r == Role::Administrator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_administrator_satisfies_any_role() {
        let admin = User {
            id: Uuid::new_v4(),
            name: "Admin".into(),
            department: None,
            roles: vec![Role::Administrator],
        };
        assert!(admin.has_role(Role::Approver));
        assert!(admin.has_role(Role::Requester));
    }

    #[test]
    fn test_requester_cannot_approve() {
        let user = User {
            id: Uuid::new_v4(),
            name: "Requester".into(),
            department: Some("Lab".into()),
            roles: vec![Role::Requester],
        };
        assert!(!user.has_role(Role::Approver));
    }
}
