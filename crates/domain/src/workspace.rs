//! Workspace membership roles.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Membership role within a workspace. Roles form a total order
/// `Owner > Maintainer > Developer > Guest`; authorization checks compare
/// against the minimum role an operation demands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Guest,
    Developer,
    Maintainer,
    Owner,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Guest => "guest",
            Role::Developer => "developer",
            Role::Maintainer => "maintainer",
            Role::Owner => "owner",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "guest" => Ok(Role::Guest),
            "developer" => Ok(Role::Developer),
            "maintainer" => Ok(Role::Maintainer),
            "owner" => Ok(Role::Owner),
            other => Err(Error::Validation(format!("unknown role: {other}"))),
        }
    }

    /// Whether a member with this role may grant `granted` to someone else.
    /// Owners may grant anything; maintainers may add developers and guests.
    pub fn may_grant(&self, granted: Role) -> bool {
        match self {
            Role::Owner => true,
            Role::Maintainer => granted <= Role::Developer,
            _ => false,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_are_totally_ordered() {
        assert!(Role::Owner > Role::Maintainer);
        assert!(Role::Maintainer > Role::Developer);
        assert!(Role::Developer > Role::Guest);
    }

    #[test]
    fn maintainers_grant_at_most_developer() {
        assert!(Role::Maintainer.may_grant(Role::Developer));
        assert!(Role::Maintainer.may_grant(Role::Guest));
        assert!(!Role::Maintainer.may_grant(Role::Maintainer));
        assert!(!Role::Maintainer.may_grant(Role::Owner));
        assert!(Role::Owner.may_grant(Role::Owner));
        assert!(!Role::Developer.may_grant(Role::Guest));
    }

    #[test]
    fn role_round_trips_through_text() {
        for r in [Role::Guest, Role::Developer, Role::Maintainer, Role::Owner] {
            assert_eq!(Role::parse(r.as_str()).unwrap(), r);
        }
        assert!(Role::parse("admin").is_err());
    }
}
