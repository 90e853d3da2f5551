//! Sandbox status machine.
//!
//! Every status write in the system goes through
//! [`SandboxStatus::can_transition`]; anything not in the table is rejected
//! as a conflict before any backend call is made.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Kind
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Where a sandbox runs. Immutable after create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxKind {
    /// Runs as a container the control plane provisions (Docker or
    /// Kubernetes, per the configured backend).
    Cloud,
    /// Runs on the user's machine and reaches us through the reverse tunnel.
    Local,
}

impl SandboxKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxKind::Cloud => "cloud",
            SandboxKind::Local => "local",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "cloud" => Ok(SandboxKind::Cloud),
            "local" => Ok(SandboxKind::Local),
            other => Err(Error::Internal(format!("unknown sandbox kind: {other}"))),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Status
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Sandbox lifecycle status.
///
/// ```text
/// creating ──► running ──► pausing ──► paused ──► resuming ──► running
///     │           │                        │
///     │           └──► offline (local) ────┘
///     ▼           ▼                        ▼
///  deleting   deleting                 deleting
/// ```
///
/// `Offline` applies only to local sandboxes whose tunnel is absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    Creating,
    Running,
    Pausing,
    Paused,
    Resuming,
    Offline,
    Deleting,
}

impl SandboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxStatus::Creating => "creating",
            SandboxStatus::Running => "running",
            SandboxStatus::Pausing => "pausing",
            SandboxStatus::Paused => "paused",
            SandboxStatus::Resuming => "resuming",
            SandboxStatus::Offline => "offline",
            SandboxStatus::Deleting => "deleting",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "creating" => Ok(SandboxStatus::Creating),
            "running" => Ok(SandboxStatus::Running),
            "pausing" => Ok(SandboxStatus::Pausing),
            "paused" => Ok(SandboxStatus::Paused),
            "resuming" => Ok(SandboxStatus::Resuming),
            "offline" => Ok(SandboxStatus::Offline),
            "deleting" => Ok(SandboxStatus::Deleting),
            other => Err(Error::Internal(format!("unknown sandbox status: {other}"))),
        }
    }

    /// The legal-transition table. Delete is legal from every state;
    /// everything else follows the chain above.
    pub fn can_transition(self, to: SandboxStatus) -> bool {
        use SandboxStatus::*;
        if to == Deleting {
            return true;
        }
        matches!(
            (self, to),
            (Creating, Running)
                | (Running, Pausing)
                | (Running, Offline)
                | (Pausing, Paused)
                | (Paused, Resuming)
                | (Resuming, Running)
                | (Offline, Running)
        )
    }

    /// Reject an illegal transition with a `Conflict`.
    pub fn check_transition(self, to: SandboxStatus) -> Result<()> {
        if self.can_transition(to) {
            Ok(())
        } else {
            Err(Error::Conflict(format!(
                "illegal transition {} -> {}",
                self.as_str(),
                to.as_str()
            )))
        }
    }

    /// States a crashed manager must drive toward their terminal intent on
    /// startup instead of leaving dangling.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            SandboxStatus::Creating
                | SandboxStatus::Pausing
                | SandboxStatus::Resuming
                | SandboxStatus::Deleting
        )
    }
}

impl std::fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::SandboxStatus::*;
    use super::*;

    const ALL: [SandboxStatus; 7] =
        [Creating, Running, Pausing, Paused, Resuming, Offline, Deleting];

    #[test]
    fn delete_is_legal_from_every_state() {
        for s in ALL {
            assert!(s.can_transition(Deleting), "{s} -> deleting must be legal");
        }
    }

    #[test]
    fn the_happy_chain_is_legal() {
        assert!(Creating.can_transition(Running));
        assert!(Running.can_transition(Pausing));
        assert!(Pausing.can_transition(Paused));
        assert!(Paused.can_transition(Resuming));
        assert!(Resuming.can_transition(Running));
    }

    #[test]
    fn tunnel_attach_detach_is_legal() {
        assert!(Running.can_transition(Offline));
        assert!(Offline.can_transition(Running));
    }

    #[test]
    fn everything_else_is_rejected() {
        // Exhaustive sweep: the only legal pairs are the ones listed.
        let legal = [
            (Creating, Running),
            (Running, Pausing),
            (Running, Offline),
            (Pausing, Paused),
            (Paused, Resuming),
            (Resuming, Running),
            (Offline, Running),
        ];
        for from in ALL {
            for to in ALL {
                if to == Deleting {
                    continue;
                }
                let expected = legal.contains(&(from, to));
                assert_eq!(
                    from.can_transition(to),
                    expected,
                    "{from} -> {to} expected legal={expected}"
                );
            }
        }
    }

    #[test]
    fn check_transition_reports_conflict() {
        let err = Paused.check_transition(Running).unwrap_err();
        assert_eq!(err.http_status(), 409);
    }

    #[test]
    fn status_round_trips_through_text() {
        for s in ALL {
            assert_eq!(SandboxStatus::parse(s.as_str()).unwrap(), s);
        }
        assert!(SandboxStatus::parse("zombie").is_err());
    }

    #[test]
    fn transient_states() {
        assert!(Creating.is_transient());
        assert!(Pausing.is_transient());
        assert!(Resuming.is_transient());
        assert!(Deleting.is_transient());
        assert!(!Running.is_transient());
        assert!(!Paused.is_transient());
        assert!(!Offline.is_transient());
    }
}
