//! Stream/compare role assignment with an atomic swap.

use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Serialize;

use crate::config::PrimaryRole;
use crate::upstream::Endpoint;

/// Which endpoint streams to the client and which one is compared.
#[derive(Debug, Clone)]
pub struct RoleAssignment {
    stream: Arc<Endpoint>,
    compare: Arc<Endpoint>,
    primary_role: PrimaryRole,
}

impl RoleAssignment {
    pub fn new(primary: Arc<Endpoint>, secondary: Arc<Endpoint>, primary_role: PrimaryRole) -> Self {
        let (stream, compare) = match primary_role {
            PrimaryRole::Primary => (primary, secondary),
            PrimaryRole::Secondary => (secondary, primary),
        };
        Self {
            stream,
            compare,
            primary_role,
        }
    }

    pub fn stream(&self) -> &Arc<Endpoint> {
        &self.stream
    }

    pub fn compare(&self) -> &Arc<Endpoint> {
        &self.compare
    }

    pub fn primary_role(&self) -> PrimaryRole {
        self.primary_role
    }

    /// The endpoint configured as primary, whatever its current role.
    pub fn primary(&self) -> &Arc<Endpoint> {
        match self.primary_role {
            PrimaryRole::Primary => &self.stream,
            PrimaryRole::Secondary => &self.compare,
        }
    }

    pub fn secondary(&self) -> &Arc<Endpoint> {
        match self.primary_role {
            PrimaryRole::Primary => &self.compare,
            PrimaryRole::Secondary => &self.stream,
        }
    }

    fn swapped(&self) -> Self {
        Self {
            stream: self.compare.clone(),
            compare: self.stream.clone(),
            primary_role: self.primary_role.flipped(),
        }
    }

    pub fn describe(&self) -> RoleSwitch {
        RoleSwitch {
            stream_endpoint: self.stream.to_string(),
            compare_endpoint: self.compare.to_string(),
            primary_role: self.primary_role,
        }
    }
}

/// Serializable view of an assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleSwitch {
    pub stream_endpoint: String,
    pub compare_endpoint: String,
    pub primary_role: PrimaryRole,
}

/// Holds the current assignment. Readers take one snapshot per request;
/// a switch replaces the whole assignment at once.
#[derive(Debug)]
pub struct RoleController {
    current: ArcSwap<RoleAssignment>,
}

impl RoleController {
    pub fn new(assignment: RoleAssignment) -> Self {
        Self {
            current: ArcSwap::from_pointee(assignment),
        }
    }

    pub fn snapshot(&self) -> Arc<RoleAssignment> {
        self.current.load_full()
    }

    /// Swap stream and compare roles. Returns the new assignment.
    pub fn switch_roles(&self) -> Arc<RoleAssignment> {
        let mut installed = None;
        self.current.rcu(|current| {
            let next = Arc::new(current.swapped());
            installed = Some(next.clone());
            next
        });
        installed.unwrap_or_else(|| self.current.load_full())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::EndpointName;

    fn controller() -> RoleController {
        let primary = Arc::new(Endpoint::new(EndpointName::Primary, "http://a:8545".parse().unwrap()));
        let secondary = Arc::new(Endpoint::new(EndpointName::Secondary, "http://b:8545".parse().unwrap()));
        RoleController::new(RoleAssignment::new(primary, secondary, PrimaryRole::Primary))
    }

    #[test]
    fn test_switch_twice_restores() {
        let roles = controller();
        let before = roles.snapshot().describe();

        let switched = roles.switch_roles();
        assert_eq!(switched.stream().name(), EndpointName::Secondary);
        assert_eq!(switched.compare().name(), EndpointName::Primary);
        assert_eq!(switched.primary_role(), PrimaryRole::Secondary);
        assert_eq!(switched.primary().name(), EndpointName::Primary);

        roles.switch_roles();
        assert_eq!(roles.snapshot().describe(), before);
    }

    #[test]
    fn test_snapshot_survives_switch() {
        let roles = controller();
        let held = roles.snapshot();
        roles.switch_roles();
        assert_eq!(held.stream().name(), EndpointName::Primary);
        assert_eq!(roles.snapshot().stream().name(), EndpointName::Secondary);
    }

    #[test]
    fn test_concurrent_switches_never_tear() {
        let roles = Arc::new(controller());
        let switchers: Vec<_> = (0..4)
            .map(|_| {
                let roles = roles.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        roles.switch_roles();
                    }
                })
            })
            .collect();

        for _ in 0..10_000 {
            let snapshot = roles.snapshot();
            assert_ne!(snapshot.stream().name(), snapshot.compare().name());
        }
        for handle in switchers {
            handle.join().unwrap();
        }
        // 4000 flips is even.
        assert_eq!(roles.snapshot().primary_role(), PrimaryRole::Primary);
    }
}
