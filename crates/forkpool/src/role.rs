//! Process role resolution.
//!
//! Whether a process is the primary or a worker is a property of how it was
//! created: only a primary spawns workers, and it marks them through the
//! environment. The resolved [`Role`] is passed explicitly into whichever
//! bootstrap path runs.

/// Environment variable a primary sets on every worker it spawns.
pub const ROLE_ENV: &str = "FORKPOOL_ROLE";

const WORKER_MARKER: &str = "worker";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Pool coordinator. Never serves traffic.
    Primary,
    /// Request server spawned by a primary.
    Worker,
}

impl Role {
    /// Resolve the role of the current process.
    pub fn resolve() -> Self {
        Self::from_marker(std::env::var(ROLE_ENV).ok().as_deref())
    }

    /// Resolve from the raw marker value. Anything but the worker marker is
    /// a primary, so a stray value can never stop a pool from forming.
    pub fn from_marker(marker: Option<&str>) -> Self {
        match marker {
            Some(WORKER_MARKER) => Role::Worker,
            _ => Role::Primary,
        }
    }

    pub fn is_primary(&self) -> bool {
        matches!(self, Role::Primary)
    }

    /// Marker value that makes a spawned process resolve to this role.
    pub fn marker(&self) -> Option<&'static str> {
        match self {
            Role::Primary => None,
            Role::Worker => Some(WORKER_MARKER),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launched_process_is_primary() {
        assert_eq!(Role::from_marker(None), Role::Primary);
        assert!(Role::from_marker(None).is_primary());
    }

    #[test]
    fn spawned_worker_resolves_to_worker() {
        let marker = Role::Worker.marker();
        assert_eq!(Role::from_marker(marker), Role::Worker);
        assert!(!Role::Worker.is_primary());
    }

    #[test]
    fn unknown_marker_falls_back_to_primary() {
        assert_eq!(Role::from_marker(Some("")), Role::Primary);
        assert_eq!(Role::from_marker(Some("Worker")), Role::Primary);
    }
}
