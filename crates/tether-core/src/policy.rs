//! Admission policy: whitelist, blacklist, and connection limits.

use std::{net::IpAddr, time::Duration};

use crate::{
    config::{DEFAULT_MAX_CONNECTIONS, SessionLimits},
    error::ConfigError,
};

/// Per-server admission rules, fixed once listening starts.
///
/// # Invariants
///
/// - A non-empty whitelist admits only listed peers; the blacklist is
///   ignored entirely.
/// - Otherwise a non-empty blacklist refuses listed peers.
/// - With both lists empty, everyone is admitted.
#[derive(Debug, Clone)]
pub struct PolicySet {
    /// Addresses admitted when non-empty (exclusive).
    pub whitelist: Vec<IpAddr>,
    /// Addresses refused when the whitelist is empty.
    pub blacklist: Vec<IpAddr>,
    /// Cap on concurrent sessions.
    pub max_connections: usize,
    /// Per-session inactivity timeout; zero means no timeout.
    pub inactivity_timeout: Duration,
}

impl Default for PolicySet {
    fn default() -> Self {
        Self {
            whitelist: Vec::new(),
            blacklist: Vec::new(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            inactivity_timeout: Duration::ZERO,
        }
    }
}

impl PolicySet {
    /// Validate the policy before listening.
    pub fn validate(&self) -> Result<(), ConfigError> {
        SessionLimits { inactivity_timeout: self.inactivity_timeout, ..SessionLimits::default() }
            .validate()
    }

    /// Whether a peer at `addr` passes the allow/deny lists.
    ///
    /// Capacity is enforced separately by the accept loop; this only
    /// answers the address question.
    #[must_use]
    pub fn is_connection_allowed(&self, addr: IpAddr) -> bool {
        if !self.whitelist.is_empty() {
            return self.whitelist.contains(&addr);
        }
        if !self.blacklist.is_empty() {
            return !self.blacklist.contains(&addr);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn empty_policy_admits_everyone() {
        let policy = PolicySet::default();
        assert!(policy.is_connection_allowed(ip("10.0.0.1")));
        assert!(policy.is_connection_allowed(ip("::1")));
    }

    #[test]
    fn whitelist_is_exclusive() {
        let policy = PolicySet { whitelist: vec![ip("10.0.0.1")], ..PolicySet::default() };
        assert!(policy.is_connection_allowed(ip("10.0.0.1")));
        assert!(!policy.is_connection_allowed(ip("10.0.0.2")));
    }

    #[test]
    fn whitelist_overrides_blacklist() {
        let policy = PolicySet {
            whitelist: vec![ip("10.0.0.1")],
            blacklist: vec![ip("10.0.0.1")],
            ..PolicySet::default()
        };
        // Blacklist is ignored while a whitelist is configured.
        assert!(policy.is_connection_allowed(ip("10.0.0.1")));
    }

    #[test]
    fn blacklist_refuses_listed_peers() {
        let policy = PolicySet { blacklist: vec![ip("192.168.1.7")], ..PolicySet::default() };
        assert!(!policy.is_connection_allowed(ip("192.168.1.7")));
        assert!(policy.is_connection_allowed(ip("192.168.1.8")));
    }

    #[test]
    fn timeout_band_checked_on_validate() {
        let policy =
            PolicySet { inactivity_timeout: Duration::from_secs(2), ..PolicySet::default() };
        assert!(policy.validate().is_err());

        let policy = PolicySet { inactivity_timeout: Duration::ZERO, ..PolicySet::default() };
        assert!(policy.validate().is_ok());
    }
}
