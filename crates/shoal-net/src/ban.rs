//! In-memory, host-keyed ban list with timed expiry.
//!
//! A ban blocks future `accept` from that host; it does not retroactively
//! close other live connections from the same host, since connections are
//! identified by `node_id`, not host. Expiry is checked lazily on lookup.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::info;

/// Why a host was banned, surfaced for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanReason {
    InvalidProtocol,
    RateLimitExceeded,
}

#[derive(Debug, Clone, Copy)]
struct BanEntry {
    expiry: Instant,
    reason: BanReason,
}

/// Tracks banned hosts. `127.0.0.1` and `::1` can be exempted in testing
/// mode so integration tests against a local listener aren't self-banning.
pub struct BanList {
    entries: HashMap<String, BanEntry>,
    exempt_loopback: bool,
}

impl BanList {
    pub fn new(exempt_loopback: bool) -> Self {
        Self { entries: HashMap::new(), exempt_loopback }
    }

    fn is_loopback(host: &str) -> bool {
        host == "127.0.0.1" || host == "::1"
    }

    pub fn ban(&mut self, host: &str, duration: Duration, reason: BanReason) {
        if self.exempt_loopback && Self::is_loopback(host) {
            return;
        }
        info!(%host, ?reason, duration_secs = duration.as_secs(), "ban: host banned");
        self.entries.insert(host.to_string(), BanEntry { expiry: Instant::now() + duration, reason });
    }

    /// Returns `Some(reason)` if `host` is currently banned, lazily expiring
    /// the entry (and removing it) if its ban has elapsed.
    pub fn check(&mut self, host: &str) -> Option<BanReason> {
        if self.exempt_loopback && Self::is_loopback(host) {
            return None;
        }
        match self.entries.get(host) {
            Some(entry) if entry.expiry > Instant::now() => Some(entry.reason),
            Some(_) => {
                self.entries.remove(host);
                None
            }
            None => None,
        }
    }

    pub fn unban(&mut self, host: &str) {
        self.entries.remove(host);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn banned_host_is_reported_until_expiry() {
        let mut bans = BanList::new(false);
        bans.ban("1.2.3.4", Duration::from_secs(10), BanReason::InvalidProtocol);
        assert_eq!(bans.check("1.2.3.4"), Some(BanReason::InvalidProtocol));
    }

    #[test]
    fn expired_ban_is_lazily_removed() {
        let mut bans = BanList::new(false);
        bans.ban("1.2.3.4", Duration::from_millis(1), BanReason::RateLimitExceeded);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(bans.check("1.2.3.4"), None);
        assert!(bans.is_empty());
    }

    #[test]
    fn unaffected_host_is_never_banned() {
        let mut bans = BanList::new(false);
        bans.ban("1.2.3.4", Duration::from_secs(10), BanReason::InvalidProtocol);
        assert_eq!(bans.check("5.6.7.8"), None);
    }

    #[test]
    fn loopback_exempt_in_testing_mode() {
        let mut bans = BanList::new(true);
        bans.ban("127.0.0.1", Duration::from_secs(600), BanReason::InvalidProtocol);
        assert_eq!(bans.check("127.0.0.1"), None);
        assert!(bans.is_empty(), "exempted bans should not even be recorded");
    }

    #[test]
    fn loopback_enforced_outside_testing_mode() {
        let mut bans = BanList::new(false);
        bans.ban("127.0.0.1", Duration::from_secs(600), BanReason::InvalidProtocol);
        assert_eq!(bans.check("127.0.0.1"), Some(BanReason::InvalidProtocol));
    }

    #[test]
    fn unban_clears_entry_immediately() {
        let mut bans = BanList::new(false);
        bans.ban("1.2.3.4", Duration::from_secs(600), BanReason::InvalidProtocol);
        bans.unban("1.2.3.4");
        assert_eq!(bans.check("1.2.3.4"), None);
    }
}
