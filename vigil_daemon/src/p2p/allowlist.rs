//! Source-IP admission for the plane: cluster members are allowed
//! permanently (refreshed from each membership snapshot), knocks admit an
//! address for a bounded TTL.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

pub const KNOCK_TTL: Duration = Duration::from_secs(60);

#[derive(Default)]
pub struct AllowList {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    permanent: HashSet<IpAddr>,
    temporary: HashMap<IpAddr, Instant>,
}

impl AllowList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the permanent member set.
    pub fn set_members(&self, addrs: impl IntoIterator<Item = IpAddr>) {
        let mut inner = self.inner.lock().unwrap();
        inner.permanent = addrs.into_iter().collect();
    }

    /// Admit `addr` until the TTL lapses; a repeat knock extends it.
    pub fn admit_temporarily(&self, addr: IpAddr) {
        let mut inner = self.inner.lock().unwrap();
        inner.temporary.insert(addr, Instant::now() + KNOCK_TTL);
        debug!(%addr, "temporarily admitted");
    }

    pub fn is_allowed(&self, addr: IpAddr) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        inner.temporary.retain(|_, expiry| *expiry > now);
        inner.permanent.contains(&addr) || inner.temporary.contains_key(&addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_members_are_allowed() {
        let list = AllowList::new();
        let member: IpAddr = "10.99.0.2".parse().unwrap();
        let stranger: IpAddr = "192.0.2.7".parse().unwrap();
        list.set_members([member]);
        assert!(list.is_allowed(member));
        assert!(!list.is_allowed(stranger));
    }

    #[test]
    fn member_refresh_replaces_the_set() {
        let list = AllowList::new();
        let old: IpAddr = "10.99.0.2".parse().unwrap();
        let new: IpAddr = "10.99.0.3".parse().unwrap();
        list.set_members([old]);
        list.set_members([new]);
        assert!(!list.is_allowed(old));
        assert!(list.is_allowed(new));
    }

    #[test]
    fn knock_admission_is_temporary() {
        let list = AllowList::new();
        let knocker: IpAddr = "203.0.113.9".parse().unwrap();
        list.admit_temporarily(knocker);
        assert!(list.is_allowed(knocker));
        // Force-expire by rewinding the stored expiry.
        list.inner.lock().unwrap().temporary.insert(
            knocker,
            Instant::now() - Duration::from_secs(1),
        );
        assert!(!list.is_allowed(knocker));
    }
}
