use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Origins allowed to receive unprompted notifications. Cloning shares the
/// underlying set.
#[derive(Debug, Clone, Default)]
pub struct ApprovedHosts {
    inner: Arc<RwLock<HashSet<String>>>,
}

impl ApprovedHosts {
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            inner: Arc::new(RwLock::new(hosts.into_iter().map(Into::into).collect())),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashSet<String>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashSet<String>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `true` if the origin was not approved before.
    pub fn approve(&self, origin: impl Into<String>) -> bool {
        self.write().insert(origin.into())
    }

    pub fn revoke(&self, origin: &str) -> bool {
        self.write().remove(origin)
    }

    pub fn contains(&self, origin: &str) -> bool {
        self.read().contains(origin)
    }

    pub fn list(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.read().iter().cloned().collect();
        hosts.sort();
        hosts
    }

    pub fn replace<I, S>(&self, hosts: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        *self.write() = hosts.into_iter().map(Into::into).collect();
    }
}
