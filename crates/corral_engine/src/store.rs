use corral_core::prelude::*;

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, PoisonError, RwLock, Weak},
};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Installs and stacks, kept in memory and written through to the backend.
///
/// Readers take a short read lock and get clones. Writers of one record
/// serialize on that record's lock ([`EntityStore::lock`]); writes to
/// different records do not contend.
pub struct EntityStore<B> {
    installs: RwLock<HashMap<String, Install>>,
    stacks: RwLock<HashMap<String, Stack>>,
    /// Only live while someone holds or waits for the lock.
    locks: Mutex<HashMap<String, Weak<AsyncMutex<()>>>>,
    backend: B,
}

impl<B: StateBackend> EntityStore<B> {
    pub fn new(backend: B) -> Self {
        Self {
            installs: RwLock::new(HashMap::new()),
            stacks: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            backend,
        }
    }

    pub fn restore(&self, installs: Vec<Install>, stacks: Vec<Stack>) {
        let mut map = self.installs.write().unwrap_or_else(PoisonError::into_inner);
        map.extend(installs.into_iter().map(|i| (i.id.clone(), i)));
        let mut map = self.stacks.write().unwrap_or_else(PoisonError::into_inner);
        map.extend(stacks.into_iter().map(|s| (s.id.clone(), s)));
    }

    /// Exclusive access to one install or stack for a read-modify-write.
    pub async fn lock(&self, id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.retain(|_, lock| lock.strong_count() > 0);
            match locks.get(id).and_then(Weak::upgrade) {
                Some(lock) => lock,
                None => {
                    let lock = Arc::new(AsyncMutex::new(()));
                    locks.insert(id.to_string(), Arc::downgrade(&lock));
                    lock
                }
            }
        };
        lock.lock_owned().await
    }

    fn prune_locks(&self) {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, lock| lock.strong_count() > 0);
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn install(&self, id: &str) -> Option<Install> {
        self.installs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// All installs, newest first.
    pub fn installs(&self) -> Vec<Install> {
        let mut list: Vec<Install> = self
            .installs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        list
    }

    /// Persists first, so a failed write leaves the in-memory view unchanged.
    pub async fn put_install(&self, install: Install) -> Result<()> {
        self.backend.write_install(&install).await?;
        self.installs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(install.id.clone(), install);
        Ok(())
    }

    pub async fn remove_install(&self, id: &str) -> Result<()> {
        self.backend.delete_install(id).await?;
        self.installs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        self.prune_locks();
        Ok(())
    }

    /// The install of `app_id` that is not uninstalled, if any.
    pub fn active_install_for_app(&self, app_id: &str) -> Option<Install> {
        self.installs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .find(|i| i.app_id == app_id && !i.is_uninstalled())
            .cloned()
    }

    pub fn stack(&self, id: &str) -> Option<Stack> {
        self.stacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// All stacks, newest first.
    pub fn stacks(&self) -> Vec<Stack> {
        let mut list: Vec<Stack> = self
            .stacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        list
    }

    pub async fn put_stack(&self, stack: Stack) -> Result<()> {
        self.backend.write_stack(&stack).await?;
        self.stacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(stack.id.clone(), stack);
        Ok(())
    }

    pub async fn remove_stack(&self, id: &str) -> Result<()> {
        self.backend.delete_stack(id).await?;
        self.stacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        self.prune_locks();
        Ok(())
    }

    pub fn active_stack_named(&self, name: &str) -> Option<Stack> {
        self.stacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .find(|s| s.name == name && s.status != InstallStatus::Uninstalled)
            .cloned()
    }

    /// Container ids owned by a stored install or stack.
    pub fn referenced_ctids(&self) -> HashSet<u32> {
        let installs = self.installs.read().unwrap_or_else(PoisonError::into_inner);
        let stacks = self.stacks.read().unwrap_or_else(PoisonError::into_inner);
        installs
            .values()
            .filter_map(|i| i.ctid)
            .chain(stacks.values().filter_map(|s| s.ctid))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use chrono::{Duration, Utc};
    use std::collections::BTreeMap;

    fn install(id: &str, app_id: &str, status: InstallStatus) -> Install {
        Install {
            id: id.into(),
            app_id: app_id.into(),
            app_name: app_id.into(),
            app_version: "1.0.0".into(),
            ctid: Some(100),
            status,
            storage: "local-lvm".into(),
            bridge: "vmbr0".into(),
            cores: 1,
            memory_mb: 512,
            disk_gb: 4,
            hostname: app_id.into(),
            ip_address: None,
            mac_address: None,
            onboot: true,
            unprivileged: true,
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            mount_points: Vec::new(),
            devices: Vec::new(),
            env_vars: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_put_writes_through() {
        let backend = MemoryBackend::new();
        let store = EntityStore::new(backend.clone());
        store
            .put_install(install("a", "nginx", InstallStatus::Running))
            .await
            .unwrap();
        assert_eq!(backend.install_count(), 1);
        assert!(store.install("a").is_some());

        store.remove_install("a").await.unwrap();
        assert_eq!(backend.install_count(), 0);
        assert!(store.install("a").is_none());
    }

    #[tokio::test]
    async fn test_active_install_ignores_uninstalled() {
        let store = EntityStore::new(MemoryBackend::new());
        let mut old = install("a", "nginx", InstallStatus::Uninstalled);
        old.ctid = None;
        store.put_install(old).await.unwrap();
        assert!(store.active_install_for_app("nginx").is_none());

        store
            .put_install(install("b", "nginx", InstallStatus::Stopped))
            .await
            .unwrap();
        assert_eq!(store.active_install_for_app("nginx").unwrap().id, "b");
        assert_eq!(store.referenced_ctids(), HashSet::from([100]));
    }

    #[tokio::test]
    async fn test_installs_newest_first() {
        let store = EntityStore::new(MemoryBackend::new());
        let mut older = install("old", "redis", InstallStatus::Running);
        older.created_at = Utc::now() - Duration::minutes(5);
        store.put_install(older).await.unwrap();
        store
            .put_install(install("new", "nginx", InstallStatus::Running))
            .await
            .unwrap();
        let ids: Vec<_> = store.installs().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, ["new", "old"]);
    }

    #[tokio::test]
    async fn test_lock_is_per_record() {
        let store = EntityStore::new(MemoryBackend::new());
        let _a = store.lock("a").await;
        // A different record is not blocked.
        let _b = store.lock("b").await;
        let blocked = tokio::time::timeout(std::time::Duration::from_millis(20), store.lock("a")).await;
        assert!(blocked.is_err());
    }

    #[tokio::test]
    async fn test_locks_of_removed_records_are_dropped() {
        let store = EntityStore::new(MemoryBackend::new());
        for id in ["a", "b", "c"] {
            let mut record = install(id, id, InstallStatus::Uninstalled);
            record.ctid = None;
            store.put_install(record).await.unwrap();
            let _lock = store.lock(id).await;
            store.remove_install(id).await.unwrap();
        }
        assert_eq!(store.lock_count(), 1);

        let held = store.lock("d").await;
        assert_eq!(store.lock_count(), 1);
        drop(held);
        store.remove_install("d").await.unwrap();
        assert_eq!(store.lock_count(), 0);
    }
}
