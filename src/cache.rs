//! Catalog cache: one serialized snapshot per team partition
//!
//! Resolution never queries the store entity-by-entity. The whole catalog
//! (permissions, roles, role grants) is loaded once, serialized into the
//! cache backend under a partition key, and deserialized on read so callers
//! always work on a private copy. Every registry mutation calls
//! [`CatalogCache::invalidate`] before returning, so a read that follows a
//! completed write observes the new state.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::CacheConfig;
use crate::error::{PermissionError, Result};
use crate::store::PermissionStore;
use crate::types::{CatalogSnapshot, TeamId};

/// Byte-oriented cache backend. Swap in a networked cache by implementing
/// this over its client.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;
    async fn forget(&self, key: &str) -> Result<()>;
}

/// In-process backend over a `DashMap` with per-entry deadlines
#[derive(Default)]
pub struct MemoryCacheStore {
    entries: DashMap<String, (Vec<u8>, Instant)>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.entries.get(key) {
            Some(entry) if entry.1 > Instant::now() => Ok(Some(entry.0.clone())),
            Some(_) => {
                drop(self.entries.remove(key));
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        self.entries.insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn forget(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}

/// Read-through catalog cache, partitioned by team when teams are enabled
pub struct CatalogCache {
    store: Arc<dyn PermissionStore>,
    backing: Arc<dyn CacheStore>,
    key_prefix: String,
    ttl: Duration,
    teams_enabled: bool,
    /// Keys that may hold a live snapshot, so invalidation can clear every
    /// team partition without enumerating teams.
    live_keys: DashMap<String, ()>,
    /// Bumped on every invalidation. A miss records the generation before
    /// loading from the store and only publishes its snapshot if no
    /// invalidation ran in between, so a load that raced a mutation cannot
    /// pin the pre-mutation catalog.
    generation: AtomicU64,
}

impl CatalogCache {
    pub fn new(
        store: Arc<dyn PermissionStore>,
        backing: Arc<dyn CacheStore>,
        config: &CacheConfig,
        teams_enabled: bool,
    ) -> Self {
        Self {
            store,
            backing,
            key_prefix: config.key_prefix.clone(),
            ttl: config.ttl,
            teams_enabled,
            live_keys: DashMap::new(),
            generation: AtomicU64::new(0),
        }
    }

    fn key_for(&self, team: Option<TeamId>) -> String {
        match team {
            Some(id) if self.teams_enabled => format!("{}.team.{id}", self.key_prefix),
            _ => self.key_prefix.clone(),
        }
    }

    /// Snapshot for the given team partition, loading and caching on miss.
    /// The returned snapshot is always a private copy.
    pub async fn get(&self, team: Option<TeamId>) -> Result<CatalogSnapshot> {
        let key = self.key_for(team);

        if let Some(bytes) = self.backing.get(&key).await? {
            match serde_json::from_slice(&bytes) {
                Ok(snapshot) => return Ok(snapshot),
                Err(e) => {
                    // Stale or corrupt entry; fall through to a reload
                    debug!(%key, error = %e, "discarding undecodable cache entry");
                    self.backing.forget(&key).await?;
                }
            }
        }

        let generation = self.generation.load(Ordering::Acquire);
        let effective_team = if self.teams_enabled { team } else { None };
        let snapshot = self.store.load_catalog(effective_team).await?;

        // An invalidation ran while we were loading; serve the snapshot but
        // do not cache it, the load may predate the mutation.
        if self.generation.load(Ordering::Acquire) == generation {
            let bytes = serde_json::to_vec(&snapshot)
                .map_err(|e| PermissionError::Cache(format!("failed to encode catalog: {e}")))?;
            self.backing.set(&key, bytes, self.ttl).await?;
            self.live_keys.insert(key, ());
        } else {
            debug!(%key, "skipping cache fill that raced an invalidation");
        }
        Ok(snapshot)
    }

    /// Drop every live partition. Runs synchronously inside the mutation
    /// path; by the time the mutating call returns, no reader can observe
    /// the old catalog.
    pub async fn invalidate(&self) -> Result<()> {
        // Bump first so an in-flight load started before this point will not
        // publish its snapshot after we clear the keys.
        self.generation.fetch_add(1, Ordering::Release);
        let keys: Vec<String> = self.live_keys.iter().map(|e| e.key().clone()).collect();
        for key in &keys {
            self.backing.forget(key).await?;
            self.live_keys.remove(key);
        }
        debug!(partitions = keys.len(), "catalog cache invalidated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{
        BatchOp, BatchReport, MemoryStore, NewPermission, NewRole, PermissionStore,
    };
    use crate::types::{
        DirectGrant, Guard, Permission, PermissionId, Principal, Role, RoleAssignment, RoleId,
    };
    use chrono::{DateTime, Utc};
    use std::sync::atomic::AtomicBool;
    use tokio::sync::Notify;

    fn cache_over(store: Arc<MemoryStore>, teams_enabled: bool) -> CatalogCache {
        CatalogCache::new(
            store,
            Arc::new(MemoryCacheStore::new()),
            &CacheConfig::default(),
            teams_enabled,
        )
    }

    #[tokio::test]
    async fn test_read_through_and_copy_on_read() {
        let store = Arc::new(MemoryStore::new());
        store
            .create_permission(NewPermission::named("edit posts", Guard::default()))
            .await
            .unwrap();
        let cache = cache_over(store, false);

        let mut first = cache.get(None).await.unwrap();
        first.permissions.clear(); // mutating a copy

        let second = cache.get(None).await.unwrap();
        assert_eq!(second.permissions.len(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_reload() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_over(store.clone(), false);

        assert!(cache.get(None).await.unwrap().permissions.is_empty());

        store
            .create_permission(NewPermission::named("edit posts", Guard::default()))
            .await
            .unwrap();
        // Still serving the cached empty snapshot
        assert!(cache.get(None).await.unwrap().permissions.is_empty());

        cache.invalidate().await.unwrap();
        assert_eq!(cache.get(None).await.unwrap().permissions.len(), 1);
    }

    #[tokio::test]
    async fn test_team_partitions_are_separate() {
        let store = Arc::new(MemoryStore::new());
        store
            .create_permission(NewPermission::named("team one only", Guard::default()).in_team(1))
            .await
            .unwrap();
        let cache = cache_over(store, true);

        assert_eq!(cache.get(Some(1)).await.unwrap().permissions.len(), 1);
        assert!(cache.get(Some(2)).await.unwrap().permissions.is_empty());
        assert!(cache.get(None).await.unwrap().permissions.len() >= 1);
    }

    #[tokio::test]
    async fn test_teams_disabled_collapses_to_single_partition() {
        let store = Arc::new(MemoryStore::new());
        store
            .create_permission(NewPermission::named("anywhere", Guard::default()))
            .await
            .unwrap();
        let cache = cache_over(store, false);

        // Team argument is ignored when the feature is off
        assert_eq!(cache.get(Some(7)).await.unwrap().permissions.len(), 1);
    }

    /// Delegates to a [`MemoryStore`] but parks the first `load_catalog`
    /// after the load completes, so the test can interleave an invalidation
    /// between the load and the cache fill.
    struct ParkedLoadStore {
        inner: MemoryStore,
        park_next: AtomicBool,
        loaded: Notify,
        release: Notify,
    }

    impl ParkedLoadStore {
        fn new() -> Self {
            Self {
                inner: MemoryStore::new(),
                park_next: AtomicBool::new(false),
                loaded: Notify::new(),
                release: Notify::new(),
            }
        }
    }

    #[async_trait]
    impl PermissionStore for ParkedLoadStore {
        async fn create_permission(&self, new: NewPermission) -> Result<Permission> {
            self.inner.create_permission(new).await
        }
        async fn update_permission(&self, permission: Permission) -> Result<Permission> {
            self.inner.update_permission(permission).await
        }
        async fn delete_permission(&self, id: PermissionId) -> Result<()> {
            self.inner.delete_permission(id).await
        }
        async fn find_permission_by_name(
            &self,
            name: &str,
            guard: &Guard,
            team: Option<TeamId>,
        ) -> Result<Permission> {
            self.inner.find_permission_by_name(name, guard, team).await
        }
        async fn find_permission_by_id(
            &self,
            id: PermissionId,
            guard: &Guard,
        ) -> Result<Permission> {
            self.inner.find_permission_by_id(id, guard).await
        }
        async fn find_or_create_permission(
            &self,
            name: &str,
            guard: &Guard,
        ) -> Result<Permission> {
            self.inner.find_or_create_permission(name, guard).await
        }
        async fn create_role(&self, new: NewRole) -> Result<Role> {
            self.inner.create_role(new).await
        }
        async fn update_role(&self, role: Role) -> Result<Role> {
            self.inner.update_role(role).await
        }
        async fn delete_role(&self, id: RoleId) -> Result<()> {
            self.inner.delete_role(id).await
        }
        async fn find_role_by_name(
            &self,
            name: &str,
            guard: &Guard,
            team: Option<TeamId>,
        ) -> Result<Role> {
            self.inner.find_role_by_name(name, guard, team).await
        }
        async fn find_role_by_id(&self, id: RoleId, guard: &Guard) -> Result<Role> {
            self.inner.find_role_by_id(id, guard).await
        }
        async fn find_or_create_role(&self, name: &str, guard: &Guard) -> Result<Role> {
            self.inner.find_or_create_role(name, guard).await
        }
        async fn set_role_parent(
            &self,
            role_id: RoleId,
            parent_id: Option<RoleId>,
        ) -> Result<Role> {
            self.inner.set_role_parent(role_id, parent_id).await
        }
        async fn grant_to_role(&self, permission_id: PermissionId, role_id: RoleId) -> Result<()> {
            self.inner.grant_to_role(permission_id, role_id).await
        }
        async fn revoke_from_role(
            &self,
            permission_id: PermissionId,
            role_id: RoleId,
        ) -> Result<()> {
            self.inner.revoke_from_role(permission_id, role_id).await
        }
        async fn sync_role_permissions(
            &self,
            role_id: RoleId,
            permission_ids: Vec<PermissionId>,
        ) -> Result<()> {
            self.inner.sync_role_permissions(role_id, permission_ids).await
        }
        async fn assign_role(&self, assignment: RoleAssignment) -> Result<()> {
            self.inner.assign_role(assignment).await
        }
        async fn remove_role_assignment(
            &self,
            role_id: RoleId,
            principal: &Principal,
        ) -> Result<()> {
            self.inner.remove_role_assignment(role_id, principal).await
        }
        async fn grant_direct(&self, grant: DirectGrant) -> Result<()> {
            self.inner.grant_direct(grant).await
        }
        async fn revoke_direct(
            &self,
            permission_id: PermissionId,
            principal: &Principal,
        ) -> Result<()> {
            self.inner.revoke_direct(permission_id, principal).await
        }
        async fn assignments_for(&self, principal: &Principal) -> Result<Vec<RoleAssignment>> {
            self.inner.assignments_for(principal).await
        }
        async fn direct_grants_for(&self, principal: &Principal) -> Result<Vec<DirectGrant>> {
            self.inner.direct_grants_for(principal).await
        }
        async fn list_role_assignments(&self) -> Result<Vec<RoleAssignment>> {
            self.inner.list_role_assignments().await
        }
        async fn load_catalog(&self, team: Option<TeamId>) -> Result<CatalogSnapshot> {
            let snapshot = self.inner.load_catalog(team).await;
            if self.park_next.swap(false, Ordering::SeqCst) {
                self.loaded.notify_one();
                self.release.notified().await;
            }
            snapshot
        }
        async fn apply_batch(&self, ops: Vec<BatchOp>) -> Result<BatchReport> {
            self.inner.apply_batch(ops).await
        }
        async fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize> {
            self.inner.delete_expired(now).await
        }
    }

    #[tokio::test]
    async fn test_miss_racing_invalidation_does_not_pin_stale_snapshot() {
        let store = Arc::new(ParkedLoadStore::new());
        let cache = Arc::new(CatalogCache::new(
            store.clone(),
            Arc::new(MemoryCacheStore::new()),
            &CacheConfig::default(),
            false,
        ));

        // First miss loads the empty catalog, then parks before the fill
        store.park_next.store(true, Ordering::SeqCst);
        let reader = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get(None).await })
        };
        store.loaded.notified().await;

        // Mutation lands and invalidates while the reader is parked
        store
            .inner
            .create_permission(NewPermission::named("edit posts", Guard::default()))
            .await
            .unwrap();
        cache.invalidate().await.unwrap();
        store.release.notify_one();

        // The parked reader saw the pre-mutation catalog, which is fine
        let raced = reader.await.unwrap().unwrap();
        assert!(raced.permissions.is_empty());

        // But it must not have cached it past the invalidation
        assert_eq!(cache.get(None).await.unwrap().permissions.len(), 1);
    }

    #[tokio::test]
    async fn test_expired_entry_is_a_miss() {
        let backing = MemoryCacheStore::new();
        backing
            .set("k", b"payload".to_vec(), Duration::from_millis(0))
            .await
            .unwrap();
        assert!(backing.get("k").await.unwrap().is_none());
    }
}
