//! Owner to instance assignments, one table per workspace version.
//!
//! A table maps every [`InstanceOwner`] of one workspace version to the
//! instance serving it. The reconciler turns the union of all tables into
//! cluster objects; any change here marks the table dirty and wakes it.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::Serialize;

use wsman_core::Trigger;
use wsman_model::{
    InstanceName, InstanceNameGenerator, InstanceOwner, WorkspaceHash, WorkspaceVersion,
};

use crate::idle::IdleTracker;

#[derive(Debug, Default)]
struct TableState {
    assignments: BTreeMap<InstanceOwner, InstanceName>,
    pool_override: Option<u32>,
    pool_auto: Option<u32>,
}

impl TableState {
    fn effective_pool_size(&self) -> u32 {
        self.pool_override.or(self.pool_auto).unwrap_or(0)
    }
}

/// Shared pieces every table needs.
#[derive(Clone)]
struct TableContext {
    names: Arc<InstanceNameGenerator>,
    idle: Arc<IdleTracker>,
    wake: Arc<Trigger<()>>,
}

pub struct WorkspaceAssignments {
    version: WorkspaceVersion,
    state: Mutex<TableState>,
    dirty: AtomicBool,
    ctx: TableContext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolSizes {
    pub user_override: Option<u32>,
    pub auto: Option<u32>,
    pub effective: u32,
}

impl WorkspaceAssignments {
    fn new(version: WorkspaceVersion, ctx: TableContext) -> Self {
        Self {
            version,
            state: Mutex::new(TableState::default()),
            dirty: AtomicBool::new(false),
            ctx,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TableState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn version(&self) -> &WorkspaceVersion {
        &self.version
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
        self.ctx.wake.fire(());
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    /// The instance of `user_id`, creating one if needed.
    ///
    /// A new user takes over the lowest pool slot's (already running) instance
    /// and the slot is refilled with a fresh name.
    pub fn get_or_create_for_user(&self, user_id: &str) -> InstanceName {
        let owner = InstanceOwner::user(user_id);
        let mut state = self.lock();
        if let Some(existing) = state.assignments.get(&owner).cloned() {
            drop(state);
            self.ctx.idle.touch(&existing);
            self.mark_dirty();
            return existing;
        }

        let spare = state
            .assignments
            .keys()
            .find(|o| matches!(o, InstanceOwner::Unassigned(_)))
            .cloned();
        let name = match spare {
            Some(slot) => {
                let fresh = self.ctx.names.generate(&self.version.reference);
                let name = state
                    .assignments
                    .insert(slot.clone(), fresh.clone())
                    .unwrap_or_else(|| self.ctx.names.generate(&self.version.reference));
                tracing::info!(user = user_id, instance = %name, slot = %slot, refill = %fresh, "pool instance assigned to user");
                name
            }
            None => {
                let name = self.ctx.names.generate(&self.version.reference);
                tracing::info!(user = user_id, instance = %name, "new instance for user");
                name
            }
        };
        state.assignments.insert(owner, name.clone());
        drop(state);

        self.ctx.idle.touch(&name);
        self.mark_dirty();
        name
    }

    /// Shared instances are only created through [`Self::reconcile_owners`].
    pub fn shared_instance(&self, name: &str) -> Option<InstanceName> {
        self.lock()
            .assignments
            .get(&InstanceOwner::shared(name))
            .cloned()
    }

    pub fn instance_of(&self, owner: &InstanceOwner) -> Option<InstanceName> {
        self.lock().assignments.get(owner).cloned()
    }

    pub fn owner_of(&self, instance: &InstanceName) -> Option<InstanceOwner> {
        self.lock()
            .assignments
            .iter()
            .find(|(_, name)| *name == instance)
            .map(|(owner, _)| owner.clone())
    }

    pub fn set_unassigned_pool_size(&self, size: u32, from_user: bool) {
        {
            let mut state = self.lock();
            if from_user {
                state.pool_override = Some(size);
            } else {
                state.pool_auto = Some(size);
            }
        }
        self.reconcile_owners();
    }

    pub fn clear_pool_override(&self) {
        self.lock().pool_override = None;
        self.reconcile_owners();
    }

    pub fn pool_sizes(&self) -> PoolSizes {
        let state = self.lock();
        PoolSizes {
            user_override: state.pool_override,
            auto: state.pool_auto,
            effective: state.effective_pool_size(),
        }
    }

    /// Brings shared and pool owners in line with configuration. User owners
    /// are left alone. Returns whether anything changed.
    pub fn reconcile_owners(&self) -> bool {
        let mut state = self.lock();
        let mut expected: BTreeSet<InstanceOwner> = self
            .version
            .config
            .shared_instances
            .iter()
            .map(|s| InstanceOwner::shared(&s.name))
            .collect();
        expected.extend((0..state.effective_pool_size()).map(InstanceOwner::Unassigned));

        let before = state.assignments.len();
        state.assignments.retain(|owner, _| match owner {
            InstanceOwner::User(_) => true,
            InstanceOwner::Shared(_) | InstanceOwner::Unassigned(_) => expected.contains(owner),
        });
        let mut changed = state.assignments.len() != before;

        for owner in expected {
            if !state.assignments.contains_key(&owner) {
                let name = self.ctx.names.generate(&self.version.reference);
                tracing::debug!(owner = %owner, instance = %name, "owner added");
                state.assignments.insert(owner, name);
                changed = true;
            }
        }
        drop(state);

        if changed {
            self.mark_dirty();
        }
        changed
    }

    /// Drops user assignments whose instance idled longer than `ttl`.
    pub fn remove_timed_out(&self, ttl: Duration) -> Vec<InstanceName> {
        let mut removed = Vec::new();
        {
            let mut state = self.lock();
            state.assignments.retain(|owner, name| {
                let evict = owner.is_idle_evictable() && self.ctx.idle.is_timed_out(name, ttl);
                if evict {
                    removed.push(name.clone());
                }
                !evict
            });
        }
        for name in &removed {
            tracing::info!(instance = %name, "idle instance evicted");
            self.ctx.idle.forget(name);
        }
        if !removed.is_empty() {
            self.mark_dirty();
        }
        removed
    }

    pub fn snapshot(&self) -> Vec<(InstanceOwner, InstanceName)> {
        self.lock()
            .assignments
            .iter()
            .map(|(o, n)| (o.clone(), n.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// All assignment tables, keyed by version hash.
pub struct AssignmentRegistry {
    tables: RwLock<HashMap<WorkspaceHash, Arc<WorkspaceAssignments>>>,
    retired: RwLock<HashSet<WorkspaceHash>>,
    ctx: TableContext,
    idle_ttl: Duration,
    default_pool_size: u32,
}

impl AssignmentRegistry {
    pub fn new(
        names: InstanceNameGenerator,
        idle_ttl: Duration,
        default_pool_size: u32,
        wake: Arc<Trigger<()>>,
    ) -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            retired: RwLock::new(HashSet::new()),
            ctx: TableContext {
                names: Arc::new(names),
                idle: Arc::new(IdleTracker::new()),
                wake,
            },
            idle_ttl,
            default_pool_size,
        }
    }

    pub fn idle(&self) -> &IdleTracker {
        &self.ctx.idle
    }

    pub fn idle_ttl(&self) -> Duration {
        self.idle_ttl
    }

    pub fn instance_prefix(&self) -> &str {
        self.ctx.names.prefix()
    }

    pub fn get(&self, hash: &WorkspaceHash) -> Option<Arc<WorkspaceAssignments>> {
        self.tables
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(hash)
            .cloned()
    }

    /// Whether `hash` belonged to a version that has been superseded. Such
    /// versions never get a table again unless they become the latest one.
    pub fn is_retired(&self, hash: &WorkspaceHash) -> bool {
        self.retired
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(hash)
    }

    pub fn get_or_create(&self, version: &WorkspaceVersion) -> Arc<WorkspaceAssignments> {
        if let Some(table) = self.get(version.hash()) {
            return table;
        }
        let (table, created) = {
            let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
            match tables.get(version.hash()) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let table = Arc::new(WorkspaceAssignments::new(version.clone(), self.ctx.clone()));
                    tables.insert(version.hash().clone(), table.clone());
                    (table, true)
                }
            }
        };
        if created {
            tracing::debug!(workspace = %version.reference, "assignment table created");
            table.reconcile_owners();
        }
        table
    }

    pub fn tables(&self) -> Vec<Arc<WorkspaceAssignments>> {
        self.tables
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Applies the default pool size to the newest version of each workspace.
    pub fn apply_default_pool(&self, latest: &[WorkspaceVersion]) {
        for version in latest {
            self.retired
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .remove(version.hash());
            let table = self.get_or_create(version);
            if table.pool_sizes().auto != Some(self.default_pool_size) {
                table.set_unassigned_pool_size(self.default_pool_size, false);
            }
        }
    }

    /// Retires tables superseded by a newer version of the same workspace once
    /// that version is ready. Pool sizes move to the newer table; user
    /// assignments do not.
    pub fn retire_superseded(
        &self,
        latest: &[WorkspaceVersion],
        is_ready: impl Fn(&WorkspaceVersion) -> bool,
    ) -> Vec<WorkspaceHash> {
        let mut retired = Vec::new();
        for newest in latest {
            let stale: Vec<Arc<WorkspaceAssignments>> = self
                .tables()
                .into_iter()
                .filter(|t| t.version.id() == newest.id() && t.version.hash() != newest.hash())
                .collect();
            if stale.is_empty() || !is_ready(newest) {
                continue;
            }

            let target = self.get_or_create(newest);
            for old in stale {
                let sizes = old.pool_sizes();
                let current = target.pool_sizes();
                if current.user_override.is_none()
                    && let Some(size) = sizes.user_override
                {
                    target.set_unassigned_pool_size(size, true);
                }
                if current.auto.is_none()
                    && let Some(size) = sizes.auto
                {
                    target.set_unassigned_pool_size(size, false);
                }

                self.tables
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(old.version.hash());
                self.retired
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(old.version.hash().clone());
                for (_, name) in old.snapshot() {
                    self.ctx.idle.forget(&name);
                }
                tracing::info!(
                    retired = %old.version.reference,
                    successor = %newest.reference,
                    "workspace version retired"
                );
                retired.push(old.version.hash().clone());
            }
        }
        if !retired.is_empty() {
            self.ctx.wake.fire(());
        }
        retired
    }

    pub fn reconcile_owners(&self) {
        for table in self.tables() {
            table.reconcile_owners();
        }
    }

    pub fn remove_timed_out(&self) -> Vec<InstanceName> {
        self.tables()
            .iter()
            .flat_map(|t| t.remove_timed_out(self.idle_ttl))
            .collect()
    }

    /// Clears every table's dirty flag; true if any was set.
    pub fn take_dirty(&self) -> bool {
        self.tables()
            .iter()
            .fold(false, |any, t| t.take_dirty() || any)
    }

    pub fn find_by_name(&self, name: &InstanceName) -> Option<(Arc<WorkspaceAssignments>, InstanceOwner)> {
        self.tables()
            .into_iter()
            .find_map(|t| t.owner_of(name).map(|owner| (t, owner)))
    }

    pub fn find_by_uuid(&self, id: uuid::Uuid) -> Option<(Arc<WorkspaceAssignments>, InstanceOwner, InstanceName)> {
        self.tables().into_iter().find_map(|t| {
            t.snapshot()
                .into_iter()
                .find(|(_, name)| name.uuid() == id)
                .map(|(owner, name)| (t.clone(), owner, name))
        })
    }
}
