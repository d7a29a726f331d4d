//! §4.2 "Tenant limits store (C2)". An `arc_swap`-backed immutable snapshot
//! pointer: `Lookup` is a single atomic load, `ApplySnapshot` a single
//! atomic store, and `ApplyPatch` takes a small lock only to serialize
//! read-modify-write of the pointer — never to block readers.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rls_core::Atomic;

use super::Limits;
use crate::counters::CounterEngine;
use crate::tenant::TenantId;

pub type Snapshot = Arc<HashMap<TenantId, Arc<Limits>>>;

/// What to do with a single tenant's entry in [`TenantLimitsStore::apply_patch`].
pub enum Patch {
	Upsert(Limits),
	Tombstone,
}

pub struct TenantLimitsStore {
	snapshot: Atomic<HashMap<TenantId, Arc<Limits>>>,
	default_limits: Arc<Limits>,
	/// Serializes writers so concurrent `apply_patch`/`apply_snapshot` calls
	/// never interleave; readers are never blocked by this lock.
	write_lock: Mutex<()>,
	counters: Arc<CounterEngine>,
}

impl TenantLimitsStore {
	pub fn new(default_limits: Limits, counters: Arc<CounterEngine>) -> Self {
		TenantLimitsStore {
			snapshot: Arc::new(arc_swap::ArcSwap::from_pointee(HashMap::new())),
			default_limits: Arc::new(default_limits),
			write_lock: Mutex::new(()),
			counters,
		}
	}

	/// §4.2 "Lookup(tenant_id) -> Limits": returns the process-wide default
	/// for tenants with no override, never a torn read.
	pub fn lookup(&self, tenant: &TenantId) -> Arc<Limits> {
		let snap = self.snapshot.load();
		snap.get(tenant).cloned().unwrap_or_else(|| self.default_limits.clone())
	}

	pub fn default_limits(&self) -> Arc<Limits> {
		self.default_limits.clone()
	}

	pub fn counters(&self) -> &Arc<CounterEngine> {
		&self.counters
	}

	/// §4.2 "ApplySnapshot(map<tenant_id, Limits>) — atomic full replacement."
	/// Reconciles counters for every tenant whose limits actually changed
	/// (§3: "changing samples_per_second keeps the bucket's current tokens
	/// ... a removed rate limit deletes its bucket; a newly added rate limit
	/// starts full").
	pub fn apply_snapshot(&self, new: HashMap<TenantId, Limits>) {
		let _guard = self.write_lock.lock();
		let old = self.snapshot.load_full();

		let mut next: HashMap<TenantId, Arc<Limits>> = HashMap::with_capacity(new.len());
		for (tenant, limits) in new {
			let old_limits = old.get(&tenant);
			if old_limits.map(|o| o.as_ref()) != Some(&limits) {
				self.counters.reconcile(&tenant, old_limits.map(|a| a.as_ref()), Some(&limits));
			}
			next.insert(tenant, Arc::new(limits));
		}

		// Tenants present in the old snapshot but absent from the new one are
		// tombstoned: their buckets go away along with their limits.
		for tenant in old.keys() {
			if !next.contains_key(tenant) {
				self.counters.reconcile(tenant, old.get(tenant).map(|a| a.as_ref()), None);
			}
		}

		self.snapshot.store(Arc::new(next));
	}

	/// §4.2 "ApplyPatch(tenant_id, Limits | tombstone) — atomic single-tenant
	/// update or removal." A later `apply_patch` for the same tenant always
	/// wins (spec: "linearizable with respect to each other").
	pub fn apply_patch(&self, tenant: TenantId, patch: Patch) {
		let _guard = self.write_lock.lock();
		let old = self.snapshot.load_full();
		let old_limits = old.get(&tenant).map(|a| a.as_ref());

		let mut next = HashMap::clone(&old);
		match patch {
			Patch::Upsert(limits) => {
				if old_limits != Some(&limits) {
					self.counters.reconcile(&tenant, old_limits, Some(&limits));
				}
				next.insert(tenant, Arc::new(limits));
			},
			Patch::Tombstone => {
				self.counters.reconcile(&tenant, old_limits, None);
				next.remove(&tenant);
			},
		}
		self.snapshot.store(Arc::new(next));
	}

	pub fn tenant_count(&self) -> usize {
		self.snapshot.load().len()
	}

	#[cfg(test)]
	pub fn snapshot_for_test(&self) -> Snapshot {
		self.snapshot.load_full()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn store() -> TenantLimitsStore {
		TenantLimitsStore::new(Limits::unlimited(), Arc::new(CounterEngine::new(1000)))
	}

	#[test]
	fn unknown_tenant_gets_default() {
		let s = store();
		let l = s.lookup(&TenantId::from("acme"));
		assert_eq!(*l, Limits::unlimited());
	}

	#[test]
	fn patch_upsert_then_lookup() {
		let s = store();
		let limits = Limits {
			max_body_bytes: Some(1024),
			..Limits::default()
		};
		s.apply_patch(TenantId::from("acme"), Patch::Upsert(limits.clone()));
		assert_eq!(*s.lookup(&TenantId::from("acme")), limits);
	}

	#[test]
	fn later_patch_wins() {
		let s = store();
		let tenant = TenantId::from("acme");
		s.apply_patch(
			tenant.clone(),
			Patch::Upsert(Limits {
				max_body_bytes: Some(1),
				..Limits::default()
			}),
		);
		s.apply_patch(
			tenant.clone(),
			Patch::Upsert(Limits {
				max_body_bytes: Some(2),
				..Limits::default()
			}),
		);
		assert_eq!(s.lookup(&tenant).max_body_bytes, Some(2));
	}

	#[test]
	fn tombstone_removes_override() {
		let s = store();
		let tenant = TenantId::from("acme");
		s.apply_patch(
			tenant.clone(),
			Patch::Upsert(Limits {
				max_body_bytes: Some(1),
				..Limits::default()
			}),
		);
		s.apply_patch(tenant.clone(), Patch::Tombstone);
		assert_eq!(*s.lookup(&tenant), Limits::unlimited());
	}

	#[test]
	fn snapshot_replace_is_atomic_whole_map() {
		let s = store();
		let mut m = HashMap::new();
		m.insert(
			TenantId::from("a"),
			Limits {
				max_body_bytes: Some(1),
				..Limits::default()
			},
		);
		s.apply_snapshot(m);
		assert_eq!(s.tenant_count(), 1);

		let mut m2 = HashMap::new();
		m2.insert(
			TenantId::from("b"),
			Limits {
				max_body_bytes: Some(2),
				..Limits::default()
			},
		);
		s.apply_snapshot(m2);
		// "a" was tombstoned by the full replacement.
		assert_eq!(s.tenant_count(), 1);
		assert_eq!(*s.lookup(&TenantId::from("a")), Limits::unlimited());
		assert_eq!(s.lookup(&TenantId::from("b")).max_body_bytes, Some(2));
	}
}
