//! §5 "Backpressure": bounds how many requests may be decoding/charging at
//! once, per tenant and process-wide, so a burst cannot grow memory without
//! bound while C1/C4 work is in progress. Modeled on the pack's
//! semaphore-backed backpressure gate (`Arc<Semaphore>` +
//! `try_acquire_owned`, never blocking — a full semaphore means "reject
//! now", not "queue").

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::tenant::TenantId;

/// Held for the lifetime of one `check()` call; dropping it releases
/// whichever permits were taken regardless of which return path the caller
/// took. `_tenant` is `None` only in the fail-open case where the tenant
/// table is full and the request is admitted on the global semaphore alone.
pub struct InFlightPermit {
	_global: OwnedSemaphorePermit,
	_tenant: Option<OwnedSemaphorePermit>,
}

pub struct InFlightLimiter {
	global: Arc<Semaphore>,
	per_tenant: DashMap<TenantId, Arc<Semaphore>>,
	per_tenant_cap: usize,
	tenants_cap: usize,
	cap_warned: AtomicBool,
}

impl InFlightLimiter {
	/// `tenants_cap` bounds the `per_tenant` table the same way
	/// `CounterEngine::tenants_cap` bounds its own tenant map, so a client
	/// that varies its tenant header can't grow this table without bound —
	/// once full, new tenants are admitted on the global semaphore alone.
	pub fn new(global_cap: usize, per_tenant_cap: usize, tenants_cap: usize) -> Self {
		InFlightLimiter {
			global: Arc::new(Semaphore::new(global_cap)),
			per_tenant: DashMap::new(),
			per_tenant_cap,
			tenants_cap,
			cap_warned: AtomicBool::new(false),
		}
	}

	/// `None` means either the global or the per-tenant cap is currently
	/// exhausted; the caller must reject the request with
	/// `RESOURCE_EXHAUSTED` rather than wait for a permit to free up (§5:
	/// "exceeding the cap returns `RESOURCE_EXHAUSTED` to the proxy").
	pub fn try_acquire(&self, tenant: &TenantId) -> Option<InFlightPermit> {
		let global = Arc::clone(&self.global).try_acquire_owned().ok()?;

		if let Some(existing) = self.per_tenant.get(tenant) {
			let tenant_permit = existing.clone().try_acquire_owned().ok()?;
			return Some(InFlightPermit {
				_global: global,
				_tenant: Some(tenant_permit),
			});
		}

		if self.per_tenant.len() >= self.tenants_cap {
			if !self.cap_warned.swap(true, Ordering::Relaxed) {
				tracing::warn!(cap = self.tenants_cap, "in-flight tenant table full; admitting without a per-tenant cap");
			}
			return Some(InFlightPermit { _global: global, _tenant: None });
		}

		let tenant_semaphore = self
			.per_tenant
			.entry(tenant.clone())
			.or_insert_with(|| Arc::new(Semaphore::new(self.per_tenant_cap)))
			.clone();
		let tenant_permit = tenant_semaphore.try_acquire_owned().ok()?;
		Some(InFlightPermit {
			_global: global,
			_tenant: Some(tenant_permit),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn exhausted_per_tenant_cap_rejects_further_acquires() {
		let limiter = InFlightLimiter::new(10, 1, 100);
		let tenant = TenantId::from("acme");
		let first = limiter.try_acquire(&tenant);
		assert!(first.is_some());
		assert!(limiter.try_acquire(&tenant).is_none());
		drop(first);
		assert!(limiter.try_acquire(&tenant).is_some());
	}

	#[test]
	fn exhausted_global_cap_rejects_even_a_fresh_tenant() {
		let limiter = InFlightLimiter::new(1, 10, 100);
		let _held = limiter.try_acquire(&TenantId::from("acme")).unwrap();
		assert!(limiter.try_acquire(&TenantId::from("other")).is_none());
	}

	#[test]
	fn full_tenant_table_admits_new_tenants_on_the_global_semaphore_alone() {
		let limiter = InFlightLimiter::new(10, 1, 1);
		let _first = limiter.try_acquire(&TenantId::from("acme")).unwrap();
		// The table is now at its cap of 1; a second, distinct tenant still
		// gets in because the per-tenant table no longer grows.
		assert!(limiter.try_acquire(&TenantId::from("other")).is_some());
	}
}
