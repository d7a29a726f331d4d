//! The handful of shared, process-wide objects both gRPC servers close
//! over. Grounded on the teacher's convention of passing one small `Arc`
//! bundle into every server constructor rather than threading individual
//! fields through.

use std::sync::Arc;

use prometheus_client::registry::Registry;

use crate::config::Config;
use crate::counters::CounterEngine;
use crate::inflight::InFlightLimiter;
use crate::limits::TenantLimitsStore;
use crate::metrics::Metrics;

pub struct AppState {
	pub config: Config,
	pub limits: Arc<TenantLimitsStore>,
	pub metrics: Metrics,
	pub registry: Registry,
	pub in_flight: InFlightLimiter,
}

impl AppState {
	pub fn new(config: Config) -> Arc<Self> {
		let counters = Arc::new(CounterEngine::with_ring_size(config.tenants_cap, config.denials_ring_size));
		let limits = Arc::new(TenantLimitsStore::new(config.default_limits.clone(), counters));
		let mut registry = Registry::default();
		let metrics = Metrics::new(&mut registry);
		let in_flight = InFlightLimiter::new(config.in_flight_global, config.in_flight_per_tenant, config.tenants_cap);
		Arc::new(AppState {
			config,
			limits,
			metrics,
			registry,
			in_flight,
		})
	}

	pub fn counters(&self) -> &Arc<CounterEngine> {
		self.limits.counters()
	}
}
