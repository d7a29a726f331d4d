//! Process metrics named in the spec's scenario assertions
//! (`rls_decisions_total{decision="would_deny"}`) and design notes
//! (`rls_sync_staleness_seconds`). Registration only — binding an HTTP
//! `/metrics` endpoint is explicitly out of scope.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
pub struct DecisionLabels {
	pub decision: &'static str,
	pub reason: &'static str,
}

pub struct Metrics {
	pub decisions_total: Family<DecisionLabels, Counter>,
	pub filter_dropped_series_total: Counter,
	pub filter_dropped_samples_total: Counter,
	pub sync_staleness_seconds: Gauge<f64, std::sync::atomic::AtomicU64>,
	pub tenant_count: Gauge,
}

impl Metrics {
	pub fn new(registry: &mut Registry) -> Self {
		let decisions_total = Family::<DecisionLabels, Counter>::default();
		registry.register("rls_decisions_total", "Decisions made by the authorization server", decisions_total.clone());

		let filter_dropped_series_total = Counter::default();
		registry.register(
			"rls_filter_dropped_series_total",
			"Series dropped by the selective filter",
			filter_dropped_series_total.clone(),
		);

		let filter_dropped_samples_total = Counter::default();
		registry.register(
			"rls_filter_dropped_samples_total",
			"Samples dropped by the selective filter",
			filter_dropped_samples_total.clone(),
		);

		let sync_staleness_seconds = Gauge::<f64, std::sync::atomic::AtomicU64>::default();
		registry.register(
			"rls_sync_staleness_seconds",
			"Seconds since the last successful overrides sync",
			sync_staleness_seconds.clone(),
		);

		let tenant_count = Gauge::default();
		registry.register("rls_tenant_count", "Distinct tenants tracked by the counter engine", tenant_count.clone());

		Metrics {
			decisions_total,
			filter_dropped_series_total,
			filter_dropped_samples_total,
			sync_staleness_seconds,
			tenant_count,
		}
	}

	pub fn record_decision(&self, decision: &'static str, reason: &'static str) {
		self.decisions_total.get_or_create(&DecisionLabels { decision, reason }).inc();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn registers_without_panicking() {
		let mut registry = Registry::default();
		let metrics = Metrics::new(&mut registry);
		metrics.record_decision("allow", "");
		metrics.record_decision("would_deny", "rate_limit_exceeded");
	}
}
