//! §4.3 "Counter engine (C3)": per-tenant token buckets, the rolling
//! request/sample gauges, aggregate totals, and the process-wide denial
//! ring. Owned by [`crate::limits::TenantLimitsStore`], which calls
//! [`CounterEngine::reconcile`] whenever a tenant's `Limits` change so that
//! "counter objects survive a `Limits` change" (§4.2) without the request
//! path ever needing to know about it.

pub mod bucket;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::ReasonCode;
use crate::limits::Limits;
use crate::tenant::TenantId;
use bucket::{ChargeResult, TokenBucket};

const ROLLING_WINDOW_SLOTS: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeOutcome {
	Ok,
	Denied { dimension: &'static str },
}

/// §3 "Denial record", plus the non-fatal `selective_filter_applied` kind
/// from §4.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
	Denied(ReasonCode),
	SelectiveFilterApplied,
}

#[derive(Debug, Clone)]
pub struct DenialRecord {
	pub tenant: TenantId,
	pub kind: RecordKind,
	pub timestamp: SystemTime,
	pub observed_body_bytes: u64,
	pub observed_samples: u64,
	pub observed_series: u64,
	pub excess_kind: Option<&'static str>,
	pub excess_amount: Option<u64>,
}

/// One one-second slot per bucketed second; summed over the live 60 to get
/// a one-minute rolling rate (§4.3 "Request-level gauges").
#[derive(Debug)]
struct RollingWindow {
	requests: [u64; ROLLING_WINDOW_SLOTS],
	samples: [u64; ROLLING_WINDOW_SLOTS],
	slot_start: Instant,
	index: usize,
}

impl RollingWindow {
	fn new(now: Instant) -> Self {
		RollingWindow {
			requests: [0; ROLLING_WINDOW_SLOTS],
			samples: [0; ROLLING_WINDOW_SLOTS],
			slot_start: now,
			index: 0,
		}
	}

	fn advance(&mut self, now: Instant) {
		let elapsed_secs = now.saturating_duration_since(self.slot_start).as_secs();
		if elapsed_secs == 0 {
			return;
		}
		let slots_to_clear = elapsed_secs.min(ROLLING_WINDOW_SLOTS as u64) as usize;
		for i in 1..=slots_to_clear {
			let idx = (self.index + i) % ROLLING_WINDOW_SLOTS;
			self.requests[idx] = 0;
			self.samples[idx] = 0;
		}
		self.index = (self.index + slots_to_clear) % ROLLING_WINDOW_SLOTS;
		self.slot_start = now;
	}

	fn record(&mut self, now: Instant, samples: u64) {
		self.advance(now);
		self.requests[self.index] += 1;
		self.samples[self.index] += samples;
	}

	fn rates_per_second(&self) -> (f64, f64) {
		let total_requests: u64 = self.requests.iter().sum();
		let total_samples: u64 = self.samples.iter().sum();
		(
			total_requests as f64 / ROLLING_WINDOW_SLOTS as f64,
			total_samples as f64 / ROLLING_WINDOW_SLOTS as f64,
		)
	}
}

#[derive(Debug, Default)]
struct Buckets {
	samples: Option<TokenBucket>,
	bytes: Option<TokenBucket>,
	requests: Option<TokenBucket>,
}

impl Buckets {
	fn from_limits(limits: &Limits, now: Instant) -> Self {
		Buckets {
			samples: limits.samples_per_second.map(|r| TokenBucket::new(r, now)),
			bytes: limits.bytes_per_second.map(|r| TokenBucket::new(r, now)),
			requests: limits.requests_per_second.map(|r| TokenBucket::new(r, now)),
		}
	}

	/// §4.2: a changed rate retunes the existing bucket in place (tokens
	/// survive); a removed rate deletes the bucket; a newly added rate
	/// starts full.
	fn retune(&mut self, limits: &Limits, now: Instant) {
		retune_one(&mut self.samples, limits.samples_per_second, now);
		retune_one(&mut self.bytes, limits.bytes_per_second, now);
		retune_one(&mut self.requests, limits.requests_per_second, now);
	}

	/// §4.3 "Atomic charge": pre-check every active bucket, then commit only
	/// if all would succeed.
	fn try_charge_all(&mut self, samples: f64, bytes: f64, now: Instant) -> ChargeOutcome {
		if let Some(b) = &mut self.samples {
			if let ChargeResult::Denied { .. } = b.peek(samples, now) {
				return ChargeOutcome::Denied { dimension: "samples" };
			}
		}
		if let Some(b) = &mut self.bytes {
			if let ChargeResult::Denied { .. } = b.peek(bytes, now) {
				return ChargeOutcome::Denied { dimension: "bytes" };
			}
		}
		if let Some(b) = &mut self.requests {
			if let ChargeResult::Denied { .. } = b.peek(1.0, now) {
				return ChargeOutcome::Denied { dimension: "requests" };
			}
		}
		if let Some(b) = &mut self.samples {
			b.commit(samples);
		}
		if let Some(b) = &mut self.bytes {
			b.commit(bytes);
		}
		if let Some(b) = &mut self.requests {
			b.commit(1.0);
		}
		ChargeOutcome::Ok
	}
}

fn retune_one(slot: &mut Option<TokenBucket>, rate: Option<crate::limits::Rate>, now: Instant) {
	match (slot.as_mut(), rate) {
		(Some(bucket), Some(r)) => bucket.retune(r, now),
		(None, Some(r)) => *slot = Some(TokenBucket::new(r, now)),
		(Some(_), None) => *slot = None,
		(None, None) => {},
	}
}

pub struct TenantCounters {
	buckets: Mutex<Buckets>,
	rolling: Mutex<RollingWindow>,
	allowed: AtomicU64,
	denied: AtomicU64,
	filtered_series: AtomicU64,
	filtered_samples: AtomicU64,
}

impl TenantCounters {
	fn new(limits: &Limits, now: Instant) -> Self {
		TenantCounters {
			buckets: Mutex::new(Buckets::from_limits(limits, now)),
			rolling: Mutex::new(RollingWindow::new(now)),
			allowed: AtomicU64::new(0),
			denied: AtomicU64::new(0),
			filtered_series: AtomicU64::new(0),
			filtered_samples: AtomicU64::new(0),
		}
	}

	fn retune(&self, limits: &Limits, now: Instant) {
		self.buckets.lock().retune(limits, now);
	}

	pub fn rates_per_second(&self) -> (f64, f64) {
		self.rolling.lock().rates_per_second()
	}

	pub fn totals(&self) -> (u64, u64, u64, u64) {
		(
			self.allowed.load(Ordering::Relaxed),
			self.denied.load(Ordering::Relaxed),
			self.filtered_series.load(Ordering::Relaxed),
			self.filtered_samples.load(Ordering::Relaxed),
		)
	}
}

pub struct CounterEngine {
	tenants: DashMap<TenantId, Arc<TenantCounters>>,
	tenants_cap: usize,
	cap_warned: AtomicBool,
	denials: Mutex<VecDeque<DenialRecord>>,
	denials_ring_size: usize,
}

impl CounterEngine {
	pub fn new(tenants_cap: usize) -> Self {
		CounterEngine::with_ring_size(tenants_cap, 10_000)
	}

	pub fn with_ring_size(tenants_cap: usize, denials_ring_size: usize) -> Self {
		CounterEngine {
			tenants: DashMap::new(),
			tenants_cap,
			cap_warned: AtomicBool::new(false),
			denials: Mutex::new(VecDeque::with_capacity(denials_ring_size.min(1024))),
			denials_ring_size,
		}
	}

	/// §4.2's store-driven reconciliation hook: applies a `Limits` change
	/// (or removal, on `new = None`) to the tenant's counter state without
	/// resetting unrelated buckets.
	pub fn reconcile(&self, tenant: &TenantId, _old: Option<&Limits>, new: Option<&Limits>) {
		match new {
			None => {
				self.tenants.remove(tenant);
			},
			Some(limits) => {
				let now = Instant::now();
				let entry = self
					.tenants
					.entry(tenant.clone())
					.or_insert_with(|| Arc::new(TenantCounters::new(limits, now)));
				entry.retune(limits, now);
			},
		}
	}

	fn get_or_create(&self, tenant: &TenantId, limits: &Limits) -> Option<Arc<TenantCounters>> {
		if let Some(existing) = self.tenants.get(tenant) {
			return Some(existing.clone());
		}
		if self.tenants.len() >= self.tenants_cap {
			tracing::warn!(%tenant, cap = self.tenants_cap, "tenant counter table full; admitting without per-tenant rate limits");
			return None;
		}
		let warn_threshold = (self.tenants_cap as f64 * 0.8) as usize;
		if self.tenants.len() + 1 >= warn_threshold && !self.cap_warned.swap(true, Ordering::Relaxed) {
			tracing::warn!(tenants = self.tenants.len() + 1, cap = self.tenants_cap, "tenant counter table 80% full");
		}
		let now = Instant::now();
		let entry = self
			.tenants
			.entry(tenant.clone())
			.or_insert_with(|| Arc::new(TenantCounters::new(limits, now)));
		Some(entry.clone())
	}

	/// §4.3 "Multiple buckets must be charged all-or-nothing." A tenant
	/// beyond the cap is admitted unconditionally (documented fail-open).
	pub fn try_charge_all(
		&self,
		tenant: &TenantId,
		limits: &Limits,
		samples: u64,
		bytes_decompressed: u64,
	) -> ChargeOutcome {
		let Some(counters) = self.get_or_create(tenant, limits) else {
			return ChargeOutcome::Ok;
		};
		let now = Instant::now();
		counters.rolling.lock().record(now, samples);
		counters.buckets.lock().try_charge_all(samples as f64, bytes_decompressed as f64, now)
	}

	/// Descriptor-based single-dimension charge for C7 (no body to derive
	/// samples/bytes from — just `hits_addend` against one named dimension).
	pub fn try_charge_dimension(
		&self,
		tenant: &TenantId,
		limits: &Limits,
		dimension: &str,
		hits: u64,
	) -> ChargeOutcome {
		let Some(counters) = self.get_or_create(tenant, limits) else {
			return ChargeOutcome::Ok;
		};
		let now = Instant::now();
		let mut buckets = counters.buckets.lock();
		let slot = match dimension {
			"samples" => &mut buckets.samples,
			"bytes" => &mut buckets.bytes,
			"requests" => &mut buckets.requests,
			_ => return ChargeOutcome::Ok,
		};
		match slot {
			None => ChargeOutcome::Ok,
			Some(bucket) => match bucket.peek(hits as f64, now) {
				ChargeResult::Ok { .. } => {
					bucket.commit(hits as f64);
					ChargeOutcome::Ok
				},
				ChargeResult::Denied { .. } => ChargeOutcome::Denied {
					dimension: "descriptor",
				},
			},
		}
	}

	/// Commits the charge a selective filter actually produced, after
	/// `try_charge_all` denied the unfiltered write on the samples
	/// dimension. The first call never commits anything (it aborts at the
	/// first denied peek), so this is the only place that debits the
	/// bucket for a filtered request — without it the samples bucket would
	/// stay at its pre-charge token count forever (§8 scenario 3: "bucket
	/// tokens=0" after keeping exactly the affordable 800 samples).
	pub fn charge_filtered(&self, tenant: &TenantId, kept_samples: u64, bytes_decompressed: u64) -> ChargeOutcome {
		let Some(counters) = self.tenants.get(tenant) else {
			return ChargeOutcome::Ok;
		};
		let now = Instant::now();
		counters.buckets.lock().try_charge_all(kept_samples as f64, bytes_decompressed as f64, now)
	}

	/// Current token count for one dimension after a lazy refill, without
	/// charging anything. Used by the decision engine to size a
	/// selective-filter sample-drop schedule against what the bucket
	/// actually has *now*, not its nominal capacity.
	pub fn tokens_available(&self, tenant: &TenantId, dimension: &str) -> Option<f64> {
		let counters = self.tenants.get(tenant)?;
		let now = Instant::now();
		let mut buckets = counters.buckets.lock();
		let slot = match dimension {
			"samples" => &mut buckets.samples,
			"bytes" => &mut buckets.bytes,
			"requests" => &mut buckets.requests,
			_ => return None,
		};
		let bucket = slot.as_mut()?;
		bucket.peek(0.0, now);
		Some(bucket.tokens())
	}

	pub fn record_allowed(&self, tenant: &TenantId) {
		if let Some(c) = self.tenants.get(tenant) {
			c.allowed.fetch_add(1, Ordering::Relaxed);
		}
	}

	/// Unlike `record_allowed`, this must create the tenant's counters if
	/// they don't exist yet: a deny that happens before any charge runs
	/// (body-too-large, malformed protobuf) never touches `get_or_create`
	/// otherwise, so `denied_requests` would silently stay at zero for a
	/// tenant whose very first request is rejected.
	pub fn record_denied(&self, tenant: &TenantId, limits: &Limits) {
		if let Some(c) = self.get_or_create(tenant, limits) {
			c.denied.fetch_add(1, Ordering::Relaxed);
		}
	}

	pub fn record_filtered(&self, tenant: &TenantId, limits: &Limits, series: u64, samples: u64) {
		if let Some(c) = self.get_or_create(tenant, limits) {
			c.filtered_series.fetch_add(series, Ordering::Relaxed);
			c.filtered_samples.fetch_add(samples, Ordering::Relaxed);
		}
	}

	pub fn totals(&self, tenant: &TenantId) -> Option<(u64, u64, u64, u64)> {
		self.tenants.get(tenant).map(|c| c.totals())
	}

	pub fn rates_per_second(&self, tenant: &TenantId) -> Option<(f64, f64)> {
		self.tenants.get(tenant).map(|c| c.rates_per_second())
	}

	/// §3 "Denial record ... Bounded ring buffer (default 10,000)" — shared
	/// across all tenants, overwritten oldest-first on overflow.
	pub fn record_denial(&self, record: DenialRecord) {
		let mut ring = self.denials.lock();
		if ring.len() >= self.denials_ring_size {
			ring.pop_front();
		}
		ring.push_back(record);
	}

	pub fn recent_denials(&self) -> Vec<DenialRecord> {
		self.denials.lock().iter().cloned().collect()
	}

	pub fn tenant_count(&self) -> usize {
		self.tenants.len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::limits::Rate;

	fn limits_with_samples(per_second: u64) -> Limits {
		Limits {
			samples_per_second: Some(Rate::new(per_second)),
			..Limits::default()
		}
	}

	#[test]
	fn charge_within_budget_succeeds() {
		let engine = CounterEngine::new(10);
		let tenant = TenantId::from("acme");
		let limits = limits_with_samples(1000);
		assert_eq!(engine.try_charge_all(&tenant, &limits, 500, 0), ChargeOutcome::Ok);
	}

	#[test]
	fn charge_over_budget_is_all_or_nothing() {
		let engine = CounterEngine::new(10);
		let tenant = TenantId::from("acme");
		let limits = Limits {
			samples_per_second: Some(Rate::new(1000)),
			bytes_per_second: Some(Rate::new(1_000_000)),
			..Limits::default()
		};
		// Drain the samples bucket via a request-sized charge, then attempt
		// a second charge that would succeed on bytes but not on samples.
		assert_eq!(engine.try_charge_all(&tenant, &limits, 1000, 10), ChargeOutcome::Ok);
		let outcome = engine.try_charge_all(&tenant, &limits, 1, 10);
		assert_eq!(
			outcome,
			ChargeOutcome::Denied {
				dimension: "samples"
			}
		);
	}

	#[test]
	fn tenant_cap_admits_without_limits() {
		let engine = CounterEngine::new(1);
		let limits = limits_with_samples(1);
		assert_eq!(
			engine.try_charge_all(&TenantId::from("a"), &limits, 1_000_000, 0),
			ChargeOutcome::Denied {
				dimension: "samples"
			}
		);
		// Second distinct tenant is beyond the cap: fail-open.
		assert_eq!(engine.try_charge_all(&TenantId::from("b"), &limits, 1_000_000, 0), ChargeOutcome::Ok);
	}

	#[test]
	fn reconcile_removes_bucket_when_rate_dropped() {
		let engine = CounterEngine::new(10);
		let tenant = TenantId::from("acme");
		let with_rate = limits_with_samples(1000);
		engine.reconcile(&tenant, None, Some(&with_rate));
		engine.reconcile(&tenant, Some(&with_rate), Some(&Limits::default()));
		// No samples bucket left: any charge succeeds regardless of volume.
		assert_eq!(engine.try_charge_all(&tenant, &Limits::default(), 10_000_000, 0), ChargeOutcome::Ok);
	}

	#[test]
	fn denial_ring_overwrites_oldest() {
		let engine = CounterEngine::with_ring_size(10, 2);
		for i in 0..3u64 {
			engine.record_denial(DenialRecord {
				tenant: TenantId::from("acme"),
				kind: RecordKind::Denied(ReasonCode::RateLimitExceeded),
				timestamp: SystemTime::now(),
				observed_body_bytes: i,
				observed_samples: 0,
				observed_series: 0,
				excess_kind: None,
				excess_amount: None,
			});
		}
		let recent = engine.recent_denials();
		assert_eq!(recent.len(), 2);
		assert_eq!(recent[0].observed_body_bytes, 1);
		assert_eq!(recent[1].observed_body_bytes, 2);
	}
}
