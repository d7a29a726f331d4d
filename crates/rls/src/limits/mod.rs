//! §3 "Limits (per tenant), a value object." All fields optional — absent
//! means "not enforced".

pub mod store;

use serde::{Deserialize, Serialize};

pub use store::TenantLimitsStore;

/// One rate dimension: `rate` tokens/second, burst capacity =
/// `rate * burst_multiplier` (spec §3 invariant: "Rate fields imply a token
/// bucket with burst = rate (configurable multiplier, default 1x)").
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rate {
	pub per_second: u64,
	#[serde(default = "default_burst_multiplier")]
	pub burst_multiplier: f64,
}

fn default_burst_multiplier() -> f64 {
	1.0
}

impl Rate {
	pub fn new(per_second: u64) -> Self {
		Rate {
			per_second,
			burst_multiplier: 1.0,
		}
	}

	pub fn capacity(&self) -> u64 {
		(self.per_second as f64 * self.burst_multiplier).round() as u64
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Limits {
	pub samples_per_second: Option<Rate>,
	pub max_body_bytes: Option<u64>,
	pub max_labels_per_series: Option<u64>,
	pub max_series_per_request: Option<u64>,
	pub max_series_per_metric: Option<u64>,
	pub bytes_per_second: Option<Rate>,
	pub requests_per_second: Option<Rate>,
	#[serde(default = "default_true")]
	pub enforcement_enabled: bool,
	#[serde(default)]
	pub selective_filter_enabled: bool,
}

fn default_true() -> bool {
	true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LimitsError {
	#[error("max_series_per_metric ({per_metric}) must be <= max_series_per_request ({per_request})")]
	MetricCapExceedsRequestCap { per_metric: u64, per_request: u64 },
}

impl Limits {
	/// Process-wide default: unlimited except for nothing — every field is
	/// `None`/disabled. Safety caps are layered on top by config, not baked
	/// in here (spec §3: "its Limits default to 'unlimited except for hard
	/// safety caps' until overrides arrive" — the hard safety caps are
	/// `Config::max_request_bytes_raw`/`_decompressed`, enforced unconditionally
	/// before a tenant's own `Limits` are even consulted).
	pub fn unlimited() -> Self {
		Limits::default()
	}

	/// Validates the §3 invariants that aren't already expressed in the
	/// type system (non-negativity is structural via unsigned ints).
	pub fn validate(&self) -> Result<(), LimitsError> {
		if let (Some(per_metric), Some(per_request)) =
			(self.max_series_per_metric, self.max_series_per_request)
		{
			if per_metric > per_request {
				return Err(LimitsError::MetricCapExceedsRequestCap {
					per_metric,
					per_request,
				});
			}
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn unlimited_has_no_enforced_caps() {
		let l = Limits::unlimited();
		assert!(l.max_body_bytes.is_none());
		assert!(l.samples_per_second.is_none());
		assert!(l.enforcement_enabled);
	}

	#[test]
	fn rejects_metric_cap_above_request_cap() {
		let l = Limits {
			max_series_per_metric: Some(10),
			max_series_per_request: Some(5),
			..Limits::default()
		};
		assert_eq!(
			l.validate(),
			Err(LimitsError::MetricCapExceedsRequestCap {
				per_metric: 10,
				per_request: 5
			})
		);
	}

	#[test]
	fn rate_capacity_applies_burst_multiplier() {
		let r = Rate {
			per_second: 100,
			burst_multiplier: 2.0,
		};
		assert_eq!(r.capacity(), 200);
	}
}
