//! §4.4 "Decision engine (C4)". Stateless: takes a parsed payload, a tenant's
//! `Limits` snapshot, and a charge function: produces a `Decision` plus the
//! denial/filter records to append. The fixed evaluation order and the
//! tie-break rule (stable sort by `(metric_name, label_set_hash)`, original
//! index breaks remaining ties) are load-bearing for the determinism
//! invariant in §8 — do not reorder the `evaluate` steps.

use crate::codec::ParsedWrite;
use crate::counters::{ChargeOutcome, CounterEngine};
use crate::error::{DenyInfo, ReasonCode};
use crate::filter::Edit;
use crate::hash::label_set_hash;
use crate::limits::Limits;
use crate::tenant::TenantId;

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
	Allow { matched_limits: Vec<&'static str> },
	Deny(DenyInfo),
	/// `reason` names the dimension/cap whose overrun produced these edits
	/// (`"max_labels_per_series"`, `"max_series_per_request"`,
	/// `"max_series_per_metric"`, or `"samples"` for the rate-charge
	/// fallback) — the first one to fire in evaluation order, since that's
	/// the one the operator needs to act on first.
	SelectiveFilter { edits: Vec<Edit>, reason: &'static str },
}

/// §4.4 "Enforcement-disabled mode ... records the would-be decision, but
/// always returns ALLOW." Carries the real `Decision` for observability even
/// when the caller must respond with `Allow`.
pub struct Evaluation {
	pub decision: Decision,
	pub would_have: Option<Decision>,
}

/// One entry per series, carrying enough to rank and group without
/// recomputing the label hash twice.
struct RankedSeries<'a> {
	index: usize,
	metric_name: &'a str,
	label_hash: u64,
	label_count: usize,
	sample_count: usize,
}

pub fn evaluate(tenant: &TenantId, write: &ParsedWrite, limits: &Limits, counters: &CounterEngine) -> Evaluation {
	let decision = evaluate_inner(tenant, write, limits, counters);
	if limits.enforcement_enabled {
		Evaluation {
			decision,
			would_have: None,
		}
	} else {
		Evaluation {
			decision: Decision::Allow {
				matched_limits: Vec::new(),
			},
			would_have: Some(decision),
		}
	}
}

fn evaluate_inner(tenant: &TenantId, write: &ParsedWrite, limits: &Limits, counters: &CounterEngine) -> Decision {
	// 1. Body size cap.
	if let Some(cap) = limits.max_body_bytes {
		if write.body_bytes_raw > cap {
			return Decision::Deny(DenyInfo::new(
				ReasonCode::BodySizeExceeded,
				format!("body {} bytes exceeds cap {cap}", write.body_bytes_raw),
			));
		}
	}

	let ranked = rank_series(write);
	let mut edits = Vec::new();
	let mut filter_reason: Option<&'static str> = None;

	// 2. Labels-per-series cap.
	if let Some(cap) = limits.max_labels_per_series {
		let offenders: Vec<usize> = ranked
			.iter()
			.filter(|s| s.label_count as u64 > cap)
			.map(|s| s.index)
			.collect();
		if !offenders.is_empty() {
			if limits.selective_filter_enabled {
				filter_reason.get_or_insert("max_labels_per_series");
				edits.extend(offenders.into_iter().map(Edit::DropSeries));
			} else {
				return Decision::Deny(DenyInfo::new(
					ReasonCode::LabelsPerSeriesExceeded,
					format!("series exceeds max_labels_per_series={cap}"),
				));
			}
		}
	}

	// 3. Series-per-request cap: drop the lowest-ranked tail after a stable
	// sort by (metric_name, label_hash).
	if let Some(cap) = limits.max_series_per_request {
		let remaining = ranked.len() as u64 - edits.len() as u64;
		if remaining > cap {
			if limits.selective_filter_enabled {
				filter_reason.get_or_insert("max_series_per_request");
				let mut sorted: Vec<&RankedSeries> =
					ranked.iter().filter(|s| !edits.contains(&Edit::DropSeries(s.index))).collect();
				sorted.sort_by(|a, b| (a.metric_name, a.label_hash).cmp(&(b.metric_name, b.label_hash)));
				let excess = (remaining - cap) as usize;
				for s in sorted.into_iter().rev().take(excess) {
					edits.push(Edit::DropSeries(s.index));
				}
			} else {
				return Decision::Deny(DenyInfo::new(
					ReasonCode::SeriesPerRequestExceeded,
					format!("series_count exceeds max_series_per_request={cap}"),
				));
			}
		}
	}

	// 4. Series-per-metric cap: lowest-hash-first drop within the offending
	// metric.
	if let Some(cap) = limits.max_series_per_metric {
		use std::collections::HashMap;
		let mut per_metric: HashMap<&str, Vec<&RankedSeries>> = HashMap::new();
		for s in ranked.iter().filter(|s| !edits.contains(&Edit::DropSeries(s.index))) {
			per_metric.entry(s.metric_name).or_default().push(s);
		}
		let mut metric_names: Vec<&&str> = per_metric.keys().collect();
		metric_names.sort();
		for metric_name in metric_names {
			let group = &per_metric[metric_name];
			if group.len() as u64 > cap {
				if limits.selective_filter_enabled {
					filter_reason.get_or_insert("max_series_per_metric");
					let mut sorted = group.clone();
					sorted.sort_by_key(|s| s.label_hash);
					let excess = group.len() - cap as usize;
					for s in sorted.into_iter().take(excess) {
						edits.push(Edit::DropSeries(s.index));
					}
				} else {
					return Decision::Deny(DenyInfo::new(
						ReasonCode::SeriesPerMetricExceeded,
						format!("metric {metric_name} exceeds max_series_per_metric={cap}"),
					));
				}
			}
		}
	}

	// 5. Rate charge: samples / bytes_decompressed / one request, all-or-nothing.
	let outcome = counters.try_charge_all(tenant, limits, write.samples_count(), write.body_bytes_decompressed);
	if let ChargeOutcome::Denied { dimension } = outcome {
		if limits.selective_filter_enabled && dimension == "samples" {
			filter_reason.get_or_insert("samples");
			let budget = counters.tokens_available(tenant, "samples").unwrap_or(0.0) as u64;
			edits.extend(schedule_sample_drops(&ranked, &edits, budget));
			// `try_charge_all` aborted at the first denied peek and committed
			// nothing, so the reduced write this filter actually produces
			// still has to be charged for real. If the filtered write still
			// doesn't fit (e.g. bytes_per_second independently over budget,
			// a dimension the first peek never reached), deny outright
			// rather than let an uncharged write through.
			let kept_samples = kept_sample_count(&ranked, &edits);
			if let ChargeOutcome::Denied { dimension } = counters.charge_filtered(tenant, kept_samples, write.body_bytes_decompressed) {
				return Decision::Deny(
					DenyInfo::new(
						ReasonCode::RateLimitExceeded,
						format!("rate limit exceeded on dimension={dimension} after selective filtering"),
					)
					.with_dimension(dimension),
				);
			}
		} else {
			return Decision::Deny(
				DenyInfo::new(ReasonCode::RateLimitExceeded, format!("rate limit exceeded on dimension={dimension}"))
					.with_dimension(dimension),
			);
		}
	}

	if edits.is_empty() {
		Decision::Allow {
			matched_limits: Vec::new(),
		}
	} else {
		edits.sort_by_key(edit_sort_key);
		Decision::SelectiveFilter {
			edits,
			reason: filter_reason.unwrap_or("samples"),
		}
	}
}

fn edit_sort_key(edit: &Edit) -> usize {
	match edit {
		Edit::DropSeries(i) => *i,
		Edit::DropSamples(i, _) => *i,
	}
}

/// §4.4 step 5 fallback: "drop whole series first by lowest hash;
/// partial-sample drops only from the tail of each remaining series" — here
/// "tail" means latest-in-time, since truncation always keeps the earliest
/// `keep_n` samples (§4.5). `budget` is the samples bucket's *current*
/// token count, not its nominal capacity — "schedule drop of samples until
/// the write fits" means fits the tokens on hand right now.
fn schedule_sample_drops(ranked: &[RankedSeries], existing: &[Edit], budget: u64) -> Vec<Edit> {
	let mut remaining_series: Vec<&RankedSeries> = ranked.iter().filter(|s| !existing.contains(&Edit::DropSeries(s.index))).collect();
	remaining_series.sort_by_key(|s| s.label_hash);

	let mut new_edits = Vec::new();
	// Drop whole series, lowest hash first, until the remainder fits the
	// budget; the series that straddles the boundary is truncated instead
	// of dropped, and everything after it (higher hash) is left untouched.
	let mut running: u64 = remaining_series.iter().map(|s| s.sample_count as u64).sum();
	for series in remaining_series {
		if running <= budget {
			break;
		}
		let count = series.sample_count as u64;
		if running - count >= budget {
			new_edits.push(Edit::DropSeries(series.index));
			running -= count;
		} else {
			let keep_n = count - (running - budget);
			new_edits.push(Edit::DropSamples(series.index, keep_n));
			break;
		}
	}
	new_edits
}

/// Sums the samples that will actually survive `edits`: a series named in a
/// `DropSeries` edit contributes nothing, one named in a `DropSamples` edit
/// contributes its truncated count, everything else contributes its full
/// count.
fn kept_sample_count(ranked: &[RankedSeries], edits: &[Edit]) -> u64 {
	ranked
		.iter()
		.filter_map(|s| {
			for edit in edits {
				match edit {
					Edit::DropSeries(i) if *i == s.index => return None,
					Edit::DropSamples(i, keep_n) if *i == s.index => return Some(*keep_n),
					_ => {},
				}
			}
			Some(s.sample_count as u64)
		})
		.sum()
}

fn rank_series(write: &ParsedWrite) -> Vec<RankedSeries<'_>> {
	write
		.series
		.iter()
		.enumerate()
		.map(|(index, s)| RankedSeries {
			index,
			metric_name: s.metric_name.as_str(),
			label_hash: label_set_hash(s.labels.iter().map(|(k, v)| (k.as_str(), v.as_str()))),
			label_count: s.label_count,
			sample_count: s.samples.len(),
		})
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::codec::ParsedSeries;
	use crate::limits::Rate;

	fn series(name: &str, n_samples: usize) -> ParsedSeries {
		ParsedSeries {
			labels: vec![("__name__".to_string(), name.to_string())],
			samples: (0..n_samples).map(|i| (1.0, i as i64)).collect(),
			metric_name: name.to_string(),
			label_count: 1,
		}
	}

	#[test]
	fn body_over_cap_denies() {
		let write = ParsedWrite {
			series: vec![series("up", 1)],
			body_bytes_raw: 1_200_000,
			body_bytes_decompressed: 1_200_000,
			encoding: None,
		};
		let limits = Limits {
			max_body_bytes: Some(1_048_576),
			..Limits::default()
		};
		let counters = CounterEngine::new(10);
		let decision = evaluate_inner(&TenantId::from("acme"), &write, &limits, &counters);
		assert_eq!(
			decision,
			Decision::Deny(DenyInfo::new(ReasonCode::BodySizeExceeded, "body 1200000 bytes exceeds cap 1048576"))
		);
	}

	#[test]
	fn rate_limit_without_filter_denies() {
		let write = ParsedWrite {
			series: vec![series("up", 1500)],
			body_bytes_raw: 10,
			body_bytes_decompressed: 10,
			encoding: None,
		};
		let limits = Limits {
			samples_per_second: Some(Rate::new(1000)),
			..Limits::default()
		};
		let counters = CounterEngine::new(10);
		let tenant = TenantId::from("acme");
		// Drain the bucket first so it starts empty, matching the scenario.
		counters.try_charge_all(&tenant, &limits, 1000, 0);
		let decision = evaluate_inner(&tenant, &write, &limits, &counters);
		match decision {
			Decision::Deny(info) => {
				assert_eq!(info.reason, ReasonCode::RateLimitExceeded);
				assert_eq!(info.dimension, Some("samples"));
			},
			other => panic!("expected deny, got {other:?}"),
		}
	}

	#[test]
	fn enforcement_disabled_always_allows_but_records_would_deny() {
		let write = ParsedWrite {
			series: vec![series("up", 1500)],
			body_bytes_raw: 10,
			body_bytes_decompressed: 10,
			encoding: None,
		};
		let limits = Limits {
			samples_per_second: Some(Rate::new(1000)),
			enforcement_enabled: false,
			..Limits::default()
		};
		let counters = CounterEngine::new(10);
		let tenant = TenantId::from("test");
		counters.try_charge_all(&tenant, &limits, 1000, 0);
		let eval = evaluate(&tenant, &write, &limits, &counters);
		assert_eq!(
			eval.decision,
			Decision::Allow {
				matched_limits: Vec::new()
			}
		);
		assert!(matches!(eval.would_have, Some(Decision::Deny(_))));
	}

	#[test]
	fn rate_limit_with_filter_truncates_to_fit_remaining_tokens() {
		let write = ParsedWrite {
			series: vec![series("a", 300), series("b", 300), series("c", 300), series("d", 300), series("e", 300)],
			body_bytes_raw: 10,
			body_bytes_decompressed: 10,
			encoding: None,
		};
		let limits = Limits {
			samples_per_second: Some(Rate::new(1000)),
			selective_filter_enabled: true,
			..Limits::default()
		};
		let counters = CounterEngine::new(10);
		let tenant = TenantId::from("acme");
		// Leave exactly 800 tokens, as in the literal scenario.
		counters.try_charge_all(&tenant, &limits, 200, 0);

		let decision = evaluate_inner(&tenant, &write, &limits, &counters);
		let edits = match decision {
			Decision::SelectiveFilter { edits, .. } => edits,
			other => panic!("expected selective filter, got {other:?}"),
		};
		let dropped_series = edits.iter().filter(|e| matches!(e, Edit::DropSeries(_))).count();
		let truncated: Vec<&Edit> = edits.iter().filter(|e| matches!(e, Edit::DropSamples(..))).collect();
		assert_eq!(dropped_series, 2);
		assert_eq!(truncated.len(), 1);
		if let Edit::DropSamples(_, keep_n) = truncated[0] {
			assert_eq!(*keep_n, 200);
		}
		// 2 dropped series at 300 each + 1 truncated to 200 = 800 total kept.
		let kept_samples: u64 = 300 * (5 - dropped_series as u64 - 1) + 200;
		assert_eq!(kept_samples, 800);
		// The reduced charge must actually be committed: the samples bucket
		// had exactly 800 tokens, all of which are now spent.
		assert_eq!(counters.tokens_available(&tenant, "samples"), Some(0.0));
	}
}
