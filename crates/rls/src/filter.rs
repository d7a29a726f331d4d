//! §4.5 "Selective filter (C5)". A pure function over `edits` — the decision
//! engine produces them, this module only applies them and re-encodes, per
//! the design note keeping "selective-filter edits as a pure data
//! structure" so each half can be tested independently.

use bytes::Bytes;
use prost::Message;

use crate::codec::{ContentEncoding, ParsedWrite};
use rls_protos::prometheus::{Label, Sample, TimeSeries, WriteRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edit {
	DropSeries(usize),
	/// Truncate series `index` to its earliest `keep_n` samples.
	DropSamples(usize, u64),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DropStats {
	pub dropped_series_count: u64,
	pub dropped_samples_count: u64,
	pub dropped_bytes_est: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterError {
	pub message: String,
}

/// §4.5 "Apply(ParsedWrite, edits) -> (RewrittenWrite, DropStats)". Series
/// whose sample count would drop to zero after truncation are removed
/// entirely (covers `DropSamples(i, 0)` and any keep_n that rounds to it).
pub fn apply(write: &ParsedWrite, edits: &[Edit], original_encoding: ContentEncoding, original_len: usize) -> Result<(Bytes, DropStats), FilterError> {
	let mut drop_series: Vec<usize> = Vec::new();
	let mut truncate: std::collections::HashMap<usize, u64> = std::collections::HashMap::new();
	for edit in edits {
		match edit {
			Edit::DropSeries(i) => drop_series.push(*i),
			Edit::DropSamples(i, keep_n) => {
				truncate.insert(*i, *keep_n);
			},
		}
	}

	let mut stats = DropStats::default();
	let mut kept_series = Vec::with_capacity(write.series.len());

	for (index, series) in write.series.iter().enumerate() {
		if drop_series.contains(&index) {
			stats.dropped_series_count += 1;
			stats.dropped_samples_count += series.samples.len() as u64;
			continue;
		}
		if let Some(&keep_n) = truncate.get(&index) {
			if keep_n == 0 {
				stats.dropped_series_count += 1;
				stats.dropped_samples_count += series.samples.len() as u64;
				continue;
			}
			// §4.5 "truncate to the earliest keep_n samples (by timestamp;
			// stable on ties)".
			let mut sorted_idx: Vec<usize> = (0..series.samples.len()).collect();
			sorted_idx.sort_by_key(|&i| series.samples[i].1);
			let keep_idx: std::collections::HashSet<usize> = sorted_idx.into_iter().take(keep_n as usize).collect();
			let kept_samples: Vec<(f64, i64)> = series
				.samples
				.iter()
				.enumerate()
				.filter(|(i, _)| keep_idx.contains(i))
				.map(|(_, s)| *s)
				.collect();
			stats.dropped_samples_count += series.samples.len() as u64 - kept_samples.len() as u64;
			kept_series.push(pb_series(&series.labels, &kept_samples));
		} else {
			kept_series.push(pb_series(&series.labels, &series.samples));
		}
	}

	let message = WriteRequest {
		timeseries: kept_series,
		metadata: Vec::new(),
	};
	let raw = message.encode_to_vec();
	stats.dropped_bytes_est = (write.body_bytes_decompressed).saturating_sub(raw.len() as u64);

	let recompressed = recompress(&raw, original_encoding)?;
	if recompressed.len() > original_len {
		return Err(FilterError {
			message: "re-encoded body exceeds the original size".to_string(),
		});
	}
	Ok((Bytes::from(recompressed), stats))
}

fn pb_series(labels: &[(String, String)], samples: &[(f64, i64)]) -> TimeSeries {
	TimeSeries {
		labels: labels
			.iter()
			.map(|(name, value)| Label {
				name: name.clone(),
				value: value.clone(),
			})
			.collect(),
		samples: samples.iter().map(|(value, timestamp)| Sample {
			value: *value,
			timestamp: *timestamp,
		}).collect(),
		exemplars: Vec::new(),
	}
}

fn recompress(raw: &[u8], encoding: ContentEncoding) -> Result<Vec<u8>, FilterError> {
	match encoding {
		ContentEncoding::Identity => Ok(raw.to_vec()),
		ContentEncoding::Snappy => snap::raw::Encoder::new()
			.compress_vec(raw)
			.map_err(|e| FilterError { message: e.to_string() }),
		ContentEncoding::Gzip => {
			use std::io::Write;

			use flate2::write::GzEncoder;
			use flate2::Compression;

			let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
			encoder.write_all(raw).map_err(|e| FilterError { message: e.to_string() })?;
			encoder.finish().map_err(|e| FilterError { message: e.to_string() })
		},
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::codec::ParsedSeries;

	fn series(name: &str, samples: Vec<(f64, i64)>) -> ParsedSeries {
		ParsedSeries {
			labels: vec![("__name__".to_string(), name.to_string())],
			label_count: 1,
			metric_name: name.to_string(),
			samples,
		}
	}

	fn write_with(series_list: Vec<ParsedSeries>) -> ParsedWrite {
		ParsedWrite {
			series: series_list,
			body_bytes_raw: 0,
			body_bytes_decompressed: 0,
			encoding: Some(ContentEncoding::Identity),
		}
	}

	#[test]
	fn drop_series_removes_it_entirely() {
		let write = write_with(vec![series("a", vec![(1.0, 1)]), series("b", vec![(1.0, 1)])]);
		let (bytes, stats) = apply(&write, &[Edit::DropSeries(0)], ContentEncoding::Identity, 1_000_000).unwrap();
		let decoded = WriteRequest::decode(bytes.as_ref()).unwrap();
		assert_eq!(decoded.timeseries.len(), 1);
		assert_eq!(stats.dropped_series_count, 1);
	}

	#[test]
	fn drop_samples_keeps_earliest_by_timestamp() {
		let write = write_with(vec![series("a", vec![(1.0, 30), (1.0, 10), (1.0, 20)])]);
		let (bytes, stats) = apply(&write, &[Edit::DropSamples(0, 2)], ContentEncoding::Identity, 1_000_000).unwrap();
		let decoded = WriteRequest::decode(bytes.as_ref()).unwrap();
		let timestamps: Vec<i64> = decoded.timeseries[0].samples.iter().map(|s| s.timestamp).collect();
		assert_eq!(timestamps, vec![10, 20]);
		assert_eq!(stats.dropped_samples_count, 1);
	}

	#[test]
	fn truncation_to_zero_removes_the_series() {
		let write = write_with(vec![series("a", vec![(1.0, 1)])]);
		let (bytes, _) = apply(&write, &[Edit::DropSamples(0, 0)], ContentEncoding::Identity, 1_000_000).unwrap();
		let decoded = WriteRequest::decode(bytes.as_ref()).unwrap();
		assert!(decoded.timeseries.is_empty());
	}

	#[test]
	fn oversize_re_encode_falls_back_to_error() {
		let write = write_with(vec![series("a", vec![(1.0, 1)])]);
		let err = apply(&write, &[], ContentEncoding::Identity, 0).unwrap_err();
		assert!(!err.message.is_empty());
	}
}
