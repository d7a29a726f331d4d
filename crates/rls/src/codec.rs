//! §4.1 "Payload codec (C1)": decompress, then decode the Prometheus
//! remote-write protobuf in a single pass that accumulates the totals the
//! decision engine needs, per the design note "accumulate series_count,
//! samples_count, max_labels_per_series in the same pass that walks the
//! protobuf, not in a second pass."
//!
//! Decompression itself is grounded on two corpus crates already in the
//! dependency stack for unrelated reasons: `snap` (framed + block Snappy,
//! the same crate a libp2p gossipsub transport in the pack uses for its
//! message codec) and `async-compression` (gzip, already pulled in by the
//! teacher for its own body-compression needs).

use std::io::Read;

use bytes::Bytes;
use prost::Message;

use rls_protos::prometheus::{Label, Sample, TimeSeries, WriteRequest};

const FRAMED_SNAPPY_MAGIC: [u8; 10] = [0xff, 0x06, 0x00, 0x00, b's', b'N', b'a', b'p', b'p', b'Y'];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEncoding {
	Snappy,
	Gzip,
	Identity,
}

impl ContentEncoding {
	pub fn from_header(value: Option<&str>) -> Option<Self> {
		match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
			None | Some("") | Some("identity") => Some(ContentEncoding::Identity),
			Some("snappy") => Some(ContentEncoding::Snappy),
			Some("gzip") => Some(ContentEncoding::Gzip),
			_ => None,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeErrorKind {
	BadMagic,
	DecompressFailed,
	DecompressedTooLarge,
	MalformedProtobuf,
	MissingMetricName,
	UnsupportedEncoding,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeError {
	pub kind: DecodeErrorKind,
	pub message: String,
}

impl DecodeError {
	fn new(kind: DecodeErrorKind, message: impl Into<String>) -> Self {
		DecodeError {
			kind,
			message: message.into(),
		}
	}
}

pub const METRIC_NAME_LABEL: &str = "__name__";

#[derive(Debug, Clone)]
pub struct ParsedSeries {
	pub labels: Vec<(String, String)>,
	pub samples: Vec<(f64, i64)>,
	pub metric_name: String,
	pub label_count: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedWrite {
	pub series: Vec<ParsedSeries>,
	pub body_bytes_raw: u64,
	pub body_bytes_decompressed: u64,
	pub encoding: Option<ContentEncoding>,
}

impl ParsedWrite {
	pub fn series_count(&self) -> u64 {
		self.series.len() as u64
	}

	pub fn samples_count(&self) -> u64 {
		self.series.iter().map(|s| s.samples.len() as u64).sum()
	}

	pub fn labels_per_series_max(&self) -> u64 {
		self.series.iter().map(|s| s.label_count as u64).max().unwrap_or(0)
	}

	pub fn series_count_for_metric(&self, metric_name: &str) -> u64 {
		self.series.iter().filter(|s| s.metric_name == metric_name).count() as u64
	}
}

/// §4.1 "Decompression policy": detects the wire encoding, enforces the
/// decompressed-size ceiling, and parses in one protobuf walk.
pub fn decode(body: &Bytes, content_encoding_hint: Option<&str>, decompressed_cap: u64) -> Result<ParsedWrite, DecodeError> {
	let body_bytes_raw = body.len() as u64;
	let encoding = detect_encoding(body, content_encoding_hint)?;
	let decompressed = decompress(body, encoding, decompressed_cap)?;

	let mut write = parse_protobuf(&decompressed)?;
	write.body_bytes_raw = body_bytes_raw;
	write.body_bytes_decompressed = decompressed.len() as u64;
	write.encoding = Some(encoding);
	Ok(write)
}

fn detect_encoding(body: &[u8], hint: Option<&str>) -> Result<ContentEncoding, DecodeError> {
	if body.len() >= FRAMED_SNAPPY_MAGIC.len() && body[..10] == FRAMED_SNAPPY_MAGIC {
		return Ok(ContentEncoding::Snappy);
	}
	match ContentEncoding::from_header(hint) {
		Some(encoding) => Ok(encoding),
		None => Err(DecodeError::new(
			DecodeErrorKind::UnsupportedEncoding,
			format!("unrecognized content-encoding {hint:?}"),
		)),
	}
}

fn decompress(body: &Bytes, encoding: ContentEncoding, cap: u64) -> Result<Vec<u8>, DecodeError> {
	let out = match encoding {
		ContentEncoding::Identity => body.to_vec(),
		ContentEncoding::Snappy => decompress_snappy(body, cap)?,
		ContentEncoding::Gzip => decompress_gzip(body, cap)?,
	};
	if out.len() as u64 > cap {
		return Err(DecodeError::new(
			DecodeErrorKind::DecompressedTooLarge,
			format!("decompressed body {} bytes exceeds cap {cap}", out.len()),
		));
	}
	Ok(out)
}

/// Per the design note: "resist the temptation to brute-force both
/// decoders; detect by magic." Framed Snappy is detected by the caller via
/// [`detect_encoding`]'s magic check before we ever get here; anything that
/// reaches `snap::raw::Decoder` is block format.
///
/// Both branches bound how much ever gets materialized so a small,
/// high-ratio payload can't balloon into an unbounded allocation before the
/// cap is checked (§4.1's decompression-bomb ceiling only does its job if
/// it's enforced during decompression, not after it).
fn decompress_snappy(body: &[u8], cap: u64) -> Result<Vec<u8>, DecodeError> {
	if body.len() >= FRAMED_SNAPPY_MAGIC.len() && body[..10] == FRAMED_SNAPPY_MAGIC {
		let mut reader = snap::read::FrameDecoder::new(body).take(cap + 1);
		let mut out = Vec::new();
		reader
			.read_to_end(&mut out)
			.map_err(|e| DecodeError::new(DecodeErrorKind::DecompressFailed, e.to_string()))?;
		return Ok(out);
	}
	// Block format carries its uncompressed length in the header; read it
	// without allocating before deciding whether to decompress at all.
	let declared_len = snap::raw::decompress_len(body).map_err(|e| DecodeError::new(DecodeErrorKind::DecompressFailed, e.to_string()))?;
	if declared_len as u64 > cap {
		return Err(DecodeError::new(
			DecodeErrorKind::DecompressedTooLarge,
			format!("declared decompressed length {declared_len} exceeds cap {cap}"),
		));
	}
	snap::raw::Decoder::new()
		.decompress_vec(body)
		.map_err(|e| DecodeError::new(DecodeErrorKind::DecompressFailed, e.to_string()))
}

fn decompress_gzip(body: &[u8], cap: u64) -> Result<Vec<u8>, DecodeError> {
	use std::io::Cursor;

	use flate2::read::GzDecoder;

	let mut decoder = GzDecoder::new(Cursor::new(body)).take(cap + 1);
	let mut out = Vec::new();
	decoder
		.read_to_end(&mut out)
		.map_err(|e| DecodeError::new(DecodeErrorKind::DecompressFailed, e.to_string()))?;
	Ok(out)
}

fn parse_protobuf(decompressed: &[u8]) -> Result<ParsedWrite, DecodeError> {
	let message = WriteRequest::decode(decompressed)
		.map_err(|e| DecodeError::new(DecodeErrorKind::MalformedProtobuf, e.to_string()))?;

	let mut series = Vec::with_capacity(message.timeseries.len());
	for ts in message.timeseries {
		let parsed = parse_series(ts)?;
		series.push(parsed);
	}

	Ok(ParsedWrite {
		series,
		body_bytes_raw: 0,
		body_bytes_decompressed: 0,
		encoding: None,
	})
}

fn parse_series(ts: TimeSeries) -> Result<ParsedSeries, DecodeError> {
	let labels: Vec<(String, String)> = ts.labels.into_iter().map(label_pair).collect();
	let metric_name = labels
		.iter()
		.find(|(name, _)| name == METRIC_NAME_LABEL)
		.map(|(_, value)| value.clone())
		.ok_or_else(|| DecodeError::new(DecodeErrorKind::MissingMetricName, "series missing __name__ label"))?;

	let samples = ts.samples.into_iter().map(sample_pair).collect();
	let label_count = labels.len();

	Ok(ParsedSeries {
		labels,
		samples,
		metric_name,
		label_count,
	})
}

fn label_pair(l: Label) -> (String, String) {
	(l.name, l.value)
}

fn sample_pair(s: Sample) -> (f64, i64) {
	(s.value, s.timestamp)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn encode_request(series: Vec<TimeSeries>) -> Vec<u8> {
		WriteRequest {
			timeseries: series,
			metadata: Vec::new(),
		}
		.encode_to_vec()
	}

	fn series(name: &str, samples: Vec<(f64, i64)>) -> TimeSeries {
		TimeSeries {
			labels: vec![Label {
				name: METRIC_NAME_LABEL.to_string(),
				value: name.to_string(),
			}],
			samples: samples
				.into_iter()
				.map(|(value, timestamp)| Sample { value, timestamp })
				.collect(),
			exemplars: Vec::new(),
		}
	}

	#[test]
	fn identity_round_trip() {
		let bytes = encode_request(vec![series("up", vec![(1.0, 1000)])]);
		let parsed = decode(&Bytes::from(bytes), Some("identity"), 1024 * 1024).unwrap();
		assert_eq!(parsed.series_count(), 1);
		assert_eq!(parsed.samples_count(), 1);
	}

	#[test]
	fn missing_metric_name_is_rejected() {
		let bad = TimeSeries {
			labels: vec![Label {
				name: "job".to_string(),
				value: "x".to_string(),
			}],
			samples: vec![Sample {
				value: 1.0,
				timestamp: 1,
			}],
			exemplars: Vec::new(),
		};
		let bytes = encode_request(vec![bad]);
		let err = decode(&Bytes::from(bytes), Some("identity"), 1024 * 1024).unwrap_err();
		assert_eq!(err.kind, DecodeErrorKind::MissingMetricName);
	}

	#[test]
	fn unsupported_encoding_is_rejected() {
		let bytes = encode_request(vec![series("up", vec![(1.0, 1)])]);
		let err = decode(&Bytes::from(bytes), Some("br"), 1024).unwrap_err();
		assert_eq!(err.kind, DecodeErrorKind::UnsupportedEncoding);
	}

	#[test]
	fn snappy_block_round_trip() {
		let bytes = encode_request(vec![series("up", vec![(1.0, 1)])]);
		let compressed = snap::raw::Encoder::new().compress_vec(&bytes).unwrap();
		let parsed = decode(&Bytes::from(compressed), Some("snappy"), 1024 * 1024).unwrap();
		assert_eq!(parsed.series_count(), 1);
	}

	#[test]
	fn framed_snappy_magic_is_detected_without_a_header_hint() {
		let bytes = encode_request(vec![series("up", vec![(1.0, 1)])]);
		let mut compressed = Vec::new();
		{
			use std::io::Write;
			let mut writer = snap::write::FrameEncoder::new(&mut compressed);
			writer.write_all(&bytes).unwrap();
			writer.flush().unwrap();
		}
		assert_eq!(&compressed[..10], &FRAMED_SNAPPY_MAGIC);
		let parsed = decode(&Bytes::from(compressed), None, 1024 * 1024).unwrap();
		assert_eq!(parsed.series_count(), 1);
	}

	#[test]
	fn decompressed_too_large_is_rejected() {
		let bytes = encode_request(vec![series("up", vec![(1.0, 1)])]);
		let err = decode(&Bytes::from(bytes), Some("identity"), 1).unwrap_err();
		assert_eq!(err.kind, DecodeErrorKind::DecompressedTooLarge);
	}
}
