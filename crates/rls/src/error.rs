//! The reason-code taxonomy from the spec's error-handling design, plus the
//! few process-fatal error kinds that terminate `rls-app` on startup.

use std::fmt;

/// Stable reason-code strings surfaced to the proxy, the denial ring, and
/// metrics labels. Never reorder the discriminants that are derived from
/// `as_str` — operators match on the string, not the enum position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
	BodySizeExceeded,
	LabelsPerSeriesExceeded,
	SeriesPerRequestExceeded,
	SeriesPerMetricExceeded,
	RateLimitExceeded,
	DecompressedTooLarge,
	UnsupportedEncoding,
	MalformedProtobuf,
	MissingMetricName,
	Timeout,
	Internal,
}

impl ReasonCode {
	pub fn as_str(&self) -> &'static str {
		match self {
			ReasonCode::BodySizeExceeded => "body_size_exceeded",
			ReasonCode::LabelsPerSeriesExceeded => "labels_per_series_exceeded",
			ReasonCode::SeriesPerRequestExceeded => "series_per_request_exceeded",
			ReasonCode::SeriesPerMetricExceeded => "series_per_metric_exceeded",
			ReasonCode::RateLimitExceeded => "rate_limit_exceeded",
			ReasonCode::DecompressedTooLarge => "decompressed_too_large",
			ReasonCode::UnsupportedEncoding => "unsupported_encoding",
			ReasonCode::MalformedProtobuf => "malformed_protobuf",
			ReasonCode::MissingMetricName => "missing_metric_name",
			ReasonCode::Timeout => "timeout",
			ReasonCode::Internal => "internal",
		}
	}

	/// HTTP status the proxy should surface to the client for this reason.
	pub fn http_status(&self) -> u16 {
		match self {
			ReasonCode::BodySizeExceeded => 413,
			ReasonCode::LabelsPerSeriesExceeded => 400,
			ReasonCode::SeriesPerRequestExceeded => 400,
			ReasonCode::SeriesPerMetricExceeded => 400,
			ReasonCode::RateLimitExceeded => 429,
			ReasonCode::DecompressedTooLarge => 413,
			ReasonCode::UnsupportedEncoding => 415,
			ReasonCode::MalformedProtobuf => 400,
			ReasonCode::MissingMetricName => 400,
			ReasonCode::Timeout => 503,
			ReasonCode::Internal => 500,
		}
	}

	pub fn retryable(&self) -> bool {
		matches!(self, ReasonCode::RateLimitExceeded | ReasonCode::Timeout | ReasonCode::Internal)
	}
}

impl fmt::Display for ReasonCode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// A denial or would-be-denial with enough context to explain itself to a
/// human operator; carried by `Decision::Deny` and by `DenialRecord`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DenyInfo {
	pub reason: ReasonCode,
	pub message: String,
	/// Set only for `rate_limit_exceeded`: which dimension was short.
	pub dimension: Option<&'static str>,
}

impl DenyInfo {
	pub fn new(reason: ReasonCode, message: impl Into<String>) -> Self {
		DenyInfo {
			reason,
			message: message.into(),
			dimension: None,
		}
	}

	pub fn with_dimension(mut self, dimension: &'static str) -> Self {
		self.dimension = Some(dimension);
		self
	}
}

/// Errors that abort the process at startup. Never used on the per-request
/// path, where everything downgrades to a `Decision::Deny` instead.
#[derive(Debug, thiserror::Error)]
pub enum FatalError {
	#[error("failed to read configuration from {path}: {source}")]
	ConfigRead {
		path: String,
		#[source]
		source: std::io::Error,
	},
	#[error("failed to parse configuration: {0}")]
	ConfigParse(#[from] serde_yaml::Error),
	#[error("failed to bind {listener} listener on {addr}: {source}")]
	Bind {
		listener: &'static str,
		addr: String,
		#[source]
		source: std::io::Error,
	},
	#[error("failed to initialize overrides source: {0}")]
	SourceInit(#[source] anyhow::Error),
}
