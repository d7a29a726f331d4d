//! Process-level configuration surface (spec §6 "Configuration surface of
//! the core"), loaded from YAML by `rls-app` and handed down to every
//! component. Field names mirror the spec's table; durations accept
//! human-friendly strings (`250ms`, `5m`, `30s`) via [`serde_dur`].

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::limits::Limits;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct Config {
	pub listen: ListenConfig,
	pub ratelimit: RatelimitConfig,
	pub default_limits: Limits,
	pub max_request_bytes_raw: u64,
	pub max_request_bytes_decompressed: u64,
	#[serde(with = "serde_dur")]
	pub request_timeout: Duration,
	pub tenants_cap: usize,
	pub denials_ring_size: usize,
	pub sync: SyncConfig,
	pub fail_open: bool,
	pub in_flight_per_tenant: usize,
	pub in_flight_global: usize,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			listen: ListenConfig::default(),
			ratelimit: RatelimitConfig::default(),
			default_limits: Limits::default(),
			// spec §9 open question: adopt 50 MiB raw / 4 MiB decompressed-via-authz.
			max_request_bytes_raw: 50 * 1024 * 1024,
			max_request_bytes_decompressed: 4 * 1024 * 1024,
			request_timeout: Duration::from_millis(250),
			tenants_cap: 100_000,
			denials_ring_size: 10_000,
			sync: SyncConfig::default(),
			fail_open: false,
			in_flight_per_tenant: 256,
			in_flight_global: 16 * num_cpus() * 256,
		}
	}
}

fn num_cpus() -> usize {
	std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct ListenConfig {
	pub authz: String,
	pub ratelimit: String,
}

impl Default for ListenConfig {
	fn default() -> Self {
		ListenConfig {
			authz: "0.0.0.0:50051".to_string(),
			ratelimit: "0.0.0.0:50052".to_string(),
		}
	}
}

/// Maps the `domain` a descriptor arrives under (spec §4.7) to the
/// dimension it charges. An unrecognized domain is allowed through with a
/// once-per-process warning, per spec.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct RatelimitConfig {
	pub domain_map: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct SyncConfig {
	#[serde(with = "serde_dur")]
	pub resync_period: Duration,
	#[serde(with = "serde_dur")]
	pub backoff_initial: Duration,
	#[serde(with = "serde_dur")]
	pub backoff_max: Duration,
}

impl Default for SyncConfig {
	fn default() -> Self {
		SyncConfig {
			resync_period: Duration::from_secs(5 * 60),
			backoff_initial: Duration::from_millis(200),
			backoff_max: Duration::from_secs(30),
		}
	}
}

impl Config {
	pub fn from_yaml_str(s: &str) -> Result<Self, serde_yaml::Error> {
		serde_yaml::from_str(s)
	}

	pub fn from_file(path: &std::path::Path) -> Result<Self, crate::error::FatalError> {
		let text =
			fs_err::read_to_string(path).map_err(|e| crate::error::FatalError::ConfigRead {
				path: path.display().to_string(),
				source: e,
			})?;
		Config::from_yaml_str(&text).map_err(crate::error::FatalError::ConfigParse)
	}
}

/// `#[serde(with = "serde_dur")]` — human-friendly duration strings
/// (`"250ms"`, `"5m"`, `"30s"`), matching the teacher's `serde_dur` helper
/// module convention used throughout its policy config types.
pub mod serde_dur {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
		s.serialize_str(&humantime::format_duration(*d).to_string())
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
		let raw = String::deserialize(d)?;
		humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
	}
}
