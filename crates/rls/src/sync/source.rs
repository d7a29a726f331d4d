//! §4.8 "Source model": "the source exposes (abstractly) a current snapshot
//! mapping tenant_id -> override_document." [`OverridesSource`] is that
//! abstraction; [`FileSource`] is the one concrete implementation this
//! process ships with, treating a YAML file as the mapping.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::limits::{Limits, Rate};
use crate::tenant::TenantId;

/// §6 "Wire 3 — Source configuration (abstract)" document shape.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct OverrideLimits {
	pub samples_per_second: Option<u64>,
	pub max_body_bytes: Option<u64>,
	pub max_labels_per_series: Option<u64>,
	pub max_series_per_request: Option<u64>,
	pub max_series_per_metric: Option<u64>,
	pub bytes_per_second: Option<u64>,
	pub requests_per_second: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Enforcement {
	pub enabled: bool,
	pub selective_filter_enabled: bool,
}

impl Default for Enforcement {
	fn default() -> Self {
		Enforcement {
			enabled: true,
			selective_filter_enabled: false,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct OverrideDocument {
	pub limits: OverrideLimits,
	pub enforcement: Enforcement,
}

impl OverrideDocument {
	/// Absent fields inherit the default (§4.8: "Any field absent from an
	/// override means 'inherit the default'"), which here means `None`
	/// (not-enforced) since overrides are always applied on top of
	/// `Config::default_limits` at the store level via `ApplyPatch`.
	pub fn to_limits(&self) -> Limits {
		Limits {
			samples_per_second: self.limits.samples_per_second.map(Rate::new),
			max_body_bytes: self.limits.max_body_bytes,
			max_labels_per_series: self.limits.max_labels_per_series,
			max_series_per_request: self.limits.max_series_per_request,
			max_series_per_metric: self.limits.max_series_per_metric,
			bytes_per_second: self.limits.bytes_per_second.map(Rate::new),
			requests_per_second: self.limits.requests_per_second.map(Rate::new),
			enforcement_enabled: self.enforcement.enabled,
			selective_filter_enabled: self.enforcement.selective_filter_enabled,
		}
	}
}

/// A snapshot read, distinguishing tenants that failed to parse from
/// tenants genuinely absent from the source — §4.8 "Unparseable override ->
/// log, skip, keep the previous value for that tenant" only holds if the
/// controller can tell the two cases apart.
pub struct Snapshot {
	pub documents: HashMap<TenantId, OverrideDocument>,
	pub unparseable: Vec<TenantId>,
}

#[async_trait::async_trait]
pub trait OverridesSource: Send + Sync {
	async fn snapshot(&self) -> anyhow::Result<Snapshot>;
}

pub struct FileSource {
	path: PathBuf,
}

impl FileSource {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		FileSource { path: path.into() }
	}
}

#[async_trait::async_trait]
impl OverridesSource for FileSource {
	async fn snapshot(&self) -> anyhow::Result<Snapshot> {
		let text = fs_err::tokio::read_to_string(&self.path)
			.await
			.with_context(|| format!("reading overrides file {}", self.path.display()))?;
		let raw: HashMap<String, serde_yaml::Value> =
			serde_yaml::from_str(&text).with_context(|| format!("parsing overrides file {}", self.path.display()))?;

		let mut documents = HashMap::with_capacity(raw.len());
		let mut unparseable = Vec::new();
		for (tenant_id, value) in raw {
			let tenant = TenantId::from(tenant_id);
			match serde_yaml::from_value::<OverrideDocument>(value) {
				Ok(doc) => {
					documents.insert(tenant, doc);
				},
				Err(err) => {
					tracing::warn!(%tenant, error = %err, "unparseable override document; keeping previous value");
					unparseable.push(tenant);
				},
			}
		}
		Ok(Snapshot { documents, unparseable })
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn absent_fields_mean_unlimited() {
		let doc: OverrideDocument = serde_yaml::from_str("limits:\n  samples_per_second: 10\n").unwrap();
		let limits = doc.to_limits();
		assert_eq!(limits.samples_per_second.unwrap().per_second, 10);
		assert!(limits.max_body_bytes.is_none());
		assert!(limits.enforcement_enabled);
	}

	#[tokio::test]
	async fn file_source_skips_unparseable_tenants() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("overrides.yaml");
		fs_err::write(
			&path,
			"acme:\n  limits:\n    samples_per_second: 100\nbroken:\n  limits:\n    samples_per_second: notanumber\n",
		)
		.unwrap();
		let source = FileSource::new(path);
		let snapshot = source.snapshot().await.unwrap();
		assert!(snapshot.documents.contains_key(&TenantId::from("acme")));
		assert!(!snapshot.documents.contains_key(&TenantId::from("broken")));
		assert_eq!(snapshot.unparseable, vec![TenantId::from("broken")]);
	}
}
