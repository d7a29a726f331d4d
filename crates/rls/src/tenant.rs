//! The tenant identifier. Opaque, ASCII, supplied by the caller — spec §3
//! "Tenant" and §6 "Header `x-scope-orgid` ... identifies the tenant."

use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

pub const TENANT_HEADER: &str = "x-scope-orgid";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct TenantId(Arc<str>);

impl TenantId {
	pub fn new(s: impl Into<Arc<str>>) -> Self {
		TenantId(s.into())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl Borrow<str> for TenantId {
	fn borrow(&self) -> &str {
		&self.0
	}
}

impl From<&str> for TenantId {
	fn from(s: &str) -> Self {
		TenantId(Arc::from(s))
	}
}

impl From<String> for TenantId {
	fn from(s: String) -> Self {
		TenantId(Arc::from(s))
	}
}

impl fmt::Display for TenantId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Case-insensitive lookup of the tenant header out of a gRPC/HTTP header
/// map. Returns `None` if absent or empty.
pub fn extract_tenant(headers: &std::collections::HashMap<String, String>) -> Option<TenantId> {
	headers
		.iter()
		.find(|(k, _)| k.eq_ignore_ascii_case(TENANT_HEADER))
		.map(|(_, v)| v.trim())
		.filter(|v| !v.is_empty())
		.map(TenantId::from)
}
