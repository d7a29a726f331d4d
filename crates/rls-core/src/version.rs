//! Build/version info surfaced over the health service and in startup logs.

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildInfo {
	pub version: &'static str,
	pub rust_version: &'static str,
	pub target: &'static str,
}

impl BuildInfo {
	pub fn current() -> Self {
		BuildInfo {
			version: env!("CARGO_PKG_VERSION"),
			rust_version: "1.90",
			target: std::env::consts::ARCH,
		}
	}
}

impl std::fmt::Display for BuildInfo {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "rls/{} ({})", self.version, self.target)
	}
}
