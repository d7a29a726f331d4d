//! Process-wide tracing setup. Two formats are supported: `text` (compact,
//! for local development) and `json` (structured, for production log
//! shipping) — selected by `RLS_LOG_FORMAT`, defaulting to `text`. Verbosity
//! follows the standard `RUST_LOG`/`RLS_LOG` env-filter syntax.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub fn init() {
	let filter = EnvFilter::try_from_env("RLS_LOG")
		.or_else(|_| EnvFilter::try_from_default_env())
		.unwrap_or_else(|_| EnvFilter::new("info"));

	let json = std::env::var("RLS_LOG_FORMAT")
		.map(|v| v.eq_ignore_ascii_case("json"))
		.unwrap_or(false);

	let registry = tracing_subscriber::registry().with(filter);

	if json {
		registry
			.with(tracing_subscriber::fmt::layer().json().with_target(true))
			.init();
	} else {
		registry
			.with(tracing_subscriber::fmt::layer().with_target(true))
			.init();
	}
}
