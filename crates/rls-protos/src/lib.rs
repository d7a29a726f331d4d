//! Generated gRPC/protobuf bindings for the two wire protocols RLS speaks
//! (Envoy ext_authz v3, Envoy rate-limit v3) and the vendored Prometheus
//! remote-write wire format. Kept in its own crate, same as the teacher's
//! `protos` crate, so `rls` depends on generated code rather than embedding
//! `tonic::include_proto!` calls inline.

#[allow(clippy::derive_partial_eq_without_eq)]
#[allow(clippy::doc_lazy_continuation)]
pub mod envoy {
	pub mod service {
		pub mod auth {
			pub mod v3 {
				tonic::include_proto!("envoy.service.auth.v3");
			}
		}
		pub mod ratelimit {
			pub mod v3 {
				tonic::include_proto!("envoy.service.ratelimit.v3");
			}
		}
	}
	pub mod r#type {
		pub mod v3 {
			// prost-build escapes the `type` package segment to the raw
			// identifier `r#type` when naming the generated file, so the
			// plain `tonic::include_proto!("envoy.type.v3")` path doesn't
			// match the file actually written to OUT_DIR.
			include!(concat!(env!("OUT_DIR"), "/envoy.r#type.v3.rs"));
		}
	}
}

#[allow(clippy::derive_partial_eq_without_eq)]
pub mod google {
	pub mod rpc {
		tonic::include_proto!("google.rpc");
	}
}

#[allow(clippy::derive_partial_eq_without_eq)]
pub mod prometheus {
	tonic::include_proto!("prometheus");
}
