//! §4.6 "Authorization server (C6)": the primary decision path. Wires C1
//! (decode) → C3 (charge, inside C4) → C4 (decide) → C5 (rewrite) and maps
//! the result onto the ext_authz wire contract.

use std::sync::Arc;
use std::time::{Instant, SystemTime};

use tonic::{Request, Response, Status};

use rls_protos::envoy::service::auth::v3::attribute_context::HttpRequest as PbHttpRequest;
use rls_protos::envoy::service::auth::v3::authorization_server::Authorization;
use rls_protos::envoy::service::auth::v3::{
	CheckRequest, CheckResponse, DeniedHttpResponse, HeaderValue, HeaderValueOption, OkHttpResponse,
};
use rls_protos::envoy::r#type::v3::http_status::Code as HttpCode;
use rls_protos::envoy::r#type::v3::HttpStatus;
use rls_protos::google::rpc::Status as RpcStatus;

use crate::codec::{self, ContentEncoding};
use crate::counters::{DenialRecord, RecordKind};
use crate::decision::{self, Decision};
use crate::filter;
use crate::state::AppState;
use crate::tenant::{extract_tenant, TenantId, TENANT_HEADER};

const CONTENT_ENCODING_HEADER: &str = "content-encoding";

pub struct AuthzService {
	state: Arc<AppState>,
}

impl AuthzService {
	pub fn new(state: Arc<AppState>) -> Self {
		AuthzService { state }
	}
}

#[tonic::async_trait]
impl Authorization for AuthzService {
	async fn check(&self, request: Request<CheckRequest>) -> Result<Response<CheckResponse>, Status> {
		let start = Instant::now();
		let result = match tokio::time::timeout(self.state.config.request_timeout, self.check_inner(request.into_inner())).await {
			Ok(response) => response,
			Err(_) => Ok(self.internal_outcome(crate::error::ReasonCode::Timeout, "internal deadline exceeded")),
		};
		tracing::trace!(elapsed_us = start.elapsed().as_micros() as u64, "check completed");
		result.map(Response::new)
	}
}

impl AuthzService {
	/// §6 "fail_open: if true, internal errors map to ALLOW." Used for
	/// errors that reflect something wrong with this service or the
	/// request's envelope rather than a tenant-attributable policy
	/// decision (malformed ext_authz attributes, a missed deadline) — a
	/// rate-limit or body-size deny is never routed through this.
	fn internal_outcome(&self, reason: crate::error::ReasonCode, message: impl Into<String>) -> CheckResponse {
		if self.state.config.fail_open {
			allow_response(None)
		} else {
			denied_response(reason, message, None)
		}
	}

	async fn check_inner(&self, request: CheckRequest) -> Result<CheckResponse, Status> {
		let http = match request.attributes.as_ref().and_then(|a| a.request.as_ref()).and_then(|r| r.http.as_ref()) {
			Some(http) => http,
			None => return Ok(self.internal_outcome(crate::error::ReasonCode::Internal, "missing http attributes")),
		};

		let Some(tenant) = extract_tenant(&http.headers) else {
			return Ok(self.internal_outcome(crate::error::ReasonCode::Internal, format!("missing {TENANT_HEADER} header")));
		};

		// §5 "Backpressure": admission gate ahead of decode/charge work, so a
		// tenant already at its in-flight cap never reaches the decoder.
		let Some(_permit) = self.state.in_flight.try_acquire(&tenant) else {
			return Err(Status::resource_exhausted(format!("too many in-flight requests for tenant {tenant}")));
		};

		let limits = self.state.limits.lookup(&tenant);
		let raw_len = http.raw_body.len().max(http.body.len());
		if raw_len as u64 > self.state.config.max_request_bytes_raw {
			self.state.counters().record_denied(&tenant, &limits);
			self.state.counters().record_denial(denial_record(
				&tenant,
				RecordKind::Denied(crate::error::ReasonCode::BodySizeExceeded),
				None,
				raw_len as u64,
				0,
				0,
			));
			return Ok(denied_response(crate::error::ReasonCode::BodySizeExceeded, "raw body exceeds hard cap", None));
		}

		let body = if http.raw_body.is_empty() {
			bytes::Bytes::from(http.body.clone().into_bytes())
		} else {
			bytes::Bytes::from(http.raw_body.clone())
		};

		let content_encoding = header_value(http, CONTENT_ENCODING_HEADER);
		let parsed = match codec::decode(&body, content_encoding.as_deref(), self.state.config.max_request_bytes_decompressed) {
			Ok(parsed) => parsed,
			Err(err) => {
				self.state.counters().record_denied(&tenant, &limits);
				let reason = decode_error_reason(err.kind);
				self.state
					.counters()
					.record_denial(denial_record(&tenant, RecordKind::Denied(reason), None, body.len() as u64, 0, 0));
				return Ok(denied_response(reason, err.message, None));
			},
		};

		let evaluation = decision::evaluate(&tenant, &parsed, &limits, self.state.counters());
		if let Some(would_have) = &evaluation.would_have {
			match would_have {
				Decision::Deny(info) => self.state.metrics.record_decision("would_deny", info.reason.as_str()),
				Decision::SelectiveFilter { .. } => self.state.metrics.record_decision("would_deny", "rate_limit_exceeded"),
				Decision::Allow { .. } => {},
			}
		}

		match evaluation.decision {
			Decision::Allow { .. } => {
				self.state.counters().record_allowed(&tenant);
				self.state.metrics.record_decision("allow", "");
				Ok(allow_response(None))
			},
			Decision::Deny(info) => {
				self.state.counters().record_denied(&tenant, &limits);
				self.state.metrics.record_decision("deny", info.reason.as_str());
				self.state.counters().record_denial(denial_record(
					&tenant,
					RecordKind::Denied(info.reason),
					info.dimension,
					parsed.body_bytes_raw,
					parsed.samples_count(),
					parsed.series_count(),
				));
				Ok(denied_response(info.reason, info.message, info.dimension))
			},
			Decision::SelectiveFilter { edits, reason } => {
				let encoding = parsed.encoding.unwrap_or(ContentEncoding::Identity);
				match filter::apply(&parsed, &edits, encoding, body.len()) {
					Ok((rewritten, stats)) => {
						self.state
							.counters()
							.record_filtered(&tenant, &limits, stats.dropped_series_count, stats.dropped_samples_count);
						self.state.metrics.filter_dropped_series_total.inc_by(stats.dropped_series_count);
						self.state.metrics.filter_dropped_samples_total.inc_by(stats.dropped_samples_count);
						self.state.metrics.record_decision("selective_filter", "");
						self.state.counters().record_denial(denial_record(
							&tenant,
							RecordKind::SelectiveFilterApplied,
							Some(reason),
							parsed.body_bytes_raw,
							parsed.samples_count(),
							parsed.series_count(),
						));
						Ok(allow_response(Some((rewritten, stats))))
					},
					Err(_) => {
						self.state.counters().record_denied(&tenant, &limits);
						self.state.metrics.record_decision("deny", "rate_limit_exceeded");
						self.state.counters().record_denial(denial_record(
							&tenant,
							RecordKind::Denied(crate::error::ReasonCode::RateLimitExceeded),
							Some(reason),
							parsed.body_bytes_raw,
							parsed.samples_count(),
							parsed.series_count(),
						));
						Ok(denied_response(crate::error::ReasonCode::RateLimitExceeded, "filtered body exceeds original size", None))
					},
				}
			},
		}
	}
}

/// §3 "Denial record": one entry per deny or selective-filter action, fed
/// into the process-wide ring via `CounterEngine::record_denial`.
fn denial_record(
	tenant: &TenantId,
	kind: RecordKind,
	excess_kind: Option<&'static str>,
	observed_body_bytes: u64,
	observed_samples: u64,
	observed_series: u64,
) -> DenialRecord {
	DenialRecord {
		tenant: tenant.clone(),
		kind,
		timestamp: SystemTime::now(),
		observed_body_bytes,
		observed_samples,
		observed_series,
		excess_kind,
		excess_amount: None,
	}
}

fn header_value(http: &PbHttpRequest, name: &str) -> Option<String> {
	http.headers.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v.clone())
}

fn allow_response(rewrite: Option<(bytes::Bytes, filter::DropStats)>) -> CheckResponse {
	let mut ok_response = OkHttpResponse::default();
	if let Some((body, stats)) = rewrite {
		ok_response.body = body.to_vec();
		ok_response.response_headers_to_add.push(HeaderValueOption {
			header: Some(HeaderValue {
				key: "x-filter-applied".to_string(),
				value: format!("{}/{}", stats.dropped_series_count, stats.dropped_samples_count),
			}),
			append: false,
		});
	}
	CheckResponse {
		status: Some(RpcStatus {
			code: 0,
			message: String::new(),
			details: Vec::new(),
		}),
		http_response: Some(rls_protos::envoy::service::auth::v3::check_response::HttpResponse::OkResponse(ok_response)),
		response_headers_to_add: Vec::new(),
	}
}

fn denied_response(reason: crate::error::ReasonCode, message: impl Into<String>, dimension: Option<&'static str>) -> CheckResponse {
	let message = message.into();
	let body = match dimension {
		Some(dim) => format!(r#"{{"reason":"{reason}","message":"{message}","dimension":"{dim}"}}"#),
		None => format!(r#"{{"reason":"{reason}","message":"{message}"}}"#),
	};
	CheckResponse {
		status: Some(RpcStatus {
			code: 7,
			message: reason.to_string(),
			details: Vec::new(),
		}),
		http_response: Some(rls_protos::envoy::service::auth::v3::check_response::HttpResponse::DeniedResponse(
			DeniedHttpResponse {
				status: Some(HttpStatus {
					code: http_code(reason.http_status()),
				}),
				headers: Vec::new(),
				body,
			},
		)),
		response_headers_to_add: Vec::new(),
	}
}

fn http_code(status: u16) -> i32 {
	match status {
		400 => HttpCode::BadRequest as i32,
		403 => HttpCode::Forbidden as i32,
		413 => HttpCode::RequestEntityTooLarge as i32,
		415 => HttpCode::UnsupportedMediaType as i32,
		429 => HttpCode::TooManyRequests as i32,
		500 => HttpCode::InternalServerError as i32,
		503 => HttpCode::ServiceUnavailable as i32,
		_ => HttpCode::InternalServerError as i32,
	}
}

fn decode_error_reason(kind: codec::DecodeErrorKind) -> crate::error::ReasonCode {
	use codec::DecodeErrorKind as K;
	use crate::error::ReasonCode as R;
	match kind {
		K::BadMagic | K::UnsupportedEncoding => R::UnsupportedEncoding,
		K::DecompressFailed => R::MalformedProtobuf,
		K::DecompressedTooLarge => R::DecompressedTooLarge,
		K::MalformedProtobuf => R::MalformedProtobuf,
		K::MissingMetricName => R::MissingMetricName,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rls_protos::envoy::service::auth::v3::attribute_context::{HttpRequest, Peer, Request as AttrRequest};
	use rls_protos::envoy::service::auth::v3::AttributeContext;
	use rls_protos::prometheus::{Label, Sample, TimeSeries, WriteRequest as PbWriteRequest};
	use rls_protos::envoy::service::auth::v3::check_response::HttpResponse;

	fn check_request(tenant: &str, body: Vec<u8>) -> CheckRequest {
		CheckRequest {
			attributes: Some(AttributeContext {
				source: Some(Peer::default()),
				destination: Some(Peer::default()),
				request: Some(AttrRequest {
					time: None,
					http: Some(HttpRequest {
						id: "1".to_string(),
						method: "POST".to_string(),
						headers: [(TENANT_HEADER.to_string(), tenant.to_string())].into_iter().collect(),
						path: "/push".to_string(),
						host: String::new(),
						scheme: String::new(),
						query: String::new(),
						fragment: String::new(),
						size: body.len() as i64,
						protocol: String::new(),
						body: String::new(),
						raw_body: body,
					}),
				}),
			}),
		}
	}

	fn sample_body() -> Vec<u8> {
		use prost::Message;
		PbWriteRequest {
			timeseries: vec![TimeSeries {
				labels: vec![Label {
					name: "__name__".to_string(),
					value: "up".to_string(),
				}],
				samples: vec![Sample {
					value: 1.0,
					timestamp: 1,
				}],
				exemplars: Vec::new(),
			}],
			metadata: Vec::new(),
		}
		.encode_to_vec()
	}

	#[tokio::test]
	async fn allows_a_well_formed_request_under_default_limits() {
		let state = AppState::new(crate::config::Config::default());
		let service = AuthzService::new(state);
		let response = service
			.check(Request::new(check_request("acme", sample_body())))
			.await
			.unwrap()
			.into_inner();
		assert!(matches!(response.http_response, Some(HttpResponse::OkResponse(_))));
	}

	#[tokio::test]
	async fn missing_tenant_header_is_denied() {
		let state = AppState::new(crate::config::Config::default());
		let service = AuthzService::new(state);
		let mut request = check_request("acme", sample_body());
		request.attributes.as_mut().unwrap().request.as_mut().unwrap().http.as_mut().unwrap().headers.clear();
		let response = service.check(Request::new(request)).await.unwrap().into_inner();
		assert!(matches!(response.http_response, Some(HttpResponse::DeniedResponse(_))));
	}

	#[tokio::test]
	async fn fail_open_allows_on_an_internal_error() {
		let mut config = crate::config::Config::default();
		config.fail_open = true;
		let state = AppState::new(config);
		let service = AuthzService::new(state);
		let mut request = check_request("acme", sample_body());
		request.attributes.as_mut().unwrap().request.as_mut().unwrap().http.as_mut().unwrap().headers.clear();
		let response = service.check(Request::new(request)).await.unwrap().into_inner();
		assert!(matches!(response.http_response, Some(HttpResponse::OkResponse(_))));
	}

	#[tokio::test]
	async fn exhausted_in_flight_cap_returns_resource_exhausted() {
		let mut config = crate::config::Config::default();
		config.in_flight_per_tenant = 1;
		let state = AppState::new(config);
		let service = AuthzService::new(state.clone());
		let tenant = crate::tenant::TenantId::from("acme");
		let _held = state.in_flight.try_acquire(&tenant).unwrap();
		let status = service.check(Request::new(check_request("acme", sample_body()))).await.unwrap_err();
		assert_eq!(status.code(), tonic::Code::ResourceExhausted);
	}

	#[tokio::test]
	async fn body_too_large_is_recorded_in_the_denial_ring() {
		let state = AppState::new(crate::config::Config::default());
		let service = AuthzService::new(state.clone());
		let oversized = vec![0u8; state.config.max_request_bytes_raw as usize + 1];
		let _ = service.check(Request::new(check_request("acme", oversized))).await.unwrap();
		let recent = state.counters().recent_denials();
		assert_eq!(recent.len(), 1);
		assert!(matches!(recent[0].kind, crate::counters::RecordKind::Denied(crate::error::ReasonCode::BodySizeExceeded)));
	}
}
