//! §4.7 "Rate-limit server (C7)": the proxy's cheap descriptor-based
//! pre-check. Shares C3's counter engine with C6 (§4.7 "The two must agree
//! when given the same information") but never sees a request body, so it
//! only ever charges one named dimension via `hits_addend`.

use std::sync::Arc;

use dashmap::DashSet;
use tonic::{Request, Response, Status};

use rls_protos::envoy::service::ratelimit::v3::rate_limit_descriptor::Entry;
use rls_protos::envoy::service::ratelimit::v3::rate_limit_response::{Code, DescriptorStatus};
use rls_protos::envoy::service::ratelimit::v3::rate_limit_service_server::RateLimitService;
use rls_protos::envoy::service::ratelimit::v3::{RateLimitDescriptor, RateLimitRequest, RateLimitResponse};

use crate::counters::ChargeOutcome;
use crate::state::AppState;
use crate::tenant::{TenantId, TENANT_HEADER};

pub struct RatelimitService {
	state: Arc<AppState>,
	warned_domains: DashSet<String>,
}

impl RatelimitService {
	pub fn new(state: Arc<AppState>) -> Self {
		RatelimitService {
			state,
			warned_domains: DashSet::new(),
		}
	}

	fn dimension_for_domain(&self, domain: &str) -> Option<&str> {
		self.state.config.ratelimit.domain_map.get(domain).map(|s| s.as_str())
	}
}

#[tonic::async_trait]
impl RateLimitService for RatelimitService {
	async fn should_rate_limit(&self, request: Request<RateLimitRequest>) -> Result<Response<RateLimitResponse>, Status> {
		let req = request.into_inner();

		// §4.7 "Unknown domain: OK with a warning log once per domain per process."
		let Some(dimension) = self.dimension_for_domain(&req.domain) else {
			if self.warned_domains.insert(req.domain.clone()) {
				tracing::warn!(domain = %req.domain, "unrecognized rate-limit domain; allowing once");
			}
			return Ok(Response::new(RateLimitResponse {
				overall_code: Code::Ok as i32,
				statuses: req
					.descriptors
					.iter()
					.map(|_| DescriptorStatus {
						code: Code::Ok as i32,
						current_limit: None,
						limit_remaining: 0,
						duration_until_reset: None,
					})
					.collect(),
			}));
		};

		let mut overall = Code::Ok;
		let mut statuses = Vec::with_capacity(req.descriptors.len());
		for descriptor in &req.descriptors {
			let status = self.evaluate_descriptor(descriptor, dimension, req.hits_addend);
			if status.code == Code::OverLimit as i32 {
				overall = Code::OverLimit;
			}
			statuses.push(status);
		}

		Ok(Response::new(RateLimitResponse {
			overall_code: overall as i32,
			statuses,
		}))
	}
}

impl RatelimitService {
	fn evaluate_descriptor(&self, descriptor: &RateLimitDescriptor, dimension: &str, request_hits_addend: u32) -> DescriptorStatus {
		let Some(tenant) = tenant_from_entries(&descriptor.entries) else {
			return DescriptorStatus {
				code: Code::Ok as i32,
				current_limit: None,
				limit_remaining: 0,
				duration_until_reset: None,
			};
		};

		let hits = descriptor.hits_addend.unwrap_or(request_hits_addend.max(1) as u64);
		let limits = self.state.limits.lookup(&tenant);
		let outcome = self.state.counters().try_charge_dimension(&tenant, &limits, dimension, hits);

		DescriptorStatus {
			code: match outcome {
				ChargeOutcome::Ok => Code::Ok as i32,
				ChargeOutcome::Denied { .. } => Code::OverLimit as i32,
			},
			current_limit: None,
			limit_remaining: 0,
			duration_until_reset: None,
		}
	}
}

fn tenant_from_entries(entries: &[Entry]) -> Option<TenantId> {
	entries
		.iter()
		.find(|e| e.key.eq_ignore_ascii_case(TENANT_HEADER) || e.key.eq_ignore_ascii_case("tenant"))
		.map(|e| TenantId::from(e.value.as_str()))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::Config;

	fn descriptor(tenant: &str) -> RateLimitDescriptor {
		RateLimitDescriptor {
			entries: vec![Entry {
				key: "tenant".to_string(),
				value: tenant.to_string(),
			}],
			hits_addend: None,
		}
	}

	#[tokio::test]
	async fn unknown_domain_allows_with_warning() {
		let mut config = Config::default();
		config.ratelimit.domain_map.clear();
		let state = AppState::new(config);
		let service = RatelimitService::new(state);
		let response = service
			.should_rate_limit(Request::new(RateLimitRequest {
				domain: "mystery".to_string(),
				descriptors: vec![descriptor("acme")],
				hits_addend: 1,
			}))
			.await
			.unwrap()
			.into_inner();
		assert_eq!(response.overall_code, Code::Ok as i32);
	}

	#[tokio::test]
	async fn unknown_domain_warning_is_only_inserted_once() {
		let mut config = Config::default();
		config.ratelimit.domain_map.clear();
		let state = AppState::new(config);
		let service = RatelimitService::new(state);
		let request = || {
			Request::new(RateLimitRequest {
				domain: "mystery".to_string(),
				descriptors: vec![descriptor("acme")],
				hits_addend: 1,
			})
		};
		service.should_rate_limit(request()).await.unwrap();
		service.should_rate_limit(request()).await.unwrap();
		assert_eq!(service.warned_domains.len(), 1);
	}

	#[tokio::test]
	async fn known_domain_charges_the_mapped_dimension() {
		let mut config = Config::default();
		config.ratelimit.domain_map.insert("mimir_remote_write".to_string(), "requests".to_string());
		config.default_limits.requests_per_second = Some(crate::limits::Rate::new(1));
		let state = AppState::new(config);
		let service = RatelimitService::new(state);

		let request = || {
			Request::new(RateLimitRequest {
				domain: "mimir_remote_write".to_string(),
				descriptors: vec![descriptor("acme")],
				hits_addend: 1,
			})
		};
		let first = service.should_rate_limit(request()).await.unwrap().into_inner();
		assert_eq!(first.overall_code, Code::Ok as i32);
		let second = service.should_rate_limit(request()).await.unwrap().into_inner();
		assert_eq!(second.overall_code, Code::OverLimit as i32);
	}
}
