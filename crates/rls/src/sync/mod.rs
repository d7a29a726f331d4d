//! §4.8 "Overrides sync controller (C8)". A single owning task fans the
//! whole diff-and-apply cycle out against [`crate::limits::TenantLimitsStore`]
//! — per the design note "model the sync loop as a single owning task ...
//! never invoke `ApplyPatch` from multiple goroutines without serialization
//! at the store," there is exactly one caller of `apply_patch` in the whole
//! process: this loop.

pub mod source;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::hash::document_hash;
use crate::limits::store::Patch;
use crate::state::AppState;
use crate::tenant::TenantId;
use source::OverridesSource;

/// Published by the controller; the authz server only reports `SERVING`
/// once this first flips to `true` (§4.6 "Health").
pub type ReadySender = watch::Sender<bool>;
pub type ReadyReceiver = watch::Receiver<bool>;

/// Seconds since the last successful sync (§4.8 "A staleness gauge").
pub type StalenessSender = watch::Sender<f64>;
pub type StalenessReceiver = watch::Receiver<f64>;

pub struct SyncController {
	source: Arc<dyn OverridesSource>,
	state: Arc<AppState>,
	last_hashes: Mutex<HashMap<TenantId, u64>>,
}

impl SyncController {
	pub fn new(source: Arc<dyn OverridesSource>, state: Arc<AppState>) -> Arc<Self> {
		Arc::new(SyncController {
			source,
			state,
			last_hashes: Mutex::new(HashMap::new()),
		})
	}

	/// Runs until `shutdown` fires. Exits the backoff loop only on
	/// cancellation; source errors degrade to "serve last snapshot" per
	/// §7's propagation policy, never terminating the process.
	pub async fn run(self: Arc<Self>, ready_tx: ReadySender, staleness_tx: StalenessSender, mut shutdown: rls_core::signal::DrainWatcher) {
		let mut backoff = self.state.config.sync.backoff_initial;
		let mut last_success = tokio::time::Instant::now();

		loop {
			match self.resync_once().await {
				Ok(()) => {
					backoff = self.state.config.sync.backoff_initial;
					last_success = tokio::time::Instant::now();
					let _ = ready_tx.send(true);
					let _ = staleness_tx.send(0.0);
				},
				Err(err) => {
					tracing::warn!(error = %err, "overrides sync failed; serving last known snapshot");
					let _ = staleness_tx.send(last_success.elapsed().as_secs_f64());
					if shutdown.race(tokio::time::sleep(backoff)).await.is_none() {
						return;
					}
					backoff = (backoff * 2).min(self.state.config.sync.backoff_max);
					continue;
				},
			}

			if shutdown.race(tokio::time::sleep(self.state.config.sync.resync_period)).await.is_none() {
				return;
			}
		}
	}

	/// §4.8 "Resync": diff the source snapshot against the local document
	/// hashes and reconcile via `ApplyPatch`. Used for both the initial
	/// load and every subsequent periodic resync — a file-backed source has
	/// no push channel, so this diff loop is also this source's
	/// "incremental updates" mechanism.
	async fn resync_once(&self) -> anyhow::Result<()> {
		let snapshot = self.source.snapshot().await?;
		let mut last = self.last_hashes.lock();
		let mut next_hashes = last.clone();

		for (tenant, doc) in &snapshot.documents {
			let hash = document_hash(&serde_json::to_vec(doc).expect("OverrideDocument is always serializable"));
			if last.get(tenant) != Some(&hash) {
				let limits = doc.to_limits();
				match limits.validate() {
					Ok(()) => {
						self.state.limits.apply_patch(tenant.clone(), Patch::Upsert(limits));
						next_hashes.insert(tenant.clone(), hash);
					},
					Err(err) => {
						// §3 invariant violation: treated like an unparseable
						// document — log, skip, keep the previous value. The
						// hash is deliberately left unchanged so this tenant
						// is re-validated (and re-logged) on every resync
						// until the source is fixed.
						tracing::warn!(%tenant, error = %err, "invalid override document; keeping previous value");
					},
				}
				continue;
			}
			next_hashes.insert(tenant.clone(), hash);
		}

		for tenant in last.keys() {
			let still_present = snapshot.documents.contains_key(tenant);
			let skipped_this_round = snapshot.unparseable.contains(tenant);
			if !still_present && !skipped_this_round {
				self.state.limits.apply_patch(tenant.clone(), Patch::Tombstone);
				next_hashes.remove(tenant);
			}
		}

		*last = next_hashes;
		Ok(())
	}
}

pub fn staleness_channel() -> (StalenessSender, StalenessReceiver) {
	watch::channel(0.0)
}

pub fn ready_channel() -> (ReadySender, ReadyReceiver) {
	watch::channel(false)
}
