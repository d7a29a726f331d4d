//! Graceful shutdown primitives shared by the two gRPC servers and the sync
//! controller. Mirrors the teacher's `agent_core::signal`/`drain` naming: a
//! single `ShutdownTrigger` fires once (on SIGTERM/SIGINT or an explicit
//! call), and any number of `DrainWatcher`s can await it.

use std::future::Future;

use tokio::sync::watch;

#[derive(Clone)]
pub struct ShutdownTrigger {
	tx: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct DrainWatcher {
	rx: watch::Receiver<bool>,
}

pub fn new() -> (ShutdownTrigger, DrainWatcher) {
	let (tx, rx) = watch::channel(false);
	(ShutdownTrigger { tx }, DrainWatcher { rx })
}

impl ShutdownTrigger {
	/// Signal all watchers that the process is shutting down. Idempotent.
	pub fn shutdown(&self) {
		let _ = self.tx.send(true);
	}
}

impl DrainWatcher {
	/// Resolves once `shutdown()` has been called.
	pub async fn signaled(&mut self) {
		if *self.rx.borrow() {
			return;
		}
		let _ = self.rx.changed().await;
	}

	/// Race `fut` against the shutdown signal; returns `None` if shutdown won.
	pub async fn race<F: Future>(&mut self, fut: F) -> Option<F::Output> {
		tokio::select! {
			biased;
			_ = self.signaled() => None,
			out = fut => Some(out),
		}
	}
}

/// Waits for either SIGTERM or SIGINT (ctrl-c) on unix, or ctrl-c alone
/// elsewhere, then fires `trigger`.
pub async fn wait_for_signal(trigger: ShutdownTrigger) {
	#[cfg(unix)]
	{
		use tokio::signal::unix::{SignalKind, signal};
		let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
		tokio::select! {
			_ = term.recv() => {},
			_ = tokio::signal::ctrl_c() => {},
		}
	}
	#[cfg(not(unix))]
	{
		let _ = tokio::signal::ctrl_c().await;
	}
	trigger.shutdown();
}
