//! §4.3 "Token-bucket semantics": lazy refill driven by a monotonic clock,
//! capacity `rate * burst_multiplier`. Grounded on the teacher's local
//! rate-limiter's atomic-counter/lazy-refill shape, adapted to plain fields
//! guarded by the caller's lock rather than atomics — §4.3 already requires
//! serializing every multi-bucket charge under one per-tenant mutex, so a
//! second layer of per-bucket atomics would buy nothing.

use std::time::{Duration, Instant};

use crate::limits::Rate;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChargeResult {
	Ok { remaining: f64 },
	Denied { deficit: f64 },
}

#[derive(Debug, Clone)]
pub struct TokenBucket {
	capacity: f64,
	rate_per_sec: f64,
	tokens: f64,
	last_refill: Instant,
}

impl TokenBucket {
	/// A freshly created or freshly re-added bucket "starts full" (§4.2).
	pub fn new(rate: Rate, now: Instant) -> Self {
		let capacity = rate.capacity() as f64;
		TokenBucket {
			capacity,
			rate_per_sec: rate.per_second as f64,
			tokens: capacity,
			last_refill: now,
		}
	}

	fn refill(&mut self, now: Instant) {
		let elapsed = now.saturating_duration_since(self.last_refill);
		if elapsed > Duration::ZERO {
			self.tokens = (self.tokens + elapsed.as_secs_f64() * self.rate_per_sec).min(self.capacity);
			self.last_refill = now;
		}
	}

	/// Non-committing: would this charge succeed if attempted right now?
	pub fn peek(&mut self, cost: f64, now: Instant) -> ChargeResult {
		self.refill(now);
		if self.tokens >= cost {
			ChargeResult::Ok {
				remaining: self.tokens - cost,
			}
		} else {
			ChargeResult::Denied {
				deficit: cost - self.tokens,
			}
		}
	}

	/// Commits a charge already validated by [`TokenBucket::peek`]. Callers
	/// must not skip `peek` — `commit` does not itself refuse an overdraft.
	pub fn commit(&mut self, cost: f64) {
		self.tokens -= cost;
	}

	pub fn tokens(&self) -> f64 {
		self.tokens
	}

	/// §4.2 "changing `samples_per_second` keeps the bucket's current
	/// tokens, and only adjusts the refill rate and max-capacity." Tokens
	/// above the new, smaller capacity are clamped down.
	pub fn retune(&mut self, rate: Rate, now: Instant) {
		self.refill(now);
		self.capacity = rate.capacity() as f64;
		self.rate_per_sec = rate.per_second as f64;
		self.tokens = self.tokens.min(self.capacity);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn starts_full() {
		let b = TokenBucket::new(Rate::new(100), Instant::now());
		assert_eq!(b.tokens(), 100.0);
	}

	#[test]
	fn charge_drains_tokens() {
		let mut b = TokenBucket::new(Rate::new(100), Instant::now());
		let now = Instant::now();
		assert_eq!(b.peek(40.0, now), ChargeResult::Ok { remaining: 60.0 });
		b.commit(40.0);
		assert_eq!(b.tokens(), 60.0);
	}

	#[test]
	fn empty_bucket_denies() {
		let mut b = TokenBucket::new(Rate::new(100), Instant::now());
		let now = Instant::now();
		b.commit(100.0);
		match b.peek(1.0, now) {
			ChargeResult::Denied { deficit } => assert!((deficit - 1.0).abs() < 1e-9),
			other => panic!("expected denied, got {other:?}"),
		}
	}

	#[test]
	fn retune_preserves_tokens_below_new_capacity() {
		let mut b = TokenBucket::new(Rate::new(100), Instant::now());
		let now = Instant::now();
		b.commit(50.0);
		assert_eq!(b.tokens(), 50.0);
		b.retune(Rate::new(200), now);
		assert_eq!(b.tokens(), 50.0);
	}

	#[test]
	fn retune_clamps_tokens_above_smaller_capacity() {
		let mut b = TokenBucket::new(Rate::new(100), Instant::now());
		let now = Instant::now();
		b.retune(Rate::new(10), now);
		assert_eq!(b.tokens(), 10.0);
	}
}
