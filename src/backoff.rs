// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 duplex-rpc authors

//! Reconnection backoff policy (spec §4.5).

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A predicate deciding whether a failed attempt should be retried. Given
/// the error and the 1-indexed attempt number; returning `false` short-
/// circuits the backoff loop and re-raises the error immediately.
pub type RetryPredicate = Arc<dyn Fn(&Error, u32) -> bool + Send + Sync>;

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
	pub starting_delay_ms: u64,
	pub time_multiple: f64,
	pub max_delay_ms: Option<u64>,
	pub jitter: bool,
	pub num_of_attempts: u32,
	#[serde(skip, default = "default_retry")]
	pub retry: RetryPredicate,
}

fn default_retry() -> RetryPredicate {
	Arc::new(|_, _| true)
}

impl Default for BackoffConfig {
	fn default() -> Self {
		BackoffConfig {
			starting_delay_ms: 100,
			time_multiple: 2.0,
			max_delay_ms: None,
			jitter: false,
			num_of_attempts: 10,
			retry: default_retry(),
		}
	}
}

impl BackoffConfig {
	/// The delay before attempt `n` (1-indexed), before jitter (spec
	/// §4.5 table).
	pub fn delay_for_attempt(&self, n: u32) -> Duration {
		let exp = self.time_multiple.powi((n.saturating_sub(1)) as i32);
		let mut delay_ms = self.starting_delay_ms as f64 * exp;
		if let Some(max) = self.max_delay_ms {
			delay_ms = delay_ms.min(max as f64);
		}
		Duration::from_millis(delay_ms.max(0.0) as u64)
	}

	fn jittered(&self, delay: Duration) -> Duration {
		if self.jitter {
			let ms = delay.as_millis().max(1) as u64;
			Duration::from_millis(rand::rng().random_range(0..=ms))
		} else {
			delay
		}
	}
}

/// Runs `attempt` with exponential backoff, honoring `config.retry` and
/// `config.num_of_attempts`, and the ambient cancellation `signal`. Returns
/// the first `Ok`, or the last error once attempts/retry are exhausted.
pub async fn with_backoff<T, F, Fut>(config: &BackoffConfig, mut signal: crate::context::CancelWatch, mut attempt: F) -> Result<T>
where
	F: FnMut() -> Fut,
	Fut: std::future::Future<Output = Result<T>>,
{
	let mut n: u32 = 0;
	loop {
		n += 1;
		if signal.is_cancelled() {
			return Err(Error::Cancelled);
		}
		match attempt().await {
			Ok(value) => return Ok(value),
			Err(err) => {
				if n >= config.num_of_attempts || !(config.retry)(&err, n) {
					return Err(err);
				}
				let delay = config.jittered(config.delay_for_attempt(n));
				tokio::select! {
					_ = tokio::time::sleep(delay) => {}
					_ = signal.cancelled() => return Err(Error::Cancelled),
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicU32, Ordering};

	#[test]
	fn delay_grows_exponentially_and_caps() {
		let config = BackoffConfig { starting_delay_ms: 100, time_multiple: 2.0, max_delay_ms: Some(500), ..Default::default() };
		assert_eq!(config.delay_for_attempt(1), Duration::from_millis(100));
		assert_eq!(config.delay_for_attempt(2), Duration::from_millis(200));
		assert_eq!(config.delay_for_attempt(3), Duration::from_millis(400));
		assert_eq!(config.delay_for_attempt(4), Duration::from_millis(500));
	}

	#[tokio::test(start_paused = true)]
	async fn single_attempt_surfaces_immediately() {
		let config = BackoffConfig { num_of_attempts: 1, ..Default::default() };
		let calls = AtomicU32::new(0);
		let result: Result<()> = with_backoff(&config, crate::context::CancelWatch::never(), || {
			calls.fetch_add(1, Ordering::SeqCst);
			async { Err(Error::Adapter("boom".into())) }
		})
		.await;
		assert!(result.is_err());
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn retry_false_short_circuits_without_sleeping() {
		let config = BackoffConfig { retry: Arc::new(|_, _| false), ..Default::default() };
		let calls = AtomicU32::new(0);
		let result: Result<()> = with_backoff(&config, crate::context::CancelWatch::never(), || {
			calls.fetch_add(1, Ordering::SeqCst);
			async { Err(Error::Adapter("boom".into())) }
		})
		.await;
		assert!(result.is_err());
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}
}
