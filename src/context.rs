// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 duplex-rpc authors

//! Per-connection context without hidden globals (spec §9).
//!
//! The original design keeps a process-wide "current client key" that
//! handlers read through a context reader. Here the equivalent is a
//! `tokio::task_local!` map bound for the duration of one dispatched
//! handler invocation: [`Server::dispatch`](crate::server::Server::dispatch)
//! establishes the scope, and [`ContextKey::get`] reads out of it. No
//! component relies on thread-local "current cancellation" either — every
//! suspension point takes an explicit [`CancelWatch`].

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::stream::CancelHandle;

/// An opaque, process-unique handle identifying one accepted socket,
/// matching spec §4.6's "current client context key" concept. Used as the
/// key for per-connection context storage (`ContextKey` values are scoped
/// per call, this is scoped per connection).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionKey(pub u64);

/// Per-connection state store: arbitrary typed values keyed by a
/// [`ContextKey`]'s own identity, created once when a connection is
/// accepted and shared by every handler invocation for that connection
/// (spec §8 scenario 5, "middleware counter").
#[derive(Default, Clone)]
pub struct ConnectionContext {
	values: Arc<RwLock<HashMap<usize, Box<dyn Any + Send + Sync>>>>,
}

/// A typed accessor over [`ConnectionContext`], identified by its own
/// address the way the original's context reader is identified by its own
/// module-level constant.
pub struct ContextKey<T> {
	_marker: std::marker::PhantomData<T>,
}

impl<T: Send + Sync + Clone + 'static> ContextKey<T> {
	pub const fn new() -> Self {
		ContextKey { _marker: std::marker::PhantomData }
	}

	fn slot(&self) -> usize {
		self as *const Self as usize
	}

	pub fn get(&self, ctx: &ConnectionContext) -> Option<T> {
		ctx.values.read().get(&self.slot()).and_then(|v| v.downcast_ref::<T>()).cloned()
	}

	pub fn set(&self, ctx: &ConnectionContext, value: T) {
		ctx.values.write().insert(self.slot(), Box::new(value));
	}

	/// Reads the current value (or `default`), applies `f`, and stores
	/// the result back. Used by middleware-style counters.
	pub fn update(&self, ctx: &ConnectionContext, default: T, f: impl FnOnce(T) -> T) -> T {
		let current = self.get(ctx).unwrap_or(default);
		let next = f(current);
		self.set(ctx, next.clone());
		next
	}
}

impl<T: Send + Sync + Clone + 'static> Default for ContextKey<T> {
	fn default() -> Self {
		Self::new()
	}
}

tokio::task_local! {
	/// Bound for the duration of one dispatched handler invocation; this
	/// is what lets handlers read per-connection context without an
	/// explicit parameter threaded through every call signature.
	pub static CURRENT_CONNECTION: ConnectionContext;
}

/// Runs `f` with `ctx` bound as the current connection's context.
pub async fn with_connection_context<F, Fut, R>(ctx: ConnectionContext, f: F) -> R
where
	F: FnOnce() -> Fut,
	Fut: std::future::Future<Output = R>,
{
	CURRENT_CONNECTION.scope(ctx, f()).await
}

/// Reads a [`ContextKey`] out of the ambient connection context bound by
/// [`with_connection_context`]. Panics outside a handler invocation, the
/// same contract as the original's context reader.
pub fn current<T: Send + Sync + Clone + 'static>(key: &ContextKey<T>) -> Option<T> {
	CURRENT_CONNECTION.with(|ctx| key.get(ctx))
}

/// A read-only view of a [`CancelHandle`], passed explicitly to every
/// suspension point in the core rather than relying on a thread-local
/// "current cancellation" (spec §5, §9).
#[derive(Clone)]
pub struct CancelWatch(CancelHandle);

impl CancelWatch {
	pub fn from_handle(handle: CancelHandle) -> Self {
		CancelWatch(handle)
	}

	/// A watch that is never cancelled; used where an ambient signal
	/// wasn't supplied by the caller.
	pub fn never() -> Self {
		CancelWatch(CancelHandle::new())
	}

	pub fn is_cancelled(&self) -> bool {
		self.0.is_cancelled()
	}

	pub async fn cancelled(&self) {
		self.0.cancelled().await
	}
}

impl Default for CancelWatch {
	fn default() -> Self {
		CancelWatch::never()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	static COUNTER: ContextKey<i64> = ContextKey::new();

	#[tokio::test]
	async fn middleware_counter_increments_per_call() {
		let ctx = ConnectionContext::default();
		for expected in [1i64, 2, 3] {
			let ctx = ctx.clone();
			let got = with_connection_context(ctx, || async {
				let updated = COUNTER.update(&current_ctx(), 0, |n| n + 1);
				updated
			})
			.await;
			assert_eq!(got, expected);
		}
	}

	fn current_ctx() -> ConnectionContext {
		CURRENT_CONNECTION.with(|c| c.clone())
	}
}
