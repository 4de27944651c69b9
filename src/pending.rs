// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 duplex-rpc authors

//! The pending-query table (spec §4.2): a monotonic id allocator paired with
//! a map from id to a one-shot response slot.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::warn;

use crate::error::{Error, Result};
use crate::value::Cell;

pub struct PendingQueries {
	next_id: AtomicU64,
	slots: DashMap<u64, oneshot::Sender<Result<Cell>>>,
}

impl PendingQueries {
	pub fn new() -> Self {
		PendingQueries { next_id: AtomicU64::new(1), slots: DashMap::new() }
	}

	/// Allocates a fresh request id and its one-shot response future.
	/// Ids are never reused within the lifetime of this table.
	pub fn allocate(&self) -> (u64, oneshot::Receiver<Result<Cell>>) {
		let id = self.next_id.fetch_add(1, Ordering::SeqCst);
		let (tx, rx) = oneshot::channel();
		self.slots.insert(id, tx);
		(id, rx)
	}

	/// Resolves a pending query. An unknown id is logged and discarded,
	/// never treated as fatal (spec §4.2).
	pub fn resolve(&self, id: u64, value: Result<Cell>) {
		match self.slots.remove(&id) {
			Some((_, tx)) => {
				let _ = tx.send(value);
			}
			None => warn!(response_id = id, "Unknown response ID: {id}"),
		}
	}

	/// Rejects and removes every pending entry, used when the owning
	/// transport closes (spec §4.2 `rejectAll`).
	pub fn reject_all(&self, reason: Option<String>) {
		let ids: Vec<u64> = self.slots.iter().map(|e| *e.key()).collect();
		for id in ids {
			if let Some((_, tx)) = self.slots.remove(&id) {
				let err = match &reason {
					Some(r) => Error::connection_closed_with(r.clone()),
					None => Error::connection_closed(),
				};
				let _ = tx.send(Err(err));
			}
		}
	}

	pub fn cancel(&self, id: u64) {
		if let Some((_, tx)) = self.slots.remove(&id) {
			let _ = tx.send(Err(Error::Cancelled));
		}
	}

	pub fn len(&self) -> usize {
		self.slots.len()
	}

	pub fn is_empty(&self) -> bool {
		self.slots.is_empty()
	}
}

impl Default for PendingQueries {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn unknown_response_id_is_not_fatal() {
		let pending = PendingQueries::new();
		// No panics, no error returned: just a log line (see `resolve`).
		pending.resolve(999, Ok(crate::value::Value::Unit.cell()));
	}

	#[tokio::test]
	async fn reject_all_delivers_connection_closed() {
		let pending = PendingQueries::new();
		let (_id, rx) = pending.allocate();
		pending.reject_all(Some("socket dropped".into()));
		let result = rx.await.unwrap();
		assert!(result.unwrap_err().is_connection_closed());
	}
}
