// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 duplex-rpc authors

//! An in-process adapter pairing two connections without a real socket —
//! the test-tooling equivalent of spinning up a loopback server, used by
//! this crate's own integration tests (spec "ambient stack" addition, see
//! SPEC_FULL.md §A.4).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, Notify};

use super::{Adapter, CloseInfo, Connection};
use crate::context::CancelWatch;
use crate::error::Result;
use crate::message::RawFrame;

/// Shared between both ends of a [`connection_pair`]: closing either side
/// terminates the whole duplex channel, the in-memory equivalent of a real
/// socket dying (spec §6 `onClose` "invoked exactly once").
struct Shared {
	closed: AtomicBool,
	notify: Notify,
}

struct InMemoryConnection {
	outbox: mpsc::Sender<RawFrame>,
	inbox: Mutex<mpsc::Receiver<RawFrame>>,
	shared: Arc<Shared>,
}

#[async_trait::async_trait]
impl Connection for InMemoryConnection {
	async fn send(&self, frame: RawFrame) -> Result<()> {
		if self.shared.closed.load(Ordering::SeqCst) {
			return Err(crate::error::Error::Adapter("connection closed".into()));
		}
		self.outbox.send(frame).await.map_err(|_| crate::error::Error::Adapter("peer gone".into()))
	}

	async fn recv(&self) -> Option<RawFrame> {
		if self.shared.closed.load(Ordering::SeqCst) {
			return None;
		}
		let mut inbox = self.inbox.lock().await;
		tokio::select! {
			frame = inbox.recv() => frame,
			_ = self.shared.notify.notified() => None,
		}
	}

	async fn close(&self, _info: CloseInfo) -> Result<()> {
		if !self.shared.closed.swap(true, Ordering::SeqCst) {
			self.shared.notify.notify_waiters();
		}
		Ok(())
	}
}

/// Creates a connected pair: frames sent on one side arrive on the other.
/// Closing either end (or dropping it) ends the pair for both sides.
pub fn connection_pair() -> (Box<dyn Connection>, Box<dyn Connection>) {
	let (a_tx, a_rx) = mpsc::channel(128);
	let (b_tx, b_rx) = mpsc::channel(128);
	let shared = Arc::new(Shared { closed: AtomicBool::new(false), notify: Notify::new() });
	let a = InMemoryConnection { outbox: b_tx, inbox: Mutex::new(a_rx), shared: shared.clone() };
	let b = InMemoryConnection { outbox: a_tx, inbox: Mutex::new(b_rx), shared };
	(Box::new(a), Box::new(b))
}

/// An adapter whose `connect` always hands back one end of a fresh
/// in-memory pair, with the other end retrievable via
/// [`InMemoryAdapter::accept`] — handy for a test "server" loop.
pub struct InMemoryAdapter {
	incoming: Mutex<mpsc::Receiver<Box<dyn Connection>>>,
	server_side: mpsc::Sender<Box<dyn Connection>>,
}

impl InMemoryAdapter {
	pub fn new() -> Self {
		let (tx, rx) = mpsc::channel(16);
		InMemoryAdapter { incoming: Mutex::new(rx), server_side: tx }
	}

	/// Waits for the next client-initiated connection, returning the
	/// server-facing end.
	pub async fn accept(&self) -> Option<Box<dyn Connection>> {
		self.incoming.lock().await.recv().await
	}
}

impl Default for InMemoryAdapter {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait::async_trait]
impl Adapter for InMemoryAdapter {
	async fn connect(&self, _url: &str, _signal: CancelWatch) -> Result<Box<dyn Connection>> {
		let (client, server) = connection_pair();
		self.server_side.send(server).await.map_err(|_| crate::error::Error::Adapter("no listener".into()))?;
		Ok(client)
	}
}
