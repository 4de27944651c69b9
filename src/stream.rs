// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 duplex-rpc authors

//! The stream registry and chunk protocol (spec §4.3).
//!
//! Two tables live here: `inbound` (ids this side is *consuming*, receiving
//! chunks for) and `outbound` (ids this side is *producing*, reading from a
//! local [`LazySequence`] and writing chunks). Both are keyed by a single
//! monotonic `StreamId` counter per transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, Notify};

use crate::error::{Error, Result};
use crate::message::RawType;
use crate::value::Value;

pub type StreamId = u64;

/// An item yielded by a local producer. Raw items are written as the
/// two-frame `chunk{type}` + payload pair; anything else is serialized
/// through the codec as `chunk{data}` (spec §4.3 step 3).
#[derive(Debug, Clone)]
pub enum StreamItem {
	Value(Value),
	RawString(String),
	RawBytes(Vec<u8>),
}

/// A cooperative cancellation signal shared between the holder of a
/// sequence and whoever may need to stop it early (a remote `cancel` frame,
/// or the transport closing).
#[derive(Clone)]
pub struct CancelHandle {
	cancelled: Arc<AtomicBool>,
	reason: Arc<parking_lot::Mutex<Option<String>>>,
	notify: Arc<Notify>,
}

impl CancelHandle {
	pub fn new() -> Self {
		CancelHandle {
			cancelled: Arc::new(AtomicBool::new(false)),
			reason: Arc::new(parking_lot::Mutex::new(None)),
			notify: Arc::new(Notify::new()),
		}
	}

	pub fn cancel(&self, reason: impl Into<String>) {
		if !self.cancelled.swap(true, Ordering::SeqCst) {
			*self.reason.lock() = Some(reason.into());
			self.notify.notify_waiters();
		}
	}

	pub fn is_cancelled(&self) -> bool {
		self.cancelled.load(Ordering::SeqCst)
	}

	pub fn reason(&self) -> Option<String> {
		self.reason.lock().clone()
	}

	/// Resolves once [`CancelHandle::cancel`] has been called.
	pub async fn cancelled(&self) {
		loop {
			if self.is_cancelled() {
				return;
			}
			let notified = self.notify.notified();
			if self.is_cancelled() {
				return;
			}
			notified.await;
		}
	}
}

impl Default for CancelHandle {
	fn default() -> Self {
		Self::new()
	}
}

/// The producer side of a lazy sequence: a bounded channel the handler (or
/// any local code) pushes [`StreamItem`]s into, read by the transport's
/// per-stream producer task (spec §4.3 "Sending a lazy sequence").
#[derive(Debug)]
pub struct LazySequence {
	pub(crate) receiver: mpsc::Receiver<std::result::Result<StreamItem, String>>,
}

#[derive(Clone)]
pub struct LazySequenceSender {
	sender: mpsc::Sender<std::result::Result<StreamItem, String>>,
}

impl LazySequenceSender {
	pub async fn push(&self, item: impl Into<StreamItem>) -> bool {
		self.sender.send(Ok(item.into())).await.is_ok()
	}

	pub async fn fail(&self, err: impl Into<String>) {
		let _ = self.sender.send(Err(err.into())).await;
	}
}

impl From<Value> for StreamItem {
	fn from(v: Value) -> Self {
		StreamItem::Value(v)
	}
}
impl From<String> for StreamItem {
	fn from(v: String) -> Self {
		StreamItem::RawString(v)
	}
}
impl From<Vec<u8>> for StreamItem {
	fn from(v: Vec<u8>) -> Self {
		StreamItem::RawBytes(v)
	}
}

/// Creates a bounded lazy sequence and the handle used to push items into it.
/// `capacity` bounds the producer ahead of the consumer (backpressure, spec
/// §1/§5).
pub fn lazy_sequence(capacity: usize) -> (LazySequenceSender, LazySequence) {
	let (tx, rx) = mpsc::channel(capacity.max(1));
	(LazySequenceSender { sender: tx }, LazySequence { receiver: rx })
}

/// The consumer side of an inbound stream: what `subscribe` and friends read
/// from. Produced by the codec's `LazyStream` reviver.
pub struct StreamReceiver {
	pub(crate) receiver: mpsc::Receiver<std::result::Result<StreamItem, String>>,
	pub(crate) id: StreamId,
}

impl StreamReceiver {
	/// Reads the next item, or `None` once the producer finished
	/// normally (`done`).
	pub async fn next(&mut self) -> Option<std::result::Result<StreamItem, String>> {
		self.receiver.recv().await
	}

	/// The id to pass to `Transport::cancel_inbound` to cancel
	/// consumption and send the wire `cancel` frame.
	pub fn id(&self) -> StreamId {
		self.id
	}
}

struct InboundEntry {
	sink: mpsc::Sender<std::result::Result<StreamItem, String>>,
	canceled: AtomicBool,
}

struct OutboundEntry {
	cancel: CancelHandle,
}

/// Tracks the two-frame `chunk{type}` + raw-payload coupling (spec §4.3,
/// "Receiving"). At most one announcement may be outstanding per transport
/// at a time; the next physical frame must consume it before any other
/// control frame is parsed.
struct PendingRaw {
	id: StreamId,
	physical_type: RawType,
}

/// Per-transport inbound/outbound stream tables plus the stream-id counter
/// and the `expectedRaw` slot (spec §4.3).
pub struct StreamRegistry {
	inbound: DashMap<StreamId, InboundEntry>,
	outbound: DashMap<StreamId, OutboundEntry>,
	/// Consumer handles awaiting pickup by application code, keyed by the
	/// id the codec's `LazyStream` reviver just decoded. Populated by
	/// [`StreamRegistry::register_inbound`], drained by
	/// [`StreamRegistry::take_receiver`].
	receivers: DashMap<StreamId, mpsc::Receiver<std::result::Result<StreamItem, String>>>,
	next_id: AtomicU64,
	expected_raw: parking_lot::Mutex<Option<PendingRaw>>,
}

impl StreamRegistry {
	pub fn new() -> Self {
		StreamRegistry {
			inbound: DashMap::new(),
			outbound: DashMap::new(),
			receivers: DashMap::new(),
			next_id: AtomicU64::new(1),
			expected_raw: parking_lot::Mutex::new(None),
		}
	}

	fn allocate_id(&self) -> StreamId {
		self.next_id.fetch_add(1, Ordering::SeqCst)
	}

	/// Registers a new outbound stream id and cancel handle (spec §4.3
	/// step 1). Returns the id to place on the wire.
	pub fn register_outbound(&self) -> (StreamId, CancelHandle) {
		let id = self.allocate_id();
		let cancel = CancelHandle::new();
		self.outbound.insert(id, OutboundEntry { cancel: cancel.clone() });
		(id, cancel)
	}

	pub fn remove_outbound(&self, id: StreamId) {
		self.outbound.remove(&id);
	}

	/// Registers an inbound stream for a wire-assigned id (the codec's
	/// `LazyStream` reviver calls this with the id it just decoded). The
	/// consumer-facing handle is parked in `receivers` until application
	/// code claims it with [`StreamRegistry::take_receiver`].
	pub fn register_inbound(&self, id: StreamId, capacity: usize) {
		let (tx, rx) = mpsc::channel(capacity.max(1));
		self.inbound.insert(id, InboundEntry { sink: tx, canceled: AtomicBool::new(false) });
		self.receivers.insert(id, rx);
	}

	/// Claims the consumer handle for a previously decoded stream id.
	/// Returns `None` if already claimed or the id is unknown.
	pub fn take_receiver(&self, id: StreamId) -> Option<StreamReceiver> {
		self.receivers.remove(&id).map(|(_, receiver)| StreamReceiver { receiver, id })
	}

	/// Local consumer cancel: mark canceled, keep the entry registered
	/// until the producer's `done`/`error` arrives (spec §4.3 "Consumer-
	/// initiated cancel").
	pub fn mark_inbound_canceled(&self, id: StreamId) {
		if let Some(entry) = self.inbound.get(&id) {
			entry.canceled.store(true, Ordering::SeqCst);
		}
	}

	pub fn remove_inbound(&self, id: StreamId) {
		self.inbound.remove(&id);
	}

	pub fn has_inbound(&self, id: StreamId) -> bool {
		self.inbound.contains_key(&id)
	}

	pub fn has_outbound(&self, id: StreamId) -> bool {
		self.outbound.contains_key(&id)
	}

	pub fn outbound_cancel_handle(&self, id: StreamId) -> Option<CancelHandle> {
		self.outbound.get(&id).map(|e| e.cancel.clone())
	}

	/// Routes a decoded chunk item to its sink. Silently discards items
	/// for ids already locally canceled (spec §4.3, "If a canceled
	/// inbound receives further chunks... silently discard").
	pub async fn deliver_chunk(&self, id: StreamId, item: std::result::Result<StreamItem, String>) -> Result<()> {
		let sink = match self.inbound.get(&id) {
			Some(entry) => {
				if entry.canceled.load(Ordering::SeqCst) {
					return Ok(());
				}
				entry.sink.clone()
			}
			None => return Err(Error::Protocol(format!("unknown stream id in chunk: {id}"))),
		};
		let _ = sink.send(item).await;
		Ok(())
	}

	/// Terminates an inbound stream: `Ok(())` for a `done` frame (the
	/// sender simply drops, so a pending `.next()` observes `None`),
	/// `Err(message)` for an `error` frame (delivered to the sink before
	/// the entry is removed).
	pub async fn finish_inbound(&self, id: StreamId, outcome: std::result::Result<(), String>) -> Result<()> {
		let entry = match self.inbound.remove(&id) {
			Some((_, entry)) => entry,
			None => return Err(Error::Protocol(format!("unknown stream id: {id}"))),
		};
		if let Err(message) = outcome {
			if !entry.canceled.load(Ordering::SeqCst) {
				let _ = entry.sink.send(Err(message)).await;
			}
		}
		Ok(())
	}

	/// Consumer-initiated cancel target lookup: find the outbound handle
	/// a remote `cancel` frame refers to and fire it.
	pub fn cancel_outbound(&self, id: StreamId, reason: Option<String>) -> Result<()> {
		match self.outbound.get(&id) {
			Some(entry) => {
				entry.cancel.cancel(reason.unwrap_or_default());
				Ok(())
			}
			None => Err(Error::Protocol(format!("cancel for unknown stream id: {id}"))),
		}
	}

	/// Sets the `expectedRaw` slot. Errors if one was already pending —
	/// that would mean two `chunk{type}` announcements in a row with no
	/// raw payload between them, a protocol violation.
	pub fn expect_raw(&self, id: StreamId, physical_type: RawType) -> Result<()> {
		let mut slot = self.expected_raw.lock();
		if slot.is_some() {
			return Err(Error::Protocol("chunk{type} announced while another was pending".into()));
		}
		*slot = Some(PendingRaw { id, physical_type });
		Ok(())
	}

	/// Consumes the `expectedRaw` slot for an arriving physical frame, or
	/// errors if none was pending (spec §4.3 `UnexpectedRaw`).
	pub fn take_expected_raw(&self) -> Result<(StreamId, RawType)> {
		let mut slot = self.expected_raw.lock();
		match slot.take() {
			Some(pending) => Ok((pending.id, pending.physical_type)),
			None => Err(Error::Protocol("raw frame with no expectedRaw slot set".into())),
		}
	}

	pub fn has_expected_raw(&self) -> bool {
		self.expected_raw.lock().is_some()
	}

	/// Drains and fails every registered stream, used by `Transport::close`.
	pub fn close_all(&self, reason: &str) {
		for entry in self.outbound.iter() {
			entry.cancel.cancel(reason.to_string());
		}
		self.outbound.clear();

		let ids: Vec<StreamId> = self.inbound.iter().map(|e| *e.key()).collect();
		for id in ids {
			if let Some((_, entry)) = self.inbound.remove(&id) {
				let _ = entry.sink.try_send(Err(reason.to_string()));
			}
		}
	}
}

impl Default for StreamRegistry {
	fn default() -> Self {
		Self::new()
	}
}

/// Snapshot of pending-raw state used only for protocol assertions in tests.
#[allow(dead_code)]
pub(crate) fn debug_pending_raw_ids(registry: &StreamRegistry) -> HashMap<StreamId, RawType> {
	let mut map = HashMap::new();
	if let Some(pending) = registry.expected_raw.lock().as_ref() {
		map.insert(pending.id, pending.physical_type);
	}
	map
}
