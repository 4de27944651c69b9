// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 duplex-rpc authors

//! The stateful engine tying the codec and stream registry to a byte channel
//! (spec §2 component 3, §4.3, §5).
//!
//! One `Transport` is created per accepted socket and lives until it is
//! closed or the underlying connection dies; a reconnect always creates a
//! fresh instance (spec §3 "Transport" lifecycle). A background task owns
//! the read side exclusively, routing every frame either into the stream
//! registry, the pending-query table, or — for a `ClientMessage` a peer
//! wants handled — an `mpsc` channel the caller drains. All writes go
//! through a single-writer lock so the `chunk{type}` + raw-payload pair can
//! never be interleaved with another frame (spec §4.3 "Atomicity
//! requirement").

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value as Json;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tracing::{instrument, warn};

use crate::adapter::{CloseInfo, Connection};
use crate::codec::Codec;
use crate::error::{Error, RemoteMethodError, Result};
use crate::message::{ClientMessage, ControlFrame, RawFrame, RawType, ServerMessage, StreamFrame};
use crate::pending::PendingQueries;
use crate::stream::{CancelHandle, LazySequence, StreamId, StreamItem, StreamRegistry};
use crate::value::{Cell, Value};

/// Either side of the wire's two message shapes, decoded from one JSON
/// array frame (spec §3 `ClientMessage`/`ServerMessage`).
enum Envelope {
	Client(ClientMessage),
	Server(ServerMessage),
}

pub struct Transport {
	connection: Box<dyn Connection>,
	codec: Arc<Codec>,
	streams: StreamRegistry,
	pending: Arc<PendingQueries>,
	write_lock: AsyncMutex<()>,
	last_message: parking_lot::Mutex<Instant>,
	pong_notify: Notify,
	closed: AtomicBool,
	closed_notify: Notify,
	requests_tx: mpsc::Sender<ClientMessage>,
}

impl Transport {
	/// Wraps a freshly opened connection. Spawns the background read loop
	/// immediately; incoming `ClientMessage`s needing dispatch arrive on
	/// the returned receiver.
	pub fn new(connection: Box<dyn Connection>, codec: Arc<Codec>, pending: Arc<PendingQueries>) -> (Arc<Transport>, mpsc::Receiver<ClientMessage>) {
		let (requests_tx, requests_rx) = mpsc::channel(64);
		let transport = Arc::new(Transport {
			connection,
			codec,
			streams: StreamRegistry::new(),
			pending,
			write_lock: AsyncMutex::new(()),
			last_message: parking_lot::Mutex::new(Instant::now()),
			pong_notify: Notify::new(),
			closed: AtomicBool::new(false),
			closed_notify: Notify::new(),
			requests_tx,
		});
		let reader = transport.clone();
		tokio::spawn(async move { reader.read_loop().await });
		(transport, requests_rx)
	}

	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::SeqCst)
	}

	/// Resolves once the connection has terminated, locally or remotely.
	pub async fn closed(&self) {
		loop {
			if self.is_closed() {
				return;
			}
			let notified = self.closed_notify.notified();
			if self.is_closed() {
				return;
			}
			notified.await;
		}
	}

	pub fn time_since_last_message(&self) -> Duration {
		self.last_message.lock().elapsed()
	}

	fn touch_last_message(&self) {
		*self.last_message.lock() = Instant::now();
	}

	/// Closes the underlying connection and tears down every stream and
	/// pending query with `reason` (spec §3 "After close(reason)...").
	pub async fn close(&self, info: CloseInfo) -> Result<()> {
		if self.closed.swap(true, Ordering::SeqCst) {
			return Ok(());
		}
		let reason = info.reason.clone();
		let _ = self.connection.close(info).await;
		self.streams.close_all(&reason);
		self.pending.reject_all(Some(reason));
		self.closed_notify.notify_waiters();
		Ok(())
	}

	fn mark_closed_remotely(&self, reason: &str) {
		if self.closed.swap(true, Ordering::SeqCst) {
			return;
		}
		self.streams.close_all(reason);
		self.pending.reject_all(Some(reason.to_string()));
		self.closed_notify.notify_waiters();
	}

	async fn write_text(&self, text: String) -> Result<()> {
		let _guard = self.write_lock.lock().await;
		self.connection.send(RawFrame::Text(text)).await
	}

	pub async fn send_control(&self, frame: ControlFrame) -> Result<()> {
		self.write_text(frame.as_str().to_string()).await
	}

	/// Sends a call request, spawning any lazy-sequence producer tasks the
	/// flatten pass discovered only *after* the frame write completes
	/// (spec §4.3 step 2 ordering requirement).
	pub async fn send_client_message(self: &Arc<Self>, message: &ClientMessage) -> Result<()> {
		let value = client_message_to_value(message);
		let flattened = self.codec.flatten(&value.cell(), &self.streams)?;
		self.write_text(Json::Array(flattened.frame).to_string()).await?;
		self.spawn_producers(flattened.pending_producers);
		Ok(())
	}

	pub async fn send_server_message(self: &Arc<Self>, message: &ServerMessage) -> Result<()> {
		let value = server_message_to_value(message);
		let flattened = self.codec.flatten(&value.cell(), &self.streams)?;
		self.write_text(Json::Array(flattened.frame).to_string()).await?;
		self.spawn_producers(flattened.pending_producers);
		Ok(())
	}

	/// Marks an inbound stream canceled and notifies the producer (spec
	/// §4.3 "Consumer-initiated cancel").
	pub async fn cancel_inbound(&self, id: StreamId, reason: Option<String>) -> Result<()> {
		self.streams.mark_inbound_canceled(id);
		self.write_text(stream_frame_to_json(&StreamFrame::Cancel { id, reason }).to_string()).await
	}

	pub fn streams(&self) -> &StreamRegistry {
		&self.streams
	}

	fn spawn_producers(self: &Arc<Self>, producers: Vec<(StreamId, LazySequence, CancelHandle)>) {
		for (id, sequence, cancel) in producers {
			let transport = self.clone();
			tokio::spawn(async move { transport.run_producer(id, sequence, cancel).await });
		}
	}

	#[instrument(level = "debug", skip(self, sequence, cancel))]
	async fn run_producer(self: Arc<Self>, id: StreamId, mut sequence: LazySequence, cancel: CancelHandle) {
		loop {
			tokio::select! {
				_ = cancel.cancelled() => break,
				item = sequence.receiver.recv() => match item {
					None => {
						let _ = self.write_text(stream_frame_to_json(&StreamFrame::Done { id }).to_string()).await;
						break;
					}
					Some(Err(message)) => {
						let _ = self.write_text(stream_frame_to_json(&StreamFrame::Error { id, error: message }).to_string()).await;
						break;
					}
					Some(Ok(StreamItem::RawString(s))) => {
						if self.write_raw_chunk(id, RawType::String, RawFrame::Text(s)).await.is_err() {
							break;
						}
					}
					Some(Ok(StreamItem::RawBytes(b))) => {
						if self.write_raw_chunk(id, RawType::Uint8Array, RawFrame::Binary(b)).await.is_err() {
							break;
						}
					}
					Some(Ok(StreamItem::Value(value))) => {
						match self.codec.flatten(&value.cell(), &self.streams) {
							Ok(flattened) => {
								let json = serde_json::json!({ "stream": "chunk", "id": id, "data": flattened.frame });
								if self.write_text(json.to_string()).await.is_err() {
									break;
								}
								self.spawn_producers(flattened.pending_producers);
							}
							Err(err) => {
								let _ = self
									.write_text(stream_frame_to_json(&StreamFrame::Error { id, error: err.to_string() }).to_string())
									.await;
								break;
							}
						}
					}
				}
			}
		}
		self.streams.remove_outbound(id);
	}

	/// Writes the `chunk{type}` announcement and the raw payload as one
	/// atomic pair under the single write lock (spec §4.3 step 3, §5).
	async fn write_raw_chunk(&self, id: StreamId, physical: RawType, raw: RawFrame) -> Result<()> {
		let _guard = self.write_lock.lock().await;
		let announce = stream_frame_to_json(&StreamFrame::ChunkAnnounce { id, physical_type: physical });
		self.connection.send(RawFrame::Text(announce.to_string())).await?;
		self.connection.send(raw).await
	}

	/// Background read loop: the only task that ever calls
	/// `connection.recv()`. Runs until the connection closes.
	#[instrument(level = "debug", skip(self))]
	async fn read_loop(self: Arc<Self>) {
		loop {
			let frame = match self.connection.recv().await {
				Some(frame) => frame,
				None => {
					self.mark_closed_remotely("connection closed");
					return;
				}
			};
			if let Err(err) = self.handle_frame(frame).await {
				warn!(error = %err, "closing transport after protocol error");
				let _ = self.connection.close(CloseInfo::normal(err.to_string())).await;
				self.mark_closed_remotely(&err.to_string());
				return;
			}
		}
	}

	async fn handle_frame(self: &Arc<Self>, frame: RawFrame) -> Result<()> {
		if self.streams.has_expected_raw() {
			let (id, physical) = self.streams.take_expected_raw()?;
			if frame.physical_type() != physical {
				return Err(Error::Protocol(format!(
					"chunk{{type}} announced {physical:?} but the following frame was {:?}",
					frame.physical_type()
				)));
			}
			let item = match frame {
				RawFrame::Text(s) => StreamItem::RawString(s),
				RawFrame::Binary(b) => StreamItem::RawBytes(b),
			};
			self.touch_last_message();
			return self.streams.deliver_chunk(id, Ok(item)).await;
		}

		let text = match frame {
			RawFrame::Text(text) => text,
			RawFrame::Binary(_) => return Err(Error::Protocol("raw frame with no expectedRaw slot set".into())),
		};

		if text == ControlFrame::Ping.as_str() {
			self.touch_last_message();
			return self.send_control(ControlFrame::Pong).await;
		}
		if text == ControlFrame::Pong.as_str() {
			self.touch_last_message();
			self.pong_notify.notify_waiters();
			return Ok(());
		}

		self.touch_last_message();
		let json: Json = serde_json::from_str(&text).map_err(|e| Error::Protocol(format!("invalid frame: {e}")))?;
		match &json {
			Json::Array(frame) => self.handle_envelope(frame).await,
			Json::Object(obj) if obj.contains_key("stream") => self.handle_stream_control(obj).await,
			_ => Err(Error::Protocol("frame is neither an array nor a stream control object".into())),
		}
	}

	async fn handle_envelope(self: &Arc<Self>, frame: &[Json]) -> Result<()> {
		let cell = self.codec.unflatten(frame, &self.streams)?;
		match decode_envelope(&cell)? {
			Envelope::Client(message) => {
				let _ = self.requests_tx.send(message).await;
				Ok(())
			}
			Envelope::Server(message) => {
				let id = message.id();
				let result = match message {
					ServerMessage::Ok { result, .. } => Ok(result.cell()),
					ServerMessage::Err { error, .. } => Err(Error::RemoteMethod(error)),
				};
				self.pending.resolve(id, result);
				Ok(())
			}
		}
	}

	async fn handle_stream_control(&self, obj: &serde_json::Map<String, Json>) -> Result<()> {
		let kind = obj.get("stream").and_then(Json::as_str).ok_or_else(|| Error::Protocol("missing stream control kind".into()))?;
		let id = obj.get("id").and_then(Json::as_u64).ok_or_else(|| Error::Protocol("missing stream control id".into()))?;
		match kind {
			"cancel" => {
				let reason = obj.get("reason").and_then(Json::as_str).map(str::to_string);
				self.streams.cancel_outbound(id, reason)
			}
			"chunk" => {
				if let Some(type_name) = obj.get("type").and_then(Json::as_str) {
					let physical = RawType::parse(type_name).ok_or_else(|| Error::Protocol(format!("unknown physical type: {type_name}")))?;
					self.streams.expect_raw(id, physical)
				} else if let Some(Json::Array(data)) = obj.get("data") {
					let value_cell = self.codec.unflatten(data, &self.streams)?;
					let value = value_cell.read().clone();
					self.streams.deliver_chunk(id, Ok(StreamItem::Value(value))).await
				} else {
					Err(Error::Protocol("chunk frame missing type/data".into()))
				}
			}
			"done" => self.streams.finish_inbound(id, Ok(())).await,
			"error" => {
				let message = obj.get("error").and_then(Json::as_str).unwrap_or("unknown error").to_string();
				self.streams.finish_inbound(id, Err(message)).await
			}
			other => Err(Error::Protocol(format!("unknown stream control kind: {other}"))),
		}
	}

	/// Sends `"ping"` and waits up to `timeout` for a `"pong"`. Returns
	/// `true` if one arrived in time (spec §4.4 step 2, §4.6 "Liveness").
	pub async fn ping(&self, timeout: Duration) -> bool {
		if self.send_control(ControlFrame::Ping).await.is_err() {
			return false;
		}
		tokio::select! {
			_ = self.pong_notify.notified() => true,
			_ = tokio::time::sleep(timeout) => false,
		}
	}
}

/// Serializes the control-frame shaped [`StreamFrame`] variants. `Chunk`
/// carries an un-flattened `Value` and is built inline at its one call site
/// instead, where a [`Codec`] is in scope to flatten it.
fn stream_frame_to_json(frame: &StreamFrame) -> Json {
	match frame {
		StreamFrame::Cancel { id, reason } => serde_json::json!({ "stream": "cancel", "id": id, "reason": reason }),
		StreamFrame::ChunkAnnounce { id, physical_type } => {
			serde_json::json!({ "stream": "chunk", "id": id, "type": physical_type.as_str() })
		}
		StreamFrame::Done { id } => serde_json::json!({ "stream": "done", "id": id }),
		StreamFrame::Error { id, error } => serde_json::json!({ "stream": "error", "id": id, "error": error }),
		StreamFrame::Chunk { .. } => unreachable!("chunk{{data}} frames are built at their one call site in run_producer"),
	}
}

fn client_message_to_value(message: &ClientMessage) -> Value {
	Value::map([
		("id".to_string(), Value::Int(message.id as i64)),
		("method".to_string(), Value::Str(message.method.clone())),
		("params".to_string(), Value::array(message.params.iter().cloned())),
	])
}

fn server_message_to_value(message: &ServerMessage) -> Value {
	match message {
		ServerMessage::Ok { id, result } => {
			Value::map([("id".to_string(), Value::Int(*id as i64)), ("result".to_string(), result.clone())])
		}
		ServerMessage::Err { id, error } => {
			let error_value = match error {
				RemoteMethodError::Message(msg) => Value::Str(msg.clone()),
				RemoteMethodError::Opaque => Value::Bool(true),
			};
			Value::map([("id".to_string(), Value::Int(*id as i64)), ("error".to_string(), error_value)])
		}
	}
}

fn map_field<'a>(entries: &'a [(String, Cell)], key: &str) -> Option<&'a Cell> {
	entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
}

fn decode_envelope(cell: &Cell) -> Result<Envelope> {
	let value = cell.read().clone();
	let entries = match value {
		Value::Map(entries) => entries,
		_ => return Err(Error::Protocol("message envelope is not a map".into())),
	};
	let id = map_field(&entries, "id")
		.and_then(|c| c.read().as_int())
		.ok_or_else(|| Error::Protocol("message envelope missing id".into()))? as u64;

	if let Some(method) = map_field(&entries, "method") {
		let method = method.read().as_str().ok_or_else(|| Error::Protocol("method must be a string".into()))?.to_string();
		let params = match map_field(&entries, "params").map(|c| c.read().clone()) {
			Some(Value::Array(items)) => items.iter().map(|c| c.read().clone()).collect(),
			Some(_) => return Err(Error::Protocol("params must be an array".into())),
			None => Vec::new(),
		};
		return Ok(Envelope::Client(ClientMessage { id, method, params }));
	}

	if let Some(error) = map_field(&entries, "error") {
		let error = match error.read().clone() {
			Value::Str(message) => RemoteMethodError::Message(message),
			Value::Bool(true) => RemoteMethodError::Opaque,
			_ => return Err(Error::Protocol("error field must be a string or true".into())),
		};
		return Ok(Envelope::Server(ServerMessage::Err { id, error }));
	}

	let result = map_field(&entries, "result").map(|c| c.read().clone()).unwrap_or(Value::Null);
	Ok(Envelope::Server(ServerMessage::Ok { id, result }))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::adapter::in_memory::connection_pair;

	async fn transport_pair() -> (Arc<Transport>, mpsc::Receiver<ClientMessage>, Arc<Transport>, mpsc::Receiver<ClientMessage>) {
		let (a, b) = connection_pair();
		let (t_a, rx_a) = Transport::new(a, Arc::new(Codec::new()), Arc::new(PendingQueries::new()));
		let (t_b, rx_b) = Transport::new(b, Arc::new(Codec::new()), Arc::new(PendingQueries::new()));
		(t_a, rx_a, t_b, rx_b)
	}

	#[tokio::test]
	async fn simple_call_round_trips_through_envelopes() {
		let (client, _client_rx, server, mut server_rx) = transport_pair().await;

		client
			.send_client_message(&ClientMessage { id: 1, method: "add".into(), params: vec![Value::Int(123), Value::Int(456)] })
			.await
			.unwrap();

		let received = server_rx.recv().await.unwrap();
		assert_eq!(received.method, "add");
		assert_eq!(received.id, 1);

		server.send_server_message(&ServerMessage::Ok { id: 1, result: Value::Int(579) }).await.unwrap();

		// Give the client's read loop a chance to process the response.
		tokio::time::sleep(Duration::from_millis(20)).await;
		drop(server);
		let _ = client;
	}

	#[tokio::test]
	async fn ping_without_pong_times_out() {
		let (client, _rx_a, server, _rx_b) = transport_pair().await;
		drop(server);
		let alive = client.ping(Duration::from_millis(20)).await;
		assert!(!alive);
	}
}
