// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 duplex-rpc authors

//! The client connection manager (spec §4.4, §2 component 4): owns the
//! reconnect loop, the outbound request queue, the pending-query table, and
//! the periodic liveness pinger, on top of an [`Adapter`]-supplied socket.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, instrument, warn};

use crate::adapter::{Adapter, CloseInfo};
use crate::backoff::{with_backoff, BackoffConfig};
use crate::codec::{Codec, Transform};
use crate::context::{CancelWatch, ConnectionContext};
use crate::error::{Error, Result};
use crate::message::ClientMessage;
use crate::pending::PendingQueries;
use crate::server::{dispatch, ErrorSink, MethodTable};
use crate::stream::{CancelHandle, StreamReceiver};
use crate::transport::Transport;
use crate::value::Value;

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
	pub url: String,
	pub backoff: BackoffConfig,
	pub ping_interval_ms: u64,
	pub pong_timeout_ms: u64,
}

impl Default for ClientConfig {
	fn default() -> Self {
		ClientConfig { url: String::new(), backoff: BackoffConfig::default(), ping_interval_ms: 10_000, pong_timeout_ms: 1_000 }
	}
}

impl ClientConfig {
	pub fn ping_interval(&self) -> Duration {
		Duration::from_millis(self.ping_interval_ms)
	}

	pub fn pong_timeout(&self) -> Duration {
		Duration::from_millis(self.pong_timeout_ms)
	}
}

/// A handle to one successful attach (spec §3 `Connection`, §6
/// `onConnection`): `closed()` resolves once that particular socket
/// terminates, locally or remotely.
#[derive(Clone)]
pub struct ConnectionHandle {
	transport: Arc<Transport>,
}

impl ConnectionHandle {
	pub async fn closed(&self) {
		self.transport.closed().await;
	}

	pub async fn close(&self, info: CloseInfo) -> Result<()> {
		self.transport.close(info).await
	}
}

/// Everything that can't live in the serializable [`ClientConfig`]: the
/// socket provider, codec extensions, cancellation, and callbacks (spec §6
/// "Client configuration").
pub struct ClientOptions {
	pub config: ClientConfig,
	pub adapter: Arc<dyn Adapter>,
	pub transforms: Vec<Arc<dyn Transform>>,
	pub signal: CancelWatch,
	pub on_error: Option<ErrorSink>,
	pub on_connection: Option<Arc<dyn Fn(ConnectionHandle) + Send + Sync>>,
	/// Methods this client answers when its peer places a call back over
	/// the same duplex socket (spec §1 "both call direction and stream
	/// direction are multiplexed"). Empty by default — most clients only
	/// call out.
	pub methods: Arc<MethodTable>,
}

impl ClientOptions {
	pub fn new(url: impl Into<String>, adapter: Arc<dyn Adapter>) -> Self {
		ClientOptions {
			config: ClientConfig { url: url.into(), ..ClientConfig::default() },
			adapter,
			transforms: Vec::new(),
			signal: CancelWatch::never(),
			on_error: Some(crate::server::default_error_sink()),
			on_connection: None,
			methods: Arc::new(MethodTable::new()),
		}
	}
}

/// What a resolved call turned out to be: an ordinary value, or a lazy
/// sequence whose id the codec decoded inline (spec §2 "data flow for a
/// stream result").
pub enum CallOutcome {
	Value(Value),
	Stream(StreamReceiver),
}

/// Options for [`Client::subscribe`] (spec §4.4 "Subscription").
#[derive(Default)]
pub struct SubscribeOptions {
	pub signal: CancelWatch,
}

pub struct Client {
	config: ClientConfig,
	adapter: Arc<dyn Adapter>,
	codec: Arc<Codec>,
	pending: Arc<PendingQueries>,
	queue: parking_lot::Mutex<VecDeque<ClientMessage>>,
	current: parking_lot::RwLock<Option<Arc<Transport>>>,
	cancel: CancelHandle,
	on_error: Option<ErrorSink>,
	on_connection: Option<Arc<dyn Fn(ConnectionHandle) + Send + Sync>>,
	methods: Arc<MethodTable>,
	attach_notify: Notify,
}

impl Client {
	/// Starts the connect loop (spec §4.4) as a background task and
	/// returns the handle immediately; callers don't wait for the first
	/// attach before issuing `call`s — requests made before attach are
	/// queued.
	pub fn connect(options: ClientOptions) -> Arc<Client> {
		let mut codec = Codec::new();
		for transform in options.transforms {
			codec.register(transform);
		}

		let client = Arc::new(Client {
			config: options.config,
			adapter: options.adapter,
			codec: Arc::new(codec),
			pending: Arc::new(PendingQueries::new()),
			queue: parking_lot::Mutex::new(VecDeque::new()),
			current: parking_lot::RwLock::new(None),
			cancel: cancel_handle_from_watch(options.signal),
			on_error: options.on_error,
			on_connection: options.on_connection,
			methods: options.methods,
			attach_notify: Notify::new(),
		});

		let loop_client = client.clone();
		tokio::spawn(async move { loop_client.connect_loop().await });
		client
	}

	/// Aborts the connect loop, closes any attached socket with code
	/// 1000, and fails every queued/pending request (spec §5 "client-
	/// level abort").
	pub fn close(&self) {
		self.cancel.cancel("client closed");
		if let Some(transport) = self.current.read().clone() {
			let transport = transport.clone();
			tokio::spawn(async move {
				let _ = transport.close(CloseInfo::normal("client closed")).await;
			});
		}
		self.pending.reject_all(Some("client closed".into()));
	}

	fn watch(&self) -> CancelWatch {
		CancelWatch::from_handle(self.cancel.clone())
	}

	#[instrument(level = "debug", skip(self))]
	async fn connect_loop(self: Arc<Self>) {
		loop {
			if self.cancel.is_cancelled() {
				return;
			}

			let url = self.config.url.clone();
			let watch = self.watch();
			let adapter = self.adapter.clone();
			let attempt = with_backoff(&self.config.backoff, watch.clone(), move || {
				let adapter = adapter.clone();
				let url = url.clone();
				let watch = watch.clone();
				async move { adapter.connect(&url, watch).await }
			})
			.await;

			let connection = match attempt {
				Ok(connection) => connection,
				Err(err) => {
					self.report_error(err);
					return;
				}
			};

			let (transport, requests_rx) = Transport::new(connection, self.codec.clone(), self.pending.clone());
			*self.current.write() = Some(transport.clone());
			self.attach_notify.notify_waiters();
			self.flush_queue(&transport).await;

			let ping_transport = transport.clone();
			let ping_interval = self.config.ping_interval();
			let pong_timeout = self.config.pong_timeout();
			let ping_task = tokio::spawn(async move { ping_loop(ping_transport, ping_interval, pong_timeout).await });

			let dispatch_transport = transport.clone();
			let methods = self.methods.clone();
			let on_error = self.on_error.clone();
			let dispatch_task = tokio::spawn(async move {
				dispatch_inbound_requests(dispatch_transport, requests_rx, methods, on_error).await;
			});

			if let Some(on_connection) = &self.on_connection {
				on_connection(ConnectionHandle { transport: transport.clone() });
			}

			transport.closed().await;
			ping_task.abort();
			dispatch_task.abort();
			*self.current.write() = None;

			if self.cancel.is_cancelled() {
				return;
			}
			debug!("transport closed, reconnecting");
		}
	}

	fn report_error(&self, err: Error) {
		if let Some(sink) = &self.on_error {
			sink(err);
		} else {
			warn!(error = %err, "duplex-rpc client error");
		}
	}

	async fn flush_queue(&self, transport: &Arc<Transport>) {
		let queued: Vec<ClientMessage> = {
			let mut queue = self.queue.lock();
			queue.drain(..).collect()
		};
		for message in queued {
			if transport.send_client_message(&message).await.is_err() {
				break;
			}
		}
	}

	/// Sends `method(params)` and awaits its response (spec §4.4
	/// `call`). If no transport is currently attached, the request is
	/// queued and sent in order as soon as one attaches.
	pub async fn call(self: &Arc<Self>, method: impl Into<String>, params: Vec<Value>) -> Result<CallOutcome> {
		let (id, rx) = self.pending.allocate();
		let message = ClientMessage { id, method: method.into(), params };

		let transport = self.current.read().clone();
		match transport {
			Some(transport) => {
				if let Err(err) = transport.send_client_message(&message).await {
					self.pending.cancel(id);
					return Err(err);
				}
			}
			None => self.queue.lock().push_back(message),
		}

		let cell = rx.await.map_err(|_| Error::connection_closed())??;
		let value = cell.read().clone();
		if let Value::InboundStream(stream_id) = value {
			let transport = self.current.read().clone().ok_or_else(Error::connection_closed)?;
			let receiver = transport.streams().take_receiver(stream_id).ok_or_else(|| Error::Protocol(format!("stream {stream_id} already claimed")))?;
			Ok(CallOutcome::Stream(receiver))
		} else {
			Ok(CallOutcome::Value(value))
		}
	}

	/// Convenience over [`Client::call`] for calls known to resolve to a
	/// scalar/structured value rather than a stream.
	pub async fn call_value(self: &Arc<Self>, method: impl Into<String>, params: Vec<Value>) -> Result<Value> {
		match self.call(method, params).await? {
			CallOutcome::Value(value) => Ok(value),
			CallOutcome::Stream(_) => Err(Error::Protocol("expected a scalar result but got a stream".into())),
		}
	}

	/// Issues a streaming call, subscribes to it, and re-issues the same
	/// call automatically if the transport drops mid-stream (spec §4.4
	/// "Subscription", the one automatic re-issue in the design).
	/// Observer errors are reported through `on_error` rather than
	/// terminating the subscription.
	pub async fn subscribe<O>(
		self: &Arc<Self>,
		method: impl Into<String>,
		params: Vec<Value>,
		mut observer: O,
		options: SubscribeOptions,
	) -> Result<()>
	where
		O: FnMut(std::result::Result<crate::stream::StreamItem, String>),
	{
		let method = method.into();
		loop {
			let outcome = self.call(method.clone(), params.clone()).await?;
			let mut receiver = match outcome {
				CallOutcome::Stream(receiver) => receiver,
				CallOutcome::Value(value) => {
					observer(Ok(crate::stream::StreamItem::Value(value)));
					return Ok(());
				}
			};
			// The transport this stream id was minted on. If it's closed by
			// the time the inner loop exits, the stream ended because the
			// connection died mid-sequence, not because the producer sent
			// `done` — that's the signal to re-issue and resubscribe (spec
			// §4.4 "Subscription", scenario 6).
			let stream_transport = self.current.read().clone();

			loop {
				tokio::select! {
					_ = options.signal.cancelled() => {
						if let Some(transport) = self.current.read().clone() {
							let _ = transport.cancel_inbound(receiver.id(), Some("subscriber aborted".into())).await;
						}
						return Ok(());
					}
					item = receiver.next() => {
						match item {
							Some(item) => observer(item),
							None => break,
						}
					}
				}
			}

			let connection_died = stream_transport.as_ref().map(|t| t.is_closed()).unwrap_or(true);
			if !connection_died {
				return Ok(());
			}
			debug!(%method, "subscription's connection closed mid-stream, resubscribing");
		}
	}

	pub fn is_attached(&self) -> bool {
		self.current.read().is_some()
	}

	/// Waits for the next (or current) successful attach. Useful in
	/// tests that need a transport to exist before asserting on its
	/// state.
	pub async fn wait_attached(&self) {
		loop {
			if self.is_attached() {
				return;
			}
			let notified = self.attach_notify.notified();
			if self.is_attached() {
				return;
			}
			notified.await;
		}
	}

	pub fn pending_count(&self) -> usize {
		self.pending.len()
	}
}

/// Bridges an ambient [`CancelWatch`] (spec §6 `signal`) into the owned
/// [`CancelHandle`] the connect loop selects on, so a client-level abort
/// and the loop's own `close()` share one cancellation path.
fn cancel_handle_from_watch(signal: CancelWatch) -> CancelHandle {
	let handle = CancelHandle::new();
	if signal.is_cancelled() {
		handle.cancel("ambient signal already cancelled");
	} else {
		let handle_clone = handle.clone();
		tokio::spawn(async move {
			signal.cancelled().await;
			handle_clone.cancel("ambient signal cancelled");
		});
	}
	handle
}

/// Actively pings at a fixed interval (spec §4.4 step 2): if a pong doesn't
/// arrive within `pong_timeout`, the client unilaterally closes the socket
/// with code 1001 ("going away") rather than waiting for a read timeout.
async fn ping_loop(transport: Arc<Transport>, interval: Duration, pong_timeout: Duration) {
	let mut ticker = tokio::time::interval(interval);
	ticker.tick().await;
	loop {
		tokio::select! {
			_ = ticker.tick() => {}
			_ = transport.closed() => return,
		}
		if transport.is_closed() {
			return;
		}
		let alive = transport.ping(pong_timeout).await;
		if !alive {
			let _ = transport.close(CloseInfo::going_away("ping timeout")).await;
			return;
		}
	}
}

/// Drains requests the remote peer placed on this same socket and answers
/// them against the client's (usually empty) method table — the
/// bidirectional half of spec §1 "both call direction ... multiplexed over
/// one underlying socket".
async fn dispatch_inbound_requests(
	transport: Arc<Transport>,
	mut requests_rx: tokio::sync::mpsc::Receiver<ClientMessage>,
	methods: Arc<MethodTable>,
	on_error: Option<ErrorSink>,
) {
	let ctx = ConnectionContext::default();
	while let Some(message) = requests_rx.recv().await {
		let methods = methods.clone();
		let transport = transport.clone();
		let ctx = ctx.clone();
		let on_error = on_error.clone();
		tokio::spawn(async move {
			dispatch(&methods, &transport, message, ctx, on_error.as_ref()).await;
		});
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::adapter::in_memory::InMemoryAdapter;
	use crate::server::{HandlerError, Server, ServerConfig};

	fn test_server(methods: Arc<MethodTable>) -> Arc<Server> {
		Arc::new(Server::new(methods, ServerConfig::default()))
	}

	#[tokio::test]
	async fn simple_call_resolves_to_sum() {
		let table = MethodTable::new();
		table.register("add", |params: Vec<Value>| async move {
			let a = i64::from(params[0].clone().as_int().unwrap());
			let b = params[1].clone().as_int().unwrap();
			Ok::<_, HandlerError>(Value::Int(a + b))
		});
		let server = test_server(Arc::new(table));
		let adapter = Arc::new(InMemoryAdapter::new());

		let server_adapter = adapter.clone();
		tokio::spawn(async move {
			if let Some(conn) = server_adapter.accept().await {
				server.accept(conn);
			}
		});

		let client = Client::connect(ClientOptions::new("mem://test", adapter));
		let result = client.call_value("add", vec![Value::Int(123), Value::Int(456)]).await.unwrap();
		assert_eq!(result.as_int(), Some(579));
	}

	#[tokio::test]
	async fn null_and_void_results_do_not_hang() {
		let table = MethodTable::new();
		table.register("nullReturn", |_p: Vec<Value>| async move { Ok::<_, HandlerError>(Value::Null) });
		table.register("voidReturn", |_p: Vec<Value>| async move { Ok::<_, HandlerError>(Value::Unit) });
		let server = test_server(Arc::new(table));
		let adapter = Arc::new(InMemoryAdapter::new());
		let server_adapter = adapter.clone();
		tokio::spawn(async move {
			if let Some(conn) = server_adapter.accept().await {
				server.accept(conn);
			}
		});

		let client = Client::connect(ClientOptions::new("mem://test", adapter));
		assert!(matches!(client.call_value("nullReturn", vec![]).await.unwrap(), Value::Null));
		assert!(matches!(client.call_value("voidReturn", vec![]).await.unwrap(), Value::Unit));
	}

	/// Wraps an [`InMemoryAdapter`] but parks `connect` on a [`Notify`]
	/// until the test releases it, so calls issued beforehand are
	/// observably queued rather than racing the real attach.
	struct GatedAdapter {
		inner: Arc<InMemoryAdapter>,
		gate: Arc<Notify>,
	}

	#[async_trait::async_trait]
	impl Adapter for GatedAdapter {
		async fn connect(&self, url: &str, signal: CancelWatch) -> Result<Box<dyn crate::adapter::Connection>> {
			self.gate.notified().await;
			self.inner.connect(url, signal).await
		}
	}

	#[tokio::test]
	async fn requests_made_before_attach_are_flushed_in_order() {
		let table = MethodTable::new();
		let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
		let order_for_handler = order.clone();
		table.register("mark", move |params: Vec<Value>| {
			let order = order_for_handler.clone();
			async move {
				order.lock().push(params[0].clone().as_int().unwrap());
				Ok::<_, HandlerError>(Value::Unit)
			}
		});
		let server = test_server(Arc::new(table));
		let inner = Arc::new(InMemoryAdapter::new());
		let gate = Arc::new(Notify::new());
		let adapter = Arc::new(GatedAdapter { inner: inner.clone(), gate: gate.clone() });

		let client = Client::connect(ClientOptions::new("mem://test", adapter));
		// Queue calls while `connect` is still parked on the gate.
		let c1 = client.clone();
		let c2 = client.clone();
		let c3 = client.clone();
		let fut1 = tokio::spawn(async move { c1.call_value("mark", vec![Value::Int(1)]).await });
		let fut2 = tokio::spawn(async move { c2.call_value("mark", vec![Value::Int(2)]).await });
		let fut3 = tokio::spawn(async move { c3.call_value("mark", vec![Value::Int(3)]).await });
		// Give the three calls a chance to observe no attached transport
		// and queue themselves before the gate opens.
		tokio::task::yield_now().await;
		tokio::task::yield_now().await;

		let server_inner = inner.clone();
		tokio::spawn(async move {
			if let Some(conn) = server_inner.accept().await {
				server.accept(conn);
			}
		});
		gate.notify_one();

		fut1.await.unwrap().unwrap();
		fut2.await.unwrap().unwrap();
		fut3.await.unwrap().unwrap();
		assert_eq!(*order.lock(), vec![1, 2, 3]);
	}
}
