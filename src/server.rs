// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 duplex-rpc authors

//! The server-side connection handler (spec §4.6, §2 component 5): per
//! accepted socket, creates a transport, dispatches incoming requests
//! against a method table, writes results back, and enforces liveness
//! timeouts.
//!
//! The handler registry / middleware stack and the process-level serving
//! loop (listening on a port, accepting upgrade requests) are external
//! collaborators kept out of scope (spec §1); this module starts from an
//! already-accepted [`Connection`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{error, instrument, warn};

use crate::adapter::{CloseInfo, Connection};
use crate::codec::{Codec, Transform};
use crate::context::{with_connection_context, ConnectionContext};
use crate::error::{Error, RemoteMethodError, Result, RpcClientError};
use crate::message::{ClientMessage, ServerMessage};
use crate::pending::PendingQueries;
use crate::stream::LazySequence;
use crate::transport::Transport;
use crate::value::Value;

/// What a dispatched handler produced: a scalar/structured result, or a
/// lazy sequence the codec will replace with a stream id on the wire (spec
/// §2 "data flow for a stream result").
pub enum HandlerOutcome {
	Value(Value),
	Stream(LazySequence),
}

impl From<Value> for HandlerOutcome {
	fn from(value: Value) -> Self {
		HandlerOutcome::Value(value)
	}
}

impl From<LazySequence> for HandlerOutcome {
	fn from(sequence: LazySequence) -> Self {
		HandlerOutcome::Stream(sequence)
	}
}

/// An error a dispatched handler can raise. `Client` is the designated
/// "safe to surface verbatim" kind (spec §4.6 step 4, `RPCClientError`);
/// anything else is logged locally and the caller only ever sees
/// [`RemoteMethodError::Opaque`] (spec §4.6 step 5).
#[derive(Debug)]
pub enum HandlerError {
	Client(RpcClientError),
	Internal(String),
}

impl HandlerError {
	pub fn client(message: impl Into<String>) -> Self {
		HandlerError::Client(RpcClientError::new(message))
	}

	pub fn internal(error: impl std::fmt::Display) -> Self {
		HandlerError::Internal(error.to_string())
	}
}

impl From<RpcClientError> for HandlerError {
	fn from(error: RpcClientError) -> Self {
		HandlerError::Client(error)
	}
}

pub type HandlerResult = std::result::Result<HandlerOutcome, HandlerError>;
type HandlerFuture = BoxFuture<'static, HandlerResult>;
type HandlerFn = Arc<dyn Fn(Vec<Value>) -> HandlerFuture + Send + Sync>;

/// A sink for errors the framework recovers from locally but still wants
/// reported somewhere (spec §6 `onError`, default: log to stderr via
/// `tracing`).
pub type ErrorSink = Arc<dyn Fn(Error) + Send + Sync>;

pub fn default_error_sink() -> ErrorSink {
	Arc::new(|err| warn!(error = %err, "unhandled duplex-rpc error"))
}

/// Name -> handler map, shared by every connection a [`Server`] accepts
/// (spec §4.6 "method table").
#[derive(Default)]
pub struct MethodTable {
	handlers: DashMap<String, HandlerFn>,
}

impl MethodTable {
	pub fn new() -> Self {
		MethodTable { handlers: DashMap::new() }
	}

	/// Registers a handler. The closure reads per-connection state, if
	/// any, via [`crate::context::current`] inside the task-local scope
	/// [`dispatch`] establishes — handlers are not threaded with an
	/// explicit context parameter (spec §9).
	pub fn register<F, Fut, O>(&self, method: impl Into<String>, handler: F)
	where
		F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = std::result::Result<O, HandlerError>> + Send + 'static,
		O: Into<HandlerOutcome>,
	{
		let boxed: HandlerFn = Arc::new(move |params| {
			let fut = handler(params);
			Box::pin(async move { fut.await.map(Into::into) })
		});
		self.handlers.insert(method.into(), boxed);
	}

	fn get(&self, method: &str) -> Option<HandlerFn> {
		self.handlers.get(method).map(|entry| entry.clone())
	}
}

/// A server-side helper producing one lazy sequence per subscriber with a
/// shared push broadcast (spec GLOSSARY "Channel", scenario 4 "channel
/// fan-out"). `onSubscribe`-style setup is left to the caller: construct a
/// `Channel`, call [`Channel::subscribe`] from inside a handler to mint a
/// new subscriber sequence, and drive it (e.g. from a spawned timer task)
/// with [`Channel::push`].
#[derive(Clone, Default)]
pub struct Channel {
	subscribers: Arc<parking_lot::Mutex<Vec<crate::stream::LazySequenceSender>>>,
}

impl Channel {
	pub fn new() -> Self {
		Channel::default()
	}

	pub fn subscriber_count(&self) -> usize {
		self.subscribers.lock().len()
	}

	/// Mints a new subscriber: returns the `LazySequence` to hand back
	/// as a handler's result, and keeps the sender side registered for
	/// future [`Channel::push`] calls.
	pub fn subscribe(&self, capacity: usize) -> LazySequence {
		let (sender, sequence) = crate::stream::lazy_sequence(capacity);
		self.subscribers.lock().push(sender);
		sequence
	}

	/// Broadcasts `value` to every live subscriber, dropping any whose
	/// receiver has gone away.
	pub async fn push(&self, value: Value) {
		let senders: Vec<_> = self.subscribers.lock().clone();
		let mut dead = Vec::new();
		for (idx, sender) in senders.iter().enumerate() {
			if !sender.push(value.clone()).await {
				dead.push(idx);
			}
		}
		if !dead.is_empty() {
			let mut guard = self.subscribers.lock();
			for idx in dead.into_iter().rev() {
				if idx < guard.len() {
					guard.remove(idx);
				}
			}
		}
	}

	/// Ends every subscriber's sequence normally by failing nothing and
	/// simply dropping the senders (a dropped sender makes `.next()`
	/// observe `None`, the normal-end signal, spec §4.3 step 4).
	pub fn close(&self) {
		self.subscribers.lock().clear();
	}

	/// Like [`Channel::subscribe`], but pushes `initial` to the new
	/// subscriber alone before it's added to the broadcast list — the shape
	/// an `onSubscribe(a, b)` callback needs (spec §8 scenario 4): its
	/// return value is this one subscriber's first item, not a value every
	/// other subscriber also sees.
	pub async fn subscribe_seeded(&self, capacity: usize, initial: Value) -> LazySequence {
		let (sender, sequence) = crate::stream::lazy_sequence(capacity);
		sender.push(initial).await;
		self.subscribers.lock().push(sender);
		sequence
	}
}

/// Dispatches one incoming [`ClientMessage`] against `table`, replying on
/// `transport` (spec §4.6 "Dispatch"). Exposed standalone (rather than only
/// as a private [`Server`] method) because a [`crate::client::Client`] may
/// also want to answer calls placed by its peer over the same duplex
/// socket.
#[instrument(level = "debug", skip(table, transport, ctx, on_error, message), fields(method = %message.method, id = message.id))]
pub async fn dispatch(table: &MethodTable, transport: &Arc<Transport>, message: ClientMessage, ctx: ConnectionContext, on_error: Option<&ErrorSink>) {
	let ClientMessage { id, method, params } = message;

	let handler = match table.get(&method) {
		Some(handler) => handler,
		None => {
			let response = ServerMessage::Err { id, error: RemoteMethodError::Message(format!("Unknown method: {method}")) };
			let _ = transport.send_server_message(&response).await;
			return;
		}
	};

	let outcome = with_connection_context(ctx, move || handler(params)).await;
	let response = match outcome {
		Ok(HandlerOutcome::Value(value)) => ServerMessage::Ok { id, result: value },
		Ok(HandlerOutcome::Stream(sequence)) => ServerMessage::Ok { id, result: Value::stream(sequence) },
		Err(HandlerError::Client(err)) => ServerMessage::Err { id, error: RemoteMethodError::Message(err.0) },
		Err(HandlerError::Internal(message)) => {
			error!(error = %message, method = %method, id, "handler failed");
			if let Some(sink) = on_error {
				sink(Error::Handler(message));
			}
			ServerMessage::Err { id, error: RemoteMethodError::Opaque }
		}
	};
	let _ = transport.send_server_message(&response).await;
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
	pub ping_timeout_ms: u64,
	pub pong_timeout_ms: u64,
}

impl Default for ServerConfig {
	fn default() -> Self {
		ServerConfig { ping_timeout_ms: 60_000, pong_timeout_ms: 1_000 }
	}
}

impl ServerConfig {
	pub fn ping_timeout(&self) -> Duration {
		Duration::from_millis(self.ping_timeout_ms)
	}

	pub fn pong_timeout(&self) -> Duration {
		Duration::from_millis(self.pong_timeout_ms)
	}
}

/// Per-accepted-socket connection handler (spec §2 component 5). One
/// `Server` owns a method table and codec transforms shared across every
/// connection it accepts; each [`Server::accept`] call spins up a fresh
/// [`Transport`], dispatch loop, and liveness monitor for that one socket.
pub struct Server {
	methods: Arc<MethodTable>,
	codec: Arc<Codec>,
	config: ServerConfig,
	on_error: Option<ErrorSink>,
}

impl Server {
	pub fn new(methods: Arc<MethodTable>, config: ServerConfig) -> Self {
		Server { methods, codec: Arc::new(Codec::new()), config, on_error: Some(default_error_sink()) }
	}

	pub fn with_transforms(mut self, transforms: impl IntoIterator<Item = Arc<dyn Transform>>) -> Self {
		let mut codec = Codec::new();
		for transform in transforms {
			codec.register(transform);
		}
		self.codec = Arc::new(codec);
		self
	}

	pub fn with_error_sink(mut self, sink: ErrorSink) -> Self {
		self.on_error = Some(sink);
		self
	}

	/// Wraps a freshly accepted connection: spawns the transport's read
	/// loop, a dispatch task draining incoming requests, and a liveness
	/// monitor (spec §4.6 "Liveness"). Returns the transport handle so
	/// the caller can observe `closed()` or force a `close()`.
	pub fn accept(self: &Arc<Self>, connection: Box<dyn Connection>) -> Arc<Transport> {
		let pending = Arc::new(PendingQueries::new());
		let (transport, requests_rx) = Transport::new(connection, self.codec.clone(), pending);
		let ctx = ConnectionContext::default();

		let server = self.clone();
		let dispatch_transport = transport.clone();
		tokio::spawn(async move { server.dispatch_loop(dispatch_transport, requests_rx, ctx).await });

		let liveness_transport = transport.clone();
		let ping_timeout = self.config.ping_timeout();
		let pong_timeout = self.config.pong_timeout();
		tokio::spawn(async move { liveness_loop(liveness_transport, ping_timeout, pong_timeout).await });

		transport
	}

	async fn dispatch_loop(self: Arc<Self>, transport: Arc<Transport>, mut requests_rx: tokio::sync::mpsc::Receiver<ClientMessage>, ctx: ConnectionContext) {
		while let Some(message) = requests_rx.recv().await {
			let methods = self.methods.clone();
			let transport = transport.clone();
			let ctx = ctx.clone();
			let on_error = self.on_error.clone();
			tokio::spawn(async move {
				dispatch(&methods, &transport, message, ctx, on_error.as_ref()).await;
			});
		}
	}
}

/// Mirror of the client's active pinger (spec §4.6): wakes shortly before
/// `ping_timeout` would otherwise elapse since the last inbound message. If
/// traffic arrived in the meantime, reschedules; otherwise actively probes
/// and closes the socket if no reply lands within `pong_timeout`.
pub async fn liveness_loop(transport: Arc<Transport>, ping_timeout: Duration, pong_timeout: Duration) {
	loop {
		if transport.is_closed() {
			return;
		}
		let elapsed = transport.time_since_last_message();
		if elapsed < ping_timeout {
			let remaining = ping_timeout - elapsed;
			tokio::select! {
				_ = tokio::time::sleep(remaining) => {}
				_ = transport.closed() => return,
			}
			continue;
		}

		let alive = transport.ping(pong_timeout).await;
		if !alive {
			let _ = transport.close(CloseInfo::normal("liveness timeout")).await;
			return;
		}
	}
}
