// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 duplex-rpc authors

//! A bidirectional RPC framework layered on a single long-lived,
//! auto-reconnecting full-duplex message socket.
//!
//! This crate is the transport and stream multiplexer described in the
//! design: request/response correlation, lazy-sequence ("stream")
//! multiplexing with backpressure and cancellation, a pluggable
//! reducer/reviver codec that preserves cyclic and shared references,
//! ping/pong liveness, an outbound request queue that absorbs
//! disconnections, and client-side reconnection with exponential backoff.
//!
//! The specific socket implementation, the HTTP upgrade handshake and
//! per-request authentication, the process-level serving loop, and the
//! user-facing proxy turning `router.method(args)` into a call are external
//! collaborators, specified only at their interface (see [`adapter`]).
//!
//! - [`transport`] — the stateful engine tying the codec and stream
//!   registry to a byte channel.
//! - [`client`] — the connection manager: reconnect, request queue,
//!   liveness pinger, `call`/`subscribe`.
//! - [`server`] — per-connection dispatch against a method table, plus
//!   liveness enforcement.
//! - [`codec`] / [`value`] — the wire format and the value graph it
//!   serializes, including the built-in lazy-stream tag.
//! - [`stream`] — the stream registry and chunk protocol.
//! - [`adapter`] — the pluggable socket boundary.

pub use client::{CallOutcome, Client, ClientConfig, ClientOptions, ConnectionHandle, SubscribeOptions};
pub use codec::{Codec, Transform};
pub use error::{Error, RemoteMethodError, Result, RpcClientError};
pub use server::{Channel, HandlerError, HandlerOutcome, MethodTable, Server, ServerConfig};
pub use stream::{lazy_sequence, CancelHandle, LazySequence, LazySequenceSender, StreamItem, StreamReceiver};
pub use value::{FromValue, Value};

pub mod adapter;
pub mod backoff;
pub mod client;
pub mod codec;
pub mod context;
pub mod error;
mod macros;
pub mod message;
pub mod pending;
pub mod server;
pub mod stream;
pub mod transport;
pub mod value;
