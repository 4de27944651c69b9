// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 duplex-rpc authors

use std::fmt;

use thiserror::Error;

/// Errors produced by the transport, client connection manager, and server
/// connection handler.
///
/// Variants map directly onto the error kinds enumerated for the wire
/// protocol: a malformed frame or a broken stream invariant is always
/// [`Error::Protocol`] and is fatal to the transport that raised it, while
/// [`Error::ConnectionClosed`] is the sentinel pending queries and
/// subscriptions observe when their transport dies.
#[derive(Debug, Error)]
pub enum Error {
	/// The wire-level invariants in the stream/control protocol were
	/// violated (unknown stream id, unexpected raw frame, malformed
	/// frame, unrecognized reducer/reviver tag). Fatal to the transport.
	#[error("protocol error: {0}")]
	Protocol(String),

	/// An ambient cancellation context was fired while the operation was
	/// suspended. Not surfaced as a user-facing failure by callers that
	/// requested the cancellation themselves.
	#[error("operation cancelled")]
	Cancelled,

	/// The transport this pending query or subscription belonged to has
	/// closed. Subscriptions use this as the automatic-resubscribe signal.
	#[error("connection closed{}", reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
	ConnectionClosed { reason: Option<String> },

	/// The remote side responded with an application-level error.
	/// `RemoteMethod::Message` carries a caller-safe string (an
	/// `RPCClientError` on the server side); `RemoteMethod::Opaque` is the
	/// server's generic "request failed" for causes it chose not to leak.
	#[error("remote method error: {0}")]
	RemoteMethod(RemoteMethodError),

	/// The request named a method the server has no handler for.
	#[error("unknown method: {0}")]
	UnknownMethod(String),

	/// The underlying socket adapter failed (connect, send, or close).
	#[error("adapter error: {0}")]
	Adapter(String),

	/// A stream producer failed while generating chunks. Surfaced to the
	/// remote as a `stream:"error"` frame; does not close the transport.
	#[error("stream producer error: {0}")]
	StreamProducer(String),

	/// A dispatched handler returned an error that is not an
	/// [`RpcClientError`]. Reported to the server's `onError` sink; the
	/// caller only ever sees [`RemoteMethodError::Opaque`].
	#[error("handler error: {0}")]
	Handler(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteMethodError {
	/// A caller-safe message string, surfaced verbatim.
	Message(String),
	/// A generic failure whose cause the server declined to leak.
	Opaque,
}

impl fmt::Display for RemoteMethodError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			RemoteMethodError::Message(msg) => f.write_str(msg),
			RemoteMethodError::Opaque => f.write_str("request failed"),
		}
	}
}

impl Error {
	pub fn connection_closed() -> Self {
		Error::ConnectionClosed { reason: None }
	}

	pub fn connection_closed_with(reason: impl Into<String>) -> Self {
		Error::ConnectionClosed { reason: Some(reason.into()) }
	}

	/// True if this is the [`Error::ConnectionClosed`] sentinel, regardless
	/// of the attached reason. Subscription resubscription logic keys off
	/// this rather than a full pattern match.
	pub fn is_connection_closed(&self) -> bool {
		matches!(self, Error::ConnectionClosed { .. })
	}

	pub fn is_cancelled(&self) -> bool {
		matches!(self, Error::Cancelled)
	}
}

/// A designated error type handler implementations use to signal a message
/// that is safe to surface to the remote caller verbatim (spec §4.6,
/// §GLOSSARY `RPCClientError`). Any other handler error is logged locally
/// and surfaced to the caller as [`RemoteMethodError::Opaque`].
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct RpcClientError(pub String);

impl RpcClientError {
	pub fn new(message: impl Into<String>) -> Self {
		RpcClientError(message.into())
	}
}

pub type Result<T> = std::result::Result<T, Error>;
