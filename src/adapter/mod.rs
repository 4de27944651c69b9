// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 duplex-rpc authors

//! The socket adapter boundary (spec §6 "Adapter contract"): the only thing
//! the transport needs from a concrete byte-oriented full-duplex channel.
//!
//! The specific socket implementation, the HTTP upgrade handshake, and
//! per-request authentication are all external collaborators (spec §1) kept
//! out of the core; this module only defines the seam they plug into.

use async_trait::async_trait;

use crate::context::CancelWatch;
use crate::error::Result;
use crate::message::RawFrame;

pub mod in_memory;
#[cfg(feature = "tungstenite")]
pub mod tungstenite;

/// Why a connection ended, mirroring the close codes in spec §6.
#[derive(Debug, Clone)]
pub struct CloseInfo {
	pub code: u16,
	pub reason: String,
}

impl CloseInfo {
	pub const NORMAL: u16 = 1000;
	pub const GOING_AWAY: u16 = 1001;

	pub fn normal(reason: impl Into<String>) -> Self {
		CloseInfo { code: Self::NORMAL, reason: reason.into() }
	}

	pub fn going_away(reason: impl Into<String>) -> Self {
		CloseInfo { code: Self::GOING_AWAY, reason: reason.into() }
	}
}

/// One established full-duplex connection. `recv` is pull-based rather than
/// the push-based `onMessage` callback the spec describes — the idiomatic
/// Rust shape for something tokio already streams — but the contract is the
/// same: frames are delivered in order, and `recv` returning `None` is the
/// one-time `onClose` signal (see DESIGN.md).
#[async_trait]
pub trait Connection: Send + Sync {
	async fn send(&self, frame: RawFrame) -> Result<()>;
	async fn recv(&self) -> Option<RawFrame>;
	async fn close(&self, info: CloseInfo) -> Result<()>;
}

/// A pluggable socket provider. `connect` honors `signal` both before and
/// during the handshake (spec §6).
#[async_trait]
pub trait Adapter: Send + Sync {
	async fn connect(&self, url: &str, signal: CancelWatch) -> Result<Box<dyn Connection>>;
}
