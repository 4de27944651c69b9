// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 duplex-rpc authors

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::{Error, Result};
use crate::stream::{LazySequence, StreamId};

/// A lazy sequence awaiting a single consumption: taken once by the
/// flatten pass that reduces it to a `Tagged` `LazyStream` node.
pub type PendingStream = Arc<Mutex<Option<LazySequence>>>;

/// A single node in a value graph. Composite variants hold [`Cell`]s rather
/// than nested `Value`s directly, so that two branches of the graph can
/// share the same node (`Arc::clone`) and a node can be mutated in place
/// after construction to point back at one of its own ancestors, producing a
/// genuine cycle. This is the "cyclic and shared reference" requirement of
/// spec §4.1 without reaching for an arena/index crate: identity is just
/// `Arc` pointer identity.
#[derive(Debug, Clone)]
pub enum Value {
	Null,
	/// The absence value returned for handlers with no meaningful result
	/// (spec §8 scenario 2, "void return").
	Unit,
	Bool(bool),
	Int(i64),
	Float(f64),
	Str(String),
	Bytes(Vec<u8>),
	Array(Vec<Cell>),
	Map(Vec<(String, Cell)>),
	/// A value produced or consumed by a registered reducer/reviver,
	/// keyed by tag. Before encoding, a `LazyStream` value is represented
	/// this way with tag `"LazyStream"` and an `Int` payload holding the
	/// stream id (see [`crate::codec`]).
	Tagged { tag: String, payload: Cell },
	/// A lazy sequence awaiting serialization. The codec's built-in
	/// `LazyStream` reducer rewrites this to a `Tagged` node before the
	/// graph is flattened; it is never observed on the wire.
	Stream(PendingStream),
	/// The decoded form of a `LazyStream` tag: the consumer handle lives
	/// in the transport's stream registry under this id, fetched once via
	/// `Transport::take_stream`.
	InboundStream(StreamId),
}

/// A shared, mutable handle to a [`Value`] node.
pub type Cell = Arc<RwLock<Value>>;

impl Value {
	pub fn cell(self) -> Cell {
		Arc::new(RwLock::new(self))
	}

	/// Allocates an empty placeholder cell (initialized to `Null`) that
	/// callers can mutate after building the rest of the graph, in order
	/// to wire up a cycle through it.
	pub fn placeholder() -> Cell {
		Arc::new(RwLock::new(Value::Null))
	}

	pub fn array(items: impl IntoIterator<Item = Value>) -> Value {
		Value::Array(items.into_iter().map(Value::cell).collect())
	}

	pub fn map(entries: impl IntoIterator<Item = (String, Value)>) -> Value {
		Value::Map(entries.into_iter().map(|(k, v)| (k, v.cell())).collect())
	}

	/// Wraps a lazy sequence as a value suitable for returning as (or
	/// nesting inside) an RPC result.
	pub fn stream(sequence: LazySequence) -> Value {
		Value::Stream(Arc::new(Mutex::new(Some(sequence))))
	}

	pub fn as_str(&self) -> Option<&str> {
		match self {
			Value::Str(s) => Some(s),
			_ => None,
		}
	}

	pub fn as_int(&self) -> Option<i64> {
		match self {
			Value::Int(i) => Some(*i),
			_ => None,
		}
	}
}

impl From<bool> for Value {
	fn from(v: bool) -> Self {
		Value::Bool(v)
	}
}

impl From<i64> for Value {
	fn from(v: i64) -> Self {
		Value::Int(v)
	}
}

impl From<f64> for Value {
	fn from(v: f64) -> Self {
		Value::Float(v)
	}
}

impl From<String> for Value {
	fn from(v: String) -> Self {
		Value::Str(v)
	}
}

impl From<&str> for Value {
	fn from(v: &str) -> Self {
		Value::Str(v.to_string())
	}
}

impl From<Vec<u8>> for Value {
	fn from(v: Vec<u8>) -> Self {
		Value::Bytes(v)
	}
}

/// Decodes a scalar call result into a concrete Rust type (SPEC_FULL §B,
/// "client stub generation" building block). This is the typed half of a
/// generated stub: `Client::call` hands back a [`Value`], and a stub method
/// narrows it to its declared return type with this trait instead of
/// threading a full serde round-trip through the wire codec.
pub trait FromValue: Sized {
	fn from_value(value: Value) -> Result<Self>;
}

impl FromValue for Value {
	fn from_value(value: Value) -> Result<Self> {
		Ok(value)
	}
}

impl FromValue for () {
	fn from_value(_value: Value) -> Result<Self> {
		Ok(())
	}
}

impl FromValue for bool {
	fn from_value(value: Value) -> Result<Self> {
		match value {
			Value::Bool(b) => Ok(b),
			other => Err(Error::Protocol(format!("expected bool, got {other:?}"))),
		}
	}
}

impl FromValue for i64 {
	fn from_value(value: Value) -> Result<Self> {
		value.as_int().ok_or_else(|| Error::Protocol(format!("expected int, got {value:?}")))
	}
}

impl FromValue for f64 {
	fn from_value(value: Value) -> Result<Self> {
		match value {
			Value::Float(f) => Ok(f),
			Value::Int(i) => Ok(i as f64),
			other => Err(Error::Protocol(format!("expected float, got {other:?}"))),
		}
	}
}

impl FromValue for String {
	fn from_value(value: Value) -> Result<Self> {
		match value {
			Value::Str(s) => Ok(s),
			other => Err(Error::Protocol(format!("expected string, got {other:?}"))),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn cyclic_array_points_to_itself() {
		let cell = Value::placeholder();
		*cell.write() = Value::Array(vec![cell.clone()]);

		match &*cell.read() {
			Value::Array(items) => assert!(Arc::ptr_eq(&items[0], &cell)),
			_ => panic!("expected array"),
		}
	}

	#[test]
	fn shared_subtree_is_the_same_cell() {
		let shared = Value::from("shared").cell();
		let root = Value::array([]);
		let root = root.cell();
		*root.write() = Value::Array(vec![shared.clone(), shared.clone()]);

		match &*root.read() {
			Value::Array(items) => assert!(Arc::ptr_eq(&items[0], &items[1])),
			_ => panic!("expected array"),
		}
	}
}
