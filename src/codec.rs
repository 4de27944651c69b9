// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 duplex-rpc authors

//! Converts between a [`Value`] graph and the JSON frame on the wire (spec
//! §4.1).
//!
//! The built-in `LazyStream` tag is handled directly by [`Codec`] since it
//! needs to reach into a transport's [`StreamRegistry`] (allocating an
//! outbound id, or parking a freshly decoded inbound receiver). User-
//! declared tags are plain data transforms registered as [`Transform`]s and
//! never touch the registry.
//!
//! Cyclic and shared references are preserved with a two-pass indexed
//! encoding: every unique [`Cell`] (by pointer identity) gets a slot index
//! the first time it is visited, *before* its children are visited, so a
//! self-referencing node can still be its own child. Decoding allocates a
//! parallel vector of cells up front, fills leaves first, and composite
//! slots afterwards, so that a later slot's back-reference to an earlier one
//! resolves without needing to guess a fill order.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value as Json;

use crate::error::{Error, Result};
use crate::stream::{StreamId, StreamRegistry};
use crate::value::{Cell, Value};

pub const LAZY_STREAM_TAG: &str = "LazyStream";

/// A user-declared reducer/reviver pair for one tag (spec §4.1, §6
/// `transforms`).
pub trait Transform: Send + Sync {
	fn tag(&self) -> &str;
	/// Value -> portable payload, applied to the `Tagged` node's payload
	/// before it is flattened.
	fn reduce(&self, payload: &Value) -> Value;
	/// Portable payload -> value, applied to the decoded payload before
	/// the `Tagged` node is handed back to the caller.
	fn revive(&self, payload: Value) -> Value;
}

/// An identity transform: useful as a no-op registration in tests verifying
/// that composing one doesn't change round-trip behavior (spec §8).
pub struct IdentityTransform(pub String);

impl Transform for IdentityTransform {
	fn tag(&self) -> &str {
		&self.0
	}
	fn reduce(&self, payload: &Value) -> Value {
		payload.clone()
	}
	fn revive(&self, payload: Value) -> Value {
		payload
	}
}

#[derive(Default)]
pub struct Codec {
	transforms: HashMap<String, Arc<dyn Transform>>,
}

/// Output of flattening a value graph: the JSON frame contents (root index
/// first, then one element per slot) plus any lazy sequences that were
/// reduced to stream ids and now need their producer task started.
pub struct Flattened {
	pub frame: Vec<Json>,
	pub pending_producers: Vec<(StreamId, crate::stream::LazySequence, crate::stream::CancelHandle)>,
}

impl Codec {
	pub fn new() -> Self {
		Codec { transforms: HashMap::new() }
	}

	pub fn register(&mut self, transform: Arc<dyn Transform>) {
		self.transforms.insert(transform.tag().to_string(), transform);
	}

	pub fn flatten(&self, root: &Cell, streams: &StreamRegistry) -> Result<Flattened> {
		let mut seen: HashMap<usize, u32> = HashMap::new();
		let mut slots: Vec<Json> = Vec::new();
		let mut pending_producers = Vec::new();
		let root_idx = self.visit(root, &mut seen, &mut slots, streams, &mut pending_producers)?;
		let mut frame = Vec::with_capacity(slots.len() + 1);
		frame.push(Json::from(root_idx));
		frame.extend(slots);
		Ok(Flattened { frame, pending_producers })
	}

	fn visit(
		&self,
		cell: &Cell,
		seen: &mut HashMap<usize, u32>,
		slots: &mut Vec<Json>,
		streams: &StreamRegistry,
		pending_producers: &mut Vec<(StreamId, crate::stream::LazySequence, crate::stream::CancelHandle)>,
	) -> Result<u32> {
		let key = Arc::as_ptr(cell) as *const () as usize;
		if let Some(&id) = seen.get(&key) {
			return Ok(id);
		}
		let id = slots.len() as u32;
		slots.push(Json::Null);
		seen.insert(key, id);

		let encoded = self.encode_node(cell, seen, slots, streams, pending_producers)?;
		slots[id as usize] = encoded;
		Ok(id)
	}

	fn encode_node(
		&self,
		cell: &Cell,
		seen: &mut HashMap<usize, u32>,
		slots: &mut Vec<Json>,
		streams: &StreamRegistry,
		pending_producers: &mut Vec<(StreamId, crate::stream::LazySequence, crate::stream::CancelHandle)>,
	) -> Result<Json> {
		// Values that allocate a stream id need the registry mutated
		// before we can emit anything, so that case is handled outside
		// the big match below.
		let is_stream = matches!(&*cell.read(), Value::Stream(_));
		if is_stream {
			let pending = match &*cell.read() {
				Value::Stream(pending) => pending.clone(),
				_ => unreachable!(),
			};
			let sequence = pending
				.lock()
				.take()
				.ok_or_else(|| Error::Protocol("lazy sequence already consumed".into()))?;
			let (stream_id, cancel) = streams.register_outbound();
			pending_producers.push((stream_id, sequence, cancel));
			let payload_idx = {
				let leaf = Value::Int(stream_id as i64).cell();
				self.visit(&leaf, seen, slots, streams, pending_producers)?
			};
			return Ok(tagged_json(LAZY_STREAM_TAG, payload_idx));
		}

		let value = cell.read().clone();
		match value {
			Value::Null => Ok(Json::Null),
			Value::Unit => Ok(serde_json::json!({ "u": true })),
			Value::Bool(b) => Ok(Json::Bool(b)),
			Value::Int(i) => Ok(Json::from(i)),
			Value::Float(f) => Ok(serde_json::json!(f)),
			Value::Str(s) => Ok(Json::String(s)),
			Value::Bytes(bytes) => Ok(serde_json::json!({ "b": bytes })),
			Value::Array(items) => {
				let mut indices = Vec::with_capacity(items.len());
				for item in &items {
					indices.push(self.visit(item, seen, slots, streams, pending_producers)?);
				}
				Ok(serde_json::json!({ "a": indices }))
			}
			Value::Map(entries) => {
				let mut pairs = Vec::with_capacity(entries.len());
				for (key, value) in &entries {
					let idx = self.visit(value, seen, slots, streams, pending_producers)?;
					pairs.push(serde_json::json!([key, idx]));
				}
				Ok(serde_json::json!({ "m": pairs }))
			}
			Value::Tagged { tag, payload } => {
				let payload = match self.transforms.get(&tag) {
					Some(transform) => transform.reduce(&payload.read().clone()).cell(),
					None => payload,
				};
				let idx = self.visit(&payload, seen, slots, streams, pending_producers)?;
				Ok(tagged_json(&tag, idx))
			}
			Value::Stream(_) => unreachable!("handled above"),
			Value::InboundStream(id) => Ok(tagged_json(LAZY_STREAM_TAG, {
				let leaf = Value::Int(id as i64).cell();
				self.visit(&leaf, seen, slots, streams, pending_producers)?
			})),
		}
	}

	/// Decodes a flattened JSON frame back into a value graph. `frame[0]`
	/// is the root slot index; `frame[1..]` are the slots.
	pub fn unflatten(&self, frame: &[Json], streams: &StreamRegistry) -> Result<Cell> {
		let root_idx = frame
			.first()
			.and_then(|v| v.as_u64())
			.ok_or_else(|| Error::Protocol("missing root index in flattened frame".into()))?
			as usize;
		let slots = &frame[1..];
		let mut cells: Vec<Option<Cell>> = vec![None; slots.len()];
		self.decode_slot(root_idx, slots, &mut cells, streams)
	}

	fn decode_slot(
		&self,
		idx: usize,
		slots: &[Json],
		cells: &mut Vec<Option<Cell>>,
		streams: &StreamRegistry,
	) -> Result<Cell> {
		if let Some(Some(cell)) = cells.get(idx) {
			return Ok(cell.clone());
		}
		let raw = slots
			.get(idx)
			.ok_or_else(|| Error::Protocol(format!("slot index {idx} out of range")))?;

		// Reserve the slot with a placeholder before recursing so a
		// cyclic reference to `idx` resolves to the same cell.
		let placeholder = Value::placeholder();
		cells[idx] = Some(placeholder.clone());

		let decoded = self.decode_json(raw, slots, cells, streams)?;
		*placeholder.write() = decoded;
		Ok(placeholder)
	}

	fn decode_json(
		&self,
		raw: &Json,
		slots: &[Json],
		cells: &mut Vec<Option<Cell>>,
		streams: &StreamRegistry,
	) -> Result<Value> {
		match raw {
			Json::Null => Ok(Value::Null),
			Json::Bool(b) => Ok(Value::Bool(*b)),
			Json::Number(n) => {
				if let Some(i) = n.as_i64() {
					Ok(Value::Int(i))
				} else {
					Ok(Value::Float(n.as_f64().unwrap_or_default()))
				}
			}
			Json::String(s) => Ok(Value::Str(s.clone())),
			Json::Array(_) => Err(Error::Protocol("bare array is not a valid slot".into())),
			Json::Object(obj) => {
				if obj.contains_key("u") {
					return Ok(Value::Unit);
				}
				if let Some(Json::Array(bytes)) = obj.get("b") {
					let bytes = bytes
						.iter()
						.map(|v| v.as_u64().unwrap_or_default() as u8)
						.collect();
					return Ok(Value::Bytes(bytes));
				}
				if let Some(Json::Array(indices)) = obj.get("a") {
					let mut items = Vec::with_capacity(indices.len());
					for idx in indices {
						let idx = idx
							.as_u64()
							.ok_or_else(|| Error::Protocol("bad array index".into()))?
							as usize;
						items.push(self.decode_slot(idx, slots, cells, streams)?);
					}
					return Ok(Value::Array(items));
				}
				if let Some(Json::Array(pairs)) = obj.get("m") {
					let mut entries = Vec::with_capacity(pairs.len());
					for pair in pairs {
						let pair = pair
							.as_array()
							.ok_or_else(|| Error::Protocol("bad map entry".into()))?;
						let key = pair[0]
							.as_str()
							.ok_or_else(|| Error::Protocol("bad map key".into()))?
							.to_string();
						let idx = pair[1]
							.as_u64()
							.ok_or_else(|| Error::Protocol("bad map index".into()))?
							as usize;
						entries.push((key, self.decode_slot(idx, slots, cells, streams)?));
					}
					return Ok(Value::Map(entries));
				}
				if let Some(Json::Array(tag_payload)) = obj.get("t") {
					let tag = tag_payload[0]
						.as_str()
						.ok_or_else(|| Error::Protocol("bad tag".into()))?
						.to_string();
					let idx = tag_payload[1]
						.as_u64()
						.ok_or_else(|| Error::Protocol("bad tag payload index".into()))?
						as usize;
					let payload_cell = self.decode_slot(idx, slots, cells, streams)?;

					if tag == LAZY_STREAM_TAG {
						let stream_id = payload_cell
							.read()
							.as_int()
							.ok_or_else(|| Error::Protocol("LazyStream payload must be an int".into()))?
							as StreamId;
						streams.register_inbound(stream_id, 64);
						return Ok(Value::InboundStream(stream_id));
					}

					return match self.transforms.get(&tag) {
						Some(transform) => Ok(transform.revive(payload_cell.read().clone())),
						None => Err(Error::Protocol(format!("unknown tag: {tag}"))),
					};
				}
				Err(Error::Protocol("unrecognized slot object shape".into()))
			}
		}
	}
}

fn tagged_json(tag: &str, payload_idx: u32) -> Json {
	serde_json::json!({ "t": [tag, payload_idx] })
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::value::Value;

	fn roundtrip(value: Value) -> Value {
		let codec = Codec::new();
		let streams = StreamRegistry::new();
		let cell = value.cell();
		let flattened = codec.flatten(&cell, &streams).unwrap();
		let decoded = codec.unflatten(&flattened.frame, &streams).unwrap();
		decoded.read().clone()
	}

	#[test]
	fn round_trips_primitives() {
		assert!(matches!(roundtrip(Value::Int(42)), Value::Int(42)));
		assert!(matches!(roundtrip(Value::Str("hi".into())), Value::Str(s) if s == "hi"));
		assert!(matches!(roundtrip(Value::Unit), Value::Unit));
		assert!(matches!(roundtrip(Value::Null), Value::Null));
	}

	#[test]
	fn round_trips_shared_subtree() {
		let shared = Value::from("shared").cell();
		let root = Arc::new(parking_lot::RwLock::new(Value::Array(vec![shared.clone(), shared.clone()])));

		let codec = Codec::new();
		let streams = StreamRegistry::new();
		let flattened = codec.flatten(&root, &streams).unwrap();
		// Only two unique slots should have been emitted: the array and
		// the single shared string, despite two references to it.
		assert_eq!(flattened.frame.len() - 1, 2);

		let decoded = codec.unflatten(&flattened.frame, &streams).unwrap();
		match &*decoded.read() {
			Value::Array(items) => assert!(Arc::ptr_eq(&items[0], &items[1])),
			_ => panic!("expected array"),
		}
	}

	#[test]
	fn round_trips_cycle() {
		let cell = Value::placeholder();
		*cell.write() = Value::Array(vec![cell.clone()]);

		let codec = Codec::new();
		let streams = StreamRegistry::new();
		let flattened = codec.flatten(&cell, &streams).unwrap();
		let decoded = codec.unflatten(&flattened.frame, &streams).unwrap();
		match &*decoded.read() {
			Value::Array(items) => assert!(Arc::ptr_eq(&items[0], &decoded)),
			_ => panic!("expected array"),
		}
	}

	#[test]
	fn identity_transform_does_not_change_roundtrip() {
		let mut codec = Codec::new();
		codec.register(Arc::new(IdentityTransform("Custom".into())));
		let streams = StreamRegistry::new();

		let tagged = Value::Tagged { tag: "Custom".into(), payload: Value::Int(7).cell() }.cell();
		let flattened = codec.flatten(&tagged, &streams).unwrap();
		let decoded = codec.unflatten(&flattened.frame, &streams).unwrap();
		assert!(matches!(&*decoded.read(), Value::Int(7)));
	}

	#[test]
	fn unknown_tag_is_a_protocol_error() {
		let codec = Codec::new();
		let streams = StreamRegistry::new();
		let tagged = Value::Tagged { tag: "Mystery".into(), payload: Value::Int(1).cell() }.cell();
		let flattened = codec.flatten(&tagged, &streams).unwrap();
		let err = codec.unflatten(&flattened.frame, &streams).unwrap_err();
		assert!(matches!(err, Error::Protocol(_)));
	}
}
