// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 duplex-rpc authors

//! Boundary protocol violations (spec §4.3, §7 `ProtocolError`): a frame
//! referring to an unknown stream id, or a raw frame with no matching
//! `chunk{type}` announcement, is fatal — it closes the transport rather
//! than being silently ignored.

use std::sync::Arc;
use std::time::Duration;

use duplex_rpc::adapter::in_memory::connection_pair;
use duplex_rpc::adapter::Connection;
use duplex_rpc::message::RawFrame;
use duplex_rpc::pending::PendingQueries;
use duplex_rpc::transport::Transport;
use duplex_rpc::Codec;

async fn assert_closes_on(raw: RawFrame) {
	assert_closes_on_sequence(vec![raw]).await;
}

async fn assert_closes_on_sequence(frames: Vec<RawFrame>) {
	let (raw_end, transport_end) = connection_pair();
	let (transport, _requests_rx) = Transport::new(transport_end, Arc::new(Codec::new()), Arc::new(PendingQueries::new()));

	for raw in frames {
		raw_end.send(raw).await.unwrap();
	}

	tokio::time::timeout(Duration::from_secs(1), transport.closed()).await.expect("transport should close on protocol error");
	assert!(transport.is_closed());
}

#[tokio::test]
async fn cancel_for_unknown_stream_id_is_fatal() {
	assert_closes_on(RawFrame::Text(r#"{"stream":"cancel","id":999}"#.to_string())).await;
}

#[tokio::test]
async fn done_for_unknown_stream_id_is_fatal() {
	assert_closes_on(RawFrame::Text(r#"{"stream":"done","id":999}"#.to_string())).await;
}

#[tokio::test]
async fn error_for_unknown_stream_id_is_fatal() {
	assert_closes_on(RawFrame::Text(r#"{"stream":"error","id":999,"error":"boom"}"#.to_string())).await;
}

#[tokio::test]
async fn chunk_data_for_unregistered_inbound_id_is_fatal() {
	assert_closes_on(RawFrame::Text(r#"{"stream":"chunk","id":999,"data":[0,"hi"]}"#.to_string())).await;
}

#[tokio::test]
async fn raw_frame_with_no_pending_announcement_is_fatal() {
	assert_closes_on(RawFrame::Binary(vec![1, 2, 3])).await;
}

#[tokio::test]
async fn malformed_json_is_fatal() {
	assert_closes_on(RawFrame::Text("not json at all".to_string())).await;
}

#[tokio::test]
async fn control_frame_instead_of_announced_binary_payload_is_fatal() {
	// Announces a binary payload is coming next, but a text control frame
	// arrives instead of the raw bytes — the announced physical type must
	// match the frame that actually follows (spec §8 boundary case).
	assert_closes_on_sequence(vec![
		RawFrame::Text(r#"{"stream":"chunk","id":1,"type":"Uint8Array"}"#.to_string()),
		RawFrame::Text("ping".to_string()),
	])
	.await;
}

#[tokio::test]
async fn binary_frame_instead_of_announced_string_payload_is_fatal() {
	assert_closes_on_sequence(vec![
		RawFrame::Text(r#"{"stream":"chunk","id":1,"type":"string"}"#.to_string()),
		RawFrame::Binary(vec![1, 2, 3]),
	])
	.await;
}
