// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 duplex-rpc authors

//! Reconnect during subscription (spec §8 scenario 6): the socket is killed
//! from the server side mid-stream; `subscribe` silently re-issues the same
//! call and keeps delivering to the same observer.

use std::sync::Arc;
use std::time::Duration;

use duplex_rpc::adapter::in_memory::InMemoryAdapter;
use duplex_rpc::adapter::CloseInfo;
use duplex_rpc::{Client, ClientOptions, HandlerError, MethodTable, Server, ServerConfig, StreamItem, SubscribeOptions, Value};

#[tokio::test]
async fn subscription_resumes_after_server_kills_the_socket() {
	let table = MethodTable::new();
	table.register("countUp", |params: Vec<Value>| async move {
		let start = params[0].clone().as_int().unwrap();
		let (sender, sequence) = duplex_rpc::lazy_sequence(8);
		tokio::spawn(async move {
			let mut n = start;
			loop {
				if !sender.push(Value::Int(n)).await {
					return;
				}
				n += 1;
				tokio::time::sleep(Duration::from_millis(5)).await;
			}
		});
		Ok::<_, HandlerError>(sequence)
	});

	let server = Arc::new(Server::new(Arc::new(table), ServerConfig::default()));
	let adapter = Arc::new(InMemoryAdapter::new());

	// Captures every server-side transport as new connections arrive, so
	// the test can reach in and kill one from "the server side" without
	// touching the client.
	let (transport_tx, mut transport_rx) = tokio::sync::mpsc::unbounded_channel();
	let accept_adapter = adapter.clone();
	let accept_server = server.clone();
	tokio::spawn(async move {
		while let Some(conn) = accept_adapter.accept().await {
			let transport = accept_server.accept(conn);
			let _ = transport_tx.send(transport);
		}
	});

	let client = Client::connect(ClientOptions::new("mem://test", adapter));

	let collected = Arc::new(parking_lot::Mutex::new(Vec::new()));
	let collected_for_observer = collected.clone();
	let subscribe_client = client.clone();
	tokio::spawn(async move {
		let _ = subscribe_client
			.subscribe(
				"countUp",
				vec![Value::Int(0)],
				move |item| {
					if let Ok(StreamItem::Value(value)) = item {
						collected_for_observer.lock().push(value.as_int().unwrap());
					}
				},
				SubscribeOptions::default(),
			)
			.await;
	});

	let first_transport = transport_rx.recv().await.expect("first connection accepted");

	// Let a few items flow on the first connection before killing it.
	while collected.lock().len() < 3 {
		tokio::time::sleep(Duration::from_millis(5)).await;
	}
	let count_before_kill = collected.lock().len();

	first_transport.close(CloseInfo::normal("server-initiated close for test")).await.unwrap();

	// The client's connect loop re-attaches immediately (the in-memory
	// adapter never fails `connect`), and `subscribe` re-issues `countUp`
	// on the new transport without the caller doing anything.
	let _second_transport = transport_rx.recv().await.expect("reconnected");

	let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
	while collected.lock().len() <= count_before_kill && tokio::time::Instant::now() < deadline {
		tokio::time::sleep(Duration::from_millis(5)).await;
	}

	assert!(
		collected.lock().len() > count_before_kill,
		"expected more items to arrive after reconnect, stuck at {}",
		collected.lock().len()
	);
}
