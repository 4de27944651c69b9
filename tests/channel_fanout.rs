// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 duplex-rpc authors

//! Channel fan-out end to end (spec §8 scenario 4): `onSubscribe(a, b)`
//! returns `a + subscriberCount`, a driver pushes `++a + subscriberCount`
//! every 50ms until `a == b`, then pushes `0`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use duplex_rpc::adapter::in_memory::InMemoryAdapter;
use duplex_rpc::{Channel, Client, ClientOptions, HandlerError, MethodTable, Server, ServerConfig, StreamItem, SubscribeOptions, Value};

#[tokio::test]
async fn one_subscriber_sees_onsubscribe_value_then_ticks_then_zero() {
	let channel = Channel::new();
	let started = Arc::new(AtomicBool::new(false));

	let table = MethodTable::new();
	let table_channel = channel.clone();
	let table_started = started.clone();
	table.register("getRangeChannel", move |params: Vec<Value>| {
		let channel = table_channel.clone();
		let started = table_started.clone();
		async move {
			let start = params[0].clone().as_int().unwrap();
			let end = params[1].clone().as_int().unwrap();

			// `subscriberCount` for the onSubscribe return is the count
			// *before* this subscriber is added to the broadcast list.
			let count_before = channel.subscriber_count() as i64;
			let sequence = channel.subscribe_seeded(16, Value::Int(start + count_before)).await;

			if !started.swap(true, Ordering::SeqCst) {
				let channel = channel.clone();
				tokio::spawn(async move {
					let mut a = start;
					loop {
						tokio::time::sleep(Duration::from_millis(50)).await;
						a += 1;
						let count = channel.subscriber_count() as i64;
						channel.push(Value::Int(a + count)).await;
						if a == end {
							channel.push(Value::Int(0)).await;
							channel.close();
							break;
						}
					}
				});
			}

			Ok::<_, HandlerError>(sequence)
		}
	});

	let server = Arc::new(Server::new(Arc::new(table), ServerConfig::default()));
	let adapter = Arc::new(InMemoryAdapter::new());
	let server_adapter = adapter.clone();
	tokio::spawn(async move {
		if let Some(conn) = server_adapter.accept().await {
			server.accept(conn);
		}
	});

	let client = Client::connect(ClientOptions::new("mem://test", adapter));

	let collected = Arc::new(parking_lot::Mutex::new(Vec::new()));
	let collected_for_observer = collected.clone();
	client
		.subscribe(
			"getRangeChannel",
			vec![Value::Int(3), Value::Int(7)],
			move |item| {
				if let Ok(StreamItem::Value(value)) = item {
					collected_for_observer.lock().push(value.as_int().unwrap());
				}
			},
			SubscribeOptions::default(),
		)
		.await
		.unwrap();

	assert_eq!(*collected.lock(), vec![3, 5, 6, 7, 8, 0]);
}
