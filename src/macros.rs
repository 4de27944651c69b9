// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 duplex-rpc authors

//! The "thin macro" alternative to a reflective `router.method(args)` proxy
//! (spec §9 "Dynamic method dispatch", SPEC_FULL.md §B "Client stub
//! generation note"). [`rpc_method!`] expands to a one-line typed wrapper
//! around [`crate::client::Client::call_value`], narrowing the result with
//! [`crate::value::FromValue`] instead of threading a generated interface
//! through a proc-macro.

/// Declares an `async fn` that calls a named remote method and narrows its
/// result with [`FromValue`](crate::value::FromValue).
///
/// ```ignore
/// rpc_method!(pub async fn add(a: i64, b: i64) -> i64 = "add");
///
/// let sum = add(&client, 123, 456).await?;
/// ```
///
/// expands to a function taking `&std::sync::Arc<Client>` as its first
/// argument, matching every generated stub method having the same call
/// shape a code-generated client would produce (spec §9).
#[macro_export]
macro_rules! rpc_method {
	($vis:vis async fn $name:ident($($arg:ident : $arg_ty:ty),* $(,)?) -> $ret:ty = $method:expr) => {
		$vis async fn $name(
			client: &::std::sync::Arc<$crate::Client>,
			$($arg: $arg_ty),*
		) -> $crate::error::Result<$ret> {
			let params = vec![$($crate::value::Value::from($arg)),*];
			let value = client.call_value($method, params).await?;
			<$ret as $crate::value::FromValue>::from_value(value)
		}
	};
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use crate::adapter::in_memory::InMemoryAdapter;
	use crate::client::{Client, ClientOptions};
	use crate::server::{HandlerError, MethodTable, Server, ServerConfig};
	use crate::value::Value;

	rpc_method!(pub async fn add(a: i64, b: i64) -> i64 = "add");

	#[tokio::test]
	async fn generated_stub_calls_through_to_handler() {
		let table = MethodTable::new();
		table.register("add", |params: Vec<Value>| async move {
			let a = params[0].clone().as_int().unwrap();
			let b = params[1].clone().as_int().unwrap();
			Ok::<_, HandlerError>(Value::Int(a + b))
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
		assert_eq!(add(&client, 123, 456).await.unwrap(), 579);
	}
}
