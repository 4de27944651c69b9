// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 duplex-rpc authors

//! The real-world adapter: a `tokio-tungstenite` WebSocket, matching the
//! teacher's own client stack (`reifydb-client`'s `ws` feature).

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::{Adapter, CloseInfo, Connection};
use crate::context::CancelWatch;
use crate::error::{Error, Result};
use crate::message::RawFrame;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WebSocketConnection {
	sink: Mutex<SplitSink<WsStream, Message>>,
	stream: Mutex<SplitStream<WsStream>>,
}

#[async_trait::async_trait]
impl Connection for WebSocketConnection {
	async fn send(&self, frame: RawFrame) -> Result<()> {
		let message = match frame {
			RawFrame::Text(s) => Message::Text(s.into()),
			RawFrame::Binary(b) => Message::Binary(b.into()),
		};
		self.sink.lock().await.send(message).await.map_err(|e| Error::Adapter(e.to_string()))
	}

	async fn recv(&self) -> Option<RawFrame> {
		loop {
			let next = self.stream.lock().await.next().await;
			match next {
				Some(Ok(Message::Text(text))) => return Some(RawFrame::Text(text.to_string())),
				Some(Ok(Message::Binary(bytes))) => return Some(RawFrame::Binary(bytes.to_vec())),
				// Ping/Pong/Close frames at the WebSocket protocol level are
				// handled by tokio-tungstenite itself; they are distinct
				// from this crate's own text "ping"/"pong" liveness sentinels
				// (spec §3) and are simply skipped here.
				Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
				Some(Ok(Message::Close(_))) | None => return None,
				Some(Ok(Message::Frame(_))) => continue,
				Some(Err(_)) => return None,
			}
		}
	}

	async fn close(&self, info: CloseInfo) -> Result<()> {
		use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
		use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
		let close_code = CloseCode::from(info.code);
		let frame = CloseFrame { code: close_code, reason: info.reason.into() };
		self.sink
			.lock()
			.await
			.send(Message::Close(Some(frame)))
			.await
			.map_err(|e| Error::Adapter(e.to_string()))
	}
}

/// Connects to a `ws://`/`wss://` URL using `tokio-tungstenite`.
pub struct WebSocketAdapter;

#[async_trait::async_trait]
impl Adapter for WebSocketAdapter {
	async fn connect(&self, url: &str, signal: CancelWatch) -> Result<Box<dyn Connection>> {
		let connect = tokio_tungstenite::connect_async(url);
		let (ws_stream, _response) = tokio::select! {
			result = connect => result.map_err(|e| Error::Adapter(e.to_string()))?,
			_ = signal.cancelled() => return Err(Error::Cancelled),
		};
		let (sink, stream) = ws_stream.split();
		Ok(Box::new(WebSocketConnection { sink: Mutex::new(sink), stream: Mutex::new(stream) }))
	}
}
