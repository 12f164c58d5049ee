//! WebSocket links.
//!
//! Thin wrapper around `tokio-tungstenite` providing type-isolated
//! reader/writer halves for both directions:
//!
//! - [`connect`] dials a relay (front-ends, bridges, test clients)
//! - [`accept`] upgrades an incoming TCP stream on the relay side and reads
//!   the `room` query parameter from the request
//!
//! Both return a ([`WsWriter`], [`WsReader`]) pair implementing
//! [`FrameSink`]/[`FrameSource`], ready for [`super::Connection::spawn`].

// Rust guideline compliant 2026-02

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{
    self,
    handshake::server::{ErrorResponse, Request, Response},
    http::StatusCode,
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::{FrameSink, FrameSource, TransportError};
use crate::config::{room_from_query, validate_room};

/// Write half of a WebSocket connection.
#[derive(Debug)]
pub struct WsWriter<S = MaybeTlsStream<TcpStream>> {
    sink: SplitSink<WebSocketStream<S>, tungstenite::Message>,
}

/// Read half of a WebSocket connection.
#[derive(Debug)]
pub struct WsReader<S = MaybeTlsStream<TcpStream>> {
    stream: SplitStream<WebSocketStream<S>>,
}

#[async_trait]
impl<S> FrameSink for WsWriter<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
        self.sink
            .send(tungstenite::Message::Text(text.to_string()))
            .await
            .map_err(|e| TransportError::Io(format!("WebSocket send failed: {e}")))
    }

    async fn close(&mut self) {
        if let Err(e) = self.sink.close().await {
            log::trace!("[WebSocket] close: {e}");
        }
    }
}

#[async_trait]
impl<S> FrameSource for WsReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Control frames are handled by tungstenite; binary frames carry no
    /// envelopes and are skipped.
    async fn recv_text(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.stream.next().await {
                Some(Ok(tungstenite::Message::Text(text))) => return Some(Ok(text)),
                Some(Ok(tungstenite::Message::Close(close_frame))) => {
                    if let Some(cf) = close_frame {
                        let code = u16::from(cf.code);
                        log::debug!("[WebSocket] Peer closed: {code} {}", cf.reason);
                    }
                    return None;
                }
                Some(Ok(tungstenite::Message::Binary(data))) => {
                    log::debug!("[WebSocket] Ignoring {}-byte binary frame", data.len());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    return Some(Err(TransportError::Io(format!("WebSocket read error: {e}"))));
                }
                None => return None,
            }
        }
    }
}

/// Connect to a WebSocket URL with optional headers.
///
/// # Errors
///
/// Returns an error if the URL is invalid, header values are malformed,
/// or the WebSocket handshake fails.
pub async fn connect(url: &str, headers: &[(&str, &str)]) -> Result<(WsWriter, WsReader)> {
    use tungstenite::client::IntoClientRequest;

    let mut request = url
        .into_client_request()
        .with_context(|| format!("invalid WebSocket URL: {url}"))?;

    for &(name, value) in headers {
        let header_name = tungstenite::http::HeaderName::from_bytes(name.as_bytes())
            .with_context(|| format!("invalid header name: {name}"))?;
        let header_value = tungstenite::http::HeaderValue::from_str(value)
            .with_context(|| format!("invalid header value for {name}"))?;
        request.headers_mut().insert(header_name, header_value);
    }

    let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .context("WebSocket connect failed")?;

    let (sink, stream) = ws_stream.split();
    Ok((WsWriter { sink }, WsReader { stream }))
}

/// Upgrade an incoming connection.
///
/// Returns the halves and the requested room, or `None` when the request
/// named no room. Requests naming a malformed room are refused with 400.
///
/// # Errors
///
/// Returns an error if the upgrade fails or the room is malformed.
pub async fn accept<S>(stream: S) -> Result<(WsWriter<S>, WsReader<S>, Option<String>)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut room = None;
    let callback = |request: &Request, response: Response| {
        let path = request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or_default();
        match room_from_query(path) {
            Some(requested) if validate_room(requested).is_err() => {
                let mut refusal = ErrorResponse::new(Some(format!("invalid room: {requested:?}")));
                *refusal.status_mut() = StatusCode::BAD_REQUEST;
                Err(refusal)
            }
            requested => {
                room = requested.map(String::from);
                Ok(response)
            }
        }
    };

    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback)
        .await
        .context("WebSocket upgrade failed")?;

    let (sink, stream) = ws_stream.split();
    Ok((WsWriter { sink }, WsReader { stream }, room))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_invalid_url_returns_error() {
        assert!(connect("not-a-url", &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_connect_unreachable_host_returns_error() {
        assert!(connect("ws://127.0.0.1:1/invalid", &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_accept_reads_room_and_exchanges_text() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (mut writer, mut reader, room) = accept(stream).await.unwrap();
            let text = reader.recv_text().await.unwrap().unwrap();
            writer.send_text(&text).await.unwrap();
            room
        });

        let (mut writer, mut reader) = connect(&format!("ws://{addr}/ws?room=lab-1"), &[])
            .await
            .unwrap();
        writer.send_text("hello").await.unwrap();
        assert_eq!(reader.recv_text().await.unwrap().unwrap(), "hello");
        assert_eq!(server.await.unwrap().as_deref(), Some("lab-1"));
    }

    #[tokio::test]
    async fn test_accept_refuses_malformed_room() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            accept(stream).await.is_err()
        });

        assert!(connect(&format!("ws://{addr}/ws?room=a%20b"), &[]).await.is_err());
        assert!(server.await.unwrap());
    }
}
