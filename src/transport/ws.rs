//! WebSocket transport.
//!
//! Thin layer over `tokio-tungstenite`: text frames in, text frames out.

use futures::future::BoxFuture;
use futures::stream::{SplitSink, SplitStream};
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::{Connector, FrameSink, FrameStream, Transport};
use crate::error::{RealtimeError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Path of the realtime endpoint on the platform host
pub const REALTIME_PATH: &str = "/notification/realtime";

/// Turn a platform address into a websocket URL.
///
/// `http` becomes `ws`, `https` and bare hosts become `wss`, and an empty path
/// points at [`REALTIME_PATH`].
pub fn realtime_url(address: &str) -> String {
    let address = address.trim().trim_end_matches('/');

    let (scheme, rest) = match address.split_once("://") {
        Some(("http", rest)) => ("ws", rest),
        Some(("https", rest)) => ("wss", rest),
        Some((scheme, rest)) => (scheme, rest),
        None => ("wss", address),
    };

    if rest.contains('/') {
        format!("{scheme}://{rest}")
    } else {
        format!("{scheme}://{rest}{REALTIME_PATH}")
    }
}

/// Opens websocket connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl WsConnector {
    /// Create a websocket connector.
    pub fn new() -> Self {
        Self
    }
}

impl Connector for WsConnector {
    fn connect<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<Box<dyn Transport>>> {
        async move {
            let transport: Box<dyn Transport> = Box::new(WsTransport::connect(address).await?);
            Ok(transport)
        }
        .boxed()
    }
}

/// A connected websocket.
pub struct WsTransport {
    stream: WsStream,
}

impl WsTransport {
    /// Connect to a platform address (see [`realtime_url`]).
    pub async fn connect(address: &str) -> Result<Self> {
        let url = realtime_url(address);
        tracing::debug!(url = %url, "Opening websocket");

        let (stream, _) = connect_async(url.as_str()).await.map_err(|e| {
            RealtimeError::Connect(format!("Failed to connect to {url}: {e}"))
        })?;

        Ok(Self { stream })
    }
}

impl Transport for WsTransport {
    fn name(&self) -> &'static str {
        "websocket"
    }

    fn split(self: Box<Self>) -> (Box<dyn FrameSink>, Box<dyn FrameStream>) {
        let (sink, stream) = self.stream.split();
        (Box::new(WsSink { sink }), Box::new(WsFrames { stream }))
    }
}

struct WsSink {
    sink: SplitSink<WsStream, Message>,
}

impl FrameSink for WsSink {
    fn send(&mut self, frame: String) -> BoxFuture<'_, Result<()>> {
        async move {
            self.sink.send(Message::Text(frame.into())).await?;
            Ok(())
        }
        .boxed()
    }

    fn close(&mut self) -> BoxFuture<'_, Result<()>> {
        async move {
            self.sink.close().await?;
            Ok(())
        }
        .boxed()
    }
}

struct WsFrames {
    stream: SplitStream<WsStream>,
}

impl FrameStream for WsFrames {
    fn recv(&mut self) -> BoxFuture<'_, Option<Result<String>>> {
        async move {
            loop {
                match self.stream.next().await? {
                    Ok(Message::Text(text)) => return Some(Ok(text.to_string())),
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => return Some(Ok(text)),
                        Err(e) => {
                            tracing::warn!(
                                error = %e,
                                len = bytes.len(),
                                "Skipping binary frame that is not UTF-8"
                            );
                        },
                    },
                    Ok(Message::Close(_)) => return None,
                    Ok(_) => {},
                    Err(e) => return Some(Err(e.into())),
                }
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_realtime_url_schemes() {
        assert_eq!(
            realtime_url("https://acme.example.com"),
            "wss://acme.example.com/notification/realtime"
        );
        assert_eq!(
            realtime_url("http://localhost:8080/"),
            "ws://localhost:8080/notification/realtime"
        );
        assert_eq!(
            realtime_url("acme.example.com"),
            "wss://acme.example.com/notification/realtime"
        );
    }

    #[test]
    fn test_realtime_url_keeps_explicit_path() {
        assert_eq!(
            realtime_url("ws://127.0.0.1:9000/cometd"),
            "ws://127.0.0.1:9000/cometd"
        );
        assert_eq!(
            realtime_url("wss://acme.example.com/notification/realtime"),
            "wss://acme.example.com/notification/realtime"
        );
    }
}
