//! Helper functions abstracting away different transport protocols for Transit

use super::{
    crypto::TransitHandshakeError, ConnectionType, DirectHint, RelayEndpoint, RelayEndpointKind,
    RelayProtocol, RelayUrl, TransitConnection, TransitInfo,
};

use async_std::net::TcpStream;
use async_trait::async_trait;
use futures::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    Sink, Stream,
};
use log::*;
use std::{
    pin::Pin,
    task::{Context, Poll},
};

/// Maximum size of a single WebSocket frame we are willing to buffer.
pub(super) const WS_READ_LIMIT: usize = 65536;

#[async_trait]
pub(super) trait TransitTransportRx: AsyncRead + Unpin + Send {
    /// Helper method for handshake: read a fixed number of bytes and make sure they are as expected
    async fn read_expect(&mut self, expected: &[u8]) -> Result<(), TransitHandshakeError> {
        let mut buffer = vec![0u8; expected.len()];
        self.read_exact(&mut buffer).await?;
        ensure!(buffer == expected, TransitHandshakeError::HandshakeFailed);
        Ok(())
    }
}

#[async_trait]
pub(super) trait TransitTransportTx: AsyncWrite + Unpin + Send {
    /// Helper method: write the message length then the message
    async fn write_transit_message(&mut self, message: &[u8]) -> Result<(), std::io::Error> {
        self.write_all(&(message.len() as u32).to_be_bytes())
            .await?;
        self.write_all(message).await
    }
}

/// Trait abstracting our socket used for communicating over the wire.
///
/// Will be instantiated by either a TCP or a WebSocket connection.
pub(super) trait TransitTransport: TransitTransportRx + TransitTransportTx {}

impl<T> TransitTransportRx for T where T: AsyncRead + Unpin + Send {}
impl<T> TransitTransportTx for T where T: AsyncWrite + Unpin + Send {}
impl<T> TransitTransport for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/**
 * Present a WebSocket connection as an ordinary byte stream.
 *
 * The relay speaks the same line-and-record protocol over WebSocket as over
 * TCP, one binary frame per write. Frame boundaries carry no meaning on the
 * read side, so we buffer.
 */
pub(super) struct WsStream<S> {
    inner: async_tungstenite::WebSocketStream<S>,
    read_buf: Vec<u8>,
}

impl<S> WsStream<S> {
    pub fn new(inner: async_tungstenite::WebSocketStream<S>) -> Self {
        Self {
            inner,
            read_buf: Vec::new(),
        }
    }
}

fn ws_to_io(error: async_tungstenite::tungstenite::Error) -> std::io::Error {
    use async_tungstenite::tungstenite as ws2;
    match error {
        ws2::Error::Io(error) => error,
        other => std::io::Error::new(std::io::ErrorKind::Other, other),
    }
}

impl<S> AsyncRead for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<std::io::Result<usize>> {
        use async_tungstenite::tungstenite as ws2;
        let this = self.get_mut();

        loop {
            if !this.read_buf.is_empty() {
                let n = buf.len().min(this.read_buf.len());
                buf[..n].copy_from_slice(&this.read_buf[..n]);
                this.read_buf.drain(..n);
                return Poll::Ready(Ok(n));
            }

            match futures::ready!(Pin::new(&mut this.inner).poll_next(cx)) {
                None => return Poll::Ready(Ok(0)),
                Some(Err(ws2::Error::ConnectionClosed)) => return Poll::Ready(Ok(0)),
                Some(Err(error)) => return Poll::Ready(Err(ws_to_io(error))),
                Some(Ok(message)) if message.is_binary() => {
                    let data = message.into_data();
                    if data.len() > WS_READ_LIMIT {
                        return Poll::Ready(Err(std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            "WebSocket frame exceeds the read limit",
                        )));
                    }
                    this.read_buf.extend_from_slice(&data);
                },
                Some(Ok(message)) if message.is_close() => return Poll::Ready(Ok(0)),
                /* Pings are answered by the protocol machinery, text frames are not part of transit */
                Some(Ok(_)) => continue,
            }
        }
    }
}

impl<S> AsyncWrite for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        use async_tungstenite::tungstenite as ws2;
        let this = self.get_mut();

        futures::ready!(Pin::new(&mut this.inner).poll_ready(cx)).map_err(ws_to_io)?;
        Pin::new(&mut this.inner)
            .start_send(ws2::Message::Binary(buf.to_vec()))
            .map_err(ws_to_io)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll_flush(cx).map_err(ws_to_io)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll_close(cx).map_err(ws_to_io)
    }
}

pub(super) async fn connect_direct(
    hint: &DirectHint,
) -> Result<TransitConnection, TransitHandshakeError> {
    debug!("Connecting directly to {}", hint);
    let socket = TcpStream::connect((hint.hostname.as_str(), hint.port)).await?;
    debug!("Connected to {}!", hint);

    wrap_tcp_connection(socket, ConnectionType::Direct)
}

/* Take a relay hint and try to connect to it, with the protocol its type asks for */
pub(super) async fn connect_relay_endpoint(
    endpoint: &RelayEndpoint,
) -> Result<TransitConnection, TransitHandshakeError> {
    debug!("Connecting to relay {}", endpoint);
    let conn = match endpoint.kind {
        RelayEndpointKind::Tcp => {
            let socket = TcpStream::connect((endpoint.hostname.as_str(), endpoint.port)).await?;
            wrap_tcp_connection(socket, ConnectionType::Relay)?
        },
        RelayEndpointKind::Ws => {
            connect_ws(format!("ws://{}:{}", endpoint.hostname, endpoint.port)).await?
        },
        RelayEndpointKind::Wss => {
            connect_ws(format!("wss://{}:{}", endpoint.hostname, endpoint.port)).await?
        },
    };
    debug!("Connected to {}!", endpoint);
    Ok(conn)
}

/* Dial the locally configured relay, for the persistent slot we listen on */
pub(super) async fn connect_relay_url(
    relay: &RelayUrl,
) -> Result<TransitConnection, TransitHandshakeError> {
    debug!("Connecting to relay {}", relay);
    let conn = match relay.proto {
        RelayProtocol::Tcp => {
            let socket = TcpStream::connect((relay.host.as_str(), relay.port)).await?;
            wrap_tcp_connection(socket, ConnectionType::Relay)?
        },
        RelayProtocol::Ws | RelayProtocol::Wss => connect_ws(relay.to_string()).await?,
    };
    debug!("Connected to {}!", relay);
    Ok(conn)
}

async fn connect_ws(url: String) -> Result<TransitConnection, TransitHandshakeError> {
    let (stream, _response) = async_tungstenite::async_std::connect_async(url).await?;

    let transit = Box::new(WsStream::new(stream)) as Box<dyn TransitTransport>;

    Ok((
        transit,
        TransitInfo {
            conn_type: ConnectionType::Relay,
            peer_addr: None,
        },
    ))
}

/* Take a tcp connection and transform it into a `TransitConnection` (mainly set timeouts) */
pub(super) fn wrap_tcp_connection(
    socket: TcpStream,
    conn_type: ConnectionType,
) -> Result<TransitConnection, TransitHandshakeError> {
    /* Set proper read and write timeouts. This will temporarily set the socket into blocking mode :/ */
    // https://github.com/async-rs/async-std/issues/499
    let socket = std::net::TcpStream::try_from(socket)
        .expect("Internal error: this should not fail because we never cloned the socket");
    socket.set_write_timeout(Some(std::time::Duration::from_secs(120)))?;
    socket.set_read_timeout(Some(std::time::Duration::from_secs(120)))?;
    let socket: TcpStream = socket.into();

    let peer_addr = socket.peer_addr()?;

    Ok((
        Box::new(socket),
        TransitInfo {
            conn_type,
            peer_addr: Some(peer_addr),
        },
    ))
}
