//! Connect two sides via TCP or a relay, no matter where they are
//!
//! This protocol is the second part where the wormhole magic happens. It does
//! not strictly require a wormhole connection, but it depends on some kind of
//! secure communication channel to talk to the other side. Conveniently, the
//! mailbox provides exactly such a thing :)
//!
//! Both clients exchange messages containing hints on how to find each other.
//! These may be local IP addresses for in case they are in the same network,
//! or the address of a relay server. Every candidate is dialed concurrently
//! (while also accepting inbound connections), and the first one to complete
//! the authenticated handshake wins. In case a direct connection fails, both
//! sides connect to the relay server which will transparently glue the
//! connections together.
//!
//! **Notice:** while the resulting connection is naturally bi-directional, the
//! handshake is not symmetric. There *must* be one sender side and one
//! receiver side, and both must agree on who is who out of band.

use crate::{
    key::{Key, TransitKey},
    util,
};

use async_std::net::TcpListener;
use futures::{
    future::{Future, FutureExt},
    io::AsyncWriteExt,
    select_biased, StreamExt,
};
use log::*;
use serde_derive::{Deserialize, Serialize};
use std::{str::FromStr, sync::Arc, time::Duration};

mod crypto;
mod transport;

use crypto::{RecordDecryptor, RecordEncryptor, TransitHandshakeError};
use transport::{TransitTransport, TransitTransportRx};

/// URL to a default hosted relay server. Please don't abuse or DOS.
pub const DEFAULT_RELAY_SERVER: &str = "tcp:transit.magic-wormhole.io:4001";

/// How long `connect` may search for a viable path before giving up.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/**
 * Which side of the handshake we speak.
 *
 * The sender arbitrates between surviving connection candidates, the receiver
 * waits to be chosen. The roles also pair up the record keys: the sender's
 * write key is the receiver's read key and vice versa.
 */
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    Sender,
    Receiver,
}

/**
 * Defines a way to find the other side.
 *
 * Each ability comes with a set of [hints](Hint) to encode how to meet up.
 */
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", tag = "type")]
pub enum Ability {
    /**
     * Try to connect directly to the other side.
     *
     * This usually requires both participants to be in the same network.
     * [`DirectHint`]s are sent, which encode all local IP addresses for the
     * other side to find us.
     */
    DirectTcpV1,
    /** Try to meet the other side at a relay. */
    RelayV1,
    #[serde(other)]
    Other,
}

impl Ability {
    pub fn all_abilities() -> Vec<Ability> {
        vec![Self::DirectTcpV1, Self::RelayV1]
    }
}

/**
 * The transit message exchanged over the mailbox: everything the other side
 * needs to know to find us.
 */
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct TransitMsg {
    pub abilities_v1: Vec<Ability>,
    pub hints_v1: Vec<Hint>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "kebab-case", tag = "type")]
pub enum Hint {
    DirectTcpV1(DirectHint),
    /* Weirdness alarm: a "relay hint" contains multiple endpoints. This means
     * that there may be multiple direct hints, but if there are multiple relay
     * hints it's still only one item because it internally has a list.
     */
    RelayV1(RelayHint),
}

impl Hint {
    pub fn new_direct(priority: f32, hostname: &str, port: u16) -> Self {
        Hint::DirectTcpV1(DirectHint {
            hostname: hostname.to_string(),
            port,
            priority,
        })
    }

    pub fn new_relay(hints: Vec<RelayEndpoint>) -> Self {
        Hint::RelayV1(RelayHint { hints })
    }
}

/// One directly reachable TCP endpoint.
///
/// The priority is advertised but plays no role in the race; whoever finishes
/// the handshake first wins.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DirectHint {
    pub hostname: String,
    pub port: u16,
    #[serde(default)]
    pub priority: f32,
}

impl std::fmt::Display for DirectHint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tcp://{}:{}", self.hostname, self.port)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RelayHint {
    pub hints: Vec<RelayEndpoint>,
}

/// One address under which a relay server can be reached.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RelayEndpoint {
    #[serde(rename = "type")]
    pub kind: RelayEndpointKind,
    pub hostname: String,
    pub port: u16,
    #[serde(default)]
    pub priority: f32,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayEndpointKind {
    #[serde(rename = "direct-tcp-v1")]
    Tcp,
    #[serde(rename = "direct-ws-v1")]
    Ws,
    #[serde(rename = "direct-wss-v1")]
    Wss,
}

impl std::fmt::Display for RelayEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheme = match self.kind {
            RelayEndpointKind::Tcp => "tcp",
            RelayEndpointKind::Ws => "ws",
            RelayEndpointKind::Wss => "wss",
        };
        write!(f, "{}://{}:{}", scheme, self.hostname, self.port)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayProtocol {
    Tcp,
    Ws,
    Wss,
}

/**
 * The configured transit relay endpoint.
 *
 * A `tcp` URL with an empty host ("`:0`") means "no relay": the relay slot is
 * neither dialed nor advertised.
 */
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayUrl {
    pub proto: RelayProtocol,
    pub host: String,
    pub port: u16,
}

impl RelayUrl {
    /// A placeholder URL that disables the relay altogether.
    pub fn null() -> Self {
        RelayUrl {
            proto: RelayProtocol::Tcp,
            host: String::new(),
            port: 0,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_null(&self) -> bool {
        self.host.is_empty() && self.port == 0
    }
}

impl std::fmt::Display for RelayUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.proto {
            RelayProtocol::Tcp => write!(f, "tcp:{}:{}", self.host, self.port),
            RelayProtocol::Ws => write!(f, "ws://{}:{}", self.host, self.port),
            RelayProtocol::Wss => write!(f, "wss://{}:{}", self.host, self.port),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ParseRelayUrlError {
    #[error("Incorrect relay server url format")]
    Format,
    #[error("Cannot parse relay url port")]
    Port,
    #[error("Unsupported protocol: '{}'", _0)]
    UnsupportedProtocol(String),
}

impl FromStr for RelayUrl {
    type Err = ParseRelayUrlError;

    fn from_str(url: &str) -> Result<Self, ParseRelayUrlError> {
        if url.contains("://") {
            let parsed = url::Url::parse(url).map_err(|_| ParseRelayUrlError::Format)?;
            let proto = match parsed.scheme() {
                "tcp" => RelayProtocol::Tcp,
                "ws" => RelayProtocol::Ws,
                "wss" => RelayProtocol::Wss,
                other => bail!(ParseRelayUrlError::UnsupportedProtocol(other.into())),
            };
            let host = parsed
                .host_str()
                .ok_or(ParseRelayUrlError::Format)?
                .to_string();
            let port = parsed
                .port_or_known_default()
                .ok_or(ParseRelayUrlError::Port)?;
            Ok(RelayUrl { proto, host, port })
        } else {
            /* The classic "tcp:hostname:port" notation */
            let v: Vec<&str> = url.split(':').collect();
            ensure!(v.len() == 3, ParseRelayUrlError::Format);
            let proto = match v[0] {
                "tcp" => RelayProtocol::Tcp,
                "ws" => RelayProtocol::Ws,
                "wss" => RelayProtocol::Wss,
                other => bail!(ParseRelayUrlError::UnsupportedProtocol(other.into())),
            };
            let port = v[2].parse().map_err(|_| ParseRelayUrlError::Port)?;
            Ok(RelayUrl {
                proto,
                host: v[1].to_string(),
                port,
            })
        }
    }
}

/// Over which kind of path the peers found each other.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionType {
    Direct,
    Relay,
}

/// Metadata about the established transit connection
#[derive(Clone, Debug)]
pub struct TransitInfo {
    pub conn_type: ConnectionType,
    pub peer_addr: Option<std::net::SocketAddr>,
}

type TransitConnection = (Box<dyn TransitTransport>, TransitInfo);

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TransitConnectError {
    /** Incompatible abilities, or wrong hints */
    #[error("All connection attempts failed")]
    NoRoute,
    #[error("Gave up after not finding a viable connection in time")]
    Timeout,
    #[error("Connection establishment was cancelled")]
    Cancelled,
    #[error("The transit handshake failed")]
    Handshake,
    #[error("IO error")]
    IO(
        #[from]
        #[source]
        std::io::Error,
    ),
}

impl From<TransitHandshakeError> for TransitConnectError {
    fn from(error: TransitHandshakeError) -> Self {
        match error {
            TransitHandshakeError::IO(error) => Self::IO(error),
            TransitHandshakeError::Websocket(error) => {
                Self::IO(std::io::Error::new(std::io::ErrorKind::Other, error))
            },
            _ => Self::Handshake,
        }
    }
}

/// Errors occurring on an established record pipe
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TransitError {
    #[error("Cryptography error. This is probably an attack attempt, but it could also be a bug")]
    Crypto,
    #[error("Wrong nonce received, got {:x?} but expected {:x?}", _0, _1)]
    Nonce(Box<[u8]>, Box<[u8]>),
    #[error("Received a malformed record frame")]
    Frame,
    #[error("IO error")]
    IO(
        #[from]
        #[source]
        std::io::Error,
    ),
}

/**
 * Initialize the transit machinery.
 *
 * Bind the listener, pre-dial and register on the relay, and collect our
 * hints. This does not talk to the peer yet; exchange
 * [`our_transit_msg`](TransitConnector::our_transit_msg) with the other side
 * first, then [`connect`](TransitConnector::connect).
 */
pub async fn init(
    transit_key: Key<TransitKey>,
    relay_url: &RelayUrl,
    disable_listener: bool,
) -> Result<TransitConnector, TransitConnectError> {
    let key = Arc::new(transit_key);

    /* A WebSocket relay implies we are not reachable by address ourselves */
    let listener = if !disable_listener && relay_url.proto == RelayProtocol::Tcp {
        let listener = match TcpListener::bind("[::]:0").await {
            Ok(listener) => listener,
            /* No IPv6 support on this machine then */
            Err(_) => TcpListener::bind("0.0.0.0:0").await?,
        };
        debug!("Bound listener on port {}", listener.local_addr()?.port());
        Some(listener)
    } else {
        None
    };

    let relay_conn = if relay_url.is_null() {
        None
    } else {
        let (mut conn, _info) = transport::connect_relay_url(relay_url).await?;
        let side = crypto::generate_side();
        conn.write_all(crypto::relay_handshake_header(&key, &side).as_bytes())
            .await?;
        conn.flush().await?;
        debug!("Registered on relay {} as side {}", relay_url, side);
        Some(conn)
    };

    let mut our_hints = Vec::new();
    if let Some(listener) = &listener {
        let port = listener.local_addr()?.port();
        for ip in non_loopback_addresses() {
            our_hints.push(Hint::DirectTcpV1(DirectHint {
                hostname: ip.to_string(),
                port,
                priority: 0.0,
            }));
        }
    }
    if relay_conn.is_some() {
        let kind = match relay_url.proto {
            RelayProtocol::Tcp => RelayEndpointKind::Tcp,
            RelayProtocol::Ws => RelayEndpointKind::Ws,
            RelayProtocol::Wss => RelayEndpointKind::Wss,
        };
        our_hints.push(Hint::new_relay(vec![RelayEndpoint {
            kind,
            hostname: relay_url.host.clone(),
            port: relay_url.port,
            priority: 2.0,
        }]));
    }

    Ok(TransitConnector {
        key,
        listener,
        relay_conn,
        our_msg: TransitMsg {
            abilities_v1: Ability::all_abilities(),
            hints_v1: our_hints,
        },
    })
}

/// Enumerate the local addresses worth advertising. Loopback would only ever
/// tell the peer to talk to itself, so it is dropped here.
pub(crate) fn non_loopback_addresses() -> Vec<std::net::IpAddr> {
    match if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces
            .iter()
            .filter(|interface| !interface.is_loopback())
            .map(|interface| interface.ip())
            .filter(std::net::IpAddr::is_ipv4)
            .collect(),
        Err(error) => {
            warn!("Could not enumerate local interfaces: {}", error);
            Vec::new()
        },
    }
}

/**
 * A partially set up transit connection.
 *
 * Each side generates a [`TransitMsg`] with all the hints to find it. You need
 * to exchange it (as in: send yours, receive theirs) with the other side,
 * through the mailbox or whatever else carries your setup messages.
 */
pub struct TransitConnector {
    key: Arc<Key<TransitKey>>,
    listener: Option<TcpListener>,
    relay_conn: Option<Box<dyn TransitTransport>>,
    our_msg: TransitMsg,
}

impl TransitConnector {
    /** Send this one to the other side */
    pub fn our_transit_msg(&self) -> &TransitMsg {
        &self.our_msg
    }

    /// The local port we accept direct connections on, if we listen at all.
    pub fn listening_port(&self) -> Option<u16> {
        self.listener
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
            .map(|addr| addr.port())
    }

    /**
     * Connect to the other side.
     *
     * Every hint of the peer is dialed concurrently, while inbound
     * connections are accepted on the listener and the relay slot. The first
     * candidate to complete the handshake wins and becomes the record pipe;
     * as sender we confirm it with `go` and dismiss every other completed
     * candidate with `nevermind`.
     */
    pub async fn connect(
        mut self,
        role: Role,
        their_msg: TransitMsg,
        timeout: Duration,
    ) -> Result<(Transit, TransitInfo), TransitConnectError> {
        let (ready_tx, ready_rx) = async_channel::unbounded::<TransitConnection>();
        /* Dropping this cancels everything still in flight */
        let (cancel_tx, cancel_rx) = async_channel::bounded::<()>(1);

        let mut candidates = 0;
        for hint in &their_msg.hints_v1 {
            match hint {
                Hint::DirectTcpV1(hint) => {
                    candidates += 1;
                    let hint = hint.clone();
                    let key = self.key.clone();
                    let ready_tx = ready_tx.clone();
                    let cancel_rx = cancel_rx.clone();
                    async_std::task::spawn(async move {
                        let addr = hint.to_string();
                        let attempt = async {
                            let (mut socket, info) = transport::connect_direct(&hint).await?;
                            crypto::handshake_exchange(&mut socket, role, &key).await?;
                            Ok((socket, info))
                        };
                        run_candidate(attempt, role, ready_tx, cancel_rx, addr).await;
                    });
                },
                Hint::RelayV1(relay) => {
                    for endpoint in relay.hints.clone() {
                        candidates += 1;
                        let key = self.key.clone();
                        let ready_tx = ready_tx.clone();
                        let cancel_rx = cancel_rx.clone();
                        async_std::task::spawn(async move {
                            let addr = endpoint.to_string();
                            let attempt = async {
                                let (mut socket, info) =
                                    transport::connect_relay_endpoint(&endpoint).await?;
                                crypto::relay_handshake(&mut socket, &key).await?;
                                crypto::handshake_exchange(&mut socket, role, &key).await?;
                                Ok((socket, info))
                            };
                            run_candidate(attempt, role, ready_tx, cancel_rx, addr).await;
                        });
                    }
                },
            }
        }

        let has_listener = self.listener.is_some() || self.relay_conn.is_some();
        ensure!(
            candidates > 0 || has_listener,
            TransitConnectError::NoRoute
        );
        debug!(
            "Racing {} candidate(s){}",
            candidates,
            if has_listener { " plus inbound" } else { "" }
        );

        if let Some(listener) = self.listener.take() {
            let key = self.key.clone();
            let ready_tx = ready_tx.clone();
            let cancel_rx = cancel_rx.clone();
            async_std::task::spawn(async move {
                let mut incoming = listener.incoming().fuse();
                loop {
                    select_biased! {
                        socket = incoming.next() => match socket {
                            Some(Ok(socket)) => {
                                debug!("Inbound connection from {:?}", socket.peer_addr().ok());
                                let key = key.clone();
                                let ready_tx = ready_tx.clone();
                                let cancel_rx = cancel_rx.clone();
                                async_std::task::spawn(async move {
                                    let attempt = async {
                                        let (mut socket, info) = transport::wrap_tcp_connection(
                                            socket,
                                            ConnectionType::Direct,
                                        )?;
                                        crypto::handshake_exchange(&mut socket, role, &key).await?;
                                        Ok((socket, info))
                                    };
                                    run_candidate(attempt, role, ready_tx, cancel_rx, "inbound".into())
                                        .await;
                                });
                            },
                            Some(Err(error)) => {
                                debug!("Accepting inbound connections failed: {}", error);
                                break;
                            },
                            None => break,
                        },
                        _ = cancel_rx.recv().fuse() => break,
                    }
                }
            });
        }

        if let Some(mut relay_conn) = self.relay_conn.take() {
            let key = self.key.clone();
            let ready_tx = ready_tx.clone();
            let cancel_rx = cancel_rx.clone();
            async_std::task::spawn(async move {
                let attempt = async {
                    /* The relay sends `ok` on our registration from init once a peer shows up */
                    relay_conn.read_expect(b"ok\n").await.map_err(|_| {
                        TransitHandshakeError::RelayHandshakeFailed
                    })?;
                    crypto::handshake_exchange(&mut relay_conn, role, &key).await?;
                    let info = TransitInfo {
                        conn_type: ConnectionType::Relay,
                        peer_addr: None,
                    };
                    Ok((relay_conn, info))
                };
                run_candidate(attempt, role, ready_tx, cancel_rx, "relay slot".into()).await;
            });
        }

        /* Only the candidate tasks may hold senders now, so that the channel
         * closing doubles as the all-failed signal. */
        drop(ready_tx);

        let (mut socket, info) = match util::timeout(timeout, ready_rx.recv()).await {
            Ok(Ok(connection)) => connection,
            Ok(Err(_closed)) => {
                debug!("Every candidate failed, no connection to be had");
                return Err(TransitConnectError::NoRoute);
            },
            Err(_timeout) => return Err(TransitConnectError::Timeout),
        };

        /* We have a winner. Late arrivals get dismissed. */
        ready_rx.close();
        while let Ok((loser, _info)) = ready_rx.try_recv() {
            async_std::task::spawn(reject_loser(loser, role));
        }
        drop(cancel_tx);

        if role == Role::Sender {
            debug!("Sending 'go' to the winning connection ({:?})", info.conn_type);
            socket.write_all(b"go\n").await?;
            socket.flush().await?;
        }

        let (skey, rkey) = crypto::record_keys(&self.key, role);
        Ok((
            Transit {
                socket,
                encryptor: RecordEncryptor::new(skey),
                decryptor: RecordDecryptor::new(rkey),
            },
            info,
        ))
    }

    /// Tear down the listener and the relay slot without connecting.
    pub fn close(self) {
        /* Dropping the listener and the relay connection closes them */
    }
}

/// Drive one candidate to its conclusion: deliver the connection when the
/// handshake succeeds, swallow the failure when it does not.
async fn run_candidate(
    attempt: impl Future<Output = Result<TransitConnection, TransitHandshakeError>>,
    role: Role,
    ready_tx: async_channel::Sender<TransitConnection>,
    cancel_rx: async_channel::Receiver<()>,
    addr: String,
) {
    let attempt = attempt.fuse();
    futures::pin_mut!(attempt);

    let result = select_biased! {
        result = attempt => result,
        _ = cancel_rx.recv().fuse() => return,
    };

    match result {
        Ok(connection) => match ready_tx.send(connection).await {
            Ok(()) => trace!("Candidate {} completed the handshake", addr),
            /* Somebody else won while we were getting ready */
            Err(async_channel::SendError(connection)) => reject_loser(connection.0, role).await,
        },
        Err(error) => debug!("Connection attempt to {} failed: {}", addr, error),
    }
}

/// A completed candidate that lost the race. The peer sits waiting for a
/// verdict on it, so as sender we owe it a `nevermind` before hanging up.
async fn reject_loser(mut socket: Box<dyn TransitTransport>, role: Role) {
    if role == Role::Sender {
        let _ = socket.write_all(b"nevermind\n").await;
        let _ = socket.flush().await;
    }
    /* Dropping the socket closes it */
}

/**
 * An established transit connection.
 *
 * The raw stream is not exposed; everything goes through the encrypted record
 * pipe, one authenticated record at a time.
 */
pub struct Transit {
    socket: Box<dyn TransitTransport>,
    encryptor: RecordEncryptor,
    decryptor: RecordDecryptor,
}

impl Transit {
    /** Send an encrypted record to the other side */
    pub async fn send_record(&mut self, plaintext: &[u8]) -> Result<(), TransitError> {
        trace!("Sending record of {} bytes", plaintext.len());
        self.encryptor.encrypt_to(&mut self.socket, plaintext).await
    }

    /** Receive and decrypt one record from the other side. */
    pub async fn receive_record(&mut self) -> Result<Box<[u8]>, TransitError> {
        self.decryptor.decrypt_from(&mut self.socket).await
    }

    pub async fn flush(&mut self) -> Result<(), TransitError> {
        self.socket.flush().await.map_err(Into::into)
    }

    pub async fn close(mut self) -> Result<(), TransitError> {
        self.socket.close().await.map_err(Into::into)
    }

    /** Split the connection into two halves, one per direction. */
    pub fn split(self) -> (TransitTx, TransitRx) {
        use futures::io::AsyncReadExt;
        let (reader, writer) = self.socket.split();
        (
            TransitTx {
                socket: writer,
                encryptor: self.encryptor,
            },
            TransitRx {
                socket: reader,
                decryptor: self.decryptor,
            },
        )
    }
}

/// The sending half of a [`Transit`] connection after a [`Transit::split`]
pub struct TransitTx {
    socket: futures::io::WriteHalf<Box<dyn TransitTransport>>,
    encryptor: RecordEncryptor,
}

impl TransitTx {
    pub async fn send_record(&mut self, plaintext: &[u8]) -> Result<(), TransitError> {
        trace!("Sending record of {} bytes", plaintext.len());
        self.encryptor.encrypt_to(&mut self.socket, plaintext).await
    }

    pub async fn flush(&mut self) -> Result<(), TransitError> {
        self.socket.flush().await.map_err(Into::into)
    }
}

/// The receiving half of a [`Transit`] connection after a [`Transit::split`]
pub struct TransitRx {
    socket: futures::io::ReadHalf<Box<dyn TransitTransport>>,
    decryptor: RecordDecryptor,
}

impl TransitRx {
    pub async fn receive_record(&mut self) -> Result<Box<[u8]>, TransitError> {
        self.decryptor.decrypt_from(&mut self.socket).await
    }
}
