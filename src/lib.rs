#![forbid(unsafe_code)]
//! Get things from one computer to another, safely — the transit core.
//!
//! This crate implements the connection-establishment and payload-transfer
//! half of a magic-wormhole compatible endpoint. Given a symmetric transit key
//! from some out-of-band key agreement (usually a PAKE over a mailbox server)
//! and a way to exchange setup messages with the peer (the [`Mailbox`] trait),
//! it negotiates a direct or relayed encrypted connection and moves a file or
//! text message across it:
//!
//! - [`transit`] finds a common connection: every advertised candidate is
//!   dialed while inbound connections are accepted, the first completed
//!   handshake wins, and the result is an authenticated, encrypted record
//!   pipe.
//! - [`transfer`] speaks the offer/answer protocol on top: file metadata,
//!   accept/reject decisions, progress, streaming, and the final checksum
//!   acknowledgement.
//!
//! The mailbox wire protocol, the PAKE, and any user interface are
//! deliberately not part of this crate; they are reached only through the
//! interfaces defined here.

#[macro_use]
mod util;

pub mod key;
pub mod transfer;
pub mod transit;

use async_trait::async_trait;
use serde_derive::{Deserialize, Serialize};
use std::borrow::Cow;

pub use key::{GenericKey, Key, KeyPurpose, TransitKey};
pub use util::DisplayBytes;

/// The app id of the original file transfer protocol. Only endpoints using the
/// same id (and thus this protocol) can talk to each other.
pub const DEFAULT_APP_ID: &str = "lothar.com/wormhole/text-or-file-xfer";

/// URL of a default hosted mailbox server.
pub const DEFAULT_RENDEZVOUS_URL: &str = "ws://relay.magic-wormhole.io:4000/v1";

/// Number of words in a generated wormhole code.
pub const DEFAULT_PASSPHRASE_COMPONENT_LENGTH: usize = 2;

/**
 * Wormhole application ID
 *
 * Together with the mailbox server URL, this defines a distinct protocol
 * namespace. The transit core does not interpret it; it is carried for the
 * mailbox collaborator.
 */
#[derive(PartialEq, Eq, Clone, Debug, Deserialize, Serialize, derive_more::Display)]
#[serde(transparent)]
#[display(fmt = "{}", _0)]
pub struct AppID(pub Cow<'static, str>);

impl AppID {
    pub fn new(id: impl Into<Cow<'static, str>>) -> Self {
        AppID(id.into())
    }
}

impl From<String> for AppID {
    fn from(s: String) -> Self {
        AppID(s.into())
    }
}

/**
 * The immutable settings of an endpoint.
 *
 * `id`, `rendezvous_url` and `passphrase_component_length` belong to the
 * mailbox and code layers and are only carried here so that a host application
 * has one place for its configuration. The transit core itself reads
 * `transit_relay_url` and `disable_listener`.
 */
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Identifier passed to the mailbox collaborator.
    pub id: AppID,
    /// Mailbox server to meet at before transit starts.
    pub rendezvous_url: Cow<'static, str>,
    /// The transit relay both sides may fall back to.
    pub transit_relay_url: transit::RelayUrl,
    /// Number of words in a generated code.
    pub passphrase_component_length: usize,
    /// Relay-only mode: never bind a local listener.
    pub disable_listener: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            id: AppID(Cow::Borrowed(DEFAULT_APP_ID)),
            rendezvous_url: Cow::Borrowed(DEFAULT_RENDEZVOUS_URL),
            transit_relay_url: transit::DEFAULT_RELAY_SERVER
                .parse()
                .expect("the default relay URL parses"),
            passphrase_component_length: DEFAULT_PASSPHRASE_COMPONENT_LENGTH,
            disable_listener: false,
        }
    }
}

/// Errors a [`Mailbox`] implementation may report.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum MailboxError {
    #[error("The mailbox connection is closed")]
    Closed,
    #[error("Mailbox protocol error: {}", _0)]
    Protocol(Box<str>),
    #[error("IO error")]
    IO(
        #[from]
        #[source]
        std::io::Error,
    ),
}

/**
 * The secure setup channel to the peer.
 *
 * This is where the offer/answer dialogue and the transit hints travel before
 * the direct connection exists, usually an encrypted mailbox on a rendezvous
 * server. The transfer protocol only ever sends and receives whole messages
 * (JSON documents) over it; encryption, framing and reconnection are the
 * implementation's business.
 */
#[async_trait]
pub trait Mailbox: Send {
    /// Deliver one message to the peer.
    async fn send(&mut self, message: Vec<u8>) -> Result<(), MailboxError>;

    /// Wait for the next message from the peer.
    async fn receive(&mut self) -> Result<Vec<u8>, MailboxError>;

    /// Close the channel. Pending messages may still be delivered.
    async fn close(&mut self) -> Result<(), MailboxError>;
}
