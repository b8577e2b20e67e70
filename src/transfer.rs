//! Client-to-client protocol to organize file transfers
//!
//! This gives you the actual capability to transfer files, that feature that
//! the magic wormhole protocol got known and loved for.
//!
//! At its core, [`PeerMessage`s](PeerMessage) are exchanged over an
//! established mailbox connection with the other side. They are used to set up
//! a [transit] portal and to exchange a file offer/accept. Then, the file is
//! transmitted over the transit channel, chunk by encrypted chunk, and
//! confirmed with a checksum at the end.

use futures::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    Future,
};
use log::*;
use sha2::{digest::FixedOutput, Digest, Sha256};

use crate::{
    key::{Key, TransitKey},
    transit::{self, Role, Transit, TransitConnectError, TransitError, TransitInfo},
    util::DisplayBytes,
    AppConfig, Mailbox, MailboxError,
};

pub mod cancel;
mod messages;

pub use cancel::{cancellable, Cancelled};
pub use messages::{AnswerMessage, OfferMessage, PeerMessage, TransferType, TransitAck};

/// What a rejecting receiver tells the sender.
pub(crate) const REJECT_MESSAGE: &str = "transfer rejected";
/// What a cancelling side tells its peer over the mailbox.
pub(crate) const CANCEL_MESSAGE: &str = "transfer cancelled";

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TransferError {
    #[error("Transfer was not acknowledged by peer")]
    AckError,
    #[error("Receive checksum error")]
    Checksum,
    #[error("The file contained a different amount of bytes than advertized! Sent {} bytes, but should have been {}", sent_size, file_size)]
    FileSize { sent_size: u64, file_size: u64 },
    #[error("The peer rejected the transfer")]
    Rejected,
    #[error("The transfer was cancelled")]
    Cancelled,
    #[error("Unsupported offer type")]
    UnsupportedOffer,
    #[error("Something went wrong on the other side: {}", _0)]
    PeerError(String),

    /// Some deserialization went wrong, we probably got some garbage
    #[error("Corrupt JSON message received")]
    ProtocolJson(
        #[from]
        #[source]
        serde_json::Error,
    ),
    /// A generic string message for "something went wrong", i.e.
    /// the peer sent some unexpected message order
    #[error("Protocol error: {}", _0)]
    Protocol(Box<str>),
    #[error(
        "Unexpected message (protocol error): Expected '{}', but got: '{}'",
        _0,
        _1
    )]
    ProtocolUnexpectedMessage(Box<str>, Box<str>),
    #[error("Mailbox connection error")]
    Mailbox(
        #[from]
        #[source]
        MailboxError,
    ),
    #[error("Error while establishing transit connection")]
    TransitConnect(
        #[from]
        #[source]
        TransitConnectError,
    ),
    #[error("Transit error")]
    Transit(
        #[from]
        #[source]
        TransitError,
    ),
    #[error("IO error")]
    IO(
        #[from]
        #[source]
        std::io::Error,
    ),
}

impl TransferError {
    pub(self) fn unexpected_message(
        expected: impl Into<Box<str>>,
        got: impl std::fmt::Display,
    ) -> Self {
        Self::ProtocolUnexpectedMessage(expected.into(), got.to_string().into())
    }
}

/// Classify an error string the peer sent us over the mailbox.
fn peer_error(message: String) -> TransferError {
    match message.as_str() {
        REJECT_MESSAGE => TransferError::Rejected,
        CANCEL_MESSAGE => TransferError::Cancelled,
        _ => TransferError::PeerError(message),
    }
}

async fn send_peer_message<M: Mailbox>(
    mailbox: &mut M,
    message: &PeerMessage,
) -> Result<(), TransferError> {
    debug!("Sending peer message '{}'", message);
    mailbox.send(message.ser_json()).await.map_err(Into::into)
}

async fn receive_peer_message<M: Mailbox>(mailbox: &mut M) -> Result<PeerMessage, TransferError> {
    let data = mailbox.receive().await?;
    trace!("Received peer message {}", DisplayBytes(&data));
    serde_json::from_slice(&data).map_err(|error| {
        error!(
            "Received invalid data from peer: '{}'",
            String::from_utf8_lossy(&data)
        );
        error.into()
    })
}

/**
 * Send a text message to the other side
 *
 * Text goes over the mailbox alone; no transit channel is opened for it. The
 * progress handler, if any, fires exactly once when the peer acknowledged the
 * message.
 */
pub async fn send_text<M: Mailbox>(
    mailbox: &mut M,
    text: impl Into<String>,
    mut progress_handler: impl FnMut(u64, u64) + 'static,
) -> Result<(), TransferError> {
    let text = text.into();
    let length = text.len() as u64;

    send_peer_message(mailbox, &PeerMessage::offer_message(&*text)).await?;

    match receive_peer_message(mailbox).await? {
        PeerMessage::Answer(AnswerMessage::MessageAck(msg)) => {
            ensure!(msg == "ok", TransferError::AckError);
        },
        PeerMessage::Error(error) => bail!(peer_error(error)),
        other => bail!(TransferError::unexpected_message("answer/message_ack", other)),
    }

    progress_handler(length, length);
    debug!("Text transfer complete");
    Ok(())
}

/**
 * Send a file to the other side
 *
 * You must ensure that the reader contains exactly as many bytes as advertized
 * in `file_size`.
 */
#[allow(clippy::too_many_arguments)]
pub async fn send_file<M, F, G, H>(
    mailbox: &mut M,
    config: &AppConfig,
    transit_key: Key<TransitKey>,
    file: &mut F,
    file_name: impl Into<String>,
    file_size: u64,
    transit_handler: G,
    mut progress_handler: H,
    cancel: impl Future<Output = ()>,
) -> Result<(), TransferError>
where
    M: Mailbox,
    F: AsyncRead + Unpin + Send,
    G: FnOnce(TransitInfo),
    H: FnMut(u64, u64) + 'static,
{
    let file_name = file_name.into();
    let run = Box::pin(async {
        let connector = transit::init(
            transit_key,
            &config.transit_relay_url,
            config.disable_listener,
        )
        .await?;

        debug!("Sending transit message '{:?}'", connector.our_transit_msg());
        send_peer_message(
            mailbox,
            &PeerMessage::transit(connector.our_transit_msg().clone()),
        )
        .await?;

        /* Wait for their transit message */
        let their_transit = match receive_peer_message(mailbox).await? {
            PeerMessage::Transit(transit) => {
                debug!("Received transit message: {:?}", transit);
                transit
            },
            PeerMessage::Error(error) => bail!(peer_error(error)),
            other => bail!(TransferError::unexpected_message("transit", other)),
        };

        debug!("Sending file offer");
        send_peer_message(mailbox, &PeerMessage::offer_file(file_name, file_size)).await?;

        /* Wait for file_ack */
        match receive_peer_message(mailbox).await? {
            PeerMessage::Answer(AnswerMessage::FileAck(msg)) => {
                ensure!(msg == "ok", TransferError::AckError);
            },
            PeerMessage::Error(error) => bail!(peer_error(error)),
            other => bail!(TransferError::unexpected_message("answer/file_ack", other)),
        }

        let (mut transit, info) = connector
            .connect(Role::Sender, their_transit, transit::DEFAULT_CONNECT_TIMEOUT)
            .await?;
        debug!("Beginning file transfer via {:?}", info.conn_type);
        transit_handler(info);

        /* Send the file as encrypted records */
        let checksum = send_records(&mut transit, file, file_size, &mut progress_handler).await?;

        /* Wait for the transit ack with sha256 sum from the peer */
        debug!("Sent file. Waiting for ack");
        let transit_ack = transit.receive_record().await?;
        let transit_ack_msg = serde_json::from_slice::<TransitAck>(&transit_ack)?;
        ensure!(transit_ack_msg.ack == "ok", TransferError::AckError);
        ensure!(
            transit_ack_msg.sha256 == hex::encode(checksum),
            TransferError::Checksum
        );
        debug!("Transfer complete!");

        Ok(())
    });

    let result = cancellable(run, cancel).await;
    cancel::handle_run_result(mailbox, result).await
}

/**
 * Wait for a file offer from the other side
 *
 * Waits for the peer's transit message and offer, answers the transit part and
 * hands the decision about the offer back to you. Text messages are
 * acknowledged inline and returned directly; for files you get a
 * [`ReceiveRequest`] to [`accept`](ReceiveRequest::accept),
 * [`reject`](ReceiveRequest::reject) or [`cancel`](ReceiveRequest::cancel).
 */
pub async fn request<'a, M: Mailbox>(
    mailbox: &'a mut M,
    config: &AppConfig,
    transit_key: Key<TransitKey>,
) -> Result<Received<'a, M>, TransferError> {
    let mut connector = None;
    let mut their_transit = None;
    let mut offer = None;

    loop {
        match receive_peer_message(mailbox).await? {
            PeerMessage::Transit(msg) => {
                debug!("Received transit message: {:?}", msg);
                /* A file is coming; set up our side of the transit and answer in kind */
                let c = transit::init(
                    transit_key.clone(),
                    &config.transit_relay_url,
                    config.disable_listener,
                )
                .await?;
                send_peer_message(mailbox, &PeerMessage::transit(c.our_transit_msg().clone()))
                    .await?;
                their_transit = Some(msg);
                connector = Some(c);
            },
            PeerMessage::Offer(OfferMessage::Message(text)) => {
                debug!("Received text offer");
                send_peer_message(mailbox, &PeerMessage::message_ack("ok")).await?;
                return Ok(Received::Text(text));
            },
            PeerMessage::Offer(OfferMessage::File { filename, filesize }) => {
                debug!("Received file offer: {} ({} bytes)", filename, filesize);
                offer = Some((filename, filesize));
            },
            PeerMessage::Offer(unsupported) => {
                let kind = unsupported.transfer_type();
                send_peer_message(
                    mailbox,
                    &PeerMessage::error_message(format!("cannot receive a {} offer", kind)),
                )
                .await?;
                bail!(TransferError::UnsupportedOffer);
            },
            PeerMessage::Error(error) => bail!(peer_error(error)),
            other => bail!(TransferError::unexpected_message("transit or offer", other)),
        }

        /* Transit and offer may arrive in either order; wait until we have both */
        if connector.is_some() && offer.is_some() {
            let (filename, filesize) = offer.unwrap();
            return Ok(Received::File(ReceiveRequest {
                mailbox,
                connector: connector.unwrap(),
                their_transit: their_transit.unwrap(),
                filename,
                filesize,
            }));
        }
    }
}

/// What the peer sent us: either the text payload itself, or a file offer that
/// still needs a decision.
pub enum Received<'a, M: Mailbox> {
    Text(String),
    File(ReceiveRequest<'a, M>),
}

/**
 * A pending file send offer from the other side
 *
 * You *should* consume this object, either by calling [`accept`](ReceiveRequest::accept)
 * or [`reject`](ReceiveRequest::reject).
 */
#[must_use]
pub struct ReceiveRequest<'a, M: Mailbox> {
    mailbox: &'a mut M,
    connector: transit::TransitConnector,
    their_transit: transit::TransitMsg,
    /// The name the sender suggests for the file
    pub filename: String,
    /// The announced size in bytes
    pub filesize: u64,
}

impl<'a, M: Mailbox> ReceiveRequest<'a, M> {
    /**
     * Accept the offer and start the transfer
     *
     * The content is streamed into `content_handler` as it arrives; the
     * transfer concludes with our checksum record confirming the payload.
     */
    pub async fn accept<W, G, H>(
        self,
        transit_handler: G,
        mut progress_handler: H,
        content_handler: &mut W,
        cancel: impl Future<Output = ()>,
    ) -> Result<(), TransferError>
    where
        W: AsyncWrite + Unpin + Send,
        G: FnOnce(TransitInfo),
        H: FnMut(u64, u64) + 'static,
    {
        let Self {
            mailbox,
            connector,
            their_transit,
            filename: _,
            filesize,
        } = self;

        let run = Box::pin(async {
            send_peer_message(mailbox, &PeerMessage::file_ack("ok")).await?;

            let (mut transit, info) = connector
                .connect(
                    Role::Receiver,
                    their_transit,
                    transit::DEFAULT_CONNECT_TIMEOUT,
                )
                .await?;
            debug!("Beginning file transfer via {:?}", info.conn_type);
            transit_handler(info);

            let checksum =
                receive_records(&mut transit, filesize, &mut progress_handler, content_handler)
                    .await?;

            let sha256sum = hex::encode(checksum.as_slice());
            debug!("File received, sending checksum {}", sha256sum);
            transit
                .send_record(&TransitAck::new("ok", sha256sum).serialize_vec())
                .await?;
            debug!("Transfer complete");

            Ok(())
        });

        let result = cancellable(run, cancel).await;
        cancel::handle_run_result(mailbox, result).await
    }

    /**
     * Reject the file offer
     *
     * This will send an error message to the other side so that it knows the
     * transfer failed.
     */
    pub async fn reject(self) -> Result<(), TransferError> {
        send_peer_message(self.mailbox, &PeerMessage::error_message(REJECT_MESSAGE)).await?;
        Ok(())
    }

    /** Walk away before even answering; the peer is told why. */
    pub async fn cancel(self) -> Result<(), TransferError> {
        send_peer_message(self.mailbox, &PeerMessage::error_message(CANCEL_MESSAGE)).await?;
        Ok(())
    }
}

/// A decision of the host about a pending offer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Download,
    Reject,
    Cancel,
}

/// How a driven receive session ended.
#[derive(Debug)]
pub enum ReceiveOutcome {
    Text(String),
    File { filename: String, size: u64 },
    Rejected,
}

/**
 * Receive whatever the peer offers, driven by a command stream
 *
 * This is the channel-oriented face of [`request`]: the host pushes
 * [`Command`]s (first come, first served) and this function runs the session
 * to completion. A `Cancel` sent while the transfer is running closes the
 * transit connection; the sender will notice. Text offers need no command at
 * all. A command channel that was dropped after the session ended is fine.
 */
pub async fn receive<M, W, H>(
    mailbox: &mut M,
    config: &AppConfig,
    transit_key: Key<TransitKey>,
    commands: async_channel::Receiver<Command>,
    content_handler: &mut W,
    progress_handler: H,
) -> Result<ReceiveOutcome, TransferError>
where
    M: Mailbox,
    W: AsyncWrite + Unpin + Send,
    H: FnMut(u64, u64) + 'static,
{
    match request(mailbox, config, transit_key).await? {
        Received::Text(text) => Ok(ReceiveOutcome::Text(text)),
        Received::File(request) => {
            let filename = request.filename.clone();
            let size = request.filesize;

            match commands.recv().await {
                Ok(Command::Download) => {
                    let cancel = drain_until_cancel(commands);
                    request
                        .accept(|_info| (), progress_handler, content_handler, cancel)
                        .await?;
                    Ok(ReceiveOutcome::File { filename, size })
                },
                Ok(Command::Reject) => {
                    request.reject().await?;
                    Ok(ReceiveOutcome::Rejected)
                },
                Ok(Command::Cancel) | Err(_) => {
                    /* The host is gone or wants out before we answered */
                    request.cancel().await?;
                    Err(TransferError::Cancelled)
                },
            }
        },
    }
}

/// Resolve once a `Cancel` command arrives. A closed channel means the host
/// went away without cancelling, which is not a reason to stop.
async fn drain_until_cancel(commands: async_channel::Receiver<Command>) {
    loop {
        match commands.recv().await {
            Ok(Command::Cancel) => break,
            Ok(_) => continue,
            Err(_) => futures::future::pending::<()>().await,
        }
    }
}

/// Encrypt and send the file to the transit stream, returning the sha256 sum
/// of the plaintext.
pub(crate) async fn send_records<F, H>(
    transit: &mut Transit,
    file: &mut F,
    file_size: u64,
    progress_handler: &mut H,
) -> Result<Vec<u8>, TransferError>
where
    F: AsyncRead + Unpin + Send,
    H: FnMut(u64, u64),
{
    /* Report at 0 to allow clients to configure as necessary */
    progress_handler(0, file_size);

    let mut hasher = Sha256::default();

    /* Chunk size is a wire-invisible implementation detail */
    let mut plaintext = Box::new([0u8; 4096]);
    let mut sent_size = 0;
    loop {
        let n = file.read(&mut plaintext[..]).await?;
        if n == 0 {
            break;
        }

        transit.send_record(&plaintext[..n]).await?;
        sent_size += n as u64;
        progress_handler(sent_size, file_size);

        hasher.update(&plaintext[..n]);
    }
    transit.flush().await?;

    ensure!(
        sent_size == file_size,
        TransferError::FileSize {
            sent_size,
            file_size
        }
    );

    Ok(hasher.finalize_fixed().to_vec())
}

/// Receive the exact number of announced bytes as records, hashing as they
/// arrive. A sender that overshoots is a protocol violation, one that hangs up
/// early surfaces as an unexpected EOF from the record layer.
pub(crate) async fn receive_records<W, H>(
    transit: &mut Transit,
    filesize: u64,
    progress_handler: &mut H,
    content_handler: &mut W,
) -> Result<Vec<u8>, TransferError>
where
    W: AsyncWrite + Unpin,
    H: FnMut(u64, u64),
{
    let mut hasher = Sha256::default();
    let mut remaining = filesize;

    progress_handler(0, filesize);

    while remaining > 0 {
        let plaintext = transit.receive_record().await?;
        ensure!(
            plaintext.len() as u64 <= remaining,
            TransferError::Protocol("Peer sent more bytes than it announced".into())
        );

        content_handler.write_all(&plaintext).await?;
        hasher.update(&plaintext);

        remaining -= plaintext.len() as u64;
        progress_handler(filesize - remaining, filesize);
    }
    content_handler.flush().await?;

    Ok(hasher.finalize_fixed().to_vec())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::transit::RelayUrl;
    use async_trait::async_trait;
    use futures::io::Cursor;
    use std::sync::{Arc, Mutex};

    /// An in-memory mailbox: two of them connected back to back form the
    /// message channel that a real rendezvous server would provide.
    struct ChannelMailbox {
        tx: async_channel::Sender<Vec<u8>>,
        rx: async_channel::Receiver<Vec<u8>>,
    }

    #[async_trait]
    impl Mailbox for ChannelMailbox {
        async fn send(&mut self, message: Vec<u8>) -> Result<(), MailboxError> {
            self.tx
                .send(message)
                .await
                .map_err(|_| MailboxError::Closed)
        }

        async fn receive(&mut self) -> Result<Vec<u8>, MailboxError> {
            self.rx.recv().await.map_err(|_| MailboxError::Closed)
        }

        async fn close(&mut self) -> Result<(), MailboxError> {
            self.tx.close();
            Ok(())
        }
    }

    fn mailbox_pair() -> (ChannelMailbox, ChannelMailbox) {
        let (tx_a, rx_a) = async_channel::unbounded();
        let (tx_b, rx_b) = async_channel::unbounded();
        (
            ChannelMailbox { tx: tx_a, rx: rx_b },
            ChannelMailbox { tx: tx_b, rx: rx_a },
        )
    }

    fn test_config() -> AppConfig {
        AppConfig {
            transit_relay_url: RelayUrl::null(),
            ..AppConfig::default()
        }
    }

    fn test_key() -> Key<TransitKey> {
        Key::new(
            hex::decode("588ba9eef353778b074413a0140205d90d7479e36e0dd4ee35bb729d26131ef1")
                .unwrap()
                .into_boxed_slice(),
        )
    }

    #[async_std::test]
    async fn test_text_echo() {
        let (mut sender_mailbox, mut receiver_mailbox) = mailbox_pair();
        let config = test_config();

        let progress = Arc::new(Mutex::new(Vec::new()));
        let progress2 = progress.clone();

        let sender = async_std::task::spawn(async move {
            send_text(&mut sender_mailbox, "hello", move |done, total| {
                progress2.lock().unwrap().push((done, total));
            })
            .await
        });

        match request(&mut receiver_mailbox, &config, test_key())
            .await
            .unwrap()
        {
            Received::Text(text) => assert_eq!(text, "hello"),
            Received::File(_) => panic!("expected a text message"),
        }

        sender.await.unwrap();
        assert_eq!(&*progress.lock().unwrap(), &[(5, 5)]);
    }

    #[async_std::test]
    async fn test_rejected_offer() {
        let (mut sender_mailbox, mut receiver_mailbox) = mailbox_pair();
        /* Force relay-less, listener-less connectors: rejection must happen
         * before any connection attempt anyway */
        let config = AppConfig {
            disable_listener: true,
            ..test_config()
        };
        let config2 = config.clone();

        let sender = async_std::task::spawn(async move {
            let mut payload = Cursor::new(vec![0u8; 64]);
            send_file(
                &mut sender_mailbox,
                &config2,
                test_key(),
                &mut payload,
                "unwanted.bin",
                64,
                |_info| panic!("must not connect for a rejected offer"),
                |_done, _total| {},
                futures::future::pending(),
            )
            .await
        });

        match request(&mut receiver_mailbox, &config, test_key())
            .await
            .unwrap()
        {
            Received::File(request) => {
                assert_eq!(request.filename, "unwanted.bin");
                assert_eq!(request.filesize, 64);
                request.reject().await.unwrap();
            },
            Received::Text(_) => panic!("expected a file offer"),
        }

        match sender.await {
            Err(TransferError::Rejected) => {},
            other => panic!("expected rejection, got {:?}", other.map(|_| ())),
        }
    }

    #[async_std::test]
    async fn test_command_reject() {
        let (mut sender_mailbox, mut receiver_mailbox) = mailbox_pair();
        let config = AppConfig {
            disable_listener: true,
            ..test_config()
        };
        let config2 = config.clone();

        let sender = async_std::task::spawn(async move {
            let mut payload = Cursor::new(vec![1u8; 16]);
            send_file(
                &mut sender_mailbox,
                &config2,
                test_key(),
                &mut payload,
                "nope.bin",
                16,
                |_info| {},
                |_done, _total| {},
                futures::future::pending(),
            )
            .await
        });

        let (commands_tx, commands_rx) = async_channel::unbounded();
        commands_tx.send(Command::Reject).await.unwrap();

        let mut content = Cursor::new(Vec::new());
        let outcome = receive(
            &mut receiver_mailbox,
            &config,
            test_key(),
            commands_rx,
            &mut content,
            |_done, _total| {},
        )
        .await
        .unwrap();

        assert!(matches!(outcome, ReceiveOutcome::Rejected));
        assert!(matches!(sender.await, Err(TransferError::Rejected)));
    }

    #[async_std::test]
    async fn test_sender_cancellation_notifies_peer() {
        let (mut sender_mailbox, peer_mailbox) = mailbox_pair();
        let config = test_config();

        /* The peer never responds, and we give up immediately */
        let result = send_file(
            &mut sender_mailbox,
            &config,
            test_key(),
            &mut Cursor::new(vec![0u8; 8]),
            "file.bin",
            8,
            |_info| {},
            |_done, _total| {},
            futures::future::ready(()),
        )
        .await;
        assert!(matches!(result, Err(TransferError::Cancelled)));

        /* Cancelling twice changes nothing */
        let result = send_file(
            &mut sender_mailbox,
            &config,
            test_key(),
            &mut Cursor::new(vec![0u8; 8]),
            "file.bin",
            8,
            |_info| {},
            |_done, _total| {},
            futures::future::ready(()),
        )
        .await;
        assert!(matches!(result, Err(TransferError::Cancelled)));

        /* The peer was told, both times */
        let mut errors = 0;
        while let Ok(raw) = peer_mailbox.rx.try_recv() {
            if let Ok(PeerMessage::Error(message)) = serde_json::from_slice(&raw) {
                assert_eq!(message, CANCEL_MESSAGE);
                errors += 1;
            }
        }
        assert_eq!(errors, 2);
    }

    #[async_std::test]
    async fn test_peer_cancellation_is_classified() {
        let (mut sender_mailbox, mut receiver_mailbox) = mailbox_pair();
        let config = test_config();

        let sender = async_std::task::spawn(async move {
            send_file(
                &mut sender_mailbox,
                &config,
                test_key(),
                &mut Cursor::new(vec![0u8; 8]),
                "file.bin",
                8,
                |_info| {},
                |_done, _total| {},
                futures::future::pending(),
            )
            .await
        });

        /* Scripted peer: answer the transit message, then bail out */
        let raw = receiver_mailbox.receive().await.unwrap();
        assert!(matches!(
            serde_json::from_slice(&raw).unwrap(),
            PeerMessage::Transit(_)
        ));
        send_peer_message(
            &mut receiver_mailbox,
            &PeerMessage::transit(crate::transit::TransitMsg {
                abilities_v1: crate::transit::Ability::all_abilities(),
                hints_v1: vec![],
            }),
        )
        .await
        .unwrap();
        let _offer = receiver_mailbox.receive().await.unwrap();
        send_peer_message(
            &mut receiver_mailbox,
            &PeerMessage::error_message(CANCEL_MESSAGE),
        )
        .await
        .unwrap();

        assert!(matches!(sender.await, Err(TransferError::Cancelled)));
    }

    #[async_std::test]
    async fn test_unsupported_directory_offer() {
        let (mut sender_mailbox, mut receiver_mailbox) = mailbox_pair();
        let config = AppConfig {
            disable_listener: true,
            ..test_config()
        };

        /* Scripted peer sends a directory offer */
        let scripted = async_std::task::spawn(async move {
            send_peer_message(
                &mut sender_mailbox,
                &PeerMessage::Offer(OfferMessage::Directory {
                    dirname: "stuff".into(),
                    mode: "zipped".into(),
                    zipsize: 10,
                    numbytes: 100,
                    numfiles: 2,
                }),
            )
            .await
            .unwrap();
            /* We get an error message back */
            let raw = sender_mailbox.receive().await.unwrap();
            let message: PeerMessage = serde_json::from_slice(&raw).unwrap();
            assert!(matches!(message, PeerMessage::Error(_)));
        });

        match request(&mut receiver_mailbox, &config, test_key()).await {
            Err(TransferError::UnsupportedOffer) => {},
            other => panic!("expected unsupported offer, got {:?}", other.is_ok()),
        }
        scripted.await;
    }

    async fn run_file_transfer(payload: Vec<u8>) {
        let (mut sender_mailbox, mut receiver_mailbox) = mailbox_pair();
        let config = test_config();
        let config2 = config.clone();
        let size = payload.len() as u64;
        let payload2 = payload.clone();

        let sender = async_std::task::spawn(async move {
            let mut reader = Cursor::new(payload2);
            send_file(
                &mut sender_mailbox,
                &config2,
                test_key(),
                &mut reader,
                "payload.bin",
                size,
                |info| debug!("Sender connected via {:?}", info.conn_type),
                |_done, _total| {},
                futures::future::pending(),
            )
            .await
        });

        let (commands_tx, commands_rx) = async_channel::unbounded();
        commands_tx.send(Command::Download).await.unwrap();

        let progress = Arc::new(Mutex::new(Vec::new()));
        let progress2 = progress.clone();
        let mut content = Cursor::new(Vec::new());
        let outcome = receive(
            &mut receiver_mailbox,
            &config,
            test_key(),
            commands_rx,
            &mut content,
            move |done, total| progress2.lock().unwrap().push((done, total)),
        )
        .await
        .unwrap();

        sender.await.unwrap();

        match outcome {
            ReceiveOutcome::File { filename, size: announced } => {
                assert_eq!(filename, "payload.bin");
                assert_eq!(announced, size);
            },
            other => panic!("expected a file outcome, got {:?}", other),
        }
        assert_eq!(content.into_inner(), payload);

        let progress = progress.lock().unwrap();
        assert_eq!(progress.first(), Some(&(0, size)));
        if size > 0 {
            assert_eq!(progress.last(), Some(&(size, size)));
        }
    }

    /// Full local end-to-end transfer. Direct connection only works when this
    /// machine has an address the peer process (here: task) can dial.
    #[async_std::test]
    async fn test_file_transfer_end_to_end() {
        if crate::transit::non_loopback_addresses().is_empty() {
            warn!("Skipping end-to-end transfer test: no non-loopback interface");
            return;
        }

        use rand::RngCore;
        let mut payload = vec![0u8; 1024];
        rand::thread_rng().fill_bytes(&mut payload);
        run_file_transfer(payload).await;
    }

    /// An empty file still does the full dance, with zero payload records and
    /// the well-known checksum of nothing at all.
    #[async_std::test]
    async fn test_empty_file_transfer() {
        if crate::transit::non_loopback_addresses().is_empty() {
            warn!("Skipping empty-file transfer test: no non-loopback interface");
            return;
        }

        run_file_transfer(Vec::new()).await;
    }

    #[test]
    fn test_empty_sha256_constant() {
        /* The ack for a zero-byte payload must carry this exact digest */
        let digest: [u8; 32] = Sha256::digest(b"").into();
        assert_eq!(
            hex::encode(digest),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_peer_error_classification() {
        assert!(matches!(
            peer_error(REJECT_MESSAGE.into()),
            TransferError::Rejected
        ));
        assert!(matches!(
            peer_error(CANCEL_MESSAGE.into()),
            TransferError::Cancelled
        ));
        assert!(matches!(
            peer_error("it broke".into()),
            TransferError::PeerError(_)
        ));
    }
}
