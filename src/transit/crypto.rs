//! Cryptographic backbone of the Transit protocol
//!
//! This handles the encrypted handshakes during connection setup, then provides
//! the nonce-sequenced record layer that will be used for all messages.

use super::{
    transport::{TransitTransport, TransitTransportRx, TransitTransportTx},
    Role, TransitError,
};
use crate::{
    key::{GenericKey, Key, TransitKey, TransitRxKey, TransitTxKey},
    util,
};
use crypto_secretbox as secretbox;
use futures::io::{AsyncReadExt, AsyncWriteExt};
use log::*;
use secretbox::aead::{Aead, KeyInit};

/// Length of a classic NaCl secretbox nonce
pub const NONCE_SIZE: usize = 24;

/// Private, because we try multiple handshakes and only
/// one needs to succeed
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub(super) enum TransitHandshakeError {
    #[error("Handshake failed")]
    HandshakeFailed,
    #[error("Relay handshake failed")]
    RelayHandshakeFailed,
    #[error("IO error")]
    IO(
        #[from]
        #[source]
        std::io::Error,
    ),
    #[error("WebSocket error")]
    Websocket(
        #[from]
        #[source]
        async_tungstenite::tungstenite::Error,
    ),
}

/// 8 random hex characters naming our end towards the relay. Fresh per attempt.
pub(super) fn generate_side() -> String {
    let x: [u8; 4] = rand::random();
    hex::encode(x)
}

pub(super) fn sender_handshake_header(key: &Key<TransitKey>) -> String {
    format!(
        "transit sender {} ready\n\n",
        key.derive_subkey_from_purpose::<GenericKey>("transit_sender")
            .to_hex()
    )
}

pub(super) fn receiver_handshake_header(key: &Key<TransitKey>) -> String {
    format!(
        "transit receiver {} ready\n\n",
        key.derive_subkey_from_purpose::<GenericKey>("transit_receiver")
            .to_hex()
    )
}

pub(super) fn relay_handshake_header(key: &Key<TransitKey>, side: &str) -> String {
    format!(
        "please relay {} for side {}\n",
        key.derive_subkey_from_purpose::<GenericKey>("transit_relay_token")
            .to_hex(),
        side
    )
}

/// Register on a relay connection and wait until the relay glued us to a peer.
pub(super) async fn relay_handshake(
    socket: &mut Box<dyn TransitTransport>,
    key: &Key<TransitKey>,
) -> Result<(), TransitHandshakeError> {
    let side = generate_side();
    trace!("initiating relay handshake, side {}", side);
    socket
        .write_all(relay_handshake_header(key, &side).as_bytes())
        .await?;
    socket.flush().await?;

    let mut rx = [0u8; 3];
    socket.read_exact(&mut rx).await?;
    ensure!(&rx == b"ok\n", TransitHandshakeError::RelayHandshakeFailed);
    Ok(())
}

/**
 * The role-bound half of the direct handshake.
 *
 * The receiver expects the sender's header before it reveals its own, and then
 * waits to be selected. The sender leads with its header and verifies the echo;
 * its "go"/"nevermind" verdict is written by the arbitration step, not here.
 */
pub(super) async fn handshake_exchange(
    socket: &mut Box<dyn TransitTransport>,
    role: Role,
    key: &Key<TransitKey>,
) -> Result<(), TransitHandshakeError> {
    match role {
        Role::Sender => {
            let header = sender_handshake_header(key);
            debug_assert_eq!(header.len(), 87);
            socket.write_all(header.as_bytes()).await?;
            socket.flush().await?;

            read_expect_constant_time(socket, receiver_handshake_header(key).as_bytes()).await?;
        },
        Role::Receiver => {
            read_expect_constant_time(socket, sender_handshake_header(key).as_bytes()).await?;

            let header = receiver_handshake_header(key);
            debug_assert_eq!(header.len(), 89);
            socket.write_all(header.as_bytes()).await?;
            socket.flush().await?;

            /* Wait for the peer to pick this connection over its siblings */
            let mut rx = [0u8; 3];
            socket.read_exact(&mut rx).await?;
            ensure!(&rx == b"go\n", TransitHandshakeError::HandshakeFailed);
        },
    }
    Ok(())
}

/// Like `read_expect`, but timing-safe. The headers embed key-derived material,
/// so the comparison must not leak how far it matched.
async fn read_expect_constant_time(
    socket: &mut Box<dyn TransitTransport>,
    expected: &[u8],
) -> Result<(), TransitHandshakeError> {
    use subtle::ConstantTimeEq;

    let mut buffer = vec![0u8; expected.len()];
    socket.read_exact(&mut buffer).await?;
    ensure!(
        bool::from(buffer.as_slice().ct_eq(expected)),
        TransitHandshakeError::HandshakeFailed
    );
    Ok(())
}

/// The record keys for a direction pair. The receiver uses the sender key for
/// receiving and its own key for sending.
pub(super) fn record_keys(
    key: &Key<TransitKey>,
    role: Role,
) -> (Key<TransitTxKey>, Key<TransitRxKey>) {
    match role {
        Role::Sender => (
            key.derive_subkey_from_purpose("transit_record_sender_key"),
            key.derive_subkey_from_purpose("transit_record_receiver_key"),
        ),
        Role::Receiver => (
            key.derive_subkey_from_purpose("transit_record_receiver_key"),
            key.derive_subkey_from_purpose("transit_record_sender_key"),
        ),
    }
}

/**
 * Sealing half of the record pipe.
 *
 * The nonce is a 64 bit counter in the low bytes of the 24 byte secretbox
 * nonce. Writes are sequential by `&mut`; interleaving would corrupt the
 * counter sequence.
 */
pub(super) struct RecordEncryptor {
    skey: Key<TransitTxKey>,
    snonce: u64,
}

impl RecordEncryptor {
    pub fn new(skey: Key<TransitTxKey>) -> Self {
        Self { skey, snonce: 0 }
    }

    pub async fn encrypt_to<W>(&mut self, socket: &mut W, plaintext: &[u8]) -> Result<(), TransitError>
    where
        W: TransitTransportTx,
    {
        assert!(
            self.snonce < u64::MAX,
            "Nonce exhaustion. What on earth did you do with this connection?"
        );

        let mut nonce = [0u8; NONCE_SIZE];
        nonce[NONCE_SIZE - 8..].copy_from_slice(&self.snonce.to_be_bytes());

        let cipher = secretbox::XSalsa20Poly1305::new(secretbox::Key::from_slice(&self.skey));
        let ciphertext = cipher
            .encrypt(secretbox::Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| TransitError::Crypto)?;

        /* The length prefix counts nonce and ciphertext, not itself */
        let mut record = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        record.extend_from_slice(&nonce);
        record.extend_from_slice(&ciphertext);
        assert!(
            record.len() < u32::MAX as usize,
            "Record too large: {} bytes",
            record.len()
        );

        socket.write_transit_message(&record).await?;
        socket.flush().await?;

        self.snonce += 1;

        Ok(())
    }
}

/// What took the receiving half down. Replayed to all later callers.
#[derive(Clone, Debug)]
enum Poison {
    Frame,
    Nonce {
        received: Box<[u8]>,
        expected: Box<[u8]>,
    },
    Crypto,
    IO(std::io::ErrorKind),
}

impl Poison {
    fn to_error(&self) -> TransitError {
        match self {
            Poison::Frame => TransitError::Frame,
            Poison::Nonce { received, expected } => {
                TransitError::Nonce(received.clone(), expected.clone())
            },
            Poison::Crypto => TransitError::Crypto,
            Poison::IO(kind) => TransitError::IO(std::io::Error::from(*kind)),
        }
    }
}

/**
 * Opening half of the record pipe.
 *
 * Tracks the expected nonce as a 24 byte big-endian counter; any deviation on
 * the wire is fatal and latches the half shut.
 */
pub(super) struct RecordDecryptor {
    rkey: Key<TransitRxKey>,
    rnonce: [u8; NONCE_SIZE],
    poison: Option<Poison>,
}

impl RecordDecryptor {
    pub fn new(rkey: Key<TransitRxKey>) -> Self {
        Self {
            rkey,
            rnonce: [0; NONCE_SIZE],
            poison: None,
        }
    }

    pub async fn decrypt_from<R>(&mut self, socket: &mut R) -> Result<Box<[u8]>, TransitError>
    where
        R: TransitTransportRx,
    {
        if let Some(poison) = &self.poison {
            return Err(poison.to_error());
        }

        let mut prefix = [0u8; 4 + NONCE_SIZE];
        if let Err(error) = socket.read_exact(&mut prefix).await {
            return Err(self.poison(Poison::IO(error.kind())));
        }

        let length = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        let received_nonce = &prefix[4..];

        /* The length covers the nonce, so anything not larger cannot frame a record */
        if length <= NONCE_SIZE {
            return Err(self.poison(Poison::Frame));
        }

        if received_nonce != &self.rnonce[..] {
            return Err(self.poison(Poison::Nonce {
                received: received_nonce.into(),
                expected: self.rnonce[..].into(),
            }));
        }

        let mut ciphertext = vec![0u8; length - NONCE_SIZE];
        if let Err(error) = socket.read_exact(&mut ciphertext).await {
            return Err(self.poison(Poison::IO(error.kind())));
        }

        let cipher = secretbox::XSalsa20Poly1305::new(secretbox::Key::from_slice(&self.rkey));
        let plaintext = match cipher.decrypt(
            secretbox::Nonce::from_slice(&self.rnonce),
            ciphertext.as_slice(),
        ) {
            Ok(plaintext) => plaintext,
            Err(_) => return Err(self.poison(Poison::Crypto)),
        };

        util::increment_be(&mut self.rnonce);

        Ok(plaintext.into_boxed_slice())
    }

    fn poison(&mut self, poison: Poison) -> TransitError {
        let error = poison.to_error();
        self.poison = Some(poison);
        error
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use futures::io::Cursor;

    fn test_key() -> Key<TransitKey> {
        Key::new(
            hex::decode("588ba9eef353778b074413a0140205d90d7479e36e0dd4ee35bb729d26131ef1")
                .unwrap()
                .into_boxed_slice(),
        )
    }

    #[test]
    fn test_handshake_headers() {
        let key = test_key();
        let sender = sender_handshake_header(&key);
        let receiver = receiver_handshake_header(&key);

        assert_eq!(sender.len(), 87);
        assert_eq!(receiver.len(), 89);
        assert!(sender.starts_with("transit sender "));
        assert!(sender.ends_with(" ready\n\n"));
        assert!(receiver.starts_with("transit receiver "));

        /* Headers are distinct functions of the key, stable across calls */
        assert_ne!(sender[15..79], receiver[17..81]);
        assert_eq!(sender, sender_handshake_header(&key));

        let other_key = Key::new(b"something completely different".to_vec().into_boxed_slice());
        assert_ne!(sender, sender_handshake_header(&other_key));
    }

    #[test]
    fn test_relay_handshake_header() {
        let key = test_key();
        let header = relay_handshake_header(&key, "abcdef12");
        assert!(header.starts_with("please relay "));
        assert!(header.ends_with(" for side abcdef12\n"));
        assert_eq!(generate_side().len(), 8);
    }

    #[async_std::test]
    async fn test_record_roundtrip() {
        let key = test_key();
        let (skey, _) = record_keys(&key, Role::Sender);
        let (_, rkey) = record_keys(&key, Role::Receiver);

        let mut encryptor = RecordEncryptor::new(skey);
        let mut wire = Cursor::new(Vec::new());
        encryptor.encrypt_to(&mut wire, b"hello").await.unwrap();
        encryptor.encrypt_to(&mut wire, b"world").await.unwrap();
        encryptor.encrypt_to(&mut wire, b"").await.unwrap();

        let mut decryptor = RecordDecryptor::new(rkey);
        let mut wire = Cursor::new(wire.into_inner());
        assert_eq!(&*decryptor.decrypt_from(&mut wire).await.unwrap(), b"hello");
        assert_eq!(&*decryptor.decrypt_from(&mut wire).await.unwrap(), b"world");
        assert_eq!(&*decryptor.decrypt_from(&mut wire).await.unwrap(), b"");
    }

    #[async_std::test]
    async fn test_record_key_pairing_mismatch() {
        /* Reading with the wrong direction key must fail, not yield garbage */
        let key = test_key();
        let (skey, rkey) = record_keys(&key, Role::Sender);

        let mut encryptor = RecordEncryptor::new(skey);
        let mut wire = Cursor::new(Vec::new());
        encryptor.encrypt_to(&mut wire, b"hello").await.unwrap();

        let mut decryptor = RecordDecryptor::new(rkey);
        let mut wire = Cursor::new(wire.into_inner());
        assert!(matches!(
            decryptor.decrypt_from(&mut wire).await,
            Err(TransitError::Crypto)
        ));
    }

    #[async_std::test]
    async fn test_record_out_of_order() {
        let key = test_key();
        let (skey, _) = record_keys(&key, Role::Sender);
        let (_, rkey) = record_keys(&key, Role::Receiver);

        let mut encryptor = RecordEncryptor::new(skey);
        let mut wire = Cursor::new(Vec::new());
        encryptor.encrypt_to(&mut wire, b"first").await.unwrap();
        encryptor.encrypt_to(&mut wire, b"second").await.unwrap();

        /* Skip the first record on the wire; its sibling arrives with nonce 1 */
        let buffer = wire.into_inner();
        let first_len = 4 + u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;

        let mut decryptor = RecordDecryptor::new(rkey);
        let mut wire = Cursor::new(buffer[first_len..].to_vec());
        assert!(matches!(
            decryptor.decrypt_from(&mut wire).await,
            Err(TransitError::Nonce(_, _))
        ));

        /* The failure latches */
        let mut wire = Cursor::new(Vec::new());
        assert!(matches!(
            decryptor.decrypt_from(&mut wire).await,
            Err(TransitError::Nonce(_, _))
        ));
    }

    #[async_std::test]
    async fn test_record_corrupt_ciphertext() {
        let key = test_key();
        let (skey, _) = record_keys(&key, Role::Sender);
        let (_, rkey) = record_keys(&key, Role::Receiver);

        let mut encryptor = RecordEncryptor::new(skey);
        let mut wire = Cursor::new(Vec::new());
        encryptor.encrypt_to(&mut wire, b"an important payload").await.unwrap();

        let mut buffer = wire.into_inner();
        let middle = 4 + NONCE_SIZE + 5;
        buffer[middle] ^= 0x01;

        let mut decryptor = RecordDecryptor::new(rkey);
        let mut wire = Cursor::new(buffer);
        assert!(matches!(
            decryptor.decrypt_from(&mut wire).await,
            Err(TransitError::Crypto)
        ));

        /* Poisoned: even a pristine record is refused now */
        let mut wire = Cursor::new(Vec::new());
        assert!(matches!(
            decryptor.decrypt_from(&mut wire).await,
            Err(TransitError::Crypto)
        ));
    }

    #[async_std::test]
    async fn test_record_underlength_frame() {
        let key = test_key();
        let (_, rkey) = record_keys(&key, Role::Receiver);

        /* length = 24 would make the ciphertext empty-or-negative */
        let mut frame = Vec::new();
        frame.extend_from_slice(&24u32.to_be_bytes());
        frame.extend_from_slice(&[0u8; NONCE_SIZE]);

        let mut decryptor = RecordDecryptor::new(rkey);
        let mut wire = Cursor::new(frame);
        assert!(matches!(
            decryptor.decrypt_from(&mut wire).await,
            Err(TransitError::Frame)
        ));
    }
}
