//! Over-the-wire messages for the file transfer (including transit)
//!
//! The transit protocol does not specify how to deliver the information to
//! the other side, so it is up to the file transfer to do that.

use crate::transit::TransitMsg;
use serde_derive::{Deserialize, Serialize};

/**
 * The type of message exchanged over the mailbox for this protocol
 */
#[derive(Deserialize, Serialize, derive_more::Display, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub enum PeerMessage {
    /** Used to set up a transit channel */
    #[display(fmt = "transit")]
    Transit(TransitMsg),
    #[display(fmt = "offer")]
    Offer(OfferMessage),
    #[display(fmt = "answer")]
    Answer(AnswerMessage),
    /** Tell the other side you got an error */
    #[display(fmt = "error")]
    Error(String),
    #[display(fmt = "unknown")]
    #[serde(other)]
    Unknown,
}

impl PeerMessage {
    pub fn offer_message(msg: impl Into<String>) -> Self {
        PeerMessage::Offer(OfferMessage::Message(msg.into()))
    }

    pub fn offer_file(name: impl Into<String>, size: u64) -> Self {
        PeerMessage::Offer(OfferMessage::File {
            filename: name.into(),
            filesize: size,
        })
    }

    pub fn message_ack(msg: impl Into<String>) -> Self {
        PeerMessage::Answer(AnswerMessage::MessageAck(msg.into()))
    }

    pub fn file_ack(msg: impl Into<String>) -> Self {
        PeerMessage::Answer(AnswerMessage::FileAck(msg.into()))
    }

    pub fn error_message(msg: impl Into<String>) -> Self {
        PeerMessage::Error(msg.into())
    }

    pub fn transit(msg: TransitMsg) -> Self {
        PeerMessage::Transit(msg)
    }

    pub(super) fn ser_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub enum OfferMessage {
    Message(String),
    File {
        filename: String,
        filesize: u64,
    },
    Directory {
        dirname: String,
        mode: String,
        zipsize: u64,
        numbytes: u64,
        numfiles: u64,
    },
    #[serde(other)]
    Unknown,
}

impl OfferMessage {
    pub fn transfer_type(&self) -> TransferType {
        match self {
            OfferMessage::Message(_) => TransferType::Text,
            OfferMessage::File { .. } => TransferType::File,
            OfferMessage::Directory { .. } => TransferType::Directory,
            OfferMessage::Unknown => TransferType::File,
        }
    }
}

/// What kind of payload an offer announces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, derive_more::Display)]
pub enum TransferType {
    #[display(fmt = "file")]
    File,
    #[display(fmt = "directory")]
    Directory,
    #[display(fmt = "text message")]
    Text,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum AnswerMessage {
    MessageAck(String),
    FileAck(String),
}

/**
 * The final integrity check, sent from the receiver to the sender as the last
 * record of the session.
 */
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TransitAck {
    pub ack: String,
    pub sha256: String,
}

impl TransitAck {
    pub fn new(msg: impl Into<String>, sha256: impl Into<String>) -> Self {
        TransitAck {
            ack: msg.into(),
            sha256: sha256.into(),
        }
    }

    pub fn serialize_vec(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::transit::{Ability, Hint, RelayEndpoint, RelayEndpointKind};
    use serde_json::json;

    #[test]
    fn test_transit() {
        let abilities = Ability::all_abilities();
        let hints = vec![
            Hint::new_direct(0.0, "192.168.1.8", 46295),
            Hint::new_relay(vec![RelayEndpoint {
                kind: RelayEndpointKind::Tcp,
                hostname: "magic-wormhole-transit.debian.net".to_string(),
                port: 4001,
                priority: 2.0,
            }]),
        ];
        let t = PeerMessage::transit(TransitMsg {
            abilities_v1: abilities,
            hints_v1: hints,
        });
        assert_eq!(
            json!(t),
            json!({
                "transit": {
                    "abilities-v1": [{"type": "direct-tcp-v1"}, {"type": "relay-v1"}],
                    "hints-v1": [
                        {"type": "direct-tcp-v1", "hostname": "192.168.1.8", "port": 46295, "priority": 0.0},
                        {"type": "relay-v1", "hints": [
                            {"type": "direct-tcp-v1", "hostname": "magic-wormhole-transit.debian.net", "port": 4001, "priority": 2.0}
                        ]}
                    ]
                }
            })
        );
    }

    #[test]
    fn test_message() {
        let m1 = PeerMessage::offer_message("hello from rust");
        assert_eq!(
            json!(m1).to_string(),
            "{\"offer\":{\"message\":\"hello from rust\"}}"
        );
    }

    #[test]
    fn test_offer_file() {
        let f1 = PeerMessage::offer_file("somefile.txt", 34556);
        assert_eq!(
            json!(f1).to_string(),
            "{\"offer\":{\"file\":{\"filename\":\"somefile.txt\",\"filesize\":34556}}}"
        );
    }

    #[test]
    fn test_message_ack() {
        let m1 = PeerMessage::message_ack("ok");
        assert_eq!(
            json!(m1).to_string(),
            "{\"answer\":{\"message_ack\":\"ok\"}}"
        );
    }

    #[test]
    fn test_file_ack() {
        let f1 = PeerMessage::file_ack("ok");
        assert_eq!(json!(f1).to_string(), "{\"answer\":{\"file_ack\":\"ok\"}}");
    }

    #[test]
    fn test_error_message() {
        let e1 = PeerMessage::error_message("transfer rejected");
        assert_eq!(json!(e1).to_string(), "{\"error\":\"transfer rejected\"}");
    }

    #[test]
    fn test_transit_ack() {
        let ack = TransitAck::new("ok", "deadbeef");
        assert_eq!(
            json!(ack).to_string(),
            "{\"ack\":\"ok\",\"sha256\":\"deadbeef\"}"
        );
    }

    #[test]
    fn test_incoming_directory_offer_parses() {
        let msg: PeerMessage = serde_json::from_value(json!({
            "offer": {
                "directory": {
                    "dirname": "somedirectory",
                    "mode": "zipped",
                    "zipsize": 45,
                    "numbytes": 1234,
                    "numfiles": 10
                }
            }
        }))
        .unwrap();
        match msg {
            PeerMessage::Offer(offer @ OfferMessage::Directory { .. }) => {
                assert_eq!(offer.transfer_type(), TransferType::Directory);
            },
            other => panic!("expected directory offer, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_message_tolerated() {
        let msg: PeerMessage =
            serde_json::from_value(json!({"transit-v2": {"hints-v2": []}})).unwrap();
        assert_eq!(msg, PeerMessage::Unknown);
    }
}
