//! Wire messages exchanged with the signaling server.
//!
//! The format is JSON with a `type` discriminator, matching the rendezvous
//! service contract: `join`/`leave` announce presence, `user-list` and
//! `user-joined`/`user-left` carry membership, `offer`/`answer`/`ice-candidate`
//! carry the negotiation payloads. Targeted messages set `toUid`; messages
//! without it are treated as broadcast.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a channel participant.
///
/// Ordering is total (lexicographic) and is what the glare rule relies on,
/// so identifiers must be unique within a channel.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ParticipantId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Session description payload of an `offer` or `answer` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdpPayload {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: SdpKind,
}

/// Trickled ICE candidate payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePayload {
    pub candidate: String,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: u16,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserListPayload {
    pub users: Vec<ParticipantId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalMessage {
    Join {
        #[serde(rename = "channelId")]
        channel_id: String,
        uid: ParticipantId,
    },
    Leave {
        #[serde(rename = "channelId")]
        channel_id: String,
        uid: ParticipantId,
    },
    UserList {
        data: UserListPayload,
    },
    UserJoined {
        uid: ParticipantId,
    },
    UserLeft {
        uid: ParticipantId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Offer {
        uid: ParticipantId,
        #[serde(rename = "toUid", default, skip_serializing_if = "Option::is_none")]
        to_uid: Option<ParticipantId>,
        #[serde(rename = "channelId", default, skip_serializing_if = "Option::is_none")]
        channel_id: Option<String>,
        data: SdpPayload,
    },
    Answer {
        uid: ParticipantId,
        #[serde(rename = "toUid", default, skip_serializing_if = "Option::is_none")]
        to_uid: Option<ParticipantId>,
        #[serde(rename = "channelId", default, skip_serializing_if = "Option::is_none")]
        channel_id: Option<String>,
        data: SdpPayload,
    },
    IceCandidate {
        uid: ParticipantId,
        #[serde(rename = "toUid", default, skip_serializing_if = "Option::is_none")]
        to_uid: Option<ParticipantId>,
        #[serde(rename = "channelId", default, skip_serializing_if = "Option::is_none")]
        channel_id: Option<String>,
        data: CandidatePayload,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{from_str, json, to_value};

    #[test]
    fn offer_serializes_with_wire_field_names() {
        let message = SignalMessage::Offer {
            uid: "alice".into(),
            to_uid: Some("bob".into()),
            channel_id: Some("c1".into()),
            data: SdpPayload {
                sdp: "v=0".into(),
                kind: SdpKind::Offer,
            },
        };
        assert_eq!(
            to_value(&message).unwrap(),
            json!({
                "type": "offer",
                "uid": "alice",
                "toUid": "bob",
                "channelId": "c1",
                "data": {"sdp": "v=0", "type": "offer"},
            })
        );
    }

    #[test]
    fn candidate_parses_camel_case_fields() {
        let text = r#"{"type":"ice-candidate","uid":"bob","data":
            {"candidate":"candidate:0 1 udp 1 203.0.113.7 40000 typ host",
             "sdpMLineIndex":0,"sdpMid":"0"}}"#;
        let message: SignalMessage = from_str(text).unwrap();
        match message {
            SignalMessage::IceCandidate { uid, to_uid, data, .. } => {
                assert_eq!(uid.as_str(), "bob");
                assert_eq!(to_uid, None);
                assert_eq!(data.sdp_mline_index, 0);
                assert_eq!(data.sdp_mid, "0");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn user_list_parses_nested_users() {
        let text = r#"{"type":"user-list","data":{"users":["alice","bob"]}}"#;
        let message: SignalMessage = from_str(text).unwrap();
        assert_eq!(
            message,
            SignalMessage::UserList {
                data: UserListPayload {
                    users: vec!["alice".into(), "bob".into()],
                },
            }
        );
    }

    #[test]
    fn unknown_message_type_fails_to_parse() {
        assert!(from_str::<SignalMessage>(r#"{"type":"stats","uid":"x"}"#).is_err());
    }
}
