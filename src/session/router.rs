//! Decodes inbound signaling messages into the events the session acts on.

use crate::media::IceCandidate;
use crate::protocol::{ParticipantId, SignalMessage};

/// Reason reported when the server sends a bare `user-left`.
const DEFAULT_LEAVE_REASON: &str = "quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SignalEvent {
    MembershipSnapshot(Vec<ParticipantId>),
    ParticipantJoined(ParticipantId),
    ParticipantLeft(ParticipantId, String),
    OfferReceived {
        from: ParticipantId,
        sdp: String,
    },
    AnswerReceived {
        from: ParticipantId,
        sdp: String,
    },
    CandidateReceived {
        from: ParticipantId,
        candidate: IceCandidate,
    },
}

/// Maps a wire message to a session event. Returns `None` for traffic that
/// is not for us: messages targeted at another participant, echoes of our
/// own messages, and client-origin types a server should never relay.
pub(crate) fn route(local_id: &ParticipantId, message: SignalMessage) -> Option<SignalEvent> {
    match message {
        SignalMessage::UserList { data } => Some(SignalEvent::MembershipSnapshot(data.users)),
        SignalMessage::UserJoined { uid } => {
            if uid == *local_id {
                return None;
            }
            Some(SignalEvent::ParticipantJoined(uid))
        }
        SignalMessage::UserLeft { uid, reason } => {
            if uid == *local_id {
                return None;
            }
            Some(SignalEvent::ParticipantLeft(
                uid,
                reason.unwrap_or_else(|| DEFAULT_LEAVE_REASON.to_string()),
            ))
        }
        SignalMessage::Offer { uid, to_uid, data, .. } => {
            if !targets_us(local_id, &uid, to_uid.as_ref()) {
                return None;
            }
            Some(SignalEvent::OfferReceived {
                from: uid,
                sdp: data.sdp,
            })
        }
        SignalMessage::Answer { uid, to_uid, data, .. } => {
            if !targets_us(local_id, &uid, to_uid.as_ref()) {
                return None;
            }
            Some(SignalEvent::AnswerReceived {
                from: uid,
                sdp: data.sdp,
            })
        }
        SignalMessage::IceCandidate { uid, to_uid, data, .. } => {
            if !targets_us(local_id, &uid, to_uid.as_ref()) {
                return None;
            }
            Some(SignalEvent::CandidateReceived {
                from: uid,
                candidate: data.into(),
            })
        }
        SignalMessage::Join { .. } | SignalMessage::Leave { .. } => {
            tracing::debug!(
                target = "mesh::session",
                "ignoring client-origin join/leave relayed by server"
            );
            None
        }
    }
}

fn targets_us(
    local_id: &ParticipantId,
    from: &ParticipantId,
    to_uid: Option<&ParticipantId>,
) -> bool {
    if from == local_id {
        return false;
    }
    // Untargeted negotiation messages are tolerated as broadcast.
    match to_uid {
        Some(to) => to == local_id,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CandidatePayload, SdpKind, SdpPayload};

    fn local() -> ParticipantId {
        ParticipantId::new("alice")
    }

    fn offer(from: &str, to: Option<&str>) -> SignalMessage {
        SignalMessage::Offer {
            uid: from.into(),
            to_uid: to.map(Into::into),
            channel_id: None,
            data: SdpPayload {
                sdp: "v=0".into(),
                kind: SdpKind::Offer,
            },
        }
    }

    #[test]
    fn targeted_offer_for_us_is_routed() {
        let event = route(&local(), offer("bob", Some("alice"))).unwrap();
        assert_eq!(
            event,
            SignalEvent::OfferReceived {
                from: "bob".into(),
                sdp: "v=0".into(),
            }
        );
    }

    #[test]
    fn broadcast_offer_is_tolerated() {
        assert!(route(&local(), offer("bob", None)).is_some());
    }

    #[test]
    fn offer_for_someone_else_is_dropped() {
        assert!(route(&local(), offer("bob", Some("carol"))).is_none());
    }

    #[test]
    fn own_echo_is_dropped() {
        assert!(route(&local(), offer("alice", Some("bob"))).is_none());
    }

    #[test]
    fn bare_user_left_gets_default_reason() {
        let event = route(
            &local(),
            SignalMessage::UserLeft {
                uid: "bob".into(),
                reason: None,
            },
        )
        .unwrap();
        assert_eq!(event, SignalEvent::ParticipantLeft("bob".into(), "quit".into()));
    }

    #[test]
    fn candidate_payload_maps_to_ice_candidate() {
        let message = SignalMessage::IceCandidate {
            uid: "bob".into(),
            to_uid: Some("alice".into()),
            channel_id: None,
            data: CandidatePayload {
                candidate: "candidate:0 1 udp 1 203.0.113.7 40000 typ host".into(),
                sdp_mline_index: 0,
                sdp_mid: "audio".into(),
            },
        };
        match route(&local(), message).unwrap() {
            SignalEvent::CandidateReceived { from, candidate } => {
                assert_eq!(from.as_str(), "bob");
                assert_eq!(candidate.sdp_mid, "audio");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
