//! Deterministic offer-role assignment.

use crate::protocol::ParticipantId;

/// Decides which side of a peer pair initiates the offer: the participant
/// whose identifier sorts strictly lower. Both sides evaluate the same rule
/// and land on opposite answers, so simultaneous offers (glare) cannot
/// happen between well-behaved peers. Requires unique identifiers.
pub fn should_initiate_offer(local: &ParticipantId, remote: &ParticipantId) -> bool {
    local < remote
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exactly_one_side_offers() {
        let pairs = [("alice", "bob"), ("a", "ab"), ("2", "10"), ("Z", "a")];
        for (a, b) in pairs {
            let a = ParticipantId::new(a);
            let b = ParticipantId::new(b);
            assert_ne!(
                should_initiate_offer(&a, &b),
                should_initiate_offer(&b, &a),
                "{a} vs {b}"
            );
        }
    }

    #[test]
    fn result_is_stable() {
        let local = ParticipantId::new("alice");
        let remote = ParticipantId::new("bob");
        let first = should_initiate_offer(&local, &remote);
        for _ in 0..10 {
            assert_eq!(should_initiate_offer(&local, &remote), first);
        }
        assert!(first, "lexicographically lower id offers");
    }
}
