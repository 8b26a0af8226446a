//! Super peer selection.

use std::time::Duration;

use skein_crypto::IdentityPublicKey;

/// Pick the super peer with the lowest latency among `candidates`.
///
/// A candidate only replaces the current choice with a strictly lower
/// latency, so equal measurements never cause a switch. Among new candidates
/// with equal latency the first one wins.
#[must_use]
pub fn select_super_peer(
    current: Option<IdentityPublicKey>,
    candidates: &[(IdentityPublicKey, Duration)],
) -> Option<(IdentityPublicKey, Duration)> {
    let mut best = current.and_then(|current| {
        candidates
            .iter()
            .find(|(key, _)| *key == current)
            .copied()
    });
    for &(key, latency) in candidates {
        if best.is_none_or(|(_, best_latency)| latency < best_latency) {
            best = Some((key, latency));
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> IdentityPublicKey {
        IdentityPublicKey::from_bytes([byte; 32])
    }

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    #[test]
    fn test_lowest_latency_wins() {
        let candidates = [(key(1), ms(30)), (key(2), ms(10)), (key(3), ms(20))];
        assert_eq!(select_super_peer(None, &candidates), Some((key(2), ms(10))));
        assert_eq!(
            select_super_peer(Some(key(1)), &candidates),
            Some((key(2), ms(10)))
        );
    }

    #[test]
    fn test_tie_keeps_current() {
        let candidates = [(key(1), ms(10)), (key(2), ms(10))];
        assert_eq!(
            select_super_peer(Some(key(2)), &candidates),
            Some((key(2), ms(10)))
        );
        assert_eq!(select_super_peer(None, &candidates), Some((key(1), ms(10))));
    }

    #[test]
    fn test_unreachable_current_is_replaced() {
        let candidates = [(key(2), ms(50))];
        assert_eq!(
            select_super_peer(Some(key(1)), &candidates),
            Some((key(2), ms(50)))
        );
        assert_eq!(select_super_peer(Some(key(1)), &[]), None);
    }
}
