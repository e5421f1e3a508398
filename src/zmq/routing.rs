//! Client routing table (`spec.md` §3, §4.5).
//!
//! Maps the internal numeric client id assigned at handshake to the opaque transport identity
//! frame ZeroMQ requires to address a ROUTER socket's replies. Entries are never overwritten,
//! matching the invariant that a client id's lifetime runs from handshake until the transport
//! itself signals loss.

use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashMap;

/// Assigns client ids and routes responses back to the correct transport identity.
#[derive(Default)]
pub struct ClientRouter {
    next_client_id: AtomicU32,
    identities: DashMap<u32, Vec<u8>>,
}

impl ClientRouter {
    /// Construct an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign a fresh, monotonically-increasing client id and record its identity frame.
    ///
    /// Per `spec.md` §4.5, handshake replies carry a 4-byte client id; ids wrap are never reused
    /// within a process lifetime short of `u32::MAX` handshakes.
    pub fn register(&self, identity: Vec<u8>) -> u32 {
        let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        self.identities.insert(client_id, identity);
        client_id
    }

    /// Look up the identity frame recorded for `client_id`, if it has completed handshake.
    #[must_use]
    pub fn identity_of(&self, client_id: u32) -> Option<Vec<u8>> {
        self.identities.get(&client_id).map(|r| r.value().clone())
    }

    /// Number of clients currently routed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.identities.len()
    }

    /// Whether no clients are routed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_assigns_monotonically_increasing_ids() {
        let router = ClientRouter::new();
        let a = router.register(b"id-a".to_vec());
        let b = router.register(b"id-b".to_vec());
        assert!(b > a);
    }

    #[test]
    fn identity_of_returns_the_frame_recorded_at_handshake() {
        let router = ClientRouter::new();
        let id = router.register(b"peer-identity".to_vec());
        assert_eq!(router.identity_of(id), Some(b"peer-identity".to_vec()));
    }

    #[test]
    fn unknown_client_id_resolves_to_none() {
        let router = ClientRouter::new();
        assert_eq!(router.identity_of(9999), None);
    }

    #[test]
    fn many_clients_are_each_routed_to_their_own_identity() {
        let router = ClientRouter::new();
        let ids: Vec<u32> = (0..1000)
            .map(|i| router.register(format!("client-{i}").into_bytes()))
            .collect();
        assert_eq!(router.len(), 1000);
        for (i, id) in ids.iter().enumerate() {
            assert_eq!(
                router.identity_of(*id),
                Some(format!("client-{i}").into_bytes())
            );
        }
    }
}
