//! Epoch key management for forward-secure rooms.
//!
//! Every member holds an ephemeral X25519 keypair for the room and announces
//! its public half. The coordinator (smallest member id) periodically
//! generates a fresh symmetric epoch key and wraps it once per member under
//! the pairwise key derived from its own secret and that member's public key.
//!
//! ```text
//! NoKeyPair ──enter_room──▶ KeyPairReady ──announce──▶ AwaitingEpochKey
//!     ▲                                                      │
//!     └──────────── leave_room ◀──── HasEpochKey ◀── adopt ──┘
//! ```

use std::collections::HashMap;

use tracing::{debug, info, warn};
use x25519_dalek::PublicKey;

use skiff_net::ActiveMembers;
use skiff_shared::constants::{MAX_EPOCH_CLOCK_SKEW_MS, PUBKEY_SIZE};
use skiff_shared::crypto::{self, generate_symmetric_key, Sealed, SymmetricKey};
use skiff_shared::exchange::{import_public_key, EpochKeyPair};
use skiff_shared::protocol::WireMessage;
use skiff_shared::types::{EpochId, PeerId};

use crate::secure_channel::RoomContext;

/// Associated data binding a wrapped or sealed payload to its epoch.
pub(crate) fn epoch_aad(epoch_id: EpochId) -> [u8; 8] {
    epoch_id.0.to_be_bytes()
}

/// A symmetric group key and the generation it belongs to.
#[derive(Clone)]
pub struct EpochKey {
    pub epoch_id: EpochId,
    pub key: SymmetricKey,
}

impl EpochKey {
    pub fn new(epoch_id: EpochId, key: SymmetricKey) -> Self {
        Self { epoch_id, key }
    }

    pub fn generate(epoch_id: EpochId) -> Self {
        Self::new(epoch_id, generate_symmetric_key())
    }
}

impl std::fmt::Debug for EpochKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpochKey")
            .field("epoch_id", &self.epoch_id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum EpochState {
    NoKeyPair,
    KeyPairReady,
    AwaitingEpochKey,
    HasEpochKey,
}

/// Public keys announced by other members of the current room.
#[derive(Debug, Default)]
pub struct PeerPublicKeyDirectory {
    keys: HashMap<PeerId, PublicKey>,
}

impl PeerPublicKeyDirectory {
    /// Store `key` for `peer`. Returns `true` if the directory changed.
    ///
    /// A repeated announcement of the same key is a no-op; a different key
    /// means the peer re-entered the room and replaces the old one.
    pub fn insert(&mut self, peer: &PeerId, key: PublicKey) -> bool {
        match self.keys.get(peer) {
            Some(existing) if existing.as_bytes() == key.as_bytes() => false,
            _ => {
                self.keys.insert(peer.clone(), key);
                true
            }
        }
    }

    pub fn get(&self, peer: &PeerId) -> Option<&PublicKey> {
        self.keys.get(peer)
    }

    pub fn remove(&mut self, peer: &PeerId) -> bool {
        self.keys.remove(peer).is_some()
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.keys.contains_key(peer)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn clear(&mut self) {
        self.keys.clear();
    }
}

/// Result of handling a peer's public key announcement.
#[derive(Debug)]
pub struct AnnounceOutcome {
    /// The directory learned a key it did not have.
    pub newly_known: bool,
    /// Our own announcement, to be published in reply.
    pub reciprocate: Option<WireMessage>,
}

/// Result of a rekey attempt.
#[derive(Debug)]
pub enum RekeyOutcome {
    /// No keypair: not in a forward-secure room.
    Inactive,
    /// Another member is coordinator.
    NotCoordinator(PeerId),
    /// No epoch id above the held one exists; nothing was distributed.
    Stalled(EpochId),
    Rotated {
        epoch_id: EpochId,
        /// One `EpochKeyDistribution` per recipient.
        distributions: Vec<WireMessage>,
        /// Members skipped because their public key is unknown.
        skipped: usize,
    },
}

pub struct EpochKeyManager {
    local_id: PeerId,
    keypair: Option<EpochKeyPair>,
    directory: PeerPublicKeyDirectory,
    state: EpochState,
    /// Highest epoch any member reported holding; new epochs start above it.
    epoch_floor: Option<EpochId>,
}

impl EpochKeyManager {
    pub fn new(local_id: PeerId) -> Self {
        Self {
            local_id,
            keypair: None,
            directory: PeerPublicKeyDirectory::default(),
            state: EpochState::NoKeyPair,
            epoch_floor: None,
        }
    }

    pub fn state(&self) -> EpochState {
        self.state
    }

    pub fn directory(&self) -> &PeerPublicKeyDirectory {
        &self.directory
    }

    /// Generate a fresh keypair for a newly entered forward-secure room.
    pub fn enter_room(&mut self) {
        self.leave_room();
        let keypair = EpochKeyPair::generate();
        debug!(keypair = ?keypair, "Generated epoch keypair");
        self.keypair = Some(keypair);
        self.state = EpochState::KeyPairReady;
    }

    /// Destroy the keypair and everything learned in the room.
    pub fn leave_room(&mut self) {
        self.keypair = None;
        self.directory.clear();
        self.epoch_floor = None;
        self.state = EpochState::NoKeyPair;
    }

    /// Our public key announcement, if a keypair exists.
    ///
    /// Marks the manager as awaiting a key when none is held yet.
    pub fn announcement(&mut self, room: &RoomContext) -> Option<WireMessage> {
        let keypair = self.keypair.as_ref()?;
        if self.state == EpochState::KeyPairReady {
            self.state = EpochState::AwaitingEpochKey;
        }
        Some(WireMessage::PublicKeyAnnounce {
            public_key: keypair.public_key_bytes(),
            held_epoch: room.current_epoch(),
        })
    }

    /// Record another member's announced public key.
    ///
    /// A reported epoch further than [`MAX_EPOCH_CLOCK_SKEW_MS`] ahead of
    /// `now_ms` does not raise the epoch floor.
    pub fn handle_public_key_announce(
        &mut self,
        room: &RoomContext,
        sender: &PeerId,
        public_key: &[u8; PUBKEY_SIZE],
        held_epoch: Option<EpochId>,
        now_ms: u64,
    ) -> AnnounceOutcome {
        let idle = AnnounceOutcome {
            newly_known: false,
            reciprocate: None,
        };
        if sender == &self.local_id || self.keypair.is_none() {
            return idle;
        }

        match held_epoch {
            Some(held) if held.0 > now_ms.saturating_add(MAX_EPOCH_CLOCK_SKEW_MS) => {
                warn!(peer = %sender, held = %held, now_ms, "Ignoring implausible held epoch");
            }
            Some(held) => {
                self.epoch_floor = Some(self.epoch_floor.map_or(held, |f| f.max(held)));
            }
            None => {}
        }

        let key = match import_public_key(public_key) {
            Ok(k) => k,
            Err(e) => {
                warn!(peer = %sender, error = %e, "Rejected public key announcement");
                return idle;
            }
        };

        if !self.directory.insert(sender, key) {
            return idle;
        }

        debug!(peer = %sender, known = self.directory.len(), "Imported member public key");
        AnnounceOutcome {
            newly_known: true,
            reciprocate: self.announcement(room),
        }
    }

    /// Rotate the epoch key if this peer is the coordinator.
    ///
    /// The coordinator is recomputed from `members` on every call.
    pub fn rekey(
        &mut self,
        room: &mut RoomContext,
        members: &ActiveMembers,
        now_ms: u64,
    ) -> RekeyOutcome {
        let Some(keypair) = self.keypair.as_ref() else {
            return RekeyOutcome::Inactive;
        };

        match members.coordinator() {
            Some(coordinator) if coordinator != &self.local_id => {
                return RekeyOutcome::NotCoordinator(coordinator.clone());
            }
            _ => {}
        }

        let mut next = now_ms;
        for above in [room.current_epoch(), self.epoch_floor].into_iter().flatten() {
            let Some(id) = above.0.checked_add(1) else {
                warn!(epoch_id = %above, "Epoch ids exhausted, not rotating");
                return RekeyOutcome::Stalled(above);
            };
            next = next.max(id);
        }
        let epoch_id = EpochId(next);
        let epoch_key = EpochKey::generate(epoch_id);

        let mut distributions = Vec::new();
        let mut skipped = 0;
        for member in members.peers() {
            if member == self.local_id {
                continue;
            }
            let Some(public) = self.directory.get(&member) else {
                debug!(peer = %member, "No public key yet, skipping this round");
                skipped += 1;
                continue;
            };
            match wrap_epoch_key(keypair, public, &epoch_key) {
                Ok(sealed) => distributions.push(WireMessage::EpochKeyDistribution {
                    epoch_id,
                    recipient: member,
                    sealed,
                }),
                Err(e) => {
                    warn!(peer = %member, error = %e, "Could not wrap epoch key");
                    skipped += 1;
                }
            }
        }

        if !room.adopt_epoch_key(epoch_key) {
            return RekeyOutcome::Stalled(room.current_epoch().unwrap_or(epoch_id));
        }
        self.state = EpochState::HasEpochKey;
        info!(
            epoch_id = %epoch_id,
            recipients = distributions.len(),
            skipped,
            "Coordinator rotated epoch key"
        );

        RekeyOutcome::Rotated {
            epoch_id,
            distributions,
            skipped,
        }
    }

    /// Unwrap and adopt an epoch key addressed to us.
    ///
    /// Returns the adopted epoch id. Failures are logged and dropped.
    pub fn handle_distribution(
        &mut self,
        room: &mut RoomContext,
        sender: &PeerId,
        epoch_id: EpochId,
        recipient: &PeerId,
        sealed: &Sealed,
    ) -> Option<EpochId> {
        if recipient != &self.local_id {
            return None;
        }
        let keypair = self.keypair.as_ref()?;

        let Some(public) = self.directory.get(sender) else {
            debug!(peer = %sender, epoch_id = %epoch_id, "Distribution from peer with unknown key");
            return None;
        };

        let key = match unwrap_epoch_key(keypair, public, epoch_id, sealed) {
            Ok(k) => k,
            Err(e) => {
                warn!(peer = %sender, epoch_id = %epoch_id, error = %e, "Could not unwrap epoch key");
                return None;
            }
        };

        if room.adopt_epoch_key(EpochKey::new(epoch_id, key)) {
            self.state = EpochState::HasEpochKey;
            Some(epoch_id)
        } else {
            None
        }
    }

    /// Forget a departed member's key.
    pub fn forget_peer(&mut self, peer: &PeerId) {
        if self.directory.remove(peer) {
            debug!(peer = %peer, "Dropped member public key");
        }
    }
}

fn wrap_epoch_key(
    keypair: &EpochKeyPair,
    recipient: &PublicKey,
    epoch_key: &EpochKey,
) -> Result<Sealed, WrapError> {
    let wrap_key = keypair.pairwise_key(recipient)?;
    Ok(crypto::encrypt_with_aad(
        &wrap_key,
        &epoch_key.key,
        &epoch_aad(epoch_key.epoch_id),
    )?)
}

fn unwrap_epoch_key(
    keypair: &EpochKeyPair,
    sender: &PublicKey,
    epoch_id: EpochId,
    sealed: &Sealed,
) -> Result<SymmetricKey, WrapError> {
    let wrap_key = keypair.pairwise_key(sender)?;
    let bytes = crypto::decrypt_with_aad(&wrap_key, sealed, &epoch_aad(epoch_id))?;
    bytes.try_into().map_err(|_| WrapError::BadLength)
}

#[derive(Debug, thiserror::Error)]
enum WrapError {
    #[error(transparent)]
    Agreement(#[from] skiff_shared::KeyAgreementError),
    #[error(transparent)]
    Crypto(#[from] skiff_shared::CryptoError),
    #[error("Unwrapped key has the wrong length")]
    BadLength,
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_shared::types::{RoomId, SecurityModeKind};

    use crate::secure_channel::SecurityMode;

    fn fs_room() -> RoomContext {
        RoomContext::new(RoomId::new("vault"), SecurityMode::ForwardSecure)
    }

    fn announce_bytes(msg: &WireMessage) -> ([u8; PUBKEY_SIZE], Option<EpochId>) {
        match msg {
            WireMessage::PublicKeyAnnounce {
                public_key,
                held_epoch,
            } => (*public_key, *held_epoch),
            other => panic!("expected announcement, got {other:?}"),
        }
    }

    struct Member {
        id: PeerId,
        manager: EpochKeyManager,
        room: RoomContext,
    }

    impl Member {
        fn new(name: &str) -> Self {
            let id = PeerId::new(name);
            let mut manager = EpochKeyManager::new(id.clone());
            manager.enter_room();
            Self {
                id,
                manager,
                room: fs_room(),
            }
        }

        fn learn(&mut self, other: &mut Member) -> AnnounceOutcome {
            let msg = other.manager.announcement(&other.room).unwrap();
            let (pk, held) = announce_bytes(&msg);
            self.manager
                .handle_public_key_announce(&self.room, &other.id, &pk, held, 0)
        }
    }

    fn members(ids: &[&PeerId]) -> ActiveMembers {
        let mut set = ActiveMembers::new();
        for id in ids {
            set.touch(id, 0);
        }
        set
    }

    #[test]
    fn test_state_transitions() {
        let mut a = Member::new("a");
        assert_eq!(a.manager.state(), EpochState::KeyPairReady);

        a.manager.announcement(&a.room);
        assert_eq!(a.manager.state(), EpochState::AwaitingEpochKey);

        let set = members(&[&a.id]);
        a.manager.rekey(&mut a.room, &set, 1_000);
        assert_eq!(a.manager.state(), EpochState::HasEpochKey);

        a.manager.leave_room();
        assert_eq!(a.manager.state(), EpochState::NoKeyPair);
        assert!(matches!(
            a.manager.rekey(&mut a.room, &set, 2_000),
            RekeyOutcome::Inactive
        ));
    }

    #[test]
    fn test_first_announce_reciprocates_once() {
        let mut a = Member::new("a");
        let mut b = Member::new("b");

        let first = a.learn(&mut b);
        assert!(first.newly_known);
        assert!(first.reciprocate.is_some());

        let again = a.learn(&mut b);
        assert!(!again.newly_known);
        assert!(again.reciprocate.is_none());
        assert_eq!(a.manager.directory().len(), 1);
    }

    #[test]
    fn test_own_announce_ignored() {
        let mut a = Member::new("a");
        let msg = a.manager.announcement(&a.room).unwrap();
        let (pk, held) = announce_bytes(&msg);

        let id = a.id.clone();
        let outcome = a
            .manager
            .handle_public_key_announce(&a.room, &id, &pk, held, 0);
        assert!(!outcome.newly_known);
        assert!(a.manager.directory().is_empty());
    }

    #[test]
    fn test_coordinator_distributes_to_known_members() {
        let mut a = Member::new("a");
        let mut b = Member::new("b");
        let mut c = Member::new("c");

        a.learn(&mut b);
        b.learn(&mut a);
        // c never announced to a

        let set = members(&[&a.id, &b.id, &c.id]);
        let outcome = a.manager.rekey(&mut a.room, &set, 50_000);

        let (epoch_id, distributions, skipped) = match outcome {
            RekeyOutcome::Rotated {
                epoch_id,
                distributions,
                skipped,
            } => (epoch_id, distributions, skipped),
            other => panic!("expected rotation, got {other:?}"),
        };
        assert_eq!(epoch_id, EpochId(50_000));
        assert_eq!(distributions.len(), 1);
        assert_eq!(skipped, 1);

        let WireMessage::EpochKeyDistribution {
            epoch_id: wire_epoch,
            recipient,
            sealed,
        } = &distributions[0]
        else {
            panic!("expected distribution");
        };
        assert_eq!(recipient, &b.id);

        // c cannot open what was addressed to b
        assert!(c
            .manager
            .handle_distribution(&mut c.room, &a.id, *wire_epoch, recipient, sealed)
            .is_none());

        let adopted = b
            .manager
            .handle_distribution(&mut b.room, &a.id, *wire_epoch, recipient, sealed);
        assert_eq!(adopted, Some(epoch_id));
        assert_eq!(b.manager.state(), EpochState::HasEpochKey);

        let a_key = a.room.epoch_key().unwrap().key;
        let b_key = b.room.epoch_key().unwrap().key;
        assert_eq!(a_key, b_key);
    }

    #[test]
    fn test_non_coordinator_does_not_rekey() {
        let mut b = Member::new("b");
        let a = PeerId::new("a");
        let set = members(&[&a, &b.id]);

        match b.manager.rekey(&mut b.room, &set, 1) {
            RekeyOutcome::NotCoordinator(c) => assert_eq!(c, a),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(b.room.epoch_key().is_none());
    }

    #[test]
    fn test_epoch_ids_strictly_increase() {
        let mut a = Member::new("a");
        let set = members(&[&a.id]);

        a.manager.rekey(&mut a.room, &set, 1_000);
        // clock did not advance
        a.manager.rekey(&mut a.room, &set, 1_000);
        assert_eq!(a.room.current_epoch(), Some(EpochId(1_001)));
    }

    #[test]
    fn test_new_epoch_exceeds_reported_held_epoch() {
        let mut a = Member::new("a");
        let mut b = Member::new("b");

        // b is alone first and holds an epoch from a fast clock
        let solo = members(&[&b.id]);
        b.manager.rekey(&mut b.room, &solo, 900_000);

        a.learn(&mut b);
        b.learn(&mut a);

        let set = members(&[&a.id, &b.id]);
        let outcome = a.manager.rekey(&mut a.room, &set, 10);
        let RekeyOutcome::Rotated {
            epoch_id,
            distributions,
            ..
        } = outcome
        else {
            panic!("expected rotation");
        };
        assert_eq!(epoch_id, EpochId(900_001));

        let WireMessage::EpochKeyDistribution {
            recipient, sealed, ..
        } = &distributions[0]
        else {
            panic!("expected distribution");
        };
        assert_eq!(
            b.manager
                .handle_distribution(&mut b.room, &a.id, epoch_id, recipient, sealed),
            Some(epoch_id)
        );
    }

    #[test]
    fn test_tampered_epoch_id_rejected() {
        let mut a = Member::new("a");
        let mut b = Member::new("b");
        a.learn(&mut b);
        b.learn(&mut a);

        let set = members(&[&a.id, &b.id]);
        let RekeyOutcome::Rotated {
            epoch_id,
            distributions,
            ..
        } = a.manager.rekey(&mut a.room, &set, 5_000)
        else {
            panic!("expected rotation");
        };
        let WireMessage::EpochKeyDistribution {
            recipient, sealed, ..
        } = &distributions[0]
        else {
            panic!("expected distribution");
        };

        let forged = EpochId(epoch_id.0 + 1_000_000);
        assert!(b
            .manager
            .handle_distribution(&mut b.room, &a.id, forged, recipient, sealed)
            .is_none());
        assert_eq!(b.room.epoch_key().map(|k| k.epoch_id), None);
        assert_eq!(b.room.mode.kind(), SecurityModeKind::ForwardSecure);
    }

    #[test]
    fn test_forget_peer_skips_next_round() {
        let mut a = Member::new("a");
        let mut b = Member::new("b");
        a.learn(&mut b);

        a.manager.forget_peer(&b.id);
        let set = members(&[&a.id, &b.id]);
        let RekeyOutcome::Rotated {
            distributions,
            skipped,
            ..
        } = a.manager.rekey(&mut a.room, &set, 1)
        else {
            panic!("expected rotation");
        };
        assert!(distributions.is_empty());
        assert_eq!(skipped, 1);
    }

    #[test]
    fn test_far_future_held_epoch_does_not_freeze_rotation() {
        let mut a = Member::new("a");
        let mut b = Member::new("b");
        b.learn(&mut a);

        // A member claiming to hold the last possible epoch
        let public = match b.manager.announcement(&b.room).unwrap() {
            WireMessage::PublicKeyAnnounce { public_key, .. } => public_key,
            other => panic!("expected announcement, got {other:?}"),
        };
        a.manager.handle_public_key_announce(
            &a.room,
            &b.id,
            &public,
            Some(EpochId(u64::MAX)),
            10_000,
        );

        let set = members(&[&a.id, &b.id]);
        let mut previous = None;
        for now in [10_000, 20_000, 30_000] {
            let RekeyOutcome::Rotated {
                epoch_id,
                distributions,
                ..
            } = a.manager.rekey(&mut a.room, &set, now)
            else {
                panic!("expected rotation");
            };
            assert_eq!(epoch_id, EpochId(now));
            assert!(previous < Some(epoch_id));
            previous = Some(epoch_id);

            let WireMessage::EpochKeyDistribution {
                recipient, sealed, ..
            } = &distributions[0]
            else {
                panic!("expected distribution");
            };
            assert_eq!(
                b.manager
                    .handle_distribution(&mut b.room, &a.id, epoch_id, recipient, sealed),
                Some(epoch_id)
            );
        }
    }

    #[test]
    fn test_plausible_held_epoch_still_raises_floor() {
        let mut a = Member::new("a");
        let mut b = Member::new("b");
        let public = match b.manager.announcement(&b.room).unwrap() {
            WireMessage::PublicKeyAnnounce { public_key, .. } => public_key,
            other => panic!("expected announcement, got {other:?}"),
        };
        a.manager
            .handle_public_key_announce(&a.room, &b.id, &public, Some(EpochId(10_500)), 10_000);

        let set = members(&[&a.id, &b.id]);
        let RekeyOutcome::Rotated { epoch_id, .. } = a.manager.rekey(&mut a.room, &set, 10_000)
        else {
            panic!("expected rotation");
        };
        assert_eq!(epoch_id, EpochId(10_501));
    }

    #[test]
    fn test_exhausted_epoch_ids_stall_without_distributing() {
        let mut a = Member::new("a");
        let last = EpochKey::generate(EpochId(u64::MAX));
        let last_key = last.key;
        assert!(a.room.adopt_epoch_key(last));

        let set = members(&[&a.id]);
        match a.manager.rekey(&mut a.room, &set, 1_000) {
            RekeyOutcome::Stalled(held) => assert_eq!(held, EpochId(u64::MAX)),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(a.room.epoch_key().unwrap().key, last_key);
    }
}
