mod history;

use crate::Error;
use crate::codec::mpi;
use crate::crypto::{RandomSource, sha1, sha256, wipe_big};
use crate::types::DhKeyPair;
use history::{CounterHistory, MacKeyHistory};
use num_bigint::BigUint;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

const SEND_BYTE_HIGH: u8 = 0x01;
const RECEIVE_BYTE_HIGH: u8 = 0x02;
const SEND_BYTE_LOW: u8 = 0x02;
const RECEIVE_BYTE_LOW: u8 = 0x01;
const EXTRA_KEY_BYTE: u8 = 0xFF;

/// Keys derived from one (our key, their key) pair.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub(crate) struct SessionKeys {
    pub(crate) sending_aes: [u8; 16],
    pub(crate) sending_mac: [u8; 20],
    pub(crate) receiving_aes: [u8; 16],
    pub(crate) receiving_mac: [u8; 20],
    pub(crate) extra_key: [u8; 32],
}

impl SessionKeys {
    /// Derives the keys from our key pair and their public value.
    ///
    /// The side holding the larger public value uses 0x01 to derive its
    /// sending keys and 0x02 for its receiving keys; the other side swaps
    /// them, so both ends agree on each direction.
    pub(crate) fn derive(ours: &DhKeyPair, theirs: &BigUint) -> Self {
        let (send_byte, receive_byte) = if ours.public() > theirs {
            (SEND_BYTE_HIGH, RECEIVE_BYTE_HIGH)
        } else {
            (SEND_BYTE_LOW, RECEIVE_BYTE_LOW)
        };

        let mut secret = ours.shared_secret(theirs);
        let mut secbytes = mpi(&secret);
        wipe_big(&mut secret);

        let mut sending_aes = [0u8; 16];
        sending_aes.copy_from_slice(&sha1(&[&[send_byte], &secbytes])[..16]);
        let mut receiving_aes = [0u8; 16];
        receiving_aes.copy_from_slice(&sha1(&[&[receive_byte], &secbytes])[..16]);

        let keys = Self {
            sending_mac: sha1(&[&sending_aes]),
            receiving_mac: sha1(&[&receiving_aes]),
            extra_key: sha256(&[&[EXTRA_KEY_BYTE], &secbytes]),
            sending_aes,
            receiving_aes,
        };
        secbytes.zeroize();
        keys
    }
}

/// Rotating Diffie-Hellman keys of an encrypted conversation.
///
/// Our keys are selected by `our_key_id` (current) or `our_key_id - 1`
/// (previous), theirs likewise. Messages are sent with our previous key and
/// their current key, advertising our current public value as the next key.
#[derive(Default)]
pub(crate) struct KeyManagement {
    our_key_id: u32,
    their_key_id: u32,
    our_current: Option<DhKeyPair>,
    our_previous: Option<DhKeyPair>,
    their_current: Option<BigUint>,
    their_previous: Option<BigUint>,
    counters: CounterHistory,
    mac_keys: MacKeyHistory,
    old_mac_keys: Vec<[u8; 20]>,
}

impl KeyManagement {
    /// Installs the keys agreed on during the key exchange and generates our
    /// next key pair.
    pub(crate) fn from_exchange(
        rng: &mut dyn RandomSource,
        ours: DhKeyPair,
        our_key_id: u32,
        theirs: BigUint,
        their_key_id: u32,
    ) -> Result<Self, Error> {
        let mut keys = Self::default();
        keys.our_key_id = our_key_id;
        keys.their_key_id = their_key_id;
        keys.our_current = Some(ours);
        keys.their_current = Some(theirs);
        keys.generate_next(rng)?;
        Ok(keys)
    }

    pub(crate) fn our_key_id(&self) -> u32 {
        self.our_key_id
    }

    pub(crate) fn their_key_id(&self) -> u32 {
        self.their_key_id
    }

    /// Key ids and next public value for an outgoing message.
    pub(crate) fn sending_ids(&self) -> Result<(u32, u32, BigUint), Error> {
        let current = self
            .our_current
            .as_ref()
            .ok_or_else(|| Error::Crypto("No current key".to_string()))?;
        Ok((
            self.our_key_id.wrapping_sub(1),
            self.their_key_id,
            current.public().clone(),
        ))
    }

    fn pick_our(&self, key_id: u32) -> Result<&DhKeyPair, Error> {
        if key_id == 0 || self.our_key_id == 0 {
            return Err(Error::Unreadable("Invalid key id".to_string()));
        }

        let key = if key_id == self.our_key_id {
            self.our_current.as_ref()
        } else if key_id == self.our_key_id - 1 {
            self.our_previous.as_ref()
        } else {
            None
        };
        key.ok_or_else(|| Error::Unreadable("Unexpected our key id".to_string()))
    }

    fn pick_their(&self, key_id: u32) -> Result<&BigUint, Error> {
        if key_id == 0 || self.their_key_id == 0 {
            return Err(Error::Unreadable("Invalid key id".to_string()));
        }

        if key_id == self.their_key_id {
            self.their_current
                .as_ref()
                .ok_or_else(|| Error::Unreadable("Their current key is not defined".to_string()))
        } else if key_id == self.their_key_id - 1 {
            self.their_previous
                .as_ref()
                .ok_or_else(|| Error::Unreadable("Their previous key is not defined".to_string()))
        } else {
            Err(Error::Unreadable("Unexpected their key id".to_string()))
        }
    }

    pub(crate) fn session_keys(
        &self,
        our_key_id: u32,
        their_key_id: u32,
    ) -> Result<SessionKeys, Error> {
        let ours = self.pick_our(our_key_id)?;
        let theirs = self.pick_their(their_key_id)?;
        Ok(SessionKeys::derive(ours, theirs))
    }

    pub(crate) fn next_sending_counter(&mut self, our_key_id: u32, their_key_id: u32) -> u64 {
        self.counters.next_sending(our_key_id, their_key_id)
    }

    pub(crate) fn check_counter(
        &self,
        our_key_id: u32,
        their_key_id: u32,
        counter: u64,
    ) -> Result<(), Error> {
        self.counters.check_receiving(our_key_id, their_key_id, counter)
    }

    /// Records a message that has been authenticated with the pair's keys.
    pub(crate) fn commit_received(
        &mut self,
        our_key_id: u32,
        their_key_id: u32,
        counter: u64,
        receiving_mac: [u8; 20],
    ) {
        self.counters.commit_receiving(our_key_id, their_key_id, counter);
        self.mac_keys.add(our_key_id, their_key_id, receiving_mac);
    }

    /// Advances the key ids after an authenticated data message.
    pub(crate) fn rotate(
        &mut self,
        rng: &mut dyn RandomSource,
        recipient_key_id: u32,
        sender_key_id: u32,
        next_key: BigUint,
    ) -> Result<(), Error> {
        if recipient_key_id == self.our_key_id {
            let revealed = self.mac_keys.forget_our_key(self.our_key_id.wrapping_sub(1));
            self.old_mac_keys.extend(revealed);
            self.generate_next(rng)?;
        }

        if sender_key_id == self.their_key_id {
            let revealed = self.mac_keys.forget_their_key(self.their_key_id.wrapping_sub(1));
            self.old_mac_keys.extend(revealed);
            if let Some(mut previous) = self.their_previous.take() {
                wipe_big(&mut previous);
            }
            self.their_previous = self.their_current.replace(next_key);
            self.their_key_id += 1;
            debug!(their_key_id = self.their_key_id, "Rotated their key");
        }

        self.counters.prune(
            self.our_key_id.saturating_sub(1),
            self.their_key_id.saturating_sub(1),
        );
        Ok(())
    }

    fn generate_next(&mut self, rng: &mut dyn RandomSource) -> Result<(), Error> {
        let next = DhKeyPair::generate(rng)?;
        self.our_previous = self.our_current.replace(next);
        self.our_key_id += 1;
        debug!(our_key_id = self.our_key_id, "Rotated our key");
        Ok(())
    }

    /// Takes the MAC keys waiting to be revealed in the next message.
    pub(crate) fn take_old_mac_keys(&mut self) -> Vec<u8> {
        let mut revealed = Vec::with_capacity(self.old_mac_keys.len() * 20);
        for key in &mut self.old_mac_keys {
            revealed.extend_from_slice(key);
            key.zeroize();
        }
        self.old_mac_keys.clear();
        revealed
    }

    /// Wipes everything except the MAC keys waiting to be revealed.
    pub(crate) fn wipe_keep_reveal(&mut self) {
        let old_mac_keys = std::mem::take(&mut self.old_mac_keys);
        self.zeroize();
        self.old_mac_keys = old_mac_keys;
    }

    #[cfg(test)]
    pub(crate) fn their_current(&self) -> Option<&BigUint> {
        self.their_current.as_ref()
    }

    #[cfg(test)]
    pub(crate) fn our_current(&self) -> Option<&DhKeyPair> {
        self.our_current.as_ref()
    }

    #[cfg(test)]
    pub(crate) fn revealable(&self) -> usize {
        self.old_mac_keys.len() + self.mac_keys.len()
    }
}

impl Zeroize for KeyManagement {
    fn zeroize(&mut self) {
        self.our_key_id = 0;
        self.their_key_id = 0;
        self.our_current = None;
        self.our_previous = None;
        if let Some(key) = self.their_current.as_mut() {
            wipe_big(key);
        }
        if let Some(key) = self.their_previous.as_mut() {
            wipe_big(key);
        }
        self.their_current = None;
        self.their_previous = None;
        self.counters.clear();
        self.mac_keys.zeroize();
        self.old_mac_keys.zeroize();
    }
}

impl Drop for KeyManagement {
    fn drop(&mut self) {
        self.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    /// Two contexts as they stand right after a completed key exchange.
    fn create_pair(rng: &mut StdRng) -> (KeyManagement, KeyManagement) {
        let alice_ake = DhKeyPair::generate(rng).unwrap();
        let bob_ake = DhKeyPair::generate(rng).unwrap();
        let alice_pub = alice_ake.public().clone();
        let bob_pub = bob_ake.public().clone();

        let alice = KeyManagement::from_exchange(rng, alice_ake, 1, bob_pub, 1).unwrap();
        let bob = KeyManagement::from_exchange(rng, bob_ake, 1, alice_pub, 1).unwrap();
        (alice, bob)
    }

    #[test]
    fn test_session_keys_mirror() {
        let mut rng = StdRng::seed_from_u64(100);
        let (alice, bob) = create_pair(&mut rng);

        let (sender, recipient, _) = alice.sending_ids().unwrap();
        assert_eq!((sender, recipient), (1, 1));

        let alice_keys = alice.session_keys(sender, recipient).unwrap();
        let bob_keys = bob.session_keys(recipient, sender).unwrap();

        assert_eq!(alice_keys.sending_aes, bob_keys.receiving_aes);
        assert_eq!(alice_keys.sending_mac, bob_keys.receiving_mac);
        assert_eq!(alice_keys.receiving_aes, bob_keys.sending_aes);
        assert_eq!(alice_keys.extra_key, bob_keys.extra_key);
        assert_ne!(alice_keys.sending_aes, alice_keys.receiving_aes);
    }

    #[test]
    fn test_unknown_key_ids_conflict() {
        let mut rng = StdRng::seed_from_u64(101);
        let (alice, _) = create_pair(&mut rng);

        let conflict =
            |result: Result<SessionKeys, Error>| matches!(result, Err(err) if err.is_conflict());

        assert!(conflict(alice.session_keys(0, 1)));
        assert!(conflict(alice.session_keys(5, 1)));
        assert!(conflict(alice.session_keys(1, 0)));
        assert!(conflict(alice.session_keys(2, 3)));
        assert!(alice.session_keys(1, 1).is_ok());
    }

    #[test]
    fn test_rotation_is_idempotent_for_duplicate_ids() {
        let mut rng = StdRng::seed_from_u64(102);
        let (mut alice, mut bob) = create_pair(&mut rng);

        // Bob receives from Alice: sender 1, recipient 1
        let (sender, recipient, next) = alice.sending_ids().unwrap();
        bob.rotate(&mut rng, recipient, sender, next.clone()).unwrap();
        assert_eq!(bob.our_key_id(), 2);
        assert_eq!(bob.their_key_id(), 2);

        // The same acknowledgement again changes nothing
        bob.rotate(&mut rng, recipient, sender, next).unwrap();
        assert_eq!(bob.our_key_id(), 2);
        assert_eq!(bob.their_key_id(), 2);

        // Alice receives Bob's reply: sender 1, recipient 2
        let (sender, recipient, next) = bob.sending_ids().unwrap();
        assert_eq!((sender, recipient), (1, 2));
        let before = alice.our_current().unwrap().public().clone();
        alice.rotate(&mut rng, recipient, sender, next.clone()).unwrap();
        assert_eq!(alice.our_key_id(), 3);
        assert_ne!(alice.our_current().unwrap().public(), &before);

        alice.rotate(&mut rng, recipient, sender, next).unwrap();
        assert_eq!(alice.our_key_id(), 3);
    }

    #[test]
    fn test_old_mac_keys_revealed_after_rotation() {
        let mut rng = StdRng::seed_from_u64(103);
        let (mut alice, mut bob) = create_pair(&mut rng);

        let (sender, recipient, next) = alice.sending_ids().unwrap();
        let keys = bob.session_keys(recipient, sender).unwrap();
        bob.commit_received(recipient, sender, 1, keys.receiving_mac);
        bob.rotate(&mut rng, recipient, sender, next).unwrap();
        assert!(bob.take_old_mac_keys().is_empty());

        // Alice's acknowledgement of Bob's key retires Bob's key 1 on her side
        let (b_sender, b_recipient, b_next) = bob.sending_ids().unwrap();
        let keys = alice.session_keys(b_recipient, b_sender).unwrap();
        alice.commit_received(b_recipient, b_sender, 1, keys.receiving_mac);
        alice.rotate(&mut rng, b_recipient, b_sender, b_next).unwrap();

        // Alice now acknowledges Bob's key 2, so Bob forgets keys used with his key 1
        let (sender, recipient, next) = alice.sending_ids().unwrap();
        assert_eq!((sender, recipient), (2, 2));
        bob.rotate(&mut rng, recipient, sender, next).unwrap();
        let revealed = bob.take_old_mac_keys();
        assert_eq!(revealed.len(), 20);
        assert!(bob.take_old_mac_keys().is_empty());
    }

    #[test]
    fn test_wipe_keeps_reveal_keys() {
        let mut rng = StdRng::seed_from_u64(104);
        let (_, mut bob) = create_pair(&mut rng);
        bob.old_mac_keys.push([9; 20]);
        bob.wipe_keep_reveal();

        assert_eq!(bob.our_key_id(), 0);
        assert!(bob.their_current().is_none());
        assert_eq!(bob.revealable(), 1);
    }
}
