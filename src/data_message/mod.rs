mod tlv;

pub(crate) use tlv::*;

use crate::Error;
use crate::codec::{Reader, append_data, append_mpi, append_word};
use crate::crypto::{aes_ctr, ct_eq, hmac_sha1, is_group_element};
use crate::keys::KeyManagement;
use num_bigint::BigUint;
use tracing::trace;

/// Asks the receiver not to report the message if it cannot be read.
pub(crate) const FLAG_IGNORE_UNREADABLE: u8 = 0x01;

const MAC_LEN: usize = 20;

fn invalid() -> Error {
    Error::Malformed("Invalid data message".to_string())
}

/// An encrypted data message, without the protocol header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct DataMessage {
    pub(crate) flags: u8,
    pub(crate) sender_key_id: u32,
    pub(crate) recipient_key_id: u32,
    pub(crate) next_key: BigUint,
    pub(crate) counter: u64,
    pub(crate) ciphertext: Vec<u8>,
    pub(crate) mac: [u8; MAC_LEN],
    pub(crate) old_mac_keys: Vec<u8>,
}

impl DataMessage {
    /// The part covered by the MAC, once prefixed with the header.
    fn authenticated_part(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.ciphertext.len() + 220);
        out.push(self.flags);
        append_word(&mut out, self.sender_key_id);
        append_word(&mut out, self.recipient_key_id);
        append_mpi(&mut out, &self.next_key);
        out.extend_from_slice(&self.counter.to_be_bytes());
        append_data(&mut out, &self.ciphertext);
        out
    }

    fn compute_mac(&self, header: &[u8], mac_key: &[u8]) -> Result<[u8; MAC_LEN], Error> {
        let mut data = header.to_vec();
        data.extend_from_slice(&self.authenticated_part());
        hmac_sha1(mac_key, &data)
    }

    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.authenticated_part();
        out.extend_from_slice(&self.mac);
        append_data(&mut out, &self.old_mac_keys);
        out
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let mut reader = Reader::new(bytes);
        let flags = reader.byte()?;
        let sender_key_id = reader.word()?;
        let recipient_key_id = reader.word()?;
        let next_key = reader.mpi()?;
        let counter = u64::from_be_bytes(reader.fixed(8)?.try_into().map_err(|_| invalid())?);
        let ciphertext = reader.data()?.to_vec();
        let mac = reader.fixed(MAC_LEN)?.try_into().map_err(|_| invalid())?;
        let old_mac_keys = reader.data()?.to_vec();
        reader.finish()?;

        if counter == 0 || old_mac_keys.len() % MAC_LEN != 0 || !is_group_element(&next_key) {
            return Err(invalid());
        }

        Ok(Self {
            flags,
            sender_key_id,
            recipient_key_id,
            next_key,
            counter,
            ciphertext,
            mac,
            old_mac_keys,
        })
    }
}

/// Reads the flags of a data message body without parsing the rest.
pub(crate) fn peek_flags(body: &[u8]) -> u8 {
    body.first().copied().unwrap_or_default()
}

fn counter_iv(counter: u64) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[..8].copy_from_slice(&counter.to_be_bytes());
    iv
}

/// Encrypts and authenticates `plaintext` with the current sending keys.
///
/// Returns the message body that follows `header` on the wire. MAC keys
/// queued for revealing are attached and cleared.
pub(crate) fn seal(
    keys: &mut KeyManagement,
    header: &[u8],
    flags: u8,
    plaintext: &[u8],
) -> Result<Vec<u8>, Error> {
    let (sender_key_id, recipient_key_id, next_key) = keys.sending_ids()?;
    let session = keys.session_keys(sender_key_id, recipient_key_id)?;
    let counter = keys.next_sending_counter(sender_key_id, recipient_key_id);

    let mut message = DataMessage {
        flags,
        sender_key_id,
        recipient_key_id,
        next_key,
        counter,
        ciphertext: aes_ctr(&session.sending_aes, &counter_iv(counter), plaintext)?,
        mac: [0; MAC_LEN],
        old_mac_keys: Vec::new(),
    };
    message.mac = message.compute_mac(header, &session.sending_mac)?;
    message.old_mac_keys = keys.take_old_mac_keys();

    trace!(sender_key_id, recipient_key_id, counter, "Sealed data message");
    Ok(message.to_bytes())
}

/// A data message that passed authentication.
pub(crate) struct Opened {
    pub(crate) message: DataMessage,
    pub(crate) plaintext: Vec<u8>,
    pub(crate) extra_key: [u8; 32],
}

/// Authenticates and decrypts a data message body.
///
/// 1. Parse the body and check the counter has not been seen.
/// 2. Derive the keys for the announced key ids.
/// 3. Check the MAC in constant time.
/// 4. Only then record the counter and MAC key, and decrypt.
///
/// Any failure before step 4 leaves `keys` untouched.
pub(crate) fn open(keys: &mut KeyManagement, header: &[u8], body: &[u8]) -> Result<Opened, Error> {
    let message = DataMessage::from_bytes(body)?;
    let (our_key_id, their_key_id) = (message.recipient_key_id, message.sender_key_id);

    keys.check_counter(our_key_id, their_key_id, message.counter)?;
    let session = keys.session_keys(our_key_id, their_key_id)?;

    let mac = message.compute_mac(header, &session.receiving_mac)?;
    if !ct_eq(&mac, &message.mac) {
        return Err(Error::Unreadable("Bad MAC".to_string()));
    }

    keys.commit_received(our_key_id, their_key_id, message.counter, session.receiving_mac);
    let plaintext = aes_ctr(
        &session.receiving_aes,
        &counter_iv(message.counter),
        &message.ciphertext,
    )?;

    Ok(Opened {
        plaintext,
        extra_key: session.extra_key,
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DhKeyPair;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    const HEADER: &[u8] = &[0, 3, 3, 0, 0, 1, 0, 0, 0, 2, 0];

    fn create_keys(rng: &mut StdRng) -> (KeyManagement, KeyManagement) {
        let alice_ake = DhKeyPair::generate(rng).unwrap();
        let bob_ake = DhKeyPair::generate(rng).unwrap();
        let alice_pub = alice_ake.public().clone();
        let bob_pub = bob_ake.public().clone();
        (
            KeyManagement::from_exchange(rng, alice_ake, 1, bob_pub, 1).unwrap(),
            KeyManagement::from_exchange(rng, bob_ake, 1, alice_pub, 1).unwrap(),
        )
    }

    #[test]
    fn test_seal_and_open() {
        let mut rng = StdRng::seed_from_u64(300);
        let (mut alice, mut bob) = create_keys(&mut rng);

        let body = seal(&mut alice, HEADER, 0, b"hello bob").unwrap();
        let opened = open(&mut bob, HEADER, &body).unwrap();
        assert_eq!(opened.plaintext, b"hello bob");
        assert_eq!(opened.message.counter, 1);
        assert_eq!(opened.message.sender_key_id, 1);
        assert_eq!(opened.message.recipient_key_id, 1);
    }

    #[test]
    fn test_replayed_message_is_unreadable() {
        let mut rng = StdRng::seed_from_u64(301);
        let (mut alice, mut bob) = create_keys(&mut rng);

        let body = seal(&mut alice, HEADER, 0, b"once").unwrap();
        open(&mut bob, HEADER, &body).unwrap();
        let replay = open(&mut bob, HEADER, &body);
        assert!(matches!(replay, Err(Error::Unreadable(_))));
    }

    #[test]
    fn test_bad_mac_does_not_commit_counter() {
        let mut rng = StdRng::seed_from_u64(302);
        let (mut alice, mut bob) = create_keys(&mut rng);

        let body = seal(&mut alice, HEADER, 0, b"payload").unwrap();
        let mut tampered = body.clone();
        // Flip a ciphertext bit, the ciphertext ends 20 + 4 bytes before the end
        let index = tampered.len() - 25;
        tampered[index] ^= 0x01;

        assert!(matches!(
            open(&mut bob, HEADER, &tampered),
            Err(Error::Unreadable(_))
        ));
        assert_eq!(open(&mut bob, HEADER, &body).unwrap().plaintext, b"payload");
    }

    #[test]
    fn test_header_is_authenticated() {
        let mut rng = StdRng::seed_from_u64(303);
        let (mut alice, mut bob) = create_keys(&mut rng);

        let body = seal(&mut alice, HEADER, 0, b"payload").unwrap();
        let mut header = HEADER.to_vec();
        header[4] ^= 0x01;
        assert!(open(&mut bob, &header, &body).is_err());
    }

    #[test]
    fn test_zero_counter_is_malformed() {
        let message = DataMessage {
            flags: FLAG_IGNORE_UNREADABLE,
            sender_key_id: 1,
            recipient_key_id: 1,
            next_key: BigUint::from(5u32),
            counter: 0,
            ciphertext: vec![1, 2, 3],
            mac: [0; 20],
            old_mac_keys: Vec::new(),
        };
        let bytes = message.to_bytes();
        assert_eq!(peek_flags(&bytes), FLAG_IGNORE_UNREADABLE);
        assert!(matches!(
            DataMessage::from_bytes(&bytes),
            Err(Error::Malformed(_))
        ));
    }

    #[test]
    fn test_parse_rejects_trailing_bytes() {
        let message = DataMessage {
            flags: 0,
            sender_key_id: 2,
            recipient_key_id: 3,
            next_key: BigUint::from(5u32),
            counter: 9,
            ciphertext: vec![1, 2, 3],
            mac: [7; 20],
            old_mac_keys: vec![4; 40],
        };
        let mut bytes = message.to_bytes();
        assert_eq!(DataMessage::from_bytes(&bytes).unwrap(), message);

        bytes.push(0);
        assert!(DataMessage::from_bytes(&bytes).is_err());
    }
}
