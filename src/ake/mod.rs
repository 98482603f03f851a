mod message;

use crate::Error;
use crate::codec::{Reader, append_data, append_mpi, append_word, mpi};
use crate::crypto::{
    RandomSource, aes_ctr, ct_eq, hmac_sha256, is_group_element, random_bytes, sha256,
};
use crate::types::{DhKeyPair, PrivateKey, PublicKey};
use crate::version::{MSG_DH_COMMIT, MSG_DH_KEY, MSG_REVEAL_SIG, MSG_SIG};
use message::{DhCommit, DhKey, MAC_LEN, RevealSig, SignedPart};
use num_bigint::BigUint;
use std::time::Instant;
use tracing::{debug, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Key id of the Diffie-Hellman key used during the exchange.
const AKE_KEY_ID: u32 = 1;

const ZERO_IV: [u8; 16] = [0; 16];

/// Progress of the authenticated key exchange.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) enum AuthState {
    /// No exchange in progress.
    #[default]
    None,
    /// We sent a D-H Commit and wait for the D-H Key.
    AwaitingDhKey,
    /// We sent a D-H Key and wait for the Reveal Signature.
    AwaitingRevealSig,
    /// We sent a Reveal Signature and wait for the Signature.
    AwaitingSig,
}

/// Encryption and MAC keys protecting one signature message.
#[derive(Clone, Default, Zeroize, ZeroizeOnDrop)]
struct AkeKeys {
    c: [u8; 16],
    m1: [u8; 32],
    m2: [u8; 32],
}

#[derive(Clone, Default, Zeroize, ZeroizeOnDrop)]
struct DerivedKeys {
    ssid: [u8; 8],
    reveal: AkeKeys,
    sig: AkeKeys,
}

impl DerivedKeys {
    fn new(shared_secret: &BigUint) -> Self {
        let mut secbytes = mpi(shared_secret);
        let h = |b: u8| sha256(&[&[b], &secbytes]);

        let mut keys = Self::default();
        keys.ssid.copy_from_slice(&h(0x00)[..8]);
        let c = h(0x01);
        keys.reveal.c.copy_from_slice(&c[..16]);
        keys.sig.c.copy_from_slice(&c[16..]);
        keys.reveal.m1 = h(0x02);
        keys.reveal.m2 = h(0x03);
        keys.sig.m1 = h(0x04);
        keys.sig.m2 = h(0x05);

        secbytes.zeroize();
        keys
    }
}

/// The outcome of a completed key exchange.
pub(crate) struct Completed {
    pub(crate) ours: DhKeyPair,
    pub(crate) our_key_id: u32,
    pub(crate) their_public: BigUint,
    pub(crate) their_key_id: u32,
    pub(crate) their_key: PublicKey,
    pub(crate) ssid: [u8; 8],
}

/// What handling one key exchange message produced.
#[derive(Default)]
pub(crate) struct AkeStep {
    /// Message type and body to send back.
    pub(crate) reply: Option<(u8, Vec<u8>)>,
    pub(crate) completed: Option<Completed>,
}

impl AkeStep {
    fn reply(message_type: u8, body: Vec<u8>) -> Self {
        Self {
            reply: Some((message_type, body)),
            completed: None,
        }
    }
}

/// State of the authenticated key exchange.
///
/// The initiator (x) sends D-H Commit and Reveal Signature, the responder
/// (y) sends D-H Key and Signature. Every incoming message is either fully
/// processed or rejected without touching the state.
#[derive(Default)]
pub(crate) struct Ake {
    state: AuthState,
    ours: Option<DhKeyPair>,
    their_public: Option<BigUint>,
    r: [u8; 16],
    /// Our commitment when initiating, theirs when responding.
    commit: Option<DhCommit>,
    keys: Option<DerivedKeys>,
    reveal_sig: Option<Vec<u8>>,
    last_state_change: Option<Instant>,
}

impl Ake {
    #[cfg(test)]
    pub(crate) fn state(&self) -> AuthState {
        self.state
    }

    pub(crate) fn last_state_change(&self) -> Option<Instant> {
        self.last_state_change
    }

    fn set_state(&mut self, state: AuthState) {
        debug!(from = ?self.state, to = ?state, "Key exchange state change");
        self.state = state;
        self.last_state_change = Some(Instant::now());
    }

    /// Forgets the exchange in progress.
    pub(crate) fn reset(&mut self) {
        let last_state_change = self.last_state_change;
        *self = Self::default();
        self.last_state_change = last_state_change;
    }

    /// Starts a new exchange as initiator and returns the D-H Commit body.
    pub(crate) fn start(&mut self, rng: &mut dyn RandomSource) -> Result<Vec<u8>, Error> {
        let ours = DhKeyPair::generate(rng)?;
        let mut r = [0u8; 16];
        r.copy_from_slice(&random_bytes(rng, 16)?);

        let gx = mpi(ours.public());
        let commit = DhCommit {
            encrypted_gx: aes_ctr(&r, &ZERO_IV, &gx)?,
            hashed_gx: sha256(&[&gx]).to_vec(),
        };
        let body = commit.to_bytes();

        self.reset();
        self.ours = Some(ours);
        self.r = r;
        r.zeroize();
        self.commit = Some(commit);
        self.set_state(AuthState::AwaitingDhKey);
        Ok(body)
    }

    /// The D-H Commit we are waiting on an answer for, if any.
    pub(crate) fn pending_commit(&self) -> Option<Vec<u8>> {
        match (self.state, &self.commit) {
            (AuthState::AwaitingDhKey, Some(commit)) => Some(commit.to_bytes()),
            _ => None,
        }
    }

    pub(crate) fn receive(
        &mut self,
        rng: &mut dyn RandomSource,
        our_key: &PrivateKey,
        message_type: u8,
        body: &[u8],
    ) -> Result<AkeStep, Error> {
        let step = match message_type {
            MSG_DH_COMMIT => self.receive_dh_commit(rng, body),
            MSG_DH_KEY => self.receive_dh_key(our_key, body),
            MSG_REVEAL_SIG => self.receive_reveal_sig(our_key, body),
            MSG_SIG => self.receive_sig(body),
            _ => Err(Error::Malformed(format!(
                "Unknown message type 0x{message_type:02X}"
            ))),
        };

        if let Err(err) = &step {
            warn!(%err, state = ?self.state, "Rejected key exchange message");
        }
        step
    }

    fn receive_dh_commit(
        &mut self,
        rng: &mut dyn RandomSource,
        body: &[u8],
    ) -> Result<AkeStep, Error> {
        let theirs = DhCommit::from_bytes(body)?;

        match self.state {
            AuthState::AwaitingDhKey => {
                if let Some(ours) = &self.commit {
                    // The commitment with the larger hash wins
                    if ours.hashed_gx > theirs.hashed_gx {
                        return Ok(AkeStep::reply(MSG_DH_COMMIT, ours.to_bytes()));
                    }
                }
                self.respond_to_commit(rng, theirs)
            }
            AuthState::AwaitingRevealSig => {
                let ours = self.ours.as_ref().ok_or(Error::Session)?;
                let reply = DhKey {
                    gy: ours.public().clone(),
                };
                self.commit = Some(theirs);
                Ok(AkeStep::reply(MSG_DH_KEY, reply.to_bytes()))
            }
            AuthState::None | AuthState::AwaitingSig => self.respond_to_commit(rng, theirs),
        }
    }

    fn respond_to_commit(
        &mut self,
        rng: &mut dyn RandomSource,
        theirs: DhCommit,
    ) -> Result<AkeStep, Error> {
        let ours = DhKeyPair::generate(rng)?;
        let reply = DhKey {
            gy: ours.public().clone(),
        };

        self.reset();
        self.ours = Some(ours);
        self.commit = Some(theirs);
        self.set_state(AuthState::AwaitingRevealSig);
        Ok(AkeStep::reply(MSG_DH_KEY, reply.to_bytes()))
    }

    fn receive_dh_key(&mut self, our_key: &PrivateKey, body: &[u8]) -> Result<AkeStep, Error> {
        let DhKey { gy } = DhKey::from_bytes(body)?;
        if !is_group_element(&gy) {
            return Err(Error::Protocol("DH value out of range".to_string()));
        }

        match self.state {
            AuthState::AwaitingDhKey => {
                let ours = self.ours.as_ref().ok_or(Error::Session)?;
                let keys = DerivedKeys::new(&ours.shared_secret(&gy));
                let signed = sign(our_key, &keys.reveal, ours.public(), &gy)?;
                let body = RevealSig { r: self.r, signed }.to_bytes();

                self.their_public = Some(gy);
                self.keys = Some(keys);
                self.reveal_sig = Some(body.clone());
                self.set_state(AuthState::AwaitingSig);
                Ok(AkeStep::reply(MSG_REVEAL_SIG, body))
            }
            AuthState::AwaitingSig if self.their_public.as_ref() == Some(&gy) => {
                // A repeated D-H Key means our Reveal Signature got lost
                Ok(self
                    .reveal_sig
                    .clone()
                    .map(|body| AkeStep::reply(MSG_REVEAL_SIG, body))
                    .unwrap_or_default())
            }
            _ => Ok(AkeStep::default()),
        }
    }

    fn receive_reveal_sig(&mut self, our_key: &PrivateKey, body: &[u8]) -> Result<AkeStep, Error> {
        if self.state != AuthState::AwaitingRevealSig {
            return Ok(AkeStep::default());
        }

        let message = RevealSig::from_bytes(body)?;
        let commit = self.commit.as_ref().ok_or(Error::Session)?;
        let ours = self.ours.as_ref().ok_or(Error::Session)?;

        let gx_mpi = aes_ctr(&message.r, &ZERO_IV, &commit.encrypted_gx)?;
        if !ct_eq(&sha256(&[&gx_mpi]), &commit.hashed_gx) {
            return Err(Error::Authentication("Commitment does not match".to_string()));
        }

        let mut reader = Reader::new(&gx_mpi);
        let gx = reader.mpi()?;
        reader.finish()?;
        if !is_group_element(&gx) {
            return Err(Error::Protocol("DH value out of range".to_string()));
        }

        let keys = DerivedKeys::new(&ours.shared_secret(&gx));
        let (their_key, their_key_id) = verify(&keys.reveal, &message.signed, &gx, ours.public())?;
        let reply = sign(our_key, &keys.sig, ours.public(), &gx)?.to_bytes();

        let ours = self.ours.take().ok_or(Error::Session)?;
        let completed = Completed {
            ours,
            our_key_id: AKE_KEY_ID,
            their_public: gx,
            their_key_id,
            their_key,
            ssid: keys.ssid,
        };
        self.reset();
        self.set_state(AuthState::None);

        Ok(AkeStep {
            reply: Some((MSG_SIG, reply)),
            completed: Some(completed),
        })
    }

    fn receive_sig(&mut self, body: &[u8]) -> Result<AkeStep, Error> {
        if self.state != AuthState::AwaitingSig {
            return Ok(AkeStep::default());
        }

        let signed = SignedPart::from_bytes(body)?;
        let keys = self.keys.as_ref().ok_or(Error::Session)?;
        let ours = self.ours.as_ref().ok_or(Error::Session)?;
        let gy = self.their_public.as_ref().ok_or(Error::Session)?;

        let (their_key, their_key_id) = verify(&keys.sig, &signed, gy, ours.public())?;
        let ssid = keys.ssid;

        let ours = self.ours.take().ok_or(Error::Session)?;
        let their_public = self.their_public.take().ok_or(Error::Session)?;
        let completed = Completed {
            ours,
            our_key_id: AKE_KEY_ID,
            their_public,
            their_key_id,
            their_key,
            ssid,
        };
        self.reset();
        self.set_state(AuthState::None);

        Ok(AkeStep {
            reply: None,
            completed: Some(completed),
        })
    }
}

impl Drop for Ake {
    fn drop(&mut self) {
        self.r.zeroize();
    }
}

/// HMAC over both public values, the signer's long-term key and key id.
fn signed_data(
    keys: &AkeKeys,
    signer_dh: &BigUint,
    other_dh: &BigUint,
    signer_key: &PublicKey,
    key_id: u32,
) -> Result<[u8; 32], Error> {
    let mut data = Vec::new();
    append_mpi(&mut data, signer_dh);
    append_mpi(&mut data, other_dh);
    data.extend_from_slice(&signer_key.to_bytes());
    append_word(&mut data, key_id);
    hmac_sha256(&keys.m1, &data)
}

fn truncated_mac(keys: &AkeKeys, encrypted_sig: &[u8]) -> Result<[u8; MAC_LEN], Error> {
    let mut mac = [0u8; MAC_LEN];
    mac.copy_from_slice(&hmac_sha256(&keys.m2, encrypted_sig)?[..MAC_LEN]);
    Ok(mac)
}

/// Builds the encrypted signature over our values and its MAC.
fn sign(
    our_key: &PrivateKey,
    keys: &AkeKeys,
    our_dh: &BigUint,
    their_dh: &BigUint,
) -> Result<SignedPart, Error> {
    let hash = signed_data(keys, our_dh, their_dh, our_key.public_key(), AKE_KEY_ID)?;

    let mut x = our_key.public_key().to_bytes();
    append_word(&mut x, AKE_KEY_ID);
    x.extend_from_slice(&our_key.sign(&hash)?);

    let mut encrypted_sig = Vec::new();
    append_data(&mut encrypted_sig, &aes_ctr(&keys.c, &ZERO_IV, &x)?);
    let mac = truncated_mac(keys, &encrypted_sig)?;

    Ok(SignedPart { encrypted_sig, mac })
}

/// Checks the MAC, decrypts and verifies the peer's signature.
fn verify(
    keys: &AkeKeys,
    signed: &SignedPart,
    their_dh: &BigUint,
    our_dh: &BigUint,
) -> Result<(PublicKey, u32), Error> {
    let mac = truncated_mac(keys, &signed.encrypted_sig)?;
    if !ct_eq(&mac, &signed.mac) {
        return Err(Error::Authentication("Bad signature MAC".to_string()));
    }

    let x = aes_ctr(&keys.c, &ZERO_IV, signed.ciphertext())?;
    let mut reader = Reader::new(&x);
    let their_key = PublicKey::read(&mut reader)?;
    let their_key_id = reader.word()?;
    let signature = reader.rest();

    if their_key_id == 0 {
        return Err(Error::Protocol("Key id must not be zero".to_string()));
    }

    let hash = signed_data(keys, their_dh, our_dh, &their_key, their_key_id)?;
    their_key.verify(&hash, signature)?;
    Ok((their_key, their_key_id))
}
