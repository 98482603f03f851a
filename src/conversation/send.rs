use super::{Conversation, MessageState, WhitespaceState};
use crate::Error;
use crate::codec::append_whitespace_tag;
use crate::data_message::{
    FLAG_IGNORE_UNREADABLE, TLV_DISCONNECTED, TLV_EXTRA_SYMMETRIC_KEY, Tlv,
};
use crate::event::{ErrorCode, MessageEvent, SecurityEvent};
use crate::keys::KeyManagement;
use tracing::{debug, error};

impl Conversation {
    /// Prepares `message` for the transport.
    ///
    /// In a private conversation the message is encrypted and fragmented.
    /// Otherwise it goes out as plaintext, possibly with a whitespace tag,
    /// unless the policies require encryption: then the message is held back
    /// until a key exchange completes and [`Error::EncryptionRequired`] is
    /// returned.
    ///
    /// If encryption fails the message is never sent in the clear. When an
    /// error message handler provides a text for
    /// [`ErrorCode::EncryptionError`], that `?OTR Error:` message is returned
    /// in its place; otherwise the failure is returned.
    pub fn send(&mut self, message: &[u8]) -> Result<Vec<Vec<u8>>, Error> {
        match self.msg_state {
            MessageState::Plaintext => {
                let policies = self.config.policies;
                if policies.require_encryption {
                    self.message_event(
                        MessageEvent::EncryptionRequired,
                        Some(message),
                        Some(&Error::EncryptionRequired),
                    );
                    self.resend.queue(message, self.config.resend_interval);
                    return Err(Error::EncryptionRequired);
                }

                if policies.send_whitespace_tag && self.whitespace != WhitespaceState::Rejected {
                    self.whitespace = WhitespaceState::Sent;
                    return Ok(vec![append_whitespace_tag(message, policies.versions())]);
                }
                Ok(vec![message.to_vec()])
            }
            MessageState::Encrypted => match self.data_message(message, 0, &[]) {
                Ok(to_send) => {
                    self.resend.remember_sent(message);
                    Ok(to_send)
                }
                Err(err) => {
                    error!(%err, "Could not encrypt message");
                    self.message_event(MessageEvent::EncryptionError, Some(message), Some(&err));
                    let reply = self.error_reply(ErrorCode::EncryptionError);
                    if reply.is_empty() {
                        Err(err)
                    } else {
                        Ok(reply)
                    }
                }
            },
            MessageState::Finished => {
                self.message_event(
                    MessageEvent::ConnectionEnded,
                    Some(message),
                    Some(&Error::Finished),
                );
                Err(Error::Finished)
            }
        }
    }

    /// Ends the private conversation and returns to plaintext.
    ///
    /// From the encrypted state the peer is told with a disconnect message.
    /// Failing to build it does not stop the conversation from ending.
    pub fn end(&mut self) -> Result<Vec<Vec<u8>>, Error> {
        match self.msg_state {
            MessageState::Plaintext => Ok(Vec::new()),
            MessageState::Finished => {
                self.msg_state = MessageState::Plaintext;
                self.keys = KeyManagement::default();
                debug!("Left finished conversation");
                Ok(Vec::new())
            }
            MessageState::Encrypted => {
                self.smp.reset();
                let disconnect = Tlv::new(TLV_DISCONNECTED, Vec::new());
                let to_send = self
                    .data_message(b"", FLAG_IGNORE_UNREADABLE, &[disconnect])
                    .unwrap_or_else(|err| {
                        error!(%err, "Could not build the disconnect message");
                        Vec::new()
                    });

                self.msg_state = MessageState::Plaintext;
                self.keys = KeyManagement::default();
                debug!("Ended private conversation");
                self.security_event(SecurityEvent::GoneInsecure);
                Ok(to_send)
            }
        }
    }

    /// Starts authenticating the peer with a secret both sides know.
    ///
    /// The optional question is shown to the peer. A run already in progress
    /// is aborted first.
    pub fn start_authenticate(
        &mut self,
        question: Option<&str>,
        secret: &[u8],
    ) -> Result<Vec<Vec<u8>>, Error> {
        self.require_encrypted()?;
        let context = self.smp_context()?;
        let tlvs = self.smp.start(&mut *self.rng, &context, question, secret)?;
        self.data_message(b"", FLAG_IGNORE_UNREADABLE, &tlvs)
    }

    /// Answers the peer's authentication request with our secret.
    pub fn provide_authentication_secret(&mut self, secret: &[u8]) -> Result<Vec<Vec<u8>>, Error> {
        self.require_encrypted()?;
        let context = self.smp_context()?;
        let tlv = self.smp.provide_secret(&mut *self.rng, &context, secret)?;
        self.data_message(b"", FLAG_IGNORE_UNREADABLE, &[tlv])
    }

    /// Aborts the authentication in progress and tells the peer.
    pub fn abort_authentication(&mut self) -> Result<Vec<Vec<u8>>, Error> {
        self.require_encrypted()?;
        let tlv = self.smp.abort();
        self.data_message(b"", FLAG_IGNORE_UNREADABLE, &[tlv])
    }

    /// Returns the extra symmetric key of the current keys, and a message
    /// telling the peer to use it for `usage`.
    ///
    /// The peer's [`ReceivedKeyHandler`](crate::ReceivedKeyHandler) gets the
    /// same key together with `usage` and `usage_data`.
    pub fn use_extra_symmetric_key(
        &mut self,
        usage: u32,
        usage_data: &[u8],
    ) -> Result<([u8; 32], Vec<Vec<u8>>), Error> {
        self.require_encrypted()?;
        let (our_key_id, their_key_id, _) = self.keys.sending_ids()?;
        let key = self.keys.session_keys(our_key_id, their_key_id)?.extra_key;

        let mut value = usage.to_be_bytes().to_vec();
        value.extend_from_slice(usage_data);
        let tlv = Tlv::new(TLV_EXTRA_SYMMETRIC_KEY, value);
        let to_send = self.data_message(b"", 0, &[tlv])?;
        Ok((key, to_send))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ConversationConfig, Policies, ReceivedKeyHandler};
    use crate::types::PrivateKey;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::sync::{Arc, Mutex};

    type Keys = Arc<Mutex<Vec<(u32, Vec<u8>, [u8; 32])>>>;

    struct KeyRecorder(Keys);

    impl ReceivedKeyHandler for KeyRecorder {
        fn handle_received_key(&self, usage: u32, usage_data: &[u8], key: &[u8; 32]) {
            self.0.lock().unwrap().push((usage, usage_data.to_vec(), *key));
        }
    }

    fn create_conversation(seed: u64, config: ConversationConfig) -> Conversation {
        let mut rng = StdRng::seed_from_u64(seed);
        let key = PrivateKey::generate_with(&mut rng).unwrap();
        Conversation::with_rng(vec![key], Some(config), Box::new(rng)).unwrap()
    }

    fn go_private() -> (Conversation, Conversation) {
        let mut alice = create_conversation(700, ConversationConfig::default());
        let mut bob = create_conversation(701, ConversationConfig::default());

        let mut to_bob = vec![alice.query_message()];
        while !to_bob.is_empty() {
            let mut to_alice = Vec::new();
            for message in to_bob.drain(..) {
                to_alice.extend(bob.receive(&message).unwrap().to_send);
            }
            for message in to_alice {
                to_bob.extend(alice.receive(&message).unwrap().to_send);
            }
        }
        (alice, bob)
    }

    #[test]
    fn test_plaintext_send() {
        let mut alice = create_conversation(702, ConversationConfig::default());
        assert_eq!(alice.send(b"hello").unwrap(), vec![b"hello".to_vec()]);
        assert!(alice.end().unwrap().is_empty());
    }

    #[test]
    fn test_whitespace_tag_appended() {
        let config = ConversationConfig {
            policies: Policies {
                send_whitespace_tag: true,
                allow_v2: false,
                ..Policies::default()
            },
            ..ConversationConfig::default()
        };
        let mut alice = create_conversation(703, config);

        let sent = alice.send(b"hello").unwrap();
        let (text, versions) = crate::extract_whitespace_tag(&sent[0]).unwrap();
        assert_eq!(text, b"hello");
        assert_eq!(versions, alice.config().policies.versions());
    }

    #[test]
    fn test_end_forgets_session() {
        let (mut alice, _) = go_private();
        assert!(alice.ssid().is_some());

        let to_send = alice.end().unwrap();
        assert_eq!(to_send.len(), 1);
        assert!(!alice.is_encrypted());
        assert!(alice.use_extra_symmetric_key(1, b"").is_err());
        assert!(alice.end().unwrap().is_empty());
    }

    #[test]
    fn test_extra_symmetric_key_reaches_peer() {
        let (mut alice, mut bob) = go_private();
        let keys = Keys::default();
        bob.add_received_key_handler(KeyRecorder(keys.clone()));

        let (key, to_send) = alice.use_extra_symmetric_key(7, b"file.txt").unwrap();
        let received = bob.receive(&to_send[0]).unwrap();
        assert!(received.plaintext.is_none());

        let keys = keys.lock().unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0], (7, b"file.txt".to_vec(), key));
    }

    #[test]
    fn test_abort_authentication() {
        let (mut alice, mut bob) = go_private();
        alice.start_authenticate(None, b"secret").unwrap();

        let abort = alice.abort_authentication().unwrap();
        let received = bob.receive(&abort[0]).unwrap();
        assert!(received.to_send.is_empty());
        assert!(
            bob.provide_authentication_secret(b"secret").is_err(),
            "nothing to answer after an abort"
        );
    }

    #[test]
    fn test_encryption_failure_never_leaks_plaintext() {
        let (mut alice, _) = go_private();
        alice.keys = KeyManagement::default();
        assert!(matches!(alice.send(b"secret plans"), Err(Error::Crypto(_))));

        alice.add_error_message_handler(crate::event::StandardErrorMessages);
        assert_eq!(
            alice.send(b"secret plans").unwrap(),
            vec![b"?OTR Error: Error occurred encrypting message.".to_vec()]
        );
        assert!(alice.is_encrypted());
    }
}
