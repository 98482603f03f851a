use super::{Conversation, MessageState, Received, WhitespaceState};
use crate::Error;
use crate::codec::{MessageKind, classify, decode, error_text, extract_whitespace_tag, parse_query};
use crate::crypto::MIN_INSTANCE_TAG;
use crate::data_message::{
    FLAG_IGNORE_UNREADABLE, Opened, TLV_DISCONNECTED, TLV_EXTRA_SYMMETRIC_KEY, Tlv,
    decode_plaintext, open, peek_flags,
};
use crate::event::{
    ErrorCode, MessageEvent, ReceivedKeyHandler, SecurityEvent, SmpEvent, SmpEventHandler,
};
use crate::fragment::Fragment;
use crate::version::{
    MSG_DATA, MSG_DH_COMMIT, MSG_DH_KEY, MSG_REVEAL_SIG, MSG_SIG, MessageHeader, Version,
};
use tracing::{debug, warn};
use zeroize::Zeroize;

impl Conversation {
    /// Handles one message from the transport.
    ///
    /// Returns the text to show the user, if any, and the messages to send
    /// back. Problems with encrypted data messages are reported through
    /// events and an optional error reply rather than as errors; a failed
    /// key exchange message is returned as an error after a
    /// [`MessageEvent::SetupError`] event. A randomness failure is always
    /// returned as [`Error::Random`].
    pub fn receive(&mut self, message: &[u8]) -> Result<Received, Error> {
        let kind = classify(message);
        if kind != MessageKind::Fragment {
            self.fragments.clear();
        }
        self.dispatch(message, kind)
    }

    fn dispatch(&mut self, message: &[u8], kind: MessageKind) -> Result<Received, Error> {
        match kind {
            MessageKind::Error => Ok(self.receive_error(message)),
            MessageKind::Query => self.receive_query(message),
            MessageKind::Fragment => self.receive_fragment(message),
            MessageKind::Encoded => self.receive_encoded(message),
            MessageKind::Plaintext => self.receive_plaintext(message),
        }
    }

    fn receive_error(&mut self, message: &[u8]) -> Received {
        let text = error_text(message);
        warn!(text = %String::from_utf8_lossy(text), "Peer reported an error");
        self.message_event(MessageEvent::ReceivedMessageGeneralError, Some(text), None);

        let mut received = Received::default();
        if self.config.policies.error_start_ake {
            received.to_send.push(self.query_message());
        }
        if self.is_encrypted() {
            self.resend.arm_with_prefix();
        }
        received
    }

    fn receive_query(&mut self, message: &[u8]) -> Result<Received, Error> {
        let offered = parse_query(message);
        let version = offered
            .intersect(self.config.policies.versions())
            .best()
            .ok_or(Error::UnsupportedVersion)?;

        if self.version == Some(version) {
            let recent = self
                .ake
                .last_state_change()
                .is_some_and(|changed| changed.elapsed() < self.config.ake_repeat_window);
            if let Some(commit) = self.ake.pending_commit().filter(|_| recent) {
                debug!("Repeated query, resending D-H Commit");
                return Ok(Received::send(self.wrap(MSG_DH_COMMIT, &commit)?));
            }
        }

        self.start_ake(version)
    }

    fn start_ake(&mut self, version: Version) -> Result<Received, Error> {
        let body = self.ake.start(&mut *self.rng)?;
        self.select_key()?;
        self.commit_version(version);
        Ok(Received::send(self.wrap(MSG_DH_COMMIT, &body)?))
    }

    fn receive_fragment(&mut self, message: &[u8]) -> Result<Received, Error> {
        let fragment = match Fragment::parse(message) {
            Ok(fragment) => fragment,
            Err(err) => {
                debug!(%err, "Ignoring invalid fragment");
                return Ok(Received::default());
            }
        };

        if !self.config.policies.versions().contains(fragment.version) {
            debug!(
                version = fragment.version.number(),
                "Ignoring fragment of a disallowed version"
            );
            return Ok(Received::default());
        }

        if fragment.version.uses_instance_tags() {
            match self.accept_instance_tags(fragment.sender_tag, fragment.receiver_tag) {
                Ok(true) => {}
                Ok(false) => {
                    self.message_event(MessageEvent::ReceivedMessageForOtherInstance, None, None);
                    return Ok(Received::default());
                }
                Err(err) => {
                    debug!(%err, "Ignoring fragment");
                    return Ok(Received::default());
                }
            }
        }

        let Some(whole) = self.fragments.add(&fragment) else {
            return Ok(Received::default());
        };

        match classify(&whole) {
            MessageKind::Fragment => {
                debug!("Ignoring nested fragment");
                Ok(Received::default())
            }
            kind => self.dispatch(&whole, kind),
        }
    }

    fn receive_plaintext(&mut self, message: &[u8]) -> Result<Received, Error> {
        let mut received = Received::default();

        let text = match extract_whitespace_tag(message) {
            Some((text, offered)) => {
                let common = offered.intersect(self.config.policies.versions()).best();
                if let Some(version) = common.filter(|_| {
                    self.config.policies.whitespace_start_ake && !self.is_encrypted()
                }) {
                    debug!("Whitespace tag received, starting key exchange");
                    received = self.start_ake(version)?;
                }
                text
            }
            None => message.to_vec(),
        };

        if self.whitespace == WhitespaceState::Sent {
            self.whitespace = WhitespaceState::Rejected;
        }
        if self.is_encrypted() || self.config.policies.require_encryption {
            self.message_event(MessageEvent::ReceivedMessageUnencrypted, Some(&text), None);
        }

        received.plaintext = (!text.is_empty()).then_some(text);
        Ok(received)
    }

    fn receive_encoded(&mut self, message: &[u8]) -> Result<Received, Error> {
        let parsed = decode(message).and_then(|decoded| {
            let (header, len) = MessageHeader::parse(&decoded)?;
            Ok((decoded, header, len))
        });
        let (decoded, header, header_len) = match parsed {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(%err, "Could not decode message");
                self.message_event(MessageEvent::ReceivedMessageMalformed, None, Some(&err));
                return Err(err);
            }
        };

        if !self.config.policies.versions().contains(header.version) {
            return Err(Error::UnsupportedVersion);
        }

        if header.version.uses_instance_tags() {
            match self.accept_instance_tags(header.sender_tag, header.receiver_tag) {
                Ok(true) => {}
                Ok(false) => {
                    self.message_event(MessageEvent::ReceivedMessageForOtherInstance, None, None);
                    return Ok(Received::default());
                }
                Err(err) => {
                    self.message_event(MessageEvent::ReceivedMessageMalformed, None, Some(&err));
                    return Err(err);
                }
            }
        }

        match self.version {
            None => self.commit_version(header.version),
            Some(version) if version != header.version => {
                debug!(
                    expected = version.number(),
                    received = header.version.number(),
                    "Ignoring message of another version"
                );
                return Err(Error::WrongVersion);
            }
            Some(_) => {}
        }

        let (header_bytes, body) = decoded.split_at(header_len);
        match header.message_type {
            MSG_DATA => self.receive_data(header_bytes, body),
            MSG_DH_COMMIT | MSG_DH_KEY | MSG_REVEAL_SIG | MSG_SIG => {
                self.receive_ake(header.message_type, body)
            }
            other => {
                debug!(message_type = other, "Unrecognized message type");
                self.message_event(MessageEvent::ReceivedMessageUnrecognized, None, None);
                Ok(Received::default())
            }
        }
    }

    /// Checks the instance tags of a version 3 message, learning the peer's
    /// tag from the first message that carries one.
    ///
    /// Returns `Ok(false)` for messages meant for another instance.
    fn accept_instance_tags(&mut self, sender_tag: u32, receiver_tag: u32) -> Result<bool, Error> {
        if sender_tag < MIN_INSTANCE_TAG || (receiver_tag != 0 && receiver_tag < MIN_INSTANCE_TAG) {
            return Err(Error::Malformed("Invalid instance tag".to_string()));
        }
        if receiver_tag != 0 && receiver_tag != self.our_instance_tag {
            debug!(receiver_tag, "Message is for another instance");
            return Ok(false);
        }

        if self.their_instance_tag == 0 {
            debug!(sender_tag, "Learned peer instance tag");
            self.their_instance_tag = sender_tag;
        }
        Ok(self.their_instance_tag == sender_tag)
    }

    fn receive_ake(&mut self, message_type: u8, body: &[u8]) -> Result<Received, Error> {
        let our_key = self
            .current_key
            .clone()
            .or_else(|| self.our_keys.first().cloned())
            .ok_or(Error::Session)?;
        let step = match self.ake.receive(&mut *self.rng, &our_key, message_type, body) {
            Ok(step) => step,
            Err(err) => {
                self.message_event(MessageEvent::SetupError, None, Some(&err));
                return Err(err);
            }
        };
        if message_type == MSG_DH_COMMIT {
            // Answering a new exchange, which signs with our preferred key
            self.select_key()?;
        }

        let mut received = Received::default();
        if let Some((reply_type, reply)) = step.reply {
            received.to_send = self.wrap(reply_type, &reply)?;
        }
        if let Some(completed) = step.completed {
            self.complete_ake(completed)?;
            received.to_send.extend(self.maybe_retransmit()?);
        }
        Ok(received)
    }

    fn receive_data(&mut self, header: &[u8], body: &[u8]) -> Result<Received, Error> {
        let ignore_unreadable = peek_flags(body) & FLAG_IGNORE_UNREADABLE != 0;
        let mut received = Received::default();

        if !self.is_encrypted() {
            warn!(state = ?self.msg_state, "Data message outside a private conversation");
            if !ignore_unreadable {
                self.message_event(
                    MessageEvent::ReceivedMessageNotInPrivate,
                    None,
                    Some(&Error::NotInPrivate),
                );
                received.to_send = self.error_reply(ErrorCode::MessageNotInPrivate);
            }
            return Ok(received);
        }

        let Opened {
            message,
            mut plaintext,
            mut extra_key,
        } = match open(&mut self.keys, header, body) {
            Ok(opened) => opened,
            Err(err) => {
                warn!(%err, "Could not read data message");
                if !ignore_unreadable {
                    let (event, code) = if err.is_conflict() {
                        (MessageEvent::ReceivedMessageUnreadable, ErrorCode::MessageUnreadable)
                    } else {
                        (MessageEvent::ReceivedMessageMalformed, ErrorCode::MessageMalformed)
                    };
                    self.message_event(event, None, Some(&err));
                    received.to_send = self.error_reply(code);
                }
                return Ok(received);
            }
        };

        self.keys.rotate(
            &mut *self.rng,
            message.recipient_key_id,
            message.sender_key_id,
            message.next_key,
        )?;

        let decoded = decode_plaintext(&plaintext);
        plaintext.zeroize();
        let (text, tlvs) = match decoded {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(%err, "Could not parse decrypted payload");
                self.message_event(MessageEvent::ReceivedMessageMalformed, None, Some(&err));
                extra_key.zeroize();
                return Ok(received);
            }
        };

        if text.is_empty() && tlvs.is_empty() {
            self.message_event(MessageEvent::LogHeartbeatReceived, None, None);
        }

        let replies = self.process_tlvs(&tlvs, &extra_key);
        extra_key.zeroize();
        let replies = replies?;

        if !replies.is_empty() && self.is_encrypted() {
            let flags = if replies.iter().any(Tlv::is_smp) {
                FLAG_IGNORE_UNREADABLE
            } else {
                0
            };
            received.to_send.extend(self.data_message(b"", flags, &replies)?);
        }

        if !text.is_empty() {
            received.plaintext = Some(text);
            received.to_send.extend(self.maybe_heartbeat()?);
        }
        Ok(received)
    }

    /// Acts on the TLVs of an authenticated data message and collects the
    /// TLVs to answer with.
    fn process_tlvs(&mut self, tlvs: &[Tlv], extra_key: &[u8; 32]) -> Result<Vec<Tlv>, Error> {
        let mut replies = Vec::new();
        for tlv in tlvs {
            match tlv.tlv_type {
                TLV_DISCONNECTED => self.finish(),
                TLV_EXTRA_SYMMETRIC_KEY => match tlv.value.split_first_chunk::<4>() {
                    Some((usage, usage_data)) => {
                        self.key_handlers
                            .handle_received_key(u32::from_be_bytes(*usage), usage_data, extra_key);
                    }
                    None => debug!("Extra symmetric key TLV without usage"),
                },
                _ if tlv.is_smp() && self.is_encrypted() => {
                    let step = self.smp.receive(&mut *self.rng, tlv)?;
                    if let Some((event, progress)) = step.event {
                        let question =
                            self.smp.question().filter(|_| event == SmpEvent::AskForAnswer);
                        self.smp_handlers.handle_smp_event(event, progress, question);
                    }
                    replies.extend(step.reply);
                }
                other => debug!(tlv_type = other, "Ignoring TLV"),
            }
        }
        Ok(replies)
    }

    /// The peer ended the private conversation.
    fn finish(&mut self) {
        let was_encrypted = self.is_encrypted();
        self.msg_state = MessageState::Finished;
        self.smp.reset();
        self.keys.wipe_keep_reveal();
        debug!("Peer ended the private conversation");

        if was_encrypted {
            self.security_event(SecurityEvent::GoneInsecure);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ConversationConfig;
    use crate::crypto::LimitedRng;
    use crate::types::PrivateKey;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn create_conversation(seed: u64) -> Conversation {
        let mut rng = StdRng::seed_from_u64(seed);
        let key = PrivateKey::generate_with(&mut rng).unwrap();
        let config = ConversationConfig::default();
        Conversation::with_rng(vec![key], Some(config), Box::new(rng)).unwrap()
    }

    #[test]
    fn test_instance_tag_rules() {
        let mut bob = create_conversation(600);
        let ours = bob.our_instance_tag();

        assert!(bob.accept_instance_tags(0xFF, 0).is_err());
        assert!(bob.accept_instance_tags(0x1000, 0x42).is_err());
        assert_eq!(bob.accept_instance_tags(0x1000, ours + 1), Ok(false));
        assert_eq!(bob.their_instance_tag(), 0);

        assert_eq!(bob.accept_instance_tags(0x1000, 0), Ok(true));
        assert_eq!(bob.their_instance_tag(), 0x1000);
        assert_eq!(bob.accept_instance_tags(0x1000, ours), Ok(true));
        assert_eq!(bob.accept_instance_tags(0x2000, ours), Ok(false));
    }

    #[test]
    fn test_fragment_buffer_cleared_by_whole_message() {
        let mut bob = create_conversation(601);
        let first = b"?OTR,00001,00002,?OTRv,";
        let second = b"?OTR,00002,00002,3?,";

        assert_eq!(bob.receive(first).unwrap(), Received::default());
        bob.receive(b"an interruption").unwrap();
        // The sequence restarted, so the second piece alone completes nothing
        assert_eq!(bob.receive(second).unwrap(), Received::default());
        assert_eq!(bob.version(), None);
    }

    #[test]
    fn test_reassembled_query() {
        let mut bob = create_conversation(602);
        bob.receive(b"?OTR,00001,00002,?OTRv,").unwrap();
        let received = bob.receive(b"?OTR,00002,00002,3?,").unwrap();
        assert_eq!(received.to_send.len(), 1);
        assert_eq!(bob.version(), Some(Version::V3));
    }

    #[test]
    fn test_garbage_encoded_message_is_malformed() {
        let mut bob = create_conversation(603);
        assert!(matches!(bob.receive(b"?OTR:!!!."), Err(Error::Malformed(_))));
        assert_eq!(bob.receive(b"?OTR:AAQD."), Err(Error::UnsupportedVersion));
    }

    #[test]
    fn test_unknown_message_type() {
        let mut bob = create_conversation(604);
        // Version 2, message type 0x42
        let received = bob.receive(b"?OTR:AAJC.").unwrap();
        assert_eq!(received, Received::default());
        assert_eq!(bob.version(), Some(Version::V2));
    }

    #[test]
    fn test_failed_start_commits_nothing() {
        let mut rng = StdRng::seed_from_u64(605);
        let key = PrivateKey::generate_with(&mut rng).unwrap();
        let config = ConversationConfig {
            instance_tag: Some(0x1234),
            ..ConversationConfig::default()
        };
        let rng = Box::new(LimitedRng::new(606, 0));
        let mut bob = Conversation::with_rng(vec![key], Some(config), rng).unwrap();

        assert_eq!(bob.receive(b"?OTRv3?"), Err(Error::Random));
        assert_eq!(bob.version(), None);
        assert!(bob.ake.pending_commit().is_none());
        assert!(bob.our_current_key().is_none());
    }
}
