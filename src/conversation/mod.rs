mod config;
pub use config::*;
mod heartbeat;
mod receive;
mod resend;
mod send;

use crate::Error;
use crate::ake::{Ake, Completed};
use crate::codec::{self, encode, error_message};
use crate::crypto::{MIN_INSTANCE_TAG, RandomSource, random_instance_tag};
use crate::data_message::{Tlv, encode_plaintext, seal};
use crate::event::{
    CombinedErrorMessageHandlers, CombinedMessageEventHandlers, CombinedReceivedKeyHandlers,
    CombinedSecurityEventHandlers, CombinedSmpEventHandlers, ErrorCode, ErrorMessageHandler,
    MessageEvent, MessageEventHandler, ReceivedKeyHandler, SecurityEvent, SecurityEventHandler,
    SmpEventHandler,
};
use crate::fragment::{FragmentBuffer, fragment};
use crate::keys::KeyManagement;
use crate::smp::{Smp, SmpContext};
use crate::types::{PrivateKey, PublicKey};
use crate::version::{MSG_DATA, Version};
use rand::rngs::OsRng;
use resend::ResendQueue;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;
use zeroize::Zeroize;

/// Privacy of a conversation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MessageState {
    /// Messages travel unencrypted.
    #[default]
    Plaintext,
    /// A key exchange completed; messages are encrypted.
    Encrypted,
    /// The peer ended the private conversation. Nothing is sent until
    /// [`Conversation::end`] is called.
    Finished,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WhitespaceState {
    NotSent,
    Sent,
    Rejected,
}

/// Result of handling one transport message.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Received {
    /// Text for the user, if the message carried any.
    pub plaintext: Option<Vec<u8>>,
    /// Messages to hand to the transport, in order.
    pub to_send: Vec<Vec<u8>>,
}

impl Received {
    fn send(to_send: Vec<Vec<u8>>) -> Self {
        Self {
            plaintext: None,
            to_send,
        }
    }
}

/// An OTR conversation with one peer instance.
///
/// The conversation never talks to the network itself. Messages from the
/// transport go through [`Conversation::receive`], outgoing text through
/// [`Conversation::send`], and both hand back the messages to transmit.
/// Registered handlers are called synchronously from within these methods.
pub struct Conversation {
    config: ConversationConfig,
    our_keys: Vec<Arc<PrivateKey>>,
    /// Key of the latest key exchange. Stays put when `our_keys` is replaced.
    current_key: Option<Arc<PrivateKey>>,
    their_key: Option<PublicKey>,
    rng: Box<dyn RandomSource + Send>,
    version: Option<Version>,
    msg_state: MessageState,
    whitespace: WhitespaceState,
    our_instance_tag: u32,
    their_instance_tag: u32,
    ssid: Option<[u8; 8]>,
    ake: Ake,
    keys: KeyManagement,
    smp: Smp,
    fragments: FragmentBuffer,
    resend: ResendQueue,
    last_sent: Option<Instant>,
    security_handlers: CombinedSecurityEventHandlers,
    message_handlers: CombinedMessageEventHandlers,
    smp_handlers: CombinedSmpEventHandlers,
    error_handlers: CombinedErrorMessageHandlers,
    key_handlers: CombinedReceivedKeyHandlers,
}

impl Conversation {
    /// Creates a conversation using the operating system's random source.
    ///
    /// `our_keys` lists our long-term keys in order of preference. The
    /// preferred one is selected whenever a key exchange is started or
    /// answered. If no configuration is provided, default values are used.
    pub fn new(
        our_keys: Vec<PrivateKey>,
        config: Option<ConversationConfig>,
    ) -> Result<Self, Error> {
        Self::with_rng(our_keys, config, Box::new(OsRng))
    }

    /// Creates a conversation drawing all randomness from `rng`.
    pub fn with_rng(
        our_keys: Vec<PrivateKey>,
        config: Option<ConversationConfig>,
        mut rng: Box<dyn RandomSource + Send>,
    ) -> Result<Self, Error> {
        let our_keys = key_set(our_keys)?;
        let config = config.unwrap_or_default();
        let our_instance_tag = match config.instance_tag {
            Some(tag) if tag >= MIN_INSTANCE_TAG => tag,
            Some(tag) => {
                return Err(Error::Protocol(format!(
                    "Instance tag 0x{tag:08x} is below 0x{MIN_INSTANCE_TAG:08x}"
                )));
            }
            None => random_instance_tag(&mut *rng)?,
        };

        Ok(Self {
            config,
            our_keys,
            current_key: None,
            their_key: None,
            rng,
            version: None,
            msg_state: MessageState::Plaintext,
            whitespace: WhitespaceState::NotSent,
            our_instance_tag,
            their_instance_tag: 0,
            ssid: None,
            ake: Ake::default(),
            keys: KeyManagement::default(),
            smp: Smp::default(),
            fragments: FragmentBuffer::default(),
            resend: ResendQueue::default(),
            last_sent: None,
            security_handlers: CombinedSecurityEventHandlers::default(),
            message_handlers: CombinedMessageEventHandlers::default(),
            smp_handlers: CombinedSmpEventHandlers::default(),
            error_handlers: CombinedErrorMessageHandlers::default(),
            key_handlers: CombinedReceivedKeyHandlers::default(),
        })
    }

    pub fn add_security_event_handler(&mut self, handler: impl SecurityEventHandler + 'static) {
        self.security_handlers.add_handler(handler);
    }

    pub fn add_message_event_handler(&mut self, handler: impl MessageEventHandler + 'static) {
        self.message_handlers.add_handler(handler);
    }

    pub fn add_smp_event_handler(&mut self, handler: impl SmpEventHandler + 'static) {
        self.smp_handlers.add_handler(handler);
    }

    /// Without an error message handler no `?OTR Error:` replies are sent.
    pub fn add_error_message_handler(&mut self, handler: impl ErrorMessageHandler + 'static) {
        self.error_handlers.add_handler(handler);
    }

    pub fn add_received_key_handler(&mut self, handler: impl ReceivedKeyHandler + 'static) {
        self.key_handlers.add_handler(handler);
    }

    pub fn config(&self) -> &ConversationConfig {
        &self.config
    }

    pub fn message_state(&self) -> MessageState {
        self.msg_state
    }

    pub fn is_encrypted(&self) -> bool {
        self.msg_state == MessageState::Encrypted
    }

    /// The protocol version in use, once one has been negotiated.
    pub fn version(&self) -> Option<Version> {
        self.version
    }

    /// Session id of the last completed key exchange.
    ///
    /// Both sides compare it over a trusted channel to rule out a man in the
    /// middle.
    pub fn ssid(&self) -> Option<[u8; 8]> {
        self.ssid
    }

    /// Public halves of all our long-term keys, in order of preference.
    pub fn our_public_keys(&self) -> impl Iterator<Item = &PublicKey> {
        self.our_keys.iter().map(|key| key.public_key())
    }

    /// The public half of the key selected for the current key exchange.
    ///
    /// `None` until a key exchange has been started or answered.
    pub fn our_current_key(&self) -> Option<&PublicKey> {
        self.current_key.as_deref().map(PrivateKey::public_key)
    }

    /// Replaces our long-term keys.
    ///
    /// A running private conversation keeps its key; the new set is used
    /// from the next key exchange on.
    pub fn set_our_keys(&mut self, our_keys: Vec<PrivateKey>) -> Result<(), Error> {
        self.our_keys = key_set(our_keys)?;
        debug!(count = self.our_keys.len(), "Replaced long-term keys");
        Ok(())
    }

    /// Picks the key to authenticate with in the key exchange about to run.
    fn select_key(&mut self) -> Result<(), Error> {
        let preferred = self.our_keys.first().ok_or(Error::Session)?;
        if !self.current_key.as_ref().is_some_and(|key| Arc::ptr_eq(key, preferred)) {
            debug!("Selected long-term key");
            self.current_key = Some(Arc::clone(preferred));
        }
        Ok(())
    }

    /// The peer's long-term key, once a key exchange completed.
    pub fn their_public_key(&self) -> Option<&PublicKey> {
        self.their_key.as_ref()
    }

    pub fn our_instance_tag(&self) -> u32 {
        self.our_instance_tag
    }

    /// The peer's instance tag, or 0 while it is unknown.
    pub fn their_instance_tag(&self) -> u32 {
        self.their_instance_tag
    }

    /// The question of the authentication the peer started, if any.
    pub fn smp_question(&self) -> Option<&str> {
        self.smp.question()
    }

    /// A query message offering every version the policies allow.
    ///
    /// Sending it asks the peer to start a key exchange.
    pub fn query_message(&self) -> Vec<u8> {
        codec::query_message(
            self.config.policies.versions(),
            self.config.friendly_query.as_deref(),
        )
    }

    fn commit_version(&mut self, version: Version) {
        if self.version != Some(version) {
            debug!(version = version.number(), "Committed protocol version");
            self.version = Some(version);
        }
    }

    /// Encodes a binary message and splits it to the configured size.
    fn envelope(&self, version: Version, message: &[u8]) -> Result<Vec<Vec<u8>>, Error> {
        fragment(
            &encode(message),
            self.config.fragment_size,
            version,
            self.our_instance_tag,
            self.their_instance_tag,
        )
    }

    /// Wraps a key exchange message body for the transport.
    fn wrap(&self, message_type: u8, body: &[u8]) -> Result<Vec<Vec<u8>>, Error> {
        let version = self.version.ok_or(Error::Session)?;
        let mut message =
            version.build_header(message_type, self.our_instance_tag, self.their_instance_tag);
        message.extend_from_slice(body);
        self.envelope(version, &message)
    }

    /// Encrypts `message` and `tlvs` into a data message for the transport.
    fn data_message(
        &mut self,
        message: &[u8],
        flags: u8,
        tlvs: &[Tlv],
    ) -> Result<Vec<Vec<u8>>, Error> {
        let version = self.version.ok_or(Error::Session)?;
        let mut wire =
            version.build_header(MSG_DATA, self.our_instance_tag, self.their_instance_tag);

        let mut plaintext = encode_plaintext(message, tlvs)?;
        let body = seal(&mut self.keys, &wire, flags, &plaintext);
        plaintext.zeroize();

        wire.extend_from_slice(&body?);
        self.last_sent = Some(Instant::now());
        self.envelope(version, &wire)
    }

    /// The `?OTR Error:` reply for `code`, if a handler provides a text.
    fn error_reply(&self, code: ErrorCode) -> Vec<Vec<u8>> {
        self.error_handlers
            .handle_error_message(code)
            .map(|text| vec![error_message(&text)])
            .unwrap_or_default()
    }

    fn smp_context(&self) -> Result<SmpContext, Error> {
        let our_key = self.our_current_key().ok_or(Error::Session)?;
        let their_key = self.their_key.as_ref().ok_or(Error::Session)?;
        let ssid = self.ssid.ok_or(Error::Session)?;
        Ok(SmpContext {
            our_fingerprint: our_key.fingerprint(),
            their_fingerprint: their_key.fingerprint(),
            ssid,
        })
    }

    fn require_encrypted(&self) -> Result<(), Error> {
        if self.is_encrypted() {
            Ok(())
        } else {
            Err(Error::NotEncrypted)
        }
    }

    fn message_event(&self, event: MessageEvent, message: Option<&[u8]>, error: Option<&Error>) {
        self.message_handlers.handle_message_event(event, message, error);
    }

    fn security_event(&self, event: SecurityEvent) {
        self.security_handlers.handle_security_event(event);
    }

    /// Installs the keys of a completed key exchange and goes private.
    fn complete_ake(&mut self, completed: Completed) -> Result<(), Error> {
        let Completed {
            ours,
            our_key_id,
            their_public,
            their_key_id,
            their_key,
            ssid,
        } = completed;

        self.keys = KeyManagement::from_exchange(
            &mut *self.rng,
            ours,
            our_key_id,
            their_public,
            their_key_id,
        )?;
        let reflected = self.our_public_keys().any(|ours| *ours == their_key);
        self.their_key = Some(their_key);
        self.ssid = Some(ssid);
        self.smp.reset();
        self.last_sent = Some(Instant::now());

        let previous = self.msg_state;
        self.msg_state = MessageState::Encrypted;
        debug!(
            our_key_id = self.keys.our_key_id(),
            their_key_id = self.keys.their_key_id(),
            "Conversation is private"
        );

        if previous == MessageState::Encrypted {
            self.security_event(SecurityEvent::StillSecure);
        } else {
            self.security_event(SecurityEvent::GoneSecure);
        }
        if reflected {
            self.message_event(MessageEvent::MessageReflected, None, None);
        }
        Ok(())
    }
}

fn key_set(keys: Vec<PrivateKey>) -> Result<Vec<Arc<PrivateKey>>, Error> {
    if keys.is_empty() {
        return Err(Error::Protocol("At least one private key is needed".to_string()));
    }
    Ok(keys.into_iter().map(Arc::new).collect())
}
