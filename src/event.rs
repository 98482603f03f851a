//! Events reported to the application while a conversation runs.
//!
//! Handlers are called synchronously from inside the conversation methods, in
//! the order they were registered.

use crate::Error;

/// Changes of the conversation's privacy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SecurityEvent {
    /// A private conversation has been established.
    GoneSecure,
    /// The private conversation has ended.
    GoneInsecure,
    /// A new key exchange completed while already private.
    StillSecure,
}

/// Notable things that happened to a single message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageEvent {
    /// Policy requires encryption but the conversation is not private yet.
    EncryptionRequired,
    /// A message could not be encrypted.
    EncryptionError,
    /// The peer ended the private conversation; nothing was sent.
    ConnectionEnded,
    /// The key exchange failed.
    SetupError,
    /// The peer answered with our own key exchange values.
    MessageReflected,
    /// A message queued while waiting for encryption has been sent.
    MessageSent,
    /// A message has been sent again.
    MessageResent,
    /// Encrypted data arrived outside a private conversation.
    ReceivedMessageNotInPrivate,
    /// An encrypted message could not be read.
    ReceivedMessageUnreadable,
    /// A message could not be parsed.
    ReceivedMessageMalformed,
    /// An empty keep-alive data message arrived.
    LogHeartbeatReceived,
    /// An empty keep-alive data message was sent.
    LogHeartbeatSent,
    /// The peer sent an OTR error message.
    ReceivedMessageGeneralError,
    /// Plaintext arrived where encryption was expected.
    ReceivedMessageUnencrypted,
    /// An OTR message of an unknown type arrived.
    ReceivedMessageUnrecognized,
    /// A message addressed to another instance of our account arrived.
    ReceivedMessageForOtherInstance,
}

/// Progress of the socialist millionaires' protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SmpEvent {
    /// A message arrived for another step than the one we are in.
    Error,
    /// The peer aborted the protocol.
    Abort,
    /// The peer sent an invalid value or proof.
    Cheated,
    /// The peer asked a question; answer with the shared secret.
    AskForAnswer,
    /// The peer started the protocol; provide the shared secret.
    AskForSecret,
    InProgress,
    /// Both secrets are equal.
    Success,
    /// The secrets differ.
    Failure,
}

/// Errors reported back to the peer as `?OTR Error:` messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    EncryptionError,
    MessageUnreadable,
    MessageMalformed,
    MessageNotInPrivate,
}

pub trait SecurityEventHandler: Send {
    fn handle_security_event(&self, event: SecurityEvent);
}

pub trait MessageEventHandler: Send {
    /// `message` carries the related text where there is one, such as the
    /// peer's error text or an unencrypted message.
    fn handle_message_event(
        &self,
        event: MessageEvent,
        message: Option<&[u8]>,
        error: Option<&Error>,
    );
}

pub trait SmpEventHandler: Send {
    /// `progress` is a percentage; `question` is set for [`SmpEvent::AskForAnswer`].
    fn handle_smp_event(&self, event: SmpEvent, progress: u8, question: Option<&str>);
}

/// Produces the text of error messages sent to the peer.
///
/// Returning `None` sends no error message.
pub trait ErrorMessageHandler: Send {
    fn handle_error_message(&self, code: ErrorCode) -> Option<Vec<u8>>;
}

/// Receives extra symmetric keys announced by the peer.
pub trait ReceivedKeyHandler: Send {
    fn handle_received_key(&self, usage: u32, usage_data: &[u8], key: &[u8; 32]);
}

/// Dispatches security events to every registered handler.
#[derive(Default)]
pub struct CombinedSecurityEventHandlers {
    handlers: Vec<Box<dyn SecurityEventHandler>>,
}

impl CombinedSecurityEventHandlers {
    pub fn add_handler(&mut self, handler: impl SecurityEventHandler + 'static) {
        self.handlers.push(Box::new(handler));
    }
}

impl SecurityEventHandler for CombinedSecurityEventHandlers {
    fn handle_security_event(&self, event: SecurityEvent) {
        for handler in &self.handlers {
            handler.handle_security_event(event);
        }
    }
}

/// Dispatches message events to every registered handler.
#[derive(Default)]
pub struct CombinedMessageEventHandlers {
    handlers: Vec<Box<dyn MessageEventHandler>>,
}

impl CombinedMessageEventHandlers {
    pub fn add_handler(&mut self, handler: impl MessageEventHandler + 'static) {
        self.handlers.push(Box::new(handler));
    }
}

impl MessageEventHandler for CombinedMessageEventHandlers {
    fn handle_message_event(
        &self,
        event: MessageEvent,
        message: Option<&[u8]>,
        error: Option<&Error>,
    ) {
        for handler in &self.handlers {
            handler.handle_message_event(event, message, error);
        }
    }
}

/// Dispatches SMP events to every registered handler.
#[derive(Default)]
pub struct CombinedSmpEventHandlers {
    handlers: Vec<Box<dyn SmpEventHandler>>,
}

impl CombinedSmpEventHandlers {
    pub fn add_handler(&mut self, handler: impl SmpEventHandler + 'static) {
        self.handlers.push(Box::new(handler));
    }
}

impl SmpEventHandler for CombinedSmpEventHandlers {
    fn handle_smp_event(&self, event: SmpEvent, progress: u8, question: Option<&str>) {
        for handler in &self.handlers {
            handler.handle_smp_event(event, progress, question);
        }
    }
}

/// Asks each registered handler in turn; the first text wins.
#[derive(Default)]
pub struct CombinedErrorMessageHandlers {
    handlers: Vec<Box<dyn ErrorMessageHandler>>,
}

impl CombinedErrorMessageHandlers {
    pub fn add_handler(&mut self, handler: impl ErrorMessageHandler + 'static) {
        self.handlers.push(Box::new(handler));
    }
}

impl ErrorMessageHandler for CombinedErrorMessageHandlers {
    fn handle_error_message(&self, code: ErrorCode) -> Option<Vec<u8>> {
        self.handlers
            .iter()
            .find_map(|handler| handler.handle_error_message(code))
    }
}

/// Dispatches received extra symmetric keys to every registered handler.
#[derive(Default)]
pub struct CombinedReceivedKeyHandlers {
    handlers: Vec<Box<dyn ReceivedKeyHandler>>,
}

impl CombinedReceivedKeyHandlers {
    pub fn add_handler(&mut self, handler: impl ReceivedKeyHandler + 'static) {
        self.handlers.push(Box::new(handler));
    }
}

impl ReceivedKeyHandler for CombinedReceivedKeyHandlers {
    fn handle_received_key(&self, usage: u32, usage_data: &[u8], key: &[u8; 32]) {
        for handler in &self.handlers {
            handler.handle_received_key(usage, usage_data, key);
        }
    }
}

/// The conventional English error texts.
#[derive(Clone, Copy, Debug, Default)]
pub struct StandardErrorMessages;

impl ErrorMessageHandler for StandardErrorMessages {
    fn handle_error_message(&self, code: ErrorCode) -> Option<Vec<u8>> {
        let text: &[u8] = match code {
            ErrorCode::EncryptionError => b"Error occurred encrypting message.",
            ErrorCode::MessageUnreadable => b"You transmitted an unreadable encrypted message.",
            ErrorCode::MessageMalformed => b"You transmitted a malformed data message.",
            ErrorCode::MessageNotInPrivate => {
                b"You sent encrypted data to a peer, who wasn't expecting it."
            }
        };
        Some(text.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl SecurityEventHandler for Recorder {
        fn handle_security_event(&self, event: SecurityEvent) {
            self.log.lock().unwrap().push(format!("{}:{event:?}", self.name));
        }
    }

    struct Silent;

    impl ErrorMessageHandler for Silent {
        fn handle_error_message(&self, _code: ErrorCode) -> Option<Vec<u8>> {
            None
        }
    }

    #[test]
    fn test_combined_handlers_run_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut combined = CombinedSecurityEventHandlers::default();
        combined.add_handler(Recorder {
            name: "first",
            log: log.clone(),
        });
        combined.add_handler(Recorder {
            name: "second",
            log: log.clone(),
        });

        combined.handle_security_event(SecurityEvent::GoneSecure);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["first:GoneSecure", "second:GoneSecure"]
        );
    }

    #[test]
    fn test_first_error_text_wins() {
        let mut combined = CombinedErrorMessageHandlers::default();
        assert!(combined.handle_error_message(ErrorCode::MessageMalformed).is_none());

        combined.add_handler(Silent);
        combined.add_handler(StandardErrorMessages);
        assert_eq!(
            combined.handle_error_message(ErrorCode::MessageUnreadable).unwrap(),
            b"You transmitted an unreadable encrypted message."
        );
    }
}
