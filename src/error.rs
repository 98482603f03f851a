/// Errors that can occur during OTR protocol operations.
#[derive(thiserror::Error, Debug, Clone, Eq, PartialEq)]
pub enum Error {
    /// A cryptographic operation failed.
    #[error("Cryptographic operation failed: {0}")]
    Crypto(String),

    /// A protocol rule was violated.
    #[error("Protocol Violation: {0}")]
    Protocol(String),

    /// A message could not be parsed.
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// A message could not be read with the keys we hold.
    #[error("Unreadable message: {0}")]
    Unreadable(String),

    /// Encrypted data arrived while no private conversation is established.
    #[error("Received encrypted message while not in private")]
    NotInPrivate,

    /// None of the offered protocol versions is allowed.
    #[error("Unsupported protocol version")]
    UnsupportedVersion,

    /// The message version differs from the committed conversation version.
    #[error("Wrong protocol version")]
    WrongVersion,

    /// The authenticated key exchange failed to authenticate the peer.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The socialist millionaires' protocol failed.
    #[error("SMP error: {0}")]
    Smp(String),

    /// Policy forbids sending plaintext.
    #[error("Encryption required")]
    EncryptionRequired,

    /// The peer ended the private conversation.
    #[error("The conversation has been finished by the peer")]
    Finished,

    /// The operation needs an encrypted conversation.
    #[error("The conversation is not encrypted")]
    NotEncrypted,

    /// Conversation is in an invalid state.
    #[error("Conversation state error")]
    Session,

    /// Random number generation failed.
    #[error("Random number generation failed")]
    Random,
}

impl Error {
    /// Conflicts are reported to the peer as unreadable messages.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Unreadable(_))
    }
}

impl From<hmac::digest::InvalidLength> for Error {
    fn from(value: hmac::digest::InvalidLength) -> Self {
        Self::Crypto(value.to_string())
    }
}
