use crate::version::{Version, VersionSet};
use std::time::Duration;

/// Flags deciding how a conversation negotiates and when it encrypts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Policies {
    /// Accept and offer protocol version 2.
    pub allow_v2: bool,
    /// Accept and offer protocol version 3.
    pub allow_v3: bool,
    /// Refuse to send plaintext; messages are held until the conversation is private.
    pub require_encryption: bool,
    /// Append a whitespace tag to outgoing plaintext.
    pub send_whitespace_tag: bool,
    /// Start the key exchange when a whitespace tag is received.
    pub whitespace_start_ake: bool,
    /// Answer a received OTR error with a query message.
    pub error_start_ake: bool,
}

impl Policies {
    /// The versions these policies allow.
    pub fn versions(&self) -> VersionSet {
        let mut versions = VersionSet::new();
        if self.allow_v2 {
            versions.insert(Version::V2);
        }
        if self.allow_v3 {
            versions.insert(Version::V3);
        }
        versions
    }
}

impl Default for Policies {
    fn default() -> Self {
        Self {
            allow_v2: true,
            allow_v3: true,
            require_encryption: false,
            send_whitespace_tag: false,
            whitespace_start_ake: true,
            error_start_ake: true,
        }
    }
}

/// Settings of a single conversation.
#[derive(Clone, Debug)]
pub struct ConversationConfig {
    pub policies: Policies,
    /// Largest message handed to the transport, 0 to never fragment.
    pub fragment_size: usize,
    /// Text appended to query messages for clients without OTR.
    pub friendly_query: Option<String>,
    /// Minimum quiet time before a heartbeat is sent.
    pub heartbeat_interval: Duration,
    /// How long a message stays eligible for retransmission.
    pub resend_interval: Duration,
    /// Prepended to messages resent after the peer reported an error.
    pub resend_prefix: Vec<u8>,
    /// A repeated query within this window resends the pending D-H Commit
    /// instead of starting over.
    pub ake_repeat_window: Duration,
    /// Our instance tag, generated when not set.
    pub instance_tag: Option<u32>,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            policies: Policies::default(),
            fragment_size: 0,
            friendly_query: None,
            heartbeat_interval: Duration::from_secs(60),
            resend_interval: Duration::from_secs(60),
            resend_prefix: b"[resent] ".to_vec(),
            ake_repeat_window: Duration::from_secs(60),
            instance_tag: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_versions() {
        let policies = Policies::default();
        assert_eq!(policies.versions().best(), Some(Version::V3));

        let v2_only = Policies {
            allow_v3: false,
            ..Policies::default()
        };
        assert_eq!(
            v2_only.versions().iter().collect::<Vec<_>>(),
            vec![Version::V2]
        );

        let none = Policies {
            allow_v2: false,
            allow_v3: false,
            ..Policies::default()
        };
        assert!(none.versions().is_empty());
    }
}
