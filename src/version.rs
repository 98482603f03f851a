use crate::Error;
use crate::codec::{Reader, append_short, append_word};

pub(crate) const MSG_DH_COMMIT: u8 = 0x02;
pub(crate) const MSG_DATA: u8 = 0x03;
pub(crate) const MSG_DH_KEY: u8 = 0x0A;
pub(crate) const MSG_REVEAL_SIG: u8 = 0x11;
pub(crate) const MSG_SIG: u8 = 0x12;

/// Supported OTR protocol versions.
///
/// Both versions share their cryptography. Version 3 adds instance tags to
/// every message header and to fragments.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Version {
    /// OTR version 2.
    V2,
    /// OTR version 3.
    V3,
}

impl Version {
    /// The number carried in the two-byte version field.
    pub fn number(self) -> u16 {
        match self {
            Self::V2 => 2,
            Self::V3 => 3,
        }
    }

    pub fn from_number(number: u16) -> Option<Self> {
        match number {
            2 => Some(Self::V2),
            3 => Some(Self::V3),
            _ => None,
        }
    }

    /// Whether message headers and fragments carry instance tags.
    pub fn uses_instance_tags(self) -> bool {
        self == Self::V3
    }

    pub(crate) fn header_len(self) -> usize {
        match self {
            Self::V2 => 3,
            Self::V3 => 11,
        }
    }

    /// The digit advertised in query messages.
    pub(crate) fn query_digit(self) -> u8 {
        match self {
            Self::V2 => b'2',
            Self::V3 => b'3',
        }
    }

    pub(crate) fn build_header(
        self,
        message_type: u8,
        sender_tag: u32,
        receiver_tag: u32,
    ) -> Vec<u8> {
        let mut header = Vec::with_capacity(self.header_len());
        append_short(&mut header, self.number());
        header.push(message_type);
        if self.uses_instance_tags() {
            append_word(&mut header, sender_tag);
            append_word(&mut header, receiver_tag);
        }
        header
    }
}

/// Header of a decoded binary message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct MessageHeader {
    pub(crate) version: Version,
    pub(crate) message_type: u8,
    pub(crate) sender_tag: u32,
    pub(crate) receiver_tag: u32,
}

impl MessageHeader {
    /// Parses the header, returning it together with its length in bytes.
    pub(crate) fn parse(bytes: &[u8]) -> Result<(Self, usize), Error> {
        let mut reader = Reader::new(bytes);
        let version = Version::from_number(reader.short()?).ok_or(Error::UnsupportedVersion)?;
        let message_type = reader.byte()?;
        let (sender_tag, receiver_tag) = if version.uses_instance_tags() {
            (reader.word()?, reader.word()?)
        } else {
            (0, 0)
        };

        Ok((
            Self {
                version,
                message_type,
                sender_tag,
                receiver_tag,
            },
            version.header_len(),
        ))
    }
}

/// A set of protocol versions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VersionSet(u8);

impl VersionSet {
    pub fn new() -> Self {
        Self(0)
    }

    fn bit(version: Version) -> u8 {
        match version {
            Version::V2 => 1,
            Version::V3 => 2,
        }
    }

    pub fn insert(&mut self, version: Version) {
        self.0 |= Self::bit(version);
    }

    pub fn contains(self, version: Version) -> bool {
        self.0 & Self::bit(version) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn intersect(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// The highest version in the set.
    pub fn best(self) -> Option<Version> {
        self.iter().last()
    }

    /// Versions in ascending order.
    pub fn iter(self) -> impl Iterator<Item = Version> {
        [Version::V2, Version::V3]
            .into_iter()
            .filter(move |version| self.contains(*version))
    }
}

impl FromIterator<Version> for VersionSet {
    fn from_iter<I: IntoIterator<Item = Version>>(iter: I) -> Self {
        let mut set = Self::new();
        for version in iter {
            set.insert(version);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_lengths() {
        let v2 = Version::V2.build_header(MSG_DATA, 0x100, 0x200);
        assert_eq!(v2, vec![0, 2, 3]);

        let v3 = Version::V3.build_header(MSG_DH_KEY, 0x101, 0x202);
        assert_eq!(v3.len(), 11);

        let (header, len) = MessageHeader::parse(&v3).unwrap();
        assert_eq!(len, 11);
        assert_eq!(header.version, Version::V3);
        assert_eq!(header.message_type, MSG_DH_KEY);
        assert_eq!(header.sender_tag, 0x101);
        assert_eq!(header.receiver_tag, 0x202);
    }

    #[test]
    fn test_unknown_version_rejected() {
        assert_eq!(
            MessageHeader::parse(&[0, 4, 3]),
            Err(Error::UnsupportedVersion)
        );
        assert_eq!(
            MessageHeader::parse(&[0, 1, 3]),
            Err(Error::UnsupportedVersion)
        );
    }

    #[test]
    fn test_version_set_prefers_highest() {
        let both: VersionSet = [Version::V3, Version::V2].into_iter().collect();
        assert_eq!(both.best(), Some(Version::V3));
        assert_eq!(both.iter().collect::<Vec<_>>(), vec![Version::V2, Version::V3]);

        let only_two: VersionSet = [Version::V2].into_iter().collect();
        assert_eq!(both.intersect(only_two).best(), Some(Version::V2));
        assert!(VersionSet::new().best().is_none());
    }
}
