use crate::Error;
use crate::codec::{FRAGMENT_V2_PREFIX, FRAGMENT_V3_PREFIX};
use crate::version::Version;
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// Length of `?OTR|%08x|%08x,%05d,%05d,`.
const V3_PREFIX_LEN: usize = 35;
/// Length of `?OTR,%05d,%05d,`.
const V2_PREFIX_LEN: usize = 17;

fn invalid() -> Error {
    Error::Malformed("Invalid fragment".to_string())
}

/// Splits an encoded message into fragments of at most `max_size` bytes.
///
/// A `max_size` of zero, or a message that already fits, is returned as is.
pub(crate) fn fragment(
    message: &[u8],
    max_size: usize,
    version: Version,
    sender_tag: u32,
    receiver_tag: u32,
) -> Result<Vec<Vec<u8>>, Error> {
    if max_size == 0 || message.len() <= max_size {
        return Ok(vec![message.to_vec()]);
    }

    let prefix_len = match version {
        Version::V2 => V2_PREFIX_LEN,
        Version::V3 => V3_PREFIX_LEN,
    };
    let chunk_len = max_size
        .checked_sub(prefix_len + 1)
        .filter(|len| *len > 0)
        .ok_or_else(|| Error::Protocol("Fragment size is too small".to_string()))?;

    let total = message.len().div_ceil(chunk_len);
    if total > usize::from(u16::MAX) {
        return Err(Error::Protocol("Message needs too many fragments".to_string()));
    }

    let fragments = message
        .chunks(chunk_len)
        .enumerate()
        .map(|(i, chunk)| {
            let prefix = match version {
                Version::V2 => format!("?OTR,{:05},{:05},", i + 1, total),
                Version::V3 => format!(
                    "?OTR|{sender_tag:08x}|{receiver_tag:08x},{:05},{:05},",
                    i + 1,
                    total
                ),
            };
            let mut out = Vec::with_capacity(prefix.len() + chunk.len() + 1);
            out.extend_from_slice(prefix.as_bytes());
            out.extend_from_slice(chunk);
            out.push(b',');
            out
        })
        .collect::<Vec<_>>();

    debug!(total, len = message.len(), "Fragmented message");
    Ok(fragments)
}

/// One parsed fragment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Fragment<'a> {
    pub(crate) version: Version,
    pub(crate) sender_tag: u32,
    pub(crate) receiver_tag: u32,
    pub(crate) index: u16,
    pub(crate) total: u16,
    pub(crate) payload: &'a [u8],
}

fn split_at_byte(bytes: &[u8], separator: u8) -> Option<(&[u8], &[u8])> {
    let at = bytes.iter().position(|b| *b == separator)?;
    Some((&bytes[..at], &bytes[at + 1..]))
}

fn parse_number(bytes: &[u8], radix: u32) -> Option<u32> {
    if bytes.is_empty() || !bytes.iter().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u32::from_str_radix(std::str::from_utf8(bytes).ok()?, radix).ok()
}

impl<'a> Fragment<'a> {
    /// Parses a `?OTR|` or `?OTR,` fragment.
    ///
    /// Index 0, total 0 and an index above the total are rejected.
    pub(crate) fn parse(message: &'a [u8]) -> Result<Self, Error> {
        let message = message.trim_ascii_end();
        let (version, rest) = if let Some(rest) = message.strip_prefix(FRAGMENT_V3_PREFIX) {
            (Version::V3, rest)
        } else if let Some(rest) = message.strip_prefix(FRAGMENT_V2_PREFIX) {
            (Version::V2, rest)
        } else {
            return Err(invalid());
        };
        let rest = rest.strip_suffix(b",").ok_or_else(invalid)?;

        let (sender_tag, receiver_tag, rest) = match version {
            Version::V3 => {
                let (sender, rest) = split_at_byte(rest, b'|').ok_or_else(invalid)?;
                let (receiver, rest) = split_at_byte(rest, b',').ok_or_else(invalid)?;
                (
                    parse_number(sender, 16).ok_or_else(invalid)?,
                    parse_number(receiver, 16).ok_or_else(invalid)?,
                    rest,
                )
            }
            Version::V2 => (0, 0, rest),
        };

        let (index, rest) = split_at_byte(rest, b',').ok_or_else(invalid)?;
        let (total, payload) = split_at_byte(rest, b',').ok_or_else(invalid)?;
        let index = parse_number(index, 10)
            .and_then(|n| u16::try_from(n).ok())
            .ok_or_else(invalid)?;
        let total = parse_number(total, 10)
            .and_then(|n| u16::try_from(n).ok())
            .ok_or_else(invalid)?;

        if index == 0 || total == 0 || index > total {
            return Err(invalid());
        }

        Ok(Self {
            version,
            sender_tag,
            receiver_tag,
            index,
            total,
            payload,
        })
    }
}

struct Sequence {
    sender_tag: u32,
    receiver_tag: u32,
    total: u16,
    pieces: BTreeMap<u16, Vec<u8>>,
}

/// Collects the fragments of one message at a time.
#[derive(Default)]
pub(crate) struct FragmentBuffer {
    current: Option<Sequence>,
}

impl FragmentBuffer {
    /// Stores a fragment and returns the whole message once every piece is in.
    ///
    /// A fragment from a different sequence discards the one in progress.
    pub(crate) fn add(&mut self, fragment: &Fragment<'_>) -> Option<Vec<u8>> {
        let same_sequence = self.current.as_ref().is_some_and(|sequence| {
            sequence.sender_tag == fragment.sender_tag
                && sequence.receiver_tag == fragment.receiver_tag
                && sequence.total == fragment.total
        });

        if !same_sequence {
            if self.current.is_some() {
                debug!("Discarding incomplete fragment sequence");
            }
            self.current = Some(Sequence {
                sender_tag: fragment.sender_tag,
                receiver_tag: fragment.receiver_tag,
                total: fragment.total,
                pieces: BTreeMap::new(),
            });
        }

        let sequence = self.current.as_mut()?;
        sequence.pieces.insert(fragment.index, fragment.payload.to_vec());
        trace!(
            index = fragment.index,
            total = fragment.total,
            "Stored fragment"
        );

        if sequence.pieces.len() < usize::from(sequence.total) {
            return None;
        }

        let sequence = self.current.take()?;
        Some(sequence.pieces.into_values().flatten().collect())
    }

    pub(crate) fn clear(&mut self) {
        self.current = None;
    }
}
