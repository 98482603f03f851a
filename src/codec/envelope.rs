use crate::Error;
use crate::version::{Version, VersionSet};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;

pub(crate) const ENCODED_PREFIX: &[u8] = b"?OTR:";
pub(crate) const ERROR_PREFIX: &[u8] = b"?OTR Error:";
pub(crate) const FRAGMENT_V2_PREFIX: &[u8] = b"?OTR,";
pub(crate) const FRAGMENT_V3_PREFIX: &[u8] = b"?OTR|";
const QUERY_PREFIX: &[u8] = b"?OTR";

/// Coarse classification of an incoming transport message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MessageKind {
    Error,
    Encoded,
    Fragment,
    Query,
    Plaintext,
}

pub(crate) fn classify(message: &[u8]) -> MessageKind {
    if message.starts_with(ERROR_PREFIX) {
        MessageKind::Error
    } else if message.starts_with(ENCODED_PREFIX) {
        MessageKind::Encoded
    } else if message.starts_with(FRAGMENT_V3_PREFIX) || message.starts_with(FRAGMENT_V2_PREFIX) {
        MessageKind::Fragment
    } else if is_query(message) {
        MessageKind::Query
    } else {
        MessageKind::Plaintext
    }
}

fn is_query(message: &[u8]) -> bool {
    message.starts_with(QUERY_PREFIX)
        && matches!(message.get(QUERY_PREFIX.len()), Some(&b'?') | Some(&b'v'))
}

/// Wraps a binary message as `?OTR:<base64>.`.
pub(crate) fn encode(message: &[u8]) -> Vec<u8> {
    let encoded = STANDARD.encode(message);
    let mut out = Vec::with_capacity(ENCODED_PREFIX.len() + encoded.len() + 1);
    out.extend_from_slice(ENCODED_PREFIX);
    out.extend_from_slice(encoded.as_bytes());
    out.push(b'.');
    out
}

/// Unwraps a `?OTR:<base64>.` message.
pub(crate) fn decode(message: &[u8]) -> Result<Vec<u8>, Error> {
    let body = message
        .strip_prefix(ENCODED_PREFIX)
        .ok_or_else(|| Error::Malformed("Missing message prefix".to_string()))?;
    let body = body.trim_ascii_end();
    let body = body
        .strip_suffix(b".")
        .ok_or_else(|| Error::Malformed("Missing message terminator".to_string()))?;

    STANDARD
        .decode(body)
        .map_err(|err| Error::Malformed(err.to_string()))
}

/// Builds a query message advertising `versions`, e.g. `?OTRv23?`.
pub fn query_message(versions: VersionSet, friendly: Option<&str>) -> Vec<u8> {
    let mut out = b"?OTRv".to_vec();
    out.extend(versions.iter().map(Version::query_digit));
    out.push(b'?');
    if let Some(text) = friendly {
        out.push(b' ');
        out.extend_from_slice(text.as_bytes());
    }
    out
}

/// The versions a query message advertises. Version 1 and unknown digits
/// are dropped.
pub(crate) fn parse_query(message: &[u8]) -> VersionSet {
    let mut versions = VersionSet::new();
    let Some(mut rest) = message.strip_prefix(QUERY_PREFIX) else {
        return versions;
    };

    if let Some(tail) = rest.strip_prefix(b"?") {
        rest = tail;
    }

    if let Some(digits) = rest.strip_prefix(b"v") {
        for &digit in digits.iter().take_while(|c| **c != b'?') {
            match digit {
                b'2' => versions.insert(Version::V2),
                b'3' => versions.insert(Version::V3),
                _ => {}
            }
        }
    }

    versions
}

/// Builds `?OTR Error: <text>`.
pub(crate) fn error_message(text: &[u8]) -> Vec<u8> {
    let mut out = ERROR_PREFIX.to_vec();
    out.push(b' ');
    out.extend_from_slice(text);
    out
}

/// Text of a received error message, without the marker.
pub(crate) fn error_text(message: &[u8]) -> &[u8] {
    let text = message.strip_prefix(ERROR_PREFIX).unwrap_or(message);
    text.strip_prefix(b" ").unwrap_or(text)
}
