use crate::version::{Version, VersionSet};

/// Spells out the bits of `c`, most significant first, as space (0) or tab (1).
const fn bits(c: u8) -> [u8; 8] {
    let mut out = [b' '; 8];
    let mut i = 0;
    while i < 8 {
        if c & (0x80 >> i) != 0 {
            out[i] = b'\t';
        }
        i += 1;
    }
    out
}

const fn base_tag() -> [u8; 16] {
    let o = bits(b'O');
    let t = bits(b'T');
    let mut out = [0u8; 16];
    let mut i = 0;
    while i < 8 {
        out[i] = o[i];
        out[i + 8] = t[i];
        i += 1;
    }
    out
}

const BASE_TAG: [u8; 16] = base_tag();
const V2_TAG: [u8; 8] = bits(b'2');
const V3_TAG: [u8; 8] = bits(b'3');

fn version_tag(version: Version) -> [u8; 8] {
    match version {
        Version::V2 => V2_TAG,
        Version::V3 => V3_TAG,
    }
}

/// Appends a whitespace tag advertising `versions` to `message`.
pub fn append_whitespace_tag(message: &[u8], versions: VersionSet) -> Vec<u8> {
    let mut out = Vec::with_capacity(message.len() + BASE_TAG.len() + 16);
    out.extend_from_slice(message);
    out.extend_from_slice(&BASE_TAG);
    for version in versions.iter() {
        out.extend_from_slice(&version_tag(version));
    }
    out
}

/// Removes a whitespace tag from `message`.
///
/// Returns the message without the tag and the versions it advertised, or
/// `None` when the message carries no tag. Version tags we do not know are
/// removed but not reported.
pub fn extract_whitespace_tag(message: &[u8]) -> Option<(Vec<u8>, VersionSet)> {
    let start = message
        .windows(BASE_TAG.len())
        .position(|window| window == BASE_TAG)?;

    let mut versions = VersionSet::new();
    let mut end = start + BASE_TAG.len();
    while let Some(chunk) = message.get(end..end + 8) {
        if !chunk.iter().all(|c| *c == b' ' || *c == b'\t') {
            break;
        }
        if chunk == V2_TAG {
            versions.insert(Version::V2);
        } else if chunk == V3_TAG {
            versions.insert(Version::V3);
        }
        end += 8;
    }

    let mut plain = Vec::with_capacity(message.len() - (end - start));
    plain.extend_from_slice(&message[..start]);
    plain.extend_from_slice(&message[end..]);
    Some((plain, versions))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_tag_bytes() {
        assert_eq!(
            &BASE_TAG,
            b" \t  \t\t\t\t \t \t \t  "
        );
        assert_eq!(&V2_TAG, b"  \t\t  \t ");
        assert_eq!(&V3_TAG, b"  \t\t  \t\t");
    }

    #[test]
    fn test_whitespace_round_trip() {
        let versions: VersionSet = [Version::V2, Version::V3].into_iter().collect();
        let tagged = append_whitespace_tag(b"Hello there", versions);

        let (plain, found) = extract_whitespace_tag(&tagged).unwrap();
        assert_eq!(plain, b"Hello there");
        assert_eq!(found, versions);
    }

    #[test]
    fn test_tag_in_the_middle() {
        let mut message = b"Hi".to_vec();
        message.extend_from_slice(&BASE_TAG);
        message.extend_from_slice(&V3_TAG);
        message.extend_from_slice(b"there");

        let (plain, found) = extract_whitespace_tag(&message).unwrap();
        assert_eq!(plain, b"Hithere");
        assert_eq!(found.best(), Some(Version::V3));
        assert!(!found.contains(Version::V2));
    }

    #[test]
    fn test_unknown_version_tags_are_skipped() {
        let mut message = BASE_TAG.to_vec();
        message.extend_from_slice(&bits(b'1'));
        message.extend_from_slice(&V2_TAG);

        let (plain, found) = extract_whitespace_tag(&message).unwrap();
        assert!(plain.is_empty());
        assert_eq!(found.best(), Some(Version::V2));
    }

    #[test]
    fn test_no_tag() {
        assert!(extract_whitespace_tag(b"just text").is_none());
    }
}
