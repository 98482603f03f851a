use crate::Error;
use crate::codec::{Reader, append_short};

pub(crate) const TLV_PADDING: u16 = 0;
pub(crate) const TLV_DISCONNECTED: u16 = 1;
pub(crate) const TLV_SMP1: u16 = 2;
pub(crate) const TLV_SMP2: u16 = 3;
pub(crate) const TLV_SMP3: u16 = 4;
pub(crate) const TLV_SMP4: u16 = 5;
pub(crate) const TLV_SMP_ABORT: u16 = 6;
pub(crate) const TLV_SMP1Q: u16 = 7;
pub(crate) const TLV_EXTRA_SYMMETRIC_KEY: u16 = 8;

const PADDING_GRANULARITY: usize = 256;
const TLV_HEADER_LEN: usize = 4;

/// A type-length-value record carried after the human-readable message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Tlv {
    pub(crate) tlv_type: u16,
    pub(crate) value: Vec<u8>,
}

impl Tlv {
    pub(crate) fn new(tlv_type: u16, value: Vec<u8>) -> Self {
        Self { tlv_type, value }
    }

    pub(crate) fn is_smp(&self) -> bool {
        matches!(
            self.tlv_type,
            TLV_SMP1 | TLV_SMP2 | TLV_SMP3 | TLV_SMP4 | TLV_SMP_ABORT | TLV_SMP1Q
        )
    }

    fn append_to(&self, out: &mut Vec<u8>) -> Result<(), Error> {
        let len = u16::try_from(self.value.len())
            .map_err(|_| Error::Protocol("TLV value too long".to_string()))?;
        append_short(out, self.tlv_type);
        append_short(out, len);
        out.extend_from_slice(&self.value);
        Ok(())
    }

    fn read(reader: &mut Reader<'_>) -> Result<Self, Error> {
        let tlv_type = reader.short()?;
        let len = reader.short()? as usize;
        let value = reader.fixed(len)?.to_vec();
        Ok(Self { tlv_type, value })
    }
}

/// Encodes `message ‖ 0x00 ‖ TLVs`, padded to a multiple of 256 bytes.
pub(crate) fn encode_plaintext(message: &[u8], tlvs: &[Tlv]) -> Result<Vec<u8>, Error> {
    let mut out = Vec::with_capacity(message.len() + PADDING_GRANULARITY);
    out.extend_from_slice(message);
    out.push(0);
    for tlv in tlvs {
        tlv.append_to(&mut out)?;
    }

    let padding = (PADDING_GRANULARITY - (out.len() + TLV_HEADER_LEN) % PADDING_GRANULARITY)
        % PADDING_GRANULARITY;
    Tlv::new(TLV_PADDING, vec![0; padding]).append_to(&mut out)?;
    Ok(out)
}

/// Splits a decrypted payload into the message and its TLVs.
///
/// Padding TLVs are dropped. A payload without a NUL separator is all message.
pub(crate) fn decode_plaintext(bytes: &[u8]) -> Result<(Vec<u8>, Vec<Tlv>), Error> {
    let Some(nul) = bytes.iter().position(|b| *b == 0) else {
        return Ok((bytes.to_vec(), Vec::new()));
    };

    let mut reader = Reader::new(&bytes[nul + 1..]);
    let mut tlvs = Vec::new();
    while !reader.is_empty() {
        let tlv = Tlv::read(&mut reader)?;
        if tlv.tlv_type != TLV_PADDING {
            tlvs.push(tlv);
        }
    }

    Ok((bytes[..nul].to_vec(), tlvs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plaintext_is_padded() {
        let encoded = encode_plaintext(b"hello", &[]).unwrap();
        assert_eq!(encoded.len() % PADDING_GRANULARITY, 0);
        assert_eq!(&encoded[..6], b"hello\0");

        let (message, tlvs) = decode_plaintext(&encoded).unwrap();
        assert_eq!(message, b"hello");
        assert!(tlvs.is_empty());
    }

    #[test]
    fn test_tlvs_survive_encoding() {
        let tlvs = vec![
            Tlv::new(TLV_DISCONNECTED, Vec::new()),
            Tlv::new(TLV_EXTRA_SYMMETRIC_KEY, vec![0, 0, 0, 1, 42]),
        ];
        let encoded = encode_plaintext(b"", &tlvs).unwrap();
        assert_eq!(encoded.len(), 256);

        let (message, decoded) = decode_plaintext(&encoded).unwrap();
        assert!(message.is_empty());
        assert_eq!(decoded, tlvs);
    }

    #[test]
    fn test_payload_without_tlvs() {
        let (message, tlvs) = decode_plaintext(b"plain words").unwrap();
        assert_eq!(message, b"plain words");
        assert!(tlvs.is_empty());
    }

    #[test]
    fn test_truncated_tlv_is_malformed() {
        let bytes = [b'h', b'i', 0, 0, 1, 0, 5, 1, 2];
        assert!(matches!(decode_plaintext(&bytes), Err(Error::Malformed(_))));
    }

    #[test]
    fn test_smp_classification() {
        assert!(Tlv::new(TLV_SMP1Q, Vec::new()).is_smp());
        assert!(Tlv::new(TLV_SMP_ABORT, Vec::new()).is_smp());
        assert!(!Tlv::new(TLV_DISCONNECTED, Vec::new()).is_smp());
        assert!(!Tlv::new(TLV_EXTRA_SYMMETRIC_KEY, Vec::new()).is_smp());
    }
}
