use crate::Error;
use crate::codec::{Reader, append_data, append_mpi};
use num_bigint::BigUint;

/// Length of the truncated MACs carried in the last two messages.
pub(super) const MAC_LEN: usize = 20;
const R_LEN: usize = 16;
const HASH_LEN: usize = 32;

fn invalid() -> Error {
    Error::Malformed("Invalid key exchange message".to_string())
}

/// Commitment to the initiator's public value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(super) struct DhCommit {
    pub(super) encrypted_gx: Vec<u8>,
    pub(super) hashed_gx: Vec<u8>,
}

impl DhCommit {
    pub(super) fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.encrypted_gx.len() + self.hashed_gx.len());
        append_data(&mut out, &self.encrypted_gx);
        append_data(&mut out, &self.hashed_gx);
        out
    }

    pub(super) fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let mut reader = Reader::new(bytes);
        let encrypted_gx = reader.data()?.to_vec();
        let hashed_gx = reader.data()?.to_vec();
        reader.finish()?;

        if hashed_gx.len() != HASH_LEN {
            return Err(invalid());
        }

        Ok(Self {
            encrypted_gx,
            hashed_gx,
        })
    }
}

/// The responder's public value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(super) struct DhKey {
    pub(super) gy: BigUint,
}

impl DhKey {
    pub(super) fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        append_mpi(&mut out, &self.gy);
        out
    }

    pub(super) fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let mut reader = Reader::new(bytes);
        let gy = reader.mpi()?;
        reader.finish()?;
        Ok(Self { gy })
    }
}

/// Reveals the commitment key and carries the initiator's signature.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(super) struct RevealSig {
    pub(super) r: [u8; R_LEN],
    pub(super) signed: SignedPart,
}

impl RevealSig {
    pub(super) fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        append_data(&mut out, &self.r);
        self.signed.append_to(&mut out);
        out
    }

    pub(super) fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let mut reader = Reader::new(bytes);
        let r = reader.data()?.try_into().map_err(|_| invalid())?;
        let signed = SignedPart::read(&mut reader)?;
        reader.finish()?;
        Ok(Self { r, signed })
    }
}

/// Encrypted signature followed by its truncated MAC.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(super) struct SignedPart {
    /// DATA-encoded ciphertext, exactly as covered by the MAC.
    pub(super) encrypted_sig: Vec<u8>,
    pub(super) mac: [u8; MAC_LEN],
}

impl SignedPart {
    fn append_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.encrypted_sig);
        out.extend_from_slice(&self.mac);
    }

    fn read(reader: &mut Reader<'_>) -> Result<Self, Error> {
        let ciphertext = reader.data()?;
        let mut encrypted_sig = Vec::with_capacity(4 + ciphertext.len());
        append_data(&mut encrypted_sig, ciphertext);
        let mac = reader.fixed(MAC_LEN)?.try_into().map_err(|_| invalid())?;
        Ok(Self { encrypted_sig, mac })
    }

    /// The ciphertext without its length prefix.
    pub(super) fn ciphertext(&self) -> &[u8] {
        &self.encrypted_sig[4..]
    }

    pub(super) fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.append_to(&mut out);
        out
    }

    pub(super) fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let mut reader = Reader::new(bytes);
        let signed = Self::read(&mut reader)?;
        reader.finish()?;
        Ok(signed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dh_commit_requires_sha256_hash() {
        let commit = DhCommit {
            encrypted_gx: vec![1, 2, 3],
            hashed_gx: vec![9; 32],
        };
        assert_eq!(DhCommit::from_bytes(&commit.to_bytes()).unwrap(), commit);

        let short = DhCommit {
            encrypted_gx: vec![1, 2, 3],
            hashed_gx: vec![9; 20],
        };
        assert!(DhCommit::from_bytes(&short.to_bytes()).is_err());
    }

    #[test]
    fn test_reveal_sig_layout() {
        let mut encrypted_sig = Vec::new();
        append_data(&mut encrypted_sig, &[7; 50]);
        let message = RevealSig {
            r: [3; 16],
            signed: SignedPart {
                encrypted_sig,
                mac: [5; 20],
            },
        };

        let bytes = message.to_bytes();
        assert_eq!(bytes.len(), 4 + 16 + 4 + 50 + 20);
        assert_eq!(&bytes[..4], &[0, 0, 0, 16]);

        let parsed = RevealSig::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, message);
        assert_eq!(parsed.signed.ciphertext(), &[7; 50]);
    }

    #[test]
    fn test_reveal_sig_rejects_short_r() {
        let mut bytes = Vec::new();
        append_data(&mut bytes, &[3; 15]);
        append_data(&mut bytes, &[7; 10]);
        bytes.extend_from_slice(&[5; 20]);
        assert!(RevealSig::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_signature_message_truncated_mac() {
        let mut bytes = Vec::new();
        append_data(&mut bytes, &[7; 10]);
        bytes.extend_from_slice(&[5; 19]);
        assert!(SignedPart::from_bytes(&bytes).is_err());
    }
}
