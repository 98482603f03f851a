mod envelope;
mod whitespace;

pub use envelope::query_message;
pub(crate) use envelope::*;
pub use whitespace::{append_whitespace_tag, extract_whitespace_tag};

use crate::Error;
use num_bigint::BigUint;
use num_traits::Zero;

/// Minimal big-endian encoding of `n`; zero encodes to no bytes.
pub(crate) fn mpi_bytes(n: &BigUint) -> Vec<u8> {
    if n.is_zero() {
        Vec::new()
    } else {
        n.to_bytes_be()
    }
}

pub(crate) fn append_short(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_be_bytes());
}

pub(crate) fn append_word(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_be_bytes());
}

/// Appends a WORD length followed by the bytes.
pub(crate) fn append_data(buf: &mut Vec<u8>, data: &[u8]) {
    append_word(buf, data.len() as u32);
    buf.extend_from_slice(data);
}

pub(crate) fn append_mpi(buf: &mut Vec<u8>, n: &BigUint) {
    append_data(buf, &mpi_bytes(n));
}

pub(crate) fn append_mpis(buf: &mut Vec<u8>, values: &[&BigUint]) {
    for n in values {
        append_mpi(buf, n);
    }
}

/// Serializes a single MPI.
pub(crate) fn mpi(n: &BigUint) -> Vec<u8> {
    let mut buf = Vec::new();
    append_mpi(&mut buf, n);
    buf
}

fn truncated() -> Error {
    Error::Malformed("Invalid message format".to_string())
}

/// Cursor over a wire message.
pub(crate) struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    pub(crate) fn fixed(&mut self, len: usize) -> Result<&'a [u8], Error> {
        if self.bytes.len() < len {
            return Err(truncated());
        }
        let (head, tail) = self.bytes.split_at(len);
        self.bytes = tail;
        Ok(head)
    }

    pub(crate) fn byte(&mut self) -> Result<u8, Error> {
        Ok(self.fixed(1)?[0])
    }

    pub(crate) fn short(&mut self) -> Result<u16, Error> {
        let bytes = self.fixed(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub(crate) fn word(&mut self) -> Result<u32, Error> {
        let bytes = self.fixed(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub(crate) fn data(&mut self) -> Result<&'a [u8], Error> {
        let len = self.word()? as usize;
        self.fixed(len)
    }

    pub(crate) fn mpi(&mut self) -> Result<BigUint, Error> {
        Ok(BigUint::from_bytes_be(self.data()?))
    }

    pub(crate) fn mpis(&mut self, count: usize) -> Result<Vec<BigUint>, Error> {
        (0..count).map(|_| self.mpi()).collect()
    }

    /// Everything not consumed yet.
    pub(crate) fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.bytes)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Fails unless the whole input has been consumed.
    pub(crate) fn finish(self) -> Result<(), Error> {
        if self.bytes.is_empty() {
            Ok(())
        } else {
            Err(Error::Malformed("Trailing bytes after message".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mpi_encoding() {
        assert_eq!(mpi(&BigUint::zero()), vec![0, 0, 0, 0]);
        assert_eq!(mpi(&BigUint::from(1u32)), vec![0, 0, 0, 1, 1]);
        assert_eq!(mpi(&BigUint::from(0x1234u32)), vec![0, 0, 0, 2, 0x12, 0x34]);
    }

    #[test]
    fn test_reader_primitives() {
        let mut buf = Vec::new();
        buf.push(7);
        append_short(&mut buf, 3);
        append_word(&mut buf, 0xDEADBEEF);
        append_data(&mut buf, b"hi");
        append_mpi(&mut buf, &BigUint::from(258u32));

        let mut reader = Reader::new(&buf);
        assert_eq!(reader.byte().unwrap(), 7);
        assert_eq!(reader.short().unwrap(), 3);
        assert_eq!(reader.word().unwrap(), 0xDEADBEEF);
        assert_eq!(reader.data().unwrap(), b"hi");
        assert_eq!(reader.mpi().unwrap(), BigUint::from(258u32));
        assert!(reader.is_empty());
        assert!(reader.finish().is_ok());
    }

    #[test]
    fn test_reader_rejects_truncated_data() {
        let buf = [0, 0, 0, 9, 1, 2];
        let mut reader = Reader::new(&buf);
        assert!(matches!(reader.data(), Err(Error::Malformed(_))));
    }

    #[test]
    fn test_reader_rejects_trailing_bytes() {
        let buf = [0, 1, 2];
        let mut reader = Reader::new(&buf);
        reader.short().unwrap();
        assert!(reader.finish().is_err());
    }
}
