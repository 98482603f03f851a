use crate::Error;
use crate::codec::{Reader, append_mpis, append_word};
use crate::data_message::{TLV_SMP1, TLV_SMP1Q, TLV_SMP2, TLV_SMP3, TLV_SMP4, Tlv};
use num_bigint::BigUint;

fn encode(tlv_type: u16, values: &[&BigUint]) -> Tlv {
    let mut value = Vec::new();
    append_word(&mut value, values.len() as u32);
    append_mpis(&mut value, values);
    Tlv::new(tlv_type, value)
}

fn decode<const N: usize>(value: &[u8]) -> Result<[BigUint; N], Error> {
    let mut reader = Reader::new(value);
    if reader.word()? as usize != N {
        return Err(Error::Malformed("Unexpected SMP value count".to_string()));
    }
    let values = reader.mpis(N)?;
    reader.finish()?;
    values
        .try_into()
        .map_err(|_| Error::Malformed("Unexpected SMP value count".to_string()))
}

/// First message: the initiator's generators and their proofs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(super) struct Smp1 {
    pub(super) g2a: BigUint,
    pub(super) c2: BigUint,
    pub(super) d2: BigUint,
    pub(super) g3a: BigUint,
    pub(super) c3: BigUint,
    pub(super) d3: BigUint,
}

impl Smp1 {
    /// Encodes as SMP1, or as SMP1Q when a question is given.
    pub(super) fn to_tlv(&self, question: Option<&str>) -> Tlv {
        let values = [&self.g2a, &self.c2, &self.d2, &self.g3a, &self.c3, &self.d3];
        match question {
            None => encode(TLV_SMP1, &values),
            Some(question) => {
                let inner = encode(TLV_SMP1Q, &values);
                let mut value = question.as_bytes().to_vec();
                value.push(0);
                value.extend_from_slice(&inner.value);
                Tlv::new(TLV_SMP1Q, value)
            }
        }
    }

    /// Parses SMP1 or SMP1Q, returning the question if there is one.
    pub(super) fn from_tlv(tlv: &Tlv) -> Result<(Self, Option<String>), Error> {
        let (question, value) = if tlv.tlv_type == TLV_SMP1Q {
            let nul = tlv
                .value
                .iter()
                .position(|b| *b == 0)
                .ok_or_else(|| Error::Malformed("SMP question is not terminated".to_string()))?;
            let question = String::from_utf8_lossy(&tlv.value[..nul]).into_owned();
            (Some(question), &tlv.value[nul + 1..])
        } else {
            (None, tlv.value.as_slice())
        };

        let [g2a, c2, d2, g3a, c3, d3] = decode::<6>(value)?;
        Ok((
            Self {
                g2a,
                c2,
                d2,
                g3a,
                c3,
                d3,
            },
            question,
        ))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(super) struct Smp2 {
    pub(super) g2b: BigUint,
    pub(super) c2: BigUint,
    pub(super) d2: BigUint,
    pub(super) g3b: BigUint,
    pub(super) c3: BigUint,
    pub(super) d3: BigUint,
    pub(super) pb: BigUint,
    pub(super) qb: BigUint,
    pub(super) cp: BigUint,
    pub(super) d5: BigUint,
    pub(super) d6: BigUint,
}

impl Smp2 {
    pub(super) fn to_tlv(&self) -> Tlv {
        encode(
            TLV_SMP2,
            &[
                &self.g2b, &self.c2, &self.d2, &self.g3b, &self.c3, &self.d3, &self.pb, &self.qb,
                &self.cp, &self.d5, &self.d6,
            ],
        )
    }

    pub(super) fn from_tlv(tlv: &Tlv) -> Result<Self, Error> {
        let [g2b, c2, d2, g3b, c3, d3, pb, qb, cp, d5, d6] = decode::<11>(&tlv.value)?;
        Ok(Self {
            g2b,
            c2,
            d2,
            g3b,
            c3,
            d3,
            pb,
            qb,
            cp,
            d5,
            d6,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(super) struct Smp3 {
    pub(super) pa: BigUint,
    pub(super) qa: BigUint,
    pub(super) cp: BigUint,
    pub(super) d5: BigUint,
    pub(super) d6: BigUint,
    pub(super) ra: BigUint,
    pub(super) cr: BigUint,
    pub(super) d7: BigUint,
}

impl Smp3 {
    pub(super) fn to_tlv(&self) -> Tlv {
        encode(
            TLV_SMP3,
            &[
                &self.pa, &self.qa, &self.cp, &self.d5, &self.d6, &self.ra, &self.cr, &self.d7,
            ],
        )
    }

    pub(super) fn from_tlv(tlv: &Tlv) -> Result<Self, Error> {
        let [pa, qa, cp, d5, d6, ra, cr, d7] = decode::<8>(&tlv.value)?;
        Ok(Self {
            pa,
            qa,
            cp,
            d5,
            d6,
            ra,
            cr,
            d7,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(super) struct Smp4 {
    pub(super) rb: BigUint,
    pub(super) cr: BigUint,
    pub(super) d7: BigUint,
}

impl Smp4 {
    pub(super) fn to_tlv(&self) -> Tlv {
        encode(TLV_SMP4, &[&self.rb, &self.cr, &self.d7])
    }

    pub(super) fn from_tlv(tlv: &Tlv) -> Result<Self, Error> {
        let [rb, cr, d7] = decode::<3>(&tlv.value)?;
        Ok(Self { rb, cr, d7 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_smp1() -> Smp1 {
        Smp1 {
            g2a: BigUint::from(1u32),
            c2: BigUint::from(2u32),
            d2: BigUint::from(3u32),
            g3a: BigUint::from(4u32),
            c3: BigUint::from(5u32),
            d3: BigUint::from(6u32),
        }
    }

    #[test]
    fn test_smp1_layout() {
        let tlv = sample_smp1().to_tlv(None);
        assert_eq!(tlv.tlv_type, TLV_SMP1);
        assert_eq!(&tlv.value[..4], &[0, 0, 0, 6]);
        // Each small MPI is a 4-byte length and one byte
        assert_eq!(tlv.value.len(), 4 + 6 * 5);
        assert_eq!(&tlv.value[4..9], &[0, 0, 0, 1, 1]);
    }

    #[test]
    fn test_smp1_question() {
        let message = sample_smp1();
        let tlv = message.to_tlv(Some("Where did we meet?"));
        assert_eq!(tlv.tlv_type, TLV_SMP1Q);
        assert!(tlv.value.starts_with(b"Where did we meet?\0"));

        let (parsed, question) = Smp1::from_tlv(&tlv).unwrap();
        assert_eq!(parsed, message);
        assert_eq!(question.as_deref(), Some("Where did we meet?"));
    }

    #[test]
    fn test_wrong_count_is_malformed() {
        let short = encode(TLV_SMP4, &[&BigUint::from(1u32), &BigUint::from(2u32)]);
        assert!(matches!(Smp4::from_tlv(&short), Err(Error::Malformed(_))));

        let mut lying = encode(TLV_SMP4, &[&BigUint::from(1u32)]);
        lying.value[3] = 3;
        assert!(Smp4::from_tlv(&lying).is_err());
    }

    #[test]
    fn test_question_without_terminator() {
        let tlv = Tlv::new(TLV_SMP1Q, b"no terminator".to_vec());
        assert!(Smp1::from_tlv(&tlv).is_err());
    }
}
