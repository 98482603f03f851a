mod message;
mod proof;

use crate::Error;
use crate::crypto::{
    RandomSource, div, exp, exp_g, is_group_element, mul, random_mpi, sha256, wipe_big,
};
use crate::data_message::{TLV_SMP_ABORT, TLV_SMP1, TLV_SMP1Q, TLV_SMP2, TLV_SMP3, TLV_SMP4, Tlv};
use crate::event::SmpEvent;
use message::{Smp1, Smp2, Smp3, Smp4};
use num_bigint::BigUint;
use proof::{
    CoordinateNonces, Coordinates, prove_coordinates, prove_equal_logs, prove_log,
    verify_coordinates, verify_equal_logs, verify_log,
};
use tracing::{debug, warn};

/// Length in bytes of the random exponents.
const EXPONENT_LEN: usize = 192;

const SMP_VERSION: u8 = 1;

/// What the peer needs to know to bind the secret to this session.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SmpContext {
    pub(crate) our_fingerprint: [u8; 20],
    pub(crate) their_fingerprint: [u8; 20],
    pub(crate) ssid: [u8; 8],
}

/// Combines the user's secret with both fingerprints and the session id.
fn combined_secret(
    initiator: &[u8; 20],
    responder: &[u8; 20],
    ssid: &[u8; 8],
    secret: &[u8],
) -> BigUint {
    BigUint::from_bytes_be(&sha256(&[&[SMP_VERSION], initiator, responder, ssid, secret]))
}

fn random_exponent(rng: &mut dyn RandomSource) -> Result<BigUint, Error> {
    random_mpi(rng, EXPONENT_LEN)
}

fn abort_tlv() -> Tlv {
    Tlv::new(TLV_SMP_ABORT, Vec::new())
}

/// Values the initiator keeps while waiting for SMP2.
struct AwaitingSmp2 {
    x: BigUint,
    a2: BigUint,
    a3: BigUint,
}

/// Values the responder keeps while waiting for SMP3.
struct AwaitingSmp3 {
    b3: BigUint,
    g2: BigUint,
    g3: BigUint,
    g3a: BigUint,
    pb: BigUint,
    qb: BigUint,
}

/// Values the initiator keeps while waiting for SMP4.
struct AwaitingSmp4 {
    a3: BigUint,
    g3b: BigUint,
    pa_pb: BigUint,
    qa_qb: BigUint,
}

#[derive(Default)]
enum Step {
    #[default]
    Expect1,
    WaitingForSecret(Box<Smp1>),
    Expect2(Box<AwaitingSmp2>),
    Expect3(Box<AwaitingSmp3>),
    Expect4(Box<AwaitingSmp4>),
}

impl Step {
    fn name(&self) -> &'static str {
        match self {
            Self::Expect1 => "expect1",
            Self::WaitingForSecret(_) => "waiting_for_secret",
            Self::Expect2(_) => "expect2",
            Self::Expect3(_) => "expect3",
            Self::Expect4(_) => "expect4",
        }
    }

    fn wipe(&mut self) {
        match self {
            Self::Expect1 => {}
            Self::WaitingForSecret(m) => {
                for n in [&mut m.g2a, &mut m.c2, &mut m.d2, &mut m.g3a, &mut m.c3, &mut m.d3] {
                    wipe_big(n);
                }
            }
            Self::Expect2(s) => {
                for n in [&mut s.x, &mut s.a2, &mut s.a3] {
                    wipe_big(n);
                }
            }
            Self::Expect3(s) => {
                for n in [&mut s.b3, &mut s.g2, &mut s.g3, &mut s.g3a, &mut s.pb, &mut s.qb] {
                    wipe_big(n);
                }
            }
            Self::Expect4(s) => {
                for n in [&mut s.a3, &mut s.g3b, &mut s.pa_pb, &mut s.qa_qb] {
                    wipe_big(n);
                }
            }
        }
        *self = Self::Expect1;
    }
}

/// Outcome of handling one SMP TLV.
#[derive(Debug, Default)]
pub(crate) struct SmpStep {
    pub(crate) reply: Option<Tlv>,
    /// Event and progress percentage to report.
    pub(crate) event: Option<(SmpEvent, u8)>,
}

impl SmpStep {
    fn event(event: SmpEvent, progress: u8) -> Self {
        Self {
            reply: None,
            event: Some((event, progress)),
        }
    }

    fn abort(event: SmpEvent) -> Self {
        Self {
            reply: Some(abort_tlv()),
            event: Some((event, 0)),
        }
    }
}

/// The socialist millionaires' protocol.
///
/// Lets both sides check that they share a secret without revealing it.
/// The initiator moves through expect1, expect2 and expect4, the responder
/// through expect1, waiting_for_secret and expect3; both end in expect1.
#[derive(Default)]
pub(crate) struct Smp {
    step: Step,
    question: Option<String>,
}

impl Smp {
    pub(crate) fn question(&self) -> Option<&str> {
        self.question.as_deref()
    }

    /// Wipes everything and returns to expect1.
    pub(crate) fn reset(&mut self) {
        self.step.wipe();
        self.question = None;
    }

    /// Aborts any run in progress and returns the abort TLV for the peer.
    pub(crate) fn abort(&mut self) -> Tlv {
        debug!(step = self.step.name(), "Aborting SMP");
        self.reset();
        abort_tlv()
    }

    /// Starts a run as initiator.
    ///
    /// An abort TLV is prepended when a previous run was still in progress.
    pub(crate) fn start(
        &mut self,
        rng: &mut dyn RandomSource,
        context: &SmpContext,
        question: Option<&str>,
        secret: &[u8],
    ) -> Result<Vec<Tlv>, Error> {
        let x = combined_secret(
            &context.our_fingerprint,
            &context.their_fingerprint,
            &context.ssid,
            secret,
        );
        let (a2, a3, r2, r3) = (
            random_exponent(rng)?,
            random_exponent(rng)?,
            random_exponent(rng)?,
            random_exponent(rng)?,
        );

        let (c2, d2) = prove_log(1, &r2, &a2);
        let (c3, d3) = prove_log(2, &r3, &a3);
        let message = Smp1 {
            g2a: exp_g(&a2),
            c2,
            d2,
            g3a: exp_g(&a3),
            c3,
            d3,
        };

        let mut tlvs = Vec::with_capacity(2);
        if !matches!(self.step, Step::Expect1) {
            tlvs.push(abort_tlv());
        }
        tlvs.push(message.to_tlv(question));

        self.reset();
        self.step = Step::Expect2(Box::new(AwaitingSmp2 { x, a2, a3 }));
        debug!(with_question = question.is_some(), "Started SMP");
        Ok(tlvs)
    }

    /// Answers a received SMP1 with our secret, producing SMP2.
    pub(crate) fn provide_secret(
        &mut self,
        rng: &mut dyn RandomSource,
        context: &SmpContext,
        secret: &[u8],
    ) -> Result<Tlv, Error> {
        let Step::WaitingForSecret(received) = &self.step else {
            return Err(Error::Smp("Not waiting for a secret".to_string()));
        };

        let y = combined_secret(
            &context.their_fingerprint,
            &context.our_fingerprint,
            &context.ssid,
            secret,
        );
        let mut exponents = Vec::with_capacity(7);
        for _ in 0..7 {
            exponents.push(random_exponent(rng)?);
        }
        let [b2, b3, r2, r3, r4, r5, r6] = <[BigUint; 7]>::try_from(exponents)
            .map_err(|_| Error::Smp("Exponent generation failed".to_string()))?;

        let (c2, d2) = prove_log(3, &r2, &b2);
        let (c3, d3) = prove_log(4, &r3, &b3);

        let g2 = exp(&received.g2a, &b2);
        let g3 = exp(&received.g3a, &b3);
        let pb = exp(&g3, &r4);
        let qb = mul(&exp_g(&r4), &exp(&g2, &y));
        let nonces = CoordinateNonces { r5: &r5, r6: &r6 };
        let (cp, d5, d6) = prove_coordinates(5, &g2, &g3, nonces, &r4, &y);

        let message = Smp2 {
            g2b: exp_g(&b2),
            c2,
            d2,
            g3b: exp_g(&b3),
            c3,
            d3,
            pb: pb.clone(),
            qb: qb.clone(),
            cp,
            d5,
            d6,
        };

        let g3a = received.g3a.clone();
        self.step.wipe();
        self.step = Step::Expect3(Box::new(AwaitingSmp3 {
            b3,
            g2,
            g3,
            g3a,
            pb,
            qb,
        }));
        debug!("Sent SMP2");
        Ok(message.to_tlv())
    }

    /// Handles an SMP TLV received inside a data message.
    ///
    /// A message that fails verification aborts the run and reports cheating.
    /// A local randomness failure is returned as is and leaves the run where it was.
    pub(crate) fn receive(
        &mut self,
        rng: &mut dyn RandomSource,
        tlv: &Tlv,
    ) -> Result<SmpStep, Error> {
        let result = match tlv.tlv_type {
            TLV_SMP_ABORT => {
                self.reset();
                return Ok(SmpStep::event(SmpEvent::Abort, 0));
            }
            TLV_SMP1 | TLV_SMP1Q => self.receive_smp1(tlv),
            TLV_SMP2 => self.receive_smp2(rng, tlv),
            TLV_SMP3 => self.receive_smp3(rng, tlv),
            TLV_SMP4 => self.receive_smp4(tlv),
            _ => return Ok(SmpStep::default()),
        };

        match result {
            Err(Error::Random) => Err(Error::Random),
            Err(err) => {
                warn!(%err, step = self.step.name(), "Peer sent an invalid SMP message");
                self.reset();
                Ok(SmpStep::abort(SmpEvent::Cheated))
            }
            step => step,
        }
    }

    fn unexpected(&mut self) -> Result<SmpStep, Error> {
        warn!(step = self.step.name(), "SMP message out of order");
        self.reset();
        Ok(SmpStep::abort(SmpEvent::Error))
    }

    fn receive_smp1(&mut self, tlv: &Tlv) -> Result<SmpStep, Error> {
        if !matches!(self.step, Step::Expect1) {
            return self.unexpected();
        }

        let (message, question) = Smp1::from_tlv(tlv)?;
        check_elements(&[&message.g2a, &message.g3a])?;
        if !verify_log(1, &message.c2, &message.d2, &message.g2a) {
            return Err(Error::Smp("c2 is not a valid proof".to_string()));
        }
        if !verify_log(2, &message.c3, &message.d3, &message.g3a) {
            return Err(Error::Smp("c3 is not a valid proof".to_string()));
        }

        let event = if question.is_some() {
            SmpEvent::AskForAnswer
        } else {
            SmpEvent::AskForSecret
        };
        self.question = question;
        self.step = Step::WaitingForSecret(Box::new(message));
        debug!("Received SMP1");
        Ok(SmpStep::event(event, 25))
    }

    fn receive_smp2(&mut self, rng: &mut dyn RandomSource, tlv: &Tlv) -> Result<SmpStep, Error> {
        let Step::Expect2(state) = &self.step else {
            return self.unexpected();
        };

        let message = Smp2::from_tlv(tlv)?;
        check_elements(&[&message.g2b, &message.g3b, &message.pb, &message.qb])?;
        if !verify_log(3, &message.c2, &message.d2, &message.g2b) {
            return Err(Error::Smp("c2 is not a valid proof".to_string()));
        }
        if !verify_log(4, &message.c3, &message.d3, &message.g3b) {
            return Err(Error::Smp("c3 is not a valid proof".to_string()));
        }

        let g2 = exp(&message.g2b, &state.a2);
        let g3 = exp(&message.g3b, &state.a3);
        let coordinates = Coordinates {
            p: &message.pb,
            q: &message.qb,
            cp: &message.cp,
            d5: &message.d5,
            d6: &message.d6,
        };
        if !verify_coordinates(5, &g2, &g3, coordinates) {
            return Err(Error::Smp("cP is not a valid proof".to_string()));
        }

        let (r4, r5, r6, r7) = (
            random_exponent(rng)?,
            random_exponent(rng)?,
            random_exponent(rng)?,
            random_exponent(rng)?,
        );
        let pa = exp(&g3, &r4);
        let qa = mul(&exp_g(&r4), &exp(&g2, &state.x));
        let nonces = CoordinateNonces { r5: &r5, r6: &r6 };
        let (cp, d5, d6) = prove_coordinates(6, &g2, &g3, nonces, &r4, &state.x);

        let qa_qb = div(&qa, &message.qb);
        let pa_pb = div(&pa, &message.pb);
        let ra = exp(&qa_qb, &state.a3);
        let (cr, d7) = prove_equal_logs(7, &qa_qb, &r7, &state.a3);

        let reply = Smp3 {
            pa,
            qa,
            cp,
            d5,
            d6,
            ra,
            cr,
            d7,
        };
        let next = AwaitingSmp4 {
            a3: state.a3.clone(),
            g3b: message.g3b,
            pa_pb,
            qa_qb,
        };

        self.step.wipe();
        self.step = Step::Expect4(Box::new(next));
        debug!("Received SMP2");
        Ok(SmpStep {
            reply: Some(reply.to_tlv()),
            event: Some((SmpEvent::InProgress, 60)),
        })
    }

    fn receive_smp3(&mut self, rng: &mut dyn RandomSource, tlv: &Tlv) -> Result<SmpStep, Error> {
        let Step::Expect3(state) = &self.step else {
            return self.unexpected();
        };

        let message = Smp3::from_tlv(tlv)?;
        check_elements(&[&message.pa, &message.qa, &message.ra])?;
        let coordinates = Coordinates {
            p: &message.pa,
            q: &message.qa,
            cp: &message.cp,
            d5: &message.d5,
            d6: &message.d6,
        };
        if !verify_coordinates(6, &state.g2, &state.g3, coordinates) {
            return Err(Error::Smp("cP is not a valid proof".to_string()));
        }

        let qa_qb = div(&message.qa, &state.qb);
        if !verify_equal_logs(7, &state.g3a, &qa_qb, &message.ra, &message.cr, &message.d7) {
            return Err(Error::Smp("cR is not a valid proof".to_string()));
        }

        let r7 = random_exponent(rng)?;
        let rb = exp(&qa_qb, &state.b3);
        let (cr, d7) = prove_equal_logs(8, &qa_qb, &r7, &state.b3);

        let pa_pb = div(&message.pa, &state.pb);
        let matched = exp(&message.ra, &state.b3) == pa_pb;

        self.reset();
        debug!(matched, "Received SMP3");
        // SMP4 is sent either way so the initiator learns the outcome too
        Ok(SmpStep {
            reply: Some(Smp4 { rb, cr, d7 }.to_tlv()),
            event: Some(outcome(matched)),
        })
    }

    fn receive_smp4(&mut self, tlv: &Tlv) -> Result<SmpStep, Error> {
        let Step::Expect4(state) = &self.step else {
            return self.unexpected();
        };

        let message = Smp4::from_tlv(tlv)?;
        check_elements(&[&message.rb])?;
        if !verify_equal_logs(8, &state.g3b, &state.qa_qb, &message.rb, &message.cr, &message.d7) {
            return Err(Error::Smp("cR is not a valid proof".to_string()));
        }

        let matched = exp(&message.rb, &state.a3) == state.pa_pb;
        self.reset();
        debug!(matched, "Received SMP4");
        Ok(SmpStep {
            reply: None,
            event: Some(outcome(matched)),
        })
    }
}

impl Drop for Smp {
    fn drop(&mut self) {
        self.step.wipe();
    }
}

fn outcome(matched: bool) -> (SmpEvent, u8) {
    if matched {
        (SmpEvent::Success, 100)
    } else {
        (SmpEvent::Failure, 100)
    }
}

fn check_elements(values: &[&BigUint]) -> Result<(), Error> {
    if values.iter().all(|n| is_group_element(n)) {
        Ok(())
    } else {
        Err(Error::Smp("Invalid group element".to_string()))
    }
}
