use crate::codec::append_mpis;
use crate::crypto::{exp, exp_g, mul, order, sha256, sub_mod};
use num_bigint::BigUint;

/// SHA-256 over the step byte and the MPI encodings of `values`.
pub(super) fn hash(step: u8, values: &[&BigUint]) -> BigUint {
    let mut data = vec![step];
    append_mpis(&mut data, values);
    BigUint::from_bytes_be(&sha256(&[&data]))
}

/// Computes r - a * c mod q.
fn response(r: &BigUint, a: &BigUint, c: &BigUint) -> BigUint {
    sub_mod(r, &(a * c), order())
}

/// Proof of knowledge of the exponent `a` of g^a, using the nonce `r`.
pub(super) fn prove_log(step: u8, r: &BigUint, a: &BigUint) -> (BigUint, BigUint) {
    let c = hash(step, &[&exp_g(r)]);
    let d = response(r, a, &c);
    (c, d)
}

/// Checks `c == h(g^d * ga^c)`.
pub(super) fn verify_log(step: u8, c: &BigUint, d: &BigUint, ga: &BigUint) -> bool {
    let commitment = mul(&exp_g(d), &exp(ga, c));
    *c == hash(step, &[&commitment])
}

/// Nonces of a proof that P = g3^r and Q = g^r * g2^x share `r`.
pub(super) struct CoordinateNonces<'a> {
    pub(super) r5: &'a BigUint,
    pub(super) r6: &'a BigUint,
}

/// Proves that P = g3^r and Q = g^r * g2^x were built from the same r and
/// the secret x. Returns (cP, d5, d6).
pub(super) fn prove_coordinates(
    step: u8,
    g2: &BigUint,
    g3: &BigUint,
    nonces: CoordinateNonces<'_>,
    r: &BigUint,
    x: &BigUint,
) -> (BigUint, BigUint, BigUint) {
    let left = exp(g3, nonces.r5);
    let right = mul(&exp_g(nonces.r5), &exp(g2, nonces.r6));
    let cp = hash(step, &[&left, &right]);
    let d5 = response(nonces.r5, r, &cp);
    let d6 = response(nonces.r6, x, &cp);
    (cp, d5, d6)
}

pub(super) struct Coordinates<'a> {
    pub(super) p: &'a BigUint,
    pub(super) q: &'a BigUint,
    pub(super) cp: &'a BigUint,
    pub(super) d5: &'a BigUint,
    pub(super) d6: &'a BigUint,
}

/// Checks `cP == h(g3^d5 * P^cP, g^d5 * g2^d6 * Q^cP)`.
pub(super) fn verify_coordinates(
    step: u8,
    g2: &BigUint,
    g3: &BigUint,
    proof: Coordinates<'_>,
) -> bool {
    let left = mul(&exp(g3, proof.d5), &exp(proof.p, proof.cp));
    let right = mul(
        &mul(&exp_g(proof.d5), &exp(g2, proof.d6)),
        &exp(proof.q, proof.cp),
    );
    *proof.cp == hash(step, &[&left, &right])
}

/// Proves that R = qab^a3 uses the same a3 as the published g3a.
/// Returns (cR, d7).
pub(super) fn prove_equal_logs(
    step: u8,
    qab: &BigUint,
    r7: &BigUint,
    a3: &BigUint,
) -> (BigUint, BigUint) {
    let cr = hash(step, &[&exp_g(r7), &exp(qab, r7)]);
    let d7 = response(r7, a3, &cr);
    (cr, d7)
}

/// Checks `cR == h(g^d7 * g3^cR, qab^d7 * R^cR)`.
pub(super) fn verify_equal_logs(
    step: u8,
    g3: &BigUint,
    qab: &BigUint,
    r: &BigUint,
    cr: &BigUint,
    d7: &BigUint,
) -> bool {
    let left = mul(&exp_g(d7), &exp(g3, cr));
    let right = mul(&exp(qab, d7), &exp(r, cr));
    *cr == hash(step, &[&left, &right])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::div;

    fn n(value: u64) -> BigUint {
        BigUint::from(value)
    }

    #[test]
    fn test_log_proof() {
        let (a, r) = (n(123_456_789), n(987_654_321));
        let ga = exp_g(&a);
        let (c, d) = prove_log(1, &r, &a);

        assert!(verify_log(1, &c, &d, &ga));
        assert!(!verify_log(2, &c, &d, &ga));
        assert!(!verify_log(1, &c, &d, &exp_g(&n(5))));
    }

    #[test]
    fn test_coordinate_proof() {
        let (g2, g3) = (exp_g(&n(11)), exp_g(&n(13)));
        let (r, x) = (n(17), n(19));
        let (r5, r6) = (n(23), n(29));
        let p = exp(&g3, &r);
        let q = mul(&exp_g(&r), &exp(&g2, &x));

        let nonces = CoordinateNonces { r5: &r5, r6: &r6 };
        let (cp, d5, d6) = prove_coordinates(5, &g2, &g3, nonces, &r, &x);
        let proof = Coordinates {
            p: &p,
            q: &q,
            cp: &cp,
            d5: &d5,
            d6: &d6,
        };
        assert!(verify_coordinates(5, &g2, &g3, proof));

        let wrong_q = mul(&q, &exp_g(&n(1)));
        let forged = Coordinates {
            p: &p,
            q: &wrong_q,
            cp: &cp,
            d5: &d5,
            d6: &d6,
        };
        assert!(!verify_coordinates(5, &g2, &g3, forged));
    }

    #[test]
    fn test_equal_logs_proof() {
        let a3 = n(31);
        let g3 = exp_g(&a3);
        let qab = div(&exp_g(&n(37)), &exp_g(&n(41)));
        let r = exp(&qab, &a3);

        let (cr, d7) = prove_equal_logs(7, &qab, &n(43), &a3);
        assert!(verify_equal_logs(7, &g3, &qab, &r, &cr, &d7));
        assert!(!verify_equal_logs(8, &g3, &qab, &r, &cr, &d7));
        assert!(!verify_equal_logs(7, &exp_g(&n(2)), &qab, &r, &cr, &d7));
    }
}
