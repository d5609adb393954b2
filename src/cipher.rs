//! ElGamal cipher vectors over BLS12-381 G1 and the partial transformations
//! each cothority member applies during the switching protocols.
//!
//! A [CipherText] is a pair `(K, C)` with `K = r·B` and `C = m·B + r·Y`,
//! where `B` is the group generator, `Y` the receiver public key, and `m` a
//! small-integer plaintext encoded as a scalar multiple of the generator.
//! Vectors of ciphertexts are additively homomorphic component-wise, which is
//! what makes grouped aggregation possible without decryption.
//!
//! The switching protocols never decrypt. Each cothority member holds a key
//! share `s_i` (the collective key is `Y = Σs_i·B`) and, per survey, a secret
//! scalar `π_i`. A member's partial transformation only ever uses its own
//! secrets; the composite over all members realizes the intended total:
//!
//! - deterministic switch: `C ← C − s_i·K + π_i·B` (K untouched), totaling
//!   `D = m·B + (Σπ_i)·B`. The total depends only on the plaintext and the
//!   survey-wide secret, so equal plaintexts yield equal points.
//! - key switch: `C ← C − s_i·K₀ + r_i·Y'`, `K ← K + r_i·B`, with `K₀` the
//!   ephemeral key captured before the first hop, totaling a fresh encryption
//!   of `m` under `Y'`.
//! - probabilistic switch: `C ← C − π_i·B + r_i·Y'`, `K ← K + r_i·B`, seeded
//!   from the trivial encryption `(0, D)`, totaling a fresh encryption of `m`
//!   under `Y'` with the survey secret summed back out.

use bytes::{Buf, BufMut};
use commonware_codec::{EncodeSize, Error as CodecError, FixedSize, Read, ReadExt, Write};
use commonware_cryptography::bls12381::primitives::group::{Element, Scalar, G1};
use rand::{CryptoRng, RngCore};
use std::collections::HashMap;

use crate::Error;

/// Maximum number of attributes in a single cipher vector accepted off the wire.
pub const MAX_ATTRIBUTES: usize = 1_024;

/// Returns `point * scalar` without mutating the operands.
fn mul(point: &G1, scalar: &Scalar) -> G1 {
    let mut out = *point;
    out.mul(scalar);
    out
}

/// Returns the additive inverse of a point.
fn neg(point: &G1) -> G1 {
    let mut minus_one = Scalar::zero();
    minus_one.sub(&Scalar::one());
    mul(point, &minus_one)
}

/// Generates a fresh ElGamal key share, returning `(s_i, s_i·B)`.
pub fn keygen<R: RngCore + CryptoRng>(rng: &mut R) -> (Scalar, G1) {
    let secret = Scalar::from_rand(rng);
    let public = public_key(&secret);
    (secret, public)
}

/// Returns the public key corresponding to a secret scalar.
pub fn public_key(secret: &Scalar) -> G1 {
    mul(&G1::one(), secret)
}

/// Sums the members' public key shares into the collective public key.
pub fn combine(shares: &[G1]) -> G1 {
    let mut collective = G1::zero();
    for share in shares {
        collective.add(share);
    }
    collective
}

/// A single ElGamal ciphertext.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CipherText {
    /// The ephemeral key `r·B`.
    pub k: G1,
    /// The blinded message `m·B + r·Y`.
    pub c: G1,
}

impl CipherText {
    /// Encrypts a small integer under the provided public key.
    pub fn encrypt<R: RngCore + CryptoRng>(public: &G1, message: u32, rng: &mut R) -> Self {
        let encoded = Scalar::from(message);
        let ephemeral = Scalar::from_rand(rng);
        let mut c = mul(&G1::one(), &encoded);
        c.add(&mul(public, &ephemeral));
        Self {
            k: mul(&G1::one(), &ephemeral),
            c,
        }
    }

    /// Recovers the message point `m·B` using the receiver secret.
    pub fn decrypt(&self, secret: &Scalar) -> G1 {
        let mut message = self.c;
        message.add(&neg(&mul(&self.k, secret)));
        message
    }

    /// Adds another ciphertext component-wise (homomorphic addition).
    pub fn add(&mut self, other: &Self) {
        self.k.add(&other.k);
        self.c.add(&other.c);
    }

    /// Re-randomizes the ciphertext in place, preserving the plaintext.
    pub fn rerandomize<R: RngCore + CryptoRng>(&mut self, public: &G1, rng: &mut R) {
        let fresh = Scalar::from_rand(rng);
        self.k.add(&mul(&G1::one(), &fresh));
        self.c.add(&mul(public, &fresh));
    }
}

impl Write for CipherText {
    fn write(&self, buf: &mut impl BufMut) {
        self.k.write(buf);
        self.c.write(buf);
    }
}

impl Read for CipherText {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let k = G1::read(buf)?;
        let c = G1::read(buf)?;
        Ok(Self { k, c })
    }
}

impl FixedSize for CipherText {
    const SIZE: usize = G1::SIZE * 2;
}

/// An ordered sequence of ciphertexts: one survey row of numeric attributes,
/// or a tuple of grouping attributes.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct CipherVector(Vec<CipherText>);

impl CipherVector {
    /// Encrypts a vector of small integers under the provided public key.
    pub fn encrypt<R: RngCore + CryptoRng>(public: &G1, values: &[u32], rng: &mut R) -> Self {
        Self(
            values
                .iter()
                .map(|value| CipherText::encrypt(public, *value, rng))
                .collect(),
        )
    }

    /// Decrypts every component and resolves the message points through the
    /// provided table. Fails if any component exceeds the table bound.
    pub fn decrypt(&self, secret: &Scalar, table: &DecryptionTable) -> Result<Vec<u32>, Error> {
        self.0
            .iter()
            .map(|component| {
                table
                    .lookup(&component.decrypt(secret))
                    .ok_or(Error::ValueOutOfRange)
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Component-wise homomorphic addition.
    pub fn add(&mut self, other: &Self) -> Result<(), Error> {
        if self.0.len() != other.0.len() {
            return Err(Error::InvalidDimensions {
                expected: self.0.len(),
                actual: other.0.len(),
            });
        }
        for (component, addend) in self.0.iter_mut().zip(other.0.iter()) {
            component.add(addend);
        }
        Ok(())
    }

    /// Re-randomizes every component in place, preserving plaintexts.
    pub fn rerandomize<R: RngCore + CryptoRng>(&mut self, public: &G1, rng: &mut R) {
        for component in &mut self.0 {
            component.rerandomize(public, rng);
        }
    }

    /// Applies this member's deterministic-switch partial: for each component,
    /// `C ← C − s_i·K + π_i·B`. The ephemeral keys are left untouched so that
    /// every member subtracts its key share against the same `K`.
    pub fn switch_to_deterministic(&mut self, share: &Scalar, survey_secret: &Scalar) {
        let blinding = mul(&G1::one(), survey_secret);
        for component in &mut self.0 {
            component.c.add(&neg(&mul(&component.k, share)));
            component.c.add(&blinding);
        }
    }

    /// Applies this member's key-switch partial. `originals` are the ephemeral
    /// keys as captured at the initiator before the first hop; subtracting the
    /// key share against them (rather than the evolving `K`) is what makes the
    /// telescoping sum collapse to a valid encryption under `new_key`.
    pub fn switch_for_key<R: RngCore + CryptoRng>(
        &mut self,
        share: &Scalar,
        originals: &[G1],
        new_key: &G1,
        rng: &mut R,
    ) -> Result<(), Error> {
        if originals.len() != self.0.len() {
            return Err(Error::InvalidDimensions {
                expected: self.0.len(),
                actual: originals.len(),
            });
        }
        for (component, original) in self.0.iter_mut().zip(originals.iter()) {
            let fresh = Scalar::from_rand(rng);
            component.c.add(&neg(&mul(original, share)));
            component.c.add(&mul(new_key, &fresh));
            component.k.add(&mul(&G1::one(), &fresh));
        }
        Ok(())
    }

    /// Applies this member's probabilistic-switch partial: for each component,
    /// `C ← C − π_i·B + r·Y_target` and `K ← K + r·B`.
    pub fn switch_to_probabilistic<R: RngCore + CryptoRng>(
        &mut self,
        survey_secret: &Scalar,
        target: &G1,
        rng: &mut R,
    ) {
        let unblinding = neg(&mul(&G1::one(), survey_secret));
        for component in &mut self.0 {
            let fresh = Scalar::from_rand(rng);
            component.c.add(&unblinding);
            component.c.add(&mul(target, &fresh));
            component.k.add(&mul(&G1::one(), &fresh));
        }
    }

    /// Projects the ephemeral keys of every component, in order.
    pub fn ephemeral_keys(&self) -> Vec<G1> {
        self.0.iter().map(|component| component.k).collect()
    }

    /// Clears every ephemeral key to the group identity. Used by the key
    /// switching initiator to build the working copy after capturing the
    /// original keys.
    pub fn clear_ephemeral_keys(&mut self) {
        for component in &mut self.0 {
            component.k = G1::zero();
        }
    }

    /// Reduces the vector to its deterministic form by discarding the
    /// ephemeral keys. Only meaningful once every member has applied its
    /// deterministic-switch partial.
    pub fn finalize_deterministic(&self) -> DeterministicCipherVector {
        DeterministicCipherVector(
            self.0
                .iter()
                .map(|component| DeterministicCipherText(component.c))
                .collect(),
        )
    }
}

impl Write for CipherVector {
    fn write(&self, buf: &mut impl BufMut) {
        self.0.len().write(buf);
        for component in &self.0 {
            component.write(buf);
        }
    }
}

impl Read for CipherVector {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let len = usize::read_cfg(buf, &(..=MAX_ATTRIBUTES).into())?;
        let mut components = Vec::with_capacity(len);
        for _ in 0..len {
            components.push(CipherText::read(buf)?);
        }
        Ok(Self(components))
    }
}

impl EncodeSize for CipherVector {
    fn encode_size(&self) -> usize {
        self.0.len().encode_size() + self.0.len() * CipherText::SIZE
    }
}

/// A ciphertext reduced to a single point: equal plaintexts within one survey
/// map to equal points, enabling grouping without decryption.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeterministicCipherText(pub G1);

impl Write for DeterministicCipherText {
    fn write(&self, buf: &mut impl BufMut) {
        self.0.write(buf);
    }
}

impl Read for DeterministicCipherText {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        Ok(Self(G1::read(buf)?))
    }
}

impl FixedSize for DeterministicCipherText {
    const SIZE: usize = G1::SIZE;
}

/// An ordered sequence of deterministic ciphertexts.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct DeterministicCipherVector(Vec<DeterministicCipherText>);

impl DeterministicCipherVector {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Seeds a probabilistic switch: every deterministic value becomes the
    /// trivial encryption `(0, D)`.
    pub fn seed_probabilistic(&self) -> CipherVector {
        CipherVector(
            self.0
                .iter()
                .map(|deterministic| CipherText {
                    k: G1::zero(),
                    c: deterministic.0,
                })
                .collect(),
        )
    }
}

impl Write for DeterministicCipherVector {
    fn write(&self, buf: &mut impl BufMut) {
        self.0.len().write(buf);
        for component in &self.0 {
            component.write(buf);
        }
    }
}

impl Read for DeterministicCipherVector {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let len = usize::read_cfg(buf, &(..=MAX_ATTRIBUTES).into())?;
        let mut components = Vec::with_capacity(len);
        for _ in 0..len {
            components.push(DeterministicCipherText::read(buf)?);
        }
        Ok(Self(components))
    }
}

impl EncodeSize for DeterministicCipherVector {
    fn encode_size(&self) -> usize {
        self.0.len().encode_size() + self.0.len() * DeterministicCipherText::SIZE
    }
}

/// A deterministic cipher vector in its role as a grouping key: rows whose
/// grouping attributes reduce to the same point sequence belong to the same
/// group.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct GroupingAttributes(DeterministicCipherVector);

impl GroupingAttributes {
    pub fn vector(&self) -> &DeterministicCipherVector {
        &self.0
    }
}

impl From<DeterministicCipherVector> for GroupingAttributes {
    fn from(vector: DeterministicCipherVector) -> Self {
        Self(vector)
    }
}

impl From<GroupingAttributes> for DeterministicCipherVector {
    fn from(attributes: GroupingAttributes) -> Self {
        attributes.0
    }
}

impl Write for GroupingAttributes {
    fn write(&self, buf: &mut impl BufMut) {
        self.0.write(buf);
    }
}

impl Read for GroupingAttributes {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, cfg: &()) -> Result<Self, CodecError> {
        Ok(Self(DeterministicCipherVector::read_cfg(buf, cfg)?))
    }
}

impl EncodeSize for GroupingAttributes {
    fn encode_size(&self) -> usize {
        self.0.encode_size()
    }
}

/// A bounded discrete-log table resolving message points `m·B` back to `m`.
///
/// Survey aggregates are small integers, so the table walks the generator's
/// multiples once up to a caller-chosen bound.
pub struct DecryptionTable {
    points: HashMap<G1, u32>,
}

impl DecryptionTable {
    /// Builds a table covering plaintexts in `0..=max`.
    pub fn new(max: u32) -> Self {
        let mut points = HashMap::with_capacity(max as usize + 1);
        let mut accumulator = G1::zero();
        for value in 0..=max {
            points.insert(accumulator, value);
            accumulator.add(&G1::one());
        }
        Self { points }
    }

    /// Resolves a message point, if it falls within the table bound.
    pub fn lookup(&self, point: &G1) -> Option<u32> {
        self.points.get(point).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_codec::{DecodeExt, Encode};
    use rand::{rngs::StdRng, SeedableRng};

    /// Generates `n` key shares and the collective public key.
    fn cothority(n: usize, rng: &mut StdRng) -> (Vec<Scalar>, G1) {
        let (secrets, publics): (Vec<_>, Vec<_>) = (0..n).map(|_| keygen(rng)).unzip();
        let collective = combine(&publics);
        (secrets, collective)
    }

    fn collective_secret(shares: &[Scalar]) -> Scalar {
        let mut sum = Scalar::zero();
        for share in shares {
            sum.add(share);
        }
        sum
    }

    #[test]
    fn test_encrypt_decrypt() {
        let mut rng = StdRng::seed_from_u64(0);
        let (secret, public) = keygen(&mut rng);
        let table = DecryptionTable::new(64);

        let values = [0u32, 1, 2, 3, 42];
        let vector = CipherVector::encrypt(&public, &values, &mut rng);
        assert_eq!(vector.decrypt(&secret, &table).unwrap(), values.to_vec());
    }

    #[test]
    fn test_decryption_table_bound() {
        let mut rng = StdRng::seed_from_u64(1);
        let (secret, public) = keygen(&mut rng);
        let table = DecryptionTable::new(8);

        let vector = CipherVector::encrypt(&public, &[9], &mut rng);
        assert!(matches!(
            vector.decrypt(&secret, &table),
            Err(Error::ValueOutOfRange)
        ));
    }

    #[test]
    fn test_homomorphic_addition() {
        let mut rng = StdRng::seed_from_u64(2);
        let (secret, public) = keygen(&mut rng);
        let table = DecryptionTable::new(16);

        let mut sum = CipherVector::encrypt(&public, &[1, 0, 5], &mut rng);
        let other = CipherVector::encrypt(&public, &[0, 1, 5], &mut rng);
        sum.add(&other).unwrap();
        assert_eq!(sum.decrypt(&secret, &table).unwrap(), vec![1, 1, 10]);
    }

    #[test]
    fn test_addition_dimension_mismatch() {
        let mut rng = StdRng::seed_from_u64(3);
        let (_, public) = keygen(&mut rng);

        let mut vector = CipherVector::encrypt(&public, &[1, 2], &mut rng);
        let other = CipherVector::encrypt(&public, &[1], &mut rng);
        assert!(vector.add(&other).is_err());
    }

    #[test]
    fn test_rerandomize_preserves_plaintext() {
        let mut rng = StdRng::seed_from_u64(4);
        let (secret, public) = keygen(&mut rng);
        let table = DecryptionTable::new(16);

        let mut vector = CipherVector::encrypt(&public, &[7, 0], &mut rng);
        for _ in 0..5 {
            vector.rerandomize(&public, &mut rng);
        }
        assert_eq!(vector.decrypt(&secret, &table).unwrap(), vec![7, 0]);
    }

    #[test]
    fn test_deterministic_switch_groups_equal_plaintexts() {
        let mut rng = StdRng::seed_from_u64(5);
        let (shares, collective) = cothority(3, &mut rng);
        let survey_secrets: Vec<Scalar> = (0..3).map(|_| Scalar::from_rand(&mut rng)).collect();

        // Two independent encryptions of the same plaintext, one of another.
        let mut first = CipherVector::encrypt(&collective, &[1, 2], &mut rng);
        let mut second = CipherVector::encrypt(&collective, &[1, 2], &mut rng);
        let mut third = CipherVector::encrypt(&collective, &[1, 3], &mut rng);
        for (share, survey_secret) in shares.iter().zip(survey_secrets.iter()) {
            first.switch_to_deterministic(share, survey_secret);
            second.switch_to_deterministic(share, survey_secret);
            third.switch_to_deterministic(share, survey_secret);
        }

        let first = first.finalize_deterministic();
        let second = second.finalize_deterministic();
        let third = third.finalize_deterministic();
        assert_eq!(first, second);
        assert_ne!(first, third);
        assert_eq!(first.encode(), second.encode());
    }

    #[test]
    fn test_deterministic_switch_repeatable() {
        let mut rng = StdRng::seed_from_u64(6);
        let (shares, collective) = cothority(5, &mut rng);
        let survey_secrets: Vec<Scalar> = (0..5).map(|_| Scalar::from_rand(&mut rng)).collect();

        let vector = CipherVector::encrypt(&collective, &[9], &mut rng);
        let mut runs = Vec::new();
        for _ in 0..2 {
            let mut copy = vector.clone();
            for (share, survey_secret) in shares.iter().zip(survey_secrets.iter()) {
                copy.switch_to_deterministic(share, survey_secret);
            }
            runs.push(copy.finalize_deterministic().encode());
        }
        assert_eq!(runs[0], runs[1]);
    }

    #[test]
    fn test_deterministic_switch_unlinkable_across_surveys() {
        let mut rng = StdRng::seed_from_u64(7);
        let (shares, collective) = cothority(3, &mut rng);
        let survey_a: Vec<Scalar> = (0..3).map(|_| Scalar::from_rand(&mut rng)).collect();
        let survey_b: Vec<Scalar> = (0..3).map(|_| Scalar::from_rand(&mut rng)).collect();

        let vector = CipherVector::encrypt(&collective, &[1], &mut rng);
        let mut in_a = vector.clone();
        let mut in_b = vector;
        for ((share, secret_a), secret_b) in
            shares.iter().zip(survey_a.iter()).zip(survey_b.iter())
        {
            in_a.switch_to_deterministic(share, secret_a);
            in_b.switch_to_deterministic(share, secret_b);
        }
        assert_ne!(
            in_a.finalize_deterministic(),
            in_b.finalize_deterministic()
        );
    }

    #[test]
    fn test_key_switch_preserves_plaintext() {
        let mut rng = StdRng::seed_from_u64(8);
        let (shares, collective) = cothority(4, &mut rng);
        let (querier_secret, querier_public) = keygen(&mut rng);
        let table = DecryptionTable::new(16);

        let vector = CipherVector::encrypt(&collective, &[3, 0, 11], &mut rng);
        let originals = vector.ephemeral_keys();
        let mut switched = vector;
        switched.clear_ephemeral_keys();
        for share in &shares {
            switched
                .switch_for_key(share, &originals, &querier_public, &mut rng)
                .unwrap();
        }
        assert_eq!(
            switched.decrypt(&querier_secret, &table).unwrap(),
            vec![3, 0, 11]
        );
    }

    #[test]
    fn test_key_switch_round_trip() {
        let mut rng = StdRng::seed_from_u64(9);
        let (shares, collective) = cothority(3, &mut rng);
        let (querier_secret, querier_public) = keygen(&mut rng);
        let table = DecryptionTable::new(16);

        // Cothority to querier.
        let vector = CipherVector::encrypt(&collective, &[5], &mut rng);
        let originals = vector.ephemeral_keys();
        let mut under_querier = vector;
        under_querier.clear_ephemeral_keys();
        for share in &shares {
            under_querier
                .switch_for_key(share, &originals, &querier_public, &mut rng)
                .unwrap();
        }

        // Querier back to the cothority, roles reversed.
        let originals = under_querier.ephemeral_keys();
        let mut returned = under_querier;
        returned.clear_ephemeral_keys();
        returned
            .switch_for_key(&querier_secret, &originals, &collective, &mut rng)
            .unwrap();

        let secret = collective_secret(&shares);
        assert_eq!(returned.decrypt(&secret, &table).unwrap(), vec![5]);
    }

    #[test]
    fn test_probabilistic_switch_reencrypts_deterministic() {
        let mut rng = StdRng::seed_from_u64(10);
        let (shares, collective) = cothority(3, &mut rng);
        let survey_secrets: Vec<Scalar> = (0..3).map(|_| Scalar::from_rand(&mut rng)).collect();
        let (querier_secret, querier_public) = keygen(&mut rng);
        let table = DecryptionTable::new(16);

        // Tag the plaintext, then convert the tag back to a fresh encryption
        // under the querier key.
        let mut tagged = CipherVector::encrypt(&collective, &[2, 6], &mut rng);
        for (share, survey_secret) in shares.iter().zip(survey_secrets.iter()) {
            tagged.switch_to_deterministic(share, survey_secret);
        }
        let mut switched = tagged.finalize_deterministic().seed_probabilistic();
        for survey_secret in &survey_secrets {
            switched.switch_to_probabilistic(survey_secret, &querier_public, &mut rng);
        }
        assert_eq!(
            switched.decrypt(&querier_secret, &table).unwrap(),
            vec![2, 6]
        );
    }

    #[test]
    fn test_cipher_vector_codec() {
        let mut rng = StdRng::seed_from_u64(11);
        let (_, public) = keygen(&mut rng);

        let vector = CipherVector::encrypt(&public, &[1, 2, 3], &mut rng);
        let decoded = CipherVector::decode(vector.encode()).unwrap();
        assert_eq!(vector, decoded);
    }
}
