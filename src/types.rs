//! Types used throughout the crate: identifiers, the application-facing
//! survey types, the wire messages exchanged between cothority members, and
//! the crate [Error].

use bytes::{Buf, BufMut};
use commonware_codec::{
    Encode, EncodeSize, Error as CodecError, FixedSize, Read, ReadExt, Write,
};
use commonware_cryptography::{bls12381::primitives::group::G1, PublicKey};
use commonware_utils::hex;
use futures::channel::oneshot;
use rand::Rng;
use std::collections::HashMap;
use std::fmt::Display;

use crate::cipher::{CipherVector, GroupingAttributes};
use crate::store::Phase;

/// Maximum number of rows carried by a single switching message.
pub const MAX_ROWS: usize = 65_536;

/// Maximum number of groups carried by a single aggregation message.
pub const MAX_GROUPS: usize = 65_536;

/// Error that may be encountered when interacting with the service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // Configuration errors
    /// A survey was created with an empty roster
    #[error("empty roster")]
    EmptyRoster,
    /// A survey roster contains the same member twice
    #[error("duplicate roster member")]
    DuplicateMember,
    /// This server is not part of the survey roster
    #[error("not a member of the survey roster")]
    NotInRoster,
    /// A survey with the same identifier already exists
    #[error("survey {0} already exists")]
    SurveyExists(SurveyId),
    /// The survey is not known to this server
    #[error("unknown survey {0}")]
    UnknownSurvey(SurveyId),
    /// Results were requested from a server that is not the survey coordinator
    #[error("not the survey coordinator")]
    NotCoordinator,
    /// A submitted row does not match the survey description
    #[error("expected {expected} attributes, got {actual}")]
    InvalidDimensions { expected: usize, actual: usize },

    // Network errors
    /// Unable to send a message over the network
    #[error("unable to send message")]
    UnableToSendMessage,

    // Protocol errors
    /// The survey already has a results query in flight
    #[error("survey {0} already has a query in progress")]
    QueryInProgress(SurveyId),
    /// A store operation was attempted in the wrong pipeline phase
    #[error("operation not valid in phase {0:?}")]
    WrongPhase(Phase),
    /// A switching protocol referenced a row this server does not hold
    #[error("unknown row {0}")]
    UnknownRow(RowId),
    /// The labels returned by a switching protocol do not match the pending rows
    #[error("row labels do not match pending rows")]
    RowMismatch,
    /// An aggregation contribution arrived from an unexpected peer
    #[error("unexpected aggregation contribution")]
    UnexpectedContribution,

    // Crypto errors
    /// A decrypted value exceeds the decryption table bound
    #[error("value outside the decryption table bound")]
    ValueOutOfRange,

    /// The request was canceled before it completed
    #[error("request canceled")]
    Canceled(oneshot::Canceled),
}

/// Identifies one survey across the cothority.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SurveyId(pub u128);

impl Display for SurveyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex(&self.0.to_be_bytes()))
    }
}

impl Write for SurveyId {
    fn write(&self, buf: &mut impl BufMut) {
        self.0.to_be_bytes().write(buf);
    }
}

impl Read for SurveyId {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        Ok(Self(u128::from_be_bytes(<[u8; 16]>::read(buf)?)))
    }
}

impl FixedSize for SurveyId {
    const SIZE: usize = 16;
}

/// Identifies one row within a survey, assigned by the server that first
/// introduces the row to a switching protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowId(pub u128);

impl RowId {
    /// Samples a fresh row identifier.
    pub fn random<R: Rng>(rng: &mut R) -> Self {
        Self(rng.gen())
    }
}

impl Display for RowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex(&self.0.to_be_bytes()))
    }
}

impl Write for RowId {
    fn write(&self, buf: &mut impl BufMut) {
        self.0.to_be_bytes().write(buf);
    }
}

impl Read for RowId {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        Ok(Self(u128::from_be_bytes(<[u8; 16]>::read(buf)?)))
    }
}

impl FixedSize for RowId {
    const SIZE: usize = 16;
}

/// The shape of a survey: how many grouping attributes and how many numeric
/// aggregate attributes each row carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SurveyDescription {
    pub grouping_attributes: u32,
    pub aggregate_attributes: u32,
}

/// One encrypted row as submitted by a client: the grouping attributes and
/// the numeric aggregates, both encrypted under the collective key.
#[derive(Clone, Debug)]
pub struct ClientResponse {
    pub grouping: CipherVector,
    pub aggregates: CipherVector,
}

/// One deliverable result: a group label and the per-group sums, both
/// encrypted under the querier key.
#[derive(Clone, Debug)]
pub struct SurveyResult {
    pub grouping: CipherVector,
    pub aggregates: CipherVector,
}

// ---------- Control channel ----------

/// Coordination messages between the survey coordinator and the other
/// members of the roster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Control {
    /// Instructs a member to run the grouping phase over its collected rows.
    Flush { survey: SurveyId },
    /// Acknowledges that a member's collected rows carry deterministic labels.
    FlushAck { survey: SurveyId },
}

impl Write for Control {
    fn write(&self, buf: &mut impl BufMut) {
        match self {
            Control::Flush { survey } => {
                buf.put_u8(0);
                survey.write(buf);
            }
            Control::FlushAck { survey } => {
                buf.put_u8(1);
                survey.write(buf);
            }
        }
    }
}

impl Read for Control {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        match u8::read(buf)? {
            0 => Ok(Control::Flush {
                survey: SurveyId::read(buf)?,
            }),
            1 => Ok(Control::FlushAck {
                survey: SurveyId::read(buf)?,
            }),
            _ => Err(CodecError::Invalid("Control", "invalid type")),
        }
    }
}

impl EncodeSize for Control {
    fn encode_size(&self) -> usize {
        1 + SurveyId::SIZE
    }
}

// ---------- Switching channel ----------

/// A deterministic switching message traveling the ring. Every member applies
/// its partial transformation and forwards to its successor; the initiator
/// extracts the deterministic labels when the message returns.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeterministicSwitched<P: PublicKey> {
    pub survey: SurveyId,
    pub initiator: P,
    pub data: HashMap<RowId, CipherVector>,
}

impl<P: PublicKey> Write for DeterministicSwitched<P> {
    fn write(&self, buf: &mut impl BufMut) {
        self.survey.write(buf);
        self.initiator.write(buf);
        self.data.write(buf);
    }
}

impl<P: PublicKey> Read for DeterministicSwitched<P> {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let survey = SurveyId::read(buf)?;
        let initiator = P::read(buf)?;
        let data = HashMap::read_cfg(buf, &((..=MAX_ROWS).into(), ((), ())))?;
        Ok(Self {
            survey,
            initiator,
            data,
        })
    }
}

impl<P: PublicKey> EncodeSize for DeterministicSwitched<P> {
    fn encode_size(&self) -> usize {
        self.survey.encode_size() + self.initiator.encode_size() + self.data.encode_size()
    }
}

/// A probabilistic switching message traveling the ring. The initiator seeds
/// each deterministic label as the trivial encryption `(0, D)`; the returned
/// vectors are fresh encryptions under `target_key`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbabilisticSwitched<P: PublicKey> {
    pub survey: SurveyId,
    pub initiator: P,
    pub target_key: G1,
    pub data: HashMap<RowId, CipherVector>,
}

impl<P: PublicKey> Write for ProbabilisticSwitched<P> {
    fn write(&self, buf: &mut impl BufMut) {
        self.survey.write(buf);
        self.initiator.write(buf);
        self.target_key.write(buf);
        self.data.write(buf);
    }
}

impl<P: PublicKey> Read for ProbabilisticSwitched<P> {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let survey = SurveyId::read(buf)?;
        let initiator = P::read(buf)?;
        let target_key = G1::read(buf)?;
        let data = HashMap::read_cfg(buf, &((..=MAX_ROWS).into(), ((), ())))?;
        Ok(Self {
            survey,
            initiator,
            target_key,
            data,
        })
    }
}

impl<P: PublicKey> EncodeSize for ProbabilisticSwitched<P> {
    fn encode_size(&self) -> usize {
        self.survey.encode_size()
            + self.initiator.encode_size()
            + self.target_key.encode_size()
            + self.data.encode_size()
    }
}

/// A key switching message traveling the ring. The original ephemeral keys of
/// every component are captured at the initiator and carried alongside the
/// data; each member subtracts its key share against them rather than the
/// evolving ephemeral keys.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeySwitchedCipher<P: PublicKey> {
    pub survey: SurveyId,
    pub initiator: P,
    pub data: HashMap<RowId, CipherVector>,
    pub new_key: G1,
    pub original_ephemeral_keys: HashMap<RowId, Vec<G1>>,
}

impl<P: PublicKey> Write for KeySwitchedCipher<P> {
    fn write(&self, buf: &mut impl BufMut) {
        self.survey.write(buf);
        self.initiator.write(buf);
        self.data.write(buf);
        self.new_key.write(buf);
        self.original_ephemeral_keys.write(buf);
    }
}

impl<P: PublicKey> Read for KeySwitchedCipher<P> {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let survey = SurveyId::read(buf)?;
        let initiator = P::read(buf)?;
        let data = HashMap::read_cfg(buf, &((..=MAX_ROWS).into(), ((), ())))?;
        let new_key = G1::read(buf)?;
        let original_ephemeral_keys = HashMap::read_cfg(
            buf,
            &(
                (..=MAX_ROWS).into(),
                ((), ((..=crate::cipher::MAX_ATTRIBUTES).into(), ())),
            ),
        )?;
        Ok(Self {
            survey,
            initiator,
            data,
            new_key,
            original_ephemeral_keys,
        })
    }
}

impl<P: PublicKey> EncodeSize for KeySwitchedCipher<P> {
    fn encode_size(&self) -> usize {
        self.survey.encode_size()
            + self.initiator.encode_size()
            + self.data.encode_size()
            + self.new_key.encode_size()
            + self.original_ephemeral_keys.encode_size()
    }
}

/// The messages carried by the switching channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Switching<P: PublicKey> {
    Deterministic(DeterministicSwitched<P>),
    Probabilistic(ProbabilisticSwitched<P>),
    KeySwitched(KeySwitchedCipher<P>),
}

impl<P: PublicKey> Write for Switching<P> {
    fn write(&self, buf: &mut impl BufMut) {
        match self {
            Switching::Deterministic(message) => {
                buf.put_u8(0);
                message.write(buf);
            }
            Switching::Probabilistic(message) => {
                buf.put_u8(1);
                message.write(buf);
            }
            Switching::KeySwitched(message) => {
                buf.put_u8(2);
                message.write(buf);
            }
        }
    }
}

impl<P: PublicKey> Read for Switching<P> {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        match u8::read(buf)? {
            0 => Ok(Switching::Deterministic(DeterministicSwitched::read(buf)?)),
            1 => Ok(Switching::Probabilistic(ProbabilisticSwitched::read(buf)?)),
            2 => Ok(Switching::KeySwitched(KeySwitchedCipher::read(buf)?)),
            _ => Err(CodecError::Invalid("Switching", "invalid type")),
        }
    }
}

impl<P: PublicKey> EncodeSize for Switching<P> {
    fn encode_size(&self) -> usize {
        1 + match self {
            Switching::Deterministic(message) => message.encode_size(),
            Switching::Probabilistic(message) => message.encode_size(),
            Switching::KeySwitched(message) => message.encode_size(),
        }
    }
}

// ---------- Aggregation channel ----------

/// The one-shot announcement broadcast down the tree: every member should
/// contribute its locally aggregated groups.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataReference {
    pub survey: SurveyId,
}

impl Write for DataReference {
    fn write(&self, buf: &mut impl BufMut) {
        self.survey.write(buf);
    }
}

impl Read for DataReference {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        Ok(Self {
            survey: SurveyId::read(buf)?,
        })
    }
}

impl FixedSize for DataReference {
    const SIZE: usize = SurveyId::SIZE;
}

/// A child's aggregated contribution, sent up the tree once the child has
/// folded in all of its own children.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChildAggregatedData {
    pub survey: SurveyId,
    pub child_data: HashMap<GroupingAttributes, CipherVector>,
}

impl Write for ChildAggregatedData {
    fn write(&self, buf: &mut impl BufMut) {
        self.survey.write(buf);
        self.child_data.len().write(buf);

        // Group keys have no natural order, so sort by encoding to keep the
        // wire format deterministic.
        let mut entries: Vec<_> = self
            .child_data
            .iter()
            .map(|(attributes, vector)| (attributes.encode(), attributes, vector))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        for (_, attributes, vector) in entries {
            attributes.write(buf);
            vector.write(buf);
        }
    }
}

impl Read for ChildAggregatedData {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let survey = SurveyId::read(buf)?;
        let len = usize::read_cfg(buf, &(..=MAX_GROUPS).into())?;
        let mut child_data = HashMap::with_capacity(len);
        for _ in 0..len {
            let attributes = GroupingAttributes::read(buf)?;
            let vector = CipherVector::read(buf)?;
            if child_data.insert(attributes, vector).is_some() {
                return Err(CodecError::Invalid("ChildAggregatedData", "duplicate group"));
            }
        }
        Ok(Self { survey, child_data })
    }
}

impl EncodeSize for ChildAggregatedData {
    fn encode_size(&self) -> usize {
        let mut size = self.survey.encode_size() + self.child_data.len().encode_size();
        for (attributes, vector) in &self.child_data {
            size += attributes.encode_size() + vector.encode_size();
        }
        size
    }
}

/// The messages carried by the aggregation channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Aggregation {
    Reference(DataReference),
    Child(ChildAggregatedData),
}

impl Write for Aggregation {
    fn write(&self, buf: &mut impl BufMut) {
        match self {
            Aggregation::Reference(message) => {
                buf.put_u8(0);
                message.write(buf);
            }
            Aggregation::Child(message) => {
                buf.put_u8(1);
                message.write(buf);
            }
        }
    }
}

impl Read for Aggregation {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        match u8::read(buf)? {
            0 => Ok(Aggregation::Reference(DataReference::read(buf)?)),
            1 => Ok(Aggregation::Child(ChildAggregatedData::read(buf)?)),
            _ => Err(CodecError::Invalid("Aggregation", "invalid type")),
        }
    }
}

impl EncodeSize for Aggregation {
    fn encode_size(&self) -> usize {
        1 + match self {
            Aggregation::Reference(message) => message.encode_size(),
            Aggregation::Child(message) => message.encode_size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher;
    use commonware_codec::DecodeExt;
    use commonware_cryptography::{ed25519::PrivateKey, PrivateKeyExt, Signer};
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_switching_codec() {
        let mut rng = StdRng::seed_from_u64(0);
        let (_, public) = cipher::keygen(&mut rng);
        let initiator = PrivateKey::from_seed(0).public_key();

        let mut data = HashMap::new();
        data.insert(
            RowId::random(&mut rng),
            CipherVector::encrypt(&public, &[1, 2], &mut rng),
        );
        data.insert(
            RowId::random(&mut rng),
            CipherVector::encrypt(&public, &[3, 4], &mut rng),
        );

        let message = Switching::Deterministic(DeterministicSwitched {
            survey: SurveyId(7),
            initiator,
            data,
        });
        let decoded = Switching::decode(message.encode()).unwrap();
        assert_eq!(message, decoded);
    }

    #[test]
    fn test_key_switched_codec() {
        let mut rng = StdRng::seed_from_u64(1);
        let (_, public) = cipher::keygen(&mut rng);
        let initiator = PrivateKey::from_seed(1).public_key();

        let row = RowId::random(&mut rng);
        let vector = CipherVector::encrypt(&public, &[5], &mut rng);
        let originals = vector.ephemeral_keys();

        let message = Switching::KeySwitched(KeySwitchedCipher {
            survey: SurveyId(1),
            initiator,
            data: HashMap::from([(row, vector)]),
            new_key: public,
            original_ephemeral_keys: HashMap::from([(row, originals)]),
        });
        let decoded = Switching::<_>::decode(message.encode()).unwrap();
        assert_eq!(message, decoded);
    }

    #[test]
    fn test_aggregation_codec() {
        let mut rng = StdRng::seed_from_u64(2);
        let (shares, collective) = {
            let (secret, public) = cipher::keygen(&mut rng);
            (vec![secret], public)
        };
        let survey_secret =
            commonware_cryptography::bls12381::primitives::group::Scalar::from_rand(&mut rng);

        let mut grouping = CipherVector::encrypt(&collective, &[1], &mut rng);
        grouping.switch_to_deterministic(&shares[0], &survey_secret);
        let attributes: GroupingAttributes = grouping.finalize_deterministic().into();

        let message = Aggregation::Child(ChildAggregatedData {
            survey: SurveyId(3),
            child_data: HashMap::from([(
                attributes,
                CipherVector::encrypt(&collective, &[2, 2], &mut rng),
            )]),
        });
        let decoded = Aggregation::decode(message.encode()).unwrap();
        assert_eq!(message, decoded);
    }

    #[test]
    fn test_control_codec() {
        for message in [
            Control::Flush { survey: SurveyId(9) },
            Control::FlushAck { survey: SurveyId(9) },
        ] {
            let decoded = Control::decode(message.encode()).unwrap();
            assert_eq!(message, decoded);
        }
    }
}
