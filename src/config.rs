//! Configuration for the [Engine](crate::Engine).

use commonware_cryptography::{bls12381::primitives::group::Scalar, PublicKey};

/// Configuration for the [Engine](crate::Engine).
pub struct Config<P: PublicKey> {
    /// This server's network identity.
    pub public_key: P,

    /// This server's share of the cothority's ElGamal key. The collective
    /// public key is the sum of all members' public shares.
    pub share: Scalar,

    /// The maximum size of the mailbox backlog.
    pub mailbox_size: usize,

    /// Whether protocol messages are sent over the network as priority.
    pub priority: bool,
}
