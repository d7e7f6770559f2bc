//! Collection of mocks used to test `hotstuff`.

use commonware_cryptography::{ed25519, PrivateKeyExt as _, Signer as _};

pub mod block;
pub mod chain;
pub mod network;

/// Deterministic signers, sorted by public key (committee order).
pub fn signers(n: u64) -> Vec<ed25519::PrivateKey> {
    let mut signers: Vec<_> = (0..n).map(ed25519::PrivateKey::from_seed).collect();
    signers.sort_by_key(|signer| signer.public_key());
    signers
}
