//! Types used in [`crate::engine`].
//!
//! Every type that arrives from the network is decoded with an explicit bound on the number of
//! signatures it may carry (the size of the validator set) and on the length of opaque payloads.

use crate::{Block, Error, Validators};
use bytes::{Buf, BufMut, Bytes};
use commonware_codec::{EncodeSize, Error as CodecError, FixedSize, Read, ReadExt, Write};
use commonware_cryptography::{ed25519, sha256, Signer as _, Verifier as _};
use std::{collections::HashSet, fmt};

/// Identity of a validator.
pub type Address = ed25519::PublicKey;

/// Signature over a namespaced message.
pub type Signature = ed25519::Signature;

/// Digest identifying a block.
pub type Digest = sha256::Digest;

/// View is the pair `(sequence, round)` identifying a decision attempt.
///
/// Views are ordered lexicographically: by sequence first, then by round.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct View {
    pub sequence: u64,
    pub round: u64,
}

impl View {
    pub fn new(sequence: u64, round: u64) -> Self {
        Self { sequence, round }
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.sequence, self.round)
    }
}

impl Write for View {
    fn write(&self, buf: &mut impl BufMut) {
        self.sequence.write(buf);
        self.round.write(buf);
    }
}

impl EncodeSize for View {
    fn encode_size(&self) -> usize {
        u64::SIZE * 2
    }
}

impl Read for View {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let sequence = u64::read(buf)?;
        let round = u64::read(buf)?;
        Ok(Self { sequence, round })
    }
}

/// Phase of a round, in protocol order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u64)]
pub enum Phase {
    NewView = 0,
    Prepare = 1,
    PrepareVote = 2,
    PreCommit = 3,
    PreCommitVote = 4,
    Commit = 5,
    CommitVote = 6,
    Decide = 7,
}

impl Phase {
    /// All phases, in protocol order.
    pub const ALL: [Phase; 8] = [
        Phase::NewView,
        Phase::Prepare,
        Phase::PrepareVote,
        Phase::PreCommit,
        Phase::PreCommitVote,
        Phase::Commit,
        Phase::CommitVote,
        Phase::Decide,
    ];

    /// Wire code of the phase.
    pub fn code(self) -> u64 {
        self as u64
    }

    /// Whether messages of this phase are votes sent to the proposer.
    pub fn is_vote(self) -> bool {
        matches!(
            self,
            Phase::PrepareVote | Phase::PreCommitVote | Phase::CommitVote
        )
    }

    /// Lowercase name used for logs and metric labels.
    pub fn name(self) -> &'static str {
        match self {
            Phase::NewView => "new_view",
            Phase::Prepare => "prepare",
            Phase::PrepareVote => "prepare_vote",
            Phase::PreCommit => "pre_commit",
            Phase::PreCommitVote => "pre_commit_vote",
            Phase::Commit => "commit",
            Phase::CommitVote => "commit_vote",
            Phase::Decide => "decide",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Signed envelope carried over the network.
///
/// `payload` is the encoding of the phase-specific body (see [`NewView`], [`Prepare`],
/// [`QuorumCertificate`], [`Decide`], or a [`Digest`] for votes). It is decoded with the
/// maximum payload length as configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub code: u64,
    pub view: View,
    pub address: Address,
    pub payload: Bytes,
    pub signature: Signature,
}

impl Message {
    /// Construct and sign a message.
    pub fn sign(
        signer: &ed25519::PrivateKey,
        namespace: &[u8],
        phase: Phase,
        view: View,
        payload: Bytes,
    ) -> Self {
        let address = signer.public_key();
        let signing = Self::signing_payload(phase.code(), view, &address, &payload);
        let signature = signer.sign(Some(namespace), &signing);
        Self {
            code: phase.code(),
            view,
            address,
            payload,
            signature,
        }
    }

    /// Bytes covered by the signature.
    pub fn signing_payload(code: u64, view: View, address: &Address, payload: &[u8]) -> Vec<u8> {
        let size = u64::SIZE + view.encode_size() + Address::SIZE + payload.len();
        let mut buf = Vec::with_capacity(size);
        code.write(&mut buf);
        view.write(&mut buf);
        address.write(&mut buf);
        buf.extend_from_slice(payload);
        buf
    }

    /// Check the signature against the embedded address.
    pub fn verify(&self, namespace: &[u8]) -> bool {
        let signing = Self::signing_payload(self.code, self.view, &self.address, &self.payload);
        self.address
            .verify(Some(namespace), &signing, &self.signature)
    }
}

impl Write for Message {
    fn write(&self, buf: &mut impl BufMut) {
        self.code.write(buf);
        self.view.write(buf);
        self.address.write(buf);
        self.payload.write(buf);
        self.signature.write(buf);
    }
}

impl EncodeSize for Message {
    fn encode_size(&self) -> usize {
        u64::SIZE
            + self.view.encode_size()
            + Address::SIZE
            + self.payload.encode_size()
            + Signature::SIZE
    }
}

impl Read for Message {
    /// Maximum payload length.
    type Cfg = usize;

    fn read_cfg(buf: &mut impl Buf, max_payload: &usize) -> Result<Self, CodecError> {
        let code = u64::read(buf)?;
        let view = View::read(buf)?;
        let address = Address::read(buf)?;
        let payload = Bytes::read_cfg(buf, &(..=*max_payload).into())?;
        let signature = Signature::read(buf)?;
        Ok(Self {
            code,
            view,
            address,
            payload,
            signature,
        })
    }
}

/// Proof that a quorum of validators voted for `digest` in `phase` at `view`.
///
/// Each entry is the signature of a vote [`Message`] with code `phase`, the certificate's
/// `view`, the voter's address, and the encoded `digest` as payload.
///
/// Decoded with the maximum number of signatures (the size of the validator set) as
/// configuration, so a peer cannot make a replica reserve more entries than can ever be valid.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QuorumCertificate {
    pub phase: Phase,
    pub view: View,
    pub digest: Digest,
    pub signatures: Vec<(Address, Signature)>,
}

impl QuorumCertificate {
    /// Verify that the certificate holds a quorum of distinct, valid votes.
    pub fn verify<V: Validators>(&self, namespace: &[u8], validators: &V) -> bool {
        if !self.phase.is_vote() {
            return false;
        }
        if self.signatures.len() < validators.quorum() as usize {
            return false;
        }
        let payload = self.digest.as_ref();
        let mut seen = HashSet::with_capacity(self.signatures.len());
        for (address, signature) in &self.signatures {
            if validators.get_by_address(address).is_none() {
                return false;
            }
            if !seen.insert(address) {
                return false;
            }
            let signing =
                Message::signing_payload(self.phase.code(), self.view, address, payload);
            if !address.verify(Some(namespace), &signing, signature) {
                return false;
            }
        }
        true
    }
}

impl Write for QuorumCertificate {
    fn write(&self, buf: &mut impl BufMut) {
        self.phase.code().write(buf);
        self.view.write(buf);
        self.digest.write(buf);
        self.signatures.write(buf);
    }
}

impl EncodeSize for QuorumCertificate {
    fn encode_size(&self) -> usize {
        u64::SIZE + self.view.encode_size() + Digest::SIZE + self.signatures.encode_size()
    }
}

impl Read for QuorumCertificate {
    /// Maximum number of signatures.
    type Cfg = usize;

    fn read_cfg(buf: &mut impl Buf, max_signatures: &usize) -> Result<Self, CodecError> {
        let code = u64::read(buf)?;
        let phase = Phase::ALL
            .get(code as usize)
            .copied()
            .filter(|phase| phase.code() == code && phase.is_vote())
            .ok_or(CodecError::Invalid("QuorumCertificate", "phase"))?;
        let view = View::read(buf)?;
        let digest = Digest::read(buf)?;
        let signatures =
            Vec::<(Address, Signature)>::read_cfg(buf, &((..=*max_signatures).into(), ((), ())))?;
        Ok(Self {
            phase,
            view,
            digest,
            signatures,
        })
    }
}

/// Sent to the proposer of a new view.
///
/// `block` is attached when `justify` certifies a block of the view's sequence, so the proposer
/// can re-propose it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewView<B: Block> {
    pub justify: Option<QuorumCertificate>,
    pub block: Option<B>,
}

impl<B: Block> Write for NewView<B> {
    fn write(&self, buf: &mut impl BufMut) {
        self.justify.write(buf);
        self.block.write(buf);
    }
}

impl<B: Block> EncodeSize for NewView<B> {
    fn encode_size(&self) -> usize {
        self.justify.encode_size() + self.block.encode_size()
    }
}

impl<B: Block> Read for NewView<B> {
    /// Maximum number of signatures and the block configuration.
    type Cfg = (usize, <B as Read>::Cfg);

    fn read_cfg(
        buf: &mut impl Buf,
        (max_signatures, block): &Self::Cfg,
    ) -> Result<Self, CodecError> {
        let justify = Option::<QuorumCertificate>::read_cfg(buf, max_signatures)?;
        let block = Option::<B>::read_cfg(buf, block)?;
        Ok(Self { justify, block })
    }
}

/// Proposal broadcast by the proposer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Prepare<B: Block> {
    pub block: B,
    pub justify: Option<QuorumCertificate>,
}

impl<B: Block> Write for Prepare<B> {
    fn write(&self, buf: &mut impl BufMut) {
        self.block.write(buf);
        self.justify.write(buf);
    }
}

impl<B: Block> EncodeSize for Prepare<B> {
    fn encode_size(&self) -> usize {
        self.block.encode_size() + self.justify.encode_size()
    }
}

impl<B: Block> Read for Prepare<B> {
    /// Maximum number of signatures and the block configuration.
    type Cfg = (usize, <B as Read>::Cfg);

    fn read_cfg(
        buf: &mut impl Buf,
        (max_signatures, block): &Self::Cfg,
    ) -> Result<Self, CodecError> {
        let block = B::read_cfg(buf, block)?;
        let justify = Option::<QuorumCertificate>::read_cfg(buf, max_signatures)?;
        Ok(Self { block, justify })
    }
}

/// Final message of a round carrying the decided block and its commit certificate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Decide<B: Block> {
    pub block: B,
    pub certificate: QuorumCertificate,
}

impl<B: Block> Write for Decide<B> {
    fn write(&self, buf: &mut impl BufMut) {
        self.block.write(buf);
        self.certificate.write(buf);
    }
}

impl<B: Block> EncodeSize for Decide<B> {
    fn encode_size(&self) -> usize {
        self.block.encode_size() + self.certificate.encode_size()
    }
}

impl<B: Block> Read for Decide<B> {
    /// Maximum number of signatures and the block configuration.
    type Cfg = (usize, <B as Read>::Cfg);

    fn read_cfg(
        buf: &mut impl Buf,
        (max_signatures, block): &Self::Cfg,
    ) -> Result<Self, CodecError> {
        let block = B::read_cfg(buf, block)?;
        let certificate = QuorumCertificate::read_cfg(buf, max_signatures)?;
        Ok(Self { block, certificate })
    }
}

/// Check that a decoded message body was signed with the expected view.
pub(crate) fn check_certificate_view(
    certificate: &QuorumCertificate,
    phase: Phase,
    view: View,
) -> Result<(), Error> {
    if certificate.phase != phase || certificate.view != view {
        return Err(Error::InvalidCertificate);
    }
    Ok(())
}
