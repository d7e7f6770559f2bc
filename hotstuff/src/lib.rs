//! Order blocks in a Byzantine environment with three-phase HotStuff.
//!
//! `commonware-hotstuff` drives a single validator through successive rounds of block proposal,
//! voting, and commitment. It tolerates up to `f` faulty validators out of `3f + 1` and guarantees
//! that all honest validators commit the same blocks in the same order.
//!
//! # Status
//!
//! `commonware-hotstuff` is **ALPHA** software and is not yet recommended for production use. Developers should
//! expect breaking changes and occasional instability.
//!
//! # Design
//!
//! ## Architecture
//!
//! All mutable state is owned by a single task (the [`Engine`]). Client requests, network messages,
//! round expiries, and finality notifications are delivered to it over typed channels and processed
//! one at a time, to completion. Messages that arrive for a view the engine has not yet reached are
//! held in a per-sender backlog and replayed once the engine catches up.
//!
//! ```txt
//! +-----------+  propose/query   +----------+   send    +++++++++++++
//! |           +----------------->|          +---------->+           +
//! |  Client   |                  |  Engine  |           +   Peers   +
//! |           |   +------------->|          |<----------+           +
//! +-----------+   |              +----+-----+  message  +++++++++++++
//!                 |                   |
//!                 | final_committed   | verify/commit
//!                 |                   v
//!                 |              +----------+
//!                 +--------------+  Chain   |
//!                                +----------+
//! ```
//!
//! ## Protocol Description
//!
//! Each decision is identified by a [`View`] `(sequence, round)`. The sequence is the height being
//! decided and only advances on commit. The round only advances when the round timer expires.
//!
//! Upon entering view `v`:
//! * Send `NewView(highQC)` to the proposer of `v`
//! * If proposer, wait for `2f+1` `NewView` messages (or none in round `0`), then broadcast
//!   `Prepare(block, justify)` where `justify` is the highest certificate observed
//!
//! Upon receiving `Prepare(block, justify)` from the proposer:
//! * Reject if `justify` is older than the local `highQC` or `block` does not extend it
//! * Reject if locked on a different block and `justify` is not newer than the lock
//! * Send `PrepareVote(block)` to the proposer
//!
//! Upon collecting `2f+1` votes of some phase, the proposer broadcasts the next certificate:
//! `PrepareVote` forms `PreCommit(prepareQC)`, `PreCommitVote` forms `Commit(preCommitQC)`, and
//! `CommitVote` forms `Decide(block, commitQC)`. Replicas vote on each certificate in turn and
//! lock on the block when they receive `Commit`. `Decide` carries the block so a replica that
//! missed earlier phases can still commit.
//!
//! Upon timer expiry for view `(s, r)`:
//! * Enter view `(s, r + 1)`

use bytes::Bytes;
use commonware_codec::Codec;
use std::fmt::Debug;
use thiserror::Error;

pub mod committee;
pub mod engine;
pub mod registry;
pub mod types;

mod config;
mod metrics;

#[cfg(test)]
pub mod mocks;

pub use committee::Committee;
pub use config::Config;
pub use engine::{Engine, Handle, Mailbox};
pub use types::{Address, Digest, Message, Phase, QuorumCertificate, Signature, View};

/// Errors that can occur while processing consensus messages.
///
/// All errors other than [`Error::ChannelClosed`] and [`Error::Task`] are scoped to a single message and never
/// terminate the engine.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Decode failed: {0}")]
    Decode(#[from] commonware_codec::Error),
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Signer is not a validator")]
    InvalidSigner,
    #[error("Unknown message code: {0}")]
    InvalidMessage(u64),
    #[error("Message is for a future view")]
    FutureMessage,
    #[error("Message is for a past view")]
    OldMessage,
    #[error("Safety violation: {0}")]
    SafetyViolation(&'static str),
    #[error("Message not sent by proposer")]
    NotFromProposer,
    #[error("Not the proposer")]
    NotProposer,
    #[error("Invalid proposal: {0}")]
    InvalidProposal(&'static str),
    #[error("Invalid certificate")]
    InvalidCertificate,
    #[error("Unexpected phase")]
    UnexpectedPhase,
    #[error("Missing proposal")]
    MissingProposal,
    #[error("Digest mismatch")]
    DigestMismatch,
    #[error("Channel closed: {0}")]
    ChannelClosed(&'static str),
    #[error("Task failed: {0}")]
    Task(#[from] commonware_runtime::Error),
}

impl Error {
    /// Returns true if the message that produced this error should be retried later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::FutureMessage)
    }
}

/// Block is the unit of agreement.
///
/// Blocks form a chain: every block at height `h` references the digest of its parent at
/// height `h - 1`. Blocks received from peers are decoded with the `block_cfg` provided in
/// [`Config`].
pub trait Block: Codec + Clone + Debug + Send + Sync + 'static {
    /// Digest uniquely identifying the block.
    fn digest(&self) -> Digest;

    /// Digest of the block this block extends.
    fn parent(&self) -> Digest;

    /// Height of the block (the sequence it is proposed for).
    fn height(&self) -> u64;
}

/// Validators is the interface responsible for the set of participants and proposer selection.
///
/// ## Synchronization
///
/// It is up to the user to ensure this set is identical across all participants. If it is not,
/// consensus could halt (as different participants may disagree on the proposer or quorum).
pub trait Validators: Clone + Send + 'static {
    /// Return the index of `address` if it is a validator.
    fn get_by_address(&self, address: &Address) -> Option<u32>;

    /// Return the proposer of `view`.
    fn proposer(&self, view: View) -> Address;

    /// Indicate whether `address` is the proposer of `view`.
    fn is_proposer(&self, address: &Address, view: View) -> bool {
        self.proposer(view) == *address
    }

    /// Number of validators.
    fn len(&self) -> u32;

    /// Whether there are no validators.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of distinct votes required to form a certificate.
    fn quorum(&self) -> u32 {
        commonware_utils::quorum(self.len())
    }
}

/// Chain is the interface responsible for block validity and persistence.
pub trait Chain: Send + 'static {
    /// Block type agreed upon.
    type Block: Block;

    /// Height and digest of the last committed block.
    fn head(&self) -> (u64, Digest);

    /// Verify that a proposed block is valid.
    fn verify(&mut self, block: &Self::Block) -> bool;

    /// Event indicating a block has been decided with the provided certificate.
    ///
    /// Once the block is persisted, the user should notify the engine with
    /// [`Mailbox::final_committed`] so it can move to the next sequence.
    fn commit(&mut self, block: Self::Block, certificate: QuorumCertificate);
}

/// Destination of an outbound message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Recipients {
    /// All validators other than the sender.
    All,
    /// A single validator.
    One(Address),
}

/// Sender is the interface responsible for delivering messages to peers.
///
/// Delivery is best effort. The protocol tolerates dropped messages through round timeouts.
pub trait Sender: Send + 'static {
    /// Send an encoded message to `recipients`.
    fn send(&mut self, recipients: Recipients, message: Bytes);
}
