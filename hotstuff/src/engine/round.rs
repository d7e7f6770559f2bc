use crate::{
    types::{Address, Digest, Phase, QuorumCertificate, Signature, View},
    Block,
};
use std::collections::HashMap;

/// Votes of a single phase, at most one per validator.
#[derive(Default)]
pub struct VoteSet {
    votes: HashMap<Address, (Digest, Signature)>,
}

impl VoteSet {
    /// Record a vote. Returns false if `address` already voted in this phase.
    pub fn add(&mut self, address: Address, digest: Digest, signature: Signature) -> bool {
        if self.votes.contains_key(&address) {
            return false;
        }
        self.votes.insert(address, (digest, signature));
        true
    }

    /// Number of votes for `digest`.
    pub fn count(&self, digest: &Digest) -> usize {
        self.votes.values().filter(|(d, _)| d == digest).count()
    }

    /// Signatures for `digest`, ordered by address.
    pub fn signatures(&self, digest: &Digest) -> Vec<(Address, Signature)> {
        let mut signatures: Vec<_> = self
            .votes
            .iter()
            .filter(|(_, (d, _))| d == digest)
            .map(|(address, (_, signature))| (address.clone(), signature.clone()))
            .collect();
        signatures.sort_by(|(a, _), (b, _)| a.cmp(b));
        signatures
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.votes.len()
    }
}

/// State of the round in progress. Replaced whenever a new round starts.
pub struct Round<B: Block> {
    pub view: View,

    /// Last phase this replica took part in.
    pub step: Phase,

    /// Block accepted (or proposed) in this round.
    pub proposal: Option<B>,

    /// Client block waiting to be proposed.
    pub request: Option<B>,

    /// Whether this replica already broadcast a proposal in this round.
    pub proposed: bool,

    /// `NewView` messages received as proposer, keyed by sender.
    pub new_views: HashMap<Address, Option<QuorumCertificate>>,

    pub prepare_votes: VoteSet,
    pub precommit_votes: VoteSet,
    pub commit_votes: VoteSet,

    pub prepare_qc: Option<QuorumCertificate>,
    pub precommit_qc: Option<QuorumCertificate>,
    pub commit_qc: Option<QuorumCertificate>,
}

impl<B: Block> Round<B> {
    pub fn new(view: View, request: Option<B>) -> Self {
        Self {
            view,
            step: Phase::NewView,
            proposal: None,
            request,
            proposed: false,
            new_views: HashMap::new(),
            prepare_votes: VoteSet::default(),
            precommit_votes: VoteSet::default(),
            commit_votes: VoteSet::default(),
            prepare_qc: None,
            precommit_qc: None,
            commit_qc: None,
        }
    }

    /// Votes collected for `phase` (which must be a vote phase).
    pub fn votes(&mut self, phase: Phase) -> &mut VoteSet {
        match phase {
            Phase::PrepareVote => &mut self.prepare_votes,
            Phase::PreCommitVote => &mut self.precommit_votes,
            Phase::CommitVote => &mut self.commit_votes,
            _ => unreachable!("not a vote phase: {phase}"),
        }
    }

    /// Certificate formed from the votes of `phase`, if any.
    pub fn certificate(&mut self, phase: Phase) -> &mut Option<QuorumCertificate> {
        match phase {
            Phase::PrepareVote => &mut self.prepare_qc,
            Phase::PreCommitVote => &mut self.precommit_qc,
            Phase::CommitVote => &mut self.commit_qc,
            _ => unreachable!("not a vote phase: {phase}"),
        }
    }

    /// Digest of the block accepted in this round.
    pub fn proposal_digest(&self) -> Option<Digest> {
        self.proposal.as_ref().map(Block::digest)
    }
}
