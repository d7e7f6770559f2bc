//! Handlers for each [`Phase`] of a round.

use super::state::Core;
use crate::{
    metrics::PhaseLabel,
    types::{
        check_certificate_view, Decide, Digest, Message, NewView, Phase, Prepare,
        QuorumCertificate, View,
    },
    Block, Chain, Error, Recipients, Sender, Validators,
};
use bytes::Bytes;
use commonware_codec::{Decode, DecodeExt, Encode};
use commonware_runtime::{Clock, Metrics};
use std::cmp::Ordering;
use tracing::{debug, info, trace, warn};

impl<E: Clock + Metrics, V: Validators, C: Chain, N: Sender> Core<E, V, C, N> {
    /// Compare a message's view against the current view.
    fn check_view(&self, view: View) -> Result<(), Error> {
        match view.cmp(&self.round.view) {
            Ordering::Less => Err(Error::OldMessage),
            Ordering::Greater => Err(Error::FutureMessage),
            Ordering::Equal => Ok(()),
        }
    }

    /// Check that a certificate carried as justification is valid for a message at `view`.
    fn check_justify(&self, justify: &QuorumCertificate, view: View) -> Result<(), Error> {
        if justify.view >= view {
            return Err(Error::InvalidCertificate);
        }
        if !justify.verify(&self.namespace, &self.validators) {
            return Err(Error::InvalidCertificate);
        }
        Ok(())
    }

    /// Replace `highQC` if `certificate` is newer.
    fn update_high_qc(&mut self, certificate: QuorumCertificate) {
        if self
            .high_qc
            .as_ref()
            .is_some_and(|high| high.view >= certificate.view)
        {
            return;
        }
        trace!(view = %certificate.view, phase = %certificate.phase, "updated highQC");
        self.high_qc = Some(certificate);
    }

    fn vote(&mut self, phase: Phase, digest: Digest) {
        let proposer = self.validators.proposer(self.round.view);
        self.round.step = phase;
        self.send(
            Recipients::One(proposer),
            phase,
            Bytes::copy_from_slice(digest.as_ref()),
        );
    }

    pub(super) fn handle_new_view(&mut self, message: &Message) -> Result<(), Error> {
        self.check_view(message.view)?;
        if !self.is_proposer() {
            return Err(Error::NotProposer);
        }
        let new_view =
            NewView::<C::Block>::decode_cfg(message.payload.clone(), &self.body_cfg)?;
        if let Some(justify) = &new_view.justify {
            self.check_justify(justify, message.view)?;
        }
        if let Some(block) = new_view.block {
            // Only the block certified by the justification may be attached
            match &new_view.justify {
                Some(justify)
                    if justify.digest == block.digest()
                        && block.height() == message.view.sequence =>
                {
                    self.blocks.insert(justify.digest, block);
                }
                _ => return Err(Error::InvalidProposal("block not certified by justification")),
            }
        }
        if self.round.new_views.contains_key(&message.address) {
            trace!(sender = %message.address, "ignoring duplicate new view");
            return Ok(());
        }
        self.round
            .new_views
            .insert(message.address.clone(), new_view.justify);
        self.try_propose();
        Ok(())
    }

    /// Broadcast a proposal if this replica is the proposer and has what it needs.
    ///
    /// In round `0` the proposer does not wait for `NewView` messages. In later rounds it waits
    /// for a quorum of them and extends the highest certificate they carry.
    pub(super) fn try_propose(&mut self) {
        let view = self.round.view;
        if self.round.proposed || self.decided || !self.is_proposer() {
            return;
        }
        if view.round > 0 && self.round.new_views.len() < self.validators.quorum() as usize {
            return;
        }
        let justify = self
            .round
            .new_views
            .values()
            .flatten()
            .chain(self.high_qc.iter())
            .max_by_key(|qc| qc.view)
            .cloned();
        let block = match &justify {
            Some(qc) if qc.view.sequence == view.sequence => {
                // Re-propose the block already certified in this sequence
                let Some(block) = self.blocks.get(&qc.digest) else {
                    warn!(%view, digest = %qc.digest, "missing certified block");
                    return;
                };
                block.clone()
            }
            _ => {
                let (height, head) = self.chain.head();
                match &self.round.request {
                    Some(block)
                        if block.height() == view.sequence
                            && height + 1 == view.sequence
                            && block.parent() == head =>
                    {
                        block.clone()
                    }
                    _ => {
                        trace!(%view, "waiting for request");
                        return;
                    }
                }
            }
        };
        self.round.proposed = true;
        info!(%view, digest = %block.digest(), "proposing");
        let prepare = Prepare { block, justify };
        self.send(Recipients::All, Phase::Prepare, prepare.encode().freeze());
    }

    pub(super) fn handle_prepare(&mut self, message: &Message) -> Result<(), Error> {
        self.check_view(message.view)?;
        if !self
            .validators
            .is_proposer(&message.address, message.view)
        {
            return Err(Error::NotFromProposer);
        }
        if self.round.step != Phase::NewView {
            return Err(Error::UnexpectedPhase);
        }
        let prepare =
            Prepare::<C::Block>::decode_cfg(message.payload.clone(), &self.body_cfg)?;
        let block = prepare.block;
        if block.height() != message.view.sequence {
            return Err(Error::InvalidProposal("height does not match sequence"));
        }
        if let Some(justify) = &prepare.justify {
            self.check_justify(justify, message.view)?;
        }
        self.check_safety(&block, prepare.justify.as_ref())?;
        if !self.chain.verify(&block) {
            return Err(Error::InvalidProposal("rejected by chain"));
        }

        let digest = block.digest();
        debug!(view = %message.view, %digest, "accepted proposal");
        self.blocks.insert(digest, block.clone());
        self.round.proposal = Some(block);
        if let Some(justify) = prepare.justify {
            self.update_high_qc(justify);
        }
        self.vote(Phase::PrepareVote, digest);
        Ok(())
    }

    /// Check that voting for `block` (justified by `justify`) cannot conflict with a block that
    /// may already have been committed.
    fn check_safety(
        &self,
        block: &C::Block,
        justify: Option<&QuorumCertificate>,
    ) -> Result<(), Error> {
        // Never accept a justification older than one already observed
        if let Some(high) = &self.high_qc {
            match justify {
                Some(justify) if justify.view >= high.view => {}
                _ => return Err(Error::SafetyViolation("justification older than highQC")),
            }
        }

        // The block must extend the branch the justification certifies
        let (height, head) = self.chain.head();
        if block.parent() != head {
            return Err(Error::SafetyViolation("block does not extend head"));
        }
        if let Some(justify) = justify {
            if justify.view.sequence == self.round.view.sequence {
                if justify.digest != block.digest() {
                    return Err(Error::SafetyViolation(
                        "block differs from certified block",
                    ));
                }
            } else if justify.view.sequence == height && justify.digest != head {
                return Err(Error::SafetyViolation("justification conflicts with head"));
            }
        }

        // Once locked, only switch blocks on a strictly newer justification
        if let Some(locked) = &self.locked_qc {
            if locked.digest != block.digest()
                && justify.map_or(true, |justify| justify.view <= locked.view)
            {
                return Err(Error::SafetyViolation("locked on another block"));
            }
        }
        Ok(())
    }

    pub(super) fn handle_vote(&mut self, phase: Phase, message: &Message) -> Result<(), Error> {
        self.check_view(message.view)?;
        if !self.is_proposer() {
            return Err(Error::NotProposer);
        }
        let digest = Digest::decode(message.payload.clone())?;
        if !self
            .round
            .votes(phase)
            .add(message.address.clone(), digest, message.signature.clone())
        {
            trace!(sender = %message.address, %phase, "ignoring duplicate vote");
            return Ok(());
        }
        self.try_certify(phase);
        Ok(())
    }

    /// Form a certificate from the votes of `phase` once a quorum voted for the proposal and
    /// broadcast the next phase.
    fn try_certify(&mut self, phase: Phase) {
        let Some(digest) = self.round.proposal_digest() else {
            return;
        };
        if self.round.certificate(phase).is_some() {
            return;
        }
        let quorum = self.validators.quorum() as usize;
        if self.round.votes(phase).count(&digest) < quorum {
            return;
        }
        let certificate = QuorumCertificate {
            phase,
            view: self.round.view,
            digest,
            signatures: self.round.votes(phase).signatures(&digest),
        };
        *self.round.certificate(phase) = Some(certificate.clone());
        self.metrics
            .certificates
            .get_or_create(&PhaseLabel::new(phase))
            .inc();
        debug!(view = %self.round.view, %phase, %digest, "formed certificate");

        match phase {
            Phase::PrepareVote => {
                self.send(Recipients::All, Phase::PreCommit, certificate.encode().freeze());
            }
            Phase::PreCommitVote => {
                self.send(Recipients::All, Phase::Commit, certificate.encode().freeze());
            }
            Phase::CommitVote => {
                if let Some(block) = self.round.proposal.clone() {
                    let decide = Decide { block, certificate };
                    self.send(Recipients::All, Phase::Decide, decide.encode().freeze());
                }
            }
            _ => {}
        }
    }

    pub(super) fn handle_certificate(
        &mut self,
        phase: Phase,
        message: &Message,
    ) -> Result<(), Error> {
        self.check_view(message.view)?;
        if !self
            .validators
            .is_proposer(&message.address, message.view)
        {
            return Err(Error::NotFromProposer);
        }
        let expected = match phase {
            Phase::PreCommit => Phase::PrepareVote,
            Phase::Commit => Phase::PreCommitVote,
            _ => return Err(Error::UnexpectedPhase),
        };
        let certificate =
            QuorumCertificate::decode_cfg(message.payload.clone(), &self.body_cfg.0)?;
        check_certificate_view(&certificate, expected, message.view)?;
        let Some(digest) = self.round.proposal_digest() else {
            return Err(Error::MissingProposal);
        };
        if certificate.digest != digest {
            return Err(Error::DigestMismatch);
        }
        if self.round.step != expected {
            return Err(Error::UnexpectedPhase);
        }
        if !certificate.verify(&self.namespace, &self.validators) {
            return Err(Error::InvalidCertificate);
        }

        match phase {
            Phase::PreCommit => {
                self.update_high_qc(certificate);
                self.vote(Phase::PreCommitVote, digest);
            }
            _ => {
                trace!(view = %message.view, %digest, "locked");
                self.update_high_qc(certificate.clone());
                self.locked_qc = Some(certificate);
                self.vote(Phase::CommitVote, digest);
            }
        }
        Ok(())
    }

    /// Commit the block carried by a `Decide`.
    ///
    /// Any round of the current sequence is accepted so replicas that fell behind in rounds (or
    /// missed earlier phases) still commit.
    pub(super) fn handle_decide(&mut self, message: &Message) -> Result<(), Error> {
        match message.view.sequence.cmp(&self.round.view.sequence) {
            Ordering::Less => return Err(Error::OldMessage),
            Ordering::Greater => return Err(Error::FutureMessage),
            Ordering::Equal => {}
        }
        if !self
            .validators
            .is_proposer(&message.address, message.view)
        {
            return Err(Error::NotFromProposer);
        }
        if self.decided {
            trace!(view = %message.view, "already decided");
            return Ok(());
        }
        let decide =
            Decide::<C::Block>::decode_cfg(message.payload.clone(), &self.body_cfg)?;
        check_certificate_view(&decide.certificate, Phase::CommitVote, message.view)?;
        let digest = decide.block.digest();
        if digest != decide.certificate.digest {
            return Err(Error::DigestMismatch);
        }
        if decide.block.height() != self.round.view.sequence {
            return Err(Error::InvalidProposal("height does not match sequence"));
        }
        if !decide
            .certificate
            .verify(&self.namespace, &self.validators)
        {
            return Err(Error::InvalidCertificate);
        }

        info!(view = %message.view, %digest, "decided");
        self.decided = true;
        self.timer.stop();
        self.update_high_qc(decide.certificate.clone());
        self.metrics.commits.inc();
        self.chain.commit(decide.block, decide.certificate);
        Ok(())
    }
}
