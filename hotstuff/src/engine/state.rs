use super::{backlog::Backlog, round::Round, timer::Timer};
use crate::{
    metrics::{Dropped, Metrics, PhaseLabel},
    registry,
    types::{Address, Digest, Message, NewView, Phase, QuorumCertificate, View},
    Block, Chain, Config, Error, Recipients, Sender, Validators,
};
use bytes::Bytes;
use commonware_codec::{Decode, Encode, Read};
use commonware_cryptography::{ed25519, Signer as _};
use commonware_runtime::{Clock, Metrics as RuntimeMetrics};
use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, SystemTime},
};
use tracing::{debug, info, trace};

/// Largest exponent applied to the round timeout.
const MAX_BACKOFF: u64 = 16;

/// Work generated while handling an event that must be processed before the next event.
pub(super) enum Internal {
    /// A message this replica sent to itself.
    Loopback(Message),
    /// A message held in the backlog whose view was reached.
    Backlog { sender: Address, message: Message },
}

/// Protocol state of a single validator.
///
/// `Core` is driven by exactly one task. Every method runs to completion and may queue
/// [`Internal`] work that the driver drains with [`Core::process_internal`].
pub struct Core<E: Clock + RuntimeMetrics, V: Validators, C: Chain, N: Sender> {
    context: E,
    signer: ed25519::PrivateKey,
    pub(super) address: Address,
    pub(super) validators: V,
    pub(super) chain: C,
    pub(super) sender: N,
    pub(super) namespace: Vec<u8>,
    round_timeout: Duration,
    max_round_timeout: Duration,

    max_message_size: usize,
    /// Decoding limits of phase bodies: the most signatures a certificate may carry and the
    /// block configuration.
    pub(super) body_cfg: (usize, <C::Block as Read>::Cfg),

    /// Round in progress.
    pub(super) round: Round<C::Block>,

    /// Highest certificate observed. Survives rounds and sequences.
    pub(super) high_qc: Option<QuorumCertificate>,

    // Scoped to the current sequence
    pub(super) locked_qc: Option<QuorumCertificate>,
    pub(super) blocks: HashMap<Digest, C::Block>,
    pub(super) decided: bool,

    pub(super) backlog: Backlog,
    pub(super) internal: VecDeque<Internal>,
    pub(super) timer: Timer,
    pub(super) metrics: Metrics,
}

impl<E: Clock + RuntimeMetrics, V: Validators, C: Chain, N: Sender> Core<E, V, C, N> {
    pub fn new(context: E, cfg: Config<V, C, N>) -> Self {
        let metrics = Metrics::init(&context);
        let address = cfg.signer.public_key();
        let max_signatures = cfg.validators.len() as usize;
        Self {
            context,
            signer: cfg.signer,
            address,
            validators: cfg.validators,
            chain: cfg.chain,
            sender: cfg.sender,
            namespace: cfg.namespace,
            round_timeout: cfg.round_timeout,
            max_round_timeout: cfg.max_round_timeout,

            max_message_size: cfg.max_message_size,
            body_cfg: (max_signatures, cfg.block_cfg),

            round: Round::new(View::default(), None),
            high_qc: None,

            locked_qc: None,
            blocks: HashMap::new(),
            decided: false,

            backlog: Backlog::new(cfg.max_backlog),
            internal: VecDeque::new(),
            timer: Timer::default(),
            metrics,
        }
    }

    /// Enter the first round after the chain head.
    pub fn start(&mut self) {
        let (height, head) = self.chain.head();
        info!(height, %head, "starting from chain head");
        self.start_new_round(View::new(height + 1, 0));
    }

    /// Disarm the round timer.
    pub fn stop(&mut self) {
        self.timer.stop();
    }

    /// View the round timer is armed for and when it expires.
    pub fn deadline(&self) -> Option<(View, SystemTime)> {
        self.timer.deadline()
    }

    /// Current view.
    pub fn view(&self) -> View {
        self.round.view
    }

    /// Whether this replica is the proposer of the current view.
    pub fn is_proposer(&self) -> bool {
        self.validators.is_proposer(&self.address, self.round.view)
    }

    /// Whether `digest` is the block being agreed on (or waiting to be proposed) in the
    /// current round.
    pub fn is_current_proposal(&self, digest: &Digest) -> bool {
        self.round.proposal_digest().as_ref() == Some(digest)
            || self.round.request.as_ref().map(Block::digest).as_ref() == Some(digest)
    }

    /// Reset round state and enter `view`.
    pub(super) fn start_new_round(&mut self, view: View) {
        // Carry over a request that can still be proposed
        let request = self
            .round
            .request
            .take()
            .filter(|block| block.height() >= view.sequence);
        if view.sequence != self.round.view.sequence {
            self.locked_qc = None;
            self.blocks.clear();
            self.decided = false;
        }
        self.round = Round::new(view, request);
        self.metrics.current_sequence.set(view.sequence as i64);
        self.metrics.current_round.set(view.round as i64);

        let timeout = self.timeout(view.round);
        self.timer.reset(view, self.context.current() + timeout);
        let proposer = self.validators.proposer(view);
        debug!(%view, %proposer, ?timeout, "entered round");

        // Tell the proposer about the highest certificate we know
        let block = match &self.high_qc {
            Some(qc) if qc.view.sequence == view.sequence => self.blocks.get(&qc.digest).cloned(),
            _ => None,
        };
        let new_view = NewView {
            justify: self.high_qc.clone(),
            block,
        };
        self.send(
            Recipients::One(proposer),
            Phase::NewView,
            new_view.encode().freeze(),
        );
        self.try_propose();

        // Replay messages that were waiting for this view
        for (sender, message) in self.backlog.ready(view) {
            self.internal.push_back(Internal::Backlog { sender, message });
        }
        self.metrics.backlog.set(self.backlog.len() as i64);
    }

    fn timeout(&self, round: u64) -> Duration {
        let factor = 1u32 << round.min(MAX_BACKOFF);
        self.round_timeout
            .saturating_mul(factor)
            .min(self.max_round_timeout)
    }

    /// Handle expiry of the round timer armed for `view`.
    pub fn handle_timeout(&mut self, view: View) {
        if view != self.round.view {
            trace!(%view, current = %self.round.view, "ignoring stale timeout");
            return;
        }
        if self.decided {
            trace!(%view, "ignoring timeout after decide");
            return;
        }
        info!(%view, step = %self.round.step, "round timed out");
        self.metrics.timeouts.inc();
        self.start_new_round(View::new(view.sequence, view.round + 1));
    }

    /// Handle notification that the block at `height` was persisted.
    pub fn handle_final_committed(&mut self, height: u64, digest: Digest) {
        if height < self.round.view.sequence {
            debug!(height, current = %self.round.view, "ignoring stale finalization");
            return;
        }
        debug!(height, %digest, "finalized");
        self.backlog.prune(height);
        self.start_new_round(View::new(height + 1, 0));
    }

    /// Handle a block submitted for proposal.
    pub fn handle_request(&mut self, block: C::Block) {
        let view = self.round.view;
        if block.height() < view.sequence {
            debug!(height = block.height(), %view, "ignoring stale request");
            return;
        }
        trace!(height = block.height(), digest = %block.digest(), "received request");
        self.round.request = Some(block);
        self.try_propose();
    }

    /// Decode, authenticate, and dispatch a message received from the network.
    ///
    /// The transport's `hint` is never trusted: the signer embedded in the message is what gets
    /// checked against the validator set.
    pub fn handle_message(&mut self, hint: Address, bytes: Bytes) -> Result<(), Error> {
        let result = self
            .authenticate(hint, bytes)
            .and_then(|message| self.dispatch(message, false));
        if let Err(err) = &result {
            self.record(err);
        }
        result
    }

    fn authenticate(&self, hint: Address, bytes: Bytes) -> Result<Message, Error> {
        let message = Message::decode_cfg(bytes, &self.max_message_size)?;
        if self.validators.get_by_address(&message.address).is_none() {
            return Err(Error::InvalidSigner);
        }
        if !message.verify(&self.namespace) {
            return Err(Error::InvalidSignature);
        }
        if hint != message.address {
            trace!(%hint, signer = %message.address, "message relayed by another peer");
        }
        Ok(message)
    }

    /// Route a message to its phase handler.
    ///
    /// Messages for a future view are stored in the backlog unless they are being replayed from
    /// it.
    pub(super) fn dispatch(&mut self, message: Message, replay: bool) -> Result<(), Error> {
        let phase = registry::lookup(message.code).ok_or(Error::InvalidMessage(message.code))?;
        let result = match phase {
            Phase::NewView => self.handle_new_view(&message),
            Phase::Prepare => self.handle_prepare(&message),
            Phase::PrepareVote | Phase::PreCommitVote | Phase::CommitVote => {
                self.handle_vote(phase, &message)
            }
            Phase::PreCommit | Phase::Commit => self.handle_certificate(phase, &message),
            Phase::Decide => self.handle_decide(&message),
        };
        match result {
            Ok(()) => {
                self.metrics
                    .inbound_messages
                    .get_or_create(&PhaseLabel::new(phase))
                    .inc();
                Ok(())
            }
            Err(Error::FutureMessage) if !replay => {
                let (sender, view) = (message.address.clone(), message.view);
                if self.backlog.store(sender.clone(), message, self.round.view) {
                    trace!(%sender, %view, %phase, "stored future message");
                    self.metrics.backlog.set(self.backlog.len() as i64);
                } else {
                    debug!(%sender, %view, %phase, "backlog full");
                }
                Err(Error::FutureMessage)
            }
            Err(err) => Err(err),
        }
    }

    /// Drain work queued while handling the last event.
    pub fn process_internal(&mut self) {
        while let Some(internal) = self.internal.pop_front() {
            let (result, sender, replay) = match internal {
                Internal::Loopback(message) => {
                    (self.dispatch(message, false), self.address.clone(), false)
                }
                Internal::Backlog { sender, message } => {
                    (self.dispatch(message, true), sender, true)
                }
            };
            if let Err(err) = result {
                debug!(?err, %sender, replay, "failed to process internal message");
                self.record(&err);
            }
        }
    }

    fn record(&self, err: &Error) {
        let reason = match err {
            Error::FutureMessage => return,
            Error::Decode(_) => "decode",
            Error::InvalidSignature => "invalid_signature",
            Error::InvalidSigner => "invalid_signer",
            Error::InvalidMessage(_) => "invalid_message",
            Error::OldMessage => "old",
            Error::SafetyViolation(_) => "safety",
            Error::NotFromProposer | Error::NotProposer => "proposer",
            Error::InvalidProposal(_) => "invalid_proposal",
            Error::InvalidCertificate | Error::DigestMismatch => "invalid_certificate",
            Error::UnexpectedPhase | Error::MissingProposal => "unexpected",
            Error::ChannelClosed(_) | Error::Task(_) => "closed",
        };
        self.metrics
            .dropped_messages
            .get_or_create(&Dropped::new(reason))
            .inc();
    }

    /// Sign a message for the current view and deliver it.
    ///
    /// Messages addressed to this replica (or broadcast) are also queued for local processing.
    pub(super) fn send(&mut self, recipients: Recipients, phase: Phase, payload: Bytes) {
        let message = Message::sign(
            &self.signer,
            &self.namespace,
            phase,
            self.round.view,
            payload,
        );
        match recipients {
            Recipients::One(address) if address == self.address => {}
            Recipients::One(address) => {
                self.sender
                    .send(Recipients::One(address), message.encode().freeze());
                return;
            }
            Recipients::All => {
                self.sender.send(Recipients::All, message.encode().freeze());
            }
        }
        self.internal.push_back(Internal::Loopback(message));
    }
}
