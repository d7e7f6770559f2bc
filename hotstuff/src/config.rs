use crate::{Chain, Sender, Validators};
use commonware_codec::Read;
use commonware_cryptography::ed25519;
use std::time::Duration;

/// Configuration for the consensus engine.
pub struct Config<V: Validators, C: Chain, N: Sender> {
    /// Cryptographic primitives.
    pub signer: ed25519::PrivateKey,

    /// Validator set and proposer selection.
    pub validators: V,

    /// Block verification and persistence.
    pub chain: C,

    /// Outbound network.
    pub sender: N,

    /// Prefix for all signed messages to prevent replay attacks.
    pub namespace: Vec<u8>,

    /// Maximum number of messages to buffer on channels inside the consensus
    /// engine before blocking.
    pub mailbox_size: usize,

    /// Amount of time to wait for a decision in round `0` of a sequence.
    ///
    /// Each subsequent round of the same sequence doubles this value (up to
    /// `max_round_timeout`).
    pub round_timeout: Duration,

    /// Upper bound on the round timeout.
    pub max_round_timeout: Duration,

    /// Maximum number of future messages to hold per sender.
    pub max_backlog: usize,

    /// Maximum length of the phase-specific payload of an inbound message.
    pub max_message_size: usize,

    /// Configuration used to decode blocks received from peers.
    pub block_cfg: <C::Block as Read>::Cfg,
}

impl<V: Validators, C: Chain, N: Sender> Config<V, C, N> {
    /// Assert enforces that all configuration values are valid.
    pub fn assert(&self) {
        assert!(
            !self.validators.is_empty(),
            "there must be at least one validator"
        );
        assert!(
            self.mailbox_size > 0,
            "mailbox size must be greater than zero"
        );
        assert!(
            self.round_timeout > Duration::default(),
            "round timeout must be greater than zero"
        );
        assert!(
            self.round_timeout <= self.max_round_timeout,
            "round timeout must be less than or equal to max round timeout"
        );
        assert!(
            self.max_backlog > 0,
            "it must be possible to backlog at least one message per sender"
        );
        assert!(
            self.max_message_size > 0,
            "max message size must be greater than zero"
        );
    }
}
