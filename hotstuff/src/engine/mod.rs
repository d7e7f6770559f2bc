//! Single-consumer event loop driving the protocol.
//!
//! The engine owns all protocol state and processes one event at a time. Events are drained in
//! priority order: shutdown, round expiry, finalization, client requests, and finally network
//! messages. Work generated while handling an event (messages sent to self and backlog replays)
//! is always processed before the next event is taken.

mod backlog;
mod ingress;
mod phases;
mod round;
mod state;
mod timer;

pub use ingress::{Handle, Mailbox, Request};

use crate::{
    registry,
    types::{Address, Digest, View},
    Block, Chain, Config, Error, Sender, Validators,
};
use bytes::Bytes;
use commonware_cryptography::Signer as _;
use commonware_macros::select;
use commonware_runtime::{Clock, Metrics, Spawner};
use futures::{
    channel::{mpsc, oneshot},
    future::{self, Either},
    StreamExt,
};
use state::Core;
use tracing::{debug, info, trace};

enum Event<B: Block> {
    Stop,
    Detached,
    Timeout(View),
    Finalized(u64, Digest),
    Request(Request<B>),
    Message(Address, Bytes),
}

/// Instance of the `hotstuff` consensus engine.
pub struct Engine<E: Clock + Spawner + Metrics, V: Validators, C: Chain, N: Sender> {
    context: E,
    core: Core<E, V, C, N>,

    requests: mpsc::Receiver<Request<C::Block>>,
    messages: mpsc::Receiver<(Address, Bytes)>,
    finalized: mpsc::Receiver<(u64, Digest)>,
}

impl<E: Clock + Spawner + Metrics, V: Validators, C: Chain, N: Sender> Engine<E, V, C, N> {
    /// Create a new engine and the [`Mailbox`] used to feed it.
    pub fn new(context: E, cfg: Config<V, C, N>) -> (Self, Mailbox<C::Block>) {
        // Ensure configuration is valid
        cfg.assert();

        let address = cfg.signer.public_key();
        let (requests_sender, requests) = mpsc::channel(cfg.mailbox_size);
        let (messages_sender, messages) = mpsc::channel(cfg.mailbox_size);
        let (finalized_sender, finalized) = mpsc::channel(cfg.mailbox_size);
        let core = Core::new(context.clone(), cfg);
        (
            Self {
                context,
                core,
                requests,
                messages,
                finalized,
            },
            Mailbox::new(address, requests_sender, messages_sender, finalized_sender),
        )
    }

    /// Spawn the engine with its runtime context.
    pub fn start(self) -> Handle {
        let (stop_sender, stop) = oneshot::channel();
        let task = self.context.clone().spawn(move |_| self.run(stop));
        Handle::new(stop_sender, task)
    }

    async fn run(mut self, stop: oneshot::Receiver<()>) -> Result<(), Error> {
        registry::register();
        self.core.start();

        let mut stop = Some(stop);
        loop {
            self.core.process_internal();

            let deadline = self.core.deadline();
            let stopped = match stop.as_mut() {
                Some(stop) => Either::Left(stop),
                None => Either::Right(future::pending()),
            };
            let event;
            select! {
                result = stopped => {
                    event = match result {
                        Ok(()) => Event::Stop,
                        Err(_) => Event::Detached,
                    };
                },
                view = timer::wait(&self.context, deadline) => {
                    event = Event::Timeout(view);
                },
                finalized = self.finalized.next() => {
                    let Some((height, digest)) = finalized else {
                        return Err(Error::ChannelClosed("finalized"));
                    };
                    event = Event::Finalized(height, digest);
                },
                request = self.requests.next() => {
                    let Some(request) = request else {
                        return Err(Error::ChannelClosed("requests"));
                    };
                    event = Event::Request(request);
                },
                message = self.messages.next() => {
                    let Some((sender, message)) = message else {
                        return Err(Error::ChannelClosed("messages"));
                    };
                    event = Event::Message(sender, message);
                },
            }

            match event {
                Event::Stop => {
                    info!(view = %self.core.view(), "stopping");
                    self.core.stop();
                    self.requests.close();
                    self.messages.close();
                    self.finalized.close();
                    return Ok(());
                }
                Event::Detached => {
                    // The handle was dropped without stopping the engine
                    trace!("stop handle dropped");
                    stop = None;
                }
                Event::Timeout(view) => self.core.handle_timeout(view),
                Event::Finalized(height, digest) => {
                    self.core.handle_final_committed(height, digest)
                }
                Event::Request(Request::Propose(block)) => self.core.handle_request(block),
                Event::Request(Request::IsProposer { response }) => {
                    let _ = response.send(self.core.is_proposer());
                }
                Event::Request(Request::IsCurrentProposal { digest, response }) => {
                    let _ = response.send(self.core.is_current_proposal(&digest));
                }
                Event::Message(sender, message) => {
                    if let Err(err) = self.core.handle_message(sender.clone(), message) {
                        if err.is_retryable() {
                            trace!(?err, %sender, "deferred message");
                        } else {
                            debug!(?err, %sender, "dropped message");
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mocks::{
            block::Block as MockBlock,
            chain::{Chain as MockChain, Notification},
            network::{Filter, Network, Recorder},
            signers,
        },
        types::{Message, Phase},
        Committee,
    };
    use commonware_codec::Decode;
    use commonware_cryptography::ed25519;
    use commonware_macros::test_traced;
    use commonware_runtime::{deterministic, Runner};
    use std::{
        collections::{BTreeMap, HashMap},
        sync::Arc,
        time::Duration,
    };

    const NAMESPACE: &[u8] = b"_HOTSTUFF";
    const MAX_MESSAGE_SIZE: usize = 1024 * 1024;
    const MAX_PAYLOAD: usize = 1024;

    struct Cluster {
        handles: Vec<Handle>,
        commits: mpsc::UnboundedReceiver<Notification>,
    }

    fn config<N: crate::Sender>(
        signer: &ed25519::PrivateKey,
        committee: Committee,
        chain: MockChain,
        sender: N,
    ) -> Config<Committee, MockChain, N> {
        Config {
            signer: signer.clone(),
            validators: committee,
            chain,
            sender,
            namespace: NAMESPACE.to_vec(),
            mailbox_size: 1024,
            round_timeout: Duration::from_secs(1),
            max_round_timeout: Duration::from_secs(10),
            max_backlog: 128,
            max_message_size: MAX_MESSAGE_SIZE,
            block_cfg: MAX_PAYLOAD,
        }
    }

    /// Run a driver for a validator: forward commits to the engine and propose the next block.
    fn drive(
        context: deterministic::Context,
        index: usize,
        mut mailbox: Mailbox<MockBlock>,
        mut notifications: mpsc::UnboundedReceiver<Notification>,
        tracker: mpsc::UnboundedSender<Notification>,
    ) {
        context.spawn(move |_| async move {
            while let Some(notification) = notifications.next().await {
                let height = notification.height;
                let digest = notification.digest;
                let _ = tracker.unbounded_send(notification);
                mailbox.final_committed(height, digest).await;
                mailbox
                    .propose(MockBlock::for_validator(index, height + 1, digest))
                    .await;
            }
        });
    }

    /// Start `n` validators (skipping `offline`) connected through a simulated network.
    async fn cluster(
        context: &deterministic::Context,
        n: u64,
        offline: &[usize],
        filter: Option<Filter>,
    ) -> Cluster {
        let signers = signers(n);
        let committee = Committee::new(signers.iter().map(|s| s.public_key()).collect());
        let network = Network::start(context.with_label("network"), filter);
        let (tracker, commits) = mpsc::unbounded();
        let mut handles = Vec::new();
        for (index, signer) in signers.iter().enumerate() {
            if offline.contains(&index) {
                continue;
            }
            let address = signer.public_key();
            let (chain, notifications) = MockChain::new(address.clone(), 0);
            let (_, genesis) = chain.head();
            let sender = network.sender(address.clone());
            let cfg = config(signer, committee.clone(), chain, sender);
            let context = context.with_label(&format!("validator-{index}"));
            let (engine, mut mailbox) = Engine::new(context.with_label("engine"), cfg);
            network.register(address, mailbox.clone());
            drive(
                context.with_label("driver"),
                index,
                mailbox.clone(),
                notifications,
                tracker.clone(),
            );
            mailbox
                .propose(MockBlock::for_validator(index, 1, genesis))
                .await;
            handles.push(engine.start());
        }
        Cluster { handles, commits }
    }

    /// Wait until every node in `online` committed `heights` blocks and check they agree.
    async fn wait_for_commits(
        commits: &mut mpsc::UnboundedReceiver<Notification>,
        online: usize,
        heights: u64,
    ) -> BTreeMap<u64, (Digest, View)> {
        let mut committed: HashMap<Address, BTreeMap<u64, (Digest, View)>> = HashMap::new();
        loop {
            let done = committed.len() == online
                && committed
                    .values()
                    .all(|blocks| blocks.len() as u64 >= heights);
            if done {
                break;
            }
            let notification = commits.next().await.expect("tracker closed");
            let blocks = committed.entry(notification.address).or_default();
            let previous =
                blocks.insert(notification.height, (notification.digest, notification.view));
            assert!(previous.is_none(), "committed height twice");
        }

        // Every node committed the same digest at every height
        let mut agreed = BTreeMap::new();
        for blocks in committed.values() {
            for (height, (digest, view)) in blocks.range(..=heights) {
                let (expected, _) = *agreed.entry(*height).or_insert((*digest, *view));
                assert_eq!(expected, *digest, "conflicting commits at height {height}");
            }
        }
        agreed
    }

    #[test_traced]
    fn test_all_online() {
        let executor = deterministic::Runner::timed(Duration::from_secs(30));
        executor.start(|context| async move {
            let mut cluster = cluster(&context, 4, &[], None).await;
            let agreed = wait_for_commits(&mut cluster.commits, 4, 10).await;

            // Every block was decided in the first round of its sequence
            for (height, (_, view)) in agreed.iter() {
                assert_eq!(view.sequence, *height);
                assert_eq!(view.round, 0);
            }

            for handle in cluster.handles {
                handle.stop().await.unwrap();
            }
        });
    }

    #[test_traced]
    fn test_crashed_leader() {
        let executor = deterministic::Runner::timed(Duration::from_secs(60));
        executor.start(|context| async move {
            // Validator 1 proposes (1, 0) and never comes online
            let mut cluster = cluster(&context, 4, &[1], None).await;
            let agreed = wait_for_commits(&mut cluster.commits, 3, 6).await;
            let (_, view) = agreed[&1];
            assert_eq!(view, View::new(1, 1));

            // Height 5 is proposed by validator 1 in round 0 as well
            let (_, view) = agreed[&5];
            assert_eq!(view, View::new(5, 1));
            for height in [2, 3, 4, 6] {
                let (_, view) = agreed[&height];
                assert_eq!(view.round, 0);
            }

            for handle in cluster.handles {
                handle.stop().await.unwrap();
            }
        });
    }

    #[test_traced]
    fn test_missed_prepare() {
        let executor = deterministic::Runner::timed(Duration::from_secs(30));
        executor.start(|context| async move {
            let victim = signers(4)[3].public_key();

            // Drop every Prepare sent to validator 3
            let filter: Filter =
                Arc::new(move |_: &Address, recipient: &Address, message: &Bytes| {
                    if *recipient != victim {
                        return true;
                    }
                    match Message::decode_cfg(message.clone(), &MAX_MESSAGE_SIZE) {
                        Ok(message) => message.code != Phase::Prepare.code(),
                        Err(_) => true,
                    }
                });
            let mut cluster = cluster(&context, 4, &[], Some(filter)).await;
            let agreed = wait_for_commits(&mut cluster.commits, 4, 3).await;
            for (_, (_, view)) in agreed {
                assert_eq!(view.round, 0);
            }

            for handle in cluster.handles {
                handle.stop().await.unwrap();
            }
        });
    }

    #[test_traced]
    fn test_queries() {
        let executor = deterministic::Runner::timed(Duration::from_secs(30));
        executor.start(|context| async move {
            // Validator 1 proposes (1, 0) and never hears from peers
            let signers = signers(4);
            let committee = Committee::new(signers.iter().map(|s| s.public_key()).collect());
            let (chain, _notifications) = MockChain::new(signers[1].public_key(), 0);
            let (_, genesis) = chain.head();
            let network = Network::start(context.with_label("network"), None);
            let sender = network.sender(signers[1].public_key());
            let cfg = config(&signers[1], committee, chain, sender);
            let (engine, mut mailbox) = Engine::new(context.with_label("engine"), cfg);
            assert_eq!(mailbox.address(), signers[1].public_key());
            let handle = engine.start();

            assert_eq!(mailbox.is_proposer().await, Some(true));
            let block = MockBlock::for_validator(1, 1, genesis);
            assert_eq!(
                mailbox.is_current_proposal(block.digest()).await,
                Some(false)
            );
            mailbox.propose(block.clone()).await;
            assert_eq!(
                mailbox.is_current_proposal(block.digest()).await,
                Some(true)
            );

            handle.stop().await.unwrap();
            assert_eq!(mailbox.is_proposer().await, None);
        });
    }

    #[test_traced]
    fn test_closed_mailbox() {
        let executor = deterministic::Runner::timed(Duration::from_secs(30));
        executor.start(|context| async move {
            let signers = signers(4);
            let committee = Committee::new(signers.iter().map(|s| s.public_key()).collect());
            let (chain, _notifications) = MockChain::new(signers[0].public_key(), 0);
            let cfg = config(&signers[0], committee, chain, Recorder::default());
            let (engine, mailbox) = Engine::new(context.with_label("engine"), cfg);
            let handle = engine.start();

            // Dropping every sender closes the event sources
            drop(mailbox);
            assert!(matches!(
                handle.join().await,
                Err(Error::ChannelClosed(_))
            ));
        });
    }

    #[test_traced]
    #[should_panic(expected = "round timeout must be greater than zero")]
    fn test_invalid_config() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let signers = signers(4);
            let committee = Committee::new(signers.iter().map(|s| s.public_key()).collect());
            let (chain, _notifications) = MockChain::new(signers[0].public_key(), 0);
            let mut cfg = config(&signers[0], committee, chain, Recorder::default());
            cfg.round_timeout = Duration::ZERO;
            let _ = Engine::new(context, cfg);
        });
    }
}
