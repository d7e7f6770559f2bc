use super::block::Block;
use crate::{engine::Mailbox, types::Address, Recipients};
use bytes::Bytes;
use commonware_runtime::Spawner;
use futures::{channel::mpsc, StreamExt};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

/// Decides whether a message from `sender` is delivered to `recipient`.
pub type Filter = Arc<dyn Fn(&Address, &Address, &Bytes) -> bool + Send + Sync>;

type Peers = Arc<Mutex<BTreeMap<Address, Mailbox<Block>>>>;

/// Simulated network delivering messages between registered engines in send order.
#[derive(Clone)]
pub struct Network {
    peers: Peers,
    outbound: mpsc::UnboundedSender<(Address, Recipients, Bytes)>,
}

impl Network {
    /// Spawn the router with `context`.
    pub fn start<E: Spawner>(context: E, filter: Option<Filter>) -> Self {
        let peers: Peers = Arc::default();
        let (outbound, mut inbound) = mpsc::unbounded::<(Address, Recipients, Bytes)>();
        let routes = peers.clone();
        context.spawn(move |_| async move {
            while let Some((sender, recipients, message)) = inbound.next().await {
                let targets: Vec<_> = {
                    let peers = routes.lock().unwrap();
                    peers
                        .iter()
                        .filter(|(address, _)| match &recipients {
                            Recipients::All => **address != sender,
                            Recipients::One(recipient) => *address == recipient,
                        })
                        .map(|(address, mailbox)| (address.clone(), mailbox.clone()))
                        .collect()
                };
                for (recipient, mut mailbox) in targets {
                    if let Some(filter) = &filter {
                        if !filter(&sender, &recipient, &message) {
                            continue;
                        }
                    }
                    mailbox.message(sender.clone(), message.clone()).await;
                }
            }
        });
        Self { peers, outbound }
    }

    /// Deliver messages addressed to `address` to `mailbox`.
    pub fn register(&self, address: Address, mailbox: Mailbox<Block>) {
        self.peers.lock().unwrap().insert(address, mailbox);
    }

    /// Outbound half for the engine running as `address`.
    pub fn sender(&self, address: Address) -> Sender {
        Sender {
            address,
            outbound: self.outbound.clone(),
        }
    }
}

pub struct Sender {
    address: Address,
    outbound: mpsc::UnboundedSender<(Address, Recipients, Bytes)>,
}

impl crate::Sender for Sender {
    fn send(&mut self, recipients: Recipients, message: Bytes) {
        let _ = self
            .outbound
            .unbounded_send((self.address.clone(), recipients, message));
    }
}

/// Sender that records everything sent through it.
#[derive(Clone, Default)]
pub struct Recorder {
    sent: Arc<Mutex<Vec<(Recipients, Bytes)>>>,
}

impl Recorder {
    /// Remove and return all recorded messages.
    pub fn take(&self) -> Vec<(Recipients, Bytes)> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }
}

impl crate::Sender for Recorder {
    fn send(&mut self, recipients: Recipients, message: Bytes) {
        self.sent.lock().unwrap().push((recipients, message));
    }
}
