use super::block::Block;
use crate::{
    types::{Address, Digest, QuorumCertificate, View},
    Block as _,
};
use commonware_cryptography::sha256::hash;
use futures::channel::mpsc;

/// Emitted every time the chain commits a block.
#[derive(Clone, Debug)]
pub struct Notification {
    pub address: Address,
    pub height: u64,
    pub digest: Digest,
    pub view: View,
}

/// In-memory chain that accepts any block extending its head.
pub struct Chain {
    address: Address,
    height: u64,
    head: Digest,
    notifier: mpsc::UnboundedSender<Notification>,
}

impl Chain {
    pub fn new(address: Address, height: u64) -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (notifier, receiver) = mpsc::unbounded();
        (
            Self {
                address,
                height,
                head: hash(&height.to_be_bytes()),
                notifier,
            },
            receiver,
        )
    }
}

impl crate::Chain for Chain {
    type Block = Block;

    fn head(&self) -> (u64, Digest) {
        (self.height, self.head)
    }

    fn verify(&mut self, block: &Block) -> bool {
        block.height() == self.height + 1 && block.parent() == self.head
    }

    fn commit(&mut self, block: Block, certificate: QuorumCertificate) {
        assert_eq!(block.height(), self.height + 1, "committed out of order");
        assert_eq!(block.parent(), self.head, "committed a fork");
        self.height = block.height();
        self.head = block.digest();
        let _ = self.notifier.unbounded_send(Notification {
            address: self.address.clone(),
            height: self.height,
            digest: self.head,
            view: certificate.view,
        });
    }
}
