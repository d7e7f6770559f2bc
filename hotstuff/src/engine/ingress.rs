use crate::{
    types::{Address, Digest},
    Block, Error,
};
use bytes::Bytes;
use commonware_runtime::Handle as Task;
use futures::{
    channel::{mpsc, oneshot},
    SinkExt,
};
use tracing::error;

/// Requests served by the engine.
pub enum Request<B: Block> {
    Propose(B),
    IsProposer {
        response: oneshot::Sender<bool>,
    },
    IsCurrentProposal {
        digest: Digest,
        response: oneshot::Sender<bool>,
    },
}

/// Handle used to feed a running engine.
#[derive(Clone)]
pub struct Mailbox<B: Block> {
    address: Address,
    requests: mpsc::Sender<Request<B>>,
    messages: mpsc::Sender<(Address, Bytes)>,
    finalized: mpsc::Sender<(u64, Digest)>,
}

impl<B: Block> Mailbox<B> {
    pub(super) fn new(
        address: Address,
        requests: mpsc::Sender<Request<B>>,
        messages: mpsc::Sender<(Address, Bytes)>,
        finalized: mpsc::Sender<(u64, Digest)>,
    ) -> Self {
        Self {
            address,
            requests,
            messages,
            finalized,
        }
    }

    /// Address of the validator the engine runs as.
    pub fn address(&self) -> Address {
        self.address.clone()
    }

    /// Submit a block to propose when this validator is the proposer of its height.
    pub async fn propose(&mut self, block: B) {
        if let Err(err) = self.requests.send(Request::Propose(block)).await {
            error!(?err, "failed to send propose request");
        }
    }

    /// Deliver a message received from `sender`.
    pub async fn message(&mut self, sender: Address, message: Bytes) {
        if let Err(err) = self.messages.send((sender, message)).await {
            error!(?err, "failed to send network message");
        }
    }

    /// Notify the engine that the block at `height` was persisted.
    pub async fn final_committed(&mut self, height: u64, digest: Digest) {
        if let Err(err) = self.finalized.send((height, digest)).await {
            error!(?err, "failed to send finalization");
        }
    }

    /// Whether the engine is the proposer of its current view.
    ///
    /// Returns `None` if the engine is no longer running.
    pub async fn is_proposer(&mut self) -> Option<bool> {
        let (response, receiver) = oneshot::channel();
        if let Err(err) = self.requests.send(Request::IsProposer { response }).await {
            error!(?err, "failed to send proposer query");
            return None;
        }
        receiver.await.ok()
    }

    /// Whether `digest` is the proposal (or pending request) of the current round.
    ///
    /// Returns `None` if the engine is no longer running.
    pub async fn is_current_proposal(&mut self, digest: Digest) -> Option<bool> {
        let (response, receiver) = oneshot::channel();
        if let Err(err) = self
            .requests
            .send(Request::IsCurrentProposal { digest, response })
            .await
        {
            error!(?err, "failed to send proposal query");
            return None;
        }
        receiver.await.ok()
    }
}

/// Handle to a running engine.
pub struct Handle {
    stop: Option<oneshot::Sender<()>>,
    task: Task<Result<(), Error>>,
}

impl Handle {
    pub(super) fn new(stop: oneshot::Sender<()>, task: Task<Result<(), Error>>) -> Self {
        Self {
            stop: Some(stop),
            task,
        }
    }

    /// Stop the engine and wait for it to exit.
    pub async fn stop(mut self) -> Result<(), Error> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.join().await
    }

    /// Wait for the engine to exit.
    pub async fn join(self) -> Result<(), Error> {
        self.task.await?
    }
}
