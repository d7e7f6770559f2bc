//! Messages received for views the engine has not reached yet.

use crate::types::{Address, Message, View};
use std::collections::{BTreeMap, HashMap};

/// Per-sender, view-ordered store of future messages.
pub struct Backlog {
    max_per_sender: usize,
    next: u64,
    senders: HashMap<Address, BTreeMap<(View, u64), Message>>,
}

impl Backlog {
    pub fn new(max_per_sender: usize) -> Self {
        Self {
            max_per_sender,
            next: 0,
            senders: HashMap::new(),
        }
    }

    /// Store `message` from `sender` if it is for a view after `current`.
    ///
    /// When the sender's queue is full, the entry furthest in the future is evicted if
    /// `message` is nearer. Returns whether `message` was stored.
    pub fn store(&mut self, sender: Address, message: Message, current: View) -> bool {
        if message.view <= current {
            return false;
        }
        let queue = self.senders.entry(sender).or_default();
        if queue.len() >= self.max_per_sender {
            let Some((&(furthest, _), _)) = queue.last_key_value() else {
                return false;
            };
            if message.view >= furthest {
                return false;
            }
            queue.pop_last();
        }
        queue.insert((message.view, self.next), message);
        self.next += 1;
        true
    }

    /// Remove and return all messages with a view at or before `current`, oldest view first.
    ///
    /// Messages for the same view keep their arrival order.
    pub fn ready(&mut self, current: View) -> Vec<(Address, Message)> {
        let mut ready = Vec::new();
        self.senders.retain(|sender, queue| {
            while let Some(entry) = queue.first_entry() {
                if entry.key().0 > current {
                    break;
                }
                let (key, message) = entry.remove_entry();
                ready.push((key, sender.clone(), message));
            }
            !queue.is_empty()
        });
        ready.sort_by_key(|(key, _, _)| *key);
        ready
            .into_iter()
            .map(|(_, sender, message)| (sender, message))
            .collect()
    }

    /// Drop all messages for sequences at or below `height`.
    pub fn prune(&mut self, height: u64) {
        self.senders.retain(|_, queue| {
            queue.retain(|(view, _), _| view.sequence > height);
            !queue.is_empty()
        });
    }

    /// Number of stored messages.
    pub fn len(&self) -> usize {
        self.senders.values().map(BTreeMap::len).sum()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }
}
