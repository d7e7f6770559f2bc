//! Static validator set with round-robin proposer selection.

use crate::{
    types::{Address, View},
    Validators,
};
use commonware_utils::quorum;
use std::sync::Arc;

/// Sorted, deduplicated set of validators.
#[derive(Clone, Debug)]
pub struct Committee {
    validators: Arc<Vec<Address>>,
}

impl Committee {
    /// Create a committee from a list of validators.
    ///
    /// # Panics
    ///
    /// Panics if `validators` is empty.
    pub fn new(mut validators: Vec<Address>) -> Self {
        validators.sort();
        validators.dedup();
        assert!(!validators.is_empty(), "committee must not be empty");
        Self {
            validators: Arc::new(validators),
        }
    }

    /// Validators in sorted order.
    pub fn validators(&self) -> &[Address] {
        &self.validators
    }
}

impl Validators for Committee {
    fn get_by_address(&self, address: &Address) -> Option<u32> {
        self.validators
            .binary_search(address)
            .ok()
            .map(|index| index as u32)
    }

    fn proposer(&self, view: View) -> Address {
        let n = self.validators.len() as u64;
        let index = view.sequence.wrapping_add(view.round) % n;
        self.validators[index as usize].clone()
    }

    fn len(&self) -> u32 {
        self.validators.len() as u32
    }

    fn quorum(&self) -> u32 {
        quorum(self.len())
    }
}
