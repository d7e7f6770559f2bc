//! Process-wide table mapping wire codes to [`Phase`]s.
//!
//! The table is written once (the first time any engine starts) and only read afterwards, so
//! lookups never contend.

use crate::types::Phase;
use std::{collections::BTreeMap, sync::OnceLock};

static PHASES: OnceLock<BTreeMap<u64, Phase>> = OnceLock::new();

fn build() -> BTreeMap<u64, Phase> {
    Phase::ALL
        .iter()
        .map(|phase| (phase.code(), *phase))
        .collect()
}

/// Populate the table if it has not been populated yet.
///
/// Safe to call from any number of engines concurrently.
pub fn register() -> &'static BTreeMap<u64, Phase> {
    PHASES.get_or_init(build)
}

/// Resolve a wire code.
pub fn lookup(code: u64) -> Option<Phase> {
    register().get(&code).copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_lookup() {
        for phase in Phase::ALL {
            assert_eq!(lookup(phase.code()), Some(phase));
        }
        assert_eq!(lookup(8), None);
        assert_eq!(lookup(u64::MAX), None);
    }

    #[test]
    fn test_register_concurrent() {
        let handles: Vec<_> = (0..8)
            .map(|_| thread::spawn(|| register() as *const _ as usize))
            .collect();
        let tables: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(tables.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(register().len(), Phase::ALL.len());
    }
}
