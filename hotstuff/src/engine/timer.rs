use crate::types::View;
use commonware_runtime::Clock;
use futures::future;
use std::time::SystemTime;

/// Single-shot round deadline.
///
/// At most one deadline is armed at a time. The event loop waits on it with the runtime clock
/// and reports the view it was armed for, so expiries for views that were already left can be
/// discarded.
#[derive(Default)]
pub struct Timer {
    deadline: Option<(View, SystemTime)>,
}

impl Timer {
    /// Replace any armed deadline with one for `view`.
    pub fn reset(&mut self, view: View, deadline: SystemTime) {
        self.deadline = Some((view, deadline));
    }

    /// Disarm the timer.
    pub fn stop(&mut self) {
        self.deadline = None;
    }

    pub fn deadline(&self) -> Option<(View, SystemTime)> {
        self.deadline
    }
}

/// Resolve with the armed view once `deadline` passes. Never resolves if nothing is armed.
pub async fn wait<E: Clock>(context: &E, deadline: Option<(View, SystemTime)>) -> View {
    match deadline {
        Some((view, deadline)) => {
            context.sleep_until(deadline).await;
            view
        }
        None => future::pending().await,
    }
}
