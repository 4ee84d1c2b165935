//! Per-container mutual exclusion.
//!
//! Veth setup, OVS port creation and flow installation all assume a
//! single in-flight operation per container id. A global lock would
//! serialize unrelated attaches, so ownership is tracked as a set of
//! busy ids guarded by a mutex, with a [`Notify`] standing in for the
//! condition variable: every unlock wakes all waiters, which re-check
//! the set. Fairness is not promised; progress is.

use std::collections::HashSet;
use std::sync::Mutex;

use tokio::sync::Notify;

#[derive(Default)]
pub struct ContainerArbitrator {
    busy: Mutex<HashSet<String>>,
    unlocked: Notify,
}

impl ContainerArbitrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until `container_id` is free and claims it. The returned
    /// guard releases the id on drop, covering every handler exit path.
    pub async fn lock(&self, container_id: &str) -> ContainerGuard<'_> {
        loop {
            // Register with the notifier before checking the set, so an
            // unlock between the check and the await cannot be missed.
            let notified = self.unlocked.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut busy = self.busy.lock().unwrap();
                if busy.insert(container_id.to_owned()) {
                    return ContainerGuard {
                        arbitrator: self,
                        container_id: container_id.to_owned(),
                    };
                }
            }
            notified.await;
        }
    }

    fn unlock(&self, container_id: &str) {
        let mut busy = self.busy.lock().unwrap();
        busy.remove(container_id);
        self.unlocked.notify_waiters();
    }
}

pub struct ContainerGuard<'a> {
    arbitrator: &'a ContainerArbitrator,
    container_id: String,
}

impl Drop for ContainerGuard<'_> {
    fn drop(&mut self) {
        self.arbitrator.unlock(&self.container_id);
    }
}
