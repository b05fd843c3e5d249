//! Per-campaign mutual exclusion. Ticks and state changes for the same
//! campaign are serialized; different campaigns never contend.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

pub trait CampaignLockProvider: Send + Sync {
    fn lock_for(&self, campaign_id: &Uuid) -> Arc<Mutex<()>>;
    /// Forget the lock of a campaign that will not tick again.
    fn release(&self, campaign_id: &Uuid);
}

/// Locks held in process memory; enough for a single dispatcher node.
#[derive(Default)]
pub struct InProcessLocks {
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl InProcessLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl CampaignLockProvider for InProcessLocks {
    fn lock_for(&self, campaign_id: &Uuid) -> Arc<Mutex<()>> {
        self.locks
            .entry(*campaign_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn release(&self, campaign_id: &Uuid) {
        self.locks.remove(campaign_id);
    }
}
