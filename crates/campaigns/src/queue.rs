//! Per-campaign FIFO of recipients awaiting dispatch.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use feedback_core::error::{OrchestratorError, OrchestratorResult};
use feedback_core::types::{MessageVariant, Recipient};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: Uuid,
    pub campaign_id: Uuid,
    /// Position in enqueue order, starting at 0.
    pub sequence: u64,
    pub recipient: Recipient,
    pub variant: String,
    /// Transport attempts already made for this entry.
    pub attempts: u32,
    /// Earliest time the entry may be retried.
    pub not_before: Option<DateTime<Utc>>,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct CampaignQueue {
    entries: VecDeque<QueueEntry>,
    next_sequence: u64,
    /// Counts auto-assigned entries only, so hinted entries don't skew the
    /// split.
    split_cursor: u64,
}

#[derive(Default)]
pub struct RecipientQueue {
    queues: DashMap<Uuid, CampaignQueue>,
}

impl RecipientQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a recipient. Without a hint the variant comes from a weighted
    /// round-robin over `variants`, so the same recipient list always yields
    /// the same assignment.
    pub fn enqueue(
        &self,
        campaign_id: Uuid,
        variants: &[MessageVariant],
        recipient: Recipient,
        variant_hint: Option<&str>,
        enqueued_at: DateTime<Utc>,
    ) -> OrchestratorResult<QueueEntry> {
        let mut queue = self.queues.entry(campaign_id).or_default();

        let variant = match variant_hint {
            Some(hint) => variants
                .iter()
                .find(|v| v.key == hint)
                .map(|v| v.key.clone())
                .ok_or_else(|| {
                    OrchestratorError::Validation(format!("unknown variant {hint}"))
                })?,
            None => {
                let picked = pick_variant(variants, queue.split_cursor)?;
                queue.split_cursor += 1;
                picked
            }
        };

        let entry = QueueEntry {
            id: Uuid::new_v4(),
            campaign_id,
            sequence: queue.next_sequence,
            recipient,
            variant,
            attempts: 0,
            not_before: None,
            enqueued_at,
        };
        queue.next_sequence += 1;
        queue.entries.push_back(entry.clone());

        debug!(
            campaign_id = %campaign_id,
            sequence = entry.sequence,
            variant = %entry.variant,
            "Recipient enqueued"
        );
        Ok(entry)
    }

    pub fn dequeue_next(&self, campaign_id: &Uuid) -> Option<QueueEntry> {
        self.queues.get_mut(campaign_id)?.entries.pop_front()
    }

    pub fn peek(&self, campaign_id: &Uuid) -> Option<QueueEntry> {
        self.queues.get(campaign_id)?.entries.front().cloned()
    }

    /// Put an entry back at the head so a retry keeps its FIFO position.
    pub fn requeue_front(&self, entry: QueueEntry) {
        self.queues
            .entry(entry.campaign_id)
            .or_default()
            .entries
            .push_front(entry);
    }

    pub fn len(&self, campaign_id: &Uuid) -> usize {
        self.queues
            .get(campaign_id)
            .map_or(0, |q| q.entries.len())
    }

    pub fn is_empty(&self, campaign_id: &Uuid) -> bool {
        self.len(campaign_id) == 0
    }

    /// Snapshot of pending entries in dispatch order.
    pub fn entries(&self, campaign_id: &Uuid) -> Vec<QueueEntry> {
        self.queues
            .get(campaign_id)
            .map(|q| q.entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop the campaign's queue. Returns how many entries were discarded.
    pub fn discard(&self, campaign_id: &Uuid) -> usize {
        self.queues
            .remove(campaign_id)
            .map_or(0, |(_, q)| q.entries.len())
    }
}

fn pick_variant(variants: &[MessageVariant], cursor: u64) -> OrchestratorResult<String> {
    let total: u64 = variants.iter().map(|v| u64::from(v.weight)).sum();
    if total == 0 {
        return Err(OrchestratorError::Validation(
            "campaign has no weighted variants".into(),
        ));
    }
    let slot = cursor % total;
    let mut cumulative = 0u64;
    for variant in variants {
        cumulative += u64::from(variant.weight);
        if slot < cumulative {
            return Ok(variant.key.clone());
        }
    }
    unreachable!("slot is always below the total weight")
}
