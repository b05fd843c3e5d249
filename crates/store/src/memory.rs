//! In-process store backed by DashMap for concurrent access from ticks and
//! reward requests. Stands in for the relational database in development and
//! tests; fault injection lets tests exercise write failures.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use feedback_core::error::{OrchestratorError, OrchestratorResult};
use feedback_core::store::{
    CampaignRepository, CouponRepository, LogRepository, RewardRepository, Store,
};
use feedback_core::types::{
    Campaign, CampaignLogEntry, CampaignStatus, Coupon, CouponStatus, PrizeWheel, Reward,
};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::{debug, info};
use uuid::Uuid;

struct LogRow {
    seq: u64,
    entry: CampaignLogEntry,
}

#[derive(Default)]
struct FaultPlan {
    log_appends: AtomicU32,
    log_conversions: AtomicU32,
    coupon_inserts: AtomicU32,
}

impl FaultPlan {
    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[derive(Default)]
pub struct InMemoryStore {
    campaigns: DashMap<Uuid, Campaign>,
    logs: DashMap<Uuid, LogRow>,
    log_seq: AtomicU64,
    /// Queue entry id -> id of the log recording its successful send.
    sent_entries: DashMap<Uuid, Uuid>,
    rewards: DashMap<Uuid, Reward>,
    wheels: DashMap<Uuid, PrizeWheel>,
    coupons: DashMap<Uuid, Coupon>,
    coupon_codes: DashMap<String, Uuid>,
    faults: FaultPlan,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` log appends fail with a persistence error.
    pub fn fail_next_log_appends(&self, n: u32) {
        self.faults.log_appends.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` conversion marks fail with a persistence error.
    pub fn fail_next_mark_converted(&self, n: u32) {
        self.faults.log_conversions.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` coupon inserts fail with a persistence error.
    pub fn fail_next_coupon_inserts(&self, n: u32) {
        self.faults.coupon_inserts.store(n, Ordering::SeqCst);
    }

    pub fn log_count(&self) -> usize {
        self.logs.len()
    }

    pub fn coupon_count(&self) -> usize {
        self.coupons.len()
    }

    fn sorted_logs(&self, filter: impl Fn(&CampaignLogEntry) -> bool) -> Vec<CampaignLogEntry> {
        let mut rows: Vec<(u64, CampaignLogEntry)> = self
            .logs
            .iter()
            .filter(|row| filter(&row.entry))
            .map(|row| (row.seq, row.entry.clone()))
            .collect();
        rows.sort_by_key(|(seq, _)| *seq);
        rows.into_iter().map(|(_, entry)| entry).collect()
    }
}

impl CampaignRepository for InMemoryStore {
    fn insert_campaign(&self, campaign: Campaign) -> OrchestratorResult<()> {
        if self.campaigns.contains_key(&campaign.id) {
            return Err(OrchestratorError::Persistence(format!(
                "campaign {} already exists",
                campaign.id
            )));
        }
        self.campaigns.insert(campaign.id, campaign);
        Ok(())
    }

    fn get_campaign(&self, id: &Uuid) -> Option<Campaign> {
        self.campaigns.get(id).map(|c| c.clone())
    }

    fn update_campaign(&self, campaign: &Campaign) -> OrchestratorResult<()> {
        let mut entry = self
            .campaigns
            .get_mut(&campaign.id)
            .ok_or_else(|| OrchestratorError::not_found("campaign", campaign.id))?;
        *entry = campaign.clone();
        Ok(())
    }

    fn delete_campaign(&self, id: &Uuid) -> OrchestratorResult<Option<Campaign>> {
        let removed = self.campaigns.remove(id).map(|(_, c)| c);
        if removed.is_some() {
            let mut detached = 0usize;
            for mut row in self.logs.iter_mut() {
                if row.entry.campaign_id == Some(*id) {
                    row.entry.campaign_id = None;
                    detached += 1;
                }
            }
            debug!(campaign_id = %id, detached, "Campaign deleted, logs detached");
        }
        Ok(removed)
    }

    fn campaigns_with_status(&self, statuses: &[CampaignStatus]) -> Vec<Campaign> {
        self.campaigns
            .iter()
            .filter(|c| statuses.contains(&c.status))
            .map(|c| c.value().clone())
            .collect()
    }

    fn campaigns_for_tenant(&self, tenant_id: &Uuid) -> Vec<Campaign> {
        self.campaigns
            .iter()
            .filter(|c| c.tenant_id == *tenant_id)
            .map(|c| c.value().clone())
            .collect()
    }
}

impl LogRepository for InMemoryStore {
    fn append_log(&self, entry: CampaignLogEntry) -> OrchestratorResult<()> {
        if FaultPlan::take(&self.faults.log_appends) {
            metrics::counter!("store.injected_faults", "op" => "append_log").increment(1);
            return Err(OrchestratorError::Persistence(
                "log append rejected (injected fault)".into(),
            ));
        }
        let seq = self.log_seq.fetch_add(1, Ordering::SeqCst);
        if entry.outcome.is_sent() {
            self.sent_entries.insert(entry.queue_entry_id, entry.id);
        }
        self.logs.insert(entry.id, LogRow { seq, entry });
        Ok(())
    }

    fn get_log(&self, id: &Uuid) -> Option<CampaignLogEntry> {
        self.logs.get(id).map(|row| row.entry.clone())
    }

    fn mark_converted(&self, id: &Uuid, converted_at: DateTime<Utc>) -> OrchestratorResult<bool> {
        if FaultPlan::take(&self.faults.log_conversions) {
            metrics::counter!("store.injected_faults", "op" => "mark_converted").increment(1);
            return Err(OrchestratorError::Persistence(
                "conversion mark rejected (injected fault)".into(),
            ));
        }
        let mut row = self
            .logs
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::not_found("log entry", *id))?;
        if row.entry.converted_at.is_some() {
            return Ok(false);
        }
        row.entry.converted_at = Some(converted_at);
        Ok(true)
    }

    fn logs_for_campaign(&self, campaign_id: &Uuid) -> Vec<CampaignLogEntry> {
        self.sorted_logs(|e| e.campaign_id == Some(*campaign_id))
    }

    fn logs_for_respondent(&self, tenant_id: &Uuid, respondent_ref: &str) -> Vec<CampaignLogEntry> {
        self.sorted_logs(|e| e.tenant_id == *tenant_id && e.recipient.respondent_ref == respondent_ref)
    }

    fn has_sent_log(&self, queue_entry_id: &Uuid) -> bool {
        self.sent_entries.contains_key(queue_entry_id)
    }
}

impl RewardRepository for InMemoryStore {
    fn insert_reward(&self, reward: Reward) -> OrchestratorResult<()> {
        self.rewards.insert(reward.id, reward);
        Ok(())
    }

    fn get_reward(&self, id: &Uuid) -> Option<Reward> {
        self.rewards.get(id).map(|r| r.clone())
    }

    fn update_reward(&self, reward: &Reward) -> OrchestratorResult<()> {
        let mut entry = self
            .rewards
            .get_mut(&reward.id)
            .ok_or_else(|| OrchestratorError::not_found("reward", reward.id))?;
        *entry = reward.clone();
        Ok(())
    }

    fn delete_reward(&self, id: &Uuid) -> OrchestratorResult<usize> {
        if self.rewards.remove(id).is_none() {
            return Err(OrchestratorError::not_found("reward", *id));
        }
        let mut nulled = 0usize;
        for mut wheel in self.wheels.iter_mut() {
            for slot in wheel.slots.iter_mut().filter(|s| s.reward_id == Some(*id)) {
                slot.reward_id = None;
                nulled += 1;
            }
        }
        Ok(nulled)
    }

    fn insert_wheel(&self, wheel: PrizeWheel) -> OrchestratorResult<()> {
        self.wheels.insert(wheel.id, wheel);
        Ok(())
    }

    fn get_wheel(&self, id: &Uuid) -> Option<PrizeWheel> {
        self.wheels.get(id).map(|w| w.clone())
    }
}

impl CouponRepository for InMemoryStore {
    fn insert_coupon(&self, coupon: Coupon) -> OrchestratorResult<()> {
        if FaultPlan::take(&self.faults.coupon_inserts) {
            metrics::counter!("store.injected_faults", "op" => "insert_coupon").increment(1);
            return Err(OrchestratorError::Persistence(
                "coupon insert rejected (injected fault)".into(),
            ));
        }
        match self.coupon_codes.entry(coupon.code.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(OrchestratorError::Persistence(
                format!("coupon code {} already exists", coupon.code),
            )),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(coupon.id);
                self.coupons.insert(coupon.id, coupon);
                Ok(())
            }
        }
    }

    fn get_coupon(&self, id: &Uuid) -> Option<Coupon> {
        self.coupons.get(id).map(|c| c.clone())
    }

    fn code_exists(&self, code: &str) -> bool {
        self.coupon_codes.contains_key(code)
    }

    fn transition_coupon(&self, coupon: &Coupon, expected: CouponStatus) -> OrchestratorResult<()> {
        let mut entry = self
            .coupons
            .get_mut(&coupon.id)
            .ok_or_else(|| OrchestratorError::not_found("coupon", coupon.id))?;
        if entry.status != expected {
            return Err(OrchestratorError::StateConflict(format!(
                "coupon {} is {:?}, expected {:?}",
                entry.code, entry.status, expected
            )));
        }
        *entry = coupon.clone();
        Ok(())
    }

    fn coupons_with_status(&self, status: CouponStatus) -> Vec<Coupon> {
        self.coupons
            .iter()
            .filter(|c| c.status == status)
            .map(|c| c.value().clone())
            .collect()
    }
}

impl Store for InMemoryStore {
    fn purge_tenant(&self, tenant_id: &Uuid) -> OrchestratorResult<usize> {
        let before = self.campaigns.len()
            + self.logs.len()
            + self.rewards.len()
            + self.wheels.len()
            + self.coupons.len();

        self.campaigns.retain(|_, c| c.tenant_id != *tenant_id);
        self.logs.retain(|_, row| row.entry.tenant_id != *tenant_id);
        self.sent_entries
            .retain(|_, log_id| self.logs.contains_key(log_id));
        self.rewards.retain(|_, r| r.tenant_id != *tenant_id);
        self.wheels.retain(|_, w| w.tenant_id != *tenant_id);
        self.coupons.retain(|_, c| c.tenant_id != *tenant_id);
        self.coupon_codes
            .retain(|_, id| self.coupons.contains_key(id));

        let after = self.campaigns.len()
            + self.logs.len()
            + self.rewards.len()
            + self.wheels.len()
            + self.coupons.len();
        let removed = before - after;
        info!(tenant_id = %tenant_id, removed, "Tenant data purged");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use feedback_core::types::{DeliveryOutcome, MessageVariant, Origin, PrizeSlot, Recipient, Respondent, RewardValue};

    fn campaign(tenant_id: Uuid) -> Campaign {
        let now = Utc::now();
        Campaign {
            id: Uuid::new_v4(),
            tenant_id,
            name: "c".into(),
            status: CampaignStatus::Running,
            start_date: None,
            end_date: None,
            message_delay_seconds: 0,
            variants: vec![MessageVariant::new("a", "hi", 1)],
            created_at: now,
            updated_at: now,
        }
    }

    fn log(tenant_id: Uuid, campaign_id: Uuid, who: &str) -> CampaignLogEntry {
        CampaignLogEntry {
            id: Uuid::new_v4(),
            tenant_id,
            campaign_id: Some(campaign_id),
            queue_entry_id: Uuid::new_v4(),
            recipient: Recipient::new(who, who, "5511999990000"),
            variant: "a".into(),
            sent_at: Utc::now(),
            outcome: DeliveryOutcome::Sent {
                provider_message_id: "m".into(),
            },
            attempt: 1,
            retry_count: 0,
            converted_at: None,
        }
    }

    fn coupon(tenant_id: Uuid, code: &str) -> Coupon {
        Coupon {
            id: Uuid::new_v4(),
            tenant_id,
            code: code.into(),
            reward_id: None,
            reward_description: None,
            respondent: Respondent::new("r-1", "Ana"),
            origin: Origin::Campaign {
                campaign_id: Uuid::new_v4(),
            },
            wheel_id: None,
            slot_id: None,
            status: CouponStatus::Issued,
            cancellation_reason: None,
            issued_at: Utc::now(),
            used_at: None,
            expires_at: None,
            cancelled_at: None,
        }
    }

    #[test]
    fn test_logs_keep_write_order() {
        let store = InMemoryStore::new();
        let tenant = Uuid::new_v4();
        let c = campaign(tenant);
        let ids: Vec<Uuid> = (0..20)
            .map(|i| {
                let entry = log(tenant, c.id, &format!("r-{i}"));
                let id = entry.id;
                store.append_log(entry).unwrap();
                id
            })
            .collect();
        let stored: Vec<Uuid> = store.logs_for_campaign(&c.id).iter().map(|e| e.id).collect();
        assert_eq!(stored, ids);
    }

    #[test]
    fn test_delete_campaign_detaches_logs() {
        let store = InMemoryStore::new();
        let tenant = Uuid::new_v4();
        let c = campaign(tenant);
        store.insert_campaign(c.clone()).unwrap();
        let entry = log(tenant, c.id, "r-1");
        let log_id = entry.id;
        store.append_log(entry).unwrap();

        assert!(store.delete_campaign(&c.id).unwrap().is_some());
        assert!(store.get_campaign(&c.id).is_none());
        assert_eq!(store.get_log(&log_id).unwrap().campaign_id, None);
    }

    #[test]
    fn test_mark_converted_only_once() {
        let store = InMemoryStore::new();
        let tenant = Uuid::new_v4();
        let entry = log(tenant, Uuid::new_v4(), "r-1");
        let id = entry.id;
        store.append_log(entry).unwrap();

        let first = Utc::now();
        assert!(store.mark_converted(&id, first).unwrap());
        assert!(!store.mark_converted(&id, Utc::now()).unwrap());
        assert_eq!(store.get_log(&id).unwrap().converted_at, Some(first));
    }

    #[test]
    fn test_injected_log_fault_is_consumed() {
        let store = InMemoryStore::new();
        let tenant = Uuid::new_v4();
        store.fail_next_log_appends(1);
        assert!(store.append_log(log(tenant, Uuid::new_v4(), "a")).is_err());
        assert!(store.append_log(log(tenant, Uuid::new_v4(), "a")).is_ok());
        assert_eq!(store.log_count(), 1);
    }

    #[test]
    fn test_duplicate_coupon_code_rejected() {
        let store = InMemoryStore::new();
        let tenant = Uuid::new_v4();
        store.insert_coupon(coupon(tenant, "ABCD2345")).unwrap();
        assert!(store.code_exists("ABCD2345"));
        assert!(matches!(
            store.insert_coupon(coupon(tenant, "ABCD2345")),
            Err(OrchestratorError::Persistence(_))
        ));
    }

    #[test]
    fn test_delete_reward_nulls_slots() {
        let store = InMemoryStore::new();
        let tenant = Uuid::new_v4();
        let now = Utc::now();
        let reward = Reward {
            id: Uuid::new_v4(),
            tenant_id: tenant,
            name: "Coffee".into(),
            value: RewardValue::Descriptive {
                text: "one espresso".into(),
            },
            condition: None,
            created_at: now,
            updated_at: now,
        };
        let wheel_id = Uuid::new_v4();
        store.insert_reward(reward.clone()).unwrap();
        store
            .insert_wheel(PrizeWheel {
                id: wheel_id,
                tenant_id: tenant,
                name: "w".into(),
                origin: Origin::Survey {
                    survey_id: Uuid::new_v4(),
                    campaign_id: None,
                },
                slots: vec![PrizeSlot {
                    id: Uuid::new_v4(),
                    wheel_id,
                    label: "Coffee".into(),
                    reward_id: Some(reward.id),
                    is_no_prize_option: false,
                    weight: 3,
                    active: true,
                }],
                created_at: now,
            })
            .unwrap();

        assert_eq!(store.delete_reward(&reward.id).unwrap(), 1);
        let wheel = store.get_wheel(&wheel_id).unwrap();
        assert_eq!(wheel.slots.len(), 1);
        assert_eq!(wheel.slots[0].reward_id, None);
    }

    #[test]
    fn test_purge_tenant_cascades() {
        let store = InMemoryStore::new();
        let tenant = Uuid::new_v4();
        let other = Uuid::new_v4();
        let c = campaign(tenant);
        store.insert_campaign(c.clone()).unwrap();
        store.insert_campaign(campaign(other)).unwrap();
        store.append_log(log(tenant, c.id, "r-1")).unwrap();
        store.insert_coupon(coupon(tenant, "AAAA2222")).unwrap();

        assert_eq!(store.purge_tenant(&tenant).unwrap(), 3);
        assert_eq!(store.campaigns_for_tenant(&other).len(), 1);
        assert!(!store.code_exists("AAAA2222"));
    }

    #[test]
    fn test_sent_index_tracks_appends_and_purge() {
        let store = InMemoryStore::new();
        let tenant = Uuid::new_v4();
        let sent = log(tenant, Uuid::new_v4(), "r-1");
        let mut failed = log(tenant, Uuid::new_v4(), "r-2");
        failed.outcome = DeliveryOutcome::Failed {
            reason: "timeout".into(),
        };
        let (sent_entry, failed_entry) = (sent.queue_entry_id, failed.queue_entry_id);
        store.append_log(sent).unwrap();
        store.append_log(failed).unwrap();

        assert!(store.has_sent_log(&sent_entry));
        assert!(!store.has_sent_log(&failed_entry));
        store.purge_tenant(&tenant).unwrap();
        assert!(!store.has_sent_log(&sent_entry));
    }

    #[test]
    fn test_transition_coupon_checks_status() {
        let store = InMemoryStore::new();
        let issued = coupon(Uuid::new_v4(), "BBBB3333");
        store.insert_coupon(issued.clone()).unwrap();

        let mut used = issued.clone();
        used.status = CouponStatus::Used;
        store.transition_coupon(&used, CouponStatus::Issued).unwrap();

        // A sweep working from the old snapshot must not clobber the redemption.
        let mut expired = issued;
        expired.status = CouponStatus::Expired;
        assert!(matches!(
            store.transition_coupon(&expired, CouponStatus::Issued),
            Err(OrchestratorError::StateConflict(_))
        ));
        assert_eq!(store.get_coupon(&used.id).unwrap().status, CouponStatus::Used);
    }

    #[test]
    fn test_concurrent_transitions_have_one_winner() {
        let store = InMemoryStore::new();
        let issued = coupon(Uuid::new_v4(), "CCCC4444");
        store.insert_coupon(issued.clone()).unwrap();
        let barrier = std::sync::Barrier::new(8);
        let (store, barrier) = (&store, &barrier);

        let wins = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let mut used = issued.clone();
                    used.status = CouponStatus::Used;
                    scope.spawn(move || {
                        barrier.wait();
                        store.transition_coupon(&used, CouponStatus::Issued).is_ok()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|won| *won)
                .count()
        });
        assert_eq!(wins, 1);
    }

    #[test]
    fn test_injected_conversion_fault_is_consumed() {
        let store = InMemoryStore::new();
        let entry = log(Uuid::new_v4(), Uuid::new_v4(), "r-1");
        let id = entry.id;
        store.append_log(entry).unwrap();
        store.fail_next_mark_converted(1);
        assert!(store.mark_converted(&id, Utc::now()).is_err());
        assert!(store.mark_converted(&id, Utc::now()).unwrap());
    }
}
