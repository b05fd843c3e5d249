//! Persistence capability consumed by the orchestrator.
//!
//! Implementations must make each call atomic; the orchestrator composes
//! them so that a failed write is never reported as success.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::OrchestratorResult;
use crate::types::{
    Campaign, CampaignLogEntry, CampaignStatus, Coupon, CouponStatus, PrizeWheel, Reward,
};

pub trait CampaignRepository: Send + Sync {
    fn insert_campaign(&self, campaign: Campaign) -> OrchestratorResult<()>;
    fn get_campaign(&self, id: &Uuid) -> Option<Campaign>;
    fn update_campaign(&self, campaign: &Campaign) -> OrchestratorResult<()>;
    /// Remove the campaign and null the campaign reference on its logs.
    fn delete_campaign(&self, id: &Uuid) -> OrchestratorResult<Option<Campaign>>;
    fn campaigns_with_status(&self, statuses: &[CampaignStatus]) -> Vec<Campaign>;
    fn campaigns_for_tenant(&self, tenant_id: &Uuid) -> Vec<Campaign>;
}

pub trait LogRepository: Send + Sync {
    fn append_log(&self, entry: CampaignLogEntry) -> OrchestratorResult<()>;
    fn get_log(&self, id: &Uuid) -> Option<CampaignLogEntry>;
    /// Set `converted_at` if it is still unset. Returns false when the entry
    /// was already converted.
    fn mark_converted(&self, id: &Uuid, converted_at: DateTime<Utc>) -> OrchestratorResult<bool>;
    /// Logs of one campaign in write order.
    fn logs_for_campaign(&self, campaign_id: &Uuid) -> Vec<CampaignLogEntry>;
    /// Logs of one respondent across a tenant, in write order.
    fn logs_for_respondent(&self, tenant_id: &Uuid, respondent_ref: &str) -> Vec<CampaignLogEntry>;
    /// Whether a successful send was already logged for a queue entry.
    fn has_sent_log(&self, queue_entry_id: &Uuid) -> bool;
}

pub trait RewardRepository: Send + Sync {
    fn insert_reward(&self, reward: Reward) -> OrchestratorResult<()>;
    fn get_reward(&self, id: &Uuid) -> Option<Reward>;
    fn update_reward(&self, reward: &Reward) -> OrchestratorResult<()>;
    /// Remove the reward and null every prize slot referencing it. Returns
    /// the number of slots that were nulled.
    fn delete_reward(&self, id: &Uuid) -> OrchestratorResult<usize>;

    fn insert_wheel(&self, wheel: PrizeWheel) -> OrchestratorResult<()>;
    fn get_wheel(&self, id: &Uuid) -> Option<PrizeWheel>;
}

pub trait CouponRepository: Send + Sync {
    /// Insert a new coupon. Fails when the code is already taken.
    fn insert_coupon(&self, coupon: Coupon) -> OrchestratorResult<()>;
    fn get_coupon(&self, id: &Uuid) -> Option<Coupon>;
    fn code_exists(&self, code: &str) -> bool;
    /// Replace the coupon only while its stored status is still `expected`;
    /// otherwise fail with `StateConflict` and leave it untouched. Status
    /// changes go through here so concurrent redeem, cancel and expiry
    /// cannot overwrite each other.
    fn transition_coupon(&self, coupon: &Coupon, expected: CouponStatus) -> OrchestratorResult<()>;
    fn coupons_with_status(&self, status: CouponStatus) -> Vec<Coupon>;
}

/// Everything the orchestrator persists.
pub trait Store: CampaignRepository + LogRepository + RewardRepository + CouponRepository {
    /// Delete every entity owned by a tenant, logs included.
    fn purge_tenant(&self, tenant_id: &Uuid) -> OrchestratorResult<usize>;
}
