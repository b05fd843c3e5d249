//! Tenant-scoped management of rewards and prize wheels.

use feedback_core::clock::Clock;
use feedback_core::error::{ensure_tenant, OrchestratorError, OrchestratorResult};
use feedback_core::store::Store;
use feedback_core::types::{Origin, PrizeSlot, PrizeWheel, Reward, RewardValue};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Operator input for creating or editing a reward.
#[derive(Debug, Clone, Deserialize)]
pub struct RewardDraft {
    pub name: String,
    pub value: RewardValue,
    #[serde(default)]
    pub condition: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SlotDraft {
    pub label: String,
    #[serde(default)]
    pub reward_id: Option<Uuid>,
    #[serde(default)]
    pub is_no_prize_option: bool,
    pub weight: u32,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct WheelDraft {
    pub name: String,
    pub origin: Origin,
    pub slots: Vec<SlotDraft>,
}

pub struct RewardCatalog {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl RewardCatalog {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn create_reward(&self, tenant_id: Uuid, draft: RewardDraft) -> OrchestratorResult<Reward> {
        validate_reward(&draft)?;
        let now = self.clock.now();
        let reward = Reward {
            id: Uuid::new_v4(),
            tenant_id,
            name: draft.name.trim().to_string(),
            value: draft.value,
            condition: draft.condition,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_reward(reward.clone())?;
        info!(tenant_id = %tenant_id, reward_id = %reward.id, name = %reward.name, "Reward created");
        Ok(reward)
    }

    pub fn get_reward(&self, tenant_id: Uuid, reward_id: Uuid) -> OrchestratorResult<Reward> {
        let reward = self
            .store
            .get_reward(&reward_id)
            .ok_or_else(|| OrchestratorError::not_found("reward", reward_id))?;
        ensure_tenant("reward", reward_id, reward.tenant_id, tenant_id)?;
        Ok(reward)
    }

    /// Edit a reward. Coupons already issued keep their description.
    pub fn update_reward(
        &self,
        tenant_id: Uuid,
        reward_id: Uuid,
        draft: RewardDraft,
    ) -> OrchestratorResult<Reward> {
        validate_reward(&draft)?;
        let mut reward = self.get_reward(tenant_id, reward_id)?;
        reward.name = draft.name.trim().to_string();
        reward.value = draft.value;
        reward.condition = draft.condition;
        reward.updated_at = self.clock.now();
        self.store.update_reward(&reward)?;
        info!(tenant_id = %tenant_id, reward_id = %reward_id, "Reward updated");
        Ok(reward)
    }

    /// Delete a reward; slots that pointed at it become no-prize slots.
    /// Returns how many slots were detached.
    pub fn delete_reward(&self, tenant_id: Uuid, reward_id: Uuid) -> OrchestratorResult<usize> {
        self.get_reward(tenant_id, reward_id)?;
        let detached = self.store.delete_reward(&reward_id)?;
        if detached > 0 {
            warn!(
                tenant_id = %tenant_id,
                reward_id = %reward_id,
                detached,
                "Deleted reward was still on prize wheels"
            );
        }
        info!(tenant_id = %tenant_id, reward_id = %reward_id, "Reward deleted");
        Ok(detached)
    }

    pub fn create_wheel(&self, tenant_id: Uuid, draft: WheelDraft) -> OrchestratorResult<PrizeWheel> {
        if draft.name.trim().is_empty() {
            return Err(OrchestratorError::Validation(
                "wheel name must not be empty".into(),
            ));
        }
        if draft.slots.is_empty() {
            return Err(OrchestratorError::Validation(
                "wheel needs at least one slot".into(),
            ));
        }

        let wheel_id = Uuid::new_v4();
        let mut slots = Vec::with_capacity(draft.slots.len());
        for slot in draft.slots {
            self.validate_slot(tenant_id, &slot)?;
            slots.push(PrizeSlot {
                id: Uuid::new_v4(),
                wheel_id,
                label: slot.label,
                reward_id: slot.reward_id,
                is_no_prize_option: slot.is_no_prize_option,
                weight: slot.weight,
                active: slot.active,
            });
        }

        let wheel = PrizeWheel {
            id: wheel_id,
            tenant_id,
            name: draft.name,
            origin: draft.origin,
            slots,
            created_at: self.clock.now(),
        };
        let active_weight: u64 = wheel
            .slots
            .iter()
            .filter(|s| s.active)
            .map(|s| u64::from(s.weight))
            .sum();
        if active_weight == 0 {
            warn!(tenant_id = %tenant_id, wheel_id = %wheel_id, "Wheel has no active weight; spins will fail");
        }
        self.store.insert_wheel(wheel.clone())?;
        info!(
            tenant_id = %tenant_id,
            wheel_id = %wheel_id,
            slots = wheel.slots.len(),
            "Prize wheel created"
        );
        Ok(wheel)
    }

    pub fn get_wheel(&self, tenant_id: Uuid, wheel_id: Uuid) -> OrchestratorResult<PrizeWheel> {
        let wheel = self
            .store
            .get_wheel(&wheel_id)
            .ok_or_else(|| OrchestratorError::not_found("prize wheel", wheel_id))?;
        ensure_tenant("prize wheel", wheel_id, wheel.tenant_id, tenant_id)?;
        Ok(wheel)
    }

    fn validate_slot(&self, tenant_id: Uuid, slot: &SlotDraft) -> OrchestratorResult<()> {
        if slot.label.trim().is_empty() {
            return Err(OrchestratorError::Validation(
                "slot label must not be empty".into(),
            ));
        }
        match (slot.is_no_prize_option, slot.reward_id) {
            (true, Some(_)) => Err(OrchestratorError::Validation(format!(
                "no-prize slot {} must not reference a reward",
                slot.label
            ))),
            (false, None) => Err(OrchestratorError::Validation(format!(
                "slot {} needs a reward or the no-prize flag",
                slot.label
            ))),
            (false, Some(reward_id)) => self.get_reward(tenant_id, reward_id).map(|_| ()),
            (true, None) => Ok(()),
        }
    }
}

fn validate_reward(draft: &RewardDraft) -> OrchestratorResult<()> {
    if draft.name.trim().is_empty() {
        return Err(OrchestratorError::Validation(
            "reward name must not be empty".into(),
        ));
    }
    match &draft.value {
        RewardValue::Monetary {
            amount_cents,
            currency,
        } => {
            if *amount_cents <= 0 {
                return Err(OrchestratorError::Validation(
                    "monetary reward must be positive".into(),
                ));
            }
            if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_uppercase()) {
                return Err(OrchestratorError::Validation(format!(
                    "invalid currency code {currency}"
                )));
            }
        }
        RewardValue::Percentage { percent } => {
            if !(1..=100).contains(percent) {
                return Err(OrchestratorError::Validation(format!(
                    "percentage must be between 1 and 100, got {percent}"
                )));
            }
        }
        RewardValue::Descriptive { text } => {
            if text.trim().is_empty() {
                return Err(OrchestratorError::Validation(
                    "descriptive reward needs a text".into(),
                ));
            }
        }
    }
    Ok(())
}
