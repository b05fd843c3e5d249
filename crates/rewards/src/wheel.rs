//! Prize wheel allocation: one weighted draw over a wheel's active slots.

use feedback_core::error::{ensure_tenant, OrchestratorError, OrchestratorResult};
use feedback_core::store::Store;
use feedback_core::types::{PrizeSlot, PrizeWheel};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

pub struct PrizeWheelAllocator {
    store: Arc<dyn Store>,
}

impl PrizeWheelAllocator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Pick a slot of the wheel. A seed makes the draw reproducible; without
    /// one the generator is seeded from entropy.
    pub fn allocate(
        &self,
        tenant_id: Uuid,
        wheel_id: Uuid,
        rng_seed: Option<u64>,
    ) -> OrchestratorResult<PrizeSlot> {
        let wheel = self
            .store
            .get_wheel(&wheel_id)
            .ok_or_else(|| OrchestratorError::not_found("prize wheel", wheel_id))?;
        ensure_tenant("prize wheel", wheel_id, wheel.tenant_id, tenant_id)?;
        self.draw(&wheel, rng_seed)
    }

    /// Draw from an already loaded wheel.
    pub fn draw(&self, wheel: &PrizeWheel, rng_seed: Option<u64>) -> OrchestratorResult<PrizeSlot> {
        let mut rng = match rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let slot = select_slot(&wheel.slots, &mut rng)?.clone();

        metrics::counter!("rewards.allocations", "no_prize" => slot.is_no_prize().to_string())
            .increment(1);
        debug!(
            tenant_id = %wheel.tenant_id,
            wheel_id = %wheel.id,
            slot_id = %slot.id,
            label = %slot.label,
            no_prize = slot.is_no_prize(),
            "Prize slot allocated"
        );
        Ok(slot)
    }
}

/// Uniform draw in `[0, total)` over the cumulative weights of the active
/// slots; the first slot whose running total exceeds the draw wins.
pub fn select_slot<'a, R: Rng + ?Sized>(
    slots: &'a [PrizeSlot],
    rng: &mut R,
) -> OrchestratorResult<&'a PrizeSlot> {
    let total: u64 = slots
        .iter()
        .filter(|s| s.active)
        .map(|s| u64::from(s.weight))
        .sum();
    if total == 0 {
        return Err(OrchestratorError::InvalidWheelConfiguration(
            "active slots have zero total weight".into(),
        ));
    }

    let draw = rng.gen_range(0..total);
    let mut cumulative = 0u64;
    for slot in slots.iter().filter(|s| s.active) {
        cumulative += u64::from(slot.weight);
        if draw < cumulative {
            return Ok(slot);
        }
    }
    Err(OrchestratorError::InvalidWheelConfiguration(
        "draw fell outside the wheel".into(),
    ))
}
