//! The "spin": allocate a prize and issue its coupon as one operation, then
//! tell the respondent what they won when the tenant wants that.

use crate::coupons::CouponIssuer;
use crate::wheel::PrizeWheelAllocator;
use feedback_channels::automation::SkipReason;
use feedback_channels::{AutomationNotifier, NotificationOutcome};
use feedback_core::error::{ensure_tenant, OrchestratorError, OrchestratorResult};
use feedback_core::event_bus::{make_event, noop_sink, EventSink, EventType};
use feedback_core::store::Store;
use feedback_core::types::{Coupon, PrizeSlot, Respondent};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct SpinResult {
    pub slot: PrizeSlot,
    pub coupon: Coupon,
    /// `None` when no message was attempted or the attempt failed.
    #[serde(skip)]
    pub notification: Option<NotificationOutcome>,
}

impl SpinResult {
    pub fn won(&self) -> bool {
        !self.coupon.is_receipt()
    }
}

pub struct RewardOrchestrator {
    store: Arc<dyn Store>,
    allocator: PrizeWheelAllocator,
    issuer: Arc<CouponIssuer>,
    notifier: Option<Arc<AutomationNotifier>>,
    event_sink: Arc<dyn EventSink>,
}

impl RewardOrchestrator {
    pub fn new(store: Arc<dyn Store>, issuer: Arc<CouponIssuer>) -> Self {
        Self {
            allocator: PrizeWheelAllocator::new(store.clone()),
            store,
            issuer,
            notifier: None,
            event_sink: noop_sink(),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<AutomationNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Spin a wheel for a respondent. The coupon is persisted before anything
    /// is reported; if that fails the caller gets the error and no prize.
    pub async fn spin(
        &self,
        tenant_id: Uuid,
        wheel_id: Uuid,
        respondent: &Respondent,
        rng_seed: Option<u64>,
    ) -> OrchestratorResult<SpinResult> {
        let wheel = self
            .store
            .get_wheel(&wheel_id)
            .ok_or_else(|| OrchestratorError::not_found("prize wheel", wheel_id))?;
        ensure_tenant("prize wheel", wheel_id, wheel.tenant_id, tenant_id)?;

        let slot = self.allocator.draw(&wheel, rng_seed)?;
        let coupon = self
            .issuer
            .issue(tenant_id, respondent, &slot, wheel.origin)?;

        self.event_sink.emit(make_event(
            EventType::PrizeAllocated,
            tenant_id,
            wheel.origin.campaign_id(),
            Some(slot.id),
            slot.label.clone(),
        ));
        info!(
            tenant_id = %tenant_id,
            wheel_id = %wheel_id,
            respondent = %respondent.respondent_ref,
            won = !coupon.is_receipt(),
            "Wheel spun"
        );

        let notification = if coupon.is_receipt() {
            None
        } else {
            self.notify_prize(tenant_id, respondent, &coupon).await
        };

        Ok(SpinResult {
            slot,
            coupon,
            notification,
        })
    }

    /// React to a survey score: detractors get the tenant's recovery message.
    pub async fn record_survey_score(
        &self,
        tenant_id: Uuid,
        respondent: &Respondent,
        score: u8,
    ) -> OrchestratorResult<Option<NotificationOutcome>> {
        if score > 10 {
            return Err(OrchestratorError::Validation(format!(
                "survey score must be 0-10, got {score}"
            )));
        }
        let Some(notifier) = &self.notifier else {
            return Ok(None);
        };
        match notifier.notify_detractor(&tenant_id, respondent, score).await {
            Ok(outcome) => Ok(Some(outcome)),
            Err(err) => {
                self.notification_failed(tenant_id, respondent, &err);
                Ok(None)
            }
        }
    }

    async fn notify_prize(
        &self,
        tenant_id: Uuid,
        respondent: &Respondent,
        coupon: &Coupon,
    ) -> Option<NotificationOutcome> {
        let notifier = self.notifier.as_ref()?;
        let prize = coupon.reward_description.as_deref().unwrap_or_default();
        match notifier
            .notify_prize(&tenant_id, respondent, prize, &coupon.code)
            .await
        {
            Ok(outcome) => {
                if let NotificationOutcome::Skipped(reason) = &outcome {
                    if *reason != SkipReason::Disabled {
                        info!(tenant_id = %tenant_id, reason = ?reason, "Prize message skipped");
                    }
                }
                Some(outcome)
            }
            Err(err) => {
                self.notification_failed(tenant_id, respondent, &err);
                None
            }
        }
    }

    fn notification_failed(&self, tenant_id: Uuid, respondent: &Respondent, err: &OrchestratorError) {
        warn!(
            tenant_id = %tenant_id,
            respondent = %respondent.respondent_ref,
            error = %err,
            "Automation message failed"
        );
        self.event_sink.emit(make_event(
            EventType::NotificationFailed,
            tenant_id,
            None,
            None,
            err.to_string(),
        ));
    }
}
