//! Coupon issuing, cancellation and expiry.

use chrono::{DateTime, Duration, Utc};
use feedback_core::clock::Clock;
use feedback_core::config::RewardsConfig;
use feedback_core::error::{ensure_tenant, OrchestratorError, OrchestratorResult};
use feedback_core::event_bus::{make_event, noop_sink, EventSink, EventType};
use feedback_core::store::Store;
use feedback_core::types::{Coupon, CouponStatus, Origin, PrizeSlot, Respondent};
use rand::Rng;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Uppercase letters and digits without the easily confused 0/O and 1/I.
pub const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

const MAX_CODE_ATTEMPTS: usize = 8;

pub struct CouponIssuer {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    code_length: usize,
    validity: Option<Duration>,
    event_sink: Arc<dyn EventSink>,
}

impl CouponIssuer {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, config: &RewardsConfig) -> Self {
        Self {
            store,
            clock,
            code_length: config.coupon_code_length.max(4),
            validity: config
                .coupon_validity_days
                .map(|days| Duration::days(i64::from(days))),
            event_sink: noop_sink(),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Persist a coupon for an allocated slot. A no-prize slot yields a
    /// receipt: it carries no reward and can never be redeemed.
    pub fn issue(
        &self,
        tenant_id: Uuid,
        respondent: &Respondent,
        slot: &PrizeSlot,
        origin: Origin,
    ) -> OrchestratorResult<Coupon> {
        let now = self.clock.now();
        let (reward_id, reward_description, expires_at) = if slot.is_no_prize() {
            (None, None, None)
        } else {
            let reward_id = slot.reward_id.ok_or_else(|| {
                OrchestratorError::Validation(format!("slot {} has no reward", slot.id))
            })?;
            let reward = self
                .store
                .get_reward(&reward_id)
                .ok_or_else(|| OrchestratorError::not_found("reward", reward_id))?;
            ensure_tenant("reward", reward_id, reward.tenant_id, tenant_id)?;
            (
                Some(reward_id),
                Some(reward.description()),
                self.validity.map(|v| now + v),
            )
        };

        let coupon = Coupon {
            id: Uuid::new_v4(),
            tenant_id,
            code: self.unique_code()?,
            reward_id,
            reward_description,
            respondent: respondent.clone(),
            origin,
            wheel_id: Some(slot.wheel_id),
            slot_id: Some(slot.id),
            status: CouponStatus::Issued,
            cancellation_reason: None,
            issued_at: now,
            used_at: None,
            expires_at,
            cancelled_at: None,
        };
        self.store.insert_coupon(coupon.clone())?;

        metrics::counter!("rewards.coupons_issued", "receipt" => coupon.is_receipt().to_string())
            .increment(1);
        info!(
            tenant_id = %tenant_id,
            coupon_id = %coupon.id,
            respondent = %respondent.respondent_ref,
            receipt = coupon.is_receipt(),
            "Coupon issued"
        );
        self.event_sink.emit(make_event(
            EventType::CouponIssued,
            tenant_id,
            origin.campaign_id(),
            Some(coupon.id),
            coupon.code.clone(),
        ));
        Ok(coupon)
    }

    pub fn get(&self, tenant_id: Uuid, coupon_id: Uuid) -> OrchestratorResult<Coupon> {
        let coupon = self
            .store
            .get_coupon(&coupon_id)
            .ok_or_else(|| OrchestratorError::not_found("coupon", coupon_id))?;
        ensure_tenant("coupon", coupon_id, coupon.tenant_id, tenant_id)?;
        Ok(coupon)
    }

    /// Cancel an issued coupon. The reason is mandatory.
    pub fn cancel(
        &self,
        tenant_id: Uuid,
        coupon_id: Uuid,
        reason: &str,
    ) -> OrchestratorResult<Coupon> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(OrchestratorError::Validation(
                "cancellation reason is required".into(),
            ));
        }
        let mut coupon = self.get(tenant_id, coupon_id)?;
        if coupon.status != CouponStatus::Issued {
            return Err(OrchestratorError::StateConflict(format!(
                "coupon {coupon_id} is {:?}",
                coupon.status
            )));
        }

        coupon.status = CouponStatus::Cancelled;
        coupon.cancellation_reason = Some(reason.to_string());
        coupon.cancelled_at = Some(self.clock.now());
        self.store.transition_coupon(&coupon, CouponStatus::Issued)?;

        info!(tenant_id = %tenant_id, coupon_id = %coupon_id, reason, "Coupon cancelled");
        self.event_sink.emit(make_event(
            EventType::CouponCancelled,
            tenant_id,
            coupon.origin.campaign_id(),
            Some(coupon_id),
            reason,
        ));
        Ok(coupon)
    }

    /// Move every issued coupon past its expiry to `Expired`. Returns how
    /// many were expired.
    pub fn expire_overdue(&self, now: DateTime<Utc>) -> usize {
        let mut expired = 0;
        for mut coupon in self.store.coupons_with_status(CouponStatus::Issued) {
            if !coupon.expires_at.is_some_and(|at| at <= now) {
                continue;
            }
            coupon.status = CouponStatus::Expired;
            match self.store.transition_coupon(&coupon, CouponStatus::Issued) {
                Ok(()) => {}
                Err(OrchestratorError::StateConflict(reason)) => {
                    debug!(
                        coupon_id = %coupon.id,
                        reason = %reason,
                        "Coupon changed before expiry, skipped"
                    );
                    continue;
                }
                Err(err) => {
                    warn!(
                        tenant_id = %coupon.tenant_id,
                        coupon_id = %coupon.id,
                        error = %err,
                        "Failed to expire coupon"
                    );
                    continue;
                }
            }
            expired += 1;
            self.event_sink.emit(make_event(
                EventType::CouponExpired,
                coupon.tenant_id,
                coupon.origin.campaign_id(),
                Some(coupon.id),
                coupon.code.clone(),
            ));
        }
        if expired > 0 {
            info!(expired, "Overdue coupons expired");
        }
        expired
    }

    fn unique_code(&self) -> OrchestratorResult<String> {
        let mut rng = rand::thread_rng();
        for _ in 0..MAX_CODE_ATTEMPTS {
            let code = generate_code(&mut rng, self.code_length);
            if !self.store.code_exists(&code) {
                return Ok(code);
            }
            debug!(code = %code, "Coupon code collision, regenerating");
        }
        Err(OrchestratorError::Persistence(format!(
            "no free coupon code after {MAX_CODE_ATTEMPTS} attempts"
        )))
    }
}

pub fn generate_code<R: Rng + ?Sized>(rng: &mut R, length: usize) -> String {
    (0..length)
        .map(|_| char::from(CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use feedback_core::clock::ManualClock;
    use feedback_core::event_bus::capture_sink;
    use feedback_core::store::{CouponRepository, RewardRepository};
    use feedback_core::types::{Reward, RewardValue};
    use feedback_store::InMemoryStore;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    struct Fixture {
        store: Arc<InMemoryStore>,
        clock: Arc<ManualClock>,
        issuer: CouponIssuer,
        tenant: Uuid,
        reward: Reward,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let tenant = Uuid::new_v4();
        let reward = Reward {
            id: Uuid::new_v4(),
            tenant_id: tenant,
            name: "Desconto".into(),
            value: RewardValue::Percentage { percent: 15 },
            condition: None,
            created_at: clock.now(),
            updated_at: clock.now(),
        };
        store.insert_reward(reward.clone()).unwrap();
        let issuer = CouponIssuer::new(store.clone(), clock.clone(), &RewardsConfig::default());
        Fixture {
            store,
            clock,
            issuer,
            tenant,
            reward,
        }
    }

    fn slot(reward_id: Option<Uuid>) -> PrizeSlot {
        PrizeSlot {
            id: Uuid::new_v4(),
            wheel_id: Uuid::new_v4(),
            label: "slot".into(),
            reward_id,
            is_no_prize_option: reward_id.is_none(),
            weight: 1,
            active: true,
        }
    }

    fn origin() -> Origin {
        Origin::Campaign {
            campaign_id: Uuid::new_v4(),
        }
    }

    #[test]
    fn test_issue_winning_coupon() {
        let f = fixture();
        let coupon = f
            .issuer
            .issue(f.tenant, &Respondent::new("r-1", "Ana"), &slot(Some(f.reward.id)), origin())
            .unwrap();
        assert_eq!(coupon.status, CouponStatus::Issued);
        assert_eq!(coupon.reward_id, Some(f.reward.id));
        assert_eq!(coupon.reward_description.as_deref(), Some("Desconto (15% off)"));
        assert_eq!(coupon.expires_at, Some(f.clock.now() + Duration::days(30)));
        assert_eq!(coupon.code.len(), 8);
        assert!(coupon.code.bytes().all(|b| CODE_ALPHABET.contains(&b)));
        assert!(f.store.code_exists(&coupon.code));
    }

    #[test]
    fn test_no_prize_issues_receipt() {
        let f = fixture();
        let coupon = f
            .issuer
            .issue(f.tenant, &Respondent::new("r-1", "Ana"), &slot(None), origin())
            .unwrap();
        assert!(coupon.is_receipt());
        assert_eq!(coupon.reward_description, None);
        assert_eq!(coupon.expires_at, None);
    }

    #[test]
    fn test_snapshot_survives_reward_edit() {
        let f = fixture();
        let coupon = f
            .issuer
            .issue(f.tenant, &Respondent::new("r-1", "Ana"), &slot(Some(f.reward.id)), origin())
            .unwrap();
        let mut edited = f.reward.clone();
        edited.value = RewardValue::Percentage { percent: 50 };
        f.store.update_reward(&edited).unwrap();
        let stored = f.issuer.get(f.tenant, coupon.id).unwrap();
        assert_eq!(stored.reward_description.as_deref(), Some("Desconto (15% off)"));
    }

    #[test]
    fn test_foreign_reward_rejected() {
        let f = fixture();
        let err = f
            .issuer
            .issue(Uuid::new_v4(), &Respondent::new("r-1", "Ana"), &slot(Some(f.reward.id)), origin())
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::TenantMismatch { .. }));
        assert_eq!(f.store.coupon_count(), 0);
    }

    #[test]
    fn test_persistence_failure_surfaces() {
        let f = fixture();
        f.store.fail_next_coupon_inserts(1);
        let err = f
            .issuer
            .issue(f.tenant, &Respondent::new("r-1", "Ana"), &slot(Some(f.reward.id)), origin())
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Persistence(_)));
        assert_eq!(f.store.coupon_count(), 0);
    }

    #[test]
    fn test_cancel_requires_reason_and_issued_status() {
        let f = fixture();
        let sink = capture_sink();
        let issuer = CouponIssuer::new(f.store.clone(), f.clock.clone(), &RewardsConfig::default())
            .with_event_sink(sink.clone());
        let coupon = issuer
            .issue(f.tenant, &Respondent::new("r-1", "Ana"), &slot(Some(f.reward.id)), origin())
            .unwrap();

        assert!(matches!(
            issuer.cancel(f.tenant, coupon.id, "  "),
            Err(OrchestratorError::Validation(_))
        ));
        let cancelled = issuer.cancel(f.tenant, coupon.id, "fraud").unwrap();
        assert_eq!(cancelled.status, CouponStatus::Cancelled);
        assert_eq!(cancelled.cancellation_reason.as_deref(), Some("fraud"));
        assert!(cancelled.cancelled_at.is_some());
        assert!(matches!(
            issuer.cancel(f.tenant, coupon.id, "again"),
            Err(OrchestratorError::StateConflict(_))
        ));
        assert_eq!(sink.count_type(EventType::CouponCancelled), 1);
    }

    #[test]
    fn test_expire_overdue() {
        let f = fixture();
        let respondent = Respondent::new("r-1", "Ana");
        let winning = f
            .issuer
            .issue(f.tenant, &respondent, &slot(Some(f.reward.id)), origin())
            .unwrap();
        let receipt = f
            .issuer
            .issue(f.tenant, &respondent, &slot(None), origin())
            .unwrap();

        assert_eq!(f.issuer.expire_overdue(f.clock.now()), 0);
        let later = f.clock.advance(Duration::days(31));
        assert_eq!(f.issuer.expire_overdue(later), 1);
        assert_eq!(
            f.issuer.get(f.tenant, winning.id).unwrap().status,
            CouponStatus::Expired
        );
        assert_eq!(
            f.issuer.get(f.tenant, receipt.id).unwrap().status,
            CouponStatus::Issued
        );
    }

    #[test]
    fn test_generated_codes_avoid_ambiguous_chars() {
        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..500 {
            let code = generate_code(&mut rng, 10);
            assert_eq!(code.len(), 10);
            assert!(!code.contains(['0', 'O', '1', 'I']));
        }
    }

    #[test]
    fn test_expiry_sweep_leaves_redeemed_coupon() {
        let f = fixture();
        let coupon = f
            .issuer
            .issue(f.tenant, &Respondent::new("r-1", "Ana"), &slot(Some(f.reward.id)), origin())
            .unwrap();
        let later = f.clock.advance(Duration::days(31));

        let mut redeemed = coupon.clone();
        redeemed.status = CouponStatus::Used;
        redeemed.used_at = Some(later);
        f.store.transition_coupon(&redeemed, CouponStatus::Issued).unwrap();

        assert_eq!(f.issuer.expire_overdue(later), 0);
        let stored = f.issuer.get(f.tenant, coupon.id).unwrap();
        assert_eq!(stored.status, CouponStatus::Used);
        assert_eq!(stored.used_at, Some(later));
        assert!(matches!(
            f.issuer.cancel(f.tenant, coupon.id, "late"),
            Err(OrchestratorError::StateConflict(_))
        ));
    }
}
