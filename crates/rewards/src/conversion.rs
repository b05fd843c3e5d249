//! Coupon redemption and last-touch attribution back to the dispatch log.

use chrono::{DateTime, Utc};
use feedback_core::error::{ensure_tenant, OrchestratorError, OrchestratorResult};
use feedback_core::event_bus::{make_event, noop_sink, EventSink, EventType};
use feedback_core::store::Store;
use feedback_core::types::{CampaignLogEntry, Coupon, CouponStatus, Origin};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct Conversion {
    pub coupon: Coupon,
    /// Log entry credited with the conversion, if a matching send exists.
    pub attributed_log_id: Option<Uuid>,
}

pub struct ConversionTracker {
    store: Arc<dyn Store>,
    event_sink: Arc<dyn EventSink>,
}

impl ConversionTracker {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            event_sink: noop_sink(),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Mark the coupon used and credit the most recent matching send.
    pub fn record_conversion(
        &self,
        tenant_id: Uuid,
        coupon_id: Uuid,
        redeemed_at: DateTime<Utc>,
    ) -> OrchestratorResult<Conversion> {
        let mut coupon = self
            .store
            .get_coupon(&coupon_id)
            .ok_or_else(|| OrchestratorError::not_found("coupon", coupon_id))?;
        ensure_tenant("coupon", coupon_id, coupon.tenant_id, tenant_id)?;

        if coupon.is_receipt() {
            return Err(OrchestratorError::Validation(format!(
                "coupon {} is a no-prize receipt and cannot be redeemed",
                coupon.code
            )));
        }
        if coupon.status != CouponStatus::Issued {
            return Err(OrchestratorError::StateConflict(format!(
                "coupon {} is {:?}",
                coupon.code, coupon.status
            )));
        }
        if coupon.expires_at.is_some_and(|at| at <= redeemed_at) {
            return Err(OrchestratorError::StateConflict(format!(
                "coupon {} expired",
                coupon.code
            )));
        }

        coupon.status = CouponStatus::Used;
        coupon.used_at = Some(redeemed_at);
        self.store.transition_coupon(&coupon, CouponStatus::Issued)?;

        // The redemption is committed; attribution is best effort from here.
        let attributed_log_id = self
            .last_touch(&coupon, redeemed_at)
            .and_then(|log| match self.store.mark_converted(&log.id, redeemed_at) {
                Ok(true) => Some(log.id),
                Ok(false) => None,
                Err(err) => {
                    warn!(
                        tenant_id = %tenant_id,
                        coupon_id = %coupon_id,
                        log_id = %log.id,
                        error = %err,
                        "Attribution failed, conversion left unattributed"
                    );
                    None
                }
            });

        metrics::counter!("rewards.conversions", "attributed" => attributed_log_id.is_some().to_string())
            .increment(1);
        info!(
            tenant_id = %tenant_id,
            coupon_id = %coupon_id,
            attributed_log_id = ?attributed_log_id,
            "Conversion recorded"
        );
        self.event_sink.emit(make_event(
            EventType::ConversionRecorded,
            tenant_id,
            coupon.origin.campaign_id(),
            Some(coupon_id),
            attributed_log_id.map_or_else(|| "unattributed".to_string(), |id| id.to_string()),
        ));
        Ok(Conversion {
            coupon,
            attributed_log_id,
        })
    }

    fn last_touch(&self, coupon: &Coupon, redeemed_at: DateTime<Utc>) -> Option<CampaignLogEntry> {
        let matches_origin = |log: &CampaignLogEntry| match coupon.origin {
            Origin::Campaign { campaign_id }
            | Origin::Survey {
                campaign_id: Some(campaign_id),
                ..
            } => log.campaign_id == Some(campaign_id),
            Origin::Survey {
                campaign_id: None, ..
            } => log.campaign_id.is_some(),
        };

        let candidate = self
            .store
            .logs_for_respondent(&coupon.tenant_id, &coupon.respondent.respondent_ref)
            .into_iter()
            .filter(|log| {
                log.outcome.is_sent()
                    && log.converted_at.is_none()
                    && log.sent_at <= redeemed_at
                    && matches_origin(log)
            })
            .max_by_key(|log| log.sent_at);

        if candidate.is_none() {
            debug!(
                tenant_id = %coupon.tenant_id,
                coupon_id = %coupon.id,
                "No dispatched message to attribute"
            );
        }
        candidate
    }
}
