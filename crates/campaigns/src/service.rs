//! Tenant-scoped campaign commands. Every state change waits for the
//! campaign lock so it lands between dispatcher ticks, never inside one.

use crate::locks::CampaignLockProvider;
use crate::queue::{QueueEntry, RecipientQueue};
use crate::state_machine::{CampaignStateMachine, CampaignTrigger, TransitionOutcome};
use chrono::{DateTime, Utc};
use feedback_core::clock::Clock;
use feedback_core::error::{ensure_tenant, OrchestratorError, OrchestratorResult};
use feedback_core::event_bus::{noop_sink, EventSink};
use feedback_core::store::Store;
use feedback_core::types::{validate_dates, Campaign, NewCampaign, Recipient};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

pub struct CampaignService {
    store: Arc<dyn Store>,
    queue: Arc<RecipientQueue>,
    locks: Arc<dyn CampaignLockProvider>,
    clock: Arc<dyn Clock>,
    state_machine: CampaignStateMachine,
    event_sink: Arc<dyn EventSink>,
}

impl CampaignService {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<RecipientQueue>,
        locks: Arc<dyn CampaignLockProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            queue,
            locks,
            clock,
            state_machine: CampaignStateMachine::new(),
            event_sink: noop_sink(),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Validate and persist a new campaign in `Draft`.
    pub fn create(&self, new: NewCampaign) -> OrchestratorResult<Campaign> {
        let campaign = new.validate(self.clock.now())?;
        self.store.insert_campaign(campaign.clone())?;
        info!(
            tenant_id = %campaign.tenant_id,
            campaign_id = %campaign.id,
            name = %campaign.name,
            variants = campaign.variants.len(),
            "Campaign created"
        );
        Ok(campaign)
    }

    pub fn get(&self, tenant_id: Uuid, campaign_id: Uuid) -> OrchestratorResult<Campaign> {
        let campaign = self
            .store
            .get_campaign(&campaign_id)
            .ok_or_else(|| OrchestratorError::not_found("campaign", campaign_id))?;
        ensure_tenant("campaign", campaign_id, campaign.tenant_id, tenant_id)?;
        Ok(campaign)
    }

    pub fn list(&self, tenant_id: Uuid) -> Vec<Campaign> {
        self.store.campaigns_for_tenant(&tenant_id)
    }

    /// Move a draft to `Scheduled`. `start_at` overrides the stored start
    /// date; either way it must lie in the future.
    pub async fn schedule(
        &self,
        tenant_id: Uuid,
        campaign_id: Uuid,
        start_at: Option<DateTime<Utc>>,
    ) -> OrchestratorResult<Campaign> {
        let lock = self.locks.lock_for(&campaign_id);
        let _guard = lock.lock_owned().await;

        let mut campaign = self.get(tenant_id, campaign_id)?;
        let now = self.clock.now();
        let start = start_at.or(campaign.start_date).ok_or_else(|| {
            OrchestratorError::Validation("scheduling requires a start date".into())
        })?;
        if start <= now {
            return Err(OrchestratorError::Validation(format!(
                "start date {start} is not in the future"
            )));
        }
        validate_dates(Some(start), campaign.end_date)?;
        // Rejects anything but a draft before the new start date is stored.
        self.state_machine
            .apply(campaign.status, CampaignTrigger::Schedule)?;

        campaign.start_date = Some(start);
        self.state_machine.fire(
            &*self.store,
            &*self.event_sink,
            &mut campaign,
            CampaignTrigger::Schedule,
            now,
        )?;
        Ok(campaign)
    }

    /// Append a recipient to a campaign that can still dispatch.
    pub async fn enqueue_recipient(
        &self,
        tenant_id: Uuid,
        campaign_id: Uuid,
        recipient: Recipient,
        variant_hint: Option<&str>,
    ) -> OrchestratorResult<QueueEntry> {
        let lock = self.locks.lock_for(&campaign_id);
        let _guard = lock.lock_owned().await;

        let campaign = self.get(tenant_id, campaign_id)?;
        if campaign.status.is_terminal() {
            return Err(OrchestratorError::StateConflict(format!(
                "campaign {campaign_id} is {}",
                campaign.status.as_str()
            )));
        }
        if recipient.phone.trim().is_empty() {
            return Err(OrchestratorError::Validation(
                "recipient phone must not be empty".into(),
            ));
        }
        self.queue.enqueue(
            campaign_id,
            &campaign.variants,
            recipient,
            variant_hint,
            self.clock.now(),
        )
    }

    pub async fn pause(&self, tenant_id: Uuid, campaign_id: Uuid) -> OrchestratorResult<Campaign> {
        self.transition(tenant_id, campaign_id, CampaignTrigger::Pause)
            .await
            .map(|(campaign, _)| campaign)
    }

    pub async fn resume(&self, tenant_id: Uuid, campaign_id: Uuid) -> OrchestratorResult<Campaign> {
        self.transition(tenant_id, campaign_id, CampaignTrigger::Resume)
            .await
            .map(|(campaign, _)| campaign)
    }

    /// Cancel the campaign and drop whatever is still queued.
    pub async fn cancel(&self, tenant_id: Uuid, campaign_id: Uuid) -> OrchestratorResult<Campaign> {
        let (campaign, outcome) = self
            .transition(tenant_id, campaign_id, CampaignTrigger::Cancel)
            .await?;
        if outcome.changed() {
            let discarded = self.queue.discard(&campaign_id);
            self.locks.release(&campaign_id);
            info!(
                tenant_id = %tenant_id,
                campaign_id = %campaign_id,
                discarded,
                "Campaign queue discarded"
            );
        }
        Ok(campaign)
    }

    /// Remove a campaign. Its logs stay, detached from it.
    pub async fn delete(&self, tenant_id: Uuid, campaign_id: Uuid) -> OrchestratorResult<()> {
        {
            let lock = self.locks.lock_for(&campaign_id);
            let _guard = lock.lock_owned().await;
            self.get(tenant_id, campaign_id)?;
            self.store.delete_campaign(&campaign_id)?;
            self.queue.discard(&campaign_id);
        }
        self.locks.release(&campaign_id);
        info!(tenant_id = %tenant_id, campaign_id = %campaign_id, "Campaign deleted");
        Ok(())
    }

    /// Delete everything the tenant owns: campaigns, logs, rewards, wheels
    /// and coupons. Returns how many records were removed.
    pub async fn purge_tenant(&self, tenant_id: Uuid) -> OrchestratorResult<usize> {
        let campaigns = self.store.campaigns_for_tenant(&tenant_id);
        for campaign in &campaigns {
            let lock = self.locks.lock_for(&campaign.id);
            let _guard = lock.lock_owned().await;
            self.queue.discard(&campaign.id);
        }
        let removed = self.store.purge_tenant(&tenant_id)?;
        for campaign in &campaigns {
            self.locks.release(&campaign.id);
        }
        info!(
            tenant_id = %tenant_id,
            campaigns = campaigns.len(),
            removed,
            "Tenant purged"
        );
        Ok(removed)
    }

    async fn transition(
        &self,
        tenant_id: Uuid,
        campaign_id: Uuid,
        trigger: CampaignTrigger,
    ) -> OrchestratorResult<(Campaign, TransitionOutcome)> {
        let lock = self.locks.lock_for(&campaign_id);
        let _guard = lock.lock_owned().await;

        let mut campaign = self.get(tenant_id, campaign_id)?;
        let outcome = self.state_machine.fire(
            &*self.store,
            &*self.event_sink,
            &mut campaign,
            trigger,
            self.clock.now(),
        )?;
        Ok((campaign, outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locks::InProcessLocks;
    use chrono::Duration;
    use feedback_core::clock::ManualClock;
    use feedback_core::event_bus::{capture_sink, EventType};
    use feedback_core::store::{CampaignRepository, LogRepository};
    use feedback_core::types::{
        CampaignLogEntry, CampaignOwnership, CampaignStatus, DeliveryOutcome, MessageVariant,
    };
    use feedback_store::InMemoryStore;

    struct Fixture {
        store: Arc<InMemoryStore>,
        queue: Arc<RecipientQueue>,
        locks: Arc<InProcessLocks>,
        clock: Arc<ManualClock>,
        service: CampaignService,
        tenant: Uuid,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(RecipientQueue::new());
        let locks = Arc::new(InProcessLocks::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let service =
            CampaignService::new(store.clone(), queue.clone(), locks.clone(), clock.clone());
        Fixture {
            store,
            queue,
            locks,
            clock,
            service,
            tenant: Uuid::new_v4(),
        }
    }

    fn new_campaign(tenant: Uuid) -> NewCampaign {
        NewCampaign {
            owner: CampaignOwnership::Tenant(tenant),
            name: "Black Friday".into(),
            start_date: None,
            end_date: None,
            message_delay_seconds: 0,
            variants: vec![MessageVariant::new("a", "Oi {{cliente}}", 1)],
        }
    }

    fn recipient(i: usize) -> Recipient {
        Recipient::new(format!("r-{i}"), format!("Name {i}"), "5511988887777")
    }

    async fn running(f: &Fixture) -> Campaign {
        let campaign = f.service.create(new_campaign(f.tenant)).unwrap();
        let start = f.clock.now() + Duration::minutes(5);
        f.service
            .schedule(f.tenant, campaign.id, Some(start))
            .await
            .unwrap();
        let mut stored = f.store.get_campaign(&campaign.id).unwrap();
        stored.status = CampaignStatus::Running;
        f.store.update_campaign(&stored).unwrap();
        stored
    }

    #[tokio::test]
    async fn test_create_and_schedule() {
        let f = fixture();
        let campaign = f.service.create(new_campaign(f.tenant)).unwrap();
        assert_eq!(campaign.status, CampaignStatus::Draft);

        let start = f.clock.now() + Duration::hours(1);
        let scheduled = f
            .service
            .schedule(f.tenant, campaign.id, Some(start))
            .await
            .unwrap();
        assert_eq!(scheduled.status, CampaignStatus::Scheduled);
        assert_eq!(scheduled.start_date, Some(start));
    }

    #[tokio::test]
    async fn test_legacy_unowned_rejected() {
        let f = fixture();
        let mut new = new_campaign(f.tenant);
        new.owner = CampaignOwnership::LegacyUnowned;
        assert!(matches!(
            f.service.create(new),
            Err(OrchestratorError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_schedule_requires_future_start() {
        let f = fixture();
        let campaign = f.service.create(new_campaign(f.tenant)).unwrap();
        let past = f.clock.now() - Duration::minutes(1);
        let err = f
            .service
            .schedule(f.tenant, campaign.id, Some(past))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
        let err = f.service.schedule(f.tenant, campaign.id, None).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
        assert_eq!(
            f.store.get_campaign(&campaign.id).unwrap().status,
            CampaignStatus::Draft
        );
    }

    #[tokio::test]
    async fn test_schedule_rejects_end_before_start() {
        let f = fixture();
        let mut new = new_campaign(f.tenant);
        new.end_date = Some(f.clock.now() + Duration::minutes(10));
        let campaign = f.service.create(new).unwrap();
        let err = f
            .service
            .schedule(f.tenant, campaign.id, Some(f.clock.now() + Duration::hours(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
    }

    #[tokio::test]
    async fn test_other_tenant_cannot_touch_campaign() {
        let f = fixture();
        let campaign = f.service.create(new_campaign(f.tenant)).unwrap();
        let intruder = Uuid::new_v4();
        assert!(matches!(
            f.service.get(intruder, campaign.id),
            Err(OrchestratorError::TenantMismatch { .. })
        ));
        assert!(f.service.cancel(intruder, campaign.id).await.is_err());
        assert_eq!(
            f.store.get_campaign(&campaign.id).unwrap().status,
            CampaignStatus::Draft
        );
    }

    #[tokio::test]
    async fn test_pause_resume_and_cancel() {
        let f = fixture();
        let sink = capture_sink();
        let service = CampaignService::new(
            f.store.clone(),
            f.queue.clone(),
            Arc::new(InProcessLocks::new()),
            f.clock.clone(),
        )
        .with_event_sink(sink.clone());
        let campaign = running(&f).await;

        for i in 0..3 {
            service
                .enqueue_recipient(f.tenant, campaign.id, recipient(i), None)
                .await
                .unwrap();
        }
        let paused = service.pause(f.tenant, campaign.id).await.unwrap();
        assert_eq!(paused.status, CampaignStatus::Paused);
        assert_eq!(f.queue.len(&campaign.id), 3);

        service.resume(f.tenant, campaign.id).await.unwrap();
        let cancelled = service.cancel(f.tenant, campaign.id).await.unwrap();
        assert_eq!(cancelled.status, CampaignStatus::Cancelled);
        assert!(f.queue.is_empty(&campaign.id));

        let again = service.cancel(f.tenant, campaign.id).await.unwrap();
        assert_eq!(again.status, CampaignStatus::Cancelled);
        assert!(matches!(
            service.resume(f.tenant, campaign.id).await,
            Err(OrchestratorError::StateConflict(_))
        ));
        assert_eq!(sink.count_type(EventType::CampaignTransitioned), 3);
    }

    #[tokio::test]
    async fn test_cancel_releases_queue_and_lock() {
        let f = fixture();
        let campaign = running(&f).await;
        for i in 0..2 {
            f.service
                .enqueue_recipient(f.tenant, campaign.id, recipient(i), None)
                .await
                .unwrap();
        }
        assert_eq!(f.locks.len(), 1);

        f.service.cancel(f.tenant, campaign.id).await.unwrap();
        assert!(f.locks.is_empty());
        assert!(f.queue.entries(&campaign.id).is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_stamps_clock_time() {
        let f = fixture();
        let campaign = running(&f).await;
        let at = f.clock.advance(Duration::hours(3));
        let entry = f
            .service
            .enqueue_recipient(f.tenant, campaign.id, recipient(0), None)
            .await
            .unwrap();
        assert_eq!(entry.enqueued_at, at);
    }

    #[tokio::test]
    async fn test_enqueue_rejected_for_terminal_campaign() {
        let f = fixture();
        let campaign = f.service.create(new_campaign(f.tenant)).unwrap();
        f.service.cancel(f.tenant, campaign.id).await.unwrap();
        let err = f
            .service
            .enqueue_recipient(f.tenant, campaign.id, recipient(0), None)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::StateConflict(_)));
    }

    fn log_for(campaign: &Campaign) -> CampaignLogEntry {
        CampaignLogEntry {
            id: Uuid::new_v4(),
            tenant_id: campaign.tenant_id,
            campaign_id: Some(campaign.id),
            queue_entry_id: Uuid::new_v4(),
            recipient: recipient(0),
            variant: "a".into(),
            sent_at: Utc::now(),
            outcome: DeliveryOutcome::Sent {
                provider_message_id: "m-1".into(),
            },
            attempt: 1,
            retry_count: 0,
            converted_at: None,
        }
    }

    #[tokio::test]
    async fn test_delete_keeps_logs_detached() {
        let f = fixture();
        let campaign = running(&f).await;
        f.service
            .enqueue_recipient(f.tenant, campaign.id, recipient(0), None)
            .await
            .unwrap();
        let log = log_for(&campaign);
        f.store.append_log(log.clone()).unwrap();

        f.service.delete(f.tenant, campaign.id).await.unwrap();
        assert!(f.store.get_campaign(&campaign.id).is_none());
        assert!(f.queue.is_empty(&campaign.id));
        assert_eq!(f.store.get_log(&log.id).unwrap().campaign_id, None);
    }

    #[tokio::test]
    async fn test_purge_tenant_cascades() {
        let f = fixture();
        let campaign = running(&f).await;
        f.service
            .enqueue_recipient(f.tenant, campaign.id, recipient(0), None)
            .await
            .unwrap();
        let log = log_for(&campaign);
        f.store.append_log(log.clone()).unwrap();
        let other = f.service.create(new_campaign(Uuid::new_v4())).unwrap();

        let removed = f.service.purge_tenant(f.tenant).await.unwrap();
        assert_eq!(removed, 2);
        assert!(f.store.get_log(&log.id).is_none());
        assert!(f.queue.is_empty(&campaign.id));
        assert!(f.store.get_campaign(&other.id).is_some());
    }
}
