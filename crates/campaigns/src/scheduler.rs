//! Periodic tick driver. One interval loop for the whole node: each tick
//! promotes due campaigns to `Running`, fans a dispatcher tick out to every
//! running campaign, then retries parked log entries of paused, finished or
//! deleted campaigns.

use crate::dispatcher::{RateLimitedDispatcher, TickOutcome};
use crate::locks::CampaignLockProvider;
use crate::state_machine::{CampaignStateMachine, CampaignTrigger};
use chrono::{DateTime, Utc};
use feedback_core::clock::Clock;
use feedback_core::event_bus::{noop_sink, EventSink};
use feedback_core::store::Store;
use feedback_core::types::CampaignStatus;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Summary of one scheduler pass.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TickReport {
    pub started: Vec<Uuid>,
    pub outcomes: Vec<(Uuid, TickOutcome)>,
    /// Parked log entries written for campaigns that no longer tick.
    pub logs_recovered: usize,
    pub errors: usize,
}

impl TickReport {
    pub fn sent(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, TickOutcome::Sent { .. }))
            .count()
    }
}

pub struct DispatchScheduler {
    store: Arc<dyn Store>,
    dispatcher: Arc<RateLimitedDispatcher>,
    locks: Arc<dyn CampaignLockProvider>,
    clock: Arc<dyn Clock>,
    state_machine: CampaignStateMachine,
    tick_interval: Duration,
    event_sink: Arc<dyn EventSink>,
}

impl DispatchScheduler {
    pub fn new(
        store: Arc<dyn Store>,
        dispatcher: Arc<RateLimitedDispatcher>,
        locks: Arc<dyn CampaignLockProvider>,
        clock: Arc<dyn Clock>,
        tick_interval: Duration,
    ) -> Self {
        Self {
            store,
            dispatcher,
            locks,
            clock,
            state_machine: CampaignStateMachine::new(),
            tick_interval,
            event_sink: noop_sink(),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Run until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            tick_interval_ms = self.tick_interval.as_millis() as u64,
            "Dispatch scheduler started"
        );
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.run_once(self.clock.now()).await;
                    if !report.outcomes.is_empty() {
                        debug!(
                            campaigns = report.outcomes.len(),
                            sent = report.sent(),
                            errors = report.errors,
                            "Scheduler tick complete"
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Dispatch scheduler stopped");
    }

    /// One pass: promote due campaigns, tick every running one, then flush
    /// the log backlog of campaigns that were not ticked.
    pub async fn run_once(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport {
            started: self.promote_due(now).await,
            ..Default::default()
        };

        let running = self.store.campaigns_with_status(&[CampaignStatus::Running]);
        let ticked: HashSet<Uuid> = running.iter().map(|c| c.id).collect();
        let mut ticks = JoinSet::new();
        for campaign in running {
            let dispatcher = self.dispatcher.clone();
            ticks.spawn(async move {
                let result = dispatcher.run_tick(campaign.id, now).await;
                (campaign, result)
            });
        }

        while let Some(joined) = ticks.join_next().await {
            match joined {
                Ok((campaign, Ok(outcome))) => report.outcomes.push((campaign.id, outcome)),
                Ok((campaign, Err(err))) => {
                    report.errors += 1;
                    metrics::counter!("dispatch.tick_errors").increment(1);
                    error!(
                        tenant_id = %campaign.tenant_id,
                        campaign_id = %campaign.id,
                        error = %err,
                        "Dispatch tick failed"
                    );
                }
                Err(err) => {
                    report.errors += 1;
                    error!(error = %err, "Dispatch tick task aborted");
                }
            }
        }

        for campaign_id in self.dispatcher.campaigns_with_pending_logs() {
            if ticked.contains(&campaign_id) {
                continue;
            }
            if let Some(written) = self.dispatcher.flush_pending_logs(campaign_id) {
                report.logs_recovered += written;
            }
        }
        report
    }

    async fn promote_due(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut started = Vec::new();
        for campaign in self.store.campaigns_with_status(&[CampaignStatus::Scheduled]) {
            if campaign.start_date.is_some_and(|start| start > now) {
                continue;
            }
            let lock = self.locks.lock_for(&campaign.id);
            let _guard = lock.lock_owned().await;

            // Re-read under the lock; a command may have won the race.
            let Some(mut current) = self.store.get_campaign(&campaign.id) else {
                continue;
            };
            if current.status != CampaignStatus::Scheduled {
                continue;
            }
            match self.state_machine.fire(
                &*self.store,
                &*self.event_sink,
                &mut current,
                CampaignTrigger::StartDue,
                now,
            ) {
                Ok(_) => started.push(current.id),
                Err(err) => warn!(
                    tenant_id = %current.tenant_id,
                    campaign_id = %current.id,
                    error = %err,
                    "Failed to start due campaign"
                ),
            }
        }
        started
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locks::InProcessLocks;
    use crate::queue::RecipientQueue;
    use crate::service::CampaignService;
    use chrono::Duration as ChronoDuration;
    use feedback_channels::{InstanceRegistry, ScriptedTransport};
    use feedback_core::clock::ManualClock;
    use feedback_core::config::DispatchConfig;
    use feedback_core::store::{CampaignRepository, LogRepository};
    use feedback_core::types::{CampaignOwnership, MessageVariant, NewCampaign, Recipient};
    use feedback_store::InMemoryStore;

    struct Node {
        store: Arc<InMemoryStore>,
        clock: Arc<ManualClock>,
        transport: Arc<ScriptedTransport>,
        service: CampaignService,
        scheduler: DispatchScheduler,
        instances: Arc<InstanceRegistry>,
    }

    fn node() -> Node {
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(RecipientQueue::new());
        let locks = Arc::new(InProcessLocks::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let transport = Arc::new(ScriptedTransport::new());
        let instances = Arc::new(InstanceRegistry::new());
        let dispatcher = Arc::new(RateLimitedDispatcher::new(
            store.clone(),
            queue.clone(),
            instances.clone(),
            transport.clone(),
            locks.clone(),
            &DispatchConfig::default(),
        ));
        let service = CampaignService::new(store.clone(), queue, locks.clone(), clock.clone());
        let scheduler = DispatchScheduler::new(
            store.clone(),
            dispatcher,
            locks,
            clock.clone(),
            Duration::from_millis(10),
        );
        Node {
            store,
            clock,
            transport,
            service,
            scheduler,
            instances,
        }
    }

    async fn scheduled_campaign(node: &Node, tenant: Uuid, recipients: usize) -> Uuid {
        node.instances.register(tenant, format!("inst-{tenant}"));
        let campaign = node
            .service
            .create(NewCampaign {
                owner: CampaignOwnership::Tenant(tenant),
                name: "Reativação".into(),
                start_date: None,
                end_date: None,
                message_delay_seconds: 0,
                variants: vec![MessageVariant::new("a", "Oi {{cliente}}", 1)],
            })
            .unwrap();
        for i in 0..recipients {
            node.service
                .enqueue_recipient(
                    tenant,
                    campaign.id,
                    Recipient::new(format!("r-{i}"), format!("Name {i}"), "5511977776666"),
                    None,
                )
                .await
                .unwrap();
        }
        let start = node.clock.now() + ChronoDuration::seconds(30);
        node.service
            .schedule(tenant, campaign.id, Some(start))
            .await
            .unwrap();
        campaign.id
    }

    #[tokio::test]
    async fn test_promotes_due_campaign() {
        let node = node();
        let tenant = Uuid::new_v4();
        let id = scheduled_campaign(&node, tenant, 1).await;

        let early = node.scheduler.run_once(node.clock.now()).await;
        assert!(early.started.is_empty());
        assert_eq!(node.transport.call_count(), 0);

        let due = node.clock.advance(ChronoDuration::seconds(30));
        let report = node.scheduler.run_once(due).await;
        assert_eq!(report.started, vec![id]);
        assert_eq!(report.sent(), 1);
        assert_eq!(
            node.store.get_campaign(&id).unwrap().status,
            CampaignStatus::Running
        );
    }

    #[tokio::test]
    async fn test_pause_resume_preserves_order() {
        let node = node();
        let tenant = Uuid::new_v4();
        let id = scheduled_campaign(&node, tenant, 5).await;
        let now = node.clock.advance(ChronoDuration::seconds(30));

        node.scheduler.run_once(now).await;
        node.scheduler.run_once(now).await;
        node.service.pause(tenant, id).await.unwrap();

        for _ in 0..3 {
            let report = node.scheduler.run_once(now).await;
            assert_eq!(report.sent(), 0);
        }
        assert_eq!(node.store.logs_for_campaign(&id).len(), 2);

        node.service.resume(tenant, id).await.unwrap();
        for _ in 0..4 {
            node.scheduler.run_once(now).await;
        }

        let order: Vec<String> = node
            .store
            .logs_for_campaign(&id)
            .into_iter()
            .map(|l| l.recipient.respondent_ref)
            .collect();
        assert_eq!(order, vec!["r-0", "r-1", "r-2", "r-3", "r-4"]);
        assert_eq!(
            node.store.get_campaign(&id).unwrap().status,
            CampaignStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_parked_log_survives_cancel() {
        let node = node();
        let tenant = Uuid::new_v4();
        let id = scheduled_campaign(&node, tenant, 3).await;
        let now = node.clock.advance(ChronoDuration::seconds(30));

        node.store.fail_next_log_appends(1);
        assert_eq!(node.scheduler.run_once(now).await.sent(), 1);
        assert!(node.store.logs_for_campaign(&id).is_empty());
        node.service.cancel(tenant, id).await.unwrap();

        let report = node.scheduler.run_once(now).await;
        assert_eq!(report.logs_recovered, 1);
        for _ in 0..3 {
            assert_eq!(node.scheduler.run_once(now).await.logs_recovered, 0);
        }
        let logs = node.store.logs_for_campaign(&id);
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].recipient.respondent_ref, "r-0");
        assert_eq!(node.transport.call_count(), 1);
        assert_eq!(
            node.store.get_campaign(&id).unwrap().status,
            CampaignStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_busy_campaign_does_not_block_others() {
        let node = node();
        let first = scheduled_campaign(&node, Uuid::new_v4(), 2).await;
        let second = scheduled_campaign(&node, Uuid::new_v4(), 2).await;
        let now = node.clock.advance(ChronoDuration::seconds(30));
        node.scheduler.run_once(now).await;
        assert_eq!(node.transport.call_count(), 2);

        let held = node.scheduler.locks.lock_for(&first);
        let _guard = held.lock_owned().await;
        let report = node.scheduler.run_once(now).await;

        let outcome_of = |id: Uuid| {
            report
                .outcomes
                .iter()
                .find(|(c, _)| *c == id)
                .map(|(_, o)| o.clone())
        };
        assert_eq!(outcome_of(first), Some(TickOutcome::Busy));
        assert!(matches!(outcome_of(second), Some(TickOutcome::Sent { .. })));
        assert_eq!(report.errors, 0);
        assert_eq!(node.store.logs_for_campaign(&first).len(), 1);
        assert_eq!(node.store.logs_for_campaign(&second).len(), 2);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let node = node();
        let (tx, rx) = watch::channel(false);
        let scheduler = node.scheduler;
        let handle = tokio::spawn(async move { scheduler.run(rx).await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
