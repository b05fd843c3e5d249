//! Rate-limited dispatcher: drains one campaign's recipient queue at the
//! campaign's configured delay, one message per eligible tick.
//!
//! Sends go through the messaging transport with a timeout. Every attempt is
//! logged; failed attempts are retried with capped exponential backoff at the
//! head of the queue until the attempt budget runs out. Log writes that fail
//! after a successful send are parked in an ordered per-campaign backlog and
//! retried on later ticks; the recipient is never messaged twice.

use crate::locks::CampaignLockProvider;
use crate::queue::{QueueEntry, RecipientQueue};
use crate::retry::RetryPolicy;
use crate::state_machine::{CampaignStateMachine, CampaignTrigger};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use feedback_channels::{InstanceRegistry, MessageTransport};
use feedback_core::config::DispatchConfig;
use feedback_core::error::{OrchestratorError, OrchestratorResult, TransportError};
use feedback_core::event_bus::{make_event, EventSink, EventType};
use feedback_core::store::Store;
use feedback_core::templates::{self, TemplateVars};
use feedback_core::types::{Campaign, CampaignLogEntry, CampaignStatus, DeliveryOutcome};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What a single tick did for one campaign.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Another tick or command holds the campaign lock.
    Busy,
    /// Campaign is not running; nothing was sent.
    Inert(CampaignStatus),
    Throttled {
        next_eligible_at: DateTime<Utc>,
    },
    /// The head entry is waiting out its retry backoff.
    BackingOff {
        until: DateTime<Utc>,
    },
    Sent {
        entry_id: Uuid,
        attempt: u32,
    },
    Failed {
        entry_id: Uuid,
        attempt: u32,
        retry_at: DateTime<Utc>,
    },
    PermanentlyFailed {
        entry_id: Uuid,
        attempt: u32,
    },
    /// The entry was already delivered; it was dropped without sending.
    DuplicateSkipped {
        entry_id: Uuid,
    },
    /// Queue is drained but some log entries are still unwritten.
    AwaitingLogFlush {
        pending: usize,
    },
    Completed {
        trigger: CampaignTrigger,
        discarded: usize,
    },
}

pub struct RateLimitedDispatcher {
    store: Arc<dyn Store>,
    queue: Arc<RecipientQueue>,
    instances: Arc<InstanceRegistry>,
    transport: Arc<dyn MessageTransport>,
    locks: Arc<dyn CampaignLockProvider>,
    state_machine: CampaignStateMachine,
    retry: RetryPolicy,
    transport_timeout: Duration,
    /// Time of the last successful send per campaign.
    last_sent: DashMap<Uuid, DateTime<Utc>>,
    /// Log entries not yet accepted by the store, in dispatch order.
    backlog: DashMap<Uuid, VecDeque<CampaignLogEntry>>,
    event_sink: Arc<dyn EventSink>,
}

impl RateLimitedDispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<RecipientQueue>,
        instances: Arc<InstanceRegistry>,
        transport: Arc<dyn MessageTransport>,
        locks: Arc<dyn CampaignLockProvider>,
        config: &DispatchConfig,
    ) -> Self {
        info!(
            max_attempts = config.max_attempts,
            transport_timeout_ms = config.transport_timeout_ms,
            "Dispatcher initialized"
        );
        Self {
            store,
            queue,
            instances,
            transport,
            locks,
            state_machine: CampaignStateMachine::new(),
            retry: RetryPolicy::from(config),
            transport_timeout: Duration::from_millis(config.transport_timeout_ms),
            last_sent: DashMap::new(),
            backlog: DashMap::new(),
            event_sink: feedback_core::event_bus::noop_sink(),
        }
    }

    /// Attach an event sink for emitting observability events.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    pub fn queue(&self) -> &Arc<RecipientQueue> {
        &self.queue
    }

    /// Number of log entries waiting to be written for a campaign.
    pub fn pending_logs(&self, campaign_id: &Uuid) -> usize {
        self.backlog.get(campaign_id).map_or(0, |b| b.len())
    }

    /// Campaigns that still have log entries waiting to be written.
    pub fn campaigns_with_pending_logs(&self) -> Vec<Uuid> {
        self.backlog
            .iter()
            .filter(|b| !b.is_empty())
            .map(|b| *b.key())
            .collect()
    }

    /// Retry a campaign's unwritten log entries whatever its status, so a
    /// pause, cancel or delete after a send never loses the send's log.
    /// Returns `None` when the campaign is locked elsewhere.
    pub fn flush_pending_logs(&self, campaign_id: Uuid) -> Option<usize> {
        let lock = self.locks.lock_for(&campaign_id);
        let Ok(guard) = lock.try_lock_owned() else {
            debug!(campaign_id = %campaign_id, "Log flush skipped, campaign busy");
            return None;
        };

        let campaign = self.store.get_campaign(&campaign_id);
        if campaign.is_none() {
            // Deleted campaigns keep their logs, detached.
            if let Some(mut parked) = self.backlog.get_mut(&campaign_id) {
                parked.iter_mut().for_each(|log| log.campaign_id = None);
            }
        }
        let written = self.recover_backlog(&campaign_id);

        let settled = campaign.map_or(true, |c| c.status.is_terminal());
        if settled && self.pending_logs(&campaign_id) == 0 {
            drop(guard);
            self.last_sent.remove(&campaign_id);
            self.locks.release(&campaign_id);
        }
        Some(written)
    }

    /// Run one dispatch step for a campaign. Returns `Busy` without waiting
    /// when the campaign is locked elsewhere.
    pub async fn run_tick(
        &self,
        campaign_id: Uuid,
        now: DateTime<Utc>,
    ) -> OrchestratorResult<TickOutcome> {
        let lock = self.locks.lock_for(&campaign_id);
        let Ok(_guard) = lock.try_lock_owned() else {
            debug!(campaign_id = %campaign_id, "Tick skipped, campaign busy");
            return Ok(TickOutcome::Busy);
        };

        let mut campaign = self
            .store
            .get_campaign(&campaign_id)
            .ok_or_else(|| OrchestratorError::not_found("campaign", campaign_id))?;

        self.recover_backlog(&campaign_id);

        if campaign.status != CampaignStatus::Running {
            if campaign.status.is_terminal() {
                self.last_sent.remove(&campaign_id);
            }
            return Ok(TickOutcome::Inert(campaign.status));
        }

        if campaign.end_date.is_some_and(|end| now >= end) {
            let discarded = self.queue.discard(&campaign_id);
            return self.complete(&mut campaign, CampaignTrigger::EndDateReached, discarded, now);
        }

        if self.queue.is_empty(&campaign_id) {
            let pending = self.pending_logs(&campaign_id);
            if pending > 0 {
                return Ok(TickOutcome::AwaitingLogFlush { pending });
            }
            return self.complete(&mut campaign, CampaignTrigger::QueueExhausted, 0, now);
        }

        if let Some(last) = self.last_sent.get(&campaign_id).map(|t| *t) {
            let next_eligible_at =
                last + ChronoDuration::seconds(i64::from(campaign.message_delay_seconds));
            if now < next_eligible_at {
                return Ok(TickOutcome::Throttled { next_eligible_at });
            }
        }

        let Some(entry) = self.queue.dequeue_next(&campaign_id) else {
            return Ok(TickOutcome::AwaitingLogFlush { pending: 0 });
        };
        if let Some(until) = entry.not_before.filter(|nb| now < *nb) {
            self.queue.requeue_front(entry);
            return Ok(TickOutcome::BackingOff { until });
        }
        if self.already_delivered(&campaign_id, &entry.id) {
            warn!(
                tenant_id = %campaign.tenant_id,
                campaign_id = %campaign_id,
                entry_id = %entry.id,
                "Entry already delivered, dropping duplicate"
            );
            return Ok(TickOutcome::DuplicateSkipped { entry_id: entry.id });
        }

        Ok(self.send_entry(&campaign, entry, now).await)
    }

    async fn send_entry(
        &self,
        campaign: &Campaign,
        mut entry: QueueEntry,
        now: DateTime<Utc>,
    ) -> TickOutcome {
        let attempt = entry.attempts + 1;
        let text = self.render(campaign, &entry);

        let started = Instant::now();
        let result = match self.instances.get(&campaign.tenant_id) {
            Some(instance) => tokio::time::timeout(
                self.transport_timeout,
                self.transport
                    .send(&instance.instance_id, &entry.recipient.phone, &text),
            )
            .await
            .unwrap_or_else(|_| {
                Err(TransportError::Timeout(
                    self.transport_timeout.as_millis() as u64,
                ))
            }),
            None => Err(TransportError::InstanceDisconnected(
                "no instance registered".into(),
            )),
        };
        metrics::histogram!("dispatch.transport_latency_ms")
            .record(started.elapsed().as_millis() as f64);

        match result {
            Ok(provider_message_id) => {
                self.last_sent.insert(campaign.id, now);
                self.write_log(
                    campaign,
                    self.log_entry(campaign, &entry, now, attempt, DeliveryOutcome::Sent {
                        provider_message_id,
                    }),
                );
                metrics::counter!("dispatch.sent").increment(1);
                debug!(
                    tenant_id = %campaign.tenant_id,
                    campaign_id = %campaign.id,
                    sequence = entry.sequence,
                    attempt,
                    "Message sent"
                );
                self.emit(campaign, EventType::MessageSent, entry.id, format!("attempt {attempt}"));
                TickOutcome::Sent {
                    entry_id: entry.id,
                    attempt,
                }
            }
            Err(err) if self.retry.should_retry(attempt) => {
                let reason = err.to_string();
                let backoff = ChronoDuration::from_std(self.retry.backoff_after(attempt))
                    .unwrap_or_else(|_| ChronoDuration::zero());
                let retry_at = now + backoff;
                self.write_log(
                    campaign,
                    self.log_entry(campaign, &entry, now, attempt, DeliveryOutcome::Failed {
                        reason: reason.clone(),
                    }),
                );
                metrics::counter!("dispatch.failed").increment(1);
                warn!(
                    tenant_id = %campaign.tenant_id,
                    campaign_id = %campaign.id,
                    entry_id = %entry.id,
                    attempt,
                    retry_at = %retry_at,
                    error = %reason,
                    "Send failed, will retry"
                );
                self.emit(campaign, EventType::MessageFailed, entry.id, reason);

                let entry_id = entry.id;
                entry.attempts = attempt;
                entry.not_before = Some(retry_at);
                self.queue.requeue_front(entry);
                TickOutcome::Failed {
                    entry_id,
                    attempt,
                    retry_at,
                }
            }
            Err(err) => {
                let reason = err.to_string();
                self.write_log(
                    campaign,
                    self.log_entry(
                        campaign,
                        &entry,
                        now,
                        attempt,
                        DeliveryOutcome::PermanentlyFailed {
                            reason: reason.clone(),
                        },
                    ),
                );
                metrics::counter!("dispatch.permanently_failed").increment(1);
                warn!(
                    tenant_id = %campaign.tenant_id,
                    campaign_id = %campaign.id,
                    entry_id = %entry.id,
                    attempt,
                    error = %reason,
                    "Send failed permanently, moving on"
                );
                self.emit(campaign, EventType::MessagePermanentlyFailed, entry.id, reason);
                TickOutcome::PermanentlyFailed {
                    entry_id: entry.id,
                    attempt,
                }
            }
        }
    }

    fn render(&self, campaign: &Campaign, entry: &QueueEntry) -> String {
        let template = campaign
            .variant(&entry.variant)
            .or_else(|| campaign.variants.first())
            .map(|v| v.template.as_str())
            .unwrap_or_default();
        let vars = TemplateVars::new()
            .with(templates::CLIENTE, entry.recipient.name.clone())
            .with(templates::TELEFONE, entry.recipient.phone.clone())
            .with(templates::CAMPANHA, campaign.name.clone());
        templates::render(template, &vars)
    }

    fn log_entry(
        &self,
        campaign: &Campaign,
        entry: &QueueEntry,
        now: DateTime<Utc>,
        attempt: u32,
        outcome: DeliveryOutcome,
    ) -> CampaignLogEntry {
        CampaignLogEntry {
            id: Uuid::new_v4(),
            tenant_id: campaign.tenant_id,
            campaign_id: Some(campaign.id),
            queue_entry_id: entry.id,
            recipient: entry.recipient.clone(),
            variant: entry.variant.clone(),
            sent_at: now,
            outcome,
            attempt,
            retry_count: attempt - 1,
            converted_at: None,
        }
    }

    /// Queue the entry behind any unwritten logs and flush in order.
    fn write_log(&self, campaign: &Campaign, log: CampaignLogEntry) {
        self.backlog.entry(campaign.id).or_default().push_back(log);
        self.flush_backlog(&campaign.id);
    }

    /// Flush parked logs left by earlier ticks and report what got through.
    fn recover_backlog(&self, campaign_id: &Uuid) -> usize {
        let tenant_id = self
            .backlog
            .get(campaign_id)
            .and_then(|b| b.front().map(|log| log.tenant_id));
        let Some(tenant_id) = tenant_id else {
            return 0;
        };
        let recovered = self.flush_backlog(campaign_id);
        if recovered > 0 {
            info!(
                tenant_id = %tenant_id,
                campaign_id = %campaign_id,
                recovered,
                "Parked log entries written"
            );
            self.event_sink.emit(make_event(
                EventType::LogWriteRecovered,
                tenant_id,
                Some(*campaign_id),
                None,
                format!("{recovered} log entries written"),
            ));
        }
        recovered
    }

    /// Write parked log entries in order until the store refuses one.
    /// Returns how many were written.
    fn flush_backlog(&self, campaign_id: &Uuid) -> usize {
        let Some(mut backlog) = self.backlog.get_mut(campaign_id) else {
            return 0;
        };
        let mut written = 0usize;

        while let Some(log) = backlog.pop_front() {
            match self.store.append_log(log.clone()) {
                Ok(()) => written += 1,
                Err(err) => {
                    let tenant_id = log.tenant_id;
                    backlog.push_front(log);
                    metrics::counter!("dispatch.log_write_failed").increment(1);
                    warn!(
                        tenant_id = %tenant_id,
                        campaign_id = %campaign_id,
                        pending = backlog.len(),
                        error = %err,
                        "Log write failed, kept for retry"
                    );
                    self.event_sink.emit(make_event(
                        EventType::LogWriteFailed,
                        tenant_id,
                        Some(*campaign_id),
                        None,
                        err.to_string(),
                    ));
                    break;
                }
            }
        }
        let empty = backlog.is_empty();
        drop(backlog);
        if empty {
            self.backlog.remove_if(campaign_id, |_, b| b.is_empty());
        }
        written
    }

    fn already_delivered(&self, campaign_id: &Uuid, entry_id: &Uuid) -> bool {
        let parked = self.backlog.get(campaign_id).is_some_and(|b| {
            b.iter()
                .any(|l| l.queue_entry_id == *entry_id && l.outcome.is_sent())
        });
        parked || self.store.has_sent_log(entry_id)
    }

    fn complete(
        &self,
        campaign: &mut Campaign,
        trigger: CampaignTrigger,
        discarded: usize,
        now: DateTime<Utc>,
    ) -> OrchestratorResult<TickOutcome> {
        self.state_machine
            .fire(&*self.store, &*self.event_sink, campaign, trigger, now)?;
        self.last_sent.remove(&campaign.id);
        self.queue.discard(&campaign.id);
        if self.pending_logs(&campaign.id) == 0 {
            self.locks.release(&campaign.id);
        }
        info!(
            tenant_id = %campaign.tenant_id,
            campaign_id = %campaign.id,
            trigger = ?trigger,
            discarded,
            "Campaign completed"
        );
        Ok(TickOutcome::Completed { trigger, discarded })
    }

    fn emit(&self, campaign: &Campaign, event_type: EventType, entry_id: Uuid, detail: String) {
        self.event_sink.emit(make_event(
            event_type,
            campaign.tenant_id,
            Some(campaign.id),
            Some(entry_id),
            detail,
        ));
    }
}
