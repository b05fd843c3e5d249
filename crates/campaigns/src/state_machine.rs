use chrono::{DateTime, Utc};
use feedback_core::error::{OrchestratorError, OrchestratorResult};
use feedback_core::event_bus::{make_event, EventSink, EventType};
use feedback_core::store::CampaignRepository;
use feedback_core::types::{Campaign, CampaignStatus};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Events that can move a campaign between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignTrigger {
    Schedule,
    StartDue,
    Pause,
    Resume,
    QueueExhausted,
    EndDateReached,
    Cancel,
}

/// Describes a single valid state transition for a campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: CampaignStatus,
    pub to: CampaignStatus,
    pub trigger: CampaignTrigger,
}

/// Result of applying a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Moved {
        from: CampaignStatus,
        to: CampaignStatus,
    },
    /// The campaign already sits in the terminal state the trigger leads to.
    Unchanged(CampaignStatus),
}

impl TransitionOutcome {
    pub fn status(&self) -> CampaignStatus {
        match self {
            Self::Moved { to, .. } => *to,
            Self::Unchanged(status) => *status,
        }
    }

    pub fn changed(&self) -> bool {
        matches!(self, Self::Moved { .. })
    }
}

/// Guards campaign lifecycle by enforcing a fixed set of transitions.
/// Guards that need data (future start date, due time) are checked by the
/// callers before firing the trigger.
#[derive(Debug, Clone)]
pub struct CampaignStateMachine {
    transitions: Vec<StateTransition>,
}

impl CampaignStateMachine {
    pub fn new() -> Self {
        use CampaignStatus::*;
        use CampaignTrigger::*;

        let mut transitions = vec![
            StateTransition { from: Draft, to: Scheduled, trigger: Schedule },
            StateTransition { from: Scheduled, to: Running, trigger: StartDue },
            StateTransition { from: Running, to: Paused, trigger: Pause },
            StateTransition { from: Paused, to: Running, trigger: Resume },
            StateTransition { from: Running, to: Completed, trigger: QueueExhausted },
            StateTransition { from: Running, to: Completed, trigger: EndDateReached },
        ];
        for from in [Draft, Scheduled, Running, Paused] {
            transitions.push(StateTransition { from, to: Cancelled, trigger: Cancel });
        }

        Self { transitions }
    }

    pub fn transitions(&self) -> &[StateTransition] {
        &self.transitions
    }

    pub fn can_fire(&self, from: CampaignStatus, trigger: CampaignTrigger) -> bool {
        self.target(from, trigger).is_some()
    }

    fn target(&self, from: CampaignStatus, trigger: CampaignTrigger) -> Option<CampaignStatus> {
        self.transitions
            .iter()
            .find(|t| t.from == from && t.trigger == trigger)
            .map(|t| t.to)
    }

    /// Apply `trigger` to a campaign in `from`. Re-firing the trigger that
    /// produced a terminal state is a no-op; anything else from a terminal
    /// state is a conflict.
    pub fn apply(
        &self,
        from: CampaignStatus,
        trigger: CampaignTrigger,
    ) -> OrchestratorResult<TransitionOutcome> {
        if let Some(to) = self.target(from, trigger) {
            return Ok(TransitionOutcome::Moved { from, to });
        }
        let idempotent = matches!(
            (from, trigger),
            (CampaignStatus::Cancelled, CampaignTrigger::Cancel)
                | (CampaignStatus::Completed, CampaignTrigger::QueueExhausted)
                | (CampaignStatus::Completed, CampaignTrigger::EndDateReached)
        );
        if idempotent {
            return Ok(TransitionOutcome::Unchanged(from));
        }
        Err(OrchestratorError::StateConflict(format!(
            "cannot {trigger:?} a campaign in status {}",
            from.as_str()
        )))
    }

    /// Apply `trigger` to `campaign`, persist the new status, and announce
    /// it. `campaign` is only updated once the store accepted the change.
    pub fn fire<S>(
        &self,
        store: &S,
        sink: &dyn EventSink,
        campaign: &mut Campaign,
        trigger: CampaignTrigger,
        now: DateTime<Utc>,
    ) -> OrchestratorResult<TransitionOutcome>
    where
        S: CampaignRepository + ?Sized,
    {
        let outcome = self.apply(campaign.status, trigger)?;
        if let TransitionOutcome::Moved { from, to } = outcome {
            let mut updated = campaign.clone();
            updated.status = to;
            updated.updated_at = now;
            store.update_campaign(&updated)?;
            *campaign = updated;

            info!(
                tenant_id = %campaign.tenant_id,
                campaign_id = %campaign.id,
                from = from.as_str(),
                to = to.as_str(),
                trigger = ?trigger,
                "Campaign status changed"
            );
            metrics::counter!("campaign.transitions", "to" => to.as_str()).increment(1);
            sink.emit(make_event(
                EventType::CampaignTransitioned,
                campaign.tenant_id,
                Some(campaign.id),
                None,
                format!("{} -> {}", from.as_str(), to.as_str()),
            ));
        }
        Ok(outcome)
    }
}

impl Default for CampaignStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
