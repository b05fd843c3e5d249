//! Automated WhatsApp messages driven by the tenant's automation toggles:
//! prize notifications after a winning spin and recovery messages for survey
//! detractors.

use crate::instance::InstanceRegistry;
use crate::transport::MessageTransport;
use feedback_core::error::{OrchestratorResult, TransportError};
use feedback_core::templates::{self, TemplateVars};
use feedback_core::types::{Automation, Respondent};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Highest NPS score (0-10) that counts as a detractor.
pub const DETRACTOR_MAX_SCORE: u8 = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    NoInstance,
    Disabled,
    NoPhone,
    NotDetractor,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationOutcome {
    Sent { provider_message_id: String },
    Skipped(SkipReason),
}

pub struct AutomationNotifier {
    instances: Arc<InstanceRegistry>,
    transport: Arc<dyn MessageTransport>,
    timeout: Duration,
}

impl AutomationNotifier {
    pub fn new(
        instances: Arc<InstanceRegistry>,
        transport: Arc<dyn MessageTransport>,
        timeout: Duration,
    ) -> Self {
        Self {
            instances,
            transport,
            timeout,
        }
    }

    /// Tell a respondent what they won, if the tenant enabled prize messages.
    pub async fn notify_prize(
        &self,
        tenant_id: &Uuid,
        respondent: &Respondent,
        prize: &str,
        coupon_code: &str,
    ) -> OrchestratorResult<NotificationOutcome> {
        let vars = TemplateVars::new()
            .with(templates::CLIENTE, respondent.name.clone())
            .with(templates::PREMIO, prize)
            .with(templates::CUPOM, coupon_code);
        self.notify(tenant_id, respondent, vars, |a| &a.prize_message)
            .await
    }

    /// Follow up with a respondent whose survey score marks them a detractor.
    pub async fn notify_detractor(
        &self,
        tenant_id: &Uuid,
        respondent: &Respondent,
        score: u8,
    ) -> OrchestratorResult<NotificationOutcome> {
        if score > DETRACTOR_MAX_SCORE {
            return Ok(NotificationOutcome::Skipped(SkipReason::NotDetractor));
        }
        let vars = TemplateVars::new()
            .with(templates::CLIENTE, respondent.name.clone())
            .with(templates::NOTA, score.to_string());
        self.notify(tenant_id, respondent, vars, |a| &a.detractor_message)
            .await
    }

    async fn notify(
        &self,
        tenant_id: &Uuid,
        respondent: &Respondent,
        vars: TemplateVars,
        pick: impl Fn(&feedback_core::types::AutomationSettings) -> &Automation,
    ) -> OrchestratorResult<NotificationOutcome> {
        let Some(instance) = self.instances.get(tenant_id) else {
            return Ok(NotificationOutcome::Skipped(SkipReason::NoInstance));
        };
        let automation = pick(&instance.automations);
        if !automation.enabled {
            return Ok(NotificationOutcome::Skipped(SkipReason::Disabled));
        }
        let Some(phone) = respondent.phone.as_deref() else {
            debug!(tenant_id = %tenant_id, respondent = %respondent.respondent_ref, "No phone, skipping automation");
            return Ok(NotificationOutcome::Skipped(SkipReason::NoPhone));
        };

        let text = templates::render(&automation.template, &vars);
        let sent = tokio::time::timeout(
            self.timeout,
            self.transport.send(&instance.instance_id, phone, &text),
        )
        .await
        .map_err(|_| TransportError::Timeout(self.timeout.as_millis() as u64))??;

        info!(
            tenant_id = %tenant_id,
            respondent = %respondent.respondent_ref,
            "Automation message sent"
        );
        Ok(NotificationOutcome::Sent {
            provider_message_id: sent,
        })
    }
}
