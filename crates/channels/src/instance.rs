//! Per-tenant WhatsApp instance registry: connection lifecycle and automation
//! toggles.

use chrono::Utc;
use dashmap::DashMap;
use feedback_core::error::{OrchestratorError, OrchestratorResult};
use feedback_core::types::{Automation, AutomationSettings, InstanceStatus, WhatsappInstance};
use tracing::{info, warn};
use uuid::Uuid;

/// Valid (from, to) pairs for instance status changes.
const TRANSITIONS: &[(InstanceStatus, InstanceStatus)] = &[
    (InstanceStatus::Disconnected, InstanceStatus::Connecting),
    (InstanceStatus::Error, InstanceStatus::Connecting),
    (InstanceStatus::Connecting, InstanceStatus::Connected),
    (InstanceStatus::Connecting, InstanceStatus::Error),
    (InstanceStatus::Connected, InstanceStatus::Error),
    (InstanceStatus::Connecting, InstanceStatus::Disconnected),
    (InstanceStatus::Connected, InstanceStatus::Disconnected),
    (InstanceStatus::Error, InstanceStatus::Disconnected),
];

pub fn can_transition(from: InstanceStatus, to: InstanceStatus) -> bool {
    TRANSITIONS.iter().any(|(f, t)| *f == from && *t == to)
}

#[derive(Default)]
pub struct InstanceRegistry {
    instances: DashMap<Uuid, WhatsappInstance>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the tenant's instance in `Disconnected`.
    pub fn register(&self, tenant_id: Uuid, instance_id: impl Into<String>) -> WhatsappInstance {
        let instance = WhatsappInstance {
            tenant_id,
            instance_id: instance_id.into(),
            status: InstanceStatus::Disconnected,
            last_error: None,
            automations: AutomationSettings::default(),
            connected_at: None,
            updated_at: Utc::now(),
        };
        info!(
            tenant_id = %tenant_id,
            instance_id = %instance.instance_id,
            "WhatsApp instance registered"
        );
        self.instances.insert(tenant_id, instance.clone());
        instance
    }

    pub fn get(&self, tenant_id: &Uuid) -> Option<WhatsappInstance> {
        self.instances.get(tenant_id).map(|i| i.clone())
    }

    pub fn remove(&self, tenant_id: &Uuid) -> Option<WhatsappInstance> {
        self.instances.remove(tenant_id).map(|(_, i)| i)
    }

    /// The tenant's instance id, only while it is connected.
    pub fn connected_instance_id(&self, tenant_id: &Uuid) -> Option<String> {
        self.instances
            .get(tenant_id)
            .filter(|i| i.status == InstanceStatus::Connected)
            .map(|i| i.instance_id.clone())
    }

    /// Whether the instance with this id is currently connected.
    pub fn is_connected(&self, instance_id: &str) -> bool {
        self.instances
            .iter()
            .any(|i| i.instance_id == instance_id && i.status == InstanceStatus::Connected)
    }

    pub fn request_connect(&self, tenant_id: &Uuid) -> OrchestratorResult<WhatsappInstance> {
        self.transition(tenant_id, InstanceStatus::Connecting, None)
    }

    pub fn mark_connected(&self, tenant_id: &Uuid) -> OrchestratorResult<WhatsappInstance> {
        self.transition(tenant_id, InstanceStatus::Connected, None)
    }

    pub fn mark_error(
        &self,
        tenant_id: &Uuid,
        reason: impl Into<String>,
    ) -> OrchestratorResult<WhatsappInstance> {
        self.transition(tenant_id, InstanceStatus::Error, Some(reason.into()))
    }

    pub fn disconnect(&self, tenant_id: &Uuid) -> OrchestratorResult<WhatsappInstance> {
        self.transition(tenant_id, InstanceStatus::Disconnected, None)
    }

    /// Replace the automation toggles. An enabled automation needs a template.
    pub fn update_automations(
        &self,
        tenant_id: &Uuid,
        settings: AutomationSettings,
    ) -> OrchestratorResult<WhatsappInstance> {
        for (name, automation) in [
            ("prize_message", &settings.prize_message),
            ("detractor_message", &settings.detractor_message),
            ("periodic_reports", &settings.periodic_reports),
        ] {
            validate_automation(name, automation)?;
        }

        let mut instance = self
            .instances
            .get_mut(tenant_id)
            .ok_or_else(|| OrchestratorError::not_found("whatsapp instance", *tenant_id))?;
        instance.automations = settings;
        instance.updated_at = Utc::now();
        info!(tenant_id = %tenant_id, "WhatsApp automations updated");
        Ok(instance.clone())
    }

    fn transition(
        &self,
        tenant_id: &Uuid,
        to: InstanceStatus,
        error: Option<String>,
    ) -> OrchestratorResult<WhatsappInstance> {
        let mut instance = self
            .instances
            .get_mut(tenant_id)
            .ok_or_else(|| OrchestratorError::not_found("whatsapp instance", *tenant_id))?;

        let from = instance.status;
        if !can_transition(from, to) {
            return Err(OrchestratorError::StateConflict(format!(
                "WhatsApp instance cannot move from {from:?} to {to:?}"
            )));
        }

        let now = Utc::now();
        instance.status = to;
        instance.updated_at = now;
        match to {
            InstanceStatus::Connected => {
                instance.connected_at = Some(now);
                instance.last_error = None;
            }
            InstanceStatus::Error => {
                warn!(tenant_id = %tenant_id, error = ?error, "WhatsApp instance error");
                instance.last_error = error;
            }
            InstanceStatus::Disconnected => instance.connected_at = None,
            InstanceStatus::Connecting => {}
        }

        info!(tenant_id = %tenant_id, from = ?from, to = ?to, "WhatsApp instance status changed");
        Ok(instance.clone())
    }
}

fn validate_automation(name: &str, automation: &Automation) -> OrchestratorResult<()> {
    if automation.enabled && automation.template.trim().is_empty() {
        return Err(OrchestratorError::Validation(format!(
            "{name} is enabled but has no template"
        )));
    }
    Ok(())
}
