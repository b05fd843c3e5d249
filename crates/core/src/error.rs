use thiserror::Error;
use uuid::Uuid;

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("State conflict: {0}")]
    StateConflict(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Invalid wheel configuration: {0}")]
    InvalidWheelConfiguration(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("{entity} {id} does not belong to tenant {tenant_id}")]
    TenantMismatch {
        entity: &'static str,
        id: Uuid,
        tenant_id: Uuid,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl OrchestratorError {
    pub fn not_found(entity: &'static str, id: Uuid) -> Self {
        Self::NotFound { entity, id }
    }

    /// True for errors the dispatcher treats as retryable send failures.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Outcome of a failed call to the messaging transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport timed out after {0} ms")]
    Timeout(u64),

    #[error("recipient number rejected: {0}")]
    RejectedNumber(String),

    #[error("WhatsApp instance {0} is not connected")]
    InstanceDisconnected(String),

    #[error("provider error: {0}")]
    Provider(String),
}

/// Reject an entity that belongs to a different tenant than the caller's.
pub fn ensure_tenant(
    entity: &'static str,
    id: Uuid,
    owner: Uuid,
    tenant_id: Uuid,
) -> OrchestratorResult<()> {
    if owner == tenant_id {
        Ok(())
    } else {
        Err(OrchestratorError::TenantMismatch {
            entity,
            id,
            tenant_id,
        })
    }
}
