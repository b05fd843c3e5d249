use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{OrchestratorError, OrchestratorResult};

// ─── Campaigns ──────────────────────────────────────────────────────────────

/// Campaign lifecycle status. Closed set; transitions live in the campaign
/// state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Running,
    Paused,
    Completed,
    Cancelled,
}

impl CampaignStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// One A/B message template of a campaign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageVariant {
    pub key: String,
    pub template: String,
    /// Relative share of recipients assigned to this variant.
    pub weight: u32,
}

impl MessageVariant {
    pub fn new(key: impl Into<String>, template: impl Into<String>, weight: u32) -> Self {
        Self {
            key: key.into(),
            template: template.into(),
            weight,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub status: CampaignStatus,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub message_delay_seconds: u32,
    pub variants: Vec<MessageVariant>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    pub fn variant(&self, key: &str) -> Option<&MessageVariant> {
        self.variants.iter().find(|v| v.key == key)
    }
}

/// Who owns a campaign as it arrives at the boundary. Rows created during the
/// legacy migration window carry no tenant and are never accepted again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "tenant_id")]
pub enum CampaignOwnership {
    Tenant(Uuid),
    LegacyUnowned,
}

impl From<Option<Uuid>> for CampaignOwnership {
    fn from(tenant_id: Option<Uuid>) -> Self {
        tenant_id.map_or(Self::LegacyUnowned, Self::Tenant)
    }
}

/// Operator input for a new campaign, validated into a [`Campaign`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCampaign {
    pub owner: CampaignOwnership,
    pub name: String,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub message_delay_seconds: i64,
    pub variants: Vec<MessageVariant>,
}

impl NewCampaign {
    pub fn validate(self, now: DateTime<Utc>) -> OrchestratorResult<Campaign> {
        let tenant_id = match self.owner {
            CampaignOwnership::Tenant(id) => id,
            CampaignOwnership::LegacyUnowned => {
                return Err(OrchestratorError::Validation(
                    "campaign requires an owning tenant".into(),
                ))
            }
        };
        if self.name.trim().is_empty() {
            return Err(OrchestratorError::Validation(
                "campaign name must not be empty".into(),
            ));
        }
        if self.message_delay_seconds < 0 {
            return Err(OrchestratorError::Validation(format!(
                "message_delay_seconds must be >= 0, got {}",
                self.message_delay_seconds
            )));
        }
        let message_delay_seconds = u32::try_from(self.message_delay_seconds).map_err(|_| {
            OrchestratorError::Validation("message_delay_seconds is too large".into())
        })?;
        validate_dates(self.start_date, self.end_date)?;
        validate_variants(&self.variants)?;

        Ok(Campaign {
            id: Uuid::new_v4(),
            tenant_id,
            name: self.name,
            status: CampaignStatus::Draft,
            start_date: self.start_date,
            end_date: self.end_date,
            message_delay_seconds,
            variants: self.variants,
            created_at: now,
            updated_at: now,
        })
    }
}

pub fn validate_dates(
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> OrchestratorResult<()> {
    if let (Some(start), Some(end)) = (start, end) {
        if end < start {
            return Err(OrchestratorError::Validation(format!(
                "end_date {end} is before start_date {start}"
            )));
        }
    }
    Ok(())
}

pub fn validate_variants(variants: &[MessageVariant]) -> OrchestratorResult<()> {
    if variants.is_empty() {
        return Err(OrchestratorError::Validation(
            "campaign needs at least one message variant".into(),
        ));
    }
    for (i, variant) in variants.iter().enumerate() {
        if variant.key.trim().is_empty() {
            return Err(OrchestratorError::Validation(
                "variant key must not be empty".into(),
            ));
        }
        if variant.template.trim().is_empty() {
            return Err(OrchestratorError::Validation(format!(
                "variant {} has an empty template",
                variant.key
            )));
        }
        if variants[..i].iter().any(|v| v.key == variant.key) {
            return Err(OrchestratorError::Validation(format!(
                "duplicate variant key {}",
                variant.key
            )));
        }
    }
    if variants.iter().all(|v| v.weight == 0) {
        return Err(OrchestratorError::Validation(
            "variant weights must not all be zero".into(),
        ));
    }
    Ok(())
}

/// A person a campaign message is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    /// Stable respondent identity used for conversion attribution.
    pub respondent_ref: String,
    pub name: String,
    pub phone: String,
}

impl Recipient {
    pub fn new(
        respondent_ref: impl Into<String>,
        name: impl Into<String>,
        phone: impl Into<String>,
    ) -> Self {
        Self {
            respondent_ref: respondent_ref.into(),
            name: name.into(),
            phone: phone.into(),
        }
    }
}

// ─── Dispatch log ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum DeliveryOutcome {
    Sent { provider_message_id: String },
    Failed { reason: String },
    PermanentlyFailed { reason: String },
}

impl DeliveryOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, Self::Sent { .. })
    }
}

/// One attempted dispatch of a queue entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignLogEntry {
    pub id: Uuid,
    pub tenant_id: Uuid,
    /// Nulled when the campaign is deleted; the log outlives it.
    pub campaign_id: Option<Uuid>,
    pub queue_entry_id: Uuid,
    pub recipient: Recipient,
    pub variant: String,
    pub sent_at: DateTime<Utc>,
    pub outcome: DeliveryOutcome,
    /// 1-based attempt number for this queue entry.
    pub attempt: u32,
    pub retry_count: u32,
    pub converted_at: Option<DateTime<Utc>>,
}

// ─── Rewards ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum RewardValue {
    Monetary { amount_cents: i64, currency: String },
    Percentage { percent: u8 },
    Descriptive { text: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reward {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub value: RewardValue,
    pub condition: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Reward {
    /// Human readable prize text, substituted for `{{premio}}`.
    pub fn description(&self) -> String {
        match &self.value {
            RewardValue::Monetary {
                amount_cents,
                currency,
            } => format!(
                "{} ({} {}.{:02})",
                self.name,
                currency,
                amount_cents / 100,
                amount_cents.rem_euclid(100)
            ),
            RewardValue::Percentage { percent } => format!("{} ({}% off)", self.name, percent),
            RewardValue::Descriptive { text } => format!("{} ({})", self.name, text),
        }
    }
}

/// Where a wheel spin or coupon originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Origin {
    Campaign {
        campaign_id: Uuid,
    },
    Survey {
        survey_id: Uuid,
        campaign_id: Option<Uuid>,
    },
}

impl Origin {
    /// Campaign the origin is attributed to, if any.
    pub fn campaign_id(&self) -> Option<Uuid> {
        match self {
            Self::Campaign { campaign_id } => Some(*campaign_id),
            Self::Survey { campaign_id, .. } => *campaign_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrizeSlot {
    pub id: Uuid,
    pub wheel_id: Uuid,
    pub label: String,
    /// `None` for a no-prize slot or after the reward was deleted.
    pub reward_id: Option<Uuid>,
    pub is_no_prize_option: bool,
    pub weight: u32,
    pub active: bool,
}

impl PrizeSlot {
    /// Whether landing on this slot wins nothing redeemable.
    pub fn is_no_prize(&self) -> bool {
        self.is_no_prize_option || self.reward_id.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrizeWheel {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub origin: Origin,
    pub slots: Vec<PrizeSlot>,
    pub created_at: DateTime<Utc>,
}

// ─── Coupons ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CouponStatus {
    Issued,
    Used,
    Expired,
    Cancelled,
}

/// The person a coupon is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Respondent {
    pub respondent_ref: String,
    pub name: String,
    pub phone: Option<String>,
}

impl Respondent {
    pub fn new(respondent_ref: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            respondent_ref: respondent_ref.into(),
            name: name.into(),
            phone: None,
        }
    }

    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Coupon {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub code: String,
    /// `None` marks a non-redeemable receipt issued for a no-prize outcome.
    pub reward_id: Option<Uuid>,
    /// Prize text as it read when the coupon was issued.
    pub reward_description: Option<String>,
    pub respondent: Respondent,
    pub origin: Origin,
    pub wheel_id: Option<Uuid>,
    pub slot_id: Option<Uuid>,
    pub status: CouponStatus,
    pub cancellation_reason: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl Coupon {
    pub fn is_receipt(&self) -> bool {
        self.reward_id.is_none()
    }
}

// ─── WhatsApp instances ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Automation {
    pub enabled: bool,
    pub template: String,
}

impl Automation {
    pub fn enabled(template: impl Into<String>) -> Self {
        Self {
            enabled: true,
            template: template.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutomationSettings {
    pub prize_message: Automation,
    pub detractor_message: Automation,
    pub periodic_reports: Automation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhatsappInstance {
    pub tenant_id: Uuid,
    pub instance_id: String,
    pub status: InstanceStatus,
    pub last_error: Option<String>,
    pub automations: AutomationSettings,
    pub connected_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}
