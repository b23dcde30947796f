use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A donor record belonging to one organization. The gift metrics are
/// maintained by the donor-metrics updater and only read by segment rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Donor {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub status: DonorStatus,
    #[serde(default)]
    pub retention_risk: RetentionRisk,
    #[serde(default)]
    pub total_gifts: u32,
    #[serde(default)]
    pub total_amount: f64,
    #[serde(default)]
    pub last_gift_date: Option<DateTime<Utc>>,
}

impl Donor {
    pub fn new(
        organization_id: Uuid,
        first_name: impl Into<String>,
        last_name: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            organization_id,
            first_name: first_name.into(),
            last_name: last_name.into(),
            email: None,
            status: DonorStatus::Active,
            retention_risk: RetentionRisk::Unknown,
            total_gifts: 0,
            total_amount: 0.0,
            last_gift_date: None,
        }
    }

    pub fn summary(&self) -> DonorSummary {
        DonorSummary {
            id: self.id,
            name: format!("{} {}", self.first_name, self.last_name),
            email: self.email.clone(),
            status: self.status,
            retention_risk: self.retention_risk,
            total_gifts: self.total_gifts,
            total_amount: self.total_amount,
            last_gift_date: self.last_gift_date,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DonorStatus {
    #[default]
    Active,
    Lapsed,
    Inactive,
    DoNotContact,
}

/// Classification derived from recency of giving.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetentionRisk {
    Low,
    Medium,
    High,
    Critical,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Donation {
    pub id: Uuid,
    pub donor_id: Uuid,
    pub amount: f64,
    #[serde(rename = "type", default)]
    pub donation_type: DonationType,
    pub date: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DonationType {
    #[default]
    OneTime,
    Recurring,
    Pledge,
    InKind,
}

/// A named, rule-defined subset of an organization's donors.
///
/// `rules` is the persisted rule document and the only source of truth;
/// `member_count` and `last_calculated` are caches written by membership sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub rules: serde_json::Value,
    #[serde(default)]
    pub member_count: u64,
    #[serde(default)]
    pub last_calculated: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A (segment, donor) membership fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentMember {
    pub segment_id: Uuid,
    pub donor_id: Uuid,
}

/// Compact donor view returned by previews and member listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DonorSummary {
    pub id: Uuid,
    pub name: String,
    pub email: Option<String>,
    pub status: DonorStatus,
    pub retention_risk: RetentionRisk,
    pub total_gifts: u32,
    pub total_amount: f64,
    pub last_gift_date: Option<DateTime<Utc>>,
}
