//! Derived donor metrics, recalculated whenever a donation changes.
//!
//! The donation write and the metric update commit together. Segment
//! membership for the donor is refreshed afterwards, outside that
//! transaction.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use donor_core::config::RetentionConfig;
use donor_core::types::{Donation, Donor, RetentionRisk};
use donor_core::{SegmentError, SegmentResult};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use crate::store::{SegmentReader, SegmentStore, SegmentTx};
use crate::sync::{MembershipSynchronizer, RefreshOutcome};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DonorMetrics {
    pub total_gifts: u32,
    pub total_amount: f64,
    pub last_gift_date: Option<DateTime<Utc>>,
    pub retention_risk: RetentionRisk,
}

impl DonorMetrics {
    fn apply(&self, donor: &mut Donor) {
        donor.total_gifts = self.total_gifts;
        donor.total_amount = self.total_amount;
        donor.last_gift_date = self.last_gift_date;
        donor.retention_risk = self.retention_risk;
    }
}

/// Aggregate a donor's donations as of `now`.
pub fn compute_metrics(
    donations: &[Donation],
    now: DateTime<Utc>,
    retention: &RetentionConfig,
) -> DonorMetrics {
    let last_gift_date = donations.iter().map(|d| d.date).max();
    DonorMetrics {
        total_gifts: u32::try_from(donations.len()).unwrap_or(u32::MAX),
        total_amount: donations.iter().map(|d| d.amount).sum(),
        last_gift_date,
        retention_risk: classify_risk(last_gift_date, now, retention),
    }
}

/// Risk bucket by whole days since the last gift.
pub fn classify_risk(
    last_gift_date: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    retention: &RetentionConfig,
) -> RetentionRisk {
    let Some(last) = last_gift_date else {
        return RetentionRisk::Unknown;
    };
    let days = (now - last).num_days();
    if days <= retention.low_max_days {
        RetentionRisk::Low
    } else if days <= retention.medium_max_days {
        RetentionRisk::Medium
    } else if days <= retention.high_max_days {
        RetentionRisk::High
    } else {
        RetentionRisk::Critical
    }
}

/// Result of a donation write: the donor as committed, plus the membership
/// refresh that followed. `refresh` is `None` when the refresh failed; the
/// failure is logged and the committed write stands.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsUpdate {
    pub donor: Donor,
    pub refresh: Option<RefreshOutcome>,
}

pub struct DonorMetricsUpdater<S> {
    sync: Arc<MembershipSynchronizer<S>>,
    retention: RetentionConfig,
}

impl<S: SegmentStore> DonorMetricsUpdater<S> {
    pub fn new(sync: Arc<MembershipSynchronizer<S>>, retention: RetentionConfig) -> Self {
        Self { sync, retention }
    }

    pub fn record_donation(&self, donation: Donation) -> SegmentResult<MetricsUpdate> {
        validate_amount(&donation)?;
        let donor_id = donation.donor_id;
        self.commit(donor_id, |tx| tx.insert_donation(donation))
    }

    /// Replace a donation. Moving a donation to another donor is rejected.
    pub fn update_donation(&self, donation: Donation) -> SegmentResult<MetricsUpdate> {
        validate_amount(&donation)?;
        let donor_id = donation.donor_id;
        self.commit(donor_id, |tx| {
            let existing = tx
                .donation(donation.id)?
                .ok_or_else(|| SegmentError::not_found("donation", donation.id))?;
            if existing.donor_id != donation.donor_id {
                return Err(SegmentError::Invalid(format!(
                    "donation {} belongs to donor {}",
                    donation.id, existing.donor_id
                )));
            }
            tx.update_donation(donation)
        })
    }

    pub fn delete_donation(&self, donation_id: Uuid) -> SegmentResult<MetricsUpdate> {
        let donor_id = self
            .sync
            .store()
            .read(|r| r.donation(donation_id))?
            .map(|d| d.donor_id)
            .ok_or_else(|| SegmentError::not_found("donation", donation_id))?;
        self.commit(donor_id, |tx| tx.delete_donation(donation_id).map(|_| ()))
    }

    /// Recompute metrics from scratch, e.g. to age retention risk.
    pub fn recalculate(&self, donor_id: Uuid) -> SegmentResult<MetricsUpdate> {
        self.commit(donor_id, |_| Ok(()))
    }

    fn commit(
        &self,
        donor_id: Uuid,
        write: impl FnOnce(&mut dyn SegmentTx) -> SegmentResult<()>,
    ) -> SegmentResult<MetricsUpdate> {
        let now = Utc::now();
        let donor = self.sync.store().transaction(|tx| {
            let mut donor = tx
                .donor(donor_id)?
                .ok_or_else(|| SegmentError::not_found("donor", donor_id))?;
            write(&mut *tx)?;

            let metrics = compute_metrics(&tx.donations_for_donor(donor_id)?, now, &self.retention);
            metrics.apply(&mut donor);
            tx.upsert_donor(donor.clone())?;
            Ok(donor)
        })?;

        info!(
            donor_id = %donor_id,
            total_gifts = donor.total_gifts,
            total_amount = donor.total_amount,
            retention_risk = ?donor.retention_risk,
            "Donor metrics updated"
        );

        let refresh = match self.sync.refresh_for_donor(donor_id) {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                error!(donor_id = %donor_id, error = %e, "Segment refresh after donation change failed");
                None
            }
        };
        Ok(MetricsUpdate { donor, refresh })
    }
}

fn validate_amount(donation: &Donation) -> SegmentResult<()> {
    if donation.amount.is_finite() && donation.amount >= 0.0 {
        Ok(())
    } else {
        Err(SegmentError::Invalid(format!(
            "donation amount must be a non-negative number, got {}",
            donation.amount
        )))
    }
}
