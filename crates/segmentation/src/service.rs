//! Segment CRUD on top of the synchronizer.
//!
//! Every write that changes rules validates them first, then persists the
//! segment and reconciles its membership in the same transaction.

use std::sync::Arc;

use chrono::Utc;
use donor_core::config::SegmentsConfig;
use donor_core::event_bus::WorkflowSink;
use donor_core::types::{DonorSummary, Segment};
use donor_core::{SegmentError, SegmentResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::store::{SegmentReader, SegmentStore};
use crate::sync::{compile_rules, reconcile, record_sync, MembershipSynchronizer, Preview};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSegment {
    pub organization_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub rules: Value,
}

/// Partial update; absent fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub rules: Option<Value>,
}

pub struct SegmentService<S> {
    sync: Arc<MembershipSynchronizer<S>>,
    resync_on_read: bool,
}

impl<S: SegmentStore> SegmentService<S> {
    pub fn new(store: Arc<S>, workflows: Arc<dyn WorkflowSink>, config: &SegmentsConfig) -> Self {
        let sync = MembershipSynchronizer::new(store)
            .with_workflow_sink(workflows)
            .with_preview_limit(config.preview_limit);
        Self {
            sync: Arc::new(sync),
            resync_on_read: config.resync_on_read,
        }
    }

    pub fn synchronizer(&self) -> &Arc<MembershipSynchronizer<S>> {
        &self.sync
    }

    pub fn create_segment(&self, new: NewSegment) -> SegmentResult<Segment> {
        let name = validate_name(&new.name)?;
        let predicate = compile_rules(&new.rules)?;

        let now = Utc::now();
        let segment = Segment {
            id: Uuid::new_v4(),
            organization_id: new.organization_id,
            name,
            description: new.description,
            rules: new.rules,
            member_count: 0,
            last_calculated: None,
            created_at: now,
            updated_at: now,
        };
        let segment_id = segment.id;

        let lock = self.sync.segment_lock(segment_id);
        let _guard = lock.lock();
        let (outcome, created) = self.sync.store().transaction(|tx| {
            tx.insert_segment(segment)?;
            let outcome = reconcile(tx, segment_id, new.organization_id, &predicate, now)?;
            Ok((outcome, fetch(&*tx, new.organization_id, segment_id)?))
        })?;

        record_sync(&outcome);
        info!(
            segment_id = %segment_id,
            organization_id = %created.organization_id,
            name = %created.name,
            "Segment created"
        );
        Ok(created)
    }

    /// Apply `update`. Membership is re-synced only when the rule document
    /// actually changed.
    pub fn update_segment(
        &self,
        organization_id: Uuid,
        segment_id: Uuid,
        update: SegmentUpdate,
    ) -> SegmentResult<Segment> {
        let name = update.name.as_deref().map(validate_name).transpose()?;
        let predicate = update.rules.as_ref().map(compile_rules).transpose()?;

        let lock = self.sync.segment_lock(segment_id);
        let _guard = lock.lock();
        let (outcome, updated) = self.sync.store().transaction(|tx| {
            let mut segment = fetch(&*tx, organization_id, segment_id)?;
            let now = Utc::now();

            if let Some(name) = name {
                segment.name = name;
            }
            if let Some(description) = update.description {
                segment.description = Some(description);
            }
            let rules_changed = match update.rules {
                Some(rules) if rules != segment.rules => {
                    segment.rules = rules;
                    true
                }
                _ => false,
            };
            segment.updated_at = now;
            tx.update_segment(segment)?;

            let outcome = match (&predicate, rules_changed) {
                (Some(predicate), true) => {
                    Some(reconcile(tx, segment_id, organization_id, predicate, now)?)
                }
                _ => None,
            };
            Ok((outcome, fetch(&*tx, organization_id, segment_id)?))
        })?;

        if let Some(outcome) = &outcome {
            record_sync(outcome);
        }
        info!(
            segment_id = %segment_id,
            resynced = outcome.is_some(),
            "Segment updated"
        );
        Ok(updated)
    }

    /// Fetch a segment, re-syncing it first when asked to (or when
    /// configured to always do so).
    pub fn get_segment(
        &self,
        organization_id: Uuid,
        segment_id: Uuid,
        resync: bool,
    ) -> SegmentResult<Segment> {
        let segment = self
            .sync
            .store()
            .read(|r| fetch(r, organization_id, segment_id))?;
        if !(resync || self.resync_on_read) {
            return Ok(segment);
        }

        self.sync
            .sync(segment_id, organization_id, &segment.rules)?;
        self.sync
            .store()
            .read(|r| fetch(r, organization_id, segment_id))
    }

    /// Segments of an organization ordered by name.
    pub fn list_segments(&self, organization_id: Uuid) -> SegmentResult<Vec<Segment>> {
        let mut segments = self
            .sync
            .store()
            .read(|r| r.segments_for_organization(organization_id))?;
        segments.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        Ok(segments)
    }

    pub fn delete_segment(&self, organization_id: Uuid, segment_id: Uuid) -> SegmentResult<()> {
        {
            let lock = self.sync.segment_lock(segment_id);
            let _guard = lock.lock();
            self.sync.store().transaction(|tx| {
                fetch(&*tx, organization_id, segment_id)?;
                tx.delete_segment(segment_id)
            })?;
        }
        self.sync.forget_segment(segment_id);
        info!(segment_id = %segment_id, "Segment deleted");
        Ok(())
    }

    /// Summaries of the donors currently stored as members, ordered by id.
    pub fn segment_members(
        &self,
        organization_id: Uuid,
        segment_id: Uuid,
    ) -> SegmentResult<Vec<DonorSummary>> {
        self.sync.store().read(|r| {
            fetch(r, organization_id, segment_id)?;
            let mut members = Vec::new();
            for donor_id in r.member_ids(segment_id)? {
                if let Some(donor) = r.donor(donor_id)? {
                    members.push(donor.summary());
                }
            }
            Ok(members)
        })
    }

    pub fn preview(&self, organization_id: Uuid, rules: &Value) -> SegmentResult<Preview> {
        self.sync.preview(organization_id, rules)
    }
}

/// A segment that belongs to `organization_id`. Segments of other
/// organizations are reported as missing.
fn fetch<R: SegmentReader + ?Sized>(
    reader: &R,
    organization_id: Uuid,
    segment_id: Uuid,
) -> SegmentResult<Segment> {
    reader
        .segment(segment_id)?
        .filter(|s| s.organization_id == organization_id)
        .ok_or_else(|| SegmentError::not_found("segment", segment_id))
}

fn validate_name(name: &str) -> SegmentResult<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(SegmentError::Invalid("segment name must not be empty".into()));
    }
    Ok(trimmed.to_string())
}
