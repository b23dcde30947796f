//! Membership synchronizer: keeps the segment join table in line with live
//! rule evaluation.
//!
//! Full syncs diff the matching donor set against stored membership inside
//! one transaction. Donor refreshes re-test a single donor against every
//! segment of its organization and report entries and exits; entries fire a
//! SEGMENT_ENTRY workflow trigger once the transaction has committed.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use donor_core::config::DEFAULT_PREVIEW_LIMIT;
use donor_core::event_bus::{noop_sink, WorkflowSink, WorkflowTrigger};
use donor_core::types::{Donor, DonorSummary, Segment};
use donor_core::{SegmentError, SegmentResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::compiler::RuleCompiler;
use crate::predicates::{DonorFacts, Predicate};
use crate::store::{SegmentReader, SegmentStore, SegmentTx};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    pub segment_id: Uuid,
    pub added_count: usize,
    pub removed_count: usize,
    pub total_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preview {
    pub total_count: u64,
    pub donors: Vec<DonorSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentChange {
    pub segment_id: Uuid,
    pub segment_name: String,
}

impl SegmentChange {
    fn of(segment: &Segment) -> Self {
        Self {
            segment_id: segment.id,
            segment_name: segment.name.clone(),
        }
    }
}

/// Result of re-testing one donor against its organization's segments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshOutcome {
    pub donor_id: Uuid,
    pub organization_id: Uuid,
    pub entered: Vec<SegmentChange>,
    pub exited: Vec<SegmentChange>,
}

pub struct MembershipSynchronizer<S> {
    store: Arc<S>,
    workflows: Arc<dyn WorkflowSink>,
    preview_limit: usize,
    segment_locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl<S> std::fmt::Debug for MembershipSynchronizer<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MembershipSynchronizer")
            .field("preview_limit", &self.preview_limit)
            .field("segment_locks", &self.segment_locks.len())
            .finish()
    }
}

impl<S: SegmentStore> MembershipSynchronizer<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            workflows: noop_sink(),
            preview_limit: DEFAULT_PREVIEW_LIMIT,
            segment_locks: DashMap::new(),
        }
    }

    /// Attach the collaborator that receives segment-entry triggers.
    pub fn with_workflow_sink(mut self, sink: Arc<dyn WorkflowSink>) -> Self {
        self.workflows = sink;
        self
    }

    pub fn with_preview_limit(mut self, limit: usize) -> Self {
        self.preview_limit = limit;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Reconcile a segment's membership with `rules` in one transaction.
    pub fn sync(
        &self,
        segment_id: Uuid,
        organization_id: Uuid,
        rules: &Value,
    ) -> SegmentResult<SyncOutcome> {
        let predicate = compile_rules(rules)?;

        let lock = self.segment_lock(segment_id);
        let _guard = lock.lock();
        let outcome = self.store.transaction(|tx| {
            reconcile(tx, segment_id, organization_id, &predicate, Utc::now())
        })?;

        record_sync(&outcome);
        Ok(outcome)
    }

    /// Re-sync a segment from its stored rules.
    pub fn sync_segment(&self, segment_id: Uuid) -> SegmentResult<SyncOutcome> {
        let lock = self.segment_lock(segment_id);
        let _guard = lock.lock();
        let outcome = self.store.transaction(|tx| {
            let segment = tx
                .segment(segment_id)?
                .ok_or_else(|| SegmentError::not_found("segment", segment_id))?;
            let predicate = compile_rules(&segment.rules)?;
            reconcile(tx, segment_id, segment.organization_id, &predicate, Utc::now())
        })?;

        record_sync(&outcome);
        Ok(outcome)
    }

    /// Count matching donors without touching stored membership.
    pub fn count_only(&self, organization_id: Uuid, rules: &Value) -> SegmentResult<u64> {
        let predicate = compile_rules(rules)?;
        let count = self
            .store
            .read(|r| r.matching_donors(organization_id, &predicate))?
            .len();
        Ok(count as u64)
    }

    /// Matching count plus the first donors by total given (highest first,
    /// ties broken by id), capped at the preview limit.
    pub fn preview(&self, organization_id: Uuid, rules: &Value) -> SegmentResult<Preview> {
        let predicate = compile_rules(rules)?;
        let mut donors = self
            .store
            .read(|r| r.matching_donors(organization_id, &predicate))?;
        let total_count = donors.len() as u64;

        donors.sort_by(|a, b| {
            b.total_amount
                .total_cmp(&a.total_amount)
                .then_with(|| a.id.cmp(&b.id))
        });
        donors.truncate(self.preview_limit);

        Ok(Preview {
            total_count,
            donors: donors.iter().map(Donor::summary).collect(),
        })
    }

    /// Re-test one donor against every segment of its organization.
    ///
    /// Flips at most one membership row per segment, then recounts each
    /// segment's cached size from the join table. Entry triggers are emitted
    /// only after the transaction commits.
    pub fn refresh_for_donor(&self, donor_id: Uuid) -> SegmentResult<RefreshOutcome> {
        let compiler = RuleCompiler::new();
        let outcome = self.store.transaction(|tx| {
            let donor = tx
                .donor(donor_id)?
                .ok_or_else(|| SegmentError::not_found("donor", donor_id))?;
            let has_recurring = tx.has_recurring_donation(donor_id)?;
            let facts = DonorFacts::new(&donor, has_recurring);

            let mut outcome = RefreshOutcome {
                donor_id,
                organization_id: donor.organization_id,
                entered: Vec::new(),
                exited: Vec::new(),
            };

            for segment in tx.segments_for_organization(donor.organization_id)? {
                let predicate = compiler.compile_document(&segment.rules).map_err(|e| {
                    warn!(segment_id = %segment.id, error = %e, "Stored segment rules failed to compile");
                    e
                })?;

                let qualifies = predicate.matches(&facts);
                let is_member = tx.is_member(segment.id, donor_id)?;
                if qualifies && !is_member {
                    tx.add_members(segment.id, &[donor_id])?;
                    outcome.entered.push(SegmentChange::of(&segment));
                } else if !qualifies && is_member {
                    tx.remove_members(segment.id, &[donor_id])?;
                    outcome.exited.push(SegmentChange::of(&segment));
                }

                let count = tx.member_count(segment.id)?;
                tx.update_member_cache(segment.id, count, None)?;
            }
            Ok(outcome)
        })?;

        for change in &outcome.entered {
            info!(
                donor_id = %donor_id,
                segment_id = %change.segment_id,
                segment = %change.segment_name,
                "Donor entered segment"
            );
            self.workflows.emit(WorkflowTrigger::segment_entry(
                outcome.organization_id,
                donor_id,
                change.segment_id,
                change.segment_name.clone(),
            ));
        }
        for change in &outcome.exited {
            info!(
                donor_id = %donor_id,
                segment_id = %change.segment_id,
                segment = %change.segment_name,
                "Donor exited segment"
            );
        }
        metrics::counter!("segments.refresh.entries").increment(outcome.entered.len() as u64);
        metrics::counter!("segments.refresh.exits").increment(outcome.exited.len() as u64);

        Ok(outcome)
    }

    /// Mutex serializing full syncs of one segment.
    pub(crate) fn segment_lock(&self, segment_id: Uuid) -> Arc<Mutex<()>> {
        self.segment_locks
            .entry(segment_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub(crate) fn forget_segment(&self, segment_id: Uuid) {
        self.segment_locks.remove(&segment_id);
    }
}

/// Compile a rule document, logging and counting rejections.
pub(crate) fn compile_rules(rules: &Value) -> SegmentResult<Predicate> {
    RuleCompiler::new().compile_document(rules).map_err(|e| {
        warn!(error = %e, "Segment rules rejected");
        metrics::counter!("segments.rules.rejected").increment(1);
        SegmentError::from(e)
    })
}

/// Diff the matching set against stored membership and apply the
/// difference. Must run inside a transaction.
pub(crate) fn reconcile(
    tx: &mut dyn SegmentTx,
    segment_id: Uuid,
    organization_id: Uuid,
    predicate: &Predicate,
    now: DateTime<Utc>,
) -> SegmentResult<SyncOutcome> {
    let matching: BTreeSet<Uuid> = tx
        .matching_donors(organization_id, predicate)?
        .into_iter()
        .map(|d| d.id)
        .collect();
    let current = tx.member_ids(segment_id)?;

    let to_remove: Vec<Uuid> = current.difference(&matching).copied().collect();
    let to_add: Vec<Uuid> = matching.difference(&current).copied().collect();

    let removed_count = tx.remove_members(segment_id, &to_remove)?;
    let added_count = tx.add_members(segment_id, &to_add)?;
    tx.update_member_cache(segment_id, matching.len() as u64, Some(now))?;

    Ok(SyncOutcome {
        segment_id,
        added_count,
        removed_count,
        total_count: matching.len(),
    })
}

pub(crate) fn record_sync(outcome: &SyncOutcome) {
    info!(
        segment_id = %outcome.segment_id,
        added = outcome.added_count,
        removed = outcome.removed_count,
        total = outcome.total_count,
        "Segment membership synced"
    );
    metrics::counter!("segments.sync.total").increment(1);
    metrics::counter!("segments.sync.added").increment(outcome.added_count as u64);
    metrics::counter!("segments.sync.removed").increment(outcome.removed_count as u64);
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::{Fixture, MemoryStore, SegmentReader};
    use donor_core::event_bus::capture_sink;
    use donor_core::types::{Donation, DonationType, RetentionRisk};
    use serde_json::json;

    struct Org {
        id: Uuid,
        store: Arc<MemoryStore>,
        segment: Segment,
    }

    fn segment(organization_id: Uuid, name: &str, rules: Value) -> Segment {
        let now = Utc::now();
        Segment {
            id: Uuid::new_v4(),
            organization_id,
            name: name.into(),
            description: None,
            rules,
            member_count: 0,
            last_calculated: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn donor_with_gifts(organization_id: Uuid, gifts: u32) -> Donor {
        let mut d = Donor::new(organization_id, "Donor", format!("{gifts}"));
        d.total_gifts = gifts;
        d.total_amount = f64::from(gifts) * 50.0;
        d
    }

    fn org_with(donors: Vec<Donor>, rules: Value) -> Org {
        let id = donors.first().map_or_else(Uuid::new_v4, |d| d.organization_id);
        let seg = segment(id, "Test segment", rules);
        let store = MemoryStore::from_fixture(Fixture {
            donors,
            segments: vec![seg.clone()],
            ..Default::default()
        })
        .unwrap();
        Org {
            id,
            store: Arc::new(store),
            segment: seg,
        }
    }

    fn members(store: &MemoryStore, segment_id: Uuid) -> BTreeSet<Uuid> {
        store.read(|r| r.member_ids(segment_id)).unwrap()
    }

    fn cached_count(store: &MemoryStore, segment_id: Uuid) -> u64 {
        store
            .read(|r| r.segment(segment_id))
            .unwrap()
            .unwrap()
            .member_count
    }

    #[test]
    fn test_scenario_total_gifts_equals_one() {
        let org_id = Uuid::new_v4();
        let rules = json!({"field": "totalGifts", "operator": "equals", "value": 1});
        let org = org_with(
            vec![
                donor_with_gifts(org_id, 1),
                donor_with_gifts(org_id, 2),
                donor_with_gifts(org_id, 1),
            ],
            rules.clone(),
        );
        let sync = MembershipSynchronizer::new(org.store.clone());

        let outcome = sync.sync(org.segment.id, org.id, &rules).unwrap();
        assert_eq!(outcome.total_count, 2);
        assert_eq!(outcome.added_count, 2);
        assert_eq!(outcome.removed_count, 0);
        assert_eq!(cached_count(&org.store, org.segment.id), 2);
        assert!(org
            .store
            .read(|r| r.segment(org.segment.id))
            .unwrap()
            .unwrap()
            .last_calculated
            .is_some());
    }

    #[test]
    fn test_sync_is_idempotent() {
        let org_id = Uuid::new_v4();
        let rules = json!({"field": "totalGifts", "operator": "greaterThan", "value": 1});
        let org = org_with(
            (0..5).map(|g| donor_with_gifts(org_id, g)).collect(),
            rules.clone(),
        );
        let sync = MembershipSynchronizer::new(org.store.clone());

        let first = sync.sync(org.segment.id, org.id, &rules).unwrap();
        let second = sync.sync(org.segment.id, org.id, &rules).unwrap();
        assert_eq!(first.total_count, 3);
        assert_eq!(second.added_count, 0);
        assert_eq!(second.removed_count, 0);
        assert_eq!(second.total_count, first.total_count);
    }

    #[test]
    fn test_diff_removes_and_adds_exactly() {
        let org_id = Uuid::new_v4();
        let donors: Vec<Donor> = (0..4).map(|g| donor_with_gifts(org_id, g)).collect();
        let [a, b, c, d] = [donors[0].id, donors[1].id, donors[2].id, donors[3].id];
        let rules = json!({"field": "totalGifts", "operator": "greaterThanOrEqual", "value": 1});
        let org = org_with(donors, rules.clone());
        org.store
            .transaction(|tx| tx.add_members(org.segment.id, &[a, b, c]))
            .unwrap();

        let sync = MembershipSynchronizer::new(org.store.clone());
        let outcome = sync.sync(org.segment.id, org.id, &rules).unwrap();

        assert_eq!(outcome.added_count, 1);
        assert_eq!(outcome.removed_count, 1);
        assert_eq!(outcome.total_count, 3);
        assert_eq!(
            members(&org.store, org.segment.id),
            BTreeSet::from([b, c, d])
        );
    }

    #[test]
    fn test_sync_ignores_other_organizations() {
        let org_id = Uuid::new_v4();
        let rules = json!({});
        let org = org_with(vec![donor_with_gifts(org_id, 1)], rules.clone());
        let stranger = donor_with_gifts(Uuid::new_v4(), 1);
        org.store
            .transaction(|tx| tx.upsert_donor(stranger.clone()))
            .unwrap();

        let sync = MembershipSynchronizer::new(org.store.clone());
        let outcome = sync.sync(org.segment.id, org.id, &rules).unwrap();
        assert_eq!(outcome.total_count, 1);
        assert!(!members(&org.store, org.segment.id).contains(&stranger.id));
    }

    #[test]
    fn test_invalid_rules_leave_membership_alone() {
        let org_id = Uuid::new_v4();
        let donors = vec![donor_with_gifts(org_id, 1)];
        let existing = donors[0].id;
        let org = org_with(donors, json!({}));
        org.store
            .transaction(|tx| tx.add_members(org.segment.id, &[existing]))
            .unwrap();

        let sync = MembershipSynchronizer::new(org.store.clone());
        let err = sync
            .sync(
                org.segment.id,
                org.id,
                &json!({"field": "totalGifts", "operator": "approximately", "value": 1}),
            )
            .unwrap_err();
        assert!(err.is_client_error());
        assert_eq!(members(&org.store, org.segment.id), BTreeSet::from([existing]));
    }

    #[test]
    fn test_count_only_and_preview_do_not_write() {
        let org_id = Uuid::new_v4();
        let org = org_with(
            (0..6).map(|g| donor_with_gifts(org_id, g)).collect(),
            json!({}),
        );
        let sync = MembershipSynchronizer::new(org.store.clone()).with_preview_limit(2);
        let rules = json!({"giftCountRange": {"min": 1}});

        assert_eq!(sync.count_only(org.id, &rules).unwrap(), 5);

        let preview = sync.preview(org.id, &rules).unwrap();
        assert_eq!(preview.total_count, 5);
        assert_eq!(preview.donors.len(), 2);
        assert_eq!(preview.donors[0].total_gifts, 5);
        assert_eq!(preview.donors[1].total_gifts, 4);
        assert_eq!(sync.preview(org.id, &rules).unwrap(), preview);

        assert!(members(&org.store, org.segment.id).is_empty());
        assert_eq!(cached_count(&org.store, org.segment.id), 0);
    }

    #[test]
    fn test_preview_ties_are_ordered_by_id() {
        let org_id = Uuid::new_v4();
        let donors: Vec<Donor> = (0..4).map(|_| donor_with_gifts(org_id, 2)).collect();
        let mut expected: Vec<Uuid> = donors.iter().map(|d| d.id).collect();
        expected.sort();
        let org = org_with(donors, json!({}));

        let sync = MembershipSynchronizer::new(org.store.clone());
        let preview = sync.preview(org.id, &json!({})).unwrap();
        let ids: Vec<Uuid> = preview.donors.iter().map(|d| d.id).collect();
        assert_eq!(ids, expected);
        assert_eq!(
            sync.preview_limit,
            donor_core::config::SegmentsConfig::default().preview_limit
        );
    }

    #[test]
    fn test_refresh_emits_entry_once() {
        let org_id = Uuid::new_v4();
        let mut donor = donor_with_gifts(org_id, 0);
        donor.retention_risk = RetentionRisk::Low;
        let donor_id = donor.id;
        let rules = json!({"retentionRisk": ["HIGH", "CRITICAL"]});
        let org = org_with(vec![donor.clone()], rules);

        let sink = capture_sink();
        let sync = MembershipSynchronizer::new(org.store.clone()).with_workflow_sink(sink.clone());

        // Not eligible yet.
        let outcome = sync.refresh_for_donor(donor_id).unwrap();
        assert!(outcome.entered.is_empty());
        assert_eq!(sink.count(), 0);

        donor.retention_risk = RetentionRisk::High;
        org.store
            .transaction(|tx| tx.upsert_donor(donor.clone()))
            .unwrap();
        let outcome = sync.refresh_for_donor(donor_id).unwrap();
        assert_eq!(outcome.entered.len(), 1);
        assert_eq!(outcome.entered[0].segment_id, org.segment.id);
        assert_eq!(sink.count(), 1);
        let trigger = &sink.triggers()[0];
        assert_eq!(trigger.organization_id, org_id);
        assert_eq!(trigger.donor_id, donor_id);
        assert_eq!(trigger.context.segment_name, "Test segment");
        assert_eq!(cached_count(&org.store, org.segment.id), 1);

        // Still eligible after an unrelated change: no new entry.
        donor.total_amount = 9_999.0;
        org.store
            .transaction(|tx| tx.upsert_donor(donor.clone()))
            .unwrap();
        let outcome = sync.refresh_for_donor(donor_id).unwrap();
        assert!(outcome.entered.is_empty());
        assert!(outcome.exited.is_empty());
        assert_eq!(sink.count(), 1);

        donor.retention_risk = RetentionRisk::Medium;
        org.store
            .transaction(|tx| tx.upsert_donor(donor.clone()))
            .unwrap();
        let outcome = sync.refresh_for_donor(donor_id).unwrap();
        assert_eq!(outcome.exited.len(), 1);
        assert_eq!(sink.count(), 1);
        assert_eq!(cached_count(&org.store, org.segment.id), 0);
    }

    #[test]
    fn test_refresh_matches_full_sync() {
        let org_id = Uuid::new_v4();
        let donors: Vec<Donor> = (0..6).map(|g| donor_with_gifts(org_id, g)).collect();
        let rules = json!({"or": [
            {"field": "totalGifts", "operator": "greaterThanOrEqual", "value": 4},
            {"field": "hasRecurring", "operator": "equals", "value": true}
        ]});
        let org = org_with(donors.clone(), rules.clone());
        org.store
            .transaction(|tx| {
                tx.insert_donation(Donation {
                    id: Uuid::new_v4(),
                    donor_id: donors[1].id,
                    amount: 15.0,
                    donation_type: DonationType::Recurring,
                    date: Utc::now(),
                })
            })
            .unwrap();

        let sync = MembershipSynchronizer::new(org.store.clone());
        for donor in &donors {
            sync.refresh_for_donor(donor.id).unwrap();
        }
        let incremental = members(&org.store, org.segment.id);
        assert_eq!(incremental.len(), 3);
        assert_eq!(cached_count(&org.store, org.segment.id), 3);

        let outcome = sync.sync(org.segment.id, org.id, &rules).unwrap();
        assert_eq!(outcome.added_count, 0);
        assert_eq!(outcome.removed_count, 0);
        assert_eq!(members(&org.store, org.segment.id), incremental);
    }

    #[test]
    fn test_refresh_unknown_donor() {
        let org = org_with(vec![], json!({}));
        let sync = MembershipSynchronizer::new(org.store.clone());
        let err = sync.refresh_for_donor(Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, SegmentError::NotFound { entity: "donor", .. }));
    }

    #[test]
    fn test_concurrent_syncs_of_one_segment_stay_consistent() {
        let org_id = Uuid::new_v4();
        let rules = json!({"field": "totalGifts", "operator": "lessThan", "value": 10});
        let org = org_with(
            (0..20).map(|g| donor_with_gifts(org_id, g)).collect(),
            rules.clone(),
        );
        let sync = MembershipSynchronizer::new(org.store.clone());

        let added: usize = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| s.spawn(|| sync.sync(org.segment.id, org.id, &rules).unwrap()))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap().added_count)
                .sum()
        });

        assert_eq!(added, 10);
        assert_eq!(members(&org.store, org.segment.id).len(), 10);
        assert_eq!(cached_count(&org.store, org.segment.id), 10);
    }

    /// Store whose transactions fail on membership inserts.
    struct FailingStore {
        inner: MemoryStore,
    }

    struct FailingTx<'a> {
        inner: &'a mut dyn SegmentTx,
    }

    impl SegmentStore for FailingStore {
        fn read<R>(
            &self,
            f: impl FnOnce(&dyn SegmentReader) -> SegmentResult<R>,
        ) -> SegmentResult<R> {
            self.inner.read(f)
        }

        fn transaction<R>(
            &self,
            f: impl FnOnce(&mut dyn SegmentTx) -> SegmentResult<R>,
        ) -> SegmentResult<R> {
            self.inner.transaction(|tx| f(&mut FailingTx { inner: tx }))
        }
    }

    impl SegmentReader for FailingTx<'_> {
        fn donor(&self, id: Uuid) -> SegmentResult<Option<Donor>> {
            self.inner.donor(id)
        }
        fn has_recurring_donation(&self, id: Uuid) -> SegmentResult<bool> {
            self.inner.has_recurring_donation(id)
        }
        fn matching_donors(&self, org: Uuid, p: &Predicate) -> SegmentResult<Vec<Donor>> {
            self.inner.matching_donors(org, p)
        }
        fn donations_for_donor(&self, id: Uuid) -> SegmentResult<Vec<Donation>> {
            self.inner.donations_for_donor(id)
        }
        fn donation(&self, id: Uuid) -> SegmentResult<Option<Donation>> {
            self.inner.donation(id)
        }
        fn segment(&self, id: Uuid) -> SegmentResult<Option<Segment>> {
            self.inner.segment(id)
        }
        fn segments_for_organization(&self, org: Uuid) -> SegmentResult<Vec<Segment>> {
            self.inner.segments_for_organization(org)
        }
        fn member_ids(&self, id: Uuid) -> SegmentResult<BTreeSet<Uuid>> {
            self.inner.member_ids(id)
        }
        fn is_member(&self, segment_id: Uuid, donor_id: Uuid) -> SegmentResult<bool> {
            self.inner.is_member(segment_id, donor_id)
        }
        fn member_count(&self, id: Uuid) -> SegmentResult<u64> {
            self.inner.member_count(id)
        }
    }

    impl SegmentTx for FailingTx<'_> {
        fn insert_segment(&mut self, segment: Segment) -> SegmentResult<()> {
            self.inner.insert_segment(segment)
        }
        fn update_segment(&mut self, segment: Segment) -> SegmentResult<()> {
            self.inner.update_segment(segment)
        }
        fn delete_segment(&mut self, id: Uuid) -> SegmentResult<()> {
            self.inner.delete_segment(id)
        }
        fn add_members(&mut self, _segment_id: Uuid, _donor_ids: &[Uuid]) -> SegmentResult<usize> {
            Err(SegmentError::Persistence("insert failed".into()))
        }
        fn remove_members(&mut self, segment_id: Uuid, ids: &[Uuid]) -> SegmentResult<usize> {
            self.inner.remove_members(segment_id, ids)
        }
        fn update_member_cache(
            &mut self,
            segment_id: Uuid,
            count: u64,
            at: Option<DateTime<Utc>>,
        ) -> SegmentResult<()> {
            self.inner.update_member_cache(segment_id, count, at)
        }
        fn upsert_donor(&mut self, donor: Donor) -> SegmentResult<()> {
            self.inner.upsert_donor(donor)
        }
        fn insert_donation(&mut self, donation: Donation) -> SegmentResult<()> {
            self.inner.insert_donation(donation)
        }
        fn update_donation(&mut self, donation: Donation) -> SegmentResult<()> {
            self.inner.update_donation(donation)
        }
        fn delete_donation(&mut self, id: Uuid) -> SegmentResult<Donation> {
            self.inner.delete_donation(id)
        }
    }

    #[test]
    fn test_failed_sync_rolls_back_removals() {
        let org_id = Uuid::new_v4();
        let donors: Vec<Donor> = (0..3).map(|g| donor_with_gifts(org_id, g)).collect();
        let old_member = donors[0].id;
        let rules = json!({"field": "totalGifts", "operator": "greaterThan", "value": 0});
        let seg = segment(org_id, "Repeat donors", rules.clone());
        let inner = MemoryStore::from_fixture(Fixture {
            donors,
            segments: vec![seg.clone()],
            ..Default::default()
        })
        .unwrap();
        inner
            .transaction(|tx| {
                tx.add_members(seg.id, &[old_member])?;
                tx.update_member_cache(seg.id, 1, None)
            })
            .unwrap();

        let store = Arc::new(FailingStore { inner });
        let sync = MembershipSynchronizer::new(store.clone());
        let err = sync.sync(seg.id, org_id, &rules).unwrap_err();
        assert!(matches!(err, SegmentError::Persistence(_)));
        assert!(!err.is_client_error());

        let (ids, cached) = store
            .read(|r| {
                let cached = r.segment(seg.id)?.map(|s| s.member_count);
                Ok((r.member_ids(seg.id)?, cached))
            })
            .unwrap();
        assert_eq!(ids, BTreeSet::from([old_member]));
        assert_eq!(cached, Some(1));
    }
}
