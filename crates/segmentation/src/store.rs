//! Persistence seam for segment evaluation: the donor store, the segment
//! records and the membership join table.
//!
//! [`SegmentStore::transaction`] is all-or-nothing. A closure returning `Err`
//! leaves the store exactly as it was, and no reader observes a transaction
//! half-applied.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use donor_core::types::{Donation, DonationType, Donor, Segment, SegmentMember};
use donor_core::{SegmentError, SegmentResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::predicates::{DonorFacts, Predicate};

/// Read access to donors, donations, segments and membership.
pub trait SegmentReader {
    fn donor(&self, donor_id: Uuid) -> SegmentResult<Option<Donor>>;

    fn has_recurring_donation(&self, donor_id: Uuid) -> SegmentResult<bool>;

    /// Donors of `organization_id` satisfying `predicate`, ordered by id.
    fn matching_donors(
        &self,
        organization_id: Uuid,
        predicate: &Predicate,
    ) -> SegmentResult<Vec<Donor>>;

    fn donations_for_donor(&self, donor_id: Uuid) -> SegmentResult<Vec<Donation>>;

    fn donation(&self, donation_id: Uuid) -> SegmentResult<Option<Donation>>;

    fn segment(&self, segment_id: Uuid) -> SegmentResult<Option<Segment>>;

    fn segments_for_organization(&self, organization_id: Uuid) -> SegmentResult<Vec<Segment>>;

    fn member_ids(&self, segment_id: Uuid) -> SegmentResult<BTreeSet<Uuid>>;

    fn is_member(&self, segment_id: Uuid, donor_id: Uuid) -> SegmentResult<bool>;

    fn member_count(&self, segment_id: Uuid) -> SegmentResult<u64>;
}

/// Writes available inside a transaction.
pub trait SegmentTx: SegmentReader {
    fn insert_segment(&mut self, segment: Segment) -> SegmentResult<()>;

    fn update_segment(&mut self, segment: Segment) -> SegmentResult<()>;

    /// Removes the segment together with its membership rows.
    fn delete_segment(&mut self, segment_id: Uuid) -> SegmentResult<()>;

    /// Inserts membership rows, skipping pairs already present. Returns the
    /// number of rows actually inserted.
    fn add_members(&mut self, segment_id: Uuid, donor_ids: &[Uuid]) -> SegmentResult<usize>;

    /// Returns the number of rows actually deleted.
    fn remove_members(&mut self, segment_id: Uuid, donor_ids: &[Uuid]) -> SegmentResult<usize>;

    /// Writes the cached member count. `calculated_at` replaces
    /// `last_calculated` when given.
    fn update_member_cache(
        &mut self,
        segment_id: Uuid,
        member_count: u64,
        calculated_at: Option<DateTime<Utc>>,
    ) -> SegmentResult<()>;

    fn upsert_donor(&mut self, donor: Donor) -> SegmentResult<()>;

    fn insert_donation(&mut self, donation: Donation) -> SegmentResult<()>;

    fn update_donation(&mut self, donation: Donation) -> SegmentResult<()>;

    fn delete_donation(&mut self, donation_id: Uuid) -> SegmentResult<Donation>;
}

pub trait SegmentStore: Send + Sync {
    /// Run `f` against a consistent snapshot.
    fn read<R>(&self, f: impl FnOnce(&dyn SegmentReader) -> SegmentResult<R>) -> SegmentResult<R>;

    /// Run `f` in a transaction, committing only if it returns `Ok`.
    fn transaction<R>(
        &self,
        f: impl FnOnce(&mut dyn SegmentTx) -> SegmentResult<R>,
    ) -> SegmentResult<R>;
}

/// Seed data for a [`MemoryStore`], e.g. loaded from a JSON fixture.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fixture {
    #[serde(default)]
    pub donors: Vec<Donor>,
    #[serde(default)]
    pub donations: Vec<Donation>,
    #[serde(default)]
    pub segments: Vec<Segment>,
    #[serde(default)]
    pub members: Vec<SegmentMember>,
}

#[derive(Debug, Clone, Default)]
struct StoreState {
    donors: BTreeMap<Uuid, Donor>,
    donations: BTreeMap<Uuid, Donation>,
    segments: BTreeMap<Uuid, Segment>,
    members: BTreeSet<SegmentMember>,
}

/// In-process store. A transaction stages its writes on a copy of the state
/// while holding the write lock and swaps the copy in on success.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fixture(fixture: Fixture) -> SegmentResult<Self> {
        let store = Self::new();
        store.transaction(|tx| {
            for donor in fixture.donors {
                tx.upsert_donor(donor)?;
            }
            for donation in fixture.donations {
                tx.insert_donation(donation)?;
            }
            for segment in fixture.segments {
                tx.insert_segment(segment)?;
            }
            for member in fixture.members {
                tx.add_members(member.segment_id, &[member.donor_id])?;
            }
            Ok(())
        })?;
        Ok(store)
    }

    /// Current contents in fixture form.
    pub fn snapshot(&self) -> Fixture {
        let state = self.state.read();
        Fixture {
            donors: state.donors.values().cloned().collect(),
            donations: state.donations.values().cloned().collect(),
            segments: state.segments.values().cloned().collect(),
            members: state.members.iter().copied().collect(),
        }
    }
}

impl SegmentStore for MemoryStore {
    fn read<R>(&self, f: impl FnOnce(&dyn SegmentReader) -> SegmentResult<R>) -> SegmentResult<R> {
        let state = self.state.read();
        f(&*state)
    }

    fn transaction<R>(
        &self,
        f: impl FnOnce(&mut dyn SegmentTx) -> SegmentResult<R>,
    ) -> SegmentResult<R> {
        let mut state = self.state.write();
        let mut staged = state.clone();
        match f(&mut staged) {
            Ok(out) => {
                *state = staged;
                Ok(out)
            }
            Err(e) => {
                debug!(error = %e, "Transaction rolled back");
                Err(e)
            }
        }
    }
}

fn member_range(segment_id: Uuid) -> std::ops::RangeInclusive<SegmentMember> {
    SegmentMember {
        segment_id,
        donor_id: Uuid::nil(),
    }..=SegmentMember {
        segment_id,
        donor_id: Uuid::from_u128(u128::MAX),
    }
}

impl StoreState {
    fn recurring_donors(&self) -> HashSet<Uuid> {
        self.donations
            .values()
            .filter(|d| d.donation_type == DonationType::Recurring)
            .map(|d| d.donor_id)
            .collect()
    }

    fn require_segment(&self, segment_id: Uuid) -> SegmentResult<()> {
        if self.segments.contains_key(&segment_id) {
            Ok(())
        } else {
            Err(SegmentError::not_found("segment", segment_id))
        }
    }

    fn require_donor(&self, donor_id: Uuid) -> SegmentResult<()> {
        if self.donors.contains_key(&donor_id) {
            Ok(())
        } else {
            Err(SegmentError::not_found("donor", donor_id))
        }
    }
}

impl SegmentReader for StoreState {
    fn donor(&self, donor_id: Uuid) -> SegmentResult<Option<Donor>> {
        Ok(self.donors.get(&donor_id).cloned())
    }

    fn has_recurring_donation(&self, donor_id: Uuid) -> SegmentResult<bool> {
        Ok(self
            .donations
            .values()
            .any(|d| d.donor_id == donor_id && d.donation_type == DonationType::Recurring))
    }

    fn matching_donors(
        &self,
        organization_id: Uuid,
        predicate: &Predicate,
    ) -> SegmentResult<Vec<Donor>> {
        let recurring = if predicate.references_donations() {
            self.recurring_donors()
        } else {
            HashSet::new()
        };
        Ok(self
            .donors
            .values()
            .filter(|d| d.organization_id == organization_id)
            .filter(|d| predicate.matches(&DonorFacts::new(d, recurring.contains(&d.id))))
            .cloned()
            .collect())
    }

    fn donations_for_donor(&self, donor_id: Uuid) -> SegmentResult<Vec<Donation>> {
        Ok(self
            .donations
            .values()
            .filter(|d| d.donor_id == donor_id)
            .cloned()
            .collect())
    }

    fn donation(&self, donation_id: Uuid) -> SegmentResult<Option<Donation>> {
        Ok(self.donations.get(&donation_id).cloned())
    }

    fn segment(&self, segment_id: Uuid) -> SegmentResult<Option<Segment>> {
        Ok(self.segments.get(&segment_id).cloned())
    }

    fn segments_for_organization(&self, organization_id: Uuid) -> SegmentResult<Vec<Segment>> {
        Ok(self
            .segments
            .values()
            .filter(|s| s.organization_id == organization_id)
            .cloned()
            .collect())
    }

    fn member_ids(&self, segment_id: Uuid) -> SegmentResult<BTreeSet<Uuid>> {
        Ok(self
            .members
            .range(member_range(segment_id))
            .map(|m| m.donor_id)
            .collect())
    }

    fn is_member(&self, segment_id: Uuid, donor_id: Uuid) -> SegmentResult<bool> {
        Ok(self.members.contains(&SegmentMember {
            segment_id,
            donor_id,
        }))
    }

    fn member_count(&self, segment_id: Uuid) -> SegmentResult<u64> {
        Ok(self.members.range(member_range(segment_id)).count() as u64)
    }
}

impl SegmentTx for StoreState {
    fn insert_segment(&mut self, segment: Segment) -> SegmentResult<()> {
        if self.segments.contains_key(&segment.id) {
            return Err(SegmentError::Persistence(format!(
                "segment {} already exists",
                segment.id
            )));
        }
        self.segments.insert(segment.id, segment);
        Ok(())
    }

    fn update_segment(&mut self, segment: Segment) -> SegmentResult<()> {
        self.require_segment(segment.id)?;
        self.segments.insert(segment.id, segment);
        Ok(())
    }

    fn delete_segment(&mut self, segment_id: Uuid) -> SegmentResult<()> {
        self.segments
            .remove(&segment_id)
            .ok_or_else(|| SegmentError::not_found("segment", segment_id))?;
        self.members.retain(|m| m.segment_id != segment_id);
        Ok(())
    }

    fn add_members(&mut self, segment_id: Uuid, donor_ids: &[Uuid]) -> SegmentResult<usize> {
        self.require_segment(segment_id)?;
        let mut inserted = 0;
        for &donor_id in donor_ids {
            self.require_donor(donor_id)?;
            if self.members.insert(SegmentMember {
                segment_id,
                donor_id,
            }) {
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    fn remove_members(&mut self, segment_id: Uuid, donor_ids: &[Uuid]) -> SegmentResult<usize> {
        let mut removed = 0;
        for &donor_id in donor_ids {
            if self.members.remove(&SegmentMember {
                segment_id,
                donor_id,
            }) {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn update_member_cache(
        &mut self,
        segment_id: Uuid,
        member_count: u64,
        calculated_at: Option<DateTime<Utc>>,
    ) -> SegmentResult<()> {
        let segment = self
            .segments
            .get_mut(&segment_id)
            .ok_or_else(|| SegmentError::not_found("segment", segment_id))?;
        segment.member_count = member_count;
        if calculated_at.is_some() {
            segment.last_calculated = calculated_at;
        }
        Ok(())
    }

    fn upsert_donor(&mut self, donor: Donor) -> SegmentResult<()> {
        self.donors.insert(donor.id, donor);
        Ok(())
    }

    fn insert_donation(&mut self, donation: Donation) -> SegmentResult<()> {
        self.require_donor(donation.donor_id)?;
        if self.donations.contains_key(&donation.id) {
            return Err(SegmentError::Persistence(format!(
                "donation {} already exists",
                donation.id
            )));
        }
        self.donations.insert(donation.id, donation);
        Ok(())
    }

    fn update_donation(&mut self, donation: Donation) -> SegmentResult<()> {
        if !self.donations.contains_key(&donation.id) {
            return Err(SegmentError::not_found("donation", donation.id));
        }
        self.require_donor(donation.donor_id)?;
        self.donations.insert(donation.id, donation);
        Ok(())
    }

    fn delete_donation(&mut self, donation_id: Uuid) -> SegmentResult<Donation> {
        self.donations
            .remove(&donation_id)
            .ok_or_else(|| SegmentError::not_found("donation", donation_id))
    }
}
