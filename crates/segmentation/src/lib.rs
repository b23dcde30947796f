//! Donor segmentation: compiles stored segment rules into predicates and
//! keeps segment membership in step with donor data.

pub mod builder;
pub mod compiler;
pub mod donor_metrics;
mod legacy;
pub mod predicates;
pub mod rules;
pub mod service;
pub mod store;
pub mod sync;

pub use builder::RuleBuilder;
pub use compiler::{compile, RuleCompiler};
pub use donor_metrics::DonorMetricsUpdater;
pub use predicates::{DonorFacts, Predicate};
pub use rules::Rule;
pub use service::{NewSegment, SegmentService, SegmentUpdate};
pub use store::{Fixture, MemoryStore, SegmentStore};
pub use sync::{MembershipSynchronizer, Preview, RefreshOutcome, SyncOutcome};
