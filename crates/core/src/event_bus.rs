//! Workflow trigger bus: trait for handing trigger events to the workflow
//! collaborator from any module.
//!
//! Modules accept an `Arc<dyn WorkflowSink>`; step execution itself happens
//! outside this workspace.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Events that start a follow-up workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerType {
    SegmentEntry,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerContext {
    pub segment_name: String,
}

/// Payload delivered to the workflow collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowTrigger {
    pub trigger: TriggerType,
    pub organization_id: Uuid,
    pub donor_id: Uuid,
    pub segment_id: Uuid,
    pub context: TriggerContext,
}

impl WorkflowTrigger {
    pub fn segment_entry(
        organization_id: Uuid,
        donor_id: Uuid,
        segment_id: Uuid,
        segment_name: impl Into<String>,
    ) -> Self {
        Self {
            trigger: TriggerType::SegmentEntry,
            organization_id,
            donor_id,
            segment_id,
            context: TriggerContext {
                segment_name: segment_name.into(),
            },
        }
    }
}

pub trait WorkflowSink: Send + Sync {
    fn emit(&self, trigger: WorkflowTrigger);
}

/// No-op sink for modules that don't fire workflows.
pub struct NoOpSink;

impl WorkflowSink for NoOpSink {
    fn emit(&self, _trigger: WorkflowTrigger) {}
}

/// Simulates workflow execution by logging each trigger.
pub struct LoggingSink;

impl WorkflowSink for LoggingSink {
    fn emit(&self, trigger: WorkflowTrigger) {
        info!(
            trigger = ?trigger.trigger,
            organization_id = %trigger.organization_id,
            donor_id = %trigger.donor_id,
            segment_id = %trigger.segment_id,
            segment_name = %trigger.context.segment_name,
            "Workflow trigger fired (simulated)"
        );
    }
}

/// In-memory sink that captures triggers for testing.
#[derive(Default)]
pub struct CaptureSink {
    triggers: Mutex<Vec<WorkflowTrigger>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn triggers(&self) -> Vec<WorkflowTrigger> {
        self.triggers.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.triggers.lock().len()
    }

    pub fn count_for_donor(&self, donor_id: Uuid) -> usize {
        self.triggers
            .lock()
            .iter()
            .filter(|t| t.donor_id == donor_id)
            .count()
    }

    pub fn clear(&self) {
        self.triggers.lock().clear();
    }
}

impl WorkflowSink for CaptureSink {
    fn emit(&self, trigger: WorkflowTrigger) {
        self.triggers.lock().push(trigger);
    }
}

/// Convenience: a sink that drops every trigger.
pub fn noop_sink() -> Arc<dyn WorkflowSink> {
    Arc::new(NoOpSink)
}

/// Convenience: create a capture sink for tests.
pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}
