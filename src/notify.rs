//! Derived-fact signals for the push-notification layer.
//!
//! The engine only reports that a fact changed. Formatting and delivery
//! belong to whoever implements [`NotificationSink`].

use std::sync::Mutex;

use serde::Serialize;
use tracing::info;

use crate::model::{ActivityType, PlantStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "fact", rename_all = "snake_case")]
pub enum DerivedFact {
    ScheduleAssigned {
        plant_id: String,
        watering_days: u32,
        fertilizing_days: u32,
    },
    CareRecorded {
        plant_id: String,
        activity_id: String,
        activity_type: ActivityType,
        total_care_actions: u32,
    },
    StatusChanged {
        plant_id: String,
        status: PlantStatus,
    },
    PlantArchived {
        plant_id: String,
        original_version: u64,
    },
}

impl DerivedFact {
    pub fn plant_id(&self) -> &str {
        match self {
            DerivedFact::ScheduleAssigned { plant_id, .. }
            | DerivedFact::CareRecorded { plant_id, .. }
            | DerivedFact::StatusChanged { plant_id, .. }
            | DerivedFact::PlantArchived { plant_id, .. } => plant_id,
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            DerivedFact::ScheduleAssigned { .. } => "schedule_assigned",
            DerivedFact::CareRecorded { .. } => "care_recorded",
            DerivedFact::StatusChanged { .. } => "status_changed",
            DerivedFact::PlantArchived { .. } => "plant_archived",
        }
    }
}

pub trait NotificationSink: Send + Sync {
    fn publish(&self, fact: DerivedFact);
}

/// Writes every fact to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn publish(&self, fact: DerivedFact) {
        let payload = serde_json::to_string(&fact).unwrap_or_default();
        info!(
            target: "plantkeeper",
            event = "derived_fact",
            fact = fact.name(),
            plant_id = %fact.plant_id(),
            payload = %payload
        );
    }
}

/// Keeps published facts in memory.
#[derive(Debug, Default)]
pub struct CollectingSink {
    facts: Mutex<Vec<DerivedFact>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn facts(&self) -> Vec<DerivedFact> {
        let guard = match self.facts.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.facts().iter().filter(|fact| fact.name() == name).count()
    }
}

impl NotificationSink for CollectingSink {
    fn publish(&self, fact: DerivedFact) {
        let mut guard = match self.facts.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.push(fact);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn facts_serialize_with_tag() {
        let fact = DerivedFact::StatusChanged {
            plant_id: "p1".into(),
            status: PlantStatus::Healthy,
        };
        let json = serde_json::to_value(&fact).expect("serialize");
        assert_eq!(json["fact"], "status_changed");
        assert_eq!(json["plant_id"], "p1");
        assert_eq!(json["status"], "healthy");
    }

    #[test]
    fn collecting_sink_counts_by_name() {
        let sink = CollectingSink::new();
        sink.publish(DerivedFact::PlantArchived {
            plant_id: "p1".into(),
            original_version: 3,
        });
        sink.publish(DerivedFact::StatusChanged {
            plant_id: "p1".into(),
            status: PlantStatus::Thirsty,
        });
        assert_eq!(sink.count("plant_archived"), 1);
        assert_eq!(sink.facts().len(), 2);
    }
}
