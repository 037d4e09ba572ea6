use std::collections::BTreeSet;

use dossier_model::{Classification, Priority, TargetKind};
use serde::{Deserialize, Serialize};

use crate::error::{InvestigationError, Result};
use crate::registry::{Capability, CapabilityKind, CapabilityRegistry};

/// What an operator submits to `start_investigation`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvestigationSpec {
    pub title: String,
    #[serde(default)]
    pub objective: String,
    #[serde(default)]
    pub classification: Classification,
    #[serde(default)]
    pub priority: Priority,
    pub targets: Vec<TargetSpec>,
    #[serde(default)]
    pub planning: Vec<Capability>,
    #[serde(default)]
    pub analysis: Vec<Capability>,
    #[serde(default)]
    pub synthesis: Vec<Capability>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSpec {
    pub label: String,
    #[serde(default)]
    pub kind: TargetKind,
    /// Falls back to the investigation priority.
    #[serde(default)]
    pub priority: Option<Priority>,
    /// Collection capabilities whose evidence satisfies this target.
    #[serde(default)]
    pub requirements: Vec<Capability>,
}

impl InvestigationSpec {
    /// Checks the request against the registry so bad input fails at start
    /// rather than mid-phase.
    pub fn validate(&self, registry: &CapabilityRegistry) -> Result<()> {
        if self.title.trim().is_empty() {
            return Err(InvestigationError::InvalidSpec("title is empty".into()));
        }
        if self.targets.is_empty() {
            return Err(InvestigationError::InvalidSpec(
                "at least one target is required".into(),
            ));
        }

        let mut labels = BTreeSet::new();
        for target in &self.targets {
            let label = target.label.trim();
            if label.is_empty() {
                return Err(InvestigationError::InvalidSpec(
                    "target label is empty".into(),
                ));
            }
            if !labels.insert(label.to_string()) {
                return Err(InvestigationError::InvalidSpec(format!(
                    "duplicate target label {label}"
                )));
            }
            for cap in &target.requirements {
                registry.require_kind(cap, CapabilityKind::Collection)?;
            }
        }

        for cap in &self.planning {
            registry.require_kind(cap, CapabilityKind::Planning)?;
        }
        for cap in &self.analysis {
            registry.require_kind(cap, CapabilityKind::Analysis)?;
        }
        for cap in &self.synthesis {
            registry.require_kind(cap, CapabilityKind::Synthesis)?;
        }
        Ok(())
    }
}
