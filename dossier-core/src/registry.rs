use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dossier_model::Phase;
use serde::{Deserialize, Serialize};

use crate::error::{InvestigationError, Result};
use crate::worker::{TaskPayload, Worker};

/// Declared unit of work, e.g. `collect-public-records`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capability(String);

impl Capability {
    pub fn new(name: impl Into<String>) -> Self {
        Capability(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Capability {
    fn from(value: &str) -> Self {
        Capability::new(value)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which phase a capability serves. Fixes both the payload a worker accepts
/// and the product it must return.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    Planning,
    Collection,
    Analysis,
    Synthesis,
}

impl CapabilityKind {
    pub fn phase(self) -> Phase {
        match self {
            CapabilityKind::Planning => Phase::Planning,
            CapabilityKind::Collection => Phase::Collection,
            CapabilityKind::Analysis => Phase::Analysis,
            CapabilityKind::Synthesis => Phase::Synthesis,
        }
    }

    pub fn for_phase(phase: Phase) -> Self {
        match phase {
            Phase::Planning => CapabilityKind::Planning,
            Phase::Collection => CapabilityKind::Collection,
            Phase::Analysis => CapabilityKind::Analysis,
            Phase::Synthesis => CapabilityKind::Synthesis,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CapabilityKind::Planning => "planning",
            CapabilityKind::Collection => "collection",
            CapabilityKind::Analysis => "analysis",
            CapabilityKind::Synthesis => "synthesis",
        }
    }
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static description of a capability.
#[derive(Clone, Debug, PartialEq)]
pub struct CapabilityDescriptor {
    pub kind: CapabilityKind,
    pub description: String,
    /// Relative cost used only for reporting and operator hints.
    pub cost_hint: u32,
    /// Per-attempt timeout. Config overrides win over this value.
    pub timeout: Option<Duration>,
    /// In-flight bound. Config overrides win over this value.
    pub max_concurrency: Option<usize>,
}

impl CapabilityDescriptor {
    pub fn new(kind: CapabilityKind) -> Self {
        Self {
            kind,
            description: String::new(),
            cost_hint: 1,
            timeout: None,
            max_concurrency: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_cost_hint(mut self, cost_hint: u32) -> Self {
        self.cost_hint = cost_hint;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit);
        self
    }
}

#[derive(Clone)]
pub struct RegistryEntry {
    pub descriptor: CapabilityDescriptor,
    workers: Vec<Arc<dyn Worker>>,
}

impl RegistryEntry {
    pub fn workers(&self) -> &[Arc<dyn Worker>] {
        &self.workers
    }
}

impl fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.workers.iter().map(|w| w.name()).collect();
        f.debug_struct("RegistryEntry")
            .field("descriptor", &self.descriptor)
            .field("workers", &names)
            .finish()
    }
}

/// Capability name to ordered worker handles. Immutable once built.
#[derive(Clone, Debug, Default)]
pub struct CapabilityRegistry {
    entries: HashMap<Capability, RegistryEntry>,
    /// Registration order, used for deterministic iteration.
    order: Vec<Capability>,
}

impl CapabilityRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn get(&self, capability: &Capability) -> Option<&RegistryEntry> {
        self.entries.get(capability)
    }

    pub fn contains(&self, capability: &Capability) -> bool {
        self.entries.contains_key(capability)
    }

    pub fn descriptor(&self, capability: &Capability) -> Result<&CapabilityDescriptor> {
        self.entries
            .get(capability)
            .map(|entry| &entry.descriptor)
            .ok_or_else(|| InvestigationError::UnknownCapability(capability.to_string()))
    }

    /// Worker for the given 1-based attempt. Attempts rotate through the
    /// ordered list so a retry lands on the next implementation.
    pub fn worker_for(&self, capability: &Capability, attempt: u32) -> Result<Arc<dyn Worker>> {
        let entry = self
            .entries
            .get(capability)
            .ok_or_else(|| InvestigationError::UnknownCapability(capability.to_string()))?;
        let index = (attempt.saturating_sub(1) as usize) % entry.workers.len();
        Ok(Arc::clone(&entry.workers[index]))
    }

    pub fn capabilities_of(&self, kind: CapabilityKind) -> Vec<Capability> {
        self.order
            .iter()
            .filter(|cap| {
                self.entries
                    .get(*cap)
                    .is_some_and(|entry| entry.descriptor.kind == kind)
            })
            .cloned()
            .collect()
    }

    pub fn capabilities(&self) -> &[Capability] {
        &self.order
    }

    /// Rejects payloads whose variant or shape does not match the
    /// capability's descriptor.
    pub fn validate_payload(&self, capability: &Capability, payload: &TaskPayload) -> Result<()> {
        let descriptor = self.descriptor(capability)?;
        if payload.kind() != descriptor.kind {
            return Err(InvestigationError::MalformedPayload {
                capability: capability.to_string(),
                reason: format!(
                    "expected {} payload, got {}",
                    descriptor.kind,
                    payload.kind()
                ),
            });
        }
        payload
            .check_shape()
            .map_err(|reason| InvestigationError::MalformedPayload {
                capability: capability.to_string(),
                reason,
            })
    }

    /// Ensures `capability` exists and serves `kind`.
    pub fn require_kind(&self, capability: &Capability, kind: CapabilityKind) -> Result<()> {
        let descriptor = self.descriptor(capability)?;
        if descriptor.kind != kind {
            return Err(InvestigationError::InvalidSpec(format!(
                "capability {capability} is a {} capability, expected {kind}",
                descriptor.kind
            )));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct RegistryBuilder {
    entries: HashMap<Capability, RegistryEntry>,
    order: Vec<Capability>,
    errors: Vec<String>,
}

impl fmt::Debug for RegistryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryBuilder")
            .field("capabilities", &self.order)
            .field("errors", &self.errors)
            .finish()
    }
}

impl RegistryBuilder {
    /// Declares a capability with its first worker.
    pub fn register(
        mut self,
        capability: impl Into<Capability>,
        descriptor: CapabilityDescriptor,
        worker: Arc<dyn Worker>,
    ) -> Self {
        let capability = capability.into();
        if self.entries.contains_key(&capability) {
            self.errors
                .push(format!("capability {capability} registered twice"));
            return self;
        }
        self.order.push(capability.clone());
        self.entries.insert(
            capability,
            RegistryEntry {
                descriptor,
                workers: vec![worker],
            },
        );
        self
    }

    /// Appends a fallback worker to an already declared capability.
    pub fn with_worker(mut self, capability: impl Into<Capability>, worker: Arc<dyn Worker>) -> Self {
        let capability = capability.into();
        match self.entries.get_mut(&capability) {
            Some(entry) => entry.workers.push(worker),
            None => self
                .errors
                .push(format!("worker added to undeclared capability {capability}")),
        }
        self
    }

    pub fn build(self) -> Result<CapabilityRegistry> {
        if !self.errors.is_empty() {
            return Err(InvestigationError::InvalidSpec(self.errors.join("; ")));
        }
        for (capability, entry) in &self.entries {
            if entry.descriptor.max_concurrency == Some(0) {
                return Err(InvestigationError::InvalidSpec(format!(
                    "capability {capability} has a zero concurrency bound"
                )));
            }
        }
        Ok(CapabilityRegistry {
            entries: self.entries,
            order: self.order,
        })
    }
}
