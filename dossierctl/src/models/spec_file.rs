use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use dossier_core::{
    AssessmentSynthesizer, CapabilityDescriptor, CapabilityKind, CapabilityRegistry,
    CorroborationAnalyzer, FixtureResponse, FixtureWorker, InvestigationSpec, Worker,
};
use serde::Deserialize;

/// An investigation run description: what to investigate and which
/// built-in workers serve each capability.
#[derive(Debug, Clone, Deserialize)]
pub struct SpecFile {
    pub investigation: InvestigationSpec,
    #[serde(default)]
    pub capabilities: Vec<CapabilityFile>,
    #[serde(default)]
    pub fixtures: Vec<FixtureFile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CapabilityFile {
    pub name: String,
    pub kind: CapabilityKind,
    pub worker: WorkerChoice,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub cost_hint: Option<u32>,
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Fixture workers only.
    #[serde(default)]
    pub latency_ms: Option<u64>,
    /// Corroboration analyzers only.
    #[serde(default)]
    pub min_reliability: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerChoice {
    Fixture,
    Corroboration,
    Assessment,
}

/// Canned answer for one capability and target label.
#[derive(Debug, Clone, Deserialize)]
pub struct FixtureFile {
    pub capability: String,
    pub target: String,
    #[serde(flatten)]
    pub response: FixtureResponse,
}

impl SpecFile {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read spec file {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("invalid spec file {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Registers one worker per declared capability. Fixture workers get
    /// every fixture addressed to their capability.
    pub fn build_registry(&self) -> Result<CapabilityRegistry> {
        if self.capabilities.is_empty() {
            bail!("spec file declares no capabilities");
        }

        let mut builder = CapabilityRegistry::builder();
        for cap in &self.capabilities {
            let worker = self.worker_for(cap)?;
            builder = builder.register(cap.name.as_str(), descriptor_for(cap), worker);
        }

        for fixture in &self.fixtures {
            if !self.capabilities.iter().any(|c| {
                c.name == fixture.capability && c.worker == WorkerChoice::Fixture
            }) {
                bail!(
                    "fixture for {}/{} names no fixture-backed capability",
                    fixture.capability,
                    fixture.target
                );
            }
        }

        Ok(builder.build()?)
    }

    fn worker_for(&self, cap: &CapabilityFile) -> Result<Arc<dyn Worker>> {
        let name = format!("{}-{}", cap.name, worker_label(cap.worker));
        let worker: Arc<dyn Worker> = match cap.worker {
            WorkerChoice::Fixture => {
                let mut worker = FixtureWorker::new(name)
                    .with_latency(Duration::from_millis(cap.latency_ms.unwrap_or(0)));
                for fixture in self.fixtures.iter().filter(|f| f.capability == cap.name) {
                    worker.insert(
                        fixture.capability.as_str(),
                        fixture.target.clone(),
                        fixture.response.clone(),
                    );
                }
                Arc::new(worker)
            }
            WorkerChoice::Corroboration => Arc::new(
                CorroborationAnalyzer::new(name)
                    .with_min_reliability(cap.min_reliability.unwrap_or(0)),
            ),
            WorkerChoice::Assessment => Arc::new(AssessmentSynthesizer::new(name)),
        };
        Ok(worker)
    }
}

fn descriptor_for(cap: &CapabilityFile) -> CapabilityDescriptor {
    let mut descriptor = CapabilityDescriptor::new(cap.kind);
    if let Some(description) = &cap.description {
        descriptor = descriptor.with_description(description.clone());
    }
    if let Some(cost) = cap.cost_hint {
        descriptor = descriptor.with_cost_hint(cost);
    }
    if let Some(limit) = cap.max_concurrency {
        descriptor = descriptor.with_max_concurrency(limit);
    }
    if let Some(timeout) = cap.timeout_ms {
        descriptor = descriptor.with_timeout(Duration::from_millis(timeout));
    }
    descriptor
}

fn worker_label(choice: WorkerChoice) -> &'static str {
    match choice {
        WorkerChoice::Fixture => "fixture",
        WorkerChoice::Corroboration => "corroboration",
        WorkerChoice::Assessment => "assessment",
    }
}
