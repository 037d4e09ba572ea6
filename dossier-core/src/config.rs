use std::collections::HashMap;
use std::time::Duration;

use dossier_model::Phase;
use serde::{Deserialize, Serialize};

/// Global knobs that tune orchestrator behaviour.
///
/// All fields carry defaults so a configuration file only has to name the
/// values it wants to change.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Concurrency bounds and timeouts for task dispatch.
    pub dispatch: DispatchConfig,
    /// Retry/backoff policy shared by every capability.
    pub retry: RetryConfig,
    /// Exit criteria, dwell limits and sequencing per phase.
    pub phases: PhaseConfig,
    /// Subscriber buffering for progress events.
    pub broadcast: BroadcastConfig,
    /// Per-investigation actor tuning.
    pub runtime: RuntimeConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatchConfig {
    /// In-flight bound for capabilities without an override. Never unlimited.
    pub default_max_concurrency: usize,
    /// Per-attempt timeout for capabilities without an override.
    pub default_timeout_ms: u64,
    /// Optional per-capability overrides keyed by capability name.
    pub overrides: HashMap<String, CapabilityOverride>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_max_concurrency: 4,
            default_timeout_ms: 30_000,
            overrides: HashMap::new(),
        }
    }
}

impl DispatchConfig {
    pub fn override_for(&self, capability: &str) -> Option<&CapabilityOverride> {
        self.overrides.get(capability)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
pub struct CapabilityOverride {
    pub max_concurrency: Option<usize>,
    pub timeout_ms: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Fraction of the anchor delay used as the jitter half-width.
    pub jitter_ratio: f32,
    /// Lower bound on the jitter half-width.
    pub jitter_min_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            jitter_ratio: 0.25,
            jitter_min_ms: 50,
        }
    }
}

/// How a phase's task list is released to the dispatcher.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Sequencing {
    /// Every task of the phase is submitted at once.
    #[default]
    Concurrent,
    /// One capability group at a time, in registry order.
    ByCapability,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PhaseConfig {
    pub sequencing: Sequencing,
    pub planning: PhaseExit,
    pub collection: PhaseExit,
    pub analysis: PhaseExit,
    pub synthesis: PhaseExit,
}

impl Default for PhaseConfig {
    fn default() -> Self {
        Self {
            sequencing: Sequencing::Concurrent,
            planning: PhaseExit {
                min_success_ratio: 0.0,
                min_evidence: 0,
                max_dwell_ms: 60_000,
            },
            collection: PhaseExit {
                min_success_ratio: 0.5,
                min_evidence: 1,
                max_dwell_ms: 300_000,
            },
            analysis: PhaseExit {
                min_success_ratio: 0.5,
                min_evidence: 0,
                max_dwell_ms: 120_000,
            },
            synthesis: PhaseExit {
                min_success_ratio: 0.5,
                min_evidence: 0,
                max_dwell_ms: 120_000,
            },
        }
    }
}

impl PhaseConfig {
    pub fn exit_for(&self, phase: Phase) -> &PhaseExit {
        match phase {
            Phase::Planning => &self.planning,
            Phase::Collection => &self.collection,
            Phase::Analysis => &self.analysis,
            Phase::Synthesis => &self.synthesis,
        }
    }

    pub fn exit_for_mut(&mut self, phase: Phase) -> &mut PhaseExit {
        match phase {
            Phase::Planning => &mut self.planning,
            Phase::Collection => &mut self.collection,
            Phase::Analysis => &mut self.analysis,
            Phase::Synthesis => &mut self.synthesis,
        }
    }
}

/// Exit predicate and dwell limit for a single phase.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PhaseExit {
    /// Completed tasks over all tasks of the phase, once every task settled.
    pub min_success_ratio: f64,
    /// Records produced by the phase's completed tasks.
    pub min_evidence: usize,
    /// Dwell limit before the phase is closed as partial.
    pub max_dwell_ms: u64,
}

impl Default for PhaseExit {
    fn default() -> Self {
        Self {
            min_success_ratio: 0.5,
            min_evidence: 0,
            max_dwell_ms: 120_000,
        }
    }
}

impl PhaseExit {
    pub fn max_dwell(&self) -> Duration {
        Duration::from_millis(self.max_dwell_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Per-subscriber buffer. Overflow drops the oldest event.
    pub subscriber_buffer: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: 256,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    pub mailbox_capacity: usize,
    /// Cadence of dwell checks inside each investigation actor.
    pub tick_interval_ms: u64,
    /// Save attempts before the investigation is failed.
    pub save_attempts: u32,
    pub save_retry_delay_ms: u64,
    /// Grace period for actors to exit on shutdown.
    pub shutdown_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 1024,
            tick_interval_ms: 250,
            save_attempts: 3,
            save_retry_delay_ms: 100,
            shutdown_timeout_ms: 30_000,
        }
    }
}
