//! # Dossier Core
//!
//! Orchestration engine for multi-phase investigations. An investigation
//! moves through PLANNING, COLLECTION, ANALYSIS and SYNTHESIS; each phase
//! fans work out to capability workers, folds their products into an
//! evidence record, rescores confidence and broadcasts ordered progress.
//!
//! ## Architecture
//!
//! - [`runtime`]: one actor per investigation owns its record and is the
//!   only writer. [`InvestigationService`] routes control commands to it.
//! - [`dispatch`]: bounded per-capability lanes with retry, backoff,
//!   timeouts and cancellation.
//! - [`aggregator`]: validates work products and applies them to the
//!   record exactly once per task.
//! - [`scoring`]: reliability-weighted confidence with supersession.
//! - [`broadcast`]: gap-aware, journaled progress streams.
//! - [`persistence`]: atomic record storage.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use dossier_core::{
//!     CapabilityDescriptor, CapabilityKind, CapabilityRegistry, FixtureWorker,
//!     InvestigationService, InvestigationSpec,
//! };
//!
//! # async fn demo(spec: InvestigationSpec) -> dossier_core::Result<()> {
//! let registry = CapabilityRegistry::builder()
//!     .register(
//!         "osint",
//!         CapabilityDescriptor::new(CapabilityKind::Collection),
//!         Arc::new(FixtureWorker::new("osint-fixture")),
//!     )
//!     .build()?;
//! let service = InvestigationService::builder()
//!     .with_registry(Arc::new(registry))
//!     .build()?;
//! let id = service.start_investigation(spec).await?;
//! let snapshot = service.get_status(id).await?;
//! println!("{} is {}", snapshot.title, snapshot.status);
//! # Ok(())
//! # }
//! ```

pub mod aggregator;
pub mod broadcast;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod persistence;
pub mod phase;
pub mod record;
pub mod registry;
pub mod runtime;
pub mod scoring;
pub mod spec;
pub mod worker;

pub use aggregator::{EvidenceAggregator, IngestOutcome, IngestSummary};
pub use broadcast::{
    Delivery, DeliveryGap, EventJournal, EventType, InMemoryJournal, JsonlJournal,
    ProgressBroadcaster, ProgressEvent, Subscription,
};
pub use config::{
    BroadcastConfig, CapabilityOverride, DispatchConfig, OrchestratorConfig, PhaseConfig,
    PhaseExit, RetryConfig, RuntimeConfig, Sequencing,
};
pub use dispatch::{DispatchNotice, DispatchRequest, Disposition, TaskDispatcher, TaskReport};
pub use error::{InvestigationError, Result};
pub use persistence::{InMemoryStore, InvestigationStore, JsonFileStore};
pub use record::{InvestigationRecord, InvestigationSnapshot, TransitionKind};
pub use registry::{Capability, CapabilityDescriptor, CapabilityKind, CapabilityRegistry};
pub use runtime::{InvestigationService, InvestigationServiceBuilder};
pub use spec::{InvestigationSpec, TargetSpec};
pub use worker::{
    AssessmentSynthesizer, CorroborationAnalyzer, FixtureResponse, FixtureWorker, Outcome,
    TaskPayload, WorkContext, WorkProduct, Worker, WorkerError,
};

pub use dossier_model as model;
