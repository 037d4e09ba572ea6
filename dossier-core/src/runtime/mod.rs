//! Per-investigation actors and the service that supervises them.

mod actor;
mod service;

pub use service::{InvestigationService, InvestigationServiceBuilder};

use dossier_model::Phase;
use tokio::sync::oneshot;

use crate::error::Result;
use crate::record::InvestigationSnapshot;

/// Control messages accepted by an investigation actor's mailbox.
#[derive(Debug)]
pub(crate) enum ActorCommand {
    Pause(oneshot::Sender<Result<()>>),
    Resume(oneshot::Sender<Result<()>>),
    /// Replies once no task of the investigation is live.
    Cancel {
        reason: String,
        reply: oneshot::Sender<Result<InvestigationSnapshot>>,
    },
    CancelPhase(oneshot::Sender<Result<()>>),
    Reopen {
        phase: Phase,
        reply: oneshot::Sender<Result<()>>,
    },
    Snapshot(oneshot::Sender<InvestigationSnapshot>),
    Archive(oneshot::Sender<Result<()>>),
}
