//! Identifiers and enumerations shared across Dossier crates.
#![allow(missing_docs)]

pub mod error;
pub mod ids;
pub mod levels;
pub mod phase;
pub mod status;

pub use error::{ModelError, Result as ModelResult};
pub use ids::{
    AssessmentID, EvidenceID, InvestigationID, ResultID, TargetID, TaskID,
};
pub use levels::{Classification, Priority, ThreatLevel};
pub use phase::{InvestigationStatus, Phase};
pub use status::{TargetKind, TargetStatus, TaskStatus};
