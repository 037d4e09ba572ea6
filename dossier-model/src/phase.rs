use std::fmt;
use std::str::FromStr;

use crate::error::ModelError;

/// Fixed, totally ordered investigation phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Phase {
    #[default]
    Planning,
    Collection,
    Analysis,
    Synthesis,
}

impl Phase {
    pub const ALL: [Phase; 4] = [
        Phase::Planning,
        Phase::Collection,
        Phase::Analysis,
        Phase::Synthesis,
    ];

    /// The phase that follows this one, `None` after synthesis.
    pub fn next(self) -> Option<Phase> {
        match self {
            Phase::Planning => Some(Phase::Collection),
            Phase::Collection => Some(Phase::Analysis),
            Phase::Analysis => Some(Phase::Synthesis),
            Phase::Synthesis => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Planning => "planning",
            Phase::Collection => "collection",
            Phase::Analysis => "analysis",
            Phase::Synthesis => "synthesis",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "planning" => Ok(Phase::Planning),
            "collection" => Ok(Phase::Collection),
            "analysis" => Ok(Phase::Analysis),
            "synthesis" => Ok(Phase::Synthesis),
            _ => Err(ModelError::UnknownVariant {
                kind: "phase",
                value: s.to_string(),
            }),
        }
    }
}

/// Lifecycle of the investigation aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum InvestigationStatus {
    #[default]
    Planning,
    Active,
    Paused,
    Completed,
    Failed,
    Archived,
}

impl InvestigationStatus {
    /// No further phase work happens in these states.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InvestigationStatus::Completed
                | InvestigationStatus::Failed
                | InvestigationStatus::Archived
        )
    }

    /// Operator re-open is only accepted while work is live.
    pub fn allows_reopen(&self) -> bool {
        matches!(self, InvestigationStatus::Active | InvestigationStatus::Paused)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InvestigationStatus::Planning => "planning",
            InvestigationStatus::Active => "active",
            InvestigationStatus::Paused => "paused",
            InvestigationStatus::Completed => "completed",
            InvestigationStatus::Failed => "failed",
            InvestigationStatus::Archived => "archived",
        }
    }
}

impl fmt::Display for InvestigationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
