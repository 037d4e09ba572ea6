use std::fmt;
use std::str::FromStr;

use crate::error::ModelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum TargetKind {
    Person,
    Organization,
    Location,
    Domain,
    #[default]
    Other,
}

impl FromStr for TargetKind {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "person" => Ok(TargetKind::Person),
            "organization" | "organisation" => Ok(TargetKind::Organization),
            "location" => Ok(TargetKind::Location),
            "domain" => Ok(TargetKind::Domain),
            "other" => Ok(TargetKind::Other),
            _ => Err(ModelError::UnknownVariant {
                kind: "target kind",
                value: s.to_string(),
            }),
        }
    }
}

/// PENDING until collection opens, then ACTIVE until every requirement is
/// either satisfied (COMPLETED) or provably unsatisfiable (FAILED).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum TargetStatus {
    #[default]
    Pending,
    Active,
    Completed,
    Failed,
}

impl TargetStatus {
    pub fn is_settled(&self) -> bool {
        matches!(self, TargetStatus::Completed | TargetStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed
                | TaskStatus::Failed
                | TaskStatus::TimedOut
                | TaskStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::TimedOut => "timed_out",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TargetStatus::Pending => "pending",
            TargetStatus::Active => "active",
            TargetStatus::Completed => "completed",
            TargetStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}
