use std::fmt;
use std::str::FromStr;

use crate::error::ModelError;

/// Handling level of an investigation. Ordered from least to most restricted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Classification {
    #[default]
    Unclassified,
    Confidential,
    Secret,
    TopSecret,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Unclassified => "unclassified",
            Classification::Confidential => "confidential",
            Classification::Secret => "secret",
            Classification::TopSecret => "top_secret",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Classification {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "unclassified" => Ok(Classification::Unclassified),
            "confidential" => Ok(Classification::Confidential),
            "secret" => Ok(Classification::Secret),
            "top_secret" => Ok(Classification::TopSecret),
            _ => Err(ModelError::UnknownVariant {
                kind: "classification",
                value: s.to_string(),
            }),
        }
    }
}

/// Scheduling priority. `Ord` runs LOW < MEDIUM < HIGH < CRITICAL so a
/// max-heap pops the most urgent work first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Priority {
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Medium,
        Priority::Low,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            _ => Err(ModelError::UnknownVariant {
                kind: "priority",
                value: s.to_string(),
            }),
        }
    }
}

/// Severity carried by a threat assessment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ThreatLevel {
    #[default]
    Negligible,
    Low,
    Moderate,
    High,
    Severe,
}

impl ThreatLevel {
    /// Buckets a 0.0-1.0 signal into a level.
    pub fn from_signal(signal: f64) -> Self {
        match signal {
            s if s >= 0.85 => ThreatLevel::Severe,
            s if s >= 0.65 => ThreatLevel::High,
            s if s >= 0.4 => ThreatLevel::Moderate,
            s if s >= 0.15 => ThreatLevel::Low,
            _ => ThreatLevel::Negligible,
        }
    }
}

impl fmt::Display for ThreatLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ThreatLevel::Negligible => "negligible",
            ThreatLevel::Low => "low",
            ThreatLevel::Moderate => "moderate",
            ThreatLevel::High => "high",
            ThreatLevel::Severe => "severe",
        };
        f.write_str(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_is_totally_ordered() {
        assert!(Classification::Unclassified < Classification::Confidential);
        assert!(Classification::Confidential < Classification::Secret);
        assert!(Classification::Secret < Classification::TopSecret);
    }

    #[test]
    fn priority_orders_critical_highest() {
        let mut all = vec![
            Priority::Medium,
            Priority::Critical,
            Priority::Low,
            Priority::High,
        ];
        all.sort();
        assert_eq!(
            all,
            vec![
                Priority::Low,
                Priority::Medium,
                Priority::High,
                Priority::Critical
            ]
        );
    }

    #[test]
    fn parses_case_insensitively() {
        assert_eq!(
            "Top-Secret".parse::<Classification>().unwrap(),
            Classification::TopSecret
        );
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn threat_level_buckets() {
        assert_eq!(ThreatLevel::from_signal(0.0), ThreatLevel::Negligible);
        assert_eq!(ThreatLevel::from_signal(0.5), ThreatLevel::Moderate);
        assert_eq!(ThreatLevel::from_signal(0.9), ThreatLevel::Severe);
    }
}
