use std::str::FromStr;

use uuid::Uuid;

use crate::error::ModelError;

macro_rules! typed_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Copy)]
        #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
        #[cfg_attr(feature = "serde", serde(transparent))]
        pub struct $name(pub Uuid);

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl $name {
            /// Time-ordered identifier so ids sort by creation.
            pub fn new() -> Self {
                $name(Uuid::now_v7())
            }

            pub fn as_str(&self) -> String {
                self.0.to_string()
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }

            pub fn to_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl AsRef<Uuid> for $name {
            fn as_ref(&self) -> &Uuid {
                &self.0
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                $name(value)
            }
        }

        impl FromStr for $name {
            type Err = ModelError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s.trim())
                    .map($name)
                    .map_err(|err| ModelError::InvalidId(format!("{s}: {err}")))
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

typed_id!(
    /// Root aggregate identifier.
    InvestigationID
);
typed_id!(
    /// Entity under investigation. Only valid within its owning investigation.
    TargetID
);
typed_id!(
    /// One unit of dispatched work.
    TaskID
);
typed_id!(EvidenceID);
typed_id!(ResultID);
typed_id!(AssessmentID);
