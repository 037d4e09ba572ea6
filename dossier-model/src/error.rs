use std::fmt::{self, Display};

/// Errors produced when parsing model values from external text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    UnknownVariant { kind: &'static str, value: String },
    InvalidId(String),
}

impl Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::UnknownVariant { kind, value } => {
                write!(f, "unknown {kind}: {value}")
            }
            ModelError::InvalidId(msg) => write!(f, "invalid id: {msg}"),
        }
    }
}

impl std::error::Error for ModelError {}

pub type Result<T> = std::result::Result<T, ModelError>;
