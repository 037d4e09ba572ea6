//! Operator tooling for Dossier: configuration loading and validation, spec
//! files that wire built-in workers into a registry, and the `dossierctl`
//! command surface built on top of them.

pub mod cli;
pub mod loader;
pub mod models;
pub mod validation;

pub use loader::{ConfigLoad, ConfigLoader, error::ConfigLoadError};
pub use models::{Config, ConfigMetadata, FileConfig, spec_file::SpecFile};
pub use validation::{ConfigGuardRailError, ConfigWarning, ConfigWarnings, apply_guard_rails};
