use dossier_model::Phase;
use thiserror::Error;

use super::models::Config;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigGuardRailError {
    #[error("{scope} concurrency must be at least 1")]
    ZeroConcurrency { scope: String },
    #[error("retry.max_attempts must be at least 1")]
    ZeroAttempts,
    #[error("runtime.save_attempts must be at least 1")]
    ZeroSaveAttempts,
    #[error("phases.{phase}.min_success_ratio {value} is outside [0, 1]")]
    RatioOutOfRange { phase: Phase, value: f64 },
    #[error("broadcast.subscriber_buffer must be at least 1")]
    ZeroSubscriberBuffer,
    #[error("runtime.mailbox_capacity must be at least 1")]
    ZeroMailbox,
}

#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push<S: Into<String>>(&mut self, message: S) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint<S: Into<String>, H: Into<String>>(
        &mut self,
        message: S,
        hint: H,
    ) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn extend(&mut self, other: ConfigWarnings) {
        self.items.extend(other.items);
    }
}

pub fn apply_guard_rails(
    config: &Config,
) -> Result<ConfigWarnings, ConfigGuardRailError> {
    let mut warnings = ConfigWarnings::default();
    let orchestrator = &config.orchestrator;

    if orchestrator.dispatch.default_max_concurrency == 0 {
        return Err(ConfigGuardRailError::ZeroConcurrency {
            scope: "dispatch.default_max_concurrency".into(),
        });
    }
    let mut overrides: Vec<_> = orchestrator.dispatch.overrides.iter().collect();
    overrides.sort_by(|a, b| a.0.cmp(b.0));
    for (capability, limits) in overrides {
        if limits.max_concurrency == Some(0) {
            return Err(ConfigGuardRailError::ZeroConcurrency {
                scope: format!("dispatch.overrides.{capability}"),
            });
        }
        if limits.timeout_ms == Some(0) {
            warnings.push_with_hint(
                format!("dispatch.overrides.{capability}.timeout_ms is 0; every attempt will time out"),
                "Remove the override to fall back to dispatch.default_timeout_ms",
            );
        }
    }

    if orchestrator.retry.max_attempts == 0 {
        return Err(ConfigGuardRailError::ZeroAttempts);
    }
    if orchestrator.runtime.save_attempts == 0 {
        return Err(ConfigGuardRailError::ZeroSaveAttempts);
    }
    if orchestrator.broadcast.subscriber_buffer == 0 {
        return Err(ConfigGuardRailError::ZeroSubscriberBuffer);
    }
    if orchestrator.runtime.mailbox_capacity == 0 {
        return Err(ConfigGuardRailError::ZeroMailbox);
    }

    for phase in Phase::ALL {
        let exit = orchestrator.phases.exit_for(phase);
        if !(0.0..=1.0).contains(&exit.min_success_ratio) {
            return Err(ConfigGuardRailError::RatioOutOfRange {
                phase,
                value: exit.min_success_ratio,
            });
        }
        if exit.max_dwell_ms < orchestrator.runtime.tick_interval_ms {
            warnings.push_with_hint(
                format!(
                    "phases.{phase}.max_dwell_ms ({}) is shorter than runtime.tick_interval_ms ({})",
                    exit.max_dwell_ms, orchestrator.runtime.tick_interval_ms
                ),
                "Dwell expiry is only noticed on a tick; lower the tick interval",
            );
        }
    }

    if orchestrator.retry.backoff_base_ms > orchestrator.retry.backoff_max_ms {
        warnings.push(format!(
            "retry.backoff_base_ms ({}) exceeds retry.backoff_max_ms ({}); every delay is capped",
            orchestrator.retry.backoff_base_ms, orchestrator.retry.backoff_max_ms
        ));
    }
    if orchestrator.retry.jitter_ratio > 1.0 {
        warnings.push("retry.jitter_ratio above 1.0 can collapse delays to zero");
    }

    if config.store_dir.is_none() {
        warnings.push_with_hint(
            "No store directory configured; investigations are kept in memory and lost on exit",
            "Set DOSSIER_STORE_DIR or add a [store] dir to the config file",
        );
    }

    Ok(warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConfigMetadata, FileConfig};
    use std::path::PathBuf;

    fn config() -> Config {
        let mut config = FileConfig::default().into_config(ConfigMetadata::default());
        config.store_dir = Some(PathBuf::from("/tmp/dossier"));
        config
    }

    #[test]
    fn defaults_pass_without_warnings() {
        let warnings = apply_guard_rails(&config()).unwrap();
        assert!(warnings.is_empty(), "{:?}", warnings.items);
    }

    #[test]
    fn hard_errors_block_startup() {
        let mut cfg = config();
        cfg.orchestrator.retry.max_attempts = 0;
        assert_eq!(apply_guard_rails(&cfg).unwrap_err(), ConfigGuardRailError::ZeroAttempts);

        let mut cfg = config();
        cfg.orchestrator.phases.analysis.min_success_ratio = 1.5;
        assert!(matches!(
            apply_guard_rails(&cfg),
            Err(ConfigGuardRailError::RatioOutOfRange { phase: Phase::Analysis, .. })
        ));

        let mut cfg = config();
        cfg.orchestrator.dispatch.default_max_concurrency = 0;
        assert!(matches!(
            apply_guard_rails(&cfg),
            Err(ConfigGuardRailError::ZeroConcurrency { .. })
        ));
    }

    #[test]
    fn missing_store_is_only_a_warning() {
        let mut cfg = config();
        cfg.store_dir = None;
        let warnings = apply_guard_rails(&cfg).unwrap();
        assert_eq!(warnings.items.len(), 1);
        assert!(warnings.items[0].hint.as_deref().unwrap().contains("DOSSIER_STORE_DIR"));
    }
}
