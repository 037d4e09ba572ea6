//! Resolves configuration from a TOML file, an optional `.env` file and
//! `DOSSIER_*` environment overrides, in that order of precedence (later
//! wins), then runs the guard rails.

pub mod error;

use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::models::{ConfigMetadata, FileConfig, Config};
use crate::validation::{ConfigWarnings, apply_guard_rails};
use error::ConfigLoadError;

pub const ENV_CONFIG: &str = "DOSSIER_CONFIG";
pub const ENV_STORE_DIR: &str = "DOSSIER_STORE_DIR";
pub const ENV_LOG: &str = "DOSSIER_LOG";
pub const ENV_MAX_ATTEMPTS: &str = "DOSSIER_MAX_ATTEMPTS";
pub const ENV_SUBSCRIBER_BUFFER: &str = "DOSSIER_SUBSCRIBER_BUFFER";

const DEFAULT_LOCATIONS: [&str; 2] = ["dossier.toml", "config/dossier.toml"];

/// Result of a successful load: the resolved config plus non-fatal findings.
#[derive(Debug, Clone)]
pub struct ConfigLoad {
    pub config: Config,
    pub warnings: ConfigWarnings,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
    env_file: Option<PathBuf>,
    skip_dotenv: bool,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config_path(mut self, path: Option<PathBuf>) -> Self {
        self.config_path = path;
        self
    }

    /// Reads this file instead of looking for `.env` in the working directory.
    pub fn with_env_file(mut self, path: Option<PathBuf>) -> Self {
        self.env_file = path;
        self
    }

    pub fn without_dotenv(mut self) -> Self {
        self.skip_dotenv = true;
        self
    }

    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = self.load_env_file()?;
        self.load_with(env_file_loaded, |key| std::env::var(key).ok())
    }

    /// Resolution with an explicit environment lookup. Nothing here reads
    /// the process environment.
    pub fn load_with(
        &self,
        env_file_loaded: bool,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<ConfigLoad, ConfigLoadError> {
        let explicit = self
            .config_path
            .clone()
            .or_else(|| env(ENV_CONFIG).map(PathBuf::from));
        let config_path = match explicit {
            Some(path) if !path.exists() => {
                return Err(ConfigLoadError::MissingConfigFile { path });
            }
            Some(path) => Some(path),
            None => DEFAULT_LOCATIONS
                .iter()
                .map(PathBuf::from)
                .find(|p| p.is_file()),
        };

        let mut file = match &config_path {
            Some(path) => read_file_config(path)?,
            None => FileConfig::default(),
        };

        let mut overridden = Vec::new();
        if let Some(dir) = env(ENV_STORE_DIR).filter(|v| !v.trim().is_empty()) {
            file.store.dir = Some(PathBuf::from(dir));
            overridden.push(ENV_STORE_DIR);
        }
        if let Some(filter) = env(ENV_LOG).filter(|v| !v.trim().is_empty()) {
            file.log.filter = Some(filter);
            overridden.push(ENV_LOG);
        }
        if let Some(raw) = env(ENV_MAX_ATTEMPTS) {
            file.retry.max_attempts = parse_env(ENV_MAX_ATTEMPTS, &raw)?;
            overridden.push(ENV_MAX_ATTEMPTS);
        }
        if let Some(raw) = env(ENV_SUBSCRIBER_BUFFER) {
            file.broadcast.subscriber_buffer = parse_env(ENV_SUBSCRIBER_BUFFER, &raw)?;
            overridden.push(ENV_SUBSCRIBER_BUFFER);
        }

        let config = file.into_config(ConfigMetadata {
            config_path,
            env_file_loaded,
            overridden,
        });
        let warnings = apply_guard_rails(&config)?;
        Ok(ConfigLoad { config, warnings })
    }

    fn load_env_file(&self) -> Result<bool, ConfigLoadError> {
        if self.skip_dotenv {
            return Ok(false);
        }
        match &self.env_file {
            Some(path) => {
                dotenvy::from_path(path)?;
                Ok(true)
            }
            None => match dotenvy::dotenv() {
                Ok(_) => Ok(true),
                Err(err) if err.not_found() => Ok(false),
                Err(err) => Err(err.into()),
            },
        }
    }
}

fn read_file_config(path: &Path) -> Result<FileConfig, ConfigLoadError> {
    let raw = std::fs::read_to_string(path).map_err(|source| {
        ConfigLoadError::ConfigFileIo {
            path: path.to_path_buf(),
            source,
        }
    })?;
    toml::from_str(&raw).map_err(|source| ConfigLoadError::ConfigFileParse {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_env<T>(key: &'static str, raw: &str) -> Result<T, ConfigLoadError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|err: T::Err| ConfigLoadError::InvalidEnv {
        key,
        value: raw.to_string(),
        reason: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    fn config_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn env_overrides_win_over_the_file() {
        let file = config_file("[store]\ndir = \"/from/file\"\n[retry]\nmax_attempts = 2\n");
        let load = ConfigLoader::new()
            .with_config_path(Some(file.path().to_path_buf()))
            .load_with(
                false,
                env(&[(ENV_STORE_DIR, "/from/env"), (ENV_SUBSCRIBER_BUFFER, "64")]),
            )
            .unwrap();

        let config = load.config;
        assert_eq!(config.store_dir, Some(PathBuf::from("/from/env")));
        assert_eq!(config.orchestrator.retry.max_attempts, 2);
        assert_eq!(config.orchestrator.broadcast.subscriber_buffer, 64);
        assert_eq!(config.metadata.overridden, vec![ENV_STORE_DIR, ENV_SUBSCRIBER_BUFFER]);
        assert!(load.warnings.is_empty());
    }

    #[test]
    fn config_path_can_come_from_the_environment() {
        let file = config_file("[log]\nfilter = \"dossier_core=debug\"\n");
        let path = file.path().to_string_lossy().to_string();
        let load = ConfigLoader::new()
            .load_with(false, env(&[(ENV_CONFIG, path.as_str())]))
            .unwrap();
        assert_eq!(load.config.log_filter, "dossier_core=debug");
        assert_eq!(load.config.metadata.config_path, Some(file.path().to_path_buf()));
    }

    #[test]
    fn bad_values_are_reported_with_their_key() {
        let err = ConfigLoader::new()
            .with_config_path(Some(config_file("").path().to_path_buf()))
            .load_with(false, env(&[(ENV_MAX_ATTEMPTS, "many")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigLoadError::InvalidEnv { key: ENV_MAX_ATTEMPTS, .. }
        ));

        let err = ConfigLoader::new()
            .with_config_path(Some(config_file("[retry]\nmax_attempts = 0\n").path().to_path_buf()))
            .load_with(false, env(&[]))
            .unwrap_err();
        assert!(matches!(err, ConfigLoadError::GuardRail(_)));

        let err = ConfigLoader::new()
            .with_config_path(Some(PathBuf::from("/definitely/not/here.toml")))
            .load_with(false, env(&[]))
            .unwrap_err();
        assert!(matches!(err, ConfigLoadError::MissingConfigFile { .. }));
    }

    #[test]
    fn malformed_files_fail_to_parse() {
        let file = config_file("[retry\nmax_attempts = 2\n");
        let err = ConfigLoader::new()
            .with_config_path(Some(file.path().to_path_buf()))
            .load_with(false, env(&[]))
            .unwrap_err();
        assert!(matches!(err, ConfigLoadError::ConfigFileParse { .. }));
    }
}
