use anyhow::{Context, Result};

use crate::loader::ConfigLoad;
use crate::models::FileConfig;

/// Human-readable report of a successful load.
pub fn check_report(load: &ConfigLoad) -> String {
    let meta = &load.config.metadata;
    let mut out = String::new();

    match &meta.config_path {
        Some(path) => out.push_str(&format!("config file: {}\n", path.display())),
        None => out.push_str("config file: none (built-in defaults)\n"),
    }
    if meta.env_file_loaded {
        out.push_str("env file: loaded\n");
    }
    if !meta.overridden.is_empty() {
        out.push_str(&format!("environment overrides: {}\n", meta.overridden.join(", ")));
    }
    match &load.config.store_dir {
        Some(dir) => out.push_str(&format!("store: {}\n", dir.display())),
        None => out.push_str("store: in-memory\n"),
    }

    if load.warnings.is_empty() {
        out.push_str("configuration OK\n");
    } else {
        out.push_str(&format!("configuration OK with {} warning(s):\n", load.warnings.items.len()));
        for warning in &load.warnings.items {
            out.push_str(&format!("  - {}\n", warning.message));
            if let Some(hint) = &warning.hint {
                out.push_str(&format!("    hint: {hint}\n"));
            }
        }
    }
    out
}

pub fn print_default() -> Result<String> {
    toml::to_string_pretty(&FileConfig::template()).context("failed to render default config")
}
