use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use dossier_core::{InvestigationStore, JsonFileStore};
use dossier_model::InvestigationID;

use super::StatusArgs;
use super::run::render_summary;
use crate::models::Config;

pub async fn status(args: &StatusArgs, config: &Config) -> Result<()> {
    let id: InvestigationID = args
        .id
        .parse()
        .with_context(|| format!("'{}' is not an investigation id", args.id))?;

    let dir = args
        .store_dir
        .clone()
        .or_else(|| config.store_dir.clone())
        .ok_or_else(|| anyhow!("no store directory; pass --store-dir or set DOSSIER_STORE_DIR"))?;

    let store = JsonFileStore::open(&dir)
        .await
        .with_context(|| format!("failed to open store at {}", dir.display()))?;
    let record = store.load(id).await?;
    let snapshot = record.snapshot();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        let elapsed = (snapshot.updated_at - record.created_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        print!("{}", render_summary(&snapshot, elapsed));
    }
    Ok(())
}
