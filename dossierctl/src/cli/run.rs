use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use dossier_core::{
    Delivery, EventJournal, InMemoryJournal, InMemoryStore, InvestigationService,
    InvestigationSnapshot, InvestigationStore, JsonFileStore, JsonlJournal,
};
use dossier_model::{InvestigationID, InvestigationStatus};
use tracing::{info, warn};

use super::RunArgs;
use crate::models::Config;
use crate::models::spec_file::SpecFile;

pub async fn run(args: &RunArgs, config: &Config) -> Result<()> {
    let spec_file = SpecFile::load(&args.spec)?;
    let registry = Arc::new(spec_file.build_registry()?);

    let (store, journal) = backends(config.store_dir.as_deref()).await?;
    let service = InvestigationService::builder()
        .with_config(config.orchestrator.clone())
        .with_registry(registry)
        .with_store(store)
        .with_journal(journal)
        .build()?;

    let started = Instant::now();
    let id = service
        .start_investigation(spec_file.investigation.clone())
        .await?;
    info!(investigation = %id, spec = %args.spec.display(), "investigation started");
    if !args.json {
        println!("investigation {id}");
    }

    let waited = tokio::time::timeout(args.timeout, follow(&service, id, args.follow && !args.json)).await;
    let outcome = match waited {
        Ok(Ok(())) => service.get_status(id).await.map_err(anyhow::Error::from),
        Ok(Err(err)) => Err(err),
        Err(_) => {
            warn!(investigation = %id, timeout = ?args.timeout, "investigation did not settle in time");
            service
                .cancel(id, format!("timed out after {}", humantime::format_duration(args.timeout)))
                .await
                .map_err(anyhow::Error::from)
        }
    };
    service.shutdown().await;
    let snapshot = outcome?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        print!("{}", render_summary(&snapshot, started.elapsed()));
    }

    if snapshot.status == InvestigationStatus::Failed {
        bail!(
            "investigation {id} failed: {}",
            snapshot.failure_reason.as_deref().unwrap_or("unknown reason")
        );
    }
    Ok(())
}

async fn backends(
    store_dir: Option<&Path>,
) -> Result<(Arc<dyn InvestigationStore>, Arc<dyn EventJournal>)> {
    let Some(dir) = store_dir else {
        let store: Arc<dyn InvestigationStore> = Arc::new(InMemoryStore::new());
        let journal: Arc<dyn EventJournal> = Arc::new(InMemoryJournal::new());
        return Ok((store, journal));
    };

    let store: Arc<dyn InvestigationStore> = Arc::new(
        JsonFileStore::open(dir)
            .await
            .with_context(|| format!("failed to open store at {}", dir.display()))?,
    );
    let journal: Arc<dyn EventJournal> = Arc::new(
        JsonlJournal::open(dir.join("events"))
            .await
            .with_context(|| format!("failed to open event journal under {}", dir.display()))?,
    );
    Ok((store, journal))
}

/// Drains progress events until a final one arrives.
async fn follow(service: &InvestigationService, id: InvestigationID, print: bool) -> Result<()> {
    let mut subscription = service.subscribe_from(id, 0).await?;
    while let Some(delivery) = subscription.recv().await? {
        match delivery {
            Delivery::Event(event) => {
                if print {
                    println!(
                        "[{:>4}] {:<24} {}",
                        event.sequence,
                        event.event_type.as_str(),
                        event.payload_summary
                    );
                }
                if event.event_type.is_final() {
                    break;
                }
            }
            Delivery::Gap(gap) => {
                warn!(
                    investigation = %id,
                    after = gap.after_sequence,
                    dropped = gap.dropped,
                    "progress events dropped"
                );
            }
        }
    }
    Ok(())
}

pub fn render_summary(snapshot: &InvestigationSnapshot, elapsed: Duration) -> String {
    let mut out = String::new();
    out.push_str(&format!("title:        {}\n", snapshot.title));
    out.push_str(&format!("status:       {}\n", snapshot.status));
    out.push_str(&format!("phase:        {}\n", snapshot.phase));
    out.push_str(&format!("confidence:   {:.3}\n", snapshot.confidence));
    out.push_str(&format!("completeness: {:.3}\n", snapshot.completeness));
    out.push_str(&format!(
        "evidence:     {} record(s), {} finding(s)\n",
        snapshot.evidence_count, snapshot.finding_count
    ));
    let counts = &snapshot.task_counts;
    out.push_str(&format!(
        "tasks:        {} completed, {} failed, {} timed out, {} cancelled\n",
        counts.completed, counts.failed, counts.timed_out, counts.cancelled
    ));
    if !snapshot.degraded_phases.is_empty() {
        let phases: Vec<String> = snapshot.degraded_phases.iter().map(|p| p.to_string()).collect();
        out.push_str(&format!("degraded:     {}\n", phases.join(", ")));
    }
    if let Some(reason) = &snapshot.failure_reason {
        out.push_str(&format!("failure:      {reason}\n"));
    }
    for target in &snapshot.targets {
        out.push_str(&format!(
            "  target {:<20} {} ({}/{} requirement(s))\n",
            target.label,
            target.status,
            target.satisfied.len(),
            target.requirements.len()
        ));
    }
    for assessment in &snapshot.assessments {
        out.push_str(&format!(
            "  assessment {} {:.2}: {}\n",
            assessment.level, assessment.confidence, assessment.summary
        ));
    }
    let elapsed = Duration::from_millis(elapsed.as_millis() as u64);
    out.push_str(&format!("elapsed:      {}\n", humantime::format_duration(elapsed)));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use dossier_core::{InvestigationRecord, InvestigationSpec};

    #[test]
    fn summary_names_status_targets_and_failure() {
        let spec: InvestigationSpec = toml::from_str(
            r#"
                title = "Supplier review"

                [[targets]]
                label = "acme-logistics"

                [[targets]]
                label = "north-freight"
            "#,
        )
        .unwrap();
        let mut snapshot = InvestigationRecord::from_spec(InvestigationID::new(), &spec).snapshot();
        snapshot.failure_reason = Some("operator stop".into());

        let text = render_summary(&snapshot, Duration::from_millis(1500));
        assert!(text.contains("Supplier review"));
        assert!(text.contains(&format!("status:       {}", snapshot.status)));
        assert!(text.contains("acme-logistics"));
        assert!(text.contains("north-freight"));
        assert!(text.contains("failure:      operator stop"));
        assert!(text.contains("elapsed:      1s 500ms"));
    }
}
