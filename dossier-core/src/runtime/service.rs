use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use dossier_model::{InvestigationID, Phase};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::ActorCommand;
use super::actor::{ActorDeps, InvestigationActor};
use crate::aggregator::EvidenceAggregator;
use crate::broadcast::{EventJournal, InMemoryJournal, ProgressBroadcaster, Subscription};
use crate::config::OrchestratorConfig;
use crate::dispatch::TaskDispatcher;
use crate::error::{InvestigationError, Result};
use crate::persistence::{InMemoryStore, InvestigationStore};
use crate::phase::PhasePolicy;
use crate::record::{InvestigationRecord, InvestigationSnapshot};
use crate::registry::CapabilityRegistry;
use crate::spec::InvestigationSpec;

/// Control surface over every running investigation. Each investigation
/// is owned by one actor task; the service only routes commands to it.
pub struct InvestigationService {
    deps: ActorDeps,
    actors: Arc<DashMap<InvestigationID, mpsc::Sender<ActorCommand>>>,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for InvestigationService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handles = self.handles.try_lock().map(|h| h.len()).ok();
        f.debug_struct("InvestigationService")
            .field("running", &self.actors.len())
            .field("handles", &handles)
            .field("dispatcher", &self.deps.dispatcher)
            .field("shutdown_cancelled", &self.shutdown.is_cancelled())
            .finish()
    }
}

#[derive(Default)]
pub struct InvestigationServiceBuilder {
    config: OrchestratorConfig,
    registry: Option<Arc<CapabilityRegistry>>,
    store: Option<Arc<dyn InvestigationStore>>,
    journal: Option<Arc<dyn EventJournal>>,
}

impl fmt::Debug for InvestigationServiceBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvestigationServiceBuilder")
            .field("config", &self.config)
            .field("registry", &self.registry.is_some())
            .field("store", &self.store.is_some())
            .field("journal", &self.journal)
            .finish()
    }
}

impl InvestigationServiceBuilder {
    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_registry(mut self, registry: Arc<CapabilityRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn InvestigationStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_journal(mut self, journal: Arc<dyn EventJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn build(self) -> Result<InvestigationService> {
        let registry = self.registry.ok_or_else(|| {
            InvestigationError::Internal("investigation service needs a capability registry".into())
        })?;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryStore::new()));
        let journal = self
            .journal
            .unwrap_or_else(|| Arc::new(InMemoryJournal::new()));
        let config = self.config;

        let deps = ActorDeps {
            dispatcher: TaskDispatcher::new(
                Arc::clone(&registry),
                config.dispatch.clone(),
                config.retry.clone(),
            ),
            aggregator: EvidenceAggregator::new(registry),
            policy: PhasePolicy::new(config.phases.clone()),
            broadcaster: Arc::new(ProgressBroadcaster::new(&config.broadcast, journal)),
            store,
            config: Arc::new(config),
        };

        Ok(InvestigationService {
            deps,
            actors: Arc::new(DashMap::new()),
            shutdown: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        })
    }
}

impl InvestigationService {
    pub fn builder() -> InvestigationServiceBuilder {
        InvestigationServiceBuilder::default()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.deps.config
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        self.deps.dispatcher.registry()
    }

    pub fn broadcaster(&self) -> &Arc<ProgressBroadcaster> {
        &self.deps.broadcaster
    }

    /// Validates and persists the request, then starts the investigation in
    /// its PLANNING phase.
    pub async fn start_investigation(&self, spec: InvestigationSpec) -> Result<InvestigationID> {
        if self.shutdown.is_cancelled() {
            return Err(InvestigationError::Cancelled("service is shutting down".into()));
        }
        spec.validate(self.registry())?;

        let id = InvestigationID::new();
        let record = InvestigationRecord::from_spec(id, &spec);
        self.deps.store.save(&record).await?;

        info!(
            investigation = %id,
            title = %record.title,
            targets = record.targets.len(),
            "investigation accepted"
        );
        let control = self.reserve(id)?;
        self.spawn(record, control, false).await;
        Ok(id)
    }

    /// Loads a persisted investigation and resumes driving it. At most one
    /// concurrent caller wins; the others see `InvalidTransition`.
    pub async fn recover(&self, id: InvestigationID) -> Result<()> {
        let control = self.reserve(id)?;
        let record = match self.deps.store.load(id).await {
            Ok(record) => record,
            Err(err) => {
                self.actors.remove(&id);
                return Err(err);
            }
        };
        self.spawn(record, control, true).await;
        Ok(())
    }

    pub async fn pause(&self, id: InvestigationID) -> Result<()> {
        self.request(id, ActorCommand::Pause).await?
    }

    pub async fn resume(&self, id: InvestigationID) -> Result<()> {
        self.request(id, ActorCommand::Resume).await?
    }

    /// Fails the investigation and waits until none of its tasks is live.
    pub async fn cancel(&self, id: InvestigationID, reason: impl Into<String>) -> Result<InvestigationSnapshot> {
        let reason = reason.into();
        self.request(id, |reply| ActorCommand::Cancel { reason, reply })
            .await?
    }

    /// Cancels the open phase's outstanding tasks. The phase then closes
    /// through its normal exit evaluation.
    pub async fn cancel_phase(&self, id: InvestigationID) -> Result<()> {
        self.request(id, ActorCommand::CancelPhase).await?
    }

    pub async fn reopen_phase(&self, id: InvestigationID, phase: Phase) -> Result<()> {
        self.request(id, |reply| ActorCommand::Reopen { phase, reply })
            .await?
    }

    /// Live snapshot for running investigations, stored one otherwise.
    pub async fn get_status(&self, id: InvestigationID) -> Result<InvestigationSnapshot> {
        match self.request(id, ActorCommand::Snapshot).await {
            Ok(snapshot) => Ok(snapshot),
            Err(InvestigationError::NotFound(_)) => Ok(self.deps.store.load(id).await?.snapshot()),
            Err(err) => Err(err),
        }
    }

    pub async fn archive(&self, id: InvestigationID) -> Result<()> {
        if !self.actors.contains_key(&id) {
            match self.recover(id).await {
                // a concurrent caller brought it up first
                Ok(()) | Err(InvestigationError::InvalidTransition(_)) => {}
                Err(err) => return Err(err),
            }
        }
        self.request(id, ActorCommand::Archive).await?
    }

    pub async fn subscribe(&self, id: InvestigationID) -> Result<Subscription> {
        self.ensure_known(id).await?;
        self.deps.broadcaster.subscribe(id).await
    }

    /// Replays events after `after` from the journal, then goes live.
    pub async fn subscribe_from(&self, id: InvestigationID, after: u64) -> Result<Subscription> {
        self.ensure_known(id).await?;
        self.deps.broadcaster.subscribe_from(id, after).await
    }

    pub async fn list(&self) -> Result<Vec<InvestigationID>> {
        self.deps.store.list().await
    }

    pub fn running(&self) -> Vec<InvestigationID> {
        let mut ids: Vec<_> = self.actors.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    /// Stops every actor after a final save and waits for them to exit.
    pub async fn shutdown(&self) {
        info!("shutting down investigation service");
        self.shutdown.cancel();
        self.deps.dispatcher.shutdown();

        let handles = {
            let mut guard = self.handles.lock().await;
            std::mem::take(&mut *guard)
        };
        let timeout = Duration::from_millis(self.deps.config.runtime.shutdown_timeout_ms);
        for handle in handles {
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "investigation actor panicked"),
                Err(_) => warn!("investigation actor did not stop in time"),
            }
        }
        info!("investigation service stopped");
    }

    /// Claims the mailbox slot for `id`. Commands sent before the actor
    /// starts wait in the channel.
    fn reserve(&self, id: InvestigationID) -> Result<mpsc::Receiver<ActorCommand>> {
        match self.actors.entry(id) {
            Entry::Occupied(_) => Err(InvestigationError::InvalidTransition(format!(
                "investigation {id} is already running"
            ))),
            Entry::Vacant(slot) => {
                let (tx, rx) = mpsc::channel(self.deps.config.runtime.mailbox_capacity.max(1));
                slot.insert(tx);
                Ok(rx)
            }
        }
    }

    async fn spawn(
        &self,
        record: InvestigationRecord,
        control: mpsc::Receiver<ActorCommand>,
        recovered: bool,
    ) {
        let id = record.id;
        let actor = InvestigationActor::new(self.deps.clone(), record, control, self.shutdown.child_token());
        let actors = Arc::clone(&self.actors);
        let handle = tokio::spawn(async move {
            if recovered {
                actor.run_recovered().await;
            } else {
                actor.run_new().await;
            }
            actors.remove(&id);
        });

        let mut handles = self.handles.lock().await;
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    async fn request<T>(
        &self,
        id: InvestigationID,
        command: impl FnOnce(oneshot::Sender<T>) -> ActorCommand,
    ) -> Result<T> {
        let sender = self
            .actors
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| InvestigationError::NotFound(format!("investigation {id} is not running")))?;

        let (reply, response) = oneshot::channel();
        sender
            .send(command(reply))
            .await
            .map_err(|_| InvestigationError::NotFound(format!("investigation {id} is not running")))?;
        response
            .await
            .map_err(|_| InvestigationError::Cancelled(format!("investigation {id} stopped before replying")))
    }

    async fn ensure_known(&self, id: InvestigationID) -> Result<()> {
        if self.actors.contains_key(&id) {
            return Ok(());
        }
        self.deps.store.load(id).await.map(|_| ())
    }
}
