//! Progress broadcast: journal first, then fan out.
//!
//! Every event gets the next per-investigation sequence number and is
//! appended to the [`EventJournal`] before live subscribers see it. Live
//! fan-out uses a bounded `tokio::sync::broadcast` channel, so a slow
//! subscriber loses its oldest buffered events instead of holding back the
//! publisher. The loss surfaces to that subscriber as a single
//! [`DeliveryGap`], after which it resynchronizes from the journal.

mod journal;

pub use journal::{EventJournal, InMemoryJournal, JsonlJournal};

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dossier_model::InvestigationID;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, warn};

use crate::config::BroadcastConfig;
use crate::error::{InvestigationError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    InvestigationStarted,
    InvestigationPaused,
    InvestigationResumed,
    InvestigationCompleted,
    InvestigationFailed,
    InvestigationArchived,
    PhaseEntered,
    TaskQueued,
    TaskStarted,
    TaskRetrying,
    TaskFinished,
    EvidenceAdded,
    TargetSettled,
    ConfidenceUpdated,
}

impl EventType {
    /// No further events follow one of these.
    pub fn is_final(self) -> bool {
        matches!(
            self,
            EventType::InvestigationCompleted
                | EventType::InvestigationFailed
                | EventType::InvestigationArchived
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::InvestigationStarted => "investigation_started",
            EventType::InvestigationPaused => "investigation_paused",
            EventType::InvestigationResumed => "investigation_resumed",
            EventType::InvestigationCompleted => "investigation_completed",
            EventType::InvestigationFailed => "investigation_failed",
            EventType::InvestigationArchived => "investigation_archived",
            EventType::PhaseEntered => "phase_entered",
            EventType::TaskQueued => "task_queued",
            EventType::TaskStarted => "task_started",
            EventType::TaskRetrying => "task_retrying",
            EventType::TaskFinished => "task_finished",
            EventType::EvidenceAdded => "evidence_added",
            EventType::TargetSettled => "target_settled",
            EventType::ConfidenceUpdated => "confidence_updated",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Per-investigation, starting at 1. Doubles as the resumption cursor.
    pub sequence: u64,
    pub investigation_id: InvestigationID,
    pub event_type: EventType,
    pub payload_summary: String,
    pub timestamp: DateTime<Utc>,
}

/// Events after `after_sequence` were dropped from this subscriber's buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeliveryGap {
    pub investigation_id: InvestigationID,
    pub after_sequence: u64,
    pub dropped: u64,
}

impl From<DeliveryGap> for InvestigationError {
    fn from(gap: DeliveryGap) -> Self {
        InvestigationError::DeliveryGap {
            after: gap.after_sequence,
            dropped: gap.dropped,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Delivery {
    Event(ProgressEvent),
    Gap(DeliveryGap),
}

struct Channel {
    sender: broadcast::Sender<ProgressEvent>,
    /// Last published sequence. Loaded from the journal on first use.
    last: Mutex<Option<u64>>,
}

pub struct ProgressBroadcaster {
    channels: DashMap<InvestigationID, Arc<Channel>>,
    journal: Arc<dyn EventJournal>,
    capacity: usize,
}

impl fmt::Debug for ProgressBroadcaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressBroadcaster")
            .field("channels", &self.channels.len())
            .field("capacity", &self.capacity)
            .field("journal", &self.journal)
            .finish()
    }
}

impl ProgressBroadcaster {
    pub fn new(config: &BroadcastConfig, journal: Arc<dyn EventJournal>) -> Self {
        Self {
            channels: DashMap::new(),
            journal,
            capacity: config.subscriber_buffer.max(1),
        }
    }

    pub fn journal(&self) -> &Arc<dyn EventJournal> {
        &self.journal
    }

    fn channel(&self, investigation_id: InvestigationID) -> Arc<Channel> {
        self.channels
            .entry(investigation_id)
            .or_insert_with(|| {
                let (sender, _) = broadcast::channel(self.capacity);
                Arc::new(Channel {
                    sender,
                    last: Mutex::new(None),
                })
            })
            .clone()
    }

    async fn current(&self, investigation_id: InvestigationID, last: &mut Option<u64>) -> Result<u64> {
        match *last {
            Some(seq) => Ok(seq),
            None => {
                let seq = self.journal.last_sequence(investigation_id).await?;
                *last = Some(seq);
                Ok(seq)
            }
        }
    }

    /// Journals the event, then hands it to live subscribers.
    pub async fn publish(
        &self,
        investigation_id: InvestigationID,
        event_type: EventType,
        payload_summary: impl Into<String>,
    ) -> Result<ProgressEvent> {
        let channel = self.channel(investigation_id);
        let mut last = channel.last.lock().await;
        let previous = self.current(investigation_id, &mut last).await?;

        let event = ProgressEvent {
            sequence: previous + 1,
            investigation_id,
            event_type,
            payload_summary: payload_summary.into(),
            timestamp: Utc::now(),
        };
        self.journal.append(&event).await?;
        *last = Some(event.sequence);

        // no receivers is fine; the journal has it
        let _ = channel.sender.send(event.clone());
        debug!(
            investigation = %investigation_id,
            sequence = event.sequence,
            event_type = ?event_type,
            "progress event published"
        );
        Ok(event)
    }

    /// Live events from now on.
    pub async fn subscribe(&self, investigation_id: InvestigationID) -> Result<Subscription> {
        let channel = self.channel(investigation_id);
        let mut last = channel.last.lock().await;
        let cursor = self.current(investigation_id, &mut last).await?;
        let receiver = channel.sender.subscribe();
        Ok(Subscription::new(investigation_id, receiver, Arc::clone(&self.journal), self.capacity, cursor, cursor))
    }

    /// Events strictly after `after`, then live. A backlog larger than the
    /// subscriber buffer is announced with a gap before replay starts.
    pub async fn subscribe_from(&self, investigation_id: InvestigationID, after: u64) -> Result<Subscription> {
        let channel = self.channel(investigation_id);
        let mut last = channel.last.lock().await;
        let head = self.current(investigation_id, &mut last).await?;
        let receiver = channel.sender.subscribe();

        let mut subscription =
            Subscription::new(investigation_id, receiver, Arc::clone(&self.journal), self.capacity, after, head);
        let backlog = head.saturating_sub(after);
        if backlog > self.capacity as u64 {
            warn!(
                investigation = %investigation_id,
                after,
                backlog,
                "subscriber fell behind its buffer"
            );
            subscription.gap = Some(DeliveryGap {
                investigation_id,
                after_sequence: after,
                dropped: backlog - self.capacity as u64,
            });
        }
        Ok(subscription)
    }

    pub async fn last_sequence(&self, investigation_id: InvestigationID) -> Result<u64> {
        let channel = self.channel(investigation_id);
        let mut last = channel.last.lock().await;
        self.current(investigation_id, &mut last).await
    }

    /// Ends live delivery for the investigation. Buffered events are still
    /// handed out before subscribers see the end of the stream.
    pub fn close(&self, investigation_id: InvestigationID) {
        self.channels.remove(&investigation_id);
    }
}

pub struct Subscription {
    investigation_id: InvestigationID,
    receiver: broadcast::Receiver<ProgressEvent>,
    journal: Arc<dyn EventJournal>,
    page: usize,
    /// Highest sequence handed out.
    cursor: u64,
    /// Replay from the journal until the cursor reaches this.
    replay_to: u64,
    pending: VecDeque<ProgressEvent>,
    gap: Option<DeliveryGap>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("investigation_id", &self.investigation_id)
            .field("cursor", &self.cursor)
            .field("replay_to", &self.replay_to)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl Subscription {
    fn new(
        investigation_id: InvestigationID,
        receiver: broadcast::Receiver<ProgressEvent>,
        journal: Arc<dyn EventJournal>,
        page: usize,
        cursor: u64,
        replay_to: u64,
    ) -> Self {
        Self {
            investigation_id,
            receiver,
            journal,
            page,
            cursor,
            replay_to,
            pending: VecDeque::new(),
            gap: None,
        }
    }

    pub fn investigation_id(&self) -> InvestigationID {
        self.investigation_id
    }

    /// Sequence of the last event handed out.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Next delivery, or `None` once the investigation's channel closed.
    /// Never yields an event at or below the cursor.
    pub async fn recv(&mut self) -> Result<Option<Delivery>> {
        loop {
            if let Some(gap) = self.gap.take() {
                return Ok(Some(Delivery::Gap(gap)));
            }

            if let Some(event) = self.pending.pop_front() {
                if event.sequence <= self.cursor {
                    continue;
                }
                self.cursor = event.sequence;
                return Ok(Some(Delivery::Event(event)));
            }

            if self.cursor < self.replay_to {
                let page = self
                    .journal
                    .read_after(self.investigation_id, self.cursor, self.page)
                    .await?;
                if page.is_empty() {
                    self.replay_to = self.cursor;
                } else {
                    self.pending.extend(page);
                }
                continue;
            }

            match self.receiver.recv().await {
                Ok(event) => {
                    if event.sequence <= self.cursor {
                        continue;
                    }
                    self.cursor = event.sequence;
                    return Ok(Some(Delivery::Event(event)));
                }
                Err(broadcast::error::RecvError::Lagged(dropped)) => {
                    warn!(
                        investigation = %self.investigation_id,
                        after = self.cursor,
                        dropped,
                        "subscriber lagged, resynchronizing from journal"
                    );
                    self.gap = Some(DeliveryGap {
                        investigation_id: self.investigation_id,
                        after_sequence: self.cursor,
                        dropped,
                    });
                    self.replay_to = u64::MAX;
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
            }
        }
    }

    /// Events as a stream. Gaps surface as `InvestigationError::DeliveryGap`
    /// items and the stream keeps going.
    pub fn into_stream(self) -> impl Stream<Item = Result<ProgressEvent>> + Send {
        futures::stream::unfold(self, |mut sub| async move {
            match sub.recv().await {
                Ok(Some(Delivery::Event(event))) => Some((Ok(event), sub)),
                Ok(Some(Delivery::Gap(gap))) => Some((Err(gap.into()), sub)),
                Ok(None) => None,
                Err(e) => Some((Err(e), sub)),
            }
        })
    }
}
