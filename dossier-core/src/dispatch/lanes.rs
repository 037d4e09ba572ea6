use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::fmt;

use dossier_model::{InvestigationID, Priority};
use tokio::sync::mpsc;

use crate::registry::Capability;

use super::{DispatchNotice, DispatchRequest};

/// Queue entry waiting for an in-flight slot on its capability lane.
pub(crate) struct QueuedTask {
    pub(crate) seq: u64,
    pub(crate) attempt: u32,
    pub(crate) request: DispatchRequest,
    pub(crate) notices: mpsc::Sender<DispatchNotice>,
}

impl QueuedTask {
    fn key(&self) -> (Priority, Reverse<u64>) {
        (self.request.priority, Reverse(self.seq))
    }
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    /// Higher priority first, then earlier enqueue.
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl fmt::Debug for QueuedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedTask")
            .field("seq", &self.seq)
            .field("attempt", &self.attempt)
            .field("task_id", &self.request.task_id)
            .field("priority", &self.request.priority)
            .finish()
    }
}

struct Lane {
    limit: usize,
    in_flight: usize,
    queue: BinaryHeap<QueuedTask>,
}

impl fmt::Debug for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lane")
            .field("limit", &self.limit)
            .field("in_flight", &self.in_flight)
            .field("queued", &self.queue.len())
            .finish()
    }
}

/// Entries released by [`LaneSet::take_ready`].
#[derive(Debug, Default)]
pub(crate) struct Released {
    pub(crate) ready: Vec<QueuedTask>,
    pub(crate) cancelled: Vec<QueuedTask>,
}

/// Per-capability priority queues with an in-flight bound each.
#[derive(Debug, Default)]
pub(crate) struct LaneSet {
    lanes: HashMap<Capability, Lane>,
    next_seq: u64,
}

impl LaneSet {
    pub(crate) fn push(
        &mut self,
        limit: usize,
        attempt: u32,
        request: DispatchRequest,
        notices: mpsc::Sender<DispatchNotice>,
    ) {
        self.next_seq += 1;
        let lane = self
            .lanes
            .entry(request.capability.clone())
            .or_insert_with(|| Lane {
                limit: limit.max(1),
                in_flight: 0,
                queue: BinaryHeap::new(),
            });
        lane.queue.push(QueuedTask {
            seq: self.next_seq,
            attempt,
            request,
            notices,
        });
    }

    /// Claims slots for as many queued entries as the bound allows.
    /// Entries of paused investigations stay queued; cancelled entries are
    /// removed and handed back for reporting.
    pub(crate) fn take_ready(
        &mut self,
        capability: &Capability,
        is_paused: impl Fn(&InvestigationID) -> bool,
    ) -> Released {
        let mut released = Released::default();
        let Some(lane) = self.lanes.get_mut(capability) else {
            return released;
        };

        let mut held = Vec::new();
        while lane.in_flight < lane.limit {
            let Some(entry) = lane.queue.pop() else {
                break;
            };
            if entry.request.cancel.is_cancelled() {
                released.cancelled.push(entry);
                continue;
            }
            if is_paused(&entry.request.investigation_id) {
                held.push(entry);
                continue;
            }
            lane.in_flight += 1;
            released.ready.push(entry);
        }
        lane.queue.extend(held);
        released
    }

    pub(crate) fn release(&mut self, capability: &Capability) {
        if let Some(lane) = self.lanes.get_mut(capability) {
            lane.in_flight = lane.in_flight.saturating_sub(1);
        }
    }

    /// Removes queued entries of `investigation_id` whose token fired.
    pub(crate) fn purge_cancelled(&mut self, investigation_id: InvestigationID) -> Vec<QueuedTask> {
        let mut purged = Vec::new();
        for lane in self.lanes.values_mut() {
            let (drop, keep): (Vec<_>, Vec<_>) = lane.queue.drain().partition(|entry| {
                entry.request.investigation_id == investigation_id
                    && entry.request.cancel.is_cancelled()
            });
            lane.queue.extend(keep);
            purged.extend(drop);
        }
        purged.sort_by_key(|entry| entry.seq);
        purged
    }

    pub(crate) fn capabilities(&self) -> Vec<Capability> {
        self.lanes.keys().cloned().collect()
    }

    /// (in-flight, queued) per capability.
    pub(crate) fn snapshot(&self) -> HashMap<Capability, (usize, usize)> {
        self.lanes
            .iter()
            .map(|(cap, lane)| (cap.clone(), (lane.in_flight, lane.queue.len())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{TargetBrief, TaskPayload};
    use dossier_model::{TargetID, TargetKind, TaskID};
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn request(n: u128, priority: Priority, inv: InvestigationID) -> DispatchRequest {
        DispatchRequest {
            task_id: TaskID(Uuid::from_u128(n)),
            investigation_id: inv,
            capability: "collect-web".into(),
            priority,
            payload: TaskPayload::Collect {
                target: TargetBrief {
                    id: TargetID(Uuid::from_u128(100 + n)),
                    label: format!("t{n}"),
                    kind: TargetKind::Other,
                },
            },
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn pops_by_priority_then_fifo() {
        let (tx, _rx) = mpsc::channel(8);
        let inv = InvestigationID(Uuid::from_u128(1));
        let mut lanes = LaneSet::default();
        lanes.push(8, 1, request(1, Priority::Low, inv), tx.clone());
        lanes.push(8, 1, request(2, Priority::Critical, inv), tx.clone());
        lanes.push(8, 1, request(3, Priority::Medium, inv), tx.clone());
        lanes.push(8, 1, request(4, Priority::Critical, inv), tx.clone());
        lanes.push(8, 1, request(5, Priority::High, inv), tx);

        let released = lanes.take_ready(&"collect-web".into(), |_| false);
        let order: Vec<u128> = released
            .ready
            .iter()
            .map(|e| e.request.task_id.0.as_u128())
            .collect();
        assert_eq!(order, vec![2, 4, 5, 3, 1]);
    }

    #[test]
    fn bound_holds_until_release() {
        let (tx, _rx) = mpsc::channel(8);
        let inv = InvestigationID(Uuid::from_u128(1));
        let cap: Capability = "collect-web".into();
        let mut lanes = LaneSet::default();
        for n in 0..5 {
            lanes.push(2, 1, request(n, Priority::Medium, inv), tx.clone());
        }

        assert_eq!(lanes.take_ready(&cap, |_| false).ready.len(), 2);
        assert!(lanes.take_ready(&cap, |_| false).ready.is_empty());

        lanes.release(&cap);
        assert_eq!(lanes.take_ready(&cap, |_| false).ready.len(), 1);
        assert_eq!(lanes.snapshot()[&cap], (2, 2));
    }

    #[test]
    fn paused_entries_stay_queued_and_cancelled_are_dropped() {
        let (tx, _rx) = mpsc::channel(8);
        let paused = InvestigationID(Uuid::from_u128(1));
        let live = InvestigationID(Uuid::from_u128(2));
        let cap: Capability = "collect-web".into();
        let mut lanes = LaneSet::default();

        lanes.push(4, 1, request(1, Priority::Critical, paused), tx.clone());
        let cancelled = request(2, Priority::High, live);
        cancelled.cancel.cancel();
        lanes.push(4, 1, cancelled, tx.clone());
        lanes.push(4, 1, request(3, Priority::Low, live), tx);

        let released = lanes.take_ready(&cap, |inv| *inv == paused);
        assert_eq!(released.ready.len(), 1);
        assert_eq!(released.ready[0].request.task_id.0.as_u128(), 3);
        assert_eq!(released.cancelled.len(), 1);
        assert_eq!(lanes.snapshot()[&cap], (1, 1));
    }

    #[test]
    fn purge_only_touches_cancelled_entries_of_one_investigation() {
        let (tx, _rx) = mpsc::channel(8);
        let inv = InvestigationID(Uuid::from_u128(1));
        let other = InvestigationID(Uuid::from_u128(2));
        let mut lanes = LaneSet::default();

        let a = request(1, Priority::Low, inv);
        let b = request(2, Priority::Low, other);
        let c = request(3, Priority::Low, inv);
        a.cancel.cancel();
        b.cancel.cancel();
        lanes.push(1, 1, a, tx.clone());
        lanes.push(1, 1, b, tx.clone());
        lanes.push(1, 1, c, tx);

        let purged = lanes.purge_cancelled(inv);
        assert_eq!(purged.len(), 1);
        assert_eq!(purged[0].request.task_id.0.as_u128(), 1);
        let cap: Capability = "collect-web".into();
        assert_eq!(lanes.snapshot()[&cap], (0, 2));
    }
}
