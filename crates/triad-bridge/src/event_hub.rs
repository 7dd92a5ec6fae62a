use std::sync::{Arc, Mutex};
use std::time::Instant;

use triad_core::types::{EventKind, EventSource, JobId, ProgressEvent};

/// Default per-subscriber backlog when none is configured.
const DEFAULT_BACKLOG: usize = 1024;

/// Per-job broadcast point for [`ProgressEvent`]s, built on flume channels.
///
/// Every event published for the job is delivered to each live subscriber
/// in publication order. Delivery is best-effort: a subscriber that stops
/// draining gets its oldest queued events dropped once its bounded backlog
/// fills, along with a single `warning` event per lag episode. Publishing
/// is serialized under one lock, so per-source ordering survives fan-out.
///
/// The hub closes itself after the job's `complete` event: later publishes
/// are discarded and later subscriptions observe an already-closed stream.
#[derive(Clone)]
pub struct EventHub {
    job_id: JobId,
    started: Instant,
    backlog: usize,
    inner: Arc<Mutex<HubInner>>,
}

struct HubInner {
    subscribers: Vec<Subscriber>,
    closed: bool,
}

struct Subscriber {
    tx: flume::Sender<ProgressEvent>,
    /// Hub-held clone of the subscriber's receiver, used to discard the
    /// oldest queued event when the backlog is full (flume is MPMC).
    steal: flume::Receiver<ProgressEvent>,
    lagging: bool,
}

enum Delivery {
    Clean,
    Dropped,
    Disconnected,
}

impl EventHub {
    pub fn new(job_id: JobId) -> Self {
        Self::with_backlog(job_id, DEFAULT_BACKLOG)
    }

    pub fn with_backlog(job_id: JobId, backlog: usize) -> Self {
        Self {
            job_id,
            started: Instant::now(),
            backlog: backlog.max(1),
            inner: Arc::new(Mutex::new(HubInner {
                subscribers: Vec::new(),
                closed: false,
            })),
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Register a new subscriber and return its receiving end.
    ///
    /// Subscribing after the hub closed returns a receiver that reports
    /// disconnection immediately.
    pub fn subscribe(&self) -> flume::Receiver<ProgressEvent> {
        let (tx, rx) = flume::bounded(self.backlog);
        let mut inner = self.inner.lock().expect("EventHub lock poisoned");
        if !inner.closed {
            inner.subscribers.push(Subscriber {
                tx,
                steal: rx.clone(),
                lagging: false,
            });
        }
        rx
    }

    /// Build and publish an event stamped with wall-clock and job-relative
    /// monotonic timestamps.
    pub fn emit(&self, source: EventSource, kind: EventKind, payload: impl Into<String>) {
        let event = ProgressEvent::new(
            self.job_id.clone(),
            source,
            kind,
            payload,
            self.started.elapsed().as_millis() as u64,
        );
        self.publish(event);
    }

    /// Publish a prebuilt event to all current subscribers.
    pub fn publish(&self, event: ProgressEvent) {
        let mut inner = self.inner.lock().expect("EventHub lock poisoned");
        if inner.closed {
            tracing::debug!(job_id = %self.job_id, kind = ?event.kind, "event after close discarded");
            return;
        }
        let is_complete = event.kind == EventKind::Complete;

        let mut lag_warnings = 0usize;
        inner.subscribers.retain_mut(|sub| match deliver(sub, &event) {
            Delivery::Clean => {
                sub.lagging = false;
                true
            }
            Delivery::Dropped => {
                if !sub.lagging {
                    sub.lagging = true;
                    lag_warnings += 1;
                }
                true
            }
            Delivery::Disconnected => false,
        });

        if lag_warnings > 0 {
            tracing::warn!(job_id = %self.job_id, subscribers = lag_warnings, "subscriber lagging; events dropped");
            let warning = ProgressEvent::new(
                self.job_id.clone(),
                EventSource::Job,
                EventKind::Warning,
                "subscriber lagging; events dropped",
                self.started.elapsed().as_millis() as u64,
            );
            inner
                .subscribers
                .retain_mut(|sub| !matches!(deliver(sub, &warning), Delivery::Disconnected));
        }

        if is_complete {
            // Dropping the senders lets subscribers drain what is queued and
            // then observe disconnection; nothing is published afterwards.
            inner.closed = true;
            inner.subscribers.clear();
        }
    }

    /// Close the hub without a `complete` event (drain window expired with
    /// no subscriber, or the owning session is gone).
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("EventHub lock poisoned");
        inner.closed = true;
        inner.subscribers.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().expect("EventHub lock poisoned").closed
    }

    /// Number of currently connected subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .lock()
            .expect("EventHub lock poisoned")
            .subscribers
            .len()
    }
}

/// Push one event into a subscriber queue, discarding the oldest queued
/// events while the backlog is full.
fn deliver(sub: &mut Subscriber, event: &ProgressEvent) -> Delivery {
    // The hub's own `steal` clone keeps the channel open, so a dropped
    // subscriber is detected by receiver count rather than send failure.
    if sub.tx.receiver_count() <= 1 {
        return Delivery::Disconnected;
    }

    let mut dropped = false;
    let mut pending = event.clone();
    loop {
        match sub.tx.try_send(pending) {
            Ok(()) => {
                return if dropped {
                    Delivery::Dropped
                } else {
                    Delivery::Clean
                }
            }
            Err(flume::TrySendError::Full(ev)) => {
                let _ = sub.steal.try_recv();
                dropped = true;
                pending = ev;
            }
            Err(flume::TrySendError::Disconnected(_)) => return Delivery::Disconnected,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use triad_core::types::AgentKey;

    fn hub() -> EventHub {
        EventHub::with_backlog(JobId::new("job-1"), 4)
    }

    #[test]
    fn events_delivered_in_order() {
        let hub = hub();
        let rx = hub.subscribe();

        for i in 0..3 {
            hub.emit(
                EventSource::from(AgentKey::Primary1),
                EventKind::Stdout,
                format!("line {i}"),
            );
        }

        for i in 0..3 {
            let event = rx.try_recv().unwrap();
            assert_eq!(event.payload, format!("line {i}"));
            assert_eq!(event.kind, EventKind::Stdout);
        }
    }

    #[test]
    fn lagging_subscriber_drops_oldest_with_warning() {
        let hub = EventHub::with_backlog(JobId::new("job-2"), 2);
        let rx = hub.subscribe();

        for i in 0..4 {
            hub.emit(EventSource::Job, EventKind::Status, format!("e{i}"));
        }

        // Backlog of 2: e0..e2 were displaced; the queue holds the lag
        // warning (published once when the overflow started) and the
        // newest payload.
        let events: Vec<_> = rx.drain().collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::Warning);
        assert!(events[0].payload.contains("lagging"));
        assert_eq!(events[1].payload, "e3");
    }

    #[test]
    fn warning_emitted_once_per_lag_episode() {
        let hub = EventHub::with_backlog(JobId::new("job-3"), 2);
        let rx = hub.subscribe();

        // First episode: overflow, then the subscriber catches up.
        for i in 0..4 {
            hub.emit(EventSource::Job, EventKind::Status, format!("a{i}"));
        }
        let first_episode: Vec<_> = rx.drain().collect();
        let first_warnings = first_episode
            .iter()
            .filter(|e| e.kind == EventKind::Warning)
            .count();
        assert_eq!(first_warnings, 1);

        // A clean delivery ends the episode; a later overflow warns again.
        hub.emit(EventSource::Job, EventKind::Status, "clean");
        for i in 0..3 {
            hub.emit(EventSource::Job, EventKind::Status, format!("b{i}"));
        }
        let second_warnings = rx
            .drain()
            .filter(|e| e.kind == EventKind::Warning)
            .count();
        assert_eq!(second_warnings, 1);
    }

    #[test]
    fn disconnected_subscribers_are_pruned() {
        let hub = hub();
        let rx = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 1);

        drop(rx);
        hub.emit(EventSource::Job, EventKind::Status, "tick");
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn complete_closes_hub_and_is_last() {
        let hub = hub();
        let rx = hub.subscribe();

        hub.emit(EventSource::Job, EventKind::Phase, "running");
        hub.emit(EventSource::Job, EventKind::Complete, "succeeded");
        hub.emit(EventSource::Job, EventKind::Status, "late");

        assert!(hub.is_closed());
        let events: Vec<_> = rx.drain().collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events.last().unwrap().kind, EventKind::Complete);
        // Sender side is gone; receiver reports disconnect after drain.
        assert!(matches!(rx.try_recv(), Err(flume::TryRecvError::Disconnected)));
    }

    #[test]
    fn subscribe_after_close_is_disconnected() {
        let hub = hub();
        hub.emit(EventSource::Job, EventKind::Complete, "succeeded");
        let rx = hub.subscribe();
        assert!(matches!(rx.try_recv(), Err(flume::TryRecvError::Disconnected)));
    }

    #[test]
    fn monotonic_timestamps_are_nondecreasing() {
        let hub = hub();
        let rx = hub.subscribe();
        for _ in 0..5 {
            hub.emit(EventSource::Job, EventKind::Status, "tick");
        }
        let stamps: Vec<u64> = rx.drain().map(|e| e.monotonic_ms).collect();
        assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
    }
}
