//! Per-device event dispatcher.
//!
//! Every subscription owns a bounded [`tokio::sync::mpsc`] queue. `publish`
//! enqueues one shared [`Arc<Event>`] into the queue of every matching
//! subscriber while holding the dispatcher lock, so each subscriber observes
//! events in exactly the order `publish` was called. Draining a queue (and the
//! actual network send) belongs to whoever holds the [`EventReceiver`],
//! typically a [`DeliveryWorker`][crate::transport::DeliveryWorker].
//!
//! # Categories
//!
//! | Category | Typical payload |
//! |---|---|
//! | [`EventCategory::InterfaceChange`] | [`EventPayload::InterfaceChange`] snapshot |
//! | [`EventCategory::Change`], [`EventCategory::Archive`], [`EventCategory::User`] | [`EventPayload::AttributeValue`] |
//! | [`EventCategory::DataReady`] | [`EventPayload::DataReady`] counter |
//! | [`EventCategory::Pipe`] | [`EventPayload::Pipe`] blob |
//! | [`EventCategory::Heartbeat`] | [`EventPayload::Heartbeat`], sent to all subscribers |
//!
//! # Failure semantics
//!
//! `publish` never fails for the caller. A subscriber whose queue receiver is
//! gone, or whose transport reported a failure through
//! [`EventDispatcher::report_failure`], is evicted on the next publish or
//! heartbeat. Subscribers that do not [`ack`][EventDispatcher::ack] within
//! `max_missed_heartbeats` heartbeat periods are evicted by
//! [`EventDispatcher::heartbeat`].

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use dynadev_kernel::LivenessTracker;
use dynadev_types::{DevError, Event, EventCategory, EventPayload};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tracing::{debug, info, trace, warn};

/// Default per-subscriber queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Default number of heartbeat periods a subscriber may stay silent.
pub const DEFAULT_MAX_MISSED_HEARTBEATS: u32 = 3;

/// Opaque identifier of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherConfig {
    pub queue_capacity: usize,
    pub max_missed_heartbeats: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_missed_heartbeats: DEFAULT_MAX_MISSED_HEARTBEATS,
        }
    }
}

/// Point-in-time view of one subscriber's bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberInfo {
    pub handle: SubscriptionHandle,
    pub subscriber_id: String,
    pub categories: HashSet<EventCategory>,
    pub last_acked_revision: u64,
    pub missed_heartbeats: u32,
    /// Events dropped because this subscriber's queue was full.
    pub dropped: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub published: u64,
    pub enqueued: u64,
    pub dropped: u64,
    pub evicted: u64,
}

/// Receiving end of one subscription's queue.
#[derive(Debug)]
pub struct EventReceiver {
    rx: mpsc::Receiver<Arc<Event>>,
}

impl EventReceiver {
    /// Wait for the next event. Returns `None` once the subscription is gone
    /// and every already-queued event has been received.
    pub async fn recv(&mut self) -> Option<Arc<Event>> {
        self.rx.recv().await
    }

    /// Take the next queued event without waiting.
    pub fn try_recv(&mut self) -> Option<Arc<Event>> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Take every event currently queued.
    pub fn drain(&mut self) -> Vec<Arc<Event>> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

/// A live subscription returned by [`EventDispatcher::subscribe`].
#[derive(Debug)]
pub struct Subscription {
    pub handle: SubscriptionHandle,
    pub subscriber_id: String,
    pub events: EventReceiver,
}

struct Slot {
    subscriber_id: String,
    categories: HashSet<EventCategory>,
    last_acked_revision: u64,
    dropped: u64,
    queue: mpsc::Sender<Arc<Event>>,
}

struct DispatcherState {
    slots: HashMap<SubscriptionHandle, Slot>,
    next_handle: u64,
    current_revision: u64,
    heartbeat_sequence: u64,
    liveness: LivenessTracker<SubscriptionHandle>,
    broken: HashSet<SubscriptionHandle>,
    stats: DispatchStats,
}

impl DispatcherState {
    fn evict(&mut self, handle: SubscriptionHandle, cause: &str) {
        self.liveness.remove(&handle);
        self.broken.remove(&handle);
        if let Some(slot) = self.slots.remove(&handle) {
            self.stats.evicted += 1;
            warn!(subscription = %handle, subscriber = %slot.subscriber_id, cause, "subscriber evicted");
        }
    }

    fn evict_broken(&mut self) {
        let broken: Vec<SubscriptionHandle> = self.broken.drain().collect();
        for handle in broken {
            self.evict(handle, "transport reported failure");
        }
    }

    fn enqueue(&mut self, event: Arc<Event>) -> usize {
        self.stats.published += 1;
        let category = event.category;
        let mut enqueued = 0;
        let mut unreachable = Vec::new();
        for (handle, slot) in self.slots.iter_mut() {
            if category != EventCategory::Heartbeat && !slot.categories.contains(&category) {
                continue;
            }
            match slot.queue.try_send(Arc::clone(&event)) {
                Ok(()) => enqueued += 1,
                Err(TrySendError::Full(_)) => {
                    slot.dropped += 1;
                    self.stats.dropped += 1;
                    warn!(subscription = %handle, %category, "subscriber queue full; event dropped");
                }
                Err(TrySendError::Closed(_)) => unreachable.push(*handle),
            }
        }
        self.stats.enqueued += enqueued as u64;
        for handle in unreachable {
            self.evict(handle, "receiver dropped");
        }
        trace!(%category, enqueued, "event published");
        enqueued
    }
}

/// Subscriber lists and delivery queues of one device.
///
/// Clone it cheaply – all clones share the same subscriber table.
#[derive(Clone)]
pub struct EventDispatcher {
    device: Arc<str>,
    config: DispatcherConfig,
    state: Arc<Mutex<DispatcherState>>,
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("device", &self.device)
            .field("config", &self.config)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl EventDispatcher {
    pub fn new(device: &str, config: DispatcherConfig) -> Self {
        Self {
            device: Arc::from(device),
            config,
            state: Arc::new(Mutex::new(DispatcherState {
                slots: HashMap::new(),
                next_handle: 1,
                current_revision: 0,
                heartbeat_sequence: 0,
                liveness: LivenessTracker::new(config.max_missed_heartbeats),
                broken: HashSet::new(),
                stats: DispatchStats::default(),
            })),
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn config(&self) -> DispatcherConfig {
        self.config
    }

    /// Register `subscriber_id` for `categories`. Heartbeats are delivered
    /// regardless of the requested categories.
    pub fn subscribe(
        &self,
        subscriber_id: &str,
        categories: impl IntoIterator<Item = EventCategory>,
    ) -> Subscription {
        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let categories: HashSet<EventCategory> = categories.into_iter().collect();
        let mut state = self.state.lock();
        let handle = SubscriptionHandle(state.next_handle);
        state.next_handle += 1;
        let last_acked_revision = state.current_revision;
        state.liveness.register(handle);
        info!(
            device = %self.device,
            subscription = %handle,
            subscriber = subscriber_id,
            categories = ?categories,
            "subscribed"
        );
        state.slots.insert(
            handle,
            Slot {
                subscriber_id: subscriber_id.to_string(),
                categories,
                last_acked_revision,
                dropped: 0,
                queue: tx,
            },
        );
        Subscription {
            handle,
            subscriber_id: subscriber_id.to_string(),
            events: EventReceiver { rx },
        }
    }

    /// Cancel a subscription. Events already queued stay receivable.
    /// Returns `false` when the handle is unknown (e.g. already evicted).
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let mut state = self.state.lock();
        state.liveness.remove(&handle);
        state.broken.remove(&handle);
        let removed = state.slots.remove(&handle).is_some();
        if removed {
            info!(device = %self.device, subscription = %handle, "unsubscribed");
        }
        removed
    }

    /// Deliver `payload` to every current subscriber of `category`.
    ///
    /// Returns the number of subscriber queues the event was placed in.
    /// Returns `0` when nobody is listening; that is not an error.
    pub fn publish(&self, category: EventCategory, payload: EventPayload) -> usize {
        let event = Arc::new(Event::new(&*self.device, category, payload));
        let mut state = self.state.lock();
        state.evict_broken();
        if let EventPayload::InterfaceChange(snapshot) = &event.payload {
            state.current_revision = state.current_revision.max(snapshot.revision);
        }
        state.enqueue(event)
    }

    /// One heartbeat period: expire silent subscribers, then send a
    /// heartbeat event to everybody left. Returns the evicted handles.
    pub fn heartbeat(&self) -> Vec<SubscriptionHandle> {
        let mut state = self.state.lock();
        state.evict_broken();
        let expired = state.liveness.tick();
        for handle in &expired {
            state.evict(*handle, "missed heartbeats");
        }
        state.heartbeat_sequence += 1;
        let sequence = state.heartbeat_sequence;
        let event = Arc::new(Event::new(
            &*self.device,
            EventCategory::Heartbeat,
            EventPayload::Heartbeat { sequence },
        ));
        let sent = state.enqueue(event);
        debug!(device = %self.device, sequence, sent, evicted = expired.len(), "heartbeat");
        expired
    }

    /// Liveness acknowledgement from a subscriber, carrying the newest
    /// interface revision it has processed.
    ///
    /// # Errors
    ///
    /// [`DevError::InvalidArgument`] when the handle is unknown or `revision`
    /// is newer than any revision published so far.
    pub fn ack(&self, handle: SubscriptionHandle, revision: u64) -> Result<(), DevError> {
        let mut state = self.state.lock();
        let current = state.current_revision;
        if revision > current {
            return Err(DevError::InvalidArgument(format!(
                "revision {revision} is ahead of current revision {current}"
            )));
        }
        let Some(slot) = state.slots.get_mut(&handle) else {
            return Err(DevError::InvalidArgument(format!("unknown subscription {handle}")));
        };
        slot.last_acked_revision = slot.last_acked_revision.max(revision);
        state.liveness.ack(&handle);
        Ok(())
    }

    /// Transport callback: delivery to `handle` failed. The subscriber is
    /// evicted on the next publish or heartbeat.
    pub fn report_failure(&self, handle: SubscriptionHandle) {
        let mut state = self.state.lock();
        if state.slots.contains_key(&handle) {
            state.broken.insert(handle);
            debug!(subscription = %handle, "delivery failure reported");
        }
    }

    pub fn current_revision(&self) -> u64 {
        self.state.lock().current_revision
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().slots.len()
    }

    pub fn is_subscribed(&self, handle: SubscriptionHandle) -> bool {
        self.state.lock().slots.contains_key(&handle)
    }

    pub fn subscribers(&self) -> Vec<SubscriberInfo> {
        let state = self.state.lock();
        let mut infos: Vec<SubscriberInfo> = state
            .slots
            .iter()
            .map(|(handle, slot)| SubscriberInfo {
                handle: *handle,
                subscriber_id: slot.subscriber_id.clone(),
                categories: slot.categories.clone(),
                last_acked_revision: slot.last_acked_revision,
                missed_heartbeats: state.liveness.missed(handle).unwrap_or(0),
                dropped: slot.dropped,
            })
            .collect();
        infos.sort_by_key(|i| i.handle);
        infos
    }

    pub fn stats(&self) -> DispatchStats {
        self.state.lock().stats
    }
}
