//! The delivery seam between the dispatcher and the outside world.
//!
//! The dispatcher never talks to a network. It fills per-subscriber queues;
//! a [`DeliveryWorker`] drains one queue and hands each event to a
//! [`Transport`], which owns the wire protocol.
//!
//! - [`Transport`] – the trait every delivery backend must implement.
//! - [`ChannelTransport`] – in-process backend that forwards events into a
//!   Tokio channel, used for embedding and tests.

use std::sync::Arc;

use async_trait::async_trait;
use dynadev_types::Event;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::dispatcher::{EventDispatcher, Subscription};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("subscriber {subscriber} unreachable: {reason}")]
    Unreachable { subscriber: String, reason: String },
    #[error("payload for {subscriber} could not be encoded: {reason}")]
    Encoding { subscriber: String, reason: String },
}

/// Every delivery backend must implement this trait.
///
/// # Contract
///
/// * `deliver` – send one event to `subscriber`. An `Err` means the
///   subscriber can no longer be reached; the worker reports it to the
///   dispatcher and stops.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn deliver(&self, subscriber: &str, event: &Event) -> Result<(), DeliveryError>;
}

/// Drains one subscription into a [`Transport`].
pub struct DeliveryWorker;

impl DeliveryWorker {
    /// Spawn a task that delivers every queued event of `subscription`, in
    /// queue order, until the subscription ends or delivery fails.
    pub fn spawn(
        dispatcher: EventDispatcher,
        subscription: Subscription,
        transport: Arc<dyn Transport>,
    ) -> JoinHandle<()> {
        let Subscription {
            handle,
            subscriber_id,
            mut events,
        } = subscription;
        tokio::spawn(async move {
            let mut delivered = 0u64;
            while let Some(event) = events.recv().await {
                if let Err(e) = transport.deliver(&subscriber_id, &event).await {
                    warn!(subscription = %handle, error = %e, "delivery failed");
                    dispatcher.report_failure(handle);
                    break;
                }
                delivered += 1;
            }
            debug!(subscription = %handle, delivered, "delivery worker finished");
        })
    }
}

/// Forwards `(subscriber, event)` pairs into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<(String, Event)>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(String, Event)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn deliver(&self, subscriber: &str, event: &Event) -> Result<(), DeliveryError> {
        self.tx
            .send((subscriber.to_string(), event.clone()))
            .map_err(|_| DeliveryError::Unreachable {
                subscriber: subscriber.to_string(),
                reason: "channel closed".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::DispatcherConfig;
    use dynadev_types::{AttrQuality, DevArg, EventCategory, EventPayload};

    fn value(v: i32) -> EventPayload {
        EventPayload::AttributeValue {
            attribute: "counter".to_string(),
            value: DevArg::Long(v),
            quality: AttrQuality::Valid,
        }
    }

    struct Refusing;

    #[async_trait]
    impl Transport for Refusing {
        async fn deliver(&self, subscriber: &str, _event: &Event) -> Result<(), DeliveryError> {
            Err(DeliveryError::Unreachable {
                subscriber: subscriber.to_string(),
                reason: "connection refused".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn worker_delivers_in_order() {
        let dispatcher = EventDispatcher::new("test/transport/1", DispatcherConfig::default());
        let subscription = dispatcher.subscribe("client-a", [EventCategory::Change]);
        let handle = subscription.handle;
        let (transport, mut rx) = ChannelTransport::new();
        let worker = DeliveryWorker::spawn(dispatcher.clone(), subscription, Arc::new(transport));

        for i in 0..5 {
            dispatcher.publish(EventCategory::Change, value(i));
        }
        for i in 0..5 {
            let (subscriber, event) = rx.recv().await.expect("event delivered");
            assert_eq!(subscriber, "client-a");
            match event.payload {
                EventPayload::AttributeValue {
                    value: DevArg::Long(v),
                    ..
                } => assert_eq!(v, i),
                other => panic!("unexpected payload {other:?}"),
            }
        }

        dispatcher.unsubscribe(handle);
        worker.await.expect("worker exits cleanly");
    }

    #[tokio::test]
    async fn failing_transport_gets_subscriber_evicted() {
        let dispatcher = EventDispatcher::new("test/transport/1", DispatcherConfig::default());
        let subscription = dispatcher.subscribe("client-b", [EventCategory::Change]);
        let handle = subscription.handle;
        let worker = DeliveryWorker::spawn(dispatcher.clone(), subscription, Arc::new(Refusing));

        dispatcher.publish(EventCategory::Change, value(1));
        worker.await.expect("worker stops after failure");

        assert!(dispatcher.is_subscribed(handle));
        dispatcher.publish(EventCategory::Change, value(2));
        assert!(!dispatcher.is_subscribed(handle));
        assert_eq!(dispatcher.stats().evicted, 1);
    }
}
