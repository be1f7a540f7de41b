//! `dynadev-middleware` – event delivery for one device.
//!
//! Routes events from the device to its subscribers without caring about the
//! events' meaning.
//!
//! # Modules
//!
//! - [`dispatcher`] – subscriber table, per-subscriber FIFO queues, heartbeat
//!   liveness and eviction.
//! - [`transport`] – the [`Transport`] trait and the worker that drains a
//!   subscription into it.

pub mod dispatcher;
pub mod transport;

pub use dispatcher::{
    DispatchStats, DispatcherConfig, EventDispatcher, EventReceiver, SubscriberInfo,
    Subscription, SubscriptionHandle,
};
pub use transport::{ChannelTransport, DeliveryError, DeliveryWorker, Transport};
