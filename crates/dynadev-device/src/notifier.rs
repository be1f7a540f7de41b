//! [`InterfaceNotifier`] – revision counter and interface-change publisher.
//!
//! Every call to [`InterfaceNotifier::snapshot`] increments the revision by
//! exactly one, whether or not the interface content differs from the
//! previous snapshot. The resulting [`InterfaceSnapshot`] is immutable and
//! shared by reference with every subscriber notified of that revision.

use std::sync::Arc;

use dynadev_middleware::EventDispatcher;
use dynadev_types::{EventCategory, EventPayload, InterfaceSnapshot};
use tracing::debug;

use crate::registry::Registry;

#[derive(Debug)]
pub struct InterfaceNotifier {
    device: String,
    revision: u64,
}

impl InterfaceNotifier {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            revision: 0,
        }
    }

    /// Revision of the latest snapshot; `0` before any mutation.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// View of `registry` at the current revision, without advancing it.
    /// Used for the startup interface.
    pub fn current(&self, registry: &Registry) -> Arc<InterfaceSnapshot> {
        Arc::new(self.view(registry, self.revision))
    }

    /// View of `registry` tagged with a freshly incremented revision.
    pub fn snapshot(&mut self, registry: &Registry) -> Arc<InterfaceSnapshot> {
        self.revision += 1;
        Arc::new(self.view(registry, self.revision))
    }

    /// Hand `snapshot` to the dispatcher as an interface-change event.
    /// Returns the number of subscribers it was queued for.
    pub fn notify(&self, dispatcher: &EventDispatcher, snapshot: &Arc<InterfaceSnapshot>) -> usize {
        let queued = dispatcher.publish(
            EventCategory::InterfaceChange,
            EventPayload::InterfaceChange(Arc::clone(snapshot)),
        );
        debug!(
            device = %self.device,
            revision = snapshot.revision,
            queued,
            "interface change notified"
        );
        queued
    }

    fn view(&self, registry: &Registry, revision: u64) -> InterfaceSnapshot {
        InterfaceSnapshot {
            device: self.device.clone(),
            revision,
            attributes: registry.attribute_descriptors(),
            commands: registry.command_descriptors(),
            pipes: registry.pipe_descriptors(),
        }
    }
}
