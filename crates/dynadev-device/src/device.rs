//! [`Device`] – one device instance and its concurrency domain.
//!
//! A device owns its [`Registry`], [`InterfaceNotifier`] and
//! [`EventDispatcher`]. Every interface mutation runs under the device's
//! write lock: the registry change, the revision increment and the
//! interface-change publish happen as one step, so no two snapshots share a
//! revision and subscribers see revisions in increasing order. Readers of the
//! current snapshot take the read lock and never observe a half-applied
//! mutation.
//!
//! Request paths ([`Device::read_attribute`], [`Device::execute`], ...) ask
//! the [`AccessGuard`] first, look the handler up under the read lock, release
//! the lock, and only then call the handler. A handler may therefore mutate
//! the interface of the device that called it.
//!
//! # Example
//!
//! ```
//! use dynadev_device::{AttributeDef, DeviceBuilder};
//! use dynadev_types::{AttrAccess, DataType, EventCategory};
//!
//! let device = DeviceBuilder::new("test/doc/1")
//!     .attribute(AttributeDef::new("busy", DataType::Boolean, AttrAccess::Read))
//!     .build()
//!     .unwrap();
//! let mut sub = device.subscribe("client", [EventCategory::InterfaceChange]);
//!
//! let revision = device
//!     .add_attribute(AttributeDef::new("ioattr", DataType::Double, AttrAccess::Read))
//!     .unwrap();
//! assert_eq!(revision, 1);
//! assert_eq!(device.current_snapshot().attribute_names(), vec!["busy", "ioattr"]);
//! assert!(sub.events.try_recv().is_some());
//! ```

use std::sync::Arc;

use dynadev_kernel::{AccessGuard, BusyLease, BusyState, GatePolicy};
use dynadev_middleware::{DispatcherConfig, EventDispatcher, Subscription, SubscriptionHandle};
use dynadev_types::{
    AttrQuality, DataType, DevArg, DevError, DevState, EntryKind, EventCategory, EventPayload,
    InterfaceSnapshot, OperationKind, PipeBlob,
};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::handlers::{AttributeDef, CommandDef, PipeDef};
use crate::notifier::InterfaceNotifier;
use crate::registry::{PushKind, Registry};
use crate::source::{self, InterfaceSource};
use crate::standard;

struct DeviceCore {
    registry: Registry,
    notifier: InterfaceNotifier,
    latest: Arc<InterfaceSnapshot>,
}

pub struct Device {
    name: String,
    core: RwLock<DeviceCore>,
    dispatcher: EventDispatcher,
    guard: AccessGuard,
    state: RwLock<DevState>,
    status: RwLock<Option<String>>,
}

fn expect_type(target: &str, expected: DataType, value: &DevArg) -> Result<(), DevError> {
    let actual = value.data_type();
    if actual == expected {
        Ok(())
    } else {
        Err(DevError::WrongType {
            target: target.to_string(),
            expected,
            actual,
        })
    }
}

fn not_allowed(operation: OperationKind, target: &str, reason: &str) -> DevError {
    DevError::NotAllowed {
        operation,
        target: target.to_string(),
        reason: reason.to_string(),
    }
}

impl Device {
    /// The device name, e.g. `test/ifchange/1`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Event fan-out for this device.
    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    /// Busy gate applied to every client request.
    pub fn guard(&self) -> &AccessGuard {
        &self.guard
    }

    /// Shared busy flag behind [`Device::guard`].
    pub fn busy_state(&self) -> &Arc<BusyState> {
        self.guard.busy_state()
    }

    /// The interface as of the latest revision.
    pub fn current_snapshot(&self) -> Arc<InterfaceSnapshot> {
        Arc::clone(&self.core.read().latest)
    }

    /// Latest published interface revision; `0` until the first mutation.
    pub fn revision(&self) -> u64 {
        self.core.read().notifier.revision()
    }

    // ────────────────────────────────────────────────────────────────────────
    // Interface mutations
    // ────────────────────────────────────────────────────────────────────────

    /// Add a dynamic attribute and return the new interface revision.
    ///
    /// # Errors
    ///
    /// - [`DevError::NotAllowed`] while the device is busy.
    /// - [`DevError::DuplicateName`] when the name is taken; the interface is
    ///   left unchanged and no revision is consumed.
    pub fn add_attribute(&self, def: AttributeDef) -> Result<u64, DevError> {
        self.mutate(|r| r.add_attribute(def, None))
    }

    /// Remove a dynamic attribute and return the new interface revision.
    ///
    /// # Errors
    ///
    /// [`DevError::NotFound`] when no dynamic attribute has this name.
    pub fn remove_attribute(&self, name: &str) -> Result<u64, DevError> {
        self.mutate(|r| r.remove_attribute(name, None))
    }

    /// Add a dynamic command and return the new interface revision.
    ///
    /// # Errors
    ///
    /// Same as [`Device::add_attribute`], for commands.
    pub fn add_command(&self, def: CommandDef) -> Result<u64, DevError> {
        self.mutate(|r| r.add_command(def, None))
    }

    /// Remove a dynamic command. Static commands report
    /// [`DevError::NotFound`].
    pub fn remove_command(&self, name: &str) -> Result<u64, DevError> {
        self.mutate(|r| r.remove_command(name, None))
    }

    /// Add a dynamic pipe and return the new interface revision.
    pub fn add_pipe(&self, def: PipeDef) -> Result<u64, DevError> {
        self.mutate(|r| r.add_pipe(def, None))
    }

    /// Remove a dynamic pipe and return the new interface revision.
    pub fn remove_pipe(&self, name: &str) -> Result<u64, DevError> {
        self.mutate(|r| r.remove_pipe(name, None))
    }

    /// Run `f` as a reconfiguration: the busy gate is held for its whole
    /// duration, blocking gated requests from everybody else, while mutations
    /// made through the [`Reconfiguration`] handle pass. Each mutation still
    /// produces its own revision.
    ///
    /// # Errors
    ///
    /// [`DevError::NotAllowed`] when the device is already busy, otherwise
    /// whatever `f` returns.
    pub fn reconfigure<T, F>(&self, f: F) -> Result<T, DevError>
    where
        F: FnOnce(&Reconfiguration<'_>) -> Result<T, DevError>,
    {
        let lease = self.busy_state().try_acquire().ok_or_else(|| {
            not_allowed(OperationKind::Configure, &self.name, "device is busy")
        })?;
        info!(device = %self.name, "reconfiguration started");
        let tx = Reconfiguration {
            device: self,
            lease,
        };
        let result = f(&tx);
        drop(tx);
        match &result {
            Ok(_) => info!(
                device = %self.name,
                revision = self.revision(),
                "reconfiguration finished"
            ),
            Err(e) => warn!(device = %self.name, error = %e, "reconfiguration failed"),
        }
        result
    }

    /// Remove every dynamic entry as a single revision and put the device
    /// back in the `ON` state.
    pub fn init(&self) -> Result<(), DevError> {
        {
            let mut guard = self.core.write();
            let core = &mut *guard;
            if core.registry.remove_all_dynamic(None)? > 0 {
                self.commit(core);
            }
        }
        *self.status.write() = None;
        self.set_state(DevState::On);
        info!(device = %self.name, "device initialised");
        Ok(())
    }

    fn mutate<F>(&self, change: F) -> Result<u64, DevError>
    where
        F: FnOnce(&mut Registry) -> Result<(), DevError>,
    {
        let mut guard = self.core.write();
        let core = &mut *guard;
        change(&mut core.registry)?;
        Ok(self.commit(core))
    }

    fn commit(&self, core: &mut DeviceCore) -> u64 {
        let snapshot = core.notifier.snapshot(&core.registry);
        core.latest = Arc::clone(&snapshot);
        core.notifier.notify(&self.dispatcher, &snapshot);
        info!(device = %self.name, revision = snapshot.revision, "interface changed");
        snapshot.revision
    }

    // ────────────────────────────────────────────────────────────────────────
    // Request paths
    // ────────────────────────────────────────────────────────────────────────

    /// Read an attribute value.
    ///
    /// # Errors
    ///
    /// - [`DevError::NotAllowed`] while busy or for write-only attributes.
    /// - [`DevError::NotFound`] for unknown attributes.
    /// - [`DevError::WrongType`] when the handler returns a value of the wrong
    ///   type.
    pub fn read_attribute(&self, name: &str) -> Result<DevArg, DevError> {
        self.guard.check(OperationKind::Read, name, None)?;
        let (descriptor, read) = {
            let core = self.core.read();
            let entry = core
                .registry
                .attribute(name)
                .ok_or_else(|| DevError::not_found(EntryKind::Attribute, name))?;
            if !entry.def.access.readable() {
                return Err(not_allowed(OperationKind::Read, name, "attribute is write-only"));
            }
            (entry.descriptor(), Arc::clone(&entry.def.read))
        };
        let value = read(self)?;
        expect_type(&descriptor.name, descriptor.data_type, &value)?;
        debug!(device = %self.name, attribute = %descriptor.name, %value, "attribute read");
        Ok(value)
    }

    /// Write an attribute through its handler.
    ///
    /// # Errors
    ///
    /// - [`DevError::NotAllowed`] for read-only attributes or while busy.
    /// - [`DevError::WrongType`] when `value` does not match the attribute.
    pub fn write_attribute(&self, name: &str, value: DevArg) -> Result<(), DevError> {
        self.guard.check(OperationKind::Write, name, None)?;
        let (descriptor, write) = {
            let core = self.core.read();
            let entry = core
                .registry
                .attribute(name)
                .ok_or_else(|| DevError::not_found(EntryKind::Attribute, name))?;
            if !entry.def.access.writable() {
                return Err(not_allowed(OperationKind::Write, name, "attribute is read-only"));
            }
            (entry.descriptor(), Arc::clone(&entry.def.write))
        };
        expect_type(&descriptor.name, descriptor.data_type, &value)?;
        debug!(device = %self.name, attribute = %descriptor.name, %value, "attribute write");
        write(self, value)
    }

    /// Execute a command. `arg` must match the command's input type
    /// (`DevArg::Void` for void commands).
    pub fn execute(&self, name: &str, arg: DevArg) -> Result<DevArg, DevError> {
        self.guard.check(OperationKind::Execute, name, None)?;
        let (descriptor, execute) = {
            let core = self.core.read();
            let entry = core
                .registry
                .command(name)
                .ok_or_else(|| DevError::not_found(EntryKind::Command, name))?;
            (entry.descriptor(), Arc::clone(&entry.def.execute))
        };
        expect_type(&descriptor.name, descriptor.in_type, &arg)?;
        debug!(device = %self.name, command = %descriptor.name, "command execute");
        let out = execute(self, arg)?;
        expect_type(&descriptor.name, descriptor.out_type, &out)?;
        Ok(out)
    }

    /// Read the current blob of a pipe.
    pub fn read_pipe(&self, name: &str) -> Result<PipeBlob, DevError> {
        self.guard.check(OperationKind::Read, name, None)?;
        let read = {
            let core = self.core.read();
            let entry = core
                .registry
                .pipe(name)
                .ok_or_else(|| DevError::not_found(EntryKind::Pipe, name))?;
            Arc::clone(&entry.def.read)
        };
        read(self)
    }

    /// Write a blob to a pipe. Read-only pipes are rejected with
    /// [`DevError::NotAllowed`].
    pub fn write_pipe(&self, name: &str, blob: PipeBlob) -> Result<(), DevError> {
        self.guard.check(OperationKind::Write, name, None)?;
        let write = {
            let core = self.core.read();
            let entry = core
                .registry
                .pipe(name)
                .ok_or_else(|| DevError::not_found(EntryKind::Pipe, name))?;
            if !entry.def.write_type.writable() {
                return Err(not_allowed(OperationKind::Write, name, "pipe is read-only"));
            }
            Arc::clone(&entry.def.write)
        };
        write(self, blob)
    }

    // ────────────────────────────────────────────────────────────────────────
    // Subscriptions
    // ────────────────────────────────────────────────────────────────────────

    /// Subscribe to this device's events. The subscription sees every
    /// interface revision newer than [`Device::revision`] at the time of the
    /// call.
    pub fn subscribe(
        &self,
        subscriber_id: &str,
        categories: impl IntoIterator<Item = EventCategory>,
    ) -> Subscription {
        let _core = self.core.write();
        self.dispatcher.subscribe(subscriber_id, categories)
    }

    /// Drop a subscription. `false` if it was already gone.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let _core = self.core.write();
        self.dispatcher.unsubscribe(handle)
    }

    /// See [`EventDispatcher::ack`].
    pub fn ack(&self, handle: SubscriptionHandle, revision: u64) -> Result<(), DevError> {
        self.dispatcher.ack(handle, revision)
    }

    /// One heartbeat period. Returns the subscriptions evicted for silence.
    pub fn heartbeat(&self) -> Vec<SubscriptionHandle> {
        self.dispatcher.heartbeat()
    }

    // ────────────────────────────────────────────────────────────────────────
    // Pushed events
    // ────────────────────────────────────────────────────────────────────────

    /// Allow or forbid [`Device::push_change_event`] for `attribute`.
    pub fn set_change_event(&self, attribute: &str, enabled: bool) -> Result<(), DevError> {
        self.set_event_flag(attribute, PushKind::Change, enabled)
    }

    /// Allow or forbid [`Device::push_archive_event`] for `attribute`.
    pub fn set_archive_event(&self, attribute: &str, enabled: bool) -> Result<(), DevError> {
        self.set_event_flag(attribute, PushKind::Archive, enabled)
    }

    /// Allow or forbid [`Device::push_data_ready_event`] for `attribute`.
    pub fn set_data_ready_event(&self, attribute: &str, enabled: bool) -> Result<(), DevError> {
        self.set_event_flag(attribute, PushKind::DataReady, enabled)
    }

    /// Publish a change event for `attribute`. Returns the number of
    /// subscribers it was queued for.
    ///
    /// # Errors
    ///
    /// - [`DevError::NotFound`] for unknown attributes.
    /// - [`DevError::NotAllowed`] unless enabled with
    ///   [`Device::set_change_event`].
    /// - [`DevError::WrongType`] when `value` does not match the attribute.
    pub fn push_change_event(
        &self,
        attribute: &str,
        value: DevArg,
        quality: AttrQuality,
    ) -> Result<usize, DevError> {
        self.push_value(
            EventCategory::Change,
            attribute,
            value,
            quality,
            Some(PushKind::Change),
        )
    }

    /// Like [`Device::push_change_event`], gated by
    /// [`Device::set_archive_event`].
    pub fn push_archive_event(
        &self,
        attribute: &str,
        value: DevArg,
        quality: AttrQuality,
    ) -> Result<usize, DevError> {
        self.push_value(
            EventCategory::Archive,
            attribute,
            value,
            quality,
            Some(PushKind::Archive),
        )
    }

    /// User events need no prior enabling.
    pub fn push_user_event(
        &self,
        attribute: &str,
        value: DevArg,
        quality: AttrQuality,
    ) -> Result<usize, DevError> {
        self.push_value(EventCategory::User, attribute, value, quality, None)
    }

    /// Publish a data-ready notification carrying `counter` instead of a value.
    pub fn push_data_ready_event(&self, attribute: &str, counter: i32) -> Result<usize, DevError> {
        let name = self.pushable(attribute, Some(PushKind::DataReady))?.0;
        Ok(self.dispatcher.publish(
            EventCategory::DataReady,
            EventPayload::DataReady {
                attribute: name,
                counter,
            },
        ))
    }

    /// Publish a pipe event. Pipe events need no prior enabling.
    pub fn push_pipe_event(&self, pipe: &str, blob: PipeBlob) -> Result<usize, DevError> {
        let name = {
            let core = self.core.read();
            let entry = core
                .registry
                .pipe(pipe)
                .ok_or_else(|| DevError::not_found(EntryKind::Pipe, pipe))?;
            entry.def.name.clone()
        };
        Ok(self
            .dispatcher
            .publish(EventCategory::Pipe, EventPayload::Pipe { pipe: name, blob }))
    }

    fn set_event_flag(
        &self,
        attribute: &str,
        kind: PushKind,
        enabled: bool,
    ) -> Result<(), DevError> {
        let mut core = self.core.write();
        let entry = core
            .registry
            .attribute_mut(attribute)
            .ok_or_else(|| DevError::not_found(EntryKind::Attribute, attribute))?;
        entry.events.set(kind, enabled);
        debug!(device = %self.name, attribute, flags = ?entry.events, "event flags updated");
        Ok(())
    }

    /// Registered spelling and type of `attribute`, provided its flags allow
    /// pushing `kind`.
    fn pushable(
        &self,
        attribute: &str,
        kind: Option<PushKind>,
    ) -> Result<(String, DataType), DevError> {
        let core = self.core.read();
        let entry = core
            .registry
            .attribute(attribute)
            .ok_or_else(|| DevError::not_found(EntryKind::Attribute, attribute))?;
        if let Some(kind) = kind.filter(|k| !entry.events.allows(*k)) {
            return Err(not_allowed(
                OperationKind::Write,
                attribute,
                &format!("{kind} events are not pushed manually for this attribute"),
            ));
        }
        Ok((entry.def.name.clone(), entry.def.data_type))
    }

    fn push_value(
        &self,
        category: EventCategory,
        attribute: &str,
        value: DevArg,
        quality: AttrQuality,
        kind: Option<PushKind>,
    ) -> Result<usize, DevError> {
        let (name, data_type) = self.pushable(attribute, kind)?;
        expect_type(&name, data_type, &value)?;
        Ok(self.dispatcher.publish(
            category,
            EventPayload::AttributeValue {
                attribute: name,
                value,
                quality,
            },
        ))
    }

    // ────────────────────────────────────────────────────────────────────────
    // State
    // ────────────────────────────────────────────────────────────────────────

    /// Current [`DevState`].
    pub fn state(&self) -> DevState {
        *self.state.read()
    }

    /// Set the state; transitions are logged.
    pub fn set_state(&self, state: DevState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            info!(device = %self.name, from = %previous, to = %state, "state changed");
        }
    }

    /// The status string; derived from the state unless set explicitly.
    pub fn status(&self) -> String {
        match self.status.read().as_ref() {
            Some(status) => status.clone(),
            None => format!("The device is in {} state.", self.state()),
        }
    }

    /// Override the derived status string.
    pub fn set_status(&self, status: impl Into<String>) {
        *self.status.write() = Some(status.into());
    }
}

/// Handle passed to a [`Device::reconfigure`] closure. Mutations made
/// through it hold the busy lease and so pass the busy gate.
pub struct Reconfiguration<'a> {
    device: &'a Device,
    lease: BusyLease,
}

impl Reconfiguration<'_> {
    /// The device under reconfiguration.
    pub fn device(&self) -> &Device {
        self.device
    }

    /// [`Device::add_attribute`] under the held lease.
    pub fn add_attribute(&self, def: AttributeDef) -> Result<u64, DevError> {
        self.device.mutate(|r| r.add_attribute(def, Some(&self.lease)))
    }

    /// [`Device::remove_attribute`] under the held lease.
    pub fn remove_attribute(&self, name: &str) -> Result<u64, DevError> {
        self.device.mutate(|r| r.remove_attribute(name, Some(&self.lease)))
    }

    /// [`Device::add_command`] under the held lease.
    pub fn add_command(&self, def: CommandDef) -> Result<u64, DevError> {
        self.device.mutate(|r| r.add_command(def, Some(&self.lease)))
    }

    /// [`Device::remove_command`] under the held lease.
    pub fn remove_command(&self, name: &str) -> Result<u64, DevError> {
        self.device.mutate(|r| r.remove_command(name, Some(&self.lease)))
    }

    /// [`Device::add_pipe`] under the held lease.
    pub fn add_pipe(&self, def: PipeDef) -> Result<u64, DevError> {
        self.device.mutate(|r| r.add_pipe(def, Some(&self.lease)))
    }

    /// [`Device::remove_pipe`] under the held lease.
    pub fn remove_pipe(&self, name: &str) -> Result<u64, DevError> {
        self.device.mutate(|r| r.remove_pipe(name, Some(&self.lease)))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// DeviceBuilder
// ────────────────────────────────────────────────────────────────────────────

/// Assembles a [`Device`] from its static interface and configuration.
pub struct DeviceBuilder {
    name: String,
    policy: GatePolicy,
    dispatcher: DispatcherConfig,
    initial_state: DevState,
    standard_interface: bool,
    attributes: Vec<AttributeDef>,
    commands: Vec<CommandDef>,
    pipes: Vec<PipeDef>,
}

impl DeviceBuilder {
    /// A builder with no interface, an open gate and state `Unknown`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            policy: GatePolicy::default(),
            dispatcher: DispatcherConfig::default(),
            initial_state: DevState::Unknown,
            standard_interface: false,
            attributes: Vec::new(),
            commands: Vec::new(),
            pipes: Vec::new(),
        }
    }

    /// Name the device will be built with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replace the gate policy.
    pub fn gate_policy(mut self, policy: GatePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Adjust the gate policy set so far.
    pub fn gate_policy_with<F>(mut self, f: F) -> Self
    where
        F: FnOnce(GatePolicy) -> GatePolicy,
    {
        self.policy = f(self.policy);
        self
    }

    /// Queue capacity and heartbeat tolerance for the dispatcher.
    pub fn dispatcher_config(mut self, config: DispatcherConfig) -> Self {
        self.dispatcher = config;
        self
    }

    /// State reported before anything calls [`Device::set_state`].
    pub fn initial_state(mut self, state: DevState) -> Self {
        self.initial_state = state;
        self
    }

    /// Install `Init`, `State` and `Status`.
    pub fn with_standard_interface(mut self) -> Self {
        self.standard_interface = true;
        self
    }

    /// Add a static attribute.
    pub fn attribute(mut self, def: AttributeDef) -> Self {
        self.attributes.push(def);
        self
    }

    /// Add a static command.
    pub fn command(mut self, def: CommandDef) -> Self {
        self.commands.push(def);
        self
    }

    /// Add a static pipe.
    pub fn pipe(mut self, def: PipeDef) -> Self {
        self.pipes.push(def);
        self
    }

    /// Append the static entries supplied by `source`.
    pub fn interface_from(mut self, source: &dyn InterfaceSource) -> Self {
        self.attributes
            .extend(source.attributes().into_iter().map(source::attribute_def));
        self.commands
            .extend(source.commands().into_iter().map(source::command_def));
        self.pipes.extend(source.pipes().into_iter().map(source::pipe_def));
        self
    }

    /// # Errors
    ///
    /// [`DevError::DuplicateName`] or [`DevError::InvalidArgument`] when the
    /// static interface is inconsistent.
    pub fn build(self) -> Result<Arc<Device>, DevError> {
        let guard = AccessGuard::new(BusyState::new(), self.policy);
        let mut registry = Registry::new(guard.clone());
        if self.standard_interface {
            for def in standard::attributes() {
                registry.add_static_attribute(def)?;
            }
            for def in standard::commands() {
                registry.add_static_command(def)?;
            }
        }
        for def in self.attributes {
            registry.add_static_attribute(def)?;
        }
        for def in self.commands {
            registry.add_static_command(def)?;
        }
        for def in self.pipes {
            registry.add_static_pipe(def)?;
        }

        let notifier = InterfaceNotifier::new(self.name.clone());
        let latest = notifier.current(&registry);
        info!(
            device = %self.name,
            attributes = latest.attributes.len(),
            commands = latest.commands.len(),
            pipes = latest.pipes.len(),
            "device built"
        );
        Ok(Arc::new(Device {
            dispatcher: EventDispatcher::new(&self.name, self.dispatcher),
            name: self.name,
            core: RwLock::new(DeviceCore {
                registry,
                notifier,
                latest,
            }),
            guard,
            state: RwLock::new(self.initial_state),
            status: RwLock::new(None),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dynadev_types::{AttrAccess, PipeWriteType};

    fn double_attr(name: &str) -> AttributeDef {
        AttributeDef::new(name, DataType::Double, AttrAccess::Read)
    }

    fn device_with_busy() -> Arc<Device> {
        DeviceBuilder::new("test/device/1")
            .attribute(AttributeDef::new("busy", DataType::Boolean, AttrAccess::Read))
            .build()
            .unwrap()
    }

    fn snapshots(sub: &mut Subscription) -> Vec<Arc<InterfaceSnapshot>> {
        sub.events
            .drain()
            .into_iter()
            .filter_map(|e| match &e.payload {
                EventPayload::InterfaceChange(s) => Some(Arc::clone(s)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn add_remove_scenario() {
        let device = device_with_busy();
        let mut sub = device.subscribe("client", [EventCategory::InterfaceChange]);
        assert_eq!(device.revision(), 0);

        assert_eq!(device.add_attribute(double_attr("ioattr")).unwrap(), 1);
        let received = snapshots(&mut sub);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].revision, 1);
        assert_eq!(received[0].attribute_names(), vec!["busy", "ioattr"]);

        assert_eq!(device.remove_attribute("ioattr").unwrap(), 2);
        let received = snapshots(&mut sub);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].revision, 2);
        assert_eq!(received[0].attribute_names(), vec!["busy"]);

        assert!(matches!(
            device.remove_attribute("ioattr"),
            Err(DevError::NotFound { kind: EntryKind::Attribute, .. })
        ));
        assert_eq!(device.revision(), 2);
        assert!(snapshots(&mut sub).is_empty());
    }

    #[tokio::test]
    async fn delivery_worker_forwards_revisions_in_order() {
        use dynadev_middleware::{ChannelTransport, DeliveryWorker};
        use std::time::Duration;

        let device = device_with_busy();
        let sub = device.subscribe("client", [EventCategory::InterfaceChange]);
        let (transport, mut rx) = ChannelTransport::new();
        let worker = DeliveryWorker::spawn(device.dispatcher().clone(), sub, Arc::new(transport));

        device.add_attribute(double_attr("ioattr")).unwrap();
        device.remove_attribute("ioattr").unwrap();

        let mut seen = Vec::new();
        while seen.len() < 2 {
            let (subscriber, event) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("delivered in time")
                .expect("channel open");
            assert_eq!(subscriber, "client");
            if let EventPayload::InterfaceChange(snapshot) = &event.payload {
                seen.push(snapshot.revision);
            }
        }
        assert_eq!(seen, vec![1, 2]);
        worker.abort();
    }

    #[test]
    fn failed_add_consumes_no_revision() {
        let device = device_with_busy();
        device.add_attribute(double_attr("x")).unwrap();
        let before = device.current_snapshot();
        assert!(matches!(
            device.add_attribute(double_attr("x")),
            Err(DevError::DuplicateName { .. })
        ));
        assert_eq!(device.revision(), 1);
        assert!(Arc::ptr_eq(&before, &device.current_snapshot()));
    }

    #[test]
    fn concurrent_mutations_get_distinct_gapless_revisions() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 25;
        let device = device_with_busy();
        let mut sub = device.subscribe("client", [EventCategory::InterfaceChange]);

        let mut revisions: Vec<u64> = std::thread::scope(|s| {
            let workers: Vec<_> = (0..THREADS)
                .map(|t| {
                    let device = &device;
                    s.spawn(move || {
                        (0..PER_THREAD)
                            .map(|i| {
                                device
                                    .add_attribute(double_attr(&format!("a{t}_{i}")))
                                    .unwrap()
                            })
                            .collect::<Vec<u64>>()
                    })
                })
                .collect();
            // Snapshot reads never see a half-applied mutation.
            for _ in 0..100 {
                let snap = device.current_snapshot();
                assert_eq!(snap.attributes.len() as u64, snap.revision + 1);
            }
            workers.into_iter().flat_map(|w| w.join().unwrap()).collect()
        });
        revisions.sort_unstable();
        let expected: Vec<u64> = (1..=(THREADS * PER_THREAD) as u64).collect();
        assert_eq!(revisions, expected);

        let seen: Vec<u64> = snapshots(&mut sub).iter().map(|s| s.revision).collect();
        assert_eq!(seen, expected);
        assert_eq!(device.current_snapshot().attributes.len(), THREADS * PER_THREAD + 1);
    }

    #[test]
    fn subscriber_receives_each_mutation_in_order() {
        let device = device_with_busy();
        device.add_attribute(double_attr("early")).unwrap();
        let mut sub = device.subscribe("late", [EventCategory::InterfaceChange]);
        for i in 0..5 {
            device.add_command(CommandDef::void(format!("cmd{i}"), |_| Ok(()))).unwrap();
        }
        let seen: Vec<u64> = snapshots(&mut sub).iter().map(|s| s.revision).collect();
        assert_eq!(seen, vec![2, 3, 4, 5, 6]);
    }

    #[test]
    fn busy_blocks_requests_but_not_the_reconfiguration() {
        let device = DeviceBuilder::new("test/device/2")
            .gate_policy(GatePolicy::default().exempt("busy"))
            .attribute(AttributeDef::new("busy", DataType::Boolean, AttrAccess::Read))
            .build()
            .unwrap();

        let revision = device
            .reconfigure(|tx| {
                let dev = tx.device();
                assert!(dev.busy_state().is_busy());
                assert!(matches!(
                    dev.add_attribute(double_attr("intruder")),
                    Err(DevError::NotAllowed { .. })
                ));
                assert!(dev.read_attribute("busy").is_ok());
                tx.add_attribute(double_attr("ioattr"))?;
                tx.add_command(CommandDef::void("iocmd", |_| Ok(())).device_level())
            })
            .unwrap();

        assert_eq!(revision, 2);
        assert!(!device.busy_state().is_busy());
        assert!(device.read_attribute("ioattr").is_ok());
    }

    #[test]
    fn nested_reconfiguration_is_refused() {
        let device = device_with_busy();
        let err = device
            .reconfigure(|tx| tx.device().reconfigure(|_| Ok(())))
            .unwrap_err();
        assert!(matches!(err, DevError::NotAllowed { operation: OperationKind::Configure, .. }));
        assert!(!device.busy_state().is_busy());
    }

    #[test]
    fn requests_are_type_checked() {
        let device = DeviceBuilder::new("test/device/3")
            .attribute(AttributeDef::new("setpoint", DataType::Double, AttrAccess::ReadWrite))
            .attribute(AttributeDef::new("secret", DataType::Long, AttrAccess::Write))
            .command(CommandDef::new("Double", DataType::Long, DataType::Long, |_, arg| {
                match arg {
                    DevArg::Long(v) => Ok(DevArg::Long(v * 2)),
                    other => Ok(other),
                }
            }))
            .build()
            .unwrap();

        device.write_attribute("SetPoint", DevArg::Double(4.5)).unwrap();
        assert_eq!(device.read_attribute("setpoint").unwrap(), DevArg::Double(4.5));
        assert!(matches!(
            device.write_attribute("setpoint", DevArg::Long(1)),
            Err(DevError::WrongType { expected: DataType::Double, actual: DataType::Long, .. })
        ));
        assert!(matches!(
            device.read_attribute("secret"),
            Err(DevError::NotAllowed { operation: OperationKind::Read, .. })
        ));
        assert_eq!(device.execute("double", DevArg::Long(21)).unwrap(), DevArg::Long(42));
        assert!(matches!(
            device.execute("double", DevArg::Void),
            Err(DevError::WrongType { .. })
        ));
        assert!(matches!(
            device.execute("missing", DevArg::Void),
            Err(DevError::NotFound { kind: EntryKind::Command, .. })
        ));
    }

    #[test]
    fn handler_may_reconfigure_its_own_device() {
        let device = DeviceBuilder::new("test/device/4")
            .command(CommandDef::void("Grow", |dev| {
                dev.reconfigure(|tx| tx.add_attribute(double_attr("grown")).map(|_| ()))
            }))
            .build()
            .unwrap();
        device.execute("Grow", DevArg::Void).unwrap();
        assert_eq!(device.current_snapshot().attribute_names(), vec!["grown"]);
    }

    #[test]
    fn push_events_respect_flags() {
        let device = device_with_busy();
        let mut sub = device.subscribe(
            "client",
            [EventCategory::Change, EventCategory::DataReady, EventCategory::User],
        );

        assert!(matches!(
            device.push_change_event("busy", DevArg::Boolean(true), AttrQuality::Valid),
            Err(DevError::NotAllowed { .. })
        ));
        device.set_change_event("busy", true).unwrap();
        assert_eq!(
            device
                .push_change_event("BUSY", DevArg::Boolean(true), AttrQuality::Valid)
                .unwrap(),
            1
        );
        assert!(matches!(
            device.push_change_event("busy", DevArg::Double(1.0), AttrQuality::Valid),
            Err(DevError::WrongType { .. })
        ));
        assert!(device.push_data_ready_event("busy", 1).is_err());
        device.set_data_ready_event("busy", true).unwrap();
        device.push_data_ready_event("busy", 7).unwrap();
        device
            .push_user_event("busy", DevArg::Boolean(false), AttrQuality::Alarm)
            .unwrap();
        assert!(matches!(
            device.set_archive_event("ghost", true),
            Err(DevError::NotFound { .. })
        ));

        let events = sub.events.drain();
        assert_eq!(events.len(), 3);
        match &events[0].payload {
            EventPayload::AttributeValue { attribute, .. } => assert_eq!(attribute, "busy"),
            other => panic!("unexpected payload {other:?}"),
        }
        assert!(matches!(events[1].payload, EventPayload::DataReady { counter: 7, .. }));
        assert_eq!(events[2].category, EventCategory::User);
    }

    #[test]
    fn pipes_read_write_and_push() {
        let device = DeviceBuilder::new("test/device/5")
            .pipe(PipeDef::new("rw", PipeWriteType::ReadWrite))
            .pipe(PipeDef::new("ro", PipeWriteType::Read))
            .build()
            .unwrap();
        let mut sub = device.subscribe("client", [EventCategory::Pipe]);

        let blob = PipeBlob::new("data").with("level", DevArg::Double(0.5));
        device.write_pipe("rw", blob.clone()).unwrap();
        assert_eq!(device.read_pipe("RW").unwrap(), blob);
        assert!(matches!(
            device.write_pipe("ro", blob.clone()),
            Err(DevError::NotAllowed { .. })
        ));
        assert_eq!(device.push_pipe_event("rw", blob.clone()).unwrap(), 1);
        assert!(device.push_pipe_event("ghost", blob).is_err());
        assert_eq!(sub.events.drain().len(), 1);

        device.add_pipe(PipeDef::new("extra", PipeWriteType::Read)).unwrap();
        assert_eq!(device.current_snapshot().pipe_names(), vec!["rw", "ro", "extra"]);
        device.remove_pipe("extra").unwrap();
        assert_eq!(device.revision(), 2);
    }

    #[test]
    fn standard_interface_and_init() {
        let device = DeviceBuilder::new("test/device/6")
            .with_standard_interface()
            .build()
            .unwrap();
        assert_eq!(device.read_attribute("State").unwrap(), DevArg::State(DevState::Unknown));

        device.add_attribute(double_attr("a")).unwrap();
        device.add_command(CommandDef::void("c", |_| Ok(()))).unwrap();
        device.set_state(DevState::Fault);
        device.set_status("broken");

        device.execute("Init", DevArg::Void).unwrap();
        assert_eq!(device.revision(), 3);
        let snap = device.current_snapshot();
        assert_eq!(snap.attribute_names(), vec!["State", "Status"]);
        assert_eq!(snap.command_names(), vec!["Init", "State", "Status"]);
        assert_eq!(device.execute("state", DevArg::Void).unwrap(), DevArg::State(DevState::On));
        assert_eq!(
            device.execute("Status", DevArg::Void).unwrap(),
            DevArg::String("The device is in ON state.".into())
        );

        // Nothing dynamic left: no further revision.
        device.init().unwrap();
        assert_eq!(device.revision(), 3);
    }

    #[test]
    fn interface_can_be_seeded_from_a_snapshot() {
        let source = device_with_busy();
        source.add_command(CommandDef::void("iocmd", |_| Ok(())).device_level()).unwrap();
        let snapshot = source.current_snapshot();

        let copy = DeviceBuilder::new("test/device/7")
            .interface_from(&*snapshot)
            .build()
            .unwrap();
        let view = copy.current_snapshot();
        assert_eq!(view.attribute_names(), vec!["busy"]);
        assert_eq!(view.command_names(), vec!["iocmd"]);
        assert!(view.commands.iter().all(|c| !c.is_dynamic && c.takes_device_arg));
        assert_eq!(copy.revision(), 0);
    }

    #[test]
    fn duplicate_static_entries_fail_the_build() {
        let result = DeviceBuilder::new("test/device/8")
            .with_standard_interface()
            .attribute(double_attr("state"))
            .build();
        assert!(matches!(result, Err(DevError::DuplicateName { .. })));
    }
}
