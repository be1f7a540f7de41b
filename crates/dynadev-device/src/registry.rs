//! [`Registry`] – the live interface of one device.
//!
//! The registry stores every attribute, command and pipe the device exposes,
//! each with the handlers that serve it. Names are unique per kind and compared
//! case-insensitively; entries keep the spelling they were registered with and
//! are listed in registration order.
//!
//! Static entries are installed once by the
//! [`DeviceBuilder`][crate::device::DeviceBuilder]. Dynamic entries are added
//! and removed at runtime; each such mutation is first admitted by the
//! [`AccessGuard`] as an [`OperationKind::Configure`] request.
//!
//! The registry itself is not synchronised. [`Device`][crate::device::Device]
//! owns it behind a lock and turns every successful mutation into a new
//! interface revision.

use dynadev_kernel::{AccessGuard, BusyLease};
use dynadev_types::{
    AttributeDescriptor, CommandDescriptor, DevError, EntryKind, OperationKind, PipeDescriptor,
};
use indexmap::IndexMap;
use tracing::info;

use crate::handlers::{AttributeDef, CommandDef, PipeDef};

/// Events a device pushes by hand rather than by detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushKind {
    Change,
    Archive,
    DataReady,
}

impl std::fmt::Display for PushKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PushKind::Change => f.write_str("change"),
            PushKind::Archive => f.write_str("archive"),
            PushKind::DataReady => f.write_str("data ready"),
        }
    }
}

/// Which manual push events an attribute accepts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventFlags {
    pub change: bool,
    pub archive: bool,
    pub data_ready: bool,
}

impl EventFlags {
    pub fn allows(&self, kind: PushKind) -> bool {
        match kind {
            PushKind::Change => self.change,
            PushKind::Archive => self.archive,
            PushKind::DataReady => self.data_ready,
        }
    }

    pub fn set(&mut self, kind: PushKind, enabled: bool) {
        match kind {
            PushKind::Change => self.change = enabled,
            PushKind::Archive => self.archive = enabled,
            PushKind::DataReady => self.data_ready = enabled,
        }
    }
}

#[derive(Clone)]
pub struct AttributeEntry {
    pub def: AttributeDef,
    pub is_dynamic: bool,
    pub events: EventFlags,
}

impl AttributeEntry {
    pub fn descriptor(&self) -> AttributeDescriptor {
        AttributeDescriptor {
            name: self.def.name.clone(),
            data_type: self.def.data_type,
            access: self.def.access,
            is_dynamic: self.is_dynamic,
        }
    }
}

#[derive(Clone)]
pub struct CommandEntry {
    pub def: CommandDef,
    pub is_dynamic: bool,
}

impl CommandEntry {
    pub fn descriptor(&self) -> CommandDescriptor {
        CommandDescriptor {
            name: self.def.name.clone(),
            in_type: self.def.in_type,
            out_type: self.def.out_type,
            takes_device_arg: self.def.takes_device_arg,
            is_dynamic: self.is_dynamic,
        }
    }
}

#[derive(Clone)]
pub struct PipeEntry {
    pub def: PipeDef,
    pub is_dynamic: bool,
}

impl PipeEntry {
    pub fn descriptor(&self) -> PipeDescriptor {
        PipeDescriptor {
            name: self.def.name.clone(),
            write_type: self.def.write_type,
            is_dynamic: self.is_dynamic,
        }
    }
}

/// Lookup key for `name`, or `InvalidArgument` for names that can never be
/// addressed.
fn key_for(name: &str) -> Result<String, DevError> {
    if name.trim().is_empty() {
        return Err(DevError::InvalidArgument("entry name must not be empty".to_string()));
    }
    if name.contains('/') {
        return Err(DevError::InvalidArgument(format!(
            "entry name '{name}' must not contain '/'"
        )));
    }
    Ok(name.to_ascii_lowercase())
}

pub struct Registry {
    guard: AccessGuard,
    attributes: IndexMap<String, AttributeEntry>,
    commands: IndexMap<String, CommandEntry>,
    pipes: IndexMap<String, PipeEntry>,
}

impl Registry {
    pub fn new(guard: AccessGuard) -> Self {
        Self {
            guard,
            attributes: IndexMap::new(),
            commands: IndexMap::new(),
            pipes: IndexMap::new(),
        }
    }

    pub fn guard(&self) -> &AccessGuard {
        &self.guard
    }

    // ── Static entries ──────────────────────────────────────────────────────

    /// Register a static attribute; it can never be removed.
    pub fn add_static_attribute(&mut self, def: AttributeDef) -> Result<(), DevError> {
        self.insert_attribute(def, false)
    }

    pub fn add_static_command(&mut self, def: CommandDef) -> Result<(), DevError> {
        self.insert_command(def, false)
    }

    pub fn add_static_pipe(&mut self, def: PipeDef) -> Result<(), DevError> {
        self.insert_pipe(def, false)
    }

    // ── Dynamic entries ─────────────────────────────────────────────────────

    /// Add a dynamic attribute.
    ///
    /// # Errors
    ///
    /// - [`DevError::NotAllowed`] when the guard denies the reconfiguration.
    /// - [`DevError::DuplicateName`] when an attribute with this name exists.
    /// - [`DevError::InvalidArgument`] for empty names or names containing `/`.
    pub fn add_attribute(
        &mut self,
        def: AttributeDef,
        lease: Option<&BusyLease>,
    ) -> Result<(), DevError> {
        self.guard.check(OperationKind::Configure, &def.name, lease)?;
        self.insert_attribute(def, true)
    }

    /// Remove a dynamic attribute. Static attributes are reported as
    /// [`DevError::NotFound`], exactly like absent ones.
    pub fn remove_attribute(
        &mut self,
        name: &str,
        lease: Option<&BusyLease>,
    ) -> Result<(), DevError> {
        self.guard.check(OperationKind::Configure, name, lease)?;
        let key = key_for(name)?;
        match self.attributes.get(&key) {
            Some(entry) if entry.is_dynamic => {
                self.attributes.shift_remove(&key);
                info!(attribute = name, "dynamic attribute removed");
                Ok(())
            }
            _ => Err(DevError::not_found(EntryKind::Attribute, name)),
        }
    }

    /// Add a dynamic command.
    ///
    /// # Errors
    ///
    /// As for [`Registry::add_attribute`], with [`EntryKind::Command`].
    pub fn add_command(
        &mut self,
        def: CommandDef,
        lease: Option<&BusyLease>,
    ) -> Result<(), DevError> {
        self.guard.check(OperationKind::Configure, &def.name, lease)?;
        self.insert_command(def, true)
    }

    /// Remove a dynamic command; static ones report [`DevError::NotFound`].
    pub fn remove_command(
        &mut self,
        name: &str,
        lease: Option<&BusyLease>,
    ) -> Result<(), DevError> {
        self.guard.check(OperationKind::Configure, name, lease)?;
        let key = key_for(name)?;
        match self.commands.get(&key) {
            Some(entry) if entry.is_dynamic => {
                self.commands.shift_remove(&key);
                info!(command = name, "dynamic command removed");
                Ok(())
            }
            _ => Err(DevError::not_found(EntryKind::Command, name)),
        }
    }

    /// Add a dynamic pipe. Names are checked as for attributes.
    pub fn add_pipe(&mut self, def: PipeDef, lease: Option<&BusyLease>) -> Result<(), DevError> {
        self.guard.check(OperationKind::Configure, &def.name, lease)?;
        self.insert_pipe(def, true)
    }

    /// Remove a dynamic pipe; static ones report [`DevError::NotFound`].
    pub fn remove_pipe(&mut self, name: &str, lease: Option<&BusyLease>) -> Result<(), DevError> {
        self.guard.check(OperationKind::Configure, name, lease)?;
        let key = key_for(name)?;
        match self.pipes.get(&key) {
            Some(entry) if entry.is_dynamic => {
                self.pipes.shift_remove(&key);
                info!(pipe = name, "dynamic pipe removed");
                Ok(())
            }
            _ => Err(DevError::not_found(EntryKind::Pipe, name)),
        }
    }

    /// Drop every dynamic entry of every kind. Returns how many were removed.
    pub fn remove_all_dynamic(&mut self, lease: Option<&BusyLease>) -> Result<usize, DevError> {
        self.guard.check(OperationKind::Configure, "*", lease)?;
        let before = self.len();
        self.attributes.retain(|_, e| !e.is_dynamic);
        self.commands.retain(|_, e| !e.is_dynamic);
        self.pipes.retain(|_, e| !e.is_dynamic);
        let removed = before - self.len();
        if removed > 0 {
            info!(removed, "dynamic interface cleared");
        }
        Ok(removed)
    }

    // ── Lookup ──────────────────────────────────────────────────────────────

    /// Case-insensitive lookup.
    pub fn attribute(&self, name: &str) -> Option<&AttributeEntry> {
        self.attributes.get(&name.to_ascii_lowercase())
    }

    pub fn attribute_mut(&mut self, name: &str) -> Option<&mut AttributeEntry> {
        self.attributes.get_mut(&name.to_ascii_lowercase())
    }

    pub fn command(&self, name: &str) -> Option<&CommandEntry> {
        self.commands.get(&name.to_ascii_lowercase())
    }

    pub fn pipe(&self, name: &str) -> Option<&PipeEntry> {
        self.pipes.get(&name.to_ascii_lowercase())
    }

    pub fn attribute_descriptors(&self) -> Vec<AttributeDescriptor> {
        self.attributes.values().map(AttributeEntry::descriptor).collect()
    }

    pub fn command_descriptors(&self) -> Vec<CommandDescriptor> {
        self.commands.values().map(CommandEntry::descriptor).collect()
    }

    pub fn pipe_descriptors(&self) -> Vec<PipeDescriptor> {
        self.pipes.values().map(PipeEntry::descriptor).collect()
    }

    /// Total number of entries of all kinds.
    pub fn len(&self) -> usize {
        self.attributes.len() + self.commands.len() + self.pipes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ── Internal ────────────────────────────────────────────────────────────

    fn insert_attribute(&mut self, def: AttributeDef, is_dynamic: bool) -> Result<(), DevError> {
        let key = key_for(&def.name)?;
        if self.attributes.contains_key(&key) {
            return Err(DevError::DuplicateName {
                kind: EntryKind::Attribute,
                name: def.name,
            });
        }
        info!(attribute = %def.name, data_type = %def.data_type, is_dynamic, "attribute added");
        self.attributes.insert(
            key,
            AttributeEntry {
                def,
                is_dynamic,
                events: EventFlags::default(),
            },
        );
        Ok(())
    }

    fn insert_command(&mut self, def: CommandDef, is_dynamic: bool) -> Result<(), DevError> {
        let key = key_for(&def.name)?;
        if self.commands.contains_key(&key) {
            return Err(DevError::DuplicateName {
                kind: EntryKind::Command,
                name: def.name,
            });
        }
        info!(command = %def.name, is_dynamic, "command added");
        self.commands.insert(key, CommandEntry { def, is_dynamic });
        Ok(())
    }

    fn insert_pipe(&mut self, def: PipeDef, is_dynamic: bool) -> Result<(), DevError> {
        let key = key_for(&def.name)?;
        if self.pipes.contains_key(&key) {
            return Err(DevError::DuplicateName {
                kind: EntryKind::Pipe,
                name: def.name,
            });
        }
        info!(pipe = %def.name, is_dynamic, "pipe added");
        self.pipes.insert(key, PipeEntry { def, is_dynamic });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dynadev_kernel::{BusyState, GatePolicy};
    use dynadev_types::{AttrAccess, DataType, PipeWriteType};

    fn registry() -> Registry {
        Registry::new(AccessGuard::new(BusyState::new(), GatePolicy::default()))
    }

    fn attr(name: &str) -> AttributeDef {
        AttributeDef::new(name, DataType::Double, AttrAccess::Read)
    }

    #[test]
    fn add_then_remove_dynamic_attribute() {
        let mut r = registry();
        r.add_static_attribute(AttributeDef::new("busy", DataType::Boolean, AttrAccess::Read))
            .unwrap();
        r.add_attribute(attr("ioattr"), None).unwrap();
        let names: Vec<String> = r.attribute_descriptors().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["busy", "ioattr"]);
        assert!(r.attribute("ioattr").unwrap().is_dynamic);

        r.remove_attribute("ioattr", None).unwrap();
        assert!(r.attribute("ioattr").is_none());
        assert_eq!(r.len(), 1);
    }

    #[test]
    fn dynamic_commands_and_pipes_follow_attribute_rules() {
        let mut r = registry();
        r.add_command(CommandDef::void("iocmd", |_| Ok(())), None).unwrap();
        r.add_pipe(PipeDef::new("TestPipe", PipeWriteType::ReadWrite), None).unwrap();
        assert!(r.command("IOCMD").unwrap().is_dynamic);
        assert!(r.pipe("testpipe").unwrap().is_dynamic);

        assert!(matches!(
            r.add_command(CommandDef::void("IoCmd", |_| Ok(())), None),
            Err(DevError::DuplicateName { kind: EntryKind::Command, .. })
        ));
        assert!(matches!(
            r.add_pipe(PipeDef::new("a/b", PipeWriteType::Read), None),
            Err(DevError::InvalidArgument(_))
        ));

        r.remove_command("iocmd", None).unwrap();
        r.remove_pipe("TestPipe", None).unwrap();
        assert!(r.is_empty());
        assert!(matches!(
            r.remove_command("iocmd", None),
            Err(DevError::NotFound { kind: EntryKind::Command, .. })
        ));
    }

    #[test]
    fn duplicate_attribute_leaves_registry_unchanged() {
        let mut r = registry();
        r.add_attribute(attr("x"), None).unwrap();
        let before = r.attribute_descriptors();
        let err = r
            .add_attribute(AttributeDef::new("X", DataType::Long, AttrAccess::Write), None)
            .unwrap_err();
        assert_eq!(
            err,
            DevError::DuplicateName {
                kind: EntryKind::Attribute,
                name: "X".into()
            }
        );
        assert_eq!(r.attribute_descriptors(), before);
    }

    #[test]
    fn dynamic_name_may_not_shadow_static_one() {
        let mut r = registry();
        r.add_static_attribute(attr("busy")).unwrap();
        assert!(matches!(
            r.add_attribute(attr("busy"), None),
            Err(DevError::DuplicateName { .. })
        ));
    }

    #[test]
    fn static_entries_cannot_be_removed() {
        let mut r = registry();
        r.add_static_attribute(attr("busy")).unwrap();
        r.add_static_command(CommandDef::void("Unlock", |_| Ok(()))).unwrap();
        assert_eq!(
            r.remove_attribute("busy", None),
            Err(DevError::not_found(EntryKind::Attribute, "busy"))
        );
        assert!(matches!(
            r.remove_command("unlock", None),
            Err(DevError::NotFound { .. })
        ));
        assert_eq!(r.len(), 2);
    }

    #[test]
    fn remove_absent_is_not_found() {
        let mut r = registry();
        assert!(matches!(
            r.remove_attribute("ghost", None),
            Err(DevError::NotFound { kind: EntryKind::Attribute, .. })
        ));
        assert!(matches!(
            r.remove_pipe("ghost", None),
            Err(DevError::NotFound { kind: EntryKind::Pipe, .. })
        ));
    }

    #[test]
    fn kinds_have_separate_namespaces() {
        let mut r = registry();
        r.add_static_attribute(attr("State")).unwrap();
        r.add_static_command(CommandDef::void("State", |_| Ok(()))).unwrap();
        r.add_pipe(PipeDef::new("State", PipeWriteType::Read), None).unwrap();
        assert_eq!(r.len(), 3);
    }

    #[test]
    fn lookups_ignore_case_and_keep_spelling() {
        let mut r = registry();
        r.add_command(CommandDef::void("IoCmd", |_| Ok(())).device_level(), None)
            .unwrap();
        let entry = r.command("iocmd").unwrap();
        let d = entry.descriptor();
        assert_eq!(d.name, "IoCmd");
        assert!(d.takes_device_arg);
        assert!(d.is_dynamic);
    }

    #[test]
    fn invalid_names_are_rejected() {
        let mut r = registry();
        assert!(matches!(
            r.add_attribute(attr(""), None),
            Err(DevError::InvalidArgument(_))
        ));
        assert!(matches!(
            r.add_attribute(attr("a/b"), None),
            Err(DevError::InvalidArgument(_))
        ));
        assert!(r.is_empty());
    }

    #[test]
    fn busy_gate_blocks_anonymous_reconfiguration() {
        let busy = BusyState::new();
        let mut r = Registry::new(AccessGuard::new(busy.clone(), GatePolicy::default()));
        let lease = busy.try_acquire().expect("gate is free");

        assert!(matches!(
            r.add_attribute(attr("ioattr"), None),
            Err(DevError::NotAllowed { operation: OperationKind::Configure, .. })
        ));
        r.add_attribute(attr("ioattr"), Some(&lease)).unwrap();
        drop(lease);
        r.remove_attribute("ioattr", None).unwrap();
    }

    #[test]
    fn remove_all_dynamic_keeps_static_entries() {
        let mut r = registry();
        r.add_static_attribute(attr("busy")).unwrap();
        r.add_attribute(attr("a"), None).unwrap();
        r.add_command(CommandDef::void("c", |_| Ok(())), None).unwrap();
        r.add_pipe(PipeDef::new("p", PipeWriteType::ReadWrite), None).unwrap();
        assert_eq!(r.remove_all_dynamic(None).unwrap(), 3);
        assert_eq!(r.len(), 1);
        assert_eq!(r.remove_all_dynamic(None).unwrap(), 0);
    }
}
