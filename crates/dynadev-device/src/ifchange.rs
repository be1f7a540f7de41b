//! `IfchangeServer` – example device that grows and shrinks its interface.
//!
//! | Entry | Kind | Behaviour |
//! |---|---|---|
//! | `busy` | attribute, `DevBoolean`, read | current busy gate; readable while busy |
//! | `Add_dynamic` | command | adds `ioattr` and `iocmd` under the busy lease |
//! | `Delete_Dynamic` | command | removes `ioattr` and `iocmd` under the busy lease |
//! | `Unlock` | command | clears the busy gate; executable while busy |
//!
//! Each successful add or remove publishes one interface-change event.
//! `Add_dynamic` and `Delete_Dynamic` change both entries or neither.

use dynadev_kernel::GatePolicy;
use dynadev_types::{AttrAccess, DataType, DevArg, DevError, DevState, EntryKind};
use tracing::debug;

use crate::device::{Device, DeviceBuilder};
use crate::handlers::{AttributeDef, CommandDef};

pub const CLASS_NAME: &str = "IfchangeServer";
pub const UNLOCK_COMMAND: &str = "Unlock";
pub const DYNAMIC_ATTRIBUTE: &str = "ioattr";
pub const DYNAMIC_COMMAND: &str = "iocmd";

pub fn builder(name: impl Into<String>) -> DeviceBuilder {
    DeviceBuilder::new(name)
        .with_standard_interface()
        .initial_state(DevState::On)
        .gate_policy(
            GatePolicy::default()
                .exempt("busy")
                .with_unlock_command(UNLOCK_COMMAND),
        )
        .attribute(
            AttributeDef::new("busy", DataType::Boolean, AttrAccess::Read)
                .read_with(|dev| Ok(DevArg::Boolean(dev.busy_state().is_busy()))),
        )
        .command(CommandDef::void("Add_dynamic", add_dynamic))
        .command(CommandDef::void("Delete_Dynamic", delete_dynamic))
        .command(CommandDef::void(UNLOCK_COMMAND, |dev| {
            dev.busy_state().set(false);
            Ok(())
        }))
}

// Both entries are checked before either is touched, so a half-present pair
// fails with no revision consumed.
fn add_dynamic(dev: &Device) -> Result<(), DevError> {
    dev.reconfigure(|tx| {
        let snap = tx.device().current_snapshot();
        if snap.attributes.iter().any(|a| a.name.eq_ignore_ascii_case(DYNAMIC_ATTRIBUTE)) {
            return Err(duplicate(EntryKind::Attribute, DYNAMIC_ATTRIBUTE));
        }
        if snap.commands.iter().any(|c| c.name.eq_ignore_ascii_case(DYNAMIC_COMMAND)) {
            return Err(duplicate(EntryKind::Command, DYNAMIC_COMMAND));
        }
        tx.add_attribute(AttributeDef::new(
            DYNAMIC_ATTRIBUTE,
            DataType::Double,
            AttrAccess::Read,
        ))?;
        tx.add_command(CommandDef::void(DYNAMIC_COMMAND, iocmd).device_level())?;
        Ok(())
    })
}

fn delete_dynamic(dev: &Device) -> Result<(), DevError> {
    dev.reconfigure(|tx| {
        let snap = tx.device().current_snapshot();
        let dynamic = |name: &str, is_dynamic: bool, wanted: &str| {
            is_dynamic && name.eq_ignore_ascii_case(wanted)
        };
        if !snap.attributes.iter().any(|a| dynamic(a.name.as_str(), a.is_dynamic, DYNAMIC_ATTRIBUTE)) {
            return Err(missing(EntryKind::Attribute, DYNAMIC_ATTRIBUTE));
        }
        if !snap.commands.iter().any(|c| dynamic(c.name.as_str(), c.is_dynamic, DYNAMIC_COMMAND)) {
            return Err(missing(EntryKind::Command, DYNAMIC_COMMAND));
        }
        tx.remove_attribute(DYNAMIC_ATTRIBUTE)?;
        tx.remove_command(DYNAMIC_COMMAND)?;
        Ok(())
    })
}

fn duplicate(kind: EntryKind, name: &str) -> DevError {
    DevError::DuplicateName { kind, name: name.to_string() }
}

fn missing(kind: EntryKind, name: &str) -> DevError {
    DevError::NotFound { kind, name: name.to_string() }
}

fn iocmd(dev: &Device) -> Result<(), DevError> {
    debug!(device = dev.name(), "iocmd executed");
    Ok(())
}
