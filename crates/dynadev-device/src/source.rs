//! [`InterfaceSource`] – where the static interface of a device comes from.
//!
//! A source only supplies descriptors. Entries installed from a source get
//! default behaviour: attributes and pipes are memorized, commands echo
//! their argument (see [`CommandDef::echo`]).

use dynadev_types::{AttributeDescriptor, CommandDescriptor, InterfaceSnapshot, PipeDescriptor};

use crate::handlers::{AttributeDef, CommandDef, PipeDef};

pub trait InterfaceSource {
    fn attributes(&self) -> Vec<AttributeDescriptor>;
    fn commands(&self) -> Vec<CommandDescriptor>;
    fn pipes(&self) -> Vec<PipeDescriptor>;
}

/// A published snapshot can seed another device with the same interface.
impl InterfaceSource for InterfaceSnapshot {
    fn attributes(&self) -> Vec<AttributeDescriptor> {
        self.attributes.clone()
    }

    fn commands(&self) -> Vec<CommandDescriptor> {
        self.commands.clone()
    }

    fn pipes(&self) -> Vec<PipeDescriptor> {
        self.pipes.clone()
    }
}

pub(crate) fn attribute_def(d: AttributeDescriptor) -> AttributeDef {
    AttributeDef::new(d.name, d.data_type, d.access)
}

pub(crate) fn command_def(d: CommandDescriptor) -> CommandDef {
    let def = CommandDef::echo(d.name, d.in_type, d.out_type);
    if d.takes_device_arg {
        def.device_level()
    } else {
        def
    }
}

pub(crate) fn pipe_def(d: PipeDescriptor) -> PipeDef {
    PipeDef::new(d.name, d.write_type)
}
