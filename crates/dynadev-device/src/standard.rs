//! The `Init`, `State` and `Status` entries every control-system device
//! exposes.

use dynadev_types::{AttrAccess, DataType, DevArg};

use crate::handlers::{AttributeDef, CommandDef};

pub(crate) fn attributes() -> Vec<AttributeDef> {
    vec![
        AttributeDef::new("State", DataType::State, AttrAccess::Read)
            .read_with(|dev| Ok(DevArg::State(dev.state()))),
        AttributeDef::new("Status", DataType::String, AttrAccess::Read)
            .read_with(|dev| Ok(DevArg::String(dev.status()))),
    ]
}

pub(crate) fn commands() -> Vec<CommandDef> {
    vec![
        CommandDef::void("Init", |dev| dev.init()),
        CommandDef::new("State", DataType::Void, DataType::State, |dev, _| {
            Ok(DevArg::State(dev.state()))
        }),
        CommandDef::new("Status", DataType::Void, DataType::String, |dev, _| {
            Ok(DevArg::String(dev.status()))
        }),
    ]
}
