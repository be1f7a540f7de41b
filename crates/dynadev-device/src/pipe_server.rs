//! `PipeServer` – example device exercising pipe events.
//!
//! Exposes the read/write pipe `TestPipe` and the command
//! `cmd_push_pipe_event(DevShort)`: `0` pushes the pipe's current blob, `1`
//! pushes a blob with a nested blob inside.

use dynadev_types::{DataType, DevArg, DevError, DevState, PipeBlob, PipeWriteType};

use crate::device::{Device, DeviceBuilder};
use crate::handlers::{CommandDef, PipeDef};

pub const CLASS_NAME: &str = "PipeServer";
pub const TEST_PIPE: &str = "TestPipe";
pub const PUSH_COMMAND: &str = "cmd_push_pipe_event";

pub fn builder(name: impl Into<String>) -> DeviceBuilder {
    DeviceBuilder::new(name)
        .with_standard_interface()
        .initial_state(DevState::On)
        .pipe(PipeDef::memorized(
            TEST_PIPE,
            PipeWriteType::ReadWrite,
            PipeBlob::new("TestPipeBlob"),
        ))
        .command(CommandDef::new(
            PUSH_COMMAND,
            DataType::Short,
            DataType::Void,
            push_pipe_event,
        ))
}

fn push_pipe_event(dev: &Device, arg: DevArg) -> Result<DevArg, DevError> {
    let blob = match arg {
        DevArg::Short(0) => dev.read_pipe(TEST_PIPE)?,
        DevArg::Short(1) => nested_blob(),
        other => {
            return Err(DevError::InvalidArgument(format!(
                "{PUSH_COMMAND} expects 0 or 1, got {other}"
            )));
        }
    };
    dev.push_pipe_event(TEST_PIPE, blob)?;
    Ok(DevArg::Void)
}

fn nested_blob() -> PipeBlob {
    let inner = PipeBlob::new("Inner")
        .with("counter", DevArg::Long(1))
        .with("names", DevArg::StringArray(vec!["a".into(), "b".into()]));
    PipeBlob::new("PipeEventCase1")
        .with("values", DevArg::DoubleArray(vec![1.5, 2.5]))
        .with_blob("inner", inner)
}
