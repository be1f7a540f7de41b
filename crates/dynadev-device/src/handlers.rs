//! Capability-indexed handler table entries.
//!
//! Every attribute, command and pipe is described by a `*Def` value: the
//! descriptor fields plus the closures that serve requests for it. The
//! [`Registry`][crate::registry::Registry] stores them keyed by name; the
//! [`Device`] looks a handler up, releases its lock, and calls it.

use std::sync::Arc;

use dynadev_types::{AttrAccess, DataType, DevArg, DevError, PipeBlob, PipeWriteType};
use parking_lot::Mutex;

use crate::device::Device;

pub type ReadFn = Arc<dyn Fn(&Device) -> Result<DevArg, DevError> + Send + Sync>;
pub type WriteFn = Arc<dyn Fn(&Device, DevArg) -> Result<(), DevError> + Send + Sync>;
pub type ExecuteFn = Arc<dyn Fn(&Device, DevArg) -> Result<DevArg, DevError> + Send + Sync>;
pub type PipeReadFn = Arc<dyn Fn(&Device) -> Result<PipeBlob, DevError> + Send + Sync>;
pub type PipeWriteFn = Arc<dyn Fn(&Device, PipeBlob) -> Result<(), DevError> + Send + Sync>;

// ────────────────────────────────────────────────────────────────────────────
// Attributes
// ────────────────────────────────────────────────────────────────────────────

/// An attribute to install: descriptor fields plus read/write handlers.
///
/// By default the value is memorized: writes store it, reads return the last
/// stored value (initially the zero value of `data_type`).
#[derive(Clone)]
pub struct AttributeDef {
    pub name: String,
    pub data_type: DataType,
    pub access: AttrAccess,
    pub(crate) read: ReadFn,
    pub(crate) write: WriteFn,
}

impl AttributeDef {
    pub fn new(name: impl Into<String>, data_type: DataType, access: AttrAccess) -> Self {
        Self::memorized(name, access, DevArg::default_for(data_type))
    }

    /// Memorized attribute seeded with `initial`; its type is taken from the
    /// value.
    pub fn memorized(name: impl Into<String>, access: AttrAccess, initial: DevArg) -> Self {
        let data_type = initial.data_type();
        let cell = Arc::new(Mutex::new(initial));
        let read_cell = Arc::clone(&cell);
        Self {
            name: name.into(),
            data_type,
            access,
            read: Arc::new(move |_: &Device| -> Result<DevArg, DevError> {
                Ok(read_cell.lock().clone())
            }),
            write: Arc::new(move |_: &Device, value: DevArg| -> Result<(), DevError> {
                *cell.lock() = value;
                Ok(())
            }),
        }
    }

    pub fn read_with<F>(mut self, read: F) -> Self
    where
        F: Fn(&Device) -> Result<DevArg, DevError> + Send + Sync + 'static,
    {
        self.read = Arc::new(read);
        self
    }

    pub fn write_with<F>(mut self, write: F) -> Self
    where
        F: Fn(&Device, DevArg) -> Result<(), DevError> + Send + Sync + 'static,
    {
        self.write = Arc::new(write);
        self
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Commands
// ────────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct CommandDef {
    pub name: String,
    pub in_type: DataType,
    pub out_type: DataType,
    pub takes_device_arg: bool,
    pub(crate) execute: ExecuteFn,
}

impl CommandDef {
    pub fn new<F>(
        name: impl Into<String>,
        in_type: DataType,
        out_type: DataType,
        execute: F,
    ) -> Self
    where
        F: Fn(&Device, DevArg) -> Result<DevArg, DevError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            in_type,
            out_type,
            takes_device_arg: false,
            execute: Arc::new(execute),
        }
    }

    /// `DevVoid -> DevVoid` command.
    pub fn void<F>(name: impl Into<String>, run: F) -> Self
    where
        F: Fn(&Device) -> Result<(), DevError> + Send + Sync + 'static,
    {
        Self::new(name, DataType::Void, DataType::Void, move |dev: &Device, _| {
            run(dev).map(|()| DevArg::Void)
        })
    }

    /// Command without code of its own: returns its argument when the in and
    /// out types agree, otherwise the zero value of `out_type`.
    pub fn echo(name: impl Into<String>, in_type: DataType, out_type: DataType) -> Self {
        Self::new(name, in_type, out_type, move |_: &Device, arg: DevArg| {
            if in_type == out_type {
                Ok(arg)
            } else {
                Ok(DevArg::default_for(out_type))
            }
        })
    }

    /// Install the command for this device instance only.
    pub fn device_level(mut self) -> Self {
        self.takes_device_arg = true;
        self
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Pipes
// ────────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct PipeDef {
    pub name: String,
    pub write_type: PipeWriteType,
    pub(crate) read: PipeReadFn,
    pub(crate) write: PipeWriteFn,
}

impl PipeDef {
    /// Memorized pipe holding an empty blob.
    pub fn new(name: impl Into<String>, write_type: PipeWriteType) -> Self {
        let name = name.into();
        let blob = PipeBlob::new(name.clone());
        Self::memorized(name, write_type, blob)
    }

    pub fn memorized(
        name: impl Into<String>,
        write_type: PipeWriteType,
        initial: PipeBlob,
    ) -> Self {
        let cell = Arc::new(Mutex::new(initial));
        let read_cell = Arc::clone(&cell);
        Self {
            name: name.into(),
            write_type,
            read: Arc::new(move |_: &Device| -> Result<PipeBlob, DevError> {
                Ok(read_cell.lock().clone())
            }),
            write: Arc::new(move |_: &Device, blob: PipeBlob| -> Result<(), DevError> {
                *cell.lock() = blob;
                Ok(())
            }),
        }
    }

    pub fn read_with<F>(mut self, read: F) -> Self
    where
        F: Fn(&Device) -> Result<PipeBlob, DevError> + Send + Sync + 'static,
    {
        self.read = Arc::new(read);
        self
    }

    pub fn write_with<F>(mut self, write: F) -> Self
    where
        F: Fn(&Device, PipeBlob) -> Result<(), DevError> + Send + Sync + 'static,
    {
        self.write = Arc::new(write);
        self
    }
}
