//! `dynadev-device` – a device instance with a dynamic interface.
//!
//! # Modules
//!
//! - [`handlers`] – attribute, command and pipe definitions with their
//!   handler closures.
//! - [`registry`] – the name-indexed handler table of one device.
//! - [`notifier`] – interface revisions and interface-change publishing.
//! - [`device`] – [`Device`], its request paths and [`DeviceBuilder`].
//! - [`source`] – [`InterfaceSource`], the supplier of static entries.
//! - [`ifchange`], [`pipe_server`] – example devices.

pub mod device;
pub mod handlers;
pub mod ifchange;
pub mod notifier;
pub mod pipe_server;
pub mod registry;
pub mod source;
mod standard;

pub use device::{Device, DeviceBuilder, Reconfiguration};
pub use handlers::{AttributeDef, CommandDef, PipeDef};
pub use notifier::InterfaceNotifier;
pub use registry::{EventFlags, PushKind, Registry};
pub use source::InterfaceSource;
