use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Wire-level data types a command argument or attribute value may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Void,
    Boolean,
    Short,
    Long,
    Long64,
    Float,
    Double,
    String,
    State,
    DoubleArray,
    StringArray,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Void => "DevVoid",
            DataType::Boolean => "DevBoolean",
            DataType::Short => "DevShort",
            DataType::Long => "DevLong",
            DataType::Long64 => "DevLong64",
            DataType::Float => "DevFloat",
            DataType::Double => "DevDouble",
            DataType::String => "DevString",
            DataType::State => "DevState",
            DataType::DoubleArray => "DevVarDoubleArray",
            DataType::StringArray => "DevVarStringArray",
        };
        f.write_str(name)
    }
}

/// Operational state reported by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum DevState {
    On,
    Off,
    Close,
    Open,
    Insert,
    Extract,
    Moving,
    Standby,
    Fault,
    Init,
    Running,
    Alarm,
    Disable,
    #[default]
    Unknown,
}

impl DevState {
    const ALL: [DevState; 14] = [
        DevState::On,
        DevState::Off,
        DevState::Close,
        DevState::Open,
        DevState::Insert,
        DevState::Extract,
        DevState::Moving,
        DevState::Standby,
        DevState::Fault,
        DevState::Init,
        DevState::Running,
        DevState::Alarm,
        DevState::Disable,
        DevState::Unknown,
    ];

    fn as_str(&self) -> &'static str {
        match self {
            DevState::On => "ON",
            DevState::Off => "OFF",
            DevState::Close => "CLOSE",
            DevState::Open => "OPEN",
            DevState::Insert => "INSERT",
            DevState::Extract => "EXTRACT",
            DevState::Moving => "MOVING",
            DevState::Standby => "STANDBY",
            DevState::Fault => "FAULT",
            DevState::Init => "INIT",
            DevState::Running => "RUNNING",
            DevState::Alarm => "ALARM",
            DevState::Disable => "DISABLE",
            DevState::Unknown => "UNKNOWN",
        }
    }

    /// Case-insensitive lookup by state name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|s| s.as_str().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for DevState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tagged argument/value type. One variant per [`DataType`]; the discriminant
/// is checked at the registry boundary instead of being discovered at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum DevArg {
    Void,
    Boolean(bool),
    Short(i16),
    Long(i32),
    Long64(i64),
    Float(f32),
    Double(f64),
    String(String),
    State(DevState),
    DoubleArray(Vec<f64>),
    StringArray(Vec<String>),
}

impl DevArg {
    /// The [`DataType`] discriminant of this value.
    pub fn data_type(&self) -> DataType {
        match self {
            DevArg::Void => DataType::Void,
            DevArg::Boolean(_) => DataType::Boolean,
            DevArg::Short(_) => DataType::Short,
            DevArg::Long(_) => DataType::Long,
            DevArg::Long64(_) => DataType::Long64,
            DevArg::Float(_) => DataType::Float,
            DevArg::Double(_) => DataType::Double,
            DevArg::String(_) => DataType::String,
            DevArg::State(_) => DataType::State,
            DevArg::DoubleArray(_) => DataType::DoubleArray,
            DevArg::StringArray(_) => DataType::StringArray,
        }
    }

    /// A zero value of the given type, used to seed memorized attributes.
    pub fn default_for(data_type: DataType) -> Self {
        match data_type {
            DataType::Void => DevArg::Void,
            DataType::Boolean => DevArg::Boolean(false),
            DataType::Short => DevArg::Short(0),
            DataType::Long => DevArg::Long(0),
            DataType::Long64 => DevArg::Long64(0),
            DataType::Float => DevArg::Float(0.0),
            DataType::Double => DevArg::Double(0.0),
            DataType::String => DevArg::String(String::new()),
            DataType::State => DevArg::State(DevState::Unknown),
            DataType::DoubleArray => DevArg::DoubleArray(Vec::new()),
            DataType::StringArray => DevArg::StringArray(Vec::new()),
        }
    }

    /// Parse `text` as a value of `data_type`.
    ///
    /// Arrays are comma separated. Booleans accept `true/false`, `1/0` and
    /// `on/off`.
    ///
    /// # Errors
    ///
    /// [`DevError::InvalidArgument`] when `text` cannot be converted.
    pub fn parse(data_type: DataType, text: &str) -> Result<Self, DevError> {
        let text = text.trim();
        let invalid = || DevError::InvalidArgument(format!("cannot parse '{text}' as {data_type}"));
        let value = match data_type {
            DataType::Void => DevArg::Void,
            DataType::Boolean => match text.to_ascii_lowercase().as_str() {
                "true" | "1" | "on" => DevArg::Boolean(true),
                "false" | "0" | "off" => DevArg::Boolean(false),
                _ => return Err(invalid()),
            },
            DataType::Short => DevArg::Short(text.parse().map_err(|_| invalid())?),
            DataType::Long => DevArg::Long(text.parse().map_err(|_| invalid())?),
            DataType::Long64 => DevArg::Long64(text.parse().map_err(|_| invalid())?),
            DataType::Float => DevArg::Float(text.parse().map_err(|_| invalid())?),
            DataType::Double => DevArg::Double(text.parse().map_err(|_| invalid())?),
            DataType::String => DevArg::String(text.to_string()),
            DataType::State => DevArg::State(DevState::from_name(text).ok_or_else(invalid)?),
            DataType::DoubleArray => {
                if text.is_empty() {
                    DevArg::DoubleArray(Vec::new())
                } else {
                    let items = text
                        .split(',')
                        .map(|s| s.trim().parse::<f64>())
                        .collect::<Result<Vec<_>, _>>()
                        .map_err(|_| invalid())?;
                    DevArg::DoubleArray(items)
                }
            }
            DataType::StringArray => {
                if text.is_empty() {
                    DevArg::StringArray(Vec::new())
                } else {
                    DevArg::StringArray(text.split(',').map(|s| s.trim().to_string()).collect())
                }
            }
        };
        Ok(value)
    }
}

impl fmt::Display for DevArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DevArg::Void => f.write_str("<void>"),
            DevArg::Boolean(v) => write!(f, "{v}"),
            DevArg::Short(v) => write!(f, "{v}"),
            DevArg::Long(v) => write!(f, "{v}"),
            DevArg::Long64(v) => write!(f, "{v}"),
            DevArg::Float(v) => write!(f, "{v}"),
            DevArg::Double(v) => write!(f, "{v}"),
            DevArg::String(v) => f.write_str(v),
            DevArg::State(v) => write!(f, "{v}"),
            DevArg::DoubleArray(v) => {
                let parts: Vec<String> = v.iter().map(|x| x.to_string()).collect();
                write!(f, "[{}]", parts.join(", "))
            }
            DevArg::StringArray(v) => write!(f, "[{}]", v.join(", ")),
        }
    }
}

/// Read/write capability of an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttrAccess {
    Read,
    Write,
    ReadWrite,
}

impl AttrAccess {
    pub fn readable(&self) -> bool {
        matches!(self, AttrAccess::Read | AttrAccess::ReadWrite)
    }

    pub fn writable(&self) -> bool {
        matches!(self, AttrAccess::Write | AttrAccess::ReadWrite)
    }
}

/// Write capability of a pipe. Pipes are always readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipeWriteType {
    Read,
    ReadWrite,
}

impl PipeWriteType {
    pub fn writable(&self) -> bool {
        matches!(self, PipeWriteType::ReadWrite)
    }
}

/// Quality tag attached to pushed attribute values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AttrQuality {
    #[default]
    Valid,
    Invalid,
    Alarm,
    Changing,
    Warning,
}

/// The three kinds of named entries a device exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Attribute,
    Command,
    Pipe,
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryKind::Attribute => f.write_str("attribute"),
            EntryKind::Command => f.write_str("command"),
            EntryKind::Pipe => f.write_str("pipe"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeDescriptor {
    pub name: String,
    pub data_type: DataType,
    pub access: AttrAccess,
    pub is_dynamic: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandDescriptor {
    pub name: String,
    pub in_type: DataType,
    pub out_type: DataType,
    /// Installed for this device instance only rather than for every device
    /// of its class.
    pub takes_device_arg: bool,
    pub is_dynamic: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipeDescriptor {
    pub name: String,
    pub write_type: PipeWriteType,
    pub is_dynamic: bool,
}

/// Immutable view of a device interface at one revision.
///
/// Produced once per registry mutation and shared by reference with every
/// subscriber notified of that revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceSnapshot {
    pub device: String,
    pub revision: u64,
    pub attributes: Vec<AttributeDescriptor>,
    pub commands: Vec<CommandDescriptor>,
    pub pipes: Vec<PipeDescriptor>,
}

impl InterfaceSnapshot {
    pub fn attribute_names(&self) -> Vec<&str> {
        self.attributes.iter().map(|a| a.name.as_str()).collect()
    }

    pub fn command_names(&self) -> Vec<&str> {
        self.commands.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn pipe_names(&self) -> Vec<&str> {
        self.pipes.iter().map(|p| p.name.as_str()).collect()
    }
}

/// A named, nested data structure carried by a pipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PipeBlob {
    pub name: String,
    pub elements: Vec<PipeElement>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipeElement {
    pub name: String,
    pub value: PipeValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PipeValue {
    Scalar(DevArg),
    Blob(PipeBlob),
}

impl PipeBlob {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            elements: Vec::new(),
        }
    }

    /// Builder-style append of a scalar element.
    pub fn with(mut self, name: impl Into<String>, value: DevArg) -> Self {
        self.elements.push(PipeElement {
            name: name.into(),
            value: PipeValue::Scalar(value),
        });
        self
    }

    /// Builder-style append of a nested blob.
    pub fn with_blob(mut self, name: impl Into<String>, blob: PipeBlob) -> Self {
        self.elements.push(PipeElement {
            name: name.into(),
            value: PipeValue::Blob(blob),
        });
        self
    }

    pub fn get(&self, name: &str) -> Option<&PipeValue> {
        self.elements.iter().find(|e| e.name == name).map(|e| &e.value)
    }
}

/// Subscription categories understood by the event dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Change,
    Archive,
    User,
    DataReady,
    Pipe,
    InterfaceChange,
    Heartbeat,
}

impl EventCategory {
    /// Parse a category from its short or `*_event` name, case-insensitively.
    pub fn from_name(name: &str) -> Option<Self> {
        let lower = name.trim().to_ascii_lowercase();
        let short = lower.strip_suffix("_event").unwrap_or(&lower);
        match short {
            "change" => Some(EventCategory::Change),
            "archive" => Some(EventCategory::Archive),
            "user" => Some(EventCategory::User),
            "data_ready" => Some(EventCategory::DataReady),
            "pipe" => Some(EventCategory::Pipe),
            "interface_change" => Some(EventCategory::InterfaceChange),
            "heartbeat" => Some(EventCategory::Heartbeat),
            _ => None,
        }
    }
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventCategory::Change => "change_event",
            EventCategory::Archive => "archive_event",
            EventCategory::User => "user_event",
            EventCategory::DataReady => "data_ready_event",
            EventCategory::Pipe => "pipe_event",
            EventCategory::InterfaceChange => "interface_change_event",
            EventCategory::Heartbeat => "heartbeat",
        };
        f.write_str(name)
    }
}

/// Kind of request the access guard is asked about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Read,
    Write,
    Execute,
    /// Adding or removing a dynamic attribute, command or pipe.
    Configure,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Read => f.write_str("read"),
            OperationKind::Write => f.write_str("write"),
            OperationKind::Execute => f.write_str("execute"),
            OperationKind::Configure => f.write_str("configure"),
        }
    }
}

/// Unified event wrapper handed to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g. "test/ifchange/1"
    pub device: String,
    pub category: EventCategory,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(device: impl Into<String>, category: EventCategory, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            device: device.into(),
            category,
            payload,
        }
    }
}

/// Variants of data carried by an [`Event`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    InterfaceChange(Arc<InterfaceSnapshot>),
    AttributeValue {
        attribute: String,
        value: DevArg,
        quality: AttrQuality,
    },
    DataReady {
        attribute: String,
        counter: i32,
    },
    Pipe {
        pipe: String,
        blob: PipeBlob,
    },
    Heartbeat {
        sequence: u64,
    },
}

/// Error type returned to the immediate caller of every registry, guard and
/// device operation.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DevError {
    #[error("{kind} '{name}' already exists")]
    DuplicateName { kind: EntryKind, name: String },

    #[error("{kind} '{name}' not found")]
    NotFound { kind: EntryKind, name: String },

    #[error("{operation} on '{target}' not allowed: {reason}")]
    NotAllowed {
        operation: OperationKind,
        target: String,
        reason: String,
    },

    #[error("wrong type for '{target}': expected {expected}, got {actual}")]
    WrongType {
        target: String,
        expected: DataType,
        actual: DataType,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("handler for '{target}' failed: {reason}")]
    HandlerFailed { target: String, reason: String },
}

impl DevError {
    /// Control-system reason code for this error.
    pub fn reason(&self) -> &'static str {
        match self {
            DevError::DuplicateName { kind: EntryKind::Attribute, .. } => "API_AttrAlreadyExist",
            DevError::DuplicateName { kind: EntryKind::Command, .. } => "API_CommandAlreadyExist",
            DevError::DuplicateName { kind: EntryKind::Pipe, .. } => "API_PipeDuplicateName",
            DevError::NotFound { kind: EntryKind::Attribute, .. } => "API_AttrNotFound",
            DevError::NotFound { kind: EntryKind::Command, .. } => "API_CommandNotFound",
            DevError::NotFound { kind: EntryKind::Pipe, .. } => "API_PipeNotFound",
            DevError::NotAllowed { operation: OperationKind::Execute, .. } => "API_CommandNotAllowed",
            DevError::NotAllowed { .. } => "API_AttrNotAllowed",
            DevError::WrongType { .. } => "API_IncompatibleArgumentType",
            DevError::InvalidArgument(_) => "API_InvalidArgs",
            DevError::HandlerFailed { .. } => "API_DeviceError",
        }
    }

    pub fn not_found(kind: EntryKind, name: impl Into<String>) -> Self {
        DevError::NotFound {
            kind,
            name: name.into(),
        }
    }
}
