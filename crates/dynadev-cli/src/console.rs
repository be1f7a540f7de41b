//! [`ConsoleTransport`] – delivers subscriber events to the terminal.
//!
//! Each delivered event becomes one line: coloured text for humans, or a
//! JSON object when the CLI runs with `DYNADEV_LOG_FORMAT=json`.

use std::io::Write;

use async_trait::async_trait;
use colored::Colorize;
use dynadev_middleware::{DeliveryError, Transport};
use dynadev_types::{Event, EventPayload, PipeBlob, PipeValue};
use parking_lot::Mutex;
use serde::Serialize;

#[derive(Serialize)]
struct JsonLine<'a> {
    subscriber: &'a str,
    event: &'a Event,
}

pub struct ConsoleTransport {
    json: bool,
    out: Mutex<Box<dyn Write + Send>>,
}

impl ConsoleTransport {
    pub fn stdout(json: bool) -> Self {
        Self::with_writer(json, Box::new(std::io::stdout()))
    }

    pub fn with_writer(json: bool, out: Box<dyn Write + Send>) -> Self {
        Self {
            json,
            out: Mutex::new(out),
        }
    }

    fn render(&self, subscriber: &str, event: &Event) -> Result<String, DeliveryError> {
        if self.json {
            let line = JsonLine { subscriber, event };
            return serde_json::to_string(&line).map_err(|e| DeliveryError::Encoding {
                subscriber: subscriber.to_string(),
                reason: e.to_string(),
            });
        }
        Ok(format!(
            "  {} {} {}",
            format!("[{}]", event.category).cyan(),
            subscriber.dimmed(),
            describe(event)
        ))
    }
}

#[async_trait]
impl Transport for ConsoleTransport {
    async fn deliver(&self, subscriber: &str, event: &Event) -> Result<(), DeliveryError> {
        let line = self.render(subscriber, event)?;
        let mut out = self.out.lock();
        writeln!(out, "{line}")
            .and_then(|()| out.flush())
            .map_err(|e| DeliveryError::Unreachable {
                subscriber: subscriber.to_string(),
                reason: e.to_string(),
            })
    }
}

/// One-line plain-text summary of an event payload.
pub fn describe(event: &Event) -> String {
    match &event.payload {
        EventPayload::InterfaceChange(snapshot) => format!(
            "{} revision {}: {} attribute(s), {} command(s), {} pipe(s)",
            snapshot.device,
            snapshot.revision,
            snapshot.attributes.len(),
            snapshot.commands.len(),
            snapshot.pipes.len()
        ),
        EventPayload::AttributeValue {
            attribute,
            value,
            quality,
        } => format!("{}/{attribute} = {value} ({quality:?})", event.device),
        EventPayload::DataReady { attribute, counter } => {
            format!("{}/{attribute} data ready, counter {counter}", event.device)
        }
        EventPayload::Pipe { pipe, blob } => {
            format!("{}/{pipe} {}", event.device, describe_blob(blob))
        }
        EventPayload::Heartbeat { sequence } => format!("{} heartbeat #{sequence}", event.device),
    }
}

pub fn describe_blob(blob: &PipeBlob) -> String {
    let parts: Vec<String> = blob
        .elements
        .iter()
        .map(|e| match &e.value {
            PipeValue::Scalar(v) => format!("{}={}", e.name, v),
            PipeValue::Blob(inner) => format!("{}={}", e.name, describe_blob(inner)),
        })
        .collect();
    format!("{}{{{}}}", blob.name, parts.join(", "))
}
