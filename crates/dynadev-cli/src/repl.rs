//! REPL – the interactive device shell.
//!
//! Supported slash-commands:
//!   /help                         – show this list
//!   /interface                    – print the current interface and revision
//!   /read <name>                  – read an attribute (or pipe)
//!   /write <attribute> <value>    – write an attribute
//!   /exec <command> [arg]         – execute a command
//!   /subscribe [--no-ack] <id> [category..]
//!                                 – subscribe and print events as they arrive
//!   /unsubscribe <handle>         – drop a subscription
//!   /ack <handle> <revision>      – acknowledge a revision (resets liveness)
//!   /subscribers                  – list live subscriptions
//!   /busy [on|off]                – show or set the busy state
//!   /quit | /exit                 – exit the shell
//!
//! Subscriptions opened here ack every event they print, which keeps them
//! alive across heartbeats. With `--no-ack` the user acks by hand and an
//! idle subscription is evicted after `max_missed_heartbeats + 1` periods.

use colored::Colorize;
use std::collections::HashMap;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use dynadev_device::Device;
use dynadev_middleware::{
    DeliveryError, DeliveryWorker, EventDispatcher, SubscriptionHandle, Transport,
};
use dynadev_types::{DataType, DevArg, DevError, EntryKind, Event, EventCategory, EventPayload};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::console::describe_blob;

/// What the loop should do after a command.
#[derive(Debug, PartialEq)]
pub enum Flow {
    Continue(Vec<String>),
    Quit,
}

/// Shell state: the served device plus the delivery workers of the
/// subscriptions opened from this shell.
pub struct Session {
    device: Arc<Device>,
    runtime: Handle,
    transport: Arc<dyn Transport>,
    workers: HashMap<SubscriptionHandle, JoinHandle<()>>,
}

impl Session {
    pub fn new(device: Arc<Device>, runtime: Handle, transport: Arc<dyn Transport>) -> Self {
        Self {
            device,
            runtime,
            transport,
            workers: HashMap::new(),
        }
    }

    /// Parse and run one input line.
    pub fn execute_line(&mut self, line: &str) -> Result<Flow, String> {
        let mut words = line.split_whitespace();
        let Some(cmd) = words.next() else {
            return Ok(Flow::Continue(Vec::new()));
        };
        let args: Vec<&str> = words.collect();

        let lines = match cmd {
            "/help" => help(),
            "/interface" => self.cmd_interface(),
            "/read" => self.cmd_read(&args)?,
            "/write" => self.cmd_write(&args)?,
            "/exec" => self.cmd_exec(&args)?,
            "/subscribe" => self.cmd_subscribe(&args)?,
            "/unsubscribe" => self.cmd_unsubscribe(&args)?,
            "/ack" => self.cmd_ack(&args)?,
            "/subscribers" => self.cmd_subscribers(),
            "/busy" => self.cmd_busy(&args)?,
            "/quit" | "/exit" => return Ok(Flow::Quit),
            other => {
                return Err(format!(
                    "Unknown command '{other}'. Type /help for a list of commands."
                ));
            }
        };
        Ok(Flow::Continue(lines))
    }

    fn cmd_interface(&self) -> Vec<String> {
        let snapshot = self.device.current_snapshot();
        let mut lines = vec![format!(
            "{} {} (state {}, revision {})",
            "Interface of".bold(),
            snapshot.device.bold(),
            self.device.state(),
            snapshot.revision
        )];
        lines.push("  Attributes:".to_string());
        for a in &snapshot.attributes {
            lines.push(format!(
                "    {:<20} {:?} {:?}{}",
                a.name,
                a.data_type,
                a.access,
                dynamic_mark(a.is_dynamic)
            ));
        }
        lines.push("  Commands:".to_string());
        for c in &snapshot.commands {
            lines.push(format!(
                "    {:<20} {:?} -> {:?}{}",
                c.name,
                c.in_type,
                c.out_type,
                dynamic_mark(c.is_dynamic)
            ));
        }
        lines.push("  Pipes:".to_string());
        for p in &snapshot.pipes {
            lines.push(format!(
                "    {:<20} {:?}{}",
                p.name,
                p.write_type,
                dynamic_mark(p.is_dynamic)
            ));
        }
        lines
    }

    fn cmd_read(&self, args: &[&str]) -> Result<Vec<String>, String> {
        let [name] = args else {
            return Err("Usage: /read <name>".to_string());
        };
        match self.device.read_attribute(name) {
            Ok(value) => Ok(vec![format!("{name} = {value}")]),
            Err(DevError::NotFound { .. }) => match self.device.read_pipe(name) {
                Ok(blob) => Ok(vec![format!("{name} = {}", describe_blob(&blob))]),
                Err(DevError::NotFound { .. }) => Err(render_error(&DevError::not_found(
                    EntryKind::Attribute,
                    *name,
                ))),
                Err(e) => Err(render_error(&e)),
            },
            Err(e) => Err(render_error(&e)),
        }
    }

    fn cmd_write(&self, args: &[&str]) -> Result<Vec<String>, String> {
        let [name, rest @ ..] = args else {
            return Err("Usage: /write <attribute> <value>".to_string());
        };
        let data_type = self
            .device
            .current_snapshot()
            .attributes
            .iter()
            .find(|a| a.name.eq_ignore_ascii_case(name))
            .map(|a| a.data_type)
            .ok_or_else(|| render_error(&DevError::not_found(EntryKind::Attribute, *name)))?;
        let value = DevArg::parse(data_type, &rest.join(" ")).map_err(|e| render_error(&e))?;
        self.device
            .write_attribute(name, value)
            .map_err(|e| render_error(&e))?;
        Ok(vec![format!("{} {name}", "✓ wrote".green())])
    }

    fn cmd_exec(&self, args: &[&str]) -> Result<Vec<String>, String> {
        let [name, rest @ ..] = args else {
            return Err("Usage: /exec <command> [arg]".to_string());
        };
        let in_type = self
            .device
            .current_snapshot()
            .commands
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
            .map(|c| c.in_type)
            .ok_or_else(|| render_error(&DevError::not_found(EntryKind::Command, *name)))?;
        let arg = if in_type == DataType::Void {
            DevArg::Void
        } else {
            DevArg::parse(in_type, &rest.join(" ")).map_err(|e| render_error(&e))?
        };
        let out = self.device.execute(name, arg).map_err(|e| render_error(&e))?;
        Ok(vec![format!("{name} -> {out}")])
    }

    fn cmd_subscribe(&mut self, args: &[&str]) -> Result<Vec<String>, String> {
        let (auto_ack, args) = match args {
            ["--no-ack", rest @ ..] => (false, rest),
            _ => (true, args),
        };
        let [subscriber, names @ ..] = args else {
            return Err("Usage: /subscribe [--no-ack] <id> [category ...]".to_string());
        };
        let categories = parse_categories(names)?;
        let show_heartbeats = categories.contains(&EventCategory::Heartbeat);
        let subscription = self.device.subscribe(subscriber, categories.iter().copied());
        let handle = subscription.handle;
        let dispatcher = self.device.dispatcher().clone();
        let transport: Arc<dyn Transport> = if auto_ack {
            Arc::new(AutoAck {
                dispatcher: dispatcher.clone(),
                handle,
                inner: Arc::clone(&self.transport),
                show_heartbeats,
                seen_revision: AtomicU64::new(0),
            })
        } else {
            Arc::clone(&self.transport)
        };
        let worker = {
            let _rt = self.runtime.enter();
            DeliveryWorker::spawn(dispatcher, subscription, transport)
        };
        self.workers.insert(handle, worker);
        let names: Vec<String> = categories.iter().map(|c| c.to_string()).collect();
        let acking = if auto_ack { "auto-ack" } else { "manual ack" };
        Ok(vec![format!(
            "{} {} for {subscriber} ({}; {acking})",
            "✓ subscribed".green(),
            handle.to_string().bold(),
            names.join(", ")
        )])
    }

    fn cmd_unsubscribe(&mut self, args: &[&str]) -> Result<Vec<String>, String> {
        let [text] = args else {
            return Err("Usage: /unsubscribe <handle>".to_string());
        };
        let handle = self.find_handle(text)?;
        self.device.unsubscribe(handle);
        self.workers.remove(&handle);
        Ok(vec![format!("{} {handle}", "✓ unsubscribed".green())])
    }

    fn cmd_ack(&self, args: &[&str]) -> Result<Vec<String>, String> {
        let [text, revision] = args else {
            return Err("Usage: /ack <handle> <revision>".to_string());
        };
        let handle = self.find_handle(text)?;
        let revision: u64 = revision
            .parse()
            .map_err(|_| format!("Invalid revision '{revision}'"))?;
        self.device
            .ack(handle, revision)
            .map_err(|e| render_error(&e))?;
        Ok(vec![format!("{} {handle} at revision {revision}", "✓ acked".green())])
    }

    fn cmd_subscribers(&mut self) -> Vec<String> {
        let dispatcher = self.device.dispatcher();
        self.workers.retain(|handle, _| dispatcher.is_subscribed(*handle));
        let subscribers = dispatcher.subscribers();
        if subscribers.is_empty() {
            return vec!["  (no subscribers)".to_string()];
        }
        let mut lines = Vec::with_capacity(subscribers.len());
        for info in subscribers {
            let mut categories: Vec<String> =
                info.categories.iter().map(|c| c.to_string()).collect();
            categories.sort();
            lines.push(format!(
                "  {:<8} {:<16} acked {:<4} missed {} dropped {} [{}]",
                info.handle.to_string(),
                info.subscriber_id,
                info.last_acked_revision,
                info.missed_heartbeats,
                info.dropped,
                categories.join(", ")
            ));
        }
        lines
    }

    fn cmd_busy(&self, args: &[&str]) -> Result<Vec<String>, String> {
        let busy = self.device.busy_state();
        match args {
            [] => {}
            ["on"] => busy.set(true),
            ["off"] => busy.set(false),
            _ => return Err("Usage: /busy [on|off]".to_string()),
        }
        let label = if busy.is_busy() { "busy".yellow() } else { "idle".green() };
        Ok(vec![format!("  device is {label}")])
    }

    /// Accepts `sub-N` or a bare `N`.
    fn find_handle(&self, text: &str) -> Result<SubscriptionHandle, String> {
        let id: u64 = text
            .strip_prefix("sub-")
            .unwrap_or(text)
            .parse()
            .map_err(|_| format!("Invalid subscription handle '{text}'"))?;
        self.device
            .dispatcher()
            .subscribers()
            .into_iter()
            .map(|info| info.handle)
            .find(|handle| handle.id() == id)
            .ok_or_else(|| format!("No live subscription {text}"))
    }
}

/// Acks on behalf of a shell subscriber: every event handed to the console
/// counts as processed, up to the newest interface revision seen so far.
///
/// Heartbeats reach every subscriber, so there is always something to ack
/// while the device is quiet. Those the user did not ask for are acked and
/// not printed.
struct AutoAck {
    dispatcher: EventDispatcher,
    handle: SubscriptionHandle,
    inner: Arc<dyn Transport>,
    show_heartbeats: bool,
    seen_revision: AtomicU64,
}

#[async_trait]
impl Transport for AutoAck {
    async fn deliver(&self, subscriber: &str, event: &Event) -> Result<(), DeliveryError> {
        if let EventPayload::InterfaceChange(snapshot) = &event.payload {
            self.seen_revision.fetch_max(snapshot.revision, Ordering::SeqCst);
        }
        // Ack before printing so liveness is current once the line appears.
        // An unknown handle means the subscription is already gone.
        let _ = self
            .dispatcher
            .ack(self.handle, self.seen_revision.load(Ordering::SeqCst));
        if matches!(event.payload, EventPayload::Heartbeat { .. }) && !self.show_heartbeats {
            return Ok(());
        }
        self.inner.deliver(subscriber, event).await
    }
}

/// Entry point for the interactive loop.
///
/// `shutdown` is polled each iteration; when set the loop exits cleanly.
pub fn run(mut session: Session, shutdown: Arc<AtomicBool>) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        print!("{} ", "dynadev>".bold().cyan());
        stdout.flush().ok();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        }

        match session.execute_line(line.trim()) {
            Ok(Flow::Continue(lines)) => {
                for l in lines {
                    println!("{l}");
                }
            }
            Ok(Flow::Quit) => {
                println!("{}", "Goodbye.".green());
                break;
            }
            Err(e) => println!("{}", e.red()),
        }
    }
}

fn help() -> Vec<String> {
    let entries = [
        ("/interface", "print the current interface and revision"),
        ("/read <name>", "read an attribute or pipe"),
        ("/write <attr> <value>", "write an attribute"),
        ("/exec <cmd> [arg]", "execute a command"),
        ("/subscribe <id> [cat..]", "subscribe to event categories (default: interface_change)"),
        ("/subscribe --no-ack ..", "same, but /ack by hand or be evicted after missed heartbeats"),
        ("/unsubscribe <handle>", "drop a subscription"),
        ("/ack <handle> <rev>", "acknowledge a revision and reset liveness"),
        ("/subscribers", "list live subscriptions"),
        ("/busy [on|off]", "show or set the busy state"),
        ("/quit  /exit", "exit the shell"),
    ];
    let mut lines = vec![String::new(), "DynaDev Commands".bold().underline().to_string()];
    for (cmd, text) in entries {
        lines.push(format!("  {}  – {}", format!("{cmd:<24}").bold().cyan(), text));
    }
    lines.push(String::new());
    lines
}

/// No names means interface changes only; `all` means every category.
fn parse_categories(names: &[&str]) -> Result<Vec<EventCategory>, String> {
    if names.is_empty() {
        return Ok(vec![EventCategory::InterfaceChange]);
    }
    if names.iter().any(|n| n.eq_ignore_ascii_case("all")) {
        return Ok(vec![
            EventCategory::Change,
            EventCategory::Archive,
            EventCategory::User,
            EventCategory::DataReady,
            EventCategory::Pipe,
            EventCategory::InterfaceChange,
            EventCategory::Heartbeat,
        ]);
    }
    names
        .iter()
        .map(|n| EventCategory::from_name(n).ok_or_else(|| format!("Unknown event category '{n}'")))
        .collect()
}

fn dynamic_mark(is_dynamic: bool) -> &'static str {
    if is_dynamic { " (dynamic)" } else { "" }
}

fn render_error(e: &DevError) -> String {
    format!("{} [{}]", e, e.reason())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dynadev_device::ifchange;
    use dynadev_middleware::ChannelTransport;
    use dynadev_types::{Event, EventPayload};
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn session() -> (tokio::runtime::Runtime, Session, UnboundedReceiver<(String, Event)>) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let device = ifchange::builder("test/ifchange/1").build().unwrap();
        let (transport, rx) = ChannelTransport::new();
        let session = Session::new(device, rt.handle().clone(), Arc::new(transport));
        (rt, session, rx)
    }

    fn lines(flow: Flow) -> Vec<String> {
        match flow {
            Flow::Continue(lines) => lines,
            Flow::Quit => panic!("unexpected quit"),
        }
    }

    #[test]
    fn quit_and_exit_end_the_loop() {
        let (_rt, mut s, _rx) = session();
        assert_eq!(s.execute_line("/quit").unwrap(), Flow::Quit);
        assert_eq!(s.execute_line("/exit").unwrap(), Flow::Quit);
    }

    #[test]
    fn blank_line_is_a_no_op() {
        let (_rt, mut s, _rx) = session();
        assert_eq!(s.execute_line("").unwrap(), Flow::Continue(Vec::new()));
    }

    #[test]
    fn unknown_command_is_an_error() {
        let (_rt, mut s, _rx) = session();
        let err = s.execute_line("/frobnicate").unwrap_err();
        assert!(err.contains("/frobnicate"));
    }

    #[test]
    fn exec_add_dynamic_then_read_ioattr() {
        let (_rt, mut s, _rx) = session();
        s.execute_line("/exec Add_dynamic").unwrap();
        let out = lines(s.execute_line("/interface").unwrap());
        assert!(out.iter().any(|l| l.contains("ioattr") && l.contains("(dynamic)")));
        assert!(out.iter().any(|l| l.contains("revision 2")));

        let out = lines(s.execute_line("/read ioattr").unwrap());
        assert_eq!(out, vec!["ioattr = 0".to_string()]);
        let err = s.execute_line("/write ioattr 2.5").unwrap_err();
        assert!(err.contains("API_AttrNotAllowed"));
    }

    #[test]
    fn read_falls_back_to_pipes() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let device = dynadev_device::pipe_server::builder("test/pipe/1").build().unwrap();
        let (transport, _rx) = ChannelTransport::new();
        let mut s = Session::new(device, rt.handle().clone(), Arc::new(transport));
        let out = lines(s.execute_line("/read TestPipe").unwrap());
        assert_eq!(out, vec!["TestPipe = TestPipeBlob{}".to_string()]);
    }

    #[test]
    fn read_unknown_name_reports_reason() {
        let (_rt, mut s, _rx) = session();
        let err = s.execute_line("/read nothing").unwrap_err();
        assert!(err.contains("API_AttrNotFound"));
    }

    #[test]
    fn busy_blocks_exec_until_unlock() {
        let (_rt, mut s, _rx) = session();
        s.execute_line("/busy on").unwrap();
        let err = s.execute_line("/exec Add_dynamic").unwrap_err();
        assert!(err.contains("API_CommandNotAllowed"));
        // The unlock command and the busy attribute stay reachable.
        let out = lines(s.execute_line("/read busy").unwrap());
        assert_eq!(out, vec!["busy = true".to_string()]);
        s.execute_line("/exec Unlock").unwrap();
        s.execute_line("/exec Add_dynamic").unwrap();
    }

    #[test]
    fn subscribe_delivers_interface_changes() {
        let (rt, mut s, mut rx) = session();
        let out = lines(s.execute_line("/subscribe client-a").unwrap());
        assert!(out[0].contains("sub-"));
        s.execute_line("/exec Add_dynamic").unwrap();

        let (subscriber, event) = rt
            .block_on(async { tokio::time::timeout(Duration::from_secs(2), rx.recv()).await })
            .expect("delivered in time")
            .expect("channel open");
        assert_eq!(subscriber, "client-a");
        match event.payload {
            EventPayload::InterfaceChange(snapshot) => assert_eq!(snapshot.revision, 1),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn ack_and_unsubscribe_by_handle() {
        let (_rt, mut s, _rx) = session();
        s.execute_line("/subscribe client-a change interface_change").unwrap();
        let handle = s.device.dispatcher().subscribers()[0].handle;
        s.execute_line("/exec Add_dynamic").unwrap();

        s.execute_line(&format!("/ack {handle} 1")).unwrap();
        assert_eq!(s.device.dispatcher().subscribers()[0].last_acked_revision, 1);
        assert!(s.execute_line(&format!("/ack {} 9", handle.id())).is_err());

        let out = lines(s.execute_line("/subscribers").unwrap());
        assert!(out[0].contains("client-a"));

        s.execute_line(&format!("/unsubscribe {handle}")).unwrap();
        assert_eq!(s.device.dispatcher().subscriber_count(), 0);
        assert!(s.execute_line(&format!("/unsubscribe {handle}")).is_err());
    }

    #[test]
    fn shell_subscription_acks_itself_across_heartbeats() {
        let (rt, mut s, mut rx) = session();
        s.execute_line("/subscribe client-a").unwrap();
        let handle = s.device.dispatcher().subscribers()[0].handle;

        for _ in 0..6 {
            assert!(s.device.heartbeat().is_empty());
            std::thread::sleep(Duration::from_millis(50));
        }
        assert!(s.device.dispatcher().is_subscribed(handle));

        // Heartbeats were not asked for, so only the interface change shows up.
        s.execute_line("/exec Add_dynamic").unwrap();
        let (_, event) = rt
            .block_on(async { tokio::time::timeout(Duration::from_secs(2), rx.recv()).await })
            .expect("delivered in time")
            .expect("channel open");
        assert!(matches!(event.payload, EventPayload::InterfaceChange(_)));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(s.device.dispatcher().subscribers()[0].last_acked_revision, 2);
    }

    #[test]
    fn no_ack_subscription_is_evicted_after_missed_heartbeats() {
        let (_rt, mut s, _rx) = session();
        let out = lines(s.execute_line("/subscribe --no-ack client-a").unwrap());
        assert!(out[0].contains("manual ack"));
        let handle = s.device.dispatcher().subscribers()[0].handle;

        let evicted: Vec<_> = (0..6).flat_map(|_| s.device.heartbeat()).collect();
        assert_eq!(evicted, vec![handle]);
        assert!(!s.device.dispatcher().is_subscribed(handle));
        assert!(s.execute_line("/subscribe --no-ack").is_err());
    }

    #[test]
    fn parse_categories_defaults_and_all() {
        assert_eq!(parse_categories(&[]).unwrap(), vec![EventCategory::InterfaceChange]);
        assert_eq!(parse_categories(&["all"]).unwrap().len(), 7);
        assert_eq!(
            parse_categories(&["change_event", "pipe"]).unwrap(),
            vec![EventCategory::Change, EventCategory::Pipe]
        );
        assert!(parse_categories(&["nonsense"]).is_err());
    }
}
