//! `dynadev` – interactive host for one dynamic-interface device.
//!
//! The binary:
//!
//! 1. Loads `~/.dynadev/config.toml`, running a short **First-Run Wizard**
//!    when the file is absent.
//! 2. Builds the configured example device (`ifchange` or `pipe`) with the
//!    static entries and gate policy from the config.
//! 3. Drives subscriber heartbeats on a Tokio runtime.
//! 4. Drops the user into an **interactive shell** with slash-commands
//!    (`/interface`, `/read`, `/exec`, `/subscribe`, `/help`, ...).
//! 5. Intercepts **Ctrl-C** to stop the shell cleanly.

mod config;
mod console;
mod repl;
mod telemetry;

use colored::Colorize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::warn;

use dynadev_device::{Device, ifchange, pipe_server};
use dynadev_middleware::DispatcherConfig;
use dynadev_types::DevError;

use crate::config::{Config, ServerKind};
use crate::console::ConsoleTransport;
use crate::telemetry::{LogFormat, TelemetrySettings};

fn main() {
    print_banner();

    // ── Configuration ─────────────────────────────────────────────────────
    let cfg = match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => run_first_run_wizard(),
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            Config::default()
        }
    };

    // ── Structured logging ────────────────────────────────────────────────
    let log_format = LogFormat::from_env();
    let _telemetry = telemetry::init_tracing(&TelemetrySettings::new(&cfg, log_format));

    // ── Shared shutdown flag ──────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – shutting down …".yellow().bold());
        shutdown_clone.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler");
    }

    // ── Device ────────────────────────────────────────────────────────────
    let device = match build_device(&cfg) {
        Ok(device) => device,
        Err(e) => {
            eprintln!("{}: {} [{}]", "Device error".red(), e, e.reason());
            std::process::exit(1);
        }
    };
    println!(
        "  Serving {} as {} (revision {})",
        device.name().bold(),
        cfg.server.to_string().cyan(),
        device.revision()
    );

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}: {}", "Failed to start runtime".red(), e);
            std::process::exit(1);
        }
    };
    runtime.spawn(heartbeat_loop(Arc::clone(&device), cfg.heartbeat_period()));

    println!();
    println!("  Type {} for a list of commands.\n", "/help".bold().cyan());

    let session = repl::Session::new(
        device,
        runtime.handle().clone(),
        Arc::new(ConsoleTransport::stdout(log_format.is_json())),
    );
    repl::run(session, shutdown);

    runtime.shutdown_timeout(Duration::from_secs(1));
}

/// Build the configured example device and install the config's static
/// entries on it.
fn build_device(cfg: &Config) -> Result<Arc<Device>, DevError> {
    let builder = match cfg.server {
        ServerKind::Ifchange => ifchange::builder(cfg.device_name.as_str()),
        ServerKind::Pipe => pipe_server::builder(cfg.device_name.as_str()),
    };
    builder
        .gate_policy_with(|policy| cfg.guard.apply(policy))
        .dispatcher_config(DispatcherConfig {
            queue_capacity: cfg.queue_capacity,
            max_missed_heartbeats: cfg.max_missed_heartbeats,
        })
        .interface_from(cfg)
        .build()
}

/// One dispatcher heartbeat per `period`; logs every eviction.
async fn heartbeat_loop(device: Arc<Device>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        for handle in device.heartbeat() {
            warn!(device = device.name(), subscription = %handle, "subscriber evicted");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// First-Run Wizard
// ─────────────────────────────────────────────────────────────────────────────

fn run_first_run_wizard() -> Config {
    println!();
    println!("{}", "  ╔══════════════════════════════════════╗".bold().cyan());
    println!("{}", "  ║       DynaDev First-Run Wizard       ║".bold().cyan());
    println!("{}", "  ╚══════════════════════════════════════╝".bold().cyan());
    println!();
    println!("  No configuration found.  Let's set up a device.\n");

    let mut cfg = Config::default();

    println!("  Which device would you like to serve?");
    println!("    1) Interface-change demo  (default)");
    println!("    2) Pipe demo");
    let choice = prompt_line("  Enter choice [1]: ", "1");
    cfg.server = match choice.trim() {
        "2" => ServerKind::Pipe,
        _ => ServerKind::Ifchange,
    };
    if cfg.server == ServerKind::Pipe {
        cfg.device_name = "test/pipe/1".to_string();
    }

    cfg.device_name = prompt_line(
        &format!("  Device name [{}]: ", cfg.device_name),
        &cfg.device_name,
    );

    match config::save(&cfg) {
        Ok(()) => println!(
            "\n  {} Config saved to {}\n",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
    cfg
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!(
        "  {} {}",
        "DynaDev".bold().cyan(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Dynamic device interface host");
    println!();
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn prompt_line(msg: &str, default: &str) -> String {
    use std::io::{BufRead, Write};
    print!("{}", msg);
    std::io::stdout().flush().ok();
    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(_) => {
            let t = line.trim().to_string();
            if t.is_empty() { default.to_string() } else { t }
        }
        Err(_) => default.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GuardConfig, StaticAttribute, StaticCommand};
    use dynadev_types::{AttrAccess, DataType, DevArg, EntryKind, OperationKind};

    #[test]
    fn default_config_builds_ifchange_device() {
        let device = build_device(&Config::default()).unwrap();
        assert_eq!(device.name(), "test/ifchange/1");
        assert_eq!(device.revision(), 0);
        assert!(device.current_snapshot().command_names().contains(&"Add_dynamic"));
        assert_eq!(device.dispatcher().config().queue_capacity, 256);
    }

    #[test]
    fn pipe_server_kind_builds_pipe_device() {
        let cfg = Config {
            server: ServerKind::Pipe,
            device_name: "test/pipe/1".into(),
            ..Config::default()
        };
        let device = build_device(&cfg).unwrap();
        assert_eq!(device.current_snapshot().pipe_names(), vec!["TestPipe"]);
    }

    #[test]
    fn static_entries_from_config_are_installed() {
        let cfg = Config {
            attributes: vec![StaticAttribute {
                name: "setpoint".into(),
                data_type: DataType::Double,
                access: AttrAccess::ReadWrite,
            }],
            commands: vec![StaticCommand {
                name: "Echo".into(),
                in_type: DataType::String,
                out_type: DataType::String,
                device_level: false,
            }],
            ..Config::default()
        };
        let device = build_device(&cfg).unwrap();
        device.write_attribute("setpoint", DevArg::Double(4.0)).unwrap();
        assert_eq!(device.read_attribute("setpoint").unwrap(), DevArg::Double(4.0));
        assert_eq!(
            device.execute("Echo", DevArg::String("hi".into())).unwrap(),
            DevArg::String("hi".into())
        );
        // Static entries cannot be removed at runtime.
        assert_eq!(
            device.remove_attribute("setpoint").unwrap_err(),
            DevError::not_found(EntryKind::Attribute, "setpoint")
        );
    }

    #[test]
    fn config_entry_clashing_with_builtin_is_rejected() {
        let cfg = Config {
            attributes: vec![StaticAttribute {
                name: "BUSY".into(),
                data_type: DataType::Boolean,
                access: AttrAccess::Read,
            }],
            ..Config::default()
        };
        assert!(matches!(
            build_device(&cfg),
            Err(DevError::DuplicateName { kind: EntryKind::Attribute, .. })
        ));
    }

    #[test]
    fn guard_config_narrows_gating() {
        let cfg = Config {
            guard: GuardConfig {
                gated: Some(vec![OperationKind::Execute, OperationKind::Configure]),
                ..GuardConfig::default()
            },
            ..Config::default()
        };
        let device = build_device(&cfg).unwrap();
        device.busy_state().set(true);
        assert!(device.read_attribute("State").is_ok());
        assert!(device.execute("Add_dynamic", DevArg::Void).is_err());
        // The builtin unlock command survives a config that leaves it unset.
        device.execute("Unlock", DevArg::Void).unwrap();
        assert!(!device.busy_state().is_busy());
    }

    #[tokio::test]
    async fn heartbeat_loop_evicts_silent_subscribers() {
        let device = build_device(&Config::default()).unwrap();
        let _sub = device.subscribe("silent", [dynadev_types::EventCategory::Heartbeat]);
        let task = tokio::spawn(heartbeat_loop(Arc::clone(&device), Duration::from_millis(10)));
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(device.dispatcher().subscriber_count(), 0);
        task.abort();
    }
}
