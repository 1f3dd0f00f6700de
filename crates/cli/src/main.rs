// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use eab::commands;
use eab::config::Config;

#[derive(Parser)]
#[command(name = "eab", version, about = "Embedded Agent Bridge serial daemon.")]
struct Cli {
    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    subcommand: Option<Commands>,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// List available serial ports.
    ListPorts,
    /// Show the daemon's status for this device.
    Status,
    /// Stop a running daemon.
    Stop,
    /// Pause the daemon, releasing the serial port for flashing.
    Pause {
        /// Seconds until the daemon auto-resumes.
        #[arg(long, default_value = "30")]
        seconds: u64,
    },
    /// Queue a command for the device (use ! prefix for device control).
    Cmd { command: String },
    /// Queue a hard reset (!RESET).
    Reset,
    /// Wait for a regex to appear in the session log.
    WaitFor {
        pattern: String,
        #[arg(long, default_value = "30")]
        timeout: u64,
    },
    /// List registered devices.
    Devices,
    /// Register a device without starting a daemon.
    Register {
        name: String,
        #[arg(long, default_value = "debug")]
        device_type: String,
        #[arg(long, default_value = "")]
        chip: String,
    },
    /// Remove a device's session directory.
    Unregister { name: String },
}

/// Initialize tracing from config.
///
/// Priority: --log-level / EAB_LOG_LEVEL > RUST_LOG > "info". Uses
/// `try_init` so repeated calls (tests) are harmless.
fn init_tracing(config: &Config) {
    use tracing_subscriber::fmt;

    let filter = if std::env::var("EAB_LOG_LEVEL").is_err() && config.log_level == "info" {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level))
    } else {
        EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let result = match config.log_format.as_str() {
        "json" => fmt::fmt().with_env_filter(filter).json().try_init(),
        _ => fmt::fmt().with_env_filter(filter).try_init(),
    };
    drop(result);
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = cli.config;

    if let Err(e) = config.validate() {
        eprintln!("error: {e}");
        std::process::exit(2);
    }

    init_tracing(&config);

    let code = match cli.subcommand {
        Some(Commands::ListPorts) => commands::list_ports(),
        Some(Commands::Status) => commands::show_status(&config),
        Some(Commands::Stop) => commands::stop_daemon(&config).await,
        Some(Commands::Pause { seconds }) => unwrap_code(commands::pause_daemon(&config, seconds)),
        Some(Commands::Cmd { command }) => unwrap_code(commands::send_command(&config, &command)),
        Some(Commands::Reset) => unwrap_code(commands::send_command(&config, "!RESET")),
        Some(Commands::WaitFor { pattern, timeout }) => unwrap_code(
            commands::wait_for_pattern(
                &config,
                &pattern,
                std::time::Duration::from_secs(timeout),
            )
            .await,
        ),
        Some(Commands::Devices) => commands::list_devices(&config),
        Some(Commands::Register { name, device_type, chip }) => {
            unwrap_code(commands::register(&config, &name, &device_type, &chip))
        }
        Some(Commands::Unregister { name }) => commands::unregister(&config, &name),
        None => match eab::daemon::run(config).await {
            Ok(()) => 0,
            Err(e) => {
                error!("fatal: {e:#}");
                1
            }
        },
    };

    std::process::exit(code);
}

fn unwrap_code(result: anyhow::Result<i32>) -> i32 {
    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            1
        }
    }
}
