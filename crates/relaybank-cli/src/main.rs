//! `relaybank` – relay bank controller daemon.
//!
//! 1. Initialises tracing (console or JSON, optional OTLP export).
//! 2. Loads `~/.relaybank/config.toml` (defaults when absent).
//! 3. Claims the GPIO lines and forces every relay off before serving.
//! 4. Serves the JSON control API until **Ctrl-C** / SIGTERM, then forces
//!    every relay off again and releases the lines.
//!
//! `relaybank init` writes the default configuration and exits.

mod config;
mod telemetry;

use std::process::ExitCode;
use std::sync::Arc;

use colored::Colorize;
use relaybank_api::ApiServer;
use relaybank_hal::{LineDriver, SimLineDriver, SysfsLineDriver};
use relaybank_kernel::SwitchEngine;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use config::{Config, DriverKind};

fn main() -> ExitCode {
    let guard = telemetry::init_tracing("relaybank");
    if guard.exporting() {
        info!("exporting spans over OTLP");
    }

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        None | Some("run") => {}
        Some("init") => return write_default_config(),
        Some("help" | "-h" | "--help") => {
            print_usage();
            return ExitCode::SUCCESS;
        }
        Some(other) => {
            eprintln!("{} unknown command '{}'", "error:".red().bold(), other);
            print_usage();
            return ExitCode::FAILURE;
        }
    }

    print_banner();

    let cfg = match config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{}: {}", "Config error".red(), e);
            return ExitCode::FAILURE;
        }
    };
    println!(
        "  Config   {}",
        config::config_path().display().to_string().bold()
    );
    println!("  Driver   {}", cfg.driver.to_string().bold());
    println!("  Settle   {} ms", cfg.settle_ms);

    let engine = match build_engine(&cfg) {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            eprintln!("{}: {}", "Config error".red(), e);
            return ExitCode::FAILURE;
        }
    };

    // Fail-safe start: nothing is served until every relay is confirmed off.
    match engine.initialize() {
        Ok(report) => println!(
            "  {} all {} relays off",
            "✓".green(),
            report.outcomes.len()
        ),
        Err(e) => {
            error!(error = %e, "hardware initialisation failed");
            eprintln!("{}: {}", "Hardware error".red().bold(), e);
            return ExitCode::FAILURE;
        }
    }

    let stop = Arc::new(Notify::new());
    let stop_signal = Arc::clone(&stop);
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Shutdown requested – turning every relay off …".yellow().bold());
        stop_signal.notify_one();
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; relays are released only on normal exit");
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}: {}", "Runtime error".red(), e);
            return shutdown(&engine, ExitCode::FAILURE);
        }
    };

    let server = ApiServer::new(Arc::clone(&engine))
        .with_addr(cfg.listen_addr)
        .with_port(cfg.http_port);
    println!(
        "  API      {}\n",
        format!("http://{}", server.socket_addr()).cyan()
    );

    let served = runtime.block_on(server.run_until(async move { stop.notified().await }));
    let code = match served {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "API server failed");
            eprintln!("{}: {}", "Server error".red(), e);
            ExitCode::FAILURE
        }
    };
    shutdown(&engine, code)
}

/// Build the engine described by `cfg`.  The hardware is not touched yet.
fn build_engine(cfg: &Config) -> Result<SwitchEngine, String> {
    let registry = cfg.registry()?;
    let driver: Box<dyn LineDriver> = match cfg.driver {
        DriverKind::Sim => Box::new(SimLineDriver::new()),
        DriverKind::Sysfs => Box::new(SysfsLineDriver::new(cfg.gpio_root.clone())),
    };
    Ok(SwitchEngine::new(registry, driver).with_settle(cfg.settle()))
}

/// Force every relay off, release the lines and report.
fn shutdown(engine: &SwitchEngine, code: ExitCode) -> ExitCode {
    match engine.shutdown() {
        Ok(report) if report.all_confirmed() => {
            println!("{}", "  ✓ All relays off. Lines released.".green());
            code
        }
        Ok(report) => {
            let failed: Vec<String> = report.failed().iter().map(ToString::to_string).collect();
            eprintln!(
                "{} channels {} did not confirm off",
                "⚠".red().bold(),
                failed.join(", ")
            );
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("{}: {}", "Shutdown error".red(), e);
            ExitCode::FAILURE
        }
    }
}

fn write_default_config() -> ExitCode {
    match config::save(&Config::default()) {
        Ok(path) => {
            println!("  Wrote default configuration to {}", path.display().to_string().bold());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{}: {}", "Config error".red(), e);
            ExitCode::FAILURE
        }
    }
}

fn print_usage() {
    println!("Usage: relaybank [run | init | help]");
    println!();
    println!("  run    claim the relay bank and serve the control API (default)");
    println!("  init   write the default configuration file");
}

fn print_banner() {
    println!();
    println!("{}", "  ╔══════════════════════════════╗".cyan());
    println!("{}", "  ║   RelayBank  controller      ║".cyan().bold());
    println!("{}", "  ╚══════════════════════════════╝".cyan());
    println!();
}
