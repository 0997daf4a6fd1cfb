//! `mowguard` – MowGuard safety core binary
//!
//! 1. Loads `~/.mowguard/config.toml`, writing the defaults on first run.
//! 2. Starts the safety core: telemetry bus, ingest hub, safety loop,
//!    heartbeat watchdog, audit journal and push channel.
//! 3. Serves the WebSocket push channel and the HTTP control surface.
//! 4. Turns **Ctrl-C** into a latched emergency stop before shutting down.
//!
//! `--simulate` attaches scripted sensor producers so the core can be
//! exercised without hardware.

mod config;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use mowguard_cockpit::{CockpitServer, CockpitState};
use mowguard_kernel::ControlGate;
use mowguard_middleware::{ProducerEvent, RawReading, SimulatedProducer};
use mowguard_runtime::SafetyCore;
use mowguard_types::{MowError, ReadingValue, SensorClass, StopSource};
use tokio::sync::Notify;
use tracing::{error, info, warn};

const STOP_SETTLE_TIMEOUT: Duration = Duration::from_secs(2);

struct Args {
    simulate: bool,
}

fn parse_args() -> Option<Args> {
    let mut args = Args { simulate: false };
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--simulate" => args.simulate = true,
            "-h" | "--help" => {
                print_usage();
                return None;
            }
            other => {
                println!("{}: unknown argument {other}", "Error".red());
                print_usage();
                return None;
            }
        }
    }
    Some(args)
}

fn main() {
    let Some(args) = parse_args() else {
        return;
    };

    let _tracing = mowguard_runtime::init_tracing("mowguard");

    print_banner();

    let cfg = match config::load() {
        Ok(Some(cfg)) => {
            println!("  Config loaded from {}", config::config_path().display().to_string().bold());
            cfg
        }
        Ok(None) => {
            let mut cfg = config::Config::default();
            match config::save(&cfg) {
                Ok(()) => println!(
                    "  {} Default config written to {}",
                    "✓".green().bold(),
                    config::config_path().display().to_string().bold()
                ),
                Err(e) => println!("{}: {}", "Error saving config".red(), e),
            }
            config::apply_env_overrides(&mut cfg);
            if let Err(e) = cfg.validate() {
                println!("{}: {}", "Config error".red(), e);
                std::process::exit(2);
            }
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            std::process::exit(2);
        }
    };

    if cfg.journal_path.is_none() {
        warn!("no journal_path configured; audit journal is in memory and lost on exit");
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to build the Tokio runtime");
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(cfg, args)) {
        println!("{}: {}", "Fatal".red().bold(), e);
        std::process::exit(1);
    }
}

async fn run(cfg: config::Config, args: Args) -> Result<(), MowError> {
    println!();
    println!("{}", "  Starting MowGuard safety core …".bold());

    print!("  [1/4] Starting safety loop, watchdog and journal … ");
    let mut core = SafetyCore::start(cfg.core_config())?;
    println!("{}", "OK".green());

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let shutdown = Arc::new(Notify::new());
    let shutdown_signal = Arc::clone(&shutdown);
    let safety = core.safety().clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – latching emergency stop …".yellow().bold());
        match safety.request_stop_blocking(StopSource::OperatorSignal, "operator_signal") {
            Ok(()) => println!("{}", "  ✓ Emergency stop requested.".green()),
            Err(e) => println!("{}: {}", "  Emergency stop failed".red(), e),
        }
        shutdown_signal.notify_one();
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler; operator signal will not latch a stop");
    }

    print!("  [2/4] Starting push channel on port {} … ", cfg.bridge_port);
    let gateway = Arc::clone(core.gateway());
    let bridge_addr = SocketAddr::from(([0, 0, 0, 0], cfg.bridge_port));
    let bridge = tokio::spawn(async move {
        if let Err(e) = gateway.run_ws_server(bridge_addr).await {
            error!(error = %e, "push channel stopped");
        }
    });
    println!("{}", "OK".green());

    print!("  [3/4] Starting control surface on port {} … ", cfg.control_port);
    let gate = ControlGate::with_caps(cfg.blade_authorization(), cfg.speed_caps());
    let cockpit = CockpitServer::new(CockpitState::new(&core, gate)).with_port(cfg.control_port);
    let control = tokio::spawn(async move {
        if let Err(e) = cockpit.run().await {
            error!(error = %e, "control surface stopped");
        }
    });
    println!("{}", "OK".green());

    if args.simulate {
        print!("  [4/4] Attaching simulated sensors … ");
        attach_simulation(&mut core);
        println!("{}", "OK".green());
    } else {
        println!("  [4/4] No simulated sensors ({} to enable)", "--simulate".bold());
    }

    println!();
    println!(
        "  Control surface: {}",
        format!("http://localhost:{}/api/safety/status", cfg.control_port).cyan()
    );
    println!("  Push channel:    {}", format!("ws://localhost:{}", cfg.bridge_port).cyan());
    println!("  Press {} to latch an emergency stop and exit.", "Ctrl-C".bold());
    info!(state = %core.snapshot().state, "safety core running");

    shutdown.notified().await;

    // The handler only queues the stop; let it latch and reach the journal.
    match core.await_stop_recorded(STOP_SETTLE_TIMEOUT).await {
        Ok(snapshot) => info!(state = %snapshot.state, "emergency stop recorded"),
        Err(e) => error!(error = %e, "emergency stop not confirmed before shutdown"),
    }

    bridge.abort();
    control.abort();
    let final_state = core.snapshot().state;
    core.shutdown().await;
    println!("{} (final state {})", "  ✓ Exiting MowGuard.".green(), final_state);
    Ok(())
}

/// Scripted sensors that keep every interlock quiet.
fn attach_simulation(core: &mut SafetyCore) {
    let period = Duration::from_millis(200);

    let level = ReadingValue::Attitude {
        roll_deg: 2.0,
        pitch_deg: 1.5,
        yaw_deg: 90.0,
    };
    core.add_producer(
        SimulatedProducer::new(
            "sim_imu",
            SensorClass::Attitude,
            "imu",
            vec![ProducerEvent::Reading(RawReading::new(
                "sim_imu",
                SensorClass::Attitude,
                "imu",
                level,
            ))],
            period,
        )
        .repeating(),
    );

    core.add_producer(
        SimulatedProducer::new(
            "sim_sonar",
            SensorClass::Ranging,
            "front",
            vec![
                ProducerEvent::Reading(RawReading::new(
                    "sim_sonar",
                    SensorClass::Ranging,
                    "front",
                    ReadingValue::Range { distance_m: 2.4 },
                )),
                ProducerEvent::TransportError("simulated serial hiccup".to_string()),
                ProducerEvent::Reading(RawReading::new(
                    "sim_sonar",
                    SensorClass::Ranging,
                    "front",
                    ReadingValue::Range { distance_m: 1.1 },
                )),
            ],
            period,
        )
        .repeating(),
    );

    core.add_producer(
        SimulatedProducer::new(
            "sim_bms",
            SensorClass::Power,
            "battery",
            vec![ProducerEvent::Reading(RawReading::new(
                "sim_bms",
                SensorClass::Power,
                "battery",
                ReadingValue::Power {
                    voltage_v: 25.2,
                    current_a: 3.1,
                    battery_percent: 80,
                    battery_temp_c: 31.0,
                },
            ))],
            Duration::from_secs(1),
        )
        .repeating(),
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   __  ___              _____                     __"#.bold().green());
    println!("{}", r#"  /  |/  /__ _    __   / ___/_ _____ ________ ___/ /"#.bold().green());
    println!("{}", r#" / /|_/ / _ \ |/|/ /  / (_ / // / _ `/ __/ _ `/ _  / "#.bold().green());
    println!("{}", r#"/_/  /_/\___/__,__/   \___/\_,_/\_,_/_/  \_,_/\_,_/  "#.bold().green());
    println!();
    println!("  {}", "Lawn-mower safety core".dimmed());
    println!();
}

fn print_usage() {
    println!("Usage: mowguard [--simulate]");
    println!();
    println!("  --simulate   attach scripted sensor producers");
    println!("  -h, --help   show this help");
    println!();
    println!("Configuration is read from ~/.mowguard/config.toml (MOWGUARD_* env vars override).");
}
