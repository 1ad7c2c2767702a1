//! ---
//! mppt_section: "01-core-functionality"
//! mppt_subsection: "binary"
//! mppt_type: "source"
//! mppt_scope: "code"
//! mppt_description: "Binary entrypoint for the R-MPPT daemon."
//! mppt_version: "v0.0.0-prealpha"
//! mppt_owner: "tbd"
//! ---
mod rt;
mod sink;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use r_mppt_common::time::jitter_us;
use r_mppt_common::{init_tracing, AppConfig};
use r_mppt_core::{
    Clock, ControlCore, DailyStatsSink, SnapshotPublisher, SystemState, TracingStatsSink,
};
use r_mppt_sim::{SimulatedClock, Simulation};
use tokio::signal;
use tracing::{info, warn};

use crate::rt::{wall_period, RateLimiter};
use crate::sink::{export_history, CsvStatsSink};

#[derive(Debug, Parser)]
#[command(
    author,
    version = concat!("R-MPPT ", env!("CARGO_PKG_VERSION")),
    about = "R-MPPT charge controller daemon",
    long_about = None
)]
struct Cli {
    #[arg(
        long,
        value_name = "FILE",
        env = "R_MPPT_CONFIG",
        help = "Path to configuration file"
    )]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the control loop against the simulated plant")]
    Run(RunArgs),
    #[command(about = "List the battery profiles and the active selection")]
    Profiles,
    #[command(about = "Validate the configuration and print it as JSON")]
    CheckConfig,
}

#[derive(Debug, Default, clap::Args)]
struct RunArgs {
    #[arg(long, help = "Stop after this many control cycles")]
    cycles: Option<u64>,

    #[arg(long, help = "Override simulation.speedup")]
    speedup: Option<f64>,

    #[arg(long, value_name = "FILE", help = "Export the telemetry history on shutdown")]
    history_csv: Option<PathBuf>,

    #[arg(long, value_name = "FILE", help = "Append finished days to this CSV file")]
    daily_csv: Option<PathBuf>,

    #[arg(
        long,
        default_value_t = 10,
        help = "Seconds between status lines, in simulated time"
    )]
    status_every: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/mpptd.sim.toml"));

    let loaded = match AppConfig::load_with_source(&candidates) {
        Ok(loaded) => Some(loaded),
        Err(err) if cli.config.is_none() => {
            eprintln!("{err:#}; falling back to built-in defaults");
            None
        }
        Err(err) => return Err(err),
    };
    let (mut config, source) = match loaded {
        Some(loaded) => (loaded.config, Some(loaded.source)),
        None => (AppConfig::default(), None),
    };

    match cli.command.unwrap_or(Commands::Run(RunArgs {
        status_every: 10,
        ..RunArgs::default()
    })) {
        Commands::Run(args) => {
            if let Some(speedup) = args.speedup {
                config.simulation.speedup = speedup;
                config.validate()?;
            }
            init_tracing("r-mpptd", &config.logging)?;
            if let Some(path) = &source {
                info!(config_path = %path.display(), "configuration loaded");
            }
            run_daemon(config, args).await?
        }
        Commands::Profiles => {
            let core = ControlCore::new(&config, Local::now().date_naive())?;
            let selected = core.catalog().selected();
            for (battery_type, profile) in core.catalog().iter() {
                let marker = if battery_type == selected { '*' } else { ' ' };
                println!(
                    "{marker} {:<10} bulk {:>5.2} V  absorption {:>5.2} V  float {:>5.2} V  max {:>5.1} A  absorb {:>4} min  eq {}",
                    profile.name,
                    profile.bulk_voltage,
                    profile.absorption_voltage,
                    profile.float_voltage,
                    profile.max_charge_current,
                    profile.absorption_time.as_secs() / 60,
                    if profile.use_equalization {
                        format!("{:.2} V", profile.equalization_voltage)
                    } else {
                        "off".to_owned()
                    },
                );
            }
        }
        Commands::CheckConfig => {
            config.validate()?;
            ControlCore::new(&config, Local::now().date_naive())?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

async fn run_daemon(config: AppConfig, args: RunArgs) -> Result<()> {
    let tick = config.controller.tick_interval;
    let speedup = config.simulation.speedup;
    let clock = SimulatedClock::realtime(
        speedup,
        Local::now().date_naive(),
        config.simulation.start_hour,
    );
    let mut sim = Simulation::from_config(&config)?;
    let plant = sim.handle();

    let stats_sink: Box<dyn DailyStatsSink + Send> = match &args.daily_csv {
        Some(path) => Box::new(CsvStatsSink::open(path)?),
        None => Box::new(TracingStatsSink),
    };
    let publisher = SnapshotPublisher::new();
    let mut core = ControlCore::new(&config, clock.today())
        .context("failed to build control core")?
        .with_stats_sink(stats_sink)
        .with_publisher(publisher.clone());

    sim.advance(clock.monotonic());
    let offsets = core.initialize(&mut plant.zero_inputs())?;
    info!(
        current = offsets.current,
        panel_voltage = offsets.panel_voltage,
        battery_voltage = offsets.battery_voltage,
        profile = %core.profile().name,
        "controller initialized"
    );

    let status_every = Duration::from_secs(args.status_every.max(1));
    let status = tokio::spawn(report_status(
        publisher,
        wall_period(status_every, speedup),
    ));

    let mut sensor = plant.sensor();
    let mut actuator = plant.actuator();
    let period = wall_period(tick, speedup);
    let mut limiter = RateLimiter::new(period);
    let mut last_tick = None;
    let mut cycles = 0_u64;
    info!(
        tick_ms = tick.as_millis() as u64,
        speedup,
        "control loop running; waiting for termination signal"
    );
    loop {
        tokio::select! {
            at = limiter.tick() => {
                if let Some(previous) = last_tick.replace(at) {
                    let jitter = jitter_us(at - previous, period);
                    if jitter.unsigned_abs() as u128 > period.as_micros() / 2 {
                        warn!(jitter_us = jitter, "control tick overran");
                    }
                }
            }
            result = signal::ctrl_c() => {
                result?;
                info!("ctrl-c received; shutting down");
                break;
            }
        }
        sim.advance(clock.monotonic());
        let report = core.cycle(&mut sensor, &mut actuator, &clock);
        if let Some(transition) = &report.transition {
            info!(from = %transition.from, to = %transition.to, cycle = report.cycle, "system transition");
        }
        if report.system_state == SystemState::Fault && report.transition.is_some() {
            warn!(flags = %core.state().error_flags, "controller faulted");
        }
        cycles += 1;
        if args.cycles.is_some_and(|limit| cycles >= limit) {
            info!(cycles, "cycle limit reached");
            break;
        }
    }
    status.abort();

    if let Some(path) = &args.history_csv {
        export_history(core.history(), path)?;
    }
    let today = core.daily_stats();
    info!(
        date = %today.date,
        energy_wh = today.total_energy_wh,
        max_power = today.max_power,
        charge_cycles = today.charge_cycles,
        "daemon stopped"
    );
    Ok(())
}

async fn report_status(publisher: SnapshotPublisher, period: Duration) {
    let mut limiter = RateLimiter::new(period);
    loop {
        limiter.tick().await;
        let Some(snapshot) = publisher.latest() else {
            continue;
        };
        let state = &snapshot.state;
        info!(
            cycle = state.cycle,
            system = %state.system_state,
            phase = %state.charge_phase,
            mppt = %state.mppt_state,
            protection = %state.protection_state,
            duty = state.command.duty,
            panel_power = state.reading.panel_power,
            battery_voltage = state.reading.battery_voltage,
            battery_current = state.reading.battery_current,
            energy_wh = snapshot.daily.total_energy_wh,
            "status"
        );
    }
}
