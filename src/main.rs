/*
 * This file is part of fan-service.
 *
 * Copyright (C) 2025 fan-service contributors
 *
 * fan-service is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * fan-service is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with fan-service. If not, see <https://www.gnu.org/licenses/>.
 */


use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};

use fan_service::bsp::{make_bsp, Bsp, BspOptions};
use fan_service::config::{resolve_config_path, BspType, ServiceConfig};
use fan_service::constants::defaults;
use fan_service::logger;
use fan_service::mokujin::{MokujinBsp, SimClock};
use fan_service::FanService;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "fan_service")]
#[command(version)]
#[command(about = "Closed-loop fan control for switch platforms")]
struct Cli {
    /// Config file (defaults to $FAN_SERVICE_CONFIG, then /etc/fan_service/fan_service.json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Event timeline replayed by the mokujin BSP
    #[arg(long)]
    mock_input: Option<PathBuf>,

    /// Seconds between check ticks
    #[arg(long, default_value_t = defaults::CHECK_INTERVAL_SECS)]
    check_interval: u64,

    /// tracing filter directive, e.g. "debug" or "fan_service=trace"
    #[arg(long)]
    log_level: Option<String>,

    /// Run one kickstart and one control cycle, print fan statuses, and exit
    #[arg(long)]
    once: bool,
}

/// Build the board; the mokujin clock is handed back so it can follow real time
fn build_bsp(config: &ServiceConfig, cli: &Cli) -> anyhow::Result<(Box<dyn Bsp>, Option<SimClock>)> {
    if config.bsp_type == BspType::Mokujin {
        let path = cli
            .mock_input
            .as_deref()
            .context("--mock-input is required for the mokujin BSP")?;
        let bsp = MokujinBsp::from_file(path)
            .with_context(|| format!("loading mokujin timeline {}", path.display()))?;
        let clock = bsp.clock();
        return Ok((Box::new(bsp), Some(clock)));
    }
    let options = BspOptions {
        mock_input: cli.mock_input.clone(),
    };
    Ok((make_bsp(config, &options)?, None))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let target = logger::init_logging(cli.log_level.as_deref());
    info!(version = VERSION, logging = target.as_str(), "fan_service starting");

    // SAFETY: geteuid has no preconditions and cannot fail
    if unsafe { libc::geteuid() } != 0 {
        warn!("Not running as root; sysfs writes will likely fail");
    }

    let config_path = resolve_config_path(cli.config.as_deref());
    let config = ServiceConfig::from_file(&config_path)
        .with_context(|| format!("loading config {}", config_path.display()))?;
    let (bsp, sim_clock) = build_bsp(&config, &cli)?;
    let mut service = FanService::new(config, bsp);

    service.kickstart();

    if cli.once {
        service.control_fan();
        for (name, status) in service.get_fan_statuses() {
            println!("{}", serde_json::to_string(&serde_json::json!({ "fan": name, "status": status }))?);
        }
        return Ok(());
    }

    let check_interval = Duration::from_secs(cli.check_interval.max(1));
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received SIGINT/SIGTERM, shutting down");
        flag.store(true, Ordering::SeqCst);
    }) {
        error!(error = %e, "Failed to set signal handler");
    }

    if let Some(clock) = sim_clock {
        let step = check_interval.as_secs();
        let stop = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(check_interval);
            while !stop.load(Ordering::SeqCst) {
                ticker.tick().await;
                clock.advance(step);
            }
        });
    }

    service.run(check_interval, shutdown).await;
    info!(cycles = service.control_cycles(), "fan_service stopped");
    Ok(())
}
