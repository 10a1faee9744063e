//! Automation runtime server
//!
//! Main entry point: loads `appdaemon.yaml` from the config directory, runs
//! the runtime until interrupted and maps failures onto exit codes.
//!
//! Usage:
//!   appdaemon -c /etc/appdaemon --log-level DEBUG

mod demo;

use ad_clock::{SharedClock, SystemClock, VirtualClock};
use ad_config::{AppDaemonConfig, ConfigError};
use ad_runtime::{AppDaemon, RuntimeError};
use anyhow::Context;
use chrono::Utc;
use clap::{Parser, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Real time between virtual clock steps
const WARP_STEP: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[command(name = "appdaemon")]
#[command(about = "Run home automation apps against a namespaced state store", version)]
struct Args {
    /// Directory holding appdaemon.yaml
    #[arg(short, long)]
    config: PathBuf,

    /// Accepted for compatibility; the process stays in the foreground
    #[arg(short, long)]
    daemon: bool,

    /// Write the process id here while running
    #[arg(short, long)]
    pidfile: Option<PathBuf>,

    /// Log level, overridden by RUST_LOG when set
    #[arg(short = 'D', long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    /// Only reload apps when asked to
    #[arg(long)]
    production: bool,

    /// Run time faster (or slower) than the wall clock
    #[arg(long)]
    timewarp: Option<f64>,

    /// Start the clock at this local time, "YYYY-MM-DD HH:MM:SS"
    #[arg(long)]
    starttime: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "UPPERCASE")]
enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    fn directive(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error | LogLevel::Critical => "error",
        }
    }
}

fn init_logging(level: LogLevel) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.directive()));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn load_config(args: &Args) -> Result<AppDaemonConfig, ConfigError> {
    let mut config = AppDaemonConfig::load(&args.config)?;
    if args.production {
        config.production_mode = true;
    }
    if let Some(timewarp) = args.timewarp {
        config.timewarp = timewarp;
    }
    if let Some(starttime) = &args.starttime {
        config.starttime = Some(starttime.clone());
    }
    config.validate()?;
    Ok(config)
}

/// Wall clock, or a virtual one when time is shifted or warped
fn build_clock(config: &AppDaemonConfig) -> Result<SharedClock, ConfigError> {
    let start = config.starttime()?;
    if start.is_none() && config.timewarp == 1.0 {
        return Ok(Arc::new(SystemClock));
    }
    let tz = config.tz()?;
    let start = start.map_or_else(Utc::now, |t| ad_scheduler::localize(tz, t));
    info!(start = %start.with_timezone(&tz), timewarp = config.timewarp, "Running on a virtual clock");

    let clock = VirtualClock::at(start);
    let driver = clock.clone();
    let step = chrono::Duration::milliseconds((WARP_STEP.as_millis() as f64 * config.timewarp) as i64);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(WARP_STEP);
        loop {
            ticker.tick().await;
            driver.advance(step);
        }
    });
    Ok(Arc::new(clock))
}

struct PidFile(PathBuf);

impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        std::fs::write(path, std::process::id().to_string())
            .with_context(|| format!("writing pid file {}", path.display()))?;
        Ok(Self(path.to_path_buf()))
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.0) {
            warn!(path = %self.0.display(), error = %e, "Unable to remove pid file");
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Unable to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.log_level);
    info!(version = env!("CARGO_PKG_VERSION"), "Starting automation runtime");

    if args.daemon {
        warn!("Daemon mode is not supported, staying in the foreground");
    }

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return ExitCode::from(1);
        }
    };
    let clock = match build_clock(&config) {
        Ok(clock) => clock,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return ExitCode::from(1);
        }
    };

    let _pidfile = match args.pidfile.as_deref().map(PidFile::create).transpose() {
        Ok(pidfile) => pidfile,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Unable to start");
            return ExitCode::from(2);
        }
    };

    let ad = match AppDaemon::with_clock(config, demo::registry(), clock).await {
        Ok(ad) => ad,
        Err(RuntimeError::Config(e)) => {
            error!(error = %e, "Invalid configuration");
            return ExitCode::from(1);
        }
        Err(e @ RuntimeError::UnknownPluginType { .. }) => {
            error!(error = %e, "Invalid configuration");
            return ExitCode::from(1);
        }
        Err(e) => {
            error!(error = %e, "Unable to start");
            return ExitCode::from(2);
        }
    };

    match ad.run_until(shutdown_signal()).await {
        Ok(()) => {
            info!("Shut down cleanly");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Fatal runtime error");
            ad.stop().await;
            ExitCode::from(2)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flags() {
        let args = Args::try_parse_from([
            "appdaemon",
            "-c",
            "/etc/appdaemon",
            "-D",
            "WARNING",
            "--production",
            "--timewarp",
            "10",
        ])
        .unwrap();
        assert_eq!(args.config, PathBuf::from("/etc/appdaemon"));
        assert_eq!(args.log_level, LogLevel::Warning);
        assert_eq!(args.log_level.directive(), "warn");
        assert!(args.production);
        assert_eq!(args.timewarp, Some(10.0));
        assert!(args.pidfile.is_none());
    }

    #[test]
    fn test_config_dir_required() {
        assert!(Args::try_parse_from(["appdaemon"]).is_err());
    }
}
