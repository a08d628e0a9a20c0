mod classify;
mod config;
mod escalation;
mod logging;
mod monitor;
mod process;
mod stats;

use clap::Parser;
use config::{MonitorConfig, MonitorParams, ParamValue};
use std::path::PathBuf;
use std::process::ExitCode;

/// Kill Passenger workers whose resident memory exceeds a limit.
///
/// Performs one check pass and exits; schedule it with cron or a systemd
/// timer. Bloated workers get SIGUSR1, and SIGTERM if they are still running
/// after the wait time.
#[derive(Parser, Debug)]
#[command(name = "passenger-monitor", version, about)]
pub struct Cli {
    /// Config file path (a missing file means all defaults)
    #[arg(short, long, default_value = "passenger-monitor.toml")]
    config: PathBuf,

    /// Memory limit per worker in MB (overrides config)
    #[arg(long)]
    memory_limit: Option<String>,

    /// Log file path (overrides config)
    #[arg(long)]
    log_file: Option<String>,

    /// Seconds to wait after the graceful signal (overrides config)
    #[arg(long)]
    wait_time: Option<String>,

    /// Regex selecting worker lines in the stats output (overrides config)
    #[arg(long)]
    process_name_regex: Option<String>,

    /// Command that prints worker memory stats (overrides config)
    #[arg(long)]
    stats_command: Option<String>,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (state transitions, skipped lines)
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    /// CLI flags as params; unset flags stay absent so lower layers apply.
    fn params(&self) -> MonitorParams {
        MonitorParams {
            memory_limit: self.memory_limit.as_deref().map(ParamValue::from),
            log_file: self.log_file.clone(),
            wait_time: self.wait_time.as_deref().map(ParamValue::from),
            process_name_regex: self.process_name_regex.clone(),
            stats_command: self.stats_command.clone(),
        }
    }
}

fn resolve_config(cli: &Cli) -> Result<MonitorConfig, config::ConfigError> {
    let params = config::load_params(&cli.config)?.merge(cli.params());
    MonitorConfig::resolve(&params)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match resolve_config(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("passenger-monitor: {e}");
            return ExitCode::from(1);
        }
    };

    if cli.dry_run {
        println!("passenger-monitor v{}", env!("CARGO_PKG_VERSION"));
        println!("memory_limit:       {} MB", config.memory_limit_mb);
        println!("log_file:           {}", config.log_file.display());
        println!("wait_time:          {}s", config.wait_time.as_secs_f64());
        println!("process_name_regex: {}", config.process_name_regex);
        println!("stats_command:      {}", config.stats_command.join(" "));
        println!("Dry run mode: config validated, not running.");
        return ExitCode::SUCCESS;
    }

    if let Err(e) = logging::init(&config.log_file, cli.verbose) {
        eprintln!("passenger-monitor: {e}");
        return ExitCode::from(1);
    }

    match monitor::run(config).await {
        Ok(report) if report.has_failures() => ExitCode::from(2),
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(severity = "fatal", error = %e, "check pass aborted");
            ExitCode::from(1)
        }
    }
}
