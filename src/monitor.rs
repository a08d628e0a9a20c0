/// One check pass: discover workers, classify them, and escalate every
/// bloated one concurrently. Returns only after every escalation resolves.
use crate::classify::is_bloated;
use crate::config::MonitorConfig;
use crate::escalation::{EscalationWorker, Resolution};
use crate::process::{ProcessControl, SignalError, SystemProcesses};
use crate::stats::{parse_line, CommandStats, StatsError, StatsSource};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// What happened during a check pass.
#[derive(Debug, Default)]
pub struct CheckReport {
    pub lines_scanned: usize,
    pub workers_matched: usize,
    /// Matching lines whose pid or usage could not be parsed.
    pub malformed_lines: usize,
    /// One entry per escalation task that ran to completion, in completion order.
    pub escalations: Vec<(i32, Result<Resolution, SignalError>)>,
    /// Escalation tasks that panicked.
    pub panicked: usize,
}

impl CheckReport {
    pub fn has_failures(&self) -> bool {
        self.panicked > 0 || self.escalations.iter().any(|(_, r)| r.is_err())
    }
}

pub struct Monitor<S, P> {
    config: MonitorConfig,
    stats: S,
    control: Arc<P>,
}

impl Monitor<CommandStats, SystemProcesses> {
    /// Monitor that runs the configured stats command and signals real processes.
    pub fn from_config(config: MonitorConfig) -> Result<Self, MonitorError> {
        let stats = CommandStats::new(&config.stats_command)?;
        Ok(Self::new(config, stats, Arc::new(SystemProcesses)))
    }
}

impl<S: StatsSource, P: ProcessControl> Monitor<S, P> {
    pub fn new(config: MonitorConfig, stats: S, control: Arc<P>) -> Self {
        Self {
            config,
            stats,
            control,
        }
    }

    /// Run a single discovery-classify-escalate pass.
    ///
    /// A stats failure aborts the pass before anything is signalled.
    /// Failures inside one escalation are logged and recorded in the report
    /// without affecting the others.
    pub async fn check(&self) -> Result<CheckReport, MonitorError> {
        info!("checking bloated Passenger workers");

        let text = self.stats.fetch().await?;
        let mut report = CheckReport::default();
        let mut tasks = JoinSet::new();

        for line in text.lines() {
            report.lines_scanned += 1;

            let observation = match parse_line(line, &self.config.process_name_regex) {
                Ok(Some(obs)) => obs,
                Ok(None) => continue,
                Err(e) => {
                    warn!(line = line.trim(), error = %e, "skipping malformed worker line");
                    report.malformed_lines += 1;
                    continue;
                }
            };
            report.workers_matched += 1;

            if is_bloated(&observation, self.config.memory_limit_mb) {
                let pid = observation.pid;
                let worker =
                    EscalationWorker::new(pid, self.config.wait_time, Arc::clone(&self.control));
                tasks.spawn(async move { (pid, worker.run().await) });
            }
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((pid, Ok(resolution))) => {
                    tracing::debug!(pid, ?resolution, "escalation resolved");
                    report.escalations.push((pid, Ok(resolution)));
                }
                Ok((pid, Err(e))) => {
                    error!(pid, severity = "fatal", error = %e, "escalation failed");
                    report.escalations.push((pid, Err(e)));
                }
                Err(e) => {
                    error!(error = %e, "escalation task panicked");
                    report.panicked += 1;
                }
            }
        }

        info!(
            scanned = report.lines_scanned,
            matched = report.workers_matched,
            malformed = report.malformed_lines,
            escalated = report.escalations.len() + report.panicked,
            "finished checking for bloated Passenger workers"
        );
        Ok(report)
    }
}

/// Resolve the production monitor and run one pass.
pub async fn run(config: MonitorConfig) -> Result<CheckReport, MonitorError> {
    Monitor::from_config(config)?.check().await
}

/// Errors that abort a whole check pass.
#[derive(Debug)]
pub enum MonitorError {
    Stats(StatsError),
}

impl From<StatsError> for MonitorError {
    fn from(e: StatsError) -> Self {
        MonitorError::Stats(e)
    }
}

impl std::fmt::Display for MonitorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MonitorError::Stats(e) => write!(f, "could not read worker stats: {e}"),
        }
    }
}

impl std::error::Error for MonitorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MonitorError::Stats(e) => Some(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorParams;
    use crate::logging::capture::Capture;
    use crate::process::fake::{Event, FakeProcesses};
    use crate::process::SignalKind;
    use nix::errno::Errno;
    use std::io::{BufRead, BufReader};
    use std::os::unix::process::ExitStatusExt;
    use std::process::{Command, Stdio};
    use std::time::Duration;

    const THREE_WORKERS: &str = "
    25096  637.9 MB   165.4 MB  Passenger RubyApp:
    25097  637.9 MB   100.4 MB  Passenger RubyApp:
    25098  637.9 MB   120.4 MB  Passenger RubyApp:
  ";

    struct FixedStats(String);

    impl StatsSource for FixedStats {
        async fn fetch(&self) -> Result<String, StatsError> {
            Ok(self.0.clone())
        }
    }

    struct BrokenStats;

    impl StatsSource for BrokenStats {
        async fn fetch(&self) -> Result<String, StatsError> {
            Err(StatsError::EmptyCommand)
        }
    }

    /// Pids that were escalated, in completion order.
    fn escalated_pids(report: &CheckReport) -> Vec<i32> {
        report.escalations.iter().map(|(pid, _)| *pid).collect()
    }

    fn default_config() -> MonitorConfig {
        MonitorConfig::resolve(&MonitorParams::default()).unwrap()
    }

    fn monitor(stats: &str, control: &Arc<FakeProcesses>) -> Monitor<FixedStats, FakeProcesses> {
        Monitor::new(
            default_config(),
            FixedStats(stats.to_string()),
            Arc::clone(control),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_worker_over_limit_is_escalated() {
        let control = Arc::new(FakeProcesses::new());
        let report = monitor(THREE_WORKERS, &control).check().await.unwrap();

        assert_eq!(report.workers_matched, 3);
        assert_eq!(escalated_pids(&report), vec![25096]);
        assert_eq!(
            control.signals(),
            vec![(25096, SignalKind::GracefulShutdown)]
        );
        assert!(control.events_for(25097).is_empty());
        assert!(control.events_for(25098).is_empty());
        assert!(!report.has_failures());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bloated_survivor_is_force_killed() {
        let control = Arc::new(FakeProcesses::new().survivor(25096));
        let report = monitor(THREE_WORKERS, &control).check().await.unwrap();

        assert_eq!(
            control.events_for(25096),
            vec![
                Event::Signal(25096, SignalKind::GracefulShutdown),
                Event::AliveCheck(25096),
                Event::Signal(25096, SignalKind::ForceTerminate),
            ]
        );
        assert!(matches!(
            report.escalations[0],
            (25096, Ok(Resolution::ForceSignalSent))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_bloated_workers_sends_nothing() {
        let stats = "
        25096  637.9 MB   105.4 MB  Passenger RubyApp:
        25098  637.9 MB   120.4 MB  Passenger RubyApp:
        ";
        let control = Arc::new(FakeProcesses::new());
        let report = monitor(stats, &control).check().await.unwrap();

        assert_eq!(report.workers_matched, 2);
        assert!(report.escalations.is_empty());
        assert!(control.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmatched_and_malformed_lines_are_skipped() {
        let stats = "
---------- Passenger processes -----------
PID    VMSize    Private   Name
2301   219.5 MB  900.0 MB  PassengerAgent watchdog
oops   637.9 MB  500.0 MB  Passenger RubyApp:
4001   637.9 MB  n/a       Passenger RubyApp:
4002   637.9 MB  400.0 MB  Passenger RubyApp:
### Processes: 4
";
        let control = Arc::new(FakeProcesses::new());
        let report = monitor(stats, &control).check().await.unwrap();

        assert_eq!(report.malformed_lines, 2);
        assert_eq!(report.workers_matched, 1);
        assert_eq!(escalated_pids(&report), vec![4002]);
        assert!(control.events_for(2301).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_waits_for_all_escalations_concurrently() {
        let stats = "
        101  1.0 MB  300.0 MB  Passenger RubyApp:
        102  1.0 MB  310.0 MB  Passenger RubyApp:
        103  1.0 MB  320.0 MB  Passenger RubyApp:
        ";
        let control = Arc::new(
            FakeProcesses::new()
                .survivor(101)
                .survivor(102)
                .survivor(103),
        );
        let grace = default_config().wait_time;
        let start = tokio::time::Instant::now();
        let report = monitor(stats, &control).check().await.unwrap();
        let elapsed = start.elapsed();

        // Every task resolved before check returned.
        let mut pids = escalated_pids(&report);
        pids.sort();
        assert_eq!(pids, vec![101, 102, 103]);
        let forced = control
            .signals()
            .into_iter()
            .filter(|(_, kind)| *kind == SignalKind::ForceTerminate)
            .count();
        assert_eq!(forced, 3);

        // The waits overlapped instead of running back to back.
        assert!(elapsed >= grace);
        assert!(elapsed < grace * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_signal_failure_is_isolated_to_its_worker() {
        let stats = "
        201  1.0 MB  300.0 MB  Passenger RubyApp:
        202  1.0 MB  300.0 MB  Passenger RubyApp:
        ";
        let control = Arc::new(
            FakeProcesses::new()
                .failing(201, SignalKind::GracefulShutdown, Errno::EPERM)
                .survivor(202),
        );
        let report = monitor(stats, &control).check().await.unwrap();

        assert!(report.has_failures());
        assert_eq!(report.escalations.len(), 2);
        for (pid, result) in &report.escalations {
            match *pid {
                201 => assert_eq!(result.unwrap_err().errno, Errno::EPERM),
                202 => assert_eq!(*result, Ok(Resolution::ForceSignalSent)),
                other => panic!("unexpected pid {other}"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_limit_and_pattern() {
        let params = MonitorParams {
            memory_limit: Some("50".into()),
            process_name_regex: Some("sidekiq".to_string()),
            wait_time: Some("1".into()),
            ..Default::default()
        };
        let config = MonitorConfig::resolve(&params).unwrap();
        let stats = "
        301  1.0 MB  60.0 MB  sidekiq 6.5
        302  1.0 MB  50.0 MB  sidekiq 6.5
        303  1.0 MB  90.0 MB  Passenger RubyApp:
        ";
        let control = Arc::new(FakeProcesses::new());
        let monitor = Monitor::new(config, FixedStats(stats.to_string()), Arc::clone(&control));
        let report = monitor.check().await.unwrap();

        assert_eq!(escalated_pids(&report), vec![301]);
    }

    #[tokio::test]
    async fn test_stats_failure_aborts_pass() {
        let control = Arc::new(FakeProcesses::new());
        let monitor = Monitor::new(default_config(), BrokenStats, Arc::clone(&control));
        let err = monitor.check().await.unwrap_err();

        assert!(matches!(err, MonitorError::Stats(StatsError::EmptyCommand)));
        assert!(err.to_string().contains("could not read worker stats"));
        assert!(control.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bracketing_log_lines_come_first_and_last() {
        let (capture, _guard) = Capture::install(tracing::Level::INFO);

        let stats = "
        401  1.0 MB  300.0 MB  Passenger RubyApp:
        402  1.0 MB  300.0 MB  Passenger RubyApp:
        40377  1.0 MB  100.0 MB  Passenger RubyApp:
        40488  1.0 MB  900.0 MB  PassengerAgent watchdog
        ";
        let control = Arc::new(FakeProcesses::new().survivor(402));
        monitor(stats, &control).check().await.unwrap();

        let output = capture.output();
        let lines: Vec<&str> = output.lines().collect();
        assert!(lines.len() > 2);
        assert!(lines[0].contains("checking bloated Passenger workers"));
        assert!(lines[lines.len() - 1].contains("finished checking"));
        assert!(output.contains("found bloated worker: 401 - 300MB"));
        assert!(output.contains("force kill: 402"));
        assert!(!output.contains("force kill: 401"));
        // Below-limit and unmatched workers leave no trace in the log.
        assert!(!output.contains("40377"));
        assert!(!output.contains("40488"));
        assert!(control.events_for(40377).is_empty());
        assert!(control.events_for(40488).is_empty());
    }

    #[tokio::test]
    async fn test_run_force_kills_real_worker_ignoring_usr1() {
        let mut child = Command::new("sh")
            .args(["-c", "trap '' USR1; echo ready; exec sleep 30"])
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        let pid = child.id() as i32;

        // Wait until the trap is installed before anything is signalled.
        let mut ready = String::new();
        BufReader::new(child.stdout.take().unwrap())
            .read_line(&mut ready)
            .unwrap();
        assert_eq!(ready.trim(), "ready");

        let dir = tempfile::tempdir().unwrap();
        let stats_file = dir.path().join("stats.txt");
        std::fs::write(
            &stats_file,
            format!("{pid}  637.9 MB  300.0 MB  Passenger RubyApp: /srv/app\n"),
        )
        .unwrap();

        let params = MonitorParams {
            stats_command: Some(format!("cat {}", stats_file.display())),
            wait_time: Some("0.2".into()),
            ..Default::default()
        };
        let config = MonitorConfig::resolve(&params).unwrap();
        let report = run(config).await.unwrap();

        assert_eq!(report.escalations.len(), 1);
        assert!(matches!(
            report.escalations[0],
            (p, Ok(Resolution::ForceSignalSent)) if p == pid
        ));
        let status = child.wait().unwrap();
        assert_eq!(status.signal(), Some(nix::sys::signal::Signal::SIGTERM as i32));
    }

    #[test]
    fn test_report_without_escalations_has_no_failures() {
        assert!(!CheckReport::default().has_failures());
        let report = CheckReport {
            panicked: 1,
            ..Default::default()
        };
        assert!(report.has_failures());
    }

    #[test]
    fn test_wait_time_flows_into_config() {
        assert_eq!(default_config().wait_time, Duration::from_secs(10));
    }
}
