/// Worker discovery: run the external stats command and turn its text output
/// into per-worker observations.
///
/// Each stats record is one whitespace-separated line:
///
/// ```text
///   25096  637.9 MB   165.4 MB  Passenger RubyApp: /srv/app
/// ```
///
/// Field 0 is the pid and field 3 the resident memory in MB. Everything else
/// on the line is ignored.
use regex::Regex;
use std::future::Future;
use std::process::Stdio;
use tokio::process::Command;

const PID_FIELD: usize = 0;
const USAGE_FIELD: usize = 3;

/// One matched worker line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorkerObservation {
    pub pid: i32,
    pub memory_usage_mb: f64,
}

/// Parse a single stats line.
///
/// Returns `Ok(None)` when the line does not match `pattern` (headers,
/// summaries, other process types). A matching line whose pid or usage
/// field cannot be read is an error.
pub fn parse_line(line: &str, pattern: &Regex) -> Result<Option<WorkerObservation>, ParseError> {
    if !pattern.is_match(line) {
        return Ok(None);
    }

    let fields: Vec<&str> = line.split_whitespace().collect();
    let pid_field = fields.get(PID_FIELD).ok_or(ParseError::MissingField { field: "pid" })?;
    let usage_field = fields
        .get(USAGE_FIELD)
        .ok_or(ParseError::MissingField { field: "memory usage" })?;

    // kill(2) treats 0 and negative pids as process groups.
    let pid = match pid_field.parse::<i32>() {
        Ok(pid) if pid > 0 => pid,
        _ => {
            return Err(ParseError::InvalidPid {
                value: pid_field.to_string(),
            })
        }
    };

    let memory_usage_mb = match usage_field.parse::<f64>() {
        Ok(mb) if mb.is_finite() && mb >= 0.0 => mb,
        _ => {
            return Err(ParseError::InvalidUsage {
                value: usage_field.to_string(),
            })
        }
    };

    Ok(Some(WorkerObservation {
        pid,
        memory_usage_mb,
    }))
}

/// A matched stats line that could not be decomposed into pid and usage.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseError {
    MissingField { field: &'static str },
    InvalidPid { value: String },
    InvalidUsage { value: String },
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::MissingField { field } => write!(f, "missing {field} field"),
            ParseError::InvalidPid { value } => write!(f, "invalid pid '{value}'"),
            ParseError::InvalidUsage { value } => write!(f, "invalid memory usage '{value}'"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Produces the raw stats text, one worker per line.
pub trait StatsSource {
    fn fetch(&self) -> impl Future<Output = Result<String, StatsError>> + Send;
}

/// Runs an external command (no shell) and returns its stdout.
#[derive(Debug, Clone)]
pub struct CommandStats {
    program: String,
    args: Vec<String>,
}

impl CommandStats {
    /// Build from a command line already split into program and arguments.
    pub fn new(command: &[String]) -> Result<Self, StatsError> {
        let (program, args) = command.split_first().ok_or(StatsError::EmptyCommand)?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }

    fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl StatsSource for CommandStats {
    async fn fetch(&self) -> Result<String, StatsError> {
        tracing::debug!(command = %self.display(), "running stats command");

        let output = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| StatsError::Spawn {
                command: self.display(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(StatsError::CommandFailed {
                command: self.display(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        String::from_utf8(output.stdout).map_err(|e| StatsError::InvalidUtf8 {
            command: self.display(),
            source: e,
        })
    }
}

/// Failure to obtain stats text. Aborts the whole check pass.
#[derive(Debug)]
pub enum StatsError {
    EmptyCommand,
    Spawn {
        command: String,
        source: std::io::Error,
    },
    /// The command ran but exited unsuccessfully (`code` is None if signalled).
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
    InvalidUtf8 {
        command: String,
        source: std::string::FromUtf8Error,
    },
}

impl std::fmt::Display for StatsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatsError::EmptyCommand => write!(f, "no stats command configured"),
            StatsError::Spawn { command, source } => {
                write!(f, "failed to run stats command '{command}': {source}")
            }
            StatsError::CommandFailed {
                command,
                code,
                stderr,
            } => {
                let code = code.map_or_else(|| "signal".to_string(), |c| c.to_string());
                write!(
                    f,
                    "stats command '{command}' failed (exit {code}):\n{}",
                    stderr.lines().take(10).collect::<Vec<_>>().join("\n")
                )
            }
            StatsError::InvalidUtf8 { command, source } => {
                write!(f, "stats command '{command}' produced invalid UTF-8: {source}")
            }
        }
    }
}

impl std::error::Error for StatsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StatsError::Spawn { source, .. } => Some(source),
            StatsError::InvalidUtf8 { source, .. } => Some(source),
            StatsError::EmptyCommand | StatsError::CommandFailed { .. } => None,
        }
    }
}
