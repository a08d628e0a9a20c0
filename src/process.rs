/// OS process control: signal delivery and liveness checks by pid.
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

/// The two signals the escalation protocol sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    /// Catchable shutdown request (SIGUSR1). Passenger workers finish their
    /// current request and exit.
    GracefulShutdown,
    /// SIGTERM.
    ForceTerminate,
}

impl SignalKind {
    pub fn signal(self) -> Signal {
        match self {
            SignalKind::GracefulShutdown => Signal::SIGUSR1,
            SignalKind::ForceTerminate => Signal::SIGTERM,
        }
    }
}

/// Result of a signal send that did not fail outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// The pid no longer exists (ESRCH).
    NoSuchProcess,
}

/// Signal delivery and liveness checks, shared by all escalation tasks.
pub trait ProcessControl: Send + Sync + 'static {
    fn send_signal(&self, pid: i32, kind: SignalKind) -> Result<Delivery, SignalError>;

    /// `false` only when the pid cannot be found.
    fn is_alive(&self, pid: i32) -> bool;
}

/// [`ProcessControl`] backed by `kill(2)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcesses;

impl ProcessControl for SystemProcesses {
    fn send_signal(&self, pid: i32, kind: SignalKind) -> Result<Delivery, SignalError> {
        match kill(Pid::from_raw(pid), kind.signal()) {
            Ok(()) => Ok(Delivery::Delivered),
            Err(Errno::ESRCH) => Ok(Delivery::NoSuchProcess),
            Err(errno) => Err(SignalError { pid, kind, errno }),
        }
    }

    fn is_alive(&self, pid: i32) -> bool {
        // Signal 0 probes existence; EPERM still means the process is there.
        !matches!(kill(Pid::from_raw(pid), None), Err(Errno::ESRCH))
    }
}

/// Sending a signal failed for a reason other than the process being gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalError {
    pub pid: i32,
    pub kind: SignalKind,
    pub errno: Errno,
}

impl std::fmt::Display for SignalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "failed to send {} to {}: {}",
            self.kind.signal(),
            self.pid,
            self.errno.desc()
        )
    }
}

impl std::error::Error for SignalError {}


#[cfg(test)]
mod tests {
    use super::*;
    use std::process::{Child, Command};

    fn spawn_sleeper() -> (Child, i32) {
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id() as i32;
        (child, pid)
    }

    #[test]
    fn test_signal_kinds_map_to_posix_signals() {
        assert_eq!(SignalKind::GracefulShutdown.signal(), Signal::SIGUSR1);
        assert_eq!(SignalKind::ForceTerminate.signal(), Signal::SIGTERM);
    }

    #[test]
    fn test_running_process_is_alive() {
        let (mut child, pid) = spawn_sleeper();
        assert!(SystemProcesses.is_alive(pid));
        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn test_reaped_process_is_not_alive() {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id() as i32;
        child.wait().unwrap();
        assert!(!SystemProcesses.is_alive(pid));
    }

    #[test]
    fn test_force_terminate_kills_process() {
        let (mut child, pid) = spawn_sleeper();
        let delivery = SystemProcesses
            .send_signal(pid, SignalKind::ForceTerminate)
            .unwrap();
        assert_eq!(delivery, Delivery::Delivered);

        let status = child.wait().unwrap();
        assert!(!status.success());
        assert!(!SystemProcesses.is_alive(pid));
    }

    #[test]
    fn test_signal_to_missing_process_is_tolerated() {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id() as i32;
        child.wait().unwrap();

        let delivery = SystemProcesses
            .send_signal(pid, SignalKind::GracefulShutdown)
            .unwrap();
        assert_eq!(delivery, Delivery::NoSuchProcess);
    }

    #[test]
    fn test_signal_error_display() {
        let err = SignalError {
            pid: 25096,
            kind: SignalKind::GracefulShutdown,
            errno: Errno::EPERM,
        };
        let msg = err.to_string();
        assert!(msg.contains("SIGUSR1"));
        assert!(msg.contains("25096"));
    }
}
