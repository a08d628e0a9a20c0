/// Two-phase kill protocol for a single bloated worker.
///
/// ```text
/// Pending -> GracefulSignalSent -> Waiting -> Resolved(Dead)
///                                          -> Resolved(ForceSignalSent)
/// ```
///
/// A graceful signal that finds no process short-circuits to `Resolved(Dead)`.
/// There is no retry after the forceful signal; a worker that survives it is
/// picked up again by the next check pass.
use crate::process::{Delivery, ProcessControl, SignalError, SignalKind};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// How an escalation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The worker exited, either on its own or after the graceful signal.
    Dead,
    /// The worker outlived the grace period and was sent SIGTERM.
    ForceSignalSent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationState {
    Pending,
    GracefulSignalSent,
    /// The grace period has elapsed; liveness not yet checked.
    Waiting,
    Resolved(Resolution),
}

pub struct EscalationWorker<P> {
    pid: i32,
    grace_period: Duration,
    control: Arc<P>,
    state: EscalationState,
}

impl<P: ProcessControl> EscalationWorker<P> {
    pub fn new(pid: i32, grace_period: Duration, control: Arc<P>) -> Self {
        Self {
            pid,
            grace_period,
            control,
            state: EscalationState::Pending,
        }
    }

    /// Drive the protocol to a resolved state.
    ///
    /// A signal delivery failure ends the task with an error; the worker's
    /// state is left where the failure happened.
    pub async fn run(mut self) -> Result<Resolution, SignalError> {
        loop {
            if let EscalationState::Resolved(resolution) = self.state {
                return Ok(resolution);
            }
            self.step().await?;
        }
    }

    /// Perform exactly one transition.
    async fn step(&mut self) -> Result<(), SignalError> {
        let pid = self.pid;
        let next = match self.state {
            EscalationState::Pending => {
                error!(pid, "trying to kill {pid} gracefully...");
                match self.control.send_signal(pid, SignalKind::GracefulShutdown)? {
                    Delivery::Delivered => EscalationState::GracefulSignalSent,
                    Delivery::NoSuchProcess => {
                        debug!(pid, "worker already exited before graceful signal");
                        EscalationState::Resolved(Resolution::Dead)
                    }
                }
            }
            EscalationState::GracefulSignalSent => {
                error!(
                    pid,
                    grace_secs = self.grace_period.as_secs_f64(),
                    "waiting for worker to shut down..."
                );
                tokio::time::sleep(self.grace_period).await;
                EscalationState::Waiting
            }
            EscalationState::Waiting => {
                if !self.control.is_alive(pid) {
                    debug!(pid, "worker exited within grace period");
                    EscalationState::Resolved(Resolution::Dead)
                } else {
                    error!(pid, severity = "fatal", "force kill: {pid}");
                    match self.control.send_signal(pid, SignalKind::ForceTerminate)? {
                        Delivery::Delivered => {
                            EscalationState::Resolved(Resolution::ForceSignalSent)
                        }
                        Delivery::NoSuchProcess => EscalationState::Resolved(Resolution::Dead),
                    }
                }
            }
            EscalationState::Resolved(_) => self.state,
        };

        debug!(pid, from = ?self.state, to = ?next, "escalation transition");
        self.state = next;
        Ok(())
    }
}
