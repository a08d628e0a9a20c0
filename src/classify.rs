use crate::stats::WorkerObservation;
use tracing::error;

/// Decide whether a worker exceeds the memory limit.
///
/// The comparison is strict: a worker sitting exactly at the limit is left
/// alone. Only a positive result is logged.
pub fn is_bloated(observation: &WorkerObservation, limit_mb: f64) -> bool {
    let bloated = observation.memory_usage_mb > limit_mb;
    if bloated {
        error!(
            pid = observation.pid,
            usage_mb = observation.memory_usage_mb,
            limit_mb,
            "found bloated worker: {} - {}MB",
            observation.pid,
            observation.memory_usage_mb
        );
    }
    bloated
}
