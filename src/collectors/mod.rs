pub mod system;

use crate::snapshot::MetricsSnapshot;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

pub use system::SysinfoSource;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("metrics source is unavailable: {0}")]
    Unavailable(String),
    #[error("sampling task failed: {0}")]
    Join(String),
}

/// Produces host metrics. Calls block on OS queries and may take up to about
/// a second (CPU usage needs two samples), so async callers go through
/// `spawn_blocking`.
pub trait MetricsSource: Send + Sync {
    fn sample(&self) -> Result<MetricsSnapshot, SourceError>;

    /// Usage per logical core, in core order.
    fn cpu_per_core(&self) -> Result<Vec<f64>, SourceError>;

    fn swap(&self) -> Result<SwapStat, SourceError>;

    /// Busiest processes, ordered by CPU then memory, at most `limit`.
    fn top_processes(&self, limit: usize) -> Result<Vec<ProcessStat>, SourceError>;

    /// Non-loopback interfaces with their cumulative counters and first
    /// IPv4 address.
    fn interfaces(&self) -> Result<Vec<InterfaceStat>, SourceError>;
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SwapStat {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
    pub usage_percent: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessStat {
    pub pid: u32,
    pub name: String,
    /// Normalised to the whole machine, 0..100.
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct InterfaceStat {
    pub name: String,
    pub recv_bytes: u64,
    pub sent_bytes: u64,
    pub up: Option<bool>,
    pub speed_mbps: Option<u64>,
    pub ipv4: Option<String>,
}

/// Takes a snapshot on the blocking pool.
pub async fn sample_blocking(
    source: &Arc<dyn MetricsSource>,
) -> Result<MetricsSnapshot, SourceError> {
    let source = Arc::clone(source);
    tokio::task::spawn_blocking(move || source.sample())
        .await
        .map_err(|e| SourceError::Join(e.to_string()))?
}

/// Orders by CPU, then memory, both descending, and keeps `limit` entries.
pub fn rank_processes(mut procs: Vec<ProcessStat>, limit: usize) -> Vec<ProcessStat> {
    procs.sort_by(|a, b| {
        b.cpu_percent
            .total_cmp(&a.cpu_percent)
            .then(b.memory_percent.total_cmp(&a.memory_percent))
    });
    procs.truncate(limit);
    procs
}


#[cfg(test)]
mod tests {
    use super::*;

    fn proc(pid: u32, cpu: f64, mem: f64) -> ProcessStat {
        ProcessStat {
            pid,
            name: format!("p{pid}"),
            cpu_percent: cpu,
            memory_percent: mem,
        }
    }

    #[test]
    fn processes_rank_by_cpu_then_memory() {
        let ranked = rank_processes(
            vec![proc(1, 5.0, 1.0), proc(2, 5.0, 9.0), proc(3, 50.0, 0.0), proc(4, 0.0, 90.0)],
            3,
        );
        let pids: Vec<u32> = ranked.iter().map(|p| p.pid).collect();
        assert_eq!(pids, vec![3, 2, 1]);
    }
}
