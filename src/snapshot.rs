use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;

/// One point-in-time capture of every monitored metric.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub system: SystemInfo,
    pub cpu: CpuStat,
    pub memory: MemoryStat,
    pub disk: DiskStat,
    pub network: NetStat,
    pub gpu: Option<GpuStat>,
    pub temperatures: Vec<TempStat>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SystemInfo {
    pub host_name: Option<String>,
    pub platform: Option<String>,
    pub os_version: Option<String>,
    pub kernel_version: Option<String>,
    pub uptime_seconds: u64,
}

impl SystemInfo {
    pub fn uptime_hours(&self) -> f64 {
        round2(self.uptime_seconds as f64 / 3600.0)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CpuStat {
    pub usage_percent: f64,
    pub load_1: Option<f64>,
    pub load_5: Option<f64>,
    pub load_15: Option<f64>,
    pub physical_cores: Option<usize>,
    pub logical_cores: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MemoryStat {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub usage_percent: Option<f64>,
}

impl MemoryStat {
    pub fn new(total_bytes: u64, used_bytes: u64, available_bytes: u64) -> Self {
        Self {
            total_bytes,
            used_bytes,
            available_bytes,
            usage_percent: percent(used_bytes as f64, total_bytes as f64),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DiskStat {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
    pub usage_percent: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NetStat {
    pub sent_bytes: u64,
    pub recv_bytes: u64,
    pub packets_sent: u64,
    pub packets_recv: u64,
    pub errors: u64,
    pub drops: u64,
    pub sent_bytes_per_sec: f64,
    pub recv_bytes_per_sec: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GpuStat {
    pub index: u32,
    pub name: String,
    pub temperature_celsius: Option<f64>,
    pub usage_percent: Option<f64>,
    pub memory: GpuMemoryStat,
    pub power_draw_watts: Option<f64>,
    pub power_limit_watts: Option<f64>,
    pub fan_speed_percent: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GpuMemoryStat {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
    pub usage_percent: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TempStat {
    pub label: String,
    pub celsius: f64,
    pub critical_celsius: Option<f64>,
}

/// Raw cumulative interface counters, summed over all interfaces.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetCounters {
    pub sent_bytes: u64,
    pub recv_bytes: u64,
    pub packets_sent: u64,
    pub packets_recv: u64,
    pub errors_in: u64,
    pub errors_out: u64,
    pub drops_in: u64,
    pub drops_out: u64,
}

impl NetStat {
    /// Rates are averaged over the whole uptime, not over the last sample.
    pub fn from_counters(c: NetCounters, uptime_seconds: u64) -> Self {
        Self {
            sent_bytes: c.sent_bytes,
            recv_bytes: c.recv_bytes,
            packets_sent: c.packets_sent,
            packets_recv: c.packets_recv,
            errors: c.errors_in.saturating_add(c.errors_out),
            drops: c.drops_in.saturating_add(c.drops_out),
            sent_bytes_per_sec: rate(c.sent_bytes, uptime_seconds),
            recv_bytes_per_sec: rate(c.recv_bytes, uptime_seconds),
        }
    }
}

/// A mounted filesystem as reported by the OS, before aggregation.
#[derive(Debug, Clone)]
pub struct Partition {
    pub device: String,
    pub fs_type: String,
    pub mount_point: String,
    pub total_bytes: u64,
    pub free_bytes: u64,
}

const EXCLUDED_MOUNT_PREFIXES: [&str; 4] = ["/etc/", "/usr/", "/dev/", "/tmp/"];

const PSEUDO_FILESYSTEMS: [&str; 11] = [
    "tmpfs",
    "devtmpfs",
    "overlay",
    "squashfs",
    "proc",
    "sysfs",
    "cgroup",
    "cgroup2",
    "devpts",
    "autofs",
    "nsfs",
];

fn is_eligible(p: &Partition) -> bool {
    if EXCLUDED_MOUNT_PREFIXES
        .iter()
        .any(|prefix| p.mount_point.starts_with(prefix))
    {
        return false;
    }
    let fs = p.fs_type.to_ascii_lowercase();
    !PSEUDO_FILESYSTEMS.contains(&fs.as_str())
}

/// Sums partitions into one disk figure. Each (device, fs type) pair counts
/// once, so bind mounts of the same volume do not inflate the totals.
pub fn aggregate_disks(partitions: &[Partition]) -> DiskStat {
    let mut seen: HashSet<(&str, &str)> = HashSet::new();
    let mut total = 0_u64;
    let mut used = 0_u64;
    let mut free = 0_u64;

    for p in partitions.iter().filter(|p| is_eligible(p)) {
        if !seen.insert((p.device.as_str(), p.fs_type.as_str())) {
            continue;
        }
        total = total.saturating_add(p.total_bytes);
        free = free.saturating_add(p.free_bytes);
        used = used.saturating_add(p.total_bytes.saturating_sub(p.free_bytes));
    }

    DiskStat {
        total_bytes: total,
        used_bytes: used,
        free_bytes: free,
        usage_percent: percent(used as f64, total as f64),
    }
}

/// `used / total` as a percentage in 0..=100, or `None` when unmeasurable.
pub fn percent(used: f64, total: f64) -> Option<f64> {
    if !total.is_finite() || total <= 0.0 || !used.is_finite() {
        return None;
    }
    Some(round2(((used / total) * 100.0).clamp(0.0, 100.0)))
}

pub fn clamp_percent(v: f64) -> f64 {
    if v.is_finite() {
        round2(v.clamp(0.0, 100.0))
    } else {
        0.0
    }
}

pub fn rate(bytes: u64, seconds: u64) -> f64 {
    if seconds == 0 {
        return 0.0;
    }
    bytes as f64 / seconds as f64
}

pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

pub fn bytes_to_gb(bytes: u64) -> f64 {
    round2(bytes as f64 / 1024.0 / 1024.0 / 1024.0)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn snapshot(cpu: f64, ram: f64, disk: f64, gpu_mem: Option<f64>) -> MetricsSnapshot {
        let gib = 1024 * 1024 * 1024_u64;
        MetricsSnapshot {
            timestamp: Utc::now(),
            system: SystemInfo {
                host_name: Some("test-host".to_string()),
                platform: Some("Linux".to_string()),
                os_version: Some("22.04".to_string()),
                kernel_version: Some("6.1.0".to_string()),
                uptime_seconds: 7200,
            },
            cpu: CpuStat {
                usage_percent: cpu,
                load_1: Some(0.5),
                load_5: Some(0.4),
                load_15: Some(0.3),
                physical_cores: Some(4),
                logical_cores: 8,
            },
            memory: MemoryStat {
                total_bytes: 16 * gib,
                used_bytes: 8 * gib,
                available_bytes: 8 * gib,
                usage_percent: Some(ram),
            },
            disk: DiskStat {
                total_bytes: 100 * gib,
                used_bytes: 50 * gib,
                free_bytes: 50 * gib,
                usage_percent: Some(disk),
            },
            network: NetStat::default(),
            gpu: gpu_mem.map(|pct| GpuStat {
                index: 0,
                name: "Test GPU".to_string(),
                temperature_celsius: Some(60.0),
                usage_percent: Some(10.0),
                memory: GpuMemoryStat {
                    total_bytes: 8 * gib,
                    used_bytes: 4 * gib,
                    free_bytes: 4 * gib,
                    usage_percent: Some(pct),
                },
                power_draw_watts: Some(120.0),
                power_limit_watts: Some(250.0),
                fan_speed_percent: None,
            }),
            temperatures: Vec::new(),
        }
    }
}
