use crate::collectors::{
    rank_processes, InterfaceStat, MetricsSource, ProcessStat, SourceError, SwapStat,
};
use crate::snapshot::{
    aggregate_disks, clamp_percent, percent, round2, CpuStat, GpuMemoryStat, GpuStat,
    MemoryStat, MetricsSnapshot, NetCounters, NetStat, Partition, SystemInfo, TempStat,
};
use chrono::Utc;
use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::process::{Command, Output, Stdio};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use sysinfo::{
    ComponentExt, CpuExt, DiskExt, NetworkExt, NetworksExt, PidExt, ProcessExt, System,
    SystemExt,
};
use tracing::{debug, warn};

const NVIDIA_SMI_QUERY: &str = concat!(
    "--query-gpu=index,name,temperature.gpu,utilization.gpu,",
    "memory.total,memory.used,memory.free,power.draw,power.limit,fan.speed",
);
const PROCESS_NAME_MAX: usize = 20;
const MIB: u64 = 1024 * 1024;
const GPU_QUERY_TIMEOUT: Duration = Duration::from_secs(5);
const TOOL_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Production source: one shared `sysinfo::System` plus `nvidia-smi`.
pub struct SysinfoSource {
    system: Mutex<System>,
}

impl SysinfoSource {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_disks_list();
        system.refresh_networks_list();
        system.refresh_components_list();
        Self {
            system: Mutex::new(system),
        }
    }

    fn lock(&self) -> MutexGuard<'_, System> {
        // A panic while sampling leaves counters that are still usable.
        self.system.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Everything except the GPU, under the system lock.
    fn sample_system(&self) -> Result<MetricsSnapshot, SourceError> {
        let mut system = self.lock();

        let usage = measure_cpu(&mut system);
        system.refresh_memory();
        system.refresh_disks_list();
        system.refresh_disks();
        system.refresh_networks_list();
        system.refresh_networks();
        system.refresh_components();

        if system.cpus().is_empty() {
            return Err(SourceError::Unavailable("no CPUs reported".to_string()));
        }

        let uptime_seconds = system.uptime();
        let load = system.load_average();
        let (load_1, load_5, load_15) = if cfg!(target_os = "windows") {
            (None, None, None)
        } else {
            (
                Some(round2(load.one)),
                Some(round2(load.five)),
                Some(round2(load.fifteen)),
            )
        };

        Ok(MetricsSnapshot {
            timestamp: Utc::now(),
            system: SystemInfo {
                host_name: system.host_name(),
                platform: system.name(),
                os_version: system.os_version(),
                kernel_version: system.kernel_version(),
                uptime_seconds,
            },
            cpu: CpuStat {
                usage_percent: clamp_percent(average(&usage)),
                load_1,
                load_5,
                load_15,
                physical_cores: system.physical_core_count(),
                logical_cores: system.cpus().len(),
            },
            memory: MemoryStat::new(
                system.total_memory(),
                system.used_memory(),
                system.available_memory(),
            ),
            disk: aggregate_disks(&partitions(&system)),
            network: NetStat::from_counters(net_counters(&system), uptime_seconds),
            gpu: None,
            temperatures: collect_temps(&system),
        })
    }
}

impl Default for SysinfoSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSource for SysinfoSource {
    fn sample(&self) -> Result<MetricsSnapshot, SourceError> {
        let mut snapshot = self.sample_system()?;
        // nvidia-smi runs without the system lock held
        snapshot.gpu = collect_gpu();

        debug!(
            cpu = snapshot.cpu.usage_percent,
            ram = ?snapshot.memory.usage_percent,
            disk = ?snapshot.disk.usage_percent,
            gpu = snapshot.gpu.is_some(),
            "snapshot sampled"
        );
        Ok(snapshot)
    }

    fn cpu_per_core(&self) -> Result<Vec<f64>, SourceError> {
        let mut system = self.lock();
        let usage = measure_cpu(&mut system);
        if usage.is_empty() {
            return Err(SourceError::Unavailable("no CPUs reported".to_string()));
        }
        Ok(usage)
    }

    fn swap(&self) -> Result<SwapStat, SourceError> {
        let mut system = self.lock();
        system.refresh_memory();
        let total = system.total_swap();
        let used = system.used_swap();
        Ok(SwapStat {
            total_bytes: total,
            used_bytes: used,
            free_bytes: system.free_swap(),
            usage_percent: percent(used as f64, total as f64),
        })
    }

    fn top_processes(&self, limit: usize) -> Result<Vec<ProcessStat>, SourceError> {
        let mut system = self.lock();
        system.refresh_memory();
        // Process CPU usage is a delta between two refreshes.
        system.refresh_processes();
        thread::sleep(System::MINIMUM_CPU_UPDATE_INTERVAL);
        system.refresh_processes();

        let cores = system.cpus().len().max(1) as f64;
        let total_memory = system.total_memory() as f64;

        let procs = system
            .processes()
            .iter()
            .map(|(pid, p)| ProcessStat {
                pid: pid.as_u32(),
                name: p.name().chars().take(PROCESS_NAME_MAX).collect(),
                cpu_percent: clamp_percent(p.cpu_usage() as f64 / cores),
                memory_percent: percent(p.memory() as f64, total_memory).unwrap_or(0.0),
            })
            .collect();

        Ok(rank_processes(procs, limit))
    }

    fn interfaces(&self) -> Result<Vec<InterfaceStat>, SourceError> {
        let mut system = self.lock();
        system.refresh_networks_list();
        system.refresh_networks();
        let addresses = ipv4_addresses();

        let mut out: Vec<InterfaceStat> = system
            .networks()
            .iter()
            .filter(|(name, _)| !name.starts_with("lo"))
            .map(|(name, data)| {
                let (up, speed_mbps) = link_state(name);
                InterfaceStat {
                    name: name.to_string(),
                    recv_bytes: data.total_received(),
                    sent_bytes: data.total_transmitted(),
                    up,
                    speed_mbps,
                    ipv4: addresses.get(name.as_str()).map(ToString::to_string),
                }
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }
}

fn measure_cpu(system: &mut System) -> Vec<f64> {
    system.refresh_cpu();
    thread::sleep(System::MINIMUM_CPU_UPDATE_INTERVAL);
    system.refresh_cpu();
    system
        .cpus()
        .iter()
        .map(|c| clamp_percent(c.cpu_usage() as f64))
        .collect()
}

fn average(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn partitions(system: &System) -> Vec<Partition> {
    system
        .disks()
        .iter()
        .map(|d| Partition {
            device: d.name().to_string_lossy().to_string(),
            fs_type: String::from_utf8_lossy(d.file_system()).to_string(),
            mount_point: d.mount_point().to_string_lossy().to_string(),
            total_bytes: d.total_space(),
            free_bytes: d.available_space(),
        })
        .collect()
}

fn net_counters(system: &System) -> NetCounters {
    let mut c = NetCounters::default();
    for (name, data) in system.networks().iter() {
        c.sent_bytes = c.sent_bytes.saturating_add(data.total_transmitted());
        c.recv_bytes = c.recv_bytes.saturating_add(data.total_received());
        c.packets_sent = c
            .packets_sent
            .saturating_add(data.total_packets_transmitted());
        c.packets_recv = c
            .packets_recv
            .saturating_add(data.total_packets_received());
        c.errors_in = c.errors_in.saturating_add(data.total_errors_on_received());
        c.errors_out = c
            .errors_out
            .saturating_add(data.total_errors_on_transmitted());
        let (drops_in, drops_out) = interface_drops(name);
        c.drops_in = c.drops_in.saturating_add(drops_in);
        c.drops_out = c.drops_out.saturating_add(drops_out);
    }
    c
}

#[cfg(target_os = "linux")]
fn read_sys_net(iface: &str, file: &str) -> Option<String> {
    fs::read_to_string(format!("/sys/class/net/{iface}/{file}"))
        .ok()
        .map(|s| s.trim().to_string())
}

#[cfg(target_os = "linux")]
fn interface_drops(iface: &str) -> (u64, u64) {
    let read = |file: &str| {
        read_sys_net(iface, file)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0)
    };
    (read("statistics/rx_dropped"), read("statistics/tx_dropped"))
}

#[cfg(not(target_os = "linux"))]
fn interface_drops(_iface: &str) -> (u64, u64) {
    (0, 0)
}

#[cfg(target_os = "linux")]
fn link_state(iface: &str) -> (Option<bool>, Option<u64>) {
    // tun and wireguard links stay "unknown" while passing traffic
    let up = read_sys_net(iface, "operstate").map(|s| matches!(s.as_str(), "up" | "unknown"));
    // Virtual links report -1 or refuse the read.
    let speed = read_sys_net(iface, "speed")
        .and_then(|v| v.parse::<i64>().ok())
        .and_then(|v| u64::try_from(v).ok())
        .filter(|v| *v > 0);
    (up, speed)
}

#[cfg(not(target_os = "linux"))]
fn link_state(_iface: &str) -> (Option<bool>, Option<u64>) {
    (None, None)
}

/// First IPv4 address of every interface that has one.
fn ipv4_addresses() -> HashMap<String, Ipv4Addr> {
    let mut out = HashMap::new();
    match if_addrs::get_if_addrs() {
        Ok(addrs) => {
            for iface in addrs {
                if let IpAddr::V4(ip) = iface.ip() {
                    out.entry(iface.name).or_insert(ip);
                }
            }
        }
        Err(err) => debug!(error = %err, "failed to list interface addresses"),
    }
    out
}

fn collect_temps(system: &System) -> Vec<TempStat> {
    let temps: Vec<TempStat> = system
        .components()
        .iter()
        .filter(|c| c.temperature().is_finite() && c.temperature() > 0.0)
        .map(|c| TempStat {
            label: c.label().to_string(),
            celsius: round2(c.temperature() as f64),
            critical_celsius: c.critical().filter(|v| v.is_finite()).map(|v| v as f64),
        })
        .collect();

    if !temps.is_empty() {
        return temps;
    }

    let zones = collect_thermal_zones();
    debug!(thermal_zones = zones.len(), "no sysinfo components, using thermal zones");
    zones
}

#[cfg(target_os = "linux")]
fn collect_thermal_zones() -> Vec<TempStat> {
    let Ok(entries) = fs::read_dir("/sys/class/thermal") else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|v| v.to_str()) else {
            continue;
        };
        if !name.starts_with("thermal_zone") {
            continue;
        }

        let label = fs::read_to_string(path.join("type"))
            .ok()
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|| name.to_string());
        let Some(raw) = fs::read_to_string(path.join("temp")).ok() else {
            continue;
        };
        let Ok(v) = raw.trim().parse::<f64>() else {
            continue;
        };
        // millidegrees on most kernels
        let celsius = if v > 1000.0 { v / 1000.0 } else { v };
        if celsius > 0.0 {
            out.push(TempStat {
                label,
                celsius: round2(celsius),
                critical_celsius: None,
            });
        }
    }

    out.sort_by(|a, b| a.label.cmp(&b.label));
    out
}

#[cfg(not(target_os = "linux"))]
fn collect_thermal_zones() -> Vec<TempStat> {
    Vec::new()
}

/// First GPU reported by `nvidia-smi`, or `None` when the tool is missing,
/// hangs or its output is unusable.
fn collect_gpu() -> Option<GpuStat> {
    query_gpu("nvidia-smi", GPU_QUERY_TIMEOUT)
}

fn query_gpu(program: &str, deadline: Duration) -> Option<GpuStat> {
    let output = run_with_deadline(
        program,
        &[NVIDIA_SMI_QUERY, "--format=csv,noheader,nounits"],
        deadline,
    )?;
    if !output.status.success() {
        debug!(status = ?output.status, "nvidia-smi exited with failure");
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    text.lines().find_map(parse_nvidia_smi_line)
}

/// Runs a short-lived tool and kills it once `deadline` passes. The tool's
/// output must fit in the pipe buffer, which holds for a few CSV rows.
fn run_with_deadline(program: &str, args: &[&str], deadline: Duration) -> Option<Output> {
    let mut child = match Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            debug!(program, error = %err, "tool not available");
            return None;
        }
    };

    let started = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(_)) => break,
            Ok(None) if started.elapsed() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                warn!(
                    program,
                    deadline = %humantime::format_duration(deadline),
                    "tool did not finish in time, killed"
                );
                return None;
            }
            Ok(None) => thread::sleep(TOOL_POLL_INTERVAL),
            Err(err) => {
                debug!(program, error = %err, "failed to wait for tool");
                let _ = child.kill();
                let _ = child.wait();
                return None;
            }
        }
    }

    match child.wait_with_output() {
        Ok(output) => Some(output),
        Err(err) => {
            debug!(program, error = %err, "failed to read tool output");
            None
        }
    }
}

/// Parses one CSV row of the query above. Memory columns are in MiB.
fn parse_nvidia_smi_line(line: &str) -> Option<GpuStat> {
    let parts: Vec<&str> = line.split(',').map(str::trim).collect();
    if parts.len() < 10 {
        return None;
    }

    let index = parse_u64_loose(parts[0]).and_then(|v| u32::try_from(v).ok())?;
    let name = parts[1].to_string();
    if name.is_empty() {
        return None;
    }

    let total = parse_u64_loose(parts[4]).unwrap_or(0).saturating_mul(MIB);
    let used = parse_u64_loose(parts[5]).unwrap_or(0).saturating_mul(MIB);
    let free = parse_u64_loose(parts[6]).unwrap_or(0).saturating_mul(MIB);

    Some(GpuStat {
        index,
        name,
        temperature_celsius: parse_f64_loose(parts[2]),
        usage_percent: parse_f64_loose(parts[3]).map(clamp_percent),
        memory: GpuMemoryStat {
            total_bytes: total,
            used_bytes: used,
            free_bytes: free,
            usage_percent: percent(used as f64, total as f64),
        },
        power_draw_watts: parse_f64_loose(parts[7]).map(round2),
        power_limit_watts: parse_f64_loose(parts[8]).map(round2),
        fan_speed_percent: parse_f64_loose(parts[9]).map(clamp_percent),
    })
}

/// Accepts `12.5`, `12,5` and values with unit noise; `[N/A]` yields `None`.
fn parse_f64_loose(input: &str) -> Option<f64> {
    let trimmed = input.trim();
    if let Ok(v) = trimmed.parse::<f64>() {
        return Some(v).filter(|v| v.is_finite());
    }

    let filtered: String = trimmed
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '.' | ',' | '-' | '+'))
        .collect();
    if !filtered.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }

    filtered
        .replace(',', ".")
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}

fn parse_u64_loose(input: &str) -> Option<u64> {
    parse_f64_loose(input).map(|v| if v < 0.0 { 0 } else { v as u64 })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nvidia_row_is_parsed_with_mib_memory() {
        let gpu = parse_nvidia_smi_line(
            "0, NVIDIA GeForce RTX 3090, 61, 37, 24576, 12288, 12288, 115.32, 350.00, 45",
        )
        .expect("row must parse");
        assert_eq!(gpu.index, 0);
        assert_eq!(gpu.name, "NVIDIA GeForce RTX 3090");
        assert_eq!(gpu.temperature_celsius, Some(61.0));
        assert_eq!(gpu.usage_percent, Some(37.0));
        assert_eq!(gpu.memory.total_bytes, 24576 * MIB);
        assert_eq!(gpu.memory.used_bytes, 12288 * MIB);
        assert_eq!(gpu.memory.usage_percent, Some(50.0));
        assert_eq!(gpu.power_draw_watts, Some(115.32));
        assert_eq!(gpu.fan_speed_percent, Some(45.0));
    }

    #[test]
    fn not_available_columns_become_none() {
        let gpu = parse_nvidia_smi_line(
            "0, Tesla T4, 40, 0, 15360, 0, 15360, [N/A], [N/A], [Not Supported]",
        )
        .expect("row must parse");
        assert_eq!(gpu.power_draw_watts, None);
        assert_eq!(gpu.power_limit_watts, None);
        assert_eq!(gpu.fan_speed_percent, None);
        assert_eq!(gpu.memory.usage_percent, Some(0.0));
    }

    #[test]
    fn short_or_garbage_rows_are_rejected() {
        assert!(parse_nvidia_smi_line("").is_none());
        assert!(parse_nvidia_smi_line("0, GPU, 50").is_none());
        assert!(parse_nvidia_smi_line("x, , 1, 2, 3, 4, 5, 6, 7, 8").is_none());
    }

    #[test]
    fn zero_total_memory_has_no_usage() {
        let gpu = parse_nvidia_smi_line("1, Mystery, 30, 5, 0, 0, 0, 10, 20, 30")
            .expect("row must parse");
        assert_eq!(gpu.index, 1);
        assert!(gpu.memory.usage_percent.is_none());
    }

    #[test]
    fn loose_float_parsing() {
        assert_eq!(parse_f64_loose("12.5"), Some(12.5));
        assert_eq!(parse_f64_loose("12,5"), Some(12.5));
        assert_eq!(parse_f64_loose("45 %"), Some(45.0));
        assert_eq!(parse_f64_loose("[N/A]"), None);
        assert_eq!(parse_u64_loose("-3"), Some(0));
    }

    #[cfg(unix)]
    #[test]
    fn hung_tool_is_killed_at_deadline() {
        let started = Instant::now();
        let output = run_with_deadline("sleep", &["12"], Duration::from_millis(300));
        assert!(output.is_none());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[test]
    fn quick_tool_output_is_returned() {
        let output = run_with_deadline(
            "echo",
            &["0, Test GPU, 50, 10, 8192, 4096, 4096, 100, 250, 30"],
            Duration::from_secs(5),
        )
        .expect("echo finishes");
        let text = String::from_utf8_lossy(&output.stdout);
        let gpu = text.lines().find_map(parse_nvidia_smi_line).expect("row parses");
        assert_eq!(gpu.name, "Test GPU");
        assert_eq!(gpu.memory.usage_percent, Some(50.0));
    }

    #[test]
    fn missing_gpu_tool_means_no_gpu() {
        assert!(query_gpu("hostpulse-no-such-tool", Duration::from_secs(1)).is_none());
    }

    #[test]
    fn average_of_nothing_is_zero() {
        assert_eq!(average(&[]), 0.0);
        assert_eq!(average(&[10.0, 30.0]), 20.0);
    }
}
