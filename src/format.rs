//! Chat replies and notifications, rendered as Telegram HTML.

use crate::alerts::{AlertEvent, MetricClass};
use crate::collectors::{InterfaceStat, ProcessStat, SwapStat};
use crate::router::{ChatInfo, SenderIdentity};
use crate::snapshot::{bytes_to_gb, MetricsSnapshot};
use chrono::{DateTime, Utc};
use std::fmt::Display;
use teloxide::utils::html::escape;

pub const NOT_AUTHORIZED_TEXT: &str = "⛔ You are not allowed to use this bot!";
pub const TOP_PROGRESS_TEXT: &str = "⏳ Collecting process information...";
pub const RATE_LIMITED_TEXT: &str = "Too many requests. Please try again in a minute.";

const BAR_CELLS: usize = 10;
const NA: &str = "n/a";
// Keeps /network well under the 4096 character message limit.
const MAX_LISTED_INTERFACES: usize = 20;
const INTERFACE_NAME_MAX: usize = 32;

/// Ten-cell usage bar; each cell is 10%.
pub fn make_bar(percent: f64) -> String {
    let pct = if percent.is_finite() {
        percent.clamp(0.0, 100.0)
    } else {
        0.0
    };
    let filled = ((pct / 100.0) * BAR_CELLS as f64).floor() as usize;
    let filled = filled.min(BAR_CELLS);
    format!("{}{}", "█".repeat(filled), "░".repeat(BAR_CELLS - filled))
}

fn or_na<T: Display>(v: Option<T>) -> String {
    v.map(|v| v.to_string()).unwrap_or_else(|| NA.to_string())
}

fn pct(v: Option<f64>) -> String {
    v.map(|v| format!("{v:.1}%"))
        .unwrap_or_else(|| NA.to_string())
}

fn gb(bytes: u64) -> String {
    format!("{:.2} GB", bytes_to_gb(bytes))
}

fn host(snapshot: &MetricsSnapshot) -> String {
    escape(snapshot.system.host_name.as_deref().unwrap_or("unknown"))
}

pub fn human_uptime(seconds: u64) -> String {
    let days = seconds / 86_400;
    let hours = (seconds % 86_400) / 3600;
    let mins = (seconds % 3600) / 60;

    if days > 0 {
        format!("{days}d {hours}h {mins}m")
    } else if hours > 0 {
        format!("{hours}h {mins}m")
    } else if mins > 0 {
        format!("{mins}m")
    } else {
        format!("{seconds}s")
    }
}

pub fn help_text() -> String {
    [
        "🤖 <b>COMMANDS</b>",
        "",
        "📊 <b>Overview:</b>",
        "/info - System overview",
        "/status - Current usage with bars",
        "",
        "💻 <b>Details:</b>",
        "/cpu - CPU and per-core usage",
        "/ram - Memory and swap",
        "/disk - Disk usage",
        "/gpu - GPU (if present)",
        "/network - Network counters and interfaces",
        "/top - Top 10 processes",
        "",
        "🆔 <b>Bot:</b>",
        "/userid - Your user ID",
        "/groupid - This group's ID",
        "/author - About this bot",
        "/help - This help",
    ]
    .join("\n")
}

pub fn format_info(s: &MetricsSnapshot) -> String {
    let mut out = vec![
        "🖥️ <b>SYSTEM INFORMATION</b>".to_string(),
        String::new(),
        "<b>Operating system:</b>".to_string(),
        format!("• Hostname: <code>{}</code>", host(s)),
        format!(
            "• Platform: {} {}",
            escape(s.system.platform.as_deref().unwrap_or(NA)),
            escape(s.system.os_version.as_deref().unwrap_or_default())
        ),
        format!(
            "• Kernel: {}",
            escape(s.system.kernel_version.as_deref().unwrap_or(NA))
        ),
        format!(
            "• Uptime: {} ({} h)",
            human_uptime(s.system.uptime_seconds),
            s.system.uptime_hours()
        ),
        String::new(),
        "<b>CPU:</b>".to_string(),
        format!(
            "• Cores: {} physical / {} logical",
            or_na(s.cpu.physical_cores),
            s.cpu.logical_cores
        ),
        format!("• Usage: {:.1}%", s.cpu.usage_percent),
        format!(
            "• Load avg: {} / {} / {}",
            or_na(s.cpu.load_1),
            or_na(s.cpu.load_5),
            or_na(s.cpu.load_15)
        ),
        String::new(),
        "<b>RAM:</b>".to_string(),
        format!("• Total: {}", gb(s.memory.total_bytes)),
        format!(
            "• Used: {} ({})",
            gb(s.memory.used_bytes),
            pct(s.memory.usage_percent)
        ),
        format!("• Available: {}", gb(s.memory.available_bytes)),
        String::new(),
        "<b>Disk:</b>".to_string(),
        format!("• Total: {}", gb(s.disk.total_bytes)),
        format!(
            "• Used: {} ({})",
            gb(s.disk.used_bytes),
            pct(s.disk.usage_percent)
        ),
        format!("• Free: {}", gb(s.disk.free_bytes)),
    ];

    if let Some(g) = &s.gpu {
        out.push(String::new());
        out.push("<b>GPU:</b>".to_string());
        out.push(format!("• Name: {}", escape(&g.name)));
        out.push(format!(
            "• Memory: {:.2}/{:.2} GB ({})",
            bytes_to_gb(g.memory.used_bytes),
            bytes_to_gb(g.memory.total_bytes),
            pct(g.memory.usage_percent)
        ));
        out.push(format!(
            "• Temp: {}",
            g.temperature_celsius
                .map(|t| format!("{t:.0}°C"))
                .unwrap_or_else(|| NA.to_string())
        ));
    }

    out.join("\n")
}

fn usage_block(
    out: &mut Vec<String>,
    title: &str,
    percent: Option<f64>,
    used_total: Option<(u64, u64)>,
) {
    out.push(String::new());
    out.push(format!("{title} {}", pct(percent)));
    out.push(make_bar(percent.unwrap_or(0.0)));
    if let Some((used, total)) = used_total {
        out.push(format!(
            "{:.2}/{:.2} GB",
            bytes_to_gb(used),
            bytes_to_gb(total)
        ));
    }
}

fn status_body(header: &str, s: &MetricsSnapshot, with_errors: bool) -> String {
    let mut out = vec![header.to_string()];

    usage_block(&mut out, "🖥️ <b>CPU:</b>", Some(s.cpu.usage_percent), None);
    usage_block(
        &mut out,
        "💾 <b>RAM:</b>",
        s.memory.usage_percent,
        Some((s.memory.used_bytes, s.memory.total_bytes)),
    );
    usage_block(
        &mut out,
        "💿 <b>Disk:</b>",
        s.disk.usage_percent,
        Some((s.disk.used_bytes, s.disk.total_bytes)),
    );

    out.push(String::new());
    out.push("🌐 <b>Network:</b>".to_string());
    out.push(format!("• Sent: {}", gb(s.network.sent_bytes)));
    out.push(format!("• Recv: {}", gb(s.network.recv_bytes)));
    if with_errors {
        out.push(format!("• Errors: {}", s.network.errors));
    }

    if let Some(g) = &s.gpu {
        usage_block(
            &mut out,
            "🎮 <b>GPU Memory:</b>",
            g.memory.usage_percent,
            Some((g.memory.used_bytes, g.memory.total_bytes)),
        );
    }

    out.join("\n")
}

pub fn format_status(s: &MetricsSnapshot) -> String {
    status_body("📊 <b>SYSTEM STATUS</b>", s, true)
}

pub fn format_auto_status(s: &MetricsSnapshot) -> String {
    let body = status_body("📊 <b>AUTO STATUS UPDATE</b>", s, false);
    format!("{body}\n\n🖥️ Host: <code>{}</code>", host(s))
}

pub fn format_cpu(s: &MetricsSnapshot, per_core: &[f64]) -> String {
    let cores = if per_core.is_empty() {
        NA.to_string()
    } else {
        per_core
            .iter()
            .enumerate()
            .map(|(i, v)| format!("Core {i}: {v:.1}%"))
            .collect::<Vec<_>>()
            .join("\n")
    };

    [
        "💻 <b>CPU</b>".to_string(),
        String::new(),
        "<b>Overview:</b>".to_string(),
        format!("• Physical cores: {}", or_na(s.cpu.physical_cores)),
        format!("• Logical cores: {}", s.cpu.logical_cores),
        format!("• Usage: {:.1}%", s.cpu.usage_percent),
        String::new(),
        "<b>Load average:</b>".to_string(),
        format!("• 1 min: {}", or_na(s.cpu.load_1)),
        format!("• 5 min: {}", or_na(s.cpu.load_5)),
        format!("• 15 min: {}", or_na(s.cpu.load_15)),
        String::new(),
        "<b>Usage per core:</b>".to_string(),
        cores,
    ]
    .join("\n")
}

pub fn format_ram(s: &MetricsSnapshot, swap: &SwapStat) -> String {
    [
        "💾 <b>MEMORY</b>".to_string(),
        String::new(),
        "<b>Virtual memory:</b>".to_string(),
        format!("• Total: {}", gb(s.memory.total_bytes)),
        format!("• Used: {}", gb(s.memory.used_bytes)),
        format!("• Available: {}", gb(s.memory.available_bytes)),
        format!("• Usage: {}", pct(s.memory.usage_percent)),
        String::new(),
        "<b>Swap:</b>".to_string(),
        format!("• Total: {}", gb(swap.total_bytes)),
        format!("• Used: {}", gb(swap.used_bytes)),
        format!("• Free: {}", gb(swap.free_bytes)),
        format!("• Usage: {}", pct(swap.usage_percent)),
    ]
    .join("\n")
}

pub fn format_disk(s: &MetricsSnapshot) -> String {
    [
        "💿 <b>DISK</b>".to_string(),
        String::new(),
        format!("• Total: {}", gb(s.disk.total_bytes)),
        format!("• Used: {}", gb(s.disk.used_bytes)),
        format!("• Free: {}", gb(s.disk.free_bytes)),
        format!("• Usage: {}", pct(s.disk.usage_percent)),
    ]
    .join("\n")
}

pub fn format_gpu(s: &MetricsSnapshot) -> String {
    let Some(g) = &s.gpu else {
        return "❌ No GPU found or nvidia-smi is not available".to_string();
    };

    let unit = |v: Option<f64>, suffix: &str| {
        v.map(|v| format!("{v:.1}{suffix}"))
            .unwrap_or_else(|| NA.to_string())
    };

    [
        "🎮 <b>GPU</b>".to_string(),
        String::new(),
        format!("<b>{}</b> (index {})", escape(&g.name), g.index),
        String::new(),
        "<b>Compute:</b>".to_string(),
        format!("• Utilization: {}", pct(g.usage_percent)),
        format!("• Temperature: {}", unit(g.temperature_celsius, "°C")),
        format!("• Fan speed: {}", pct(g.fan_speed_percent)),
        String::new(),
        "<b>Memory:</b>".to_string(),
        format!("• Total: {}", gb(g.memory.total_bytes)),
        format!("• Used: {}", gb(g.memory.used_bytes)),
        format!("• Free: {}", gb(g.memory.free_bytes)),
        format!("• Usage: {}", pct(g.memory.usage_percent)),
        String::new(),
        "<b>Power:</b>".to_string(),
        format!("• Draw: {}", unit(g.power_draw_watts, " W")),
        format!("• Limit: {}", unit(g.power_limit_watts, " W")),
    ]
    .join("\n")
}

pub fn format_network(s: &MetricsSnapshot, interfaces: &[InterfaceStat]) -> String {
    let listed = interfaces
        .iter()
        .filter(|i| i.up != Some(false))
        .filter_map(|i| i.ipv4.as_deref().map(|ip| (i, ip)))
        .collect::<Vec<_>>();

    let mut out = vec![
        "🌐 <b>NETWORK</b>".to_string(),
        String::new(),
        "<b>Totals since boot:</b>".to_string(),
        format!("• Sent: {}", gb(s.network.sent_bytes)),
        format!("• Received: {}", gb(s.network.recv_bytes)),
        format!("• Packets sent: {}", s.network.packets_sent),
        format!("• Packets recv: {}", s.network.packets_recv),
        format!("• Errors: {}", s.network.errors),
        format!("• Drops: {}", s.network.drops),
        String::new(),
        "<b>Interfaces:</b>".to_string(),
    ];
    if listed.is_empty() {
        out.push(NA.to_string());
    }
    for (iface, ip) in listed.iter().take(MAX_LISTED_INTERFACES) {
        let name: String = iface.name.chars().take(INTERFACE_NAME_MAX).collect();
        let speed = iface
            .speed_mbps
            .map(|v| format!(" - {v} Mbps"))
            .unwrap_or_default();
        out.push(format!(
            "• {}: {}{} (↓ {} / ↑ {})",
            escape(&name),
            escape(ip),
            speed,
            gb(iface.recv_bytes),
            gb(iface.sent_bytes)
        ));
    }
    if listed.len() > MAX_LISTED_INTERFACES {
        out.push(format!("… and {} more", listed.len() - MAX_LISTED_INTERFACES));
    }
    out.join("\n")
}

pub fn format_top(procs: &[ProcessStat]) -> String {
    let mut table = format!("{:<8} {:<20} {:<8} {:<8}\n", "PID", "NAME", "CPU%", "MEM%");
    table.push_str(&"-".repeat(46));
    table.push('\n');
    for p in procs {
        table.push_str(&format!(
            "{:<8} {:<20} {:<8.1} {:<8.1}\n",
            p.pid, p.name, p.cpu_percent, p.memory_percent
        ));
    }

    format!(
        "⚡ <b>TOP {} PROCESSES (CPU)</b>\n\n<pre>{}</pre>",
        procs.len(),
        escape(table.trim_end())
    )
}

pub fn format_userid(sender: &SenderIdentity) -> String {
    [
        "👤 <b>USER</b>".to_string(),
        String::new(),
        format!("• User ID: <code>{}</code>", escape(&sender.id)),
        format!(
            "• Username: {}",
            sender
                .username
                .as_deref()
                .map(|u| format!("@{}", escape(u)))
                .unwrap_or_else(|| NA.to_string())
        ),
        format!(
            "• First name: {}",
            escape(sender.first_name.as_deref().unwrap_or(NA))
        ),
        format!(
            "• Last name: {}",
            escape(sender.last_name.as_deref().unwrap_or(NA))
        ),
    ]
    .join("\n")
}

pub fn format_groupid(chat: &ChatInfo) -> String {
    if !chat.is_group() {
        return "❌ This command only works in a group!".to_string();
    }
    [
        "👥 <b>GROUP</b>".to_string(),
        String::new(),
        format!("• Group ID: <code>{}</code>", chat.id),
        format!(
            "• Group name: {}",
            escape(chat.title.as_deref().unwrap_or(NA))
        ),
        format!("• Type: {}", chat.kind.as_str()),
    ]
    .join("\n")
}

pub fn author_text() -> String {
    [
        "👨‍💻 <b>ABOUT</b>",
        "",
        "Host metrics agent with a Telegram front end.",
        "",
        "<b>This bot:</b>",
        "Watches CPU, RAM, disk, GPU and network of this server, stores samples",
        "in InfluxDB and raises alerts when usage stays above its thresholds.",
        "",
        concat!("🔧 Version: ", env!("CARGO_PKG_VERSION")),
    ]
    .join("\n")
}

fn alert_block(event: &AlertEvent) -> String {
    let (icon, title) = match event.class {
        MetricClass::Cpu => ("🔴", "CPU WARNING"),
        MetricClass::Ram => ("🟠", "RAM WARNING"),
        MetricClass::Disk => ("🟡", "DISK WARNING"),
        MetricClass::GpuMemory => ("🟣", "GPU MEMORY WARNING"),
    };

    let mut lines = vec![
        format!("{icon} <b>{title}</b>"),
        format!(
            "Usage: {:.1}% (threshold: {:.1}%)",
            event.observed, event.threshold
        ),
    ];
    if let (Some(used), Some(total)) = (event.context.used_bytes, event.context.total_bytes) {
        lines.push(format!(
            "{:.2}/{:.2} GB",
            bytes_to_gb(used),
            bytes_to_gb(total)
        ));
    }
    if let Some(name) = &event.context.gpu_name {
        lines.push(format!("GPU: {}", escape(name)));
    }
    lines.join("\n")
}

/// One message for every event fired in a single evaluation.
pub fn format_alert(events: &[AlertEvent], host_name: &str, at: DateTime<Utc>) -> String {
    let blocks = events.iter().map(alert_block).collect::<Vec<_>>();
    format!(
        "⚠️ <b>SYSTEM ALERT</b>\n\n{}\n\n🕐 Time: {}\n🖥️ Host: <code>{}</code>",
        blocks.join("\n\n"),
        at.format("%Y-%m-%d %H:%M:%S UTC"),
        escape(host_name)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertContext;
    use crate::router::ChatKind;
    use crate::snapshot::fixtures::snapshot;
    use chrono::TimeZone;

    #[test]
    fn bar_fills_one_cell_per_ten_percent() {
        assert_eq!(make_bar(0.0), "░░░░░░░░░░");
        assert_eq!(make_bar(45.0), "████░░░░░░");
        assert_eq!(make_bar(100.0), "██████████");
        assert_eq!(make_bar(180.0), "██████████");
        assert_eq!(make_bar(f64::NAN), "░░░░░░░░░░");
    }

    #[test]
    fn uptime_is_compact() {
        assert_eq!(human_uptime(42), "42s");
        assert_eq!(human_uptime(3 * 3600 + 120), "3h 2m");
        assert_eq!(human_uptime(2 * 86_400 + 3600), "2d 1h 0m");
    }

    #[test]
    fn status_includes_gpu_block_only_with_gpu() {
        let without = format_status(&snapshot(42.0, 50.0, 50.0, None));
        assert!(without.contains("<b>CPU:</b> 42.0%"));
        assert!(without.contains("8.00/16.00 GB"));
        assert!(!without.contains("GPU Memory"));

        let with = format_status(&snapshot(42.0, 50.0, 50.0, Some(50.0)));
        assert!(with.contains("<b>GPU Memory:</b> 50.0%"));
        assert!(with.contains("4.00/8.00 GB"));
    }

    #[test]
    fn missing_values_render_as_na() {
        let mut s = snapshot(1.0, 1.0, 1.0, None);
        s.cpu.load_1 = None;
        s.cpu.physical_cores = None;
        s.disk.usage_percent = None;
        let info = format_info(&s);
        assert!(info.contains("• Cores: n/a physical / 8 logical"));
        assert!(info.contains("Load avg: n/a / 0.4 / 0.3"));
        assert!(format_disk(&s).contains("• Usage: n/a"));
        assert!(format_gpu(&s).starts_with("❌"));
    }

    #[test]
    fn top_table_escapes_process_names() {
        let procs = vec![ProcessStat {
            pid: 7,
            name: "<evil>".to_string(),
            cpu_percent: 12.34,
            memory_percent: 1.0,
        }];
        let text = format_top(&procs);
        assert!(text.contains("&lt;evil&gt;"));
        assert!(text.contains("12.3"));
        assert!(text.starts_with("⚡ <b>TOP 1 PROCESSES"));
    }

    #[test]
    fn alert_message_has_block_per_event() {
        let events = vec![
            AlertEvent {
                class: MetricClass::Cpu,
                observed: 81.0,
                threshold: 80.0,
                context: AlertContext::default(),
            },
            AlertEvent {
                class: MetricClass::GpuMemory,
                observed: 95.5,
                threshold: 90.0,
                context: AlertContext {
                    used_bytes: Some(4 * 1024 * 1024 * 1024),
                    total_bytes: Some(8 * 1024 * 1024 * 1024),
                    gpu_name: Some("RTX 3090".to_string()),
                },
            },
        ];
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).single().expect("valid time");
        let text = format_alert(&events, "db-1", at);

        assert!(text.starts_with("⚠️ <b>SYSTEM ALERT</b>"));
        assert!(text.contains("🔴 <b>CPU WARNING</b>\nUsage: 81.0% (threshold: 80.0%)"));
        assert!(text.contains("🟣 <b>GPU MEMORY WARNING</b>"));
        assert!(text.contains("4.00/8.00 GB\nGPU: RTX 3090"));
        assert!(text.contains("🕐 Time: 2024-05-01 12:30:00 UTC"));
        assert!(text.ends_with("<code>db-1</code>"));
    }

    #[test]
    fn groupid_outside_group_is_refused() {
        let private = ChatInfo {
            id: 5,
            kind: ChatKind::Private,
            title: None,
        };
        assert!(format_groupid(&private).starts_with("❌"));

        let group = ChatInfo {
            id: -100,
            kind: ChatKind::Supergroup,
            title: Some("Ops & Infra".to_string()),
        };
        let text = format_groupid(&group);
        assert!(text.contains("<code>-100</code>"));
        assert!(text.contains("Ops &amp; Infra"));
        assert!(text.contains("supergroup"));
    }

    fn iface(name: &str, up: Option<bool>, ipv4: Option<&str>) -> InterfaceStat {
        InterfaceStat {
            name: name.to_string(),
            recv_bytes: 0,
            sent_bytes: 0,
            up,
            speed_mbps: Some(10_000),
            ipv4: ipv4.map(str::to_string),
        }
    }

    #[test]
    fn network_lists_only_up_interfaces_with_ipv4() {
        let interfaces = vec![
            iface("eth0", Some(true), Some("192.168.1.10")),
            iface("eth1", Some(false), Some("10.0.0.1")),
            iface("docker0", Some(true), None),
            iface("wg0", None, Some("10.8.0.1")),
        ];
        let text = format_network(&snapshot(1.0, 1.0, 1.0, None), &interfaces);
        assert!(text.contains("• eth0: 192.168.1.10 - 10000 Mbps"));
        assert!(text.contains("• wg0: 10.8.0.1"));
        assert!(!text.contains("eth1"));
        assert!(!text.contains("docker0"));
    }

    #[test]
    fn network_reply_fits_one_message_on_busy_hosts() {
        let interfaces = (0..120)
            .map(|i| {
                let name = format!("veth{i:04}abcdefabcdefabcdefabcdefabcdef");
                iface(&name, Some(true), Some("172.17.255.254"))
            })
            .collect::<Vec<_>>();
        let text = format_network(&snapshot(1.0, 1.0, 1.0, None), &interfaces);
        assert!(text.chars().count() < 4096, "{} chars", text.chars().count());
        assert!(text.contains("veth0019"));
        assert!(!text.contains("veth0020"));
        assert!(text.ends_with("… and 100 more"));
    }

    #[test]
    fn userid_shows_username_with_at() {
        let sender = SenderIdentity {
            id: "123".to_string(),
            username: Some("alice".to_string()),
            first_name: Some("Alice".to_string()),
            last_name: None,
        };
        let text = format_userid(&sender);
        assert!(text.contains("<code>123</code>"));
        assert!(text.contains("@alice"));
        assert!(text.contains("• Last name: n/a"));
    }
}
