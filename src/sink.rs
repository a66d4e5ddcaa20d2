use crate::config::SinkConfig;
use crate::snapshot::{bytes_to_gb, round2, MetricsSnapshot};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink is not configured")]
    NotConfigured,
    #[error("sink is closed")]
    Closed,
    #[error("request to sink failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("sink rejected write with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkHealth {
    Connected,
    Disconnected,
    NotConfigured,
}

impl SinkHealth {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::NotConfigured => "not configured",
        }
    }
}

/// Durable destination for snapshots.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn write(&self, snapshot: &MetricsSnapshot) -> Result<(), SinkError>;

    async fn health(&self) -> SinkHealth;

    /// Stops accepting writes. Later writes fail with [`SinkError::Closed`].
    async fn close(&self) -> Result<(), SinkError>;
}

/// InfluxDB v2 over the HTTP write API.
pub struct InfluxSink {
    client: Client,
    url: String,
    token: String,
    org: String,
    bucket: String,
    closed: AtomicBool,
}

impl InfluxSink {
    pub fn new(cfg: &SinkConfig, timeout: Duration) -> Result<Self, SinkError> {
        if !cfg.is_configured() {
            return Err(SinkError::NotConfigured);
        }
        let field = |v: &Option<String>| v.as_deref().unwrap_or_default().trim().to_string();

        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: field(&cfg.url).trim_end_matches('/').to_string(),
            token: field(&cfg.token),
            org: field(&cfg.org),
            bucket: field(&cfg.bucket),
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Sink for InfluxSink {
    async fn write(&self, snapshot: &MetricsSnapshot) -> Result<(), SinkError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SinkError::Closed);
        }

        let body = encode_line_protocol(snapshot);
        let resp = self
            .client
            .post(format!("{}/api/v2/write", self.url))
            .query(&[
                ("org", self.org.as_str()),
                ("bucket", self.bucket.as_str()),
                ("precision", "ns"),
            ])
            .header("Authorization", format!("Token {}", self.token))
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SinkError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        debug!(timestamp = %snapshot.timestamp, "snapshot written to influxdb");
        Ok(())
    }

    async fn health(&self) -> SinkHealth {
        if self.closed.load(Ordering::SeqCst) {
            return SinkHealth::Disconnected;
        }
        match self.client.get(format!("{}/health", self.url)).send().await {
            Ok(resp) if resp.status().is_success() => SinkHealth::Connected,
            Ok(resp) => {
                warn!(status = resp.status().as_u16(), "influxdb health check failed");
                SinkHealth::Disconnected
            }
            Err(err) => {
                warn!(error = %err, "influxdb health check failed");
                SinkHealth::Disconnected
            }
        }
    }

    async fn close(&self) -> Result<(), SinkError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

enum FieldValue {
    Float(f64),
    Int(u64),
}

struct Point<'a> {
    measurement: &'static str,
    tags: Vec<(&'static str, &'a str)>,
    fields: Vec<(&'static str, FieldValue)>,
}

impl Point<'_> {
    fn write_to(&self, out: &mut String, timestamp_ns: Option<i64>) {
        out.push_str(self.measurement);
        for (key, value) in &self.tags {
            let _ = write!(out, ",{key}={}", escape_tag(value));
        }
        for (i, (key, value)) in self.fields.iter().enumerate() {
            out.push(if i == 0 { ' ' } else { ',' });
            let _ = match value {
                FieldValue::Float(v) => write!(out, "{key}={}", round2(*v)),
                FieldValue::Int(v) => write!(out, "{key}={v}i"),
            };
        }
        if let Some(ts) = timestamp_ns {
            let _ = write!(out, " {ts}");
        }
        out.push('\n');
    }
}

fn escape_tag(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, ',' | '=' | ' ') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn mb_per_sec(bytes_per_sec: f64) -> f64 {
    bytes_per_sec / 1024.0 / 1024.0
}

/// Renders one snapshot as InfluxDB line protocol, one measurement per line.
/// Floats keep two decimals; counters are integer fields.
pub fn encode_line_protocol(snapshot: &MetricsSnapshot) -> String {
    use FieldValue::{Float, Int};

    let host = snapshot.system.host_name.as_deref().unwrap_or("unknown");
    let host_tag = vec![("host", host)];
    let cpu = &snapshot.cpu;
    let mem = &snapshot.memory;
    let disk = &snapshot.disk;
    let net = &snapshot.network;
    let gpu_index = snapshot.gpu.as_ref().map(|g| g.index.to_string());

    let mut points = vec![
        Point {
            measurement: "cpu",
            tags: host_tag.clone(),
            fields: vec![
                ("physical_cores", Int(cpu.physical_cores.unwrap_or(0) as u64)),
                ("logical_cores", Int(cpu.logical_cores as u64)),
                ("usage_percent", Float(cpu.usage_percent)),
                ("load_1min", Float(cpu.load_1.unwrap_or(0.0))),
                ("load_5min", Float(cpu.load_5.unwrap_or(0.0))),
                ("load_15min", Float(cpu.load_15.unwrap_or(0.0))),
            ],
        },
        Point {
            measurement: "memory",
            tags: host_tag.clone(),
            fields: vec![
                ("total_gb", Float(bytes_to_gb(mem.total_bytes))),
                ("used_gb", Float(bytes_to_gb(mem.used_bytes))),
                ("available_gb", Float(bytes_to_gb(mem.available_bytes))),
                ("usage_percent", Float(mem.usage_percent.unwrap_or(0.0))),
            ],
        },
        Point {
            measurement: "disk",
            tags: host_tag.clone(),
            fields: vec![
                ("total_gb", Float(bytes_to_gb(disk.total_bytes))),
                ("used_gb", Float(bytes_to_gb(disk.used_bytes))),
                ("free_gb", Float(bytes_to_gb(disk.free_bytes))),
                ("usage_percent", Float(disk.usage_percent.unwrap_or(0.0))),
            ],
        },
        Point {
            measurement: "network",
            tags: host_tag.clone(),
            fields: vec![
                ("sent_gb", Float(bytes_to_gb(net.sent_bytes))),
                ("recv_gb", Float(bytes_to_gb(net.recv_bytes))),
                ("sent_mb_per_sec", Float(mb_per_sec(net.sent_bytes_per_sec))),
                ("recv_mb_per_sec", Float(mb_per_sec(net.recv_bytes_per_sec))),
                ("packets_sent", Int(net.packets_sent)),
                ("packets_recv", Int(net.packets_recv)),
                ("errors", Int(net.errors)),
                ("drops", Int(net.drops)),
            ],
        },
    ];

    if let (Some(gpu), Some(index)) = (&snapshot.gpu, gpu_index.as_deref()) {
        let mut tags = host_tag.clone();
        tags.push(("gpu_index", index));
        tags.push(("gpu_name", gpu.name.as_str()));
        points.push(Point {
            measurement: "gpu",
            tags,
            fields: vec![
                ("temperature_c", Float(gpu.temperature_celsius.unwrap_or(0.0))),
                ("usage_percent", Float(gpu.usage_percent.unwrap_or(0.0))),
                ("memory_total_gb", Float(bytes_to_gb(gpu.memory.total_bytes))),
                ("memory_used_gb", Float(bytes_to_gb(gpu.memory.used_bytes))),
                ("memory_free_gb", Float(bytes_to_gb(gpu.memory.free_bytes))),
                (
                    "memory_usage_percent",
                    Float(gpu.memory.usage_percent.unwrap_or(0.0)),
                ),
                ("power_draw_w", Float(gpu.power_draw_watts.unwrap_or(0.0))),
                ("power_limit_w", Float(gpu.power_limit_watts.unwrap_or(0.0))),
                ("fan_speed_percent", Float(gpu.fan_speed_percent.unwrap_or(0.0))),
            ],
        });
    }

    points.push(Point {
        measurement: "system",
        tags: host_tag,
        fields: vec![("uptime_hours", Float(snapshot.system.uptime_hours()))],
    });

    let ts = snapshot.timestamp.timestamp_nanos_opt();
    let mut out = String::new();
    for p in &points {
        p.write_to(&mut out, ts);
    }
    out
}


#[cfg(test)]
mod tests {
    use super::memory::MemorySink;
    use super::*;
    use crate::snapshot::fixtures::snapshot;

    fn field(lines: &str, measurement: &str, key: &str) -> Option<String> {
        let line = lines
            .lines()
            .find(|l| l.split([',', ' ']).next() == Some(measurement))?;
        let fields = line.split(' ').nth(1)?;
        fields.split(',').find_map(|kv| {
            let (k, v) = kv.split_once('=')?;
            (k == key).then(|| v.to_string())
        })
    }

    #[test]
    fn two_decimal_precision_survives_encoding() {
        let mut snap = snapshot(42.0, 42.126, 10.0, None);
        let lines = encode_line_protocol(&snap);
        let cpu: f64 = field(&lines, "cpu", "usage_percent")
            .expect("cpu field")
            .parse()
            .expect("float");
        let ram: f64 = field(&lines, "memory", "usage_percent")
            .expect("ram field")
            .parse()
            .expect("float");
        assert_eq!(cpu, 42.0);
        assert_eq!(ram, 42.13);

        snap.cpu.usage_percent = 7.5;
        let lines = encode_line_protocol(&snap);
        assert_eq!(field(&lines, "cpu", "usage_percent").as_deref(), Some("7.5"));
    }

    #[test]
    fn counters_are_integer_fields() {
        let mut snap = snapshot(1.0, 1.0, 1.0, None);
        snap.network.packets_sent = 12;
        snap.network.drops = 3;
        let lines = encode_line_protocol(&snap);
        assert_eq!(field(&lines, "network", "packets_sent").as_deref(), Some("12i"));
        assert_eq!(field(&lines, "network", "drops").as_deref(), Some("3i"));
        assert_eq!(field(&lines, "cpu", "logical_cores").as_deref(), Some("8i"));
    }

    #[test]
    fn gpu_measurement_only_when_present() {
        let without = encode_line_protocol(&snapshot(1.0, 1.0, 1.0, None));
        assert!(!without.lines().any(|l| l.starts_with("gpu")));
        assert_eq!(without.lines().count(), 5);

        let with = encode_line_protocol(&snapshot(1.0, 1.0, 1.0, Some(50.0)));
        let gpu_line = with
            .lines()
            .find(|l| l.starts_with("gpu,"))
            .expect("gpu line");
        assert!(gpu_line.starts_with("gpu,host=test-host,gpu_index=0,gpu_name=Test\\ GPU "));
        assert_eq!(with.lines().count(), 6);
    }

    #[test]
    fn every_line_is_tagged_and_timestamped() {
        let snap = snapshot(1.0, 1.0, 1.0, None);
        let ts = snap
            .timestamp
            .timestamp_nanos_opt()
            .expect("timestamp in range")
            .to_string();
        for line in encode_line_protocol(&snap).lines() {
            assert!(line.contains(",host=test-host "), "{line}");
            assert!(line.ends_with(&ts), "{line}");
        }
    }

    #[test]
    fn tag_values_are_escaped() {
        assert_eq!(escape_tag("a b,c=d"), "a\\ b\\,c\\=d");
    }

    #[test]
    fn influx_sink_requires_full_configuration() {
        let cfg = SinkConfig {
            url: Some("http://localhost:8086".to_string()),
            token: Some("t".to_string()),
            org: None,
            bucket: Some("b".to_string()),
        };
        assert!(matches!(
            InfluxSink::new(&cfg, Duration::from_secs(1)),
            Err(SinkError::NotConfigured)
        ));
    }

    #[tokio::test]
    async fn memory_sink_rejects_writes_after_close() {
        let sink = MemorySink::default();
        let snap = snapshot(1.0, 1.0, 1.0, None);
        sink.write(&snap).await.expect("open sink accepts writes");
        sink.close().await.expect("close");
        assert!(matches!(sink.write(&snap).await, Err(SinkError::Closed)));
        assert_eq!(sink.len(), 1);
    }
}
