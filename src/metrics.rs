use crate::snapshot::MetricsSnapshot;
use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, Registry, TextEncoder};
use std::sync::Arc;
use std::time::Instant;

/// Self-metrics of the agent, served at `/metrics/prometheus`.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    started_at: Instant,
    pub agent_cpu_usage_percent: Gauge,
    pub agent_ram_usage_percent: Gauge,
    pub agent_disk_usage_percent: Gauge,
    pub agent_gpu_memory_usage_percent: Gauge,
    pub agent_last_collect_timestamp_seconds: Gauge,
    pub agent_uptime_seconds: Gauge,
    pub agent_job_runs_total: CounterVec,
    pub agent_job_skipped_total: CounterVec,
    pub agent_job_failures_total: CounterVec,
    pub agent_sink_writes_total: CounterVec,
    pub agent_alerts_sent_total: CounterVec,
    pub agent_commands_total: CounterVec,
    pub agent_scrape_count_total: Counter,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let agent_cpu_usage_percent = Gauge::with_opts(opts!(
            "agent_cpu_usage_percent",
            "CPU usage of the last snapshot in percent (0..100)"
        ))?;
        let agent_ram_usage_percent = Gauge::with_opts(opts!(
            "agent_ram_usage_percent",
            "RAM usage of the last snapshot in percent"
        ))?;
        let agent_disk_usage_percent = Gauge::with_opts(opts!(
            "agent_disk_usage_percent",
            "Aggregated disk usage of the last snapshot in percent"
        ))?;
        let agent_gpu_memory_usage_percent = Gauge::with_opts(opts!(
            "agent_gpu_memory_usage_percent",
            "GPU memory usage of the last snapshot in percent, 0 without a GPU"
        ))?;
        let agent_last_collect_timestamp_seconds = Gauge::with_opts(opts!(
            "agent_last_collect_timestamp_seconds",
            "Unix time of the last snapshot"
        ))?;
        let agent_uptime_seconds =
            Gauge::with_opts(opts!("agent_uptime_seconds", "Agent uptime in seconds"))?;
        let agent_job_runs_total = CounterVec::new(
            opts!("agent_job_runs_total", "Scheduled job invocations by job"),
            &["job"],
        )?;
        let agent_job_skipped_total = CounterVec::new(
            opts!(
                "agent_job_skipped_total",
                "Ticks skipped because the previous run was still in flight"
            ),
            &["job"],
        )?;
        let agent_job_failures_total = CounterVec::new(
            opts!("agent_job_failures_total", "Failed or panicked job runs by job"),
            &["job"],
        )?;
        let agent_sink_writes_total = CounterVec::new(
            opts!("agent_sink_writes_total", "Sink writes by outcome"),
            &["outcome"],
        )?;
        let agent_alerts_sent_total = CounterVec::new(
            opts!("agent_alerts_sent_total", "Delivered alerts by metric class"),
            &["class"],
        )?;
        let agent_commands_total = CounterVec::new(
            opts!("agent_commands_total", "Bot commands by name and outcome"),
            &["command", "outcome"],
        )?;
        let agent_scrape_count_total = Counter::with_opts(opts!(
            "agent_scrape_count_total",
            "Number of /metrics/prometheus scrapes"
        ))?;

        register(&registry, &agent_cpu_usage_percent)?;
        register(&registry, &agent_ram_usage_percent)?;
        register(&registry, &agent_disk_usage_percent)?;
        register(&registry, &agent_gpu_memory_usage_percent)?;
        register(&registry, &agent_last_collect_timestamp_seconds)?;
        register(&registry, &agent_uptime_seconds)?;
        register(&registry, &agent_job_runs_total)?;
        register(&registry, &agent_job_skipped_total)?;
        register(&registry, &agent_job_failures_total)?;
        register(&registry, &agent_sink_writes_total)?;
        register(&registry, &agent_alerts_sent_total)?;
        register(&registry, &agent_commands_total)?;
        register(&registry, &agent_scrape_count_total)?;

        Ok(Arc::new(Self {
            registry,
            started_at: Instant::now(),
            agent_cpu_usage_percent,
            agent_ram_usage_percent,
            agent_disk_usage_percent,
            agent_gpu_memory_usage_percent,
            agent_last_collect_timestamp_seconds,
            agent_uptime_seconds,
            agent_job_runs_total,
            agent_job_skipped_total,
            agent_job_failures_total,
            agent_sink_writes_total,
            agent_alerts_sent_total,
            agent_commands_total,
            agent_scrape_count_total,
        }))
    }

    pub fn update_from_snapshot(&self, snapshot: &MetricsSnapshot) {
        self.agent_cpu_usage_percent.set(snapshot.cpu.usage_percent);
        self.agent_ram_usage_percent
            .set(snapshot.memory.usage_percent.unwrap_or(0.0));
        self.agent_disk_usage_percent
            .set(snapshot.disk.usage_percent.unwrap_or(0.0));
        self.agent_gpu_memory_usage_percent.set(
            snapshot
                .gpu
                .as_ref()
                .and_then(|g| g.memory.usage_percent)
                .unwrap_or(0.0),
        );
        self.agent_last_collect_timestamp_seconds
            .set(snapshot.timestamp.timestamp() as f64);
    }

    pub fn inc_job_run(&self, job: &str) {
        self.agent_job_runs_total.with_label_values(&[job]).inc();
    }

    pub fn inc_job_skipped(&self, job: &str) {
        self.agent_job_skipped_total.with_label_values(&[job]).inc();
    }

    pub fn inc_job_failure(&self, job: &str) {
        self.agent_job_failures_total
            .with_label_values(&[job])
            .inc();
    }

    pub fn inc_sink_write(&self, outcome: &str) {
        self.agent_sink_writes_total
            .with_label_values(&[outcome])
            .inc();
    }

    pub fn inc_alert_sent(&self, class: &str) {
        self.agent_alerts_sent_total
            .with_label_values(&[class])
            .inc();
    }

    pub fn inc_command(&self, command: &str, outcome: &str) {
        self.agent_commands_total
            .with_label_values(&[command, outcome])
            .inc();
    }

    pub fn inc_scrape_count(&self) {
        self.agent_scrape_count_total.inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        self.agent_uptime_seconds
            .set(self.started_at.elapsed().as_secs_f64());

        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}
