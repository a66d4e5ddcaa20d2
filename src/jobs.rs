use crate::alerts::{AlertEvaluator, AlertThresholds};
use crate::collectors::{sample_blocking, MetricsSource};
use crate::format;
use crate::metrics::Metrics;
use crate::notify::Notifier;
use crate::scheduler::Job;
use crate::sink::Sink;
use anyhow::Context;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info};

/// Samples the host and writes the snapshot to the sink, if one is configured.
pub struct CollectJob {
    source: Arc<dyn MetricsSource>,
    sink: Option<Arc<dyn Sink>>,
    metrics: Arc<Metrics>,
    io_timeout: Duration,
}

impl CollectJob {
    pub fn new(
        source: Arc<dyn MetricsSource>,
        sink: Option<Arc<dyn Sink>>,
        metrics: Arc<Metrics>,
        io_timeout: Duration,
    ) -> Self {
        Self {
            source,
            sink,
            metrics,
            io_timeout,
        }
    }
}

#[async_trait]
impl Job for CollectJob {
    async fn run(&self) -> anyhow::Result<()> {
        let snapshot = sample_blocking(&self.source).await?;
        self.metrics.update_from_snapshot(&snapshot);

        let Some(sink) = &self.sink else {
            return Ok(());
        };

        match timeout(self.io_timeout, sink.write(&snapshot)).await {
            Ok(Ok(())) => {
                self.metrics.inc_sink_write("ok");
                debug!(timestamp = %snapshot.timestamp, "snapshot stored");
                Ok(())
            }
            Ok(Err(err)) => {
                self.metrics.inc_sink_write("error");
                Err(err).context("sink write failed")
            }
            Err(_) => {
                self.metrics.inc_sink_write("timeout");
                anyhow::bail!(
                    "sink write timed out after {}",
                    humantime::format_duration(self.io_timeout)
                )
            }
        }
    }
}

/// Checks thresholds and notifies the alert chat. Cooldown state is consumed
/// when an alert fires, whether or not the message gets through.
pub struct AlertJob {
    source: Arc<dyn MetricsSource>,
    notifier: Arc<dyn Notifier>,
    chat_id: i64,
    thresholds: AlertThresholds,
    evaluator: Mutex<AlertEvaluator>,
    metrics: Arc<Metrics>,
    io_timeout: Duration,
}

impl AlertJob {
    pub fn new(
        source: Arc<dyn MetricsSource>,
        notifier: Arc<dyn Notifier>,
        chat_id: i64,
        thresholds: AlertThresholds,
        metrics: Arc<Metrics>,
        io_timeout: Duration,
    ) -> Self {
        Self {
            source,
            notifier,
            chat_id,
            thresholds,
            evaluator: Mutex::new(AlertEvaluator::new()),
            metrics,
            io_timeout,
        }
    }
}

#[async_trait]
impl Job for AlertJob {
    async fn run(&self) -> anyhow::Result<()> {
        let snapshot = sample_blocking(&self.source).await?;

        let events = {
            let mut evaluator = self.evaluator.lock().await;
            evaluator.evaluate(&snapshot, &self.thresholds, Instant::now())
        };
        if events.is_empty() {
            return Ok(());
        }

        let host = snapshot.system.host_name.as_deref().unwrap_or("unknown");
        let text = format::format_alert(&events, host, snapshot.timestamp);
        deliver(self.notifier.as_ref(), self.chat_id, &text, self.io_timeout)
            .await
            .context("alert delivery failed")?;

        for event in &events {
            self.metrics.inc_alert_sent(event.class.as_str());
        }
        info!(count = events.len(), chat_id = self.chat_id, "alert sent");
        Ok(())
    }
}

/// Periodic status digest to a fixed chat.
pub struct AutoStatusJob {
    source: Arc<dyn MetricsSource>,
    notifier: Arc<dyn Notifier>,
    chat_id: i64,
    io_timeout: Duration,
}

impl AutoStatusJob {
    pub fn new(
        source: Arc<dyn MetricsSource>,
        notifier: Arc<dyn Notifier>,
        chat_id: i64,
        io_timeout: Duration,
    ) -> Self {
        Self {
            source,
            notifier,
            chat_id,
            io_timeout,
        }
    }
}

#[async_trait]
impl Job for AutoStatusJob {
    async fn run(&self) -> anyhow::Result<()> {
        let snapshot = sample_blocking(&self.source).await?;
        let text = format::format_auto_status(&snapshot);
        deliver(self.notifier.as_ref(), self.chat_id, &text, self.io_timeout)
            .await
            .context("auto status delivery failed")?;
        debug!(chat_id = self.chat_id, "auto status sent");
        Ok(())
    }
}

async fn deliver(
    notifier: &dyn Notifier,
    chat_id: i64,
    text: &str,
    io_timeout: Duration,
) -> anyhow::Result<()> {
    match timeout(io_timeout, notifier.send(chat_id, text)).await {
        Ok(result) => result.map_err(anyhow::Error::from),
        Err(_) => anyhow::bail!(
            "delivery to chat {chat_id} timed out after {}",
            humantime::format_duration(io_timeout)
        ),
    }
}
