mod alerts;
mod collectors;
mod config;
mod format;
mod http;
mod jobs;
mod metrics;
mod notify;
mod router;
mod scheduler;
mod sink;
mod snapshot;
mod telegram;

use alerts::AlertThresholds;
use axum::serve;
use clap::Parser;
use collectors::{MetricsSource, SysinfoSource};
use config::Config;
use jobs::{AlertJob, AutoStatusJob, CollectJob};
use metrics::Metrics;
use notify::{Notifier, TelegramNotifier};
use router::{AuthorizedSenders, CommandRouter};
use scheduler::{JobRunner, JobStats, ScheduledJob};
use sink::{InfluxSink, Sink};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use teloxide::Bot;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "hostpulse")]
#[command(version)]
struct Cli {
    /// Optional YAML config; environment variables override it.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    print_default_config: bool,
    #[arg(long)]
    telegram_off: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return ExitCode::SUCCESS;
    }

    let mut cfg = match Config::load(cli.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };
    if cli.telegram_off {
        cfg.telegram.enabled = false;
    }

    match run(cfg).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            error!(error = %format!("{err:#}"), "fatal startup error");
            ExitCode::FAILURE
        }
    }
}

/// Runs until a termination signal. `Ok(false)` means shutdown was not clean.
async fn run(cfg: Config) -> anyhow::Result<bool> {
    let collection_interval = Duration::from_secs(cfg.collection_interval_secs);
    let io_timeout = Duration::from_secs(cfg.io_timeout_secs);

    info!(
        listen = %cfg.listen,
        interval = %humantime::format_duration(collection_interval),
        "starting hostpulse"
    );

    let metrics = Metrics::new().map_err(|e| anyhow::anyhow!("failed to register metrics: {e}"))?;
    let source: Arc<dyn MetricsSource> = Arc::new(SysinfoSource::new());

    let sink: Option<Arc<dyn Sink>> = if cfg.sink.is_configured() {
        Some(Arc::new(InfluxSink::new(&cfg.sink, io_timeout)?))
    } else {
        warn!("InfluxDB is not configured, snapshots will not be stored");
        None
    };

    let bot = match (cfg.telegram.enabled, cfg.telegram.token()) {
        (true, Some(token)) => Some(Bot::new(token)),
        (true, None) => {
            warn!("TELEGRAM_BOT_TOKEN is not set, bot, alerts and auto status are disabled");
            None
        }
        (false, _) => {
            info!("telegram is disabled");
            None
        }
    };

    let mut runner = JobRunner::new(Duration::from_secs(cfg.shutdown_grace_secs))
        .with_metrics(metrics.clone());
    let mut job_stats: Vec<(&'static str, Arc<JobStats>)> = Vec::new();
    let stats = runner.register(ScheduledJob::new(
        "collect",
        collection_interval,
        Arc::new(CollectJob::new(
            source.clone(),
            sink.clone(),
            metrics.clone(),
            io_timeout,
        )),
    ));
    job_stats.push(("collect", stats));

    if let Some(bot) = &bot {
        let notifier: Arc<dyn Notifier> = Arc::new(TelegramNotifier::new(bot.clone()));

        match cfg.alerts.chat_id {
            Some(chat_id) => {
                let thresholds = AlertThresholds::from(&cfg.alerts);
                let stats = runner.register(ScheduledJob::new(
                    "alert_check",
                    thresholds.check_interval,
                    Arc::new(AlertJob::new(
                        source.clone(),
                        notifier.clone(),
                        chat_id,
                        thresholds,
                        metrics.clone(),
                        io_timeout,
                    )),
                ));
                job_stats.push(("alert_check", stats));
            }
            None => warn!("TELEGRAM_ALERT_CHAT_ID is not set, alerts are disabled"),
        }

        if let Some(chat_id) = cfg.telegram.auto_status_chat_id {
            let stats = runner.register(ScheduledJob::new(
                "auto_status",
                Duration::from_secs(cfg.telegram.auto_status_interval_secs),
                Arc::new(AutoStatusJob::new(
                    source.clone(),
                    notifier,
                    chat_id,
                    io_timeout,
                )),
            ));
            job_stats.push(("auto_status", stats));
        }
    }

    let addr: SocketAddr = cfg.listen_addr()?;
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "http server listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_task = {
        let app = http::build_router(http::HttpAppState {
            source: source.clone(),
            sink: sink.clone(),
            metrics: metrics.clone(),
            collection_interval,
            io_timeout,
        });
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });
            if let Err(err) = server.await {
                error!(error = %err, "http server failed");
            }
        })
    };

    let telegram_task = bot.map(|bot| {
        let router = Arc::new(CommandRouter::new(
            source.clone(),
            AuthorizedSenders::new(cfg.telegram.allowed_users.iter().cloned()),
        ));
        let telegram_cfg = cfg.telegram.clone();
        let metrics = metrics.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let result = telegram::run_bot(bot, telegram_cfg, router, metrics, shutdown).await;
            if let Err(err) = result {
                error!(error = %err, "telegram bot stopped with an error");
            }
        })
    });

    info!(jobs = runner.len(), "job runner started");
    let runner_task = tokio::spawn(runner.run(shutdown_rx));

    wait_for_signal().await;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);

    let mut clean = match runner_task.await {
        Ok(report) => {
            if !report.clean {
                warn!(aborted = ?report.aborted, "jobs were aborted during shutdown");
            }
            report.clean
        }
        Err(err) => {
            error!(error = %err, "job runner task failed");
            false
        }
    };

    for (job, stats) in &job_stats {
        info!(
            job = *job,
            runs = stats.invocations(),
            skipped = stats.skipped(),
            failures = stats.failures(),
            "job summary"
        );
    }

    if let Err(err) = http_task.await {
        error!(error = %err, "http task failed");
        clean = false;
    }
    if let Some(task) = telegram_task {
        if let Err(err) = task.await {
            error!(error = %err, "telegram task failed");
            clean = false;
        }
    }

    if let Some(sink) = &sink {
        if let Err(err) = sink.close().await {
            warn!(error = %err, "failed to close sink");
            clean = false;
        }
    }

    info!(clean, "hostpulse stopped");
    Ok(clean)
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => {
                        if let Err(err) = result {
                            error!(error = %err, "failed to listen for Ctrl+C");
                        }
                    }
                    _ = term.recv() => {}
                }
                return;
            }
            Err(err) => warn!(error = %err, "failed to install SIGTERM handler"),
        }
    }

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for Ctrl+C");
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
