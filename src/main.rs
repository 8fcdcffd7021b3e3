mod collectors;
mod config;
mod http;
mod metrics;
mod registry;
mod report;
mod snapshot;
mod state;
mod transport;

use axum::serve;
use clap::{Parser, ValueEnum};
use collectors::fleet::{CollectError, CollectOptions, FleetCollector};
use collectors::runner::RemoteCommandRunner;
use collectors::suite::DiagnosticSuite;
use config::Config;
use metrics::Metrics;
use registry::HostRegistry;
use report::LatencyReport;
use snapshot::{FleetSnapshot, HostStatus};
use state::State;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;
use tokio::sync::{watch, Notify, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use transport::credentials::KeyFileResolver;
use transport::openssh::OpenSshTransport;

#[derive(Parser, Debug)]
#[command(name = "fleetmond")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "./servers.yaml")]
    config: String,
    #[arg(long)]
    print_default_config: bool,
    /// Run a single collection cycle, print it and exit.
    #[arg(long)]
    once: bool,
    /// Run a single collection cycle and print only its timing summary.
    #[arg(long, conflicts_with = "once")]
    latency_report: bool,
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
    #[arg(long)]
    max_parallel: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Json,
    Text,
}

/// Everything one collection cycle needs; built once from the config.
#[derive(Clone)]
struct Cycle {
    collector: FleetCollector,
    registry: Arc<HostRegistry>,
    suite: Arc<DiagnosticSuite>,
    opts: CollectOptions,
}

impl Cycle {
    async fn run(&self) -> Result<(FleetSnapshot, Duration), CollectError> {
        let started = Instant::now();
        let snapshot = self
            .collector
            .collect(&self.registry, self.suite.clone(), self.opts)
            .await?;
        Ok((snapshot, started.elapsed()))
    }
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let mut cfg = match Config::load_from_file(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, config = %cli.config, "failed to load configuration");
            std::process::exit(1);
        }
    };
    if let Some(max_parallel) = cli.max_parallel {
        if max_parallel == 0 {
            error!("--max-parallel must be >= 1");
            std::process::exit(1);
        }
        cfg.collection.max_parallel = max_parallel;
    }

    let registry = match cfg.registry() {
        Ok(registry) => Arc::new(registry),
        Err(err) => {
            error!(error = %err, "invalid server list");
            std::process::exit(1);
        }
    };

    let suite = match DiagnosticSuite::standard() {
        Ok(suite) => Arc::new(suite),
        Err(err) => {
            error!(error = %err, "invalid diagnostic suite");
            std::process::exit(1);
        }
    };

    let transport = Arc::new(OpenSshTransport::new(
        cfg.ssh.clone(),
        Arc::new(KeyFileResolver::from_env()),
    ));
    let runner = Arc::new(RemoteCommandRunner::new(transport.clone()));
    let cycle = Cycle {
        collector: FleetCollector::new(runner),
        registry,
        suite,
        opts: cfg.collect_options(),
    };

    if cli.once || cli.latency_report {
        let code = run_once(&cycle, cli.format, cli.latency_report).await;
        transport.drain().await;
        std::process::exit(code);
    }

    info!(
        listen = %cfg.listen,
        hosts = cycle.registry.len(),
        refresh_interval_secs = cfg.refresh_interval_secs,
        max_parallel = cfg.collection.max_parallel,
        "starting fleetmond"
    );

    let shared_state = Arc::new(RwLock::new(State::new(now_unix())));
    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "failed to initialise metrics");
            std::process::exit(1);
        }
    };
    let refresh = Arc::new(Notify::new());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_task = {
        let listen = cfg.listen.clone();
        let app = http::build_router(metrics.clone(), shared_state.clone(), refresh.clone());
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let addr: SocketAddr = match listen.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    error!(error = %err, listen = %listen, "invalid listen address");
                    return;
                }
            };

            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, "failed to start HTTP server");
                    return;
                }
            };

            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "HTTP server error");
            }
        })
    };

    let collector_task = {
        let metrics = metrics.clone();
        let shared_state = shared_state.clone();
        let refresh = refresh.clone();
        let mut shutdown = shutdown_rx.clone();
        let interval = Duration::from_secs(cfg.refresh_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        info!("refresh loop stopping");
                        break;
                    }
                    _ = ticker.tick() => {}
                    _ = refresh.notified() => {
                        info!("manual refresh requested");
                        ticker.reset();
                    }
                }

                let result = tokio::select! {
                    _ = shutdown.changed() => {
                        info!("collection cycle abandoned on shutdown");
                        break;
                    }
                    result = cycle.run() => result,
                };

                match result {
                    Ok((snapshot, elapsed)) => {
                        let guard = {
                            let mut guard = shared_state.write().await;
                            let changes =
                                guard.update_collected(snapshot, elapsed.as_millis() as u64);
                            for change in changes {
                                let from = change.from.map(HostStatus::as_str).unwrap_or("unknown");
                                if change.to == HostStatus::Offline {
                                    warn!(host = %change.host, from, to = change.to.as_str(), "host status changed");
                                } else {
                                    info!(host = %change.host, from, to = change.to.as_str(), "host status changed");
                                }
                            }
                            guard.downgrade()
                        };
                        metrics.update_from_state(&guard);
                    }
                    Err(err) => {
                        metrics.inc_collect_error("inconsistent");
                        error!(error = %err, "collection cycle failed");
                    }
                }
            }
        })
    };

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to wait for Ctrl+C");
    }
    info!("Ctrl+C received, shutting down");

    let _ = shutdown_tx.send(true);

    let _ = collector_task.await;
    let _ = http_task.await;
    transport.drain().await;
}

async fn run_once(cycle: &Cycle, format: OutputFormat, latency_only: bool) -> i32 {
    let (snapshot, elapsed) = match cycle.run().await {
        Ok(done) => done,
        Err(err) => {
            error!(error = %err, "collection cycle failed");
            return 1;
        }
    };

    let rendered = if latency_only {
        let report = LatencyReport::from_snapshot(&snapshot, elapsed);
        match format {
            OutputFormat::Json => serde_json::to_string_pretty(&report),
            OutputFormat::Text => Ok(report.render()),
        }
    } else {
        match format {
            OutputFormat::Json => serde_json::to_string_pretty(&snapshot),
            OutputFormat::Text => Ok(report::render_text(&snapshot)),
        }
    };

    match rendered {
        Ok(text) => {
            println!("{text}");
            0
        }
        Err(err) => {
            error!(error = %err, "failed to serialise result");
            1
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
