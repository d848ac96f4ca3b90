//! Switchyard binary
//!
//! Parses the command line, loads configuration, sets up logging and runs
//! the selected service on a multi-threaded tokio runtime.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, info_span, warn, Instrument};

use switchyard::aggregate::AggregatorConfig;
use switchyard::broadcast::{BroadcastLog, BroadcastLogConfig, EventProducer, ReplayResponder};
use switchyard::channel::{PongHandler, ReplyServer, ResilientChannel};
use switchyard::cli::{Cli, Commands, ConfigSubcommand, DemoScenario};
use switchyard::config::{self, parse_addr, SwitchyardConfig};
use switchyard::demo;
use switchyard::dispatch::{DispatchRouterConfig, Worker, WorkerConfig};
use switchyard::error::{Error, Result};
use switchyard::frontend::{Frontend, FrontendHandler};
use switchyard::logging;
use switchyard::protocol::{RequestEnvelope, ResponseEnvelope};
use switchyard::types::CorrelationId;
use switchyard::version;

fn main() -> Result<()> {
    // Parse CLI arguments first (before logging, so we know verbosity)
    let cli = Cli::parse();

    match &cli.command {
        Commands::Version => {
            version::print_version();
            return Ok(());
        }
        Commands::Config { subcommand } => {
            logging::init_simple(tracing::Level::WARN)?;
            if let Err(e) = handle_config_command(subcommand.clone(), cli.config.as_deref()) {
                eprint!("{}", e.format_for_terminal());
                std::process::exit(e.exit_code());
            }
            return Ok(());
        }
        _ => {}
    }

    let config = match SwitchyardConfig::load(cli.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprint!("{}", e.format_for_terminal());
            std::process::exit(e.exit_code());
        }
    };

    // The guards must be kept alive for the lifetime of the program
    let _log_guards = logging::init_logging(&config.logging, cli.verbose, cli.quiet)?;

    let build = version::build_info();
    info!(
        version = %build.full_version(),
        target = %build.target,
        profile = %build.profile,
        "Starting switchyard"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(num_cpus::get().min(8))
        .thread_name("switchyard")
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create async runtime: {}", e)))?;

    let result = runtime.block_on(async move {
        match cli.command {
            Commands::Serve { no_producer } => serve(config, no_producer).await,
            Commands::Worker { index } => run_worker(config, index).await,
            Commands::ReplyServer {
                bind,
                delay_first_n,
                delay_ms,
            } => run_reply_server(config, bind, delay_first_n, Duration::from_millis(delay_ms)).await,
            Commands::Request { message } => run_request(config, message).await,
            Commands::Demo {
                scenario,
                live,
                workers,
                requests,
                delay_first_n,
                delay_ms,
            } => {
                let outcome = match scenario {
                    DemoScenario::Pubsub => demo::run_pubsub(&config, live).await,
                    DemoScenario::Reqrep => {
                        demo::run_reqrep(&config, delay_first_n, Duration::from_millis(delay_ms)).await
                    }
                    DemoScenario::RoundRobin => demo::run_round_robin(&config, workers, requests).await,
                };
                outcome.map_err(|e| Error::Internal(format!("{:#}", e)))
            }
            Commands::Version | Commands::Config { .. } => {
                // Already handled above
                unreachable!();
            }
        }
    });

    if let Err(e) = result {
        error!(error = %e.format_for_log(), "Command failed");
        eprint!("{}", e.format_for_terminal());
        std::process::exit(e.exit_code());
    }

    Ok(())
}

/// Run every service until Ctrl+C
async fn serve(config: SwitchyardConfig, no_producer: bool) -> Result<()> {
    let (log, log_task) = BroadcastLog::start(BroadcastLogConfig::from_settings(&config.broadcast)?).await?;

    let replay_addr = parse_addr("broadcast.replay_addr", &config.broadcast.replay_addr)?;
    let responder = ReplayResponder::bind(replay_addr, log.clone(), config.broadcast.signal_gaps).await?;
    let responder_task = responder.spawn();

    let producer_task = match config.broadcast.publish_interval() {
        Some(interval) if !no_producer => Some(EventProducer::new(log.clone(), interval).spawn()),
        _ => None,
    };

    let (frontend, tasks) = Frontend::start(
        DispatchRouterConfig::from_settings(&config.router)?,
        AggregatorConfig::from_settings(&config.aggregator)?,
    )
    .await?;

    // Request channels enter the dispatch pipeline here
    let endpoint = parse_addr("channel.endpoint", &config.channel.endpoint)?;
    let request_server = ReplyServer::bind(endpoint, Arc::new(FrontendHandler::new(frontend.clone()))).await?;

    info!(
        publish = %log.publish_addr(),
        replay = %replay_addr,
        requests = %request_server.local_addr(),
        router = %frontend.router().local_addr(),
        results = %frontend.aggregator().local_addr(),
        producer = producer_task.is_some(),
        "All services running, press Ctrl+C to stop"
    );

    // Periodic status line
    let mut status_timer = tokio::time::interval(Duration::from_secs(60));
    status_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let shutdown_signal = tokio::signal::ctrl_c();
    tokio::pin!(shutdown_signal);

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Shutdown signal received");
                break;
            }
            _ = status_timer.tick() => {
                match (log.window().await, frontend.router().stats().await, frontend.aggregator().stats().await) {
                    (Ok(window), Ok(router), Ok(aggregator)) => info!(
                        next_seq = window.next_seq,
                        retained = window.len,
                        workers = router.workers,
                        dispatched = router.dispatched,
                        pending = aggregator.pending,
                        resolved = aggregator.resolved,
                        "Status"
                    ),
                    _ => {
                        warn!("A service stopped unexpectedly");
                        break;
                    }
                }
            }
        }
    }

    request_server.shutdown();
    let stopped = frontend.shutdown(true).await?;
    info!(workers = stopped, "Sent STOP to workers");
    log.shutdown().await?;

    for task in tasks.into_iter().chain([log_task, responder_task]).chain(producer_task) {
        if let Err(e) = task.await {
            warn!(error = %e, "Service task ended abnormally");
        }
    }
    info!("Shutdown complete");
    Ok(())
}

async fn run_worker(config: SwitchyardConfig, index: Option<u16>) -> Result<()> {
    let mut worker_config = WorkerConfig::from_config(&config)?;
    if let Some(index) = index {
        worker_config.identity = switchyard::types::WorkerIdentity::from_index(index);
    }

    let worker = Worker::echo(worker_config);
    let span = info_span!("worker", id = %worker.identity());
    tokio::select! {
        report = worker.run().instrument(span) => {
            let report = report?;
            info!(
                worker = %report.identity,
                handled = report.handled,
                exit = ?report.exit,
                "Worker finished"
            );
        }
        _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
    }
    Ok(())
}

async fn run_reply_server(
    config: SwitchyardConfig,
    bind: Option<String>,
    delay_first_n: usize,
    delay: Duration,
) -> Result<()> {
    let addr = match bind {
        Some(addr) => parse_addr("--bind", &addr)?,
        None => parse_addr("channel.endpoint", &config.channel.endpoint)?,
    };
    let handler = Arc::new(PongHandler::with_delayed_replies(delay_first_n, delay));
    let server = ReplyServer::bind(addr, handler.clone()).await?;
    info!(
        addr = %server.local_addr(),
        delay_first_n,
        delay_ms = delay.as_millis() as u64,
        "Reply server running, press Ctrl+C to stop"
    );

    tokio::signal::ctrl_c().await?;
    info!(requests = handler.requests_seen(), "Shutdown signal received");
    Ok(())
}

async fn run_request(config: SwitchyardConfig, message: String) -> Result<()> {
    let body = serde_json::from_str(&message).unwrap_or(serde_json::Value::String(message));
    let mut channel = ResilientChannel::from_settings(&config.channel)?;

    // A fresh correlation id per attempt, the abandoned one may still be pending
    let reply = channel
        .request_with(|_| {
            RequestEnvelope::new(CorrelationId::random(), body.clone())
                .to_frames()
                .unwrap_or_default()
        })
        .await?;

    match ResponseEnvelope::from_frames(&reply) {
        Ok(response) => {
            info!(
                request_id = %response.correlation_id,
                worker = %response.worker_identity,
                "Response received"
            );
            let result = response.into_result()?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        // Plain reply servers answer with text frames
        Err(_) => {
            for frame in reply {
                println!("{}", String::from_utf8_lossy(&frame));
            }
        }
    }
    info!(attempts = channel.attempts_made(), "Request complete");
    Ok(())
}

/// Handle configuration subcommands
fn handle_config_command(subcommand: ConfigSubcommand, config_path: Option<&str>) -> Result<()> {
    match subcommand {
        ConfigSubcommand::Show => {
            let cfg = SwitchyardConfig::load(config_path)?;
            println!("{}", toml::to_string_pretty(&cfg)?);
        }
        ConfigSubcommand::Init { path, force } => {
            let written = config::init_config(path.as_deref(), force)?;
            println!("Configuration written to {}", written.display());
        }
        ConfigSubcommand::Validate => {
            SwitchyardConfig::load(config_path)?;
            println!("Configuration is valid.");
        }
    }

    Ok(())
}
