use anyhow::Context;
use clap::Parser;
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;

use nsm_wire::capability;
use nsm_wire::msg::MessageType;

use nsmd::config::Config;
use nsmd::discovery::{DiscoveryDriver, DiscoverySettings, StaticEnumerator};
use nsmd::engine::SensorEngine;
use nsmd::events::{EventDispatcher, RediscoveryHandler};
use nsmd::metrics::Metrics;
use nsmd::registry::EndpointRegistry;
use nsmd::sensor::factory;
use nsmd::sinks::{JsonlSink, LogSink, SinkList};
use nsmd::transport::{SockTransport, Transport};

#[derive(Parser, Debug)]
#[command(name = "nsmd")]
#[command(about = "NSM device management daemon")]
struct Args {
    /// Path to config file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Run discovery, print the registry, and exit
    #[arg(long)]
    discover_only: bool,
}

// The engine's concurrency model is cooperative: one event loop
// drives every task, and release paths only schedule work for later
// ticks. A single-threaded runtime keeps that contract literal.
#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };
    println!("[nsmd] starting NSM management daemon...");

    let metrics = Arc::new(Metrics::new());

    // roll up polls/s every second
    {
        let metrics = Arc::clone(&metrics);
        tokio::spawn(async move {
            loop {
                sleep(Duration::from_secs(1)).await;
                metrics.rollup();
            }
        });
    }

    // log a counter summary every 10 seconds
    {
        let metrics = Arc::clone(&metrics);
        tokio::spawn(async move {
            loop {
                sleep(Duration::from_secs(10)).await;
                info!("metrics: {}", metrics.summary());
            }
        });
    }

    let transport: Arc<dyn Transport> = Arc::new(
        SockTransport::connect(&config.transport.socket, &config.transport.local_socket)
            .with_context(|| {
                format!("failed to connect to demux socket {}", config.transport.socket)
            })?,
    );
    info!(
        "[nsmd] transport up on {} (local eid {})",
        config.transport.socket, config.transport.local_eid
    );

    let dispatcher = Arc::new(EventDispatcher::new(
        Arc::clone(&transport),
        Arc::clone(&metrics),
    ));
    let (event_tx, event_rx) = mpsc::channel(256);
    transport.subscribe_events(event_tx);
    let _intake = Arc::clone(&dispatcher).spawn_intake(event_rx);

    let registry = Arc::new(EndpointRegistry::new());

    let built = factory::build_stores(&config)?;
    for name in &built.awaiting_discovery {
        warn!("[nsmd] sensor {name} deferred until its endpoint is discovered");
    }
    let endpoints = Arc::new(built.endpoints);
    let sensors = Arc::new(built.sensors);

    let mut sinks = SinkList::new();
    sinks.register(LogSink);
    if let Some(path) = &config.logging.readings_file {
        match JsonlSink::new(path).await {
            Ok(sink) => {
                info!("[nsmd] appending readings to {path}");
                sinks.register(sink);
            }
            Err(e) => warn!("[nsmd] readings file {path} unavailable: {e}"),
        }
    }

    // Discovery: rediscovery events funnel back into the driver.
    let settings = DiscoverySettings::from_config(&config)?;
    let (ready_tx, mut ready_rx) = mpsc::channel(64);
    let (rediscover_tx, rediscover_rx) = mpsc::channel(64);
    dispatcher
        .register_global(
            MessageType::DeviceCapability,
            capability::REDISCOVERY_EVENT_ID,
            Arc::new(RediscoveryHandler::new(rediscover_tx)),
        )
        .expect("rediscovery handler registered twice");
    let driver = DiscoveryDriver::new(
        Arc::clone(&transport),
        Arc::clone(&registry),
        Arc::clone(&metrics),
        settings,
        ready_tx,
    );
    let enumerator = Arc::new(StaticEnumerator::from_config(&config.endpoints));
    tokio::spawn(driver.run(enumerator, rediscover_rx));

    if args.discover_only {
        let expected = config.endpoints.len();
        let mut seen = 0usize;
        let deadline = sleep(Duration::from_secs(30));
        tokio::pin!(deadline);
        while seen < expected {
            tokio::select! {
                ready = ready_rx.recv() => match ready {
                    Some(ready) => {
                        println!("[nsmd] discovered eid={} uuid={}", ready.eid, ready.uuid);
                        seen += 1;
                    }
                    None => break,
                },
                _ = &mut deadline => {
                    warn!("[nsmd] discovery incomplete after 30 s ({seen}/{expected})");
                    break;
                }
            }
        }
        println!("[nsmd] discovery done ({seen}/{expected} endpoints)");
        return Ok(());
    }

    let engine = SensorEngine::new(
        config.polling.clone(),
        Arc::clone(&endpoints),
        Arc::clone(&sensors),
        Arc::clone(&registry),
        Arc::clone(&transport),
        Arc::clone(&dispatcher),
        Arc::new(sinks),
        Arc::clone(&metrics),
    );
    let _loops = engine.start();
    info!(
        "[nsmd] engine running: {} endpoints, {} sensors",
        endpoints.len(),
        sensors.len()
    );

    tokio::spawn(async move {
        while let Some(ready) = ready_rx.recv().await {
            info!("[nsmd] endpoint ready: eid={} uuid={}", ready.eid, ready.uuid);
        }
    });

    {
        use tokio::signal::unix::{signal, SignalKind};
        tokio::spawn(async {
            let mut sigterm = signal(SignalKind::terminate()).expect("sigterm handler");
            sigterm.recv().await;
            println!("[nsmd] SIGTERM received, shutting down");
            std::process::exit(0);
        });
    }

    println!("[nsmd] running. Press Ctrl+C to exit.");
    tokio::signal::ctrl_c().await?;
    println!("[nsmd] shutting down...");
    Ok(())
}
