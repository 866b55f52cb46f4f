use anyhow::Context;
use axum::{routing::get, Router};
use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;
use simulator::clock::{Clock, SystemClock};
use simulator::config::{Cli, LocationMode, Settings, TransportArgs};
use simulator::errors::Result;
use simulator::fleet::{build_fleet, FleetSpec};
use simulator::locations::LocationTable;
use simulator::metrics;
use simulator::scheduler::{Backoff, Scheduler};
use simulator::sink::{
    CoapSink, CoapSinkConfig, KafkaRestSink, KafkaRestSinkConfig, MqttSink, MqttSinkConfig, Sink,
    SyslogSink, SyslogSinkConfig, FACILITY_USER, SEVERITY_NOTICE,
};
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const MQTT_CHANNEL_CAPACITY: usize = 100;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run().await {
        error!("Simulator failed: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = cli.settings().context("invalid configuration")?;

    info!("Starting IoT fleet simulator");
    info!(
        "Transport: {:?}, Devices: {}, Seed: {}, Interval: {}-{}ms",
        settings.transport,
        settings.fleet_size,
        settings.seed,
        settings.scheduler.interval.min_ms(),
        settings.scheduler.interval.max_ms()
    );

    metrics::init_metrics()?;
    if let Some(addr) = &cli.fleet.metrics_addr {
        serve_metrics(addr).await?;
    }

    let locations = match settings.location_mode {
        LocationMode::Places => Some(LocationTable::load(&settings.location_data)),
        LocationMode::Regions => None,
    };
    let spec = FleetSpec {
        size: settings.fleet_size,
        seed: &settings.seed,
        locations: locations.as_ref(),
        unit: settings.unit,
    };
    let mut rng = StdRng::from_entropy();
    let fleet = build_fleet(
        &spec,
        &settings.scheduler.interval,
        SystemClock.epoch_seconds(),
        &mut rng,
    )
    .context("failed to build fleet")?;

    for device in &fleet {
        info!(
            "Device {} serial {} at {} (mean {:.1}{})",
            device.id,
            device.serial_number,
            device.location.name(),
            device.profile.mean,
            settings.unit.label()
        );
    }

    let sink = connect_with_retry(&cli.transport, &settings)
        .await
        .context("failed to connect sink")?;

    let scheduler = Scheduler::new(
        fleet,
        sink,
        SystemClock,
        settings.encoder.clone(),
        settings.scheduler.clone(),
    )?
    .with_rng(rng);

    let summary = scheduler.run(shutdown_signal()).await;
    info!(
        "Stopped after {} sweeps: {} messages sent, {} failed",
        summary.sweeps, summary.sent, summary.failed
    );
    Ok(())
}

/// Initial connection uses the same backoff as in-loop reconnects.
async fn connect_with_retry(transport: &TransportArgs, settings: &Settings) -> Result<Box<dyn Sink>> {
    let policy = settings.scheduler.reconnect;
    let mut backoff = Backoff::new(policy);

    loop {
        match connect_sink(transport, settings).await {
            Ok(sink) => return Ok(sink),
            Err(e) => match backoff.next_delay() {
                Some(delay) => {
                    warn!(
                        "Failed to connect (attempt {}/{}), retrying in {:?}: {}",
                        backoff.attempts(),
                        policy.max_attempts,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                None => return Err(e),
            },
        }
    }
}

async fn connect_sink(transport: &TransportArgs, settings: &Settings) -> Result<Box<dyn Sink>> {
    let sink: Box<dyn Sink> = match transport {
        TransportArgs::Mqtt(args) => Box::new(
            MqttSink::connect(MqttSinkConfig {
                host: args.host.clone(),
                port: args.port,
                client_id: args
                    .client_id
                    .clone()
                    .unwrap_or_else(|| format!("sim-{}", uuid::Uuid::new_v4())),
                keep_alive: Duration::from_secs(args.keepalive_secs),
                topic_prefix: args.topic_prefix.clone(),
                manufacturer: settings.manufacturer.clone(),
                device_family: settings.device_family.clone(),
                capacity: MQTT_CHANNEL_CAPACITY,
            })
            .await?,
        ),
        TransportArgs::Coap(args) => Box::new(
            CoapSink::connect(CoapSinkConfig {
                host: args.host.clone(),
                port: args.port,
                path: args.path.clone(),
                timeout: Duration::from_millis(args.timeout_ms),
            })
            .await?,
        ),
        TransportArgs::Http(args) => Box::new(KafkaRestSink::new(KafkaRestSinkConfig {
            base_url: args.base_url(),
            topic: args.topic.clone(),
            timeout: Duration::from_millis(args.timeout_ms),
        })?),
        #[cfg(feature = "kafka")]
        TransportArgs::Kafka(args) => {
            Box::new(simulator::sink::KafkaSink::new(simulator::sink::KafkaSinkConfig {
                bootstrap_servers: args.bootstrap_servers.clone(),
                client_id: args.client_id.clone(),
                topic: args.topic.clone(),
                delivery_timeout: Duration::from_millis(args.delivery_timeout_ms),
                properties: args.parsed_properties()?,
            })?)
        }
        #[cfg(feature = "amqp")]
        TransportArgs::Amqp(args) => Box::new(
            simulator::sink::AmqpSink::connect(simulator::sink::AmqpSinkConfig {
                uri: args.uri.clone(),
                queue: args.queue.clone(),
            })
            .await?,
        ),
        TransportArgs::Syslog(args) => Box::new(
            SyslogSink::connect(SyslogSinkConfig {
                host: args.host.clone(),
                port: args.port,
                protocol: args.protocol,
                hostname: args.hostname.clone(),
                vendor: settings.manufacturer.clone(),
                product: settings.device_family.clone(),
                facility: FACILITY_USER,
                severity: SEVERITY_NOTICE,
            })
            .await?,
        ),
    };
    Ok(sink)
}

async fn serve_metrics(addr: &str) -> anyhow::Result<()> {
    let app = Router::new().route("/metrics", get(metrics_handler));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics server to {}", addr))?;

    info!("Metrics server listening on {}", addr);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap_or_else(|e| {
            error!("Metrics server error: {}", e);
        });
    });
    Ok(())
}

async fn metrics_handler() -> String {
    metrics::gather_metrics().unwrap_or_else(|e| {
        error!("Failed to encode metrics: {}", e);
        String::new()
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Received shutdown signal");
}
