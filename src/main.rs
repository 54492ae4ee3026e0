use anyhow::Context;
use clap::Parser;
use pg_row_capture::serializer::SerializerCache;
use pg_row_capture::sink::{JsonLinesSink, KafkaSink};
use pg_row_capture::{Config, Error, Replicator};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "pg-row-capture")]
#[command(about = "Capture row-level changes of one PostgreSQL table", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Starting pg-row-capture");
    info!("Loading configuration from {:?}", args.config);

    let config = Config::from_file(&args.config)
        .with_context(|| format!("failed to load configuration from {:?}", args.config))?;

    info!(
        host = %config.source.host,
        port = config.source.port,
        database = %config.source.database,
        table = %config.source.table,
        slot = %config.source.slot_name(),
        unbounded = config.retry.unbounded,
        kafka = config.kafka.is_some(),
        "Configuration summary"
    );

    let (stop, shutdown) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, shutting down");
                let _ = stop.send(true);
            }
            Err(e) => warn!("Cannot listen for Ctrl+C: {}", e),
        }
    });

    let with_schema = config.kafka.as_ref().map_or(false, |k| k.with_schema);
    let cache = Arc::new(SerializerCache::json(with_schema));
    let replicator = Replicator::new(config.clone(), shutdown);

    let result = match &config.kafka {
        Some(kafka) => {
            let mut sink = KafkaSink::new(kafka, cache).context("failed to create Kafka producer")?;
            replicator.run(&mut sink).await
        }
        None => {
            let mut sink = JsonLinesSink::stdout(cache);
            replicator.run(&mut sink).await
        }
    };

    match result {
        Ok(summary) => {
            info!(
                snapshot_rows = summary.snapshot_rows,
                streamed = summary.streamed,
                "Capture finished"
            );
            Ok(())
        }
        Err(Error::Shutdown) => {
            info!("Stopped before capture started");
            Ok(())
        }
        Err(e) => {
            error!(kind = %e.kind(), "Capture failed: {}", e);
            Err(e).context("capture failed")
        }
    }
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("pg_row_capture=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("pg_row_capture=info,warn"))
    };

    // Records go to stdout, so logs stay on stderr.
    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_writer(std::io::stderr)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
