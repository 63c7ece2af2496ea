//! VIRTA broker entrypoint
//!
//! One binary, one subcommand per backend. Global flags cover the ingest
//! port, the configuration source and status reporting; each subcommand adds
//! the knobs of its backend.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::error;

use virta_broker::backend::kafka::{KafkaArgs, KafkaBackend};
use virta_broker::backend::memory::{MemoryArgs, MemoryBackend};
use virta_broker::backend::redis::{ProbeCommand, RedisArgs, RedisBackend};
use virta_broker::backend::Backend;
use virta_broker::broker::{ConfigSourceSpec, Instance};
use virta_broker::status::{FileStatusBackend, StatusBackend, StatusManagerConfig};

#[derive(Parser)]
#[command(name = "virta", about = "CloudEvents broker", version)]
struct Cli {
    #[command(flatten)]
    globals: Globals,

    #[command(subcommand)]
    backend: BackendCommand,
}

#[derive(Args)]
struct Globals {
    /// HTTP port for the CloudEvents ingest endpoint
    #[arg(long, env = "PORT", default_value_t = 8080)]
    port: u16,

    /// Unique identifier for this broker instance
    #[arg(long, env = "BROKER_NAME", default_value = "virta")]
    instance: String,

    /// Path to the broker configuration file
    #[arg(long, env = "BROKER_CONFIG_PATH")]
    broker_config: Option<PathBuf>,

    /// Poll the configuration file on this period (seconds) instead of
    /// watching it
    #[arg(long, env = "CONFIG_POLLING_PERIOD")]
    config_polling_period: Option<u64>,

    /// Inline broker configuration (YAML or JSON)
    #[arg(long, env = "BROKER_CONFIG", conflicts_with = "broker_config")]
    inline_config: Option<String>,

    /// File where status snapshots are written
    #[arg(long, env = "STATUS_FILE_PATH")]
    status_file: Option<PathBuf>,

    /// Status resync period in seconds
    #[arg(long, default_value_t = 10)]
    status_resync_seconds: u64,

    /// Expiry in seconds for status entries of other instances
    #[arg(long, default_value_t = 120)]
    status_instance_expire_seconds: u64,
}

#[derive(Subcommand)]
enum BackendCommand {
    /// In-memory backend: no durability, single process
    Memory {
        /// Capacity of the event buffer
        #[arg(long, env = "MEMORY_BUFFER_SIZE", default_value_t = 10_000)]
        buffer_size: usize,

        /// Produce timeout in milliseconds when the buffer is full
        #[arg(long, env = "MEMORY_PRODUCE_TIMEOUT_MS", default_value_t = 1_000)]
        produce_timeout_ms: u64,
    },

    /// Redis Streams backend
    Redis {
        /// Connection URL, e.g. redis://localhost:6379/0
        #[arg(long, env = "REDIS_URL", default_value = "redis://localhost:6379")]
        url: String,

        /// Stream key used as the event log
        #[arg(long, env = "REDIS_STREAM", default_value = "virta")]
        stream: String,

        /// Prefix for per-subscription consumer groups
        #[arg(long, env = "REDIS_GROUP", default_value = "virta")]
        group: String,

        /// Approximate maximum stream length trimmed on produce
        #[arg(long, env = "REDIS_STREAM_MAXLEN")]
        stream_maxlen: Option<usize>,

        /// Stamp dispatched events with their stream id
        #[arg(long, env = "REDIS_TRACKING_ID")]
        tracking_id: bool,
    },

    /// Kafka backend
    Kafka {
        /// Seed broker addresses
        #[arg(long, env = "KAFKA_ADDRESSES", value_delimiter = ',',
            default_value = "localhost:9092")]
        addresses: Vec<String>,

        /// Topic used as the event log
        #[arg(long, env = "KAFKA_TOPIC", default_value = "virta")]
        topic: String,

        /// Prefix for per-subscription consumer groups
        #[arg(long, env = "KAFKA_GROUP", default_value = "virta")]
        group: String,

        /// Stamp dispatched events with their offset
        #[arg(long, env = "KAFKA_TRACKING_ID")]
        tracking_id: bool,
    },
}

fn build_backend(cli: &Cli) -> Arc<dyn Backend> {
    match &cli.backend {
        BackendCommand::Memory {
            buffer_size,
            produce_timeout_ms,
        } => Arc::new(MemoryBackend::new(MemoryArgs {
            buffer_size: *buffer_size,
            produce_timeout: Duration::from_millis(*produce_timeout_ms),
        })),
        BackendCommand::Redis {
            url,
            stream,
            group,
            stream_maxlen,
            tracking_id,
        } => Arc::new(RedisBackend::new(RedisArgs {
            url: url.clone(),
            stream: stream.clone(),
            group_prefix: group.clone(),
            instance: cli.globals.instance.clone(),
            stream_max_len: *stream_maxlen,
            tracking_id_enabled: *tracking_id,
            probe: ProbeCommand::default(),
        })),
        BackendCommand::Kafka {
            addresses,
            topic,
            group,
            tracking_id,
        } => Arc::new(KafkaBackend::new(KafkaArgs {
            addresses: addresses.clone(),
            topic: topic.clone(),
            group_prefix: group.clone(),
            instance: cli.globals.instance.clone(),
            tracking_id_enabled: *tracking_id,
        })),
    }
}

fn config_source(globals: &Globals) -> ConfigSourceSpec {
    if let Some(inline) = &globals.inline_config {
        return ConfigSourceSpec::Inline(inline.clone());
    }
    match (&globals.broker_config, globals.config_polling_period) {
        (Some(path), Some(seconds)) => {
            ConfigSourceSpec::Poller(path.clone(), Duration::from_secs(seconds))
        }
        (Some(path), None) => ConfigSourceSpec::Watcher(path.clone()),
        (None, _) => ConfigSourceSpec::None,
    }
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let status_backends: Vec<Arc<dyn StatusBackend>> = match &cli.globals.status_file {
        Some(path) => vec![Arc::new(FileStatusBackend::new(
            path,
            &cli.globals.instance,
            Duration::from_secs(cli.globals.status_instance_expire_seconds),
        ))],
        None => Vec::new(),
    };

    let instance = Instance::new(
        build_backend(&cli),
        cli.globals.port,
        config_source(&cli.globals),
        StatusManagerConfig {
            resync_period: Duration::from_secs(cli.globals.status_resync_seconds),
            ..Default::default()
        },
        status_backends,
    );

    match instance.start(CancellationToken::new()).await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "broker exited with error");
            std::process::ExitCode::FAILURE
        }
    }
}
