use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::{log::BalanceStrategy, logging::SamplerOptions};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "kvbuf",
    about = "Write-buffering proxy for key-value stores",
    version = crate::version::VERSION,
    disable_help_subcommand = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub config: Config,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the proxy, the replay consumer and the HTTP endpoints (default).
    Run,

    /// Send one command to a running proxy.
    Send(SendArgs),

    /// Inspect or reset the replay group's committed offsets.
    #[command(subcommand)]
    Offset(OffsetCommand),

    /// Print one record from the log.
    Fetch(FetchArgs),
}

#[derive(Args, Debug, Clone)]
pub struct SendArgs {
    #[arg(long, value_name = "ADDR", default_value = "http://127.0.0.1:9090")]
    pub addr: String,

    /// Also write the encoded request to this file.
    #[arg(long, value_name = "PATH")]
    pub dump_path: Option<PathBuf>,

    #[arg(value_name = "CMD")]
    pub cmd: String,

    /// Arguments; `@path` is replaced by the content of `path`.
    #[arg(value_name = "ARGS")]
    pub args: Vec<String>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum OffsetCommand {
    Get {
        #[arg(long, value_name = "N")]
        partition: Option<i32>,
    },
    Set {
        #[arg(long, value_name = "N")]
        partition: i32,
        #[arg(long, value_name = "OFFSET")]
        offset: i64,
    },
}

#[derive(Args, Debug, Clone)]
pub struct FetchArgs {
    #[arg(long, value_name = "N")]
    pub partition: i32,

    #[arg(long, value_name = "OFFSET")]
    pub offset: i64,

    /// Also write the raw record value to this file.
    #[arg(long, value_name = "PATH")]
    pub dump_path: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct Config {
    #[arg(
        long,
        global = true,
        env = "KVBUF_GRPC_BIND",
        value_name = "ADDR",
        default_value = "0.0.0.0:9090"
    )]
    pub grpc_bind: SocketAddr,

    #[arg(
        long,
        global = true,
        env = "KVBUF_HTTP_BIND",
        value_name = "ADDR",
        default_value = "127.0.0.1:8080"
    )]
    pub http_bind: SocketAddr,

    #[arg(
        long,
        global = true,
        env = "KVBUF_DATA_DIR",
        value_name = "PATH",
        default_value = "./data"
    )]
    pub data_dir: PathBuf,

    /// Directory for the access log; access entries go to the main log when unset.
    #[arg(long, global = true, env = "KVBUF_LOG_DIR", value_name = "PATH")]
    pub log_dir: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        env = "KVBUF_TOPIC",
        value_name = "NAME",
        default_value = "kvbuf"
    )]
    pub topic: String,

    #[arg(
        long,
        global = true,
        env = "KVBUF_PARTITIONS",
        value_name = "N",
        default_value_t = 8,
        value_parser = clap::value_parser!(u32).range(1..=1024)
    )]
    pub partitions: u32,

    #[arg(
        long,
        global = true,
        env = "KVBUF_CONSUMER_GROUP",
        value_name = "NAME",
        default_value = "kvbuf-replay"
    )]
    pub consumer_group: String,

    /// How partitions are spread over the replay group's members.
    #[arg(
        long,
        global = true,
        env = "KVBUF_BALANCE_STRATEGY",
        value_name = "STRATEGY",
        default_value = "sticky",
        value_enum
    )]
    pub balance_strategy: BalanceStrategy,

    #[arg(
        long,
        global = true,
        env = "KVBUF_STORE_ADDR",
        value_name = "ADDR",
        default_value = "127.0.0.1:6379"
    )]
    pub store_addr: String,

    #[arg(
        long,
        global = true,
        env = "KVBUF_STORE_PASSWORD",
        value_name = "PASSWORD",
        hide_env_values = true
    )]
    pub store_password: Option<String>,

    #[arg(
        long,
        global = true,
        env = "KVBUF_STORE_DB",
        value_name = "N",
        default_value_t = 0
    )]
    pub store_db: u32,

    #[arg(
        long,
        global = true,
        env = "KVBUF_STORE_POOL_SIZE",
        value_name = "N",
        default_value_t = 8,
        value_parser = clap::value_parser!(u64).range(1..=256)
    )]
    pub store_pool_size: u64,

    #[arg(
        long,
        global = true,
        env = "KVBUF_STORE_TIMEOUT_MS",
        value_name = "MS",
        default_value_t = 1000,
        value_parser = clap::value_parser!(u64).range(1..=60_000)
    )]
    pub store_timeout_ms: u64,

    #[arg(
        long,
        global = true,
        env = "KVBUF_PUBLISH_TPS_LIMIT",
        value_name = "TPS",
        default_value_t = 500_000,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub publish_tps_limit: u64,

    /// How long admission may wait for a publish token.
    #[arg(
        long,
        global = true,
        env = "KVBUF_ADMISSION_WAIT_MS",
        value_name = "MS",
        default_value_t = 100,
        value_parser = clap::value_parser!(u64).range(0..=10_000)
    )]
    pub admission_wait_ms: u64,

    #[arg(
        long,
        global = true,
        env = "KVBUF_REPLAY_TPS_LIMIT",
        value_name = "TPS",
        default_value_t = 100_000,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub replay_tps_limit: u64,

    #[arg(
        long,
        global = true,
        env = "KVBUF_MAX_RETRIES",
        value_name = "N",
        default_value_t = 10,
        value_parser = clap::value_parser!(u32).range(0..=1000)
    )]
    pub max_retries: u32,

    #[arg(
        long,
        global = true,
        env = "KVBUF_RETRY_INITIAL_DELAY_MS",
        value_name = "MS",
        default_value_t = 20,
        value_parser = clap::value_parser!(u64).range(1..=60_000)
    )]
    pub retry_initial_delay_ms: u64,

    #[arg(
        long,
        global = true,
        env = "KVBUF_RETRY_MAX_DELAY_MS",
        value_name = "MS",
        default_value_t = 500,
        value_parser = clap::value_parser!(u64).range(1..=600_000)
    )]
    pub retry_max_delay_ms: u64,

    /// Allow-listed commands, comma separated.
    #[arg(
        long,
        global = true,
        env = "KVBUF_COMMANDS",
        value_name = "CMD,...",
        value_delimiter = ',',
        default_value = "setex"
    )]
    pub commands: Vec<String>,

    #[arg(
        long,
        global = true,
        env = "KVBUF_MAX_REQUEST_BYTES",
        value_name = "BYTES",
        default_value_t = 1_048_576,
        value_parser = clap::value_parser!(u64).range(1..=(64 * 1024 * 1024))
    )]
    pub max_request_bytes: u64,

    #[arg(
        long,
        global = true,
        env = "KVBUF_PUBLISH_TIMEOUT_MS",
        value_name = "MS",
        default_value_t = 5000,
        value_parser = clap::value_parser!(u64).range(1..=600_000)
    )]
    pub publish_timeout_ms: u64,

    #[arg(
        long,
        global = true,
        env = "KVBUF_OFFSET_COMMIT_INTERVAL_MS",
        value_name = "MS",
        default_value_t = 1000,
        value_parser = clap::value_parser!(u64).range(10..=600_000)
    )]
    pub offset_commit_interval_ms: u64,

    /// Sample access entries: per call site and tick, keep the first
    /// `--access-log-sample-first`, then every `--access-log-sample-thereafter`-th.
    #[arg(long, global = true, env = "KVBUF_ACCESS_LOG_SAMPLE")]
    pub access_log_sample: bool,

    #[arg(
        long,
        global = true,
        env = "KVBUF_ACCESS_LOG_SAMPLE_TICK_MS",
        value_name = "MS",
        default_value_t = 1000,
        value_parser = clap::value_parser!(u64).range(1..=3_600_000)
    )]
    pub access_log_sample_tick_ms: u64,

    #[arg(
        long,
        global = true,
        env = "KVBUF_ACCESS_LOG_SAMPLE_FIRST",
        value_name = "N",
        default_value_t = 100
    )]
    pub access_log_sample_first: u64,

    #[arg(
        long,
        global = true,
        env = "KVBUF_ACCESS_LOG_SAMPLE_THEREAFTER",
        value_name = "N",
        default_value_t = 10_000,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub access_log_sample_thereafter: u64,
}

impl Config {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn admission_wait(&self) -> Duration {
        Duration::from_millis(self.admission_wait_ms)
    }

    pub fn retry_initial_delay(&self) -> Duration {
        Duration::from_millis(self.retry_initial_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn offset_commit_interval(&self) -> Duration {
        Duration::from_millis(self.offset_commit_interval_ms)
    }

    pub fn access_log_sampler(&self) -> Option<SamplerOptions> {
        self.access_log_sample.then(|| SamplerOptions {
            tick: Duration::from_millis(self.access_log_sample_tick_ms),
            first: self.access_log_sample_first,
            thereafter: self.access_log_sample_thereafter,
        })
    }

    /// Allow-list entries, trimmed and lower-cased, blanks dropped.
    pub fn allowed_commands(&self) -> Vec<String> {
        self.commands
            .iter()
            .map(|c| c.trim().to_ascii_lowercase())
            .filter(|c| !c.is_empty())
            .collect()
    }
}
