//! Process wiring: builds every component once and runs the servers.

use std::{future::Future, sync::Arc};

use anyhow::Context as _;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    admission::AdmissionController,
    catalog::Catalog,
    config::Config,
    http::build_router,
    log::file::{FileLog, FileLogOptions},
    metrics::Metrics,
    proto::proxy::proxy_server::ProxyServer,
    proxy::ProxyService,
    publisher::Publisher,
    ratelimit::TokenBucket,
    replay::{ReplayConsumer, ReplayOptions, spawn_replay_consumer},
    retry::replay_policy,
    store::{CommandExecutor, RedisOptions, RedisStore},
};

/// Everything the proxy and the replay consumer share, built once at startup.
pub struct ServiceContext {
    pub config: Config,
    pub metrics: Metrics,
    pub catalog: Arc<Catalog>,
    pub log: FileLog,
    pub store: Arc<dyn CommandExecutor>,
}

impl ServiceContext {
    /// Connect to the configured store and open the file log.
    pub async fn connect(config: Config) -> anyhow::Result<Self> {
        let store = RedisStore::new(RedisOptions {
            addr: config.store_addr.clone(),
            password: config.store_password.clone(),
            db: config.store_db,
            pool_size: config.store_pool_size as usize,
            timeout: config.store_timeout(),
        });
        store
            .ping()
            .await
            .with_context(|| format!("connect to store at {}", config.store_addr))?;
        let log = open_log(&config).await?;
        Self::new(config, Arc::new(store), log).await
    }

    /// Introspect `store` and build the catalog from the allow-list.
    pub async fn new(
        config: Config,
        store: Arc<dyn CommandExecutor>,
        log: FileLog,
    ) -> anyhow::Result<Self> {
        let introspected = store
            .introspect_commands()
            .await
            .context("introspect store commands")?;
        let catalog = Catalog::build(introspected, &config.allowed_commands())
            .context("build command catalog")?;
        info!(commands = ?catalog.names(), "command catalog ready");

        let metrics = Metrics::new().context("register metrics")?;
        Ok(Self {
            config,
            metrics,
            catalog: Arc::new(catalog),
            log,
            store,
        })
    }

    pub fn proxy_service(&self) -> ProxyService {
        let admission = AdmissionController::new(
            self.catalog.clone(),
            Arc::new(TokenBucket::with_rate(self.config.publish_tps_limit)),
            self.config.admission_wait(),
        );
        let publisher = Publisher::new(
            Arc::new(self.log.clone()),
            self.config.topic.clone(),
            self.config.max_request_bytes as usize,
        );
        ProxyService::new(
            Arc::new(admission),
            publisher,
            self.metrics.requests.clone(),
            self.config.publish_timeout(),
        )
    }

    pub fn replay_consumer(&self) -> ReplayConsumer {
        let policy = replay_policy(
            self.config.retry_initial_delay(),
            self.config.retry_max_delay(),
            self.config.max_retries,
        );
        ReplayConsumer::new(
            self.store.clone(),
            Arc::new(TokenBucket::with_rate(self.config.replay_tps_limit)),
            Arc::new(policy),
            self.metrics.replay.clone(),
        )
    }
}

fn log_options(config: &Config) -> FileLogOptions {
    FileLogOptions {
        data_dir: config.data_dir.clone(),
        topic: config.topic.clone(),
        partitions: config.partitions,
        commit_interval: config.offset_commit_interval(),
        balance_strategy: config.balance_strategy,
    }
}

/// Open the log for appends and replay. Only one process may hold it.
pub async fn open_log(config: &Config) -> anyhow::Result<FileLog> {
    FileLog::open(log_options(config))
        .await
        .with_context(|| format!("open log under {}", config.data_dir.display()))
}

/// Open the log for inspection; safe while a server is running.
pub async fn open_log_read_only(config: &Config) -> anyhow::Result<FileLog> {
    FileLog::open_read_only(log_options(config))
        .await
        .with_context(|| format!("open log under {} read-only", config.data_dir.display()))
}

/// `kvbuf run`: serve until SIGINT/SIGTERM.
pub async fn run_server(config: Config) -> anyhow::Result<()> {
    let grpc = TcpListener::bind(config.grpc_bind)
        .await
        .with_context(|| format!("bind grpc on {}", config.grpc_bind))?;
    let http = TcpListener::bind(config.http_bind)
        .await
        .with_context(|| format!("bind http on {}", config.http_bind))?;
    let ctx = ServiceContext::connect(config).await?;
    serve(ctx, grpc, http, shutdown_signal()).await
}

/// Start replay, then the gRPC and HTTP servers; stop them in that order
/// once `shutdown` resolves or either server exits.
pub async fn serve(
    ctx: ServiceContext,
    grpc: TcpListener,
    http: TcpListener,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    let replay_opts = ReplayOptions {
        group_id: ctx.config.consumer_group.clone(),
        topic: ctx.config.topic.clone(),
    };
    let replay = spawn_replay_consumer(ctx.replay_consumer(), &ctx.log, &replay_opts)
        .await
        .context("join replay consumer group")?;
    replay.ready().await.context("wait for replay assignment")?;

    let stopping = CancellationToken::new();

    let grpc_addr = grpc.local_addr()?;
    let grpc_stop = CancellationToken::new();
    let grpc_server = tonic::transport::Server::builder()
        .add_service(ProxyServer::new(ctx.proxy_service()))
        .serve_with_incoming_shutdown(
            TcpListenerStream::new(grpc),
            grpc_stop.clone().cancelled_owned(),
        );
    let grpc_task = {
        let stopping = stopping.clone();
        tokio::spawn(async move {
            let res = grpc_server.await;
            stopping.cancel();
            res
        })
    };

    let http_addr = http.local_addr()?;
    let http_stop = CancellationToken::new();
    let router = build_router(ctx.metrics.clone(), replay.subscribe());
    let http_server = axum::serve(http, router).with_graceful_shutdown(http_stop.clone().cancelled_owned());
    let http_task = {
        let stopping = stopping.clone();
        tokio::spawn(async move {
            let res = http_server.await;
            stopping.cancel();
            res
        })
    };

    info!(
        grpc = %grpc_addr,
        http = %http_addr,
        topic = %ctx.config.topic,
        group = %ctx.config.consumer_group,
        version = crate::version::VERSION,
        "kvbuf serving"
    );

    tokio::select! {
        _ = shutdown => info!("shutdown requested"),
        _ = stopping.cancelled() => warn!("a server exited unexpectedly; shutting down"),
    }

    grpc_stop.cancel();
    let grpc_res = grpc_task.await.context("join grpc server")?;
    http_stop.cancel();
    let http_res = http_task.await.context("join http server")?;
    let replay_res = replay.stop().await;
    ctx.log.flush().await.context("flush committed offsets")?;
    info!("kvbuf stopped");

    grpc_res.context("grpc server")?;
    http_res.context("http server")?;
    replay_res.context("replay consumer")?;
    Ok(())
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
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
}
