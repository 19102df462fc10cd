//! Replays logged requests against the store.
//!
//! One task drives the group session: it waits for assignments, claims the
//! assigned partitions and runs one worker per claim. A worker applies its
//! partition's records strictly in order. A new assignment cancels the
//! current workers between records, waits for them to finish, then claims
//! again; shutdown does the same and leaves the group.

use std::{fmt, sync::Arc, time::Duration};

use bytes::Bytes;
use chrono::Utc;
use prost::Message as _;
use tokio::{
    sync::watch,
    task::{JoinHandle, JoinSet},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    log::{ConsumerGroup, GroupSession, LogError, LogRecord, PartitionClaim},
    logging::ACCESS_TARGET,
    metrics::OutcomeMetrics,
    proto::Request,
    ratelimit::TokenBucket,
    retry::{RetryStrategy, retry},
    store::{CommandExecutor, StoreError},
};

const READ_ERROR_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayState {
    Joining,
    Ready,
    Consuming,
    Rebalancing,
    Closing,
    Closed,
}

impl ReplayState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Joining => "joining",
            Self::Ready => "ready",
            Self::Consuming => "consuming",
            Self::Rebalancing => "rebalancing",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ReplayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub enum ReplayError {
    Log(LogError),
    Decode(prost::DecodeError),
    MalformedRecord(String),
    Apply { attempts: u32, source: StoreError },
    /// The consumer stopped before it became ready.
    Closed,
    Task(String),
}

impl fmt::Display for ReplayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Log(e) => write!(f, "replay log error: {e}"),
            Self::Decode(e) => write!(f, "undecodable record: {e}"),
            Self::MalformedRecord(msg) => write!(f, "malformed record: {msg}"),
            Self::Apply { attempts, source } => {
                write!(f, "apply failed after {attempts} attempts: {source}")
            }
            Self::Closed => write!(f, "replay consumer closed"),
            Self::Task(msg) => write!(f, "replay task failed: {msg}"),
        }
    }
}

impl std::error::Error for ReplayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Log(e) => Some(e),
            Self::Decode(e) => Some(e),
            Self::Apply { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<LogError> for ReplayError {
    fn from(value: LogError) -> Self {
        Self::Log(value)
    }
}

impl From<prost::DecodeError> for ReplayError {
    fn from(value: prost::DecodeError) -> Self {
        Self::Decode(value)
    }
}

#[derive(Debug, Clone)]
pub struct ReplayOptions {
    pub group_id: String,
    pub topic: String,
}

pub struct ReplayConsumer {
    executor: Arc<dyn CommandExecutor>,
    limiter: Arc<TokenBucket>,
    policy: Arc<dyn RetryStrategy>,
    metrics: OutcomeMetrics,
}

impl ReplayConsumer {
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        limiter: Arc<TokenBucket>,
        policy: Arc<dyn RetryStrategy>,
        metrics: OutcomeMetrics,
    ) -> Self {
        Self {
            executor,
            limiter,
            policy,
            metrics,
        }
    }

    /// Apply one record. The offset is marked whatever the outcome.
    async fn process(&self, claim: &mut dyn PartitionClaim, record: &LogRecord) {
        let queued_ms = (Utc::now() - record.timestamp).num_milliseconds().max(0);
        let started = Instant::now();

        let (command, result) = match decode_record(record) {
            Ok((command, args)) => {
                self.limiter.acquire().await;
                let result = self.apply(&command, &args).await;
                (command, result)
            }
            Err(err) => (String::new(), Err(err)),
        };

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let ok = result.is_ok();
        self.metrics.observe(ok, elapsed_ms);
        if let Err(err) = &result {
            error!(
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                error = %err,
                "dropping record"
            );
        }
        info!(
            target: ACCESS_TARGET,
            cmd = %command,
            key = %String::from_utf8_lossy(&record.key),
            topic = %record.topic,
            partition = record.partition,
            offset = record.offset,
            ok,
            queued_ms,
            elapsed_ms,
            "replay"
        );

        claim.mark_processed(record);
    }

    async fn apply(&self, command: &str, args: &[Bytes]) -> Result<(), ReplayError> {
        let executor = &self.executor;
        let attempted = retry(self.policy.as_ref(), |_| executor.execute(command, args)).await;
        match attempted.result {
            Ok(_) => Ok(()),
            Err(source) => Err(ReplayError::Apply {
                attempts: attempted.attempts,
                source,
            }),
        }
    }

    async fn consume(self: Arc<Self>, mut claim: Box<dyn PartitionClaim>, stop: CancellationToken) {
        let partition = claim.partition();
        debug!(topic = claim.topic(), partition, "partition worker started");
        loop {
            let next = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                next = claim.next_record() => next,
            };
            match next {
                Ok(record) => self.process(claim.as_mut(), &record).await,
                Err(err @ LogError::Corrupt { .. }) => {
                    self.metrics.observe(false, 0.0);
                    error!(partition, error = %err, "skipping corrupt record");
                }
                Err(LogError::Closed) => {
                    warn!(partition, "log closed under partition worker");
                    break;
                }
                Err(err) => {
                    warn!(partition, error = %err, "read failed; retrying");
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = tokio::time::sleep(READ_ERROR_BACKOFF) => {}
                    }
                }
            }
        }
        debug!(partition, "partition worker stopped");
    }

    async fn run(
        self: Arc<Self>,
        mut session: Box<dyn GroupSession>,
        state: watch::Sender<ReplayState>,
        shutdown: CancellationToken,
    ) -> Result<(), ReplayError> {
        let mut current: Option<Generation> = None;
        let result = loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Ok(()),
                exited = worker_exit(&mut current) => {
                    if let Err(err) = exited {
                        error!(error = %err, "partition worker panicked");
                    }
                }
                assignment = session.next_assignment() => {
                    let Some(assignment) = assignment else {
                        warn!("consumer group session ended");
                        break Ok(());
                    };
                    if let Some(previous) = current.take() {
                        state.send_replace(ReplayState::Rebalancing);
                        previous.drain().await;
                    }

                    let claims = match session.claim(&assignment).await {
                        Ok(claims) => claims,
                        Err(err) => break Err(ReplayError::Log(err)),
                    };
                    if claims.len() != assignment.partitions.len() {
                        // Superseded while claiming; the next assignment is already queued.
                        continue;
                    }
                    info!(
                        generation = assignment.generation,
                        topic = %assignment.topic,
                        partitions = ?assignment.partitions,
                        "partitions assigned"
                    );

                    let mut generation = Generation::new();
                    for claim in claims {
                        let stop = generation.stop.clone();
                        generation.tasks.spawn(self.clone().consume(claim, stop));
                    }
                    current = Some(generation);

                    if *state.borrow() == ReplayState::Joining {
                        state.send_replace(ReplayState::Ready);
                    }
                    state.send_replace(ReplayState::Consuming);
                }
            }
        };

        state.send_replace(ReplayState::Closing);
        if let Some(generation) = current.take() {
            generation.drain().await;
        }
        let closed = session.close().await;
        state.send_replace(ReplayState::Closed);
        result?;
        Ok(closed?)
    }
}

struct Generation {
    stop: CancellationToken,
    tasks: JoinSet<()>,
}

impl Generation {
    fn new() -> Self {
        Self {
            stop: CancellationToken::new(),
            tasks: JoinSet::new(),
        }
    }

    async fn drain(mut self) {
        self.stop.cancel();
        while let Some(res) = self.tasks.join_next().await {
            if let Err(err) = res {
                error!(error = %err, "partition worker panicked");
            }
        }
    }
}

async fn worker_exit(
    current: &mut Option<Generation>,
) -> Result<(), tokio::task::JoinError> {
    match current {
        Some(generation) if !generation.tasks.is_empty() => {
            match generation.tasks.join_next().await {
                Some(res) => res,
                None => std::future::pending().await,
            }
        }
        _ => std::future::pending().await,
    }
}

/// Decode a logged payload into the command name and its arguments.
pub fn decode_record(record: &LogRecord) -> Result<(String, Vec<Bytes>), ReplayError> {
    let req = Request::decode(record.value.clone())?;
    if req.args.is_empty() {
        return Err(ReplayError::MalformedRecord(format!(
            "{} has no arguments",
            req.cmd
        )));
    }
    let command = req.cmd.to_ascii_lowercase();
    Ok((command, req.args.into_iter().map(Bytes::from).collect()))
}

/// Handle to a running replay consumer.
pub struct ReplayHandle {
    state: watch::Receiver<ReplayState>,
    shutdown: CancellationToken,
    task: JoinHandle<Result<(), ReplayError>>,
}

impl ReplayHandle {
    pub fn state(&self) -> ReplayState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ReplayState> {
        self.state.clone()
    }

    /// Wait until the first assignment has been claimed.
    pub async fn ready(&self) -> Result<(), ReplayError> {
        let mut state = self.state.clone();
        let reached = state
            .wait_for(|s| *s != ReplayState::Joining)
            .await
            .map(|s| *s)
            .unwrap_or(ReplayState::Closed);
        match reached {
            ReplayState::Closing | ReplayState::Closed => Err(ReplayError::Closed),
            _ => Ok(()),
        }
    }

    /// Stop pulling records, let in-flight records finish and leave the group.
    pub async fn stop(self) -> Result<(), ReplayError> {
        self.shutdown.cancel();
        self.task
            .await
            .map_err(|e| ReplayError::Task(e.to_string()))?
    }
}

/// Join the consumer group and start replaying in the background.
///
/// Failing to join is returned here; the process cannot replay without it.
pub async fn spawn_replay_consumer(
    consumer: ReplayConsumer,
    group: &dyn ConsumerGroup,
    opts: &ReplayOptions,
) -> Result<ReplayHandle, ReplayError> {
    let session = group
        .join(&opts.group_id, std::slice::from_ref(&opts.topic))
        .await?;
    info!(group = %opts.group_id, topic = %opts.topic, "replay consumer joined");

    let (state_tx, state_rx) = watch::channel(ReplayState::Joining);
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(Arc::new(consumer).run(session, state_tx, shutdown.clone()));
    Ok(ReplayHandle {
        state: state_rx,
        shutdown,
        task,
    })
}
