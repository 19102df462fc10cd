use std::{
    collections::BTreeMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, Ordering},
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tokio::time::{Duration, Instant};

use kvbuf::{
    catalog::CommandDescriptor,
    log::{
        BalanceStrategy,
        file::{FileLog, FileLogOptions},
    },
    metrics::Metrics,
    proto::Request,
    publisher::Publisher,
    ratelimit::TokenBucket,
    replay::{ReplayConsumer, ReplayOptions, spawn_replay_consumer},
    retry::replay_policy,
    store::{CommandExecutor, Frame, StoreError},
};

const GROUP: &str = "kvbuf-replay";
const TOPIC: &str = "kvbuf";

/// Records applied commands; fails every call while `always_fail` is set.
#[derive(Default)]
struct Store {
    applied: Mutex<Vec<(String, String)>>,
    attempts: AtomicU32,
    always_fail: bool,
}

#[async_trait]
impl CommandExecutor for Store {
    async fn execute(&self, _command: &str, args: &[Bytes]) -> Result<Frame, StoreError> {
        self.attempts.fetch_add(1, Ordering::AcqRel);
        if self.always_fail {
            return Err(StoreError::ConnectionClosed);
        }
        let key = String::from_utf8_lossy(&args[0]).into_owned();
        let value = String::from_utf8_lossy(&args[1]).into_owned();
        self.applied.lock().unwrap().push((key, value));
        Ok(Frame::Simple("OK".into()))
    }

    async fn introspect_commands(&self) -> Result<Vec<CommandDescriptor>, StoreError> {
        Ok(vec![CommandDescriptor::new("set", 3, 1)])
    }
}

fn log_options(dir: &TempDir, partitions: u32) -> FileLogOptions {
    FileLogOptions {
        data_dir: dir.path().to_path_buf(),
        topic: TOPIC.to_string(),
        partitions,
        commit_interval: Duration::from_millis(50),
        balance_strategy: BalanceStrategy::Sticky,
    }
}

async fn open(dir: &TempDir, partitions: u32) -> FileLog {
    FileLog::open(log_options(dir, partitions)).await.unwrap()
}

fn consumer(store: Arc<Store>, max_retries: u32, metrics: &Metrics) -> ReplayConsumer {
    ReplayConsumer::new(
        store,
        Arc::new(TokenBucket::with_rate(100_000)),
        Arc::new(replay_policy(
            Duration::from_millis(1),
            Duration::from_millis(4),
            max_retries,
        )),
        metrics.replay.clone(),
    )
}

fn opts() -> ReplayOptions {
    ReplayOptions {
        group_id: GROUP.to_string(),
        topic: TOPIC.to_string(),
    }
}

fn set(key: &str, value: &str) -> Request {
    Request {
        cmd: "set".to_string(),
        args: vec![key.as_bytes().to_vec(), value.as_bytes().to_vec()],
    }
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "timed out");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn per_key_apply_order_matches_publish_order() {
    let dir = TempDir::new().unwrap();
    let log = open(&dir, 4).await;
    let store = Arc::new(Store::default());
    let metrics = Metrics::new().unwrap();
    let publisher = Publisher::new(Arc::new(log.clone()), TOPIC.to_string(), 1 << 20);

    // Half published before replay starts, half while it runs.
    let keys = ["a", "b", "c", "d", "e", "f", "g"];
    for seq in 0..50 {
        for key in keys {
            publisher
                .publish(&set(key, &seq.to_string()), key.as_bytes())
                .await
                .unwrap();
        }
    }
    let handle = spawn_replay_consumer(consumer(store.clone(), 3, &metrics), &log, &opts())
        .await
        .unwrap();
    handle.ready().await.unwrap();
    for seq in 50..100 {
        for key in keys {
            publisher
                .publish(&set(key, &seq.to_string()), key.as_bytes())
                .await
                .unwrap();
        }
    }

    let total = keys.len() * 100;
    wait_until(|| store.applied.lock().unwrap().len() >= total).await;
    handle.stop().await.unwrap();

    let mut per_key: BTreeMap<String, Vec<u32>> = BTreeMap::new();
    for (key, value) in store.applied.lock().unwrap().iter() {
        per_key
            .entry(key.clone())
            .or_default()
            .push(value.parse().unwrap());
    }
    let expected: Vec<u32> = (0..100).collect();
    for key in keys {
        assert_eq!(per_key[key], expected, "order of key {key}");
    }
    assert_eq!(metrics.replay.succeeded.get(), total as u64);
}

#[tokio::test]
async fn exhausted_command_is_dropped_and_offset_still_advances() {
    let dir = TempDir::new().unwrap();
    let log = open(&dir, 2).await;
    let store = Arc::new(Store {
        always_fail: true,
        ..Store::default()
    });
    let metrics = Metrics::new().unwrap();
    let publisher = Publisher::new(Arc::new(log.clone()), TOPIC.to_string(), 1 << 20);
    let appended = publisher.publish(&set("k1", "v1"), b"k1").await.unwrap();

    let handle = spawn_replay_consumer(consumer(store.clone(), 3, &metrics), &log, &opts())
        .await
        .unwrap();
    handle.ready().await.unwrap();

    wait_until(|| metrics.replay.failed.get() == 1).await;
    handle.stop().await.unwrap();

    assert_eq!(store.attempts.load(Ordering::Acquire), 4);
    let committed = log.committed_offsets(GROUP).await.unwrap();
    assert_eq!(committed[&appended.partition], appended.offset + 1);

    // The dropped record is not redelivered on restart.
    let reopened = FileLog::open_read_only(log_options(&dir, 2)).await.unwrap();
    let committed = reopened.committed_offsets(GROUP).await.unwrap();
    assert_eq!(committed[&appended.partition], appended.offset + 1);
}

#[tokio::test]
async fn restart_resumes_after_last_processed_record() {
    let dir = TempDir::new().unwrap();
    let metrics = Metrics::new().unwrap();
    let store = Arc::new(Store::default());

    {
        let log = open(&dir, 2).await;
        let publisher = Publisher::new(Arc::new(log.clone()), TOPIC.to_string(), 1 << 20);
        for i in 0..5 {
            publisher.publish(&set("k", &i.to_string()), b"k").await.unwrap();
        }
        let handle = spawn_replay_consumer(consumer(store.clone(), 0, &metrics), &log, &opts())
            .await
            .unwrap();
        wait_until(|| store.applied.lock().unwrap().len() == 5).await;
        handle.stop().await.unwrap();
    }

    let log = open(&dir, 2).await;
    let publisher = Publisher::new(Arc::new(log.clone()), TOPIC.to_string(), 1 << 20);
    publisher.publish(&set("k", "5"), b"k").await.unwrap();
    let handle = spawn_replay_consumer(consumer(store.clone(), 0, &metrics), &log, &opts())
        .await
        .unwrap();
    wait_until(|| store.applied.lock().unwrap().len() == 6).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.stop().await.unwrap();

    let values: Vec<String> = store
        .applied
        .lock()
        .unwrap()
        .iter()
        .map(|(_, v)| v.clone())
        .collect();
    assert_eq!(values, vec!["0", "1", "2", "3", "4", "5"]);
}
