//! Single-host, file-backed partitioned log.
//!
//! Each partition is an append-only file of frames:
//!
//! ```text
//! len:u32 | timestamp_ms:i64 | key_len:u32 | key | value
//! ```
//!
//! `len` counts everything after itself. An append returns only after the
//! frame has been written and `sync_data` has completed. On open, every
//! partition file is scanned to rebuild the offset index and a torn trailing
//! frame is cut off.
//!
//! The partition count is recorded in `topic.json` on first open and a
//! different count is refused afterwards, since it would move keys to other
//! partitions. A writable open holds an exclusive lock on the topic
//! directory; [`FileLog::open_read_only`] takes no lock and never writes.
//!
//! Consumer groups are coordinated in-process. Committed offsets live in
//! memory, are updated by `mark_processed`, and are flushed to
//! `offsets/<group>.json` periodically and when a member leaves.

use std::{
    collections::{BTreeMap, HashMap},
    io::{Read as _, Seek as _, SeekFrom},
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicBool, AtomicI64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::{Buf as _, BufMut as _, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use tokio::{
    io::{AsyncReadExt as _, AsyncSeekExt as _, AsyncWriteExt as _},
    sync::{OwnedMutexGuard, RwLock, mpsc, watch},
};
use tracing::{debug, info, warn};

use super::{
    Appended, Assignment, BalanceStrategy, ConsumerGroup, GroupSession, LogError, LogProducer,
    LogRecord, PartitionClaim, partition_for_key,
};

const FRAME_HEADER_LEN: usize = 8 + 4;
const META_FILE: &str = "topic.json";
const LOCK_FILE: &str = "LOCK";

#[derive(Debug, Clone)]
pub struct FileLogOptions {
    pub data_dir: PathBuf,
    pub topic: String,
    pub partitions: u32,
    pub commit_interval: Duration,
    pub balance_strategy: BalanceStrategy,
}

#[derive(Clone)]
pub struct FileLog {
    inner: Arc<Inner>,
}

struct Inner {
    topic: String,
    dir: PathBuf,
    partitions: Vec<Arc<Partition>>,
    groups: Mutex<HashMap<String, Arc<Group>>>,
    commit_interval: Duration,
    balance_strategy: BalanceStrategy,
    read_only: bool,
    _lock: Option<std::fs::File>,
}

struct Partition {
    id: i32,
    path: PathBuf,
    writer: Option<tokio::sync::Mutex<Writer>>,
    /// Byte position of each frame; the length is the next offset.
    index: RwLock<Vec<u64>>,
    high_watermark: watch::Sender<i64>,
}

struct Writer {
    file: tokio::fs::File,
    end: u64,
}

struct Group {
    id: String,
    offsets_path: PathBuf,
    committed: Vec<AtomicI64>,
    /// One exclusive claim per partition within this group.
    leases: Vec<Arc<tokio::sync::Mutex<()>>>,
    dirty: AtomicBool,
    members: Mutex<Members>,
    generation: watch::Sender<u64>,
    flush_lock: tokio::sync::Mutex<()>,
}

#[derive(Default)]
struct Members {
    next_id: u64,
    generation: u64,
    senders: BTreeMap<u64, mpsc::UnboundedSender<Assignment>>,
    owned: BTreeMap<u64, Vec<i32>>,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Default)]
struct PersistedOffsets {
    #[serde(default)]
    partitions: BTreeMap<i32, i64>,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct TopicMeta {
    partitions: u32,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl FileLog {
    /// Open for appends and consumption. Fails with [`LogError::Locked`]
    /// while another writable open of the same topic is alive.
    pub async fn open(opts: FileLogOptions) -> Result<Self, LogError> {
        let dir = opts.data_dir.join("log").join(&opts.topic);
        tokio::fs::create_dir_all(dir.join("offsets")).await?;
        let dir_lock = lock_dir(dir.clone()).await?;

        let partitions = opts.partitions.max(1);
        if check_layout(&dir, &opts.topic, partitions).await?.is_none() {
            write_json(&dir.join(META_FILE), &TopicMeta { partitions }).await?;
        }
        Self::load(opts, dir, Some(dir_lock)).await
    }

    /// Open for inspection. Takes no lock, refuses appends and offset
    /// changes, and stops at a torn tail instead of truncating it.
    pub async fn open_read_only(opts: FileLogOptions) -> Result<Self, LogError> {
        let dir = opts.data_dir.join("log").join(&opts.topic);
        check_layout(&dir, &opts.topic, opts.partitions.max(1)).await?;
        Self::load(opts, dir, None).await
    }

    async fn load(
        opts: FileLogOptions,
        dir: PathBuf,
        dir_lock: Option<std::fs::File>,
    ) -> Result<Self, LogError> {
        let read_only = dir_lock.is_none();
        let count = opts.partitions.max(1);
        let mut partitions = Vec::with_capacity(count as usize);
        for id in 0..count as i32 {
            let path = dir.join(format!("{id}.log"));
            let (index, end) = scan_partition(path.clone(), !read_only).await?;
            let writer = if read_only {
                None
            } else {
                let file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .await?;
                Some(tokio::sync::Mutex::new(Writer { file, end }))
            };
            let next = index.len() as i64;
            debug!(partition = id, next_offset = next, bytes = end, "opened partition");
            partitions.push(Arc::new(Partition {
                id,
                path,
                writer,
                index: RwLock::new(index),
                high_watermark: watch::Sender::new(next),
            }));
        }

        info!(
            topic = %opts.topic,
            partitions = partitions.len(),
            dir = %dir.display(),
            read_only,
            "file log opened"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                topic: opts.topic,
                dir,
                partitions,
                groups: Mutex::new(HashMap::new()),
                commit_interval: opts.commit_interval,
                balance_strategy: opts.balance_strategy,
                read_only,
                _lock: dir_lock,
            }),
        })
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn partition_count(&self) -> u32 {
        self.inner.partitions.len() as u32
    }

    /// Next offset to be written, per partition.
    pub fn high_watermarks(&self) -> Vec<(i32, i64)> {
        self.inner
            .partitions
            .iter()
            .map(|p| (p.id, *p.high_watermark.borrow()))
            .collect()
    }

    pub async fn read_at(&self, partition: i32, offset: i64) -> Result<LogRecord, LogError> {
        let part = self.inner.partition(partition)?;
        let mut file = tokio::fs::File::open(&part.path).await?;
        part.read(&self.inner.topic, &mut file, offset).await
    }

    /// Committed next offsets of `group_id`, one per partition.
    pub async fn committed_offsets(&self, group_id: &str) -> Result<BTreeMap<i32, i64>, LogError> {
        let group = self.inner.group(group_id).await?;
        Ok(group.snapshot())
    }

    /// Move `group_id`'s committed offset for `partition`. Intended for
    /// operators while no member is consuming.
    pub async fn reset_offset(
        &self,
        group_id: &str,
        partition: i32,
        offset: i64,
    ) -> Result<(), LogError> {
        if self.inner.read_only {
            return Err(LogError::ReadOnly);
        }
        let part = self.inner.partition(partition)?;
        let hwm = *part.high_watermark.borrow();
        if !(0..=hwm).contains(&offset) {
            return Err(LogError::OffsetOutOfRange { partition, offset });
        }
        let group = self.inner.group(group_id).await?;
        group.committed[partition as usize].store(offset, Ordering::Release);
        group.dirty.store(true, Ordering::Release);
        group.flush().await
    }

    /// Flush the committed offsets of every known group.
    pub async fn flush(&self) -> Result<(), LogError> {
        let groups = lock(&self.inner.groups).values().cloned().collect::<Vec<_>>();
        for group in groups {
            group.flush().await?;
        }
        Ok(())
    }
}

impl Inner {
    fn partition(&self, partition: i32) -> Result<&Arc<Partition>, LogError> {
        usize::try_from(partition)
            .ok()
            .and_then(|idx| self.partitions.get(idx))
            .ok_or_else(|| LogError::UnknownPartition {
                topic: self.topic.clone(),
                partition,
            })
    }

    fn check_topic(&self, topic: &str) -> Result<(), LogError> {
        if topic != self.topic {
            return Err(LogError::UnknownTopic(topic.to_string()));
        }
        Ok(())
    }

    async fn group(&self, group_id: &str) -> Result<Arc<Group>, LogError> {
        let existing = lock(&self.groups).get(group_id).cloned();
        if let Some(group) = existing {
            return Ok(group);
        }

        let offsets_path = self.dir.join("offsets").join(format!("{group_id}.json"));
        let persisted = read_json::<PersistedOffsets>(&offsets_path)
            .await?
            .unwrap_or_default();
        let committed = self
            .partitions
            .iter()
            .map(|p| {
                let hwm = *p.high_watermark.borrow();
                let saved = persisted.partitions.get(&p.id).copied().unwrap_or(0);
                AtomicI64::new(saved.clamp(0, hwm))
            })
            .collect();
        let fresh = Arc::new(Group {
            id: group_id.to_string(),
            offsets_path,
            committed,
            leases: self
                .partitions
                .iter()
                .map(|_| Arc::new(tokio::sync::Mutex::new(())))
                .collect(),
            dirty: AtomicBool::new(false),
            members: Mutex::new(Members::default()),
            generation: watch::Sender::new(0),
            flush_lock: tokio::sync::Mutex::new(()),
        });

        let group = {
            let mut groups = lock(&self.groups);
            groups
                .entry(group_id.to_string())
                .or_insert_with(|| fresh.clone())
                .clone()
        };
        if Arc::ptr_eq(&group, &fresh) && !self.read_only {
            spawn_flusher(Arc::downgrade(&group), self.commit_interval);
        }
        Ok(group)
    }
}

impl Partition {
    async fn append(&self, key: &[u8], value: &[u8]) -> Result<i64, LogError> {
        let Some(writer) = &self.writer else {
            return Err(LogError::ReadOnly);
        };
        let frame = encode_frame(Utc::now().timestamp_millis(), key, value);

        let mut writer = writer.lock().await;
        let pos = writer.end;
        let written = async {
            writer.file.write_all(&frame).await?;
            writer.file.sync_data().await
        }
        .await;
        if let Err(err) = written {
            // Drop whatever part of the frame made it to disk.
            if let Err(trunc) = writer.file.set_len(pos).await {
                warn!(partition = self.id, error = %trunc, "failed to truncate partial frame");
            }
            return Err(err.into());
        }
        writer.end += frame.len() as u64;

        let offset = {
            let mut index = self.index.write().await;
            index.push(pos);
            index.len() as i64 - 1
        };
        // Published under the writer lock so the watermark never moves back.
        self.high_watermark.send_replace(offset + 1);
        drop(writer);
        Ok(offset)
    }

    async fn read(
        &self,
        topic: &str,
        file: &mut tokio::fs::File,
        offset: i64,
    ) -> Result<LogRecord, LogError> {
        let pos = {
            let index = self.index.read().await;
            usize::try_from(offset)
                .ok()
                .and_then(|i| index.get(i).copied())
                .ok_or(LogError::OffsetOutOfRange {
                    partition: self.id,
                    offset,
                })?
        };

        file.seek(SeekFrom::Start(pos)).await?;
        let len = file.read_u32().await? as usize;
        let mut body = vec![0u8; len];
        file.read_exact(&mut body).await?;

        let (timestamp, key, value) = decode_body(Bytes::from(body)).ok_or(LogError::Corrupt {
            partition: self.id,
            offset,
        })?;
        Ok(LogRecord {
            topic: topic.to_string(),
            partition: self.id,
            offset,
            key,
            value,
            timestamp,
        })
    }
}

impl Group {
    fn snapshot(&self) -> BTreeMap<i32, i64> {
        self.committed
            .iter()
            .enumerate()
            .map(|(p, v)| (p as i32, v.load(Ordering::Acquire)))
            .collect()
    }

    async fn flush(&self) -> Result<(), LogError> {
        let _guard = self.flush_lock.lock().await;
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let persisted = PersistedOffsets {
            partitions: self.snapshot(),
        };
        if let Err(err) = write_json(&self.offsets_path, &persisted).await {
            self.dirty.store(true, Ordering::Release);
            return Err(err);
        }
        debug!(group = %self.id, "committed offsets flushed");
        Ok(())
    }

    /// Recompute the assignment for the current members and push it to
    /// each of them.
    fn rebalance(&self, members: &mut Members, log: &Inner) {
        members.generation += 1;
        let generation = members.generation;
        self.generation.send_replace(generation);

        let ids: Vec<u64> = members.senders.keys().copied().collect();
        if ids.is_empty() {
            members.owned.clear();
            return;
        }
        let plan = plan_assignment(
            log.balance_strategy,
            &ids,
            log.partitions.len() as u32,
            &members.owned,
        );
        for (id, sender) in &members.senders {
            let _ = sender.send(Assignment {
                generation,
                topic: log.topic.clone(),
                partitions: plan.get(id).cloned().unwrap_or_default(),
            });
        }
        members.owned = plan;
        info!(
            group = %self.id,
            generation,
            members = ids.len(),
            strategy = ?log.balance_strategy,
            "group rebalanced"
        );
    }
}

/// Spread `partitions` over `members`. Every strategy gives each member
/// either `n / m` or `n / m + 1` partitions.
fn plan_assignment(
    strategy: BalanceStrategy,
    members: &[u64],
    partitions: u32,
    previous: &BTreeMap<u64, Vec<i32>>,
) -> BTreeMap<u64, Vec<i32>> {
    let count = members.len() as u32;
    let mut plan: BTreeMap<u64, Vec<i32>> = members.iter().map(|&m| (m, Vec::new())).collect();
    match strategy {
        BalanceStrategy::Range => {
            let per = partitions / count;
            let extra = partitions % count;
            let mut next = 0u32;
            for (i, m) in members.iter().enumerate() {
                let take = per + u32::from((i as u32) < extra);
                plan.insert(*m, (next..next + take).map(|p| p as i32).collect());
                next += take;
            }
        }
        BalanceStrategy::RoundRobin => {
            for p in 0..partitions {
                let m = members[(p % count) as usize];
                plan.entry(m).or_default().push(p as i32);
            }
        }
        BalanceStrategy::Sticky => sticky(members, partitions, previous, &mut plan),
    }
    plan
}

fn sticky(
    members: &[u64],
    partitions: u32,
    previous: &BTreeMap<u64, Vec<i32>>,
    plan: &mut BTreeMap<u64, Vec<i32>>,
) {
    let per = (partitions / members.len() as u32) as usize;
    let mut extra = (partitions % members.len() as u32) as usize;
    let mut taken = vec![false; partitions as usize];

    // Keep up to the fair share of what each member already owned.
    for &m in members {
        let kept: Vec<i32> = held(previous, m, partitions)
            .filter(|&p| !taken[p as usize])
            .take(per)
            .collect();
        for &p in &kept {
            taken[p as usize] = true;
        }
        plan.insert(m, kept);
    }
    for &m in members {
        if extra == 0 {
            break;
        }
        let Some(owned) = plan.get_mut(&m) else {
            continue;
        };
        if owned.len() != per {
            continue;
        }
        if let Some(p) = held(previous, m, partitions).find(|&p| !taken[p as usize]) {
            owned.push(p);
            taken[p as usize] = true;
            extra -= 1;
        }
    }

    let mut free: Vec<i32> = (0..partitions as i32)
        .rev()
        .filter(|&p| !taken[p as usize])
        .collect();
    for &m in members {
        let Some(owned) = plan.get_mut(&m) else {
            continue;
        };
        while owned.len() < per {
            let Some(p) = free.pop() else { break };
            owned.push(p);
        }
    }
    for &m in members {
        if extra == 0 {
            break;
        }
        let Some(owned) = plan.get_mut(&m) else {
            continue;
        };
        if owned.len() == per {
            if let Some(p) = free.pop() {
                owned.push(p);
                extra -= 1;
            }
        }
    }
    for owned in plan.values_mut() {
        owned.sort_unstable();
    }
}

/// Partitions `member` owned before, in the order it held them.
fn held(
    previous: &BTreeMap<u64, Vec<i32>>,
    member: u64,
    partitions: u32,
) -> impl Iterator<Item = i32> + '_ {
    previous
        .get(&member)
        .into_iter()
        .flatten()
        .copied()
        .filter(move |&p| p >= 0 && (p as u32) < partitions)
}

fn spawn_flusher(group: Weak<Group>, every: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let Some(group) = group.upgrade() else {
                return;
            };
            if let Err(err) = group.flush().await {
                warn!(group = %group.id, error = %err, "failed to flush committed offsets");
            }
        }
    });
}

#[async_trait]
impl LogProducer for FileLog {
    async fn append(&self, topic: &str, key: &[u8], value: &[u8]) -> Result<Appended, LogError> {
        self.inner.check_topic(topic)?;
        let partition = partition_for_key(key, self.partition_count());
        let part = self.inner.partition(partition)?;
        let offset = part.append(key, value).await?;
        Ok(Appended { partition, offset })
    }
}

#[async_trait]
impl ConsumerGroup for FileLog {
    async fn join(
        &self,
        group_id: &str,
        topics: &[String],
    ) -> Result<Box<dyn GroupSession>, LogError> {
        for topic in topics {
            self.inner.check_topic(topic)?;
        }
        let group = self.inner.group(group_id).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let member_id = {
            let mut members = lock(&group.members);
            let id = members.next_id;
            members.next_id += 1;
            members.senders.insert(id, tx);
            group.rebalance(&mut members, &self.inner);
            id
        };
        info!(group = %group_id, member_id, "joined consumer group");

        Ok(Box::new(FileGroupSession {
            log: self.inner.clone(),
            generation: group.generation.subscribe(),
            group,
            member_id,
            assignments: rx,
            left: false,
        }))
    }
}

struct FileGroupSession {
    log: Arc<Inner>,
    group: Arc<Group>,
    member_id: u64,
    assignments: mpsc::UnboundedReceiver<Assignment>,
    generation: watch::Receiver<u64>,
    left: bool,
}

impl FileGroupSession {
    fn leave(&mut self) {
        if self.left {
            return;
        }
        self.left = true;
        let mut members = lock(&self.group.members);
        members.senders.remove(&self.member_id);
        self.group.rebalance(&mut members, &self.log);
    }
}

impl Drop for FileGroupSession {
    fn drop(&mut self) {
        self.leave();
    }
}

#[async_trait]
impl GroupSession for FileGroupSession {
    async fn next_assignment(&mut self) -> Option<Assignment> {
        let mut latest = self.assignments.recv().await?;
        while let Ok(newer) = self.assignments.try_recv() {
            latest = newer;
        }
        Some(latest)
    }

    async fn claim(
        &mut self,
        assignment: &Assignment,
    ) -> Result<Vec<Box<dyn PartitionClaim>>, LogError> {
        let mut partitions = assignment.partitions.clone();
        partitions.sort_unstable();

        let mut leases = Vec::with_capacity(partitions.len());
        let mut generation = self.generation.clone();
        for &p in &partitions {
            let part = self.log.partition(p)?.clone();
            let lease = self.group.leases[part.id as usize].clone();
            tokio::select! {
                guard = lease.lock_owned() => leases.push((part, guard)),
                _ = generation.wait_for(|g| *g != assignment.generation) => {
                    debug!(
                        group = %self.group.id,
                        generation = assignment.generation,
                        "assignment went stale while claiming"
                    );
                    return Ok(Vec::new());
                }
            }
        }
        if *self.generation.borrow() != assignment.generation {
            return Ok(Vec::new());
        }

        let mut claims: Vec<Box<dyn PartitionClaim>> = Vec::with_capacity(leases.len());
        for (part, lease) in leases {
            let file = tokio::fs::File::open(&part.path).await?;
            let next_offset = self.group.committed[part.id as usize].load(Ordering::Acquire);
            claims.push(Box::new(FileClaim {
                topic: self.log.topic.clone(),
                high_watermark: part.high_watermark.subscribe(),
                partition: part,
                group: self.group.clone(),
                next_offset,
                file,
                _lease: lease,
            }));
        }
        Ok(claims)
    }

    async fn close(mut self: Box<Self>) -> Result<(), LogError> {
        self.leave();
        self.group.flush().await?;
        info!(group = %self.group.id, member_id = self.member_id, "left consumer group");
        Ok(())
    }
}

struct FileClaim {
    topic: String,
    partition: Arc<Partition>,
    group: Arc<Group>,
    next_offset: i64,
    high_watermark: watch::Receiver<i64>,
    file: tokio::fs::File,
    _lease: OwnedMutexGuard<()>,
}

#[async_trait]
impl PartitionClaim for FileClaim {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn partition(&self) -> i32 {
        self.partition.id
    }

    async fn next_record(&mut self) -> Result<LogRecord, LogError> {
        let offset = self.next_offset;
        self.high_watermark
            .wait_for(|hwm| offset < *hwm)
            .await
            .map_err(|_| LogError::Closed)?;

        let result = self
            .partition
            .read(&self.topic, &mut self.file, offset)
            .await;
        // A corrupt frame is skipped; I/O errors leave the offset for a retry.
        if matches!(result, Ok(_) | Err(LogError::Corrupt { .. })) {
            self.next_offset = offset + 1;
        }
        result
    }

    fn mark_processed(&self, record: &LogRecord) {
        self.group.committed[self.partition.id as usize]
            .fetch_max(record.offset + 1, Ordering::AcqRel);
        self.group.dirty.store(true, Ordering::Release);
    }
}

fn encode_frame(timestamp_ms: i64, key: &[u8], value: &[u8]) -> Bytes {
    let body_len = FRAME_HEADER_LEN + key.len() + value.len();
    let mut buf = BytesMut::with_capacity(4 + body_len);
    buf.put_u32(body_len as u32);
    buf.put_i64(timestamp_ms);
    buf.put_u32(key.len() as u32);
    buf.put_slice(key);
    buf.put_slice(value);
    buf.freeze()
}

fn decode_body(mut body: Bytes) -> Option<(DateTime<Utc>, Bytes, Bytes)> {
    if body.len() < FRAME_HEADER_LEN {
        return None;
    }
    let timestamp = DateTime::from_timestamp_millis(body.get_i64())?;
    let key_len = body.get_u32() as usize;
    if body.len() < key_len {
        return None;
    }
    let key = body.split_to(key_len);
    Some((timestamp, key, body))
}

/// Rebuild the frame index of one partition file. With `truncate`, a torn
/// tail is cut off; otherwise it is only left out of the index.
async fn scan_partition(path: PathBuf, truncate: bool) -> Result<(Vec<u64>, u64), LogError> {
    tokio::task::spawn_blocking(move || -> std::io::Result<(Vec<u64>, u64)> {
        let mut file = match std::fs::OpenOptions::new()
            .read(true)
            .write(truncate)
            .open(&path)
        {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e),
        };
        let file_len = file.metadata()?.len();

        let mut index = Vec::new();
        let mut pos = 0u64;
        while pos + 4 <= file_len {
            let mut len_buf = [0u8; 4];
            file.seek(SeekFrom::Start(pos))?;
            file.read_exact(&mut len_buf)?;
            let len = u64::from(u32::from_be_bytes(len_buf));
            if len < FRAME_HEADER_LEN as u64 || pos + 4 + len > file_len {
                break;
            }
            index.push(pos);
            pos += 4 + len;
        }

        if pos < file_len && truncate {
            warn!(
                path = %path.display(),
                valid_bytes = pos,
                file_bytes = file_len,
                "truncating torn tail of partition file"
            );
            file.set_len(pos)?;
            file.sync_data()?;
        }
        Ok((index, pos))
    })
    .await
    .map_err(std::io::Error::other)?
    .map_err(LogError::from)
}

/// Take the exclusive advisory lock of a topic directory.
async fn lock_dir(dir: PathBuf) -> Result<std::fs::File, LogError> {
    tokio::task::spawn_blocking(move || {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(dir.join(LOCK_FILE))?;
        match file.try_lock() {
            Ok(()) => Ok(file),
            Err(std::fs::TryLockError::WouldBlock) => Err(LogError::Locked(dir)),
            Err(std::fs::TryLockError::Error(e)) => Err(LogError::Io(e)),
        }
    })
    .await
    .map_err(std::io::Error::other)?
}

/// Compare the configured partition count with `topic.json` and with the
/// partition files present. Returns the recorded metadata, if any.
async fn check_layout(
    dir: &Path,
    topic: &str,
    configured: u32,
) -> Result<Option<TopicMeta>, LogError> {
    let meta = read_json::<TopicMeta>(&dir.join(META_FILE)).await?;
    let mut existing = meta.as_ref().map(|m| m.partitions);

    match tokio::fs::read_dir(dir).await {
        Ok(mut entries) => {
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name();
                let Some(id) = name
                    .to_str()
                    .and_then(|n| n.strip_suffix(".log"))
                    .and_then(|n| n.parse::<u32>().ok())
                else {
                    continue;
                };
                if id >= configured {
                    existing = Some(existing.unwrap_or(0).max(id.saturating_add(1)));
                }
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    match existing {
        Some(existing) if existing != configured => Err(LogError::PartitionCountMismatch {
            topic: topic.to_string(),
            configured,
            existing,
        }),
        _ => Ok(meta),
    }
}

async fn read_json<T: serde::de::DeserializeOwned + Send + 'static>(
    path: &Path,
) -> Result<Option<T>, LogError> {
    let path = path.to_path_buf();
    let bytes = tokio::task::spawn_blocking(move || match std::fs::read(&path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    })
    .await
    .map_err(std::io::Error::other)??;
    match bytes {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

async fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), LogError> {
    let path = path.to_path_buf();
    let bytes = serde_json::to_vec_pretty(value)?;
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(tmp, path)?;
        Ok(())
    })
    .await
    .map_err(std::io::Error::other)??;
    Ok(())
}
