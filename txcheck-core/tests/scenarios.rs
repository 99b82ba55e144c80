//! Exercises `CheckEngine`/`HalfScanner` end to end against an in-memory `StoreBridge`, so
//! scan decisions can be pinned to exact `born_ts`/`store_ts` relationships instead of racing
//! real wall-clock sleeps. Timing-sensitive scenarios construct their own `start_time` and
//! hand it straight to `HalfScanner::scan` rather than letting `CheckEngine` pick `Utc::now()`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use txcheck_core::half_scanner::{BackCheckListener, HalfScanner, ScanOutcome};
use txcheck_core::store::StoreBridge;
use txcheck_core::types::{
    HalfMessage, MessageQueue, OpMessage, PullResult, PullStatus, PutResult, PutStatus,
};
use txcheck_core::{ScanError, StoreError};

const BROKER: &str = "broker-a";
const HALF_TOPIC: &str = "RMQ_SYS_TRANS_HALF_TOPIC";

struct FakeStoreInner {
    half: Vec<Option<HalfMessage>>,
    op: Vec<OpMessage>,
    consume_offsets: HashMap<(String, i32), i64>,
    next_msg_id: u64,
}

/// A deterministic, in-process stand-in for the durable log + offset ledger. Offsets are
/// just vector indices; nothing here ever blocks or errors unless explicitly told to.
struct FakeStore {
    inner: Mutex<FakeStoreInner>,
    half_queue: MessageQueue,
    op_queue: MessageQueue,
}

impl FakeStore {
    fn new() -> Self {
        let half_queue = MessageQueue::new(BROKER, HALF_TOPIC, 0);
        let op_queue = half_queue.paired_op_queue();
        Self {
            inner: Mutex::new(FakeStoreInner {
                half: Vec::new(),
                op: Vec::new(),
                consume_offsets: HashMap::new(),
                next_msg_id: 0,
            }),
            half_queue,
            op_queue,
        }
    }

    /// Seeds a half message directly at the next offset, bypassing `append_half` so the
    /// test controls `born_ts`/`store_ts` precisely instead of taking `Utc::now()`.
    fn seed_half(&self, born_ts: DateTime<Utc>, store_ts: DateTime<Utc>, properties: HashMap<String, String>) -> i64 {
        let mut inner = self.inner.lock().unwrap();
        let offset = inner.half.len() as i64;
        inner.next_msg_id += 1;
        inner.half.push(Some(HalfMessage {
            msg_id: format!("seed-{}", inner.next_msg_id),
            queue: self.half_queue.clone(),
            queue_offset: offset,
            commit_log_offset: offset,
            born_ts,
            store_ts,
            body: b"payload".to_vec(),
            properties,
        }));
        offset
    }

    /// Reserves `n` half offsets with no stored message - a broker-side filter mismatch
    /// (`PullStatus::NoMatchedMsg`), not an end-of-log condition. `pull_half` skips straight
    /// over the run rather than blocking on it, the same way a real filtered pull would.
    fn seed_gap(&self, n: usize) -> i64 {
        let mut inner = self.inner.lock().unwrap();
        let offset = inner.half.len() as i64;
        for _ in 0..n {
            inner.half.push(None);
        }
        offset
    }

    /// Seeds a REMOVE tombstone naming `resolved_half_offset` at the next op offset.
    fn seed_remove(&self, resolved_half_offset: i64, born_ts: DateTime<Utc>) -> i64 {
        let mut inner = self.inner.lock().unwrap();
        let offset = inner.op.len() as i64;
        inner.op.push(OpMessage {
            queue_offset: offset,
            born_ts,
            tag: Some("REMOVE".to_string()),
            body: resolved_half_offset.to_string().into_bytes(),
        });
        offset
    }

    fn half_consume_offset(&self) -> i64 {
        self.inner
            .lock()
            .unwrap()
            .consume_offsets
            .get(&(self.half_queue.topic.clone(), self.half_queue.queue_id))
            .copied()
            .unwrap_or(0)
    }

    fn op_consume_offset(&self) -> i64 {
        self.inner
            .lock()
            .unwrap()
            .consume_offsets
            .get(&(self.op_queue.topic.clone(), self.op_queue.queue_id))
            .copied()
            .unwrap_or(0)
    }
}

fn fetch_window<T: Clone>(items: &[T], offset: i64, n: usize) -> (PullStatus, Vec<T>, i64) {
    let high = items.len() as i64;
    if offset < 0 || offset > high {
        return (PullStatus::OffsetIllegal, Vec::new(), high);
    }
    if offset == high {
        return (PullStatus::NoNewMsg, Vec::new(), offset);
    }
    let end = (offset as usize + n).min(items.len());
    (PullStatus::Found, items[offset as usize..end].to_vec(), end as i64)
}

/// As `fetch_window`, but for the half log's `Option<HalfMessage>` slots: a run of `None`s is
/// a filtered gap, reported as `NoMatchedMsg` with `next_begin_offset` past the whole run, not
/// a single message at a time.
fn fetch_half_window(items: &[Option<HalfMessage>], offset: i64, n: usize) -> (PullStatus, Vec<HalfMessage>, i64) {
    let high = items.len() as i64;
    if offset < 0 || offset > high {
        return (PullStatus::OffsetIllegal, Vec::new(), high);
    }
    if offset == high {
        return (PullStatus::NoNewMsg, Vec::new(), offset);
    }
    if items[offset as usize].is_none() {
        let mut end = offset as usize;
        while end < items.len() && items[end].is_none() {
            end += 1;
        }
        return (PullStatus::NoMatchedMsg, Vec::new(), end as i64);
    }
    let mut messages = Vec::new();
    let mut idx = offset as usize;
    while idx < items.len() && messages.len() < n {
        match &items[idx] {
            Some(msg) => messages.push(msg.clone()),
            None => break,
        }
        idx += 1;
    }
    (PullStatus::Found, messages, idx as i64)
}

#[async_trait]
impl StoreBridge for FakeStore {
    async fn half_queues(&self) -> Result<Vec<MessageQueue>, StoreError> {
        Ok(vec![self.half_queue.clone()])
    }

    async fn pull_half(
        &self,
        queue: &MessageQueue,
        offset: i64,
        n: usize,
    ) -> Result<PullResult<HalfMessage>, StoreError> {
        assert_eq!(queue, &self.half_queue);
        let inner = self.inner.lock().unwrap();
        let (status, messages, next_begin_offset) = fetch_half_window(&inner.half, offset, n);
        Ok(PullResult {
            status,
            messages,
            next_begin_offset,
        })
    }

    async fn pull_op(
        &self,
        queue: &MessageQueue,
        offset: i64,
        n: usize,
    ) -> Result<PullResult<OpMessage>, StoreError> {
        assert_eq!(queue, &self.op_queue);
        let inner = self.inner.lock().unwrap();
        let (status, messages, next_begin_offset) = fetch_window(&inner.op, offset, n);
        Ok(PullResult {
            status,
            messages,
            next_begin_offset,
        })
    }

    async fn append_half(&self, msg: &HalfMessage) -> Result<PutResult, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let offset = inner.half.len() as i64;
        let mut stored = msg.clone();
        stored.queue_offset = offset;
        stored.commit_log_offset = offset;
        inner.half.push(Some(stored));
        Ok(PutResult {
            status: PutStatus::PutOk,
            msg_id: Some(msg.msg_id.clone()),
            queue_offset: Some(offset),
        })
    }

    async fn append_op(&self, half: &HalfMessage, tag: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let offset = inner.op.len() as i64;
        inner.op.push(OpMessage {
            queue_offset: offset,
            born_ts: Utc::now(),
            tag: Some(tag.to_string()),
            body: half.queue_offset.to_string().into_bytes(),
        });
        Ok(true)
    }

    async fn read_consume_offset(&self, queue: &MessageQueue) -> Result<i64, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .consume_offsets
            .get(&(queue.topic.clone(), queue.queue_id))
            .copied()
            .unwrap_or(0))
    }

    async fn write_consume_offset(&self, queue: &MessageQueue, offset: i64) -> Result<(), StoreError> {
        self.inner
            .lock()
            .unwrap()
            .consume_offsets
            .insert((queue.topic.clone(), queue.queue_id), offset);
        Ok(())
    }

    async fn lookup_by_commit_log_offset(&self, offset: i64) -> Result<Option<HalfMessage>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .half
            .iter()
            .filter_map(|h| h.as_ref())
            .find(|h| h.commit_log_offset == offset)
            .cloned())
    }
}

#[derive(Default)]
struct FakeListener {
    resolved: Mutex<Vec<HalfMessage>>,
    discarded: Mutex<Vec<HalfMessage>>,
}

#[async_trait]
impl BackCheckListener for FakeListener {
    async fn resolve_half(&self, msg: HalfMessage) {
        self.resolved.lock().unwrap().push(msg);
    }

    async fn resolve_discard(&self, msg: &HalfMessage) {
        self.discarded.lock().unwrap().push(msg.clone());
    }
}

fn default_config() -> txcheck_core::config::CheckConfig {
    txcheck_core::config::CheckConfig {
        transaction_timeout: Duration::from_secs(6),
        transaction_check_max: 5,
        file_reserved_time_hours: 72,
    }
}

fn properties(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

/// S1: a half is committed before its immunity window elapses - the op record resolving it
/// is already visible at scan time, so the scanner advances straight past it without ever
/// dispatching a back-check, and the op offset advances over the op record that resolved it.
#[tokio::test]
async fn committed_before_immunity_resolves_without_back_check() {
    let store = FakeStore::new();
    let now = Utc::now();
    store.seed_half(now - chrono::Duration::seconds(1), now - chrono::Duration::seconds(1), HashMap::new());
    store.seed_remove(0, now - chrono::Duration::milliseconds(500));

    let scanner = HalfScanner::new(std::sync::Arc::new(store), default_config());
    let listener = FakeListener::default();
    let half_queue = MessageQueue::new(BROKER, HALF_TOPIC, 0);
    let op_queue = half_queue.paired_op_queue();

    let outcome = scanner.scan(&half_queue, &op_queue, 0, 0, &listener, now).await;

    match outcome {
        ScanOutcome::Advanced { new_half_offset, new_op_offset } => {
            assert_eq!(new_half_offset, 1);
            assert_eq!(new_op_offset, 1);
        }
        other => panic!("expected Advanced, got {other:?}"),
    }
    assert!(listener.resolved.lock().unwrap().is_empty());
    assert!(listener.discarded.lock().unwrap().is_empty());
}

/// S2: a half with no resolving op record and no immunity property ages past the configured
/// timeout - the scanner dispatches exactly one back-check and advances past it.
#[tokio::test]
async fn timed_out_half_triggers_single_back_check() {
    let store = FakeStore::new();
    let now = Utc::now();
    store.seed_half(now - chrono::Duration::seconds(10), now - chrono::Duration::seconds(10), HashMap::new());

    let store = std::sync::Arc::new(store);
    let scanner = HalfScanner::new(store.clone(), default_config());
    let listener = FakeListener::default();
    let half_queue = MessageQueue::new(BROKER, HALF_TOPIC, 0);
    let op_queue = half_queue.paired_op_queue();

    let outcome = scanner.scan(&half_queue, &op_queue, 0, 0, &listener, now).await;

    match outcome {
        ScanOutcome::Advanced { new_half_offset, .. } => assert_eq!(new_half_offset, 1),
        other => panic!("expected Advanced, got {other:?}"),
    }
    let resolved = listener.resolved.lock().unwrap();
    assert_eq!(resolved.len(), 1);
    assert_eq!(resolved[0].check_times(), 1);

    // The re-appended half landed at offset 1, carrying the bumped check count.
    let requeued = store.pull_half(&half_queue, 1, 1).await.unwrap();
    assert_eq!(requeued.messages.len(), 1);
    assert_eq!(requeued.messages[0].check_times(), 1);
}

/// S3: a half that has already exhausted `transaction_check_max` is discarded outright,
/// never re-dispatched, and the scan still advances past it.
#[tokio::test]
async fn exhausted_checks_are_discarded() {
    let store = FakeStore::new();
    let now = Utc::now();
    store.seed_half(
        now - chrono::Duration::seconds(10),
        now - chrono::Duration::seconds(10),
        properties(&[("TRANSACTION_CHECK_TIMES", "5")]),
    );

    let scanner = HalfScanner::new(std::sync::Arc::new(store), default_config());
    let listener = FakeListener::default();
    let half_queue = MessageQueue::new(BROKER, HALF_TOPIC, 0);
    let op_queue = half_queue.paired_op_queue();

    let outcome = scanner.scan(&half_queue, &op_queue, 0, 0, &listener, now).await;

    match outcome {
        ScanOutcome::Advanced { new_half_offset, .. } => assert_eq!(new_half_offset, 1),
        other => panic!("expected Advanced, got {other:?}"),
    }
    assert!(listener.resolved.lock().unwrap().is_empty());
    assert_eq!(listener.discarded.lock().unwrap().len(), 1);
}

/// S4: a half older than the store's retention window is skipped the same way an exhausted
/// half is - there's no point back-checking a producer about a segment that's already gone.
#[tokio::test]
async fn halves_older_than_retention_are_skipped() {
    let store = FakeStore::new();
    let now = Utc::now();
    let ancient = now - chrono::Duration::hours(3 * 72 + 1);
    store.seed_half(ancient, ancient, HashMap::new());

    let mut config = default_config();
    config.file_reserved_time_hours = 72;
    let scanner = HalfScanner::new(std::sync::Arc::new(store), config);
    let listener = FakeListener::default();
    let half_queue = MessageQueue::new(BROKER, HALF_TOPIC, 0);
    let op_queue = half_queue.paired_op_queue();

    let outcome = scanner.scan(&half_queue, &op_queue, 0, 0, &listener, now).await;

    match outcome {
        ScanOutcome::Advanced { new_half_offset, .. } => assert_eq!(new_half_offset, 1),
        other => panic!("expected Advanced, got {other:?}"),
    }
    assert!(listener.resolved.lock().unwrap().is_empty());
    assert_eq!(listener.discarded.lock().unwrap().len(), 1);
}

/// S5: a half carrying an explicit `CheckImmunitySeconds` still inside its window, with no
/// prior `PreparedQueueOffset`, is re-appended under immunity (not back-checked) and the
/// original offset is consumed.
#[tokio::test]
async fn explicit_immunity_property_is_honored() {
    let store = FakeStore::new();
    let now = Utc::now();
    store.seed_half(
        now - chrono::Duration::seconds(2),
        now - chrono::Duration::seconds(2),
        properties(&[("CHECK_IMMUNITY_TIME_IN_SECONDS", "30")]),
    );

    let store = std::sync::Arc::new(store);
    let scanner = HalfScanner::new(store.clone(), default_config());
    let listener = FakeListener::default();
    let half_queue = MessageQueue::new(BROKER, HALF_TOPIC, 0);
    let op_queue = half_queue.paired_op_queue();

    let outcome = scanner.scan(&half_queue, &op_queue, 0, 0, &listener, now).await;

    match outcome {
        ScanOutcome::Advanced { new_half_offset, .. } => assert_eq!(new_half_offset, 1),
        other => panic!("expected Advanced, got {other:?}"),
    }
    assert!(listener.resolved.lock().unwrap().is_empty());
    assert!(listener.discarded.lock().unwrap().is_empty());

    let requeued = store.pull_half(&half_queue, 1, 1).await.unwrap();
    assert_eq!(requeued.messages.len(), 1);
    assert_eq!(
        requeued.messages[0].prepared_queue_offset(),
        Some(0),
        "re-append under immunity stamps PreparedQueueOffset with the prior offset"
    );
}

/// S5 continued: once the immune copy above is itself reconsidered on a later scan,
/// `check_prepare_queue_offset` resolves its `PreparedQueueOffset` transitively via
/// `removeMap`, rather than dispatching another back-check. The resolving op record only
/// becomes visible at the *prior* offset, which the scan must never revisit directly (it
/// sits behind a filtered gap), so the only place that entry can be consumed is the explicit
/// `removeMap` lookup inside `check_prepare_queue_offset` itself.
#[tokio::test]
async fn immune_half_resolves_prior_offset_transitively() {
    let store = FakeStore::new();
    let now = Utc::now();

    // Offsets 0-3 are filtered out from this consumer's view; offset 3 is where the prior
    // incarnation of this transaction logically lived, but the scan never lands on it.
    store.seed_gap(4);
    // offset 4: the still-immune re-append, pointing back at the never-revisited offset 3.
    store.seed_half(
        now - chrono::Duration::seconds(2),
        now - chrono::Duration::seconds(20),
        properties(&[
            ("CHECK_IMMUNITY_TIME_IN_SECONDS", "30"),
            ("TRANSACTION_PREPARED_QUEUE_OFFSET", "3"),
        ]),
    );
    store.seed_remove(3, now);

    let store = std::sync::Arc::new(store);
    let scanner = HalfScanner::new(store.clone(), default_config());
    let listener = FakeListener::default();
    let half_queue = MessageQueue::new(BROKER, HALF_TOPIC, 0);
    let op_queue = half_queue.paired_op_queue();

    let outcome = scanner.scan(&half_queue, &op_queue, 0, 0, &listener, now).await;

    match outcome {
        ScanOutcome::Advanced { new_half_offset, new_op_offset } => {
            assert_eq!(new_half_offset, 5);
            assert_eq!(new_op_offset, 1);
        }
        other => panic!("expected Advanced, got {other:?}"),
    }
    assert!(
        listener.resolved.lock().unwrap().is_empty(),
        "transitive resolution must not dispatch a second back-check"
    );
    assert!(listener.discarded.lock().unwrap().is_empty());
}

/// S6: a half stored after the scan's `start_time` must not be touched this tick - it may
/// still be mid-flight from the producer that just sent it.
#[tokio::test]
async fn freshly_stored_half_is_left_for_next_tick() {
    let store = FakeStore::new();
    let start_time = Utc::now() - chrono::Duration::seconds(1);
    let stored_just_now = Utc::now();
    store.seed_half(stored_just_now, stored_just_now, HashMap::new());

    let scanner = HalfScanner::new(std::sync::Arc::new(store), default_config());
    let listener = FakeListener::default();
    let half_queue = MessageQueue::new(BROKER, HALF_TOPIC, 0);
    let op_queue = half_queue.paired_op_queue();

    let outcome = scanner.scan(&half_queue, &op_queue, 0, 0, &listener, start_time).await;

    match outcome {
        ScanOutcome::Deferred => {}
        other => panic!("expected Deferred, got {other:?}"),
    }
    assert!(listener.resolved.lock().unwrap().is_empty());
    assert!(listener.discarded.lock().unwrap().is_empty());
}

/// A half below the scan's starting offset that a tombstone still names is folded straight
/// into `done_op_offset` by the op index - it was already consumed by an earlier tick, so no
/// `removeMap` bookkeeping is needed for it at all.
#[tokio::test]
async fn tombstone_for_already_consumed_half_advances_op_offset_only() {
    let store = FakeStore::new();
    let now = Utc::now();
    // offset 0: already behind the half consume offset this scan starts from.
    store.seed_half(now - chrono::Duration::seconds(40), now - chrono::Duration::seconds(40), HashMap::new());
    // offset 1: the live half the scan will actually look at, aged past the timeout.
    store.seed_half(now - chrono::Duration::seconds(10), now - chrono::Duration::seconds(10), HashMap::new());
    store.seed_remove(0, now - chrono::Duration::seconds(39));

    let store = std::sync::Arc::new(store);
    let scanner = HalfScanner::new(store.clone(), default_config());
    let listener = FakeListener::default();
    let half_queue = MessageQueue::new(BROKER, HALF_TOPIC, 0);
    let op_queue = half_queue.paired_op_queue();

    // h0 = 1: offset 0 was already consumed by a prior tick.
    let outcome = scanner.scan(&half_queue, &op_queue, 1, 0, &listener, now).await;

    match outcome {
        ScanOutcome::Advanced { new_half_offset, new_op_offset } => {
            assert_eq!(new_half_offset, 2);
            assert_eq!(new_op_offset, 1);
        }
        other => panic!("expected Advanced, got {other:?}"),
    }
    // The live half at offset 1 had no resolving tombstone, so it still gets back-checked.
    assert_eq!(listener.resolved.lock().unwrap().len(), 1);
}

fn new_scan_error() -> ScanError {
    ScanError::Store(StoreError::MissingConsumeOffset(MessageQueue::new(BROKER, HALF_TOPIC, 0)))
}

#[test]
fn scan_error_display_names_the_offending_queue() {
    let err = new_scan_error();
    assert!(err.to_string().contains("MessageQueue"));
}
