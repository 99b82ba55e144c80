use std::collections::HashMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// The system topic half messages are parked in until a producer resolves them.
pub const HALF_TOPIC: &str = "RMQ_SYS_TRANS_HALF_TOPIC";
/// The system topic commit/rollback tombstones are appended to.
pub const OP_TOPIC: &str = "RMQ_SYS_TRANS_OP_HALF_TOPIC";

/// The only tag an op record needs to carry to be considered valid evidence that a half
/// message was resolved. Anything else is logged and ignored.
pub const REMOVE_TAG: &str = "REMOVE";

/// One physical queue, identified the same way the broker identifies it: which broker it
/// lives on, which topic, and which queue (partition) index within that topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageQueue {
    pub broker_name: String,
    pub topic: String,
    pub queue_id: i32,
}

impl MessageQueue {
    pub fn new(broker_name: impl Into<String>, topic: impl Into<String>, queue_id: i32) -> Self {
        Self {
            broker_name: broker_name.into(),
            topic: topic.into(),
            queue_id,
        }
    }

    /// The op queue that mirrors this half queue: same broker, same queue id, `OP_TOPIC`.
    pub fn paired_op_queue(&self) -> MessageQueue {
        MessageQueue::new(self.broker_name.clone(), OP_TOPIC, self.queue_id)
    }
}

/// A prepared (half) message, as read back from `HALF_TOPIC`.
#[derive(Debug, Clone)]
pub struct HalfMessage {
    pub msg_id: String,
    pub queue: MessageQueue,
    pub queue_offset: i64,
    pub commit_log_offset: i64,
    pub born_ts: DateTime<Utc>,
    pub store_ts: DateTime<Utc>,
    pub body: Vec<u8>,
    pub properties: HashMap<String, String>,
}

impl HalfMessage {
    pub fn check_times(&self) -> i32 {
        self.properties
            .get(crate::properties::CHECK_TIMES)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// Raw presence of the property, independent of whether it parses - a half that
    /// carries a garbled `CheckImmunitySeconds` still takes the "explicit property" branch,
    /// it just falls back to the configured timeout for its *value*.
    pub fn has_check_immunity_seconds(&self) -> bool {
        self.properties
            .contains_key(crate::properties::CHECK_IMMUNITY_SECONDS)
    }

    pub fn check_immunity_seconds(&self) -> Option<i64> {
        self.properties
            .get(crate::properties::CHECK_IMMUNITY_SECONDS)
            .and_then(|v| v.parse().ok())
    }

    /// `None` means the property was never set; `Some(sentinel)` means it was set but
    /// unparseable - the two are handled differently by `checkPrepareQueueOffset`.
    pub fn prepared_queue_offset(&self) -> Option<i64> {
        crate::properties::parse_prepared_queue_offset(&self.properties)
    }
}

/// A commit/rollback tombstone, as read back from `OP_TOPIC`.
#[derive(Debug, Clone)]
pub struct OpMessage {
    pub queue_offset: i64,
    pub born_ts: DateTime<Utc>,
    pub tag: Option<String>,
    pub body: Vec<u8>,
}

impl OpMessage {
    pub fn is_remove(&self) -> bool {
        self.tag.as_deref() == Some(REMOVE_TAG)
    }

    /// Parses the half offset this op record names. Op record bodies are always
    /// ASCII-decimal, so a parse failure means a malformed record, not a transient error.
    pub fn resolved_half_offset(&self) -> Option<i64> {
        std::str::from_utf8(&self.body)
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }
}

/// The result of a `pull_half`/`pull_op` call, mirroring the broker's own pull contract:
/// an illegal offset reports the position the caller should resume from instead of erroring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullStatus {
    Found,
    NoNewMsg,
    NoMatchedMsg,
    OffsetIllegal,
}

#[derive(Debug, Clone)]
pub struct PullResult<T> {
    pub status: PullStatus,
    pub messages: Vec<T>,
    pub next_begin_offset: i64,
}

impl<T> PullResult<T> {
    pub fn empty(status: PullStatus, next_begin_offset: i64) -> Self {
        Self {
            status,
            messages: Vec::new(),
            next_begin_offset,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutStatus {
    PutOk,
    FlushDiskTimeout,
    FlushSlaveTimeout,
    SlaveNotAvailable,
    ServiceNotAvailable,
    CreateMappedFileFailed,
    MessageIllegal,
    PropertiesSizeExceeded,
}

#[derive(Debug, Clone)]
pub struct PutResult {
    pub status: PutStatus,
    pub msg_id: Option<String>,
    pub queue_offset: Option<i64>,
}

impl PutResult {
    pub fn is_ok(&self) -> bool {
        self.status == PutStatus::PutOk
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    Success,
    SystemError,
}

#[derive(Debug, Clone)]
pub struct OperationResult {
    pub status: OperationStatus,
    pub half_message: Option<HalfMessage>,
}

/// The header a `commitMessage`/`rollbackMessage` request carries in from the client API -
/// all the core needs out of it is the physical offset of the half it's resolving.
#[derive(Debug, Clone)]
pub struct EndTransactionHeader {
    pub commit_log_offset: i64,
    pub producer_group: String,
    pub transaction_id: Option<Uuid>,
}
