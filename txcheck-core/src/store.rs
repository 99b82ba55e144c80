//! The store bridge: the only part of the check engine that talks to the underlying
//! log-structured store and its offset ledger. Everything upstream of this module (the
//! scanner, the op index, the check engine) only ever sees the `StoreBridge` trait, never
//! rdkafka or sqlx directly.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use common_kafka::kafka_producer::KafkaContext;
use common_kafka::partition_reader::{self, FetchStatus, PartitionReader, RawMessage};
use rdkafka::producer::FutureProducer;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::StoreError;
use crate::properties;
use crate::types::{
    HalfMessage, MessageQueue, OpMessage, PullResult, PullStatus, PutResult, PutStatus, HALF_TOPIC,
};

/// Everything the check engine needs from the underlying store: pull by offset, re-append,
/// read/advance the two consume offsets, and resolve a half by its physical position.
/// Implementations own all I/O; the engine above this trait is pure decision logic over
/// whatever it returns.
#[async_trait]
pub trait StoreBridge: Send + Sync {
    async fn half_queues(&self) -> Result<Vec<MessageQueue>, StoreError>;

    async fn pull_half(
        &self,
        queue: &MessageQueue,
        offset: i64,
        n: usize,
    ) -> Result<PullResult<HalfMessage>, StoreError>;

    async fn pull_op(
        &self,
        queue: &MessageQueue,
        offset: i64,
        n: usize,
    ) -> Result<PullResult<OpMessage>, StoreError>;

    async fn append_half(&self, msg: &HalfMessage) -> Result<PutResult, StoreError>;

    async fn append_op(&self, half: &HalfMessage, tag: &str) -> Result<bool, StoreError>;

    async fn read_consume_offset(&self, queue: &MessageQueue) -> Result<i64, StoreError>;

    async fn write_consume_offset(&self, queue: &MessageQueue, offset: i64)
        -> Result<(), StoreError>;

    async fn lookup_by_commit_log_offset(
        &self,
        offset: i64,
    ) -> Result<Option<HalfMessage>, StoreError>;

    /// Copies a half message, assigning a fresh `msg_id` and clearing the fields that only
    /// make sense for a stored message (offsets, `store_ts`), ready to hand to `append_half`.
    /// `CheckTimes` is bumped by exactly one, per invariant 5.
    fn renew_half(&self, msg: &HalfMessage) -> HalfMessage {
        let mut properties = msg.properties.clone();
        properties::bump_check_times(&mut properties);
        HalfMessage {
            msg_id: Uuid::now_v7().to_string(),
            queue: msg.queue.clone(),
            queue_offset: -1,
            commit_log_offset: -1,
            born_ts: msg.born_ts,
            store_ts: Utc::now(),
            body: msg.body.clone(),
            properties,
        }
    }

    /// As `renew_half`, but additionally stamps `PreparedQueueOffset` with this message's
    /// *current* offset - each immunity re-append pushes the chain forward by exactly one
    /// hop, never back to the original.
    fn renew_immunity_half(&self, msg: &HalfMessage) -> HalfMessage {
        let mut renewed = self.renew_half(msg);
        properties::set_prepared_queue_offset(&mut renewed.properties, msg.queue_offset);
        renewed
    }
}

/// Wire representation of a half message's payload. `born_ts` travels with the message
/// across re-appends (it's the producer's original send time); `store_ts` is read back from
/// the broker's own per-message timestamp, since that's genuinely assigned at persist time.
#[derive(Debug, Serialize, Deserialize)]
struct HalfWire {
    msg_id: String,
    born_ts_ms: i64,
    body: Vec<u8>,
    properties: HashMap<String, String>,
}

/// The production `StoreBridge`: half/op topics live in Kafka and are pulled by explicit
/// offset seek; the two consume offsets and the commit-log index live in Postgres, the same
/// way `cyclotron_core` keeps its job ledger in Postgres beside a Kafka side-channel.
pub struct BrokerStoreBridge {
    pool: PgPool,
    producer: FutureProducer<KafkaContext>,
    reader: Arc<PartitionReader>,
    broker_name: String,
    metadata_timeout: std::time::Duration,
}

impl BrokerStoreBridge {
    pub fn new(
        pool: PgPool,
        producer: FutureProducer<KafkaContext>,
        reader: PartitionReader,
        broker_name: impl Into<String>,
        metadata_timeout: std::time::Duration,
    ) -> Self {
        Self {
            pool,
            producer,
            reader: Arc::new(reader),
            broker_name: broker_name.into(),
            metadata_timeout,
        }
    }

    fn half_wire_to_message(
        &self,
        queue: &MessageQueue,
        raw: RawMessage,
    ) -> Option<HalfMessage> {
        let wire: HalfWire = serde_json::from_slice(&raw.payload).ok()?;
        let store_ts = raw
            .timestamp_ms
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(Utc::now);
        Some(HalfMessage {
            msg_id: wire.msg_id,
            queue: queue.clone(),
            queue_offset: raw.offset,
            // The physical commit-log offset is assigned separately, via the commit-log
            // index populated at append time; pulls don't need to round-trip it.
            commit_log_offset: -1,
            born_ts: Utc.timestamp_millis_opt(wire.born_ts_ms).single()?,
            store_ts,
            body: wire.body,
            properties: wire.properties,
        })
    }

    fn op_raw_to_message(&self, raw: RawMessage) -> OpMessage {
        let born_ts = raw
            .timestamp_ms
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(Utc::now);
        let tag = raw
            .headers
            .iter()
            .find(|(k, _)| k == "tag")
            .map(|(_, v)| String::from_utf8_lossy(v).into_owned());
        OpMessage {
            queue_offset: raw.offset,
            born_ts,
            tag,
            body: raw.payload,
        }
    }
}

#[async_trait]
impl StoreBridge for BrokerStoreBridge {
    async fn half_queues(&self) -> Result<Vec<MessageQueue>, StoreError> {
        let metadata = self
            .producer
            .client()
            .fetch_metadata(Some(HALF_TOPIC), self.metadata_timeout)
            .map_err(common_kafka::partition_reader::ReaderError::from)?;

        let Some(topic) = metadata.topics().iter().find(|t| t.name() == HALF_TOPIC) else {
            return Ok(Vec::new());
        };

        Ok(topic
            .partitions()
            .iter()
            .map(|p| MessageQueue::new(self.broker_name.clone(), HALF_TOPIC, p.id()))
            .collect())
    }

    async fn pull_half(
        &self,
        queue: &MessageQueue,
        offset: i64,
        n: usize,
    ) -> Result<PullResult<HalfMessage>, StoreError> {
        let result = self.reader.fetch(&queue.topic, queue.queue_id, offset, n)?;
        let status = to_pull_status(result.status);
        let messages = result
            .messages
            .into_iter()
            .filter_map(|raw| self.half_wire_to_message(queue, raw))
            .collect();
        Ok(PullResult {
            status,
            messages,
            next_begin_offset: result.next_begin_offset,
        })
    }

    async fn pull_op(
        &self,
        queue: &MessageQueue,
        offset: i64,
        n: usize,
    ) -> Result<PullResult<OpMessage>, StoreError> {
        let result = self.reader.fetch(&queue.topic, queue.queue_id, offset, n)?;
        let status = to_pull_status(result.status);
        let messages = result
            .messages
            .into_iter()
            .map(|raw| self.op_raw_to_message(raw))
            .collect();
        Ok(PullResult {
            status,
            messages,
            next_begin_offset: result.next_begin_offset,
        })
    }

    async fn append_half(&self, msg: &HalfMessage) -> Result<PutResult, StoreError> {
        let wire = HalfWire {
            msg_id: msg.msg_id.clone(),
            born_ts_ms: msg.born_ts.timestamp_millis(),
            body: msg.body.clone(),
            properties: msg.properties.clone(),
        };
        let payload = match serde_json::to_vec(&wire) {
            Ok(p) => p,
            Err(_) => {
                return Ok(PutResult {
                    status: PutStatus::MessageIllegal,
                    msg_id: None,
                    queue_offset: None,
                })
            }
        };

        let queue_offset = partition_reader::append(
            &self.producer,
            &msg.queue.topic,
            msg.queue.queue_id,
            Some(msg.msg_id.as_bytes()),
            &payload,
            None,
        )
        .await?;

        let commit_log_offset = sqlx::query_scalar!(
            r#"
            INSERT INTO txcheck_commit_log_index (commit_log_offset, broker_name, queue_id, queue_offset)
            VALUES (nextval('txcheck_commit_log_offset_seq'), $1, $2, $3)
            RETURNING commit_log_offset
            "#,
            msg.queue.broker_name,
            msg.queue.queue_id,
            queue_offset,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(PutResult {
            status: PutStatus::PutOk,
            msg_id: Some(msg.msg_id.clone()),
            queue_offset: Some(commit_log_offset),
        })
    }

    async fn append_op(&self, half: &HalfMessage, tag: &str) -> Result<bool, StoreError> {
        let op_queue = half.queue.paired_op_queue();
        let body = half.queue_offset.to_string();

        partition_reader::append(
            &self.producer,
            &op_queue.topic,
            op_queue.queue_id,
            None,
            body.as_bytes(),
            Some(tag),
        )
        .await?;

        Ok(true)
    }

    async fn read_consume_offset(&self, queue: &MessageQueue) -> Result<i64, StoreError> {
        let row = sqlx::query!(
            r#"
            SELECT consume_offset FROM txcheck_consume_offsets
            WHERE broker_name = $1 AND topic = $2 AND queue_id = $3
            "#,
            queue.broker_name,
            queue.topic,
            queue.queue_id,
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.consume_offset).unwrap_or(0))
    }

    async fn write_consume_offset(
        &self,
        queue: &MessageQueue,
        offset: i64,
    ) -> Result<(), StoreError> {
        sqlx::query!(
            r#"
            INSERT INTO txcheck_consume_offsets (broker_name, topic, queue_id, consume_offset, updated_at)
            VALUES ($1, $2, $3, $4, now())
            ON CONFLICT (broker_name, topic, queue_id)
            DO UPDATE SET consume_offset = EXCLUDED.consume_offset, updated_at = now()
            "#,
            queue.broker_name,
            queue.topic,
            queue.queue_id,
            offset,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn lookup_by_commit_log_offset(
        &self,
        offset: i64,
    ) -> Result<Option<HalfMessage>, StoreError> {
        let row = sqlx::query!(
            r#"
            SELECT broker_name, queue_id, queue_offset FROM txcheck_commit_log_index
            WHERE commit_log_offset = $1
            "#,
            offset,
        )
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let queue = MessageQueue::new(row.broker_name, HALF_TOPIC, row.queue_id);
        let pulled = self.pull_half(&queue, row.queue_offset, 1).await?;
        Ok(pulled.messages.into_iter().next())
    }
}

fn to_pull_status(status: FetchStatus) -> PullStatus {
    match status {
        FetchStatus::Found => PullStatus::Found,
        FetchStatus::NoNewMessage => PullStatus::NoNewMsg,
        FetchStatus::NoMatchedMessage => PullStatus::NoMatchedMsg,
        FetchStatus::OffsetIllegal => PullStatus::OffsetIllegal,
    }
}
