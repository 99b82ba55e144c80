//! A manual-offset reader over a single Kafka partition.
//!
//! The transactional check engine never joins a consumer group: the position it resumes
//! from is the consume offset row it owns in Postgres, not anything rdkafka tracks for us.
//! So instead of `SingleTopicConsumer`'s group-subscribe-and-stream model, this assigns one
//! partition at a time and seeks to an explicit offset before every fetch, mirroring the
//! broker's own `pullMessage(topic, queue, offset, n)` contract.

use std::time::Duration;

use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use thiserror::Error;

use crate::config::{KafkaConfig, ReaderConfig};
use crate::kafka_producer::KafkaContext;

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
}

/// Mirrors the broker's `PullStatus` enumeration: callers branch on this before looking at
/// `messages`, since an empty list means different things depending on the status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    Found,
    NoNewMessage,
    NoMatchedMessage,
    OffsetIllegal,
}

#[derive(Debug, Clone)]
pub struct RawMessage {
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
    pub timestamp_ms: Option<i64>,
    pub headers: Vec<(String, Vec<u8>)>,
}

#[derive(Debug)]
pub struct FetchResult {
    pub status: FetchStatus,
    pub messages: Vec<RawMessage>,
    /// The offset a caller should resume pulling from next. Equal to `offset` unless the
    /// pull was rejected as illegal, in which case it's clamped to the partition's bounds.
    pub next_begin_offset: i64,
}

pub struct PartitionReader {
    consumer: BaseConsumer,
    poll_timeout: Duration,
}

impl PartitionReader {
    pub fn new(config: &KafkaConfig, reader: &ReaderConfig) -> Result<Self, ReaderError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false")
            // rdkafka requires a group id even for an assign()-only consumer that never joins one.
            .set("group.id", "txcheck-half-scanner");

        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }

        let consumer: BaseConsumer = client_config.create()?;

        Ok(Self {
            consumer,
            poll_timeout: Duration::from_millis(reader.kafka_reader_poll_timeout_ms),
        })
    }

    /// Pull up to `n` messages from `topic`/`partition` starting at `offset`. An offset
    /// outside the partition's current bounds comes back as `OffsetIllegal` with
    /// `next_begin_offset` clamped to the nearest valid position, so the caller can forward
    /// its consume offset past the gap instead of retrying forever.
    pub fn fetch(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        n: usize,
    ) -> Result<FetchResult, ReaderError> {
        let (low, high) = self
            .consumer
            .fetch_watermarks(topic, partition, self.poll_timeout)?;

        if offset < low || offset > high {
            return Ok(FetchResult {
                status: FetchStatus::OffsetIllegal,
                messages: Vec::new(),
                next_begin_offset: offset.clamp(low, high),
            });
        }

        if offset == high {
            return Ok(FetchResult {
                status: FetchStatus::NoNewMessage,
                messages: Vec::new(),
                next_begin_offset: offset,
            });
        }

        let mut assignment = TopicPartitionList::new();
        assignment.add_partition_offset(topic, partition, Offset::Offset(offset))?;
        self.consumer.assign(&assignment)?;

        let mut messages = Vec::with_capacity(n);
        let mut next_offset = offset;
        while messages.len() < n {
            match self.consumer.poll(self.poll_timeout) {
                Some(Ok(msg)) => {
                    next_offset = msg.offset() + 1;
                    messages.push(to_raw(&msg));
                    if next_offset >= high {
                        break;
                    }
                }
                Some(Err(e)) => return Err(e.into()),
                None => break,
            }
        }

        if messages.is_empty() {
            return Ok(FetchResult {
                status: FetchStatus::NoMatchedMessage,
                messages,
                next_begin_offset: next_offset,
            });
        }

        Ok(FetchResult {
            status: FetchStatus::Found,
            messages,
            next_begin_offset: next_offset,
        })
    }
}

fn to_raw(msg: &BorrowedMessage) -> RawMessage {
    RawMessage {
        offset: msg.offset(),
        key: msg.key().map(|k| k.to_vec()),
        payload: msg.payload().map(|p| p.to_vec()).unwrap_or_default(),
        timestamp_ms: msg.timestamp().to_millis(),
        headers: msg
            .headers()
            .map(|hs| {
                hs.iter()
                    .map(|h| (h.key.to_string(), h.value.map(|v| v.to_vec()).unwrap_or_default()))
                    .collect()
            })
            .unwrap_or_default(),
    }
}

/// Appends one message to `topic`/`partition`, optionally tagged via a single Kafka header
/// (the broker's op records carry exactly one: `REMOVE`). Returns the offset the broker
/// assigned it, since the scanner needs to know where a re-appended half now lives.
pub async fn append(
    producer: &FutureProducer<KafkaContext>,
    topic: &str,
    partition: i32,
    key: Option<&[u8]>,
    payload: &[u8],
    tag: Option<&str>,
) -> Result<i64, ReaderError> {
    let mut record = FutureRecord::to(topic).payload(payload).partition(partition);
    if let Some(k) = key {
        record = record.key(k);
    }

    let headers = tag.map(|tag| {
        OwnedHeaders::new().insert(Header {
            key: "tag",
            value: Some(tag),
        })
    });
    if let Some(headers) = headers {
        record = record.headers(headers);
    }

    match producer.send(record, Duration::from_secs(30)).await {
        Ok((_partition, offset)) => Ok(offset),
        Err((e, _)) => Err(e.into()),
    }
}
