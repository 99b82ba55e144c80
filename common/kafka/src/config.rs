use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic

    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32, // Size of the in-memory producer queue in mebibytes

    #[envconfig(default = "10000000")]
    pub kafka_producer_queue_messages: u32, // Maximum number of messages in the in-memory producer queue

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message: 20 seconds

    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    pub kafka_topic_metadata_refresh_interval_ms: Option<u32>,
    pub kafka_producer_batch_size: Option<u32>, // Batch size in bytes (e.g., 8388608 for 8 MB)
    pub kafka_enable_idempotence: Option<bool>, // Enable idempotent producer for exactly-once semantics
    pub kafka_max_in_flight: Option<u32>,       // Max in-flight requests per connection
    pub kafka_retry_backoff_ms: Option<u32>,    // Backoff time between retry attempts
    pub kafka_socket_timeout_ms: Option<u32>,   // Socket operation timeout
    pub kafka_metadata_max_age_ms: Option<u32>, // Metadata refresh interval
}

// The check engine never joins a consumer group - it seeks to an explicit offset on an
// explicit partition every time it pulls, since the durable position it resumes from is
// the consume offset row in Postgres, not anything rdkafka tracks for us.
#[derive(Envconfig, Clone)]
pub struct ReaderConfig {
    #[envconfig(default = "1000")]
    pub kafka_reader_poll_timeout_ms: u64,

    #[envconfig(default = "5000")]
    pub kafka_reader_metadata_timeout_ms: u64,
}
