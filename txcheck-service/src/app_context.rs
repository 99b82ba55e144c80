use std::sync::Arc;
use std::time::Duration;

use common_kafka::kafka_producer::create_kafka_producer;
use common_kafka::partition_reader::PartitionReader;
use health::{HealthHandle, HealthRegistry};
use txcheck_core::store::BrokerStoreBridge;
use txcheck_core::CheckEngine;

use crate::config::Config;
use crate::listener::KafkaBackCheckDispatcher;

pub struct AppContext {
    pub engine: CheckEngine,
    pub dispatcher: KafkaBackCheckDispatcher,
    pub transaction_timeout: Duration,
    pub transaction_check_max: i32,
}

impl AppContext {
    pub async fn new(config: &Config, liveness: &HealthRegistry) -> Result<Self, eyre::Error> {
        let pool = config.pool_config().connect().await?;

        sqlx::migrate!("../txcheck-core/migrations")
            .run(&pool)
            .await?;

        let kafka_liveness = liveness
            .register("rdkafka".to_string(), Duration::from_secs(30))
            .await;
        let producer = create_kafka_producer(&config.kafka, kafka_liveness).await?;
        let reader = PartitionReader::new(&config.kafka, &config.kafka_reader)?;

        let metadata_timeout =
            Duration::from_millis(config.kafka_reader.kafka_reader_metadata_timeout_ms);
        let store = Arc::new(BrokerStoreBridge::new(
            pool,
            producer.clone(),
            reader,
            config.broker_name.clone(),
            metadata_timeout,
        ));

        let engine = CheckEngine::new(store, config.file_reserved_time_hours);
        let dispatcher = KafkaBackCheckDispatcher::new(producer);

        Ok(Self {
            engine,
            dispatcher,
            transaction_timeout: Duration::from_millis(config.transaction_timeout_ms),
            transaction_check_max: config.transaction_check_max,
        })
    }

}

pub async fn register_check_liveness(liveness: &HealthRegistry, interval_secs: u64) -> HealthHandle {
    liveness
        .register(
            "check-engine".to_string(),
            Duration::from_secs(interval_secs * 4),
        )
        .await
}
