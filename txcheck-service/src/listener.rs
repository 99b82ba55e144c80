//! The back-check dispatcher: the one piece of the system that talks to the producer-facing
//! RPC layer, which sits outside the check engine entirely. This implementation hands the
//! half message off to a dedicated Kafka topic for whatever gateway actually speaks
//! `checkLocalTransaction` to producers - the core only requires that the call not block.

use async_trait::async_trait;
use common_kafka::kafka_producer::KafkaContext;
use rdkafka::producer::FutureProducer;
use tracing::{error, warn};
use txcheck_core::{BackCheckListener, HalfMessage};

use crate::metrics_constants;

pub const BACK_CHECK_REQUEST_TOPIC: &str = "RMQ_SYS_TRANS_CHECK_REQUEST_TOPIC";

pub struct KafkaBackCheckDispatcher {
    producer: FutureProducer<KafkaContext>,
}

impl KafkaBackCheckDispatcher {
    pub fn new(producer: FutureProducer<KafkaContext>) -> Self {
        Self { producer }
    }
}

#[async_trait]
impl BackCheckListener for KafkaBackCheckDispatcher {
    async fn resolve_half(&self, msg: HalfMessage) {
        let producer = self.producer.clone();
        tokio::spawn(async move {
            if let Err(err) = common_kafka::partition_reader::append(
                &producer,
                BACK_CHECK_REQUEST_TOPIC,
                msg.queue.queue_id,
                Some(msg.msg_id.as_bytes()),
                &msg.body,
                None,
            )
            .await
            {
                error!(error = %err, msg_id = %msg.msg_id, "failed to dispatch back-check request");
                common_metrics::inc(metrics_constants::BACK_CHECK_DISPATCH_FAILURES, &[], 1);
            }
        });
    }

    async fn resolve_discard(&self, msg: &HalfMessage) {
        warn!(
            msg_id = %msg.msg_id,
            check_times = msg.check_times(),
            "half message permanently discarded"
        );
        common_metrics::inc(metrics_constants::HALF_DISCARD_TOTAL, &[], 1);
    }
}
