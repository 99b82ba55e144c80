//! The top-level periodic driver. Enumerates half queues, runs one `HalfScanner` tick per
//! queue under its own wall-clock budget, and exposes the broker-facing entry points that
//! create and resolve half messages. Owns nothing but its `StoreBridge` and the process-wide
//! half-queue → op-queue memoization - there is no other mutable state here.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;

use crate::config::CheckConfig;
use crate::half_scanner::{BackCheckListener, HalfScanner, ScanOutcome};
use crate::metrics_consts;
use crate::store::StoreBridge;
use crate::types::{
    EndTransactionHeader, HalfMessage, MessageQueue, OperationResult, OperationStatus, PutResult,
    REMOVE_TAG,
};

pub struct CheckEngine {
    store: Arc<dyn StoreBridge>,
    op_queue_map: DashMap<MessageQueue, MessageQueue>,
    file_reserved_time_hours: i64,
}

impl CheckEngine {
    pub fn new(store: Arc<dyn StoreBridge>, file_reserved_time_hours: i64) -> Self {
        Self {
            store,
            op_queue_map: DashMap::new(),
            file_reserved_time_hours,
        }
    }

    /// One full check pass: every half queue gets at most one `HalfScanner` tick. A queue
    /// that breaks is logged and skipped; it never aborts the remaining queues.
    pub async fn check(
        &self,
        transaction_timeout: Duration,
        transaction_check_max: i32,
        listener: &dyn BackCheckListener,
    ) {
        let config = CheckConfig {
            transaction_timeout,
            transaction_check_max,
            file_reserved_time_hours: self.file_reserved_time_hours,
        };
        let scanner = HalfScanner::new(self.store.clone(), config);
        let start_time = Utc::now();
        let _run_timer = common_metrics::timing_guard(metrics_consts::CHECK_RUN_TIME, &[]);
        common_metrics::inc(metrics_consts::CHECK_RUN_STARTS, &[], 1);

        let half_queues = match self.store.half_queues().await {
            Ok(queues) => queues,
            Err(err) => {
                tracing::error!(error = %err, "failed to enumerate half queues, skipping this check pass");
                return;
            }
        };
        if half_queues.is_empty() {
            return;
        }

        for half_queue in half_queues {
            let op_queue = self.op_queue_for(&half_queue);

            let h0 = match self.store.read_consume_offset(&half_queue).await {
                Ok(offset) if offset >= 0 => offset,
                Ok(offset) => {
                    tracing::error!(broker_name = %half_queue.broker_name, queue_id = half_queue.queue_id, offset, "negative half consume offset, skipping queue");
                    continue;
                }
                Err(err) => {
                    tracing::error!(error = %err, broker_name = %half_queue.broker_name, queue_id = half_queue.queue_id, "failed to read half consume offset, skipping queue");
                    continue;
                }
            };
            let o0 = match self.store.read_consume_offset(&op_queue).await {
                Ok(offset) if offset >= 0 => offset,
                Ok(offset) => {
                    tracing::error!(broker_name = %op_queue.broker_name, queue_id = op_queue.queue_id, offset, "negative op consume offset, skipping queue");
                    continue;
                }
                Err(err) => {
                    tracing::error!(error = %err, broker_name = %op_queue.broker_name, queue_id = op_queue.queue_id, "failed to read op consume offset, skipping queue");
                    continue;
                }
            };

            common_metrics::inc(metrics_consts::QUEUES_SCANNED, &[], 1);
            match scanner
                .scan(&half_queue, &op_queue, h0, o0, listener, start_time)
                .await
            {
                ScanOutcome::Advanced {
                    new_half_offset,
                    new_op_offset,
                } => {
                    tracing::debug!(
                        broker_name = %half_queue.broker_name,
                        queue_id = half_queue.queue_id,
                        new_half_offset,
                        new_op_offset,
                        "half queue scan advanced"
                    );
                    common_metrics::gauge(
                        metrics_consts::HALF_CONSUME_OFFSET,
                        &[("queue_id".to_string(), half_queue.queue_id.to_string())],
                        new_half_offset as f64,
                    );
                    common_metrics::gauge(
                        metrics_consts::OP_CONSUME_OFFSET,
                        &[("queue_id".to_string(), op_queue.queue_id.to_string())],
                        new_op_offset as f64,
                    );
                }
                ScanOutcome::Deferred => {
                    common_metrics::inc(metrics_consts::QUEUES_DEFERRED, &[], 1);
                }
                // Already logged inside HalfScanner::scan; nothing left to do but move on.
                ScanOutcome::Broken(_) => {
                    common_metrics::inc(metrics_consts::QUEUES_BROKEN, &[], 1);
                }
            }
        }

        common_metrics::inc(metrics_consts::CHECK_RUN_ENDS, &[], 1);
    }

    fn op_queue_for(&self, half_queue: &MessageQueue) -> MessageQueue {
        self.op_queue_map
            .entry(half_queue.clone())
            .or_insert_with(|| half_queue.paired_op_queue())
            .clone()
    }

    pub async fn prepare_message(&self, msg: &HalfMessage) -> PutResult {
        match self.store.append_half(msg).await {
            Ok(result) => result,
            Err(err) => {
                tracing::error!(error = %err, "prepareMessage failed");
                PutResult {
                    status: crate::types::PutStatus::ServiceNotAvailable,
                    msg_id: None,
                    queue_offset: None,
                }
            }
        }
    }

    pub async fn commit_message(&self, header: &EndTransactionHeader) -> OperationResult {
        self.resolve_end_transaction(header).await
    }

    pub async fn rollback_message(&self, header: &EndTransactionHeader) -> OperationResult {
        self.resolve_end_transaction(header).await
    }

    async fn resolve_end_transaction(&self, header: &EndTransactionHeader) -> OperationResult {
        match self
            .store
            .lookup_by_commit_log_offset(header.commit_log_offset)
            .await
        {
            Ok(Some(half)) => OperationResult {
                status: OperationStatus::Success,
                half_message: Some(half),
            },
            Ok(None) => OperationResult {
                status: OperationStatus::SystemError,
                half_message: None,
            },
            Err(err) => {
                tracing::error!(error = %err, commit_log_offset = header.commit_log_offset, "failed to resolve half by commit-log offset");
                OperationResult {
                    status: OperationStatus::SystemError,
                    half_message: None,
                }
            }
        }
    }

    /// Appends the `REMOVE` tombstone for `msg`. Idempotent at the semantic level - a
    /// duplicate call just writes another op record mapping to the same `removeMap` entry.
    pub async fn delete_prepare_message(&self, msg: &HalfMessage) -> bool {
        match self.store.append_op(msg, REMOVE_TAG).await {
            Ok(ok) => ok,
            Err(err) => {
                tracing::error!(error = %err, msg_id = %msg.msg_id, "deletePrepareMessage failed");
                false
            }
        }
    }
}
