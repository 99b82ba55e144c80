//! Walks one half queue from its last consumed offset, classifying each half message and
//! driving back-checks. This is the core decision procedure; everything else in the crate
//! exists to feed it durable state or carry out what it decides.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::{CheckConfig, HALF_PULL_BATCH_SIZE, MAX_RETRY_COUNT_WHEN_HALF_NULL};
use crate::error::ScanError;
use crate::metrics_consts;
use crate::op_index::{self, ScanState};
use crate::properties;
use crate::store::StoreBridge;
use crate::types::{HalfMessage, MessageQueue, PullStatus};

/// What a producer-facing back-check dispatcher must be able to do. `resolve_half` is fired
/// off and must not block the scanner; `resolve_discard` records a half as permanently
/// abandoned. Neither is expected to report failure back to the scanner - a listener that
/// can't deliver is responsible for its own retries.
#[async_trait]
pub trait BackCheckListener: Send + Sync {
    async fn resolve_half(&self, msg: HalfMessage);
    async fn resolve_discard(&self, msg: &HalfMessage);
}

/// Replaces exceptions-as-control-flow: a scan either made progress, deferred everything to
/// the next tick, or broke on a store error. Only `Broken` is logged and causes the queue to
/// be skipped for this tick - `Deferred` is an ordinary, expected outcome.
#[derive(Debug)]
pub enum ScanOutcome {
    Advanced {
        new_half_offset: i64,
        new_op_offset: i64,
    },
    Deferred,
    Broken(ScanError),
}

pub struct HalfScanner {
    store: Arc<dyn StoreBridge>,
    config: CheckConfig,
}

impl HalfScanner {
    pub fn new(store: Arc<dyn StoreBridge>, config: CheckConfig) -> Self {
        Self { store, config }
    }

    /// Runs one scan tick over `half_queue`/`op_queue` starting at `h0`/`o0`. Never returns
    /// an `Err` - any store error is caught and reported as `ScanOutcome::Broken`, per the
    /// per-queue exception boundary.
    pub async fn scan(
        &self,
        half_queue: &MessageQueue,
        op_queue: &MessageQueue,
        h0: i64,
        o0: i64,
        listener: &dyn BackCheckListener,
        start_time: DateTime<Utc>,
    ) -> ScanOutcome {
        match self
            .scan_inner(half_queue, op_queue, h0, o0, listener, start_time)
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(error = %err, broker_name = %half_queue.broker_name, queue_id = half_queue.queue_id, "half queue scan broke");
                ScanOutcome::Broken(err)
            }
        }
    }

    async fn scan_inner(
        &self,
        half_queue: &MessageQueue,
        op_queue: &MessageQueue,
        h0: i64,
        o0: i64,
        listener: &dyn BackCheckListener,
        start_time: DateTime<Utc>,
    ) -> Result<ScanOutcome, ScanError> {
        let mut state = ScanState::new();
        let mut i = h0;
        let mut new_half_offset = h0;
        let mut empty_pull_count: u32 = 0;

        let mut op_pull =
            op_index::fill_op_remove_map(self.store.as_ref(), op_queue, &mut state, o0, h0).await?;

        let budget = chrono::Duration::from_std(crate::config::PER_QUEUE_BUDGET)
            .expect("60s budget always fits in chrono::Duration");
        let configured_timeout_ms = self.config.transaction_timeout.as_millis() as i64;
        let retention = chrono::Duration::from_std(self.config.file_retention())
            .expect("retention window always fits in chrono::Duration");

        loop {
            let now = Utc::now();

            // 1. budget exhausted
            if now - start_time > budget {
                break;
            }

            // 2. resolved
            if let Some(op_off) = state.remove_map.remove(&i) {
                state.done_op_offset.push(op_off);
                common_metrics::inc(metrics_consts::HALF_RESOLVED, &[], 1);
                i += 1;
                new_half_offset = i;
                continue;
            }

            // 3. fetch
            let pulled = self
                .store
                .pull_half(half_queue, i, HALF_PULL_BATCH_SIZE)
                .await?;
            if pulled.messages.is_empty() {
                if pulled.status == PullStatus::NoNewMsg {
                    break;
                }
                empty_pull_count += 1;
                if empty_pull_count > MAX_RETRY_COUNT_WHEN_HALF_NULL {
                    break;
                }
                i = pulled.next_begin_offset;
                new_half_offset = i;
                continue;
            }
            empty_pull_count = 0;
            let half = pulled
                .messages
                .into_iter()
                .next()
                .expect("checked non-empty above");

            // 4. discard / skip screening
            if half.check_times() >= self.config.transaction_check_max {
                listener.resolve_discard(&half).await;
                common_metrics::inc(metrics_consts::HALF_DISCARDED, &[], 1);
                i += 1;
                new_half_offset = i;
                continue;
            }
            if now.signed_duration_since(half.born_ts) > retention {
                listener.resolve_discard(&half).await;
                common_metrics::inc(metrics_consts::HALF_SKIPPED_EXPIRED, &[], 1);
                i += 1;
                new_half_offset = i;
                continue;
            }

            // 5. freshly-stored guard
            if half.store_ts >= start_time {
                break;
            }

            // 6. immunity computation
            let value_of_current_minus_born_ms =
                now.signed_duration_since(half.born_ts).num_milliseconds();
            let check_immunity_time_ms = match half.check_immunity_seconds() {
                Some(seconds) if seconds != properties::USE_DEFAULT_IMMUNITY => seconds * 1000,
                _ => configured_timeout_ms,
            };

            if half.has_check_immunity_seconds() {
                // 7. immunity with explicit property
                if value_of_current_minus_born_ms < check_immunity_time_ms {
                    let resolved = self
                        .check_prepare_queue_offset(&half, now, check_immunity_time_ms, &mut state)
                        .await?;
                    if resolved {
                        i += 1;
                        new_half_offset = i;
                        continue;
                    }
                    break;
                }
            } else if (0..check_immunity_time_ms).contains(&value_of_current_minus_born_ms) {
                // 8. immunity without property
                break;
            }

            // 9. need-check predicate
            let needs_check_on_absence = op_pull.messages.is_empty()
                && value_of_current_minus_born_ms > check_immunity_time_ms;
            let needs_check_on_staleness = op_pull.messages.last().is_some_and(|last| {
                last.born_ts.signed_duration_since(start_time).num_milliseconds()
                    > configured_timeout_ms
            });
            let needs_check_on_clock_anomaly = value_of_current_minus_born_ms <= -1;

            if needs_check_on_absence || needs_check_on_staleness || needs_check_on_clock_anomaly
            {
                // 10. dispatch back-check
                let renewed = self.store.renew_half(&half);
                let put = self.store.append_half(&renewed).await?;
                if !put.is_ok() {
                    break;
                }
                listener.resolve_half(renewed).await;
                common_metrics::inc(metrics_consts::BACK_CHECKS_DISPATCHED, &[], 1);
                i += 1;
                new_half_offset = i;
            } else {
                // 11. not required, undecided: ingest more op evidence and retry this offset
                op_pull = op_index::fill_op_remove_map(
                    self.store.as_ref(),
                    op_queue,
                    &mut state,
                    op_pull.next_begin_offset,
                    h0,
                )
                .await?;
            }
        }

        let new_op_offset = op_index::calculate_op_offset(&state.done_op_offset, o0);

        if new_half_offset != h0 {
            self.store
                .write_consume_offset(half_queue, new_half_offset)
                .await?;
        }
        if new_op_offset != o0 {
            self.store.write_consume_offset(op_queue, new_op_offset).await?;
        }

        if new_half_offset == h0 && new_op_offset == o0 {
            Ok(ScanOutcome::Deferred)
        } else {
            Ok(ScanOutcome::Advanced {
                new_half_offset,
                new_op_offset,
            })
        }
    }

    /// Resolves (or re-defers) a half still inside its immunity window that already carries
    /// a prior back-check. Mutates `state` when the prior offset turns out to have been
    /// resolved transitively.
    async fn check_prepare_queue_offset(
        &self,
        half: &HalfMessage,
        now: DateTime<Utc>,
        check_immunity_time_ms: i64,
        state: &mut ScanState,
    ) -> Result<bool, ScanError> {
        let age_ms = now.signed_duration_since(half.born_ts).num_milliseconds();
        if age_ms >= check_immunity_time_ms {
            return Ok(true);
        }

        match half.prepared_queue_offset() {
            None => {
                let renewed = self.store.renew_immunity_half(half);
                let put = self.store.append_half(&renewed).await?;
                Ok(put.is_ok())
            }
            Some(prior) if prior == properties::PARSE_FAILURE_SENTINEL => Ok(false),
            Some(prior) => {
                if let Some(op_off) = state.remove_map.remove(&prior) {
                    state.done_op_offset.push(op_off);
                    Ok(true)
                } else {
                    let renewed = self.store.renew_immunity_half(half);
                    let put = self.store.append_half(&renewed).await?;
                    Ok(put.is_ok())
                }
            }
        }
    }
}
