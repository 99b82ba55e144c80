//! Builds the per-scan op-message index: which half offsets are already resolved
//! (`remove_map`), and which op offsets have nothing left to tell us (`done_op_offset`).
//! Rebuilt from scratch on every tick - there is deliberately no cache that survives across
//! ticks, only the two durable consume offsets the scan starts from.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::config::OP_PULL_BATCH_SIZE;
use crate::error::StoreError;
use crate::store::StoreBridge;
use crate::types::{MessageQueue, OpMessage, PullResult, PullStatus};

/// Transient scan state for one half-queue tick. `remove_map` holds "last op wins" by
/// design: duplicate op records for the same half offset simply overwrite the entry, and
/// only the *offset* of the winning op record matters for `done_op_offset` bookkeeping.
#[derive(Debug, Default)]
pub struct ScanState {
    pub remove_map: HashMap<i64, i64>,
    pub done_op_offset: Vec<i64>,
}

impl ScanState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Pulls up to `OP_PULL_BATCH_SIZE` op messages starting at `pull_offset_of_op` and folds
/// them into `state`. Returns the raw pull result so the caller (the half scanner) can read
/// the op message list and `next_begin_offset` for its own decision procedure.
pub async fn fill_op_remove_map(
    store: &dyn StoreBridge,
    op_queue: &MessageQueue,
    state: &mut ScanState,
    pull_offset_of_op: i64,
    mini_half_offset: i64,
) -> Result<PullResult<OpMessage>, StoreError> {
    let pulled = store
        .pull_op(op_queue, pull_offset_of_op, OP_PULL_BATCH_SIZE)
        .await?;

    match pulled.status {
        PullStatus::OffsetIllegal | PullStatus::NoMatchedMsg => {
            store
                .write_consume_offset(op_queue, pulled.next_begin_offset)
                .await?;
            return Ok(pulled);
        }
        PullStatus::NoNewMsg => return Ok(pulled),
        PullStatus::Found => {}
    }

    if pulled.messages.is_empty() {
        return Ok(pulled);
    }

    for op in &pulled.messages {
        if !op.is_remove() {
            debug!(tag = ?op.tag, queue_offset = op.queue_offset, "ignoring op record with non-REMOVE tag");
            continue;
        }

        let Some(q_off) = op.resolved_half_offset() else {
            warn!(queue_offset = op.queue_offset, "malformed op record body, ignoring");
            continue;
        };

        if q_off < mini_half_offset {
            state.done_op_offset.push(op.queue_offset);
        } else {
            state.remove_map.insert(q_off, op.queue_offset);
        }
    }

    Ok(pulled)
}

/// Folds `done_op_offset` into the next op consume offset: sort ascending, then advance
/// past every element that contiguously extends the prefix starting at `old_offset`. An
/// element below the running cursor is a duplicate (idempotence of op records) and is
/// skipped rather than double-counted; one strictly ahead of the cursor breaks the prefix.
pub fn calculate_op_offset(done_op_offset: &[i64], old_offset: i64) -> i64 {
    let mut sorted = done_op_offset.to_vec();
    sorted.sort_unstable();

    let mut new_offset = old_offset;
    for off in sorted {
        if off == new_offset {
            new_offset += 1;
        } else if off > new_offset {
            break;
        }
    }
    new_offset
}
