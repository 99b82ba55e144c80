pub const CHECK_RUN_STARTS: &str = "txcheck_run_starts";
pub const CHECK_RUN_TIME: &str = "txcheck_total_run_ms";
pub const CHECK_RUN_ENDS: &str = "txcheck_run_ends";

pub const QUEUES_SCANNED: &str = "txcheck_queues_scanned";
pub const QUEUES_BROKEN: &str = "txcheck_queues_broken";
pub const QUEUES_DEFERRED: &str = "txcheck_queues_deferred";

pub const HALF_RESOLVED: &str = "txcheck_half_resolved";
pub const HALF_DISCARDED: &str = "txcheck_half_discarded";
pub const HALF_SKIPPED_EXPIRED: &str = "txcheck_half_skipped_expired";
pub const BACK_CHECKS_DISPATCHED: &str = "txcheck_back_checks_dispatched";

pub const HALF_CONSUME_OFFSET: &str = "txcheck_half_consume_offset";
pub const OP_CONSUME_OFFSET: &str = "txcheck_op_consume_offset";
