pub const CHECK_LOOP_RUNS: &str = "txcheck_service_loop_runs";
pub const BACK_CHECK_DISPATCH_FAILURES: &str = "txcheck_service_dispatch_failures";
pub const HALF_DISCARD_TOTAL: &str = "txcheck_service_half_discards";
