//! User property keys carried on half messages, and the parsing rules the scanner applies
//! to them. Every parse failure here is treated as "property absent", never as a reason to
//! abort the scan - malformed properties degrade to defaults.

use std::collections::HashMap;

pub const CHECK_TIMES: &str = "TRANSACTION_CHECK_TIMES";
pub const CHECK_IMMUNITY_SECONDS: &str = "CHECK_IMMUNITY_TIME_IN_SECONDS";
pub const PREPARED_QUEUE_OFFSET: &str = "TRANSACTION_PREPARED_QUEUE_OFFSET";

/// The sentinel value for `CHECK_IMMUNITY_TIME_IN_SECONDS` meaning "use the configured
/// transaction timeout instead of a per-message override".
pub const USE_DEFAULT_IMMUNITY: i64 = -1;

/// The sentinel `TRANSACTION_PREPARED_QUEUE_OFFSET` value stashed when a malformed offset
/// was read back - distinguishes "we saw garbage" from "the property was never set".
pub const PARSE_FAILURE_SENTINEL: i64 = -1;

pub fn parse_check_times(properties: &HashMap<String, String>) -> i32 {
    properties
        .get(CHECK_TIMES)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

pub fn bump_check_times(properties: &mut HashMap<String, String>) -> i32 {
    let next = parse_check_times(properties) + 1;
    properties.insert(CHECK_TIMES.to_string(), next.to_string());
    next
}

pub fn set_prepared_queue_offset(properties: &mut HashMap<String, String>, offset: i64) {
    properties.insert(PREPARED_QUEUE_OFFSET.to_string(), offset.to_string());
}

/// Parses `TRANSACTION_PREPARED_QUEUE_OFFSET`. A property that's present but not a valid
/// integer is reported as the parse-failure sentinel rather than `None`, because the two
/// cases are handled differently when a half with a prior back-check is reconsidered.
pub fn parse_prepared_queue_offset(properties: &HashMap<String, String>) -> Option<i64> {
    properties.get(PREPARED_QUEUE_OFFSET).map(|raw| {
        raw.parse().unwrap_or(PARSE_FAILURE_SENTINEL)
    })
}
