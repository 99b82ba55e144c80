use thiserror::Error;

/// Errors surfaced by the store bridge - the underlying log store and its offset ledger.
/// These are always transient from the scanner's point of view: see them, log them, retry
/// next tick. Nothing in here should ever abort a scan outright.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("kafka error: {0}")]
    Kafka(#[from] common_kafka::partition_reader::ReaderError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("no consume offset row for queue {0:?}")]
    MissingConsumeOffset(crate::types::MessageQueue),
}

/// Errors from a single half-queue scan tick. Per the design notes, per-queue exceptions
/// are caught at the `CheckEngine` boundary and replaced with this explicit result rather
/// than unwinding - only `Broken` causes the queue to be skipped and logged.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error(transparent)]
    Store(#[from] StoreError),
}
