pub mod config;
pub mod kafka_producer;
pub mod partition_reader;
