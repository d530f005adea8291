//! Cache/version consistency engine

pub mod artifact;
pub mod coordinator;
pub mod error;
pub mod inflight;
pub mod sweeper;
pub mod versions;

/// Current timestamp in milliseconds since UNIX epoch
pub fn current_timestamp_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time before UNIX epoch")
        .as_millis() as i64
}
