use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as milliseconds since the epoch. All timestamps in the
/// store and on outbound frames use this resolution.
pub fn create_timestamp() -> u64 {
    let start = SystemTime::now();
    let since_the_epoch = start
        .duration_since(UNIX_EPOCH)
        .expect("Time went backwards");
    since_the_epoch.as_millis() as u64
}

/// Inbound `message` frames carry seconds-since-epoch on the wire.
pub fn wire_seconds_to_millis(seconds: u64) -> u64 {
    seconds * 1000
}
