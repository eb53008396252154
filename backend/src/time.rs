pub const HOUR_MS: u64 = 3_600_000;

/// Wall-clock time in epoch milliseconds.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Start of the trailing window of `hours` ending at `now_ms`.
pub fn window_start_ms(now_ms: u64, hours: u32) -> u64 {
    now_ms.saturating_sub(u64::from(hours).saturating_mul(HOUR_MS))
}
